pub mod batch;
pub mod default;

use {
    crate::{Record, ShardError, ShardResult},
    auto_impl::auto_impl,
    serde_json::Value,
    std::{fmt, str::FromStr},
};

pub use {batch::BatchHandler, default::DefaultHandler};

/// Logical CRUD operations over the sharded records table.
///
/// Operands are JSON values so that callers may pass either shape a handler
/// accepts; anything that is not a mapping (or, for list-shaped operations,
/// a list of mappings) fails with [`ShardError::Sharding`].
///
/// Writes return the number of affected rows, summed over all shards.
#[auto_impl(&, Box, Arc)]
pub trait CrudHandler: Send + Sync {
    /// Inserts records, each into the shard owning its `id`.
    fn insert(&self, data: &Value) -> ShardResult<usize>;

    /// Returns the records matching the criteria.
    fn select(&self, criteria: &Value) -> ShardResult<Vec<Record>>;

    /// Sets the fields in `data` on every record matching the criteria.
    fn update(&self, criteria: &Value, data: &Value) -> ShardResult<usize>;

    /// Deletes every record matching the criteria.
    fn delete(&self, criteria: &Value) -> ShardResult<usize>;
}

/// Handler selector of the logical CRUD surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerKind {
    /// Single record or criterion (a list of records is accepted by insert).
    #[default]
    Default,

    /// Lists of records or criteria, chunked and dispatched in parallel.
    Batch,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandlerKind::Default => "default",
            HandlerKind::Batch => "batch",
        })
    }
}

impl FromStr for HandlerKind {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(HandlerKind::Default),
            "batch" => Ok(HandlerKind::Batch),
            other => Err(ShardError::sharding(format!("unknown handler type: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_kind_parsing() {
        assert_eq!("default".parse::<HandlerKind>().unwrap(), HandlerKind::Default);
        assert_eq!("batch".parse::<HandlerKind>().unwrap(), HandlerKind::Batch);
        assert_eq!(HandlerKind::default().to_string(), "default");
        assert_eq!("bulk".parse::<HandlerKind>().unwrap_err().code(), 1000);
    }
}
