pub mod directory;
pub mod hash;
pub mod range;

#[cfg(test)]
mod range_test;

use {
    crate::{Criteria, KEY_FIELD, ShardError, ShardId, ShardKey, ShardResult},
    auto_impl::auto_impl,
    serde_json::Value,
    std::{fmt, str::FromStr},
};

pub use {directory::DirectoryStrategy, hash::HashStrategy, range::RangeStrategy};

/// Sharding strategy.
///
/// Maps keys and query criteria to shards and owns the shard-set
/// membership. Implementations guard their routing tables internally, so a
/// strategy is shared between handlers, router and manager behind an `Arc`.
#[auto_impl(&, Box, Arc)]
pub trait ShardingStrategy: Send + Sync {
    /// Returns the shard responsible for the given key.
    ///
    /// Fails with [`ShardError::InvalidKey`] if the key is null, empty or
    /// not an integer/string.
    fn resolve_for_key(&self, key: &Value) -> ShardResult<ShardId>;

    /// Returns the shards that may hold records matching the criteria.
    ///
    /// Depending on what the strategy can infer, this is one shard, several
    /// shards, or all of them.
    fn resolve_for_query(&self, criteria: &Criteria) -> ShardResult<Vec<ShardId>>;

    /// Initializes a new shard and registers it for routing.
    fn create_shard(&self, shard_id: &ShardId) -> ShardResult<()> {
        self.add_shard(shard_id)
    }

    /// Registers an existing shard for routing.
    fn add_shard(&self, shard_id: &ShardId) -> ShardResult<()>;

    /// Unregisters a shard, forgetting (or handing over) its key space.
    fn remove_shard(&self, shard_id: &ShardId) -> ShardResult<()>;

    /// Returns every shard known to the strategy, sorted.
    fn all_shards(&self) -> Vec<ShardId>;
}

/// Built-in strategy variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    Hash,
    Range,
    Directory,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::Hash => "hash",
            StrategyKind::Range => "range",
            StrategyKind::Directory => "directory",
        })
    }
}

impl FromStr for StrategyKind {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hash" => Ok(StrategyKind::Hash),
            "range" => Ok(StrategyKind::Range),
            "directory" => Ok(StrategyKind::Directory),
            other => Err(ShardError::sharding(format!(
                "unknown strategy type: {other}"
            ))),
        }
    }
}

/// Extracts the routing key from criteria, if the criteria carry one.
pub(crate) fn routing_key(criteria: &Criteria) -> ShardResult<Option<ShardKey>> {
    criteria
        .get(KEY_FIELD)
        .map(ShardKey::from_value)
        .transpose()
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn strategy_kind_parsing() {
        for kind in [StrategyKind::Hash, StrategyKind::Range, StrategyKind::Directory] {
            assert_eq!(kind.to_string().parse::<StrategyKind>().unwrap(), kind);
        }
        assert_eq!("ring".parse::<StrategyKind>().unwrap_err().code(), 1000);
    }

    #[test]
    fn routing_key_extraction() {
        let criteria = json!({"name": "Alice", "id": 3});
        let key = routing_key(criteria.as_object().unwrap()).unwrap();
        assert_eq!(key, Some(ShardKey::Int(3)));

        let criteria = json!({"name": "Alice"});
        assert_eq!(routing_key(criteria.as_object().unwrap()).unwrap(), None);

        let criteria = json!({"id": null});
        assert!(routing_key(criteria.as_object().unwrap()).is_err());
    }
}
