use {
    crate::shard::ShardId,
    serde_json::Value,
    std::{fmt, time::Duration},
};

/// Coarse error category, stable across releases.
///
/// Callers branch on the kind when the exact variant does not matter, e.g.
/// "any connection problem" vs "any routing problem".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Sharding,
    Configuration,
    Connection,
    Strategy,
    Query,
    Transaction,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Sharding => "sharding",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
            ErrorKind::Strategy => "strategy",
            ErrorKind::Query => "query",
            ErrorKind::Transaction => "transaction",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// Generic routing failure, e.g. a fan-out that failed on one shard.
    #[error("[1000] {message} (shard: {})", display_shard(.shard_id))]
    Sharding {
        message: String,
        shard_id: Option<ShardId>,
        #[source]
        source: Option<Box<ShardError>>,
    },

    /// Invalid or missing settings.
    #[error("[1100] Invalid configuration: {0}")]
    Configuration(String),

    /// Backing store of a shard could not be opened or used.
    #[error("[1200] Connection error on shard {shard_id}: {reason}")]
    Connection { shard_id: ShardId, reason: String },

    /// Every connection of the shard stayed leased past the timeout.
    #[error("[1210] No connection available on shard {shard_id} within {timeout:?}")]
    ConnectionTimeout { shard_id: ShardId, timeout: Duration },

    /// Pool capacity is out of bounds.
    #[error("[1220] Pool size {requested} exceeds the maximum of {max}")]
    TooManyConnections { requested: usize, max: usize },

    /// Routing table problem.
    #[error("[1300] {message}")]
    Strategy { message: String, key: Option<String> },

    /// Routing key is null, empty or not a supported scalar.
    #[error("[1310] Invalid sharding key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Overlapping intervals, out-of-range lookup, invalid split/merge.
    #[error("[1320] Range error: {0}")]
    Range(String),

    /// Non-transient statement failure (constraint violation, etc).
    #[error("[1400] Query failed on shard {shard_id}: {reason} (statement: {statement})")]
    Query {
        shard_id: ShardId,
        statement: String,
        params: Vec<Value>,
        reason: String,
    },

    /// Malformed statement or invalid identifier.
    #[error("[1410] Malformed query: {reason} (statement: {statement})")]
    QuerySyntax { statement: String, reason: String },

    /// Transient failure that persisted through every retry.
    #[error(
        "[1420] Query failed on shard {shard_id} after {attempts} attempts: {reason} (statement: {statement})"
    )]
    QueryExecution {
        shard_id: ShardId,
        statement: String,
        params: Vec<Value>,
        attempts: usize,
        reason: String,
    },

    /// Transaction bookkeeping problem.
    #[error("[1500] Transaction error: {0}")]
    Transaction(String),

    /// A transaction stopped at a failing operation.
    ///
    /// Operations applied before the failure are NOT rolled back.
    #[error("[1510] Transaction {txn_id} aborted after {applied} applied operations")]
    TransactionAborted {
        txn_id: String,
        applied: usize,
        #[source]
        source: Box<ShardError>,
    },

    /// A transaction touching several shards stopped partway.
    ///
    /// There is no cross-shard atomicity: the listed shards may hold partial
    /// results.
    #[error(
        "[1520] Transaction {txn_id} failed across shards {shards:?} after {applied} applied operations"
    )]
    CrossShardTransaction {
        txn_id: String,
        shards: Vec<ShardId>,
        applied: usize,
        #[source]
        source: Box<ShardError>,
    },
}

pub type ShardResult<T> = Result<T, ShardError>;

fn display_shard(shard_id: &Option<ShardId>) -> String {
    shard_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string())
}

impl ShardError {
    /// Creates a generic sharding error without shard context.
    pub fn sharding(message: impl Into<String>) -> Self {
        ShardError::Sharding {
            message: message.into(),
            shard_id: None,
            source: None,
        }
    }

    /// Wraps a failure that happened on a particular shard.
    pub fn on_shard(message: impl Into<String>, shard_id: ShardId, source: ShardError) -> Self {
        ShardError::Sharding {
            message: message.into(),
            shard_id: Some(shard_id),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a strategy error, optionally naming the offending key.
    pub fn strategy(message: impl Into<String>, key: Option<String>) -> Self {
        ShardError::Strategy {
            message: message.into(),
            key,
        }
    }

    /// Stable numeric code of the error.
    pub fn code(&self) -> u16 {
        match self {
            ShardError::Sharding { .. } => 1000,
            ShardError::Configuration(_) => 1100,
            ShardError::Connection { .. } => 1200,
            ShardError::ConnectionTimeout { .. } => 1210,
            ShardError::TooManyConnections { .. } => 1220,
            ShardError::Strategy { .. } => 1300,
            ShardError::InvalidKey { .. } => 1310,
            ShardError::Range(_) => 1320,
            ShardError::Query { .. } => 1400,
            ShardError::QuerySyntax { .. } => 1410,
            ShardError::QueryExecution { .. } => 1420,
            ShardError::Transaction(_) => 1500,
            ShardError::TransactionAborted { .. } => 1510,
            ShardError::CrossShardTransaction { .. } => 1520,
        }
    }

    /// Category the error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self.code() / 100 {
            11 => ErrorKind::Configuration,
            12 => ErrorKind::Connection,
            13 => ErrorKind::Strategy,
            14 => ErrorKind::Query,
            15 => ErrorKind::Transaction,
            _ => ErrorKind::Sharding,
        }
    }

    /// Shard the error is attributed to, if any.
    pub fn shard_id(&self) -> Option<&ShardId> {
        match self {
            ShardError::Sharding { shard_id, .. } => shard_id.as_ref(),
            ShardError::Connection { shard_id, .. }
            | ShardError::ConnectionTimeout { shard_id, .. }
            | ShardError::Query { shard_id, .. }
            | ShardError::QueryExecution { shard_id, .. } => Some(shard_id),
            _ => None,
        }
    }
}
