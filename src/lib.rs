//! Shard routing for embedded SQLite partitions.
//!
//! Records live in a single logical `records` table split across shards, one
//! database file per shard. A [`ShardingStrategy`] decides which shard(s) a
//! key or query belongs to: a consistent hash ring ([`HashStrategy`]),
//! ordered key ranges ([`RangeStrategy`]) or an explicit persisted mapping
//! ([`DirectoryStrategy`]). The [`ShardManager`] ties strategy, connection
//! pool, CRUD handlers and query router together.
//!
//! ```no_run
//! use {
//!     serde_json::json,
//!     sqlshard::{Config, HandlerKind, ShardManager},
//! };
//!
//! let manager = ShardManager::new(Config::default()).unwrap();
//! manager.create_shard(None).unwrap();
//! manager.create_shard(None).unwrap();
//!
//! manager
//!     .insert(&json!({"id": 1, "name": "Alice"}), HandlerKind::Default)
//!     .unwrap();
//! let found = manager.select(&json!({"id": 1}), HandlerKind::Default).unwrap();
//! assert_eq!(found.len(), 1);
//! ```

mod builder;
mod config;
mod context;
mod error;
mod executor;
pub mod handler;
mod hash;
mod interval;
mod manager;
mod metadata;
mod pool;
mod record;
mod router;
mod shard;
mod statement;
pub mod strategy;
mod txn;

pub use {
    builder::ShardManagerBuilder,
    config::{Config, MAX_POOL_SIZE},
    context::Context,
    error::{ErrorKind, ShardError, ShardResult},
    executor::{Executor, RetryPolicy},
    handler::{BatchHandler, CrudHandler, DefaultHandler, HandlerKind},
    hash::{KeyHasher, Md5Hasher, RapidHasher, RingPosition},
    interval::{Interval, KeyRange},
    manager::ShardManager,
    metadata::{InMemoryMetadata, MetadataStore, ShardInfo},
    pool::{ConnectionPool, PooledConnection, RECORDS_TABLE},
    record::{Criteria, Record, as_mapping, as_mapping_list},
    router::{QueryResult, QueryRouter},
    shard::{KEY_FIELD, ShardId, ShardKey},
    statement::{Output, Statement},
    strategy::{DirectoryStrategy, HashStrategy, RangeStrategy, ShardingStrategy, StrategyKind},
    txn::{Operation, OperationLog, TransactionCoordinator},
};
