use {
    crate::{
        BatchHandler,
        Config,
        ConnectionPool,
        Context,
        CrudHandler,
        DefaultHandler,
        DirectoryStrategy,
        HandlerKind,
        HashStrategy,
        KEY_FIELD,
        MetadataStore,
        Operation,
        QueryRouter,
        RangeStrategy,
        Record,
        ShardError,
        ShardId,
        ShardInfo,
        ShardResult,
        ShardingStrategy,
        TransactionCoordinator,
        builder::ShardManagerBuilder,
        record::as_mapping,
    },
    parking_lot::Mutex,
    serde_json::Value,
    std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
    },
    tracing::{info, warn},
};

/// Strategy the manager routes with, keeping typed access to the built-in
/// variants for their maintenance operations.
#[derive(Clone)]
pub(crate) enum StrategyHandle {
    Hash(Arc<HashStrategy>),
    Range(Arc<RangeStrategy>),
    Directory(Arc<DirectoryStrategy>),
    Custom(Arc<dyn ShardingStrategy>),
}

impl StrategyHandle {
    pub(crate) fn shared(&self) -> Arc<dyn ShardingStrategy> {
        match self {
            StrategyHandle::Hash(strategy) => Arc::clone(strategy) as Arc<dyn ShardingStrategy>,
            StrategyHandle::Range(strategy) => Arc::clone(strategy) as _,
            StrategyHandle::Directory(strategy) => Arc::clone(strategy) as _,
            StrategyHandle::Custom(strategy) => Arc::clone(strategy),
        }
    }
}

/// Shard id allocation state.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    /// Suffix of the next generated `shard_{n}` id.
    pub(crate) next_id: usize,

    /// Removed shards; their ids are never handed out again.
    pub(crate) retired: BTreeSet<ShardId>,
}

/// Entry point of the library.
///
/// Composes strategy, connection pool, handlers, router and the metadata and
/// transaction collaborators behind the logical CRUD and shard lifecycle
/// API. Construct with [`ShardManager::new()`] or
/// [`ShardManager::builder()`].
pub struct ShardManager {
    pub(crate) context: Context,
    pub(crate) strategy: StrategyHandle,
    pub(crate) shared_strategy: Arc<dyn ShardingStrategy>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) default_handler: DefaultHandler,
    pub(crate) batch_handler: BatchHandler,
    pub(crate) router: QueryRouter,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) transactions: Arc<dyn TransactionCoordinator>,
    pub(crate) lifecycle: Mutex<Lifecycle>,
}

impl ShardManager {
    /// Creates a manager with the hash strategy and in-memory collaborators.
    pub fn new(config: Config) -> ShardResult<Self> {
        Self::builder(config).build()
    }

    /// Starts configuring a manager.
    pub fn builder(config: Config) -> ShardManagerBuilder {
        ShardManagerBuilder::new(config)
    }

    /// Runtime context: configuration and tracing span.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn config(&self) -> Arc<Config> {
        self.context.config()
    }

    /// Creates and registers a shard.
    ///
    /// Without an explicit id, the next free `shard_{n}` is used. Ids of
    /// existing or removed shards are rejected. The shard's storage is
    /// opened right away, so an unusable base path fails here.
    ///
    /// Returns the id of the new shard.
    pub fn create_shard(&self, shard_id: Option<ShardId>) -> ShardResult<ShardId> {
        self.context.ensure_open()?;
        let _span = self.context.span().enter();

        let mut lifecycle = self.lifecycle.lock();
        let existing: BTreeSet<ShardId> = self.shared_strategy.all_shards().into_iter().collect();
        let shard_id = match shard_id {
            Some(shard_id) => {
                if !shard_id.is_path_safe() {
                    return Err(ShardError::Sharding {
                        message: "shard id cannot be used as a file name".to_string(),
                        shard_id: Some(shard_id),
                        source: None,
                    });
                }
                if existing.contains(&shard_id) || lifecycle.retired.contains(&shard_id) {
                    return Err(ShardError::Sharding {
                        message: "shard id is already in use or was retired".to_string(),
                        shard_id: Some(shard_id),
                        source: None,
                    });
                }
                shard_id
            }
            None => loop {
                lifecycle.next_id += 1;
                let candidate = ShardId::new(format!("shard_{}", lifecycle.next_id));
                if !existing.contains(&candidate) && !lifecycle.retired.contains(&candidate) {
                    break candidate;
                }
            },
        };

        self.shared_strategy.create_shard(&shard_id)?;
        if let Err(err) = self.pool.acquire(&shard_id) {
            if let Err(undo) = self.shared_strategy.remove_shard(&shard_id) {
                warn!(%shard_id, error = %undo, "Cannot unregister shard after failed creation");
            }
            return Err(err);
        }
        self.register(&shard_id);

        info!(%shard_id, "Created shard");
        Ok(shard_id)
    }

    /// Shards known to the strategy, sorted.
    pub fn list_shards(&self) -> Vec<ShardId> {
        self.shared_strategy.all_shards()
    }

    /// Registry entry of a shard.
    pub fn shard_info(&self, shard_id: &ShardId) -> Option<ShardInfo> {
        self.metadata.shard_info(shard_id)
    }

    /// Unregisters a shard and closes its connections.
    ///
    /// The shard's database file stays on disk; its id is retired and never
    /// reused. Keys the shard owned resolve according to the strategy's
    /// removal semantics.
    pub fn remove_shard(&self, shard_id: &ShardId) -> ShardResult<()> {
        self.context.ensure_open()?;
        let _span = self.context.span().enter();

        let mut lifecycle = self.lifecycle.lock();
        self.shared_strategy.remove_shard(shard_id)?;
        self.pool.close_shard(shard_id);
        self.metadata.unregister_shard(shard_id);
        lifecycle.retired.insert(shard_id.clone());

        info!(%shard_id, "Removed shard");
        Ok(())
    }

    /// Inserts one record (or a list of records) through the selected
    /// handler.
    pub fn insert(&self, data: &Value, handler: HandlerKind) -> ShardResult<usize> {
        self.context.ensure_open()?;
        let _span = self.context.span().enter();
        self.handler(handler).insert(data)
    }

    pub fn select(&self, criteria: &Value, handler: HandlerKind) -> ShardResult<Vec<Record>> {
        self.context.ensure_open()?;
        let _span = self.context.span().enter();
        self.handler(handler).select(criteria)
    }

    pub fn update(&self, criteria: &Value, data: &Value, handler: HandlerKind) -> ShardResult<usize> {
        self.context.ensure_open()?;
        let _span = self.context.span().enter();
        self.handler(handler).update(criteria, data)
    }

    pub fn delete(&self, criteria: &Value, handler: HandlerKind) -> ShardResult<usize> {
        self.context.ensure_open()?;
        let _span = self.context.span().enter();
        self.handler(handler).delete(criteria)
    }

    /// Applies operations one after another through the default handler.
    ///
    /// Best-effort only: the first failing operation stops the sequence,
    /// but operations applied before it stay applied. The error is
    /// [`ShardError::CrossShardTransaction`] when the transaction touched
    /// more than one shard, [`ShardError::TransactionAborted`] otherwise.
    pub fn execute_transaction(&self, operations: &[Operation]) -> ShardResult<()> {
        self.context.ensure_open()?;
        let _span = self.context.span().enter();

        let txn_id = self.transactions.begin();
        let mut touched = BTreeSet::new();
        for (applied, operation) in operations.iter().enumerate() {
            touched.extend(self.shards_for(operation));
            let result = self
                .transactions
                .add_operation(&txn_id, operation.clone())
                .and_then(|()| self.apply(operation));

            if let Err(source) = result {
                if let Err(err) = self.transactions.rollback(&txn_id) {
                    warn!(%txn_id, error = %err, "Cannot close failed transaction");
                }
                warn!(%txn_id, applied, operation = operation.name(), error = %source, "Transaction failed");
                let source = Box::new(source);
                return Err(if touched.len() > 1 {
                    ShardError::CrossShardTransaction {
                        txn_id,
                        shards: touched.into_iter().collect(),
                        applied,
                        source,
                    }
                } else {
                    ShardError::TransactionAborted {
                        txn_id,
                        applied,
                        source,
                    }
                });
            }
        }

        self.transactions.commit(&txn_id)?;
        info!(%txn_id, count = operations.len(), "Transaction applied");
        Ok(())
    }

    /// Idle connections per initialized shard.
    pub fn pool_status(&self) -> BTreeMap<ShardId, usize> {
        self.pool.status()
    }

    /// Router for statements beyond the CRUD surface.
    pub fn router(&self) -> &QueryRouter {
        &self.router
    }

    pub fn strategy(&self) -> &Arc<dyn ShardingStrategy> {
        &self.shared_strategy
    }

    pub fn hash_strategy(&self) -> Option<&Arc<HashStrategy>> {
        match &self.strategy {
            StrategyHandle::Hash(strategy) => Some(strategy),
            _ => None,
        }
    }

    pub fn range_strategy(&self) -> Option<&Arc<RangeStrategy>> {
        match &self.strategy {
            StrategyHandle::Range(strategy) => Some(strategy),
            _ => None,
        }
    }

    pub fn directory_strategy(&self) -> Option<&Arc<DirectoryStrategy>> {
        match &self.strategy {
            StrategyHandle::Directory(strategy) => Some(strategy),
            _ => None,
        }
    }

    /// Redistributes the hash ring with virtual nodes.
    ///
    /// Fails unless the manager routes with the hash strategy. Existing data
    /// is not migrated.
    pub fn rebalance(&self) -> ShardResult<BTreeMap<ShardId, usize>> {
        self.context.ensure_open()?;
        let _span = self.context.span().enter();
        self.hash_strategy()
            .map(|strategy| strategy.rebalance())
            .ok_or_else(|| ShardError::sharding("rebalancing requires the hash strategy"))
    }

    /// Closes every connection; later calls fail. Idempotent.
    pub fn close(&self) {
        if self.context.close() {
            self.pool.close_all();
            self.context.span().in_scope(|| info!("ShardManager closed"));
        }
    }

    /// Records a shard in the metadata registry unless it is already there.
    pub(crate) fn register(&self, shard_id: &ShardId) {
        if self.metadata.shard_info(shard_id).is_some() {
            return;
        }
        if let Err(err) = self.metadata.register_shard(shard_id, &self.pool.shard_path(shard_id)) {
            warn!(%shard_id, error = %err, "Cannot register shard metadata");
        }
    }

    fn handler(&self, kind: HandlerKind) -> &dyn CrudHandler {
        match kind {
            HandlerKind::Default => &self.default_handler,
            HandlerKind::Batch => &self.batch_handler,
        }
    }

    fn apply(&self, operation: &Operation) -> ShardResult<usize> {
        match operation {
            Operation::Insert { data } => self.default_handler.insert(data),
            Operation::Update { criteria, data } => self.default_handler.update(criteria, data),
            Operation::Delete { criteria } => self.default_handler.delete(criteria),
        }
    }

    /// Best guess of the shards an operation writes to.
    fn shards_for(&self, operation: &Operation) -> Vec<ShardId> {
        let resolved = match operation {
            Operation::Insert { data } => as_mapping(data, "data").and_then(|record| {
                let key = record.get(KEY_FIELD).unwrap_or(&Value::Null);
                self.shared_strategy.resolve_for_key(key).map(|shard_id| vec![shard_id])
            }),
            Operation::Update { criteria, .. } | Operation::Delete { criteria } => {
                as_mapping(criteria, "criteria")
                    .and_then(|criteria| self.shared_strategy.resolve_for_query(criteria))
            }
        };
        resolved.unwrap_or_default()
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        self.close();
    }
}
