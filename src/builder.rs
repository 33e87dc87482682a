use {
    crate::{
        BatchHandler,
        Config,
        ConnectionPool,
        Context,
        DefaultHandler,
        DirectoryStrategy,
        HashStrategy,
        InMemoryMetadata,
        MetadataStore,
        OperationLog,
        QueryRouter,
        RangeStrategy,
        ShardResult,
        ShardingStrategy,
        StrategyKind,
        TransactionCoordinator,
        executor::{Executor, RetryPolicy},
        manager::{Lifecycle, ShardManager, StrategyHandle},
    },
    parking_lot::Mutex,
    std::sync::Arc,
    tracing::info,
};

enum StrategySource {
    Kind(StrategyKind),
    Custom(Arc<dyn ShardingStrategy>),
}

/// Shard manager builder.
pub struct ShardManagerBuilder {
    config: Config,
    strategy: StrategySource,
    metadata: Option<Arc<dyn MetadataStore>>,
    transactions: Option<Arc<dyn TransactionCoordinator>>,
}

impl ShardManagerBuilder {
    /// Create new builder, routing with the hash strategy by default.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            strategy: StrategySource::Kind(StrategyKind::default()),
            metadata: None,
            transactions: None,
        }
    }

    /// Route with one of the built-in strategies.
    pub fn with_strategy(mut self, kind: StrategyKind) -> Self {
        self.strategy = StrategySource::Kind(kind);
        self
    }

    /// Route with a caller-provided strategy.
    pub fn with_custom_strategy<S: ShardingStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategy = StrategySource::Custom(Arc::new(strategy));
        self
    }

    /// Use a custom shard registry instead of the in-memory one.
    pub fn with_metadata<M: MetadataStore + 'static>(mut self, metadata: M) -> Self {
        self.metadata = Some(Arc::new(metadata));
        self
    }

    /// Use a custom transaction coordinator instead of the operation log.
    pub fn with_transaction_coordinator<T>(mut self, transactions: T) -> Self
    where
        T: TransactionCoordinator + 'static,
    {
        self.transactions = Some(Arc::new(transactions));
        self
    }

    /// Build the manager.
    ///
    /// Validates the configuration, opens the strategy (loading the
    /// directory file for the directory strategy) and registers
    /// `active_shards`. Shard storage is opened lazily on first use.
    pub fn build(self) -> ShardResult<ShardManager> {
        let context = Context::new(self.config)?;
        let config = context.config();

        let strategy = match self.strategy {
            StrategySource::Kind(StrategyKind::Hash) => {
                StrategyHandle::Hash(Arc::new(HashStrategy::new(config.virtual_nodes)))
            }
            StrategySource::Kind(StrategyKind::Range) => StrategyHandle::Range(Arc::new(RangeStrategy::new())),
            StrategySource::Kind(StrategyKind::Directory) => StrategyHandle::Directory(Arc::new(
                DirectoryStrategy::open(&config.directory_path, config.directory_cache_size)?,
            )),
            StrategySource::Custom(strategy) => StrategyHandle::Custom(strategy),
        };
        let shared_strategy = strategy.shared();

        let pool = Arc::new(ConnectionPool::from_config(&config)?);
        let executor = Executor::new(Arc::clone(&pool), RetryPolicy::from_config(&config));
        let default_handler = DefaultHandler::new(Arc::clone(&shared_strategy), executor.clone());
        let batch_handler = BatchHandler::new(default_handler.clone(), config.batch_size, config.max_workers)?;
        let router = QueryRouter::new(Arc::clone(&shared_strategy), executor, config.max_workers)?;

        let known = shared_strategy.all_shards();
        for shard_id in config.active_shards.iter().filter(|id| !known.contains(id)) {
            shared_strategy.add_shard(shard_id)?;
        }

        let manager = ShardManager {
            strategy,
            shared_strategy,
            pool,
            default_handler,
            batch_handler,
            router,
            metadata: self.metadata.unwrap_or_else(|| Arc::new(InMemoryMetadata::new())),
            transactions: self.transactions.unwrap_or_else(|| Arc::new(OperationLog::new())),
            lifecycle: Mutex::new(Lifecycle::default()),
            context,
        };
        for shard_id in manager.list_shards() {
            manager.register(&shard_id);
        }

        manager
            .context
            .span()
            .in_scope(|| info!(shards = manager.list_shards().len(), "ShardManager initialized"));
        Ok(manager)
    }
}
