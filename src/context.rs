use {
    crate::{Config, ShardError, ShardResult},
    parking_lot::RwLock,
    std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    tracing::{Span, info, info_span},
};

/// Explicitly passed-down runtime context.
///
/// Holds the validated configuration and the tracing span every component
/// of one manager logs under. Components read a snapshot of the
/// configuration when they are constructed; later updates only affect
/// components created afterwards.
#[derive(Debug)]
pub struct Context {
    config: RwLock<Arc<Config>>,
    span: Span,
    closed: AtomicBool,
}

impl Context {
    /// Validates the configuration and opens the context.
    pub fn new(config: Config) -> ShardResult<Self> {
        config.validate()?;
        let span = info_span!("sqlshard", base_path = %config.shard_base_path.display());
        span.in_scope(|| info!(pool_size = config.pool_size, "Context initialized"));

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            span,
            closed: AtomicBool::new(false),
        })
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    /// Applies `f` to a copy of the configuration and installs the result.
    ///
    /// Fails with [`ShardError::Configuration`] if the configuration is not
    /// mutable or the updated configuration does not validate.
    pub fn update_config<F>(&self, f: F) -> ShardResult<Arc<Config>>
    where
        F: FnOnce(&mut Config),
    {
        let mut config = self.config.write();
        if !config.mutable {
            return Err(ShardError::Configuration(
                "configuration is immutable and cannot be modified".to_string(),
            ));
        }

        let mut next = Config::clone(&config);
        f(&mut next);
        next.validate()?;
        *config = Arc::new(next);
        Ok(Arc::clone(&config))
    }

    /// Span the owning manager's components log under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Marks the context closed; returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.span.in_scope(|| info!("Context closed"));
        }
        first
    }

    /// Fails if the context has been closed.
    pub(crate) fn ensure_open(&self) -> ShardResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShardError::sharding("shard manager is closed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_by_default() {
        let ctx = Context::new(Config::default()).unwrap();
        let err = ctx.update_config(|c| c.pool_size = 9).unwrap_err();
        assert_eq!(err.code(), 1100);
        assert_eq!(ctx.config().pool_size, 5);
    }

    #[test]
    fn mutable_updates_are_validated() {
        let config = Config {
            mutable: true,
            ..Default::default()
        };
        let ctx = Context::new(config).unwrap();
        assert_eq!(ctx.update_config(|c| c.pool_size = 9).unwrap().pool_size, 9);
        assert!(ctx.update_config(|c| c.pool_size = 0).is_err());
        assert_eq!(ctx.config().pool_size, 9);
    }

    #[test]
    fn invalid_config_rejected() {
        let config = Config {
            batch_size: 0,
            ..Default::default()
        };
        assert!(Context::new(config).is_err());
    }

    #[test]
    fn close_once() {
        let ctx = Context::new(Config::default()).unwrap();
        assert!(ctx.ensure_open().is_ok());
        assert!(ctx.close());
        assert!(!ctx.close());
        assert_eq!(ctx.ensure_open().unwrap_err().code(), 1000);
    }
}
