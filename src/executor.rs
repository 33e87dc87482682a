use {
    crate::{
        Config,
        ConnectionPool,
        ShardError,
        ShardId,
        ShardResult,
        statement::{self, Output, Statement},
    },
    std::{sync::Arc, thread, time::Duration},
    tracing::{debug, warn},
};

/// Bounded retry on transient storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per statement, including the first one.
    pub max_attempts: usize,

    /// Delay before the second attempt; grows linearly afterwards.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    /// Policy configured by `max_retries` and `retry_backoff_ms`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Runs statements on shards through the connection pool.
///
/// Each statement runs on a single leased connection, so statements issued
/// by one caller against one shard execute in order.
#[derive(Clone)]
pub struct Executor {
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
}

impl Executor {
    pub fn new(pool: Arc<ConnectionPool>, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Connection pool the executor leases from.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Executes a statement on the given shard.
    ///
    /// `columns` are added to the records table first if missing. Transient
    /// errors (busy or locked database) are retried up to the configured
    /// number of attempts; exhausting them fails with
    /// [`ShardError::QueryExecution`]. Malformed statements fail with
    /// [`ShardError::QuerySyntax`], any other storage error with
    /// [`ShardError::Query`], without retrying.
    pub fn execute(&self, shard_id: &ShardId, statement: &Statement, columns: &[&str]) -> ShardResult<Output> {
        let connection = self.pool.acquire(shard_id)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = statement::ensure_columns(&connection, columns.iter().copied())
                .and_then(|()| statement::run(&connection, statement));

            let err = match result {
                Ok(output) => {
                    debug!(%shard_id, %statement, params = ?statement.params, "Executed statement");
                    return Ok(output);
                }
                Err(err) => err,
            };

            if statement::is_transient(&err) && attempt < self.retry.max_attempts {
                warn!(%shard_id, %statement, attempt, error = %err, "Query execution failed, retrying");
                thread::sleep(self.retry.backoff * attempt as u32);
                continue;
            }

            warn!(%shard_id, %statement, params = ?statement.params, attempt, error = %err, "Query execution failed");
            if statement::is_broken(&err) {
                if let Err(discard_err) = connection.discard() {
                    warn!(%shard_id, error = %discard_err, "Cannot replace broken connection");
                }
            }
            return Err(query_error(shard_id, statement, attempt, err));
        }
    }
}

/// Builds a bounded worker pool for fan-out.
pub(crate) fn worker_pool(name: &'static str, threads: usize) -> ShardResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |idx| format!("{name}-{idx}"))
        .build()
        .map_err(|err| ShardError::Configuration(format!("cannot start {name} workers: {err}")))
}

fn query_error(shard_id: &ShardId, statement: &Statement, attempts: usize, err: rusqlite::Error) -> ShardError {
    if statement::is_transient(&err) {
        ShardError::QueryExecution {
            shard_id: shard_id.clone(),
            statement: statement.sql.clone(),
            params: statement.params.clone(),
            attempts,
            reason: err.to_string(),
        }
    } else if statement::is_syntax(&err) {
        ShardError::QuerySyntax {
            statement: statement.sql.clone(),
            reason: err.to_string(),
        }
    } else {
        ShardError::Query {
            shard_id: shard_id.clone(),
            statement: statement.sql.clone(),
            params: statement.params.clone(),
            reason: err.to_string(),
        }
    }
}
