use {
    crate::{Config, ShardError, ShardId, ShardResult},
    parking_lot::{Condvar, Mutex},
    rusqlite::Connection,
    std::{
        collections::{BTreeMap, HashMap, VecDeque},
        fs,
        ops::{Deref, DerefMut},
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::{Duration, Instant},
    },
    tracing::{debug, info, warn},
};

/// Name of the single logical table every shard holds.
pub const RECORDS_TABLE: &str = "records";

/// How long SQLite itself waits on a locked database before reporting it busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(1);

/// Connections of one shard.
struct ShardPool {
    shard_id: ShardId,
    path: PathBuf,

    /// Idle connections. Together with the leased ones they always number
    /// `pool_size`.
    idle: Mutex<VecDeque<Connection>>,

    /// Signalled whenever a connection is returned.
    available: Condvar,

    /// Set once the shard pool is drained; returned connections are closed
    /// instead of queued.
    closed: AtomicBool,
}

impl ShardPool {
    fn put(&self, connection: Connection) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(shard_id = %self.shard_id, "Closing connection returned to a closed pool");
            return;
        }
        self.idle.lock().push_back(connection);
        self.available.notify_one();
    }
}

/// Connection leased from a shard pool.
///
/// Returns itself to the pool when dropped.
pub struct PooledConnection {
    /// Present until the lease is dropped.
    connection: Option<Connection>,
    shard: Arc<ShardPool>,
}

impl PooledConnection {
    /// Shard this connection belongs to.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard.shard_id
    }

    /// Closes a broken connection and puts a freshly opened one in its slot.
    ///
    /// If the replacement cannot be opened, the old connection is returned
    /// to the pool instead, so the pool never shrinks.
    pub fn discard(mut self) -> ShardResult<()> {
        let fresh = open_connection(&self.shard.shard_id, &self.shard.path)?;
        self.connection = Some(fresh);
        warn!(shard_id = %self.shard.shard_id, "Discarded broken connection");
        Ok(())
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("Connection already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("Connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.shard.put(connection);
        }
    }
}

/// Bounded per-shard connection pool.
///
/// The first access to a shard opens `pool_size` connections to
/// `{base_path}/{shard_id}.db` (creating the directory and the records table
/// as needed). At most `pool_size` connections of a shard are leased at any
/// time; [`acquire()`](Self::acquire) waits up to the connection timeout for
/// one to be returned.
pub struct ConnectionPool {
    base_path: PathBuf,
    pool_size: usize,
    timeout: Duration,
    shards: Mutex<HashMap<ShardId, Arc<ShardPool>>>,

    /// Liveness check run on every leased connection.
    probe: fn(&Connection) -> bool,
}

impl ConnectionPool {
    /// Creates a pool; no connection is opened until a shard is accessed.
    pub fn new(base_path: impl Into<PathBuf>, pool_size: usize, timeout: Duration) -> ShardResult<Self> {
        if pool_size == 0 {
            return Err(ShardError::Configuration(
                "pool_size must be a positive integer".to_string(),
            ));
        }
        if pool_size > crate::config::MAX_POOL_SIZE {
            return Err(ShardError::TooManyConnections {
                requested: pool_size,
                max: crate::config::MAX_POOL_SIZE,
            });
        }

        Ok(Self {
            base_path: base_path.into(),
            pool_size,
            timeout,
            shards: Mutex::new(HashMap::new()),
            probe: is_alive,
        })
    }

    #[cfg(test)]
    fn with_probe(mut self, probe: fn(&Connection) -> bool) -> Self {
        self.probe = probe;
        self
    }

    /// Creates a pool from the configuration.
    pub fn from_config(config: &Config) -> ShardResult<Self> {
        Self::new(
            config.shard_base_path.clone(),
            config.pool_size,
            config.connection_timeout(),
        )
    }

    /// Leases a connection to the given shard.
    ///
    /// Blocks until a connection is free, failing with
    /// [`ShardError::ConnectionTimeout`] once the timeout elapses. The pool
    /// never retries on its own. A leased connection is probed first; a dead
    /// one is replaced by a freshly opened connection.
    pub fn acquire(&self, shard_id: &ShardId) -> ShardResult<PooledConnection> {
        let shard = self.shard_pool(shard_id)?;
        let deadline = Instant::now() + self.timeout;

        let connection = {
            let mut idle = shard.idle.lock();
            loop {
                if shard.closed.load(Ordering::SeqCst) {
                    return Err(ShardError::Connection {
                        shard_id: shard_id.clone(),
                        reason: "shard pool was closed".to_string(),
                    });
                }
                if let Some(connection) = idle.pop_front() {
                    break connection;
                }
                if shard.available.wait_until(&mut idle, deadline).timed_out() && idle.is_empty() {
                    warn!(%shard_id, timeout = ?self.timeout, "Connection pool exhausted");
                    return Err(ShardError::ConnectionTimeout {
                        shard_id: shard_id.clone(),
                        timeout: self.timeout,
                    });
                }
            }
        };

        let connection = if (self.probe)(&connection) {
            connection
        } else {
            warn!(%shard_id, "Invalid connection detected, creating a new one");
            match open_connection(shard_id, &shard.path) {
                Ok(fresh) => fresh,
                Err(err) => {
                    // Keep the slot so the pool does not shrink.
                    shard.put(connection);
                    return Err(err);
                }
            }
        };

        Ok(PooledConnection {
            connection: Some(connection),
            shard,
        })
    }

    /// Returns a leased connection to its shard's pool.
    ///
    /// Equivalent to dropping the lease; never blocks on other leases.
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Closes every idle connection of a shard and forgets its pool.
    ///
    /// Connections currently leased are closed when they are returned.
    /// Returns whether the shard had a pool.
    pub fn close_shard(&self, shard_id: &ShardId) -> bool {
        let Some(shard) = self.shards.lock().remove(shard_id) else {
            return false;
        };
        shard.closed.store(true, Ordering::SeqCst);
        let drained = {
            let mut idle = shard.idle.lock();
            let drained = idle.len();
            idle.clear();
            drained
        };
        shard.available.notify_all();

        info!(%shard_id, drained, "Closed all connections for shard");
        true
    }

    /// Closes the pools of all shards.
    pub fn close_all(&self) {
        let shard_ids: Vec<ShardId> = self.shards.lock().keys().cloned().collect();
        for shard_id in shard_ids {
            self.close_shard(&shard_id);
        }
    }

    /// Number of idle connections per shard.
    ///
    /// For capacity observability only; the counts may be stale by the time
    /// they are read.
    pub fn status(&self) -> BTreeMap<ShardId, usize> {
        let shards: Vec<Arc<ShardPool>> = self.shards.lock().values().cloned().collect();
        shards
            .into_iter()
            .map(|shard| {
                let idle = shard.idle.lock().len();
                (shard.shard_id.clone(), idle)
            })
            .collect()
    }

    /// Connections opened per shard.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Path of the database file backing the given shard.
    pub fn shard_path(&self, shard_id: &ShardId) -> PathBuf {
        self.base_path.join(format!("{shard_id}.db"))
    }

    /// Returns the pool of a shard, opening it on first access.
    ///
    /// Connections are opened without holding the shard map lock, so a slow
    /// shard never stalls the others. If two callers initialize the same
    /// shard at once, the first pool inserted wins.
    fn shard_pool(&self, shard_id: &ShardId) -> ShardResult<Arc<ShardPool>> {
        if let Some(shard) = self.shards.lock().get(shard_id) {
            return Ok(Arc::clone(shard));
        }

        let path = self.shard_path(shard_id);
        fs::create_dir_all(&self.base_path).map_err(|err| ShardError::Connection {
            shard_id: shard_id.clone(),
            reason: format!("cannot create {}: {err}", self.base_path.display()),
        })?;
        let idle = (0..self.pool_size)
            .map(|_| open_connection(shard_id, &path))
            .collect::<ShardResult<VecDeque<_>>>()?;

        let shard = Arc::new(ShardPool {
            shard_id: shard_id.clone(),
            path,
            idle: Mutex::new(idle),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let mut shards = self.shards.lock();
        if let Some(winner) = shards.get(shard_id) {
            debug!(%shard_id, "Shard pool initialized concurrently, dropping ours");
            return Ok(Arc::clone(winner));
        }
        shards.insert(shard_id.clone(), Arc::clone(&shard));

        info!(%shard_id, pool_size = self.pool_size, "Initialized connection pool for shard");
        Ok(shard)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Opens a connection and makes sure the records table exists.
fn open_connection(shard_id: &ShardId, path: &Path) -> ShardResult<Connection> {
    let connect = || -> rusqlite::Result<Connection> {
        let connection = Connection::open(path)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        connection.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {RECORDS_TABLE} (id PRIMARY KEY)"
        ))?;
        Ok(connection)
    };

    let connection = connect().map_err(|err| ShardError::Connection {
        shard_id: shard_id.clone(),
        reason: format!("cannot open {}: {err}", path.display()),
    })?;
    debug!(%shard_id, path = %path.display(), "Created new connection");
    Ok(connection)
}

/// Liveness probe.
fn is_alive(connection: &Connection) -> bool {
    connection
        .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use {super::*, std::thread};

    fn pool(dir: &tempfile::TempDir, size: usize, timeout: Duration) -> ConnectionPool {
        ConnectionPool::new(dir.path().join("shards"), size, timeout).unwrap()
    }

    #[test]
    fn lazy_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir, 3, Duration::from_secs(1));
        assert!(pool.status().is_empty());

        let shard = ShardId::from("shard_1");
        let connection = pool.acquire(&shard).unwrap();
        assert_eq!(connection.shard_id(), &shard);
        assert!(pool.shard_path(&shard).exists());
        assert_eq!(pool.status()[&shard], 2);

        pool.release(connection);
        assert_eq!(pool.status()[&shard], 3);
    }

    #[test]
    fn records_table_created() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir, 1, Duration::from_secs(1));
        let connection = pool.acquire(&ShardId::from("s")).unwrap();
        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn exhaustion_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir, 3, Duration::from_millis(200));
        let shard = ShardId::from("shard_1");

        let leases: Vec<_> = (0..3).map(|_| pool.acquire(&shard).unwrap()).collect();
        let started = Instant::now();
        let err = pool.acquire(&shard).err().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(err.code(), 1210);
        assert_eq!(err.shard_id(), Some(&shard));

        drop(leases);
        assert_eq!(pool.status()[&shard], 3);
    }

    #[test]
    fn release_unblocks_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(pool(&dir, 3, Duration::from_secs(10)));
        let shard = ShardId::from("shard_1");

        let mut leases: Vec<_> = (0..3).map(|_| pool.acquire(&shard).unwrap()).collect();
        let waiter = {
            let pool = Arc::clone(&pool);
            let shard = shard.clone();
            thread::spawn(move || {
                let started = Instant::now();
                pool.acquire(&shard).map(|_| started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(100));
        leases.pop();
        let waited = waiter.join().unwrap().unwrap();
        assert!(waited < Duration::from_secs(5), "waiter blocked for {waited:?}");
    }

    #[test]
    fn close_shard_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir, 2, Duration::from_millis(100));
        let (s1, s2) = (ShardId::from("shard_1"), ShardId::from("shard_2"));

        let lease = pool.acquire(&s1).unwrap();
        drop(pool.acquire(&s2).unwrap());
        assert_eq!(pool.status().len(), 2);

        assert!(pool.close_shard(&s1));
        assert!(!pool.close_shard(&s1));
        assert!(!pool.status().contains_key(&s1));

        // Returning to a closed pool closes the connection instead.
        drop(lease);
        assert!(!pool.status().contains_key(&s1));

        // Re-accessing a closed shard opens a fresh pool.
        drop(pool.acquire(&s1).unwrap());
        assert_eq!(pool.status()[&s1], 2);

        pool.close_all();
        assert!(pool.status().is_empty());
    }

    #[test]
    fn discard_keeps_pool_size() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir, 2, Duration::from_secs(1));
        let shard = ShardId::from("shard_1");

        let lease = pool.acquire(&shard).unwrap();
        lease.discard().unwrap();
        assert_eq!(pool.status()[&shard], 2);
    }

    #[test]
    fn dead_connection_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir, 1, Duration::from_secs(1)).with_probe(|_| false);
        let shard = ShardId::from("shard_1");

        // Temporary tables live and die with their connection.
        let lease = pool.acquire(&shard).unwrap();
        lease.execute_batch("CREATE TEMP TABLE marker (x)").unwrap();
        drop(lease);
        assert_eq!(pool.status()[&shard], 1);

        let lease = pool.acquire(&shard).unwrap();
        assert!(lease.execute_batch("SELECT * FROM marker").is_err());
        drop(lease);
        assert_eq!(pool.status()[&shard], 1);
    }

    #[test]
    fn slow_shard_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(pool(&dir, 2, Duration::from_secs(5)));
        let (slow, fast) = (ShardId::from("slow"), ShardId::from("fast"));
        drop(pool.acquire(&fast).unwrap());

        // An exclusive lock held elsewhere makes opening the slow shard wait
        // out the busy timeout.
        let holder = Connection::open(pool.shard_path(&slow)).unwrap();
        holder.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let initializing = {
            let pool = Arc::clone(&pool);
            let slow = slow.clone();
            thread::spawn(move || pool.acquire(&slow).map(drop))
        };
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        drop(pool.acquire(&fast).unwrap());
        let status = pool.status();
        let waited = started.elapsed();
        assert!(waited < Duration::from_millis(500), "blocked for {waited:?}");
        assert_eq!(status[&fast], 2);

        assert_eq!(initializing.join().unwrap().unwrap_err().code(), 1200);
        holder.execute_batch("ROLLBACK").unwrap();
        drop(pool.acquire(&slow).unwrap());
        assert_eq!(pool.status()[&slow], 2);
    }

    #[test]
    fn pool_bounds() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            ConnectionPool::new(dir.path(), 0, Duration::from_secs(1))
                .err()
                .unwrap()
                .code(),
            1100
        );
        assert_eq!(
            ConnectionPool::new(dir.path(), crate::config::MAX_POOL_SIZE + 1, Duration::from_secs(1))
                .err()
                .unwrap()
                .code(),
            1220
        );
    }

    #[test]
    fn unopenable_store_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the shard directory should be.
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let pool = ConnectionPool::new(&blocker, 2, Duration::from_secs(1)).unwrap();
        let err = pool.acquire(&ShardId::from("s")).err().unwrap();
        assert_eq!(err.code(), 1200);
        assert!(pool.status().is_empty());
    }
}
