use {
    crate::{ShardError, ShardId, ShardResult},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Upper bound on connections per shard.
pub const MAX_POOL_SIZE: usize = 1024;

/// Library configuration.
///
/// Every field has a default, so a partial JSON document (or `{}`) is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Seconds to wait for a free connection before failing.
    pub connection_timeout: u64,

    /// Connections opened per shard.
    pub pool_size: usize,

    /// Directory holding one database file per shard.
    pub shard_base_path: PathBuf,

    /// File backing the directory strategy's persisted mapping.
    pub directory_path: PathBuf,

    /// Shards registered on startup.
    pub active_shards: Vec<ShardId>,

    /// Ring entries per shard installed by a hash ring rebalance.
    pub virtual_nodes: usize,

    /// Whether the configuration may be changed after construction.
    pub mutable: bool,

    /// Capacity of the directory strategy's LRU cache.
    pub directory_cache_size: usize,

    /// Records per chunk in batch operations.
    pub batch_size: usize,

    /// Attempts per statement on transient storage errors.
    pub max_retries: usize,

    /// Base delay between attempts, grows linearly with the attempt number.
    pub retry_backoff_ms: u64,

    /// Worker threads used for fan-out.
    pub max_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_timeout: 30,
            pool_size: 5,
            shard_base_path: PathBuf::from("./shards"),
            directory_path: PathBuf::from("./directory.json"),
            active_shards: Vec::new(),
            virtual_nodes: 100,
            mutable: false,
            directory_cache_size: 100,
            batch_size: 100,
            max_retries: 3,
            retry_backoff_ms: 25,
            max_workers: 8,
        }
    }
}

impl Config {
    /// Loads and validates a JSON configuration file.
    ///
    /// Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> ShardResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            ShardError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|err| {
            ShardError::Configuration(format!("cannot parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> ShardResult<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)
            .map_err(|err| ShardError::Configuration(err.to_string()))?;
        fs::write(path, raw).map_err(|err| {
            ShardError::Configuration(format!("cannot write {}: {err}", path.display()))
        })
    }

    /// Checks that every setting is within bounds.
    pub fn validate(&self) -> ShardResult<()> {
        let positive = [
            ("connection_timeout", self.connection_timeout as usize),
            ("pool_size", self.pool_size),
            ("virtual_nodes", self.virtual_nodes),
            ("directory_cache_size", self.directory_cache_size),
            ("batch_size", self.batch_size),
            ("max_retries", self.max_retries),
            ("max_workers", self.max_workers),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ShardError::Configuration(format!(
                "{name} must be a positive integer"
            )));
        }
        if self.pool_size > MAX_POOL_SIZE {
            return Err(ShardError::TooManyConnections {
                requested: self.pool_size,
                max: MAX_POOL_SIZE,
            });
        }
        if let Some(shard_id) = self.active_shards.iter().find(|id| !id.is_path_safe()) {
            return Err(ShardError::Configuration(format!(
                "active shard id '{shard_id}' cannot be used as a file name"
            )));
        }
        if self.shard_base_path.as_os_str().is_empty() {
            return Err(ShardError::Configuration(
                "shard_base_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection timeout as a duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.connection_timeout, 30);
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.shard_base_path, PathBuf::from("./shards"));
        assert_eq!(config.directory_path, PathBuf::from("./directory.json"));
        assert_eq!(config.virtual_nodes, 100);
        assert!(!config.mutable);
        assert!(config.validate().is_ok());

        let parsed: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn validation() {
        let config = Config {
            pool_size: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), 1100);
        assert!(err.to_string().contains("pool_size"));

        let config = Config {
            connection_timeout: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            pool_size: MAX_POOL_SIZE + 1,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), 1220);

        let config = Config {
            active_shards: vec![ShardId::from("../outside")],
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), 1100);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"pool_size": 3, "active_shards": ["a", "b"]}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.active_shards, vec![ShardId::from("a"), ShardId::from("b")]);
        assert_eq!(config.connection_timeout, 30);

        let saved = dir.path().join("saved.json");
        config.save(&saved).unwrap();
        assert_eq!(Config::from_file(&saved).unwrap(), config);

        std::fs::write(&path, r#"{"pool_size": -1}"#).unwrap();
        assert_eq!(Config::from_file(&path).unwrap_err().code(), 1100);
        std::fs::write(&path, r#"{"pool_sizes": 1}"#).unwrap();
        assert!(Config::from_file(&path).is_err());
        assert!(Config::from_file(dir.path().join("missing.json")).is_err());
    }
}
