use {
    crate::{ShardError, ShardId, ShardResult},
    auto_impl::auto_impl,
    parking_lot::RwLock,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    std::{
        collections::{BTreeMap, HashMap},
        path::{Path, PathBuf},
    },
    tracing::{debug, warn},
};

/// What the registry knows about a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,

    /// Backing database file.
    pub location: PathBuf,
}

/// Registry of existing shards and their locations.
///
/// No durability is implied: an implementation may lose everything on
/// restart, the manager re-registers the shards it knows on startup.
#[auto_impl(&, Box, Arc)]
pub trait MetadataStore: Send + Sync {
    /// Records a new shard; fails if the shard is already registered.
    fn register_shard(&self, shard_id: &ShardId, location: &Path) -> ShardResult<()>;

    /// Forgets a shard, returning what was known about it.
    fn unregister_shard(&self, shard_id: &ShardId) -> Option<ShardInfo>;

    fn shard_info(&self, shard_id: &ShardId) -> Option<ShardInfo>;

    /// Registered shard ids, sorted.
    fn list_shards(&self) -> Vec<ShardId>;

    /// Stores an arbitrary value under `key`, replacing any previous one.
    fn store_metadata(&self, key: &str, value: Value);

    fn metadata(&self, key: &str) -> Option<Value>;
}

/// Process-local registry.
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    shards: RwLock<BTreeMap<ShardId, ShardInfo>>,
    values: RwLock<HashMap<String, Value>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        warn!("Shard metadata is kept in memory only (best-effort, not durable)");
        Self::default()
    }
}

impl MetadataStore for InMemoryMetadata {
    fn register_shard(&self, shard_id: &ShardId, location: &Path) -> ShardResult<()> {
        let mut shards = self.shards.write();
        if shards.contains_key(shard_id) {
            return Err(ShardError::Sharding {
                message: "shard is already registered".to_string(),
                shard_id: Some(shard_id.clone()),
                source: None,
            });
        }
        shards.insert(shard_id.clone(), ShardInfo {
            shard_id: shard_id.clone(),
            location: location.to_path_buf(),
        });
        debug!(%shard_id, location = %location.display(), "Registered shard");
        Ok(())
    }

    fn unregister_shard(&self, shard_id: &ShardId) -> Option<ShardInfo> {
        self.shards.write().remove(shard_id)
    }

    fn shard_info(&self, shard_id: &ShardId) -> Option<ShardInfo> {
        self.shards.read().get(shard_id).cloned()
    }

    fn list_shards(&self) -> Vec<ShardId> {
        self.shards.read().keys().cloned().collect()
    }

    fn store_metadata(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_string(), value);
    }

    fn metadata(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn registry() {
        let metadata = InMemoryMetadata::new();
        let s1 = ShardId::from("shard_1");
        metadata.register_shard(&s1, Path::new("/tmp/shard_1.db")).unwrap();
        assert_eq!(
            metadata.register_shard(&s1, Path::new("/x")).unwrap_err().shard_id(),
            Some(&s1)
        );

        let info = metadata.shard_info(&s1).unwrap();
        assert_eq!(info.location, PathBuf::from("/tmp/shard_1.db"));
        assert_eq!(metadata.list_shards(), vec![s1.clone()]);

        assert_eq!(metadata.unregister_shard(&s1), Some(info));
        assert!(metadata.shard_info(&s1).is_none());
        assert!(metadata.list_shards().is_empty());
    }

    #[test]
    fn arbitrary_values() {
        let metadata = InMemoryMetadata::new();
        assert!(metadata.metadata("owner").is_none());
        metadata.store_metadata("owner", json!({"team": "storage"}));
        assert_eq!(metadata.metadata("owner"), Some(json!({"team": "storage"})));
    }
}
