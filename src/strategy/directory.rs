use {
    super::{ShardingStrategy, routing_key},
    crate::{Criteria, ShardError, ShardId, ShardKey, ShardResult},
    lru::LruCache,
    parking_lot::Mutex,
    serde_json::Value,
    std::{
        collections::{BTreeMap, BTreeSet},
        fs,
        io::{BufReader, BufWriter, Write},
        num::NonZeroUsize,
        path::{Path, PathBuf},
    },
    tracing::{debug, info},
};

struct Directory {
    /// Persisted key -> shard mapping.
    mappings: BTreeMap<String, ShardId>,

    /// Hot subset of `mappings`.
    cache: LruCache<String, ShardId>,

    /// Shards registered explicitly, whether or not they own keys.
    shards: BTreeSet<ShardId>,
}

/// Directory-based strategy.
///
/// Keys are explicitly mapped to shards. The mapping lives in a JSON object
/// file (`{ "key": "shard_id", ... }`) rewritten wholesale on every mutation,
/// and a bounded LRU cache mirrors its hot entries.
///
/// Keys are stored in their canonical rendering, so `1` and `"1"` refer to
/// the same entry.
pub struct DirectoryStrategy {
    path: PathBuf,
    state: Mutex<Directory>,
}

impl DirectoryStrategy {
    /// Opens the directory persisted at `path`, or starts an empty one if the
    /// file does not exist yet.
    pub fn open(path: impl Into<PathBuf>, cache_size: usize) -> ShardResult<Self> {
        let path = path.into();
        let capacity = NonZeroUsize::new(cache_size).ok_or_else(|| {
            ShardError::Configuration("directory cache size must be positive".to_string())
        })?;

        let mappings = if path.exists() {
            load(&path)?
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), entries = mappings.len(), "Opened shard directory");

        Ok(Self {
            path,
            state: Mutex::new(Directory {
                mappings,
                cache: LruCache::new(capacity),
                shards: BTreeSet::new(),
            }),
        })
    }

    /// Adds or replaces a key -> shard mapping and persists the directory.
    pub fn add_mapping(&self, key: impl Into<ShardKey>, shard_id: &ShardId) -> ShardResult<()> {
        let key = validated(key.into())?.to_string();
        let mut state = self.state.lock();
        let previous = state.mappings.insert(key.clone(), shard_id.clone());
        if let Err(err) = save(&self.path, &state.mappings) {
            match previous {
                Some(previous) => state.mappings.insert(key, previous),
                None => state.mappings.remove(&key),
            };
            return Err(err);
        }
        state.cache.put(key.clone(), shard_id.clone());

        debug!(%key, %shard_id, "Added directory mapping");
        Ok(())
    }

    /// Removes a mapping, returning whether it existed.
    pub fn remove_mapping(&self, key: impl Into<ShardKey>) -> ShardResult<bool> {
        let key = key.into().to_string();
        let mut state = self.state.lock();
        let Some(previous) = state.mappings.remove(&key) else {
            return Ok(false);
        };
        if let Err(err) = save(&self.path, &state.mappings) {
            state.mappings.insert(key, previous);
            return Err(err);
        }
        state.cache.pop(&key);

        debug!(%key, "Removed directory mapping");
        Ok(true)
    }

    /// Merges the given mappings into the directory.
    ///
    /// The whole cache is invalidated; it repopulates lazily on lookups.
    pub fn import_mappings<I, K>(&self, mappings: I) -> ShardResult<usize>
    where
        I: IntoIterator<Item = (K, ShardId)>,
        K: Into<ShardKey>,
    {
        let incoming = mappings
            .into_iter()
            .map(|(key, shard_id)| Ok((validated(key.into())?.to_string(), shard_id)))
            .collect::<ShardResult<Vec<_>>>()?;

        let mut state = self.state.lock();
        let mut next = state.mappings.clone();
        let count = incoming.len();
        next.extend(incoming);
        save(&self.path, &next)?;
        state.mappings = next;
        state.cache.clear();

        info!(count, "Imported directory mappings");
        Ok(count)
    }

    /// Returns every key mapped to the given shard.
    pub fn mappings_for_shard(&self, shard_id: &ShardId) -> Vec<String> {
        self.state
            .lock()
            .mappings
            .iter()
            .filter(|(_, owner)| *owner == shard_id)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns the union of shards holding the given keys.
    ///
    /// Keys absent from the directory are skipped.
    pub fn shards_for_keys<'a, I>(&self, keys: I) -> Vec<ShardId>
    where
        I: IntoIterator<Item = &'a ShardKey>,
    {
        let shards: BTreeSet<ShardId> = keys
            .into_iter()
            .filter_map(|key| self.resolve(key).ok())
            .collect();
        shards.into_iter().collect()
    }

    /// Number of cached entries.
    pub fn cached_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Path of the persisted mapping.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resolve(&self, key: &ShardKey) -> ShardResult<ShardId> {
        let key = key.to_string();
        let mut state = self.state.lock();
        if let Some(shard_id) = state.cache.get(&key) {
            return Ok(shard_id.clone());
        }

        let shard_id = state
            .mappings
            .get(&key)
            .cloned()
            .ok_or_else(|| ShardError::strategy("key not found in directory", Some(key.clone())))?;
        state.cache.put(key, shard_id.clone());
        Ok(shard_id)
    }
}

impl ShardingStrategy for DirectoryStrategy {
    fn resolve_for_key(&self, key: &Value) -> ShardResult<ShardId> {
        self.resolve(&ShardKey::from_value(key)?)
    }

    /// Only the routing key of the criteria is looked up; an unmapped key
    /// yields no shard. To route a list of keys use
    /// [`shards_for_keys()`](DirectoryStrategy::shards_for_keys).
    fn resolve_for_query(&self, criteria: &Criteria) -> ShardResult<Vec<ShardId>> {
        match routing_key(criteria)? {
            Some(key) => Ok(self.shards_for_keys([&key])),
            None => Ok(self.all_shards()),
        }
    }

    fn add_shard(&self, shard_id: &ShardId) -> ShardResult<()> {
        let mut state = self.state.lock();
        let mapped = state.mappings.values().any(|owner| owner == shard_id);
        if mapped || !state.shards.insert(shard_id.clone()) {
            return Err(ShardError::strategy(
                format!("shard {shard_id} already exists in directory"),
                None,
            ));
        }
        info!(%shard_id, "Added shard to directory");
        Ok(())
    }

    /// Drops the shard and every key mapped to it.
    ///
    /// Fails if the shard was never added and owns no key.
    fn remove_shard(&self, shard_id: &ShardId) -> ShardResult<()> {
        let mut state = self.state.lock();
        let mapped = state.mappings.values().any(|owner| owner == shard_id);
        if !mapped && !state.shards.contains(shard_id) {
            return Err(ShardError::strategy(
                format!("shard {shard_id} is not in directory"),
                None,
            ));
        }
        let mut next = state.mappings.clone();
        next.retain(|_, owner| owner != shard_id);
        let removed = state.mappings.len() - next.len();
        if removed > 0 {
            save(&self.path, &next)?;
        }

        let keys: Vec<String> = state
            .mappings
            .iter()
            .filter(|(_, owner)| *owner == shard_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            state.cache.pop(key);
        }
        state.mappings = next;
        state.shards.remove(shard_id);

        info!(%shard_id, removed, "Removed shard from directory");
        Ok(())
    }

    fn all_shards(&self) -> Vec<ShardId> {
        let state = self.state.lock();
        let shards: BTreeSet<ShardId> = state
            .shards
            .iter()
            .chain(state.mappings.values())
            .cloned()
            .collect();
        shards.into_iter().collect()
    }
}

/// Rejects keys that could not be routed, such as empty strings.
fn validated(key: ShardKey) -> ShardResult<ShardKey> {
    ShardKey::from_value(&key.to_value())
}

fn load(path: &Path) -> ShardResult<BTreeMap<String, ShardId>> {
    let file = fs::File::open(path).map_err(|err| persistence_error(path, err))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| persistence_error(path, err))
}

/// Rewrites the whole directory file.
///
/// The mapping is written to a sibling temporary file first and renamed
/// over the target, so readers never observe a half-written file.
fn save(path: &Path, mappings: &BTreeMap<String, ShardId>) -> ShardResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| persistence_error(path, err))?;
    }

    let tmp = path.with_extension("json.tmp");
    let write = || -> std::io::Result<()> {
        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        serde_json::to_writer(&mut writer, mappings)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|err| persistence_error(path, err))
}

fn persistence_error(path: &Path, err: impl std::fmt::Display) -> ShardError {
    ShardError::strategy(
        format!("directory file {}: {err}", path.display()),
        None,
    )
}
