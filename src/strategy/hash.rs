use {
    super::{ShardingStrategy, routing_key},
    crate::{
        Criteria,
        ShardError,
        ShardId,
        ShardKey,
        ShardResult,
        hash::{KeyHasher, Md5Hasher, RingPosition},
    },
    parking_lot::RwLock,
    serde_json::Value,
    std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
    },
    tracing::info,
};

/// Immutable snapshot of the hash ring.
///
/// Writers build a new snapshot and swap it in, so lookups never wait for a
/// ring edit to finish.
#[derive(Debug, Default, Clone)]
struct Ring {
    /// Ring position -> owning shard.
    entries: BTreeMap<RingPosition, ShardId>,

    /// Registered shards.
    members: BTreeSet<ShardId>,
}

impl Ring {
    /// Finds the first entry at or after `position`, wrapping around to the
    /// smallest entry.
    fn lookup(&self, position: RingPosition) -> Option<&ShardId> {
        self.entries
            .range(position..)
            .next()
            .or_else(|| self.entries.iter().next())
            .map(|(_, shard_id)| shard_id)
    }
}

/// Consistent hashing strategy.
///
/// Keys and shards are hashed onto a ring of 128-bit positions; a key
/// belongs to the first shard entry at or after its position. Removing a
/// shard only moves the keys it owned, every other key keeps its shard.
pub struct HashStrategy {
    hasher: Box<dyn KeyHasher>,
    virtual_nodes: usize,
    ring: RwLock<Arc<Ring>>,
}

impl HashStrategy {
    /// Creates an empty ring using the default MD5 hasher.
    ///
    /// `virtual_nodes` is the number of ring entries per shard installed by
    /// [`rebalance()`](Self::rebalance).
    pub fn new(virtual_nodes: usize) -> Self {
        Self::with_hasher(virtual_nodes, Md5Hasher)
    }

    /// Creates an empty ring with a custom hasher.
    pub fn with_hasher<H: KeyHasher + 'static>(virtual_nodes: usize, hasher: H) -> Self {
        Self {
            hasher: Box::new(hasher),
            virtual_nodes: virtual_nodes.max(1),
            ring: RwLock::new(Arc::new(Ring::default())),
        }
    }

    /// Returns ring position to which a given key will be assigned.
    pub fn position(&self, key: &ShardKey) -> RingPosition {
        self.hasher.hash_key(&key.to_string())
    }

    /// Number of entries on the ring.
    pub fn ring_len(&self) -> usize {
        self.snapshot().entries.len()
    }

    /// Replaces the ring with `virtual_nodes` entries per registered shard.
    ///
    /// Entry `i` of shard `s` sits at `hash("s:i")`. This is an explicit
    /// maintenance action: keys move between shards and data is not migrated.
    ///
    /// Returns the number of ring entries owned by each shard.
    pub fn rebalance(&self) -> BTreeMap<ShardId, usize> {
        let mut ring = self.ring.write();
        let mut next = Ring {
            entries: BTreeMap::new(),
            members: ring.members.clone(),
        };
        for shard_id in &next.members {
            for i in 0..self.virtual_nodes {
                let position = self.hasher.hash_key(&format!("{shard_id}:{i}"));
                next.entries.entry(position).or_insert_with(|| shard_id.clone());
            }
        }

        let mut distribution: BTreeMap<ShardId, usize> =
            next.members.iter().map(|id| (id.clone(), 0)).collect();
        for shard_id in next.entries.values() {
            *distribution.entry(shard_id.clone()).or_default() += 1;
        }

        *ring = Arc::new(next);
        info!(?distribution, "Rebalanced hash ring");
        distribution
    }

    fn snapshot(&self) -> Arc<Ring> {
        Arc::clone(&self.ring.read())
    }

    fn resolve(&self, key: &ShardKey) -> ShardResult<ShardId> {
        let position = self.position(key);
        self.snapshot()
            .lookup(position)
            .cloned()
            .ok_or_else(|| ShardError::strategy("hash ring is empty", Some(key.to_string())))
    }
}

impl ShardingStrategy for HashStrategy {
    fn resolve_for_key(&self, key: &Value) -> ShardResult<ShardId> {
        self.resolve(&ShardKey::from_value(key)?)
    }

    /// Arbitrary predicates cannot be mapped onto a single ring position, so
    /// unless the criteria pin the routing key, every shard is a candidate.
    fn resolve_for_query(&self, criteria: &Criteria) -> ShardResult<Vec<ShardId>> {
        match routing_key(criteria)? {
            Some(key) => Ok(vec![self.resolve(&key)?]),
            None => Ok(self.all_shards()),
        }
    }

    fn add_shard(&self, shard_id: &ShardId) -> ShardResult<()> {
        let position = self.hasher.hash_key(shard_id.as_str());
        let mut ring = self.ring.write();
        if ring.members.contains(shard_id) {
            return Err(ShardError::strategy(
                format!("shard {shard_id} is already on the hash ring"),
                None,
            ));
        }

        let mut next = Ring::clone(&ring);
        next.members.insert(shard_id.clone());
        next.entries.entry(position).or_insert_with(|| shard_id.clone());
        *ring = Arc::new(next);

        info!(%shard_id, "Added shard to hash ring");
        Ok(())
    }

    fn remove_shard(&self, shard_id: &ShardId) -> ShardResult<()> {
        let mut ring = self.ring.write();
        if !ring.members.contains(shard_id) {
            return Err(ShardError::strategy(
                format!("shard {shard_id} is not on the hash ring"),
                None,
            ));
        }

        let mut next = Ring::clone(&ring);
        next.members.remove(shard_id);
        next.entries.retain(|_, owner| owner != shard_id);
        *ring = Arc::new(next);

        info!(%shard_id, "Removed shard from hash ring");
        Ok(())
    }

    fn all_shards(&self) -> Vec<ShardId> {
        self.snapshot().members.iter().cloned().collect()
    }
}
