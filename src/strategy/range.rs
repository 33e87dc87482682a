use {
    super::{ShardingStrategy, routing_key},
    crate::{
        Criteria,
        ShardError,
        ShardId,
        ShardKey,
        ShardResult,
        interval::{Interval, KeyRange, validate_disjoint},
    },
    parking_lot::RwLock,
    serde_json::Value,
    std::collections::BTreeSet,
    tracing::info,
};

#[derive(Debug, Default, Clone)]
struct RangeMap {
    /// Disjoint intervals, sorted by start.
    intervals: Vec<Interval>,

    /// Registered shards, including those that own no interval yet.
    members: BTreeSet<ShardId>,
}

impl RangeMap {
    /// Index of the interval containing the key.
    fn position(&self, key: &ShardKey) -> Option<usize> {
        let idx = self
            .intervals
            .partition_point(|interval| interval.key_range().start() <= key);
        idx.checked_sub(1)
            .filter(|&idx| self.intervals[idx].key_range().contains(key))
    }

    fn insert(&mut self, interval: Interval) {
        let idx = self
            .intervals
            .partition_point(|other| other.key_range().start() < interval.key_range().start());
        self.members.insert(interval.shard_id().clone());
        self.intervals.insert(idx, interval);
    }
}

/// Range-based strategy.
///
/// Shards own disjoint half-open key ranges. Every mutation is applied to a
/// copy of the range map, validated, and only then committed, so a failed
/// mutation leaves the map untouched.
#[derive(Default)]
pub struct RangeStrategy {
    state: RwLock<RangeMap>,
}

impl RangeStrategy {
    /// Creates a strategy with no ranges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a strategy from predefined ranges.
    ///
    /// Fails with [`ShardError::Range`] if any two ranges overlap.
    pub fn with_ranges<I>(ranges: I) -> ShardResult<Self>
    where
        I: IntoIterator<Item = (KeyRange, ShardId)>,
    {
        let mut map = RangeMap::default();
        for (key_range, shard_id) in ranges {
            map.insert(Interval::new(key_range, shard_id));
        }
        validate_disjoint(&map.intervals)?;

        Ok(Self {
            state: RwLock::new(map),
        })
    }

    /// Assigns `[start..end)` to the given shard.
    pub fn add_range(
        &self,
        start: impl Into<ShardKey>,
        end: impl Into<ShardKey>,
        shard_id: &ShardId,
    ) -> ShardResult<()> {
        let key_range = KeyRange::new(start, end)?;
        self.mutate(|map| {
            if map
                .intervals
                .iter()
                .any(|interval| interval.key_range() == &key_range)
            {
                return Err(ShardError::Range(format!("range {key_range} already exists")));
            }
            map.insert(Interval::new(key_range.clone(), shard_id.clone()));
            Ok(())
        })?;

        info!(%shard_id, range = %key_range, "Added shard range");
        Ok(())
    }

    /// Splits the interval containing `range_start` at `split_point`.
    ///
    /// The current owner keeps `[start..split_point)`, `new_shard_id` takes
    /// `[split_point..end)`. The split point must lie strictly inside the
    /// interval.
    pub fn split_range(
        &self,
        range_start: impl Into<ShardKey>,
        split_point: impl Into<ShardKey>,
        new_shard_id: &ShardId,
    ) -> ShardResult<()> {
        let (range_start, split_point) = (range_start.into(), split_point.into());
        self.mutate(|map| {
            let idx = map.position(&range_start).ok_or_else(|| {
                ShardError::Range(format!("value {range_start} does not fall within any range"))
            })?;
            let interval = map.intervals.remove(idx);
            let key_range = interval.key_range();
            if split_point <= *key_range.start() || split_point >= *key_range.end() {
                return Err(ShardError::Range(format!(
                    "split point {split_point} is outside the range {key_range}"
                )));
            }

            let left = KeyRange::new(key_range.start().clone(), split_point.clone())?;
            let right = KeyRange::new(split_point.clone(), key_range.end().clone())?;
            map.insert(Interval::new(left, interval.shard_id().clone()));
            map.insert(Interval::new(right, new_shard_id.clone()));
            Ok(())
        })?;

        info!(shard_id = %new_shard_id, %split_point, "Split range");
        Ok(())
    }

    /// Combines two adjacent intervals into `[first.start..second.end)`
    /// owned by `target_shard_id`.
    ///
    /// Both ranges must exist exactly as given and `first.end` must equal
    /// `second.start`.
    pub fn merge_ranges(
        &self,
        first: &KeyRange,
        second: &KeyRange,
        target_shard_id: &ShardId,
    ) -> ShardResult<()> {
        if first.end() != second.start() {
            return Err(ShardError::Range(format!(
                "ranges {first} and {second} are not adjacent"
            )));
        }

        self.mutate(|map| {
            for key_range in [first, second] {
                let idx = map
                    .intervals
                    .iter()
                    .position(|interval| interval.key_range() == key_range)
                    .ok_or_else(|| ShardError::Range(format!("range {key_range} does not exist")))?;
                map.intervals.remove(idx);
            }

            let merged = KeyRange::new(first.start().clone(), second.end().clone())?;
            map.insert(Interval::new(merged, target_shard_id.clone()));
            Ok(())
        })?;

        info!(shard_id = %target_shard_id, %first, %second, "Merged ranges");
        Ok(())
    }

    /// Returns every shard whose interval overlaps `[start..end)`.
    pub fn shards_for_span(
        &self,
        start: impl Into<ShardKey>,
        end: impl Into<ShardKey>,
    ) -> ShardResult<Vec<ShardId>> {
        let span = KeyRange::new(start, end)?;
        let state = self.state.read();
        let shards: BTreeSet<ShardId> = state
            .intervals
            .iter()
            .filter(|interval| interval.key_range().overlaps(&span))
            .map(|interval| interval.shard_id().clone())
            .collect();
        Ok(shards.into_iter().collect())
    }

    /// Returns a copy of the current intervals, sorted by start.
    pub fn ranges(&self) -> Vec<Interval> {
        self.state.read().intervals.clone()
    }

    /// Applies `f` to a copy of the map and commits it only if `f` succeeds
    /// and the result is still disjoint.
    fn mutate<F>(&self, f: F) -> ShardResult<()>
    where
        F: FnOnce(&mut RangeMap) -> ShardResult<()>,
    {
        let mut state = self.state.write();
        let mut next = state.clone();
        f(&mut next)?;
        validate_disjoint(&next.intervals)?;
        *state = next;
        Ok(())
    }

    fn resolve(&self, key: &ShardKey) -> ShardResult<ShardId> {
        let state = self.state.read();
        state
            .position(key)
            .map(|idx| state.intervals[idx].shard_id().clone())
            .ok_or_else(|| ShardError::Range(format!("value {key} does not fall within any range")))
    }
}

impl ShardingStrategy for RangeStrategy {
    fn resolve_for_key(&self, key: &Value) -> ShardResult<ShardId> {
        self.resolve(&ShardKey::from_value(key)?)
    }

    /// With the routing key present this is a point lookup (no shard if no
    /// range covers the key); otherwise every shard is a candidate. Criteria
    /// are never read as a span, use
    /// [`shards_for_span()`](RangeStrategy::shards_for_span) for that.
    fn resolve_for_query(&self, criteria: &Criteria) -> ShardResult<Vec<ShardId>> {
        match routing_key(criteria)? {
            Some(key) => {
                let state = self.state.read();
                Ok(state
                    .position(&key)
                    .map(|idx| vec![state.intervals[idx].shard_id().clone()])
                    .unwrap_or_default())
            }
            None => Ok(self.all_shards()),
        }
    }

    /// Registers the shard without key space; assign ranges with
    /// [`add_range()`](RangeStrategy::add_range) or
    /// [`split_range()`](RangeStrategy::split_range).
    fn add_shard(&self, shard_id: &ShardId) -> ShardResult<()> {
        let mut state = self.state.write();
        if !state.members.insert(shard_id.clone()) {
            return Err(ShardError::strategy(
                format!("shard {shard_id} is already registered"),
                None,
            ));
        }
        info!(%shard_id, "Added shard without range");
        Ok(())
    }

    fn remove_shard(&self, shard_id: &ShardId) -> ShardResult<()> {
        let mut state = self.state.write();
        if !state.members.remove(shard_id) {
            return Err(ShardError::strategy(
                format!("shard {shard_id} is not registered"),
                None,
            ));
        }
        state.intervals.retain(|interval| interval.shard_id() != shard_id);
        info!(%shard_id, "Removed shard and its ranges");
        Ok(())
    }

    fn all_shards(&self) -> Vec<ShardId> {
        self.state.read().members.iter().cloned().collect()
    }
}
