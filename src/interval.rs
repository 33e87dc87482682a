use {
    crate::{ShardError, ShardId, ShardKey, ShardResult},
    std::fmt,
};

/// A half-open range of keys.
///
/// Range bounded inclusively below and exclusively above i.e.
/// `[start..end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    start: ShardKey,
    end: ShardKey,
}

impl KeyRange {
    /// Creates a new key range.
    ///
    /// Fails with [`ShardError::Range`] if the range is empty.
    pub fn new(start: impl Into<ShardKey>, end: impl Into<ShardKey>) -> ShardResult<Self> {
        let (start, end) = (start.into(), end.into());
        if start >= end {
            return Err(ShardError::Range(format!(
                "range start {start} must be below its end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> &ShardKey {
        &self.start
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> &ShardKey {
        &self.end
    }

    /// Check if the given key is in the range.
    pub fn contains(&self, key: &ShardKey) -> bool {
        key >= &self.start && key < &self.end
    }

    /// Check if two half-open ranges share at least one key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !(other.end <= self.start || other.start >= self.end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end)
    }
}

/// A key range with the shard responsible for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    key_range: KeyRange,
    shard_id: ShardId,
}

impl Interval {
    /// Creates a new interval with the given key range and owner.
    pub fn new(key_range: KeyRange, shard_id: ShardId) -> Self {
        Self {
            key_range,
            shard_id,
        }
    }

    /// Returns the key range of the interval.
    pub fn key_range(&self) -> &KeyRange {
        &self.key_range
    }

    /// Returns the shard responsible for the interval.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }
}

/// Checks that the intervals, sorted by start, are pairwise disjoint.
pub(crate) fn validate_disjoint(intervals: &[Interval]) -> ShardResult<()> {
    for pair in intervals.windows(2) {
        let (left, right) = (&pair[0].key_range, &pair[1].key_range);
        if left.end > right.start {
            return Err(ShardError::Range(format!(
                "overlapping ranges detected: {left} and {right}"
            )));
        }
    }
    Ok(())
}
