#![forbid(unsafe_code)]

//! Sharded statistics counters.
//!
//! Writers bump a shard chosen by their thread; readers sum all shards.
//! This keeps hot-path increments contention-free without a
//! compare-exchange per event.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

const SHARD_COUNT: usize = 16;

/// A monotone counter sharded across cache lines.
#[derive(Debug)]
pub struct ShardedCounter {
    shards: Box<[AtomicU64]>,
}

impl Default for ShardedCounter {
    fn default() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl ShardedCounter {
    /// Creates a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self) -> &AtomicU64 {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Adds `amount` to this thread's shard.
    pub fn add(&self, amount: u64) {
        self.shard().fetch_add(amount, Ordering::Relaxed);
    }

    /// Increments by one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Sums all shards. The result is exact once writers are quiet.
    pub fn sum(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.load(Ordering::Relaxed))
            .sum()
    }
}

/// Counters kept by each block allocator.
#[derive(Debug, Default)]
pub struct AllocatorStatistics {
    /// Slabs opened for allocation for the first time.
    pub slabs_opened: ShardedCounter,
    /// Slabs re-opened after having been open before.
    pub slabs_reopened: ShardedCounter,
    /// Slabs scrubbed back to a usable state.
    pub slabs_scrubbed: ShardedCounter,
}

impl AllocatorStatistics {
    /// Takes a point-in-time snapshot.
    pub fn snapshot(&self) -> AllocatorStatisticsSnapshot {
        AllocatorStatisticsSnapshot {
            slabs_opened: self.slabs_opened.sum(),
            slabs_reopened: self.slabs_reopened.sum(),
            slabs_scrubbed: self.slabs_scrubbed.sum(),
        }
    }
}

/// Serializable snapshot of [`AllocatorStatistics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStatisticsSnapshot {
    /// Slabs opened for allocation for the first time.
    pub slabs_opened: u64,
    /// Slabs re-opened after having been open before.
    pub slabs_reopened: u64,
    /// Slabs scrubbed back to a usable state.
    pub slabs_scrubbed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sum_sees_all_increments() {
        let counter = ShardedCounter::new();
        for _ in 0..100 {
            counter.increment();
        }
        counter.add(11);
        assert_eq!(counter.sum(), 111);
    }

    #[test]
    fn concurrent_writers_are_counted() {
        let counter = Arc::new(ShardedCounter::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    counter.increment();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.sum(), 4000);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = AllocatorStatistics::default();
        stats.slabs_opened.increment();
        let snapshot = stats.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"slabs_opened\":1"));
    }
}
