//! Shared bookkeeping across concurrent chunk fetches.
//!
//! One tracker exists per download run. All mutations go through a single
//! mutex so byte totals, the validated set and the attempt counters stay
//! consistent when fetch tasks complete out of order.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// Hard ceiling on parallel chunk fetches for one download.
pub(crate) const MAX_CONCURRENT_CHUNKS: usize = 3;

#[derive(Debug, Default)]
struct TrackerState {
    validated: BTreeSet<u32>,
    sizes: BTreeMap<u32, u64>,
    attempted: u64,
    failed: u64,
}

#[derive(Debug, Default)]
pub struct ChunkTracker {
    state: Mutex<TrackerState>,
}

impl ChunkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_validated(&self, index: u32) -> bool {
        self.state.lock().validated.contains(&index)
    }

    /// Record a chunk as safely on disk and hash-verified.
    pub fn mark_validated(&self, index: u32, size: u64) {
        let mut state = self.state.lock();
        state.validated.insert(index);
        state.sizes.insert(index, size);
    }

    pub fn set_size(&self, index: u32, size: u64) {
        self.state.lock().sizes.insert(index, size);
    }

    pub fn snapshot_validated(&self) -> BTreeSet<u32> {
        self.state.lock().validated.clone()
    }

    pub fn snapshot_sizes(&self) -> BTreeMap<u32, u64> {
        self.state.lock().sizes.clone()
    }

    pub fn completed_chunks(&self) -> u32 {
        self.state.lock().validated.len() as u32
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.state.lock().sizes.values().sum()
    }

    /// Count one fetch attempt (including retries).
    pub fn record_attempt(&self) {
        self.state.lock().attempted += 1;
    }

    /// Count one failed fetch attempt.
    pub fn record_failure(&self) {
        self.state.lock().failed += 1;
    }

    pub fn failure_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.attempted, state.failed)
    }

    /// Concurrency level for newly launched fetches, derived from the
    /// observed failure ratio: full fan-out while failures stay under 10%,
    /// throttled to 2 up to 30%, serialized beyond that.
    pub fn concurrency_level(&self) -> usize {
        let state = self.state.lock();
        if state.attempted == 0 {
            return MAX_CONCURRENT_CHUNKS;
        }
        let ratio = state.failed as f64 / state.attempted as f64;
        if ratio <= 0.10 {
            MAX_CONCURRENT_CHUNKS
        } else if ratio <= 0.30 {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_snapshot() {
        let tracker = ChunkTracker::new();
        assert!(!tracker.is_validated(0));

        tracker.mark_validated(0, 1000);
        tracker.mark_validated(2, 999);
        assert!(tracker.is_validated(0));
        assert!(!tracker.is_validated(1));
        assert_eq!(tracker.completed_chunks(), 2);
        assert_eq!(tracker.downloaded_bytes(), 1999);
        assert_eq!(tracker.snapshot_validated(), BTreeSet::from([0, 2]));
        assert_eq!(tracker.snapshot_sizes().get(&2), Some(&999));
    }

    #[test]
    fn test_concurrency_thresholds() {
        let tracker = ChunkTracker::new();
        // No attempts yet: full fan-out
        assert_eq!(tracker.concurrency_level(), 3);

        // 1 failure over 10 attempts = exactly 10%: still full
        for _ in 0..10 {
            tracker.record_attempt();
        }
        tracker.record_failure();
        assert_eq!(tracker.concurrency_level(), 3);

        // 3/10 = 30%: throttled to 2
        tracker.record_failure();
        tracker.record_failure();
        assert_eq!(tracker.concurrency_level(), 2);

        // 4/10 = 40%: serialized
        tracker.record_failure();
        assert_eq!(tracker.concurrency_level(), 1);
    }
}
