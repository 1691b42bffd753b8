//! Structured progress events and their rate-limited delivery.
//!
//! Events are coalesced structurally: the engine emits exactly one event per
//! validated chunk plus one per phase transition, never more.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPhase {
    Initializing,
    Downloading,
    Merging,
    Validating,
    Compiling,
    Complete,
}

/// Snapshot of download progress delivered to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedProgress {
    /// Overall progress in `0.0..=100.0`, scaled across all phases.
    pub percentage: f64,
    pub downloaded_bytes: u64,
    /// Estimated while fetching, exact from merging onward.
    pub total_bytes: u64,
    pub bytes_per_second: f64,
    pub eta_seconds: Option<u64>,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub phase: DownloadPhase,
}

/// Progress callback for downloads.
pub type ProgressCallback = Arc<dyn Fn(DetailedProgress) + Send + Sync>;

struct RateWindow {
    at: Instant,
    bytes: u64,
}

/// Computes percentages, throughput and ETA, and forwards events to the
/// caller-supplied callback.
///
/// Fetching occupies the front of the percentage range and the tail is
/// reserved for merge/validate (and compile when the artifact needs
/// post-processing), so the bar never moves backwards across phases.
pub(crate) struct ProgressEmitter {
    callback: Option<ProgressCallback>,
    total_chunks: u32,
    will_compile: bool,
    rate: Mutex<RateWindow>,
}

impl ProgressEmitter {
    /// Announce a run before the manifest (and thus the chunk totals) is
    /// known.
    pub fn emit_initializing(callback: &Option<ProgressCallback>) {
        if let Some(callback) = callback {
            callback(DetailedProgress {
                percentage: 0.0,
                downloaded_bytes: 0,
                total_bytes: 0,
                bytes_per_second: 0.0,
                eta_seconds: None,
                current_chunk: 0,
                total_chunks: 0,
                phase: DownloadPhase::Initializing,
            });
        }
    }

    pub fn new(callback: Option<ProgressCallback>, total_chunks: u32, will_compile: bool) -> Self {
        Self {
            callback,
            total_chunks,
            will_compile,
            rate: Mutex::new(RateWindow {
                at: Instant::now(),
                bytes: 0,
            }),
        }
    }

    /// Seed the throughput window with bytes that were already on disk, so
    /// resumed chunks are not counted as instantaneous transfer.
    pub fn reset_baseline(&self, bytes: u64) {
        let mut rate = self.rate.lock();
        rate.at = Instant::now();
        rate.bytes = bytes;
    }

    fn fetch_cap(&self) -> f64 {
        if self.will_compile {
            85.0
        } else {
            95.0
        }
    }

    fn phase_percentage(&self, phase: DownloadPhase, completed: u32) -> f64 {
        match phase {
            DownloadPhase::Initializing => 0.0,
            DownloadPhase::Downloading => self.fetch_percentage(completed),
            DownloadPhase::Merging => self.fetch_cap(),
            DownloadPhase::Validating => {
                if self.will_compile {
                    88.0
                } else {
                    98.0
                }
            }
            DownloadPhase::Compiling => 90.0,
            DownloadPhase::Complete => 100.0,
        }
    }

    fn fetch_percentage(&self, completed: u32) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.fetch_cap() * completed as f64 / self.total_chunks as f64
    }

    fn throughput(&self, downloaded_bytes: u64) -> f64 {
        let mut rate = self.rate.lock();
        let elapsed = rate.at.elapsed().as_secs_f64();
        let delta = downloaded_bytes.saturating_sub(rate.bytes);
        rate.at = Instant::now();
        rate.bytes = downloaded_bytes;
        if elapsed <= 0.0 {
            return 0.0;
        }
        delta as f64 / elapsed
    }

    /// Emit a phase-transition event.
    pub fn emit_phase(&self, phase: DownloadPhase, completed: u32, downloaded_bytes: u64, total_bytes: u64) {
        let Some(callback) = &self.callback else {
            return;
        };
        let bps = self.throughput(downloaded_bytes);
        callback(DetailedProgress {
            percentage: self.phase_percentage(phase, completed),
            downloaded_bytes,
            total_bytes,
            bytes_per_second: bps,
            eta_seconds: None,
            current_chunk: completed,
            total_chunks: self.total_chunks,
            phase,
        });
    }

    /// Emit one event for a freshly validated chunk.
    pub fn emit_chunk(&self, completed: u32, downloaded_bytes: u64) {
        let Some(callback) = &self.callback else {
            return;
        };
        let estimated_total = estimate_total_bytes(downloaded_bytes, completed, self.total_chunks);
        let bps = self.throughput(downloaded_bytes);
        let remaining = estimated_total.saturating_sub(downloaded_bytes);
        let eta_seconds = if bps > 0.0 {
            Some((remaining as f64 / bps).ceil() as u64)
        } else {
            None
        };
        callback(DetailedProgress {
            percentage: self.fetch_percentage(completed),
            downloaded_bytes,
            total_bytes: estimated_total,
            bytes_per_second: bps,
            eta_seconds,
            current_chunk: completed,
            total_chunks: self.total_chunks,
            phase: DownloadPhase::Downloading,
        });
    }
}

/// Project the artifact size from the chunks seen so far.
pub(crate) fn estimate_total_bytes(downloaded_bytes: u64, completed: u32, total_chunks: u32) -> u64 {
    downloaded_bytes * total_chunks as u64 / std::cmp::max(1, completed) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn collect() -> (ProgressCallback, Arc<PlMutex<Vec<DetailedProgress>>>) {
        let events = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().push(p));
        (callback, events)
    }

    #[test]
    fn test_estimate_total_bytes() {
        assert_eq!(estimate_total_bytes(2000, 2, 3), 3000);
        assert_eq!(estimate_total_bytes(0, 0, 3), 0);
        assert_eq!(estimate_total_bytes(999, 1, 1), 999);
    }

    #[test]
    fn test_phase_ladder_without_compile() {
        let emitter = ProgressEmitter::new(None, 4, false);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Initializing, 0), 0.0);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Downloading, 2), 47.5);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Merging, 4), 95.0);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Validating, 4), 98.0);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Complete, 4), 100.0);
    }

    #[test]
    fn test_phase_ladder_with_compile() {
        let emitter = ProgressEmitter::new(None, 4, true);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Downloading, 4), 85.0);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Merging, 4), 85.0);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Validating, 4), 88.0);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Compiling, 4), 90.0);
        assert_eq!(emitter.phase_percentage(DownloadPhase::Complete, 4), 100.0);
    }

    #[test]
    fn test_chunk_events_carry_estimate() {
        let (callback, events) = collect();
        let emitter = ProgressEmitter::new(Some(callback), 3, false);

        emitter.emit_chunk(1, 1000);
        emitter.emit_chunk(2, 2000);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].total_bytes, 3000);
        assert_eq!(events[1].total_bytes, 3000);
        assert_eq!(events[1].current_chunk, 2);
        assert_eq!(events[1].phase, DownloadPhase::Downloading);
        assert!(events[1].percentage > events[0].percentage);
    }

    #[test]
    fn test_no_callback_is_silent() {
        let emitter = ProgressEmitter::new(None, 3, false);
        emitter.emit_phase(DownloadPhase::Initializing, 0, 0, 0);
        emitter.emit_chunk(1, 100);
    }
}
