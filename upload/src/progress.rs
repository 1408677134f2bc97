use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A snapshot of aggregate upload progress, as reported to the caller.
///
/// `percentage` is monotonically non-decreasing for the lifetime of one
/// upload task even though individual parts reset their in-flight byte
/// counts when they retry.
///
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    /// Parts confirmed by the backend.
    pub completed_parts: u32,

    /// Parts discovered so far (grows as URL batches arrive).
    pub total_parts_known: u32,

    /// Bytes reported as uploaded, monotonic.
    pub uploaded_bytes: u64,

    /// Total bytes in the file.
    pub total_bytes: u64,

    /// `uploaded_bytes / total_bytes` as a percentage, monotonic.
    pub percentage: f64,
}

/// Callback receiving progress snapshots.
///
pub type ProgressSink = Box<dyn Fn(UploadProgress) + Send + Sync>;

/// The single owner of progress arithmetic for one upload task.
///
/// Per-part byte counts flow in from concurrently running part uploads; every
/// mutation funnels through one recompute step that enforces the monotonicity
/// invariant in one place, so a retried part (whose own contribution resets
/// to zero) can never make the externally visible numbers go backwards.
///
pub struct ProgressTracker {
    total_bytes: u64,
    sink: Option<ProgressSink>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    completed_parts: u32,
    total_parts_known: u32,
    completed_bytes: u64,
    in_flight: HashMap<u32, u64>,
    high_water_bytes: u64,
    high_water_pct: f64,
}

impl ProgressTracker {
    /// Create a tracker for a file of `total_bytes`, optionally emitting
    /// every snapshot to `sink`.
    ///
    pub fn new(total_bytes: u64, sink: Option<ProgressSink>) -> Self {
        Self {
            total_bytes,
            sink,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record how many parts have been discovered so far.
    ///
    pub fn set_total_parts_known(&self, total: u32) {
        let mut inner = self.lock();
        if total > inner.total_parts_known {
            inner.total_parts_known = total;
            self.recompute_and_emit(&mut inner);
        }
    }

    /// Record the cumulative bytes sent for the current attempt of a part.
    ///
    pub fn part_progress(&self, part_number: u32, bytes: u64) {
        let mut inner = self.lock();
        inner.in_flight.insert(part_number, bytes);
        self.recompute_and_emit(&mut inner);
    }

    /// Zero a part's in-flight contribution ahead of a retry attempt.
    ///
    /// The external aggregate does not regress; only the internal accounting
    /// resets so a failed attempt cannot inflate it.
    ///
    pub fn reset_part(&self, part_number: u32) {
        let mut inner = self.lock();
        inner.in_flight.insert(part_number, 0);
        self.recompute_and_emit(&mut inner);
    }

    /// Record backend confirmation of a part of `len` bytes.
    ///
    pub fn part_completed(&self, part_number: u32, len: u64) {
        let mut inner = self.lock();
        inner.in_flight.remove(&part_number);
        inner.completed_parts += 1;
        inner.completed_bytes += len;
        self.recompute_and_emit(&mut inner);
    }

    /// The current (monotonic) snapshot.
    ///
    pub fn snapshot(&self) -> UploadProgress {
        let inner = self.lock();
        self.snapshot_of(&inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding this lock poisons nothing recoverable; the
        // task is already failing.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recompute_and_emit(&self, inner: &mut Inner) {
        let in_flight: u64 = inner.in_flight.values().sum();
        let raw_bytes = inner.completed_bytes + in_flight;
        inner.high_water_bytes = inner.high_water_bytes.max(raw_bytes);

        let raw_pct = if self.total_bytes == 0 {
            if inner.total_parts_known > 0 && inner.completed_parts >= inner.total_parts_known {
                100.0
            } else {
                0.0
            }
        } else {
            (inner.high_water_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        };
        inner.high_water_pct = inner.high_water_pct.max(raw_pct);

        if let Some(sink) = &self.sink {
            sink(self.snapshot_of(inner));
        }
    }

    fn snapshot_of(&self, inner: &Inner) -> UploadProgress {
        UploadProgress {
            completed_parts: inner.completed_parts,
            total_parts_known: inner.total_parts_known,
            uploaded_bytes: inner.high_water_bytes,
            total_bytes: self.total_bytes,
            percentage: inner.high_water_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn collecting_tracker(total: u64) -> (Arc<Mutex<Vec<f64>>>, ProgressTracker) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let tracker = ProgressTracker::new(
            total,
            Some(Box::new(move |p: UploadProgress| {
                sink_seen.lock().unwrap().push(p.percentage);
            })),
        );
        (seen, tracker)
    }

    #[test]
    fn test_percentage_never_decreases_across_retries() {
        let (seen, tracker) = collecting_tracker(1000);
        tracker.set_total_parts_known(2);

        tracker.part_progress(1, 400);
        tracker.part_progress(2, 100);
        // Part 1 fails and retries from zero.
        tracker.reset_part(1);
        tracker.part_progress(1, 200);
        tracker.part_progress(1, 500);
        tracker.part_completed(1, 500);
        tracker.part_completed(2, 500);

        let seen = seen.lock().unwrap();
        for pair in seen.windows(2) {
            assert!(
                pair[1] >= pair[0],
                "percentage regressed: {} -> {}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(*seen.last().unwrap(), 100.0);
    }

    #[test]
    fn test_reset_does_not_regress_reported_bytes() {
        let (_, tracker) = collecting_tracker(1000);
        tracker.part_progress(1, 400);
        let before = tracker.snapshot();
        tracker.reset_part(1);
        let after = tracker.snapshot();
        assert!(after.uploaded_bytes >= before.uploaded_bytes);
        assert!(after.percentage >= before.percentage);
    }

    #[test]
    fn test_completion_reaches_exactly_one_hundred() {
        let (_, tracker) = collecting_tracker(800);
        tracker.set_total_parts_known(2);
        tracker.part_completed(1, 400);
        tracker.part_completed(2, 400);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.percentage, 100.0);
        assert_eq!(snapshot.uploaded_bytes, 800);
        assert_eq!(snapshot.completed_parts, 2);
    }

    #[test]
    fn test_empty_file_progress() {
        let (_, tracker) = collecting_tracker(0);
        tracker.set_total_parts_known(1);
        assert_eq!(tracker.snapshot().percentage, 0.0);
        tracker.part_completed(1, 0);
        assert_eq!(tracker.snapshot().percentage, 100.0);
    }

    #[test]
    fn test_total_parts_known_only_grows() {
        let (_, tracker) = collecting_tracker(100);
        tracker.set_total_parts_known(5);
        tracker.set_total_parts_known(3);
        assert_eq!(tracker.snapshot().total_parts_known, 5);
    }
}
