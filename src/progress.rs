use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::state::SegmentStatus;

/// Shared counters updated by segment workers.
///
/// Readers take no lock, so a value may lag by at most the chunk each
/// worker is currently writing.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    downloaded: AtomicU64,
    completed_segments: AtomicUsize,
    failed_segments: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub completed_segments: usize,
    pub failed_segments: usize,
}

impl ProgressAggregator {
    pub fn new(initial_bytes: u64) -> Self {
        Self {
            downloaded: AtomicU64::new(initial_bytes),
            ..Self::default()
        }
    }

    pub fn add(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record(&self, status: SegmentStatus) {
        match status {
            SegmentStatus::Completed => {
                self.completed_segments.fetch_add(1, Ordering::Relaxed);
            }
            SegmentStatus::Failed => {
                self.failed_segments.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            downloaded: self.downloaded(),
            completed_segments: self.completed_segments.load(Ordering::Relaxed),
            failed_segments: self.failed_segments.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_writers() {
        let progress = Arc::new(ProgressAggregator::new(100));
        let mut handles = vec![];
        for _ in 0..8 {
            let progress = progress.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    progress.add(3);
                }
                progress.record(SegmentStatus::Completed);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snap = progress.snapshot();
        assert_eq!(snap.downloaded, 100 + 8 * 3000);
        assert_eq!(snap.completed_segments, 8);
        assert_eq!(snap.failed_segments, 0);
    }

    #[test]
    fn test_paused_outcomes_are_not_counted() {
        let progress = ProgressAggregator::default();
        progress.record(SegmentStatus::Paused);
        progress.record(SegmentStatus::Failed);
        assert_eq!(progress.snapshot().failed_segments, 1);
        assert_eq!(progress.snapshot().completed_segments, 0);
    }
}
