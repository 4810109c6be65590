//! Progress Tracker
//!
//! Counters for queued, in-flight and finished files. Readable at any time as
//! a snapshot and pushed to subscribers on every change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub queued_files: u64,
    pub in_flight_files: u64,
    pub stored_files: u64,
    pub duplicate_files: u64,
    pub failed_files: u64,
    pub expired_sessions: u64,
    pub bytes_stored: u64,
}

#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<ProgressTrackerInner>,
}

struct ProgressTrackerInner {
    queued: AtomicU64,
    in_flight: AtomicU64,
    stored: AtomicU64,
    duplicate: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    bytes_stored: AtomicU64,
    tx: watch::Sender<ProgressSnapshot>,
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self {
            inner: Arc::new(ProgressTrackerInner {
                queued: AtomicU64::new(0),
                in_flight: AtomicU64::new(0),
                stored: AtomicU64::new(0),
                duplicate: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                bytes_stored: AtomicU64::new(0),
                tx,
            }),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let i = &self.inner;
        ProgressSnapshot {
            queued_files: i.queued.load(Ordering::SeqCst),
            in_flight_files: i.in_flight.load(Ordering::SeqCst),
            stored_files: i.stored.load(Ordering::SeqCst),
            duplicate_files: i.duplicate.load(Ordering::SeqCst),
            failed_files: i.failed.load(Ordering::SeqCst),
            expired_sessions: i.expired.load(Ordering::SeqCst),
            bytes_stored: i.bytes_stored.load(Ordering::SeqCst),
        }
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.inner.tx.subscribe()
    }

    fn publish(&self) {
        self.inner.tx.send_replace(self.snapshot());
    }

    /// Files accepted into a batch but not yet started
    pub fn enqueue(&self, count: u64) {
        self.inner.queued.fetch_add(count, Ordering::SeqCst);
        self.publish();
    }

    /// One file waiting for a transfer slot
    pub fn queue_one(&self) -> QueuedFile {
        self.enqueue(1);
        QueuedFile {
            progress: self.clone(),
            started: false,
        }
    }

    /// A file starts transferring; `from_queue` when it was enqueued first
    pub fn start(&self, from_queue: bool) {
        if from_queue {
            decrement(&self.inner.queued);
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.publish();
    }

    pub fn stored(&self, bytes: u64) {
        decrement(&self.inner.in_flight);
        self.inner.stored.fetch_add(1, Ordering::SeqCst);
        self.inner.bytes_stored.fetch_add(bytes, Ordering::SeqCst);
        self.publish();
    }

    pub fn duplicate(&self) {
        decrement(&self.inner.in_flight);
        self.inner.duplicate.fetch_add(1, Ordering::SeqCst);
        self.publish();
    }

    pub fn failed(&self) {
        decrement(&self.inner.in_flight);
        self.inner.failed.fetch_add(1, Ordering::SeqCst);
        self.publish();
    }

    pub fn expired(&self) {
        decrement(&self.inner.in_flight);
        self.inner.expired.fetch_add(1, Ordering::SeqCst);
        self.publish();
    }
}

/// Queue entry for a single file. Dropped without `start`, it leaves the queue.
pub struct QueuedFile {
    progress: ProgressTracker,
    started: bool,
}

impl QueuedFile {
    pub fn start(mut self) {
        self.started = true;
        self.progress.start(true);
    }
}

impl Drop for QueuedFile {
    fn drop(&mut self) {
        if !self.started {
            decrement(&self.progress.inner.queued);
            self.progress.publish();
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_follow_lifecycle() {
        let progress = ProgressTracker::new();
        progress.enqueue(3);
        progress.start(true);
        progress.start(true);
        progress.stored(100);
        progress.duplicate();

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.queued_files, 1);
        assert_eq!(snapshot.in_flight_files, 0);
        assert_eq!(snapshot.stored_files, 1);
        assert_eq!(snapshot.duplicate_files, 1);
        assert_eq!(snapshot.bytes_stored, 100);
    }

    #[test]
    fn test_queued_file_leaves_queue_on_drop() {
        let progress = ProgressTracker::new();
        let waiting = progress.queue_one();
        let abandoned = progress.queue_one();
        assert_eq!(progress.snapshot().queued_files, 2);

        drop(abandoned);
        assert_eq!(progress.snapshot().queued_files, 1);

        waiting.start();
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.queued_files, 0);
        assert_eq!(snapshot.in_flight_files, 1);
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let progress = ProgressTracker::new();
        progress.expired();
        assert_eq!(progress.snapshot().in_flight_files, 0);
        assert_eq!(progress.snapshot().expired_sessions, 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let progress = ProgressTracker::new();
        let mut rx = progress.subscribe();

        progress.start(false);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().in_flight_files, 1);

        progress.failed();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().failed_files, 1);
    }
}
