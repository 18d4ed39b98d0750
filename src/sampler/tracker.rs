//! Live task and open handle accounting, used for leak checks

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts sampler tasks that are still running and stores still open
#[derive(Debug, Default)]
pub struct ResourceTracker {
    live_tasks: AtomicUsize,
    open_stores: AtomicUsize,
}

/// Point-in-time copy of the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub live_tasks: usize,
    pub open_stores: usize,
}

impl ResourceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a running task; the count drops when the guard does
    pub fn task_started(self: &Arc<Self>) -> TaskGuard {
        self.live_tasks.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn store_opened(&self) {
        self.open_stores.fetch_add(1, Ordering::SeqCst);
    }

    pub fn store_closed(&self) {
        self.open_stores.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live_tasks(&self) -> usize {
        self.live_tasks.load(Ordering::SeqCst)
    }

    pub fn open_stores(&self) -> usize {
        self.open_stores.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            live_tasks: self.live_tasks(),
            open_stores: self.open_stores(),
        }
    }
}

/// Held by a running sampler task
#[derive(Debug)]
pub struct TaskGuard {
    tracker: Arc<ResourceTracker>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.live_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_guard_releases_on_drop() {
        let tracker = ResourceTracker::new();
        let first = tracker.task_started();
        let second = tracker.task_started();
        assert_eq!(tracker.live_tasks(), 2);

        drop(first);
        assert_eq!(tracker.live_tasks(), 1);
        drop(second);
        assert_eq!(tracker.snapshot(), ResourceSnapshot { live_tasks: 0, open_stores: 0 });
    }

    #[test]
    fn test_store_accounting() {
        let tracker = ResourceTracker::new();
        tracker.store_opened();
        tracker.store_opened();
        tracker.store_closed();
        assert_eq!(tracker.open_stores(), 1);
    }
}
