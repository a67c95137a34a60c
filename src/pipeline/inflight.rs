use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Barrier counting tasks admitted into the visit stage but not yet
/// finalized by storage. Incremented exactly once per admitted task, before
/// the task is placed on the sanitized stream, and decremented exactly once
/// when storage finishes with it (success or failure). The sanitize stage
/// closes its output only after this counter drains, which is what breaks
/// the shutdown cycle between stages 2 and 5.
#[derive(Debug, Default)]
pub struct InflightCounter {
    count: AtomicUsize,
    notify: Notify,
}

impl InflightCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn done(&self) {
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "inflight counter underflow");
        if previous == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once the counter reaches zero. Immediately ready if nothing
    /// is in flight.
    pub async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
