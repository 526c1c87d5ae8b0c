use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by every [`ConnectionNode`](crate::ConnectionNode).
///
/// `acquired - released` is the number of query handles currently holding
/// the node's lock.
#[derive(Debug, Default)]
pub struct NodeStats {
    acquired: AtomicU64,
    released: AtomicU64,
    opened: AtomicU64,
    open_failures: AtomicU64,
    closed: AtomicU64,
    deferred_closes: AtomicU64,
}

/// Point-in-time copy of [`NodeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStatsSnapshot {
    pub acquired: u64,
    pub released: u64,
    pub opened: u64,
    pub open_failures: u64,
    pub closed: u64,
    pub deferred_closes: u64,
}

impl NodeStatsSnapshot {
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

impl NodeStats {
    #[must_use]
    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            acquired: self.acquired.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
            opened: self.opened.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            deferred_closes: self.deferred_closes.load(Ordering::Relaxed),
        }
    }

    /// Handles currently holding the lock.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        // Load released first so a concurrent release can't push it past acquired.
        let released = self.released.load(Ordering::Acquire);
        let acquired = self.acquired.load(Ordering::Acquire);
        acquired.saturating_sub(released)
    }

    pub(crate) fn record_acquire(&self) {
        self.acquired.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_release(&self) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred_close(&self) {
        self.deferred_closes.fetch_add(1, Ordering::Relaxed);
    }
}
