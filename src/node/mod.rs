//! Connection nodes: one native connection, its re-entrant lock and its idle timer.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RawMutex, RawThreadId, ReentrantMutex};

use crate::config::DatabaseTarget;
use crate::driver::{NativeConnection, NativeDriver, namespace};
use crate::error::SqlMultiplexError;
use crate::handle::{Lease, QueryHandle};

mod idle;
mod stats;

pub use idle::{IdleTimerService, TimerHandle};
pub use stats::{NodeStats, NodeStatsSnapshot};

pub(crate) type ConnectionCell = RefCell<Option<Box<dyn NativeConnection>>>;
pub(crate) type ConnectionSlot = ReentrantMutex<ConnectionCell>;
pub(crate) type SlotGuard = lock_api::ArcReentrantMutexGuard<RawMutex, RawThreadId, ConnectionCell>;
/// Set once the node is gone; the last lease to release then closes the connection.
pub(crate) type OrphanFlag = Arc<Mutex<bool>>;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique node number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// What [`ConnectionNode::close`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The native connection was closed.
    Closed,
    /// Nothing was open.
    AlreadyClosed,
    /// A query handle was live; the idle timer was re-armed instead.
    Deferred,
}

enum IdleTimeout {
    Disabled,
    Enabled { window: Duration, timer: TimerHandle },
}

/// Owns one native connection behind a re-entrant lock.
///
/// Handles returned by [`query`](Self::query) hold the lock until dropped.
/// When an idle window is configured, every query re-arms a single-shot
/// timer on the [`IdleTimerService`] thread; when it fires the node closes
/// its connection unless a handle is still live, in which case it re-arms.
pub struct ConnectionNode {
    id: NodeId,
    name: String,
    owner: ThreadId,
    target: Arc<DatabaseTarget>,
    driver: Arc<dyn NativeDriver>,
    slot: Arc<ConnectionSlot>,
    open: AtomicBool,
    idle: IdleTimeout,
    stats: Arc<NodeStats>,
    orphaned: OrphanFlag,
    this: Weak<ConnectionNode>,
}

impl ConnectionNode {
    /// Create a node owned by the calling thread. No connection is opened yet.
    ///
    /// `idle` is the idle window plus the timer thread that drives it; `None`
    /// disables idle closing for this node.
    #[must_use]
    pub fn new(
        target: Arc<DatabaseTarget>,
        driver: Arc<dyn NativeDriver>,
        idle: Option<(Duration, TimerHandle)>,
    ) -> Arc<Self> {
        let id = NodeId::next();
        let owner = thread::current().id();
        let name = format!("{}({owner:?}#{})", target.connection_id(), id.0);
        namespace::register(&name, target.driver_name());

        let idle = match idle {
            Some((window, timer)) if !window.is_zero() => IdleTimeout::Enabled { window, timer },
            _ => IdleTimeout::Disabled,
        };
        tracing::debug!(node = %id, connection = %name, driver = driver.name(), "connection node created");

        Arc::new_cyclic(|this| ConnectionNode {
            id,
            name,
            owner,
            target,
            driver,
            slot: Arc::new(ReentrantMutex::new(RefCell::new(None))),
            open: AtomicBool::new(false),
            idle,
            stats: Arc::new(NodeStats::default()),
            orphaned: Arc::new(Mutex::new(false)),
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Process-unique connection name, `"{connection_id}({thread}#{serial})"`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread that created the node.
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    #[must_use]
    pub fn target(&self) -> &DatabaseTarget {
        &self.target
    }

    #[must_use]
    pub fn stats(&self) -> NodeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a native connection is currently open. Never blocks.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Whether some thread currently holds this node's lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.slot.is_locked()
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        match &self.idle {
            IdleTimeout::Enabled { window, .. } => Some(*window),
            IdleTimeout::Disabled => None,
        }
    }

    /// Open the native connection if needed. Failures are logged, not retried.
    pub fn open(&self) -> bool {
        self.try_open().is_ok()
    }

    /// Like [`open`](Self::open) but keeps the driver's error.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ConfigError`] when the driver cannot handle
    /// the target's mode, or the driver's open error.
    pub fn try_open(&self) -> Result<(), SqlMultiplexError> {
        let guard = self.slot.lock();
        self.open_locked(&guard)
    }

    /// Lock the node, open lazily, re-arm the idle timer and hand out a handle.
    ///
    /// Blocks while another thread holds a handle on this node. If the open
    /// fails the handle is still returned; its statement calls then fail with
    /// [`SqlMultiplexError::ConnectionError`].
    #[must_use]
    pub fn query(&self) -> QueryHandle {
        self.query_at(Instant::now())
    }

    pub(crate) fn query_at(&self, dispatched_at: Instant) -> QueryHandle {
        let guard = self.slot.lock_arc();
        self.stats.record_acquire();
        if !self.is_open() && self.open_locked(&guard).is_err() {
            tracing::debug!(connection = %self.name, "handing out a handle on a closed connection");
        }
        self.arm_idle();
        QueryHandle::new(
            Lease::new(
                guard,
                Arc::clone(&self.stats),
                self.name.clone(),
                Arc::clone(&self.orphaned),
            ),
            dispatched_at,
        )
    }

    /// Close the connection unless it is in use.
    ///
    /// Never blocks: if the lock is held, or a handle on this very thread is
    /// still live, the idle timer is re-armed and [`CloseOutcome::Deferred`]
    /// is returned.
    pub fn close(&self) -> CloseOutcome {
        let Some(guard) = self.slot.try_lock() else {
            return self.defer_close();
        };
        if self.stats.outstanding() > 0 {
            drop(guard);
            return self.defer_close();
        }

        self.disarm_idle();
        let taken = guard.borrow_mut().take();
        let outcome = match taken {
            Some(conn) => {
                self.close_native(conn);
                CloseOutcome::Closed
            }
            None => CloseOutcome::AlreadyClosed,
        };
        drop(guard);
        outcome
    }

    /// Release the connection's name and, when no handle is live, close and
    /// drop the native connection so the next open creates a fresh one.
    ///
    /// Blocks while another thread holds a handle. A live handle on the calling
    /// thread keeps its connection; only the name is released.
    pub fn remove_connection(&self) {
        let guard = self.slot.lock();
        namespace::deregister(&self.name);
        if self.stats.outstanding() > 0 {
            tracing::debug!(connection = %self.name, "name released, connection kept for a live handle");
            return;
        }
        let taken = guard.borrow_mut().take();
        if let Some(conn) = taken {
            self.close_native(conn);
        }
        drop(guard);
    }

    fn open_locked(&self, cell: &ConnectionCell) -> Result<(), SqlMultiplexError> {
        if cell.borrow().is_some() {
            self.arm_idle();
            return Ok(());
        }
        if !namespace::is_registered(&self.name) {
            namespace::register(&self.name, self.target.driver_name());
        }

        match self.driver.open(&self.name, &self.target) {
            Ok(conn) => {
                *cell.borrow_mut() = Some(conn);
                self.open.store(true, Ordering::Release);
                self.stats.record_open();
                self.arm_idle();
                tracing::debug!(node = %self.id, connection = %self.name, "connection opened");
                Ok(())
            }
            Err(err) => {
                self.stats.record_open_failure();
                tracing::warn!(
                    node = %self.id,
                    connection = %self.name,
                    error = %err,
                    "failed to open connection"
                );
                Err(err)
            }
        }
    }

    fn close_native(&self, conn: Box<dyn NativeConnection>) {
        self.open.store(false, Ordering::Release);
        if let Err(err) = conn.close() {
            tracing::warn!(connection = %self.name, error = %err, "error while closing connection");
        }
        self.stats.record_close();
        tracing::debug!(node = %self.id, connection = %self.name, "connection closed");
    }

    fn defer_close(&self) -> CloseOutcome {
        self.stats.record_deferred_close();
        self.arm_idle();
        tracing::debug!(node = %self.id, connection = %self.name, "node busy, close deferred");
        CloseOutcome::Deferred
    }

    fn arm_idle(&self) {
        if let IdleTimeout::Enabled { window, timer } = &self.idle {
            timer.arm(self.id, *window, self.this.clone());
        }
    }

    fn disarm_idle(&self) {
        if let IdleTimeout::Enabled { timer, .. } = &self.idle {
            timer.disarm(self.id);
        }
    }
}

impl fmt::Debug for ConnectionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("open", &self.is_open())
            .field("idle_timeout", &self.idle_timeout())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionNode {
    fn drop(&mut self) {
        self.disarm_idle();
        // Leases drop the slot lock while holding the flag, so either the slot
        // is free here or its last lease will see the flag and close.
        let mut orphaned = self.orphaned.lock();
        *orphaned = true;
        if let Some(guard) = self.slot.try_lock() {
            if self.stats.outstanding() == 0 {
                let taken = guard.borrow_mut().take();
                if let Some(conn) = taken {
                    self.close_native(conn);
                }
            }
        }
        drop(orphaned);
        namespace::deregister(&self.name);
    }
}
