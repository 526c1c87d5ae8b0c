//! Thread-routing registry: maps calling threads onto connection nodes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{AccessPolicy, DatabaseTarget, RegistryConfig, ResolvedPolicy, RoutingMode};
use crate::driver::{NativeDriver, lookup_driver};
use crate::error::SqlMultiplexError;
use crate::handle::QueryHandle;
use crate::node::{ConnectionNode, IdleTimerService, TimerHandle};

#[derive(Default)]
struct RegistryState {
    nodes: HashMap<ThreadId, Arc<ConnectionNode>>,
    last_dispatch: Option<Instant>,
}

/// Routes each calling thread to a [`ConnectionNode`] according to the
/// resolved [`AccessPolicy`], and spaces dispatches out when the policy asks.
///
/// In [`RoutingMode::Single`] every thread shares one node (and therefore
/// one connection). In [`RoutingMode::Multi`] each thread gets its own node
/// on first use. The registry owns every node it creates; they are closed
/// by [`destroy_all_connections`](Self::destroy_all_connections) or when the
/// registry is dropped.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::thread;
/// use sql_multiplex::prelude::*;
///
/// # fn main() -> Result<(), SqlMultiplexError> {
/// let target = DatabaseTarget::file("sqlite", "app", "app.db");
/// let policy = AccessPolicy::new().with_idle_timeout_ms(30_000);
/// let registry = Arc::new(Registry::new(target, policy)?);
///
/// let workers: Vec<_> = (0..4)
///     .map(|i| {
///         let registry = Arc::clone(&registry);
///         thread::spawn(move || {
///             let mut query = registry.query();
///             query.exec("INSERT INTO events (worker) VALUES (?1)", &[RowValues::Int(i)])
///         })
///     })
///     .collect();
/// for worker in workers {
///     worker.join().expect("worker panicked")?;
/// }
/// # Ok(()) }
/// ```
pub struct Registry {
    target: Arc<DatabaseTarget>,
    policy: ResolvedPolicy,
    driver: Arc<dyn NativeDriver>,
    state: Mutex<RegistryState>,
    timer: Option<IdleTimerService>,
}

impl Registry {
    /// Build a registry using the built-in driver named by the target.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ConfigError`] if no built-in driver
    /// matches `target.driver_name()` or the target is incomplete.
    pub fn new(target: DatabaseTarget, policy: AccessPolicy) -> Result<Self, SqlMultiplexError> {
        let driver = lookup_driver(target.driver_name()).ok_or_else(|| {
            SqlMultiplexError::ConfigError(format!(
                "no built-in driver for {}; use Registry::with_driver",
                target.driver_name()
            ))
        })?;
        Self::with_driver(target, policy, driver)
    }

    /// Build a registry around a caller-supplied driver.
    ///
    /// The policy is resolved against `target.driver_name()`, not against the
    /// driver object, so a custom driver can still be treated as a server engine.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ConfigError`] for an incomplete target, or
    /// [`SqlMultiplexError::ConnectionError`] if the idle timer thread cannot start.
    pub fn with_driver(
        target: DatabaseTarget,
        policy: AccessPolicy,
        driver: Arc<dyn NativeDriver>,
    ) -> Result<Self, SqlMultiplexError> {
        target.validate()?;
        let policy = policy.resolve(target.driver_name());
        let timer = match policy.idle_timeout() {
            Some(_) => Some(IdleTimerService::spawn()?),
            None => None,
        };

        tracing::debug!(
            connection_id = target.connection_id(),
            driver = driver.name(),
            routing = ?policy.routing_mode(),
            min_spacing_ms = policy.min_spacing_ms(),
            spacing_enforced = policy.spacing_enforced(),
            idle_timeout_ms = policy.idle_timeout_ms(),
            "registry created"
        );

        Ok(Self {
            target: Arc::new(target),
            policy,
            driver,
            state: Mutex::new(RegistryState::default()),
            timer,
        })
    }

    /// Build a registry from a loaded [`RegistryConfig`].
    ///
    /// # Errors
    /// Same as [`Registry::new`].
    pub fn from_config(config: RegistryConfig) -> Result<Self, SqlMultiplexError> {
        Self::new(config.target, config.policy)
    }

    /// Get a query handle for the calling thread.
    ///
    /// May sleep to honour the spacing policy, and blocks while another
    /// thread holds a handle on the same node.
    #[must_use]
    pub fn query(&self) -> QueryHandle {
        let (node, dispatched_at) = {
            let mut state = self.state.lock();
            let dispatched_at = wait_for_spacing(self.policy.min_spacing(), &mut state);
            let node = self.route(&mut state);
            (node, dispatched_at)
        };
        node.query_at(dispatched_at)
    }

    fn route(&self, state: &mut RegistryState) -> Arc<ConnectionNode> {
        let thread_id = thread::current().id();
        match self.policy.routing_mode() {
            RoutingMode::Multi => Arc::clone(
                state
                    .nodes
                    .entry(thread_id)
                    .or_insert_with(|| self.create_node()),
            ),
            RoutingMode::Single | RoutingMode::Auto => {
                if let Some(node) = state.nodes.values().next() {
                    return Arc::clone(node);
                }
                let node = self.create_node();
                state.nodes.insert(thread_id, Arc::clone(&node));
                node
            }
        }
    }

    fn create_node(&self) -> Arc<ConnectionNode> {
        ConnectionNode::new(
            Arc::clone(&self.target),
            Arc::clone(&self.driver),
            self.idle_config(),
        )
    }

    fn idle_config(&self) -> Option<(Duration, TimerHandle)> {
        let window = self.policy.idle_timeout()?;
        let timer = self.timer.as_ref()?;
        Some((window, timer.handle()))
    }

    /// Drop every node and clear the map.
    ///
    /// Idle nodes close their connections immediately. A node whose handle is
    /// still alive on another thread leaves its connection to close when that
    /// handle is released. The next [`query`](Self::query) recreates nodes.
    pub fn destroy_all_connections(&self) {
        let mut state = self.state.lock();
        let count = state.nodes.len();
        state.nodes.clear();
        if count > 0 {
            tracing::info!(
                connection_id = self.target.connection_id(),
                nodes = count,
                "destroyed all connections"
            );
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Thread identities currently holding a map entry.
    #[must_use]
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.state.lock().nodes.keys().copied().collect()
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<ConnectionNode>> {
        self.state.lock().nodes.values().cloned().collect()
    }

    /// The node a given thread routes to, if one exists yet.
    ///
    /// In single mode every thread shares the one node.
    #[must_use]
    pub fn node_for_thread(&self, thread_id: ThreadId) -> Option<Arc<ConnectionNode>> {
        let state = self.state.lock();
        match self.policy.routing_mode() {
            RoutingMode::Multi => state.nodes.get(&thread_id).cloned(),
            RoutingMode::Single | RoutingMode::Auto => state.nodes.values().next().cloned(),
        }
    }

    /// When the last dispatch was let through.
    #[must_use]
    pub fn last_dispatch(&self) -> Option<Instant> {
        self.state.lock().last_dispatch
    }

    #[must_use]
    pub fn policy(&self) -> &ResolvedPolicy {
        &self.policy
    }

    #[must_use]
    pub fn target(&self) -> &DatabaseTarget {
        &self.target
    }
}

/// Sleep until `min_spacing` has passed since the previous dispatch, then
/// stamp and return the new dispatch time. The first dispatch never waits.
fn wait_for_spacing(min_spacing: Option<Duration>, state: &mut RegistryState) -> Instant {
    if let (Some(min), Some(last)) = (min_spacing, state.last_dispatch) {
        let elapsed = last.elapsed();
        if elapsed < min {
            let pause = min - elapsed;
            tracing::trace!(pause_us = pause.as_micros(), "spacing dispatch");
            thread::sleep(pause);
        }
    }
    let now = Instant::now();
    state.last_dispatch = Some(now);
    now
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("target", &self.target)
            .field("policy", &self.policy)
            .field("driver", &self.driver.name())
            .field("nodes", &self.node_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.destroy_all_connections();
    }
}
