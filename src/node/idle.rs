//! Idle-timeout owner thread.
//!
//! Timer state lives on one dedicated thread. Nodes never touch it directly:
//! they send [`TimerCommand`]s through a [`TimerHandle`], and when a deadline
//! passes the owner thread calls [`on_idle_timeout`] for that node.

use std::collections::HashMap;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::SqlMultiplexError;

use super::{CloseOutcome, ConnectionNode, NodeId};

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum TimerCommand {
    /// Start (or restart) the single-shot idle window for a node.
    Arm {
        node_id: NodeId,
        deadline: Instant,
        node: Weak<ConnectionNode>,
    },
    Disarm {
        node_id: NodeId,
    },
    Shutdown,
}

/// Cloneable sender side used by nodes to reach the timer owner thread.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    sender: Sender<TimerCommand>,
}

impl TimerHandle {
    pub(crate) fn arm(&self, node_id: NodeId, window: Duration, node: Weak<ConnectionNode>) {
        self.send(TimerCommand::Arm {
            node_id,
            deadline: Instant::now() + window,
            node,
        });
    }

    pub(crate) fn disarm(&self, node_id: NodeId) {
        self.send(TimerCommand::Disarm { node_id });
    }

    fn send(&self, command: TimerCommand) {
        if self.sender.send(command).is_err() {
            tracing::debug!("idle timer thread already stopped; command dropped");
        }
    }
}

/// Owns the idle-timer thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct IdleTimerService {
    handle: TimerHandle,
    thread_name: String,
}

impl IdleTimerService {
    /// Spawn the owner thread.
    ///
    /// # Errors
    /// Returns [`SqlMultiplexError::ConnectionError`] if the thread cannot be spawned.
    pub fn spawn() -> Result<Self, SqlMultiplexError> {
        let (sender, receiver) = mpsc::channel::<TimerCommand>();
        let service_id = NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed);
        let thread_name = format!("sql-idle-timer-{service_id}");
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_idle_timer(&receiver))
            .map_err(|err| {
                SqlMultiplexError::ConnectionError(format!(
                    "failed to spawn idle timer thread: {err}"
                ))
            })?;

        Ok(Self {
            handle: TimerHandle { sender },
            thread_name,
        })
    }

    #[must_use]
    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}

impl Drop for IdleTimerService {
    fn drop(&mut self) {
        self.handle.send(TimerCommand::Shutdown);
    }
}

struct PendingClose {
    deadline: Instant,
    node: Weak<ConnectionNode>,
}

fn run_idle_timer(receiver: &Receiver<TimerCommand>) {
    let mut pending: HashMap<NodeId, PendingClose> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let command = match next_deadline {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(wait) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        match command {
            Some(TimerCommand::Arm {
                node_id,
                deadline,
                node,
            }) => {
                pending.insert(node_id, PendingClose { deadline, node });
            }
            Some(TimerCommand::Disarm { node_id }) => {
                pending.remove(&node_id);
            }
            Some(TimerCommand::Shutdown) => break,
            None => {}
        }

        let now = Instant::now();
        let expired: Vec<NodeId> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for node_id in expired {
            if let Some(entry) = pending.remove(&node_id) {
                if let Some(node) = entry.node.upgrade() {
                    on_idle_timeout(node_id, &node);
                }
            }
        }
    }

    tracing::debug!(armed = pending.len(), "idle timer thread stopped");
}

/// The single timeout handler: try to close, which defers if the node is busy.
pub(crate) fn on_idle_timeout(node_id: NodeId, node: &ConnectionNode) -> CloseOutcome {
    let outcome = node.close();
    tracing::debug!(node = %node_id, connection = node.name(), ?outcome, "idle timeout fired");
    outcome
}
