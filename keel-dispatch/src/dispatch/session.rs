//! Per-node session
//!
//! A session is the server-side mailbox of one connected node. Dispatch
//! decisions are deposited into three independent one-slot queues
//! (assignments, cancellations, liveness ticks); the node's stream handler is
//! the only consumer and turns them into outbound frames.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use keel_core::dto::stream::{CancelCommand, PipelineAssignment};

use super::DispatchError;

/// Receiving side of a session's queues, owned by the active stream handler
pub struct Mailbox {
    pub assignments: mpsc::Receiver<PipelineAssignment>,
    pub cancels: mpsc::Receiver<CancelCommand>,
    pub timeouts: mpsc::Receiver<()>,
}

struct LastSeen {
    instant: Instant,
    at: DateTime<Utc>,
}

pub struct NodeSession {
    node_id: String,
    assignment_tx: mpsc::Sender<PipelineAssignment>,
    cancel_tx: mpsc::Sender<CancelCommand>,
    timeout_tx: mpsc::Sender<()>,
    mailbox: Arc<AsyncMutex<Mailbox>>,
    /// Execution IDs from the node's latest heartbeat
    claimed: RwLock<Vec<String>>,
    last_seen: Mutex<LastSeen>,
    /// Held across the capacity check and the enqueue of an assignment
    assign_lock: AsyncMutex<()>,
    closed: CancellationToken,
}

impl NodeSession {
    pub fn new(node_id: impl Into<String>) -> Self {
        let (assignment_tx, assignments) = mpsc::channel(1);
        let (cancel_tx, cancels) = mpsc::channel(1);
        let (timeout_tx, timeouts) = mpsc::channel(1);

        Self {
            node_id: node_id.into(),
            assignment_tx,
            cancel_tx,
            timeout_tx,
            mailbox: Arc::new(AsyncMutex::new(Mailbox {
                assignments,
                cancels,
                timeouts,
            })),
            claimed: RwLock::new(Vec::new()),
            last_seen: Mutex::new(LastSeen {
                instant: Instant::now(),
                at: Utc::now(),
            }),
            assign_lock: AsyncMutex::new(()),
            closed: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Takes exclusive ownership of the mailbox.
    ///
    /// Returns `None` while another handler holds it.
    pub fn claim_mailbox(&self) -> Option<OwnedMutexGuard<Mailbox>> {
        self.mailbox.clone().try_lock_owned().ok()
    }

    /// Replaces the claimed sources with the node's latest self-report
    pub fn update_claimed(&self, active: Vec<String>) {
        *self.claimed.write().unwrap_or_else(PoisonError::into_inner) = active;
    }

    pub fn claimed_sources(&self) -> Vec<String> {
        self.claimed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn touch(&self) {
        let mut seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.instant = Instant::now();
        seen.at = Utc::now();
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .at
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .instant
            .elapsed()
    }

    /// Checks capacity and enqueues under one lock.
    ///
    /// Waits while an earlier assignment is still undelivered; fails with
    /// `NodeUnknown` if the session is closed meanwhile.
    pub async fn enqueue_assignment(
        &self,
        assignment: PipelineAssignment,
        max_pipelines: usize,
    ) -> Result<(), DispatchError> {
        let _guard = self.assign_lock.lock().await;

        let claimed = self.claimed_count();
        if claimed >= max_pipelines {
            return Err(DispatchError::CapacityExceeded {
                node_id: self.node_id.clone(),
                claimed,
                max: max_pipelines,
            });
        }

        tokio::select! {
            sent = self.assignment_tx.send(assignment) => {
                sent.map_err(|_| DispatchError::NodeUnknown(self.node_id.clone()))
            }
            _ = self.closed.cancelled() => Err(DispatchError::NodeUnknown(self.node_id.clone())),
        }
    }

    pub async fn enqueue_cancel(&self, command: CancelCommand) -> Result<(), DispatchError> {
        tokio::select! {
            sent = self.cancel_tx.send(command) => {
                sent.map_err(|_| DispatchError::NodeUnknown(self.node_id.clone()))
            }
            _ = self.closed.cancelled() => Err(DispatchError::NodeUnknown(self.node_id.clone())),
        }
    }

    /// Offers a liveness tick without waiting; false if one is already pending
    pub fn offer_timeout(&self) -> bool {
        self.timeout_tx.try_send(()).is_ok()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSession")
            .field("node_id", &self.node_id)
            .field("claimed", &self.claimed_sources())
            .field("closed", &self.is_closed())
            .finish()
    }
}
