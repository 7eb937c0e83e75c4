//! Pause coordinator.
//!
//! Human-review rendezvous for paused transactions: a single-slot oneshot
//! channel per request id plus a bounded pending queue. Approval delivery
//! never blocks the sender; an approval for an unknown id is silently
//! dropped.

use dashmap::DashMap;
use refract_common::PendingItem;
use refract_rules::Rewrite;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// External verdict for a pending transaction.
#[derive(Debug)]
pub enum PauseDecision {
    Approve(Rewrite),
    Reject,
}

/// Outcome of waiting on a registered pause.
#[derive(Debug)]
pub enum PauseWait {
    Decision(PauseDecision),
    TimedOut,
}

/// Deregisters the approval slot when the waiting handler goes away,
/// including when its future is dropped by the per-event timeout.
pub struct PauseRegistration {
    id: String,
    slots: Arc<DashMap<String, oneshot::Sender<PauseDecision>>>,
    rx: Option<oneshot::Receiver<PauseDecision>>,
}

impl Drop for PauseRegistration {
    fn drop(&mut self) {
        self.slots.remove(&self.id);
    }
}

/// Per-session pause coordinator.
pub struct PauseCoordinator {
    slots: Arc<DashMap<String, oneshot::Sender<PauseDecision>>>,
    pending_tx: mpsc::Sender<PendingItem>,
}

impl PauseCoordinator {
    /// Build a coordinator with a bounded pending queue; the receiver is
    /// handed to the front-end subscription.
    pub fn new(pending_capacity: usize) -> (Self, mpsc::Receiver<PendingItem>) {
        let (pending_tx, pending_rx) = mpsc::channel(pending_capacity);
        (
            Self {
                slots: Arc::new(DashMap::new()),
                pending_tx,
            },
            pending_rx,
        )
    }

    /// Register an approval slot for a request id.
    pub fn register(&self, id: &str) -> PauseRegistration {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id.to_string(), tx);
        PauseRegistration {
            id: id.to_string(),
            slots: self.slots.clone(),
            rx: Some(rx),
        }
    }

    /// Non-blocking enqueue into the pending queue. `false` means the
    /// queue is full and the caller must fall back to the default action.
    pub fn try_enqueue(&self, item: PendingItem) -> bool {
        self.pending_tx.try_send(item).is_ok()
    }

    /// Deliver an approval. Unknown ids are dropped without blocking.
    pub fn approve(&self, id: &str, rewrite: Rewrite) -> bool {
        self.resolve(id, PauseDecision::Approve(rewrite))
    }

    /// Deliver a rejection. Unknown ids are dropped without blocking.
    pub fn reject(&self, id: &str) -> bool {
        self.resolve(id, PauseDecision::Reject)
    }

    fn resolve(&self, id: &str, decision: PauseDecision) -> bool {
        match self.slots.remove(id) {
            Some((_, tx)) => {
                // The waiter may have timed out in the meantime.
                let _ = tx.send(decision);
                true
            }
            None => {
                debug!(id, "approval for unknown pending item dropped");
                false
            }
        }
    }

    /// Number of registered (outstanding) pauses.
    pub fn outstanding(&self) -> usize {
        self.slots.len()
    }

    /// Wait for the decision or the pause timeout.
    pub async fn wait(&self, mut registration: PauseRegistration, timeout_ms: u64) -> PauseWait {
        let Some(rx) = registration.rx.take() else {
            return PauseWait::TimedOut;
        };
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(decision)) => PauseWait::Decision(decision),
            // Sender dropped without a decision; treat as timeout-equivalent.
            Ok(Err(_)) => PauseWait::TimedOut,
            Err(_) => PauseWait::TimedOut,
        }
    }
}
