//! Coalescing guard for recovery exchanges
//!
//! Holds the one piece of process-wide state in the lifecycle manager: the
//! "recovery in flight" slot. While the slot is occupied, callers that hit a
//! 401 subscribe to the in-flight recovery instead of starting their own, and
//! every subscriber receives the leader's outcome.
//!
//! Init: empty slot, no subscribers. Teardown: the slot is emptied when the
//! leader completes (success or failure) and also when the leader's future is
//! dropped mid-exchange, so a cancelled caller can never wedge the gate.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use gateway::NormalizedError;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Outcome shared with every caller that joined one recovery. On success the
/// new credential is already in the session store.
pub type RecoveryOutcome = Result<(), NormalizedError>;

/// Single-flight gate for the recovery exchange.
#[derive(Debug, Default)]
pub struct RecoveryGate {
    in_flight: Mutex<Option<broadcast::Sender<RecoveryOutcome>>>,
}

enum Ticket<'a> {
    Leader(LeaderGuard<'a>),
    Follower(broadcast::Receiver<RecoveryOutcome>),
}

/// Owned by the caller running the exchange. Empties the slot on drop.
struct LeaderGuard<'a> {
    gate: &'a RecoveryGate,
    sender: broadcast::Sender<RecoveryOutcome>,
    completed: bool,
}

impl LeaderGuard<'_> {
    fn complete(mut self, outcome: &RecoveryOutcome) {
        self.gate.slot().take();
        self.completed = true;
        let joined = self.sender.send(outcome.clone()).unwrap_or(0);
        debug!(joined, success = outcome.is_ok(), "recovery completed");
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            // Dropping the slot's sender closes every follower's receiver
            self.gate.slot().take();
            warn!("recovery abandoned before completion");
        }
    }
}

impl RecoveryGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<broadcast::Sender<RecoveryOutcome>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> Ticket<'_> {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(sender) => Ticket::Follower(sender.subscribe()),
            None => {
                let (sender, _) = broadcast::channel(1);
                *slot = Some(sender.clone());
                Ticket::Leader(LeaderGuard {
                    gate: self,
                    sender,
                    completed: false,
                })
            }
        }
    }

    /// Whether a recovery exchange is currently running.
    pub fn is_in_flight(&self) -> bool {
        self.slot().is_some()
    }

    /// Number of callers waiting on the in-flight recovery.
    pub fn waiting(&self) -> usize {
        self.slot().as_ref().map_or(0, |s| s.receiver_count())
    }

    /// Run `exchange` unless one is already in flight, in which case wait for
    /// that one's outcome. If the leader is dropped before finishing, a
    /// waiting caller takes over as the new leader.
    pub async fn run<F, Fut>(&self, exchange: F) -> RecoveryOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RecoveryOutcome>,
    {
        loop {
            match self.enter() {
                Ticket::Leader(guard) => {
                    debug!("leading recovery exchange");
                    let outcome = exchange().await;
                    guard.complete(&outcome);
                    return outcome;
                }
                Ticket::Follower(mut receiver) => {
                    debug!("joining in-flight recovery");
                    match receiver.recv().await {
                        Ok(outcome) => return outcome,
                        Err(_) => continue,
                    }
                }
            }
        }
    }
}
