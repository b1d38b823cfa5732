//! Token lifecycle manager
//!
//! The per-call state machine is a pure function: it receives events and
//! returns `(new_state, action)`. [`LifecycleManager::execute`] runs the I/O
//! implied by each action. Keeping the transitions pure is what makes the
//! "at most one recovery, at most one replay" bound easy to test.

use std::sync::Arc;

use common::Secret;
use gateway::{NormalizedError, RelayRequest, RelayResponse, UpstreamResult, codes};
use session::{Session, SessionStore};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::events::{EVENT_CHANNEL_CAPACITY, SessionEvent};
use crate::gate::{RecoveryGate, RecoveryOutcome};
use crate::transport::Transport;

/// One outbound call and whether it has already been replayed.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request: RelayRequest,
    pub retried: bool,
}

impl CallContext {
    pub fn new(request: RelayRequest) -> Self {
        Self {
            request,
            retried: false,
        }
    }
}

/// Per-call states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Initial,
    Sent,
    Expired,
    Recovering,
    Resent,
    Succeeded,
    /// Terminal failure other than a dead session (pass-through, gateway
    /// errors, or a 401 after the replay).
    Failed,
    RecoveryFailed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Succeeded | CallState::Failed | CallState::RecoveryFailed
        )
    }
}

/// Events that drive per-call transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Dispatched,
    /// The gateway relayed an upstream answer with this status.
    Responded { status: u16 },
    /// The gateway itself failed (`PROXY_ERROR`, `INVALID_RESPONSE`).
    RelayFailed,
    /// A 401 arrived but there is no refresh credential to recover with.
    NoRefreshCredential,
    /// A 401 arrived for a credential the store has since replaced.
    AlreadyRecovered,
    RecoveryStarted,
    Recovered,
    RecoveryRejected,
}

/// I/O the executor performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Send,
    CheckRefreshCredential,
    Recover,
    Replay,
    Finish,
}

const UNAUTHORIZED: u16 = 401;

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Handle a per-call transition. Pure function: no I/O.
pub fn handle_event(state: CallState, event: CallEvent, retried: bool) -> (CallState, CallAction) {
    match (state, event) {
        (CallState::Initial, CallEvent::Dispatched) => (CallState::Sent, CallAction::Send),

        // --- Sent ---
        (CallState::Sent, CallEvent::Responded { status }) if is_success(status) => {
            (CallState::Succeeded, CallAction::Finish)
        }
        (CallState::Sent, CallEvent::Responded { status: UNAUTHORIZED }) if !retried => {
            (CallState::Expired, CallAction::CheckRefreshCredential)
        }
        (CallState::Sent, CallEvent::Responded { .. } | CallEvent::RelayFailed) => {
            (CallState::Failed, CallAction::Finish)
        }

        // --- Expired ---
        (CallState::Expired, CallEvent::RecoveryStarted) => {
            (CallState::Recovering, CallAction::Recover)
        }
        (CallState::Expired, CallEvent::NoRefreshCredential) => {
            (CallState::Failed, CallAction::Finish)
        }
        (CallState::Expired, CallEvent::AlreadyRecovered) => (CallState::Resent, CallAction::Replay),

        // --- Recovering ---
        (CallState::Recovering, CallEvent::Recovered) => (CallState::Resent, CallAction::Replay),
        (CallState::Recovering, CallEvent::RecoveryRejected) => {
            (CallState::RecoveryFailed, CallAction::Finish)
        }

        // --- Resent: whatever comes back is final ---
        (CallState::Resent, CallEvent::Responded { status }) if is_success(status) => {
            (CallState::Succeeded, CallAction::Finish)
        }
        (CallState::Resent, CallEvent::Responded { .. } | CallEvent::RelayFailed) => {
            (CallState::Failed, CallAction::Finish)
        }

        // --- Invalid/unhandled transition: stop where we are ---
        (state, _event) => (state, CallAction::Finish),
    }
}

/// Wraps every outbound call with one-shot credential recovery.
pub struct LifecycleManager {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    gate: RecoveryGate,
    events: broadcast::Sender<SessionEvent>,
}

impl LifecycleManager {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn SessionStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            store,
            gate: RecoveryGate::new(),
            events,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn gate(&self) -> &RecoveryGate {
        &self.gate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Run one call to completion: at most two relays and one recovery.
    ///
    /// `Ok` carries any structurally valid upstream answer, including
    /// non-2xx ones; `Err` carries gateway failures and `RECOVERY_FAILED`.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, request: RelayRequest) -> UpstreamResult {
        let mut ctx = CallContext::new(request);
        let (mut state, mut action) = handle_event(CallState::Initial, CallEvent::Dispatched, false);
        let mut last: Option<UpstreamResult> = None;
        let mut sent_with: Option<Secret<String>> = None;

        loop {
            let event = match action {
                CallAction::Send | CallAction::Replay => {
                    if action == CallAction::Replay {
                        ctx.retried = true;
                    }
                    sent_with = self.store.read_access_credential().await;
                    let result = self.transport.send(ctx.request.clone()).await;
                    let event = match &result {
                        Ok(RelayResponse { status, .. }) => CallEvent::Responded { status: *status },
                        Err(_) => CallEvent::RelayFailed,
                    };
                    last = Some(result);
                    event
                }
                CallAction::CheckRefreshCredential => {
                    let current = self.store.read_access_credential().await;
                    if current.is_some() && current != sent_with {
                        debug!("credential replaced since this call was sent, replaying");
                        CallEvent::AlreadyRecovered
                    } else if self.store.read_refresh_credential().await.is_some() {
                        CallEvent::RecoveryStarted
                    } else {
                        debug!("401 without refresh credential, not recovering");
                        CallEvent::NoRefreshCredential
                    }
                }
                CallAction::Recover => match self.gate.run(move || self.recover_session()).await {
                    Ok(()) => CallEvent::Recovered,
                    Err(e) => {
                        last = Some(Err(e));
                        CallEvent::RecoveryRejected
                    }
                },
                CallAction::Finish => break,
            };

            let (next_state, next_action) = handle_event(state, event, ctx.retried);
            debug!(from = ?state, to = ?next_state, ?event, "call transition");
            state = next_state;
            action = next_action;
        }

        debug!(?state, retried = ctx.retried, "call finished");
        last.unwrap_or_else(|| {
            Err(NormalizedError::new(
                codes::UNKNOWN_ERROR,
                "call finished without a result",
                500,
            ))
        })
    }

    /// The recovery exchange itself. Runs once per coalesced group.
    ///
    /// Any failure ends the session: the store is cleared and
    /// [`SessionEvent::Expired`] is broadcast before waiters are released.
    async fn recover_session(&self) -> RecoveryOutcome {
        let outcome = self.exchange_refresh_credential().await;
        match &outcome {
            Ok(subject_id) => {
                info!(subject_id, "access credential recovered");
                metrics::counter!("gateway_recoveries_total", "outcome" => "success").increment(1);
                self.emit(SessionEvent::Refreshed {
                    subject_id: *subject_id,
                });
            }
            Err(e) => {
                warn!(error = %e, "recovery failed, ending session");
                metrics::counter!("gateway_recoveries_total", "outcome" => "failure").increment(1);
                if let Err(clear_err) = self.store.clear().await {
                    warn!(error = %clear_err, "failed to clear session after recovery failure");
                }
                self.emit(SessionEvent::Expired {
                    reason: e.message.clone(),
                });
            }
        }
        outcome.map(|_| ())
    }

    async fn exchange_refresh_credential(&self) -> Result<u64, NormalizedError> {
        let refresh = self
            .store
            .read_refresh_credential()
            .await
            .ok_or_else(|| NormalizedError::recovery_failed("no refresh credential"))?;
        let subject_id = self
            .store
            .read_subject_id()
            .await
            .ok_or_else(|| NormalizedError::recovery_failed("session has no subject id"))?;

        let pair = self.transport.recover(&refresh).await.map_err(|e| {
            if e.code == codes::RECOVERY_FAILED {
                e
            } else {
                NormalizedError::recovery_failed(e.message)
            }
        })?;

        let recovered = Session::recovered(pair.access, pair.refresh, refresh, subject_id);
        self.store
            .write(recovered)
            .await
            .map_err(|e| NormalizedError::recovery_failed(format!("storing recovered session: {e}")))?;
        Ok(subject_id)
    }
}
