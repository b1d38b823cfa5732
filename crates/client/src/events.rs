//! Session lifecycle notifications for the application layer

/// Broadcast whenever the session changes.
///
/// `Expired` is the redirect signal: the refresh token was rejected, the
/// session has been cleared, and the user must sign in again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { subject_id: u64 },
    Refreshed { subject_id: u64 },
    SignedOut,
    Expired { reason: String },
}

impl SessionEvent {
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, SessionEvent::Expired { .. } | SessionEvent::SignedOut)
    }
}

/// Capacity of the session event channel. Slow subscribers lag rather than
/// block the lifecycle manager.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;
