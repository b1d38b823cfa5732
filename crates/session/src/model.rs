//! The session triple

use common::Secret;

/// Authentication state for one signed-in user.
///
/// Both tokens are set and replaced together. `Debug` output never contains
/// token values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access: Secret<String>,
    pub refresh: Secret<String>,
    pub subject_id: u64,
}

impl Session {
    pub fn new(
        access: impl Into<Secret<String>>,
        refresh: impl Into<Secret<String>>,
        subject_id: u64,
    ) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
            subject_id,
        }
    }

    /// Session after a successful recovery exchange.
    ///
    /// When the backend did not rotate the refresh token, `current_refresh`
    /// is kept.
    pub fn recovered(
        access: Secret<String>,
        rotated_refresh: Option<Secret<String>>,
        current_refresh: Secret<String>,
        subject_id: u64,
    ) -> Self {
        Self {
            access,
            refresh: rotated_refresh.unwrap_or(current_refresh),
            subject_id,
        }
    }
}
