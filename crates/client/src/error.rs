//! Typed error raised to application code

use gateway::{NormalizedError, codes};

/// Failure surfaced by [`crate::ApiClient`]. Carries the normalized
/// `code`, `message`, and `httpStatus`; branch on [`ApiError::code`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ApiError(pub NormalizedError);

impl ApiError {
    pub fn code(&self) -> &str {
        &self.0.code
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    pub fn http_status(&self) -> u16 {
        self.0.http_status
    }

    /// The session is gone and the user has to sign in again.
    pub fn is_session_expired(&self) -> bool {
        self.0.code == codes::RECOVERY_FAILED
    }

    pub fn into_normalized(self) -> NormalizedError {
        self.0
    }
}

impl From<NormalizedError> for ApiError {
    fn from(err: NormalizedError) -> Self {
        Self(err)
    }
}

/// Result alias for API calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
