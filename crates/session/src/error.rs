//! Error types for session storage

/// Errors from session store operations.
///
/// A missing session is never an error; reads return `None` instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("session parse error: {0}")]
    Parse(String),

    #[error("invalid session value: {0}")]
    InvalidValue(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
