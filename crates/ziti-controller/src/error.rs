//! Controller client error types.

use thiserror::Error;

/// Errors returned by controller operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    /// 401/403, or an authenticated call without a session
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Controller unreachable or failing (connect error, timeout, 5xx)
    #[error("controller unavailable: {0}")]
    Unavailable(String),

    /// Response body did not match the expected model
    #[error("invalid controller response: {0}")]
    InvalidResponse(String),

    /// Any other non-success HTTP status
    #[error("controller request failed with status {status}: {message}")]
    Request {
        /// HTTP status code
        status: u16,
        /// Error message from the response envelope, if any
        message: String,
    },

    /// Controller URL could not be used
    #[error("invalid controller URL: {0}")]
    InvalidUrl(String),

    /// The client was shut down
    #[error("controller client is shut down")]
    Shutdown,
}

impl ControllerError {
    /// Whether retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;
