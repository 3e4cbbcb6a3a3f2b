//! Error types for the Ziti SDK
//!
//! `ZitiError` is the single error taxonomy surfaced to applications. It is
//! `Clone` so one failure can be stored in a [`Status`](crate::Status) and
//! delivered to every waiter of a closing channel.
//!
//! # Error Categories
//!
//! - **Transient**: controller or router unavailable, timeouts, closed
//!   channels. A later attempt may succeed.
//! - **Authorization**: `NotAuthorized` requires a fresh login.
//! - **Permanent**: everything else.

use std::borrow::Cow;
use std::io;

use thiserror::Error;
use ziti_controller::ControllerError;
use ziti_crypto::CryptoError;
use ziti_transport::TransportError;

use crate::message::MessageError;

/// Errors surfaced by the Ziti SDK
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZitiError {
    // ============ Controller Errors ============
    /// Controller rejected the credentials or session
    #[error("Not authorized: {0}")]
    NotAuthorized(Cow<'static, str>),

    /// Controller could not be reached
    #[error("Controller unavailable: {0}")]
    ControllerUnavailable(Cow<'static, str>),

    /// Controller or router answered with something unexpected
    #[error("Invalid response: {0}")]
    InvalidResponse(Cow<'static, str>),

    // ============ Routing Errors ============
    /// No edge router could be reached for the session
    #[error("Edge router unavailable: {0}")]
    EdgeRouterUnavailable(Cow<'static, str>),

    /// Service unknown, removed, or not permitted
    #[error("Service not available: {0}")]
    ServiceNotAvailable(Cow<'static, str>),

    /// Router refused the virtual connection
    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    /// Channel hello attempted without an API session
    #[error("No API session token")]
    NoSessionToken,

    // ============ Channel Errors ============
    /// Inbound frame violated the framing rules
    #[error("Malformed frame: {0}")]
    MalformedFrame(Cow<'static, str>),

    /// Channel closed; carries the root cause
    #[error("Channel closed: {0}")]
    ChannelClosed(Cow<'static, str>),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    // ============ Crypto Errors ============
    /// Payload failed authentication or arrived out of order
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Local stream header requested twice
    #[error("Stream header already consumed")]
    HeaderAlreadyConsumed,

    /// Peer stream header applied twice
    #[error("Stream already initialized")]
    AlreadyInitialized,

    // ============ State Errors ============
    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Anything else
    #[error("{0}")]
    Unknown(Cow<'static, str>),
}

impl ZitiError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ZitiError::ControllerUnavailable(_)
                | ZitiError::EdgeRouterUnavailable(_)
                | ZitiError::Timeout(_)
                | ZitiError::ChannelClosed(_)
                | ZitiError::Io(_)
        )
    }

    /// Returns true if a fresh login is required
    #[must_use]
    pub fn is_not_authorized(&self) -> bool {
        matches!(self, ZitiError::NotAuthorized(_) | ZitiError::NoSessionToken)
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        ZitiError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        ZitiError::Timeout(Cow::Borrowed(context))
    }

    /// Create a channel closed error with static context (zero allocation)
    #[must_use]
    pub const fn channel_closed(context: &'static str) -> Self {
        ZitiError::ChannelClosed(Cow::Borrowed(context))
    }

    /// Create a service not available error with dynamic context
    #[must_use]
    pub fn service_not_available(context: impl Into<String>) -> Self {
        ZitiError::ServiceNotAvailable(Cow::Owned(context.into()))
    }

    /// Create an edge router unavailable error with dynamic context
    #[must_use]
    pub fn edge_router_unavailable(context: impl Into<String>) -> Self {
        ZitiError::EdgeRouterUnavailable(Cow::Owned(context.into()))
    }

    /// Create an invalid response error with dynamic context
    #[must_use]
    pub fn invalid_response(context: impl Into<String>) -> Self {
        ZitiError::InvalidResponse(Cow::Owned(context.into()))
    }
}

impl From<ControllerError> for ZitiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::NotAuthorized(m) => ZitiError::NotAuthorized(Cow::Owned(m)),
            ControllerError::Unavailable(m) => ZitiError::ControllerUnavailable(Cow::Owned(m)),
            ControllerError::InvalidResponse(m) => ZitiError::InvalidResponse(Cow::Owned(m)),
            ControllerError::InvalidUrl(m) => ZitiError::InvalidConfig(Cow::Owned(m)),
            ControllerError::Shutdown => ZitiError::invalid_state("controller client is shut down"),
            other @ ControllerError::Request { .. } => ZitiError::Unknown(Cow::Owned(other.to_string())),
        }
    }
}

impl From<CryptoError> for ZitiError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed => ZitiError::DecryptionFailed,
            CryptoError::HeaderAlreadyConsumed => ZitiError::HeaderAlreadyConsumed,
            CryptoError::AlreadyInitialized => ZitiError::AlreadyInitialized,
            CryptoError::InvalidHeader { .. } | CryptoError::InvalidPublicKey => {
                ZitiError::InvalidResponse(Cow::Owned(err.to_string()))
            }
            CryptoError::NotInitialized | CryptoError::StreamFinished => {
                ZitiError::InvalidState(Cow::Owned(err.to_string()))
            }
            other => ZitiError::Unknown(Cow::Owned(other.to_string())),
        }
    }
}

impl From<TransportError> for ZitiError {
    fn from(err: TransportError) -> Self {
        ZitiError::EdgeRouterUnavailable(Cow::Owned(err.to_string()))
    }
}

impl From<MessageError> for ZitiError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Malformed(m) => ZitiError::MalformedFrame(m),
            MessageError::Io(e) => ZitiError::Io(e.to_string()),
        }
    }
}

impl From<io::Error> for ZitiError {
    fn from(err: io::Error) -> Self {
        ZitiError::Io(err.to_string())
    }
}

impl From<ZitiError> for io::Error {
    fn from(err: ZitiError) -> Self {
        let kind = match &err {
            ZitiError::ChannelClosed(_) => io::ErrorKind::BrokenPipe,
            ZitiError::ConnectionRejected(_) => io::ErrorKind::ConnectionRefused,
            ZitiError::Timeout(_) => io::ErrorKind::TimedOut,
            ZitiError::NotAuthorized(_) | ZitiError::NoSessionToken => {
                io::ErrorKind::PermissionDenied
            }
            ZitiError::ServiceNotAvailable(_) | ZitiError::EdgeRouterUnavailable(_) => {
                io::ErrorKind::NotFound
            }
            ZitiError::DecryptionFailed | ZitiError::MalformedFrame(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Result type for Ziti operations
pub type Result<T> = std::result::Result<T, ZitiError>;
