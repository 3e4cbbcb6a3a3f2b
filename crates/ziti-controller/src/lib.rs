//! # Ziti Controller
//!
//! Typed access to the controller's client REST API.
//!
//! The [`Controller`] trait is the seam the Ziti context talks through; the
//! [`RestController`] implementation speaks HTTPS with the identity's client
//! certificate. No retries happen at this layer.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | [`Controller::version`] | `GET /version` |
//! | [`Controller::login`] | `POST /authenticate?method=cert` |
//! | [`Controller::logout`] | `DELETE /current-session` |
//! | [`Controller::get_services`] | `GET /services` |
//! | [`Controller::create_net_session`] | `POST /sessions` |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod model;
pub mod rest;

pub use error::{ControllerError, Result};
pub use model::{
    ApiIdentity, DnsConfig, EdgeRouter, NetworkSession, Service, Session, SessionType, Version,
};
pub use rest::RestController;

use async_trait::async_trait;

/// Header carrying the API session token.
pub const SESSION_HEADER: &str = "zt-session";

/// Operations the SDK needs from the controller.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Controller version information.
    async fn version(&self) -> Result<Version>;

    /// Authenticate with the identity's client certificate.
    async fn login(&self) -> Result<Session>;

    /// End the current API session.
    async fn logout(&self) -> Result<()>;

    /// All services visible to the identity.
    async fn get_services(&self) -> Result<Vec<Service>>;

    /// Create a network session for `service`.
    async fn create_net_session(
        &self,
        service: &Service,
        session_type: SessionType,
    ) -> Result<NetworkSession>;

    /// Release client resources. Later authenticated calls fail.
    async fn shutdown(&self);
}
