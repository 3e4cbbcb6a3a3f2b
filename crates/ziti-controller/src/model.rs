//! Controller data model.
//!
//! JSON shapes exchanged with the controller's client API. Field names follow
//! the controller's camelCase convention.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Kind of network session a client may hold for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionType {
    /// Connect to the service
    Dial,
    /// Host the service
    Bind,
}

impl SessionType {
    /// Both session types, in eviction order.
    pub const ALL: [SessionType; 2] = [SessionType::Dial, SessionType::Bind];
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dial => f.write_str("Dial"),
            Self::Bind => f.write_str("Bind"),
        }
    }
}

/// Intercept address advertised for a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Host name clients use for the service
    pub hostname: String,
    /// Port clients use for the service
    pub port: u16,
}

/// A service visible to the authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Opaque service id
    pub id: String,
    /// Unique service name
    pub name: String,
    /// Optional intercept address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
    /// Allowed session types
    #[serde(default)]
    pub permissions: BTreeSet<SessionType>,
}

impl Service {
    /// Whether the identity may open sessions of `session_type`.
    #[must_use]
    pub fn permits(&self, session_type: SessionType) -> bool {
        self.permissions.contains(&session_type)
    }
}

/// An edge router able to carry a network session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRouter {
    /// Router name
    pub name: String,
    /// Router host name
    #[serde(default)]
    pub hostname: String,
    /// Listener URLs keyed by protocol (`tls`, ...)
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
}

/// Service-scoped capability issued by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSession {
    /// Session id
    pub id: String,
    /// Token presented in CONNECT
    pub token: String,
    /// Dial or Bind
    #[serde(rename = "type")]
    pub session_type: SessionType,
    /// Routers hosting the service
    #[serde(rename = "edgeRouters", default)]
    pub edge_routers: Vec<EdgeRouter>,
}

impl NetworkSession {
    /// The `tls` listener URL of each router, in router order.
    pub fn tls_urls(&self) -> impl Iterator<Item = &str> {
        self.edge_routers
            .iter()
            .filter_map(|r| r.urls.get("tls").map(String::as_str))
    }
}

/// Identity as known to the controller API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiIdentity {
    /// Identity id
    pub id: String,
    /// Identity name
    pub name: String,
}

/// API session created by login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session token (`zt-session`)
    pub token: String,
    /// Authenticated identity
    pub identity: ApiIdentity,
}

/// Controller version information.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    /// Release version
    #[serde(default)]
    pub version: String,
    /// Source revision
    #[serde(default)]
    pub revision: String,
    /// Build date
    #[serde(default)]
    pub build_date: String,
    /// Runtime used to build the controller
    #[serde(default)]
    pub runtime_version: String,
}

/// Request body for `POST /sessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest<'a> {
    /// Target service
    pub service_id: &'a str,
    /// Requested session type
    #[serde(rename = "type")]
    pub session_type: SessionType,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub data: T,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Meta {
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Pagination {
    pub total_count: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}
