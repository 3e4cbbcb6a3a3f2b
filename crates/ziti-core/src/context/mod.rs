//! Ziti context: the per-identity runtime.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      ZitiContext                           │
//! │  status (watch)        service events (broadcast)         │
//! ├───────────────────────────────────────────────────────────┤
//! │ ServiceTable │ session cache │ channel pool │ Supervisor  │
//! ├───────────────────────────────────────────────────────────┤
//! │  Controller (REST)   │   Dialer + Channel   │ DnsManager  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! A context starts `Disabled`. Enabling it logs in and starts the service
//! refresh loop under the supervisor; disabling cancels the supervisor,
//! closes all channels, and drops cached network sessions.

pub mod config;
#[allow(clippy::module_inception)]
pub mod context;
pub mod services;
pub mod status;
mod supervisor;

pub use config::ContextConfig;
pub use context::ZitiContext;
pub use services::{ServiceDiff, ServiceTable};
pub use status::{ServiceEvent, ServiceEventKind, ServiceUpdates, Status, StatusUpdates};
