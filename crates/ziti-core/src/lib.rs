//! # Ziti Core
//!
//! Client-side runtime for a zero-trust overlay network.
//!
//! This crate provides:
//! - Edge wire message encoding and decoding
//! - Edge channels: one framed TLS connection per router, multiplexing many
//!   virtual connections with request/reply correlation
//! - Virtual connections encrypted between the SDK and the edge router
//! - The per-identity [`ZitiContext`]: login, service refresh, network
//!   session cache, channel pool and dialing
//! - The blocking [`Ziti`] facade for synchronous callers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        ZitiContext                               │
//! │   (login, services, network sessions, channel pool, dial)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      ZitiConnection                              │
//! │   (one virtual connection, secret stream encrypted payload)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Channel                                  │
//! │   (framed messages over TLS to one edge router)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod connection;
pub mod context;
pub mod dns;
pub mod error;
pub mod identity;
pub mod message;
pub mod meter;
pub mod protocol;
pub mod sdk;

pub use channel::{Channel, ChannelConfig, MessageReceiver};
pub use connection::{BlockingConnection, ZitiConnection};
pub use context::{
    ContextConfig, ServiceEvent, ServiceEventKind, ServiceUpdates, Status, StatusUpdates,
    ZitiContext,
};
pub use dns::{DnsManager, LoopbackDnsManager};
pub use error::{Result, ZitiError};
pub use identity::ZitiIdentity;
pub use message::{Message, MessageError};
pub use meter::RateMeter;
pub use protocol::ContentType;
pub use sdk::Ziti;

pub use ziti_controller::{NetworkSession, Service, SessionType};

/// SDK version reported in logs
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
