//! # Ziti Transport
//!
//! Byte-stream transports used to reach edge routers.
//!
//! Edge routers advertise URLs such as `tls://router.example:3022`. A
//! [`Dialer`] turns such a URL into a connected, boxed duplex stream that the
//! edge channel frames messages over.
//!
//! This crate provides:
//! - The [`Dialer`] abstraction and [`BoxedTransport`] stream type
//! - [`TlsDialer`] for `tls://` routers (rustls, client certificate auth)
//! - [`TcpDialer`] for plain `tcp://` routers in lab setups

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod tls;
pub mod transport;

pub use tls::{TcpDialer, TlsDialer};
pub use transport::{
    BoxedTransport, Dialer, RouterAddr, TransportError, TransportResult, TransportStream,
};

use std::time::Duration;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// TCP keepalive idle time (None disables keepalive)
    pub keepalive: Option<Duration>,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive: Some(Duration::from_secs(30)),
            nodelay: true,
        }
    }
}
