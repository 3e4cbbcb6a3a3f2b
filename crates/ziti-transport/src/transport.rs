//! Dialer trait abstraction for edge router transports.
//!
//! The edge channel only needs an ordered, reliable byte stream. This module
//! defines the `Dialer` trait that produces such streams so the channel can
//! run over TLS in production and over in-memory pipes in tests.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Router address could not be parsed or uses an unknown scheme
    #[error("Invalid router address: {0}")]
    InvalidAddress(String),

    /// Connection failed
    #[error("Connection to {0} failed")]
    ConnectionFailed(String),

    /// Connect did not finish in time
    #[error("Connection to {0} timed out")]
    Timeout(String),

    /// TLS handshake or configuration failure
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Duplex byte stream to an edge router.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// Boxed transport stream handed to the edge channel.
pub type BoxedTransport = Box<dyn TransportStream>;

/// Opens transports to edge router addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to an edge router URL such as `tls://host:3022`.
    ///
    /// # Errors
    /// Returns `TransportError` if the address is invalid or the connection
    /// cannot be established.
    async fn dial(&self, addr: &str) -> TransportResult<BoxedTransport>;
}

/// A parsed edge router URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAddr {
    /// URL scheme (`tls` or `tcp`)
    pub scheme: String,
    /// Host name or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl RouterAddr {
    /// Parse a `scheme://host:port` router URL.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidAddress` when the URL has no host or
    /// no port.
    pub fn parse(addr: &str) -> TransportResult<Self> {
        let url = url::Url::parse(addr).map_err(|e| TransportError::InvalidAddress(format!("{addr}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidAddress(format!("{addr}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| TransportError::InvalidAddress(format!("{addr}: missing port")))?;
        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
        })
    }

    /// `host:port` form suitable for `TcpStream::connect`.
    #[must_use]
    pub fn socket_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tls_addr() {
        let addr = RouterAddr::parse("tls://er1.example.com:3022").unwrap();
        assert_eq!(addr.scheme, "tls");
        assert_eq!(addr.host, "er1.example.com");
        assert_eq!(addr.port, 3022);
        assert_eq!(addr.socket_target(), "er1.example.com:3022");
    }

    #[test]
    fn test_parse_ipv6_addr() {
        let addr = RouterAddr::parse("tcp://[::1]:4000").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.socket_target(), "[::1]:4000");
    }

    #[test]
    fn test_parse_missing_port() {
        assert!(matches!(
            RouterAddr::parse("tls://er1.example.com"),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(RouterAddr::parse("not a url").is_err());
    }
}
