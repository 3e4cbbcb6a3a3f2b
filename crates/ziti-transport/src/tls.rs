//! TCP and TLS dialers for edge routers.

use std::sync::Arc;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::TransportConfig;
use crate::transport::{BoxedTransport, Dialer, RouterAddr, TransportError, TransportResult};

async fn connect_tcp(addr: &RouterAddr, config: &TransportConfig) -> TransportResult<TcpStream> {
    let target = addr.socket_target();
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| TransportError::Timeout(target.clone()))?
        .map_err(|e| {
            tracing::debug!("TCP connect to {} failed: {}", target, e);
            TransportError::ConnectionFailed(target.clone())
        })?;

    stream.set_nodelay(config.nodelay)?;
    if let Some(idle) = config.keepalive {
        let keepalive = TcpKeepalive::new().with_time(idle);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(stream)
}

/// Dialer for plain `tcp://` routers.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    /// Create a TCP dialer.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> TransportResult<BoxedTransport> {
        let parsed = RouterAddr::parse(addr)?;
        if parsed.scheme != "tcp" {
            return Err(TransportError::InvalidAddress(format!(
                "{addr}: unsupported scheme {}",
                parsed.scheme
            )));
        }
        let stream = connect_tcp(&parsed, &self.config).await?;
        Ok(Box::new(stream))
    }
}

/// Dialer for `tls://` routers, also accepting `tcp://`.
///
/// The rustls client configuration carries the identity's client
/// certificate and trusted CA bundle.
#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
    config: TransportConfig,
}

impl TlsDialer {
    /// Create a TLS dialer from a client configuration.
    #[must_use]
    pub fn new(tls: Arc<rustls::ClientConfig>, config: TransportConfig) -> Self {
        Self {
            connector: TlsConnector::from(tls),
            config,
        }
    }
}

impl std::fmt::Debug for TlsDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDialer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: &str) -> TransportResult<BoxedTransport> {
        let parsed = RouterAddr::parse(addr)?;
        match parsed.scheme.as_str() {
            "tls" => {}
            "tcp" => {
                let stream = connect_tcp(&parsed, &self.config).await?;
                return Ok(Box::new(stream));
            }
            other => {
                return Err(TransportError::InvalidAddress(format!(
                    "{addr}: unsupported scheme {other}"
                )));
            }
        }

        let server_name = rustls::ServerName::try_from(parsed.host.as_str())
            .map_err(|e| TransportError::InvalidAddress(format!("{addr}: {e}")))?;

        let stream = connect_tcp(&parsed, &self.config).await?;
        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        tracing::debug!("TLS session established with {}", addr);
        Ok(Box::new(tls))
    }
}
