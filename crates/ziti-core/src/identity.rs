//! Ziti identity: who we are to the controller and edge routers.

use std::sync::{Arc, Mutex};

use crate::{Result, ZitiError};

/// A loaded identity with its TLS material and current API session token.
pub struct ZitiIdentity {
    name: String,
    controller: String,
    tls: Option<Arc<rustls::ClientConfig>>,
    session_token: Mutex<Option<String>>,
}

impl ZitiIdentity {
    /// Identity without TLS material (plain `tcp://` routers, tests).
    #[must_use]
    pub fn new(name: impl Into<String>, controller: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            controller: controller.into(),
            tls: None,
            session_token: Mutex::new(None),
        }
    }

    /// Attach a prepared rustls client configuration.
    #[must_use]
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Build an identity from PEM encoded material.
    ///
    /// `cert_chain` holds the client certificate followed by intermediates,
    /// `key` a PKCS#8, RSA or EC private key, and `ca_bundle` the trust
    /// anchors for both the controller and the edge routers.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::InvalidConfig`] if any PEM input is unusable.
    pub fn from_pem(
        name: impl Into<String>,
        controller: impl Into<String>,
        cert_chain: &[u8],
        key: &[u8],
        ca_bundle: &[u8],
    ) -> Result<Self> {
        let certs: Vec<rustls::Certificate> = parse_pem(cert_chain, "certificate chain")?
            .into_iter()
            .filter(|p| p.tag == "CERTIFICATE")
            .map(|p| rustls::Certificate(p.contents))
            .collect();
        if certs.is_empty() {
            return Err(invalid_config("certificate chain has no CERTIFICATE blocks"));
        }

        let key = parse_pem(key, "private key")?
            .into_iter()
            .find(|p| matches!(p.tag.as_str(), "PRIVATE KEY" | "RSA PRIVATE KEY" | "EC PRIVATE KEY"))
            .map(|p| rustls::PrivateKey(p.contents))
            .ok_or_else(|| invalid_config("no private key block found"))?;

        let mut roots = rustls::RootCertStore::empty();
        for ca in parse_pem(ca_bundle, "CA bundle")? {
            if ca.tag != "CERTIFICATE" {
                continue;
            }
            roots
                .add(&rustls::Certificate(ca.contents))
                .map_err(|e| ZitiError::InvalidConfig(format!("CA bundle: {e}").into()))?;
        }
        if roots.is_empty() {
            return Err(invalid_config("CA bundle has no certificates"));
        }

        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| ZitiError::InvalidConfig(format!("client certificate: {e}").into()))?;

        Ok(Self::new(name, controller).with_tls(Arc::new(config)))
    }

    /// Identity name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controller URL.
    #[must_use]
    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// TLS configuration for controller and router connections.
    #[must_use]
    pub fn tls_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        self.tls.clone()
    }

    /// Current API session token.
    #[must_use]
    pub fn session_token(&self) -> Option<String> {
        self.session_token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Replace (or clear) the API session token.
    pub fn set_session_token(&self, token: Option<String>) {
        *self
            .session_token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = token;
    }
}

fn invalid_config(msg: &'static str) -> ZitiError {
    ZitiError::InvalidConfig(msg.into())
}

fn parse_pem(input: &[u8], what: &str) -> Result<Vec<pem::Pem>> {
    pem::parse_many(input).map_err(|e| ZitiError::InvalidConfig(format!("{what}: {e}").into()))
}

impl std::fmt::Debug for ZitiIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZitiIdentity")
            .field("name", &self.name)
            .field("controller", &self.controller)
            .field("tls", &self.tls.is_some())
            .field("has_session", &self.session_token().is_some())
            .finish()
    }
}
