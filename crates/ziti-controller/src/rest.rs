//! REST implementation of [`Controller`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::model::{CreateSessionRequest, Envelope, ErrorEnvelope};
use crate::{
    Controller, ControllerError, NetworkSession, Result, SESSION_HEADER, Service, Session,
    SessionType, Version,
};

/// Services requested per page.
const PAGE_LIMIT: usize = 500;

/// Controller client over HTTPS.
pub struct RestController {
    base: url::Url,
    http: reqwest::Client,
    token: Mutex<Option<String>>,
    shut_down: AtomicBool,
}

impl RestController {
    /// Create a client for the controller at `controller_url`.
    ///
    /// `tls` carries the client certificate and trust anchors; without it the
    /// platform defaults are used and certificate login is not possible.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidUrl`] if the URL does not parse or
    /// the HTTP client cannot be built.
    pub fn new(controller_url: &str, tls: Option<Arc<rustls::ClientConfig>>) -> Result<Self> {
        let mut base = url::Url::parse(controller_url)
            .map_err(|e| ControllerError::InvalidUrl(format!("{controller_url}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30));
        if let Some(tls) = tls {
            builder = builder.use_preconfigured_tls((*tls).clone());
        }
        let http = builder
            .build()
            .map_err(|e| ControllerError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            base,
            http,
            token: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Controller base URL.
    #[must_use]
    pub fn base_url(&self) -> &url::Url {
        &self.base
    }

    fn token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self
            .token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = token;
    }

    fn request(&self, method: Method, path: &str, authenticated: bool) -> Result<reqwest::RequestBuilder> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ControllerError::Shutdown);
        }
        let url = self
            .base
            .join(path)
            .map_err(|e| ControllerError::InvalidUrl(format!("{path}: {e}")))?;
        let mut req = self.http.request(method, url);
        if authenticated {
            let token = self
                .token()
                .ok_or_else(|| ControllerError::NotAuthorized("no API session".to_string()))?;
            req = req.header(SESSION_HEADER, token);
        }
        Ok(req)
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<Envelope<T>> {
        let resp = req
            .send()
            .await
            .map_err(|e| ControllerError::from_reqwest(&e))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ControllerError::from_reqwest(&e))?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        serde_json::from_slice(&body).map_err(|e| ControllerError::InvalidResponse(e.to_string()))
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> ControllerError {
    let message = serde_json::from_slice::<ErrorEnvelope>(body)
        .map(|e| {
            if e.error.code.is_empty() {
                e.error.message
            } else {
                format!("{}: {}", e.error.code, e.error.message)
            }
        })
        .unwrap_or_else(|_| status.to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ControllerError::NotAuthorized(message),
        s if s.is_server_error() => ControllerError::Unavailable(message),
        s => ControllerError::Request {
            status: s.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl Controller for RestController {
    async fn version(&self) -> Result<Version> {
        let env: Envelope<Version> = self.send(self.request(Method::GET, "version", false)?).await?;
        Ok(env.data)
    }

    async fn login(&self) -> Result<Session> {
        let req = self
            .request(Method::POST, "authenticate?method=cert", false)?
            .json(&serde_json::json!({}));
        let env: Envelope<Session> = self.send(req).await?;
        self.set_token(Some(env.data.token.clone()));
        tracing::debug!("Logged in as {} ({})", env.data.identity.name, env.data.identity.id);
        Ok(env.data)
    }

    async fn logout(&self) -> Result<()> {
        if self.token().is_none() {
            return Ok(());
        }
        let req = self.request(Method::DELETE, "current-session", true)?;
        let result = self.send::<serde_json::Value>(req).await;
        self.set_token(None);
        result.map(|_| ())
    }

    async fn get_services(&self) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        loop {
            let path = format!("services?limit={PAGE_LIMIT}&offset={}", services.len());
            let env: Envelope<Vec<Service>> = self.send(self.request(Method::GET, &path, true)?).await?;
            let page_len = env.data.len();
            services.extend(env.data);

            let total = env.meta.pagination.map_or(services.len(), |p| p.total_count);
            if page_len == 0 || services.len() >= total {
                break;
            }
        }
        tracing::trace!("Fetched {} services", services.len());
        Ok(services)
    }

    async fn create_net_session(
        &self,
        service: &Service,
        session_type: SessionType,
    ) -> Result<NetworkSession> {
        let req = self
            .request(Method::POST, "sessions", true)?
            .json(&CreateSessionRequest {
                service_id: &service.id,
                session_type,
            });
        let env: Envelope<NetworkSession> = self.send(req).await?;
        tracing::debug!(
            "Created {} session {} for service {}",
            session_type,
            env.data.id,
            service.name
        );
        Ok(env.data)
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.set_token(None);
    }
}

impl std::fmt::Debug for RestController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestController")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.token().is_some())
            .finish()
    }
}
