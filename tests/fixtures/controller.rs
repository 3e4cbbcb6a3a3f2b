//! Scripted controller.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use ziti_controller::{
    ApiIdentity, Controller, ControllerError, DnsConfig, EdgeRouter, NetworkSession, Result,
    Service, Session, SessionType, Version,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Build a service with the given permissions and optional `host:port`.
pub fn service(id: &str, name: &str, perms: &[SessionType], dns: Option<(&str, u16)>) -> Service {
    Service {
        id: id.to_string(),
        name: name.to_string(),
        dns: dns.map(|(hostname, port)| DnsConfig {
            hostname: hostname.to_string(),
            port,
        }),
        permissions: perms.iter().copied().collect::<BTreeSet<_>>(),
    }
}

/// Controller double.
///
/// Each `get_services` call consumes the next scripted list; the last list
/// repeats. Network sessions list one edge router per configured URL, in
/// order.
pub struct StubController {
    routers: Vec<String>,
    scripts: Mutex<VecDeque<Vec<Service>>>,
    unauthorized_on: Option<usize>,
    login_gate: Option<Notify>,
    /// `login` calls
    pub logins: AtomicUsize,
    /// `logout` calls
    pub logouts: AtomicUsize,
    /// `get_services` calls
    pub service_calls: AtomicUsize,
    /// `create_net_session` calls
    pub creates: AtomicUsize,
}

impl StubController {
    /// Controller whose sessions point at `routers`.
    pub fn new(routers: &[&str]) -> Self {
        Self {
            routers: routers.iter().map(|r| r.to_string()).collect(),
            scripts: Mutex::new(VecDeque::new()),
            unauthorized_on: None,
            login_gate: None,
            logins: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            service_calls: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }

    /// Append a service list to the script.
    pub fn then_services(self, services: Vec<Service>) -> Self {
        lock(&self.scripts).push_back(services);
        self
    }

    /// Answer the `n`th `get_services` call (1-based) with 401.
    pub fn unauthorized_on(mut self, n: usize) -> Self {
        self.unauthorized_on = Some(n);
        self
    }

    /// Hold every `login` until [`release_login`](Self::release_login).
    pub fn gated(mut self) -> Self {
        self.login_gate = Some(Notify::new());
        self
    }

    /// Let one gated login proceed.
    pub fn release_login(&self) {
        if let Some(gate) = &self.login_gate {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl Controller for StubController {
    async fn version(&self) -> Result<Version> {
        Ok(Version {
            version: "v0.0.0-test".into(),
            revision: "test".into(),
            build_date: "today".into(),
            runtime_version: "rust".into(),
        })
    }

    async fn login(&self) -> Result<Session> {
        if let Some(gate) = &self.login_gate {
            gate.notified().await;
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session {
            token: format!("api-token-{n}"),
            identity: ApiIdentity {
                id: "identity-id".into(),
                name: "test-identity".into(),
            },
        })
    }

    async fn logout(&self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_services(&self) -> Result<Vec<Service>> {
        let n = self.service_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.unauthorized_on == Some(n) {
            return Err(ControllerError::NotAuthorized("session expired".into()));
        }
        let mut scripts = lock(&self.scripts);
        let list = if scripts.len() > 1 {
            scripts.pop_front()
        } else {
            scripts.front().cloned()
        };
        Ok(list.unwrap_or_default())
    }

    async fn create_net_session(
        &self,
        service: &Service,
        session_type: SessionType,
    ) -> Result<NetworkSession> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        // Widen the window for concurrent dials.
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(NetworkSession {
            id: format!("ns-{n}"),
            token: format!("ns-token-{}", service.id),
            session_type,
            edge_routers: self
                .routers
                .iter()
                .enumerate()
                .map(|(i, url)| EdgeRouter {
                    name: format!("er{i}"),
                    hostname: format!("er{i}.test"),
                    urls: [("tls".to_string(), url.clone())].into(),
                })
                .collect(),
        })
    }

    async fn shutdown(&self) {}
}
