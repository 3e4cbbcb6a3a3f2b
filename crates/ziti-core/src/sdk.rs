//! Blocking SDK facade.
//!
//! [`Ziti`] owns a multi-threaded tokio runtime and every loaded
//! [`ZitiContext`]. Its methods block the calling thread and must not be
//! called from inside an async task.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use ziti_controller::{Controller, RestController};
use ziti_transport::{Dialer, TcpDialer, TlsDialer};

use crate::connection::BlockingConnection;
use crate::context::{ContextConfig, ZitiContext};
use crate::dns::{DnsManager, LoopbackDnsManager};
use crate::identity::ZitiIdentity;
use crate::{Result, SDK_VERSION, ZitiError};

/// Process-level entry point: a runtime plus the loaded contexts.
pub struct Ziti {
    runtime: Runtime,
    contexts: Mutex<Vec<ZitiContext>>,
    dns: Arc<dyn DnsManager>,
    config: ContextConfig,
}

impl Ziti {
    /// Create an SDK instance with default settings and a loopback DNS
    /// manager.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::Io`] if the runtime cannot be started.
    pub fn new() -> Result<Self> {
        Self::with_config(ContextConfig::default(), Arc::new(LoopbackDnsManager::new()))
    }

    /// Create an SDK instance with explicit context settings and DNS manager.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::InvalidConfig`] for bad settings and
    /// [`ZitiError::Io`] if the runtime cannot be started.
    pub fn with_config(config: ContextConfig, dns: Arc<dyn DnsManager>) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("ziti")
            .build()?;
        tracing::debug!("Ziti SDK {} started", SDK_VERSION);
        Ok(Self {
            runtime,
            contexts: Mutex::new(Vec::new()),
            dns,
            config,
        })
    }

    fn lock_contexts(&self) -> MutexGuard<'_, Vec<ZitiContext>> {
        self.contexts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Load `identity` with the REST controller client and a TLS router
    /// dialer (plain TCP when the identity has no TLS material).
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::InvalidConfig`] for a bad controller URL and
    /// [`ZitiError::InvalidState`] if a context with the same name exists.
    pub fn load_context(&self, identity: ZitiIdentity, enabled: bool) -> Result<ZitiContext> {
        let identity = Arc::new(identity);
        let tls = identity.tls_config();

        let _enter = self.runtime.enter();
        let controller = RestController::new(identity.controller(), tls.clone())?;
        let dialer: Arc<dyn Dialer> = match tls {
            Some(tls) => Arc::new(TlsDialer::new(tls, self.config.transport())),
            None => Arc::new(TcpDialer::new(self.config.transport())),
        };
        self.load_context_with(identity, Arc::new(controller), dialer, enabled)
    }

    /// Load a context over caller-supplied controller and dialer.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::InvalidState`] if a context with the same name
    /// exists.
    pub fn load_context_with(
        &self,
        identity: Arc<ZitiIdentity>,
        controller: Arc<dyn Controller>,
        dialer: Arc<dyn Dialer>,
        enabled: bool,
    ) -> Result<ZitiContext> {
        let mut contexts = self.lock_contexts();
        if contexts.iter().any(|c| c.name() == identity.name()) {
            return Err(ZitiError::InvalidState(
                format!("identity {} is already loaded", identity.name()).into(),
            ));
        }

        let _enter = self.runtime.enter();
        let ctx = ZitiContext::new(identity, controller, dialer, self.dns.clone(), self.config.clone())?;
        ctx.set_enabled(enabled);
        contexts.push(ctx.clone());
        tracing::info!("Loaded identity {} ({})", ctx.name(), ctx.controller());
        Ok(ctx)
    }

    /// All loaded contexts, in load order.
    #[must_use]
    pub fn contexts(&self) -> Vec<ZitiContext> {
        self.lock_contexts().clone()
    }

    /// Context for identity `name`.
    #[must_use]
    pub fn context(&self, name: &str) -> Option<ZitiContext> {
        self.lock_contexts().iter().find(|c| c.name() == name).cloned()
    }

    /// Unload and destroy the context for identity `name`.
    pub fn remove_context(&self, name: &str) -> bool {
        let removed = {
            let mut contexts = self.lock_contexts();
            let idx = contexts.iter().position(|c| c.name() == name);
            idx.map(|i| contexts.remove(i))
        };
        match removed {
            Some(ctx) => {
                self.runtime.block_on(ctx.destroy());
                true
            }
            None => false,
        }
    }

    /// Wait until every context has its first service list (or its
    /// services barrier timed out).
    pub fn wait_for_services(&self) {
        let contexts = self.contexts();
        self.runtime.block_on(async {
            for ctx in &contexts {
                if ctx.is_enabled() {
                    ctx.check_services_loaded().await;
                }
            }
        });
    }

    /// Dial `service` through the first context that knows it.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::ServiceNotAvailable`] if no context offers the
    /// service, or the dial error of the chosen context.
    pub fn dial(&self, service: &str) -> Result<BlockingConnection> {
        for ctx in self.contexts() {
            if !ctx.is_enabled() {
                continue;
            }
            let known = self.runtime.block_on(async {
                ctx.check_services_loaded().await;
                ctx.get_service(service).is_some()
            });
            if known {
                let conn = self.runtime.block_on(ctx.dial(service))?;
                return Ok(BlockingConnection::new(conn, self.handle()));
            }
        }
        Err(ZitiError::service_not_available(service))
    }

    /// Connect to the service behind `addr`.
    ///
    /// An address handed out by the DNS manager selects its service
    /// directly; otherwise `addr` is matched against service `dns` configs.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::ServiceNotAvailable`] if no context serves
    /// `addr`, or the dial error of the chosen context.
    pub fn connect(&self, addr: SocketAddr) -> Result<BlockingConnection> {
        let by_id = self.dns.service_id_by_addr(&addr);
        let host = addr.ip().to_string();

        for ctx in self.contexts() {
            if !ctx.is_enabled() {
                continue;
            }
            let dial = match &by_id {
                Some(id) if ctx.get_service_by_id(id).is_some() => {
                    Some(self.runtime.block_on(ctx.dial_by_id(id)))
                }
                Some(_) => None,
                None if ctx.service_by_host(&host, addr.port()).is_some() => {
                    Some(self.runtime.block_on(ctx.dial_host(&host, addr.port())))
                }
                None => None,
            };
            if let Some(result) = dial {
                return Ok(BlockingConnection::new(result?, self.handle()));
            }
        }
        Err(ZitiError::service_not_available(addr.to_string()))
    }

    /// Address the DNS manager assigned to `hostname`.
    #[must_use]
    pub fn resolve(&self, hostname: &str) -> Option<IpAddr> {
        self.dns.resolve(hostname)
    }

    /// The DNS manager shared by all contexts.
    #[must_use]
    pub fn dns(&self) -> &Arc<dyn DnsManager> {
        &self.dns
    }

    /// Handle of the SDK runtime.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Destroy every context and stop the runtime.
    pub fn shutdown(self) {
        let contexts = std::mem::take(&mut *self.lock_contexts());
        self.runtime.block_on(async {
            for ctx in &contexts {
                ctx.destroy().await;
            }
        });
        self.runtime.shutdown_timeout(Duration::from_secs(5));
        tracing::debug!("Ziti SDK stopped");
    }
}

impl std::fmt::Debug for Ziti {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.contexts().iter().map(|c| c.name().to_string()).collect();
        f.debug_struct("Ziti")
            .field("contexts", &names)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ziti_controller::{
        ApiIdentity, ControllerError, NetworkSession, Service, Session, SessionType, Version,
    };
    use ziti_transport::{BoxedTransport, TransportError, TransportResult};

    struct EmptyController;

    #[async_trait]
    impl Controller for EmptyController {
        async fn version(&self) -> ziti_controller::Result<Version> {
            Err(ControllerError::Unavailable("unused".into()))
        }
        async fn login(&self) -> ziti_controller::Result<Session> {
            Ok(Session {
                token: "t".into(),
                identity: ApiIdentity {
                    id: "1".into(),
                    name: "n".into(),
                },
            })
        }
        async fn logout(&self) -> ziti_controller::Result<()> {
            Ok(())
        }
        async fn get_services(&self) -> ziti_controller::Result<Vec<Service>> {
            Ok(Vec::new())
        }
        async fn create_net_session(
            &self,
            _service: &Service,
            _session_type: SessionType,
        ) -> ziti_controller::Result<NetworkSession> {
            Err(ControllerError::Unavailable("unused".into()))
        }
        async fn shutdown(&self) {}
    }

    struct NoDialer;

    #[async_trait]
    impl Dialer for NoDialer {
        async fn dial(&self, addr: &str) -> TransportResult<BoxedTransport> {
            Err(TransportError::ConnectionFailed(addr.to_string()))
        }
    }

    fn load(ziti: &Ziti, name: &str) -> Result<ZitiContext> {
        ziti.load_context_with(
            Arc::new(ZitiIdentity::new(name, "https://ctrl:1280")),
            Arc::new(EmptyController),
            Arc::new(NoDialer),
            true,
        )
    }

    #[test]
    fn test_load_and_remove_context() {
        let ziti = Ziti::new().unwrap();
        load(&ziti, "alice").unwrap();
        assert!(load(&ziti, "alice").is_err());
        assert_eq!(ziti.contexts().len(), 1);

        ziti.wait_for_services();
        assert!(ziti.context("alice").is_some());

        assert!(ziti.remove_context("alice"));
        assert!(!ziti.remove_context("alice"));
        assert!(ziti.contexts().is_empty());
        ziti.shutdown();
    }

    #[test]
    fn test_dial_unknown_service() {
        let ziti = Ziti::new().unwrap();
        load(&ziti, "alice").unwrap();
        let err = ziti.dial("nope").unwrap_err();
        assert!(matches!(err, ZitiError::ServiceNotAvailable(_)));
        ziti.shutdown();
    }

    #[test]
    fn test_connect_unknown_address() {
        let ziti = Ziti::new().unwrap();
        load(&ziti, "alice").unwrap();
        let err = ziti.connect("10.1.2.3:443".parse().unwrap()).unwrap_err();
        assert!(matches!(err, ZitiError::ServiceNotAvailable(_)));
        ziti.shutdown();
    }

    #[test]
    fn test_load_context_rejects_bad_url() {
        let ziti = Ziti::new().unwrap();
        let err = ziti
            .load_context(ZitiIdentity::new("bob", "not a url"), false)
            .unwrap_err();
        assert!(matches!(err, ZitiError::InvalidConfig(_)));
        ziti.shutdown();
    }
}
