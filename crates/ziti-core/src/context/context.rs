//! The per-identity Ziti context.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use ziti_controller::{ApiIdentity, Controller, NetworkSession, Service, SessionType};
use ziti_transport::Dialer;

use super::config::ContextConfig;
use super::services::ServiceTable;
use super::status::{ServiceEvent, ServiceEventKind, ServiceUpdates, Status, StatusUpdates};
use super::supervisor::Supervisor;
use crate::channel::Channel;
use crate::connection::ZitiConnection;
use crate::dns::DnsManager;
use crate::identity::ZitiIdentity;
use crate::{Result, ZitiError};

type SessionKey = (String, SessionType);

/// Context inner state
pub(crate) struct ContextInner {
    identity: Arc<ZitiIdentity>,
    config: ContextConfig,
    controller: Arc<dyn Controller>,
    dialer: Arc<dyn Dialer>,
    dns: Arc<dyn DnsManager>,
    /// Runtime all background tasks are spawned on
    handle: Handle,
    enabled: AtomicBool,
    /// Serializes enable/disable transitions
    enable_lock: Mutex<()>,
    status: watch::Sender<Status>,
    service_tx: broadcast::Sender<ServiceEvent>,
    services: Mutex<ServiceTable>,
    services_loaded: watch::Sender<bool>,
    /// Network session cache ((service id, type) -> session)
    sessions: DashMap<SessionKey, NetworkSession>,
    /// One create in flight per session key
    session_locks: DashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>,
    /// Channel pool (router URL -> channel)
    channels: DashMap<String, Arc<Channel>>,
    channel_dial_lock: tokio::sync::Mutex<()>,
    supervisor: Supervisor,
    api_identity: Mutex<Option<ApiIdentity>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.supervisor.cancel_all();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Runtime for one identity: login, service refresh, network sessions,
/// channel pool, and dialing.
///
/// Cloning is cheap; all clones share the same state. Background tasks only
/// hold weak references, so dropping the last clone tears the context down.
#[derive(Clone)]
pub struct ZitiContext {
    pub(crate) inner: Arc<ContextInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl ZitiContext {
    /// Create a disabled context. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::InvalidConfig`] for an unusable configuration and
    /// [`ZitiError::InvalidState`] outside a runtime.
    pub fn new(
        identity: Arc<ZitiIdentity>,
        controller: Arc<dyn Controller>,
        dialer: Arc<dyn Dialer>,
        dns: Arc<dyn DnsManager>,
        config: ContextConfig,
    ) -> Result<Self> {
        config.validate()?;
        let handle = Handle::try_current()
            .map_err(|_| ZitiError::invalid_state("context created outside a tokio runtime"))?;

        let (status, _) = watch::channel(Status::Disabled);
        let (service_tx, _) = broadcast::channel(config.event_buffer);
        let (services_loaded, _) = watch::channel(false);

        let inner = ContextInner {
            identity,
            config,
            controller,
            dialer,
            dns,
            handle,
            enabled: AtomicBool::new(false),
            enable_lock: Mutex::new(()),
            status,
            service_tx,
            services: Mutex::new(ServiceTable::new()),
            services_loaded,
            sessions: DashMap::new(),
            session_locks: DashMap::new(),
            channels: DashMap::new(),
            channel_dial_lock: tokio::sync::Mutex::new(()),
            supervisor: Supervisor::new(),
            api_identity: Mutex::new(None),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl ZitiContext {
    /// Identity name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.identity.name()
    }

    /// Controller URL.
    #[must_use]
    pub fn controller(&self) -> &str {
        self.inner.identity.controller()
    }

    /// The identity this context acts for.
    #[must_use]
    pub fn identity(&self) -> &Arc<ZitiIdentity> {
        &self.inner.identity
    }

    /// Context configuration.
    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// API identity reported by the controller at login.
    #[must_use]
    pub fn get_id(&self) -> Option<ApiIdentity> {
        lock(&self.inner.api_identity).clone()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.status.borrow().clone()
    }

    /// Whether the context is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Service by name.
    #[must_use]
    pub fn get_service(&self, name: &str) -> Option<Service> {
        lock(&self.inner.services).by_name(name).cloned()
    }

    /// Service by id.
    #[must_use]
    pub fn get_service_by_id(&self, id: &str) -> Option<Service> {
        lock(&self.inner.services).by_id(id).cloned()
    }

    /// Service intercepting `addr`.
    #[must_use]
    pub fn service_by_addr(&self, addr: &SocketAddr) -> Option<Service> {
        let table = lock(&self.inner.services);
        if let Some(service) = table.by_addr(addr) {
            return Some(service.clone());
        }
        let id = self.inner.dns.service_id_by_addr(addr)?;
        table.by_id(&id).cloned()
    }

    /// Service whose `dns` config matches `host:port`.
    #[must_use]
    pub fn service_by_host(&self, host: &str, port: u16) -> Option<Service> {
        lock(&self.inner.services).by_host(host, port).cloned()
    }

    /// Snapshot of all visible services, sorted by name.
    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        lock(&self.inner.services).services()
    }

    /// Cached network session for `(service_id, session_type)`.
    #[must_use]
    pub fn network_session(&self, service_id: &str, session_type: SessionType) -> Option<NetworkSession> {
        self.inner
            .sessions
            .get(&(service_id.to_string(), session_type))
            .map(|s| s.value().clone())
    }

    /// Number of cached network sessions.
    #[must_use]
    pub fn network_session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Router URLs with a pooled channel.
    #[must_use]
    pub fn channel_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.inner.channels.iter().map(|e| e.key().clone()).collect();
        addrs.sort();
        addrs
    }

    /// Pooled channel for a router URL.
    #[must_use]
    pub fn channel(&self, addr: &str) -> Option<Arc<Channel>> {
        self.inner.channels.get(addr).map(|c| c.value().clone())
    }

    /// Runtime the context's tasks run on.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Status
// ═══════════════════════════════════════════════════════════════════════════

impl ZitiContext {
    /// Conflated status stream: the current status, then every change.
    #[must_use]
    pub fn status_updates(&self) -> StatusUpdates {
        StatusUpdates::new(self.inner.status.subscribe())
    }

    /// Buffered service stream: `Available` for every known service, then
    /// every change.
    #[must_use]
    pub fn service_updates(&self) -> ServiceUpdates {
        // Subscribing under the table lock keeps the snapshot and the stream
        // gap-free and duplicate-free.
        let table = lock(&self.inner.services);
        let rx = self.inner.service_tx.subscribe();
        ServiceUpdates::new(table.services(), rx)
    }

    /// Move to `next` unless the context is disabled.
    fn update_status(&self, next: Status) {
        self.inner.status.send_if_modified(|current| {
            if *current == Status::Disabled || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn handle_not_authorized(&self, err: ZitiError) {
        tracing::warn!("Identity {} is not authorized: {}", self.name(), err);
        self.inner.identity.set_session_token(None);
        *lock(&self.inner.api_identity) = None;
        self.update_status(Status::NotAuthorized(err));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl ZitiContext {
    /// Enable or disable the context.
    ///
    /// `false -> true` moves to `Loading` and starts login followed by the
    /// service refresh loop. `true -> false` moves to `Disabled`, cancels all
    /// background tasks, closes every channel, and drops cached sessions.
    /// Setting the current value again does nothing.
    pub fn set_enabled(&self, enabled: bool) {
        let _guard = lock(&self.inner.enable_lock);
        if self.inner.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }

        if enabled {
            self.inner.status.send_replace(Status::Loading);
            self.start();
        } else {
            self.inner.status.send_replace(Status::Disabled);
            self.stop();
        }
    }

    fn start(&self) {
        let name = self.name().to_string();
        let mut updates = self.status_updates();
        self.inner
            .supervisor
            .spawn(&self.inner.handle, "status-logger", async move {
                while let Some(status) = updates.next().await {
                    tracing::info!("Context {} status: {}", name, status);
                }
            });

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .supervisor
            .spawn(&self.inner.handle, "refresh", async move {
                let logged_in = match weak.upgrade() {
                    Some(inner) => ZitiContext { inner }.login().await.is_ok(),
                    None => false,
                };
                if logged_in {
                    Self::refresh_loop(weak).await;
                }
            });
    }

    fn stop(&self) {
        self.inner.supervisor.cancel_all();

        // Collect first: closing fires on_close hooks that touch the pool.
        let channels: Vec<Arc<Channel>> =
            self.inner.channels.iter().map(|e| e.value().clone()).collect();
        self.inner.channels.clear();
        for channel in channels {
            channel.close();
        }

        self.inner.sessions.clear();
        self.inner.session_locks.clear();
        tracing::debug!("Context {} stopped", self.name());
    }

    /// Log in to the controller.
    ///
    /// Stores the session token and API identity and moves to `Active`. A
    /// rejection clears the token and moves to `NotAuthorized`; any other
    /// failure moves to `Unavailable`.
    ///
    /// # Errors
    ///
    /// Returns the controller error.
    pub async fn login(&self) -> Result<()> {
        tracing::debug!("Logging in {} at {}", self.name(), self.controller());
        match self.inner.controller.login().await {
            Ok(session) => {
                tracing::info!(
                    "Logged in as {} ({})",
                    session.identity.name,
                    session.identity.id
                );
                self.inner.identity.set_session_token(Some(session.token));
                *lock(&self.inner.api_identity) = Some(session.identity);
                self.update_status(Status::Active);
                Ok(())
            }
            Err(e) => {
                let err = ZitiError::from(e);
                if err.is_not_authorized() {
                    self.handle_not_authorized(err.clone());
                } else {
                    tracing::warn!("Login of {} failed: {}", self.name(), err);
                    self.update_status(Status::Unavailable(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// End the API session and forget the token.
    ///
    /// # Errors
    ///
    /// Returns the controller error; the local token is cleared regardless.
    pub async fn logout(&self) -> Result<()> {
        let result = self.inner.controller.logout().await.map_err(ZitiError::from);
        self.inner.identity.set_session_token(None);
        *lock(&self.inner.api_identity) = None;
        result
    }

    /// Disable the context, log out, shut the controller client down, and
    /// forget every service.
    pub async fn destroy(&self) {
        self.set_enabled(false);
        self.stop();

        if self.inner.identity.session_token().is_some() {
            if let Err(e) = self.logout().await {
                tracing::debug!("Logout of {} failed: {}", self.name(), e);
            }
        }
        self.inner.controller.shutdown().await;

        let table = std::mem::take(&mut *lock(&self.inner.services));
        for service in table.services() {
            self.inner.dns.unregister_service(&service);
        }
        tracing::info!("Context {} destroyed", self.name());
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Service Refresh
// ═══════════════════════════════════════════════════════════════════════════

impl ZitiContext {
    async fn refresh_loop(weak: Weak<ContextInner>) {
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let ctx = ZitiContext { inner };

            match ctx.refresh_services().await {
                Ok(()) => {}
                Err(e) if e.is_not_authorized() => return,
                Err(e) => {
                    tracing::warn!("Service refresh of {} failed: {}", ctx.name(), e);
                    ctx.update_status(Status::Impaired(e));
                    return;
                }
            }

            let interval = ctx.inner.config.refresh_interval;
            drop(ctx);
            tokio::time::sleep(interval).await;
        }
    }

    /// Fetch the service list once and apply it.
    ///
    /// # Errors
    ///
    /// Returns the controller error. A `NotAuthorized` answer also clears
    /// the session token and moves the context to `NotAuthorized`.
    pub async fn refresh_services(&self) -> Result<()> {
        let services = match self.inner.controller.get_services().await {
            Ok(services) => services,
            Err(e) => {
                let err = ZitiError::from(e);
                if err.is_not_authorized() {
                    self.handle_not_authorized(err.clone());
                }
                return Err(err);
            }
        };
        tracing::debug!("{} services visible to {}", services.len(), self.name());
        self.process_service_updates(services);
        Ok(())
    }

    /// Apply an authoritative service list.
    ///
    /// Removed services emit `Unavailable`, lose their sessions and their
    /// intercept address. New services emit `Available`; services whose
    /// attributes changed emit `Changed` and lose the session types they are
    /// no longer permitted. Applying the same list twice emits nothing.
    pub fn process_service_updates(&self, services: Vec<Service>) {
        let inner = &self.inner;
        let mut table = lock(&inner.services);

        let diff = table.replace_all(services);

        for (service, _) in diff.removed {
            tracing::debug!("Service {} is no longer available", service.name);
            inner.dns.unregister_service(&service);
            for session_type in SessionType::ALL {
                self.evict_session(&service.id, session_type);
            }
            self.emit(ServiceEvent::new(service, ServiceEventKind::Unavailable));
        }

        for service in diff.added {
            tracing::debug!("Service {} is available", service.name);
            self.emit(ServiceEvent::new(service, ServiceEventKind::Available));
        }

        for (previous, service) in diff.changed {
            for session_type in SessionType::ALL {
                if previous.permits(session_type) && !service.permits(session_type) {
                    tracing::debug!("Lost {} permission on {}", session_type, service.name);
                    self.evict_session(&service.id, session_type);
                }
            }
            self.emit(ServiceEvent::new(service, ServiceEventKind::Changed));
        }

        for service in table.services() {
            match inner.dns.register_service(&service) {
                Some(addr) => table.set_addr(&service.id, addr),
                None => {
                    table.clear_addr(&service.id);
                }
            }
        }
        drop(table);

        inner.services_loaded.send_if_modified(|loaded| {
            if *loaded {
                return false;
            }
            *loaded = true;
            true
        });
    }

    fn emit(&self, event: ServiceEvent) {
        // No subscribers is fine.
        let _ = self.inner.service_tx.send(event);
    }

    fn evict_session(&self, service_id: &str, session_type: SessionType) {
        let key = (service_id.to_string(), session_type);
        if self.inner.sessions.remove(&key).is_some() {
            tracing::trace!("Evicted {} session of {}", session_type, service_id);
        }
        self.inner.session_locks.remove(&key);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Barriers
// ═══════════════════════════════════════════════════════════════════════════

impl ZitiContext {
    /// Wait until the context leaves `Loading`.
    ///
    /// # Errors
    ///
    /// - The login error if the context is `NotAuthorized`
    /// - [`ZitiError::InvalidState`] for any other non-`Active` status
    /// - [`ZitiError::Timeout`] if login takes longer than `active_timeout`
    pub async fn check_active(&self) -> Result<()> {
        let mut rx = self.inner.status.subscribe();
        let waited = tokio::time::timeout(
            self.inner.config.active_timeout,
            rx.wait_for(|s| *s != Status::Loading),
        )
        .await;

        let status = match waited {
            Err(_) => return Err(ZitiError::timeout("waiting for context to become active")),
            Ok(Err(_)) => return Err(ZitiError::invalid_state("context is gone")),
            Ok(Ok(status)) => status.clone(),
        };

        match status {
            Status::Active => Ok(()),
            Status::NotAuthorized(e) => Err(e),
            other => Err(ZitiError::InvalidState(format!("context is {other}").into())),
        }
    }

    /// Wait for the first service list, at most `services_timeout`.
    ///
    /// A timeout is only logged; lookups then see whatever is known.
    pub async fn check_services_loaded(&self) {
        let mut rx = self.inner.services_loaded.subscribe();
        let waited = tokio::time::timeout(
            self.inner.config.services_timeout,
            rx.wait_for(|loaded| *loaded),
        )
        .await;
        if waited.is_err() {
            tracing::warn!("Timed out waiting for services of {}", self.name());
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Dialing
// ═══════════════════════════════════════════════════════════════════════════

impl ZitiContext {
    /// Open a virtual connection to the service named `service`.
    ///
    /// # Errors
    ///
    /// - Any [`check_active`](Self::check_active) error
    /// - [`ZitiError::ServiceNotAvailable`] for an unknown or undialable service
    /// - [`ZitiError::EdgeRouterUnavailable`] if no router can be reached
    /// - [`ZitiError::ConnectionRejected`] if the router refuses the connection
    pub async fn dial(&self, service: &str) -> Result<ZitiConnection> {
        self.check_active().await?;
        self.check_services_loaded().await;
        let service = self
            .get_service(service)
            .ok_or_else(|| ZitiError::service_not_available(service))?;
        self.dial_service(&service).await
    }

    /// Open a virtual connection to the service with id `service_id`.
    ///
    /// # Errors
    ///
    /// See [`dial`](Self::dial).
    pub async fn dial_by_id(&self, service_id: &str) -> Result<ZitiConnection> {
        self.check_active().await?;
        self.check_services_loaded().await;
        let service = self
            .get_service_by_id(service_id)
            .ok_or_else(|| ZitiError::service_not_available(service_id))?;
        self.dial_service(&service).await
    }

    /// Open a virtual connection to the service intercepting `host:port`.
    ///
    /// # Errors
    ///
    /// See [`dial`](Self::dial).
    pub async fn dial_host(&self, host: &str, port: u16) -> Result<ZitiConnection> {
        self.check_active().await?;
        self.check_services_loaded().await;
        let service = self
            .service_by_host(host, port)
            .ok_or_else(|| ZitiError::service_not_available(format!("{host}:{port}")))?;
        self.dial_service(&service).await
    }

    async fn dial_service(&self, service: &Service) -> Result<ZitiConnection> {
        let session = self.get_network_session(service, SessionType::Dial).await?;
        let channel = self.get_channel(&session).await?;
        ZitiConnection::connect(
            channel,
            &session,
            service,
            self.inner.config.inbound_queue,
            self.inner.config.connect_timeout,
        )
        .await
    }

    /// Cached network session for `service`, created on first use.
    ///
    /// At most one create is in flight per `(service, type)`. A session is
    /// only cached while the service is still visible and still permits
    /// `session_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::ServiceNotAvailable`] if the service does not
    /// permit `session_type`, and controller errors otherwise. A
    /// `NotAuthorized` answer also moves the context to `NotAuthorized`.
    pub async fn get_network_session(
        &self,
        service: &Service,
        session_type: SessionType,
    ) -> Result<NetworkSession> {
        if !service.permits(session_type) {
            return Err(ZitiError::service_not_available(format!(
                "{} does not permit {}",
                service.name, session_type
            )));
        }

        let key = (service.id.clone(), session_type);
        if let Some(session) = self.inner.sessions.get(&key).map(|s| s.value().clone()) {
            return Ok(session);
        }

        let create_lock = self
            .inner
            .session_locks
            .entry(key.clone())
            .or_default()
            .value()
            .clone();
        let _guard = create_lock.lock().await;

        if let Some(session) = self.inner.sessions.get(&key).map(|s| s.value().clone()) {
            return Ok(session);
        }

        let session = match self
            .inner
            .controller
            .create_net_session(service, session_type)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let err = ZitiError::from(e);
                if err.is_not_authorized() {
                    self.handle_not_authorized(err.clone());
                }
                return Err(err);
            }
        };
        tracing::debug!("Created {} session {} for {}", session_type, session.id, service.name);

        // Eviction happens under the table lock, so check and insert here too.
        let table = lock(&self.inner.services);
        if table
            .by_id(&service.id)
            .is_some_and(|s| s.permits(session_type))
        {
            self.inner.sessions.insert(key, session.clone());
        }
        drop(table);

        Ok(session)
    }

    fn pooled_channel(&self, urls: &[String]) -> Option<Arc<Channel>> {
        for url in urls {
            let Some(channel) = self.inner.channels.get(url).map(|c| c.value().clone()) else {
                continue;
            };
            if !channel.is_closed() {
                return Some(channel);
            }
            self.inner
                .channels
                .remove_if(url, |_, c| Arc::ptr_eq(c, &channel));
        }
        None
    }

    /// Channel to one of the session's edge routers.
    ///
    /// Reuses an open pooled channel if any router URL has one; otherwise
    /// dials the URLs in order and pools the first that completes the hello.
    /// The pool stays locked across dial and insert.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::EdgeRouterUnavailable`] if every router fails.
    pub async fn get_channel(&self, session: &NetworkSession) -> Result<Arc<Channel>> {
        let urls: Vec<String> = session.tls_urls().map(str::to_owned).collect();
        if urls.is_empty() {
            return Err(ZitiError::edge_router_unavailable(format!(
                "session {} lists no edge routers",
                session.id
            )));
        }

        if let Some(channel) = self.pooled_channel(&urls) {
            return Ok(channel);
        }

        let _guard = self.inner.channel_dial_lock.lock().await;
        if let Some(channel) = self.pooled_channel(&urls) {
            return Ok(channel);
        }

        let channel_config = self.inner.config.channel();
        let mut last_error = None;
        for url in &urls {
            match Channel::dial(
                self.inner.dialer.as_ref(),
                url,
                &self.inner.identity,
                &channel_config,
            )
            .await
            {
                Ok(channel) => {
                    self.pool_channel(url, &channel);
                    return Ok(channel);
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to edge router {}: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(ZitiError::edge_router_unavailable(format!(
            "no edge router reachable for session {}: {}",
            session.id, cause
        )))
    }

    fn pool_channel(&self, url: &str, channel: &Arc<Channel>) {
        self.inner.channels.insert(url.to_string(), channel.clone());

        let weak = Arc::downgrade(&self.inner);
        let key = url.to_string();
        let id = channel.id();
        channel.on_close(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.channels.remove_if(&key, |_, c| c.id() == id).is_some() {
                    tracing::debug!("Channel {} to {} left the pool", id, key);
                }
            }
        });
    }
}

impl std::fmt::Debug for ZitiContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZitiContext")
            .field("name", &self.name())
            .field("controller", &self.controller())
            .field("status", &self.status())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
