//! Intercept address management.
//!
//! Services may advertise a `dns` hostname and port. The [`DnsManager`]
//! decides which socket address stands for each such service so that
//! `connect(addr)` callers can be routed to the right service.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use ziti_controller::Service;

/// Maps services to intercept addresses.
pub trait DnsManager: Send + Sync {
    /// Register `service`, returning its intercept address if it has one.
    fn register_service(&self, service: &Service) -> Option<SocketAddr>;

    /// Forget `service`.
    fn unregister_service(&self, service: &Service);

    /// Service id bound to `addr`, if any.
    fn service_id_by_addr(&self, addr: &SocketAddr) -> Option<String>;

    /// Address assigned to `hostname`, if any.
    fn resolve(&self, hostname: &str) -> Option<IpAddr>;
}

#[derive(Debug, Default)]
struct Tables {
    hosts: HashMap<String, IpAddr>,
    by_addr: HashMap<SocketAddr, String>,
    by_id: HashMap<String, SocketAddr>,
    next: u16,
}

/// In-memory DNS manager handing out `127.1.x.y` addresses.
///
/// Hostnames that are already IP literals keep their address. A hostname
/// keeps its address for the lifetime of the manager, even after all of its
/// services are gone.
#[derive(Debug, Default)]
pub struct LoopbackDnsManager {
    tables: Mutex<Tables>,
}

impl LoopbackDnsManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Tables {
    fn address_for(&mut self, hostname: &str) -> Option<IpAddr> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Some(ip);
        }
        let key = hostname.to_ascii_lowercase();
        if let Some(ip) = self.hosts.get(&key) {
            return Some(*ip);
        }
        if self.next == u16::MAX {
            tracing::warn!("Loopback address pool exhausted, not assigning {}", hostname);
            return None;
        }
        self.next += 1;
        let [x, y] = self.next.to_be_bytes();
        let ip = IpAddr::V4(Ipv4Addr::new(127, 1, x, y));
        self.hosts.insert(key, ip);
        Some(ip)
    }

    fn remove_service(&mut self, id: &str) {
        if let Some(addr) = self.by_id.remove(id) {
            self.by_addr.remove(&addr);
        }
    }
}

impl DnsManager for LoopbackDnsManager {
    fn register_service(&self, service: &Service) -> Option<SocketAddr> {
        let mut tables = self.tables();
        let Some(dns) = service.dns.as_ref() else {
            tables.remove_service(&service.id);
            return None;
        };

        let addr = SocketAddr::new(tables.address_for(&dns.hostname)?, dns.port);
        if tables.by_id.get(&service.id) == Some(&addr) {
            return Some(addr);
        }

        tables.remove_service(&service.id);
        if let Some(previous) = tables.by_addr.insert(addr, service.id.clone()) {
            tracing::warn!("{} now intercepts {}, replacing service {}", service.name, addr, previous);
            tables.by_id.remove(&previous);
        }
        tables.by_id.insert(service.id.clone(), addr);
        tracing::debug!("Assigned {} to service {}", addr, service.name);
        Some(addr)
    }

    fn unregister_service(&self, service: &Service) {
        self.tables().remove_service(&service.id);
    }

    fn service_id_by_addr(&self, addr: &SocketAddr) -> Option<String> {
        self.tables().by_addr.get(addr).cloned()
    }

    fn resolve(&self, hostname: &str) -> Option<IpAddr> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Some(ip);
        }
        self.tables().hosts.get(&hostname.to_ascii_lowercase()).copied()
    }
}
