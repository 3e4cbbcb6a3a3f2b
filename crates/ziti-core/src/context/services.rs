//! Service table.
//!
//! Four indexes over the services visible to a context. Every mutation goes
//! through [`ServiceTable`] so the indexes stay mutually consistent:
//!
//! - `by_id[s.id] == s` and `by_name[s.name] == s.id` for every service
//! - `addr_by_id[by_addr[addr]] == addr` for every intercept address

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use ziti_controller::Service;

/// What [`ServiceTable::replace_all`] changed.
#[derive(Debug, Default)]
pub struct ServiceDiff {
    /// Services no longer listed, with their former intercept address
    pub removed: Vec<(Service, Option<SocketAddr>)>,
    /// Services seen for the first time
    pub added: Vec<Service>,
    /// `(previous, current)` for services whose attributes changed
    pub changed: Vec<(Service, Service)>,
}

/// Keep the last entry for each key.
fn last_by<K, F>(services: Vec<Service>, key: F) -> Vec<Service>
where
    K: Eq + std::hash::Hash,
    F: Fn(&Service) -> K,
{
    let mut last = HashMap::new();
    for (i, service) in services.iter().enumerate() {
        if let Some(earlier) = last.insert(key(service), i) {
            tracing::warn!(
                "Service list repeats {} ({}); keeping the later entry",
                services[earlier].name,
                services[earlier].id
            );
        }
    }
    services
        .into_iter()
        .enumerate()
        .filter(|(i, s)| last.get(&key(s)) == Some(i))
        .map(|(_, s)| s)
        .collect()
}

/// Services known to one context.
#[derive(Debug, Default)]
pub struct ServiceTable {
    by_id: HashMap<String, Service>,
    by_name: HashMap<String, String>,
    by_addr: HashMap<SocketAddr, String>,
    addr_by_id: HashMap<String, SocketAddr>,
}

impl ServiceTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service; returns the previous version.
    pub fn upsert(&mut self, service: Service) -> Option<Service> {
        let previous = self.by_id.insert(service.id.clone(), service.clone());
        if let Some(old) = &previous {
            if old.name != service.name && self.by_name.get(&old.name) == Some(&old.id) {
                self.by_name.remove(&old.name);
            }
        }
        if let Some(displaced) = self.by_name.insert(service.name.clone(), service.id.clone()) {
            if displaced != service.id {
                // A different id now owns this name; the controller list is
                // authoritative, so drop the stale entry entirely.
                tracing::warn!("Service name {} moved from {} to {}", service.name, displaced, service.id);
                self.remove(&displaced);
                self.by_name.insert(service.name.clone(), service.id.clone());
            }
        }
        previous
    }

    /// Make `services` the full contents of the table.
    ///
    /// Names are reassigned only after every listed service is in place, so
    /// services that trade names are reported as changed rather than lost.
    /// When the list repeats an id or a name, the later entry wins.
    pub fn replace_all(&mut self, services: Vec<Service>) -> ServiceDiff {
        let services = last_by(services, |s| s.id.clone());
        let services = last_by(services, |s| s.name.clone());
        let listed: HashSet<&str> = services.iter().map(|s| s.id.as_str()).collect();

        let mut diff = ServiceDiff::default();
        for id in self.ids() {
            if !listed.contains(id.as_str()) {
                if let Some(removed) = self.remove(&id) {
                    diff.removed.push(removed);
                }
            }
        }

        // Every remaining id is listed, so the name index is rebuilt whole.
        self.by_name.clear();
        for service in services {
            self.by_name.insert(service.name.clone(), service.id.clone());
            match self.by_id.insert(service.id.clone(), service.clone()) {
                None => diff.added.push(service),
                Some(previous) if previous != service => diff.changed.push((previous, service)),
                Some(_) => {}
            }
        }
        diff
    }

    /// Remove a service; returns it with its intercept address.
    pub fn remove(&mut self, id: &str) -> Option<(Service, Option<SocketAddr>)> {
        let service = self.by_id.remove(id)?;
        if self.by_name.get(&service.name).map(String::as_str) == Some(id) {
            self.by_name.remove(&service.name);
        }
        let addr = self.clear_addr(id);
        Some((service, addr))
    }

    /// Bind `addr` to service `id`, replacing any previous binding of
    /// either side.
    pub fn set_addr(&mut self, id: &str, addr: SocketAddr) {
        if !self.by_id.contains_key(id) || self.addr_by_id.get(id) == Some(&addr) {
            return;
        }
        self.clear_addr(id);
        if let Some(other) = self.by_addr.insert(addr, id.to_string()) {
            self.addr_by_id.remove(&other);
        }
        self.addr_by_id.insert(id.to_string(), addr);
    }

    /// Drop the intercept address of service `id`.
    pub fn clear_addr(&mut self, id: &str) -> Option<SocketAddr> {
        let addr = self.addr_by_id.remove(id)?;
        if self.by_addr.get(&addr).map(String::as_str) == Some(id) {
            self.by_addr.remove(&addr);
        }
        Some(addr)
    }

    /// Service by id.
    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<&Service> {
        self.by_id.get(id)
    }

    /// Service by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Service> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// Service by intercept address.
    #[must_use]
    pub fn by_addr(&self, addr: &SocketAddr) -> Option<&Service> {
        self.by_addr.get(addr).and_then(|id| self.by_id.get(id))
    }

    /// Service whose `dns` config is `host:port`.
    #[must_use]
    pub fn by_host(&self, host: &str, port: u16) -> Option<&Service> {
        self.by_id.values().find(|s| {
            s.dns
                .as_ref()
                .is_some_and(|d| d.port == port && d.hostname.eq_ignore_ascii_case(host))
        })
    }

    /// Intercept address of service `id`.
    #[must_use]
    pub fn addr_of(&self, id: &str) -> Option<SocketAddr> {
        self.addr_by_id.get(id).copied()
    }

    /// Ids of all services.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.by_id.keys().cloned().collect()
    }

    /// All services, sorted by name.
    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        let mut all: Vec<Service> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Whether all four indexes agree.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let names_ok = self.by_id.values().all(|s| self.by_name.get(&s.name) == Some(&s.id))
            && self.by_name.len() == self.by_id.len();
        let addrs_ok = self
            .by_addr
            .iter()
            .all(|(addr, id)| self.by_id.contains_key(id) && self.addr_by_id.get(id) == Some(addr))
            && self.by_addr.len() == self.addr_by_id.len();
        names_ok && addrs_ok
    }
}
