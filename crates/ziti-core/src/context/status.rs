//! Context status and service events.

use tokio::sync::{broadcast, watch};
use ziti_controller::Service;

use crate::ZitiError;

/// Health of a Ziti context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Not enabled; only an explicit enable leaves this state
    Disabled,
    /// Enabled and logging in
    Loading,
    /// Logged in and usable
    Active,
    /// Logged in, but service refresh failed
    Impaired(ZitiError),
    /// Controller rejected the identity or its session
    NotAuthorized(ZitiError),
    /// Controller could not be reached at login
    Unavailable(ZitiError),
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Loading => f.write_str("Loading"),
            Self::Active => f.write_str("Active"),
            Self::Impaired(e) => write!(f, "Impaired({e})"),
            Self::NotAuthorized(e) => write!(f, "NotAuthorized({e})"),
            Self::Unavailable(e) => write!(f, "Unavailable({e})"),
        }
    }
}

/// What happened to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEventKind {
    /// Newly visible
    Available,
    /// No longer visible
    Unavailable,
    /// Still visible with different attributes
    Changed,
}

/// A change to the set of services visible to a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    /// The service (last known attributes for `Unavailable`)
    pub service: Service,
    /// What happened
    pub kind: ServiceEventKind,
}

impl ServiceEvent {
    pub(crate) fn new(service: Service, kind: ServiceEventKind) -> Self {
        Self { service, kind }
    }
}

/// Conflated status stream: the current status, then every change.
///
/// A slow subscriber only sees the latest status.
#[derive(Debug)]
pub struct StatusUpdates {
    rx: watch::Receiver<Status>,
    started: bool,
}

impl StatusUpdates {
    pub(crate) fn new(rx: watch::Receiver<Status>) -> Self {
        Self { rx, started: false }
    }

    /// Next status; `None` once the context is gone.
    pub async fn next(&mut self) -> Option<Status> {
        if !self.started {
            self.started = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Latest status without waiting.
    #[must_use]
    pub fn current(&self) -> Status {
        self.rx.borrow().clone()
    }
}

/// Buffered service stream: one `Available` per known service at
/// subscription time, then every change in emission order.
#[derive(Debug)]
pub struct ServiceUpdates {
    initial: std::collections::VecDeque<ServiceEvent>,
    rx: broadcast::Receiver<ServiceEvent>,
}

impl ServiceUpdates {
    pub(crate) fn new(
        initial: impl IntoIterator<Item = Service>,
        rx: broadcast::Receiver<ServiceEvent>,
    ) -> Self {
        Self {
            initial: initial
                .into_iter()
                .map(|s| ServiceEvent::new(s, ServiceEventKind::Available))
                .collect(),
            rx,
        }
    }

    /// Next event; `None` once the context is gone.
    pub async fn next(&mut self) -> Option<ServiceEvent> {
        if let Some(event) = self.initial.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Service event subscriber lagged, {} events lost", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready.
    pub fn try_next(&mut self) -> Option<ServiceEvent> {
        if let Some(event) = self.initial.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!("Service event subscriber lagged, {} events lost", missed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_updates_conflate() {
        let (tx, rx) = watch::channel(Status::Disabled);
        let mut updates = StatusUpdates::new(rx);
        assert_eq!(updates.next().await, Some(Status::Disabled));

        tx.send_replace(Status::Loading);
        tx.send_replace(Status::Active);
        assert_eq!(updates.next().await, Some(Status::Active));

        drop(tx);
        assert_eq!(updates.next().await, None);
    }

    #[tokio::test]
    async fn test_service_updates_initial_then_live() {
        let svc = |id: &str| Service {
            id: id.into(),
            name: id.into(),
            dns: None,
            permissions: Default::default(),
        };
        let (tx, rx) = broadcast::channel(8);
        let mut updates = ServiceUpdates::new(vec![svc("a")], rx);
        tx.send(ServiceEvent::new(svc("b"), ServiceEventKind::Available)).unwrap();
        tx.send(ServiceEvent::new(svc("a"), ServiceEventKind::Unavailable)).unwrap();

        let first = updates.next().await.unwrap();
        assert_eq!((first.service.id.as_str(), first.kind), ("a", ServiceEventKind::Available));
        let second = updates.next().await.unwrap();
        assert_eq!(second.service.id, "b");
        let third = updates.try_next().unwrap();
        assert_eq!(third.kind, ServiceEventKind::Unavailable);
        assert!(updates.try_next().is_none());
    }

    #[test]
    fn test_status_display() {
        let s = Status::NotAuthorized(ZitiError::NotAuthorized("expired".into()));
        assert_eq!(s.to_string(), "NotAuthorized(Not authorized: expired)");
    }
}
