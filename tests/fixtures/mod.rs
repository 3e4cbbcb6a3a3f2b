//! Test doubles for the controller, the edge router and the router dialer.
//!
//! # Example
//!
//! ```no_run
//! use ziti_integration_tests::fixtures::{FakeDialer, FakeEdgeRouter, StubController};
//!
//! # async fn demo() {
//! let router = FakeEdgeRouter::new();
//! let dialer = FakeDialer::new(router.clone());
//! let controller = StubController::new(&["tls://er1:3022"]);
//! # }
//! ```

mod controller;
mod router;

pub use controller::{StubController, service};
pub use router::{FakeDialer, FakeEdgeRouter};

use std::sync::Arc;
use std::time::Duration;

use ziti_core::{ContextConfig, LoopbackDnsManager, ZitiContext, ZitiIdentity};

/// Identity name used by every fixture context.
pub const IDENTITY: &str = "test-identity";

/// Context settings with short barriers; refresh only on demand unless
/// `refresh_interval` is overridden.
pub fn test_config() -> ContextConfig {
    ContextConfig {
        refresh_interval: Duration::from_secs(3600),
        services_timeout: Duration::from_secs(2),
        active_timeout: Duration::from_secs(2),
        hello_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ..ContextConfig::default()
    }
}

/// A disabled context wired to the given doubles.
pub fn context_with(
    controller: Arc<StubController>,
    dialer: Arc<FakeDialer>,
    dns: Arc<LoopbackDnsManager>,
    config: ContextConfig,
) -> ZitiContext {
    ZitiContext::new(
        Arc::new(ZitiIdentity::new(IDENTITY, "https://ctrl.test:1280")),
        controller,
        dialer,
        dns,
        config,
    )
    .expect("context")
}

/// Await `fut`, failing the test after five seconds.
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
