//! Context configuration

use std::time::Duration;

use ziti_transport::TransportConfig;

use crate::channel::ChannelConfig;
use crate::{Result, ZitiError};

/// Ziti context configuration
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Delay between service list refreshes
    pub refresh_interval: Duration,

    /// How long `dial` waits for the first service list before giving up
    /// on the barrier (a warning, not an error)
    pub services_timeout: Duration,

    /// How long `dial` waits for the context to become active
    pub active_timeout: Duration,

    /// Bound on the channel hello exchange
    pub hello_timeout: Duration,

    /// Bound on the CONNECT exchange and on TCP connect to routers
    pub connect_timeout: Duration,

    /// Per-channel send queue depth
    pub send_queue: usize,

    /// Per-connection inbound frame queue depth
    pub inbound_queue: usize,

    /// Service event buffer per subscriber
    pub event_buffer: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5 * 60),
            services_timeout: Duration::from_secs(30),
            active_timeout: Duration::from_secs(30),
            hello_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            send_queue: 16,
            inbound_queue: 64,
            event_buffer: 256,
        }
    }
}

impl ContextConfig {
    /// Check every field is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ZitiError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("refresh_interval", self.refresh_interval),
            ("services_timeout", self.services_timeout),
            ("active_timeout", self.active_timeout),
            ("hello_timeout", self.hello_timeout),
            ("connect_timeout", self.connect_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ZitiError::InvalidConfig(format!("{name} must be non-zero").into()));
            }
        }

        let sizes = [
            ("send_queue", self.send_queue),
            ("inbound_queue", self.inbound_queue),
            ("event_buffer", self.event_buffer),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ZitiError::InvalidConfig(format!("{name} must be non-zero").into()));
            }
        }
        Ok(())
    }

    /// Channel settings derived from this configuration.
    #[must_use]
    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            hello_timeout: self.hello_timeout,
            send_queue: self.send_queue,
        }
    }

    /// Router transport settings derived from this configuration.
    #[must_use]
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout,
            ..TransportConfig::default()
        }
    }
}
