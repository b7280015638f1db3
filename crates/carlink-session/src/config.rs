//! Session configuration

use carlink_core::DEFAULT_PROTOCOL_VERSION;
use carlink_transport::TransportConfig;
use std::sync::Arc;
use std::time::Duration;

use crate::security::HandshakeProvider;

/// Heartbeat monitor settings.
///
/// Monitors are optional; a disabled config never sends heartbeats and never
/// times a session out.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Time between outgoing HEARTBEAT packets
    pub interval: Duration,
    /// Silence from the peer after which the session is closed
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
        }
    }
}

impl HeartbeatConfig {
    /// Enabled monitors with the given timings
    pub fn enabled(interval: Duration, timeout: Duration) -> Self {
        Self {
            enabled: true,
            interval,
            timeout,
        }
    }
}

/// Everything a session needs besides its listener and registry
#[derive(Clone)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    pub heartbeat: HeartbeatConfig,
    /// Provider for encrypted services, if the application has one
    pub security: Option<Arc<dyn HandshakeProvider>>,
    /// Protocol version used before the peer answers
    pub version: u8,
}

impl SessionConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            heartbeat: HeartbeatConfig::default(),
            security: None,
            version: DEFAULT_PROTOCOL_VERSION,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_security(mut self, provider: Arc<dyn HandshakeProvider>) -> Self {
        self.security = Some(provider);
        self
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("transport", &self.transport)
            .field("heartbeat", &self.heartbeat)
            .field("security", &self.security.is_some())
            .field("version", &self.version)
            .finish()
    }
}
