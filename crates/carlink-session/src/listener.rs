//! Session and service listeners

use carlink_core::{Packet, ServiceType};

/// Application-level session events. Every method has an empty default.
#[allow(unused_variables)]
pub trait SessionListener: Send + Sync {
    fn on_service_started(&self, session_id: u8, service: ServiceType, encrypted: bool) {}

    fn on_service_ended(&self, session_id: u8, service: ServiceType) {}

    /// Start or end request rejected by the peer
    fn on_service_nacked(&self, session_id: u8, service: ServiceType, reason: &str) {}

    /// Non-CONTROL packet for this session
    fn on_message(&self, packet: &Packet) {}

    fn on_heartbeat_timeout(&self, session_id: u8) {}

    fn on_transport_disconnected(&self, reason: Option<&str>) {}

    /// Connect attempts exhausted
    fn on_transport_error(&self, reason: &str) {}
}

/// Per-service events
pub trait ServiceListener: Send + Sync {
    fn on_service_started(&self, session_id: u8, service: ServiceType, encrypted: bool);

    fn on_service_ended(&self, session_id: u8, service: ServiceType);

    fn on_service_error(&self, session_id: u8, service: ServiceType, reason: &str);
}
