//! carlink Sessions
//!
//! Logical sessions on top of shared physical connections:
//! - [`ConnectionRegistry`]: hands out connections, sharing one channel
//!   between sessions of the same transport kind
//! - [`Connection`]: one transport driver plus packet dispatch to the
//!   sessions registered on it
//! - [`Session`]: service lifecycle, encrypted negotiation and heartbeats

pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod registry;
pub mod security;
pub mod session;

pub use config::{HeartbeatConfig, SessionConfig};
pub use connection::Connection;
pub use error::{Result, SessionError};
pub use heartbeat::{HeartbeatHandler, HeartbeatMonitor};
pub use listener::{ServiceListener, SessionListener};
pub use registry::ConnectionRegistry;
pub use security::{HandshakeProvider, HANDSHAKE_BUFFER_SIZE};
pub use session::{create_session, Session};
