//! carlink Core
//!
//! Packet model and wire primitives shared by every carlink crate.
//!
//! This crate provides:
//! - Protocol packets ([`Packet`], [`ServiceType`])
//! - SLIP framing, byte at a time ([`FrameDecoder`], [`framing::encode`])
//! - CONTROL service payloads ([`ControlFunction`], [`ServiceControl`], [`SecurityQueryHeader`])

pub mod control;
pub mod error;
pub mod framing;
pub mod packet;

pub use control::{ControlFunction, QueryType, SecurityQueryHeader, ServiceControl};
pub use error::{Error, Result};
pub use framing::{DecodeState, FrameDecoder, FramingConfig};
pub use packet::{Packet, ServiceType, TransportKind};

/// Highest protocol version this stack speaks
pub const MAX_PROTOCOL_VERSION: u8 = 5;

/// Protocol version used when a session does not ask for one
pub const DEFAULT_PROTOCOL_VERSION: u8 = 5;

/// Head-unit address on the SLIP-over-USB network
pub const DEFAULT_PEER_ADDR: &str = "192.168.3.2";

/// TCP port the head unit listens on behind the SLIP bridge
pub const DEFAULT_TCP_PORT: u16 = 15324;
