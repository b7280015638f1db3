//! Protocol packets

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, DEFAULT_PROTOCOL_VERSION};

/// Service (channel) types carried inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ServiceType {
    /// Session management, heartbeats and security handshakes
    Control = 0x00,
    /// Remote procedure calls
    Rpc = 0x07,
    /// Raw PCM audio
    Pcm = 0x0A,
    /// Navigation video
    Nav = 0x0B,
    /// Bulk data (files, images)
    BulkData = 0x0F,
}

impl ServiceType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_control(self) -> bool {
        self == ServiceType::Control
    }
}

impl TryFrom<u8> for ServiceType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ServiceType::Control),
            0x07 => Ok(ServiceType::Rpc),
            0x0A => Ok(ServiceType::Pcm),
            0x0B => Ok(ServiceType::Nav),
            0x0F => Ok(ServiceType::BulkData),
            other => Err(Error::UnknownServiceType(other)),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceType::Control => "CONTROL",
            ServiceType::Rpc => "RPC",
            ServiceType::Pcm => "PCM",
            ServiceType::Nav => "NAV",
            ServiceType::BulkData => "BULK_DATA",
        };
        f.write_str(name)
    }
}

/// Physical transport families a connection can run over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Bluetooth,
    Usb,
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Usb => "usb",
            TransportKind::Tcp => "tcp",
        };
        f.write_str(name)
    }
}

/// A framed protocol packet.
///
/// Packets are immutable once built. The function id only exists on the wire
/// for [`ServiceType::Control`] packets; [`Packet::function_id`] returns `None`
/// for every other service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    version: u8,
    session_id: u8,
    service_type: ServiceType,
    function_id: u8,
    payload: Bytes,
}

impl Packet {
    /// Create a packet for a non-control service
    pub fn new(service_type: ServiceType, session_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            version: DEFAULT_PROTOCOL_VERSION,
            session_id,
            service_type,
            function_id: 0,
            payload: payload.into(),
        }
    }

    /// Create a CONTROL packet with a function id
    pub fn control(function_id: u8, session_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            version: DEFAULT_PROTOCOL_VERSION,
            session_id,
            service_type: ServiceType::Control,
            function_id,
            payload: payload.into(),
        }
    }

    /// Set the protocol version
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn function_id(&self) -> Option<u8> {
        self.service_type.is_control().then_some(self.function_id)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size of the unescaped header on the wire
    pub fn header_len(&self) -> usize {
        // version + session + service + [function] + length(u32)
        if self.service_type.is_control() {
            8
        } else {
            7
        }
    }
}
