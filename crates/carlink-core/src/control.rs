//! CONTROL service payloads
//!
//! Service lifecycle requests and heartbeats travel as CONTROL packets whose
//! function id selects the operation. Start and end requests share one fixed
//! layout:
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ Byte 0:    Service type                    │
//! │ Byte 1:    Flags ([0] encrypted)           │
//! │ Byte 2-5:  Correlation id (u32 big-endian) │
//! │ Byte 6-9:  Hash id (u32 big-endian)        │
//! └────────────────────────────────────────────┘
//! ```
//!
//! Security handshake payloads (function [`ControlFunction::Security`]) are
//! prefixed by a 12 byte [`SecurityQueryHeader`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, ServiceType};

/// CONTROL function ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlFunction {
    Security = 0x01,
    StartService = 0x10,
    StartServiceAck = 0x11,
    StartServiceNack = 0x12,
    EndService = 0x13,
    EndServiceAck = 0x14,
    EndServiceNack = 0x15,
    Heartbeat = 0x20,
    HeartbeatAck = 0x21,
}

impl ControlFunction {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ControlFunction {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ControlFunction::Security),
            0x10 => Ok(ControlFunction::StartService),
            0x11 => Ok(ControlFunction::StartServiceAck),
            0x12 => Ok(ControlFunction::StartServiceNack),
            0x13 => Ok(ControlFunction::EndService),
            0x14 => Ok(ControlFunction::EndServiceAck),
            0x15 => Ok(ControlFunction::EndServiceNack),
            0x20 => Ok(ControlFunction::Heartbeat),
            0x21 => Ok(ControlFunction::HeartbeatAck),
            other => Err(Error::UnknownControlFunction(other)),
        }
    }
}

/// Body of start/end requests and their (N)ACKs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceControl {
    pub service: ServiceType,
    pub encrypted: bool,
    pub correlation_id: u32,
    pub hash_id: u32,
}

impl ServiceControl {
    pub const SIZE: usize = 10;

    pub fn new(service: ServiceType, correlation_id: u32) -> Self {
        Self {
            service,
            encrypted: false,
            correlation_id,
            hash_id: 0,
        }
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_hash_id(mut self, hash_id: u32) -> Self {
        self.hash_id = hash_id;
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(self.service.as_u8());
        buf.put_u8(u8::from(self.encrypted));
        buf.put_u32(self.correlation_id);
        buf.put_u32(self.hash_id);
        buf.freeze()
    }

    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                needed: Self::SIZE,
                have: buf.remaining(),
            });
        }

        let service = ServiceType::try_from(buf.get_u8())?;
        let encrypted = buf.get_u8() & 0x01 != 0;
        let correlation_id = buf.get_u32();
        let hash_id = buf.get_u32();

        Ok(Self {
            service,
            encrypted,
            correlation_id,
            hash_id,
        })
    }
}

/// Security query types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryType {
    Request = 0x00,
    Response = 0x10,
    Notification = 0x20,
}

impl QueryType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(QueryType::Request),
            0x10 => Some(QueryType::Response),
            0x20 => Some(QueryType::Notification),
            _ => None,
        }
    }
}

/// Fixed header in front of every security handshake payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityQueryHeader {
    pub query_type: QueryType,
    /// 24-bit query id
    pub query_id: u32,
    pub sequence: u32,
    pub json_size: u32,
}

impl SecurityQueryHeader {
    pub const SIZE: usize = 12;

    /// Query id for raw handshake bytes
    pub const SEND_HANDSHAKE_DATA: u32 = 0x00_0001;

    /// Header for outbound handshake data
    pub fn handshake(sequence: u32) -> Self {
        Self {
            query_type: QueryType::Notification,
            query_id: Self::SEND_HANDSHAKE_DATA,
            sequence,
            json_size: 0,
        }
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.query_type as u8);
        let id = self.query_id & 0x00FF_FFFF;
        buf.put_u8((id >> 16) as u8);
        buf.put_u16(id as u16);
        buf.put_u32(self.sequence);
        buf.put_u32(self.json_size);
    }

    /// Parse the header and return it together with the bytes that follow
    pub fn split(payload: &Bytes) -> Result<(Self, Bytes)> {
        if payload.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                needed: Self::SIZE,
                have: payload.len(),
            });
        }

        let mut head = &payload[..Self::SIZE];
        // Unknown query types are kept as notifications; the payload is what matters
        let query_type = QueryType::from_u8(head.get_u8()).unwrap_or(QueryType::Notification);
        let hi = head.get_u8() as u32;
        let lo = head.get_u16() as u32;
        let sequence = head.get_u32();
        let json_size = head.get_u32();

        let header = Self {
            query_type,
            query_id: (hi << 16) | lo,
            sequence,
            json_size,
        };
        Ok((header, payload.slice(Self::SIZE..)))
    }

    /// Prefix `data` with this header
    pub fn wrap(&self, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE + data.len());
        self.write_to(&mut buf);
        buf.extend_from_slice(data);
        buf.freeze()
    }
}
