//! SLIP framing
//!
//! carlink frame format:
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ END (0xC0)                                                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Byte 0:     Protocol version (1..=5)                            │
//! │ Byte 1:     Session id                                          │
//! │ Byte 2:     Service type                                        │
//! │ [CONTROL]   Function id                                         │
//! │ 4 bytes:    Payload length (uint32 big-endian)                  │
//! │ Payload                                                         │
//! │ 2 bytes:    CRC-16/CCITT over everything above (big-endian)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ END (0xC0)                                                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inside a frame 0xC0 is sent as `ESC ESC_END` and 0xDB as `ESC ESC_ESC`.
//! The decoder consumes one byte at a time and silently drops anything that
//! does not form a valid frame.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Packet, Result, ServiceType, MAX_PROTOCOL_VERSION};

/// Frame delimiter
pub const END: u8 = 0xC0;
/// Escape marker
pub const ESC: u8 = 0xDB;
/// Escaped END
pub const ESC_END: u8 = 0xDC;
/// Escaped ESC
pub const ESC_ESC: u8 = 0xDD;

/// Default payload limit per packet
pub const DEFAULT_MAX_PAYLOAD: usize = 128 * 1024;

/// Framing configuration
#[derive(Debug, Clone)]
pub struct FramingConfig {
    /// Largest payload accepted by the decoder
    pub max_payload: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Where the decoder is within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Between frames, waiting for END
    Idle,
    Version,
    SessionId,
    ServiceType,
    FunctionId,
    Length,
    Payload,
    Checksum,
    /// Packet complete, waiting for the closing END
    Trailer,
}

/// Byte-at-a-time packet decoder.
///
/// Not synchronized; exactly one reader should drive it. Memory held is
/// bounded by the packet currently being assembled.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    escaping: bool,
    max_payload: usize,
    crc: u16,
    version: u8,
    session_id: u8,
    service_type: ServiceType,
    function_id: u8,
    length: u32,
    field_bytes: u8,
    checksum: u16,
    payload: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_config(FramingConfig::default())
    }

    pub fn with_config(config: FramingConfig) -> Self {
        Self {
            state: DecodeState::Idle,
            escaping: false,
            max_payload: config.max_payload,
            crc: CRC_INIT,
            version: 0,
            session_id: 0,
            service_type: ServiceType::Control,
            function_id: 0,
            length: 0,
            field_bytes: 0,
            checksum: 0,
            payload: BytesMut::new(),
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Drop any partial frame and go back to [`DecodeState::Idle`]
    pub fn reset(&mut self) {
        self.clear_frame();
        self.state = DecodeState::Idle;
    }

    /// Feed one byte. Returns a packet when this byte completes one.
    pub fn push(&mut self, byte: u8) -> Option<Packet> {
        if byte == END {
            return match self.state {
                DecodeState::Trailer => {
                    let packet = self.take_packet();
                    self.reset();
                    Some(packet)
                }
                // Opening END, or an END that cuts a partial frame short
                _ => {
                    self.clear_frame();
                    self.state = DecodeState::Version;
                    None
                }
            };
        }

        if self.state == DecodeState::Idle {
            return None;
        }

        let byte = if self.escaping {
            self.escaping = false;
            match byte {
                ESC_END => END,
                ESC_ESC => ESC,
                _ => {
                    self.reset();
                    return None;
                }
            }
        } else if byte == ESC {
            self.escaping = true;
            return None;
        } else {
            byte
        };

        if !self.accept(byte) {
            self.reset();
        }
        None
    }

    /// Feed a buffer, collecting every packet it completes
    pub fn decode(&mut self, data: &[u8]) -> Vec<Packet> {
        data.iter().filter_map(|b| self.push(*b)).collect()
    }

    fn accept(&mut self, byte: u8) -> bool {
        match self.state {
            DecodeState::Idle => return false,
            DecodeState::Version => {
                if byte == 0 || byte > MAX_PROTOCOL_VERSION {
                    return false;
                }
                self.version = byte;
                self.state = DecodeState::SessionId;
            }
            DecodeState::SessionId => {
                self.session_id = byte;
                self.state = DecodeState::ServiceType;
            }
            DecodeState::ServiceType => {
                let Ok(service) = ServiceType::try_from(byte) else {
                    return false;
                };
                self.service_type = service;
                self.state = if service.is_control() {
                    DecodeState::FunctionId
                } else {
                    DecodeState::Length
                };
            }
            DecodeState::FunctionId => {
                self.function_id = byte;
                self.state = DecodeState::Length;
            }
            DecodeState::Length => {
                self.length = (self.length << 8) | byte as u32;
                self.field_bytes += 1;
                if self.field_bytes == 4 {
                    self.field_bytes = 0;
                    if self.length as usize > self.max_payload {
                        return false;
                    }
                    self.payload.reserve(self.length as usize);
                    self.state = if self.length == 0 {
                        DecodeState::Checksum
                    } else {
                        DecodeState::Payload
                    };
                }
            }
            DecodeState::Payload => {
                self.payload.put_u8(byte);
                if self.payload.len() == self.length as usize {
                    self.state = DecodeState::Checksum;
                }
            }
            DecodeState::Checksum => {
                self.checksum = (self.checksum << 8) | byte as u16;
                self.field_bytes += 1;
                if self.field_bytes == 2 {
                    if self.checksum != self.crc {
                        return false;
                    }
                    self.state = DecodeState::Trailer;
                }
                return true;
            }
            DecodeState::Trailer => return false,
        }

        self.crc = crc16_update(self.crc, byte);
        true
    }

    fn clear_frame(&mut self) {
        self.escaping = false;
        self.crc = CRC_INIT;
        self.version = 0;
        self.session_id = 0;
        self.service_type = ServiceType::Control;
        self.function_id = 0;
        self.length = 0;
        self.field_bytes = 0;
        self.checksum = 0;
        self.payload = BytesMut::new();
    }

    fn take_packet(&mut self) -> Packet {
        let payload = std::mem::take(&mut self.payload).freeze();
        let packet = if self.service_type.is_control() {
            Packet::control(self.function_id, self.session_id, payload)
        } else {
            Packet::new(self.service_type, self.session_id, payload)
        };
        packet.with_version(self.version)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a packet into a complete SLIP frame
pub fn encode(packet: &Packet) -> Result<Bytes> {
    let payload = packet.payload();
    if payload.len() > u32::MAX as usize {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        });
    }

    let mut raw = BytesMut::with_capacity(packet.header_len() + payload.len() + 2);
    raw.put_u8(packet.version());
    raw.put_u8(packet.session_id());
    raw.put_u8(packet.service_type().as_u8());
    if let Some(function_id) = packet.function_id() {
        raw.put_u8(function_id);
    }
    raw.put_u32(payload.len() as u32);
    raw.extend_from_slice(payload);
    let crc = crc16(&raw);
    raw.put_u16(crc);

    // Worst case every byte needs escaping
    let mut frame = BytesMut::with_capacity(raw.len() * 2 + 2);
    frame.put_u8(END);
    for byte in raw.iter() {
        match *byte {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            b => frame.put_u8(b),
        }
    }
    frame.put_u8(END);

    Ok(frame.freeze())
}

const CRC_INIT: u16 = 0xFFFF;

fn crc16_update(mut crc: u16, byte: u8) -> u16 {
    crc ^= (byte as u16) << 8;
    for _ in 0..8 {
        if crc & 0x8000 != 0 {
            crc = (crc << 1) ^ 0x1021;
        } else {
            crc <<= 1;
        }
    }
    crc
}

/// CRC-16/CCITT-FALSE
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC_INIT, |crc, b| crc16_update(crc, *b))
}
