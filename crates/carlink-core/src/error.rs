//! Error types for carlink core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Unknown service type byte
    #[error("unknown service type: 0x{0:02x}")]
    UnknownServiceType(u8),

    /// Unknown CONTROL function id
    #[error("unknown control function: 0x{0:02x}")]
    UnknownControlFunction(u8),

    /// Protocol version outside the supported range
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds the configured maximum
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Input shorter than the structure being decoded
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },
}
