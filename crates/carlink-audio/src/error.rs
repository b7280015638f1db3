//! Audio error types

use thiserror::Error;

use crate::manager::StreamingState;

pub type Result<T> = std::result::Result<T, AudioError>;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("not connected")]
    NotConnected,

    #[error("invalid streaming state: {0}")]
    InvalidState(StreamingState),

    #[error("unsupported sampling rate: {0} Hz")]
    UnsupportedSamplingRate(u32),

    #[error("unsupported bits per sample: {0}")]
    UnsupportedBitsPerSample(u8),

    #[error("decoder error: {0}")]
    Decoder(String),

    #[error("session error: {0}")]
    Session(#[from] carlink_session::SessionError),
}
