//! Session error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] carlink_transport::TransportError),

    #[error("core protocol error: {0}")]
    Core(#[from] carlink_core::Error),

    #[error("security error: {0}")]
    Security(String),

    #[error("session error: {0}")]
    Other(String),
}
