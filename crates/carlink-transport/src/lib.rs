//! carlink Transport Layer
//!
//! This crate owns the physical side of a connection:
//! - Byte channels (TCP, USB accessory, Bluetooth serial)
//! - The transport driver: connect with retries, read loop, send, disconnect
//!
//! Every channel is reduced to the same read/write/close contract, so the
//! driver and everything above it never care which one is in use.

pub mod config;
pub mod driver;
pub mod error;
pub mod retry;
pub mod stream;
pub mod traits;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "accessory")]
pub mod accessory;

pub mod serial;

pub use config::TransportConfig;
pub use driver::{DriverConfig, DriverState, TransportDriver};
pub use error::{Result, TransportError};
pub use retry::RetryPolicy;
pub use stream::{split_stream, StreamReader, StreamWriter};
pub use traits::{ChannelPair, ChannelReader, ChannelWriter, Connector, TransportEvent};

#[cfg(feature = "tcp")]
pub use tcp::{TcpConfig, TcpConnector};

#[cfg(feature = "accessory")]
pub use accessory::AccessoryConnector;

pub use serial::{SerialConfig, SerialConnector};
