//! Transport trait definitions

use async_trait::async_trait;
use carlink_core::{Packet, TransportKind};

use crate::driver::DriverState;
use crate::error::Result;

/// Events reported by a [`TransportDriver`](crate::TransportDriver)
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Driver moved to a new state
    StateChanged(DriverState),
    /// Channel established
    Connected,
    /// Channel closed (clean or error)
    Disconnected { reason: Option<String> },
    /// A complete packet arrived, tagged with the transport it came from
    Packet {
        transport: TransportKind,
        packet: Packet,
    },
    /// Every connect attempt failed
    ConnectFailed { attempts: u32 },
}

/// Read half of a byte channel
#[async_trait]
pub trait ChannelReader: Send {
    /// Read into `buf`. `Ok(0)` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Write half of a byte channel
#[async_trait]
pub trait ChannelWriter: Send {
    /// Write all of `data`
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Release the channel
    async fn close(&mut self) -> Result<()>;
}

/// Both halves of an open channel
pub type ChannelPair = (Box<dyn ChannelReader>, Box<dyn ChannelWriter>);

/// Opens byte channels to one target
#[async_trait]
pub trait Connector: Send + Sync {
    /// Transport family of the channels this connector opens
    fn kind(&self) -> TransportKind;

    /// Human readable target, for logs
    fn describe(&self) -> String;

    /// Open a channel
    async fn connect(&self) -> Result<ChannelPair>;
}
