//! TCP channel
//!
//! Raw TCP to the head unit. On USB links the head unit is reached through a
//! SLIP network interface, so this is also the channel used for USB-over-IP.

use async_trait::async_trait;
use carlink_core::{TransportKind, DEFAULT_PEER_ADDR, DEFAULT_TCP_PORT};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::{StreamReader, StreamWriter};
use crate::traits::{ChannelPair, Connector};

/// TCP configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Peer host
    pub host: String,
    /// Peer port
    pub port: u16,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Keep-alive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// Network kind reported for this channel
    pub kind: TransportKind,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PEER_ADDR.to_string(),
            port: DEFAULT_TCP_PORT,
            connect_timeout: Duration::from_secs(10),
            keepalive_secs: 30,
            nodelay: true,
            kind: TransportKind::Tcp,
        }
    }
}

impl TcpConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    /// Report channels as running over `kind` (e.g. USB for SLIP bridges)
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opens TCP channels
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn kind(&self) -> TransportKind {
        self.config.kind
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.config.addr())
    }

    async fn connect(&self) -> Result<ChannelPair> {
        let addr = self.config.addr();
        debug!("Connecting to TCP: {}", addr);

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if self.config.nodelay {
            let _ = stream.set_nodelay(true);
        }

        // Enable TCP keepalive if configured
        if self.config.keepalive_secs > 0 {
            let socket = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(self.config.keepalive_secs));
            let _ = socket.set_tcp_keepalive(&keepalive);
        }

        info!("TCP connected to {}", addr);
        let (reader, writer) = stream.into_split();
        Ok((
            Box::new(StreamReader::new(reader)),
            Box::new(StreamWriter::new(writer)),
        ))
    }
}
