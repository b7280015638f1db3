//! Serial channel
//!
//! Bluetooth RFCOMM links show up as serial device nodes (for example
//! `/dev/rfcomm0`) once paired, so the Bluetooth transport is a serial port.
//! Pairing itself happens outside this crate.

use async_trait::async_trait;
use carlink_core::TransportKind;

use crate::error::{Result, TransportError};
use crate::traits::{ChannelPair, Connector};

/// Serial channel configuration
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path
    pub port_name: String,
    /// Baud rate (default: 115200)
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: "/dev/rfcomm0".to_string(),
            baud_rate: 115200,
        }
    }
}

impl SerialConfig {
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            ..Default::default()
        }
    }
}

/// Opens serial (Bluetooth RFCOMM) channels
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    /// List available serial ports
    #[cfg(feature = "serial")]
    pub fn list_ports() -> Result<Vec<String>> {
        let ports = tokio_serial::available_ports().map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to list ports: {}", e))
        })?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    #[cfg(not(feature = "serial"))]
    pub fn list_ports() -> Result<Vec<String>> {
        Err(TransportError::ConnectionFailed(
            "Serial feature not enabled. Compile with --features serial".into(),
        ))
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.config.port_name, self.config.baud_rate)
    }

    #[cfg(feature = "serial")]
    async fn connect(&self) -> Result<ChannelPair> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(&self.config.port_name, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to open port: {}", e)))?;

        tracing::info!(
            "Serial port opened: {} @ {} baud",
            self.config.port_name,
            self.config.baud_rate
        );

        Ok(crate::stream::split_stream(port))
    }

    #[cfg(not(feature = "serial"))]
    async fn connect(&self) -> Result<ChannelPair> {
        Err(TransportError::ConnectionFailed(
            "Serial feature not enabled. Compile with --features serial".into(),
        ))
    }
}
