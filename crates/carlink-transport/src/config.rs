//! Transport configuration
//!
//! A [`TransportConfig`] names one physical target and how a driver should
//! treat it. Two configs describe the same physical channel when their
//! transport kinds match; the multiplexer relies on that to share channels.

use carlink_core::TransportKind;
use std::fmt;
use std::sync::Arc;

use crate::driver::DriverConfig;
use crate::retry::RetryPolicy;
use crate::serial::{SerialConfig, SerialConnector};
use crate::traits::Connector;

#[cfg(feature = "tcp")]
use crate::tcp::{TcpConfig, TcpConnector};

#[cfg(feature = "accessory")]
use crate::accessory::AccessoryConnector;

/// Where and how to connect
#[derive(Clone)]
pub struct TransportConfig {
    connector: Arc<dyn Connector>,
    /// Driver behaviour (retries, reconnect, timeouts)
    pub driver: DriverConfig,
    /// Allow other sessions to share the channel
    pub share_connection: bool,
}

impl TransportConfig {
    /// Any connector, default driver settings
    pub fn custom(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            driver: DriverConfig::default(),
            share_connection: true,
        }
    }

    /// TCP to a head unit (or emulator)
    #[cfg(feature = "tcp")]
    pub fn tcp(host: &str, port: u16) -> Self {
        Self::custom(Arc::new(TcpConnector::new(TcpConfig::new(host, port))))
    }

    /// Bluetooth RFCOMM device node
    pub fn bluetooth(port_name: &str) -> Self {
        Self::custom(Arc::new(SerialConnector::new(SerialConfig::new(port_name))))
    }

    /// USB accessory device node, with the accessory retry policy
    #[cfg(feature = "accessory")]
    pub fn accessory(path: &str) -> Self {
        let mut config = Self::custom(Arc::new(AccessoryConnector::new(path)));
        config.driver.retry = RetryPolicy::accessory();
        config
    }

    pub fn with_share_connection(mut self, share: bool) -> Self {
        self.share_connection = share;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.driver.auto_reconnect = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.driver.retry = retry;
        self
    }

    pub fn with_driver_config(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.connector.kind()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("target", &self.connector.describe())
            .field("kind", &self.connector.kind())
            .field("share_connection", &self.share_connection)
            .field("driver", &self.driver)
            .finish()
    }
}
