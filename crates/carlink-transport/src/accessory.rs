//! USB accessory channel
//!
//! In accessory mode the host exposes the bulk endpoints as a character device
//! that is read and written like a file.

use async_trait::async_trait;
use carlink_core::TransportKind;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tracing::info;

use crate::error::{Result, TransportError};
use crate::stream::split_stream;
use crate::traits::{ChannelPair, Connector};

/// Opens a USB accessory device node
pub struct AccessoryConnector {
    path: PathBuf,
}

impl AccessoryConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Connector for AccessoryConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn describe(&self) -> String {
        format!("usb://{}", self.path.display())
    }

    async fn connect(&self) -> Result<ChannelPair> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Failed to open accessory {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        info!("USB accessory opened: {}", self.path.display());
        Ok(split_stream(file))
    }
}
