//! Config file loading
//!
//! Everything is optional; command-line flags override the file.

use anyhow::{bail, Context, Result};
use carlink_audio::{AudioCapability, AudioConfig};
use carlink_session::HeartbeatConfig;
use carlink_transport::{RetryPolicy, TransportConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub transport: TransportSection,
    pub session: SessionSection,
    pub audio: AudioSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// tcp, accessory or bluetooth
    pub kind: String,
    pub host: String,
    pub port: u16,
    /// Device node for accessory and bluetooth
    pub device: Option<String>,
    pub share_connection: bool,
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            kind: "tcp".to_string(),
            host: carlink_core::DEFAULT_PEER_ADDR.to_string(),
            port: carlink_core::DEFAULT_TCP_PORT,
            device: None,
            share_connection: true,
            auto_reconnect: true,
            max_attempts: 5,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub version: u8,
    /// 0 disables heartbeats
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            version: carlink_core::DEFAULT_PROTOCOL_VERSION,
            heartbeat_interval_secs: 0,
            heartbeat_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub capability: Option<AudioCapability>,
}

impl CliConfig {
    /// Load `path`, or the default file when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = default_config_file();
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn transport(&self) -> Result<TransportConfig> {
        let section = &self.transport;
        let config = match section.kind.as_str() {
            "tcp" => TransportConfig::tcp(&section.host, section.port),
            "accessory" | "usb" => {
                let device = section
                    .device
                    .as_deref()
                    .context("accessory transport needs a device path")?;
                TransportConfig::accessory(device)
            }
            "bluetooth" | "bt" => {
                let device = section
                    .device
                    .as_deref()
                    .context("bluetooth transport needs a device path")?;
                TransportConfig::bluetooth(device)
            }
            other => bail!("Unknown transport kind: {}", other),
        };

        let mut config = config
            .with_share_connection(section.share_connection)
            .with_auto_reconnect(section.auto_reconnect);
        if section.kind != "accessory" && section.kind != "usb" {
            config = config.with_retry(RetryPolicy::fixed(
                section.max_attempts,
                Duration::from_millis(section.retry_delay_ms),
            ));
        }
        Ok(config)
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        if self.session.heartbeat_interval_secs == 0 {
            return HeartbeatConfig::default();
        }
        HeartbeatConfig::enabled(
            Duration::from_secs(self.session.heartbeat_interval_secs),
            Duration::from_secs(self.session.heartbeat_timeout_secs),
        )
    }

    pub fn audio(&self) -> AudioConfig {
        AudioConfig {
            capability: self.audio.capability,
            ..AudioConfig::default()
        }
    }
}

/// `<config dir>/carlink/config.toml`
pub fn default_config_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("carlink")
        .join("config.toml")
}
