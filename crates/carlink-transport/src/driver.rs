//! Transport driver
//!
//! Owns exactly one physical channel. `connect` retries per [`RetryPolicy`],
//! then a read loop task feeds every received byte through a
//! [`FrameDecoder`] and reports each packet as a [`TransportEvent::Packet`].
//! When the channel drops and auto-reconnect is on, the connect policy runs
//! again.
//!
//! State flow: `None → Listen → Connecting → Connected → Listen` (on
//! disconnect) `→ None` (on stop). Exhausted retries end in `Error`.
//!
//! Disconnects requested by callers, by a failed send and by the read loop
//! all go through the link lock; a generation number tags each link so the
//! loser of a race does nothing.

use bytes::Bytes;
use carlink_core::{framing, FrameDecoder, FramingConfig, Packet, TransportKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::retry::RetryPolicy;
use crate::traits::{ChannelReader, ChannelWriter, Connector, TransportEvent};

/// Default read buffer size
const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// A write that has not finished after this long means a stuck endpoint
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Driver lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Not started, or explicitly stopped
    None,
    /// Started, no channel
    Listen,
    /// Connect attempt in progress
    Connecting,
    /// Channel open, read loop running
    Connected,
    /// Connect attempts exhausted
    Error,
}

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Re-run the connect policy when the channel drops
    pub auto_reconnect: bool,
    /// Connect retry policy (a single attempt without auto-reconnect)
    pub retry: RetryPolicy,
    /// Read buffer size
    pub read_buffer_size: usize,
    /// Upper bound for a single write
    pub write_timeout: Duration,
    /// Framing limits
    pub framing: FramingConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            retry: RetryPolicy::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            framing: FramingConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    fn attempts(&self) -> u32 {
        if self.auto_reconnect {
            self.retry.max_attempts.max(1)
        } else {
            1
        }
    }
}

/// Channel currently owned by the driver
struct Link {
    writer: Option<Box<dyn ChannelWriter>>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
}

struct DriverInner {
    connector: Arc<dyn Connector>,
    config: DriverConfig,
    state: Mutex<DriverState>,
    link: tokio::sync::Mutex<Link>,
    /// Serializes connect runs
    connecting: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    stopped: AtomicBool,
    stop_notify: Notify,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Reconnecting driver for one byte channel.
///
/// Cloning is cheap; clones share the same channel.
#[derive(Clone)]
pub struct TransportDriver {
    inner: Arc<DriverInner>,
}

impl TransportDriver {
    /// Create a driver and the receiver for its events
    pub fn new(
        connector: Arc<dyn Connector>,
        config: DriverConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = DriverInner {
            connector,
            config,
            state: Mutex::new(DriverState::None),
            link: tokio::sync::Mutex::new(Link {
                writer: None,
                reader: None,
                generation: 0,
            }),
            connecting: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Current state
    pub fn state(&self) -> DriverState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == DriverState::Connected
    }

    /// Transport family of the underlying channel
    pub fn kind(&self) -> TransportKind {
        self.inner.connector.kind()
    }

    /// Human readable target
    pub fn describe(&self) -> String {
        self.inner.connector.describe()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Connect, retrying per policy. Returns once connected or out of attempts.
    pub async fn connect(&self) -> Result<()> {
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.inner.run_connect().await
    }

    /// Frame and send a packet
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let frame = framing::encode(packet)?;
        self.send_bytes(frame).await
    }

    /// Send already framed bytes.
    ///
    /// A failed or stuck write disconnects the driver and returns the error;
    /// it is not retried.
    pub async fn send_bytes(&self, data: Bytes) -> Result<()> {
        let inner = &self.inner;
        let mut link = inner.link.lock().await;

        if *inner.state.lock() != DriverState::Connected {
            return Err(TransportError::NotConnected);
        }
        let Some(writer) = link.writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let result = match tokio::time::timeout(inner.config.write_timeout, writer.write(&data)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(()) => {
                debug!("Sent {} bytes to {}", data.len(), inner.connector.describe());
                Ok(())
            }
            Err(e) => {
                error!("Write to {} failed: {}", inner.connector.describe(), e);
                let reason = e.to_string();
                inner.drop_link(&mut link, Some(reason.clone()), DriverState::Listen).await;
                drop(link);
                inner.schedule_reconnect();
                Err(TransportError::SendFailed(reason))
            }
        }
    }

    /// Close the channel and go back to `Listen`. Idempotent.
    pub async fn disconnect(&self, reason: Option<String>) {
        let mut link = self.inner.link.lock().await;
        self.inner.drop_link(&mut link, reason, DriverState::Listen).await;
    }

    /// Close the channel, cancel any reconnect and go to `None`
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.stopped.store(true, Ordering::SeqCst);
        inner.stop_notify.notify_waiters();

        let mut link = inner.link.lock().await;
        if !inner
            .drop_link(&mut link, Some("stopped".to_string()), DriverState::None)
            .await
        {
            inner.set_state(DriverState::None);
        }
    }
}

impl std::fmt::Debug for TransportDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportDriver")
            .field("target", &self.describe())
            .field("state", &self.state())
            .finish()
    }
}

impl DriverInner {
    fn emit(&self, event: TransportEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: DriverState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            debug!("{} -> {:?}", self.connector.describe(), next);
            self.emit(TransportEvent::StateChanged(next));
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn run_connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connecting.lock().await;

        if *self.state.lock() == DriverState::Connected {
            return Ok(());
        }

        let target = self.connector.describe();
        let attempts = self.config.attempts();
        self.set_state(DriverState::Listen);

        for attempt in 1..=attempts {
            if self.is_stopped() {
                return Err(TransportError::Stopped);
            }

            self.set_state(DriverState::Connecting);
            info!("Connecting to {} (attempt {}/{})", target, attempt, attempts);

            match self.connector.connect().await {
                Ok((reader, writer)) => return self.attach(reader, writer).await,
                Err(e) => {
                    warn!("Connect to {} failed: {}", target, e);
                    if attempt == attempts || self.is_stopped() {
                        break;
                    }
                    self.set_state(DriverState::Listen);
                    let delay = self.config.retry.delay_for(attempt - 1);
                    debug!("Retrying {} in {:?}", target, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop_notify.notified() => {}
                    }
                }
            }
        }

        if self.is_stopped() {
            return Err(TransportError::Stopped);
        }

        error!("Giving up on {} after {} attempts", target, attempts);
        self.set_state(DriverState::Error);
        self.emit(TransportEvent::ConnectFailed { attempts });
        Err(TransportError::ConnectionFailed(format!(
            "{} unreachable after {} attempts",
            target, attempts
        )))
    }

    /// Install a freshly opened channel. A stop that landed while the
    /// connect was in flight wins: the channel is closed again.
    async fn attach(
        self: &Arc<Self>,
        reader: Box<dyn ChannelReader>,
        mut writer: Box<dyn ChannelWriter>,
    ) -> Result<()> {
        let mut link = self.link.lock().await;

        if self.is_stopped() {
            drop(reader);
            if let Err(e) = writer.close().await {
                debug!("Close of {} reported: {}", self.connector.describe(), e);
            }
            self.set_state(DriverState::None);
            info!("Discarding channel to {}: driver stopped", self.connector.describe());
            return Err(TransportError::Stopped);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        link.generation = generation;
        link.writer = Some(writer);

        // Connected before the reader can report anything
        self.set_state(DriverState::Connected);
        self.emit(TransportEvent::Connected);
        info!("Connected to {}", self.connector.describe());

        let inner = Arc::clone(self);
        link.reader = Some(tokio::spawn(async move {
            inner.read_loop(reader, generation).await;
        }));
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut reader: Box<dyn ChannelReader>, generation: u64) {
        let kind = self.connector.kind();
        let mut decoder = FrameDecoder::with_config(self.config.framing.clone());
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];

        let reason = loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("{} closed by peer", self.connector.describe());
                    break None;
                }
                Ok(n) => {
                    for byte in &buf[..n] {
                        if let Some(packet) = decoder.push(*byte) {
                            debug!(
                                "Packet formed: {} session {} ({} bytes)",
                                packet.service_type(),
                                packet.session_id(),
                                packet.payload().len()
                            );
                            self.emit(TransportEvent::Packet {
                                transport: kind,
                                packet,
                            });
                        }
                    }
                }
                Err(e) => {
                    error!("Read from {} failed: {}", self.connector.describe(), e);
                    break Some(e.to_string());
                }
            }
        };

        let lost = {
            let mut link = self.link.lock().await;
            if link.generation != generation || link.writer.is_none() {
                false
            } else {
                // Our own handle: drop it without aborting ourselves
                link.reader.take();
                self.drop_link(&mut link, reason, DriverState::Listen).await
            }
        };

        if lost {
            self.schedule_reconnect();
        }
    }

    /// Close the current link, if any. Returns false when there was none.
    async fn drop_link(&self, link: &mut Link, reason: Option<String>, next: DriverState) -> bool {
        let Some(mut writer) = link.writer.take() else {
            return false;
        };

        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        link.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(e) = writer.close().await {
            debug!("Close of {} reported: {}", self.connector.describe(), e);
        }

        info!(
            "Disconnected from {}: {}",
            self.connector.describe(),
            reason.as_deref().unwrap_or("closed")
        );
        self.set_state(next);
        self.emit(TransportEvent::Disconnected { reason });
        true
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.config.auto_reconnect || self.is_stopped() {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.run_connect().await {
                debug!("Reconnect ended: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_config_default() {
        let config = DriverConfig::default();
        assert!(config.auto_reconnect);
        assert_eq!(config.retry.max_attempts, 30);
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.write_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_single_attempt_without_auto_reconnect() {
        let config = DriverConfig::default().with_auto_reconnect(false);
        assert_eq!(config.attempts(), 1);

        let config = DriverConfig::default().with_retry(RetryPolicy::fixed(0, Duration::ZERO));
        assert_eq!(config.attempts(), 1);
    }
}
