//! Common test helpers for carlink tests
//!
//! This crate provides:
//! - Condition-based waiting (no hardcoded sleeps)
//! - In-memory channels that plug into the transport driver
//! - A scripted head unit that answers service requests and heartbeats
//! - Recording session/service listeners
//! - A deterministic handshake provider

use async_trait::async_trait;
use bytes::Bytes;
use carlink_core::{
    framing, ControlFunction, FrameDecoder, Packet, SecurityQueryHeader, ServiceControl,
    ServiceType, TransportKind,
};
use carlink_session::{HandshakeProvider, ServiceListener, SessionListener};
use carlink_transport::{split_stream, ChannelPair, Connector, TransportError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Install a tracing subscriber that writes through the test harness.
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout. Uses tokio time, so it also works
/// under a paused clock.
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    check().await
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait for a boolean flag to become true
pub async fn wait_for_flag(flag: &AtomicBool, max_wait: Duration) -> bool {
    wait_for(
        || async { flag.load(Ordering::SeqCst) },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait with notification
pub async fn wait_with_notify(notify: &Notify, max_wait: Duration) -> bool {
    timeout(max_wait, notify.notified()).await.is_ok()
}

// ============================================================================
// In-Memory Channels
// ============================================================================

/// Connector whose channels are in-memory duplex pipes. The far end of
/// every channel is handed to the paired [`PeerAcceptor`].
pub struct MemoryConnector {
    kind: TransportKind,
    failures: u32,
    attempts: AtomicU32,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl MemoryConnector {
    pub fn new(kind: TransportKind) -> (Arc<Self>, PeerAcceptor) {
        Self::failing(kind, 0)
    }

    /// Refuse the first `failures` connect attempts
    pub fn failing(kind: TransportKind, failures: u32) -> (Arc<Self>, PeerAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            kind,
            failures,
            attempts: AtomicU32::new(0),
            peers: tx,
        });
        (connector, PeerAcceptor { rx })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.kind)
    }

    async fn connect(&self) -> carlink_transport::Result<ChannelPair> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(TransportError::ConnectionFailed("refused by test".into()));
        }
        let (local, remote) = tokio::io::duplex(64 * 1024);
        self.peers
            .send(remote)
            .map_err(|_| TransportError::ConnectionFailed("acceptor dropped".into()))?;
        Ok(split_stream(local))
    }
}

/// Far ends of the channels a [`MemoryConnector`] opened
pub struct PeerAcceptor {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl PeerAcceptor {
    /// Next raw channel, or `None` after [`DEFAULT_TIMEOUT`]
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        timeout(DEFAULT_TIMEOUT, self.rx.recv()).await.ok().flatten()
    }

    /// Next channel, answered by a scripted head unit
    pub async fn accept_head_unit(&mut self, config: HeadUnitConfig) -> Option<HeadUnit> {
        self.accept()
            .await
            .map(|stream| HeadUnit::spawn(stream, config))
    }
}

// ============================================================================
// Scripted Head Unit
// ============================================================================

/// How the scripted head unit answers
#[derive(Debug, Clone)]
pub struct HeadUnitConfig {
    /// Session id handed out for the first RPC start; later ones count up
    pub first_session_id: u8,
    /// Hash id returned with RPC acks
    pub hash_id: u32,
    /// Answer start/end requests at all
    pub ack_services: bool,
    pub nack_start: HashSet<ServiceType>,
    pub nack_end: HashSet<ServiceType>,
    pub answer_heartbeats: bool,
    /// Reply sent for the first handshake packet
    pub handshake_reply: Option<Bytes>,
}

impl Default for HeadUnitConfig {
    fn default() -> Self {
        Self {
            first_session_id: 1,
            hash_id: 0x1234_5678,
            ack_services: true,
            nack_start: HashSet::new(),
            nack_end: HashSet::new(),
            answer_heartbeats: true,
            handshake_reply: None,
        }
    }
}

impl HeadUnitConfig {
    pub fn nacking_start(mut self, service: ServiceType) -> Self {
        self.nack_start.insert(service);
        self
    }

    pub fn nacking_end(mut self, service: ServiceType) -> Self {
        self.nack_end.insert(service);
        self
    }

    pub fn silent(mut self) -> Self {
        self.ack_services = false;
        self.answer_heartbeats = false;
        self
    }

    pub fn without_heartbeat_acks(mut self) -> Self {
        self.answer_heartbeats = false;
        self
    }

    pub fn with_handshake_reply(mut self, reply: &'static [u8]) -> Self {
        self.handshake_reply = Some(Bytes::from_static(reply));
        self
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

/// Peer end of a channel that behaves like a minimal head unit and records
/// every packet it receives. Dropping it hangs up.
pub struct HeadUnit {
    writer: SharedWriter,
    received: Arc<Mutex<Vec<Packet>>>,
    count: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl HeadUnit {
    pub fn spawn(stream: DuplexStream, config: HeadUnitConfig) -> Self {
        let (mut reader, writer) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let received = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicU32::new(0));

        let task = {
            let writer = Arc::clone(&writer);
            let received = Arc::clone(&received);
            let count = Arc::clone(&count);
            let script = Script {
                next_session: AtomicU8::new(config.first_session_id),
                handshake_answered: AtomicBool::new(false),
            };

            tokio::spawn(async move {
                let mut decoder = FrameDecoder::new();
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    for packet in decoder.decode(&buf[..n]) {
                        received.lock().push(packet.clone());
                        count.fetch_add(1, Ordering::SeqCst);
                        if let Some(reply) = answer(&config, &script, &packet) {
                            write_packet(&writer, &reply).await;
                        }
                    }
                }
            })
        };

        Self {
            writer,
            received,
            count,
            task,
        }
    }

    /// Send a packet to the phone side
    pub async fn send(&self, packet: &Packet) {
        write_packet(&self.writer, packet).await;
    }

    /// Raw bytes, for framing tests
    pub async fn send_raw(&self, data: &[u8]) {
        let mut writer = self.writer.lock().await;
        let _ = writer.write_all(data).await;
        let _ = writer.flush().await;
    }

    pub fn received(&self) -> Vec<Packet> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Received CONTROL packets with the given function
    pub fn received_control(&self, function: ControlFunction) -> Vec<Packet> {
        self.received
            .lock()
            .iter()
            .filter(|p| p.function_id() == Some(function.as_u8()))
            .cloned()
            .collect()
    }

    /// Received packets on a non-CONTROL service
    pub fn received_on(&self, service: ServiceType) -> Vec<Packet> {
        self.received
            .lock()
            .iter()
            .filter(|p| p.service_type() == service)
            .cloned()
            .collect()
    }

    /// Start/end requests the head unit saw, decoded
    pub fn service_requests(&self, function: ControlFunction) -> Vec<ServiceControl> {
        self.received_control(function)
            .iter()
            .filter_map(|p| ServiceControl::decode(p.payload().clone()).ok())
            .collect()
    }

    /// Wait until `check` holds for the received packets
    pub async fn wait_until<F>(&self, check: F, max_wait: Duration) -> bool
    where
        F: Fn(&[Packet]) -> bool,
    {
        wait_for(
            || {
                let ok = check(self.received.lock().as_slice());
                async move { ok }
            },
            DEFAULT_CHECK_INTERVAL,
            max_wait,
        )
        .await
    }

    /// Wait for `n` CONTROL packets of one function
    pub async fn wait_for_control(&self, function: ControlFunction, n: usize, max_wait: Duration) -> bool {
        let id = function.as_u8();
        self.wait_until(
            |packets| packets.iter().filter(|p| p.function_id() == Some(id)).count() >= n,
            max_wait,
        )
        .await
    }
}

impl Drop for HeadUnit {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn write_packet(writer: &SharedWriter, packet: &Packet) {
    let Ok(frame) = framing::encode(packet) else {
        return;
    };
    let mut writer = writer.lock().await;
    let _ = writer.write_all(&frame).await;
    let _ = writer.flush().await;
}

/// Head unit state carried between packets
struct Script {
    next_session: AtomicU8,
    handshake_answered: AtomicBool,
}

fn answer(config: &HeadUnitConfig, script: &Script, packet: &Packet) -> Option<Packet> {
    let function = ControlFunction::try_from(packet.function_id()?).ok()?;
    let version = packet.version();

    match function {
        ControlFunction::StartService | ControlFunction::EndService => {
            if !config.ack_services {
                return None;
            }
            let request = ServiceControl::decode(packet.payload().clone()).ok()?;
            let starting = function == ControlFunction::StartService;

            let (nacks, ack, nack) = if starting {
                (
                    &config.nack_start,
                    ControlFunction::StartServiceAck,
                    ControlFunction::StartServiceNack,
                )
            } else {
                (
                    &config.nack_end,
                    ControlFunction::EndServiceAck,
                    ControlFunction::EndServiceNack,
                )
            };

            if nacks.contains(&request.service) {
                let body = ServiceControl::new(request.service, request.correlation_id);
                return Some(
                    Packet::control(nack.as_u8(), packet.session_id(), body.encode())
                        .with_version(version),
                );
            }

            let session_id = if starting && request.service == ServiceType::Rpc {
                script.next_session.fetch_add(1, Ordering::SeqCst)
            } else {
                packet.session_id()
            };
            let hash_id = if request.service == ServiceType::Rpc {
                config.hash_id
            } else {
                0
            };
            let body = ServiceControl::new(request.service, request.correlation_id)
                .with_encrypted(request.encrypted)
                .with_hash_id(hash_id);
            Some(Packet::control(ack.as_u8(), session_id, body.encode()).with_version(version))
        }
        ControlFunction::Heartbeat if config.answer_heartbeats => Some(
            Packet::control(
                ControlFunction::HeartbeatAck.as_u8(),
                packet.session_id(),
                Bytes::new(),
            )
            .with_version(version),
        ),
        ControlFunction::Security => {
            let reply = config.handshake_reply.as_ref()?;
            if script.handshake_answered.swap(true, Ordering::SeqCst) {
                return None;
            }
            let payload = SecurityQueryHeader::handshake(0).wrap(reply);
            Some(
                Packet::control(ControlFunction::Security.as_u8(), packet.session_id(), payload)
                    .with_version(version),
            )
        }
        _ => None,
    }
}

// ============================================================================
// Recording Listeners
// ============================================================================

/// Everything a [`RecordingSessionListener`] saw
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ServiceStarted {
        session_id: u8,
        service: ServiceType,
        encrypted: bool,
    },
    ServiceEnded {
        session_id: u8,
        service: ServiceType,
    },
    ServiceNacked {
        service: ServiceType,
        reason: String,
    },
    Message(Packet),
    HeartbeatTimeout(u8),
    TransportDisconnected(Option<String>),
    TransportError(String),
}

/// Session listener that keeps every event
#[derive(Default)]
pub struct RecordingSessionListener {
    events: Mutex<Vec<SessionEvent>>,
    count: AtomicU32,
}

impl RecordingSessionListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: SessionEvent) {
        self.events.lock().push(event);
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn has<F: Fn(&SessionEvent) -> bool>(&self, check: F) -> bool {
        self.events.lock().iter().any(check)
    }

    /// Wait for an event matching `check`
    pub async fn wait_for<F>(&self, check: F, max_wait: Duration) -> bool
    where
        F: Fn(&SessionEvent) -> bool,
    {
        wait_for(
            || {
                let found = self.has(&check);
                async move { found }
            },
            DEFAULT_CHECK_INTERVAL,
            max_wait,
        )
        .await
    }

    pub async fn wait_for_started(&self, service: ServiceType) -> bool {
        self.wait_for(
            |e| matches!(e, SessionEvent::ServiceStarted { service: s, .. } if *s == service),
            DEFAULT_TIMEOUT,
        )
        .await
    }
}

impl SessionListener for RecordingSessionListener {
    fn on_service_started(&self, session_id: u8, service: ServiceType, encrypted: bool) {
        self.record(SessionEvent::ServiceStarted {
            session_id,
            service,
            encrypted,
        });
    }

    fn on_service_ended(&self, session_id: u8, service: ServiceType) {
        self.record(SessionEvent::ServiceEnded {
            session_id,
            service,
        });
    }

    fn on_service_nacked(&self, _session_id: u8, service: ServiceType, reason: &str) {
        self.record(SessionEvent::ServiceNacked {
            service,
            reason: reason.to_string(),
        });
    }

    fn on_message(&self, packet: &Packet) {
        self.record(SessionEvent::Message(packet.clone()));
    }

    fn on_heartbeat_timeout(&self, session_id: u8) {
        self.record(SessionEvent::HeartbeatTimeout(session_id));
    }

    fn on_transport_disconnected(&self, reason: Option<&str>) {
        self.record(SessionEvent::TransportDisconnected(reason.map(str::to_string)));
    }

    fn on_transport_error(&self, reason: &str) {
        self.record(SessionEvent::TransportError(reason.to_string()));
    }
}

/// Everything a [`RecordingServiceListener`] saw
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Started { service: ServiceType, encrypted: bool },
    Ended { service: ServiceType },
    Error { service: ServiceType, reason: String },
}

/// Service listener that keeps every event
#[derive(Default)]
pub struct RecordingServiceListener {
    events: Mutex<Vec<ServiceEvent>>,
    count: AtomicU32,
}

impl RecordingServiceListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: ServiceEvent) {
        self.events.lock().push(event);
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ServiceEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn wait_for_count(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.count, n, max_wait).await
    }
}

impl ServiceListener for RecordingServiceListener {
    fn on_service_started(&self, _session_id: u8, service: ServiceType, encrypted: bool) {
        self.record(ServiceEvent::Started { service, encrypted });
    }

    fn on_service_ended(&self, _session_id: u8, service: ServiceType) {
        self.record(ServiceEvent::Ended { service });
    }

    fn on_service_error(&self, _session_id: u8, service: ServiceType, reason: &str) {
        self.record(ServiceEvent::Error {
            service,
            reason: reason.to_string(),
        });
    }
}

// ============================================================================
// Handshake Provider
// ============================================================================

pub const CLIENT_HELLO: &[u8] = b"client-hello";
pub const SERVER_HELLO: &[u8] = b"server-hello";
pub const CLIENT_FINISHED: &[u8] = b"client-finished";

/// Two-step handshake: `initialize` emits [`CLIENT_HELLO`]; receiving
/// [`SERVER_HELLO`] answers [`CLIENT_FINISHED`] and completes.
#[derive(Default)]
pub struct MockHandshakeProvider {
    /// Complete inside `initialize`, without any exchange
    instant: bool,
    complete: AtomicBool,
    initialized: AtomicU32,
    shutdowns: AtomicU32,
    inputs: Mutex<Vec<Vec<u8>>>,
}

impl MockHandshakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn instant() -> Arc<Self> {
        Arc::new(Self {
            instant: true,
            ..Default::default()
        })
    }

    pub fn initialize_calls(&self) -> u32 {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Handshake bytes received from the peer
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.inputs.lock().clone()
    }
}

impl HandshakeProvider for MockHandshakeProvider {
    fn initialize(&self) -> Option<Bytes> {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        if self.instant {
            self.complete.store(true, Ordering::SeqCst);
            return None;
        }
        Some(Bytes::from_static(CLIENT_HELLO))
    }

    fn run_handshake(&self, input: &[u8], output: &mut [u8]) -> usize {
        self.inputs.lock().push(input.to_vec());
        if self.is_complete() || input != SERVER_HELLO || output.len() < CLIENT_FINISHED.len() {
            return 0;
        }
        output[..CLIENT_FINISHED.len()].copy_from_slice(CLIENT_FINISHED);
        self.complete.store(true, Ordering::SeqCst);
        CLIENT_FINISHED.len()
    }

    fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
