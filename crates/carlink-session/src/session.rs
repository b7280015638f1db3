//! Session lifecycle and security coordination
//!
//! A [`Session`] is one logical conversation with the head unit, bound to a
//! [`Connection`] handed out by the [`ConnectionRegistry`]. It starts and ends
//! services, negotiates encrypted services through a [`HandshakeProvider`],
//! answers handshake traffic and keeps heartbeats running.
//!
//! Every operation is a silent no-op while the session has no connection.

use async_trait::async_trait;
use bytes::Bytes;
use carlink_core::{
    ControlFunction, Packet, SecurityQueryHeader, ServiceControl, ServiceType, TransportKind,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::heartbeat::{HeartbeatHandler, HeartbeatMonitor};
use crate::listener::{ServiceListener, SessionListener};
use crate::registry::ConnectionRegistry;
use crate::security::HANDSHAKE_BUFFER_SIZE;

pub(crate) struct SessionInner {
    this: Weak<SessionInner>,
    version: AtomicU8,
    session_id: AtomicU8,
    hash_id: AtomicU32,
    config: SessionConfig,
    listener: Arc<dyn SessionListener>,
    registry: Arc<ConnectionRegistry>,
    connection: Mutex<Option<Arc<Connection>>>,
    encrypted: Mutex<HashSet<ServiceType>>,
    service_listeners: DashMap<ServiceType, Vec<Arc<dyn ServiceListener>>>,
    /// Services waiting for the handshake to finish
    pending_secure: Mutex<Vec<ServiceType>>,
    security_sequence: AtomicU32,
    rpc_requested: AtomicBool,
    heartbeat: Mutex<Option<HeartbeatMonitor>>,
}

/// A logical session. Clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning session handle held by connections
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }

    pub(crate) fn ptr_eq(&self, session: &Session) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&session.inner))
    }
}

/// Create a session. Nothing is connected until [`Session::start_session`].
pub fn create_session(
    version: u8,
    listener: Arc<dyn SessionListener>,
    config: SessionConfig,
    registry: Arc<ConnectionRegistry>,
) -> Session {
    let inner = Arc::new_cyclic(|this| SessionInner {
        this: this.clone(),
        version: AtomicU8::new(version),
        session_id: AtomicU8::new(0),
        hash_id: AtomicU32::new(0),
        config,
        listener,
        registry,
        connection: Mutex::new(None),
        encrypted: Mutex::new(HashSet::new()),
        service_listeners: DashMap::new(),
        pending_secure: Mutex::new(Vec::new()),
        security_sequence: AtomicU32::new(0),
        rpc_requested: AtomicBool::new(false),
        heartbeat: Mutex::new(None),
    });
    Session { inner }
}

impl Session {
    /// Session id assigned by the peer (0 until the RPC service starts)
    pub fn session_id(&self) -> u8 {
        self.inner.session_id.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> u8 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Hash id from the last RPC start, used to resume
    pub fn hash_id(&self) -> u32 {
        self.inner.hash_id.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.connection.lock().clone()
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.connection().map(|c| c.kind())
    }

    pub fn is_connected(&self) -> bool {
        self.connection().map_or(false, |c| c.is_connected())
    }

    pub fn is_service_protected(&self, service: ServiceType) -> bool {
        self.inner.encrypted.lock().contains(&service)
    }

    /// Join a connection from the registry. The RPC service is requested as
    /// soon as the transport is up.
    pub async fn start_session(&self) -> Result<()> {
        if self.connection().is_some() {
            return Ok(());
        }

        let connection = self
            .inner
            .registry
            .acquire(self, &self.inner.config.transport);
        info!(
            "Session registered on connection {} ({})",
            connection.id(),
            connection.kind()
        );

        if connection.is_connected() {
            self.start_rpc(&connection).await?;
        }
        Ok(())
    }

    /// Request a service. Encrypted requests wait for the handshake.
    pub async fn start_service(&self, service: ServiceType, encrypted: bool) -> Result<()> {
        let Some(connection) = self.connection() else {
            return Ok(());
        };

        if !encrypted {
            return self.request_start(&connection, service, false).await;
        }

        let Some(provider) = self.inner.config.security.clone() else {
            self.notify_service_error(
                service,
                "Encrypted service requested without a handshake provider",
            );
            return Ok(());
        };

        if provider.is_complete() {
            return self.request_start(&connection, service, true).await;
        }

        {
            let mut pending = self.inner.pending_secure.lock();
            if !pending.contains(&service) {
                pending.push(service);
            }
        }

        if let Some(hello) = provider.initialize() {
            self.send_handshake(&connection, &hello, self.session_id(), self.version())
                .await?;
        }
        if provider.is_complete() {
            self.on_security_initialized().await;
        }
        Ok(())
    }

    pub async fn end_service(&self, service: ServiceType) -> Result<()> {
        let Some(connection) = self.connection() else {
            return Ok(());
        };
        let hash_id = if service == ServiceType::Rpc {
            self.hash_id()
        } else {
            0
        };
        connection
            .request_service(self, ControlFunction::EndService, service, false, hash_id)
            .await
    }

    pub async fn send_message(&self, packet: &Packet) -> Result<()> {
        let Some(connection) = self.connection() else {
            return Ok(());
        };
        connection.send(packet).await
    }

    /// Send `payload` on `service` with this session's id and version
    pub async fn send_data(&self, service: ServiceType, payload: impl Into<Bytes>) -> Result<()> {
        let packet =
            Packet::new(service, self.session_id(), payload).with_version(self.version());
        self.send_message(&packet).await
    }

    pub fn add_service_listener(&self, service: ServiceType, listener: Arc<dyn ServiceListener>) {
        self.inner
            .service_listeners
            .entry(service)
            .or_default()
            .push(listener);
    }

    pub fn remove_service_listener(&self, service: ServiceType, listener: &Arc<dyn ServiceListener>) {
        if let Some(mut listeners) = self.inner.service_listeners.get_mut(&service) {
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    /// Shut the provider down, stop heartbeats and leave the connection
    pub async fn close(&self) {
        if let Some(provider) = &self.inner.config.security {
            provider.shutdown();
        }
        self.stop_heartbeat();
        self.inner.pending_secure.lock().clear();
        self.inner.rpc_requested.store(false, Ordering::SeqCst);
        self.inner.registry.release(self).await;
        debug!("Session {} closed", self.session_id());
    }

    // ------------------------------------------------------------------
    // Crate internals
    // ------------------------------------------------------------------

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    /// Replace the connection, returning the previous one
    pub(crate) fn set_connection(&self, connection: Option<Arc<Connection>>) -> Option<Arc<Connection>> {
        std::mem::replace(&mut *self.inner.connection.lock(), connection)
    }

    fn listeners_for(&self, service: ServiceType) -> Vec<Arc<dyn ServiceListener>> {
        self.inner
            .service_listeners
            .get(&service)
            .map(|l| l.value().clone())
            .unwrap_or_default()
    }

    pub(crate) fn notify_service_error(&self, service: ServiceType, reason: &str) {
        warn!("{} service error: {}", service, reason);
        let session_id = self.session_id();
        for listener in self.listeners_for(service) {
            listener.on_service_error(session_id, service, reason);
        }
    }

    async fn request_start(
        &self,
        connection: &Connection,
        service: ServiceType,
        encrypted: bool,
    ) -> Result<()> {
        let hash_id = if service == ServiceType::Rpc {
            self.hash_id()
        } else {
            0
        };
        connection
            .request_service(self, ControlFunction::StartService, service, encrypted, hash_id)
            .await
    }

    async fn start_rpc(&self, connection: &Connection) -> Result<()> {
        if self.inner.rpc_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.request_start(connection, ServiceType::Rpc, false).await;
        if result.is_err() {
            self.inner.rpc_requested.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn send_handshake(
        &self,
        connection: &Connection,
        data: &[u8],
        session_id: u8,
        version: u8,
    ) -> Result<()> {
        let sequence = self.inner.security_sequence.fetch_add(1, Ordering::SeqCst);
        let payload = SecurityQueryHeader::handshake(sequence).wrap(data);
        let packet = Packet::control(ControlFunction::Security.as_u8(), session_id, payload)
            .with_version(version);
        debug!("Sending {} handshake bytes", data.len());
        connection.send(&packet).await
    }

    async fn on_security_initialized(&self) {
        let queued = std::mem::take(&mut *self.inner.pending_secure.lock());
        if queued.is_empty() {
            return;
        }
        let Some(connection) = self.connection() else {
            return;
        };

        info!("Handshake complete, starting {} encrypted services", queued.len());
        for service in queued {
            if let Err(e) = self.request_start(&connection, service, true).await {
                warn!("Encrypted start of {} failed: {}", service, e);
            }
        }
    }

    fn start_heartbeat(&self) {
        let config = &self.inner.config.heartbeat;
        if !config.enabled {
            return;
        }
        let mut heartbeat = self.inner.heartbeat.lock();
        if heartbeat.as_ref().map_or(false, HeartbeatMonitor::is_running) {
            return;
        }
        let handler: Weak<dyn HeartbeatHandler> = self.inner.this.clone();
        *heartbeat = Some(HeartbeatMonitor::start(config, handler));
    }

    fn stop_heartbeat(&self) {
        if let Some(monitor) = self.inner.heartbeat.lock().take() {
            monitor.stop();
        }
    }

    // ------------------------------------------------------------------
    // Connection callbacks
    // ------------------------------------------------------------------

    pub(crate) async fn on_transport_connected(&self, connection: &Arc<Connection>) {
        if !self.is_on(connection) {
            return;
        }
        if let Err(e) = self.start_rpc(connection).await {
            warn!("RPC start failed: {}", e);
        }
    }

    pub(crate) async fn on_transport_disconnected(
        &self,
        connection: &Arc<Connection>,
        reason: Option<&str>,
    ) {
        if !self.is_on(connection) {
            return;
        }
        self.stop_heartbeat();
        self.inner.rpc_requested.store(false, Ordering::SeqCst);
        self.inner.listener.on_transport_disconnected(reason);

        if connection.driver().config().auto_reconnect {
            return;
        }
        if self.inner.registry.reattach(self, connection).await {
            if let Some(next) = self.connection() {
                if next.is_connected() {
                    if let Err(e) = self.start_rpc(&next).await {
                        warn!("RPC start after reattach failed: {}", e);
                    }
                }
            }
        }
    }

    pub(crate) fn on_transport_error(&self, reason: &str) {
        self.inner.listener.on_transport_error(reason);
    }

    pub(crate) fn on_message(&self, packet: &Packet) {
        self.inner.listener.on_message(packet);
    }

    pub(crate) fn on_heartbeat_activity(&self) {
        if let Some(monitor) = self.inner.heartbeat.lock().as_ref() {
            monitor.notify_activity();
        }
    }

    pub(crate) async fn on_service_control(
        &self,
        function: ControlFunction,
        packet: &Packet,
        body: ServiceControl,
    ) {
        match function {
            ControlFunction::StartServiceAck => self.on_service_started(packet, body),
            ControlFunction::StartServiceNack => {
                if body.service == ServiceType::Rpc {
                    self.inner.rpc_requested.store(false, Ordering::SeqCst);
                }
                self.on_service_nacked(body.service, &format!("Start {} Service NACK'ed", body.service));
            }
            ControlFunction::EndServiceAck => self.on_service_ended(packet.session_id(), body.service),
            ControlFunction::EndServiceNack => {
                self.on_service_nacked(body.service, &format!("End {} Service NACK'ed", body.service));
            }
            _ => {}
        }
    }

    fn on_service_started(&self, packet: &Packet, body: ServiceControl) {
        let service = body.service;
        let session_id = packet.session_id();
        self.inner.session_id.store(session_id, Ordering::SeqCst);
        if service == ServiceType::Rpc {
            self.inner.version.store(packet.version(), Ordering::SeqCst);
        }
        if body.encrypted {
            self.inner.encrypted.lock().insert(service);
        }

        info!(
            "{} service started on session {} (encrypted: {})",
            service, session_id, body.encrypted
        );
        self.inner
            .listener
            .on_service_started(session_id, service, body.encrypted);
        for listener in self.listeners_for(service) {
            listener.on_service_started(session_id, service, body.encrypted);
        }

        self.start_heartbeat();
        if service == ServiceType::Rpc {
            self.inner.hash_id.store(body.hash_id, Ordering::SeqCst);
        }
    }

    fn on_service_ended(&self, session_id: u8, service: ServiceType) {
        info!("{} service ended on session {}", service, session_id);
        self.inner.listener.on_service_ended(session_id, service);
        for listener in self.listeners_for(service) {
            listener.on_service_ended(session_id, service);
        }
        self.inner.encrypted.lock().remove(&service);

        if service == ServiceType::Rpc {
            self.stop_heartbeat();
            self.inner.rpc_requested.store(false, Ordering::SeqCst);
        }
    }

    fn on_service_nacked(&self, service: ServiceType, reason: &str) {
        let session_id = self.session_id();
        self.inner
            .listener
            .on_service_nacked(session_id, service, reason);
        self.notify_service_error(service, reason);
    }

    /// Handshake bytes from the peer, behind a security query header
    pub(crate) async fn on_security_data(&self, packet: &Packet) {
        let Some(provider) = self.inner.config.security.clone() else {
            debug!("Handshake data without a provider, dropped");
            return;
        };

        let (_, data) = match SecurityQueryHeader::split(packet.payload()) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Malformed handshake packet: {}", e);
                return;
            }
        };

        let mut output = vec![0u8; HANDSHAKE_BUFFER_SIZE];
        let written = provider.run_handshake(&data, &mut output).min(output.len());
        if written > 0 {
            if let Some(connection) = self.connection() {
                if let Err(e) = self
                    .send_handshake(
                        &connection,
                        &output[..written],
                        packet.session_id(),
                        packet.version(),
                    )
                    .await
                {
                    warn!("Handshake reply failed: {}", e);
                }
            }
        }

        if provider.is_complete() {
            self.on_security_initialized().await;
        }
    }

    fn is_on(&self, connection: &Arc<Connection>) -> bool {
        self.connection()
            .map_or(false, |current| Arc::ptr_eq(&current, connection))
    }
}

#[async_trait]
impl HeartbeatHandler for SessionInner {
    async fn send_heartbeat(&self) {
        let Some(connection) = self.connection.lock().clone() else {
            return;
        };
        let packet = Packet::control(
            ControlFunction::Heartbeat.as_u8(),
            self.session_id.load(Ordering::SeqCst),
            Bytes::new(),
        )
        .with_version(self.version.load(Ordering::SeqCst));
        if let Err(e) = connection.send(&packet).await {
            warn!("Heartbeat send failed: {}", e);
        }
    }

    async fn heartbeat_timed_out(&self) {
        let session_id = self.session_id.load(Ordering::SeqCst);
        self.listener.on_heartbeat_timeout(session_id);

        // Closing stops this monitor, so it runs on its own task
        if let Some(inner) = self.this.upgrade() {
            let session = Session { inner };
            tokio::spawn(async move {
                session.close().await;
            });
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("version", &self.version())
            .field("hash_id", &self.hash_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}
