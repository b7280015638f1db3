//! Physical connections
//!
//! A [`Connection`] wraps one [`TransportDriver`] and dispatches every packet
//! it produces to the sessions registered on it. Start and end
//! acknowledgements are matched to the requesting session by correlation id;
//! everything else is matched by session id.

use bytes::Bytes;
use carlink_core::{ControlFunction, Packet, ServiceControl, ServiceType, TransportKind};
use carlink_transport::{DriverState, TransportConfig, TransportDriver, TransportEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::session::{Session, WeakSession};

/// One physical transport shared by zero or more sessions
pub struct Connection {
    id: Uuid,
    kind: TransportKind,
    driver: TransportDriver,
    /// Registered sessions, in registration order
    sessions: Mutex<Vec<WeakSession>>,
    /// Outstanding start/end requests by correlation id
    pending: Mutex<HashMap<u32, WeakSession>>,
    next_correlation: AtomicU32,
    closed: AtomicBool,
}

impl Connection {
    /// Create a connection and start connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: &TransportConfig) -> Arc<Self> {
        let (driver, events) = TransportDriver::new(config.connector(), config.driver.clone());
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            kind: config.kind(),
            driver: driver.clone(),
            sessions: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_correlation: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });

        info!("Connection {} opening {}", connection.id, config.describe());

        tokio::spawn(dispatch(Arc::downgrade(&connection), events));
        tokio::spawn(async move {
            if let Err(e) = driver.connect().await {
                warn!("Initial connect failed: {}", e);
            }
        });

        connection
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn driver(&self) -> &TransportDriver {
        &self.driver
    }

    pub fn state(&self) -> DriverState {
        self.driver.state()
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    /// Connected, or a connect attempt is in flight
    pub fn is_connected_or_pending(&self) -> bool {
        matches!(
            self.driver.state(),
            DriverState::Connected | DriverState::Connecting
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of registered sessions
    pub fn register_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_registered(&self, session: &Session) -> bool {
        self.sessions.lock().iter().any(|w| w.ptr_eq(session))
    }

    /// Register a session. Returns the new count.
    pub(crate) fn register(&self, session: &Session) -> usize {
        let mut sessions = self.sessions.lock();
        if !sessions.iter().any(|w| w.ptr_eq(session)) {
            sessions.push(session.downgrade());
        }
        sessions.len()
    }

    /// Unregister a session. Returns the remaining count.
    pub(crate) fn unregister(&self, session: &Session) -> usize {
        self.pending.lock().retain(|_, w| !w.ptr_eq(session));
        let mut sessions = self.sessions.lock();
        sessions.retain(|w| !w.ptr_eq(session));
        sessions.len()
    }

    /// Send a packet as is
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        self.driver.send(packet).await?;
        Ok(())
    }

    /// Send a START_SERVICE or END_SERVICE request on behalf of `session`
    pub(crate) async fn request_service(
        &self,
        session: &Session,
        function: ControlFunction,
        service: ServiceType,
        encrypted: bool,
        hash_id: u32,
    ) -> Result<()> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(correlation_id, session.downgrade());

        let body = ServiceControl::new(service, correlation_id)
            .with_encrypted(encrypted)
            .with_hash_id(hash_id);
        let packet = Packet::control(function.as_u8(), session.session_id(), body.encode())
            .with_version(session.version());

        debug!(
            "Connection {}: {:?} {} (correlation {})",
            self.id, function, service, correlation_id
        );

        if let Err(e) = self.driver.send(&packet).await {
            self.pending.lock().remove(&correlation_id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop the transport. Registered sessions are left alone.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Connection {} closing", self.id);
        self.pending.lock().clear();
        self.driver.stop().await;
    }

    fn sessions(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .iter()
            .filter_map(WeakSession::upgrade)
            .collect()
    }

    fn find_session(&self, session_id: u8) -> Option<Session> {
        self.sessions()
            .into_iter()
            .find(|s| s.session_id() == session_id)
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                for session in self.sessions() {
                    session.on_transport_connected(self).await;
                }
            }
            TransportEvent::Disconnected { reason } => {
                self.pending.lock().clear();
                for session in self.sessions() {
                    session.on_transport_disconnected(self, reason.as_deref()).await;
                }
            }
            TransportEvent::ConnectFailed { attempts } => {
                let reason = format!("connect failed after {} attempts", attempts);
                for session in self.sessions() {
                    session.on_transport_error(&reason);
                }
            }
            TransportEvent::Packet { packet, .. } => self.route(packet).await,
            TransportEvent::StateChanged(_) => {}
        }
    }

    async fn route(&self, packet: Packet) {
        let Some(function_id) = packet.function_id() else {
            match self.find_session(packet.session_id()) {
                Some(session) => session.on_message(&packet),
                None => debug!(
                    "Connection {}: no session {} for {} packet",
                    self.id,
                    packet.session_id(),
                    packet.service_type()
                ),
            }
            return;
        };

        let function = match ControlFunction::try_from(function_id) {
            Ok(function) => function,
            Err(e) => {
                debug!("Connection {}: {}", self.id, e);
                return;
            }
        };

        match function {
            ControlFunction::StartServiceAck
            | ControlFunction::StartServiceNack
            | ControlFunction::EndServiceAck
            | ControlFunction::EndServiceNack => {
                let body = match ServiceControl::decode(packet.payload().clone()) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Connection {}: bad {:?} body: {}", self.id, function, e);
                        return;
                    }
                };
                let requester = self
                    .pending
                    .lock()
                    .remove(&body.correlation_id)
                    .and_then(|w| w.upgrade());
                match requester.or_else(|| self.find_session(packet.session_id())) {
                    Some(session) => session.on_service_control(function, &packet, body).await,
                    None => debug!(
                        "Connection {}: unmatched {:?} (correlation {})",
                        self.id, function, body.correlation_id
                    ),
                }
            }
            ControlFunction::Heartbeat => {
                let ack = Packet::control(
                    ControlFunction::HeartbeatAck.as_u8(),
                    packet.session_id(),
                    Bytes::new(),
                )
                .with_version(packet.version());
                if let Err(e) = self.driver.send(&ack).await {
                    warn!("Connection {}: heartbeat ack failed: {}", self.id, e);
                }
                if let Some(session) = self.find_session(packet.session_id()) {
                    session.on_heartbeat_activity();
                }
            }
            ControlFunction::HeartbeatAck => {
                if let Some(session) = self.find_session(packet.session_id()) {
                    session.on_heartbeat_activity();
                }
            }
            ControlFunction::Security => match self.find_session(packet.session_id()) {
                Some(session) => session.on_security_data(&packet).await,
                None => debug!("Connection {}: handshake data for unknown session", self.id),
            },
            ControlFunction::StartService | ControlFunction::EndService => {
                debug!("Connection {}: ignoring peer {:?}", self.id, function);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("sessions", &self.register_count())
            .finish()
    }
}

/// Drains driver events until the connection is gone
async fn dispatch(connection: Weak<Connection>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        if connection.is_closed() {
            continue;
        }
        connection.handle_event(event).await;
    }
}
