//! Connection multiplexer
//!
//! The registry owns the shareable connections. Sessions asking for a
//! transport kind that is already open are placed on the least loaded
//! connection of that kind; a connection leaves the registry, and closes its
//! transport, when its last session is released.

use carlink_transport::TransportConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::session::Session;

/// Shared connections, scanned and modified under one lock
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create a connection for `session` and register it there.
    ///
    /// With sharing enabled the connection of the same kind with the lowest
    /// registration count wins, the earliest one on a tie. Without sharing a
    /// private connection is created that never enters the registry.
    pub fn acquire(&self, session: &Session, config: &TransportConfig) -> Arc<Connection> {
        let connection = if config.share_connection {
            let mut connections = self.connections.lock();
            let kind = config.kind();

            let mut best: Option<&Arc<Connection>> = None;
            for candidate in connections.iter().filter(|c| c.kind() == kind) {
                let count = candidate.register_count();
                if count == 0 {
                    continue;
                }
                if best.map_or(true, |b| count < b.register_count()) {
                    best = Some(candidate);
                }
            }

            match best.cloned() {
                Some(existing) => {
                    existing.register(session);
                    debug!(
                        "Sharing connection {} ({} sessions)",
                        existing.id(),
                        existing.register_count()
                    );
                    existing
                }
                None => {
                    let created = Connection::open(config);
                    created.register(session);
                    connections.push(Arc::clone(&created));
                    created
                }
            }
        } else {
            let created = Connection::open(config);
            created.register(session);
            created
        };

        session.set_connection(Some(Arc::clone(&connection)));
        connection
    }

    /// Unregister `session` from its connection. The connection is removed
    /// and closed when no session is left on it.
    pub async fn release(&self, session: &Session) {
        let Some(connection) = session.set_connection(None) else {
            return;
        };

        let remaining = {
            let mut connections = self.connections.lock();
            let remaining = connection.unregister(session);
            if remaining == 0 {
                connections.retain(|c| !Arc::ptr_eq(c, &connection));
            }
            remaining
        };

        if remaining == 0 {
            info!("Connection {} has no sessions left", connection.id());
            connection.close().await;
        }
    }

    /// Move `session` off a failed connection onto another open connection of
    /// the same kind. Returns whether it found one.
    pub async fn reattach(&self, session: &Session, failed: &Arc<Connection>) -> bool {
        let (target, orphaned) = {
            let mut connections = self.connections.lock();
            connections.retain(|c| !Arc::ptr_eq(c, failed));
            let orphaned = failed.unregister(session) == 0;

            let target = connections
                .iter()
                .find(|c| c.kind() == failed.kind() && c.is_connected_or_pending())
                .cloned();
            if let Some(target) = &target {
                target.register(session);
            }
            (target, orphaned)
        };

        if orphaned {
            failed.close().await;
        }

        match target {
            Some(target) => {
                info!(
                    "Session moved from connection {} to {}",
                    failed.id(),
                    target.id()
                );
                session.set_connection(Some(target));
                true
            }
            None => {
                session.set_connection(None);
                false
            }
        }
    }

    /// Number of shared connections
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Snapshot of the shared connections, in registry order
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .finish()
    }
}
