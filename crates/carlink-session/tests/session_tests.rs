//! Session Lifecycle Tests
//!
//! Runs sessions against the scripted head unit from carlink-test-utils:
//! - RPC start, session id and hash id assignment
//! - Plain and encrypted service start/end
//! - NACK reporting
//! - Handshake interception
//! - Heartbeats and heartbeat timeouts
//! - Behaviour without a connection

use bytes::Bytes;
use carlink_core::{ControlFunction, Packet, SecurityQueryHeader, ServiceType, TransportKind};
use carlink_session::{
    create_session, ConnectionRegistry, HeartbeatConfig, ServiceListener, Session, SessionConfig,
};
use carlink_test_utils::{
    init_tracing, wait_for, HeadUnit, HeadUnitConfig, MemoryConnector, MockHandshakeProvider,
    PeerAcceptor, RecordingServiceListener, RecordingSessionListener, ServiceEvent, SessionEvent,
    CLIENT_FINISHED, CLIENT_HELLO, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT, SERVER_HELLO,
};
use carlink_transport::{RetryPolicy, TransportConfig};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn transport(connector: Arc<MemoryConnector>) -> TransportConfig {
    TransportConfig::custom(connector).with_retry(RetryPolicy::fixed(3, Duration::from_millis(50)))
}

struct Harness {
    session: Session,
    listener: Arc<RecordingSessionListener>,
    registry: Arc<ConnectionRegistry>,
    head: HeadUnit,
    _acceptor: PeerAcceptor,
}

async fn start_with(config: impl FnOnce(SessionConfig) -> SessionConfig, head: HeadUnitConfig) -> Harness {
    init_tracing();
    let (connector, mut acceptor) = MemoryConnector::new(TransportKind::Usb);
    let registry = Arc::new(ConnectionRegistry::new());
    let listener = RecordingSessionListener::new();

    let session = create_session(
        5,
        listener.clone(),
        config(SessionConfig::new(transport(connector))),
        registry.clone(),
    );
    session.start_session().await.expect("start_session failed");

    let head = acceptor
        .accept_head_unit(head)
        .await
        .expect("No channel opened");
    assert!(
        listener.wait_for_started(ServiceType::Rpc).await,
        "RPC service never started"
    );

    Harness {
        session,
        listener,
        registry,
        head,
        _acceptor: acceptor,
    }
}

async fn start_default() -> Harness {
    start_with(|c| c, HeadUnitConfig::default()).await
}

// ============================================================================
// Session Start
// ============================================================================

#[tokio::test]
async fn test_rpc_start_assigns_session_and_hash_id() {
    let h = start_default().await;

    assert_eq!(h.session.session_id(), 1);
    let session = h.session.clone();
    assert!(
        wait_for(
            || {
                let hash = session.hash_id();
                async move { hash == 0x1234_5678 }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );
    assert!(h.session.is_connected());
    assert_eq!(h.session.transport_kind(), Some(TransportKind::Usb));

    let requests = h.head.service_requests(ControlFunction::StartService);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].service, ServiceType::Rpc);
    assert!(!requests[0].encrypted);
}

#[tokio::test]
async fn test_start_session_twice_is_noop() {
    let h = start_default().await;
    h.session.start_session().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.head.service_requests(ControlFunction::StartService).len(), 1);
    assert_eq!(h.registry.len(), 1);
}

// ============================================================================
// Service Start / End
// ============================================================================

#[tokio::test]
async fn test_plain_service_start_and_end() {
    let h = start_default().await;
    let pcm = RecordingServiceListener::new();
    h.session.add_service_listener(ServiceType::Pcm, pcm.clone());

    h.session.start_service(ServiceType::Pcm, false).await.unwrap();
    assert!(pcm.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert_eq!(
        pcm.events()[0],
        ServiceEvent::Started {
            service: ServiceType::Pcm,
            encrypted: false
        }
    );
    assert!(!h.session.is_service_protected(ServiceType::Pcm));

    h.session.end_service(ServiceType::Pcm).await.unwrap();
    assert!(pcm.wait_for_count(2, DEFAULT_TIMEOUT).await);
    assert_eq!(
        pcm.events()[1],
        ServiceEvent::Ended {
            service: ServiceType::Pcm
        }
    );
    assert!(h.listener.has(|e| matches!(
        e,
        SessionEvent::ServiceEnded {
            session_id: 1,
            service: ServiceType::Pcm
        }
    )));
}

#[tokio::test]
async fn test_removed_service_listener_is_not_called() {
    let h = start_default().await;
    let kept = RecordingServiceListener::new();
    let removed = RecordingServiceListener::new();
    let removed_dyn: Arc<dyn ServiceListener> = removed.clone();

    h.session.add_service_listener(ServiceType::Nav, kept.clone());
    h.session.add_service_listener(ServiceType::Nav, removed_dyn.clone());
    h.session.remove_service_listener(ServiceType::Nav, &removed_dyn);

    h.session.start_service(ServiceType::Nav, false).await.unwrap();
    assert!(kept.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert_eq!(removed.count(), 0);
}

#[tokio::test]
async fn test_start_nack_reports_service_error() {
    let h = start_with(|c| c, HeadUnitConfig::default().nacking_start(ServiceType::Nav)).await;
    let nav = RecordingServiceListener::new();
    h.session.add_service_listener(ServiceType::Nav, nav.clone());

    h.session.start_service(ServiceType::Nav, false).await.unwrap();
    assert!(nav.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert_eq!(
        nav.events()[0],
        ServiceEvent::Error {
            service: ServiceType::Nav,
            reason: "Start NAV Service NACK'ed".to_string()
        }
    );
    assert!(h.listener.has(|e| matches!(
        e,
        SessionEvent::ServiceNacked { service: ServiceType::Nav, reason } if reason == "Start NAV Service NACK'ed"
    )));

    // Session survives a NACK
    assert!(h.session.is_connected());
}

#[tokio::test]
async fn test_end_nack_reports_service_error() {
    let h = start_with(|c| c, HeadUnitConfig::default().nacking_end(ServiceType::Pcm)).await;
    let pcm = RecordingServiceListener::new();
    h.session.add_service_listener(ServiceType::Pcm, pcm.clone());

    h.session.start_service(ServiceType::Pcm, false).await.unwrap();
    assert!(pcm.wait_for_count(1, DEFAULT_TIMEOUT).await);
    h.session.end_service(ServiceType::Pcm).await.unwrap();
    assert!(pcm.wait_for_count(2, DEFAULT_TIMEOUT).await);

    assert_eq!(
        pcm.events()[1],
        ServiceEvent::Error {
            service: ServiceType::Pcm,
            reason: "End PCM Service NACK'ed".to_string()
        }
    );
}

// ============================================================================
// Encryption
// ============================================================================

#[tokio::test]
async fn test_encrypted_without_provider_is_an_error() {
    let h = start_default().await;
    let pcm = RecordingServiceListener::new();
    h.session.add_service_listener(ServiceType::Pcm, pcm.clone());

    h.session.start_service(ServiceType::Pcm, true).await.unwrap();
    assert!(pcm.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert!(matches!(pcm.events()[0], ServiceEvent::Error { service: ServiceType::Pcm, .. }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let pcm_requests = h
        .head
        .service_requests(ControlFunction::StartService)
        .into_iter()
        .filter(|r| r.service == ServiceType::Pcm)
        .count();
    assert_eq!(pcm_requests, 0);
}

#[tokio::test]
async fn test_encrypted_service_after_handshake() {
    let provider = MockHandshakeProvider::new();
    let h = start_with(
        {
            let provider = provider.clone();
            move |c| c.with_security(provider)
        },
        HeadUnitConfig::default().with_handshake_reply(SERVER_HELLO),
    )
    .await;

    h.session.start_service(ServiceType::Pcm, true).await.unwrap();
    assert!(
        h.listener
            .wait_for(
                |e| matches!(
                    e,
                    SessionEvent::ServiceStarted {
                        service: ServiceType::Pcm,
                        encrypted: true,
                        ..
                    }
                ),
                DEFAULT_TIMEOUT
            )
            .await
    );
    assert!(h.session.is_service_protected(ServiceType::Pcm));
    assert_eq!(provider.initialize_calls(), 1);
    assert_eq!(provider.inputs(), vec![SERVER_HELLO.to_vec()]);

    // Client hello, then client finished, each behind a query header
    let handshakes = h.head.received_control(ControlFunction::Security);
    assert_eq!(handshakes.len(), 2);
    let (_, hello) = SecurityQueryHeader::split(handshakes[0].payload()).unwrap();
    let (_, finished) = SecurityQueryHeader::split(handshakes[1].payload()).unwrap();
    assert_eq!(&hello[..], CLIENT_HELLO);
    assert_eq!(&finished[..], CLIENT_FINISHED);
    assert_eq!(handshakes[1].session_id(), 1);

    // Ending the service clears protection
    h.session.end_service(ServiceType::Pcm).await.unwrap();
    assert!(
        h.listener
            .wait_for(
                |e| matches!(e, SessionEvent::ServiceEnded { service: ServiceType::Pcm, .. }),
                DEFAULT_TIMEOUT
            )
            .await
    );
    assert!(!h.session.is_service_protected(ServiceType::Pcm));
}

#[tokio::test]
async fn test_queued_services_start_together() {
    let provider = MockHandshakeProvider::new();
    // No reply yet: the handshake stalls
    let h = start_with(
        {
            let provider = provider.clone();
            move |c| c.with_security(provider)
        },
        HeadUnitConfig::default(),
    )
    .await;

    h.session.start_service(ServiceType::Pcm, true).await.unwrap();
    h.session.start_service(ServiceType::Nav, true).await.unwrap();
    assert!(
        h.head
            .wait_for_control(ControlFunction::Security, 2, DEFAULT_TIMEOUT)
            .await
    );
    assert_eq!(h.head.service_requests(ControlFunction::StartService).len(), 1);

    // Peer finishes the handshake
    let reply = SecurityQueryHeader::handshake(0).wrap(SERVER_HELLO);
    h.head
        .send(&Packet::control(ControlFunction::Security.as_u8(), 1, reply))
        .await;

    assert!(
        h.head
            .wait_for_control(ControlFunction::StartService, 3, DEFAULT_TIMEOUT)
            .await
    );
    let encrypted: Vec<_> = h
        .head
        .service_requests(ControlFunction::StartService)
        .into_iter()
        .filter(|r| r.encrypted)
        .map(|r| r.service)
        .collect();
    assert_eq!(encrypted, vec![ServiceType::Pcm, ServiceType::Nav]);
}

#[tokio::test]
async fn test_instant_provider_starts_encrypted_directly() {
    let provider = MockHandshakeProvider::instant();
    let h = start_with(
        {
            let provider = provider.clone();
            move |c| c.with_security(provider)
        },
        HeadUnitConfig::default(),
    )
    .await;

    h.session.start_service(ServiceType::BulkData, true).await.unwrap();
    assert!(
        h.listener
            .wait_for(
                |e| matches!(
                    e,
                    SessionEvent::ServiceStarted {
                        service: ServiceType::BulkData,
                        encrypted: true,
                        ..
                    }
                ),
                DEFAULT_TIMEOUT
            )
            .await
    );
    assert!(h.head.received_control(ControlFunction::Security).is_empty());
}

// ============================================================================
// Heartbeats
// ============================================================================

#[tokio::test]
async fn test_heartbeats_are_sent() {
    let h = start_with(
        |c| c.with_heartbeat(HeartbeatConfig::enabled(Duration::from_millis(50), Duration::from_secs(5))),
        HeadUnitConfig::default(),
    )
    .await;

    assert!(
        h.head
            .wait_for_control(ControlFunction::Heartbeat, 3, DEFAULT_TIMEOUT)
            .await
    );
    assert!(h.session.is_connected());
    assert!(!h.listener.has(|e| matches!(e, SessionEvent::HeartbeatTimeout(_))));
}

#[tokio::test]
async fn test_heartbeat_timeout_closes_session() {
    let h = start_with(
        |c| c.with_heartbeat(HeartbeatConfig::enabled(Duration::from_millis(50), Duration::from_millis(300))),
        HeadUnitConfig::default().without_heartbeat_acks(),
    )
    .await;

    assert!(
        h.listener
            .wait_for(|e| matches!(e, SessionEvent::HeartbeatTimeout(1)), DEFAULT_TIMEOUT)
            .await
    );

    let session = h.session.clone();
    assert!(
        wait_for(
            || {
                let gone = session.connection().is_none();
                async move { gone }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_peer_heartbeat_is_acknowledged() {
    let h = start_default().await;

    h.head
        .send(&Packet::control(ControlFunction::Heartbeat.as_u8(), 1, Bytes::new()))
        .await;
    assert!(
        h.head
            .wait_for_control(ControlFunction::HeartbeatAck, 1, DEFAULT_TIMEOUT)
            .await
    );
    assert_eq!(
        h.head.received_control(ControlFunction::HeartbeatAck)[0].session_id(),
        1
    );
}

// ============================================================================
// Messages and Transport Events
// ============================================================================

#[tokio::test]
async fn test_messages_reach_the_listener() {
    let h = start_default().await;

    let packet = Packet::new(ServiceType::Rpc, 1, &b"{\"fn\":\"Show\"}"[..]);
    h.head.send(&packet).await;
    assert!(
        h.listener
            .wait_for(|e| *e == SessionEvent::Message(packet.clone()), DEFAULT_TIMEOUT)
            .await
    );
}

#[tokio::test]
async fn test_send_data_uses_session_id() {
    let h = start_default().await;

    h.session
        .send_data(ServiceType::BulkData, &b"file"[..])
        .await
        .unwrap();
    assert!(
        h.head
            .wait_until(
                |packets| packets.iter().any(|p| p.service_type() == ServiceType::BulkData),
                DEFAULT_TIMEOUT
            )
            .await
    );
    let sent = h.head.received_on(ServiceType::BulkData);
    assert_eq!(sent[0].session_id(), 1);
    assert_eq!(&sent[0].payload()[..], b"file");
}

#[tokio::test]
async fn test_peer_hangup_notifies_listener() {
    let h = start_default().await;
    let listener = h.listener.clone();
    drop(h.head);

    assert!(
        listener
            .wait_for(
                |e| matches!(e, SessionEvent::TransportDisconnected(_)),
                DEFAULT_TIMEOUT
            )
            .await
    );
}

// ============================================================================
// Without a Connection / Close
// ============================================================================

#[tokio::test]
async fn test_operations_without_connection_are_noops() {
    let (connector, _acceptor) = MemoryConnector::new(TransportKind::Tcp);
    let session = create_session(
        5,
        RecordingSessionListener::new(),
        SessionConfig::new(transport(connector.clone())),
        Arc::new(ConnectionRegistry::new()),
    );

    assert!(session.start_service(ServiceType::Pcm, false).await.is_ok());
    assert!(session.end_service(ServiceType::Pcm).await.is_ok());
    assert!(session
        .send_message(&Packet::new(ServiceType::Rpc, 0, Bytes::new()))
        .await
        .is_ok());
    assert!(!session.is_connected());
    assert_eq!(connector.attempts(), 0);

    session.close().await;
}

#[tokio::test]
async fn test_close_releases_connection_and_provider() {
    let provider = MockHandshakeProvider::new();
    let h = start_with(
        {
            let provider = provider.clone();
            move |c| c.with_security(provider)
        },
        HeadUnitConfig::default(),
    )
    .await;
    let connection = h.session.connection().unwrap();

    h.session.close().await;

    assert_eq!(provider.shutdown_calls(), 1);
    assert!(h.session.connection().is_none());
    assert!(h.registry.is_empty());
    assert!(connection.is_closed());
    assert_eq!(connection.register_count(), 0);
}
