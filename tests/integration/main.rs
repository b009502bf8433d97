//! Cross-crate scenario tests for the valvelink firmware core: chunk
//! reassembly under realistic transport conditions, a full Security1
//! handshake driven purely through wire bytes (as a transport would see
//! them), command routing end to end through the dispatch queues, and
//! error manager exhaustion/cooldown behavior.

use std::sync::Arc;

use valvelink_core::crypto::{self, Keypair};
use valvelink_core::error::{ErrorCategory, ErrorComponent, ErrorSeverity};
use valvelink_core::message::{Frame, Origin, RespFrame};
use valvelink_core::wire::LegacyFrame;
use valvelink_services::chunk_manager::{ChunkManager, ChunkManagerConfig, ReceiveOutcome};
use valvelink_services::error_manager::{ErrorManager, ErrorReport, RecoveryDecision, RecoveryOutcome};
use valvelink_services::router::{CommandRouter, EchoHandler, StatusHandler};
use valvelink_services::security1::{Security1Session, TransportKind};

fn manager() -> ChunkManager {
    ChunkManager::new(ChunkManagerConfig {
        max_chunk_size: 23,
        max_concurrent_frames: 8,
        reassembly_timeout_ms: 10_000,
    })
}

/// A legacy frame too large for one BLE notification is chunked, delivered
/// out of order as a lossy link would reorder it, and reassembles back to
/// the exact encoded frame bytes.
#[test]
fn chunked_frame_survives_reordered_delivery() {
    let mgr = manager();
    let frame = LegacyFrame {
        id: 99,
        op: "set_valve".to_string(),
        payload: vec![0xAB; 80],
    };
    let encoded = frame.encode();
    let chunks = mgr.send(&encoded).unwrap();
    assert!(chunks.len() > 1, "payload must actually require chunking for this test");

    let mut order: Vec<usize> = (0..chunks.len()).collect();
    order.reverse();
    let mut assembled = None;
    for &i in &order {
        if let (ReceiveOutcome::Complete, Some(bytes)) = mgr.receive(0, &chunks[i]).unwrap() {
            assembled = Some(bytes);
        }
    }
    let decoded = LegacyFrame::decode(&assembled.unwrap()).unwrap();
    assert_eq!(decoded, frame);
}

/// Two independent Security1 sessions (one per transport) each run their
/// own handshake against their own simulated client and never share
/// session key material.
#[test]
fn ble_and_mqtt_sessions_handshake_independently() {
    let ble_session = Security1Session::new();
    let mqtt_session = Security1Session::new();
    ble_session.start(0, TransportKind::Ble, "ble_pop_0001").unwrap();
    mqtt_session.start(0, TransportKind::Mqtt, "mqtt_pop_0002").unwrap();

    let ble_client = Keypair::generate();
    let mqtt_client = Keypair::generate();

    let ble_establish_resp = drive_establish(&ble_session, &ble_client);
    let mqtt_establish_resp = drive_establish(&mqtt_session, &mqtt_client);

    let ble_device_pub: [u8; 32] = ble_establish_resp[3..35].try_into().unwrap();
    let mqtt_device_pub: [u8; 32] = mqtt_establish_resp[3..35].try_into().unwrap();
    assert_ne!(ble_device_pub, mqtt_device_pub);

    drive_verify(&ble_session, &ble_client, &ble_establish_resp, "ble_pop_0001");
    drive_verify(&mqtt_session, &mqtt_client, &mqtt_establish_resp, "mqtt_pop_0002");

    ble_session.activate().unwrap();
    mqtt_session.activate().unwrap();

    let ble_ct = ble_session.encrypt(0, b"open valve 1").unwrap();
    // The MQTT session's key cannot decrypt a BLE-encrypted payload.
    assert!(mqtt_session.decrypt(0, &ble_ct).is_err());
    assert_eq!(ble_session.decrypt(0, &ble_ct).unwrap(), b"open valve 1");
}

fn drive_establish(session: &Security1Session, client: &Keypair) -> [u8; 51] {
    let mut req = vec![1u8, 1, 32];
    req.extend_from_slice(&client.public);
    session.process_session_establish(0, &req).unwrap()
}

fn drive_verify(session: &Security1Session, client: &Keypair, establish_resp: &[u8; 51], pop: &str) {
    let device_pub: [u8; 32] = establish_resp[3..35].try_into().unwrap();
    let device_random: [u8; 16] = establish_resp[35..51].try_into().unwrap();
    let shared = client.diffie_hellman(&device_pub);
    let session_key = crypto::derive_session_key(&shared, pop);
    let mut token = device_pub;
    crypto::aes_ctr_apply(session_key.as_bytes(), &device_random, &mut token);
    let mut verify_req = vec![1u8, 2, 0x00, 0x20];
    verify_req.extend_from_slice(&token);
    session.process_session_verify(0, &verify_req).unwrap();
}

/// A frame dispatched through the actual router task (not calling
/// `dispatch()` directly) comes back on the response queue matching its
/// origin, carrying the handler's status and payload.
#[tokio::test]
async fn router_task_answers_on_matching_origin_queue() {
    let mut router = CommandRouter::new();
    router.register("echo", Box::new(EchoHandler));
    router.register("status", Box::new(StatusHandler));
    let router = Arc::new(router);

    let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::channel::<Frame>(8);
    let (ble_tx, mut ble_rx) = tokio::sync::mpsc::channel::<RespFrame>(8);
    let (mqtt_tx, mut mqtt_rx) = tokio::sync::mpsc::channel::<RespFrame>(8);
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);

    // Mirrors valvelinkd::dispatch::spawn_router_task's loop shape without
    // depending on the binary crate from this dev-dependency test target.
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                frame = cmd_rx.recv() => {
                    let Some(frame) = frame else { return };
                    let origin = frame.origin;
                    let resp = router.dispatch(frame);
                    let tx = match origin {
                        Origin::Ble => &ble_tx,
                        Origin::Mqtt => &mqtt_tx,
                    };
                    let _ = tx.send(resp).await;
                }
            }
        }
    });

    cmd_tx
        .send(Frame {
            id: 5,
            op: "echo".into(),
            payload: b"valve-1".to_vec(),
            origin: Origin::Ble,
            is_final: true,
        })
        .await
        .unwrap();
    cmd_tx
        .send(Frame {
            id: 6,
            op: "unknown_op".into(),
            payload: Vec::new(),
            origin: Origin::Mqtt,
            is_final: true,
        })
        .await
        .unwrap();

    let ble_resp = ble_rx.recv().await.unwrap();
    assert_eq!(ble_resp.id, 5);
    assert_eq!(ble_resp.status, 0);
    assert_eq!(ble_resp.payload, b"valve-1");

    let mqtt_resp = mqtt_rx.recv().await.unwrap();
    assert_eq!(mqtt_resp.id, 6);
    assert_eq!(mqtt_resp.status, -1);
    assert!(mqtt_resp.payload.is_empty());

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

/// A component whose recovery callback is missing fails its first recovery
/// attempt; since `consecutive_failures` climbs on every report regardless
/// of outcome, the very next report already finds the component exhausted,
/// after which `report()` stops recommending recovery until it is
/// re-registered or a successful recovery resets the counter.
#[tokio::test]
async fn error_manager_exhausts_after_repeated_failed_recovery() {
    use valvelink_core::config::RecoveryDefaults;

    let mgr = ErrorManager::new();
    let cfg = RecoveryDefaults {
        max_consecutive_errors: 2,
        recovery_cooldown_ms: 5_000,
        auto_recovery_enabled: true,
        escalate_on_failure: true,
        ..RecoveryDefaults::default()
    };
    mgr.register(ErrorComponent::MqttTransport, cfg, None);

    let make_report = || ErrorReport {
        component: ErrorComponent::MqttTransport,
        category: ErrorCategory::Protocol,
        severity: ErrorSeverity::Error,
        error_code: 7,
        underlying_code: 0,
        context_data: 0,
        description: "malformed handshake frame".to_string(),
    };

    // First report: consecutive_failures goes 0 -> 1, still under the max.
    let first = mgr.report(0, make_report());
    assert!(matches!(first, RecoveryDecision::Attempt(_)));

    // Recovery has no callback to call for ResetState, so it fails and
    // escalates. Failure alone no longer bumps consecutive_failures —
    // only report() does — so it's still 1 after this.
    let outcome = mgr
        .recover(0, ErrorComponent::MqttTransport, strategy_of(first))
        .await
        .unwrap();
    assert!(matches!(outcome, RecoveryOutcome::Escalated(_)));

    // Second report: consecutive_failures goes 1 -> 2, hitting the
    // configured max, so this report is exhausted outright.
    let second = mgr.report(1_000, make_report());
    assert_eq!(second, RecoveryDecision::SkipExhausted);

    assert!(mgr.is_degraded(1_000, ErrorComponent::MqttTransport));
}

fn strategy_of(decision: RecoveryDecision) -> valvelink_core::error::RecoveryStrategy {
    match decision {
        RecoveryDecision::Attempt(strategy) => strategy,
        _ => panic!("expected an Attempt decision"),
    }
}
