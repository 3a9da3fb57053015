mod common;

use common::{MockTransport, key, respond, respond_with};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tuyalan::batch::BatchPacketBuilder;
use tuyalan::crypto;
use tuyalan::negotiation::{self, ResponseBody};
use tuyalan::transport::{Transport, UdpTransport};
use tuyalan::{
    DeviceInfo, Manager, ManagerConfig, NegotiationEvent, NegotiatorState, TuyaError, Version,
};

const SHORT: Option<Duration> = Some(Duration::from_millis(30));

fn device(n: u8) -> DeviceInfo {
    DeviceInfo::new(format!("dev{}", n), key(n)).with_ip(format!("10.0.0.{}", n).parse().unwrap())
}

fn addr(n: u8) -> SocketAddr {
    format!("10.0.0.{}:6669", n).parse().unwrap()
}

fn mock_manager() -> (Arc<MockTransport>, Manager) {
    let mock = Arc::new(MockTransport::new());
    let manager = Manager::with_transport(mock.clone(), ManagerConfig::default());
    (mock, manager)
}

fn drain(rx: &mut broadcast::Receiver<NegotiationEvent>) -> Vec<NegotiationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn batch_with_one_responder() {
    let (mock, manager) = mock_manager();
    let mut events = manager.subscribe();

    let runner = manager.clone();
    let batch = tokio::spawn(async move {
        runner
            .start_batch_negotiation(
                vec![device(1), device(2), device(3)],
                Some(Duration::from_millis(300)),
            )
            .await
    });

    mock.wait_for(3).await;
    assert_eq!(manager.route_count(), 3);
    assert_eq!(manager.pending_count(), 3);

    let request = mock.sent_to(addr(1))[0].clone();
    let client_random = negotiation::decode_request(&request, &key(1)).unwrap().random;
    let response = respond(&request, &key(1), [7; 16]);
    assert!(manager.route_response(&response, addr(1)).await);

    let report = batch.await.unwrap();
    assert_eq!(report.succeeded, vec!["dev1"]);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.error_for("dev2"), Some(&TuyaError::Timeout));
    assert_eq!(report.error_for("dev3"), Some(&TuyaError::Timeout));

    assert_eq!(manager.pending_count(), 0);
    assert_eq!(manager.route_count(), 0);
    assert_eq!(manager.state_of("dev1"), Some(NegotiatorState::Established));
    assert_eq!(manager.state_of("dev2"), Some(NegotiatorState::Idle));
    assert_eq!(manager.failure_count("dev1"), 0);
    assert_eq!(manager.failure_count("dev2"), 1);

    let session = manager.session("dev1").unwrap();
    let client_random = hex::decode(client_random).unwrap();
    assert_eq!(
        session.session_key,
        crypto::derive_session_key(key(1).as_bytes(), &client_random, &[7; 16])
    );

    let events = drain(&mut events);
    assert_eq!(events.len(), 3);
    assert!(matches!(
        &events[0],
        NegotiationEvent::Success { device_id, port: 6669, .. } if device_id == "dev1"
    ));
    assert!(events[1..]
        .iter()
        .all(|e| matches!(e, NegotiationEvent::Error { reason: TuyaError::Timeout, .. })));
}

#[tokio::test]
async fn finish_frame_follows_success() {
    let (mock, manager) = mock_manager();
    let runner = manager.clone();
    let task = tokio::spawn(async move { runner.negotiate(device(4), None).await });

    mock.wait_for(1).await;
    let request = mock.sent_to(addr(4))[0].clone();
    assert!(manager.route_response(&respond(&request, &key(4), [3; 16]), addr(4)).await);
    let session = task.await.unwrap().unwrap();

    let sent = mock.sent_to(addr(4));
    assert_eq!(sent.len(), 2);
    let proof = negotiation::decode_finish(&sent[1], &key(4), &session.session_key, &[3; 16]).unwrap();
    assert_eq!(proof, crypto::hmac_sha256(key(4).as_bytes(), &[3; 16]).unwrap());
}

#[tokio::test]
async fn offline_after_three_failures() {
    let (mock, manager) = mock_manager();
    let mut events = manager.subscribe();

    for _ in 0..2 {
        assert_eq!(manager.negotiate(device(5), SHORT).await.err(), Some(TuyaError::Timeout));
    }
    assert_eq!(manager.failure_count("dev5"), 2);
    assert!(drain(&mut events)
        .iter()
        .all(|e| !matches!(e, NegotiationEvent::Offline { .. })));

    assert!(manager.negotiate(device(5), SHORT).await.is_err());
    let third = drain(&mut events);
    assert_eq!(
        third,
        vec![
            NegotiationEvent::Error {
                device_id: "dev5".into(),
                reason: TuyaError::Timeout,
            },
            NegotiationEvent::Offline {
                device_id: "dev5".into(),
            },
        ]
    );

    // no second offline event past the threshold
    assert!(manager.negotiate(device(5), SHORT).await.is_err());
    assert_eq!(manager.failure_count("dev5"), 4);
    assert_eq!(drain(&mut events).len(), 1);

    let runner = manager.clone();
    let task = tokio::spawn(async move { runner.negotiate(device(5), None).await });
    mock.wait_for(5).await;
    let request = mock.sent_to(addr(5))[4].clone();
    assert!(manager.route_response(&respond(&request, &key(5), [1; 16]), addr(5)).await);
    assert!(task.await.unwrap().is_ok());
    assert_eq!(manager.failure_count("dev5"), 0);
}

#[tokio::test]
async fn unknown_frames_are_dropped() {
    let (mock, manager) = mock_manager();
    let mut events = manager.subscribe();

    let runner = manager.clone();
    let task = tokio::spawn(async move {
        runner
            .negotiate(device(6), Some(Duration::from_millis(200)))
            .await
    });
    mock.wait_for(1).await;
    let request = mock.sent_to(addr(6))[0].clone();

    // answer to a request nobody sent
    let stray = respond_with(
        &tuyalan::protocol::build(0x6699, 1, 3, &[0u8; 40], 0x9966).unwrap(),
        ResponseBody {
            gw_id: "dev6".into(),
            random: hex::encode([0u8; 16]),
            uuid: negotiation::device_uuid("dev6"),
        },
    );
    assert!(!manager.route_response(&stray, addr(6)).await);
    assert!(!manager.route_response(b"garbage", addr(6)).await);
    // our own broadcast looping back
    assert!(!manager.route_response(&request, addr(6)).await);

    assert_eq!(manager.route_count(), 1);
    assert_eq!(manager.state_of("dev6"), Some(NegotiatorState::RequestSent));
    assert!(drain(&mut events).is_empty());

    assert_eq!(task.await.unwrap().err(), Some(TuyaError::Timeout));
}

#[tokio::test]
async fn duplicate_response_counts_once() {
    let (mock, manager) = mock_manager();
    let mut events = manager.subscribe();

    let runner = manager.clone();
    let task = tokio::spawn(async move { runner.negotiate(device(7), None).await });
    mock.wait_for(1).await;
    let request = mock.sent_to(addr(7))[0].clone();
    let response = respond(&request, &key(7), [2; 16]);

    assert!(manager.route_response(&response, addr(7)).await);
    assert!(!manager.route_response(&response, addr(7)).await);
    assert!(task.await.unwrap().is_ok());

    let successes = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, NegotiationEvent::Success { .. }))
        .count();
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn identity_mismatch_is_a_failure() {
    let (mock, manager) = mock_manager();
    let mut events = manager.subscribe();

    let runner = manager.clone();
    let task = tokio::spawn(async move { runner.negotiate(device(8), None).await });
    mock.wait_for(1).await;
    let request = mock.sent_to(addr(8))[0].clone();
    let forged = respond_with(
        &request,
        ResponseBody {
            gw_id: "dev8".into(),
            random: hex::encode([2u8; 16]),
            uuid: negotiation::device_uuid("somebody-else"),
        },
    );

    assert!(manager.route_response(&forged, addr(8)).await);
    assert!(matches!(
        task.await.unwrap(),
        Err(TuyaError::IdentityMismatch { field: "uuid", .. })
    ));
    assert_eq!(manager.failure_count("dev8"), 1);
    assert_eq!(manager.state_of("dev8"), Some(NegotiatorState::Failed));
    assert!(manager.session("dev8").is_none());
    assert!(matches!(
        drain(&mut events).as_slice(),
        [NegotiationEvent::Error { .. }]
    ));
}

#[tokio::test]
async fn remove_cancels_without_counting() {
    let (mock, manager) = mock_manager();
    let mut events = manager.subscribe();

    let runner = manager.clone();
    let batch = tokio::spawn(async move {
        runner
            .start_batch_negotiation(vec![device(9), device(10)], Some(Duration::from_secs(5)))
            .await
    });
    mock.wait_for(2).await;

    assert!(manager.remove("dev9"));
    assert!(!manager.remove("dev9"));
    let request = mock.sent_to(addr(10))[0].clone();
    assert!(manager.route_response(&respond(&request, &key(10), [4; 16]), addr(10)).await);

    // both members settled, so the batch ends well before its deadline
    let report = tokio::time::timeout(Duration::from_secs(1), batch)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.succeeded, vec!["dev10"]);
    assert_eq!(report.error_for("dev9"), Some(&TuyaError::Cancelled));
    assert_eq!(manager.failure_count("dev9"), 0);
    assert_eq!(manager.state_of("dev9"), None);
    assert!(drain(&mut events)
        .iter()
        .all(|e| e.device_id() != "dev9"));
}

#[tokio::test]
async fn send_failure_and_version_gate() {
    let (mock, manager) = mock_manager();
    mock.set_failing(true);

    let legacy = device(11).with_version(Some(Version::V3_3));
    let report = manager
        .start_batch_negotiation(vec![device(12), legacy], SHORT)
        .await;
    assert_eq!(report.skipped, vec!["dev11"]);
    assert!(matches!(report.error_for("dev12"), Some(TuyaError::Transport(_))));
    assert_eq!(manager.failure_count("dev12"), 1);
    assert_eq!(manager.route_count(), 0);
    assert_eq!(manager.state_of("dev11"), None);

    assert!(matches!(
        manager
            .negotiate(device(13).with_version(Some(Version::V3_4)), SHORT)
            .await,
        Err(TuyaError::UnsupportedVersion(v)) if v == "3.4"
    ));
}

#[tokio::test]
async fn broadcast_when_ip_unknown() {
    let (mock, manager) = mock_manager();
    let unknown = DeviceInfo::new("nomad", key(14));
    let _ = manager.start_batch_negotiation(vec![unknown], SHORT).await;

    let sent = mock.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "255.255.255.255:6669".parse().unwrap());
}

#[tokio::test]
async fn announce_renegotiation_builds_batch_packet() {
    let (mock, manager) = mock_manager();
    let ids = vec!["dev1".to_string(), "dev2".to_string()];
    let entries = manager.announce_renegotiation(&ids).await.unwrap();

    let sent = mock.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "255.255.255.255:6669".parse().unwrap());

    let packet = BatchPacketBuilder::broadcast().open(&sent[0].0).unwrap();
    assert_eq!(packet.entries.len(), 2);
    assert_eq!(packet.entry_for("dev2").unwrap().random, entries[1].random);
}

#[tokio::test]
async fn negotiates_over_loopback() {
    let loopback = ManagerConfig::default()
        .with_bind_addr("127.0.0.1")
        .with_port(0);
    let manager = Manager::bind(loopback.clone()).await.unwrap();

    let device_socket = UdpTransport::bind(&loopback).unwrap();
    let device_addr = device_socket.local_addr().unwrap();
    let emulator = tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let (len, from) = device_socket.recv_from(&mut buf).await.unwrap();
        let response = respond(&buf[..len], &key(15), [5; 16]);
        device_socket.send_to(&response, from).await.unwrap();
        let (len, _) = device_socket.recv_from(&mut buf).await.unwrap();
        buf[..len].to_vec()
    });

    let target = DeviceInfo::new("dev15", key(15))
        .with_ip(device_addr.ip())
        .with_port(device_addr.port());
    let session = manager
        .negotiate(target, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(session.peer, device_addr);
    assert_eq!(manager.cache().len(), 1);

    let finish = emulator.await.unwrap();
    assert!(negotiation::decode_finish(&finish, &key(15), &session.session_key, &[5; 16]).is_ok());
    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_is_cached_when_success_fires() {
    let (mock, manager) = mock_manager();
    let mut events = manager.subscribe();

    let observer = manager.clone();
    let checker = tokio::spawn(async move {
        let mut seen = 0;
        while seen < 4 {
            match events.recv().await {
                Ok(NegotiationEvent::Success { device_id, session_key, .. }) => {
                    let cached = observer.session(&device_id);
                    assert_eq!(cached.map(|s| s.session_key), Some(session_key));
                    seen += 1;
                }
                Ok(other) => panic!("unexpected event {:?}", other),
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    });

    let runner = manager.clone();
    let batch = tokio::spawn(async move {
        runner
            .start_batch_negotiation((21..25).map(device).collect(), Some(Duration::from_secs(2)))
            .await
    });
    mock.wait_for(4).await;

    let mut answers = Vec::new();
    for n in 21..25u8 {
        let request = mock.sent_to(addr(n))[0].clone();
        let response = respond(&request, &key(n), [n; 16]);
        let router = manager.clone();
        answers.push(tokio::spawn(async move {
            router.route_response(&response, addr(n)).await
        }));
    }
    for answer in answers {
        assert!(answer.await.unwrap());
    }

    let report = batch.await.unwrap();
    assert_eq!(report.succeeded.len(), 4);
    tokio::time::timeout(Duration::from_secs(1), checker)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn corrupted_response_keeps_request_pending() {
    let (mock, manager) = mock_manager();
    let mut events = manager.subscribe();

    let runner = manager.clone();
    let task = tokio::spawn(async move {
        runner.negotiate(device(16), Some(Duration::from_secs(2))).await
    });
    mock.wait_for(1).await;
    let request = mock.sent_to(addr(16))[0].clone();
    let response = respond(&request, &key(16), [6; 16]);

    let mut corrupted = response.clone();
    let crc_at = corrupted.len() - 8;
    corrupted[crc_at] ^= 0x01;

    assert!(!manager.route_response(&corrupted, addr(16)).await);
    assert_eq!(manager.route_count(), 1);
    assert_eq!(manager.state_of("dev16"), Some(NegotiatorState::RequestSent));
    assert_eq!(manager.failure_count("dev16"), 0);
    assert!(drain(&mut events).is_empty());

    assert!(manager.route_response(&response, addr(16)).await);
    assert!(task.await.unwrap().is_ok());
    assert_eq!(manager.state_of("dev16"), Some(NegotiatorState::Established));
}

#[tokio::test]
async fn unbounded_timeout_does_not_overflow() {
    let (mock, manager) = mock_manager();

    let report = manager
        .start_batch_negotiation(vec![], Some(Duration::MAX))
        .await;
    assert!(report.succeeded.is_empty());
    assert!(report.failed.is_empty());

    let runner = manager.clone();
    let task = tokio::spawn(async move { runner.negotiate(device(17), Some(Duration::MAX)).await });
    mock.wait_for(1).await;
    let request = mock.sent_to(addr(17))[0].clone();
    assert!(manager.route_response(&respond(&request, &key(17), [9; 16]), addr(17)).await);
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn create_keeps_in_flight_device() {
    let (mock, manager) = mock_manager();
    assert!(manager.create(device(18)));
    assert!(!manager.create(device(18)));
    assert_eq!(manager.state_of("dev18"), Some(NegotiatorState::Idle));

    let runner = manager.clone();
    let task = tokio::spawn(async move { runner.negotiate(device(18), None).await });
    mock.wait_for(1).await;

    // a rekeyed copy arriving mid-request must not replace the key in use
    assert!(!manager.create(DeviceInfo::new("dev18", key(99))));
    assert_eq!(manager.state_of("dev18"), Some(NegotiatorState::RequestSent));

    let request = mock.sent_to(addr(18))[0].clone();
    let client_random = negotiation::decode_request(&request, &key(18)).unwrap().random;
    assert!(manager.route_response(&respond(&request, &key(18), [1; 16]), addr(18)).await);

    let session = task.await.unwrap().unwrap();
    assert_eq!(
        session.session_key,
        crypto::derive_session_key(key(18).as_bytes(), &hex::decode(client_random).unwrap(), &[1; 16])
    );
    assert_eq!(manager.device_ids(), vec!["dev18"]);
}
