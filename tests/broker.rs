//! Broker client integration tests against a mocked broker.

mod support;

use comfycarry::broker::{BrokerClient, BrokerHandle, PublicRegistration, sign_request};
use comfycarry::error::{BrokerError, CarryError};
use comfycarry::services::{Protocol, ServiceSpec};
use comfycarry::store::{StateStore, keys};
use comfycarry::supervisor::ProcessSupervisor;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use support::MockSupervisor;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "test-secret";

fn comfy_service() -> ServiceSpec {
    ServiceSpec {
        name: "ComfyUI".into(),
        port: 8188,
        suffix: String::new(),
        protocol: Protocol::Http,
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<StateStore>,
    supervisor: Arc<MockSupervisor>,
    handle: BrokerHandle,
}

fn fixture(server: &MockServer) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    let supervisor = Arc::new(MockSupervisor::new());
    let client = BrokerClient::new(
        server.uri(),
        SECRET,
        Arc::clone(&store),
        Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
        "cloudflared",
        20241,
    );
    Fixture {
        _dir: dir,
        store,
        supervisor,
        handle: BrokerHandle::new(client),
    }
}

fn seed_registration(store: &StateStore, random_id: &str) {
    store
        .set(
            keys::PUBLIC_REGISTRATION,
            PublicRegistration {
                random_id: random_id.into(),
                tunnel_token: "tok-old".into(),
                urls: HashMap::new(),
                instance_id: "seeded".into(),
            },
        )
        .unwrap();
}

#[tokio::test]
async fn register_signs_request_persists_state_and_starts_daemon() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "random_id": "cc-pub1",
            "tunnel_token": "tok-xyz",
            "urls": {"ComfyUI": "https://cc-pub1.carry.dev"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fx = fixture(&server);
    let registration = fx.handle.register(&[comfy_service()]).await.unwrap();
    assert_eq!(registration.random_id, "cc-pub1");

    // Persisted for crash recovery.
    let stored: PublicRegistration = fx.store.get_as(keys::PUBLIC_REGISTRATION).unwrap();
    assert_eq!(stored.random_id, "cc-pub1");
    assert_eq!(stored.tunnel_token, "tok-xyz");

    // Daemon launched with the issued token.
    let args = fx.supervisor.last_start_args().unwrap();
    assert!(args.contains(&"tok-xyz".to_string()));

    // The request carried a valid HMAC over instance_id:timestamp.
    let request = &server.received_requests().await.unwrap()[0];
    let header = |name: &str| {
        request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_owned()
    };
    let instance = header("X-Instance-Id");
    let timestamp: u64 = header("X-Timestamp").parse().unwrap();
    assert_eq!(header("X-Signature"), sign_request(SECRET, &instance, timestamp));
}

#[tokio::test]
async fn register_rejection_persists_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": false,
            "error": "capacity exhausted"
        })))
        .mount(&server)
        .await;

    let fx = fixture(&server);
    let err = fx.handle.register(&[comfy_service()]).await.unwrap_err();
    assert!(matches!(
        err,
        CarryError::Broker(BrokerError::Rejected { .. })
    ));
    assert!(fx.store.get(keys::PUBLIC_REGISTRATION).is_none());
    assert_eq!(fx.supervisor.start_count(), 0);
}

#[tokio::test]
async fn three_heartbeat_failures_degrade_one_success_resets() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/heartbeat"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/heartbeat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active": true})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    seed_registration(&store, "cc-pub1");
    let supervisor = Arc::new(MockSupervisor::new());
    let client = BrokerClient::new(
        server.uri(),
        SECRET,
        Arc::clone(&store),
        supervisor as Arc<dyn ProcessSupervisor>,
        "cloudflared",
        20241,
    );
    let handle = BrokerHandle::new(client);

    for round in 1..=3u32 {
        let mut client = handle.lock().await;
        assert!(client.send_heartbeat().await.is_err());
        let state = client.heartbeat_state();
        assert_eq!(state.consecutive_failures, round);
        assert_eq!(state.degraded, round >= 3);
    }

    let mut client = handle.lock().await;
    assert!(client.send_heartbeat().await.unwrap());
    let state = client.heartbeat_state();
    assert!(!state.degraded);
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn server_error_with_json_body_counts_as_failure_not_dropped_registration() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/heartbeat"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "internal"})))
        .expect(2)
        .mount(&server)
        .await;
    // A 5xx must never look like a dropped registration.
    Mock::given(method("POST"))
        .and(path("/api/register"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    seed_registration(&store, "cc-pub1");
    let supervisor = Arc::new(MockSupervisor::new());
    let client = BrokerClient::new(
        server.uri(),
        SECRET,
        Arc::clone(&store),
        supervisor as Arc<dyn ProcessSupervisor>,
        "cloudflared",
        20241,
    );
    let handle = BrokerHandle::new(client);

    let mut client = handle.lock().await;
    for round in 1..=2u32 {
        let err = client.send_heartbeat().await.unwrap_err();
        assert!(matches!(
            err,
            CarryError::Broker(BrokerError::Unreachable(_))
        ));
        assert_eq!(client.heartbeat_state().consecutive_failures, round);
    }

    // The stale registration is kept for the next attempt.
    let stored: PublicRegistration = store.get_as(keys::PUBLIC_REGISTRATION).unwrap();
    assert_eq!(stored.random_id, "cc-pub1");
    server.verify().await;
}

#[tokio::test]
async fn restore_with_inactive_registration_reregisters_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/heartbeat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active": false})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "random_id": "cc-fresh",
            "tunnel_token": "tok-new",
            "urls": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    seed_registration(&store, "cc-stale");
    let supervisor = Arc::new(MockSupervisor::new());
    let client = BrokerClient::new(
        server.uri(),
        SECRET,
        Arc::clone(&store),
        Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
        "cloudflared",
        20241,
    );
    let handle = BrokerHandle::new(client);

    let fresh = handle.restore(&[comfy_service()]).await.unwrap();
    assert_eq!(fresh.random_id, "cc-fresh");
    assert_ne!(fresh.random_id, "cc-stale");

    let stored: PublicRegistration = store.get_as(keys::PUBLIC_REGISTRATION).unwrap();
    assert_eq!(stored.random_id, "cc-fresh");

    // Daemon restarted for the old token, then for the fresh one.
    let args = supervisor.last_start_args().unwrap();
    assert!(args.contains(&"tok-new".to_string()));
    server.verify().await;
}

#[tokio::test]
async fn restore_without_persisted_state_errors() {
    let server = MockServer::start().await;
    let fx = fixture(&server);
    let err = fx.handle.restore(&[comfy_service()]).await.unwrap_err();
    assert!(matches!(
        err,
        CarryError::Broker(BrokerError::NotRegistered)
    ));
}

#[tokio::test]
async fn release_clears_local_state_even_when_broker_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/release"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    seed_registration(&store, "cc-pub1");
    let supervisor = Arc::new(MockSupervisor::new());
    supervisor
        .running
        .lock()
        .unwrap()
        .insert("cloudflared".into());
    let client = BrokerClient::new(
        server.uri(),
        SECRET,
        Arc::clone(&store),
        Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
        "cloudflared",
        20241,
    );
    let handle = BrokerHandle::new(client);

    handle.release().await.unwrap();
    assert!(store.get(keys::PUBLIC_REGISTRATION).is_none());
    assert!(!supervisor.is_running("cloudflared").await);
    server.verify().await;
}
