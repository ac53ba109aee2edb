#![allow(clippy::unwrap_used)]
// End-to-end tests: a Central against a wiremock backend, with pushes
// delivered to its real callback listener.

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hmgate_core::{
    Central, CentralConfig, CentralEvent, ConnectionState, CoreError, EntityId, HealthConfig,
    InterfaceConfig, RequestConfig, TlsVerification, Value,
};

const IFACE: &str = "hm-rf";

// ── Helpers ─────────────────────────────────────────────────────────

fn rpc_ok(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "result": result, "id": 1 }))
}

async fn mount(server: &MockServer, rpc: &str, result: serde_json::Value) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": rpc })))
        .respond_with(rpc_ok(result))
        .mount(server)
        .await;
}

async fn mount_paramset_description(server: &MockServer, address: &str, result: serde_json::Value) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "getParamsetDescription",
            "params": [address, "VALUES"],
        })))
        .respond_with(rpc_ok(result))
        .mount(server)
        .await;
}

fn param(ty: &str, operations: u8) -> serde_json::Value {
    json!({ "TYPE": ty, "OPERATIONS": operations, "FLAGS": 1 })
}

/// A backend with one device `ABC123`: maintenance channel 0 and a
/// channel 1 with a writable `LEVEL` and a read-only `ACTUAL_TEMPERATURE`.
async fn mount_backend(server: &MockServer) {
    mount(
        server,
        "system.listMethods",
        json!(["getValue", "setValue", "system.listMethods"]),
    )
    .await;
    mount(server, "init", json!("")).await;
    mount(server, "ping", json!(true)).await;
    mount(
        server,
        "listDevices",
        json!([
            { "ADDRESS": "ABC123", "TYPE": "ACME-DIM", "CHILDREN": ["ABC123:0", "ABC123:1"], "PARAMSETS": [], "VERSION": 3 },
            { "ADDRESS": "ABC123:0", "TYPE": "MAINTENANCE", "PARENT": "ABC123", "INDEX": 0, "PARAMSETS": ["VALUES"], "VERSION": 3 },
            { "ADDRESS": "ABC123:1", "TYPE": "DIMMER", "PARENT": "ABC123", "INDEX": 1, "PARAMSETS": ["VALUES"], "VERSION": 3 },
        ]),
    )
    .await;
    mount_paramset_description(server, "ABC123:0", json!({ "UNREACH": param("BOOL", 5) })).await;
    mount_paramset_description(
        server,
        "ABC123:1",
        json!({
            "LEVEL": { "TYPE": "FLOAT", "OPERATIONS": 7, "FLAGS": 1, "MIN": 0.0, "MAX": 1.0 },
            "ACTUAL_TEMPERATURE": param("FLOAT", 5),
        }),
    )
    .await;
}

fn config(server: &MockServer, health: HealthConfig) -> CentralConfig {
    let mut config = CentralConfig::new("test-central", "127.0.0.1:0".parse().unwrap());
    config.callback_host = "127.0.0.1".into();
    config.health = health;
    config.request = RequestConfig {
        timeout: Duration::from_millis(500),
        max_concurrent: 1,
        max_retries: 0,
        retry_delay: Duration::from_millis(10),
    };
    config.interfaces.push(InterfaceConfig {
        interface_id: IFACE.into(),
        backend_interface: "BidCos-RF".into(),
        url: Url::parse(&server.uri()).unwrap(),
        legacy_url: None,
        credentials: None,
        tls: TlsVerification::SystemDefaults,
    });
    config
}

fn quiet_health() -> HealthConfig {
    HealthConfig {
        probe_interval: Duration::from_secs(60),
        ..HealthConfig::default()
    }
}

async fn push(central: &Central, method: &str, params: serde_json::Value) {
    let url = central.callback_url().await.unwrap();
    let reply: serde_json::Value = reqwest::Client::new()
        .post(url)
        .json(&json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(reply.get("error").is_none() || reply["error"].is_null());
}

async fn requests_for(server: &MockServer, rpc: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| {
            serde_json::from_slice::<serde_json::Value>(&r.body)
                .is_ok_and(|body| body["method"] == rpc)
        })
        .count()
}

async fn wait_for_level(central: &Central, expected: f64) {
    let mut sub = central.subscribe(&EntityId::from("ABC123:1/LEVEL")).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(entity) = sub.next().await {
            if entity.value("level") == Some(&Value::Float(expected)) {
                return;
            }
        }
        panic!("entity disappeared");
    })
    .await
    .unwrap();
}

async fn wait_for_uncertain(central: &Central, id: &str) {
    let mut sub = central.subscribe(&EntityId::from(id)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(entity) = sub.next().await {
            if entity.uncertain {
                return;
            }
        }
        panic!("entity disappeared");
    })
    .await
    .unwrap();
}

// ── Startup & materialization ───────────────────────────────────────

#[tokio::test]
async fn test_start_materializes_listed_devices() {
    let server = MockServer::start().await;
    mount_backend(&server).await;

    let central = Central::new(config(&server, quiet_health())).unwrap();
    let mut events = central.events();
    central.start().await.unwrap();

    assert_eq!(central.connection_state(IFACE).unwrap(), ConnectionState::Connected);
    let mut ids: Vec<String> = central
        .list_entities()
        .iter()
        .map(|e| e.id.to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["ABC123:0/UNREACH", "ABC123:1/ACTUAL_TEMPERATURE", "ABC123:1/LEVEL"]);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&CentralEvent::DevicesCreated {
        interface_id: IFACE.into(),
        addresses: vec!["ABC123".into()],
    }));
    assert!(seen.contains(&CentralEvent::InterfaceAvailable { interface_id: IFACE.into() }));

    central.shutdown().await;
}

// ── Scenario A: cached push served without a request ────────────────

#[tokio::test]
async fn test_pushed_value_is_served_from_cache() {
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let central = Central::new(config(&server, quiet_health())).unwrap();
    central.start().await.unwrap();

    push(&central, "event", json!([IFACE, "ABC123:1", "LEVEL", 0.5])).await;
    wait_for_level(&central, 0.5).await;

    let value = central
        .get_value(IFACE, "ABC123:1", "LEVEL", Some(Duration::from_secs(300)))
        .await
        .unwrap();
    assert_eq!(value, Value::Float(0.5));
    assert_eq!(requests_for(&server, "getValue").await, 0);

    central.shutdown().await;
}

#[tokio::test]
async fn test_cache_miss_fetches_and_caches() {
    let server = MockServer::start().await;
    mount_backend(&server).await;
    mount(&server, "getValue", json!(0.25)).await;
    let central = Central::new(config(&server, quiet_health())).unwrap();
    central.start().await.unwrap();

    let value = central
        .get_value(IFACE, "ABC123:1", "ACTUAL_TEMPERATURE", None)
        .await
        .unwrap();
    assert_eq!(value, Value::Float(0.25));
    central
        .get_value(IFACE, "ABC123:1", "ACTUAL_TEMPERATURE", None)
        .await
        .unwrap();
    assert_eq!(requests_for(&server, "getValue").await, 1);

    central.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_pushes_apply_once() {
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let central = Central::new(config(&server, quiet_health())).unwrap();
    central.start().await.unwrap();

    push(&central, "event", json!([IFACE, "ABC123:1", "LEVEL", 0.75])).await;
    push(&central, "event", json!([IFACE, "ABC123:1", "LEVEL", 0.75])).await;
    wait_for_level(&central, 0.75).await;

    let levels: Vec<_> = central
        .list_entities()
        .iter()
        .filter(|e| e.id.as_str() == "ABC123:1/LEVEL")
        .map(|e| e.value("level").cloned())
        .collect();
    assert_eq!(levels, vec![Some(Value::Float(0.75))]);

    central.shutdown().await;
}

// ── Scenario B: writes validated before sending ─────────────────────

#[tokio::test]
async fn test_read_only_write_is_denied_locally() {
    let server = MockServer::start().await;
    mount_backend(&server).await;
    mount(&server, "setValue", json!("")).await;
    let central = Central::new(config(&server, quiet_health())).unwrap();
    central.start().await.unwrap();

    let err = central
        .set_value(IFACE, "ABC123:1", "ACTUAL_TEMPERATURE", 21.0)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied { .. }), "got {err:?}");

    let err = central.set_value(IFACE, "ABC123:1", "LEVEL", 1.5).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidParameter { .. }), "got {err:?}");
    assert_eq!(requests_for(&server, "setValue").await, 0);

    central.set_value(IFACE, "ABC123:1", "LEVEL", 0.3).await.unwrap();
    assert_eq!(requests_for(&server, "setValue").await, 1);
    wait_for_level(&central, 0.3).await;

    central.shutdown().await;
}

// ── Scenario C: probe failures disconnect, reads fail fast ──────────

#[tokio::test]
async fn test_three_failed_probes_disconnect_then_recover() {
    let server = MockServer::start().await;
    // Failing pings take precedence over the healthy ping mounted below.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "ping" })))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_backend(&server).await;

    let health = HealthConfig {
        probe_interval: Duration::from_millis(50),
        reconnect_backoff: Duration::from_millis(100),
        silent_reconnect_backoff: Duration::from_millis(100),
        ..HealthConfig::default()
    };
    let central = Central::new(config(&server, health)).unwrap();
    let mut events = central.events();
    central.start().await.unwrap();

    let mut state = central.connection_state_watch(IFACE).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    let err = central
        .get_value(IFACE, "ABC123:1", "LEVEL", Some(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Unreachable { .. }), "got {err:?}");
    let err = central.set_value(IFACE, "ABC123:1", "LEVEL", 0.1).await.unwrap_err();
    assert!(matches!(err, CoreError::Unreachable { .. }), "got {err:?}");
    assert_eq!(requests_for(&server, "getValue").await, 0);
    assert_eq!(requests_for(&server, "setValue").await, 0);

    wait_for_uncertain(&central, "ABC123:1/LEVEL").await;

    // Backend recovers.
    server.reset().await;
    mount_backend(&server).await;
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            CentralEvent::InterfaceAvailable { .. } => transitions.push("available"),
            CentralEvent::InterfaceUnavailable { .. } => transitions.push("unavailable"),
            _ => {}
        }
    }
    assert_eq!(transitions, vec!["available", "unavailable", "available"]);

    central.shutdown().await;
}

// ── Device lifecycle ────────────────────────────────────────────────

#[tokio::test]
async fn test_deleted_device_cascades() {
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let central = Central::new(config(&server, quiet_health())).unwrap();
    central.start().await.unwrap();
    let mut events = central.events();
    let mut sub = central.subscribe(&EntityId::from("ABC123:1/LEVEL")).unwrap();

    push(&central, "deleteDevices", json!([IFACE, ["ABC123"]])).await;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, CentralEvent::DevicesDeleted {
        interface_id: IFACE.into(),
        addresses: vec!["ABC123".into()],
    });
    assert!(central.list_entities().is_empty());
    assert!(central.device("ABC123").is_none());

    // The subscription drains to its end.
    tokio::time::timeout(Duration::from_secs(5), async { while sub.next().await.is_some() {} })
        .await
        .unwrap();

    central.shutdown().await;
}

#[tokio::test]
async fn test_unreach_marks_entities_uncertain() {
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let central = Central::new(config(&server, quiet_health())).unwrap();
    central.start().await.unwrap();

    push(&central, "event", json!([IFACE, "ABC123:0", "UNREACH", true])).await;
    wait_for_uncertain(&central, "ABC123:1/LEVEL").await;
    assert!(!central.device("ABC123").unwrap().reachable);

    central.shutdown().await;
}

// ── Persistence ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_persisted_state_survives_restart_without_backend() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_backend(&server).await;

    let mut first = config(&server, quiet_health());
    first.storage_dir = Some(dir.path().to_path_buf());
    let central = Central::new(first.clone()).unwrap();
    central.start().await.unwrap();
    push(&central, "event", json!([IFACE, "ABC123:1", "LEVEL", 0.5])).await;
    wait_for_level(&central, 0.5).await;
    central.shutdown().await;
    drop(server);

    // Same config; the backend is gone now.
    let central = Central::new(first).unwrap();
    central.start().await.unwrap();
    assert_eq!(central.connection_state(IFACE).unwrap(), ConnectionState::Disconnected);

    let level = central.entity(&EntityId::from("ABC123:1/LEVEL")).unwrap();
    assert_eq!(level.value("level"), Some(&Value::Float(0.5)));
    assert!(level.uncertain);

    central.shutdown().await;
}

#[tokio::test]
async fn test_second_shutdown_is_a_no_op() {
    let server = MockServer::start().await;
    mount_backend(&server).await;
    let central = Central::new(config(&server, quiet_health())).unwrap();
    central.start().await.unwrap();

    let other = central.clone();
    tokio::join!(central.shutdown(), other.shutdown());
    central.shutdown().await;
    assert_eq!(central.connection_state(IFACE).unwrap(), ConnectionState::Disconnected);
}

/// A backend whose `rpc` answers only after `delay`, ahead of the
/// regular mocks.
async fn mount_slow(server: &MockServer, rpc: &str, delay: Duration) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": rpc })))
        .respond_with(rpc_ok(json!("")).set_delay(delay))
        .with_priority(1)
        .mount(server)
        .await;
}

fn patient_config(server: &MockServer) -> CentralConfig {
    let mut config = config(server, quiet_health());
    config.request.timeout = Duration::from_secs(10);
    config
}

#[tokio::test]
async fn test_shutdown_abandons_device_reload_in_flight() {
    let server = MockServer::start().await;
    mount_slow(&server, "getDeviceDescription", Duration::from_secs(4)).await;
    mount_backend(&server).await;
    let central = Central::new(patient_config(&server)).unwrap();
    central.start().await.unwrap();

    push(&central, "updateDevice", json!([IFACE, "ABC123", 0])).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(requests_for(&server, "getDeviceDescription").await, 1);

    let started = Instant::now();
    central.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn test_reload_in_flight_does_not_hold_up_value_pushes() {
    let server = MockServer::start().await;
    mount_slow(&server, "getDeviceDescription", Duration::from_secs(4)).await;
    mount_backend(&server).await;
    let central = Central::new(patient_config(&server)).unwrap();
    central.start().await.unwrap();

    push(&central, "updateDevice", json!([IFACE, "ABC123", 0])).await;
    push(&central, "event", json!([IFACE, "ABC123:1", "LEVEL", 0.4])).await;
    tokio::time::timeout(Duration::from_secs(1), wait_for_level(&central, 0.4))
        .await
        .unwrap();

    central.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_answers_write_in_flight() {
    let server = MockServer::start().await;
    mount_slow(&server, "setValue", Duration::from_secs(4)).await;
    mount_backend(&server).await;
    let central = Central::new(patient_config(&server)).unwrap();
    central.start().await.unwrap();

    let writer = central.clone();
    let write =
        tokio::spawn(async move { writer.set_value(IFACE, "ABC123:1", "LEVEL", 0.6).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(requests_for(&server, "setValue").await, 1);

    let started = Instant::now();
    central.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

    let err = write.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::ShuttingDown), "got {err:?}");
}

#[tokio::test]
async fn test_duplicate_interface_ids_are_rejected() {
    let server = MockServer::start().await;
    let mut config = config(&server, quiet_health());
    let duplicate = config.interfaces[0].clone();
    config.interfaces.push(duplicate);
    assert!(matches!(Central::new(config), Err(CoreError::Config { .. })));
}
