#![allow(clippy::unwrap_used)]
// Integration tests for the callback listener over real HTTP.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::watch;

use hmgate_api::{CallbackEvent, CallbackServer, DeviceSummary, Error, Value};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (CallbackServer, reqwest::Client) {
    let server = CallbackServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    (server, reqwest::Client::new())
}

async fn call(
    http: &reqwest::Client,
    server: &CallbackServer,
    rpc_path: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    http.post(format!("{}{rpc_path}", server.url("127.0.0.1")))
        .json(&json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 7 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

fn no_devices() -> watch::Receiver<Arc<Vec<DeviceSummary>>> {
    watch::channel(Arc::new(Vec::new())).1
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_event_is_routed_by_interface_id() {
    let (server, http) = setup().await;
    let mut rf = server.register("ccu-HmIP-RF", no_devices()).await;
    let mut wired = server.register("ccu-HmIP-Wired", no_devices()).await;

    let reply = call(
        &http,
        &server,
        "/RPC2",
        "event",
        json!(["ccu-HmIP-RF", "ABC123:1", "LEVEL", 0.5]),
    )
    .await;
    assert_eq!(reply["id"], json!(7));
    assert!(reply.get("error").is_none() || reply["error"].is_null());

    assert_eq!(
        rf.recv().await.unwrap(),
        CallbackEvent::ValueChanged {
            channel_address: "ABC123:1".into(),
            parameter: "LEVEL".into(),
            value: Value::Float(0.5),
        }
    );
    let nothing = tokio::time::timeout(Duration::from_millis(50), wired.recv()).await;
    assert!(nothing.is_err(), "other interface must not see the event");

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_interface_is_dropped() {
    let (server, http) = setup().await;
    let reply = call(
        &http,
        &server,
        "/",
        "event",
        json!(["nobody", "ABC123:1", "STATE", true]),
    )
    .await;
    assert!(reply["error"].is_null());
    server.shutdown().await;
}

#[tokio::test]
async fn test_list_devices_reports_known_devices() {
    let (server, http) = setup().await;
    let (_tx, known) = watch::channel(Arc::new(vec![DeviceSummary {
        address: "ABC123".into(),
        version: 3,
    }]));
    let _rx = server.register("ccu-HmIP-RF", known).await;

    let reply = call(&http, &server, "/", "listDevices", json!(["ccu-HmIP-RF"])).await;
    assert_eq!(reply["result"], json!([{ "ADDRESS": "ABC123", "VERSION": 3 }]));

    server.shutdown().await;
}

#[tokio::test]
async fn test_multicall_dispatches_in_order() {
    let (server, http) = setup().await;
    let mut rx = server.register("iface", no_devices()).await;

    let reply = call(
        &http,
        &server,
        "/",
        "system.multicall",
        json!([[
            { "methodName": "event", "params": ["iface", "ABC123:0", "UNREACH", true] },
            { "methodName": "bogus", "params": [] },
            { "methodName": "event", "params": ["iface", "ABC123:0", "UNREACH", false] }
        ]]),
    )
    .await;

    let results = reply["result"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[1]["faultCode"], json!(-32601));

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert!(matches!(first, CallbackEvent::ValueChanged { value: Value::Bool(true), .. }));
    assert!(matches!(second, CallbackEvent::ValueChanged { value: Value::Bool(false), .. }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_new_and_error_callbacks() {
    let (server, http) = setup().await;
    let mut rx = server.register("iface", no_devices()).await;

    call(
        &http,
        &server,
        "/",
        "newDevices",
        json!(["iface", [{ "ADDRESS": "NEW001", "TYPE": "HmIP-PS", "CHILDREN": ["NEW001:3"] }]]),
    )
    .await;
    call(&http, &server, "/", "error", json!(["iface", -1, "connection lost"])).await;

    match rx.recv().await.unwrap() {
        CallbackEvent::DeviceNew { descriptions } => {
            assert_eq!(descriptions[0].device_type, "HmIP-PS");
        }
        other => panic!("expected DeviceNew, got {other:?}"),
    }
    assert_eq!(
        rx.recv().await.unwrap(),
        CallbackEvent::InterfaceUnreachable {
            code: -1,
            message: "connection lost".into()
        }
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_bad_params_are_a_fault() {
    let (server, http) = setup().await;
    let reply = call(&http, &server, "/", "event", json!(["iface"])).await;
    assert_eq!(reply["error"]["code"], json!(-32602));
    server.shutdown().await;
}

#[tokio::test]
async fn test_deregister_ends_receiver() {
    let (server, _http) = setup().await;
    let mut rx = server.register("iface", no_devices()).await;
    server.deregister("iface").await;
    assert!(rx.recv().await.is_none());
    server.shutdown().await;
}

#[tokio::test]
async fn test_bind_conflict_is_bind_error() {
    let (server, _http) = setup().await;
    let result = CallbackServer::bind(server.local_addr()).await;
    assert!(
        matches!(result, Err(Error::Bind { .. })),
        "expected Bind error"
    );
    server.shutdown().await;
}
