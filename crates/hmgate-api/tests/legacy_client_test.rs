#![allow(clippy::unwrap_used)]
// Integration tests for `LegacyClient` using wiremock.

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hmgate_api::{Credentials, Error, LegacyClient, ParamsetKind, Paramset, Value};

const CGI: &str = "/api/homematic.cgi";

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup(credentials: Option<Credentials>) -> (MockServer, LegacyClient) {
    let server = MockServer::start().await;
    let base_url = Url::parse(&server.uri()).unwrap();
    let client =
        LegacyClient::with_client(reqwest::Client::new(), &base_url, "HmIP-RF", credentials)
            .unwrap();
    (server, client)
}

fn admin() -> Option<Credentials> {
    Some(Credentials {
        username: "Admin".into(),
        password: "secret".to_string().into(),
    })
}

fn ok(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "version": "1.1",
        "result": result,
        "error": null,
        "id": 0
    }))
}

fn fault(name: &str, code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "version": "1.1",
        "result": null,
        "error": { "name": name, "code": code, "message": message },
        "id": 0
    }))
}

async fn mount_login(server: &MockServer, session_id: &str) {
    Mock::given(method("POST"))
        .and(path(CGI))
        .and(body_partial_json(json!({ "method": "Session.login" })))
        .respond_with(ok(json!(session_id)))
        .mount(server)
        .await;
}

// ── Session tests ───────────────────────────────────────────────────

#[tokio::test]
async fn test_calls_carry_session_and_interface() {
    let (server, client) = setup(admin()).await;
    mount_login(&server, "sess-1").await;

    Mock::given(method("POST"))
        .and(path(CGI))
        .and(body_partial_json(json!({
            "method": "Interface.getValue",
            "params": {
                "_session_id_": "sess-1",
                "interface": "HmIP-RF",
                "address": "ABC123:1",
                "valueKey": "LEVEL"
            }
        })))
        .respond_with(ok(json!("0.500000")))
        .expect(1)
        .mount(&server)
        .await;

    let value = client.get_value("ABC123:1", "LEVEL").await.unwrap();
    assert_eq!(value, Value::String("0.500000".into()));
}

#[tokio::test]
async fn test_login_failure_is_authentication_error() {
    let (server, client) = setup(admin()).await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "Session.login" })))
        .respond_with(fault("JSONRPCError", 501, "invalid credentials"))
        .mount(&server)
        .await;

    let result = client.login().await;
    assert!(
        matches!(result, Err(Error::Authentication { .. })),
        "expected Authentication error, got: {result:?}"
    );
}

#[tokio::test]
async fn test_login_without_session_id_fails() {
    let (server, client) = setup(admin()).await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "Session.login" })))
        .respond_with(ok(json!(null)))
        .mount(&server)
        .await;

    let result = client.login().await;
    assert!(
        matches!(result, Err(Error::Authentication { .. })),
        "expected Authentication error, got: {result:?}"
    );
}

#[tokio::test]
async fn test_access_denied_triggers_one_relogin() {
    let (server, client) = setup(admin()).await;
    mount_login(&server, "sess-2").await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "Interface.isPresent" })))
        .respond_with(fault("JSONRPCError", 400, "access denied"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "Interface.isPresent" })))
        .respond_with(ok(json!(true)))
        .mount(&server)
        .await;

    assert!(client.is_present().await.unwrap());
}

#[tokio::test]
async fn test_no_credentials_means_no_session() {
    let (server, client) = setup(None).await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "Session.login" })))
        .respond_with(ok(json!("unused")))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "Interface.isPresent" })))
        .respond_with(ok(json!(true)))
        .mount(&server)
        .await;

    assert!(client.is_present().await.unwrap());
    assert_eq!(client.login().await.unwrap(), None);
}

#[tokio::test]
async fn test_logout_clears_session() {
    let (server, client) = setup(admin()).await;
    mount_login(&server, "sess-3").await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "Session.logout",
            "params": { "_session_id_": "sess-3" }
        })))
        .respond_with(ok(json!(true)))
        .expect(1)
        .mount(&server)
        .await;

    client.login().await.unwrap();
    client.logout().await.unwrap();
    // Second logout has no session left and sends nothing.
    client.logout().await.unwrap();
}

// ── Interface tests ─────────────────────────────────────────────────

#[tokio::test]
async fn test_paramset_description_list_is_keyed_by_name() {
    let (server, client) = setup(None).await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "Interface.getParamsetDescription",
            "params": { "address": "ABC123:1", "paramsetKey": "VALUES" }
        })))
        .respond_with(ok(json!([
            { "NAME": "LEVEL", "TYPE": "FLOAT", "OPERATIONS": 7, "FLAGS": 1, "MIN": 0.0, "MAX": 1.0 },
            { "NAME": "STOP", "TYPE": "ACTION", "OPERATIONS": 2, "FLAGS": 1 }
        ])))
        .mount(&server)
        .await;

    let desc = client
        .get_paramset_description("ABC123:1", ParamsetKind::Values)
        .await
        .unwrap();
    assert_eq!(desc.len(), 2);
    assert!(desc["LEVEL"].operations.is_readable());
    assert!(!desc["STOP"].operations.is_readable());
}

#[tokio::test]
async fn test_put_paramset_sends_typed_set() {
    let (server, client) = setup(None).await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "Interface.putParamset",
            "params": {
                "interface": "HmIP-RF",
                "paramsetKey": "MASTER",
                "set": [{ "name": "TEMPERATURE_OFFSET", "type": "double", "value": 1.5 }]
            }
        })))
        .respond_with(ok(json!(true)))
        .expect(1)
        .mount(&server)
        .await;

    let mut values = Paramset::new();
    values.insert("TEMPERATURE_OFFSET".into(), Value::Float(1.5));
    client
        .put_paramset("ABC123:1", ParamsetKind::Master, &values)
        .await
        .unwrap();
}
