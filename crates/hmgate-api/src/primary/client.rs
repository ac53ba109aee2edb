// Async HTTP client for the primary JSON-RPC 2.0 protocol.
//
// One POST per call to the interface URL. Positional params, numeric ids,
// `{result}` or `{error: {code, message}}` responses.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, trace};
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;
use crate::types::{DeviceDescription, Paramset, ParamsetDescription, ParamsetKind, Value};

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code for rejected parameters.
pub const INVALID_PARAMS: i64 = -32602;

// ── Response envelope ────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

// ── Client ───────────────────────────────────────────────────────────

/// Async client for the primary protocol of one backend interface.
pub struct PrimaryClient {
    http: reqwest::Client,
    url: Url,
    next_id: AtomicU64,
}

impl PrimaryClient {
    // ── Constructors ─────────────────────────────────────────────────

    /// Build a client for the interface at `url` (e.g. `http://ccu:2010`).
    pub fn new(url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self::with_client(transport.build_client()?, url))
    }

    /// Build a client around a pre-configured `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, url: Url) -> Self {
        Self {
            http,
            url,
            next_id: AtomicU64::new(1),
        }
    }

    /// The interface endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    // ── Introspection & registration ─────────────────────────────────

    /// List all methods the backend implements. Also serves as the
    /// capability probe: legacy-only backends answer "method not found".
    pub async fn system_list_methods(&self) -> Result<Vec<String>, Error> {
        self.call("system.listMethods", json!([])).await
    }

    /// Lightweight liveness check.
    pub async fn ping(&self, caller_id: &str) -> Result<bool, Error> {
        self.call::<Option<bool>>("ping", json!([caller_id]))
            .await
            .map(|r| r.unwrap_or(true))
    }

    /// Register `callback_url` so the backend pushes events tagged with
    /// `interface_id` to it.
    pub async fn init(&self, callback_url: &str, interface_id: &str) -> Result<(), Error> {
        self.call_unit("init", json!([callback_url, interface_id]))
            .await
    }

    /// Deregister `callback_url` (an `init` with an empty interface id).
    pub async fn deinit(&self, callback_url: &str) -> Result<(), Error> {
        self.call_unit("init", json!([callback_url, ""])).await
    }

    // ── Descriptions ─────────────────────────────────────────────────

    /// All device and channel descriptions known to the interface.
    pub async fn list_devices(&self) -> Result<Vec<DeviceDescription>, Error> {
        self.call("listDevices", json!([])).await
    }

    pub async fn get_device_description(&self, address: &str) -> Result<DeviceDescription, Error> {
        self.call("getDeviceDescription", json!([address])).await
    }

    pub async fn get_paramset_description(
        &self,
        address: &str,
        kind: ParamsetKind,
    ) -> Result<ParamsetDescription, Error> {
        self.call("getParamsetDescription", json!([address, kind]))
            .await
    }

    // ── Values ───────────────────────────────────────────────────────

    pub async fn get_paramset(&self, address: &str, kind: ParamsetKind) -> Result<Paramset, Error> {
        self.call("getParamset", json!([address, kind])).await
    }

    pub async fn put_paramset(
        &self,
        address: &str,
        kind: ParamsetKind,
        values: &Paramset,
    ) -> Result<(), Error> {
        self.call_unit("putParamset", json!([address, kind, values]))
            .await
    }

    pub async fn get_value(&self, address: &str, parameter: &str) -> Result<Value, Error> {
        self.call("getValue", json!([address, parameter])).await
    }

    pub async fn set_value(
        &self,
        address: &str,
        parameter: &str,
        value: &Value,
    ) -> Result<(), Error> {
        self.call_unit("setValue", json!([address, parameter, value]))
            .await
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Issue one JSON-RPC call and decode its `result`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, Error> {
        let raw = self.send(method, params).await?;
        serde_json::from_value(raw.clone()).map_err(|e| Error::Deserialization {
            message: format!("{method}: {e}"),
            body: raw.to_string(),
        })
    }

    /// Issue a call whose result carries no information.
    async fn call_unit(&self, method: &str, params: serde_json::Value) -> Result<(), Error> {
        self.send(method, params).await.map(drop)
    }

    async fn send(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        debug!(url = %self.url, method, id, "primary rpc");

        let resp = self.http.post(self.url.clone()).json(&body).send().await?;
        let status = resp.status();

        if status == reqwest::StatusCode::NOT_FOUND
            || status == reqwest::StatusCode::METHOD_NOT_ALLOWED
        {
            return Err(Error::MethodNotFound {
                method: method.to_owned(),
            });
        }

        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Rpc {
                code: i64::from(status.as_u16()),
                message: if text.is_empty() {
                    status.to_string()
                } else {
                    text
                },
            });
        }

        trace!(method, body = %text, "primary rpc response");

        let envelope: RpcResponse<serde_json::Value> =
            serde_json::from_str(&text).map_err(|e| {
                let preview: String = text.chars().take(200).collect();
                Error::Deserialization {
                    message: format!("{e} (body preview: {preview:?})"),
                    body: text.clone(),
                }
            })?;

        if let Some(err) = envelope.error {
            return Err(match err.code {
                METHOD_NOT_FOUND => Error::MethodNotFound {
                    method: method.to_owned(),
                },
                INVALID_PARAMS => Error::InvalidParams {
                    message: err.message,
                },
                code => Error::Rpc {
                    code,
                    message: err.message,
                },
            });
        }

        Ok(envelope.result.unwrap_or(serde_json::Value::Null))
    }
}
