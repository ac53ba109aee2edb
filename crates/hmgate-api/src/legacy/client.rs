// Legacy API HTTP client
//
// Wraps `reqwest::Client` with the `{result, error}` envelope, named
// params, and the `_session_id_` session parameter. Session login/renew
// lives in `session.rs` to keep this module focused on transport mechanics.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, json};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use url::Url;

use crate::auth::{Credentials, Protocol};
use crate::error::Error;
use crate::legacy::session::Session;
use crate::transport::TransportConfig;
use crate::types::{
    DeviceDescription, ParameterDescription, Paramset, ParamsetDescription, ParamsetKind, Value,
};

// ── Response envelope ────────────────────────────────────────────────

#[derive(Deserialize)]
struct LegacyResponse {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<LegacyErrorObject>,
}

#[derive(Deserialize)]
struct LegacyErrorObject {
    #[serde(default)]
    name: String,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl LegacyErrorObject {
    fn into_error(self) -> Error {
        let text = format!("{} {}", self.name, self.message).to_ascii_lowercase();
        if self.code == 401 || text.contains("access denied") || text.contains("session") {
            Error::SessionExpired
        } else if text.contains("unknown parameter") || text.contains("invalid") {
            Error::InvalidParams {
                message: self.message,
            }
        } else {
            Error::LegacyApi {
                message: if self.message.is_empty() {
                    self.name
                } else {
                    self.message
                },
            }
        }
    }
}

/// Parameter description as the legacy API lists it: flat, with its name.
#[derive(Deserialize)]
struct NamedParameterDescription {
    #[serde(rename = "NAME")]
    name: String,
    #[serde(flatten)]
    description: ParameterDescription,
}

// ── Client ───────────────────────────────────────────────────────────

/// Raw HTTP client for a backend's legacy JSON-RPC API.
///
/// Every call is scoped to one backend interface (`HmIP-RF`, `BidCos-RF`,
/// ...) and carries the session id when credentials are configured.
pub struct LegacyClient {
    http: reqwest::Client,
    url: Url,
    interface: String,
    credentials: Option<Credentials>,
    pub(crate) session: Mutex<Option<Session>>,
}

impl LegacyClient {
    /// Create a new legacy client from a `TransportConfig`.
    ///
    /// `base_url` is the backend web root (e.g. `http://ccu`); the RPC path
    /// is appended automatically.
    pub fn new(
        base_url: &Url,
        interface: impl Into<String>,
        credentials: Option<Credentials>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Self::with_client(http, base_url, interface, credentials)
    }

    /// Create a legacy client with a pre-built `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        base_url: &Url,
        interface: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Result<Self, Error> {
        let url = base_url.join(Protocol::Legacy.rpc_path())?;
        Ok(Self {
            http,
            url,
            interface: interface.into(),
            credentials,
            session: Mutex::new(None),
        })
    }

    /// Backend interface name every call is scoped to.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Full RPC endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    // ── Interface methods ────────────────────────────────────────────

    /// Liveness check for the backend interface.
    pub async fn is_present(&self) -> Result<bool, Error> {
        self.call("Interface.isPresent", self.scoped(Map::new()))
            .await
    }

    /// Register `callback_url` for pushes tagged with `interface_id`.
    pub async fn init(&self, callback_url: &str, interface_id: &str) -> Result<(), Error> {
        let mut params = Map::new();
        params.insert("url".into(), json!(callback_url));
        params.insert("interfaceId".into(), json!(interface_id));
        self.call_unit("Interface.init", self.scoped(params)).await
    }

    /// Deregister `callback_url`.
    pub async fn deinit(&self, callback_url: &str) -> Result<(), Error> {
        self.init(callback_url, "").await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceDescription>, Error> {
        self.call("Interface.listDevices", self.scoped(Map::new()))
            .await
    }

    pub async fn get_device_description(&self, address: &str) -> Result<DeviceDescription, Error> {
        let mut params = Map::new();
        params.insert("address".into(), json!(address));
        self.call("Interface.getDeviceDescription", self.scoped(params))
            .await
    }

    /// Paramset description, re-keyed from the legacy list form into a map.
    pub async fn get_paramset_description(
        &self,
        address: &str,
        kind: ParamsetKind,
    ) -> Result<ParamsetDescription, Error> {
        let mut params = Map::new();
        params.insert("address".into(), json!(address));
        params.insert("paramsetKey".into(), json!(kind));
        let list: Vec<NamedParameterDescription> = self
            .call("Interface.getParamsetDescription", self.scoped(params))
            .await?;
        Ok(list
            .into_iter()
            .map(|entry| (entry.name, entry.description))
            .collect())
    }

    /// Paramset values. Values may arrive as strings; callers coerce them.
    pub async fn get_paramset(&self, address: &str, kind: ParamsetKind) -> Result<Paramset, Error> {
        let mut params = Map::new();
        params.insert("address".into(), json!(address));
        params.insert("paramsetKey".into(), json!(kind));
        self.call("Interface.getParamset", self.scoped(params))
            .await
    }

    pub async fn put_paramset(
        &self,
        address: &str,
        kind: ParamsetKind,
        values: &Paramset,
    ) -> Result<(), Error> {
        let set: Vec<serde_json::Value> = values
            .iter()
            .map(|(name, value)| {
                json!({
                    "name": name,
                    "type": type_tag(value),
                    "value": value,
                })
            })
            .collect();
        let mut params = Map::new();
        params.insert("address".into(), json!(address));
        params.insert("paramsetKey".into(), json!(kind));
        params.insert("set".into(), json!(set));
        self.call_unit("Interface.putParamset", self.scoped(params))
            .await
    }

    pub async fn get_value(&self, address: &str, parameter: &str) -> Result<Value, Error> {
        let mut params = Map::new();
        params.insert("address".into(), json!(address));
        params.insert("valueKey".into(), json!(parameter));
        self.call("Interface.getValue", self.scoped(params)).await
    }

    pub async fn set_value(
        &self,
        address: &str,
        parameter: &str,
        value: &Value,
    ) -> Result<(), Error> {
        let mut params = Map::new();
        params.insert("address".into(), json!(address));
        params.insert("valueKey".into(), json!(parameter));
        params.insert("type".into(), json!(type_tag(value)));
        params.insert("value".into(), json!(value));
        self.call_unit("Interface.setValue", self.scoped(params))
            .await
    }

    // ── Request helpers ──────────────────────────────────────────────

    fn scoped(&self, mut params: Map<String, serde_json::Value>) -> Map<String, serde_json::Value> {
        params.insert("interface".into(), json!(self.interface));
        params
    }

    /// Call with session handling: one re-login and retry if the backend
    /// reports the session as expired.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Map<String, serde_json::Value>,
    ) -> Result<T, Error> {
        let raw = match self.authed_post(method, params.clone()).await {
            Err(Error::SessionExpired) if self.credentials.is_some() => {
                warn!(method, "legacy session rejected, logging in again");
                self.invalidate_session().await;
                self.authed_post(method, params).await?
            }
            other => other?,
        };

        serde_json::from_value(raw.clone()).map_err(|e| Error::Deserialization {
            message: format!("{method}: {e}"),
            body: raw.to_string(),
        })
    }

    async fn call_unit(
        &self,
        method: &str,
        params: Map<String, serde_json::Value>,
    ) -> Result<(), Error> {
        self.call::<serde_json::Value>(method, params)
            .await
            .map(drop)
    }

    async fn authed_post(
        &self,
        method: &str,
        mut params: Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, Error> {
        if let Some(session_id) = self.session_id().await? {
            params.insert("_session_id_".into(), json!(session_id));
        }
        self.post(method, params).await
    }

    /// Send a POST and unwrap the legacy envelope.
    pub(crate) async fn post(
        &self,
        method: &str,
        params: Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, Error> {
        let body = json!({
            "method": method,
            "params": params,
            "jsonrpc": "1.1",
            "id": 0,
        });

        debug!(url = %self.url, method, "legacy rpc");

        let resp = self.http.post(self.url.clone()).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::SessionExpired);
        }
        if !status.is_success() {
            return Err(Error::LegacyApi {
                message: format!("HTTP {status}: {text}"),
            });
        }

        trace!(method, body = %text, "legacy rpc response");

        let envelope: LegacyResponse = serde_json::from_str(&text).map_err(|e| {
            let preview: String = text.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body: text.clone(),
            }
        })?;

        match envelope.error {
            Some(err) => Err(err.into_error()),
            None => Ok(envelope.result),
        }
    }
}

/// Legacy type tag for a value being written.
fn type_tag(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "bool",
        Value::Integer(_) => "int",
        Value::Float(_) => "double",
        Value::String(_) => "string",
    }
}
