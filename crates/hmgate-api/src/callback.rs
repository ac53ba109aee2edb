//! Callback listener for backend push notifications.
//!
//! One HTTP listener per central accepts JSON-RPC 2.0 `POST`s on `/` and
//! `/RPC2`. Calls carry the interface id they were registered with; the
//! listener routes each decoded [`CallbackEvent`] to that interface's
//! [`CallbackReceiver`] and drops events for ids nobody registered.
//!
//! ```rust,ignore
//! let server = CallbackServer::bind("0.0.0.0:0".parse()?).await?;
//! let mut events = server.register("ccu-HmIP-RF", known_devices_rx).await;
//! client.init(&server.url("192.168.1.20"), "ccu-HmIP-RF").await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::primary::client::{INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::types::{DeviceDescription, DeviceSummary, Value};

/// Methods the listener answers, reported by `system.listMethods`.
pub const CALLBACK_METHODS: &[&str] = &[
    "deleteDevices",
    "error",
    "event",
    "listDevices",
    "newDevices",
    "readdedDevice",
    "replaceDevice",
    "system.listMethods",
    "system.multicall",
    "updateDevice",
];

// ── CallbackEvent ────────────────────────────────────────────────────

/// A decoded push notification for one interface.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    /// A parameter value changed on a channel (or device, for channel 0).
    ValueChanged {
        channel_address: String,
        parameter: String,
        value: Value,
    },
    /// Newly paired devices with all their channel descriptions.
    DeviceNew { descriptions: Vec<DeviceDescription> },
    /// A device or channel was removed.
    DeviceDeleted { address: String },
    /// A device changed: hint 0 = firmware/descriptions, 1 = links.
    DeviceUpdated { address: String, hint: i64 },
    /// A device was swapped for another one.
    DeviceReplaced {
        old_address: String,
        new_address: String,
    },
    /// Previously known devices were paired again.
    DeviceReadded { addresses: Vec<String> },
    /// The backend reports it lost contact with the interface.
    InterfaceUnreachable { code: i64, message: String },
}

// ── CallbackReceiver ─────────────────────────────────────────────────

/// Event sequence for one registered interface.
///
/// Unbounded and not restartable: once the listener drops the interface
/// (deregistration, re-registration, or shutdown) the sequence ends.
pub struct CallbackReceiver {
    interface_id: String,
    rx: mpsc::UnboundedReceiver<CallbackEvent>,
}

impl CallbackReceiver {
    pub fn interface_id(&self) -> &str {
        &self.interface_id
    }

    /// Next event, or `None` once the interface is no longer routed.
    pub async fn recv(&mut self) -> Option<CallbackEvent> {
        self.rx.recv().await
    }
}

impl futures_core::Stream for CallbackReceiver {
    type Item = CallbackEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ── Routing table ────────────────────────────────────────────────────

struct Route {
    tx: mpsc::UnboundedSender<CallbackEvent>,
    known: watch::Receiver<Arc<Vec<DeviceSummary>>>,
}

type Routes = Arc<RwLock<HashMap<String, Route>>>;

// ── CallbackServer ───────────────────────────────────────────────────

/// Running callback listener shared by all interfaces of a central.
pub struct CallbackServer {
    local_addr: SocketAddr,
    routes: Routes,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackServer {
    /// Bind `addr` and start serving. Port `0` picks a free port.
    ///
    /// Bind failures are fatal for interface setup and surface as
    /// [`Error::Bind`].
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind {
                address: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            address: addr.to_string(),
            source,
        })?;

        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let app = Router::new()
            .route("/", post(handle_rpc))
            .route("/RPC2", post(handle_rpc))
            .with_state(Arc::clone(&routes));

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!(error = %e, "callback listener stopped with error");
            }
        });

        info!(%local_addr, "callback listener bound");

        Ok(Self {
            local_addr,
            routes,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL the backend should push to, as reachable under `host`.
    pub fn url(&self, host: &str) -> String {
        format!("http://{host}:{}", self.local_addr.port())
    }

    /// Route events tagged `interface_id` to a new receiver.
    ///
    /// `known` feeds the `listDevices` reply for this interface. A previous
    /// registration under the same id is replaced and its receiver ends.
    pub async fn register(
        &self,
        interface_id: &str,
        known: watch::Receiver<Arc<Vec<DeviceSummary>>>,
    ) -> CallbackReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self
            .routes
            .write()
            .await
            .insert(interface_id.to_owned(), Route { tx, known });
        if replaced.is_some() {
            debug!(interface_id, "callback route replaced");
        }
        CallbackReceiver {
            interface_id: interface_id.to_owned(),
            rx,
        }
    }

    /// Stop routing `interface_id`; its receiver ends.
    pub async fn deregister(&self, interface_id: &str) {
        self.routes.write().await.remove(interface_id);
    }

    /// Stop accepting connections and end every receiver.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.routes.write().await.clear();
        debug!("callback listener shut down");
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Request handling ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Vec<serde_json::Value>,
    #[serde(default)]
    id: serde_json::Value,
}

#[derive(Deserialize)]
struct MulticallEntry {
    #[serde(rename = "methodName")]
    method_name: String,
    #[serde(default)]
    params: Vec<serde_json::Value>,
}

/// JSON-RPC error object produced while dispatching.
struct Fault {
    code: i64,
    message: String,
}

impl Fault {
    fn invalid_params(method: &str, e: &serde_json::Error) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: format!("{method}: {e}"),
        }
    }
}

async fn handle_rpc(State(routes): State<Routes>, body: String) -> Json<serde_json::Value> {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "undecodable callback request");
            return Json(json!({
                "jsonrpc": "2.0",
                "error": { "code": -32700, "message": e.to_string() },
                "id": null,
            }));
        }
    };

    let reply = match dispatch(&routes, &request.method, request.params).await {
        Ok(result) => json!({ "jsonrpc": "2.0", "result": result, "id": request.id }),
        Err(fault) => json!({
            "jsonrpc": "2.0",
            "error": { "code": fault.code, "message": fault.message },
            "id": request.id,
        }),
    };
    Json(reply)
}

async fn dispatch(
    routes: &Routes,
    method: &str,
    params: Vec<serde_json::Value>,
) -> Result<serde_json::Value, Fault> {
    if method == "system.multicall" {
        let (calls,): (Vec<MulticallEntry>,) =
            decode(params).map_err(|e| Fault::invalid_params(method, &e))?;
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if call.method_name == "system.multicall" {
                results.push(json!({
                    "faultCode": METHOD_NOT_FOUND,
                    "faultString": "nested multicall",
                }));
                continue;
            }
            let outcome = dispatch_single(routes, &call.method_name, call.params).await;
            results.push(match outcome {
                Ok(value) => json!([value]),
                Err(fault) => json!({ "faultCode": fault.code, "faultString": fault.message }),
            });
        }
        return Ok(serde_json::Value::Array(results));
    }
    dispatch_single(routes, method, params).await
}

async fn dispatch_single(
    routes: &Routes,
    method: &str,
    params: Vec<serde_json::Value>,
) -> Result<serde_json::Value, Fault> {
    let bad = |e: serde_json::Error| Fault::invalid_params(method, &e);

    match method {
        "system.listMethods" => Ok(json!(CALLBACK_METHODS)),
        "event" => {
            let (interface_id, channel_address, parameter, value): (String, String, String, Value) =
                decode(params).map_err(bad)?;
            debug!(%interface_id, %channel_address, %parameter, %value, "event");
            emit(
                routes,
                &interface_id,
                [CallbackEvent::ValueChanged {
                    channel_address,
                    parameter,
                    value,
                }],
            )
            .await;
            Ok(json!(""))
        }
        "listDevices" => {
            let (interface_id,): (String,) = decode(params).map_err(bad)?;
            let guard = routes.read().await;
            let known = guard
                .get(&interface_id)
                .map(|route| route.known.borrow().as_ref().clone())
                .unwrap_or_default();
            debug!(%interface_id, count = known.len(), "listDevices");
            Ok(json!(known))
        }
        "newDevices" => {
            let (interface_id, descriptions): (String, Vec<DeviceDescription>) =
                decode(params).map_err(bad)?;
            info!(%interface_id, count = descriptions.len(), "newDevices");
            emit(routes, &interface_id, [CallbackEvent::DeviceNew { descriptions }]).await;
            Ok(json!(""))
        }
        "deleteDevices" => {
            let (interface_id, addresses): (String, Vec<String>) = decode(params).map_err(bad)?;
            info!(%interface_id, count = addresses.len(), "deleteDevices");
            emit(
                routes,
                &interface_id,
                addresses
                    .into_iter()
                    .map(|address| CallbackEvent::DeviceDeleted { address }),
            )
            .await;
            Ok(json!(""))
        }
        "updateDevice" => {
            let (interface_id, address, hint): (String, String, i64) =
                decode(params).map_err(bad)?;
            emit(routes, &interface_id, [CallbackEvent::DeviceUpdated { address, hint }]).await;
            Ok(json!(""))
        }
        "replaceDevice" => {
            let (interface_id, old_address, new_address): (String, String, String) =
                decode(params).map_err(bad)?;
            emit(
                routes,
                &interface_id,
                [CallbackEvent::DeviceReplaced {
                    old_address,
                    new_address,
                }],
            )
            .await;
            Ok(json!(""))
        }
        "readdedDevice" => {
            let (interface_id, addresses): (String, Vec<String>) = decode(params).map_err(bad)?;
            emit(routes, &interface_id, [CallbackEvent::DeviceReadded { addresses }]).await;
            Ok(json!(""))
        }
        "error" => {
            let (interface_id, code, message): (String, i64, String) =
                decode(params).map_err(bad)?;
            warn!(%interface_id, code, %message, "backend reported error");
            emit(
                routes,
                &interface_id,
                [CallbackEvent::InterfaceUnreachable { code, message }],
            )
            .await;
            Ok(json!(""))
        }
        other => Err(Fault {
            code: METHOD_NOT_FOUND,
            message: format!("unknown method: {other}"),
        }),
    }
}

/// Positional params decode as a tuple.
fn decode<T: DeserializeOwned>(params: Vec<serde_json::Value>) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::Value::Array(params))
}

async fn emit(
    routes: &Routes,
    interface_id: &str,
    events: impl IntoIterator<Item = CallbackEvent>,
) {
    let guard = routes.read().await;
    let Some(route) = guard.get(interface_id) else {
        warn!(interface_id, "callback for unregistered interface dropped");
        return;
    };
    for event in events {
        if route.tx.send(event).is_err() {
            debug!(interface_id, "callback receiver gone, event dropped");
            return;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
