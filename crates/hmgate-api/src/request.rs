//! Protocol-negotiating request client.
//!
//! [`RequestClient`] wraps either a [`PrimaryClient`] or a [`LegacyClient`],
//! chosen once per interface by a capability probe and held for the
//! interface's lifetime. Every outbound call goes through the same
//! execution path:
//!
//! 1. wait FIFO for a permit from the per-interface semaphore,
//! 2. run a single attempt under the request deadline,
//! 3. release the permit, and on a connection-level failure sleep and retry.
//!
//! Deadline overruns fail with [`Error::Timeout`] immediately. Backend
//! errors are never retried. Cancelling the interface's token aborts
//! queued and in-flight calls with [`Error::Cancelled`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Protocol;
use crate::error::Error;
use crate::legacy::LegacyClient;
use crate::primary::PrimaryClient;
use crate::types::{DeviceDescription, Paramset, ParamsetDescription, ParamsetKind, Value};

// ── Policy ───────────────────────────────────────────────────────────

/// Timeout, concurrency, and retry limits for one interface.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Calls allowed in flight at once.
    pub max_concurrent: usize,
    /// Extra attempts after a connection-level failure.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_concurrent: 3,
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

// ── Backend strategy ─────────────────────────────────────────────────

enum Backend {
    Primary(PrimaryClient),
    Legacy(LegacyClient),
}

impl Backend {
    async fn ping(&self, caller_id: &str) -> Result<bool, Error> {
        match self {
            Self::Primary(c) => c.ping(caller_id).await,
            Self::Legacy(c) => c.is_present().await,
        }
    }

    async fn init(&self, callback_url: &str, interface_id: &str) -> Result<(), Error> {
        match self {
            Self::Primary(c) => c.init(callback_url, interface_id).await,
            Self::Legacy(c) => c.init(callback_url, interface_id).await,
        }
    }

    async fn deinit(&self, callback_url: &str) -> Result<(), Error> {
        match self {
            Self::Primary(c) => c.deinit(callback_url).await,
            Self::Legacy(c) => c.deinit(callback_url).await,
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDescription>, Error> {
        match self {
            Self::Primary(c) => c.list_devices().await,
            Self::Legacy(c) => c.list_devices().await,
        }
    }

    async fn get_device_description(&self, address: &str) -> Result<DeviceDescription, Error> {
        match self {
            Self::Primary(c) => c.get_device_description(address).await,
            Self::Legacy(c) => c.get_device_description(address).await,
        }
    }

    async fn get_paramset_description(
        &self,
        address: &str,
        kind: ParamsetKind,
    ) -> Result<ParamsetDescription, Error> {
        match self {
            Self::Primary(c) => c.get_paramset_description(address, kind).await,
            Self::Legacy(c) => c.get_paramset_description(address, kind).await,
        }
    }

    async fn get_paramset(&self, address: &str, kind: ParamsetKind) -> Result<Paramset, Error> {
        match self {
            Self::Primary(c) => c.get_paramset(address, kind).await,
            Self::Legacy(c) => c.get_paramset(address, kind).await,
        }
    }

    async fn put_paramset(
        &self,
        address: &str,
        kind: ParamsetKind,
        values: &Paramset,
    ) -> Result<(), Error> {
        match self {
            Self::Primary(c) => c.put_paramset(address, kind, values).await,
            Self::Legacy(c) => c.put_paramset(address, kind, values).await,
        }
    }

    async fn get_value(&self, address: &str, parameter: &str) -> Result<Value, Error> {
        match self {
            Self::Primary(c) => c.get_value(address, parameter).await,
            Self::Legacy(c) => c.get_value(address, parameter).await,
        }
    }

    async fn set_value(&self, address: &str, parameter: &str, value: &Value) -> Result<(), Error> {
        match self {
            Self::Primary(c) => c.set_value(address, parameter, value).await,
            Self::Legacy(c) => c.set_value(address, parameter, value).await,
        }
    }
}

// ── RequestClient ────────────────────────────────────────────────────

/// Outbound call strategy for one interface.
pub struct RequestClient {
    backend: Backend,
    permits: Arc<Semaphore>,
    policy: RequestPolicy,
    cancel: CancellationToken,
}

impl RequestClient {
    /// Probe the primary protocol and pin the variant for this interface.
    ///
    /// `system.listMethods` is attempted once. A "method not found" answer
    /// pins the legacy client (when one is configured); a connection
    /// failure or deadline overrun fails with [`Error::Unreachable`].
    pub async fn negotiate(
        primary: PrimaryClient,
        legacy: Option<LegacyClient>,
        policy: RequestPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let probe = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio::time::timeout(policy.timeout, primary.system_list_methods()) => r,
        };

        let backend = match probe {
            Ok(Ok(methods)) => {
                info!(url = %primary.url(), methods = methods.len(), "primary protocol pinned");
                Backend::Primary(primary)
            }
            Ok(Err(e)) if e.is_method_not_found() => match legacy {
                Some(legacy) => {
                    info!(
                        url = %legacy.url(),
                        interface = legacy.interface(),
                        "legacy protocol pinned"
                    );
                    Backend::Legacy(legacy)
                }
                None => return Err(e),
            },
            Ok(Err(e)) if e.is_transient() || e.is_timeout() => {
                return Err(Error::Unreachable {
                    attempts: 1,
                    reason: e.to_string(),
                });
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Unreachable {
                    attempts: 1,
                    reason: "capability probe timed out".into(),
                });
            }
        };

        Ok(Self::from_backend(backend, policy, cancel))
    }

    /// Use the primary protocol without probing.
    pub fn primary(
        client: PrimaryClient,
        policy: RequestPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self::from_backend(Backend::Primary(client), policy, cancel)
    }

    /// Use the legacy protocol without probing.
    pub fn legacy(client: LegacyClient, policy: RequestPolicy, cancel: CancellationToken) -> Self {
        Self::from_backend(Backend::Legacy(client), policy, cancel)
    }

    fn from_backend(backend: Backend, policy: RequestPolicy, cancel: CancellationToken) -> Self {
        let permits = Arc::new(Semaphore::new(policy.max_concurrent.max(1)));
        Self {
            backend,
            permits,
            policy,
            cancel,
        }
    }

    /// The protocol variant pinned for this interface.
    pub fn protocol(&self) -> Protocol {
        match self.backend {
            Backend::Primary(_) => Protocol::Primary,
            Backend::Legacy(_) => Protocol::Legacy,
        }
    }

    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Lightweight liveness probe.
    pub async fn ping(&self, caller_id: &str) -> Result<bool, Error> {
        self.execute("ping", || self.backend.ping(caller_id)).await
    }

    pub async fn init(&self, callback_url: &str, interface_id: &str) -> Result<(), Error> {
        self.execute("init", || self.backend.init(callback_url, interface_id))
            .await
    }

    pub async fn deinit(&self, callback_url: &str) -> Result<(), Error> {
        self.execute("deinit", || self.backend.deinit(callback_url))
            .await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceDescription>, Error> {
        self.execute("listDevices", || self.backend.list_devices())
            .await
    }

    pub async fn get_device_description(&self, address: &str) -> Result<DeviceDescription, Error> {
        self.execute("getDeviceDescription", || {
            self.backend.get_device_description(address)
        })
        .await
    }

    pub async fn get_paramset_description(
        &self,
        address: &str,
        kind: ParamsetKind,
    ) -> Result<ParamsetDescription, Error> {
        self.execute("getParamsetDescription", || {
            self.backend.get_paramset_description(address, kind)
        })
        .await
    }

    pub async fn get_paramset(&self, address: &str, kind: ParamsetKind) -> Result<Paramset, Error> {
        self.execute("getParamset", || self.backend.get_paramset(address, kind))
            .await
    }

    pub async fn put_paramset(
        &self,
        address: &str,
        kind: ParamsetKind,
        values: &Paramset,
    ) -> Result<(), Error> {
        self.execute("putParamset", || {
            self.backend.put_paramset(address, kind, values)
        })
        .await
    }

    pub async fn get_value(&self, address: &str, parameter: &str) -> Result<Value, Error> {
        self.execute("getValue", || self.backend.get_value(address, parameter))
            .await
    }

    pub async fn set_value(
        &self,
        address: &str,
        parameter: &str,
        value: &Value,
    ) -> Result<(), Error> {
        self.execute("setValue", || {
            self.backend.set_value(address, parameter, value)
        })
        .await
    }

    /// Close the legacy session, if one is open. No-op for the primary protocol.
    pub async fn logout(&self) -> Result<(), Error> {
        match &self.backend {
            Backend::Primary(_) => Ok(()),
            Backend::Legacy(c) => c.logout().await,
        }
    }

    // ── Execution path ───────────────────────────────────────────────

    async fn execute<T, F, Fut>(&self, method: &'static str, op: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let outcome = {
                let _permit = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Err(Error::Cancelled),
                    permit = self.permits.acquire() => permit.map_err(|_| Error::Cancelled)?,
                };

                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Err(Error::Cancelled),
                    r = tokio::time::timeout(self.policy.timeout, op()) => r,
                }
            };

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => return Err(self.timeout_error()),
            };

            if err.is_timeout() {
                return Err(self.timeout_error());
            }
            if !err.is_transient() {
                return Err(err);
            }
            if attempt > self.policy.max_retries {
                return Err(Error::Unreachable {
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            warn!(method, attempt, error = %err, "transient failure, retrying");

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(self.policy.retry_delay) => {}
            }

            debug!(method, attempt = attempt + 1, "retry");
        }
    }

    fn timeout_error(&self) -> Error {
        Error::Timeout {
            timeout_secs: self.policy.timeout.as_secs().max(1),
        }
    }
}
