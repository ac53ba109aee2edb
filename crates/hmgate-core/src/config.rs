// ── Runtime central configuration ──
//
// These types describe which backends to talk to and how to tune the
// caches, the health monitor, and the request path. They never touch
// disk: hmgate-config (or the host) builds a `CentralConfig` and hands it in.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use hmgate_api::transport::{TlsMode, TransportConfig};
use hmgate_api::{Credentials, RequestPolicy};

use crate::rules::RuleSet;
use crate::schema::SchemaTable;

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(PathBuf),
    /// Skip verification (self-signed certs). Default for local backends.
    #[default]
    DangerAcceptInvalid,
}

/// One backend connection.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Identifier the backend tags callbacks with. Unique per central.
    pub interface_id: String,
    /// Interface name the legacy protocol expects (`HmIP-RF`, `BidCos-RF`, ...).
    pub backend_interface: String,
    /// Primary protocol endpoint (e.g. `http://192.168.1.20:2010`).
    pub url: Url,
    /// Legacy web API base; `None` disables the fallback.
    pub legacy_url: Option<Url>,
    pub credentials: Option<Credentials>,
    pub tls: TlsVerification,
}

/// Value Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// `false` sends every read to the backend.
    pub enabled: bool,
    /// `max_age` for reads that don't pass one.
    pub default_max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_age: Duration::from_secs(300),
        }
    }
}

/// Connection Health Monitor tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    /// Reconnect cadence while disconnected.
    pub reconnect_backoff: Duration,
    /// Reconnect cadence when the callback side has gone quiet as well.
    pub silent_reconnect_backoff: Duration,
    /// How long without callbacks counts as silence.
    pub callback_silence: Duration,
    /// Consecutive probe failures before the interface is disconnected.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            reconnect_backoff: Duration::from_secs(120),
            silent_reconnect_backoff: Duration::from_secs(30),
            callback_silence: Duration::from_secs(180),
            failure_threshold: 3,
        }
    }
}

/// Outbound request limits, per interface.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        let policy = RequestPolicy::default();
        Self {
            timeout: policy.timeout,
            max_concurrent: policy.max_concurrent,
            max_retries: policy.max_retries,
            retry_delay: policy.retry_delay,
        }
    }
}

impl From<&RequestConfig> for RequestPolicy {
    fn from(config: &RequestConfig) -> Self {
        Self {
            timeout: config.timeout,
            max_concurrent: config.max_concurrent,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }
}

/// Everything a [`Central`](crate::Central) needs.
#[derive(Debug, Clone)]
pub struct CentralConfig {
    /// Names this central towards the backend and keys persisted state.
    pub central_id: String,
    /// Local address the callback listener binds.
    pub callback_bind: SocketAddr,
    /// Host the backend should push to (our address as the backend sees it).
    pub callback_host: String,
    /// Where persisted caches live; `None` disables persistence.
    pub storage_dir: Option<PathBuf>,
    pub interfaces: Vec<InterfaceConfig>,
    pub cache: CacheConfig,
    pub health: HealthConfig,
    pub request: RequestConfig,
    pub rules: RuleSet,
    pub schemas: SchemaTable,
}

impl CentralConfig {
    /// A config with no interfaces and built-in rules and schemas.
    pub fn new(central_id: impl Into<String>, callback_bind: SocketAddr) -> Self {
        Self {
            central_id: central_id.into(),
            callback_bind,
            callback_host: callback_bind.ip().to_string(),
            storage_dir: None,
            interfaces: Vec::new(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            request: RequestConfig::default(),
            rules: RuleSet::default(),
            schemas: SchemaTable::builtin(),
        }
    }
}

// ── Transport helpers ───────────────────────────────────────────────

pub(crate) fn tls_to_transport(tls: &TlsVerification) -> TlsMode {
    match tls {
        TlsVerification::SystemDefaults => TlsMode::System,
        TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
        TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
    }
}

/// HTTP client settings for one interface. The client-level timeout sits
/// above the per-attempt deadline so the request path decides timeouts.
pub(crate) fn build_transport(
    interface: &InterfaceConfig,
    request: &RequestConfig,
) -> TransportConfig {
    TransportConfig {
        tls: tls_to_transport(&interface.tls),
        timeout: request.timeout * 2,
        max_idle_per_host: request.max_concurrent.max(1),
    }
}
