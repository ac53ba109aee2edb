//! Configuration for hmgate hosts.
//!
//! A TOML file plus `HMGATE_` environment overrides, credential
//! resolution (env + keyring + plaintext), ignore-rule and schema files,
//! and translation to [`hmgate_core::CentralConfig`].
//!
//! ```toml
//! central_id = "home"
//! callback_bind = "0.0.0.0:9126"
//! callback_host = "192.168.1.50"
//! rule_files = ["rules.toml"]
//!
//! [interfaces.hmip]
//! url = "http://192.168.1.20:2010"
//! backend_interface = "HmIP-RF"
//! legacy_url = "https://192.168.1.20"
//! username = "admin"
//! password_env = "CCU_PASSWORD"
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use hmgate_api::Credentials;
use hmgate_core::{
    CacheConfig, CentralConfig, HealthConfig, InterfaceConfig, RequestConfig, Rule, RuleSet,
    SchemaFile, SchemaTable, TlsVerification,
};

const KEYRING_SERVICE: &str = "hmgate";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no credentials configured for interface '{interface}'")]
    NoCredentials { interface: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("failed to load {path}: {reason}")]
    Rules { path: PathBuf, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_central_id")]
    pub central_id: String,

    /// Local listener address for backend pushes.
    #[serde(default = "default_callback_bind")]
    pub callback_bind: String,

    /// Address backends push to; defaults to the bind IP.
    pub callback_host: Option<String>,

    /// Persisted caches; defaults to the platform data dir.
    pub storage_dir: Option<PathBuf>,

    /// `false` keeps nothing on disk.
    #[serde(default = "default_true")]
    pub persist: bool,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub health: HealthSection,

    #[serde(default)]
    pub request: RequestSection,

    /// Ignore/un-ignore rule files, relative to the config file.
    #[serde(default)]
    pub rule_files: Vec<PathBuf>,

    /// Custom-entity schema files, relative to the config file.
    #[serde(default)]
    pub schema_files: Vec<PathBuf>,

    /// Inline rules, applied after the rule files.
    #[serde(default, rename = "rule")]
    pub rules: Vec<Rule>,

    /// Named backend connections. The name is the interface id.
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceSection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            central_id: default_central_id(),
            callback_bind: default_callback_bind(),
            callback_host: None,
            storage_dir: None,
            persist: true,
            cache: CacheSection::default(),
            health: HealthSection::default(),
            request: RequestSection::default(),
            rule_files: Vec::new(),
            schema_files: Vec::new(),
            rules: Vec::new(),
            interfaces: BTreeMap::new(),
        }
    }
}

fn default_central_id() -> String {
    "hmgate".into()
}
fn default_callback_bind() -> String {
    "0.0.0.0:0".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: default_max_age(),
        }
    }
}

fn default_max_age() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthSection {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_silent_backoff")]
    pub silent_reconnect_backoff_secs: u64,
    #[serde(default = "default_callback_silence")]
    pub callback_silence_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            reconnect_backoff_secs: default_reconnect_backoff(),
            silent_reconnect_backoff_secs: default_silent_backoff(),
            callback_silence_secs: default_callback_silence(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_probe_interval() -> u64 {
    15
}
fn default_reconnect_backoff() -> u64 {
    120
}
fn default_silent_backoff() -> u64 {
    30
}
fn default_callback_silence() -> u64 {
    180
}
fn default_failure_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestSection {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for RequestSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

fn default_timeout() -> u64 {
    5
}
fn default_max_concurrent() -> usize {
    3
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay() -> u64 {
    500
}

/// One backend connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterfaceSection {
    /// Primary protocol endpoint (e.g. "http://192.168.1.20:2010").
    pub url: String,

    /// Interface name the legacy web API expects ("HmIP-RF", "BidCos-RF").
    pub backend_interface: String,

    /// Legacy web API base; omit to disable the fallback.
    pub legacy_url: Option<String>,

    pub username: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,

    /// Password (plaintext; prefer keyring or env var).
    pub password: Option<String>,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub insecure: bool,
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "hmgate", "hmgate")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || fallback_dir(".config").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default directory for persisted caches.
pub fn data_dir() -> PathBuf {
    project_dirs().map_or_else(
        || fallback_dir(".local/share"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

fn fallback_dir(under_home: &str) -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(under_home);
    p.push("hmgate");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the Config from the default path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the Config from `path` + environment. A missing file yields the
/// defaults (plus any environment overrides).
///
/// Environment keys nest with a double underscore:
/// `HMGATE_HEALTH__PROBE_INTERVAL_SECS=30`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), exists = path.exists(), "loading config");
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HMGATE_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Rules and schemas ───────────────────────────────────────────────

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Rules {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::Rules {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Load and concatenate rule files (`[[rule]]` tables), in order.
pub fn load_rules(paths: &[PathBuf], base: &Path) -> Result<RuleSet, ConfigError> {
    let mut rules = RuleSet::default();
    for path in paths {
        let path = resolve_relative(base, path);
        let file: RuleSet = read_toml(&path)?;
        debug!(path = %path.display(), count = file.rules().len(), "rule file loaded");
        rules.extend(file);
    }
    Ok(rules)
}

/// The built-in schema table with every schema file layered on top.
pub fn load_schemas(paths: &[PathBuf], base: &Path) -> Result<SchemaTable, ConfigError> {
    let mut table = SchemaTable::builtin();
    for path in paths {
        let path = resolve_relative(base, path);
        let file: SchemaFile = read_toml(&path)?;
        debug!(
            path = %path.display(),
            schemas = file.schemas.len(),
            devices = file.devices.len(),
            "schema file loaded"
        );
        table.merge(file);
    }

    if let Some(mapping) = table.dangling_mappings().first() {
        return Err(ConfigError::Validation {
            field: "schema_files".into(),
            reason: format!(
                "device type {} maps to unknown schema '{}'",
                mapping.device_type, mapping.schema
            ),
        });
    }
    Ok(table)
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve an interface's credentials. `Ok(None)` when it has no
/// username (backend without authentication).
pub fn resolve_credentials(
    iface: &InterfaceSection,
    interface_id: &str,
) -> Result<Option<Credentials>, ConfigError> {
    let Some(username) = iface.username.clone() else {
        return Ok(None);
    };

    // 1. Env var named by the interface
    if let Some(ref env_name) = iface.password_env {
        if let Ok(pw) = std::env::var(env_name) {
            return Ok(Some(credentials(username, pw)));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{interface_id}/password")) {
        if let Ok(pw) = entry.get_password() {
            return Ok(Some(credentials(username, pw)));
        }
    }

    // 3. Plaintext in config
    if let Some(ref pw) = iface.password {
        return Ok(Some(credentials(username, pw.clone())));
    }

    Err(ConfigError::NoCredentials {
        interface: interface_id.into(),
    })
}

fn credentials(username: String, password: String) -> Credentials {
    Credentials {
        username,
        password: SecretString::from(password),
    }
}

// ── Translation ─────────────────────────────────────────────────────

fn parse_url(field: &str, raw: &str) -> Result<url::Url, ConfigError> {
    raw.parse().map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL {raw}: {e}"),
    })
}

fn interface_config(id: &str, iface: &InterfaceSection) -> Result<InterfaceConfig, ConfigError> {
    let url = parse_url(&format!("interfaces.{id}.url"), &iface.url)?;
    let legacy_url = iface
        .legacy_url
        .as_deref()
        .map(|raw| parse_url(&format!("interfaces.{id}.legacy_url"), raw))
        .transpose()?;

    let tls = if iface.insecure {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = iface.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    };

    Ok(InterfaceConfig {
        interface_id: id.to_owned(),
        backend_interface: iface.backend_interface.clone(),
        url,
        legacy_url,
        credentials: resolve_credentials(iface, id)?,
        tls,
    })
}

/// Build a `CentralConfig`. Relative rule and schema paths resolve
/// against `base_dir` (normally the config file's directory).
pub fn to_central_config(cfg: &Config, base_dir: &Path) -> Result<CentralConfig, ConfigError> {
    let callback_bind: SocketAddr =
        cfg.callback_bind
            .parse()
            .map_err(|_| ConfigError::Validation {
                field: "callback_bind".into(),
                reason: format!("expected host:port, got '{}'", cfg.callback_bind),
            })?;

    if cfg.interfaces.is_empty() {
        return Err(ConfigError::Validation {
            field: "interfaces".into(),
            reason: "at least one interface is required".into(),
        });
    }
    if cfg.health.failure_threshold == 0 {
        return Err(ConfigError::Validation {
            field: "health.failure_threshold".into(),
            reason: "must be at least 1".into(),
        });
    }
    if cfg.request.max_concurrent == 0 {
        return Err(ConfigError::Validation {
            field: "request.max_concurrent".into(),
            reason: "must be at least 1".into(),
        });
    }

    let interfaces = cfg
        .interfaces
        .iter()
        .map(|(id, iface)| interface_config(id, iface))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rules = load_rules(&cfg.rule_files, base_dir)?;
    rules.extend(RuleSet::new(cfg.rules.clone()));
    let schemas = load_schemas(&cfg.schema_files, base_dir)?;

    let storage_dir = cfg
        .persist
        .then(|| cfg.storage_dir.clone().unwrap_or_else(data_dir));

    info!(
        central_id = %cfg.central_id,
        interfaces = interfaces.len(),
        rules = rules.rules().len(),
        "configuration resolved"
    );

    Ok(CentralConfig {
        central_id: cfg.central_id.clone(),
        callback_bind,
        callback_host: cfg
            .callback_host
            .clone()
            .unwrap_or_else(|| callback_bind.ip().to_string()),
        storage_dir,
        interfaces,
        cache: CacheConfig {
            enabled: cfg.cache.enabled,
            default_max_age: Duration::from_secs(cfg.cache.max_age_secs),
        },
        health: HealthConfig {
            probe_interval: Duration::from_secs(cfg.health.probe_interval_secs),
            reconnect_backoff: Duration::from_secs(cfg.health.reconnect_backoff_secs),
            silent_reconnect_backoff: Duration::from_secs(cfg.health.silent_reconnect_backoff_secs),
            callback_silence: Duration::from_secs(cfg.health.callback_silence_secs),
            failure_threshold: cfg.health.failure_threshold,
        },
        request: RequestConfig {
            timeout: Duration::from_secs(cfg.request.timeout_secs),
            max_concurrent: cfg.request.max_concurrent,
            max_retries: cfg.request.max_retries,
            retry_delay: Duration::from_millis(cfg.request.retry_delay_ms),
        },
        rules,
        schemas,
    })
}

/// Load the config file at `path` and build a `CentralConfig` from it.
pub fn load_central_config(path: &Path) -> Result<CentralConfig, ConfigError> {
    let cfg = load_config_from(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    to_central_config(&cfg, base)
}
