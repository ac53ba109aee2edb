// ── Core error types ──
//
// Host-facing errors from hmgate-core. Hosts never see HTTP status codes
// or JSON parse failures directly; the `From<hmgate_api::Error>` impl
// translates wire-layer errors into this taxonomy.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    /// The backend is not answering, or the interface is disconnected.
    #[error("Backend unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Cannot bind callback listener on {address}: {reason}")]
    BindError { address: String, reason: String },

    // ── Parameter errors ─────────────────────────────────────────────
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Permission denied: {parameter} on {channel} is not writable")]
    PermissionDenied { channel: String, parameter: String },

    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("Parameter not found: {parameter} on {channel}")]
    ParameterNotFound { channel: String, parameter: String },

    #[error("Entity not found: {id}")]
    EntityNotFound { id: String },

    #[error("Interface not found: {interface_id}")]
    InterfaceNotFound { interface_id: String },

    // ── Persistence ──────────────────────────────────────────────────
    #[error("Persisted state at {path} is unusable: {reason}")]
    PersistenceCorrupt { path: String, reason: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Central is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// `true` for failures the health monitor counts against the interface.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<hmgate_api::Error> for CoreError {
    fn from(err: hmgate_api::Error) -> Self {
        use hmgate_api::Error as Api;

        match err {
            Api::Authentication { message } => CoreError::AuthenticationFailed { message },
            Api::SessionExpired => CoreError::AuthenticationFailed {
                message: "Session expired -- re-authentication required".into(),
            },
            Api::Transport(ref e) if e.is_timeout() => CoreError::Timeout { timeout_secs: 0 },
            Api::Transport(e) => CoreError::Unreachable {
                reason: e.to_string(),
            },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::Tls(msg) => CoreError::Unreachable {
                reason: format!("TLS error: {msg}"),
            },
            Api::Unreachable { attempts, reason } => CoreError::Unreachable {
                reason: format!("{reason} (after {attempts} attempt(s))"),
            },
            Api::Cancelled => CoreError::ShuttingDown,
            Api::MethodNotFound { method } => CoreError::Unsupported { operation: method },
            Api::InvalidParams { message } => CoreError::InvalidParameter { message },
            Api::Rpc { code, message } => {
                CoreError::Internal(format!("Backend error {code}: {message}"))
            }
            Api::LegacyApi { message } => CoreError::Internal(format!("Backend error: {message}")),
            Api::Bind { address, source } => CoreError::BindError {
                address,
                reason: source.to_string(),
            },
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_errors_map_to_host_taxonomy() {
        let err: CoreError = hmgate_api::Error::InvalidParams {
            message: "bad".into(),
        }
        .into();
        assert!(matches!(err, CoreError::InvalidParameter { .. }));

        let err: CoreError = hmgate_api::Error::Unreachable {
            attempts: 3,
            reason: "refused".into(),
        }
        .into();
        assert!(err.is_connection_failure());

        let err: CoreError = hmgate_api::Error::Cancelled.into();
        assert!(matches!(err, CoreError::ShuttingDown));
    }
}
