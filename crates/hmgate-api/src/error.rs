use thiserror::Error;

/// Top-level error type for the `hmgate-api` crate.
///
/// Covers every failure mode across the wire layer: session auth,
/// transport, primary JSON-RPC, legacy JSON-RPC, and the callback listener.
/// `hmgate-core` maps these into host-facing errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Session login failed (wrong credentials, account locked, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Legacy session is no longer accepted by the backend.
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A single call exceeded its deadline.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Every attempt of a call failed at the connection level.
    #[error("Backend unreachable after {attempts} attempt(s): {reason}")]
    Unreachable { attempts: u32, reason: String },

    /// The call was abandoned because its interface is shutting down.
    #[error("Request cancelled")]
    Cancelled,

    // ── Primary protocol ────────────────────────────────────────────
    /// Backend does not implement the requested method.
    #[error("Method not supported by backend: {method}")]
    MethodNotFound { method: String },

    /// Backend rejected the call parameters (unknown parameter, bad type, ...).
    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    /// Any other JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    // ── Legacy protocol ─────────────────────────────────────────────
    /// Error from the legacy API (parsed from the `{result, error}` envelope).
    #[error("Legacy API error: {message}")]
    LegacyApi { message: String },

    // ── Callback listener ───────────────────────────────────────────
    /// The callback listener could not bind its local address.
    #[error("Cannot bind callback listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates the session has expired
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::SessionExpired)
    }

    /// Returns `true` for connection-level failures worth another attempt.
    /// Deadline overruns are not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_connect() || (e.is_request() && !e.is_timeout()),
            Self::Unreachable { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if this error is a deadline overrun.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if the backend signalled that the method does not exist.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::MethodNotFound { .. })
    }
}
