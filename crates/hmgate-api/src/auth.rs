// Credentials and protocol selection shared by both RPC clients.

use secrecy::SecretString;
use strum::Display;

/// Username/password pair for backends that require a session.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

/// Which RPC variant an interface speaks.
///
/// Selected once per interface by the capability probe in
/// [`RequestClient::negotiate`](crate::request::RequestClient::negotiate)
/// and held for the interface's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    /// JSON-RPC 2.0 directly against the interface process.
    Primary,
    /// JSON-RPC 1.1 through the backend's session-based web API.
    Legacy,
}

impl Protocol {
    /// Path appended to the endpoint URL for this protocol.
    pub fn rpc_path(self) -> &'static str {
        match self {
            Self::Primary => "/",
            Self::Legacy => "/api/homematic.cgi",
        }
    }
}
