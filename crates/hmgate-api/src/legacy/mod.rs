// Legacy protocol: JSON-RPC 1.1 through the backend's session-based web API.

pub mod client;
mod session;

pub use client::LegacyClient;
pub use session::SESSION_RENEW_AFTER;
