// Primary protocol: JSON-RPC 2.0 against the backend interface process.

pub mod client;

pub use client::PrimaryClient;
