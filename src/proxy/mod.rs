//! Proxy Forwarding Engine.
//!
//! Relays hive XML envelopes from the browser to whitelisted backend services,
//! stripping identity-spoofing headers on the way out and cookies on the way back.

pub mod allowlist;
pub mod config;
pub mod envelope;
pub mod forward;
pub mod headers;

pub use allowlist::Allowlist;
pub use config::{AllowlistConfig, ProxyConfig};
pub use forward::{router, ProxyEngine};
pub use headers::HeaderSanitizer;
