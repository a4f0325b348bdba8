//! SAML Session Bridge.
//!
//! Provides SP-initiated SSO for the hive web client and turns accepted
//! assertions into backend session tokens without server-side sessions.

pub mod assertion;
pub mod c14n;
pub mod config;
pub mod context;
pub mod handler;
pub mod idp_metadata;
pub mod provider;
pub mod registry;
pub mod signature;

pub use assertion::SamaelVerifier;
pub use config::SamlConfig;
pub use handler::{router, SamlBridge};
