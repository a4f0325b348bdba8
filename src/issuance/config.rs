//! Session issuance configuration.

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::IssuanceProtocol;
use crate::proxy::headers::DEFAULT_IDENTITY_HEADERS;

/// Session Issuance Adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssuanceConfig {
    /// Protocol tag: `shared_secret` (`cq2`) or `legacy_envelope` (`i2b2`).
    pub protocol: String,

    #[serde(default)]
    pub shared_secret: SharedSecretConfig,

    #[serde(default)]
    pub legacy_envelope: LegacyEnvelopeConfig,

    /// Headers carrying SSO-derived identity to the backend.
    #[serde(default)]
    pub identity_headers: IdentityHeaders,
}

/// Shared-secret exchange settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedSecretConfig {
    /// Backend target URL -> session start endpoint and its secret.
    #[serde(default)]
    pub registry: HashMap<String, SharedSecretTarget>,

    #[serde(default = "default_shared_secret_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedSecretTarget {
    pub endpoint: String,
    pub secret: String,
}

/// Legacy envelope exchange settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyEnvelopeConfig {
    #[serde(default = "default_legacy_timeout")]
    pub timeout_secs: u64,

    /// Appended to the target URL to form the endpoint.
    #[serde(default = "default_service_suffix")]
    pub service_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityHeaders {
    #[serde(default = "default_username_header")]
    pub username: String,

    #[serde(default = "default_session_header")]
    pub session: String,
}

fn default_shared_secret_timeout() -> u64 {
    5
}

fn default_legacy_timeout() -> u64 {
    60
}

fn default_service_suffix() -> String {
    "getServices".to_string()
}

fn default_username_header() -> String {
    DEFAULT_IDENTITY_HEADERS[0].to_string()
}

fn default_session_header() -> String {
    DEFAULT_IDENTITY_HEADERS[1].to_string()
}

impl Default for SharedSecretConfig {
    fn default() -> Self {
        Self {
            registry: HashMap::new(),
            timeout_secs: default_shared_secret_timeout(),
        }
    }
}

impl Default for LegacyEnvelopeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_legacy_timeout(),
            service_suffix: default_service_suffix(),
        }
    }
}

impl Default for IdentityHeaders {
    fn default() -> Self {
        Self {
            username: default_username_header(),
            session: default_session_header(),
        }
    }
}

impl IdentityHeaders {
    pub fn names(&self) -> [&str; 2] {
        [self.username.as_str(), self.session.as_str()]
    }
}

impl IssuanceConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        let protocol: IssuanceProtocol = self.protocol.parse()?;

        for name in self.identity_headers.names() {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(format!("invalid identity header name: {}", name));
            }
        }

        match protocol {
            IssuanceProtocol::SharedSecret => {
                if self.shared_secret.timeout_secs == 0 {
                    return Err("shared_secret timeout_secs must be greater than zero".to_string());
                }
                if self.shared_secret.registry.is_empty() {
                    return Err("shared_secret registry must not be empty".to_string());
                }
                for (target, entry) in &self.shared_secret.registry {
                    if url::Url::parse(&entry.endpoint).is_err() {
                        return Err(format!("invalid shared_secret endpoint for {}: {}", target, entry.endpoint));
                    }
                    if entry.secret.is_empty() {
                        return Err(format!("shared_secret secret for {} is empty", target));
                    }
                }
            }
            IssuanceProtocol::LegacyEnvelope => {
                if self.legacy_envelope.timeout_secs == 0 {
                    return Err("legacy_envelope timeout_secs must be greater than zero".to_string());
                }
            }
        }

        Ok(())
    }
}
