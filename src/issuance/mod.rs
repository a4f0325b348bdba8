//! Session Issuance Adapter.
//!
//! Converts a validated SSO identity into a backend session token. The
//! strategy is picked once from the configured protocol tag.

pub mod config;
pub mod legacy_envelope;
pub mod shared_secret;

pub use config::IssuanceConfig;
pub use legacy_envelope::LegacyEnvelopeExchange;
pub use shared_secret::SharedSecretExchange;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::upstream::build_client;

/// Everything an issuance backend may need about the login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRequest {
    pub target_url: String,
    pub domain: String,
    pub user_id: String,
    pub assertion_session_id: String,
    pub client_ip: String,
}

#[derive(Debug, Error)]
pub enum IssuanceError {
    /// No issuance data for the requested target.
    #[error("no session initialization data for {0}")]
    Unconfigured(String),

    #[error("issuance transport failed: {0}")]
    Transport(String),

    /// Backend answered with something other than 200.
    #[error("issuance endpoint returned status {0}")]
    Rejected(u16),

    #[error("issuance response carried no token: {0}")]
    MissingToken(String),
}

/// Closed set of issuance strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceProtocol {
    SharedSecret,
    LegacyEnvelope,
}

impl FromStr for IssuanceProtocol {
    type Err = String;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "shared_secret" | "shared-secret" | "cq2" => Ok(IssuanceProtocol::SharedSecret),
            "legacy_envelope" | "legacy-envelope" | "i2b2" => Ok(IssuanceProtocol::LegacyEnvelope),
            other => Err(format!("unknown issuance protocol: {}", other)),
        }
    }
}

impl std::fmt::Display for IssuanceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssuanceProtocol::SharedSecret => write!(f, "shared_secret"),
            IssuanceProtocol::LegacyEnvelope => write!(f, "legacy_envelope"),
        }
    }
}

/// Session issuance capability.
#[async_trait]
pub trait SessionIssuer: Send + Sync {
    fn protocol(&self) -> IssuanceProtocol;

    /// Obtain a backend session token. Called at most once per login.
    async fn issue(&self, request: &IssuanceRequest) -> Result<String, IssuanceError>;
}

/// Resolve the protocol tag and build its strategy.
pub fn build_issuer(config: &IssuanceConfig, accept_invalid_certs: bool) -> Result<Arc<dyn SessionIssuer>> {
    let protocol: IssuanceProtocol = config.protocol.parse().map_err(|e: String| anyhow!(e))?;

    let issuer: Arc<dyn SessionIssuer> = match protocol {
        IssuanceProtocol::SharedSecret => {
            let client = build_client(
                accept_invalid_certs,
                Some(Duration::from_secs(config.shared_secret.timeout_secs)),
            )?;
            Arc::new(SharedSecretExchange::new(config.shared_secret.registry.clone(), client))
        }
        IssuanceProtocol::LegacyEnvelope => {
            let client = build_client(
                accept_invalid_certs,
                Some(Duration::from_secs(config.legacy_envelope.timeout_secs)),
            )?;
            Arc::new(LegacyEnvelopeExchange::new(
                &config.legacy_envelope,
                &config.identity_headers,
                client,
            )?)
        }
    };

    info!(protocol = %protocol, "Session issuance adapter configured");
    Ok(issuer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_tags() {
        assert_eq!("CQ2".parse::<IssuanceProtocol>().unwrap(), IssuanceProtocol::SharedSecret);
        assert_eq!("shared_secret".parse::<IssuanceProtocol>().unwrap(), IssuanceProtocol::SharedSecret);
        assert_eq!("i2b2".parse::<IssuanceProtocol>().unwrap(), IssuanceProtocol::LegacyEnvelope);
        assert_eq!(" Legacy-Envelope ".parse::<IssuanceProtocol>().unwrap(), IssuanceProtocol::LegacyEnvelope);
        assert!("".parse::<IssuanceProtocol>().is_err());
    }

    #[test]
    fn test_build_issuer() {
        let config: IssuanceConfig = serde_json::from_str(r#"{"protocol": "i2b2"}"#).unwrap();
        let issuer = build_issuer(&config, false).unwrap();
        assert_eq!(issuer.protocol(), IssuanceProtocol::LegacyEnvelope);

        let config: IssuanceConfig = serde_json::from_str(r#"{"protocol": "nope"}"#).unwrap();
        assert!(build_issuer(&config, false).is_err());
    }
}
