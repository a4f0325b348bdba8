//! Proxy ingress configuration.

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Allow-list as written in configuration: protocol -> `HOST[:PORT]` entries.
pub type AllowlistConfig = HashMap<String, Vec<String>>;

/// Proxy Forwarding Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Ingress path that carries hive envelopes (any method).
    #[serde(default = "default_path")]
    pub path: String,

    /// Maximum accepted request body in bytes. Larger bodies drop the connection.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Diagnostic header added to every relayed response.
    #[serde(default = "default_marker_header")]
    pub marker_header: String,

    /// Value of the diagnostic header.
    #[serde(default = "default_marker_value")]
    pub marker_value: String,
}

fn default_path() -> String {
    "/~proxy".to_string()
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_marker_header() -> String {
    "i2b2-dev-svr-mode".to_string()
}

fn default_marker_value() -> String {
    "Proxy".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_body_size: default_max_body_size(),
            marker_header: default_marker_header(),
            marker_value: default_marker_value(),
        }
    }
}

impl ProxyConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.path.starts_with('/') {
            return Err(format!("proxy path must start with '/': {}", self.path));
        }

        if self.max_body_size == 0 {
            return Err("proxy max_body_size must be greater than zero".to_string());
        }

        if HeaderName::from_bytes(self.marker_header.as_bytes()).is_err() {
            return Err(format!("invalid marker header name: {}", self.marker_header));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.path, "/~proxy");
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = ProxyConfig::default();
        config.path = "proxy".to_string();
        assert!(config.validate().is_err());

        config.path = "/proxy".to_string();
        config.max_body_size = 0;
        assert!(config.validate().is_err());

        config.max_body_size = 1024;
        config.marker_header = "bad header".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ProxyConfig = serde_json::from_str(r#"{"max_body_size": 2048}"#).unwrap();
        assert_eq!(config.max_body_size, 2048);
        assert_eq!(config.path, "/~proxy");
    }
}
