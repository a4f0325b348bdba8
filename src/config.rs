//! Gateway configuration.
//!
//! Loaded once at startup from a JSON document and handed to each component.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::issuance::IssuanceConfig;
use crate::proxy::{AllowlistConfig, ProxyConfig};
use crate::saml::SamlConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Protocol -> allowed `HOST[:PORT]` entries. Wins over `allowlist_file`.
    #[serde(default)]
    pub allowlist: Option<AllowlistConfig>,

    /// JSON file with the same shape as `allowlist`.
    #[serde(default)]
    pub allowlist_file: Option<PathBuf>,

    /// Skip certificate validation on every outbound connection.
    #[serde(default)]
    pub proxy_to_self_signed_tls: bool,

    #[serde(default)]
    pub use_cors: bool,

    /// Static web client served for unmatched paths.
    #[serde(default)]
    pub hosting_dir: Option<PathBuf>,

    #[serde(default)]
    pub saml: Option<SamlConfig>,

    #[serde(default)]
    pub issuance: Option<IssuanceConfig>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            proxy: ProxyConfig::default(),
            allowlist: None,
            allowlist_file: None,
            proxy_to_self_signed_tls: false,
            use_cors: false,
            hosting_dir: None,
            saml: None,
            issuance: None,
        }
    }
}

impl GatewayConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: GatewayConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .map_err(|e| anyhow!("Invalid configuration in {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.proxy.validate()?;

        if let Some(ref saml) = self.saml {
            saml.validate()?;

            if self.issuance.is_none() {
                return Err("saml requires an issuance section".to_string());
            }

            if saml.base_path == self.proxy.path || self.proxy.path.starts_with(&format!("{}/", saml.base_path)) {
                return Err(format!(
                    "proxy path {} collides with SAML base_path {}",
                    self.proxy.path, saml.base_path
                ));
            }
        }

        if let Some(ref issuance) = self.issuance {
            issuance.validate()?;
        }

        Ok(())
    }

    /// Resolve the allow-list: inline entries, else the allow-list file.
    pub fn load_allowlist(&self) -> Result<AllowlistConfig> {
        if let Some(ref inline) = self.allowlist {
            if self.allowlist_file.is_some() {
                warn!("Both allowlist and allowlist_file configured, using inline allowlist");
            }
            return Ok(inline.clone());
        }

        match self.allowlist_file {
            Some(ref path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read allowlist file: {}", path.display()))?;
                let allowlist: AllowlistConfig = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse allowlist file: {}", path.display()))?;
                info!(path = %path.display(), "Allowlist loaded from file");
                Ok(allowlist)
            }
            None => {
                info!("No allowlist configured");
                Ok(AllowlistConfig::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "listen": "127.0.0.1:9443",
        "proxy": {"max_body_size": 1048576},
        "allowlist": {"https": ["hive.example.org", "backend.example.org:8443"]},
        "proxy_to_self_signed_tls": true,
        "use_cors": true,
        "saml": {
            "services": {
                "okta": {"idp": {"sso_url": "https://idp.example.com/sso", "entity_id": "https://idp.example.com"}}
            },
            "attributes": {"username": "uid", "session": {"autogenerate": true}}
        },
        "issuance": {"protocol": "i2b2"}
    }"#;

    #[test]
    fn test_default_config() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.proxy.path, "/~proxy");
        assert!(config.saml.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let config: GatewayConfig = serde_json::from_str(FULL).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen.port(), 9443);
        assert!(config.proxy_to_self_signed_tls);
        assert_eq!(config.proxy.max_body_size, 1024 * 1024);
        assert_eq!(config.load_allowlist().unwrap()["https"].len(), 2);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_json::from_str::<GatewayConfig>(r#"{"whitelist": {}}"#).is_err());
    }

    #[test]
    fn test_saml_requires_issuance() {
        let mut config: GatewayConfig = serde_json::from_str(FULL).unwrap();
        config.issuance = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proxy_path_collision() {
        let mut config: GatewayConfig = serde_json::from_str(FULL).unwrap();
        config.proxy.path = "/saml/proxy".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allowlist_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whitelist.json");
        std::fs::write(&path, r#"{"http": ["localhost:9090"], "https": []}"#).unwrap();

        let mut config = GatewayConfig {
            allowlist_file: Some(path),
            ..Default::default()
        };
        assert_eq!(config.load_allowlist().unwrap()["http"], vec!["localhost:9090".to_string()]);

        let mut inline = AllowlistConfig::new();
        inline.insert("https".to_string(), vec!["hive.example.org".to_string()]);
        config.allowlist = Some(inline);
        assert!(!config.load_allowlist().unwrap().contains_key("http"));
    }

    #[test]
    fn test_missing_allowlist_file() {
        let config = GatewayConfig {
            allowlist_file: Some("/nonexistent/whitelist.json".into()),
            ..Default::default()
        };
        assert!(config.load_allowlist().is_err());
        assert!(GatewayConfig::default().load_allowlist().unwrap().is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, FULL).unwrap();
        assert!(GatewayConfig::load(&path).is_ok());

        std::fs::write(&path, r#"{"proxy": {"path": "no-slash"}}"#).unwrap();
        assert!(GatewayConfig::load(&path).is_err());
    }
}
