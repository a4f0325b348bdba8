//! Lazy per-service registry.
//!
//! Each service starts `Unloaded` with its factory and moves to `Loaded` on
//! first reference. Two first-time lookups racing may both materialize the
//! definition; the later write is kept and both results are equivalent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{error, info};

use super::config::{SamlConfig, ServiceFactoryConfig};
use super::provider::{RequestOrigin, ServiceDefinition};
use crate::error::GatewayError;

enum ServiceEntry {
    Unloaded(Arc<ServiceFactoryConfig>),
    Loaded(Arc<ServiceDefinition>),
}

pub struct ServiceRegistry {
    base_path: String,
    entries: RwLock<HashMap<String, ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn new(config: &SamlConfig) -> Self {
        let entries = config
            .services
            .iter()
            .map(|(name, factory)| {
                (
                    name.to_lowercase(),
                    ServiceEntry::Unloaded(Arc::new(factory.clone())),
                )
            })
            .collect();

        Self {
            base_path: config.base_path.clone(),
            entries: RwLock::new(entries),
        }
    }

    /// Configured service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    #[cfg(test)]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.entries
            .read()
            .map(|entries| matches!(entries.get(&name.to_lowercase()), Some(ServiceEntry::Loaded(_))))
            .unwrap_or(false)
    }

    /// Return the service definition, materializing it on first use.
    pub fn get_or_load(&self, name: &str, origin: &RequestOrigin) -> Result<Arc<ServiceDefinition>, GatewayError> {
        let name = name.to_lowercase();

        let factory = {
            let entries = self
                .entries
                .read()
                .map_err(|_| GatewayError::Config("service registry lock poisoned".to_string()))?;
            match entries.get(&name) {
                None => return Err(GatewayError::Config(format!("service '{}' is not configured", name))),
                Some(ServiceEntry::Loaded(definition)) => return Ok(definition.clone()),
                Some(ServiceEntry::Unloaded(factory)) => factory.clone(),
            }
        };

        let definition = ServiceDefinition::materialize(&name, &factory, origin, &self.base_path)
            .map(Arc::new)
            .map_err(|e| {
                error!(service = %name, error = %e, "Failed to load SAML service definition");
                GatewayError::Config(format!("service '{}' failed to load: {}", name, e))
            })?;

        let mut entries = self
            .entries
            .write()
            .map_err(|_| GatewayError::Config("service registry lock poisoned".to_string()))?;
        entries.insert(name.clone(), ServiceEntry::Loaded(definition.clone()));

        info!(
            service = %name,
            sp_entity_id = %definition.sp.entity_id,
            idp_entity_id = %definition.idp.entity_id,
            "SAML service definition loaded"
        );

        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::config::{IdpConfig, SpConfig};

    fn registry() -> ServiceRegistry {
        let mut config = SamlConfig::default();
        config.services.insert(
            "Okta".to_string(),
            ServiceFactoryConfig {
                sp: SpConfig::default(),
                idp: IdpConfig {
                    sso_url: Some("https://idp.example.com/sso".to_string()),
                    entity_id: Some("https://idp.example.com".to_string()),
                    ..Default::default()
                },
            },
        );
        config.services.insert(
            "broken".to_string(),
            ServiceFactoryConfig {
                sp: SpConfig::default(),
                idp: IdpConfig {
                    metadata_file: Some("/nonexistent/broken.xml".into()),
                    ..Default::default()
                },
            },
        );
        ServiceRegistry::new(&config)
    }

    fn origin() -> RequestOrigin {
        RequestOrigin {
            scheme: "https".to_string(),
            host: "hive.example.org".to_string(),
        }
    }

    #[test]
    fn test_names_are_case_folded() {
        assert_eq!(registry().names(), vec!["broken".to_string(), "okta".to_string()]);
    }

    #[test]
    fn test_lazy_load_is_idempotent() {
        let registry = registry();
        assert!(!registry.is_loaded("okta"));

        let first = registry.get_or_load("OKTA", &origin()).unwrap();
        assert!(registry.is_loaded("okta"));

        let other = RequestOrigin {
            scheme: "http".to_string(),
            host: "elsewhere".to_string(),
        };
        let second = registry.get_or_load("okta", &other).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.sp.entity_id, "https://hive.example.org/saml/metadata/okta");
    }

    #[test]
    fn test_unknown_service() {
        let err = registry().get_or_load("azure", &origin()).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_failed_load_stays_unloaded() {
        let registry = registry();
        assert!(matches!(
            registry.get_or_load("broken", &origin()),
            Err(GatewayError::Config(_))
        ));
        assert!(!registry.is_loaded("broken"));
    }

    #[test]
    fn test_concurrent_first_access() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_load("okta", &origin()).unwrap())
            })
            .collect();

        for handle in handles {
            let definition = handle.join().unwrap();
            assert_eq!(definition.idp.sso_url, "https://idp.example.com/sso");
        }
        assert!(registry.is_loaded("okta"));
    }
}
