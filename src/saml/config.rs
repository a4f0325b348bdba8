//! SAML Session Bridge configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::provider::RequestOrigin;

/// SAML Session Bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// Mount point of the SAML endpoints.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Logical service name -> SP/IdP factory definition.
    #[serde(default)]
    pub services: HashMap<String, ServiceFactoryConfig>,

    /// Which assertion fields feed the issuance request.
    #[serde(default)]
    pub attributes: AttributeMapping,

    /// SSO context cookie settings.
    #[serde(default)]
    pub cookie: CookieConfig,

    /// Clock skew tolerance in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,

    /// Accept assertions without a signature (NOT recommended for production).
    #[serde(default)]
    pub allow_unsigned_assertions: bool,

    /// External base URL of the gateway, e.g. `https://hive.example.org`.
    /// SP URLs not configured per service are built from it instead of
    /// from the request.
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Derive SP URLs from `X-Forwarded-Proto`/`X-Forwarded-Host`. Only safe
    /// behind a proxy that overwrites both.
    #[serde(default)]
    pub trust_forwarded_headers: bool,

    /// Function called on `window.opener` with `(userId, token)`.
    #[serde(default = "default_opener_callback")]
    pub opener_callback: String,
}

/// Factory for one logical service. Materialized on first reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceFactoryConfig {
    #[serde(default)]
    pub sp: SpConfig,
    pub idp: IdpConfig,
}

/// Service Provider side of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpConfig {
    /// SP Entity ID. Derived from the request host when absent.
    #[serde(default)]
    pub entity_id: Option<String>,

    /// Assertion Consumer Service URL. Derived from the request host when absent.
    #[serde(default)]
    pub acs_url: Option<String>,

    /// SP certificate (PEM format, included in SP metadata).
    #[serde(default)]
    pub certificate_pem: Option<String>,

    /// NameID format to request.
    /// e.g., "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress"
    #[serde(default)]
    pub name_id_format: Option<String>,

    /// Signed AuthnRequests are not supported; `true` fails validation.
    #[serde(default)]
    pub authn_requests_signed: bool,

    /// Require a signature on the assertion itself, not only on the response.
    #[serde(default = "default_true")]
    pub want_assertions_signed: bool,
}

impl Default for SpConfig {
    fn default() -> Self {
        Self {
            entity_id: None,
            acs_url: None,
            certificate_pem: None,
            name_id_format: None,
            authn_requests_signed: false,
            want_assertions_signed: true,
        }
    }
}

/// Identity Provider side of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpConfig {
    /// IdP metadata file.
    #[serde(default)]
    pub metadata_file: Option<PathBuf>,

    /// IdP metadata XML (inline, alternative to file).
    #[serde(default)]
    pub metadata_xml: Option<String>,

    /// IdP SSO URL (direct configuration, alternative to metadata).
    #[serde(default)]
    pub sso_url: Option<String>,

    /// IdP Entity ID (direct configuration).
    #[serde(default)]
    pub entity_id: Option<String>,

    /// IdP certificate (PEM format, for signature verification).
    #[serde(default)]
    pub certificate_pem: Option<String>,
}

impl IdpConfig {
    fn validate(&self) -> Result<(), String> {
        let has_metadata = self.metadata_file.is_some() || self.metadata_xml.is_some();
        let has_direct_config = self.sso_url.is_some() && self.entity_id.is_some();

        if !has_metadata && !has_direct_config {
            return Err("idp requires either metadata_file/metadata_xml or sso_url+entity_id".to_string());
        }

        Ok(())
    }
}

/// Assertion field mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeMapping {
    /// Attribute carrying the user id; `name_id` selects the subject NameID.
    #[serde(default = "default_username_attribute")]
    pub username: String,

    #[serde(default)]
    pub session: SessionAttributeConfig,
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self {
            username: default_username_attribute(),
            session: SessionAttributeConfig::default(),
        }
    }
}

/// Where the assertion session id comes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionAttributeConfig {
    /// Attribute overriding the AuthnStatement SessionIndex when present.
    #[serde(default)]
    pub from_saml: Option<String>,

    /// Ignore the assertion and generate a random session id.
    #[serde(default)]
    pub autogenerate: bool,
}

/// SSO context cookie settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieConfig {
    #[serde(default = "default_cookie_name")]
    pub name: String,

    #[serde(default = "default_cookie_path")]
    pub path: String,

    /// Require HTTPS for cookies (Secure flag).
    #[serde(default = "default_true")]
    pub secure: bool,

    /// The IdP posts to the ACS cross-site, so anything stricter than `None`
    /// keeps the browser from sending the cookie back.
    #[serde(default = "default_same_site")]
    pub same_site: String,

    /// Cookie lifetime, which is also the SSO flow expiry.
    #[serde(default = "default_cookie_max_age")]
    pub max_age_secs: u64,

    /// HMAC key for the context token. Random per process when absent.
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_base_path() -> String {
    "/saml".to_string()
}

fn default_clock_skew() -> i64 {
    300 // 5 minutes
}

fn default_opener_callback() -> String {
    "i2b2.PM.ctrlr.SamlLogin".to_string()
}

fn default_username_attribute() -> String {
    "name_id".to_string()
}

fn default_cookie_name() -> String {
    "hive_sso_context".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_same_site() -> String {
    "None".to_string()
}

fn default_cookie_max_age() -> u64 {
    600 // 10 minutes
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: default_cookie_name(),
            path: default_cookie_path(),
            secure: true,
            same_site: default_same_site(),
            max_age_secs: default_cookie_max_age(),
            secret: None,
        }
    }
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            services: HashMap::new(),
            attributes: AttributeMapping::default(),
            cookie: CookieConfig::default(),
            clock_skew_secs: default_clock_skew(),
            allow_unsigned_assertions: false,
            public_base_url: None,
            trust_forwarded_headers: false,
            opener_callback: default_opener_callback(),
        }
    }
}

impl SamlConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.base_path.starts_with('/') || self.base_path.len() < 2 {
            return Err(format!("SAML base_path must be a non-root path: {}", self.base_path));
        }

        for (name, service) in &self.services {
            if name.trim().is_empty() {
                return Err("SAML service names must not be empty".to_string());
            }
            service
                .idp
                .validate()
                .map_err(|e| format!("SAML service '{}': {}", name, e))?;
            if service.sp.authn_requests_signed {
                return Err(format!("SAML service '{}': signed AuthnRequests are not supported", name));
            }
        }

        if let Some(ref base_url) = self.public_base_url {
            RequestOrigin::from_base_url(base_url)?;
        }

        let lowered: std::collections::HashSet<String> =
            self.services.keys().map(|k| k.to_lowercase()).collect();
        if lowered.len() != self.services.len() {
            return Err("SAML service names must be unique ignoring case".to_string());
        }

        if self.clock_skew_secs < 0 {
            return Err("SAML clock_skew_secs must not be negative".to_string());
        }

        let callback_ok = !self.opener_callback.is_empty()
            && self
                .opener_callback
                .split('.')
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$'));
        if !callback_ok {
            return Err(format!("SAML opener_callback is not a JS member path: {}", self.opener_callback));
        }

        self.cookie.validate()
    }
}

impl CookieConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || !self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(format!("invalid SSO cookie name: {}", self.name));
        }

        if self.max_age_secs == 0 {
            return Err("SSO cookie max_age_secs must be greater than zero".to_string());
        }

        match self.same_site.as_str() {
            "Strict" | "Lax" => {}
            "None" if self.secure => {}
            "None" => return Err("SameSite=None requires a secure cookie".to_string()),
            other => return Err(format!("invalid SameSite value: {}", other)),
        }

        if matches!(&self.secret, Some(secret) if secret.len() < 32) {
            return Err("SSO cookie secret must be at least 32 bytes".to_string());
        }

        Ok(())
    }

    /// Build the `Set-Cookie` value carrying `value`.
    pub fn build_cookie(&self, value: &str) -> String {
        let mut cookie = format!("{}={}", self.name, value);
        cookie.push_str(&format!("; Path={}", self.path));

        if self.secure {
            cookie.push_str("; Secure");
        }

        cookie.push_str("; HttpOnly");
        cookie.push_str(&format!("; SameSite={}", self.same_site));
        cookie.push_str(&format!("; Max-Age={}", self.max_age_secs));

        cookie
    }

    /// Build a `Set-Cookie` value that removes the cookie.
    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!("{}=; Path={}; HttpOnly; Max-Age=0", self.name, self.path);
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str(&format!("; SameSite={}", self.same_site));
        cookie
    }
}

/// Find a cookie value by name in a `Cookie` header.
pub fn parse_cookie(cookie_header: &str, name: &str) -> Option<String> {
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')) {
            return Some(value.to_string());
        }
    }
    None
}
