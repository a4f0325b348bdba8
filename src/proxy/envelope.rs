//! Ingress envelope parsing.

use crate::error::GatewayError;
use crate::xml;

const DOMAIN_PATH: &[&str] = &["security", "domain"];
const USERNAME_PATH: &[&str] = &["security", "username"];
const REDIRECT_URL_PATH: &[&str] = &["proxy", "redirect_url"];

/// Fields the gateway needs from a hive request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEnvelope {
    pub domain: String,
    pub username: String,
    pub redirect_url: String,
}

impl ProxyEnvelope {
    /// Parse the full request body. All three fields are required.
    pub fn parse(body: &[u8]) -> Result<Self, GatewayError> {
        let text = String::from_utf8_lossy(body);
        let values = xml::extract_paths(&text, &[DOMAIN_PATH, USERNAME_PATH, REDIRECT_URL_PATH])
            .map_err(|e| GatewayError::Parse(format!("malformed envelope: {}", e)))?;

        let mut values = values.into_iter();
        let mut take = |field: &str| {
            values
                .next()
                .flatten()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| GatewayError::Parse(format!("envelope is missing {}", field)))
        };

        let domain = take("security/domain")?;
        let username = take("security/username")?;
        let redirect_url = take("proxy/redirect_url")?;

        Ok(Self {
            domain,
            username,
            redirect_url,
        })
    }
}
