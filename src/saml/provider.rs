//! Materialized SAML service: SP and IdP definitions.
//!
//! Handles the SP-initiated half of the flow (AuthnRequest redirect) and SP
//! metadata publication.

use anyhow::{anyhow, Context, Result};
use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use quick_xml::escape::escape;
use tracing::debug;

use super::config::ServiceFactoryConfig;
use super::idp_metadata::{pem_body, IdpMetadata};

const POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";

/// Scheme and host the browser used to reach the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin {
    pub scheme: String,
    pub host: String,
}

impl RequestOrigin {
    /// Origin as seen in the request. `x-forwarded-proto` and
    /// `x-forwarded-host` are read only when `trust_forwarded` is set.
    pub fn from_headers(headers: &HeaderMap, trust_forwarded: bool) -> Self {
        let header_value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let forwarded = |name: &str| if trust_forwarded { header_value(name) } else { None };

        let scheme = forwarded("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
        let host = forwarded("x-forwarded-host")
            .or_else(|| header_value(header::HOST.as_str()))
            .unwrap_or_else(|| "localhost".to_string());

        Self { scheme, host }
    }

    /// Origin from a configured base URL such as `https://hive.example.org`.
    pub fn from_base_url(base_url: &str) -> Result<Self, String> {
        let url = url::Url::parse(base_url).map_err(|e| format!("invalid public_base_url {}: {}", base_url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("public_base_url must be http or https: {}", base_url));
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(format!("public_base_url must not carry a path: {}", base_url));
        }
        let host = url
            .host_str()
            .ok_or_else(|| format!("public_base_url has no host: {}", base_url))?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host: match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            },
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, path)
    }
}

/// Service Provider definition.
#[derive(Debug, Clone)]
pub struct SpDefinition {
    pub entity_id: String,
    pub acs_url: String,
    pub certificate: Option<String>,
    pub name_id_format: Option<String>,
    pub want_assertions_signed: bool,
}

/// Identity Provider definition.
#[derive(Debug, Clone)]
pub struct IdpDefinition {
    pub entity_id: String,
    pub sso_url: String,
    pub certificate: Option<String>,
}

/// Immutable SP + IdP pair for one logical service.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub sp: SpDefinition,
    pub idp: IdpDefinition,
}

/// Redirect-binding AuthnRequest ready to send the browser to.
#[derive(Debug, Clone)]
pub struct AuthnRedirect {
    pub request_id: String,
    pub url: String,
}

impl ServiceDefinition {
    /// Build the definition from its factory.
    ///
    /// SP URLs missing from configuration are derived from `origin`.
    pub fn materialize(
        name: &str,
        factory: &ServiceFactoryConfig,
        origin: &RequestOrigin,
        base_path: &str,
    ) -> Result<Self> {
        let sp = SpDefinition {
            entity_id: factory
                .sp
                .entity_id
                .clone()
                .unwrap_or_else(|| origin.url(&format!("{}/metadata/{}", base_path, name))),
            acs_url: factory
                .sp
                .acs_url
                .clone()
                .unwrap_or_else(|| origin.url(&format!("{}/acs/{}", base_path, name))),
            certificate: factory.sp.certificate_pem.as_deref().map(pem_body),
            name_id_format: factory.sp.name_id_format.clone(),
            want_assertions_signed: factory.sp.want_assertions_signed,
        };

        let idp_config = &factory.idp;
        let metadata_xml = match (&idp_config.metadata_xml, &idp_config.metadata_file) {
            (Some(xml), _) => Some(xml.clone()),
            (None, Some(path)) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read IdP metadata: {}", path.display()))?,
            ),
            (None, None) => None,
        };

        let idp = match metadata_xml {
            Some(xml) => {
                let metadata = IdpMetadata::parse(&xml)?;
                IdpDefinition {
                    entity_id: idp_config.entity_id.clone().unwrap_or(metadata.entity_id),
                    sso_url: idp_config.sso_url.clone().unwrap_or(metadata.sso_url),
                    certificate: idp_config
                        .certificate_pem
                        .as_deref()
                        .map(pem_body)
                        .or(metadata.signing_certificate),
                }
            }
            None => IdpDefinition {
                entity_id: idp_config
                    .entity_id
                    .clone()
                    .ok_or_else(|| anyhow!("IdP entity_id not configured"))?,
                sso_url: idp_config
                    .sso_url
                    .clone()
                    .ok_or_else(|| anyhow!("IdP SSO URL not configured"))?,
                certificate: idp_config.certificate_pem.as_deref().map(pem_body),
            },
        };

        Ok(Self {
            name: name.to_string(),
            sp,
            idp,
        })
    }

    /// Create an AuthnRequest and return the redirect URL to the IdP.
    pub fn create_authn_request(&self) -> Result<AuthnRedirect> {
        let request_id = format!("_id{}", uuid::Uuid::new_v4());
        let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let name_id_policy = self
            .sp
            .name_id_format
            .as_deref()
            .map(|format| {
                format!(
                    r#"<samlp:NameIDPolicy Format="{}" AllowCreate="true"/>"#,
                    escape(format)
                )
            })
            .unwrap_or_default();

        let authn_request = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
                xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
                ID="{}"
                Version="2.0"
                IssueInstant="{}"
                Destination="{}"
                ProtocolBinding="{}"
                AssertionConsumerServiceURL="{}">
                <saml:Issuer>{}</saml:Issuer>
                {}
            </samlp:AuthnRequest>"#,
            request_id,
            issue_instant,
            escape(&self.idp.sso_url),
            POST_BINDING,
            escape(&self.sp.acs_url),
            escape(&self.sp.entity_id),
            name_id_policy
        );

        // Deflate and base64 encode
        let encoded = deflate_and_encode(&authn_request)?;

        let separator = if self.idp.sso_url.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}{}SAMLRequest={}",
            self.idp.sso_url,
            separator,
            urlencoding::encode(&encoded)
        );

        debug!(service = %self.name, request_id = %request_id, "Created SAML AuthnRequest redirect");
        Ok(AuthnRedirect { request_id, url })
    }

    /// SP metadata document.
    pub fn metadata_xml(&self) -> String {
        let key_descriptor = self
            .sp
            .certificate
            .as_deref()
            .map(|cert| {
                format!(
                    r#"<md:KeyDescriptor use="signing"><ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#,
                    escape(cert)
                )
            })
            .unwrap_or_default();

        let name_id_format = self
            .sp
            .name_id_format
            .as_deref()
            .map(|format| format!("<md:NameIDFormat>{}</md:NameIDFormat>", escape(format)))
            .unwrap_or_default();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
    <md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="{}" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
        {}
        {}
        <md:AssertionConsumerService Binding="{}" Location="{}" index="0" isDefault="true"/>
    </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
            escape(&self.sp.entity_id),
            self.sp.want_assertions_signed,
            key_descriptor,
            name_id_format,
            POST_BINDING,
            escape(&self.sp.acs_url)
        )
    }
}

/// Deflate and base64 encode for SAML redirect binding.
fn deflate_and_encode(xml: &str) -> Result<String> {
    use std::io::Write;

    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(xml.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::config::{IdpConfig, SpConfig};
    use axum::http::HeaderValue;
    use std::io::Read;

    fn factory() -> ServiceFactoryConfig {
        ServiceFactoryConfig {
            sp: SpConfig::default(),
            idp: IdpConfig {
                sso_url: Some("https://idp.example.com/sso".to_string()),
                entity_id: Some("https://idp.example.com".to_string()),
                ..Default::default()
            },
        }
    }

    fn origin() -> RequestOrigin {
        RequestOrigin {
            scheme: "https".to_string(),
            host: "hive.example.org".to_string(),
        }
    }

    fn inflate(encoded: &str) -> String {
        let decoded = urlencoding::decode(encoded).unwrap();
        let compressed = BASE64.decode(decoded.as_bytes()).unwrap();
        let mut xml = String::new();
        flate2::read::DeflateDecoder::new(&compressed[..])
            .read_to_string(&mut xml)
            .unwrap();
        xml
    }

    #[test]
    fn test_request_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway:8080"));
        assert_eq!(RequestOrigin::from_headers(&headers, false).url("/x"), "http://gateway:8080/x");

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("hive.example.org"));
        assert_eq!(RequestOrigin::from_headers(&headers, true), origin());
    }

    #[test]
    fn test_forwarded_headers_ignored_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("hive.example.org"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("evil.example.com"));

        let origin = RequestOrigin::from_headers(&headers, false);
        assert_eq!(origin.url("/saml/acs/okta"), "http://hive.example.org/saml/acs/okta");
    }

    #[test]
    fn test_origin_from_base_url() {
        assert_eq!(RequestOrigin::from_base_url("https://hive.example.org").unwrap(), origin());
        assert_eq!(RequestOrigin::from_base_url("https://hive.example.org/").unwrap(), origin());
        assert_eq!(
            RequestOrigin::from_base_url("http://[::1]:8080").unwrap().url("/saml"),
            "http://[::1]:8080/saml"
        );

        assert!(RequestOrigin::from_base_url("hive.example.org").is_err());
        assert!(RequestOrigin::from_base_url("ftp://hive.example.org").is_err());
        assert!(RequestOrigin::from_base_url("https://hive.example.org/webclient").is_err());
    }

    #[test]
    fn test_derived_sp_urls() {
        let service = ServiceDefinition::materialize("okta", &factory(), &origin(), "/saml").unwrap();
        assert_eq!(service.sp.entity_id, "https://hive.example.org/saml/metadata/okta");
        assert_eq!(service.sp.acs_url, "https://hive.example.org/saml/acs/okta");
        assert_eq!(service.idp.entity_id, "https://idp.example.com");
    }

    #[test]
    fn test_configured_sp_urls_win() {
        let mut factory = factory();
        factory.sp.entity_id = Some("urn:hive:sp".to_string());
        factory.sp.acs_url = Some("https://sp.example.com/acs".to_string());
        let service = ServiceDefinition::materialize("okta", &factory, &origin(), "/saml").unwrap();
        assert_eq!(service.sp.entity_id, "urn:hive:sp");
        assert_eq!(service.sp.acs_url, "https://sp.example.com/acs");
    }

    #[test]
    fn test_metadata_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("okta.xml");
        std::fs::write(
            &path,
            r#"<EntityDescriptor entityID="http://www.okta.com/exk1"><IDPSSODescriptor>
                <SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://okta.example.com/sso"/>
            </IDPSSODescriptor></EntityDescriptor>"#,
        )
        .unwrap();

        let factory = ServiceFactoryConfig {
            sp: SpConfig::default(),
            idp: IdpConfig {
                metadata_file: Some(path),
                ..Default::default()
            },
        };
        let service = ServiceDefinition::materialize("okta", &factory, &origin(), "/saml").unwrap();
        assert_eq!(service.idp.entity_id, "http://www.okta.com/exk1");
        assert_eq!(service.idp.sso_url, "https://okta.example.com/sso");
    }

    #[test]
    fn test_missing_metadata_file() {
        let factory = ServiceFactoryConfig {
            sp: SpConfig::default(),
            idp: IdpConfig {
                metadata_file: Some("/nonexistent/okta.xml".into()),
                ..Default::default()
            },
        };
        assert!(ServiceDefinition::materialize("okta", &factory, &origin(), "/saml").is_err());
    }

    #[test]
    fn test_create_authn_request() {
        let mut factory = factory();
        factory.sp.name_id_format = Some("urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress".to_string());
        let service = ServiceDefinition::materialize("okta", &factory, &origin(), "/saml").unwrap();

        let redirect = service.create_authn_request().unwrap();
        assert!(redirect.url.starts_with("https://idp.example.com/sso?SAMLRequest="));

        let encoded = redirect.url.split("SAMLRequest=").nth(1).unwrap();
        let xml = inflate(encoded);
        assert!(xml.contains(&redirect.request_id));
        assert!(xml.contains(r#"AssertionConsumerServiceURL="https://hive.example.org/saml/acs/okta""#));
        assert!(xml.contains("<saml:Issuer>https://hive.example.org/saml/metadata/okta</saml:Issuer>"));
        assert!(xml.contains("NameIDPolicy"));
    }

    #[test]
    fn test_sso_url_with_query() {
        let mut factory = factory();
        factory.idp.sso_url = Some("https://idp.example.com/sso?tenant=1".to_string());
        let service = ServiceDefinition::materialize("okta", &factory, &origin(), "/saml").unwrap();
        let redirect = service.create_authn_request().unwrap();
        assert!(redirect.url.starts_with("https://idp.example.com/sso?tenant=1&SAMLRequest="));
    }

    #[test]
    fn test_sp_metadata() {
        let mut factory = factory();
        factory.sp.certificate_pem =
            Some("-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----".to_string());
        let service = ServiceDefinition::materialize("okta", &factory, &origin(), "/saml").unwrap();

        let xml = service.metadata_xml();
        assert!(xml.contains(r#"entityID="https://hive.example.org/saml/metadata/okta""#));
        assert!(xml.contains(r#"Location="https://hive.example.org/saml/acs/okta""#));
        assert!(xml.contains(r#"WantAssertionsSigned="true""#));
        assert!(xml.contains(r#"AuthnRequestsSigned="false""#));
        assert!(xml.contains("<ds:X509Certificate>MIIB</ds:X509Certificate>"));
    }
}
