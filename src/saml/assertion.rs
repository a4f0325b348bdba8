//! Assertion verification.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use samael::schema::Assertion;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::c14n::Document;
use super::provider::ServiceDefinition;
use super::signature::{self, SigningKey, SAML_NS};
use crate::error::GatewayError;

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Attribute name selecting the subject NameID.
pub const NAME_ID: &str = "name_id";

/// Identity extracted from an accepted assertion.
#[derive(Debug, Clone, Default)]
pub struct VerifiedAssertion {
    pub name_id: String,
    pub issuer: String,
    pub session_index: Option<String>,
    pub attributes: HashMap<String, Vec<String>>,
}

impl VerifiedAssertion {
    /// First value of an attribute, or the NameID for [`NAME_ID`].
    pub fn field(&self, name: &str) -> Option<&str> {
        if name == NAME_ID {
            return Some(&self.name_id);
        }
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Assertion verification capability.
pub trait AssertionVerifier: Send + Sync {
    /// Validate a base64 `SAMLResponse` posted for `service`.
    fn verify(&self, saml_response: &str, service: &ServiceDefinition) -> Result<VerifiedAssertion, GatewayError>;
}

/// Verifier backed by samael's schema types and enveloped XML-DSig checking
/// against the IdP certificate.
///
/// Checks status, signature, issuer, audience and time conditions before
/// extracting the subject and its attributes.
pub struct SamaelVerifier {
    clock_skew_secs: i64,
    allow_unsigned: bool,
}

impl SamaelVerifier {
    pub fn new(clock_skew_secs: i64, allow_unsigned: bool) -> Self {
        Self {
            clock_skew_secs,
            allow_unsigned,
        }
    }

    /// Apply the signature policy for `service`.
    ///
    /// Signatures present on the document must verify whenever a certificate
    /// is known; `allow_unsigned` only waives their absence.
    fn check_signature(
        &self,
        document: &Document,
        assertion: &Assertion,
        service: &ServiceDefinition,
    ) -> Result<(), GatewayError> {
        let certificate = match service.idp.certificate.as_deref() {
            Some(certificate) => certificate,
            None if self.allow_unsigned => {
                warn!(service = %service.name, "No IdP certificate configured, skipping signature verification");
                return Ok(());
            }
            None => {
                return Err(invalid(format!(
                    "no signing certificate configured for IdP {}",
                    service.idp.entity_id
                )))
            }
        };

        let key = SigningKey::from_certificate(certificate).map_err(|e| invalid(e.to_string()))?;
        let signed = signature::verify(document, &key).map_err(|e| invalid(format!("SAML signature rejected: {}", e)))?;

        if signed.assertion_id != assertion.id {
            return Err(invalid("parsed assertion is not the one covered by the signature"));
        }
        if self.allow_unsigned {
            return Ok(());
        }
        if !signed.any() {
            return Err(invalid("SAML response is not signed"));
        }
        if service.sp.want_assertions_signed && !signed.assertion {
            return Err(invalid("SAML assertion is not signed"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> GatewayError {
    GatewayError::Validation(msg.into())
}

impl AssertionVerifier for SamaelVerifier {
    fn verify(&self, saml_response: &str, service: &ServiceDefinition) -> Result<VerifiedAssertion, GatewayError> {
        // IdPs may line-wrap the form field
        let compact: String = saml_response.split_whitespace().collect();
        let response_xml = BASE64
            .decode(compact.as_bytes())
            .map_err(|e| invalid(format!("failed to decode SAML response: {}", e)))?;
        let response_str =
            String::from_utf8(response_xml).map_err(|_| invalid("SAML response is not valid UTF-8"))?;

        debug!(service = %service.name, "Processing SAML response");

        let document =
            Document::parse(&response_str).map_err(|e| invalid(format!("failed to parse SAML response: {}", e)))?;
        if document
            .descendants()
            .iter()
            .any(|located| located.is(SAML_NS, "EncryptedAssertion"))
        {
            return Err(invalid("encrypted assertions are not supported"));
        }

        let response: samael::schema::Response = response_str
            .parse()
            .map_err(|e| invalid(format!("failed to parse SAML response: {:?}", e)))?;

        // Validate response status
        if let Some(ref status) = response.status {
            let status_value = status.status_code.value.as_deref();
            if status_value != Some(STATUS_SUCCESS) {
                let message = status
                    .status_message
                    .as_ref()
                    .and_then(|m| m.value.clone())
                    .unwrap_or_else(|| "Unknown error".to_string());
                return Err(invalid(format!("SAML authentication failed: {}", message)));
            }
        }

        let assertion = response
            .assertion
            .as_ref()
            .ok_or_else(|| invalid("SAML response contains no assertion"))?;

        self.check_signature(&document, assertion, service)?;

        let issuer = assertion
            .issuer
            .value
            .clone()
            .ok_or_else(|| invalid("SAML assertion has no issuer"))?;
        if issuer != service.idp.entity_id {
            return Err(invalid(format!(
                "SAML assertion issuer {} does not match IdP {}",
                issuer, service.idp.entity_id
            )));
        }

        // Validate timestamps with clock skew tolerance
        let now = Utc::now();
        let skew = Duration::seconds(self.clock_skew_secs);

        if let Some(ref conditions) = assertion.conditions {
            if let Some(ref restrictions) = conditions.audience_restrictions {
                let admitted = restrictions
                    .iter()
                    .all(|restriction| restriction.audience.iter().any(|a| a == &service.sp.entity_id));
                if !admitted {
                    return Err(invalid(format!(
                        "SAML assertion audience does not include {}",
                        service.sp.entity_id
                    )));
                }
            }
            if let Some(not_before) = conditions.not_before {
                if now < not_before - skew {
                    return Err(invalid("SAML assertion not yet valid"));
                }
            }
            if let Some(not_on_or_after) = conditions.not_on_or_after {
                if now >= not_on_or_after + skew {
                    return Err(invalid("SAML assertion has expired"));
                }
            }
        }

        let name_id = assertion
            .subject
            .as_ref()
            .and_then(|subject| subject.name_id.as_ref())
            .map(|name_id| name_id.value.clone())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| invalid("SAML assertion missing NameID"))?;

        let session_index = assertion
            .authn_statements
            .as_ref()
            .and_then(|stmts| stmts.first())
            .and_then(|s| s.session_index.clone());

        let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(ref attr_statements) = assertion.attribute_statements {
            for attr_statement in attr_statements {
                for attr in &attr_statement.attributes {
                    if let Some(ref name) = attr.name {
                        let values: Vec<String> = attr
                            .values
                            .iter()
                            .filter_map(|v| v.value.clone())
                            .collect();
                        if !values.is_empty() {
                            attributes.insert(name.clone(), values);
                        }
                    }
                }
            }
        }

        info!(
            service = %service.name,
            user_id = %name_id,
            idp = %issuer,
            attributes = attributes.len(),
            "SAML assertion validated"
        );

        Ok(VerifiedAssertion {
            name_id,
            issuer,
            session_index,
            attributes,
        })
    }
}
