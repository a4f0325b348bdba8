//! Enveloped XML-DSig verification of IdP responses.
//!
//! Only the key taken from the configured IdP certificate is trusted; any
//! `KeyInfo` carried by the message is ignored. A signature counts only when
//! its single `Reference` points at the element that encloses it, and that
//! element is the response root or its one assertion.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{PKey, Public};
use openssl::sign::Verifier;
use openssl::x509::X509;
use std::collections::HashSet;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::c14n::{canonicalize, Document, Located, XmlError, EXC_C14N};
use super::idp_metadata::pem_body;

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const SAML_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const SAMLP_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("invalid IdP certificate: {0}")]
    Certificate(String),

    #[error("document is not a SAML response")]
    NotAResponse,

    #[error("expected exactly one assertion, found {0}")]
    AssertionCount(usize),

    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("unsupported algorithm: {0}")]
    Unsupported(String),

    #[error("signature reference {0} does not point at the signed element")]
    Reference(String),

    #[error("digest of {0} does not match")]
    Digest(String),

    #[error("signature value of {0} does not verify")]
    Invalid(String),
}

/// Public key of an IdP signing certificate.
pub struct SigningKey(PKey<Public>);

impl SigningKey {
    /// Accepts a PEM certificate or its bare base64 DER body.
    pub fn from_certificate(certificate: &str) -> Result<Self, SignatureError> {
        let der = BASE64
            .decode(pem_body(certificate))
            .map_err(|e| SignatureError::Certificate(e.to_string()))?;
        let cert = X509::from_der(&der).map_err(|e| SignatureError::Certificate(e.to_string()))?;
        let key = cert
            .public_key()
            .map_err(|e| SignatureError::Certificate(e.to_string()))?;
        Ok(Self(key))
    }
}

/// Which parts of a response carry a verified signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedParts {
    pub response: bool,
    pub assertion: bool,
    /// ID of the one assertion in the document.
    pub assertion_id: String,
}

impl SignedParts {
    pub fn any(&self) -> bool {
        self.response || self.assertion
    }
}

/// Verify every signature on a response and its assertion.
///
/// A present signature that fails is an error; an absent one is reported
/// through [`SignedParts`] for the caller's policy.
pub fn verify(document: &Document, key: &SigningKey) -> Result<SignedParts, SignatureError> {
    let root = document.root();
    if !root.is(SAMLP_NS, "Response") {
        return Err(SignatureError::NotAResponse);
    }

    let descendants = document.descendants();
    let assertion_count = descendants.iter().filter(|l| l.is(SAML_NS, "Assertion")).count();
    let assertion = match root.children(SAML_NS, "Assertion").pop() {
        Some(assertion) if assertion_count == 1 => assertion,
        _ => return Err(SignatureError::AssertionCount(assertion_count)),
    };

    let mut ids = HashSet::new();
    for located in &descendants {
        if let Some(id) = located.element.attribute("ID") {
            if !ids.insert(id) {
                return Err(SignatureError::Malformed(format!("duplicate ID {}", id)));
            }
        }
    }

    let parts = SignedParts {
        response: verify_enveloped(&root, key)?,
        assertion: verify_enveloped(&assertion, key)?,
        assertion_id: assertion.element.attribute("ID").unwrap_or_default().to_string(),
    };
    debug!(
        response_signed = parts.response,
        assertion_signed = parts.assertion,
        "XML signatures verified"
    );
    Ok(parts)
}

/// Verify the signature enveloped in `target`, if any.
fn verify_enveloped(target: &Located<'_>, key: &SigningKey) -> Result<bool, SignatureError> {
    let mut signatures = target.children(DSIG_NS, "Signature");
    let signature = match (signatures.pop(), signatures.is_empty()) {
        (None, _) => return Ok(false),
        (Some(signature), true) => signature,
        (Some(_), false) => return Err(malformed("more than one Signature on an element")),
    };

    let name = target.element.local_name().to_string();
    let id = target
        .element
        .attribute("ID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("signed element has no ID"))?;

    let signed_info = required(&signature, "SignedInfo")?;
    let c14n_method = required(&signed_info, "CanonicalizationMethod")?;
    if algorithm(&c14n_method) != EXC_C14N {
        return Err(SignatureError::Unsupported(algorithm(&c14n_method).to_string()));
    }
    let signature_digest = signature_method(algorithm(&required(&signed_info, "SignatureMethod")?))?;

    let mut references = signed_info.children(DSIG_NS, "Reference");
    let reference = match (references.pop(), references.is_empty()) {
        (Some(reference), true) => reference,
        _ => return Err(malformed("expected exactly one Reference")),
    };

    let uri = reference.element.attribute("URI").unwrap_or_default();
    if uri.strip_prefix('#') != Some(id) {
        return Err(SignatureError::Reference(uri.to_string()));
    }

    let mut enveloped = false;
    let mut prefixes = None;
    if let Some(transforms) = reference.child(DSIG_NS, "Transforms") {
        for transform in transforms.children(DSIG_NS, "Transform") {
            match algorithm(&transform) {
                ENVELOPED_SIGNATURE => enveloped = true,
                EXC_C14N => prefixes = Some(inclusive_prefixes(&transform)),
                other => return Err(SignatureError::Unsupported(other.to_string())),
            }
        }
    }
    let prefixes = match prefixes {
        Some(prefixes) if enveloped => prefixes,
        _ => {
            return Err(SignatureError::Unsupported(
                "reference must apply enveloped-signature and exclusive c14n".to_string(),
            ))
        }
    };

    let reference_digest = digest_method(algorithm(&required(&reference, "DigestMethod")?))?;
    let expected = decode(&required(&reference, "DigestValue")?)?;
    let canonical = canonicalize(target, Some(signature.element), &prefixes)?;
    let actual = hash(reference_digest, canonical.as_bytes()).map_err(|e| malformed(e.to_string()))?;
    if !bool::from(actual[..].ct_eq(&expected[..])) {
        return Err(SignatureError::Digest(name));
    }

    let canonical_info = canonicalize(&signed_info, None, &inclusive_prefixes(&c14n_method))?;
    let signature_value = decode(&required(&signature, "SignatureValue")?)?;
    let mut verifier = Verifier::new(signature_digest, &key.0).map_err(|e| malformed(e.to_string()))?;
    verifier
        .update(canonical_info.as_bytes())
        .map_err(|e| malformed(e.to_string()))?;
    if !verifier.verify(&signature_value).unwrap_or(false) {
        return Err(SignatureError::Invalid(name));
    }

    Ok(true)
}

fn malformed(msg: impl Into<String>) -> SignatureError {
    SignatureError::Malformed(msg.into())
}

fn required<'a>(parent: &Located<'a>, local: &str) -> Result<Located<'a>, SignatureError> {
    parent
        .child(DSIG_NS, local)
        .ok_or_else(|| malformed(format!("missing {}", local)))
}

fn algorithm<'a>(located: &Located<'a>) -> &'a str {
    located.element.attribute("Algorithm").unwrap_or_default()
}

fn inclusive_prefixes(transform: &Located<'_>) -> Vec<String> {
    transform
        .child(EXC_C14N, "InclusiveNamespaces")
        .and_then(|inclusive| inclusive.element.attribute("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn decode(located: &Located<'_>) -> Result<Vec<u8>, SignatureError> {
    let compact: String = located.element.text().split_whitespace().collect();
    BASE64
        .decode(compact)
        .map_err(|e| malformed(format!("{}: {}", located.element.local_name(), e)))
}

fn signature_method(algorithm: &str) -> Result<MessageDigest, SignatureError> {
    match algorithm {
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2000/09/xmldsig#rsa-sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384" => Ok(MessageDigest::sha384()),
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512" => Ok(MessageDigest::sha512()),
        other => Err(SignatureError::Unsupported(other.to_string())),
    }
}

fn digest_method(algorithm: &str) -> Result<MessageDigest, SignatureError> {
    match algorithm {
        "http://www.w3.org/2001/04/xmlenc#sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2000/09/xmldsig#sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmldsig-more#sha384" => Ok(MessageDigest::sha384()),
        "http://www.w3.org/2001/04/xmlenc#sha512" => Ok(MessageDigest::sha512()),
        other => Err(SignatureError::Unsupported(other.to_string())),
    }
}
