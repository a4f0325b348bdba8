//! IdP metadata reader.

use anyhow::{anyhow, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

const REDIRECT_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";

/// What the bridge needs from an IdP metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdpMetadata {
    pub entity_id: String,
    /// SingleSignOnService location for the HTTP-Redirect binding.
    pub sso_url: String,
    /// Base64 DER of the first signing certificate, whitespace removed.
    pub signing_certificate: Option<String>,
}

impl IdpMetadata {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut entity_id = None;
        let mut sso_url = None;
        let mut certificate = None;
        let mut in_signing_key = false;
        let mut in_certificate = false;

        loop {
            match reader.read_event().context("Malformed IdP metadata")? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"EntityDescriptor" if entity_id.is_none() => {
                        entity_id = attribute(&e, b"entityID")?;
                    }
                    b"KeyDescriptor" => {
                        let usage = attribute(&e, b"use")?;
                        in_signing_key = usage.as_deref().map_or(true, |u| u == "signing");
                    }
                    b"X509Certificate" => in_certificate = in_signing_key,
                    b"SingleSignOnService" => record_sso(&e, &mut sso_url)?,
                    _ => {}
                },
                Event::Empty(e) => match e.local_name().as_ref() {
                    b"SingleSignOnService" => record_sso(&e, &mut sso_url)?,
                    b"EntityDescriptor" if entity_id.is_none() => {
                        entity_id = attribute(&e, b"entityID")?;
                    }
                    _ => {}
                },
                Event::Text(e) if in_certificate && certificate.is_none() => {
                    let text = e.unescape().context("Malformed IdP certificate")?;
                    certificate = Some(text.split_whitespace().collect::<String>());
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"KeyDescriptor" => in_signing_key = false,
                    b"X509Certificate" => in_certificate = false,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self {
            entity_id: entity_id.ok_or_else(|| anyhow!("IdP metadata has no entityID"))?,
            sso_url: sso_url.ok_or_else(|| anyhow!("IdP metadata has no HTTP-Redirect SingleSignOnService"))?,
            signing_certificate: certificate,
        })
    }
}

fn record_sso(e: &BytesStart<'_>, sso_url: &mut Option<String>) -> Result<()> {
    if sso_url.is_none() && attribute(e, b"Binding")?.as_deref() == Some(REDIRECT_BINDING) {
        *sso_url = attribute(e, b"Location")?;
    }
    Ok(())
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.context("Malformed attribute in IdP metadata")?;
        if attr.key.local_name().as_ref() == name {
            let value = attr.unescape_value().context("Malformed attribute in IdP metadata")?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Strip PEM armor and whitespace, leaving the base64 DER body.
pub fn pem_body(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----"))
        .flat_map(|line| line.split_whitespace())
        .collect()
}
