//! Legacy envelope exchange.
//!
//! Logs in against the backend's own project-management service with a
//! `get_user_configuration` request. The SSO session id stands in for the
//! password and the identity headers carry the SSO-derived user; the backend
//! answers with a session token in its `password` element.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use chrono::{SecondsFormat, Utc};
use quick_xml::escape::escape;
use rand::Rng;
use tracing::{debug, warn};

use super::config::{IdentityHeaders, LegacyEnvelopeConfig};
use super::{IssuanceError, IssuanceProtocol, IssuanceRequest, SessionIssuer};
use crate::upstream::describe_error;
use crate::xml;

const TOKEN_PATH: &[&str] = &["password"];

pub struct LegacyEnvelopeExchange {
    client: reqwest::Client,
    service_suffix: String,
    username_header: HeaderName,
    session_header: HeaderName,
}

impl LegacyEnvelopeExchange {
    pub fn new(config: &LegacyEnvelopeConfig, identity: &IdentityHeaders, client: reqwest::Client) -> Result<Self> {
        let username_header = HeaderName::from_bytes(identity.username.as_bytes())
            .map_err(|_| anyhow!("Invalid identity header: {}", identity.username))?;
        let session_header = HeaderName::from_bytes(identity.session.as_bytes())
            .map_err(|_| anyhow!("Invalid identity header: {}", identity.session))?;

        Ok(Self {
            client,
            service_suffix: config.service_suffix.clone(),
            username_header,
            session_header,
        })
    }
}

/// Build the versioned hive request message.
pub fn build_message(domain: &str, username: &str, password: &str) -> String {
    let message_num: u64 = rand::thread_rng().gen_range(1_000_000..9_007_199_254_740_991);
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<i2b2:request xmlns:i2b2="http://www.i2b2.org/xsd/hive/msg/1.1/" xmlns:pm="http://www.i2b2.org/xsd/cell/pm/1.1/">
    <message_header>
        <i2b2_version_compatible>1.1</i2b2_version_compatible>
        <hl7_version_compatible>2.4</hl7_version_compatible>
        <sending_application><application_name>i2b2 Webclient Proxy</application_name><application_version>2.0</application_version></sending_application>
        <sending_facility><facility_name>i2b2 Hive</facility_name></sending_facility>
        <receiving_application><application_name>Project Management Cell</application_name><application_version>2.0</application_version></receiving_application>
        <receiving_facility><facility_name>i2b2 Hive</facility_name></receiving_facility>
        <datetime_of_message>{}</datetime_of_message>
        <security>
            <domain>{}</domain>
            <username>{}</username>
            <password>{}</password>
        </security>
        <message_control_id>
            <message_num>{}</message_num>
            <instance_num>0</instance_num>
        </message_control_id>
        <processing_id><processing_id>P</processing_id><processing_mode>I</processing_mode></processing_id>
        <accept_acknowledgement_type>AL</accept_acknowledgement_type>
        <application_acknowledgement_type>AL</application_acknowledgement_type>
        <country_code>US</country_code>
        <project_id></project_id>
    </message_header>
    <request_header><result_waittime_ms>180000</result_waittime_ms></request_header>
    <message_body><pm:get_user_configuration><project></project></pm:get_user_configuration></message_body>
</i2b2:request>"#,
        timestamp,
        escape(domain),
        escape(username),
        escape(password),
        message_num
    )
}

#[async_trait]
impl SessionIssuer for LegacyEnvelopeExchange {
    fn protocol(&self) -> IssuanceProtocol {
        IssuanceProtocol::LegacyEnvelope
    }

    async fn issue(&self, request: &IssuanceRequest) -> Result<String, IssuanceError> {
        let endpoint = format!("{}{}", request.target_url, self.service_suffix);
        let user_value = HeaderValue::from_str(&request.user_id)
            .map_err(|_| IssuanceError::Transport("user id is not a valid header value".to_string()))?;
        let session_value = HeaderValue::from_str(&request.assertion_session_id)
            .map_err(|_| IssuanceError::Transport("session id is not a valid header value".to_string()))?;

        debug!(endpoint = %endpoint, user_id = %request.user_id, "Starting legacy envelope session");

        let message = build_message(&request.domain, &request.user_id, &request.assertion_session_id);
        let response = self
            .client
            .post(&endpoint)
            .header(header::CONTENT_TYPE, "application/xml")
            .header(self.username_header.clone(), user_value)
            .header(self.session_header.clone(), session_value)
            .body(message)
            .send()
            .await
            .map_err(|e| IssuanceError::Transport(describe_error(&e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!(endpoint = %endpoint, status = status.as_u16(), "Project management service refused login");
            return Err(IssuanceError::Rejected(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| IssuanceError::Transport(describe_error(&e)))?;

        xml::extract_text(&body, TOKEN_PATH)
            .map_err(|e| IssuanceError::MissingToken(format!("malformed response: {}", e)))?
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| IssuanceError::MissingToken("response has no password element".to_string()))
    }
}
