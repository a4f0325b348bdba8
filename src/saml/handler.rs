//! SAML endpoints.
//!
//! `/metadata/:service`, `/idp_list.json`, `/redirect/:service` and
//! `/acs/:service`. The assertion consumer runs a fixed sequence of steps
//! (load service, recover context, authorize target, verify assertion,
//! resolve identity, issue session, render) and stops at the first failure.

use anyhow::{anyhow, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::assertion::{AssertionVerifier, VerifiedAssertion};
use super::config::{parse_cookie, SamlConfig};
use super::context::{ContextSealer, SsoContext};
use super::provider::{RequestOrigin, ServiceDefinition};
use super::registry::ServiceRegistry;
use crate::error::GatewayError;
use crate::issuance::{IssuanceRequest, SessionIssuer};
use crate::proxy::Allowlist;
use crate::server::{client_ip, ConnectionHandle};

/// Cookies the legacy web client sets before opening the login window.
const LEGACY_URL_COOKIE: &str = "url";
const LEGACY_DOMAIN_COOKIE: &str = "domain";

#[derive(Debug, Default, Deserialize)]
pub struct RedirectParams {
    pub url: Option<String>,
    pub domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
}

/// SAML Session Bridge.
pub struct SamlBridge {
    config: SamlConfig,
    registry: ServiceRegistry,
    public_origin: Option<RequestOrigin>,
    sealer: ContextSealer,
    allowlist: Arc<Allowlist>,
    verifier: Arc<dyn AssertionVerifier>,
    issuer: Arc<dyn SessionIssuer>,
}

impl SamlBridge {
    pub fn new(
        config: SamlConfig,
        allowlist: Arc<Allowlist>,
        verifier: Arc<dyn AssertionVerifier>,
        issuer: Arc<dyn SessionIssuer>,
    ) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;

        if config.cookie.secret.is_none() {
            warn!("No SSO cookie secret configured, using a per-process key");
        }

        let public_origin = config
            .public_base_url
            .as_deref()
            .map(RequestOrigin::from_base_url)
            .transpose()
            .map_err(|e| anyhow!(e))?;
        if public_origin.is_none() {
            let derived: Vec<&str> = config
                .services
                .iter()
                .filter(|(_, factory)| factory.sp.entity_id.is_none() || factory.sp.acs_url.is_none())
                .map(|(name, _)| name.as_str())
                .collect();
            if !derived.is_empty() {
                warn!(
                    services = ?derived,
                    trust_forwarded_headers = config.trust_forwarded_headers,
                    "SP URLs will be derived from the first request, set saml.public_base_url to pin them"
                );
            }
        }

        Ok(Self {
            registry: ServiceRegistry::new(&config),
            public_origin,
            sealer: ContextSealer::new(config.cookie.secret.as_deref(), config.cookie.max_age_secs),
            config,
            allowlist,
            verifier,
            issuer,
        })
    }

    pub fn base_path(&self) -> &str {
        &self.config.base_path
    }

    pub fn service_names(&self) -> Vec<String> {
        self.registry.names()
    }

    fn load_service(&self, name: &str, headers: &HeaderMap) -> Result<Arc<ServiceDefinition>, GatewayError> {
        let origin = match self.public_origin {
            Some(ref origin) => origin.clone(),
            None => RequestOrigin::from_headers(headers, self.config.trust_forwarded_headers),
        };
        self.registry.get_or_load(name, &origin)
    }

    /// Target and domain for a new flow: query parameters, else legacy cookies.
    fn requested_target(&self, params: &RedirectParams, headers: &HeaderMap) -> Result<(String, String), GatewayError> {
        let from_cookie = |name: &str| {
            cookie_value(headers, name).map(|raw| {
                urlencoding::decode(&raw)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or(raw)
            })
        };

        let target_url = params
            .url
            .clone()
            .or_else(|| from_cookie(LEGACY_URL_COOKIE))
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| GatewayError::BadRequest("no target url supplied".to_string()))?;
        let domain = params
            .domain
            .clone()
            .or_else(|| from_cookie(LEGACY_DOMAIN_COOKIE))
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| GatewayError::BadRequest("no domain supplied".to_string()))?;

        Ok((target_url.trim().to_string(), domain.trim().to_string()))
    }

    /// Start SP-initiated SSO: seal the context into a cookie and send the
    /// browser to the IdP.
    pub fn begin(&self, name: &str, params: &RedirectParams, headers: &HeaderMap) -> Result<Response, GatewayError> {
        let service = self.load_service(name, headers)?;
        let (target_url, domain) = self.requested_target(params, headers)?;

        let token = self.sealer.seal(&SsoContext::new(target_url, domain))?;
        let redirect = service
            .create_authn_request()
            .map_err(|e| GatewayError::Parse(format!("failed to build AuthnRequest: {}", e)))?;

        info!(
            service = %service.name,
            request_id = %redirect.request_id,
            idp = %service.idp.sso_url,
            "Redirecting to IdP"
        );

        Ok((
            StatusCode::FOUND,
            [
                (header::LOCATION, redirect.url),
                (header::SET_COOKIE, self.config.cookie.build_cookie(&token)),
                (header::CACHE_CONTROL, "no-store".to_string()),
            ],
        )
            .into_response())
    }

    fn recover_context(&self, headers: &HeaderMap) -> Result<SsoContext, GatewayError> {
        let token = cookie_value(headers, &self.config.cookie.name).ok_or(GatewayError::FlowExpired)?;
        self.sealer.open(&token)
    }

    fn authorize_target(&self, context: &SsoContext) -> Result<(), GatewayError> {
        if self.allowlist.is_allowed(&context.target_url) {
            Ok(())
        } else {
            Err(GatewayError::NotWhitelisted(context.target_url.clone()))
        }
    }

    fn verify_assertion(&self, body: &[u8], service: &ServiceDefinition) -> Result<VerifiedAssertion, GatewayError> {
        let form: AcsForm = serde_urlencoded::from_bytes(body)
            .map_err(|e| GatewayError::Validation(format!("ACS form has no SAMLResponse: {}", e)))?;
        self.verifier.verify(&form.saml_response, service)
    }

    /// User id and assertion session id for the issuance request.
    fn resolve_identity(&self, assertion: &VerifiedAssertion) -> Result<(String, String), GatewayError> {
        let mapping = &self.config.attributes;

        let user_id = assertion
            .field(&mapping.username)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Validation(format!("assertion has no '{}' value", mapping.username)))?;

        if mapping.session.autogenerate {
            return Ok((user_id, generate_session_id()));
        }

        let session_id = mapping
            .session
            .from_saml
            .as_deref()
            .and_then(|attr| assertion.field(attr))
            .map(str::to_string)
            .or_else(|| assertion.session_index.clone())
            .unwrap_or_else(|| {
                warn!(user_id = %user_id, "Assertion carries no session index, generating one");
                generate_session_id()
            });

        Ok((user_id, session_id))
    }

    /// Consume a posted assertion and hand the browser its session token.
    pub async fn consume(
        &self,
        name: &str,
        headers: &HeaderMap,
        body: &[u8],
        client_ip: &str,
    ) -> Result<Response, GatewayError> {
        let service = self.load_service(name, headers)?;
        let context = self.recover_context(headers)?;
        self.authorize_target(&context)?;

        let assertion = self.verify_assertion(body, &service)?;
        let (user_id, assertion_session_id) = self.resolve_identity(&assertion)?;

        let request = IssuanceRequest {
            target_url: context.target_url,
            domain: context.domain,
            user_id,
            assertion_session_id,
            client_ip: client_ip.to_string(),
        };

        let token = self
            .issuer
            .issue(&request)
            .await
            .map_err(|e| GatewayError::Issuance(e.to_string()))?;

        info!(
            service = %service.name,
            client_ip = %client_ip,
            user_id = %request.user_id,
            target = %request.target_url,
            protocol = %self.issuer.protocol(),
            "SSO session issued"
        );

        let response = (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
                (header::CACHE_CONTROL, "no-store".to_string()),
                (header::SET_COOKIE, self.config.cookie.clear_cookie()),
            ],
            render_callback(&self.config.opener_callback, &request.user_id, &token),
        )
            .into_response();
        Ok(response)
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookies| parse_cookie(cookies, name))
        .filter(|v| !v.is_empty())
}

/// Random 256-bit hex identifier.
fn generate_session_id() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Encode a value as a JS string literal that is safe inside `<script>`.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

fn render_callback(callback: &str, user_id: &str, token: &str) -> String {
    format!(
        r#"<html><body>
<script type="text/javascript">window.opener.{}({}, {});</script>
</body></html>"#,
        callback,
        js_string(user_id),
        js_string(token)
    )
}

fn log_failure(step: &str, service: &str, client_ip: &str, err: &GatewayError) {
    match err {
        GatewayError::Config(_) => warn!(
            step = step,
            service = %service,
            client_ip = %client_ip,
            error = %err,
            "SAML service not configured"
        ),
        _ => warn!(
            step = step,
            service = %service,
            client_ip = %client_ip,
            kind = err.kind(),
            error = %err,
            "SAML request failed"
        ),
    }
}

pub async fn handle_metadata(
    State(bridge): State<Arc<SamlBridge>>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Response {
    match bridge.load_service(&service, &headers) {
        Ok(definition) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/xml")],
            definition.metadata_xml(),
        )
            .into_response(),
        Err(err) => {
            log_failure("metadata", &service, "-", &err);
            err.into_response()
        }
    }
}

pub async fn handle_idp_list(State(bridge): State<Arc<SamlBridge>>) -> Json<Vec<String>> {
    Json(bridge.service_names())
}

pub async fn handle_redirect(
    State(bridge): State<Arc<SamlBridge>>,
    Path(service): Path<String>,
    Query(params): Query<RedirectParams>,
    conn: Option<Extension<ConnectionHandle>>,
    headers: HeaderMap,
) -> Response {
    let client_ip = client_ip(&headers, conn.as_ref().map(|Extension(c)| c));

    match bridge.begin(&service, &params, &headers) {
        Ok(response) => {
            info!(service = %service.to_lowercase(), client_ip = %client_ip, "SAML redirect issued");
            response
        }
        Err(err) => {
            log_failure("redirect", &service, &client_ip, &err);
            err.into_response()
        }
    }
}

pub async fn handle_acs(
    State(bridge): State<Arc<SamlBridge>>,
    Path(service): Path<String>,
    conn: Option<Extension<ConnectionHandle>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip = client_ip(&headers, conn.as_ref().map(|Extension(c)| c));

    match bridge.consume(&service, &headers, &body, &client_ip).await {
        Ok(response) => response,
        Err(err) => {
            log_failure("acs", &service, &client_ip, &err);
            err.into_response()
        }
    }
}

/// SAML routes, relative to the bridge's base path.
pub fn router(bridge: Arc<SamlBridge>) -> Router {
    Router::new()
        .route("/metadata/:service", get(handle_metadata))
        .route("/idp_list.json", get(handle_idp_list))
        .route("/redirect/:service", get(handle_redirect))
        .route("/acs/:service", post(handle_acs))
        .with_state(bridge)
}
