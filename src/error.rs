//! Per-request error taxonomy.
//!
//! Every variant maps to a fixed status and a fixed client-facing body. The
//! carried detail is for server-side logs only and never reaches the client.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// A service or backend referenced by the request is not configured.
    #[error("not configured: {0}")]
    Config(String),

    /// Inbound envelope is malformed or incomplete.
    #[error("parse error: {0}")]
    Parse(String),

    /// Destination is not on the allow-list.
    #[error("host is not whitelisted: {0}")]
    NotWhitelisted(String),

    /// Client supplied an identity header reserved for SSO-derived values.
    #[error("forbidden header injected: {0}")]
    Injection(String),

    /// Transport failure talking to the backend.
    #[error("upstream transport error: {0}")]
    Upstream(String),

    /// Assertion failed validation.
    #[error("assertion validation failed: {0}")]
    Validation(String),

    /// Session issuance adapter rejected the login.
    #[error("session issuance failed: {0}")]
    Issuance(String),

    /// SSO context cookie is missing or past its lifetime.
    #[error("sso flow expired")]
    FlowExpired,

    /// SSO context cookie failed its integrity check.
    #[error("sso context rejected: {0}")]
    ContextTampered(String),

    /// Request is missing required input.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::NOT_FOUND,
            GatewayError::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NotWhitelisted(_) => StatusCode::FORBIDDEN,
            GatewayError::Injection(_) => StatusCode::FORBIDDEN,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Validation(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Issuance(_) => StatusCode::UNAUTHORIZED,
            GatewayError::FlowExpired => StatusCode::REQUEST_TIMEOUT,
            GatewayError::ContextTampered(_) => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Body sent to the client.
    pub fn client_message(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "Not Found",
            GatewayError::Parse(_) => "Internal Error Logged",
            GatewayError::NotWhitelisted(_) => "host not whitelisted",
            GatewayError::Injection(_) => "Forbidden",
            GatewayError::Upstream(_) => "Upstream request failed",
            GatewayError::Validation(_) | GatewayError::Issuance(_) => "Unauthorized",
            GatewayError::FlowExpired => "SSO flow expired, please retry the login",
            GatewayError::ContextTampered(_) => "Forbidden",
            GatewayError::BadRequest(_) => "Bad Request",
        }
    }

    /// Short machine tag used in log records.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::Parse(_) => "parse",
            GatewayError::NotWhitelisted(_) => "authorization",
            GatewayError::Injection(_) => "injection",
            GatewayError::Upstream(_) => "upstream_transport",
            GatewayError::Validation(_) => "validation",
            GatewayError::Issuance(_) => "issuance",
            GatewayError::FlowExpired => "flow_expired",
            GatewayError::ContextTampered(_) => "context_tampered",
            GatewayError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.client_message(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::Config("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::FlowExpired.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(GatewayError::Injection("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(GatewayError::Issuance("x".into()).status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_body_does_not_leak_detail() {
        let response =
            GatewayError::Upstream("connect to 10.0.0.7:8443 refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(text, "Upstream request failed");
        assert!(!text.contains("10.0.0.7"));
    }
}
