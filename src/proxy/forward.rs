//! Proxy Forwarding Engine.
//!
//! Each ingress request walks `Receiving -> Parsed -> Authorized -> Dispatched
//! -> Relayed`; any failure ends the walk with a client-safe error response and
//! a full server-side log record.

use anyhow::{anyhow, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Extension, Router};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::allowlist::Allowlist;
use super::config::ProxyConfig;
use super::envelope::ProxyEnvelope;
use super::headers::{relay_response_headers, HeaderSanitizer};
use crate::error::GatewayError;
use crate::server::{client_ip, ConnectionHandle};
use crate::upstream::describe_error;

/// Pipeline stage a proxy request has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Receiving,
    Parsed,
    Authorized,
    Dispatched,
    Relayed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Receiving => write!(f, "receiving"),
            Stage::Parsed => write!(f, "parsed"),
            Stage::Authorized => write!(f, "authorized"),
            Stage::Dispatched => write!(f, "dispatched"),
            Stage::Relayed => write!(f, "relayed"),
        }
    }
}

/// Per-request state. Lives for one request and is only ever logged.
#[derive(Debug)]
pub struct ProxyRequestContext {
    pub client_ip: String,
    pub received_at: DateTime<Utc>,
    pub body_len: usize,
    pub envelope: Option<ProxyEnvelope>,
    pub stage: Stage,
}

impl ProxyRequestContext {
    pub fn new(client_ip: String) -> Self {
        Self {
            client_ip,
            received_at: Utc::now(),
            body_len: 0,
            envelope: None,
            stage: Stage::Receiving,
        }
    }

    fn field(&self, pick: impl Fn(&ProxyEnvelope) -> &str) -> &str {
        self.envelope.as_ref().map(pick).unwrap_or("-")
    }
}

/// Outcome of reading the ingress body.
#[derive(Debug)]
pub enum Received {
    Complete(Bytes),
    /// The running byte count crossed the limit at this many bytes.
    Overflow(usize),
}

/// Proxy Forwarding Engine.
pub struct ProxyEngine {
    config: ProxyConfig,
    allowlist: Arc<Allowlist>,
    sanitizer: HeaderSanitizer,
    client: reqwest::Client,
    marker: HeaderName,
    marker_value: HeaderValue,
}

impl ProxyEngine {
    pub fn new(
        config: ProxyConfig,
        allowlist: Arc<Allowlist>,
        sanitizer: HeaderSanitizer,
        client: reqwest::Client,
    ) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;

        let marker = HeaderName::from_bytes(config.marker_header.as_bytes())
            .map_err(|_| anyhow!("Invalid marker header: {}", config.marker_header))?;
        let marker_value = HeaderValue::from_str(&config.marker_value)
            .map_err(|_| anyhow!("Invalid marker value: {}", config.marker_value))?;

        Ok(Self {
            config,
            allowlist,
            sanitizer,
            client,
            marker,
            marker_value,
        })
    }

    /// Ingress path served by this engine.
    pub fn path(&self) -> &str {
        &self.config.path
    }

    /// Accumulate the body, stopping as soon as the limit is crossed.
    pub async fn receive(&self, mut body: Body) -> Result<Received, GatewayError> {
        let limit = self.config.max_body_size;
        let mut buffer = BytesMut::new();

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| GatewayError::Parse(format!("failed reading request body: {}", e)))?;
            if let Ok(chunk) = frame.into_data() {
                let total = buffer.len() + chunk.len();
                if total > limit {
                    return Ok(Received::Overflow(total));
                }
                buffer.extend_from_slice(&chunk);
            }
        }

        Ok(Received::Complete(buffer.freeze()))
    }

    /// Sanitize headers and check the destination against the allow-list.
    pub fn authorize(
        &self,
        envelope: &ProxyEnvelope,
        inbound: &HeaderMap,
        client_ip: &str,
    ) -> Result<(HeaderMap, Url), GatewayError> {
        let outbound = self.sanitizer.sanitize(inbound, client_ip)?;

        if !self.allowlist.is_allowed(&envelope.redirect_url) {
            return Err(GatewayError::NotWhitelisted(envelope.redirect_url.clone()));
        }

        Ok((outbound, dispatch_url(&envelope.redirect_url)?))
    }

    /// Send the original body upstream.
    pub async fn dispatch(
        &self,
        method: Method,
        headers: HeaderMap,
        target: Url,
        body: Bytes,
    ) -> Result<reqwest::Response, GatewayError> {
        self.client
            .request(method, target)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(describe_error(&e)))
    }

    /// Stream the upstream response back without buffering it.
    pub fn relay(&self, upstream: reqwest::Response, ctx: &ProxyRequestContext) -> Response {
        let status = upstream.status();
        let headers = relay_response_headers(upstream.headers(), &self.marker, &self.marker_value);

        let client_ip = ctx.client_ip.clone();
        let service = ctx.field(|e| &e.redirect_url).to_string();
        let stream = upstream.bytes_stream().inspect_err(move |e| {
            error!(
                client_ip = %client_ip,
                service = %service,
                error = %e,
                "Upstream response stream failed mid-relay"
            );
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    /// Run the full pipeline for one request.
    pub async fn run(
        &self,
        ctx: &mut ProxyRequestContext,
        method: Method,
        headers: HeaderMap,
        body: Body,
        conn: Option<&ConnectionHandle>,
    ) -> Result<Response, GatewayError> {
        let body = match self.receive(body).await? {
            Received::Complete(bytes) => bytes,
            Received::Overflow(total) => {
                ctx.body_len = total;
                error!(
                    client_ip = %ctx.client_ip,
                    body_len = total,
                    limit = self.config.max_body_size,
                    "EXCESSIVE UPLOAD SIZE, dropping connection"
                );
                return match conn {
                    Some(conn) => {
                        conn.sever();
                        // The connection task drops this future once it sees the kill switch.
                        Ok(std::future::pending::<Response>().await)
                    }
                    None => Ok(StatusCode::PAYLOAD_TOO_LARGE.into_response()),
                };
            }
        };
        ctx.body_len = body.len();

        let envelope = ProxyEnvelope::parse(&body)?;
        ctx.envelope = Some(envelope);
        ctx.stage = Stage::Parsed;
        debug!(
            client_ip = %ctx.client_ip,
            domain = %ctx.field(|e| &e.domain),
            username = %ctx.field(|e| &e.username),
            service = %ctx.field(|e| &e.redirect_url),
            "Proxy envelope parsed"
        );

        let (outbound, target) = match ctx.envelope.as_ref() {
            Some(envelope) => self.authorize(envelope, &headers, &ctx.client_ip)?,
            None => return Err(GatewayError::Parse("envelope lost after parsing".to_string())),
        };
        ctx.stage = Stage::Authorized;

        let upstream = self.dispatch(method, outbound, target, body).await?;
        ctx.stage = Stage::Dispatched;

        let response = self.relay(upstream, ctx);
        ctx.stage = Stage::Relayed;

        info!(
            client_ip = %ctx.client_ip,
            received_at = %ctx.received_at.to_rfc3339(),
            body_len = ctx.body_len,
            domain = %ctx.field(|e| &e.domain),
            username = %ctx.field(|e| &e.username),
            service = %ctx.field(|e| &e.redirect_url),
            response_status = response.status().as_u16(),
            "Proxy request relayed"
        );

        Ok(response)
    }
}

/// Upstream address: scheme, host, port and path of the redirect URL.
fn dispatch_url(redirect_url: &str) -> Result<Url, GatewayError> {
    let mut url = Url::parse(redirect_url.trim())
        .map_err(|e| GatewayError::Parse(format!("invalid redirect_url {:?}: {}", redirect_url, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::Parse(format!("unsupported protocol: {}", url.scheme())));
    }

    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Axum handler for the proxy ingress path.
pub async fn handle_proxy(
    State(engine): State<Arc<ProxyEngine>>,
    conn: Option<Extension<ConnectionHandle>>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let conn = conn.map(|Extension(conn)| conn);
    let mut ctx = ProxyRequestContext::new(client_ip(&headers, conn.as_ref()));

    match engine.run(&mut ctx, method, headers, body, conn.as_ref()).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                GatewayError::Injection(header) => error!(
                    client_ip = %ctx.client_ip,
                    header = %header,
                    username = %ctx.field(|e| &e.username),
                    service = %ctx.field(|e| &e.redirect_url),
                    "CLIENT ATTEMPTED TO INJECT FORBIDDEN HEADER, request terminated"
                ),
                GatewayError::NotWhitelisted(target) => warn!(
                    client_ip = %ctx.client_ip,
                    target = %target,
                    username = %ctx.field(|e| &e.username),
                    "Request to non-whitelisted host"
                ),
                other => error!(
                    client_ip = %ctx.client_ip,
                    stage = %ctx.stage,
                    kind = other.kind(),
                    body_len = ctx.body_len,
                    service = %ctx.field(|e| &e.redirect_url),
                    error = %other,
                    "Proxy request failed"
                ),
            }
            err.into_response()
        }
    }
}

/// Router serving the proxy ingress path with any method.
pub fn router(engine: Arc<ProxyEngine>) -> Router {
    let path = engine.path().to_string();
    Router::new().route(&path, any(handle_proxy)).with_state(engine)
}
