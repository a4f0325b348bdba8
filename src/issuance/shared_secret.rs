//! Shared-secret exchange.
//!
//! The backend exposes a session-start endpoint guarded by a per-deployment
//! secret. The gateway posts the secret with the user id and gets a session
//! id back.

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::config::SharedSecretTarget;
use super::{IssuanceError, IssuanceProtocol, IssuanceRequest, SessionIssuer};
use crate::upstream::describe_error;

#[derive(Serialize)]
struct StartSessionRequest<'a> {
    secret: &'a str,
    username: &'a str,
    #[serde(rename = "clientIP")]
    client_ip: &'a str,
}

#[derive(Deserialize)]
struct StartSessionResponse {
    session: Option<String>,
}

pub struct SharedSecretExchange {
    registry: HashMap<String, SharedSecretTarget>,
    client: reqwest::Client,
}

impl SharedSecretExchange {
    pub fn new(registry: HashMap<String, SharedSecretTarget>, client: reqwest::Client) -> Self {
        Self { registry, client }
    }
}

#[async_trait]
impl SessionIssuer for SharedSecretExchange {
    fn protocol(&self) -> IssuanceProtocol {
        IssuanceProtocol::SharedSecret
    }

    async fn issue(&self, request: &IssuanceRequest) -> Result<String, IssuanceError> {
        let target = self
            .registry
            .get(&request.target_url)
            .ok_or_else(|| IssuanceError::Unconfigured(request.target_url.clone()))?;

        debug!(endpoint = %target.endpoint, user_id = %request.user_id, "Starting shared-secret session");

        let response = self
            .client
            .post(&target.endpoint)
            .json(&StartSessionRequest {
                secret: &target.secret,
                username: &request.user_id,
                client_ip: &request.client_ip,
            })
            .send()
            .await
            .map_err(|e| IssuanceError::Transport(describe_error(&e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!(endpoint = %target.endpoint, status = status.as_u16(), "Session start endpoint refused login");
            return Err(IssuanceError::Rejected(status.as_u16()));
        }

        let body: StartSessionResponse = response
            .json()
            .await
            .map_err(|e| IssuanceError::MissingToken(describe_error(&e)))?;

        body.session
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IssuanceError::MissingToken("response has no session field".to_string()))
    }
}
