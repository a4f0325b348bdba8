//! Outbound HTTP clients.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::warn;

/// Build an outbound client.
///
/// Redirects are never followed. `accept_invalid_certs` relaxes certificate
/// validation for backends running on self-signed certificates.
pub fn build_client(accept_invalid_certs: bool, timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(accept_invalid_certs);

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    if accept_invalid_certs {
        warn!("Outbound client accepts self-signed and invalid TLS certificates");
    }

    builder.build().context("Failed to create HTTP client")
}

/// Render a transport error without leaking more than the category.
pub fn describe_error(error: &reqwest::Error) -> String {
    let category = if error.is_timeout() {
        "timeout"
    } else if error.is_connect() {
        "connect"
    } else if error.is_body() || error.is_decode() {
        "body"
    } else if error.is_request() {
        "request"
    } else {
        "transport"
    };
    format!("{} error: {}", category, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_error_is_described() {
        let client = build_client(false, Some(Duration::from_secs(2))).unwrap();
        // Port 9 (discard) on localhost is expected to be closed in test environments.
        let err = client.get("http://127.0.0.1:9/").send().await.unwrap_err();
        let described = describe_error(&err);
        assert!(described.contains("error"));
    }

    #[test]
    fn test_build_relaxed_client() {
        assert!(build_client(true, None).is_ok());
    }
}
