//! SSO context token.
//!
//! Carries `{target_url, domain}` from the redirect to the ACS in a cookie.
//! Token format: `{base64url(json)}.{hex(hmac_sha256(base64url(json)))}`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Tolerated clock difference for tokens stamped slightly in the future.
const FUTURE_TOLERANCE_SECS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsoContext {
    pub target_url: String,
    pub domain: String,
    /// Unix timestamp of the redirect.
    pub issued_at: i64,
}

impl SsoContext {
    pub fn new(target_url: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            domain: domain.into(),
            issued_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Signs and verifies context tokens.
pub struct ContextSealer {
    secret: Vec<u8>,
    max_age_secs: i64,
}

impl ContextSealer {
    /// Use `secret` as HMAC key, or a random per-process key when absent.
    pub fn new(secret: Option<&str>, max_age_secs: u64) -> Self {
        let secret = match secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => rand::random::<[u8; 32]>().to_vec(),
        };

        Self {
            secret,
            max_age_secs: i64::try_from(max_age_secs).unwrap_or(i64::MAX),
        }
    }

    pub fn seal(&self, context: &SsoContext) -> Result<String, GatewayError> {
        let json = serde_json::to_vec(context)
            .map_err(|e| GatewayError::Parse(format!("failed to encode SSO context: {}", e)))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = self.sign(&payload)?;
        Ok(format!("{}.{}", payload, signature))
    }

    pub fn open(&self, token: &str) -> Result<SsoContext, GatewayError> {
        self.open_at(token, chrono::Utc::now().timestamp())
    }

    fn open_at(&self, token: &str, now: i64) -> Result<SsoContext, GatewayError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| GatewayError::ContextTampered("malformed context token".to_string()))?;

        let expected = self.sign(payload)?;
        if !bool::from(signature.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(GatewayError::ContextTampered("context signature mismatch".to_string()));
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| GatewayError::ContextTampered("context payload is not base64".to_string()))?;
        let context: SsoContext = serde_json::from_slice(&json)
            .map_err(|_| GatewayError::ContextTampered("context payload is not valid".to_string()))?;

        let age = now - context.issued_at;
        if age < -FUTURE_TOLERANCE_SECS {
            return Err(GatewayError::ContextTampered("context issued in the future".to_string()));
        }
        if age > self.max_age_secs {
            return Err(GatewayError::FlowExpired);
        }

        Ok(context)
    }

    fn sign(&self, payload: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| GatewayError::ContextTampered("invalid context key".to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-context-secret-32-bytes-long!!";

    fn context() -> SsoContext {
        SsoContext::new("https://hive.example.org/i2b2/services/PMService/", "i2b2demo")
    }

    #[test]
    fn test_seal_and_open() {
        let sealer = ContextSealer::new(Some(TEST_SECRET), 600);
        let token = sealer.seal(&context()).unwrap();
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)));
        assert_eq!(sealer.open(&token).unwrap().domain, "i2b2demo");
    }

    #[test]
    fn test_wrong_secret() {
        let token = ContextSealer::new(Some(TEST_SECRET), 600).seal(&context()).unwrap();
        let other = ContextSealer::new(None, 600);
        assert!(matches!(other.open(&token), Err(GatewayError::ContextTampered(_))));
    }

    #[test]
    fn test_tampered_target() {
        let sealer = ContextSealer::new(Some(TEST_SECRET), 600);
        let token = sealer.seal(&context()).unwrap();
        let (_, signature) = token.split_once('.').unwrap();

        let mut forged = context();
        forged.target_url = "https://evil.example.com/".to_string();
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());

        let err = sealer.open(&format!("{}.{}", payload, signature)).unwrap_err();
        assert!(matches!(err, GatewayError::ContextTampered(_)));
    }

    #[test]
    fn test_expired() {
        let sealer = ContextSealer::new(Some(TEST_SECRET), 600);
        let ctx = context();
        let token = sealer.seal(&ctx).unwrap();
        assert!(sealer.open_at(&token, ctx.issued_at + 600).is_ok());
        assert!(matches!(
            sealer.open_at(&token, ctx.issued_at + 601),
            Err(GatewayError::FlowExpired)
        ));
    }

    #[test]
    fn test_malformed() {
        let sealer = ContextSealer::new(Some(TEST_SECRET), 600);
        assert!(sealer.open("").is_err());
        assert!(sealer.open("no-dot").is_err());
        assert!(sealer.open("a.b").is_err());
    }
}
