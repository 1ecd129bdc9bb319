//! Join-token verification against the external identity provider.
//!
//! In secure mode the first `join` frame must carry an ID token whose
//! subject equals the claimed user ID. The verifier is an interface; the
//! HTTP implementation posts the token to the configured endpoint and
//! expects `{"uid": "..."}` back.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use pg_domain::error::{Error, Result};

/// Constant-time token comparison via SHA-256 digest. Hashing normalizes
/// lengths so `ct_eq` always compares 32 bytes.
pub fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedIdentity {
    pub uid: String,
}

#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP verifier
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpTokenVerifier {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpTokenVerifier {
    pub fn new(verify_url: String, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { client, verify_url })
    }
}

#[async_trait::async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        let response = self
            .client
            .post(&self.verify_url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(e.to_string())
                } else {
                    Error::Http(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "identity provider returned {}",
                response.status()
            )));
        }
        response
            .json::<VerifiedIdentity>()
            .await
            .map_err(|e| Error::Auth(format!("malformed verifier response: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Static verifier (tests, fixtures)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fixed token → uid table.
pub struct StaticVerifier {
    tokens: HashMap<String, String>,
}

impl StaticVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait::async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        for (known, uid) in &self.tokens {
            if token_eq(known, token) {
                return Ok(VerifiedIdentity { uid: uid.clone() });
            }
        }
        Err(Error::Auth("unknown token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_eq_handles_length_mismatch() {
        assert!(token_eq("abc", "abc"));
        assert!(!token_eq("abc", "abcd"));
        assert!(!token_eq("", "x"));
    }

    #[tokio::test]
    async fn static_verifier_resolves_uid() {
        let mut tokens = HashMap::new();
        tokens.insert("tok-1".to_string(), "user-1".to_string());
        let verifier = StaticVerifier::new(tokens);

        let identity = verifier.verify("tok-1").await.unwrap();
        assert_eq!(identity.uid, "user-1");
        assert!(verifier.verify("tok-2").await.is_err());
    }
}
