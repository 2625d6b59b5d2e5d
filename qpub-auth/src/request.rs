//! Signed token requests.
//!
//! A token request lets a client obtain a bearer token without ever holding
//! the API key secret: a server that does hold the key signs the request,
//! and the client exchanges it at the token endpoint. The MAC is
//! HMAC-SHA256 over the newline-joined canonical fields, base64-encoded;
//! the field order below is a server contract and must not change.

use crate::{jwt::Capability, ApiKey, Error};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;

/// Caller-chosen parameters for a token grant.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenParams {
    /// Requested token lifetime in milliseconds.
    pub ttl: Option<i64>,
    pub capability: Option<Capability>,
    pub alias: Option<String>,
}

/// A signed intent to obtain a bearer token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    /// Canonical JSON text of the requested capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Signing time, unix epoch milliseconds.
    pub timestamp: i64,
    pub nonce: String,
    pub mac: String,
}

impl TokenRequest {
    /// Creates and signs a request with the current clock and a fresh nonce.
    pub fn sign(key: &ApiKey, params: &TokenParams) -> Result<Self, Error> {
        Self::sign_at(key, params, now_ms(), random_nonce())
    }

    /// Deterministic variant of [`TokenRequest::sign`].
    pub fn sign_at(
        key: &ApiKey,
        params: &TokenParams,
        timestamp: i64,
        nonce: String,
    ) -> Result<Self, Error> {
        let capability = params
            .capability
            .as_ref()
            .map(|c| serde_json::to_string(&canonical_capability(c)))
            .transpose()
            .map_err(|e| Error::InvalidKey(format!("capability is not serializable: {e}")))?;

        let mut request = Self {
            key_name: key.name.clone(),
            ttl: params.ttl,
            capability,
            alias: params.alias.clone(),
            timestamp,
            nonce,
            mac: String::new(),
        };
        request.mac = compute_mac(key, &request.signing_text());
        Ok(request)
    }

    /// Checks the MAC against a key. Primarily a server-side operation, but
    /// also lets a client sanity-check externally supplied requests.
    pub fn verify(&self, key: &ApiKey) -> bool {
        let mut mac = HmacSha256::new_from_slice(key.secret().as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(self.signing_text().as_bytes());
        match STANDARD.decode(&self.mac) {
            Ok(expected) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }

    fn signing_text(&self) -> String {
        let ttl = self.ttl.map(|t| t.to_string()).unwrap_or_default();
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n",
            self.key_name,
            ttl,
            self.capability.as_deref().unwrap_or(""),
            self.alias.as_deref().unwrap_or(""),
            self.timestamp,
            self.nonce,
        )
    }
}

fn compute_mac(key: &ApiKey, text: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key.secret().as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(text.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

// Capabilities serialize with sorted keys so the MAC is stable across
// otherwise-equal requests.
fn canonical_capability(capability: &Capability) -> std::collections::BTreeMap<&str, &Vec<String>> {
    capability.iter().map(|(k, v)| (k.as_str(), v)).collect()
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn random_nonce() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(NONCE_LEN).map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ApiKey {
        "app.k1:sekrit".parse().unwrap()
    }

    fn params() -> TokenParams {
        TokenParams {
            ttl: Some(3_600_000),
            capability: Some(Capability::from([("news".into(), vec!["subscribe".into()])])),
            alias: Some("alice".into()),
        }
    }

    #[test]
    fn signed_requests_verify_under_the_signing_key() {
        let request = TokenRequest::sign(&key(), &params()).unwrap();
        assert!(request.verify(&key()));
        assert!(!request.verify(&"app.k1:other".parse().unwrap()));
    }

    #[test]
    fn signing_is_deterministic_for_fixed_time_and_nonce() {
        let a = TokenRequest::sign_at(&key(), &params(), 1_700_000_000_000, "n0nce".into());
        let b = TokenRequest::sign_at(&key(), &params(), 1_700_000_000_000, "n0nce".into());
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[test]
    fn tampering_invalidates_the_mac() {
        let mut request = TokenRequest::sign(&key(), &params()).unwrap();
        request.ttl = Some(7_200_000);
        assert!(!request.verify(&key()));
    }

    #[test]
    fn fresh_requests_use_fresh_nonces() {
        let a = TokenRequest::sign(&key(), &params()).unwrap();
        let b = TokenRequest::sign(&key(), &params()).unwrap();
        assert_eq!(a.nonce.len(), NONCE_LEN);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn requests_roundtrip_through_json() {
        let request = TokenRequest::sign(&key(), &params()).unwrap();
        let text = serde_json::to_string(&request).unwrap();
        let back: TokenRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(request, back);
        assert!(back.verify(&key()));
    }
}
