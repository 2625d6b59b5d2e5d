//! JWT construction and inspection.
//!
//! Tokens are minted with HS256 over the key secret, with the key id in the
//! header's `kid` field. Decoding here is *inspection only*: clients holding
//! a server-issued bearer token do not hold the signing secret, so the
//! payload is parsed without signature verification. The shape check is
//! strict: exactly three non-empty dot-separated base64url segments.

use crate::{ApiKey, Error};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The signing algorithm named in every QPub JWT header.
pub const ALGORITHM: Algorithm = Algorithm::HS256;

/// Permission map: channel pattern to the operations allowed on it.
pub type Capability = HashMap<String, Vec<String>>;

/// Claims carried in a QPub bearer token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
}

/// Signs `claims` with the key secret, naming the key id in `kid`.
pub fn sign(claims: &TokenClaims, key: &ApiKey) -> Result<String, Error> {
    let mut header = Header::new(ALGORITHM);
    header.kid = Some(key.name.clone());
    encode(&header, claims, &EncodingKey::from_secret(key.secret().as_bytes()))
        .map_err(Error::from)
}

/// Parses the claims segment of a JWT without verifying the signature.
pub fn decode_claims(token: &str) -> Result<TokenClaims, Error> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(header), Some(payload), Some(signature), None)
            if !header.is_empty() && !payload.is_empty() && !signature.is_empty() =>
        {
            payload
        }
        _ => {
            return Err(Error::InvalidToken(
                "expected three dot-separated base64url segments".into(),
            ))
        }
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::InvalidToken(format!("claims segment is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidToken(format!("claims segment is not valid JSON: {e}")))
}
