//! Bearer token bookkeeping.

use crate::{
    jwt::{self, Capability},
    Error,
};
use serde::{Deserialize, Serialize};

/// A bearer token together with its decoded lifecycle data.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenDetails {
    /// The opaque bearer string handed to the server.
    pub token: String,
    /// Expiry, unix epoch milliseconds.
    pub expires_at: i64,
    /// Issue time, unix epoch milliseconds, when known.
    pub issued_at: Option<i64>,
    pub client_alias: Option<String>,
    pub capability: Option<Capability>,
}

impl TokenDetails {
    /// Builds details by decoding the token's JWT claims for `exp`.
    pub fn from_jwt(token: impl Into<String>) -> Result<Self, Error> {
        let token = token.into();
        let claims = jwt::decode_claims(&token)?;
        Ok(Self {
            token,
            expires_at: claims.exp * 1000,
            issued_at: Some(claims.iat * 1000),
            client_alias: claims.alias,
            capability: claims.capability,
        })
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Shape of the server's token-granting responses (`issueToken`,
/// `requestToken`) and of JSON bodies returned by customer auth endpoints.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
}

impl TokenResponse {
    /// Converts to [`TokenDetails`], preferring the response's own expiry
    /// metadata and falling back to the token's JWT claims.
    pub fn into_details(self) -> Result<TokenDetails, Error> {
        match self.expires {
            Some(expires_at) => Ok(TokenDetails {
                token: self.token,
                expires_at,
                issued_at: self.issued,
                client_alias: self.alias,
                capability: self.capability,
            }),
            None => {
                let mut details = TokenDetails::from_jwt(self.token)?;
                details.client_alias = self.alias.or(details.client_alias);
                details.capability = self.capability.or(details.capability);
                Ok(details)
            }
        }
    }
}
