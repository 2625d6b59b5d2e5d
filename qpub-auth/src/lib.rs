#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Credential primitives for the QPub client SDK.
//!
//! Everything here is pure computation: API key parsing, JWT minting and
//! inspection, and HMAC-signed token requests. Network flows that use these
//! primitives (token issue/exchange, refresh scheduling) live in
//! `qpub-client`'s auth manager.

mod key;
pub use key::ApiKey;

pub mod jwt;
pub use jwt::{Capability, TokenClaims};

mod token;
pub use token::{TokenDetails, TokenResponse};

mod request;
pub use request::{TokenParams, TokenRequest};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid API key: {0}")]
    InvalidKey(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}
