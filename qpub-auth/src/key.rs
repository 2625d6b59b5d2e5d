//! API key handling.

use crate::Error;
use std::{fmt, str::FromStr};

/// An API key of the form `keyId:keySecret`.
///
/// The name (key id) is public and travels in token requests and JWT
/// headers; the secret never leaves the process except inside a basic auth
/// header in static-key mode.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    /// Public key id.
    pub name: String,
    secret: String,
}

impl ApiKey {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self { name: name.into(), secret: secret.into() }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// The `keyId:keySecret` form used for basic authentication.
    pub fn header_value(&self) -> String {
        format!("{}:{}", self.name, self.secret)
    }
}

impl FromStr for ApiKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, secret)) if !name.is_empty() && !secret.is_empty() => {
                Ok(Self::new(name, secret))
            }
            _ => Err(Error::InvalidKey("expected `keyId:keySecret`".into())),
        }
    }
}

// The secret must not leak through debug logging.
impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey").field("name", &self.name).field("secret", &"[redacted]").finish()
    }
}
