//! Client configuration.

use crate::error::Error;
use qpub_auth::TokenRequest;
use std::time::Duration;
use url::Url;

/// Typed configuration for both client roles, with defaults for every knob.
///
/// Construct with [`ClientOptions::from_key`] or [`ClientOptions::from_token`]
/// and override individual fields as needed:
///
/// ```
/// use qpub_client::ClientOptions;
/// use std::time::Duration;
///
/// let options = ClientOptions {
///     connect_timeout: Duration::from_secs(5),
///     ..ClientOptions::from_key("app.k1:secret")
/// };
/// # let _ = options;
/// ```
#[derive(Clone, Debug)]
pub struct ClientOptions {
    // -- credentials
    /// `keyId:keySecret` API key.
    pub key: Option<String>,
    /// A pre-issued bearer token. Fixed tokens cannot be refreshed.
    pub token: Option<String>,
    /// A pre-built signed token request to exchange for a bearer token.
    pub token_request: Option<TokenRequest>,
    /// Customer endpoint that returns a token, token response or signed
    /// token request.
    pub auth_url: Option<Url>,
    /// HTTP method for `auth_url` calls.
    pub auth_method: http::Method,
    /// Extra headers to send to `auth_url`.
    pub auth_headers: Vec<(String, String)>,
    /// Extra query parameters to send to `auth_url`.
    pub auth_params: Vec<(String, String)>,
    /// Client alias requested in minted tokens.
    pub alias: Option<String>,
    /// With only a key configured, authenticate with minted tokens instead
    /// of sending the raw key on every request.
    pub use_token_auth: bool,
    /// Lifetime of locally minted tokens.
    pub default_token_ttl: Duration,

    // -- endpoints
    pub http_host: String,
    pub http_port: Option<u16>,
    pub ws_host: String,
    pub ws_port: Option<u16>,
    pub secure: bool,

    // -- behaviors
    /// Open the streaming session as soon as the client is constructed.
    pub auto_connect: bool,
    /// Re-open the session with backoff after an unexpected close.
    pub auto_reconnect: bool,
    /// Re-establish server-side subscriptions after a fresh session.
    pub auto_resubscribe: bool,
    /// Acquire a token on demand when a request needs one.
    pub auto_authenticate: bool,

    // -- timings
    pub connect_timeout: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_multiplier: f64,
    pub max_reconnect_attempts: u32,
    /// How long a resubscription sweep waits for acknowledgements before
    /// flagging a channel as failed.
    pub resubscribe_interval: Duration,
    pub auth_retries: u32,
    pub auth_retry_interval: Duration,
    pub ping_timeout: Duration,
    /// Default deadline for subscribe/unsubscribe acknowledgements.
    pub operation_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            token_request: None,
            auth_url: None,
            auth_method: http::Method::GET,
            auth_headers: Vec::new(),
            auth_params: Vec::new(),
            alias: None,
            use_token_auth: false,
            default_token_ttl: Duration::from_secs(60 * 60),

            http_host: "rest.qpub.io".into(),
            http_port: None,
            ws_host: "stream.qpub.io".into(),
            ws_port: None,
            secure: true,

            auto_connect: true,
            auto_reconnect: true,
            auto_resubscribe: true,
            auto_authenticate: true,

            connect_timeout: Duration::from_secs(10),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_multiplier: 2.0,
            max_reconnect_attempts: 5,
            resubscribe_interval: Duration::from_secs(10),
            auth_retries: 2,
            auth_retry_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientOptions {
    pub fn from_key(key: impl Into<String>) -> Self {
        Self { key: Some(key.into()), ..Default::default() }
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self { token: Some(token.into()), ..Default::default() }
    }

    pub(crate) fn has_credentials(&self) -> bool {
        self.key.is_some()
            || self.token.is_some()
            || self.token_request.is_some()
            || self.auth_url.is_some()
    }

    /// The websocket connect URL, without auth query parameters.
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        match self.ws_port {
            Some(port) => format!("{scheme}://{}:{port}", self.ws_host),
            None => format!("{scheme}://{}", self.ws_host),
        }
    }

    /// Base URL for the HTTP surface.
    pub fn http_url(&self) -> Result<Url, Error> {
        let scheme = if self.secure { "https" } else { "http" };
        let base = match self.http_port {
            Some(port) => format!("{scheme}://{}:{port}/", self.http_host),
            None => format!("{scheme}://{}/", self.http_host),
        };
        Url::parse(&base).map_err(|e| Error::Config(format!("invalid http endpoint: {e}")))
    }

    pub(crate) fn next_reconnect_delay(&self, previous: Duration) -> Duration {
        let scaled = previous.mul_f64(self.reconnect_multiplier.max(1.0));
        scaled.min(self.reconnect_max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_secure_and_resilient() {
        let options = ClientOptions::default();
        assert!(options.secure);
        assert!(options.auto_connect);
        assert!(options.auto_reconnect);
        assert!(options.auto_resubscribe);
        assert_eq!(options.operation_timeout, Duration::from_secs(10));
        assert!(!options.has_credentials());
    }

    #[test]
    fn url_builders_honor_scheme_and_port() {
        let mut options = ClientOptions::from_key("k:s");
        assert_eq!(options.ws_url(), "wss://stream.qpub.io");
        assert_eq!(options.http_url().unwrap().as_str(), "https://rest.qpub.io/");

        options.secure = false;
        options.ws_port = Some(8080);
        options.http_port = Some(8081);
        options.ws_host = "localhost".into();
        options.http_host = "localhost".into();
        assert_eq!(options.ws_url(), "ws://localhost:8080");
        assert_eq!(options.http_url().unwrap().as_str(), "http://localhost:8081/");
    }

    #[test]
    fn reconnect_delay_grows_and_clamps() {
        let options = ClientOptions {
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(5),
            reconnect_multiplier: 3.0,
            ..ClientOptions::default()
        };
        let first = options.reconnect_initial_delay;
        let second = options.next_reconnect_delay(first);
        let third = options.next_reconnect_delay(second);
        assert_eq!(second, Duration::from_secs(3));
        assert_eq!(third, Duration::from_secs(5));
    }
}
