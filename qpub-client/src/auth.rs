//! Token lifecycle management.
//!
//! Four authentication modes are supported, in order of precedence when
//! [`AuthManager::authenticate`] picks a flow from the options:
//!
//! 1. a fixed bearer token (`token`) — used as-is, never refreshed;
//! 2. a pre-built signed token request (`token_request`) — exchanged at the
//!    token endpoint;
//! 3. a customer auth endpoint (`auth_url`) — may answer with a bare token,
//!    a JSON token response, or a signed token request;
//! 4. an API key — either sent directly as basic auth (static mode, no
//!    tokens involved) or, with `use_token_auth`, used to mint a JWT
//!    locally.
//!
//! Server-to-server deployments can also call [`AuthManager::issue_token`]
//! (key-signed POST to the token endpoint) and
//! [`AuthManager::create_token_request`] explicitly.
//!
//! Every acquired token schedules a proactive refresh 30 seconds before
//! expiry; refresh failures retry on a bounded budget before giving up with
//! an `AuthError` event.

use crate::{error::Error, options::ClientOptions, transport::http::HttpRequester};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use qpub_auth::{
    jwt::{self, TokenClaims},
    ApiKey, TokenDetails, TokenParams, TokenRequest, TokenResponse,
};
use qpub_core::events::EventBus;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lead time before expiry at which a refresh fires.
const REFRESH_LEAD: Duration = Duration::from_secs(30);

/// Observable auth lifecycle events.
#[derive(Clone, Debug)]
pub enum AuthEvent {
    TokenUpdated { expires_at: i64 },
    TokenExpired,
    /// One token acquisition attempt failed; retries may follow.
    TokenError(String),
    /// The retry budget is exhausted.
    AuthError(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    Token,
    TokenRequest,
    AuthUrl,
    Key,
}

/// How the streaming handshake should carry credentials.
#[derive(Clone, Debug)]
pub(crate) enum ConnectAuth {
    /// Bearer token as a query parameter on the connect URL.
    QueryToken(String),
    /// Authorization header on the websocket upgrade request.
    Header(String),
}

#[derive(Serialize)]
struct IssueTokenBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias: Option<&'a str>,
}

struct AuthState {
    key: Option<ApiKey>,
    token: Option<TokenDetails>,
    client_alias: Option<String>,
    refresh: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    resetting: bool,
    expiry_notified: bool,
}

struct AuthInner {
    options: Arc<ClientOptions>,
    http: HttpRequester,
    events: EventBus<AuthEvent>,
    state: Mutex<AuthState>,
}

/// Shared token lifecycle manager; cheap to clone.
#[derive(Clone)]
pub struct AuthManager {
    inner: Arc<AuthInner>,
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager").field("mode", &self.mode()).finish_non_exhaustive()
    }
}

impl AuthManager {
    pub(crate) fn new(
        options: Arc<ClientOptions>,
        http: HttpRequester,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let key = options.key.as_deref().map(str::parse::<ApiKey>).transpose()?;
        let client_alias = options.alias.clone();
        Ok(Self {
            inner: Arc::new(AuthInner {
                options,
                http,
                events: EventBus::new(),
                state: Mutex::new(AuthState {
                    key,
                    token: None,
                    client_alias,
                    refresh: None,
                    cancel,
                    resetting: false,
                    expiry_notified: false,
                }),
            }),
        })
    }

    pub fn events(&self) -> &EventBus<AuthEvent> {
        &self.inner.events
    }

    pub fn mode(&self) -> AuthMode {
        let options = &self.inner.options;
        if options.token.is_some() {
            AuthMode::Token
        } else if options.token_request.is_some() {
            AuthMode::TokenRequest
        } else if options.auth_url.is_some() {
            AuthMode::AuthUrl
        } else {
            AuthMode::Key
        }
    }

    fn is_static_key(&self) -> bool {
        self.mode() == AuthMode::Key && !self.inner.options.use_token_auth
    }

    /// Fixed tokens cannot be re-acquired, so they never schedule refreshes.
    fn is_renewable(&self) -> bool {
        !matches!(self.mode(), AuthMode::Token)
    }

    fn key(&self) -> Result<ApiKey, Error> {
        self.inner
            .state
            .lock()
            .unwrap()
            .key
            .clone()
            .ok_or_else(|| Error::Config("an API key is required for this operation".into()))
    }

    fn cancel_token(&self) -> CancellationToken {
        self.inner.state.lock().unwrap().cancel.clone()
    }

    /// The current token, if any. Returning an already-expired token emits
    /// `TokenExpired` first (once per token).
    pub fn token(&self) -> Option<TokenDetails> {
        let (token, notify) = {
            let mut state = self.inner.state.lock().unwrap();
            let token = state.token.clone();
            let notify = match &token {
                Some(t) if t.is_expired_at(now_ms()) && !state.expiry_notified => {
                    state.expiry_notified = true;
                    true
                }
                _ => false,
            };
            (token, notify)
        };
        if notify {
            self.inner.events.emit(&AuthEvent::TokenExpired);
        }
        token
    }

    /// The alias the client is known by, once assigned by options, a token,
    /// or the server.
    pub fn client_alias(&self) -> Option<String> {
        self.inner.state.lock().unwrap().client_alias.clone()
    }

    pub(crate) fn set_client_alias(&self, alias: impl Into<String>) {
        self.inner.state.lock().unwrap().client_alias = Some(alias.into());
    }

    /// Runs the configured authentication flow. Resolves with `None` in
    /// static key mode, which needs no token.
    #[tracing::instrument(skip(self), err)]
    pub async fn authenticate(&self) -> Result<Option<TokenDetails>, Error> {
        let cancel = self.cancel_token();
        let flow = self.authenticate_inner();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = flow => result,
        }
    }

    async fn authenticate_inner(&self) -> Result<Option<TokenDetails>, Error> {
        let options = &self.inner.options;
        if let Some(token) = &options.token {
            let details = TokenDetails::from_jwt(token.clone())?;
            self.set_token(details.clone());
            Ok(Some(details))
        } else if let Some(request) = &options.token_request {
            self.request_token(request).await.map(Some)
        } else if options.auth_url.is_some() {
            self.authorize_via_url().await.map(Some)
        } else if options.use_token_auth {
            self.generate_token(&TokenParams::default()).map(Some)
        } else {
            // static key mode
            Ok(None)
        }
    }

    /// Asks the server to issue a token, authenticating the request with the
    /// API key. Intended for server-to-server use.
    pub async fn issue_token(&self) -> Result<TokenDetails, Error> {
        let key = self.key()?;
        let alias = self.client_alias();
        let body = IssueTokenBody { ttl: None, alias: alias.as_deref() };
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, sensitive_header(&basic_auth_value(&key))?);

        let path = format!("keys/{}/issueToken", key.name);
        let response: TokenResponse = self.inner.http.post(&path, &body, headers).await?;
        let details = response.into_details()?;
        self.set_token(details.clone());
        Ok(details)
    }

    /// Mints a token locally by signing a JWT with the API key. Intended for
    /// server-to-server use; requires the key's private component.
    pub fn generate_token(&self, params: &TokenParams) -> Result<TokenDetails, Error> {
        let key = self.key()?;
        let now = now_ms() / 1000;
        let ttl = params
            .ttl
            .map(|ms| ms / 1000)
            .unwrap_or(self.inner.options.default_token_ttl.as_secs() as i64);
        let claims = TokenClaims {
            iat: now,
            exp: now + ttl.max(1),
            alias: params.alias.clone().or_else(|| self.client_alias()),
            capability: params.capability.clone(),
        };
        let token = jwt::sign(&claims, &key)?;
        let details = TokenDetails {
            token,
            expires_at: claims.exp * 1000,
            issued_at: Some(claims.iat * 1000),
            client_alias: claims.alias,
            capability: claims.capability,
        };
        self.set_token(details.clone());
        Ok(details)
    }

    /// Builds and signs a token request for a client that should never see
    /// the API key.
    pub fn create_token_request(&self, params: &TokenParams) -> Result<TokenRequest, Error> {
        let key = self.key()?;
        TokenRequest::sign(&key, params).map_err(Error::from)
    }

    /// Exchanges a signed token request for a bearer token. The request's
    /// MAC authenticates it; no key is needed.
    pub async fn request_token(&self, request: &TokenRequest) -> Result<TokenDetails, Error> {
        let path = format!("keys/{}/requestToken", request.key_name);
        let response: TokenResponse =
            self.inner.http.post(&path, request, HeaderMap::new()).await?;
        let details = response.into_details()?;
        self.set_token(details.clone());
        Ok(details)
    }

    async fn authorize_via_url(&self) -> Result<TokenDetails, Error> {
        let options = &self.inner.options;
        let url = options
            .auth_url
            .clone()
            .ok_or_else(|| Error::Config("auth_url is not configured".into()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &options.auth_headers {
            let name: reqwest::header::HeaderName = name
                .parse()
                .map_err(|_| Error::Config(format!("invalid auth header name {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Config(format!("invalid auth header value for {name:?}")))?;
            headers.insert(name, value);
        }

        let text = self
            .inner
            .http
            .request_text::<()>(
                options.auth_method.clone(),
                url,
                &options.auth_params,
                None,
                headers,
            )
            .await?;

        // The endpoint may answer with a JSON token response, a signed
        // token request, or a bare token string.
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(trimmed)?;
            if value.get("mac").is_some() {
                let request: TokenRequest = serde_json::from_value(value)?;
                return self.request_token(&request).await;
            }
            let response: TokenResponse = serde_json::from_value(value)?;
            let details = response.into_details()?;
            self.set_token(details.clone());
            return Ok(details);
        }
        let details = TokenDetails::from_jwt(trimmed)?;
        self.set_token(details.clone());
        Ok(details)
    }

    /// Installs a token and schedules its proactive refresh. Never fails:
    /// scheduling problems surface through events, not errors.
    pub fn set_token(&self, details: TokenDetails) {
        let expires_at = details.expires_at;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.resetting {
                return;
            }
            if let Some(alias) = &details.client_alias {
                state.client_alias = Some(alias.clone());
            }
            state.token = Some(details);
            state.expiry_notified = false;
        }
        self.inner.events.emit(&AuthEvent::TokenUpdated { expires_at });
        if self.is_renewable() {
            self.schedule_refresh(expires_at);
        }
    }

    fn schedule_refresh(&self, expires_at: i64) {
        let delay_ms = (expires_at - REFRESH_LEAD.as_millis() as i64 - now_ms()).max(0);
        let delay = Duration::from_millis(delay_ms as u64);
        debug!(?delay, "scheduling token refresh");

        let this = self.clone();
        let cancel = self.cancel_token();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            this.refresh_with_retries(cancel).await;
        });

        let mut state = self.inner.state.lock().unwrap();
        if let Some(previous) = state.refresh.replace(task) {
            previous.abort();
        }
    }

    async fn refresh_with_retries(&self, cancel: CancellationToken) {
        let retries = self.inner.options.auth_retries;
        let interval = self.inner.options.auth_retry_interval;
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            // a successful authenticate() installs the token and schedules
            // the next refresh itself
            match self.authenticate().await {
                Ok(_) => return,
                Err(err) => {
                    failures += 1;
                    let message = err.to_string();
                    warn!(err = %message, failures, "token refresh attempt failed");
                    self.inner.events.emit(&AuthEvent::TokenError(message.clone()));
                    if failures > retries {
                        self.inner.events.emit(&AuthEvent::AuthError(format!(
                            "token refresh failed after {failures} attempts: {message}"
                        )));
                        return;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }

    async fn ensure_token(&self) -> Result<TokenDetails, Error> {
        if let Some(token) = self.token() {
            if !token.is_expired_at(now_ms()) {
                return Ok(token);
            }
        }
        if !self.inner.options.auto_authenticate {
            return Err(Error::AuthFailure(
                "no valid token and auto-authentication is disabled".into(),
            ));
        }
        self.authenticate().await?.ok_or_else(|| {
            Error::AuthFailure("the configured auth mode does not produce tokens".into())
        })
    }

    /// Composes the Authorization header for an HTTP request.
    pub async fn auth_headers(&self) -> Result<HeaderMap, Error> {
        let value = if self.is_static_key() {
            basic_auth_value(&self.key()?)
        } else {
            format!("Bearer {}", self.ensure_token().await?.token)
        };
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, sensitive_header(&value)?);
        Ok(headers)
    }

    /// Credentials for the streaming handshake: basic auth in the upgrade
    /// request for static keys, a token query parameter otherwise.
    pub(crate) async fn connect_auth(&self) -> Result<ConnectAuth, Error> {
        if self.is_static_key() {
            Ok(ConnectAuth::Header(basic_auth_value(&self.key()?)))
        } else {
            Ok(ConnectAuth::QueryToken(self.ensure_token().await?.token))
        }
    }

    /// Aborts in-flight authentication and pending refresh timers and
    /// installs a fresh cancellation token.
    pub(crate) fn reset(&self, cancel: CancellationToken) {
        let mut state = self.inner.state.lock().unwrap();
        state.resetting = true;
        if let Some(task) = state.refresh.take() {
            task.abort();
        }
        state.cancel = cancel;
        state.token = None;
        state.expiry_notified = false;
        state.resetting = false;
    }
}

fn basic_auth_value(key: &ApiKey) -> String {
    format!("Basic {}", STANDARD.encode(key.header_value()))
}

fn sensitive_header(value: &str) -> Result<HeaderValue, Error> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|_| Error::Config("credentials are not header-safe".into()))?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
