//! JSON request/response client for the HTTP surface.

use qpub_core::protocol::ErrorInfo;
use reqwest::{header::HeaderMap, Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Error thrown when issuing an HTTP request.
#[derive(Debug, Error)]
pub enum RestError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// The server answered with a QPub error body.
    #[error("API error: {0}")]
    Api(ErrorInfo),

    #[error("deserialization error: {err}. Body: {text}")]
    SerdeJson {
        err: serde_json::Error,
        /// The response body that could not be deserialized.
        text: String,
    },

    #[error(transparent)]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
}

/// Error-body envelope returned by the server on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorInfo,
}

/// A low-level JSON client over HTTP.
///
/// Auth headers are composed per request by the caller (normally the auth
/// manager) and merged with the client's defaults.
#[derive(Clone, Debug)]
pub struct HttpRequester {
    client: Client,
    base: Url,
}

impl HttpRequester {
    pub fn new(base: Url) -> Self {
        Self::new_with_client(base, Client::new())
    }

    /// Allows customizing the underlying client (proxies, timeouts, pools).
    pub fn new_with_client(base: Url, client: Client) -> Self {
        Self { client, base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Issues a request against a path under the base URL.
    pub async fn request<T, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
        headers: HeaderMap,
    ) -> Result<R, RestError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.base.join(path.trim_start_matches('/'))?;
        self.request_url(method, url, body, headers).await
    }

    /// Issues a request against an absolute URL (used for customer auth
    /// endpoints, which live outside the QPub host).
    pub async fn request_url<T, R>(
        &self,
        method: Method,
        url: Url,
        body: Option<&T>,
        headers: HeaderMap,
    ) -> Result<R, RestError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let text = self.request_text(method, url, &[], body, headers).await?;
        serde_json::from_str(&text).map_err(|err| RestError::SerdeJson { err, text })
    }

    /// Like [`HttpRequester::request_url`] but returns the raw body, for
    /// endpoints that answer with a bare token string.
    pub async fn request_text<T>(
        &self,
        method: Method,
        url: Url,
        params: &[(String, String)],
        body: Option<&T>,
        headers: HeaderMap,
    ) -> Result<String, RestError>
    where
        T: Serialize + ?Sized,
    {
        let mut request = self.client.request(method, url).headers(headers);
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            if let Ok(body) = serde_json::from_slice::<ErrorBody>(&bytes) {
                return Err(RestError::Api(body.error));
            }
            return Err(RestError::Api(ErrorInfo {
                code: status.as_u16() as i64 * 100,
                href: None,
                message: format!("HTTP {status}"),
                status_code: Some(status.as_u16()),
            }));
        }

        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    pub async fn get<R: DeserializeOwned>(
        &self,
        path: &str,
        headers: HeaderMap,
    ) -> Result<R, RestError> {
        self.request::<(), R>(Method::GET, path, None, headers).await
    }

    pub async fn post<T, R>(&self, path: &str, body: &T, headers: HeaderMap) -> Result<R, RestError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request(Method::POST, path, Some(body), headers).await
    }

    pub async fn put<T, R>(&self, path: &str, body: &T, headers: HeaderMap) -> Result<R, RestError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request(Method::PUT, path, Some(body), headers).await
    }

    pub async fn delete<R: DeserializeOwned>(
        &self,
        path: &str,
        headers: HeaderMap,
    ) -> Result<R, RestError> {
        self.request::<(), R>(Method::DELETE, path, None, headers).await
    }

    pub async fn patch<T, R>(&self, path: &str, body: &T, headers: HeaderMap) -> Result<R, RestError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request(Method::PATCH, path, Some(body), headers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_join_under_the_base() {
        let requester = HttpRequester::new(Url::parse("https://rest.qpub.io/").unwrap());
        let joined = requester.base().join("keys/k1/issueToken").unwrap();
        assert_eq!(joined.as_str(), "https://rest.qpub.io/keys/k1/issueToken");
    }

    #[test]
    fn error_bodies_decode_to_error_info() {
        let body: ErrorBody = serde_json::from_str(
            r#"{"error":{"code":40100,"message":"unauthorized","statusCode":401}}"#,
        )
        .unwrap();
        assert_eq!(body.error.code, 40100);
        assert_eq!(body.error.status_code, Some(401));
    }
}
