//! The request role: stateless publishes over HTTP.

use crate::{auth::AuthManager, error::Error, transport::http::HttpRequester};
use qpub_core::protocol::MessagePayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
struct PublishBody<'a> {
    channels: &'a [String],
    messages: &'a [MessagePayload],
}

/// Server response to a publish request.
#[derive(Clone, Debug, Deserialize)]
pub struct PublishResponse {
    /// Channels the payloads were accepted on.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub message_count: Option<u64>,
}

/// Access to channels on a request instance. Channels here are stateless
/// names; there is no subscription machinery.
#[derive(Clone, Debug)]
pub struct RestChannels {
    http: HttpRequester,
    auth: AuthManager,
}

impl RestChannels {
    pub(crate) fn new(http: HttpRequester, auth: AuthManager) -> Self {
        Self { http, auth }
    }

    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub fn get(&self, name: &str) -> RestChannel {
        assert!(!name.is_empty(), "channel name must not be empty");
        RestChannel { name: name.to_string(), channels: self.clone() }
    }

    /// Publishes a batch of payloads to one or more channels with a single
    /// request.
    #[tracing::instrument(skip(self, messages), err)]
    pub async fn publish_batch(
        &self,
        channels: &[&str],
        messages: Vec<MessagePayload>,
    ) -> Result<PublishResponse, Error> {
        if channels.is_empty() {
            return Err(Error::Config("publish requires at least one channel".into()));
        }
        let headers = self.auth.auth_headers().await?;
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let body = PublishBody { channels: &channels, messages: &messages };
        self.http.post("messages", &body, headers).await.map_err(Error::from)
    }
}

/// A lightweight handle to one channel on the request instance.
#[derive(Clone, Debug)]
pub struct RestChannel {
    name: String,
    channels: RestChannels,
}

impl RestChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, messages: Vec<MessagePayload>) -> Result<PublishResponse, Error> {
        self.channels.publish_batch(&[&self.name], messages).await
    }

    pub async fn publish_data(&self, data: impl Into<Value>) -> Result<PublishResponse, Error> {
        self.publish(vec![MessagePayload::from_data(data)]).await
    }

    pub async fn publish_event(
        &self,
        event: impl Into<String>,
        data: impl Into<Value>,
    ) -> Result<PublishResponse, Error> {
        self.publish(vec![MessagePayload::with_event(event, data)]).await
    }
}
