#![warn(rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Clients for the QPub realtime pub/sub protocol.
//!
//! Two instance roles exist. [`QPub`] holds a long-lived streaming session:
//! channels are obtained from [`QPub::channels`], subscribed with callbacks
//! (catch-all or filtered by event name), paused and resumed with optional
//! buffering, and automatically resubscribed after reconnects. [`QPubRest`]
//! is a stateless request instance for publishing over HTTP.
//!
//! ```no_run
//! use qpub_client::{ClientOptions, QPub};
//!
//! # async fn run() -> Result<(), qpub_client::Error> {
//! let client = QPub::new(ClientOptions::from_key("app.k1:secret"))?;
//! client.connect().await?;
//!
//! let channel = client.channels().get("orders");
//! channel
//!     .subscribe(|message| println!("{}: {}", message.id, message.data))
//!     .await?;
//! channel.publish_event("created", serde_json::json!({ "id": 42 })).await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod client;
mod connection;
mod error;
mod options;
mod rest;
mod transport;

pub use auth::{AuthEvent, AuthManager, AuthMode};
pub use channel::{
    Channel, ChannelEvent, Channels, HandlerId, MessageHandler, PauseOptions, SubscribeOptions,
};
pub use client::{QPub, QPubRest};
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::Error;
pub use options::ClientOptions;
pub use rest::{PublishResponse, RestChannel, RestChannels};
pub use transport::{HttpRequester, RestError};

// The wire and credential vocabulary used in public signatures.
pub use qpub_auth::{ApiKey, Capability, TokenDetails, TokenParams, TokenRequest};
pub use qpub_core::{
    events::{EventBus, ListenerId},
    instance::{InstanceId, InstanceRole},
    message::Message,
    protocol::{Action, ConnectionDetails, ErrorInfo, Frame, MessagePayload},
};
