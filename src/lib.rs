#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! # QPub client SDK for Rust.
//!
//! A client for the QPub realtime publish/subscribe protocol, split across
//! three crates and re-exported here:
//!
//! ## `core`
//!
//! The wire vocabulary: protocol [frames](core::protocol) and action codes,
//! the [`Message`](core::message::Message) records handed to application
//! callbacks, the typed [event bus](core::events), and sortable per-instance
//! identifiers.
//!
//! ## `auth`
//!
//! Pure credential primitives: API key parsing, JWT minting and strict
//! inspection, and HMAC-signed token requests that let a client obtain
//! bearer tokens without ever holding the key secret.
//!
//! ## `client`
//!
//! The two instance roles. [`QPub`](client::QPub) owns a streaming session:
//! per-channel state machines with strict operation serialization,
//! event-filtered subscriptions, pause/resume with buffering, automatic
//! resubscription after reconnects, and a token-refreshing auth manager.
//! [`QPubRest`](client::QPubRest) publishes statelessly over HTTP.
//!
//! ## Quickstart
//!
//! ```no_run
//! use qpub::prelude::*;
//!
//! # async fn run() -> Result<(), qpub::client::Error> {
//! let client = QPub::new(ClientOptions::from_key("app.k1:secret"))?;
//! client.connect().await?;
//!
//! let channel = client.channels().get("orders");
//! channel
//!     .subscribe(|message| println!("{}: {}", message.id, message.data))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod core {
    pub use qpub_core::*;
}

pub mod auth {
    pub use qpub_auth::*;
}

pub mod client {
    pub use qpub_client::*;
}

/// Easy import of the frequently used types.
pub mod prelude {
    pub use qpub_client::*;
}
