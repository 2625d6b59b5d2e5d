#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(no_crate_inject, attr(deny(warnings, rust_2018_idioms))))]

//! Wire protocol types and shared primitives for the QPub client SDK.
//!
//! This crate carries no I/O: the [`protocol`] module models the JSON frame
//! vocabulary of the streaming transport, [`message`] the records handed to
//! application callbacks, [`events`] the typed listener bus the higher-level
//! crates emit through, and [`instance`] the sortable per-instance
//! identifiers.

pub mod events;
pub mod instance;
pub mod message;
pub mod protocol;

pub use events::{EventBus, ListenerId};
pub use instance::{InstanceId, InstanceRole};
pub use message::Message;
pub use protocol::{
    Action, ConnectionDetails, ErrorInfo, Frame, FrameError, MessageFrame, MessagePayload,
};
