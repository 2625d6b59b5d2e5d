//! Channels: named logical streams on the streaming session.
//!
//! [`Channel`] is a cheap cloneable handle; the protocol state itself lives
//! in the connection manager task (see [`state`]) and is driven through the
//! instruction channel. Subscribe and unsubscribe return once the server
//! acknowledges (or immediately, when no round-trip is needed); publish
//! resolves as soon as the frame is dispatched.

pub(crate) mod registry;
pub(crate) mod state;

pub use registry::Channels;

use crate::{connection::Instruction, error::Error};
use futures_channel::{mpsc, oneshot};
use qpub_core::{
    events::EventBus,
    message::Message,
    protocol::{ErrorInfo, MessagePayload},
};
use serde_json::Value;
use state::UnsubscribeScope;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Callback invoked for every delivered message it is registered for.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

/// Identifies one event-scoped handler registration on a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// Channel lifecycle events.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Subscribing,
    Subscribed,
    Unsubscribing,
    Unsubscribed,
    Failed(ErrorInfo),
    Resumed { delivered: usize },
}

/// Options for [`Channel::subscribe_with`].
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    /// Restrict delivery to messages carrying this event name.
    pub event: Option<String>,
    /// Acknowledgement deadline; the client default applies when `None`.
    pub timeout: Option<Duration>,
}

/// Options for [`Channel::pause_with`].
#[derive(Clone, Debug)]
pub struct PauseOptions {
    /// Buffer messages arriving while paused for replay on resume.
    pub buffer_messages: bool,
}

impl Default for PauseOptions {
    fn default() -> Self {
        Self { buffer_messages: true }
    }
}

/// Handle to one named channel.
#[derive(Clone)]
pub struct Channel {
    name: String,
    instructions: mpsc::UnboundedSender<Instruction>,
    events: Arc<EventBus<ChannelEvent>>,
    next_handler_id: Arc<AtomicU64>,
    default_timeout: Duration,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        instructions: mpsc::UnboundedSender<Instruction>,
        events: Arc<EventBus<ChannelEvent>>,
        next_handler_id: Arc<AtomicU64>,
        default_timeout: Duration,
    ) -> Self {
        Self { name, instructions, events, next_handler_id, default_timeout }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifecycle events for this channel.
    pub fn events(&self) -> &EventBus<ChannelEvent> {
        &self.events
    }

    /// Subscribes a catch-all handler receiving every message on the
    /// channel. Replaces any existing handlers.
    pub async fn subscribe(
        &self,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        self.subscribe_with(SubscribeOptions::default(), handler).await.map(|_| ())
    }

    /// Subscribes a handler for one event name only.
    pub async fn subscribe_event(
        &self,
        event: impl Into<String>,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<HandlerId, Error> {
        let options = SubscribeOptions { event: Some(event.into()), timeout: None };
        match self.subscribe_with(options, handler).await? {
            Some(id) => Ok(id),
            None => Err(Error::Config("event subscription did not register a handler".into())),
        }
    }

    /// General form of subscribe. Resolves when the subscription is
    /// effective: on the server acknowledgement when a round-trip is needed,
    /// immediately otherwise. Returns the handler id for event-scoped
    /// registrations.
    #[tracing::instrument(skip(self, options, handler), fields(channel = %self.name))]
    pub async fn subscribe_with(
        &self,
        options: SubscribeOptions,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<Option<HandlerId>, Error> {
        let handler_id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let event = options.event.clone();
        let (reply, rx) = oneshot::channel();
        self.instruct(Instruction::Subscribe {
            channel: self.name.clone(),
            event: options.event,
            handler: Arc::new(handler),
            handler_id,
            reply,
        })?;
        self.await_reply(rx, options.timeout).await?;
        Ok(event.map(|_| handler_id))
    }

    /// Fully unsubscribes the channel, detaching every handler.
    #[tracing::instrument(skip(self), fields(channel = %self.name))]
    pub async fn unsubscribe(&self) -> Result<(), Error> {
        self.unsubscribe_scope(UnsubscribeScope::Channel).await
    }

    /// Removes every handler for one event; when that leaves the channel
    /// without handlers, the channel itself is unsubscribed.
    pub async fn unsubscribe_event(&self, event: impl Into<String>) -> Result<(), Error> {
        self.unsubscribe_scope(UnsubscribeScope::Event(event.into())).await
    }

    /// Removes a single handler registration.
    pub async fn unsubscribe_handler(
        &self,
        event: impl Into<String>,
        handler_id: HandlerId,
    ) -> Result<(), Error> {
        self.unsubscribe_scope(UnsubscribeScope::Handler(event.into(), handler_id)).await
    }

    async fn unsubscribe_scope(&self, scope: UnsubscribeScope) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.instruct(Instruction::Unsubscribe { channel: self.name.clone(), scope, reply })?;
        self.await_reply(rx, None).await
    }

    /// Publishes payloads to the channel. Fire-and-forget: resolves once the
    /// frame is handed to the transport, independent of any server
    /// acknowledgement and of the operation queue.
    #[tracing::instrument(skip(self, messages), fields(channel = %self.name))]
    pub async fn publish(&self, messages: Vec<MessagePayload>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.instruct(Instruction::Publish { channel: self.name.clone(), messages, reply })?;
        rx.await.map_err(|_| Error::DeadChannel)?
    }

    /// Publishes a single data payload.
    pub async fn publish_data(&self, data: impl Into<Value>) -> Result<(), Error> {
        self.publish(vec![MessagePayload::from_data(data)]).await
    }

    /// Publishes a single payload tagged with an event name.
    pub async fn publish_event(
        &self,
        event: impl Into<String>,
        data: impl Into<Value>,
    ) -> Result<(), Error> {
        self.publish(vec![MessagePayload::with_event(event, data)]).await
    }

    /// Pauses delivery, buffering incoming messages for replay.
    pub async fn pause(&self) -> Result<(), Error> {
        self.pause_with(PauseOptions::default()).await
    }

    pub async fn pause_with(&self, options: PauseOptions) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.instruct(Instruction::Pause {
            channel: self.name.clone(),
            buffer: options.buffer_messages,
            reply,
        })?;
        rx.await.map_err(|_| Error::DeadChannel)?
    }

    /// Resumes delivery, replaying any buffered messages in arrival order.
    /// Returns how many were delivered.
    pub async fn resume(&self) -> Result<usize, Error> {
        let (reply, rx) = oneshot::channel();
        self.instruct(Instruction::Resume { channel: self.name.clone(), reply })?;
        rx.await.map_err(|_| Error::DeadChannel)?
    }

    fn instruct(&self, instruction: Instruction) -> Result<(), Error> {
        self.instructions.unbounded_send(instruction).map_err(|_| Error::DeadChannel)
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Result<(), Error>>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(Err(_)) => Err(Error::DeadChannel),
            Ok(Ok(result)) => result,
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish_non_exhaustive()
    }
}
