//! Session orchestration.
//!
//! `ConnectionManager` is the single task that owns all mutable protocol
//! state: the socket backend handle, every channel's state machine, and the
//! in-flight connect/ping waiters. Frontend handles ([`Connection`],
//! [`crate::Channels`], [`crate::Channel`]) communicate with it over an
//! unbounded instruction channel and receive results through oneshot
//! replies.
//!
//! The loop is biased: inbound frames are handled before new instructions,
//! and a lost link is re-established (with exponential backoff) before
//! anything else proceeds.

use crate::{
    auth::{now_ms, AuthManager, ConnectAuth},
    channel::{
        registry::SharedBuses,
        state::{ChannelState, ReplySender, UnsubscribeScope},
        ChannelEvent, HandlerId, MessageHandler,
    },
    error::Error,
    options::ClientOptions,
    transport::ws::{BackendHandle, ConnectRequest, FrameSink, Inbound, SocketBackend},
};
use futures_channel::{mpsc, oneshot};
use futures_util::{select_biased, StreamExt};
use qpub_core::{
    events::EventBus,
    protocol::{ConnectionDetails, ErrorInfo, Frame, MessagePayload},
};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Local error codes for failures raised by the client itself.
const CODE_PARSE_FAILURE: i64 = 40013;
const CODE_CONNECT_FAILED: i64 = 80002;
const CODE_RECONNECT_EXHAUSTED: i64 = 80030;

/// Connection lifecycle events.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Initialized,
    Connecting,
    /// The transport is open; the protocol handshake is in flight.
    Opened,
    Connected { connection_id: String, connection_details: Option<ConnectionDetails> },
    Disconnected { reason: Option<String>, code: Option<i64> },
    Closing,
    Closed,
    Failed(ErrorInfo),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Default)]
pub(crate) struct Status {
    pub(crate) state: ConnectionState,
    pub(crate) connection_id: Option<String>,
    pub(crate) details: Option<ConnectionDetails>,
}

pub(crate) type SharedStatus = Arc<Mutex<Status>>;

/// Work items sent to the manager task.
pub(crate) enum Instruction {
    Connect {
        reply: ReplySender,
    },
    Disconnect {
        reply: ReplySender,
    },
    Ping {
        reply: oneshot::Sender<Result<Duration, Error>>,
    },
    Attach {
        channel: String,
    },
    Release {
        channel: String,
    },
    Subscribe {
        channel: String,
        event: Option<String>,
        handler: MessageHandler,
        handler_id: HandlerId,
        reply: ReplySender,
    },
    Unsubscribe {
        channel: String,
        scope: UnsubscribeScope,
        reply: ReplySender,
    },
    Publish {
        channel: String,
        messages: Vec<MessagePayload>,
        reply: ReplySender,
    },
    Pause {
        channel: String,
        buffer: bool,
        reply: ReplySender,
    },
    Resume {
        channel: String,
        reply: oneshot::Sender<Result<usize, Error>>,
    },
    /// Fired by the resubscription watchdog after a sweep.
    ResubscribeCheck,
    Reset {
        cancel: CancellationToken,
        reply: oneshot::Sender<()>,
    },
}

/// Frontend handle for session control.
#[derive(Clone)]
pub struct Connection {
    instructions: mpsc::UnboundedSender<Instruction>,
    events: Arc<EventBus<ConnectionEvent>>,
    status: SharedStatus,
    connect_timeout: Duration,
    ping_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(
        instructions: mpsc::UnboundedSender<Instruction>,
        events: Arc<EventBus<ConnectionEvent>>,
        status: SharedStatus,
        connect_timeout: Duration,
        ping_timeout: Duration,
    ) -> Self {
        Self { instructions, events, status, connect_timeout, ping_timeout }
    }

    pub fn events(&self) -> &EventBus<ConnectionEvent> {
        &self.events
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The server-assigned id of the current session, if connected.
    pub fn connection_id(&self) -> Option<String> {
        self.status.lock().unwrap().connection_id.clone()
    }

    pub fn connection_details(&self) -> Option<ConnectionDetails> {
        self.status.lock().unwrap().details.clone()
    }

    /// Opens the streaming session and resolves once the server confirms it.
    #[tracing::instrument(skip(self), err)]
    pub async fn connect(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.instruct(Instruction::Connect { reply })?;
        match tokio::time::timeout(self.connect_timeout, rx).await {
            Err(_) => Err(Error::Timeout(self.connect_timeout)),
            Ok(Err(_)) => Err(Error::DeadChannel),
            Ok(Ok(result)) => result,
        }
    }

    /// Closes the streaming session.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.instruct(Instruction::Disconnect { reply })?;
        rx.await.map_err(|_| Error::DeadChannel)?
    }

    /// Round-trip time of a protocol-level ping.
    pub async fn ping(&self) -> Result<Duration, Error> {
        let (reply, rx) = oneshot::channel();
        self.instruct(Instruction::Ping { reply })?;
        match tokio::time::timeout(self.ping_timeout, rx).await {
            Err(_) => Err(Error::Timeout(self.ping_timeout)),
            Ok(Err(_)) => Err(Error::DeadChannel),
            Ok(Ok(result)) => result,
        }
    }

    pub(crate) fn instruct(&self, instruction: Instruction) -> Result<(), Error> {
        self.instructions.unbounded_send(instruction).map_err(|_| Error::DeadChannel)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("state", &self.state()).finish_non_exhaustive()
    }
}

enum Flow {
    Continue,
    Exit,
}

pub(crate) struct ConnectionManager {
    options: Arc<ClientOptions>,
    auth: AuthManager,
    instructions: mpsc::UnboundedReceiver<Instruction>,
    /// Clone of the frontend sender, used by watchdog timers.
    instruction_tx: mpsc::UnboundedSender<Instruction>,
    backend: Option<BackendHandle>,
    status: SharedStatus,
    events: Arc<EventBus<ConnectionEvent>>,
    channels: HashMap<String, ChannelState>,
    buses: SharedBuses,
    connect_waiters: Vec<ReplySender>,
    ping_waiters: VecDeque<(Instant, oneshot::Sender<Result<Duration, Error>>)>,
    cancel: CancellationToken,
    pending_reconnect: bool,
    teardown: bool,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        options: Arc<ClientOptions>,
        auth: AuthManager,
        instructions: mpsc::UnboundedReceiver<Instruction>,
        instruction_tx: mpsc::UnboundedSender<Instruction>,
        events: Arc<EventBus<ConnectionEvent>>,
        status: SharedStatus,
        buses: SharedBuses,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            auth,
            instructions,
            instruction_tx,
            backend: None,
            status,
            events,
            channels: HashMap::new(),
            buses,
            connect_waiters: Vec::new(),
            ping_waiters: VecDeque::new(),
            cancel,
            pending_reconnect: false,
            teardown: false,
        }
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        self.events.emit(&ConnectionEvent::Initialized);
        loop {
            if self.pending_reconnect {
                self.pending_reconnect = false;
                self.reconnect_with_backoff().await;
            }
            let flow = match self.backend.take() {
                Some(backend) => self.run_session(backend).await,
                None => match self.instructions.next().await {
                    Some(instruction) => self.handle_instruction(instruction, None).await,
                    None => Flow::Exit,
                },
            };
            if matches!(flow, Flow::Exit) {
                break;
            }
        }
        if let Some(backend) = self.backend.take() {
            backend.shutdown();
        }
        debug!("connection manager stopped");
    }

    /// Drives one live backend until it is lost, torn down, or the frontends
    /// go away.
    async fn run_session(&mut self, mut backend: BackendHandle) -> Flow {
        let link = backend.link.clone();
        loop {
            select_biased! {
                item = backend.frames.next() => match item {
                    Some(inbound) => {
                        self.handle_inbound(inbound, &link);
                        if self.teardown {
                            self.teardown = false;
                            backend.shutdown();
                            return Flow::Continue;
                        }
                    }
                    None => {
                        self.connection_lost();
                        return Flow::Continue;
                    }
                },
                _ = &mut backend.error => {
                    self.connection_lost();
                    return Flow::Continue;
                },
                instruction = self.instructions.next() => match instruction {
                    Some(instruction) => {
                        let flow = self.handle_instruction(instruction, Some(&link)).await;
                        if self.teardown {
                            self.teardown = false;
                            backend.shutdown();
                            return flow;
                        }
                        if matches!(flow, Flow::Exit) {
                            backend.shutdown();
                            return Flow::Exit;
                        }
                    }
                    None => {
                        backend.shutdown();
                        return Flow::Exit;
                    }
                },
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.status.lock().unwrap().state == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.lock().unwrap().state = state;
    }

    fn handle_inbound(&mut self, inbound: Inbound, link: &FrameSink) {
        match inbound {
            Inbound::Frame(frame) => self.handle_frame(frame, link),
            Inbound::ParseError(err) => {
                // malformed frames never kill the session
                self.events.emit(&ConnectionEvent::Failed(ErrorInfo::local(
                    CODE_PARSE_FAILURE,
                    format!("failed to parse inbound frame: {err}"),
                )));
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, link: &FrameSink) {
        trace!(%frame, "inbound");
        match frame {
            Frame::Connected { connection_id, connection_details } => {
                info!(connection_id, "session established");
                {
                    let mut status = self.status.lock().unwrap();
                    status.state = ConnectionState::Connected;
                    status.connection_id = Some(connection_id.clone());
                    status.details = connection_details.clone();
                }
                if let Some(alias) =
                    connection_details.as_ref().and_then(|details| details.alias.as_ref())
                {
                    self.auth.set_client_alias(alias.clone());
                }
                self.events
                    .emit(&ConnectionEvent::Connected { connection_id, connection_details });
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                if self.options.auto_resubscribe {
                    self.resubscribe_all(link);
                }
            }
            Frame::Disconnected { reason, code } => {
                warn!(?reason, ?code, "server closed the session");
                self.set_state(ConnectionState::Disconnected);
                self.events.emit(&ConnectionEvent::Disconnected { reason, code });
                self.pending_reconnect = self.options.auto_reconnect;
                self.teardown = true;
            }
            // PONG is inbound-only on this protocol, so a server liveness
            // probe is answered by echoing the PING
            Frame::Ping { timestamp } => {
                let _ = link.send(Frame::Ping { timestamp });
            }
            Frame::Pong { .. } => {
                if let Some((sent_at, reply)) = self.ping_waiters.pop_front() {
                    let _ = reply.send(Ok(sent_at.elapsed()));
                }
            }
            Frame::Error { channel: Some(channel), error } => {
                if let Some(state) = self.channels.get_mut(&channel) {
                    state.handle_frame(Some(link), Frame::Error { channel: Some(channel), error });
                } else {
                    trace!(channel, "error for unattached channel");
                }
            }
            Frame::Error { channel: None, error } => {
                error!(%error, "connection error");
                self.events.emit(&ConnectionEvent::Failed(error.clone()));
                if !self.is_connected() {
                    // handshake rejection
                    for waiter in self.connect_waiters.drain(..) {
                        let _ = waiter.send(Err(Error::Protocol(error.clone())));
                    }
                    self.set_state(ConnectionState::Failed);
                    self.teardown = true;
                }
            }
            frame => match frame.channel().map(str::to_owned) {
                Some(channel) => {
                    if let Some(state) = self.channels.get_mut(&channel) {
                        state.handle_frame(Some(link), frame);
                    } else {
                        trace!(channel, frame = %frame, "frame for unattached channel");
                    }
                }
                None => trace!(frame = %frame, "ignoring frame"),
            },
        }
    }

    async fn handle_instruction(
        &mut self,
        instruction: Instruction,
        link: Option<&FrameSink>,
    ) -> Flow {
        match instruction {
            Instruction::Connect { reply } => {
                if self.is_connected() {
                    let _ = reply.send(Ok(()));
                    return Flow::Continue;
                }
                self.connect_waiters.push(reply);
                if link.is_none() && self.backend.is_none() {
                    if let Err(err) = self.open_session().await {
                        let message = err.to_string();
                        error!(err = %message, "failed to open session");
                        self.set_state(ConnectionState::Failed);
                        self.events.emit(&ConnectionEvent::Failed(ErrorInfo::local(
                            CODE_CONNECT_FAILED,
                            message.clone(),
                        )));
                        for waiter in self.connect_waiters.drain(..) {
                            let _ = waiter.send(Err(Error::ConnectionFailed(message.clone())));
                        }
                    }
                }
            }
            Instruction::Disconnect { reply } => {
                let Some(link) = link else {
                    let _ = reply.send(Ok(()));
                    return Flow::Continue;
                };
                self.set_state(ConnectionState::Closing);
                self.events.emit(&ConnectionEvent::Closing);
                let _ = link.send(Frame::Disconnect);
                self.teardown = true;
                self.set_state(ConnectionState::Closed);
                self.events.emit(&ConnectionEvent::Closed);
                let _ = reply.send(Ok(()));
            }
            Instruction::Ping { reply } => match link {
                Some(link) if self.is_connected() => {
                    match link.send(Frame::Ping { timestamp: now_ms() }) {
                        Ok(()) => self.ping_waiters.push_back((Instant::now(), reply)),
                        Err(err) => {
                            let _ = reply.send(Err(err));
                        }
                    }
                }
                _ => {
                    let _ = reply.send(Err(Error::NotConnected));
                }
            },
            Instruction::Attach { channel } => {
                self.state_for(&channel).attach();
            }
            Instruction::Release { channel } => {
                if let Some(state) = self.channels.get_mut(&channel) {
                    if state.release() {
                        self.channels.remove(&channel);
                        self.buses.lock().unwrap().remove(&channel);
                    }
                }
            }
            Instruction::Subscribe { channel, event, handler, handler_id, reply } => {
                let link = self.link_if_connected(link);
                self.state_for(&channel).subscribe(link, event, handler, handler_id, reply);
            }
            Instruction::Unsubscribe { channel, scope, reply } => {
                let link = self.link_if_connected(link);
                self.state_for(&channel).unsubscribe(link, scope, reply);
            }
            Instruction::Publish { channel, messages, reply } => {
                let link = self.link_if_connected(link);
                self.state_for(&channel).publish(link, messages, reply);
            }
            Instruction::Pause { channel, buffer, reply } => {
                self.state_for(&channel).pause(buffer);
                let _ = reply.send(Ok(()));
            }
            Instruction::Resume { channel, reply } => {
                let delivered = self.state_for(&channel).resume();
                let _ = reply.send(Ok(delivered));
            }
            Instruction::ResubscribeCheck => {
                let link = self.link_if_connected(link);
                for state in self.channels.values_mut() {
                    state.check_resubscribe(link);
                }
            }
            Instruction::Reset { cancel, reply } => {
                debug!("resetting instance");
                for state in self.channels.values_mut() {
                    state.cancel();
                }
                self.channels.clear();
                // buses stay so existing handles keep observing events
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(Error::Cancelled));
                }
                for (_, waiter) in self.ping_waiters.drain(..) {
                    let _ = waiter.send(Err(Error::Cancelled));
                }
                self.cancel = cancel;
                self.pending_reconnect = false;
                if link.is_some() {
                    self.teardown = true;
                }
                {
                    let mut status = self.status.lock().unwrap();
                    status.state = ConnectionState::Initialized;
                    status.connection_id = None;
                    status.details = None;
                }
                let _ = reply.send(());
            }
        }
        Flow::Continue
    }

    fn link_if_connected<'a>(&self, link: Option<&'a FrameSink>) -> Option<&'a FrameSink> {
        if self.is_connected() {
            link
        } else {
            None
        }
    }

    fn state_for(&mut self, name: &str) -> &mut ChannelState {
        let buses = &self.buses;
        self.channels.entry(name.to_string()).or_insert_with(|| {
            let bus = buses.lock().unwrap().entry(name.to_string()).or_default().clone();
            ChannelState::new(name.to_string(), bus)
        })
    }

    async fn open_session(&mut self) -> Result<(), Error> {
        self.set_state(ConnectionState::Connecting);
        self.events.emit(&ConnectionEvent::Connecting);

        let request = self.connect_request().await?;
        let connect = SocketBackend::connect(request);
        let (socket, handle) =
            match tokio::time::timeout(self.options.connect_timeout, connect).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::Timeout(self.options.connect_timeout)),
            };
        socket.spawn();
        self.events.emit(&ConnectionEvent::Opened);

        handle.link.send(Frame::Connect)?;
        self.backend = Some(handle);
        Ok(())
    }

    async fn connect_request(&self) -> Result<ConnectRequest, Error> {
        let url = self.options.ws_url();
        match self.auth.connect_auth().await? {
            ConnectAuth::QueryToken(token) => {
                let mut url = Url::parse(&url)
                    .map_err(|e| Error::Config(format!("invalid ws endpoint: {e}")))?;
                url.query_pairs_mut().append_pair("access_token", &token);
                Ok(ConnectRequest { url: url.to_string(), auth_header: None })
            }
            ConnectAuth::Header(value) => Ok(ConnectRequest { url, auth_header: Some(value) }),
        }
    }

    fn connection_lost(&mut self) {
        warn!("streaming link lost");
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(&ConnectionEvent::Disconnected { reason: None, code: None });
        self.pending_reconnect = self.options.auto_reconnect;
    }

    async fn reconnect_with_backoff(&mut self) {
        let mut delay = self.options.reconnect_initial_delay;
        for attempt in 1..=self.options.max_reconnect_attempts {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            info!(attempt, "reconnecting");
            match self.open_session().await {
                Ok(()) => return,
                Err(err) => {
                    warn!(attempt, err = %err, "reconnect attempt failed");
                    delay = self.options.next_reconnect_delay(delay);
                }
            }
        }
        error!("reconnect attempts exhausted");
        self.set_state(ConnectionState::Failed);
        self.events.emit(&ConnectionEvent::Failed(ErrorInfo::local(
            CODE_RECONNECT_EXHAUSTED,
            "reconnect attempts exhausted",
        )));
    }

    /// Replays the subscription of every channel that still has handlers.
    /// Per-channel failures surface on that channel's FAILED event and never
    /// abort the sweep.
    fn resubscribe_all(&mut self, link: &FrameSink) {
        let mut swept = 0usize;
        for (name, state) in self.channels.iter_mut() {
            if !state.has_handlers() {
                continue;
            }
            match state.resubscribe(link) {
                Ok(()) => swept += 1,
                Err(err) => {
                    warn!(channel = %name, err = %err, "resubscription failed");
                    if let Some(bus) = self.buses.lock().unwrap().get(name) {
                        bus.emit(&ChannelEvent::Failed(ErrorInfo::local(
                            CODE_CONNECT_FAILED,
                            format!("resubscription failed: {err}"),
                        )));
                    }
                }
            }
        }
        if swept > 0 {
            debug!(count = swept, "resubscription sweep dispatched");
            let tx = self.instruction_tx.clone();
            let interval = self.options.resubscribe_interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                let _ = tx.unbounded_send(Instruction::ResubscribeCheck);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{Channels, SubscribeOptions},
        transport::{
            http::HttpRequester,
            ws::testing::{self, TestLink},
        },
    };
    use qpub_core::protocol::{MessageFrame, MessagePayload};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        connection: Connection,
        channels: Channels,
        far: TestLink,
    }

    fn harness() -> Harness {
        let options = Arc::new(ClientOptions {
            auto_connect: false,
            auto_reconnect: false,
            ..ClientOptions::from_key("app.k1:secret")
        });
        let http = HttpRequester::new(options.http_url().unwrap());
        let auth =
            AuthManager::new(options.clone(), http, CancellationToken::new()).unwrap();

        let (tx, rx) = mpsc::unbounded();
        let events = Arc::new(EventBus::new());
        let status: SharedStatus = Default::default();
        let buses: SharedBuses = Default::default();
        let (backend, far) = testing::pair();

        let mut manager = ConnectionManager::new(
            options.clone(),
            auth,
            rx,
            tx.clone(),
            events.clone(),
            status.clone(),
            buses.clone(),
            CancellationToken::new(),
        );
        manager.backend = Some(backend);
        manager.spawn();

        let connection = Connection::new(
            tx.clone(),
            events,
            status,
            options.connect_timeout,
            options.ping_timeout,
        );
        let channels = Channels::new(tx, buses, options.operation_timeout);
        Harness { connection, channels, far }
    }

    /// Lets the manager task drain everything queued so far.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn connected_frame() -> Frame {
        Frame::Connected { connection_id: "conn-1".into(), connection_details: None }
    }

    async fn connected_harness() -> Harness {
        let harness = harness();
        harness.far.frame(connected_frame());
        settle().await;
        assert!(harness.connection.is_connected());
        harness
    }

    fn subscribed_frame(channel: &str) -> Frame {
        Frame::Subscribed { channel: channel.into(), subscription_id: None }
    }

    fn message_frame(channel: &str, id: &str, payloads: Vec<MessagePayload>) -> Frame {
        Frame::Message(MessageFrame {
            id: id.into(),
            timestamp: "t".into(),
            channel: channel.into(),
            messages: payloads,
        })
    }

    #[tokio::test]
    async fn connected_frame_establishes_the_session() {
        let mut harness = connected_harness().await;
        assert_eq!(harness.connection.connection_id().as_deref(), Some("conn-1"));
        assert!(harness.far.next_frame().is_none());
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_before_ack_serializes() {
        let mut harness = connected_harness().await;
        let channel = harness.channels.get("c");

        let subscriber = channel.clone();
        let subscribe = tokio::spawn(async move { subscriber.subscribe(|_| {}).await });
        settle().await;

        let unsubscriber = channel.clone();
        let unsubscribe = tokio::spawn(async move { unsubscriber.unsubscribe().await });
        settle().await;

        // exactly one SUBSCRIBE on the wire, nothing else yet
        assert!(matches!(harness.far.next_frame(), Some(Frame::Subscribe { channel }) if channel == "c"));
        assert!(harness.far.next_frame().is_none());

        harness.far.frame(subscribed_frame("c"));
        settle().await;
        subscribe.await.unwrap().unwrap();

        // the ack released exactly the queued unsubscribe
        assert!(matches!(harness.far.next_frame(), Some(Frame::Unsubscribe { channel }) if channel == "c"));

        harness.far.frame(Frame::Unsubscribed { channel: "c".into(), subscription_id: None });
        settle().await;
        unsubscribe.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn batched_messages_reach_the_callback_in_order() {
        let mut harness = connected_harness().await;
        let channel = harness.channels.get("c");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let subscriber = channel.clone();
        let subscribe = tokio::spawn(async move {
            subscriber.subscribe(move |m| seen2.lock().unwrap().push(m.id.clone())).await
        });
        settle().await;
        harness.far.frame(subscribed_frame("c"));
        settle().await;
        subscribe.await.unwrap().unwrap();

        harness.far.frame(message_frame(
            "c",
            "m1",
            vec![
                MessagePayload::from_data(1),
                MessagePayload::from_data(2),
                MessagePayload::from_data(3),
            ],
        ));
        settle().await;

        assert_eq!(*seen.lock().unwrap(), ["m1-0", "m1-1", "m1-2"]);
    }

    #[tokio::test]
    async fn pause_buffers_until_resume() {
        let mut harness = connected_harness().await;
        let channel = harness.channels.get("c");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let subscriber = channel.clone();
        let subscribe = tokio::spawn(async move {
            subscriber.subscribe(move |m| seen2.lock().unwrap().push(m.data.clone())).await
        });
        settle().await;
        harness.far.frame(subscribed_frame("c"));
        settle().await;
        subscribe.await.unwrap().unwrap();

        let resumed = Arc::new(AtomicUsize::new(0));
        let resumed2 = resumed.clone();
        channel.events().on(move |event| {
            if let ChannelEvent::Resumed { delivered } = event {
                resumed2.store(*delivered, Ordering::SeqCst);
            }
        });

        channel.pause().await.unwrap();
        harness.far.frame(message_frame("c", "a", vec![MessagePayload::from_data("A")]));
        harness.far.frame(message_frame(
            "c",
            "b",
            vec![MessagePayload::from_data("B"), MessagePayload::from_data("C")],
        ));
        settle().await;
        assert!(seen.lock().unwrap().is_empty());

        let delivered = channel.resume().await.unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(resumed.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock().unwrap(), [json!("A"), json!("B"), json!("C")]);
    }

    #[tokio::test]
    async fn a_second_connected_frame_triggers_one_resubscribe_per_channel() {
        let mut harness = connected_harness().await;
        for name in ["a", "b"] {
            let channel = harness.channels.get(name);
            let subscribe = tokio::spawn(async move { channel.subscribe(|_| {}).await });
            settle().await;
            harness.far.frame(subscribed_frame(name));
            settle().await;
            subscribe.await.unwrap().unwrap();
        }
        // drain the original SUBSCRIBE frames
        while harness.far.next_frame().is_some() {}

        // the server re-established the session
        harness.far.frame(connected_frame());
        settle().await;

        let mut resubscribed = Vec::new();
        while let Some(frame) = harness.far.next_frame() {
            match frame {
                Frame::Subscribe { channel } => resubscribed.push(channel),
                other => panic!("unexpected frame {other}"),
            }
        }
        resubscribed.sort();
        assert_eq!(resubscribed, ["a", "b"], "one SUBSCRIBE each, no duplicates");
    }

    #[tokio::test]
    async fn reconnect_cancels_a_pending_unsubscribe_and_replays_the_subscription() {
        let mut harness = connected_harness().await;
        let channel = harness.channels.get("c");

        let subscriber = channel.clone();
        let subscribe = tokio::spawn(async move { subscriber.subscribe(|_| {}).await });
        settle().await;
        harness.far.frame(subscribed_frame("c"));
        settle().await;
        subscribe.await.unwrap().unwrap();
        while harness.far.next_frame().is_some() {}

        let unsubscriber = channel.clone();
        let unsubscribe = tokio::spawn(async move { unsubscriber.unsubscribe().await });
        settle().await;
        assert!(matches!(harness.far.next_frame(), Some(Frame::Unsubscribe { .. })));

        // the session is re-established before the UNSUBSCRIBED ack arrives
        harness.far.frame(connected_frame());
        settle().await;

        assert!(
            matches!(unsubscribe.await.unwrap(), Err(Error::Cancelled)),
            "the discarded unsubscribe fails fast instead of timing out"
        );
        assert!(
            matches!(harness.far.next_frame(), Some(Frame::Subscribe { channel }) if channel == "c"),
            "the sweep replays the still-attached handler"
        );
    }

    #[tokio::test]
    async fn resubscribe_watchdog_fails_the_replay_and_frees_the_queue() {
        let mut harness = connected_harness().await;
        let channel = harness.channels.get("c");

        let subscriber = channel.clone();
        let subscribe = tokio::spawn(async move { subscriber.subscribe(|_| {}).await });
        settle().await;
        harness.far.frame(subscribed_frame("c"));
        settle().await;
        subscribe.await.unwrap().unwrap();

        // a re-established session sweeps the channel; the replay goes
        // unacknowledged
        harness.far.frame(connected_frame());
        settle().await;
        while harness.far.next_frame().is_some() {}

        let failures = Arc::new(AtomicUsize::new(0));
        let failures2 = failures.clone();
        channel.events().on(move |event| {
            if matches!(event, ChannelEvent::Failed(_)) {
                failures2.fetch_add(1, Ordering::SeqCst);
            }
        });

        // queued behind the unacknowledged replay
        let unsubscriber = channel.clone();
        let unsubscribe = tokio::spawn(async move { unsubscriber.unsubscribe().await });
        settle().await;
        assert!(harness.far.next_frame().is_none());

        harness.connection.instruct(Instruction::ResubscribeCheck).unwrap();
        settle().await;

        assert_eq!(failures.load(Ordering::SeqCst), 1, "the timed-out replay is reported");
        unsubscribe.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_times_out_without_an_ack() {
        let harness = connected_harness().await;
        let channel = harness.channels.get("c");

        let options = SubscribeOptions {
            event: None,
            timeout: Some(Duration::from_millis(50)),
        };
        let started = tokio::time::Instant::now();
        let result = channel.subscribe_with(options, |_| {}).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn publish_fails_fast_when_disconnected() {
        let harness = harness();
        let channel = harness.channels.get("c");
        let result = channel.publish_data(json!({"x": 1})).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn publish_resolves_without_waiting_for_acks() {
        let mut harness = connected_harness().await;
        let channel = harness.channels.get("c");

        channel.publish_data(json!(1)).await.unwrap();
        assert!(matches!(harness.far.next_frame(), Some(Frame::Publish { .. })));
    }

    #[tokio::test]
    async fn ping_measures_the_round_trip() {
        let mut harness = connected_harness().await;
        let connection = harness.connection.clone();
        let ping = tokio::spawn(async move { connection.ping().await });
        settle().await;

        match harness.far.next_frame() {
            Some(Frame::Ping { timestamp }) => {
                harness.far.frame(Frame::Pong { timestamp });
            }
            other => panic!("expected PING, got {other:?}"),
        }
        settle().await;
        ping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn server_disconnect_emits_and_tears_down() {
        let harness = connected_harness().await;
        let disconnects = Arc::new(AtomicUsize::new(0));
        let disconnects2 = disconnects.clone();
        harness.connection.events().on(move |event| {
            if matches!(event, ConnectionEvent::Disconnected { .. }) {
                disconnects2.fetch_add(1, Ordering::SeqCst);
            }
        });

        harness.far.frame(Frame::Disconnected { reason: Some("maintenance".into()), code: None });
        settle().await;

        assert!(!harness.connection.is_connected());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_rejects_in_flight_and_queued_operations() {
        let mut harness = connected_harness().await;
        let channel = harness.channels.get("c");

        let subscriber = channel.clone();
        let subscribe = tokio::spawn(async move { subscriber.subscribe(|_| {}).await });
        settle().await;
        assert!(matches!(harness.far.next_frame(), Some(Frame::Subscribe { .. })));

        let unsubscriber = channel.clone();
        let unsubscribe = tokio::spawn(async move { unsubscriber.unsubscribe().await });
        settle().await;

        let (reply, rx) = oneshot::channel();
        harness
            .connection
            .instruct(Instruction::Reset { cancel: CancellationToken::new(), reply })
            .unwrap();
        settle().await;
        rx.await.unwrap();

        assert!(matches!(subscribe.await.unwrap(), Err(Error::Cancelled)));
        assert!(matches!(unsubscribe.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(harness.connection.state(), ConnectionState::Initialized);

        // a second reset with no intervening work is a no-op
        let (reply, rx) = oneshot::channel();
        harness
            .connection
            .instruct(Instruction::Reset { cancel: CancellationToken::new(), reply })
            .unwrap();
        rx.await.unwrap();
        assert_eq!(harness.connection.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn handshake_error_rejects_the_connect_call() {
        let harness = harness();
        let connection = harness.connection.clone();
        let connect = tokio::spawn(async move { connection.connect().await });
        settle().await;

        harness.far.frame(Frame::Error {
            channel: None,
            error: ErrorInfo::local(40100, "unauthorized"),
        });
        settle().await;

        assert!(matches!(connect.await.unwrap(), Err(Error::Protocol(info)) if info.code == 40100));
        assert_eq!(harness.connection.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn released_channels_without_handlers_are_dropped() {
        let harness = connected_harness().await;
        let _channel = harness.channels.get("ephemeral");
        harness.channels.release("ephemeral");
        settle().await;

        // a fresh get() works and the manager accepted both instructions
        let channel = harness.channels.get("ephemeral");
        channel.publish_data(json!(1)).await.unwrap();
    }
}
