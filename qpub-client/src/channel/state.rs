//! Per-channel protocol state.
//!
//! One `ChannelState` lives inside the connection manager task for every
//! attached channel. All methods are synchronous; the manager is the only
//! task that ever touches them, which is what makes the pending-flag and
//! queue invariants hold without locks.
//!
//! Control operations serialize through a FIFO queue: while a SUBSCRIBE or
//! UNSUBSCRIBE is awaiting its acknowledgement, newly arriving catch-all or
//! full-channel operations queue behind it, and exactly one queued operation
//! is drained per acknowledgement. Event-scoped subscribes bypass the queue
//! while the channel is subscribed or subscribing, since they only mutate
//! the local handler map.

use crate::{
    channel::{ChannelEvent, HandlerId, MessageHandler},
    error::Error,
    transport::ws::FrameSink,
};
use futures_channel::oneshot;
use qpub_core::{
    events::EventBus,
    message::Message,
    protocol::{ErrorInfo, Frame, MessageFrame, MessagePayload},
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tracing::{debug, trace};

pub(crate) type ReplySender = oneshot::Sender<Result<(), Error>>;

/// Error code attached to locally raised channel failures.
const CODE_NOT_CONNECTED: i64 = 80003;
const CODE_RESUBSCRIBE_TIMED_OUT: i64 = 91200;

#[derive(Debug)]
pub(crate) enum UnsubscribeScope {
    /// Detach everything and leave the channel server-side.
    Channel,
    /// Remove every handler registered for one event.
    Event(String),
    /// Remove a single handler.
    Handler(String, HandlerId),
}

pub(crate) enum ChannelOp {
    Subscribe {
        event: Option<String>,
        handler: MessageHandler,
        handler_id: HandlerId,
        reply: ReplySender,
    },
    Unsubscribe {
        scope: UnsubscribeScope,
        reply: ReplySender,
    },
}

struct PauseState {
    /// `Some` buffers delivered messages for replay on resume; `None` drops
    /// them.
    buffer: Option<VecDeque<Message>>,
}

pub(crate) struct ChannelState {
    name: String,
    refs: usize,
    subscribed: bool,
    pending_subscribe: bool,
    pending_unsubscribe: bool,
    catch_all: Option<MessageHandler>,
    event_handlers: HashMap<String, Vec<(HandlerId, MessageHandler)>>,
    queue: VecDeque<ChannelOp>,
    pause: Option<PauseState>,
    sub_waiters: Vec<ReplySender>,
    unsub_waiters: Vec<ReplySender>,
    events: Arc<EventBus<ChannelEvent>>,
}

impl ChannelState {
    pub(crate) fn new(name: String, events: Arc<EventBus<ChannelEvent>>) -> Self {
        Self {
            name,
            refs: 0,
            subscribed: false,
            pending_subscribe: false,
            pending_unsubscribe: false,
            catch_all: None,
            event_handlers: HashMap::new(),
            queue: VecDeque::new(),
            pause: None,
            sub_waiters: Vec::new(),
            unsub_waiters: Vec::new(),
            events,
        }
    }

    pub(crate) fn attach(&mut self) {
        self.refs += 1;
    }

    /// Drops a reference. Returns true when the state can be discarded: no
    /// references remain and the channel never kept handlers worth
    /// resubscribing.
    pub(crate) fn release(&mut self) -> bool {
        self.refs = self.refs.saturating_sub(1);
        self.refs == 0 && !self.has_handlers()
    }

    pub(crate) fn has_handlers(&self) -> bool {
        self.catch_all.is_some() || !self.event_handlers.is_empty()
    }

    fn contended(&self) -> bool {
        self.pending_subscribe || self.pending_unsubscribe
    }

    // -- subscribe ---------------------------------------------------------

    pub(crate) fn subscribe(
        &mut self,
        link: Option<&FrameSink>,
        event: Option<String>,
        handler: MessageHandler,
        handler_id: HandlerId,
        reply: ReplySender,
    ) {
        if let Some(event_name) = &event {
            // Event-scoped adds bypass the queue while the channel is
            // subscribed or subscribing, provided no unsubscribe is in
            // flight: they only touch the handler map.
            if !self.pending_unsubscribe && (self.subscribed || self.pending_subscribe) {
                self.install_event_handler(event_name.clone(), handler_id, handler);
                if self.subscribed {
                    let _ = reply.send(Ok(()));
                } else {
                    self.sub_waiters.push(reply);
                }
                return;
            }
        }

        if self.contended() {
            trace!(channel = %self.name, "queueing subscribe behind in-flight operation");
            self.queue.push_back(ChannelOp::Subscribe { event, handler, handler_id, reply });
            return;
        }

        self.start_subscribe(link, event, handler, handler_id, reply);
    }

    fn start_subscribe(
        &mut self,
        link: Option<&FrameSink>,
        event: Option<String>,
        handler: MessageHandler,
        handler_id: HandlerId,
        reply: ReplySender,
    ) {
        match event {
            // a catch-all replaces any event routing wholesale
            None => {
                self.catch_all = Some(handler);
                self.event_handlers.clear();
            }
            Some(event_name) => self.install_event_handler(event_name, handler_id, handler),
        }

        if self.subscribed {
            // handler swap on an active channel; no network round-trip
            let _ = reply.send(Ok(()));
            return;
        }

        let Some(link) = link else {
            let _ = reply.send(Err(Error::NotConnected));
            return;
        };

        self.events.emit(&ChannelEvent::Subscribing);
        if let Err(e) = link.send(Frame::Subscribe { channel: self.name.clone() }) {
            let _ = reply.send(Err(e));
            return;
        }
        self.pending_subscribe = true;
        self.sub_waiters.push(reply);
    }

    fn install_event_handler(
        &mut self,
        event: String,
        handler_id: HandlerId,
        handler: MessageHandler,
    ) {
        // an event-scoped subscription replaces a catch-all with routing by
        // event name
        self.catch_all = None;
        self.event_handlers.entry(event).or_default().push((handler_id, handler));
    }

    // -- unsubscribe -------------------------------------------------------

    pub(crate) fn unsubscribe(
        &mut self,
        link: Option<&FrameSink>,
        scope: UnsubscribeScope,
        reply: ReplySender,
    ) {
        match scope {
            UnsubscribeScope::Channel => self.unsubscribe_channel(link, reply),
            UnsubscribeScope::Event(event) => {
                self.event_handlers.remove(&event);
                self.finish_scoped_unsubscribe(link, reply);
            }
            UnsubscribeScope::Handler(event, handler_id) => {
                if let Some(handlers) = self.event_handlers.get_mut(&event) {
                    handlers.retain(|(id, _)| *id != handler_id);
                    if handlers.is_empty() {
                        self.event_handlers.remove(&event);
                    }
                }
                self.finish_scoped_unsubscribe(link, reply);
            }
        }
    }

    /// An event-scoped removal that empties the handler set escalates to a
    /// full unsubscribe; otherwise it resolves immediately.
    fn finish_scoped_unsubscribe(&mut self, link: Option<&FrameSink>, reply: ReplySender) {
        if self.subscribed && !self.has_handlers() {
            self.unsubscribe_channel(link, reply);
        } else {
            let _ = reply.send(Ok(()));
        }
    }

    fn unsubscribe_channel(&mut self, link: Option<&FrameSink>, reply: ReplySender) {
        if self.contended() {
            trace!(channel = %self.name, "queueing unsubscribe behind in-flight operation");
            self.queue
                .push_back(ChannelOp::Unsubscribe { scope: UnsubscribeScope::Channel, reply });
            return;
        }

        if !self.subscribed {
            self.catch_all = None;
            self.event_handlers.clear();
            let _ = reply.send(Ok(()));
            return;
        }

        let Some(link) = link else {
            // Transport is down: detach locally but keep the handlers so an
            // auto-resubscribe can restore them, and skip the frame.
            self.subscribed = false;
            self.events.emit(&ChannelEvent::Unsubscribed);
            let _ = reply.send(Ok(()));
            return;
        };

        self.events.emit(&ChannelEvent::Unsubscribing);
        if let Err(e) = link.send(Frame::Unsubscribe { channel: self.name.clone() }) {
            let _ = reply.send(Err(e));
            return;
        }
        self.pending_unsubscribe = true;
        self.unsub_waiters.push(reply);
    }

    // -- publish -----------------------------------------------------------

    /// Fire-and-forget: resolves as soon as the frame is dispatched, never
    /// waits for PUBLISHED, and never touches the operation queue.
    pub(crate) fn publish(
        &self,
        link: Option<&FrameSink>,
        messages: Vec<MessagePayload>,
        reply: ReplySender,
    ) {
        let Some(link) = link else {
            self.events.emit(&ChannelEvent::Failed(ErrorInfo::local(
                CODE_NOT_CONNECTED,
                "publish requires an active connection",
            )));
            let _ = reply.send(Err(Error::NotConnected));
            return;
        };
        let result = link.send(Frame::Publish { channel: self.name.clone(), messages });
        let _ = reply.send(result);
    }

    // -- pause / resume ----------------------------------------------------

    /// A second pause without an intervening resume is a no-op; the original
    /// buffering policy stays in force.
    pub(crate) fn pause(&mut self, buffer: bool) {
        if self.pause.is_some() {
            return;
        }
        self.pause = Some(PauseState { buffer: buffer.then(VecDeque::new) });
    }

    /// Replays any buffered messages in arrival order and reports how many
    /// were delivered. Resuming an unpaused channel is a no-op.
    pub(crate) fn resume(&mut self) -> usize {
        let Some(paused) = self.pause.take() else { return 0 };
        let buffered = paused.buffer.unwrap_or_default();
        let delivered = buffered.len();
        for message in &buffered {
            self.dispatch(message);
        }
        self.events.emit(&ChannelEvent::Resumed { delivered });
        delivered
    }

    // -- inbound frames ----------------------------------------------------

    pub(crate) fn handle_frame(&mut self, link: Option<&FrameSink>, frame: Frame) {
        match frame {
            Frame::Subscribed { .. } => {
                debug!(channel = %self.name, "subscribed");
                self.subscribed = true;
                self.pending_subscribe = false;
                self.events.emit(&ChannelEvent::Subscribed);
                for waiter in self.sub_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.drain(link);
            }
            Frame::Unsubscribed { .. } => {
                debug!(channel = %self.name, "unsubscribed");
                self.subscribed = false;
                self.pending_unsubscribe = false;
                self.catch_all = None;
                self.event_handlers.clear();
                self.events.emit(&ChannelEvent::Unsubscribed);
                for waiter in self.unsub_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.drain(link);
            }
            Frame::Message(message) => self.deliver(&message),
            Frame::Error { error, .. } => {
                debug!(channel = %self.name, %error, "channel error");
                // Waiters learn of the failure here; the pending flags are
                // only cleared by the matching acknowledgement.
                self.events.emit(&ChannelEvent::Failed(error.clone()));
                for waiter in self.sub_waiters.drain(..).chain(self.unsub_waiters.drain(..)) {
                    let _ = waiter.send(Err(Error::Protocol(error.clone())));
                }
            }
            Frame::Published { .. } => {
                // publishes resolve on dispatch; the ack is informational
                trace!(channel = %self.name, "publish acknowledged");
            }
            other => trace!(channel = %self.name, frame = %other, "ignoring frame"),
        }
    }

    /// Releases queued operations now that nothing is in flight. Operations
    /// run in FIFO order; one that opens a new network round-trip re-blocks
    /// the queue until its acknowledgement, one that completes locally lets
    /// the next follow immediately.
    fn drain(&mut self, link: Option<&FrameSink>) {
        while !self.contended() {
            let Some(op) = self.queue.pop_front() else { return };
            match op {
                ChannelOp::Subscribe { event, handler, handler_id, reply } => {
                    self.start_subscribe(link, event, handler, handler_id, reply)
                }
                ChannelOp::Unsubscribe { scope, reply } => self.unsubscribe(link, scope, reply),
            }
        }
    }

    fn deliver(&mut self, frame: &MessageFrame) {
        let records = Message::expand(frame);
        if let Some(paused) = &mut self.pause {
            match &mut paused.buffer {
                Some(buffer) => buffer.extend(records),
                None => trace!(channel = %self.name, "paused without buffering; dropping messages"),
            }
            return;
        }
        for record in &records {
            self.dispatch(record);
        }
    }

    fn dispatch(&self, message: &Message) {
        if let Some(handler) = &self.catch_all {
            handler(message);
            return;
        }
        if let Some(event) = &message.event {
            if let Some(handlers) = self.event_handlers.get(event) {
                for (_, handler) in handlers {
                    handler(message);
                }
            }
        }
    }

    // -- resubscription ----------------------------------------------------

    /// Re-establishes the server-side subscription after a fresh session.
    /// Handlers stay in place; the flags are rebuilt from scratch and a
    /// single channel-level SUBSCRIBE replays all of them, since event
    /// filtering is purely client-side.
    pub(crate) fn resubscribe(&mut self, link: &FrameSink) -> Result<(), Error> {
        // An unsubscribe may still be awaiting its ack from the previous
        // session. That ack is never coming, and the handlers it was meant
        // to detach are about to be replayed: surface the discarded
        // operation to its waiters instead of leaving them to time out.
        if self.pending_unsubscribe {
            self.pending_unsubscribe = false;
            for waiter in self.unsub_waiters.drain(..) {
                let _ = waiter.send(Err(Error::Cancelled));
            }
        }
        self.subscribed = false;
        self.pending_subscribe = false;
        if !self.has_handlers() {
            return Ok(());
        }
        link.send(Frame::Subscribe { channel: self.name.clone() })?;
        self.pending_subscribe = true;
        Ok(())
    }

    /// Invoked by the resubscription watchdog: a sweep-initiated subscribe
    /// still unacknowledged (no user waiters) is flagged as failed so the
    /// channel does not hang in `Subscribing` forever. The failed replay
    /// will produce no acknowledgement, so any operations queued behind it
    /// are released here rather than stranded.
    pub(crate) fn check_resubscribe(&mut self, link: Option<&FrameSink>) {
        if self.pending_subscribe && self.sub_waiters.is_empty() {
            self.pending_subscribe = false;
            self.events.emit(&ChannelEvent::Failed(ErrorInfo::local(
                CODE_RESUBSCRIBE_TIMED_OUT,
                "resubscription was not acknowledged in time",
            )));
            self.drain(link);
        }
    }

    /// Rejects every queued operation and waiter with `Cancelled` and clears
    /// the in-flight flags. Used on reset.
    pub(crate) fn cancel(&mut self) {
        for op in self.queue.drain(..) {
            let reply = match op {
                ChannelOp::Subscribe { reply, .. } => reply,
                ChannelOp::Unsubscribe { reply, .. } => reply,
            };
            let _ = reply.send(Err(Error::Cancelled));
        }
        for waiter in self.sub_waiters.drain(..).chain(self.unsub_waiters.drain(..)) {
            let _ = waiter.send(Err(Error::Cancelled));
        }
        self.pending_subscribe = false;
        self.pending_unsubscribe = false;
        self.pause = None;
    }

    #[cfg(test)]
    pub(crate) fn pending_flags(&self) -> (bool, bool) {
        (self.pending_subscribe, self.pending_unsubscribe)
    }

    #[cfg(test)]
    pub(crate) fn is_subscribed(&self) -> bool {
        self.subscribed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ws::testing::{self, TestLink};
    use qpub_core::protocol::MessagePayload;
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        state: ChannelState,
        link: FrameSink,
        far: TestLink,
        events: Arc<EventBus<ChannelEvent>>,
    }

    fn fixture() -> Fixture {
        let (handle, far) = testing::pair();
        let events = Arc::new(EventBus::new());
        Fixture {
            state: ChannelState::new("c".into(), events.clone()),
            link: handle.link.clone(),
            far,
            events,
        }
    }

    fn noop_handler() -> MessageHandler {
        Arc::new(|_| {})
    }

    fn recording_handler() -> (MessageHandler, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handler: MessageHandler = Arc::new(move |m| seen2.lock().unwrap().push(m.clone()));
        (handler, seen)
    }

    fn reply() -> (ReplySender, oneshot::Receiver<Result<(), Error>>) {
        oneshot::channel()
    }

    fn take(rx: &mut oneshot::Receiver<Result<(), Error>>) -> Option<Result<(), Error>> {
        rx.try_recv().unwrap()
    }

    fn message_frame(id: &str, payloads: Vec<MessagePayload>) -> Frame {
        Frame::Message(MessageFrame {
            id: id.into(),
            timestamp: "t".into(),
            channel: "c".into(),
            messages: payloads,
        })
    }

    #[test]
    fn subscribe_sends_one_frame_and_resolves_on_ack() {
        let mut fx = fixture();
        let (tx, mut rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);

        assert!(matches!(fx.far.next_frame(), Some(Frame::Subscribe { channel }) if channel == "c"));
        assert_eq!(fx.state.pending_flags(), (true, false));
        assert!(take(&mut rx).is_none(), "unresolved until the ack arrives");

        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );
        assert!(matches!(take(&mut rx), Some(Ok(()))));
        assert!(fx.state.is_subscribed());
        assert_eq!(fx.state.pending_flags(), (false, false));
    }

    #[test]
    fn subscribe_without_transport_fails_synchronously() {
        let mut fx = fixture();
        let (tx, mut rx) = reply();
        fx.state.subscribe(None, None, noop_handler(), HandlerId(1), tx);
        assert!(matches!(take(&mut rx), Some(Err(Error::NotConnected))));
        assert_eq!(fx.state.pending_flags(), (false, false));
    }

    #[test]
    fn back_to_back_subscribe_unsubscribe_serialize_fifo() {
        let mut fx = fixture();
        let (sub_tx, mut sub_rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), sub_tx);

        let (unsub_tx, mut unsub_rx) = reply();
        fx.state.unsubscribe(Some(&fx.link), UnsubscribeScope::Channel, unsub_tx);

        // only the SUBSCRIBE is on the wire while its ack is pending
        assert!(matches!(fx.far.next_frame(), Some(Frame::Subscribe { .. })));
        assert!(fx.far.next_frame().is_none());

        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );
        assert!(matches!(take(&mut sub_rx), Some(Ok(()))));

        // the ack drained exactly one queued operation
        assert!(matches!(fx.far.next_frame(), Some(Frame::Unsubscribe { .. })));
        assert!(take(&mut unsub_rx).is_none());

        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Unsubscribed { channel: "c".into(), subscription_id: None },
        );
        assert!(matches!(take(&mut unsub_rx), Some(Ok(()))));
        assert!(!fx.state.is_subscribed());
    }

    #[test]
    fn pending_subscribe_and_unsubscribe_are_never_set_together() {
        let mut fx = fixture();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        let (tx, _rx2) = reply();
        fx.state.unsubscribe(Some(&fx.link), UnsubscribeScope::Channel, tx);

        let (ps, pu) = fx.state.pending_flags();
        assert!(!(ps && pu));

        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );
        let (ps, pu) = fx.state.pending_flags();
        assert!(!(ps && pu));
    }

    #[test]
    fn resubscribing_an_active_channel_swaps_the_handler_without_a_frame() {
        let mut fx = fixture();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        fx.far.next_frame();
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        let (handler, seen) = recording_handler();
        let (tx, mut rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, handler, HandlerId(2), tx);
        assert!(matches!(take(&mut rx), Some(Ok(()))), "no ack needed");
        assert!(fx.far.next_frame().is_none(), "no second SUBSCRIBE frame");

        fx.state
            .handle_frame(Some(&fx.link), message_frame("m", vec![MessagePayload::from_data(1)]));
        assert_eq!(seen.lock().unwrap().len(), 1, "latest handler receives messages");
    }

    #[test]
    fn batched_messages_fan_out_in_payload_order() {
        let mut fx = fixture();
        let (handler, seen) = recording_handler();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, handler, HandlerId(1), tx);
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        fx.state.handle_frame(
            Some(&fx.link),
            message_frame(
                "m1",
                vec![
                    MessagePayload::from_data(1),
                    MessagePayload::from_data(2),
                    MessagePayload::from_data(3),
                ],
            ),
        );

        let seen = seen.lock().unwrap();
        let ids: Vec<_> = seen.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1-0", "m1-1", "m1-2"]);
    }

    #[test]
    fn event_scoped_handlers_route_by_event_name() {
        let mut fx = fixture();
        let (tick_handler, ticks) = recording_handler();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), Some("tick".into()), tick_handler, HandlerId(1), tx);
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        fx.state.handle_frame(
            Some(&fx.link),
            message_frame(
                "m1",
                vec![
                    MessagePayload::with_event("tick", json!(1)),
                    MessagePayload::with_event("tock", json!(2)),
                    MessagePayload::from_data(json!(3)),
                ],
            ),
        );

        let ticks = ticks.lock().unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].data, json!(1));
    }

    #[test]
    fn catch_all_after_event_scoped_replaces_the_routing() {
        let mut fx = fixture();
        let (tick_handler, ticks) = recording_handler();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), Some("tick".into()), tick_handler, HandlerId(1), tx);
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        let (all_handler, all) = recording_handler();
        let (tx, mut rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, all_handler, HandlerId(2), tx);
        assert!(matches!(take(&mut rx), Some(Ok(()))));

        fx.state.handle_frame(
            Some(&fx.link),
            message_frame("m1", vec![MessagePayload::with_event("tock", json!(9))]),
        );
        assert!(ticks.lock().unwrap().is_empty());
        assert_eq!(all.lock().unwrap().len(), 1, "catch-all receives every event");
    }

    #[test]
    fn event_scoped_add_to_an_active_channel_bypasses_the_queue() {
        let mut fx = fixture();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        fx.far.next_frame();
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        let (tx, mut rx) = reply();
        fx.state.subscribe(Some(&fx.link), Some("tick".into()), noop_handler(), HandlerId(2), tx);
        assert!(matches!(take(&mut rx), Some(Ok(()))), "resolves without a round-trip");
        assert!(fx.far.next_frame().is_none());
    }

    #[test]
    fn removing_the_last_event_handler_escalates_to_full_unsubscribe() {
        let mut fx = fixture();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), Some("tick".into()), noop_handler(), HandlerId(1), tx);
        fx.far.next_frame();
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        let (tx, mut rx) = reply();
        fx.state
            .unsubscribe(Some(&fx.link), UnsubscribeScope::Handler("tick".into(), HandlerId(1)), tx);
        assert!(matches!(fx.far.next_frame(), Some(Frame::Unsubscribe { .. })));
        assert!(take(&mut rx).is_none(), "awaits the UNSUBSCRIBED ack");

        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Unsubscribed { channel: "c".into(), subscription_id: None },
        );
        assert!(matches!(take(&mut rx), Some(Ok(()))));
    }

    #[test]
    fn removing_one_of_two_event_handlers_resolves_immediately() {
        let mut fx = fixture();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), Some("tick".into()), noop_handler(), HandlerId(1), tx);
        fx.far.next_frame();
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );
        let (tx, _rx2) = reply();
        fx.state.subscribe(Some(&fx.link), Some("tock".into()), noop_handler(), HandlerId(2), tx);

        let (tx, mut rx) = reply();
        fx.state.unsubscribe(Some(&fx.link), UnsubscribeScope::Event("tick".into()), tx);
        assert!(matches!(take(&mut rx), Some(Ok(()))));
        assert!(fx.far.next_frame().is_none(), "still subscribed for tock");
    }

    #[test]
    fn unsubscribe_while_disconnected_detaches_locally_and_keeps_handlers() {
        let mut fx = fixture();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        fx.far.next_frame();
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        let (tx, mut rx) = reply();
        fx.state.unsubscribe(None, UnsubscribeScope::Channel, tx);
        assert!(matches!(take(&mut rx), Some(Ok(()))));
        assert!(!fx.state.is_subscribed());
        assert!(fx.state.has_handlers(), "handlers survive for auto-resubscribe");
        assert!(fx.far.next_frame().is_none(), "no frame while disconnected");
    }

    #[test]
    fn publish_is_fire_and_forget() {
        let mut fx = fixture();
        let (tx, mut rx) = reply();
        fx.state.publish(Some(&fx.link), vec![MessagePayload::from_data(1)], tx);
        assert!(matches!(take(&mut rx), Some(Ok(()))), "resolves on dispatch, not on ack");
        assert!(matches!(fx.far.next_frame(), Some(Frame::Publish { .. })));

        // publish skips the operation queue even while a subscribe is pending
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        fx.far.next_frame();
        let (tx, mut rx) = reply();
        fx.state.publish(Some(&fx.link), vec![MessagePayload::from_data(2)], tx);
        assert!(matches!(take(&mut rx), Some(Ok(()))));
        assert!(matches!(fx.far.next_frame(), Some(Frame::Publish { .. })));
    }

    #[test]
    fn publish_without_transport_fails_and_emits() {
        let mut fx = fixture();
        let failures = Arc::new(Mutex::new(0));
        let failures2 = failures.clone();
        fx.events.on(move |event| {
            if matches!(event, ChannelEvent::Failed(_)) {
                *failures2.lock().unwrap() += 1;
            }
        });
        let (tx, mut rx) = reply();
        fx.state.publish(None, vec![MessagePayload::from_data(1)], tx);
        assert!(matches!(take(&mut rx), Some(Err(Error::NotConnected))));
        assert_eq!(*failures.lock().unwrap(), 1);
    }

    #[test]
    fn pause_buffers_and_resume_replays_in_order() {
        let mut fx = fixture();
        let (handler, seen) = recording_handler();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, handler, HandlerId(1), tx);
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        let resumes = Arc::new(Mutex::new(Vec::new()));
        let resumes2 = resumes.clone();
        fx.events.on(move |event| {
            if let ChannelEvent::Resumed { delivered } = event {
                resumes2.lock().unwrap().push(*delivered);
            }
        });

        fx.state.pause(true);
        fx.state.pause(false); // no-op: already paused, policy unchanged
        fx.state
            .handle_frame(Some(&fx.link), message_frame("a", vec![MessagePayload::from_data("A")]));
        fx.state.handle_frame(
            Some(&fx.link),
            message_frame(
                "b",
                vec![MessagePayload::from_data("B"), MessagePayload::from_data("C")],
            ),
        );
        assert!(seen.lock().unwrap().is_empty(), "nothing delivered while paused");

        assert_eq!(fx.state.resume(), 3);
        let delivered: Vec<_> =
            seen.lock().unwrap().iter().map(|m| m.data.clone()).collect();
        assert_eq!(delivered, [json!("A"), json!("B"), json!("C")]);
        assert_eq!(*resumes.lock().unwrap(), vec![3]);

        assert_eq!(fx.state.resume(), 0, "second resume is a no-op");
        assert_eq!(*resumes.lock().unwrap(), vec![3]);
    }

    #[test]
    fn pause_without_buffering_drops_messages() {
        let mut fx = fixture();
        let (handler, seen) = recording_handler();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, handler, HandlerId(1), tx);
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        fx.state.pause(false);
        fx.state
            .handle_frame(Some(&fx.link), message_frame("a", vec![MessagePayload::from_data(1)]));
        assert_eq!(fx.state.resume(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn server_errors_reject_waiters_and_emit_failed() {
        let mut fx = fixture();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let failures2 = failures.clone();
        fx.events.on(move |event| {
            if let ChannelEvent::Failed(info) = event {
                failures2.lock().unwrap().push(info.code);
            }
        });

        let (tx, mut rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Error {
                channel: Some("c".into()),
                error: ErrorInfo::local(90010, "denied"),
            },
        );

        assert!(matches!(take(&mut rx), Some(Err(Error::Protocol(info))) if info.code == 90010));
        assert_eq!(*failures.lock().unwrap(), vec![90010]);
    }

    #[test]
    fn resubscribe_replays_a_single_subscribe_frame() {
        let mut fx = fixture();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        fx.far.next_frame();
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        fx.state.resubscribe(&fx.link).unwrap();
        assert!(matches!(fx.far.next_frame(), Some(Frame::Subscribe { .. })));
        assert!(fx.far.next_frame().is_none(), "exactly one frame");
        assert_eq!(fx.state.pending_flags(), (true, false));

        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );
        assert!(fx.state.is_subscribed());
    }

    #[test]
    fn resubscribe_without_handlers_sends_nothing() {
        let mut fx = fixture();
        fx.state.resubscribe(&fx.link).unwrap();
        assert!(fx.far.next_frame().is_none());
        assert_eq!(fx.state.pending_flags(), (false, false));
    }

    #[test]
    fn resubscribe_cancels_an_unacknowledged_unsubscribe() {
        let mut fx = fixture();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        fx.far.next_frame();
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        let (unsub_tx, mut unsub_rx) = reply();
        fx.state.unsubscribe(Some(&fx.link), UnsubscribeScope::Channel, unsub_tx);
        assert!(matches!(fx.far.next_frame(), Some(Frame::Unsubscribe { .. })));
        assert_eq!(fx.state.pending_flags(), (false, true));

        // the link dropped before the UNSUBSCRIBED ack; a fresh session
        // replays the still-attached handlers
        fx.state.resubscribe(&fx.link).unwrap();
        assert!(
            matches!(take(&mut unsub_rx), Some(Err(Error::Cancelled))),
            "the discarded unsubscribe is surfaced, not left to time out"
        );
        assert!(matches!(fx.far.next_frame(), Some(Frame::Subscribe { .. })));
        assert_eq!(fx.state.pending_flags(), (true, false));
    }

    #[test]
    fn watchdog_timeout_releases_queued_operations_in_order() {
        let mut fx = fixture();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        fx.far.next_frame();
        fx.state.handle_frame(
            Some(&fx.link),
            Frame::Subscribed { channel: "c".into(), subscription_id: None },
        );

        // sweep-initiated replay: pending with no user waiters
        fx.state.resubscribe(&fx.link).unwrap();
        fx.far.next_frame();

        // operations queued behind the replay, FIFO
        let (unsub_tx, mut unsub_rx) = reply();
        fx.state.unsubscribe(Some(&fx.link), UnsubscribeScope::Channel, unsub_tx);
        let (sub_tx, mut sub_rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(2), sub_tx);
        assert!(fx.far.next_frame().is_none(), "queued while the replay is in flight");

        fx.state.check_resubscribe(Some(&fx.link));

        // the unsubscribe completed locally (the replay never subscribed),
        // and the queued subscribe followed it straight onto the wire
        assert!(matches!(take(&mut unsub_rx), Some(Ok(()))));
        assert!(matches!(fx.far.next_frame(), Some(Frame::Subscribe { .. })));
        assert!(take(&mut sub_rx).is_none(), "awaiting its ack");
        assert_eq!(fx.state.pending_flags(), (true, false));
    }

    #[test]
    fn cancel_rejects_queued_operations_and_waiters() {
        let mut fx = fixture();
        let (sub_tx, mut sub_rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), sub_tx);
        let (queued_tx, mut queued_rx) = reply();
        fx.state.unsubscribe(Some(&fx.link), UnsubscribeScope::Channel, queued_tx);

        fx.state.cancel();
        assert!(matches!(take(&mut sub_rx), Some(Err(Error::Cancelled))));
        assert!(matches!(take(&mut queued_rx), Some(Err(Error::Cancelled))));
        assert_eq!(fx.state.pending_flags(), (false, false));
    }

    #[test]
    fn release_keeps_channels_that_ever_had_handlers() {
        let mut fx = fixture();
        fx.state.attach();
        let (tx, _rx) = reply();
        fx.state.subscribe(Some(&fx.link), None, noop_handler(), HandlerId(1), tx);
        assert!(!fx.state.release(), "kept for auto-resubscribe");

        let mut bare = ChannelState::new("d".into(), Arc::new(EventBus::new()));
        bare.attach();
        assert!(bare.release(), "nothing to keep");
    }
}
