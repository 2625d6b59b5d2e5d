//! The channel registry facade.

use crate::{
    channel::{Channel, ChannelEvent},
    connection::Instruction,
};
use futures_channel::mpsc;
use qpub_core::events::EventBus;
use std::{
    collections::HashMap,
    fmt,
    sync::{atomic::AtomicU64, Arc, Mutex},
    time::Duration,
};

/// Event buses shared between channel handles and the manager task, keyed
/// by channel name. Kept outside the manager so `get` can hand out a handle
/// without a round-trip.
pub(crate) type SharedBuses = Arc<Mutex<HashMap<String, Arc<EventBus<ChannelEvent>>>>>;

/// Access to the streaming instance's channels.
#[derive(Clone)]
pub struct Channels {
    instructions: mpsc::UnboundedSender<Instruction>,
    buses: SharedBuses,
    next_handler_id: Arc<AtomicU64>,
    default_timeout: Duration,
}

impl Channels {
    pub(crate) fn new(
        instructions: mpsc::UnboundedSender<Instruction>,
        buses: SharedBuses,
        default_timeout: Duration,
    ) -> Self {
        Self { instructions, buses, next_handler_id: Arc::new(AtomicU64::new(1)), default_timeout }
    }

    /// Create-or-return a handle for the named channel, taking a reference
    /// on it. Idempotent: every call for the same name addresses the same
    /// underlying channel.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub fn get(&self, name: &str) -> Channel {
        assert!(!name.is_empty(), "channel name must not be empty");
        let events = self.buses.lock().unwrap().entry(name.to_string()).or_default().clone();
        let _ = self.instructions.unbounded_send(Instruction::Attach { channel: name.to_string() });
        Channel::new(
            name.to_string(),
            self.instructions.clone(),
            events,
            self.next_handler_id.clone(),
            self.default_timeout,
        )
    }

    /// Drops one reference to the named channel. A channel that ever held
    /// handlers is kept around for auto-resubscription; one that never did
    /// is discarded when its last reference goes.
    pub fn release(&self, name: &str) {
        let _ = self.instructions.unbounded_send(Instruction::Release { channel: name.to_string() });
    }
}

impl fmt::Debug for Channels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channels").finish_non_exhaustive()
    }
}
