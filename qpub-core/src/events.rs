//! Typed multi-listener event emitter.
//!
//! One `EventBus` instance backs each event family (connection, channel,
//! auth). Listeners run synchronously on the emitting task; a panicking
//! listener is caught and logged and never disturbs the other listeners or
//! the emitter.

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

/// Handle for detaching a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

struct Entry<E> {
    id: ListenerId,
    once: bool,
    callback: Callback<E>,
}

struct Inner<E> {
    next_id: u64,
    entries: Vec<Entry<E>>,
}

pub struct EventBus<E> {
    inner: Mutex<Inner<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { next_id: 0, entries: Vec::new() }) }
    }

    fn attach(&self, once: bool, callback: Callback<E>) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push(Entry { id, once, callback });
        id
    }

    /// Attaches a listener invoked on every emit until detached.
    pub fn on(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        self.attach(false, Arc::new(callback))
    }

    /// Attaches a listener delivered at most once; it detaches itself before
    /// its first invocation.
    pub fn once(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        self.attach(true, Arc::new(callback))
    }

    /// Detaches a listener. Returns whether it was still attached.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.id != id);
        inner.entries.len() != before
    }

    pub fn remove_all(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Invokes every attached listener with `event`.
    ///
    /// The listener list is snapshotted first and the lock released, so
    /// listeners may attach or detach freely. Once-listeners are removed
    /// before the snapshot runs, which guarantees at-most-once delivery even
    /// if a listener emits re-entrantly.
    pub fn emit(&self, event: &E) {
        let batch: Vec<Callback<E>> = {
            let mut inner = self.inner.lock().unwrap();
            let batch = inner.entries.iter().map(|e| Arc::clone(&e.callback)).collect();
            inner.entries.retain(|e| !e.once);
            batch
        };
        for callback in batch {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!("event listener panicked; continuing with remaining listeners");
            }
        }
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("listeners", &self.listener_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn on_and_emit_deliver_to_every_listener() {
        let bus = EventBus::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.on(move |n| {
                count.fetch_add(*n as usize, Ordering::SeqCst);
            });
        }
        bus.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 6);
        assert_eq!(bus.listener_count(), 3);
    }

    #[test]
    fn once_detaches_after_first_delivery() {
        let bus = EventBus::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.once(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&());
        bus.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn off_detaches_only_the_named_listener() {
        let bus = EventBus::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = bus.on(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        let count3 = count.clone();
        bus.on(move |_| {
            count3.fetch_add(10, Ordering::SeqCst);
        });

        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn remove_all_clears_listeners() {
        let bus = EventBus::<()>::new();
        bus.on(|_| {});
        bus.once(|_| {});
        assert_eq!(bus.listener_count(), 2);
        bus.remove_all();
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn a_panicking_listener_does_not_starve_the_rest() {
        let bus = EventBus::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on(|_| panic!("listener bug"));
        let count2 = count.clone();
        bus.on(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_may_detach_during_emit() {
        let bus = Arc::new(EventBus::<()>::new());
        let bus2 = bus.clone();
        let id = Arc::new(Mutex::new(None));
        let id2 = id.clone();
        let registered = bus.on(move |_| {
            if let Some(id) = *id2.lock().unwrap() {
                bus2.off(id);
            }
        });
        *id.lock().unwrap() = Some(registered);
        bus.emit(&());
        assert_eq!(bus.listener_count(), 0);
    }
}
