/*!
 * Event system for starsync.
 *
 * This module provides a typed publish/subscribe bus. Producers publish
 * tagged event variants; observers register per event kind and are invoked
 * synchronously, in subscription order, on the publishing thread. The bus
 * keeps no history: subscribers never observe events published before they
 * subscribed. Consumers that need current state pull it from the registry
 * instead of relying on replay.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, trace};

/// Trait for tagged event payloads carried by an [`EventBus`]
pub trait Event: Clone + Debug + Send + 'static {
    /// The discriminant type observers subscribe by
    type Kind: Copy + Eq + Hash + Debug + Send;

    /// Get the kind tag of this event
    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Event bus for publishing and subscribing to tagged events
pub struct EventBus<E: Event> {
    handlers: Mutex<HashMap<E::Kind, Vec<(SubscriptionId, Handler<E>)>>>,
    next_id: AtomicU64,
}

impl<E: Event> EventBus<E> {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to events of a specific kind
    ///
    /// The handler runs synchronously on the publishing thread, after every
    /// handler subscribed before it.
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.lock().expect("event bus lock poisoned");
        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Unsubscribe a handler
    ///
    /// Idempotent: unsubscribing an id that is not currently subscribed is
    /// a no-op.
    pub fn off(&self, kind: E::Kind, id: SubscriptionId) {
        let mut handlers = self.handlers.lock().expect("event bus lock poisoned");
        if let Some(list) = handlers.get_mut(&kind) {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Publish an event to all observers of its kind
    ///
    /// Returns the number of handlers invoked. Zero observers is not an
    /// error. A panicking handler is isolated and logged; the remaining
    /// handlers still run.
    pub fn publish(&self, event: &E) -> usize {
        let to_run: Vec<Handler<E>> = {
            let handlers = self.handlers.lock().expect("event bus lock poisoned");
            match handlers.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };

        if to_run.is_empty() {
            trace!(kind = ?event.kind(), "no observers for event");
            return 0;
        }

        for handler in &to_run {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(kind = ?event.kind(), %message, "event observer panicked");
            }
        }

        to_run.len()
    }

    /// Count the observers currently subscribed for a kind
    pub fn observer_count(&self, kind: E::Kind) -> usize {
        let handlers = self.handlers.lock().expect("event bus lock poisoned");
        handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug)]
pub struct SharedEventBus<E: Event>(Arc<EventBus<E>>);

impl<E: Event> SharedEventBus<E> {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Subscribe to events of a specific kind
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.0.on(kind, handler)
    }

    /// Unsubscribe a handler
    pub fn off(&self, kind: E::Kind, id: SubscriptionId) {
        self.0.off(kind, id);
    }

    /// Publish an event to all observers of its kind
    pub fn publish(&self, event: &E) -> usize {
        self.0.publish(event)
    }

    /// Count the observers currently subscribed for a kind
    pub fn observer_count(&self, kind: E::Kind) -> usize {
        self.0.observer_count(kind)
    }
}

impl<E: Event> Clone for SharedEventBus<E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<E: Event> Default for SharedEventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone)]
    enum TestEvent {
        Changed { value: i64 },
        Errored { message: String },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestEventKind {
        Changed,
        Errored,
    }

    impl Event for TestEvent {
        type Kind = TestEventKind;

        fn kind(&self) -> TestEventKind {
            match self {
                TestEvent::Changed { .. } => TestEventKind::Changed,
                TestEvent::Errored { .. } => TestEventKind::Errored,
            }
        }
    }

    #[test]
    fn test_publish_subscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        bus.on(TestEventKind::Changed, move |event| {
            if let TestEvent::Changed { value } = event {
                seen_clone.fetch_add(*value as usize, Ordering::SeqCst);
            }
        });

        let invoked = bus.publish(&TestEvent::Changed { value: 3 });
        assert_eq!(invoked, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_kind_routing() {
        let bus = EventBus::new();
        let changed = Arc::new(AtomicUsize::new(0));
        let errored = Arc::new(AtomicUsize::new(0));

        let changed_clone = Arc::clone(&changed);
        bus.on(TestEventKind::Changed, move |_| {
            changed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let errored_clone = Arc::clone(&errored);
        bus.on(TestEventKind::Errored, move |_| {
            errored_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&TestEvent::Changed { value: 1 });
        bus.publish(&TestEvent::Changed { value: 2 });
        bus.publish(&TestEvent::Errored {
            message: "lost link".to_string(),
        });

        assert_eq!(changed.load(Ordering::SeqCst), 2);
        assert_eq!(errored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order_clone = Arc::clone(&order);
            bus.on(TestEventKind::Changed, move |_| {
                order_clone.lock().unwrap().push(tag);
            });
        }

        bus.publish(&TestEvent::Changed { value: 0 });
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.on(TestEventKind::Changed, |_| {
            panic!("observer bug");
        });
        let seen_clone = Arc::clone(&seen);
        bus.on(TestEventKind::Changed, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let invoked = bus.publish(&TestEvent::Changed { value: 1 });
        assert_eq!(invoked, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_is_idempotent() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let id = bus.on(TestEventKind::Changed, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.off(TestEventKind::Changed, id);
        bus.off(TestEventKind::Changed, id);
        bus.off(TestEventKind::Errored, id);

        bus.publish(&TestEvent::Changed { value: 1 });
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        bus.publish(&TestEvent::Changed { value: 1 });

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.on(TestEventKind::Changed, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        bus.publish(&TestEvent::Changed { value: 2 });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_bus_clones_share_observers() {
        let bus = SharedEventBus::new();
        let bus2 = bus.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        bus.on(TestEventKind::Changed, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus2.publish(&TestEvent::Changed { value: 1 });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus2.observer_count(TestEventKind::Changed), 1);
    }
}
