//! Store events, per-operation sinks, and dispatchers.
//!
//! Every facade operation acquires an [`EventSink`] before touching the
//! backing map, records events in order while the segment lock is held, and
//! releases the sink exactly once: through
//! [`StoreEventDispatcher::release`] on success or
//! [`StoreEventDispatcher::release_after_failure`] on failure. A batch is
//! therefore published once or not at all, never partially and never twice.

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::error::StoreError;
use crate::holder::ValueHolder;

/// A change observed by the store.
///
/// Events carry owned copies of the key and the affected value bytes; they
/// outlive the segment lock and the arena blocks they were recorded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A mapping was created.
    Created {
        /// Key of the new mapping.
        key: Box<[u8]>,
        /// Installed value.
        value: Box<[u8]>,
    },
    /// A mapping was replaced.
    Updated {
        /// Key of the mapping.
        key: Box<[u8]>,
        /// Value before the update.
        old: Box<[u8]>,
        /// Value after the update.
        new: Box<[u8]>,
    },
    /// A mapping was explicitly removed.
    Removed {
        /// Key of the removed mapping.
        key: Box<[u8]>,
        /// Value at removal.
        old: Box<[u8]>,
    },
    /// A mapping was found expired and dropped.
    Expired {
        /// Key of the expired mapping.
        key: Box<[u8]>,
        /// Value at expiry.
        old: Box<[u8]>,
    },
    /// A mapping was evicted under memory pressure.
    Evicted {
        /// Key of the evicted mapping.
        key: Box<[u8]>,
        /// Value at eviction.
        old: Box<[u8]>,
    },
}

impl StoreEvent {
    /// Key the event refers to.
    pub fn key(&self) -> &[u8] {
        match self {
            StoreEvent::Created { key, .. }
            | StoreEvent::Updated { key, .. }
            | StoreEvent::Removed { key, .. }
            | StoreEvent::Expired { key, .. }
            | StoreEvent::Evicted { key, .. } => key,
        }
    }
}

/// Ordered per-operation event buffer.
///
/// Typical operations record zero, one, or two events, so the buffer keeps a
/// small inline capacity.
#[derive(Debug, Default)]
pub struct EventSink {
    events: SmallVec<[StoreEvent; 4]>,
}

impl EventSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a creation.
    pub fn created(&mut self, key: &[u8], value: &[u8]) {
        self.events.push(StoreEvent::Created {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Record an update.
    pub fn updated(&mut self, key: &[u8], old: &[u8], new: &[u8]) {
        self.events.push(StoreEvent::Updated {
            key: key.into(),
            old: old.into(),
            new: new.into(),
        });
    }

    /// Record an explicit removal.
    pub fn removed(&mut self, key: &[u8], old: &[u8]) {
        self.events.push(StoreEvent::Removed {
            key: key.into(),
            old: old.into(),
        });
    }

    /// Record an expiry.
    pub fn expired(&mut self, key: &[u8], old: &[u8]) {
        self.events.push(StoreEvent::Expired {
            key: key.into(),
            old: old.into(),
        });
    }

    /// Record an eviction.
    pub fn evicted(&mut self, key: &[u8], old: &[u8]) {
        self.events.push(StoreEvent::Evicted {
            key: key.into(),
            old: old.into(),
        });
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the sink holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Consume the sink, yielding its events in record order.
    pub fn into_events(self) -> impl Iterator<Item = StoreEvent> {
        self.events.into_iter()
    }
}

/// Dispatcher handing out sinks and publishing released batches.
pub trait StoreEventDispatcher: Send + Sync {
    /// Acquire a sink for one operation.
    fn event_sink(&self) -> EventSink;

    /// Publish a completed operation's events, preserving their order.
    fn release(&self, sink: EventSink);

    /// Discard a failed operation's events. Nothing is published.
    fn release_after_failure(&self, sink: EventSink, error: &StoreError);
}

/// Dispatcher that publishes nothing. The safe default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStoreEventDispatcher;

impl StoreEventDispatcher for NullStoreEventDispatcher {
    fn event_sink(&self) -> EventSink {
        EventSink::new()
    }

    fn release(&self, _sink: EventSink) {}

    fn release_after_failure(&self, _sink: EventSink, _error: &StoreError) {}
}

/// Observer of published store events.
pub trait StoreEventListener: Send + Sync {
    /// Called once per event, in the order the operation recorded them.
    fn on_event(&self, event: &StoreEvent);
}

/// Dispatcher delivering batches synchronously to registered listeners.
///
/// Delivery happens on the releasing thread, after the segment lock has been
/// dropped; ordering within one batch is preserved.
#[derive(Default)]
pub struct ListenerDispatcher {
    listeners: RwLock<Vec<Arc<dyn StoreEventListener>>>,
}

impl ListenerDispatcher {
    /// Create a dispatcher with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all future batches.
    pub fn register(&self, listener: Arc<dyn StoreEventListener>) {
        self.listeners.write().push(listener);
    }
}

impl StoreEventDispatcher for ListenerDispatcher {
    fn event_sink(&self) -> EventSink {
        EventSink::new()
    }

    fn release(&self, sink: EventSink) {
        let listeners = self.listeners.read();
        if listeners.is_empty() {
            return;
        }
        for event in sink.into_events() {
            for listener in listeners.iter() {
                listener.on_event(&event);
            }
        }
    }

    fn release_after_failure(&self, sink: EventSink, error: &StoreError) {
        tracing::debug!(
            dropped = sink.len(),
            %error,
            "discarding event batch after operation failure"
        );
    }
}

/// Upper-tier observer of entries leaving this tier.
pub trait InvalidationListener: Send + Sync {
    /// Called when a mapping is invalidated, evicted, or found expired.
    fn on_invalidation(&self, key: &[u8], holder: &ValueHolder);
}

/// Listener that ignores every invalidation. The safe default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInvalidationListener;

impl InvalidationListener for NullInvalidationListener {
    fn on_invalidation(&self, _key: &[u8], _holder: &ValueHolder) {}
}
