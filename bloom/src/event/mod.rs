//! The typed event bus.
//!
//! Components communicate state transitions through broadcast events. Each
//! registered [`EventListener`] holds a FIFO queue per event kind; publishing
//! enqueues a shared handle to the event on every listener subscribed to its
//! kind and invokes the listener's notifier, if one is attached.
//!
//! Ordering: within one kind, a listener observes events in publish order.
//! No ordering is guaranteed across kinds or across listeners.

mod listener;
mod notifier;

pub use listener::{EventCallback, EventListener, ListenerId};
pub use notifier::{CondvarNotifier, Notifier};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bloom_target::{MemoryAddress, MemoryBuffer, MemorySize};

use crate::target_controller::TargetControllerState;
use crate::targets::{BreakCause, RegisterValue};

/// Monotonically increasing event identifier, unique within the process.
pub type EventId = u64;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// The kind-specific payload of an event. Once published, no field mutates.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// The target's execution has stopped.
    TargetExecutionStopped {
        /// The program counter in effect at the time the stop was observed.
        program_counter: MemoryAddress,
        /// Why execution stopped.
        cause: BreakCause,
    },
    /// The target's execution has resumed.
    TargetExecutionResumed,
    /// The target was reset.
    TargetReset,
    /// Register values were written to the target.
    RegistersWritten(Vec<RegisterValue>),
    /// Memory was written to the target.
    MemoryWritten {
        /// Key of the address space written to.
        address_space_key: String,
        /// Key of the memory segment written to.
        memory_segment_key: String,
        /// First address written.
        address: MemoryAddress,
        /// Number of bytes written.
        length: MemorySize,
    },
    /// A programming session is now active.
    ProgrammingModeEnabled,
    /// The programming session has ended.
    ProgrammingModeDisabled,
    /// The target controller moved to a new lifecycle state.
    TargetControllerStateChanged(TargetControllerState),
    /// The target controller failed to service a request. The correlation id
    /// links the failure to the originating event or command.
    TargetControllerError {
        /// Human-readable description of the failure.
        message: String,
    },
    /// A debug session has started (host debugger connected).
    StartDebugSession,
    /// The debug session has ended (host debugger disconnected).
    EndDebugSession,
    /// Process shutdown was requested.
    ShutdownRequested,
    /// A buffer of memory was read. Published by long-running read operations
    /// for observers such as the Insight GUI.
    MemoryRead(MemoryBuffer),
}

impl EventPayload {
    /// The kind discriminant of the payload.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TargetExecutionStopped { .. } => EventKind::TargetExecutionStopped,
            Self::TargetExecutionResumed => EventKind::TargetExecutionResumed,
            Self::TargetReset => EventKind::TargetReset,
            Self::RegistersWritten(_) => EventKind::RegistersWritten,
            Self::MemoryWritten { .. } => EventKind::MemoryWritten,
            Self::ProgrammingModeEnabled => EventKind::ProgrammingModeEnabled,
            Self::ProgrammingModeDisabled => EventKind::ProgrammingModeDisabled,
            Self::TargetControllerStateChanged(_) => EventKind::TargetControllerStateChanged,
            Self::TargetControllerError { .. } => EventKind::TargetControllerError,
            Self::StartDebugSession => EventKind::StartDebugSession,
            Self::EndDebugSession => EventKind::EndDebugSession,
            Self::ShutdownRequested => EventKind::ShutdownRequested,
            Self::MemoryRead(_) => EventKind::MemoryRead,
        }
    }
}

/// Discriminants of [`EventPayload`], used for subscriptions and queue keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    TargetExecutionStopped,
    TargetExecutionResumed,
    TargetReset,
    RegistersWritten,
    MemoryWritten,
    ProgrammingModeEnabled,
    ProgrammingModeDisabled,
    TargetControllerStateChanged,
    TargetControllerError,
    StartDebugSession,
    EndDebugSession,
    ShutdownRequested,
    MemoryRead,
}

/// A published event. Broadcast by shared read-only handle; no field mutates
/// after publication.
#[derive(Debug)]
pub struct Event {
    /// Monotonically increasing identifier.
    pub id: EventId,
    /// Links this event to the request that caused it, if any.
    pub correlation_id: Option<EventId>,
    /// When the event was published.
    pub created_at: Instant,
    /// The kind-specific payload.
    pub payload: EventPayload,
}

impl Event {
    /// The kind discriminant of the event's payload.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// A process-wide registry of event listeners.
///
/// Registry mutations and publishes are serialized by the internal mutex;
/// listener queues have their own locks, so a slow listener never blocks
/// publication to the others for longer than one enqueue.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<ListenerId, Arc<EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Events published from this point on are
    /// delivered to it.
    pub fn register(&self, listener: Arc<EventListener>) {
        self.listeners.lock().unwrap().insert(listener.id(), listener);
    }

    /// Removes a listener from the registry. Events already queued on the
    /// listener remain dispatchable.
    pub fn deregister(&self, id: ListenerId) {
        self.listeners.lock().unwrap().remove(&id);
    }

    /// Returns true if at least one registered listener subscribes to `kind`.
    ///
    /// Publishers of expensive payloads use this to skip construction when
    /// nobody is listening.
    pub fn kind_listened_for(&self, kind: EventKind) -> bool {
        self.listeners
            .lock()
            .unwrap()
            .values()
            .any(|listener| listener.subscribed_to(kind))
    }

    /// Publishes an event, enqueuing a shared handle on every listener
    /// subscribed to its kind. Returns the allocated event id.
    pub fn publish(&self, payload: EventPayload) -> EventId {
        self.publish_correlated(payload, None)
    }

    /// Publishes an event carrying a correlation id linking it to a prior
    /// request.
    pub fn publish_correlated(
        &self,
        payload: EventPayload,
        correlation_id: Option<EventId>,
    ) -> EventId {
        let event = Arc::new(Event {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            correlation_id,
            created_at: Instant::now(),
            payload,
        });

        tracing::trace!(event_id = event.id, kind = ?event.kind(), "publishing event");

        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.values() {
            listener.enqueue(event.clone());
        }

        event.id
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn publish_reaches_subscribed_listeners_only() {
        let bus = EventBus::new();

        let subscribed = EventListener::new("subscribed");
        subscribed.subscribe(EventKind::TargetReset);
        let indifferent = EventListener::new("indifferent");
        indifferent.subscribe(EventKind::ShutdownRequested);

        bus.register(subscribed.clone());
        bus.register(indifferent.clone());

        bus.publish(EventPayload::TargetReset);

        assert!(subscribed.wait_for(&[EventKind::TargetReset], Some(Duration::ZERO), None).is_some());
        assert!(indifferent
            .wait_for(&[EventKind::ShutdownRequested], Some(Duration::ZERO), None)
            .is_none());
    }

    #[test]
    fn per_kind_fifo_order_is_preserved() {
        let bus = EventBus::new();
        let listener = EventListener::new("fifo");
        listener.subscribe(EventKind::TargetExecutionStopped);
        bus.register(listener.clone());

        for pc in [0x100u32, 0x200, 0x300] {
            bus.publish(EventPayload::TargetExecutionStopped {
                program_counter: pc,
                cause: BreakCause::Unknown,
            });
        }

        for expected in [0x100u32, 0x200, 0x300] {
            let event = listener
                .wait_for(&[EventKind::TargetExecutionStopped], Some(Duration::ZERO), None)
                .unwrap();
            match event.payload {
                EventPayload::TargetExecutionStopped { program_counter, .. } => {
                    assert_eq!(program_counter, expected)
                }
                _ => panic!("unexpected payload"),
            }
        }
    }

    #[test]
    fn event_ids_increase_monotonically() {
        let bus = EventBus::new();
        let first = bus.publish(EventPayload::TargetReset);
        let second = bus.publish(EventPayload::TargetReset);
        assert!(second > first);
    }

    #[test]
    fn kind_listened_for_reflects_subscriptions() {
        let bus = EventBus::new();
        assert!(!bus.kind_listened_for(EventKind::RegistersWritten));

        let listener = EventListener::new("registers");
        listener.subscribe(EventKind::RegistersWritten);
        bus.register(listener.clone());

        assert!(bus.kind_listened_for(EventKind::RegistersWritten));

        bus.deregister(listener.id());
        assert!(!bus.kind_listened_for(EventKind::RegistersWritten));
    }
}
