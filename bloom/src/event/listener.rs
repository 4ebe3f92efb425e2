use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

use super::{Event, EventKind, Notifier};

/// Stable identifier of a registered listener.
pub type ListenerId = u64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A callback invoked for each dispatched event of a registered kind.
///
/// Errors returned by callbacks are logged and swallowed - a failing callback
/// must never corrupt the bus or starve other callbacks.
pub type EventCallback = Box<dyn Fn(&Event) -> Result<(), Error> + Send>;

/// A registered consumer of events.
///
/// The owning thread subscribes to the kinds it cares about, then either
/// drains queued events explicitly ([`EventListener::dispatch_pending`]) or
/// blocks for them ([`EventListener::wait_and_dispatch`],
/// [`EventListener::wait_for`]). Other threads deliver events through the
/// [`super::EventBus`].
pub struct EventListener {
    id: ListenerId,
    name: String,

    /// Queued events, grouped by kind. Events are removed just before
    /// dispatching begins.
    queues: Mutex<HashMap<EventKind, VecDeque<Arc<Event>>>>,
    queue_condvar: Condvar,

    subscriptions: Mutex<HashSet<EventKind>>,
    callbacks: Mutex<HashMap<EventKind, Vec<EventCallback>>>,

    notifier: Mutex<Option<Arc<dyn Notifier>>>,
}

impl EventListener {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            queues: Mutex::new(HashMap::new()),
            queue_condvar: Condvar::new(),
            subscriptions: Mutex::new(HashSet::new()),
            callbacks: Mutex::new(HashMap::new()),
            notifier: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches a notifier, invoked on every enqueue.
    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    /// Subscribes the listener to a kind, without registering a callback.
    /// Queued events of the kind are consumed via `wait_for`.
    pub fn subscribe(&self, kind: EventKind) {
        self.subscriptions.lock().unwrap().insert(kind);
    }

    /// Drops the subscription and any queued events of the kind.
    pub fn unsubscribe(&self, kind: EventKind) {
        self.subscriptions.lock().unwrap().remove(&kind);
        self.callbacks.lock().unwrap().remove(&kind);
        self.queues.lock().unwrap().remove(&kind);
    }

    /// Registers a callback for a kind, subscribing to it in the process.
    /// Multiple callbacks may be registered for one kind.
    pub fn register_callback(&self, kind: EventKind, callback: EventCallback) {
        self.subscribe(kind);
        self.callbacks.lock().unwrap().entry(kind).or_default().push(callback);
    }

    /// Deregisters all callbacks for a kind. The subscription itself is kept,
    /// so events continue to queue.
    pub fn deregister_callbacks(&self, kind: EventKind) {
        self.callbacks.lock().unwrap().remove(&kind);
    }

    pub(super) fn subscribed_to(&self, kind: EventKind) -> bool {
        self.subscriptions.lock().unwrap().contains(&kind)
    }

    /// Delivers an event to this listener. Called by the bus with a shared
    /// handle; enqueues only when the listener subscribes to the kind.
    pub(super) fn enqueue(&self, event: Arc<Event>) {
        if !self.subscribed_to(event.kind()) {
            return;
        }

        {
            let mut queues = self.queues.lock().unwrap();
            queues.entry(event.kind()).or_default().push_back(event);
        }

        self.queue_condvar.notify_all();

        if let Some(notifier) = self.notifier.lock().unwrap().as_ref() {
            notifier.notify();
        }
    }

    /// Removes all queued events, preserving per-kind FIFO order in the
    /// returned list (ordering across kinds follows event ids).
    fn take_pending(&self) -> Vec<Arc<Event>> {
        let mut queues = self.queues.lock().unwrap();
        let mut events: Vec<Arc<Event>> =
            queues.values_mut().flat_map(|queue| queue.drain(..)).collect();
        events.sort_by_key(|event| event.id);
        events
    }

    /// Pops all queued events in FIFO order and invokes the registered
    /// callbacks per kind.
    pub fn dispatch_pending(&self) {
        for event in self.take_pending() {
            self.dispatch(&event);
        }
    }

    /// Blocks until at least one event of a subscribed kind is queued, or
    /// until `timeout` expires, then dispatches everything queued.
    pub fn wait_and_dispatch(&self, timeout: Duration) {
        {
            let queues = self.queues.lock().unwrap();
            let _unused = self
                .queue_condvar
                .wait_timeout_while(queues, timeout, |queues| {
                    queues.values().all(|queue| queue.is_empty())
                })
                .unwrap();
        }

        self.dispatch_pending();
    }

    /// Blocks until an event matching one of `kinds` (and, if given, the
    /// correlation id) arrives, or until `timeout` expires.
    ///
    /// Events of other subscribed kinds continue to queue normally. Events of
    /// the matching kinds whose correlation id does not match are discarded.
    /// `timeout` of `None` blocks indefinitely.
    pub fn wait_for(
        &self,
        kinds: &[EventKind],
        timeout: Option<Duration>,
        correlation_id: Option<super::EventId>,
    ) -> Option<Arc<Event>> {
        for kind in kinds {
            self.subscribe(*kind);
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut queues = self.queues.lock().unwrap();

        loop {
            for kind in kinds {
                if let Some(queue) = queues.get_mut(kind) {
                    while let Some(event) = queue.pop_front() {
                        match correlation_id {
                            None => return Some(event),
                            Some(id) if event.correlation_id == Some(id) => return Some(event),
                            Some(_) => continue,
                        }
                    }
                }
            }

            queues = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }

                    let (queues, _) =
                        self.queue_condvar.wait_timeout(queues, deadline - now).unwrap();
                    queues
                }
                None => self.queue_condvar.wait(queues).unwrap(),
            };
        }
    }

    fn dispatch(&self, event: &Event) {
        let callbacks = self.callbacks.lock().unwrap();
        let Some(callbacks) = callbacks.get(&event.kind()) else {
            return;
        };

        for callback in callbacks {
            if let Err(error) = callback(event) {
                tracing::error!(
                    listener = self.name.as_str(),
                    kind = ?event.kind(),
                    %error,
                    "event callback failed",
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::event::{EventBus, EventPayload};

    use super::*;

    #[test]
    fn wait_for_filters_on_correlation_id() {
        let bus = EventBus::new();
        let listener = EventListener::new("correlation");
        listener.subscribe(EventKind::ProgrammingModeEnabled);
        bus.register(listener.clone());

        bus.publish_correlated(EventPayload::ProgrammingModeEnabled, Some(11));
        bus.publish_correlated(EventPayload::ProgrammingModeEnabled, Some(22));

        let event = listener
            .wait_for(&[EventKind::ProgrammingModeEnabled], Some(Duration::ZERO), Some(22))
            .unwrap();
        assert_eq!(event.correlation_id, Some(22));

        // The non-matching correlation was discarded, not left queued.
        assert!(listener
            .wait_for(&[EventKind::ProgrammingModeEnabled], Some(Duration::ZERO), Some(11))
            .is_none());
    }

    #[test]
    fn wait_for_leaves_other_kinds_queued() {
        let bus = EventBus::new();
        let listener = EventListener::new("other-kinds");
        listener.subscribe(EventKind::TargetReset);
        listener.subscribe(EventKind::ShutdownRequested);
        bus.register(listener.clone());

        bus.publish(EventPayload::TargetReset);
        bus.publish(EventPayload::ShutdownRequested);

        listener.wait_for(&[EventKind::ShutdownRequested], Some(Duration::ZERO), None).unwrap();

        // The TargetReset event is still there.
        assert!(listener
            .wait_for(&[EventKind::TargetReset], Some(Duration::ZERO), None)
            .is_some());
    }

    #[test]
    fn wait_for_times_out() {
        let listener = EventListener::new("timeout");
        let started = Instant::now();
        let event =
            listener.wait_for(&[EventKind::TargetReset], Some(Duration::from_millis(50)), None);
        assert!(event.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn failing_callback_does_not_starve_later_callbacks() {
        let bus = EventBus::new();
        let listener = EventListener::new("failing-callback");

        let invocations = Arc::new(AtomicUsize::new(0));

        listener.register_callback(
            EventKind::TargetReset,
            Box::new(|_| Err(Error::TargetOperationFailure("callback failure".to_owned()))),
        );
        listener.register_callback(EventKind::TargetReset, {
            let invocations = invocations.clone();
            Box::new(move |_| {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        bus.register(listener.clone());
        bus.publish(EventPayload::TargetReset);
        listener.dispatch_pending();

        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // The listener continues to receive events after a callback failure.
        bus.publish(EventPayload::TargetReset);
        listener.dispatch_pending();
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_and_dispatch_runs_callbacks_for_queued_events() {
        let bus = EventBus::new();
        let listener = EventListener::new("wait-and-dispatch");

        let invocations = Arc::new(AtomicUsize::new(0));
        listener.register_callback(EventKind::TargetReset, {
            let invocations = invocations.clone();
            Box::new(move |_| {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        bus.register(listener.clone());
        bus.publish(EventPayload::TargetReset);

        listener.wait_and_dispatch(Duration::from_secs(5));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notifier_invoked_on_enqueue() {
        struct CountingNotifier(AtomicUsize);

        impl Notifier for CountingNotifier {
            fn notify(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bus = EventBus::new();
        let listener = EventListener::new("notified");
        listener.subscribe(EventKind::TargetReset);

        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        listener.set_notifier(notifier.clone());
        bus.register(listener.clone());

        bus.publish(EventPayload::TargetReset);
        bus.publish(EventPayload::ShutdownRequested);

        // Only the subscribed kind triggers the notifier.
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }
}
