use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// An external wake-up primitive, invoked on every event enqueue so that a
/// thread blocked elsewhere (I/O, a timed wait) can be unblocked promptly.
pub trait Notifier: Send + Sync {
    /// Wakes the waiting thread. Must be cheap and must never block.
    fn notify(&self);
}

/// A [`Notifier`] backed by a mutex-guarded flag and a condition variable.
///
/// The owning thread parks in [`CondvarNotifier::wait`]; any other thread
/// calls [`Notifier::notify`] to wake it. Notifications are level-triggered:
/// a notify that arrives before the wait completes immediately.
#[derive(Default)]
pub struct CondvarNotifier {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl CondvarNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until notified or until `timeout` expires, then clears the
    /// notification flag.
    pub fn wait(&self, timeout: Duration) {
        let guard = self.notified.lock().unwrap();
        let (mut guard, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |notified| !*notified)
            .unwrap();
        *guard = false;
    }
}

impl Notifier for CondvarNotifier {
    fn notify(&self) {
        let mut guard = self.notified.lock().unwrap();
        *guard = true;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn notify_wakes_waiter() {
        let notifier = Arc::new(CondvarNotifier::new());

        let waker = {
            let notifier = notifier.clone();
            std::thread::spawn(move || notifier.notify())
        };

        let started = Instant::now();
        notifier.wait(Duration::from_secs(5));
        waker.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn pending_notification_completes_wait_immediately() {
        let notifier = CondvarNotifier::new();
        notifier.notify();

        let started = Instant::now();
        notifier.wait(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
