//! Process signal handling.
//!
//! A dedicated thread sits in a blocking wait for process signals. The first
//! SIGINT/SIGTERM is translated into a `ShutdownRequested` event, giving every
//! component the chance to wind down cleanly; a second one aborts the process
//! immediately. SIGUSR1 serves as a self-wake for the handler thread itself.

use std::sync::Arc;

use signal_hook::consts::signal::{SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::{Handle, Signals};

use crate::event::{EventBus, EventPayload};

pub struct SignalHandler {
    bus: Arc<EventBus>,
    signals: Signals,
}

impl SignalHandler {
    pub fn new(bus: Arc<EventBus>) -> std::io::Result<Self> {
        Ok(Self { bus, signals: Signals::new([SIGINT, SIGTERM, SIGUSR1])? })
    }

    /// A handle with which another thread can terminate the signal loop.
    pub fn handle(&self) -> Handle {
        self.signals.handle()
    }

    /// Entry point for the signal handler thread. Returns once the handle is
    /// closed.
    pub fn run(mut self) {
        let mut shutdown_signal_count = 0u32;

        for signal in self.signals.forever() {
            match signal {
                SIGINT | SIGTERM => {
                    shutdown_signal_count += 1;

                    if shutdown_signal_count > 1 {
                        tracing::warn!("Aborting immediately");
                        std::process::exit(130);
                    }

                    tracing::info!("Shutdown signal received");
                    self.bus.publish(EventPayload::ShutdownRequested);
                }
                SIGUSR1 => {
                    // Self-wake only.
                }
                _ => {}
            }
        }
    }
}
