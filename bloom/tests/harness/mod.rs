//! Shared test harness: spins up a target controller against the simulator
//! tool and exposes the pieces a test needs to drive and observe it.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bloom::config::EnvironmentConfig;
use bloom::event::{Event, EventBus, EventKind, EventListener};
use bloom::target_controller::{CommandService, TargetController, TargetControllerState};
use bloom::targets::TargetRegistry;
use bloom::tools::simulator::{DeviceSlot, SimulatedDevice, SimulatedTool, SimulatorOptions};
use bloom::tools::ToolRegistry;
use bloom::EventPayload;

const STATE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn options() -> SimulatorOptions {
    SimulatorOptions::default()
}

pub struct Harness {
    pub bus: Arc<EventBus>,
    pub service: CommandService,
    pub listener: Arc<EventListener>,
    slot: DeviceSlot,
    thread: Option<JoinHandle<()>>,
}

impl Harness {
    /// Builds a controller for the given environment document and spawns its
    /// thread. The returned harness observes every event kind of interest.
    pub fn start(environment_yaml: &str, mut options: SimulatorOptions) -> Self {
        let bus = Arc::new(EventBus::new());

        let slot: DeviceSlot = Arc::new(Mutex::new(None));
        options.device_slot = Some(slot.clone());

        let mut tools = ToolRegistry::new();
        let factory_options = options.clone();
        tools.register("simulator", move || {
            Box::new(SimulatedTool::with_options(factory_options.clone()))
        });

        let environment: EnvironmentConfig =
            serde_yaml::from_str(environment_yaml).expect("invalid environment document");

        let listener = EventListener::new("TestObserver");
        for kind in [
            EventKind::TargetExecutionStopped,
            EventKind::TargetExecutionResumed,
            EventKind::TargetReset,
            EventKind::RegistersWritten,
            EventKind::MemoryWritten,
            EventKind::ProgrammingModeEnabled,
            EventKind::ProgrammingModeDisabled,
            EventKind::TargetControllerStateChanged,
        ] {
            listener.subscribe(kind);
        }
        bus.register(listener.clone());

        let controller =
            TargetController::new(environment, bus.clone(), tools, TargetRegistry::new());
        let service = controller.service();

        let thread = std::thread::Builder::new()
            .name("TC".to_owned())
            .spawn(move || controller.run())
            .unwrap();

        Self { bus, service, listener, slot, thread: Some(thread) }
    }

    /// Blocks until the controller reports the given lifecycle state.
    pub fn wait_for_state(&self, state: TargetControllerState) {
        let deadline = Instant::now() + STATE_TIMEOUT;

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for state {state:?}"));

            let event = self
                .listener
                .wait_for(&[EventKind::TargetControllerStateChanged], Some(remaining), None)
                .unwrap_or_else(|| panic!("timed out waiting for state {state:?}"));

            if let EventPayload::TargetControllerStateChanged(observed) = &event.payload {
                if *observed == state {
                    return;
                }
            }
        }
    }

    /// Blocks until an event of the given kind arrives.
    pub fn expect_event(&self, kind: EventKind) -> Arc<Event> {
        self.listener
            .wait_for(&[kind], Some(EVENT_TIMEOUT), None)
            .unwrap_or_else(|| panic!("timed out waiting for {kind:?} event"))
    }

    /// The simulated device behind the controller's tool.
    pub fn device(&self) -> Arc<Mutex<SimulatedDevice>> {
        let deadline = Instant::now() + STATE_TIMEOUT;

        loop {
            if let Some(device) = self.slot.lock().unwrap().clone() {
                return device;
            }

            assert!(Instant::now() < deadline, "simulated device was never constructed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Requests shutdown and joins the controller thread.
    pub fn shutdown(mut self) {
        self.bus.publish(EventPayload::ShutdownRequested);
        self.thread.take().unwrap().join().expect("controller thread panicked");
    }

    /// Joins the controller thread without requesting shutdown (for tests
    /// where the controller stops on its own).
    pub fn join(mut self) {
        self.thread.take().unwrap().join().expect("controller thread panicked");
    }
}
