//! The Target Controller.
//!
//! The controller possesses full control of the debug tool and target. It
//! runs on a dedicated thread, which is the *sole* owner of both - no other
//! component ever touches the hardware. The protocol server and other
//! stakeholders interact with it through typed commands (see
//! [`CommandService`]) and by observing events.
//!
//! The main loop alternates between polling the target's execution state
//! (edge transitions become `TargetExecutionStopped`/`TargetExecutionResumed`
//! events), draining the command queue, and dispatching session events
//! (debug session start/end, shutdown requests). A device communication
//! failure suspends the controller - the hardware is released and commands
//! are rejected until a new debug session triggers reacquisition.

mod commands;
mod memory_cache;
mod programming;
mod service;

pub use commands::{Command, CommandError, CommandId, Response, ResponsePayload};
pub use service::CommandService;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bloom_target::{AddressRange, MemorySegment, MemorySegmentType, RegisterDescriptor};

use crate::config::EnvironmentConfig;
use crate::error::{Error, ErrorKind};
use crate::event::{CondvarNotifier, EventBus, EventKind, EventListener, EventPayload};
use crate::targets::{
    build_target, BreakCause, BreakpointKind, RegisterValue, SharedTargetState, Target,
    TargetExecutionState, TargetMode, TargetRegistry,
};
use crate::tools::{DebugTool, ToolRegistry};

use memory_cache::ProgramMemoryCache;
use service::CommandChannel;

/// The lifecycle state of the target controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetControllerState {
    /// Starting up; hardware not yet acquired.
    Starting,
    /// Hardware acquired; commands are serviced.
    Active,
    /// Hardware released after a failure or end-of-session; waiting for a
    /// new debug session.
    Suspended,
    /// Shutting down; hardware being released.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// The notifier-wait timeout of the main loop, doubling as the
/// execution-state poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(60);

/// Session events the controller reacts to.
const SESSION_EVENT_KINDS: [EventKind; 3] = [
    EventKind::ShutdownRequested,
    EventKind::StartDebugSession,
    EventKind::EndDebugSession,
];

pub struct TargetController {
    environment: EnvironmentConfig,

    bus: Arc<EventBus>,
    listener: Arc<EventListener>,
    notifier: Arc<CondvarNotifier>,
    channel: Arc<CommandChannel>,

    tool_registry: ToolRegistry,
    target_registry: TargetRegistry,

    /// The controller is the sole owner of the tool and target. Ownership is
    /// never transferred to any other component.
    tool: Option<Box<dyn DebugTool>>,
    target: Option<Box<dyn Target>>,

    state: TargetControllerState,
    shared_state: Arc<SharedTargetState>,

    /// Last known execution state; a differing poll result emits a state
    /// change event.
    last_execution_state: TargetExecutionState,
    /// Break cause to attach to the next observed stop (set by the step
    /// handler).
    pending_stop_cause: Option<BreakCause>,

    /// All register descriptors, for mapping memory writes back to register
    /// values.
    register_index: Vec<RegisterDescriptor>,

    memory_cache: ProgramMemoryCache,
    shutdown_requested: bool,
}

impl TargetController {
    pub fn new(
        environment: EnvironmentConfig,
        bus: Arc<EventBus>,
        tool_registry: ToolRegistry,
        target_registry: TargetRegistry,
    ) -> Self {
        let notifier = Arc::new(CondvarNotifier::new());
        let channel = CommandChannel::new(notifier.clone());

        Self {
            environment,
            bus,
            listener: EventListener::new("TargetControllerEventListener"),
            notifier,
            channel,
            tool_registry,
            target_registry,
            tool: None,
            target: None,
            state: TargetControllerState::Starting,
            shared_state: SharedTargetState::new(),
            last_execution_state: TargetExecutionState::Unknown,
            pending_stop_cause: None,
            register_index: Vec::new(),
            memory_cache: ProgramMemoryCache::default(),
            shutdown_requested: false,
        }
    }

    /// The command handle for the protocol server. Clones share one queue.
    pub fn service(&self) -> CommandService {
        CommandService::new(self.channel.clone())
    }

    /// The shared (execution state, mode, program counter) triple.
    pub fn shared_state(&self) -> Arc<SharedTargetState> {
        self.shared_state.clone()
    }

    /// Entry point for the controller thread. Returns once the controller
    /// has shut down.
    pub fn run(mut self) {
        match self.startup() {
            Ok(()) => {
                tracing::debug!("TargetController ready and waiting for events");

                while matches!(
                    self.state,
                    TargetControllerState::Active | TargetControllerState::Suspended
                ) && !self.shutdown_requested
                {
                    if self.state == TargetControllerState::Active {
                        if let Err(error) = self.fire_target_events() {
                            if error.kind() == ErrorKind::DeviceCommunicationFailure {
                                // We assume Bloom has lost control of the
                                // debug tool - unplugged, or reset from
                                // under us. The session may be retried once
                                // the debugger reconnects.
                                tracing::error!("Device failure detected - {error}");
                                tracing::error!("Suspending TargetController");
                                self.suspend();
                            } else {
                                tracing::error!(
                                    "The TargetController encountered a fatal error - {error}"
                                );
                                break;
                            }
                        }
                    }

                    self.notifier.wait(POLL_INTERVAL);

                    self.process_commands();
                    self.service_events();
                }
            }
            Err(error) => {
                tracing::error!("TargetController failed to startup - {error}");
            }
        }

        self.shutdown();
    }

    fn startup(&mut self) -> Result<(), Error> {
        tracing::info!("Starting TargetController");
        self.set_state_and_publish(TargetControllerState::Starting);

        self.listener.set_notifier(self.notifier.clone());
        for kind in SESSION_EVENT_KINDS {
            self.listener.subscribe(kind);
        }
        self.bus.register(self.listener.clone());

        self.acquire_hardware()?;
        self.load_register_index();

        self.set_state_and_publish(TargetControllerState::Active);

        if self.environment.target.resume_on_startup {
            if let Some(target) = self.target.as_mut() {
                if target.execution_state()? != TargetExecutionState::Running {
                    target.run()?;
                }
            }
        }

        Ok(())
    }

    fn acquire_hardware(&mut self) -> Result<(), Error> {
        let tool_name = self.environment.tool.name.clone();
        let target_name = self.environment.target.name.clone();

        let mut tool = self.tool_registry.tool(&tool_name)?;
        let descriptor = self.target_registry.descriptor(&target_name)?;

        tracing::info!("Connecting to debug tool");
        tool.init()?;

        tracing::info!("Debug tool connected");
        tracing::info!("Debug tool name: {}", tool.name());
        if let Some(serial) = tool.serial_number() {
            tracing::info!("Debug tool serial: {serial}");
        }

        let mut target = match build_target(descriptor, &self.environment.target, tool.as_mut())
        {
            Ok(target) => target,
            Err(error) => {
                if let Err(close_error) = tool.close() {
                    tracing::error!("Failed to close debug tool - {close_error}");
                }
                return Err(error);
            }
        };

        tracing::info!("Activating target");
        if let Err(error) = target.activate() {
            // Failure part-way through activation still leaves the process
            // quiescent.
            if let Err(deactivate_error) = target.deactivate() {
                tracing::error!(
                    "Failed to deactivate partially-activated target - {deactivate_error}"
                );
            }
            if let Err(close_error) = tool.close() {
                tracing::error!("Failed to close debug tool - {close_error}");
            }
            return Err(error);
        }
        tracing::info!("Target activated");
        tracing::info!("Target name: {}", target.descriptor().name);

        self.tool = Some(tool);
        self.target = Some(target);
        self.shared_state.set_mode(TargetMode::Debugging);

        Ok(())
    }

    /// Releases whatever hardware was acquired, in reverse order. Idempotent
    /// and best-effort.
    fn release_hardware(&mut self) {
        let target = self.target.take();
        let tool = self.tool.take();

        if let Some(mut tool) = tool {
            if tool.initialised() {
                if let Some(mut target) = target {
                    // Deactivate without checking activation state, to cover
                    // partially-activated targets.
                    tracing::info!("Deactivating target");
                    if let Err(error) = target.deactivate() {
                        tracing::error!("Failed to deactivate target - {error}");
                    }
                }

                tracing::info!("Closing debug tool");
                if let Err(error) = tool.close() {
                    tracing::error!("Failed to close debug tool - {error}");
                }
            }
        }
    }

    fn load_register_index(&mut self) {
        let Some(target) = self.target.as_ref() else { return };

        self.register_index = target
            .descriptor()
            .peripherals
            .iter()
            .flat_map(|peripheral| &peripheral.register_groups)
            .flat_map(|group| &group.registers)
            .cloned()
            .collect();
    }

    fn suspend(&mut self) {
        if self.state == TargetControllerState::Suspended {
            return;
        }

        tracing::debug!("Suspending TargetController");

        self.release_hardware();

        self.last_execution_state = TargetExecutionState::Unknown;
        self.pending_stop_cause = None;
        self.register_index.clear();
        self.memory_cache.clear();
        self.shared_state.set_execution_state(TargetExecutionState::Unknown);
        self.shared_state.set_program_counter(None);

        self.set_state_and_publish(TargetControllerState::Suspended);
        tracing::debug!("TargetController suspended");
    }

    fn resume_from_suspension(&mut self) -> Result<(), Error> {
        tracing::debug!("Waking TargetController");

        self.acquire_hardware()?;
        self.load_register_index();
        self.last_execution_state = TargetExecutionState::Unknown;

        self.set_state_and_publish(TargetControllerState::Active);
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.state == TargetControllerState::Stopped {
            return;
        }

        tracing::info!("Shutting down TargetController");
        self.set_state_and_publish(TargetControllerState::ShuttingDown);

        self.bus.deregister(self.listener.id());
        self.release_hardware();

        self.set_state_and_publish(TargetControllerState::Stopped);
    }

    fn set_state_and_publish(&mut self, state: TargetControllerState) {
        self.state = state;
        self.bus.publish(EventPayload::TargetControllerStateChanged(state));
    }

    /// Emits execution state change events observed from the target.
    fn fire_target_events(&mut self) -> Result<(), Error> {
        let Some(target) = self.target.as_mut() else { return Ok(()) };

        let execution_state = target.execution_state()?;
        if execution_state == self.last_execution_state {
            return Ok(());
        }

        self.last_execution_state = execution_state;
        self.shared_state.set_execution_state(execution_state);

        match execution_state {
            TargetExecutionState::Stopped => {
                let program_counter = target.program_counter()?;
                self.shared_state.set_program_counter(Some(program_counter));

                let cause = self.pending_stop_cause.take().unwrap_or_else(|| {
                    let breakpoint_hit = target
                        .breakpoints()
                        .iter()
                        .any(|breakpoint| breakpoint.address == program_counter);
                    if breakpoint_hit { BreakCause::Breakpoint } else { BreakCause::Unknown }
                });

                tracing::debug!("Target state changed - STOPPED");
                self.bus.publish(EventPayload::TargetExecutionStopped {
                    program_counter,
                    cause,
                });
            }
            TargetExecutionState::Running | TargetExecutionState::Stepping => {
                self.shared_state.set_program_counter(None);
                tracing::debug!("Target state changed - RUNNING");
                self.bus.publish(EventPayload::TargetExecutionResumed);
            }
            TargetExecutionState::Unknown => {}
        }

        Ok(())
    }

    /// Drains the command queue in FIFO order, servicing each command in the
    /// controller thread.
    fn process_commands(&mut self) {
        for (command_id, command) in self.channel.drain() {
            let result = if self.state != TargetControllerState::Active
                && !command.serviceable_when_suspended()
            {
                // Hardware-dependent command handlers are deregistered
                // whilst suspended.
                Err(Error::UnknownCommand)
            } else {
                self.handle_command(&command)
            };

            let suspend_after = matches!(
                &result,
                Err(error) if error.kind() == ErrorKind::DeviceCommunicationFailure
            );

            if let Err(error) = &result {
                tracing::error!("Failed to handle {} command - {error}", command.name());
                self.bus.publish(EventPayload::TargetControllerError {
                    message: error.to_string(),
                });
            }

            self.channel.post_response(commands::Response {
                command_id,
                posted_at: Instant::now(),
                result: result.map_err(|error| commands::CommandError::new(&error)),
            });

            if suspend_after {
                tracing::error!("Device failure detected - suspending TargetController");
                self.suspend();
            }
        }
    }

    /// Dispatches session events queued on the controller's listener.
    fn service_events(&mut self) {
        while let Some(event) =
            self.listener.wait_for(&SESSION_EVENT_KINDS, Some(Duration::ZERO), None)
        {
            match event.kind() {
                EventKind::ShutdownRequested => {
                    self.shutdown_requested = true;
                }
                EventKind::StartDebugSession => {
                    if self.state == TargetControllerState::Suspended {
                        match self.resume_from_suspension() {
                            Ok(()) => {}
                            Err(error) => {
                                tracing::error!("Failed to reacquire hardware - {error}");
                                if !matches!(
                                    error.kind(),
                                    ErrorKind::DeviceCommunicationFailure
                                ) {
                                    self.shutdown_requested = true;
                                }
                                continue;
                            }
                        }
                    }

                    if let Err(error) = self.begin_debug_session() {
                        tracing::error!("Failed to begin debug session - {error}");
                    }
                }
                EventKind::EndDebugSession => {
                    if let Err(error) = self.end_debug_session() {
                        tracing::error!("Failed to end debug session - {error}");
                    }
                }
                _ => {}
            }
        }
    }

    /// Holds the target stopped at its current position, ready for the
    /// debugger.
    fn begin_debug_session(&mut self) -> Result<(), Error> {
        self.reset_target()?;

        let Some(target) = self.target.as_mut() else { return Ok(()) };
        if target.execution_state()? != TargetExecutionState::Stopped {
            target.stop()?;
        }

        self.last_execution_state = TargetExecutionState::Stopped;
        self.shared_state.set_execution_state(TargetExecutionState::Stopped);

        Ok(())
    }

    /// Kicks off execution and, depending on configuration, releases the
    /// hardware or shuts down.
    fn end_debug_session(&mut self) -> Result<(), Error> {
        if self.state == TargetControllerState::Active {
            if let Some(target) = self.target.as_mut() {
                if target.execution_state()? != TargetExecutionState::Running {
                    target.run()?;
                }
            }
            self.fire_target_events()?;
        }

        if self.environment.tool.release_post_debug_session {
            self.suspend();
        }

        if self.environment.shutdown_post_debug_session {
            self.shutdown_requested = true;
        }

        Ok(())
    }

    fn reset_target(&mut self) -> Result<(), Error> {
        let Some(target) = self.target.as_mut() else { return Ok(()) };

        target.reset()?;
        self.memory_cache.clear();

        self.last_execution_state = target.execution_state()?;
        self.shared_state.set_execution_state(self.last_execution_state);
        if self.last_execution_state == TargetExecutionState::Stopped {
            self.shared_state.set_program_counter(Some(target.program_counter()?));
        }

        self.bus.publish(EventPayload::TargetReset);
        Ok(())
    }

    fn require_stopped(&mut self, operation: &str) -> Result<(), Error> {
        let target = self.target_mut()?;
        if target.execution_state()? != TargetExecutionState::Stopped {
            return Err(Error::TargetOperationFailure(format!(
                "invalid target state - target must be stopped before {operation}"
            )));
        }
        Ok(())
    }

    fn target_mut(&mut self) -> Result<&mut Box<dyn Target>, Error> {
        self.target.as_mut().ok_or_else(|| {
            Error::TargetOperationFailure("no target hardware is currently acquired".to_owned())
        })
    }

    fn resolve_segment(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
    ) -> Result<MemorySegment, Error> {
        let target = self.target_mut()?;
        Ok(target
            .descriptor()
            .address_space(address_space_key)?
            .segment(memory_segment_key)?
            .clone())
    }

    /// The applicable access record for a segment, per the current mode.
    fn check_access(
        &mut self,
        segment: &MemorySegment,
        write: bool,
    ) -> Result<(), Error> {
        let programming = self.target_mut()?.programming_mode_enabled();
        let access = if programming {
            segment.programming_mode_access
        } else {
            segment.debug_mode_access
        };

        let permitted = if write { access.writeable } else { access.readable };
        if !permitted {
            return Err(Error::AccessDenied(format!(
                "memory segment \"{}\" does not permit {} access in {} mode",
                segment.key,
                if write { "write" } else { "read" },
                if programming { "programming" } else { "debug" },
            )));
        }

        Ok(())
    }

    fn handle_command(&mut self, command: &Command) -> Result<ResponsePayload, Error> {
        match command {
            Command::StopExecution => {
                let target = self.target_mut()?;
                if target.execution_state()? != TargetExecutionState::Stopped {
                    target.stop()?;
                }

                let program_counter = target.program_counter()?;
                self.last_execution_state = TargetExecutionState::Stopped;
                self.shared_state.set_execution_state(TargetExecutionState::Stopped);
                self.shared_state.set_program_counter(Some(program_counter));

                self.bus.publish(EventPayload::TargetExecutionStopped {
                    program_counter,
                    cause: BreakCause::HaltRequest,
                });

                Ok(ResponsePayload::Ok)
            }

            Command::ResumeExecution { from_program_counter } => {
                let target = self.target_mut()?;
                if target.execution_state()? != TargetExecutionState::Running {
                    if let Some(address) = from_program_counter {
                        target.set_program_counter(*address)?;
                    }
                    target.run()?;
                }

                self.last_execution_state = TargetExecutionState::Running;
                self.shared_state.set_execution_state(TargetExecutionState::Running);
                self.shared_state.set_program_counter(None);

                self.bus.publish(EventPayload::TargetExecutionResumed);
                Ok(ResponsePayload::Ok)
            }

            Command::StepExecution { from_program_counter } => {
                let target = self.target_mut()?;
                if target.execution_state()? != TargetExecutionState::Stopped {
                    return Err(Error::TargetOperationFailure(
                        "cannot step the target whilst it is running".to_owned(),
                    ));
                }

                if let Some(address) = from_program_counter {
                    target.set_program_counter(*address)?;
                }
                target.step()?;

                // The next observed stop is the completed step.
                self.pending_stop_cause = Some(BreakCause::Step);
                self.last_execution_state = TargetExecutionState::Running;
                self.shared_state.set_execution_state(TargetExecutionState::Running);
                self.shared_state.set_program_counter(None);

                self.bus.publish(EventPayload::TargetExecutionResumed);
                Ok(ResponsePayload::Ok)
            }

            Command::ResetTarget => {
                self.reset_target()?;
                Ok(ResponsePayload::Ok)
            }

            Command::ReadRegisters { descriptors } => {
                let values = self.target_mut()?.read_registers(descriptors)?;
                Ok(ResponsePayload::Registers(values))
            }

            Command::WriteRegisters { values } => {
                self.target_mut()?.write_registers(values)?;
                self.bus.publish(EventPayload::RegistersWritten(values.clone()));
                Ok(ResponsePayload::Ok)
            }

            Command::ReadMemory {
                address_space_key,
                memory_segment_key,
                start_address,
                length,
                excluded_ranges,
            } => {
                if *length == 0 {
                    return Ok(ResponsePayload::Memory(Vec::new()));
                }

                let segment = self.resolve_segment(address_space_key, memory_segment_key)?;
                let requested =
                    AddressRange::new(*start_address, *start_address + *length - 1);

                if !segment.address_range.contains_range(&requested) {
                    return Err(Error::RangeViolation(format!(
                        "read of {length} bytes at 0x{start_address:08x} breaches memory \
                         segment \"{}\" (0x{:08x} -> 0x{:08x})",
                        segment.key, segment.address_range.start, segment.address_range.end,
                    )));
                }

                self.check_access(&segment, false)?;

                let data = self.read_memory_cached(
                    address_space_key,
                    memory_segment_key,
                    &segment,
                    *start_address,
                    *length,
                    excluded_ranges,
                )?;

                if self.bus.kind_listened_for(EventKind::MemoryRead) {
                    self.bus.publish(EventPayload::MemoryRead(data.clone()));
                }

                Ok(ResponsePayload::Memory(data))
            }

            Command::WriteMemory {
                address_space_key,
                memory_segment_key,
                start_address,
                data,
            } => {
                if data.is_empty() {
                    return Ok(ResponsePayload::Ok);
                }

                let segment = self.resolve_segment(address_space_key, memory_segment_key)?;
                let requested = AddressRange::new(
                    *start_address,
                    *start_address + data.len() as u32 - 1,
                );

                if !segment.address_range.contains_range(&requested) {
                    return Err(Error::RangeViolation(format!(
                        "write of {} bytes at 0x{start_address:08x} breaches memory segment \
                         \"{}\" (0x{:08x} -> 0x{:08x})",
                        data.len(),
                        segment.key,
                        segment.address_range.start,
                        segment.address_range.end,
                    )));
                }

                self.check_access(&segment, true)?;

                self.write_memory_inner(
                    address_space_key,
                    memory_segment_key,
                    &segment,
                    *start_address,
                    data,
                )?;

                self.memory_cache.invalidate(address_space_key, memory_segment_key);

                self.bus.publish(EventPayload::MemoryWritten {
                    address_space_key: address_space_key.clone(),
                    memory_segment_key: memory_segment_key.clone(),
                    address: *start_address,
                    length: data.len() as u32,
                });

                // If the write covered any known registers, let observers
                // refresh - but only bother when someone is subscribed.
                if self.bus.kind_listened_for(EventKind::RegistersWritten) {
                    let written =
                        self.registers_within(address_space_key, &requested, data);
                    if !written.is_empty() {
                        self.bus.publish(EventPayload::RegistersWritten(written));
                    }
                }

                Ok(ResponsePayload::Ok)
            }

            Command::EraseMemory { address_space_key, memory_segment_key } => {
                self.target_mut()?.erase_memory(address_space_key, memory_segment_key)?;
                self.memory_cache.invalidate(address_space_key, memory_segment_key);
                Ok(ResponsePayload::Ok)
            }

            Command::SetBreakpoint { breakpoint } => {
                let installed = self.target_mut()?.set_breakpoint(breakpoint.clone())?;

                if installed.kind == BreakpointKind::Software {
                    self.memory_cache
                        .invalidate(&installed.address_space_key, &installed.memory_segment_key);
                    self.memory_cache
                        .invalidate(&breakpoint.address_space_key, &breakpoint.memory_segment_key);
                }

                Ok(ResponsePayload::Breakpoint(installed))
            }

            Command::RemoveBreakpoint { breakpoint } => {
                self.target_mut()?.remove_breakpoint(breakpoint)?;

                if breakpoint.kind == BreakpointKind::Software {
                    self.memory_cache
                        .invalidate(&breakpoint.address_space_key, &breakpoint.memory_segment_key);
                }

                Ok(ResponsePayload::Ok)
            }

            Command::SetProgramCounter { address } => {
                self.require_stopped("the program counter can be updated")?;
                self.target_mut()?.set_program_counter(*address)?;
                self.shared_state.set_program_counter(Some(*address));
                Ok(ResponsePayload::Ok)
            }

            Command::GetStackPointer => {
                self.require_stopped("the stack pointer can be retrieved")?;
                let stack_pointer = self.target_mut()?.stack_pointer()?;
                Ok(ResponsePayload::StackPointer(stack_pointer))
            }

            Command::EnableProgrammingMode => {
                let target = self.target_mut()?;
                if target.programming_mode_enabled() {
                    return Err(Error::TargetOperationFailure(
                        "a programming session is already active".to_owned(),
                    ));
                }

                // Fully quiesce the target before the mode change.
                if target.execution_state()? != TargetExecutionState::Stopped {
                    target.stop()?;
                }
                target.enable_programming_mode()?;

                self.last_execution_state = TargetExecutionState::Stopped;
                self.shared_state.set_execution_state(TargetExecutionState::Stopped);
                self.shared_state.set_mode(TargetMode::Programming);
                self.memory_cache.clear();

                self.bus.publish(EventPayload::ProgrammingModeEnabled);
                Ok(ResponsePayload::Ok)
            }

            Command::DisableProgrammingMode => {
                let target = self.target_mut()?;
                if !target.programming_mode_enabled() {
                    return Ok(ResponsePayload::Ok);
                }

                target.disable_programming_mode()?;

                self.last_execution_state = TargetExecutionState::Stopped;
                self.shared_state.set_execution_state(TargetExecutionState::Stopped);
                self.shared_state.set_mode(TargetMode::Debugging);

                self.bus.publish(EventPayload::ProgrammingModeDisabled);
                Ok(ResponsePayload::Ok)
            }

            Command::GetGpioStates { pad_ids } => {
                self.require_stopped("pad states can be retrieved")?;

                let target = self.target_mut()?;
                let pads: Vec<_> = target
                    .descriptor()
                    .pads
                    .iter()
                    .filter(|pad| pad_ids.contains(&pad.id))
                    .cloned()
                    .collect();

                let states = target.gpio_pad_states(&pads)?;
                Ok(ResponsePayload::GpioStates(states))
            }

            Command::SetGpioState { pad_id, state } => {
                self.require_stopped("pad state can be set")?;

                let target = self.target_mut()?;
                let pad = target
                    .descriptor()
                    .pad(*pad_id)
                    .cloned()
                    .ok_or_else(|| {
                        Error::TargetOperationFailure(format!("unknown pad id {pad_id}"))
                    })?;

                target.set_gpio_pad_state(&pad, *state)?;
                Ok(ResponsePayload::Ok)
            }

            Command::GetTargetDescriptor => {
                let descriptor = self.target_mut()?.descriptor().clone();
                Ok(ResponsePayload::TargetDescriptor(descriptor))
            }

            Command::GetTargetState => Ok(ResponsePayload::TargetState {
                execution_state: self.shared_state.execution_state(),
                mode: self.shared_state.mode(),
                program_counter: self.shared_state.program_counter(),
            }),

            Command::Passthrough { arguments } => {
                let target = self.target_mut()?;
                match target.invoke_passthrough_command(arguments)? {
                    Some(response) => {
                        if response.target_reset {
                            self.memory_cache.clear();
                            self.bus.publish(EventPayload::TargetReset);
                        }
                        Ok(ResponsePayload::Passthrough(response.output))
                    }
                    None => {
                        let help = self
                            .target_mut()?
                            .passthrough_help()
                            .map(|help| format!("\n\nSupported commands:\n\n{help}"))
                            .unwrap_or_default();
                        Err(Error::Unsupported(format!(
                            "unrecognised passthrough command{help}"
                        )))
                    }
                }
            }
        }
    }

    /// Serves a memory read, through the program memory cache when the
    /// segment and configuration permit.
    fn read_memory_cached(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        segment: &MemorySegment,
        start_address: u32,
        length: u32,
        excluded_ranges: &[AddressRange],
    ) -> Result<Vec<u8>, Error> {
        let cacheable = segment.segment_type == MemorySegmentType::Flash
            && self.environment.target.program_memory_cache
            && excluded_ranges.is_empty()
            && !self.target_mut()?.programming_mode_enabled();

        if !cacheable {
            return self.target_mut()?.read_memory(
                address_space_key,
                memory_segment_key,
                start_address,
                length,
                excluded_ranges,
            );
        }

        if let Some(data) =
            self.memory_cache.read(address_space_key, memory_segment_key, start_address, length)
        {
            return Ok(data);
        }

        // Populate the cache with the whole segment in one transfer -
        // subsequent reads during this debug session are free.
        let image = self.target_mut()?.read_memory(
            address_space_key,
            memory_segment_key,
            segment.address_range.start,
            segment.size(),
            &[],
        )?;

        self.memory_cache.insert(
            address_space_key,
            memory_segment_key,
            segment.address_range.start,
            image,
        );

        self.memory_cache
            .read(address_space_key, memory_segment_key, start_address, length)
            .ok_or_else(|| {
                Error::Fatal("program memory cache lookup failed after population".to_owned())
            })
    }

    /// Performs the actual write, routing large programming-session flash
    /// writes through delta programming when the adapter supports it.
    fn write_memory_inner(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        segment: &MemorySegment,
        start_address: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let delta_programming_enabled = self.environment.target.delta_programming;
        let target = self.target_mut()?;

        let delta_eligible = segment.segment_type == MemorySegmentType::Flash
            && target.programming_mode_enabled()
            && delta_programming_enabled;

        if delta_eligible {
            if let Some(block_size) =
                target.delta_block_size(address_space_key, memory_segment_key)
            {
                if data.len() as u32 > block_size {
                    let current = target.read_memory(
                        address_space_key,
                        memory_segment_key,
                        start_address,
                        data.len() as u32,
                        &[],
                    )?;

                    let regions = programming::build_delta_regions(
                        &current,
                        data,
                        start_address,
                        block_size,
                    );

                    if regions.is_empty() {
                        tracing::debug!("Delta session: no differing blocks - nothing to write");
                        return Ok(());
                    }

                    if !target.should_abandon_delta(&regions) {
                        tracing::debug!(
                            "Delta session: writing {} region(s) instead of {} bytes",
                            regions.len(),
                            data.len()
                        );
                        for region in &regions {
                            target.write_memory(
                                address_space_key,
                                memory_segment_key,
                                region.address,
                                &region.data,
                            )?;
                        }
                        return Ok(());
                    }

                    tracing::debug!("Delta session abandoned by the target driver");
                }
            }
        }

        target.write_memory(address_space_key, memory_segment_key, start_address, data)
    }

    /// Register values reconstructed from a memory write buffer, for
    /// registers wholly contained in the written range.
    fn registers_within(
        &self,
        address_space_key: &str,
        written: &AddressRange,
        data: &[u8],
    ) -> Vec<RegisterValue> {
        self.register_index
            .iter()
            .filter(|register| {
                register.address_space_key == address_space_key
                    && register.start_address >= written.start
                    && register.end_address() <= written.end
            })
            .map(|register| {
                let offset = (register.start_address - written.start) as usize;
                RegisterValue {
                    descriptor: register.clone(),
                    value: data[offset..offset + register.size as usize].to_vec(),
                }
            })
            .collect()
    }
}
