use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bloom_target::{
    AddressRange, MemoryAddress, MemoryBuffer, MemorySize, Pad, RegisterDescriptor,
    TargetDescriptor,
};

use crate::error::Error;
use crate::event::{CondvarNotifier, Notifier};
use crate::targets::{Breakpoint, GpioPadState, RegisterValue};

use super::commands::{Command, CommandId, Response, ResponsePayload};

/// Default timeout applied by the convenience wrappers. Generous enough for
/// slow operations such as a chip erase.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// The command channel between the protocol server and the controller
/// thread: a FIFO command queue plus a response map, each behind its own
/// mutex.
pub(crate) struct CommandChannel {
    queue: Mutex<VecDeque<(CommandId, Command)>>,
    responses: Mutex<HashMap<CommandId, Response>>,
    response_condvar: Condvar,
    next_command_id: AtomicU64,
    /// Wakes the controller thread out of its poll wait on every submit.
    notifier: Arc<CondvarNotifier>,
}

impl CommandChannel {
    pub(crate) fn new(notifier: Arc<CondvarNotifier>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            responses: Mutex::new(HashMap::new()),
            response_condvar: Condvar::new(),
            next_command_id: AtomicU64::new(1),
            notifier,
        })
    }

    /// Removes and returns all queued commands, in submission order.
    pub(crate) fn drain(&self) -> Vec<(CommandId, Command)> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Posts a response and wakes any thread blocked on it.
    pub(crate) fn post_response(&self, response: Response) {
        self.responses.lock().unwrap().insert(response.command_id, response);
        self.response_condvar.notify_all();
    }
}

/// The protocol server's handle onto the target controller.
///
/// Cloneable and thread-safe; every clone feeds the same command queue.
#[derive(Clone)]
pub struct CommandService {
    channel: Arc<CommandChannel>,
}

impl CommandService {
    pub(crate) fn new(channel: Arc<CommandChannel>) -> Self {
        Self { channel }
    }

    /// Enqueues a command and returns its id. The controller thread is woken
    /// immediately.
    pub fn submit(&self, command: Command) -> CommandId {
        let id = self.channel.next_command_id.fetch_add(1, Ordering::Relaxed);
        self.channel.queue.lock().unwrap().push_back((id, command));
        self.channel.notifier.notify();
        id
    }

    /// Blocks until the response for `command_id` is posted, or until
    /// `timeout` expires. `None` timeout blocks indefinitely.
    pub fn await_response(
        &self,
        command_id: CommandId,
        timeout: Option<Duration>,
    ) -> Option<Response> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut responses = self.channel.responses.lock().unwrap();

        loop {
            if let Some(response) = responses.remove(&command_id) {
                return Some(response);
            }

            responses = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }

                    let (responses, _) = self
                        .channel
                        .response_condvar
                        .wait_timeout(responses, deadline - now)
                        .unwrap();
                    responses
                }
                None => self.channel.response_condvar.wait(responses).unwrap(),
            };
        }
    }

    /// Submits a command and waits for its response, mapping response errors
    /// back into [`Error`].
    pub fn execute(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<ResponsePayload, Error> {
        let name = command.name();
        let command_id = self.submit(command);

        let response = self.await_response(command_id, timeout).ok_or_else(|| {
            Error::TargetOperationFailure(format!(
                "timed out waiting for a response to the {name} command"
            ))
        })?;

        response.result.map_err(|error| error.into_error())
    }

    fn execute_default(&self, command: Command) -> Result<ResponsePayload, Error> {
        self.execute(command, Some(DEFAULT_RESPONSE_TIMEOUT))
    }

    // Convenience wrappers, for callers that don't need raw submit/await.

    pub fn stop_execution(&self) -> Result<(), Error> {
        self.execute_default(Command::StopExecution).map(|_| ())
    }

    pub fn resume_execution(
        &self,
        from_program_counter: Option<MemoryAddress>,
    ) -> Result<(), Error> {
        self.execute_default(Command::ResumeExecution { from_program_counter }).map(|_| ())
    }

    pub fn step_execution(
        &self,
        from_program_counter: Option<MemoryAddress>,
    ) -> Result<(), Error> {
        self.execute_default(Command::StepExecution { from_program_counter }).map(|_| ())
    }

    pub fn reset_target(&self) -> Result<(), Error> {
        self.execute_default(Command::ResetTarget).map(|_| ())
    }

    pub fn read_registers(
        &self,
        descriptors: Vec<RegisterDescriptor>,
    ) -> Result<Vec<RegisterValue>, Error> {
        match self.execute_default(Command::ReadRegisters { descriptors })? {
            ResponsePayload::Registers(values) => Ok(values),
            _ => Err(Error::Fatal("unexpected response payload".to_owned())),
        }
    }

    pub fn write_registers(&self, values: Vec<RegisterValue>) -> Result<(), Error> {
        self.execute_default(Command::WriteRegisters { values }).map(|_| ())
    }

    pub fn read_memory(
        &self,
        address_space_key: impl Into<String>,
        memory_segment_key: impl Into<String>,
        start_address: MemoryAddress,
        length: MemorySize,
        excluded_ranges: Vec<AddressRange>,
    ) -> Result<MemoryBuffer, Error> {
        match self.execute_default(Command::ReadMemory {
            address_space_key: address_space_key.into(),
            memory_segment_key: memory_segment_key.into(),
            start_address,
            length,
            excluded_ranges,
        })? {
            ResponsePayload::Memory(data) => Ok(data),
            _ => Err(Error::Fatal("unexpected response payload".to_owned())),
        }
    }

    pub fn write_memory(
        &self,
        address_space_key: impl Into<String>,
        memory_segment_key: impl Into<String>,
        start_address: MemoryAddress,
        data: MemoryBuffer,
    ) -> Result<(), Error> {
        self.execute_default(Command::WriteMemory {
            address_space_key: address_space_key.into(),
            memory_segment_key: memory_segment_key.into(),
            start_address,
            data,
        })
        .map(|_| ())
    }

    pub fn erase_memory(
        &self,
        address_space_key: impl Into<String>,
        memory_segment_key: impl Into<String>,
    ) -> Result<(), Error> {
        self.execute_default(Command::EraseMemory {
            address_space_key: address_space_key.into(),
            memory_segment_key: memory_segment_key.into(),
        })
        .map(|_| ())
    }

    pub fn set_breakpoint(&self, breakpoint: Breakpoint) -> Result<Breakpoint, Error> {
        match self.execute_default(Command::SetBreakpoint { breakpoint })? {
            ResponsePayload::Breakpoint(installed) => Ok(installed),
            _ => Err(Error::Fatal("unexpected response payload".to_owned())),
        }
    }

    pub fn remove_breakpoint(&self, breakpoint: Breakpoint) -> Result<(), Error> {
        self.execute_default(Command::RemoveBreakpoint { breakpoint }).map(|_| ())
    }

    pub fn set_program_counter(&self, address: MemoryAddress) -> Result<(), Error> {
        self.execute_default(Command::SetProgramCounter { address }).map(|_| ())
    }

    pub fn stack_pointer(&self) -> Result<u32, Error> {
        match self.execute_default(Command::GetStackPointer)? {
            ResponsePayload::StackPointer(stack_pointer) => Ok(stack_pointer),
            _ => Err(Error::Fatal("unexpected response payload".to_owned())),
        }
    }

    pub fn enable_programming_mode(&self) -> Result<(), Error> {
        self.execute_default(Command::EnableProgrammingMode).map(|_| ())
    }

    pub fn disable_programming_mode(&self) -> Result<(), Error> {
        self.execute_default(Command::DisableProgrammingMode).map(|_| ())
    }

    pub fn gpio_states(&self, pad_ids: Vec<usize>) -> Result<Vec<(Pad, GpioPadState)>, Error> {
        match self.execute_default(Command::GetGpioStates { pad_ids })? {
            ResponsePayload::GpioStates(states) => Ok(states),
            _ => Err(Error::Fatal("unexpected response payload".to_owned())),
        }
    }

    pub fn set_gpio_state(&self, pad_id: usize, state: GpioPadState) -> Result<(), Error> {
        self.execute_default(Command::SetGpioState { pad_id, state }).map(|_| ())
    }

    pub fn target_descriptor(&self) -> Result<Arc<TargetDescriptor>, Error> {
        match self.execute_default(Command::GetTargetDescriptor)? {
            ResponsePayload::TargetDescriptor(descriptor) => Ok(descriptor),
            _ => Err(Error::Fatal("unexpected response payload".to_owned())),
        }
    }

    pub fn invoke_passthrough_command(&self, arguments: Vec<String>) -> Result<String, Error> {
        match self.execute_default(Command::Passthrough { arguments })? {
            ResponsePayload::Passthrough(output) => Ok(output),
            _ => Err(Error::Fatal("unexpected response payload".to_owned())),
        }
    }
}
