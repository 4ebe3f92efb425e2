use std::sync::Arc;
use std::time::Instant;

use bloom_target::{
    AddressRange, MemoryAddress, MemoryBuffer, MemorySize, Pad, RegisterDescriptor,
    TargetDescriptor,
};

use crate::error::{Error, ErrorKind};
use crate::targets::{
    Breakpoint, GpioPadState, RegisterValue, TargetExecutionState, TargetMode,
};

/// Unique identifier of a submitted command.
pub type CommandId = u64;

/// A typed request for the target controller. The protocol server never
/// touches the target adapter directly - every interaction goes through one
/// of these.
#[derive(Debug, Clone)]
pub enum Command {
    StopExecution,
    ResumeExecution {
        /// Resume from this address instead of the current program counter.
        from_program_counter: Option<MemoryAddress>,
    },
    StepExecution {
        /// Step from this address instead of the current program counter.
        from_program_counter: Option<MemoryAddress>,
    },
    ResetTarget,
    ReadRegisters {
        descriptors: Vec<RegisterDescriptor>,
    },
    WriteRegisters {
        values: Vec<RegisterValue>,
    },
    ReadMemory {
        address_space_key: String,
        memory_segment_key: String,
        start_address: MemoryAddress,
        length: MemorySize,
        /// Sub-ranges to skip on the wire - the returned buffer carries 0x00
        /// at their positions.
        excluded_ranges: Vec<AddressRange>,
    },
    WriteMemory {
        address_space_key: String,
        memory_segment_key: String,
        start_address: MemoryAddress,
        data: MemoryBuffer,
    },
    EraseMemory {
        address_space_key: String,
        memory_segment_key: String,
    },
    SetBreakpoint {
        breakpoint: Breakpoint,
    },
    RemoveBreakpoint {
        breakpoint: Breakpoint,
    },
    SetProgramCounter {
        address: MemoryAddress,
    },
    GetStackPointer,
    EnableProgrammingMode,
    DisableProgrammingMode,
    GetGpioStates {
        pad_ids: Vec<usize>,
    },
    SetGpioState {
        pad_id: usize,
        state: GpioPadState,
    },
    GetTargetDescriptor,
    /// Consistent snapshot of the (execution state, mode, program counter)
    /// triple, read on the controller thread.
    GetTargetState,
    Passthrough {
        arguments: Vec<String>,
    },
}

impl Command {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StopExecution => "StopExecution",
            Self::ResumeExecution { .. } => "ResumeExecution",
            Self::StepExecution { .. } => "StepExecution",
            Self::ResetTarget => "ResetTarget",
            Self::ReadRegisters { .. } => "ReadRegisters",
            Self::WriteRegisters { .. } => "WriteRegisters",
            Self::ReadMemory { .. } => "ReadMemory",
            Self::WriteMemory { .. } => "WriteMemory",
            Self::EraseMemory { .. } => "EraseMemory",
            Self::SetBreakpoint { .. } => "SetBreakpoint",
            Self::RemoveBreakpoint { .. } => "RemoveBreakpoint",
            Self::SetProgramCounter { .. } => "SetProgramCounter",
            Self::GetStackPointer => "GetStackPointer",
            Self::EnableProgrammingMode => "EnableProgrammingMode",
            Self::DisableProgrammingMode => "DisableProgrammingMode",
            Self::GetGpioStates { .. } => "GetGpioStates",
            Self::SetGpioState { .. } => "SetGpioState",
            Self::GetTargetDescriptor => "GetTargetDescriptor",
            Self::GetTargetState => "GetTargetState",
            Self::Passthrough { .. } => "Passthrough",
        }
    }

    /// True for commands the controller still services while suspended.
    pub fn serviceable_when_suspended(&self) -> bool {
        matches!(self, Self::GetTargetState)
    }
}

/// The success payload of a response.
#[derive(Debug, Clone)]
pub enum ResponsePayload {
    Ok,
    Registers(Vec<RegisterValue>),
    Memory(MemoryBuffer),
    StackPointer(u32),
    Breakpoint(Breakpoint),
    GpioStates(Vec<(Pad, GpioPadState)>),
    TargetDescriptor(Arc<TargetDescriptor>),
    TargetState {
        execution_state: TargetExecutionState,
        mode: TargetMode,
        program_counter: Option<MemoryAddress>,
    },
    Passthrough(String),
}

/// The error half of a response: a kind from the error taxonomy plus a
/// human-readable message.
#[derive(Debug, Clone)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(error: &Error) -> Self {
        Self { kind: error.kind(), message: error.to_string() }
    }

    /// Reconstructs an [`Error`] for callers that propagate with `?`.
    pub fn into_error(self) -> Error {
        match self.kind {
            ErrorKind::InvalidConfig => Error::InvalidConfig(self.message),
            ErrorKind::DeviceCommunicationFailure => {
                Error::DeviceCommunicationFailure(self.message)
            }
            ErrorKind::TargetOperationFailure => Error::TargetOperationFailure(self.message),
            ErrorKind::RangeViolation => Error::RangeViolation(self.message),
            ErrorKind::AccessDenied => Error::AccessDenied(self.message),
            ErrorKind::ProgrammingModeRequired => Error::ProgrammingModeRequired(self.message),
            ErrorKind::FuseSafetyCheckFailed => Error::FuseSafetyCheckFailed(self.message),
            ErrorKind::BreakpointResourceExhausted => {
                Error::BreakpointResourceExhausted(self.message)
            }
            ErrorKind::UnknownCommand => Error::UnknownCommand,
            ErrorKind::Unsupported => Error::Unsupported(self.message),
            ErrorKind::Fatal => Error::Fatal(self.message),
        }
    }
}

/// A response to a submitted command.
#[derive(Debug, Clone)]
pub struct Response {
    /// The command this responds to.
    pub command_id: CommandId,
    /// When the response was posted. Strictly after any events causally
    /// produced by the command's handler.
    pub posted_at: Instant,
    /// Success payload or typed error.
    pub result: Result<ResponsePayload, CommandError>,
}
