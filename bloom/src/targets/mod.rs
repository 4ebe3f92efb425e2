//! Target adapters.
//!
//! A [`Target`] adapter translates the abstract operations the target
//! controller issues (halt, step, memory access, breakpoints, programming
//! sessions) into concrete transactions on the family interface its debug
//! tool provides. The adapter owns the breakpoint ledger and all
//! family-specific behavior: fuse management on AVR8, mapped-segment
//! aliasing and boot-mode switching on WCH RISC-V.

pub mod avr8;
mod registry;
pub mod wch;

pub use registry::TargetRegistry;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bloom_target::{
    AddressRange, BreakpointResources, MemoryAddress, MemoryBuffer, MemorySize, Pad,
    RegisterDescriptor, TargetDescriptor, TargetFamily,
};

use crate::config::TargetConfig;
use crate::error::Error;
use crate::tools::DebugTool;

/// Instantiates the family adapter for a target, pulling the family
/// interfaces it needs out of the debug tool.
pub fn build_target(
    descriptor: Arc<TargetDescriptor>,
    config: &TargetConfig,
    tool: &mut dyn DebugTool,
) -> Result<Box<dyn Target>, Error> {
    Ok(match descriptor.family {
        TargetFamily::Avr8 => Box::new(avr8::Avr8::new(descriptor, config, tool)?),
        TargetFamily::WchRiscV => Box::new(wch::WchRiscV::new(descriptor, config, tool)?),
    })
}

/// The target's execution state, as observed through the debug interface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetExecutionState {
    /// Not yet observed.
    Unknown,
    /// Halted under debugger control.
    Stopped,
    /// Executing freely.
    Running,
    /// Executing a single instruction step.
    Stepping,
}

impl TargetExecutionState {
    /// Returns true for the running-like states.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Stepping)
    }
}

/// The mode the target is operated in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetMode {
    /// Ordinary debugging - the default.
    Debugging,
    /// A programming session is active.
    Programming,
}

/// Why target execution stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakCause {
    /// Could not be determined.
    Unknown,
    /// A breakpoint was hit.
    Breakpoint,
    /// A single step completed.
    Step,
    /// The host requested a halt.
    HaltRequest,
}

/// The kind of a breakpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    /// A break instruction written into program memory.
    Software,
    /// An on-chip comparator slot.
    Hardware,
}

/// An installed (or to-be-installed) breakpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    /// Key of the address space the breakpoint lives in.
    pub address_space_key: String,
    /// Key of the memory segment the breakpoint lives in.
    pub memory_segment_key: String,
    /// Address of the instruction the breakpoint replaces or watches.
    pub address: MemoryAddress,
    /// Size of the break instruction, in bytes.
    pub size: MemorySize,
    /// Software or hardware.
    pub kind: BreakpointKind,
    /// The instruction bytes a software breakpoint replaced. Populated by the
    /// adapter when the breakpoint is installed; restored on removal.
    pub original_data: Option<MemoryBuffer>,
}

/// A register descriptor paired with a value read from, or to be written to,
/// the target.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterValue {
    /// The register.
    pub descriptor: RegisterDescriptor,
    /// The value, in the byte order of the register's address space.
    pub value: MemoryBuffer,
}

/// Logic level of a GPIO pad.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GpioValue {
    Low,
    High,
}

/// Data direction of a GPIO pad.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GpioDirection {
    Input,
    Output,
}

/// The observable state of a GPIO pad.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GpioPadState {
    /// The pad's logic level (input value for inputs, driven value for
    /// outputs).
    pub value: GpioValue,
    /// The pad's data direction.
    pub direction: GpioDirection,
}

/// A contiguous run of differing bytes within a delta programming session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaRegion {
    /// Address of the first differing block.
    pub address: MemoryAddress,
    /// The replacement bytes, block-aligned.
    pub data: MemoryBuffer,
}

/// The outcome of a handled passthrough command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughResponse {
    /// Output to relay to the issuing debugger.
    pub output: String,
    /// True when the command reset the target, so the controller can publish
    /// the matching event.
    pub target_reset: bool,
}

const PROGRAM_COUNTER_NONE: u64 = u64::MAX;

/// The (execution state, mode, program counter) triple, shared with observer
/// threads.
///
/// Each field is individually atomic. Readers needing a consistent triple
/// must go through the snapshot command, which reads on the controller
/// thread.
#[derive(Debug)]
pub struct SharedTargetState {
    execution_state: AtomicU8,
    mode: AtomicU8,
    program_counter: AtomicU64,
}

impl Default for SharedTargetState {
    fn default() -> Self {
        Self {
            execution_state: AtomicU8::new(0),
            mode: AtomicU8::new(0),
            program_counter: AtomicU64::new(PROGRAM_COUNTER_NONE),
        }
    }
}

impl SharedTargetState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn execution_state(&self) -> TargetExecutionState {
        match self.execution_state.load(Ordering::Acquire) {
            1 => TargetExecutionState::Stopped,
            2 => TargetExecutionState::Running,
            3 => TargetExecutionState::Stepping,
            _ => TargetExecutionState::Unknown,
        }
    }

    pub fn set_execution_state(&self, state: TargetExecutionState) {
        let raw = match state {
            TargetExecutionState::Unknown => 0,
            TargetExecutionState::Stopped => 1,
            TargetExecutionState::Running => 2,
            TargetExecutionState::Stepping => 3,
        };
        self.execution_state.store(raw, Ordering::Release);
    }

    pub fn mode(&self) -> TargetMode {
        match self.mode.load(Ordering::Acquire) {
            1 => TargetMode::Programming,
            _ => TargetMode::Debugging,
        }
    }

    pub fn set_mode(&self, mode: TargetMode) {
        self.mode.store(matches!(mode, TargetMode::Programming) as u8, Ordering::Release);
    }

    /// The program counter, populated only while the target is stopped.
    pub fn program_counter(&self) -> Option<MemoryAddress> {
        match self.program_counter.load(Ordering::Acquire) {
            PROGRAM_COUNTER_NONE => None,
            raw => Some(raw as MemoryAddress),
        }
    }

    pub fn set_program_counter(&self, program_counter: Option<MemoryAddress>) {
        self.program_counter.store(
            program_counter.map_or(PROGRAM_COUNTER_NONE, u64::from),
            Ordering::Release,
        );
    }
}

/// The narrow abstract interface between the target controller and a target
/// family adapter.
///
/// The adapter owns the family debug interface handles and the breakpoint
/// ledger. It is constructed un-activated; [`Target::activate`] attaches to
/// the silicon and must confirm the device signature against the descriptor.
pub trait Target: Send {
    /// The descriptor the adapter was constructed against.
    fn descriptor(&self) -> &Arc<TargetDescriptor>;

    /// Attaches to the target: debug interface init, entry into debug state
    /// (stop + reset) and signature confirmation. May manage fuse bits first,
    /// subject to configuration.
    fn activate(&mut self) -> Result<(), Error>;

    /// Detaches from the target, removing all outstanding breakpoints.
    /// Safe to call on a partially-activated target.
    fn deactivate(&mut self) -> Result<(), Error>;

    /// Breakpoint slots available, after applying configuration (stepping
    /// reservation, hardware breakpoints disabled, ...).
    fn breakpoint_resources(&self) -> BreakpointResources;

    fn execution_state(&mut self) -> Result<TargetExecutionState, Error>;

    fn stop(&mut self) -> Result<(), Error>;
    fn run(&mut self) -> Result<(), Error>;
    fn step(&mut self) -> Result<(), Error>;
    fn reset(&mut self) -> Result<(), Error>;

    fn program_counter(&mut self) -> Result<MemoryAddress, Error>;
    fn set_program_counter(&mut self, address: MemoryAddress) -> Result<(), Error>;

    fn stack_pointer(&mut self) -> Result<u32, Error>;
    fn set_stack_pointer(&mut self, stack_pointer: u32) -> Result<(), Error>;

    /// Reads the given registers, in descriptor order.
    fn read_registers(
        &mut self,
        descriptors: &[RegisterDescriptor],
    ) -> Result<Vec<RegisterValue>, Error>;

    /// Writes the given register values.
    fn write_registers(&mut self, values: &[RegisterValue]) -> Result<(), Error>;

    /// Reads `length` bytes starting at `start_address`. Excluded sub-ranges
    /// are skipped on the wire and zero-filled in the returned buffer, which
    /// always has length `length`.
    fn read_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        length: MemorySize,
        excluded_ranges: &[AddressRange],
    ) -> Result<MemoryBuffer, Error>;

    fn write_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Erases a memory segment, following the family's erase policy for the
    /// segment type.
    fn erase_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
    ) -> Result<(), Error>;

    /// Installs a breakpoint and records it in the ledger. For software
    /// breakpoints the returned record carries the original instruction
    /// bytes.
    fn set_breakpoint(&mut self, breakpoint: Breakpoint) -> Result<Breakpoint, Error>;

    /// Removes a previously installed breakpoint, restoring original bytes
    /// for software breakpoints.
    fn remove_breakpoint(&mut self, breakpoint: &Breakpoint) -> Result<(), Error>;

    /// The ledger of currently installed breakpoints.
    fn breakpoints(&self) -> Vec<Breakpoint>;

    /// Removes every outstanding breakpoint. A failure to remove one entry
    /// must not abort the cleanup of the rest.
    fn clear_all_breakpoints(&mut self) -> Result<(), Error>;

    fn enable_programming_mode(&mut self) -> Result<(), Error>;
    fn disable_programming_mode(&mut self) -> Result<(), Error>;
    fn programming_mode_enabled(&self) -> bool;

    /// The states of the given GPIO pads. Pads that are not GPIO, or whose
    /// port peripheral is disabled, are omitted from the result.
    fn gpio_pad_states(&mut self, pads: &[Pad]) -> Result<Vec<(Pad, GpioPadState)>, Error>;

    /// Drives a GPIO pad to the given state.
    fn set_gpio_pad_state(&mut self, pad: &Pad, state: GpioPadState) -> Result<(), Error>;

    /// The delta programming block size for a segment, or `None` when the
    /// adapter does not support delta programming on it.
    fn delta_block_size(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
    ) -> Option<MemorySize>;

    /// Gives the adapter a veto over a prospective delta programming write
    /// set. On veto, the controller falls back to a full write.
    fn should_abandon_delta(&mut self, regions: &[DeltaRegion]) -> bool {
        let _unused = regions;
        false
    }

    /// Handles a tool/target-specific passthrough command. `None` means the
    /// command is not recognised by this adapter.
    fn invoke_passthrough_command(
        &mut self,
        arguments: &[String],
    ) -> Result<Option<PassthroughResponse>, Error>;

    /// Help text describing the adapter's passthrough commands.
    fn passthrough_help(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_state_program_counter_roundtrip() {
        let state = SharedTargetState::new();
        assert_eq!(state.program_counter(), None);

        state.set_program_counter(Some(0x1000));
        assert_eq!(state.program_counter(), Some(0x1000));

        state.set_program_counter(None);
        assert_eq!(state.program_counter(), None);
    }

    #[test]
    fn shared_state_defaults() {
        let state = SharedTargetState::new();
        assert_eq!(state.execution_state(), TargetExecutionState::Unknown);
        assert_eq!(state.mode(), TargetMode::Debugging);
    }
}
