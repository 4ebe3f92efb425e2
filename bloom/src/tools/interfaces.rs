use bloom_target::{
    FuseValue, MemoryAddress, MemoryBuffer, MemorySize, RegisterDescriptor, TargetSignature,
};

use crate::error::Error;
use crate::targets::TargetExecutionState;

/// The debug interface a tool exposes for AVR8 targets.
///
/// One instance drives one target over one physical interface (debugWIRE,
/// JTAG, PDI or UPDI). Memory operations are addressed by address-space and
/// segment key, as carried in the target descriptor the interface was
/// constructed against.
pub trait Avr8DebugInterface: Send {
    /// Prepares the tool-side session (physical interface selection, clock
    /// configuration). No target communication takes place.
    fn init(&mut self) -> Result<(), Error>;

    /// Activates the physical interface and attaches to the OCD.
    ///
    /// debugWIRE activation failures are reported as
    /// [`Error::DebugWireActivation`], so the caller can attempt DWEN fuse
    /// recovery over ISP.
    fn activate(&mut self) -> Result<(), Error>;

    /// Detaches from the OCD and deactivates the physical interface.
    fn deactivate(&mut self) -> Result<(), Error>;

    /// Reads the device signature from the target.
    fn device_signature(&mut self) -> Result<TargetSignature, Error>;

    fn stop(&mut self) -> Result<(), Error>;
    fn run(&mut self) -> Result<(), Error>;
    fn step(&mut self) -> Result<(), Error>;
    fn reset(&mut self) -> Result<(), Error>;

    /// The target's current execution state, as reported by the OCD.
    fn execution_state(&mut self) -> Result<TargetExecutionState, Error>;

    fn program_counter(&mut self) -> Result<MemoryAddress, Error>;
    fn set_program_counter(&mut self, address: MemoryAddress) -> Result<(), Error>;

    fn read_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        length: MemorySize,
    ) -> Result<MemoryBuffer, Error>;

    fn write_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Performs a full chip erase. May erase EEPROM, subject to the EESAVE
    /// fuse.
    fn erase_chip(&mut self) -> Result<(), Error>;

    /// Erases program memory only (per-page erase targets).
    fn erase_program_memory(&mut self) -> Result<(), Error>;

    fn enable_programming_mode(&mut self) -> Result<(), Error>;
    fn disable_programming_mode(&mut self) -> Result<(), Error>;

    /// Programs a hardware breakpoint comparator slot.
    fn set_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error>;
    /// Clears the comparator slot programmed with `address`.
    fn clear_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error>;
}

/// The AVR ISP (SPI programming) interface.
///
/// Never a debug interface - Bloom only uses ISP to inspect and update fuses
/// on debugWIRE targets, where the debug interface itself is gated behind the
/// DWEN fuse.
pub trait AvrIspInterface: Send {
    fn activate(&mut self) -> Result<(), Error>;
    fn deactivate(&mut self) -> Result<(), Error>;

    /// Reads the device signature over ISP.
    fn device_signature(&mut self) -> Result<TargetSignature, Error>;

    /// Reads the fuse byte holding the given fuse register.
    fn read_fuse(&mut self, descriptor: &RegisterDescriptor) -> Result<FuseValue, Error>;

    /// Programs the fuse byte holding the given fuse register.
    fn program_fuse(
        &mut self,
        descriptor: &RegisterDescriptor,
        value: FuseValue,
    ) -> Result<(), Error>;

    /// Reads the lock bit byte.
    fn read_lock_bit_byte(&mut self) -> Result<u8, Error>;
}

/// The debug interface a tool exposes for WCH RISC-V targets (SDI).
pub trait RiscvDebugInterface: Send {
    fn init(&mut self) -> Result<(), Error>;
    fn activate(&mut self) -> Result<(), Error>;
    fn deactivate(&mut self) -> Result<(), Error>;

    /// Reads the device id from the target.
    fn device_signature(&mut self) -> Result<TargetSignature, Error>;

    fn stop(&mut self) -> Result<(), Error>;
    fn run(&mut self) -> Result<(), Error>;
    fn step(&mut self) -> Result<(), Error>;
    fn reset(&mut self) -> Result<(), Error>;

    fn execution_state(&mut self) -> Result<TargetExecutionState, Error>;

    fn program_counter(&mut self) -> Result<MemoryAddress, Error>;
    fn set_program_counter(&mut self, address: MemoryAddress) -> Result<(), Error>;

    /// Reads a CPU register (x1-x31) by its ABI number.
    fn read_cpu_register(&mut self, number: u8) -> Result<u32, Error>;
    /// Writes a CPU register (x1-x31) by its ABI number.
    fn write_cpu_register(&mut self, number: u8, value: u32) -> Result<(), Error>;

    fn read_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        length: MemorySize,
    ) -> Result<MemoryBuffer, Error>;

    fn write_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Attempts a single-byte read, reporting whether the access succeeded.
    /// Used to resolve mapped-segment aliasing by probing a known
    /// out-of-bounds address.
    fn probe_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        address: MemoryAddress,
    ) -> Result<bool, Error>;

    /// Programs a hardware breakpoint comparator slot.
    fn set_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error>;
    /// Clears the comparator slot programmed with `address`.
    fn clear_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error>;

    fn enable_programming_mode(&mut self) -> Result<(), Error>;
    fn disable_programming_mode(&mut self) -> Result<(), Error>;
}

/// Target power control, for tools that can switch the target's supply.
pub trait TargetPowerInterface: Send {
    fn enable_target_power(&mut self) -> Result<(), Error>;
    fn disable_target_power(&mut self) -> Result<(), Error>;
}
