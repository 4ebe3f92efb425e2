//! The WCH RISC-V target adapter.
//!
//! Drives WCH CH32-series targets over the single-wire SDI interface. The
//! parts expose a *mapped* program-memory segment at the bottom of the
//! address space, aliasing either the main program segment ("user mode") or
//! the boot loader segment ("boot mode") depending on a flash status register
//! bit. Accesses through the mapped segment are de-aliased here, and a
//! passthrough command switches between the modes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bloom_target::{
    AddressRange, BitField, BreakpointResources, MemoryAddress, MemoryBuffer, MemorySegment,
    MemorySegmentType, MemorySize, Pad, PadType, RegisterDescriptor, TargetDescriptor,
};

use crate::config::TargetConfig;
use crate::error::Error;
use crate::tools::{DebugTool, RiscvDebugInterface};

use super::{
    Breakpoint, BreakpointKind, DeltaRegion, GpioDirection, GpioPadState, GpioValue,
    PassthroughResponse, Target, TargetExecutionState,
};

/// Key sequence accepted by FLASH_KEYR and FLASH_MODEKEYR.
const FLASH_KEY_1: u32 = 0x45670123;
const FLASH_KEY_2: u32 = 0xCDEF89AB;

/// The compressed break instruction (c.ebreak), as stored in program memory.
const C_EBREAK: [u8; 2] = [0x02, 0x90];
/// The full-width break instruction (ebreak).
const EBREAK: [u8; 4] = [0x73, 0x00, 0x10, 0x00];

/// Delta programming block size advertised for WCH program memory.
const DELTA_BLOCK_SIZE: MemorySize = 64;

const ERASE_RESPONSE_DELAY: Duration = Duration::from_micros(10);
const ERASE_TIMEOUT: Duration = Duration::from_millis(100);

/// The flash controller registers and bit fields, resolved once from the
/// descriptor.
struct FlashControlRegisters {
    key: RegisterDescriptor,
    mode_key: RegisterDescriptor,
    status: RegisterDescriptor,
    control: RegisterDescriptor,
    busy: BitField,
    boot_mode: BitField,
    boot_lock: BitField,
    lock: BitField,
    main_segment_erase: BitField,
    start_erase: BitField,
}

/// Per-pad GPIO register mapping, produced once from the descriptor.
struct GpioPadMapping {
    clock_enable_field: BitField,
    config_register: RegisterDescriptor,
    mode_field: BitField,
    input_register: RegisterDescriptor,
    input_field: BitField,
    output_register: RegisterDescriptor,
    output_field: BitField,
}

pub struct WchRiscV {
    config: TargetConfig,
    descriptor: Arc<TargetDescriptor>,
    interface: Box<dyn RiscvDebugInterface>,

    mapped_segment: MemorySegment,
    main_segment: MemorySegment,
    boot_segment: MemorySegment,

    /// The program segment the user selected for debugging - the one the
    /// mapped segment aliased at activation.
    selected_segment_key: String,

    flash_control: FlashControlRegisters,
    clock_enable_register: RegisterDescriptor,
    gpio_pad_mappings: BTreeMap<usize, GpioPadMapping>,

    breakpoints: Vec<Breakpoint>,
    programming_mode: bool,
    activated: bool,
}

impl WchRiscV {
    pub fn new(
        descriptor: Arc<TargetDescriptor>,
        config: &TargetConfig,
        tool: &mut dyn DebugTool,
    ) -> Result<Self, Error> {
        let interface = tool.riscv_debug_interface(&descriptor, config).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "debug tool (\"{}\") not supported by target (\"{}\")",
                tool.name(),
                descriptor.name
            ))
        })?;

        let sys = descriptor.address_space("sys")?;
        let mapped_segment = sys.segment("mapped_program_memory")?.clone();
        let main_segment = sys.segment("main_program")?.clone();
        let boot_segment = sys.segment("boot_program")?.clone();

        // Alias resolution probes the boot segment's boundary through the
        // mapped segment, which only works when boot is the smaller segment.
        debug_assert!(boot_segment.size() < main_segment.size());

        let flash_group = descriptor.peripheral("flash")?.register_group("flash")?;
        let status = flash_group.register("statr")?;
        let control = flash_group.register("ctlr")?;

        let flash_control = FlashControlRegisters {
            key: flash_group.register("keyr")?.clone(),
            mode_key: flash_group.register("modekeyr")?.clone(),
            busy: status.bit_field("busy")?.clone(),
            boot_mode: status.bit_field("boot_mode")?.clone(),
            boot_lock: status.bit_field("boot_lock")?.clone(),
            lock: control.bit_field("lock")?.clone(),
            main_segment_erase: control.bit_field("mer")?.clone(),
            start_erase: control.bit_field("strt")?.clone(),
            status: status.clone(),
            control: control.clone(),
        };

        let clock_enable_register =
            descriptor.peripheral("rcc")?.register_group("rcc")?.register("apb2pcenr")?.clone();

        let gpio_pad_mappings =
            Self::generate_gpio_pad_mappings(&descriptor, &clock_enable_register);

        Ok(Self {
            config: config.clone(),
            mapped_segment,
            main_segment,
            boot_segment,
            selected_segment_key: String::new(),
            flash_control,
            clock_enable_register,
            gpio_pad_mappings,
            descriptor,
            interface,
            breakpoints: Vec::new(),
            programming_mode: false,
            activated: false,
        })
    }

    fn generate_gpio_pad_mappings(
        descriptor: &TargetDescriptor,
        clock_enable_register: &RegisterDescriptor,
    ) -> BTreeMap<usize, GpioPadMapping> {
        let mut mappings = BTreeMap::new();

        for pad in &descriptor.pads {
            if pad.pad_type != PadType::Gpio || pad.key.len() < 3 {
                continue;
            }

            // Pad keys take the form "pa3" - the trailing digits select the
            // per-pin bit fields within the port registers.
            let pin = &pad.key[2..];

            for peripheral in descriptor.peripherals_with_key_prefix("port") {
                if peripheral.key.len() < 5 || peripheral.first_signal_for_pad(&pad.key).is_none()
                {
                    continue;
                }

                let port_letter = &peripheral.key[4..5];
                let Some(clock_enable_field) =
                    clock_enable_register.try_bit_field(&format!("iop{port_letter}en"))
                else {
                    continue;
                };

                let Some(port_group) = peripheral.try_register_group("port") else { continue };

                let config_register = ["cfglr", "cfghr", "cfgxr"]
                    .iter()
                    .filter_map(|key| port_group.try_register(key))
                    .find(|register| register.try_bit_field(&format!("mode{pin}")).is_some());

                let Some(config_register) = config_register else { continue };
                let Some(mode_field) = config_register.try_bit_field(&format!("mode{pin}")) else {
                    continue;
                };

                let Some(input_register) = port_group.try_register("indr") else { continue };
                let Some(input_field) = input_register.try_bit_field(&format!("indr{pin}")) else {
                    continue;
                };

                let Some(output_register) = port_group.try_register("outdr") else { continue };
                let Some(output_field) = output_register.try_bit_field(&format!("odr{pin}")) else {
                    continue;
                };

                mappings.insert(
                    pad.id,
                    GpioPadMapping {
                        clock_enable_field: clock_enable_field.clone(),
                        config_register: config_register.clone(),
                        mode_field: mode_field.clone(),
                        input_register: input_register.clone(),
                        input_field: input_field.clone(),
                        output_register: output_register.clone(),
                        output_field: output_field.clone(),
                    },
                );
                break;
            }
        }

        mappings
    }

    fn bit_field_value(value: u32, field: &BitField) -> u32 {
        let mask = field.mask as u32;
        (value & mask) >> mask.trailing_zeros()
    }

    fn with_bit_field(value: u32, field: &BitField, field_value: u32) -> u32 {
        let mask = field.mask as u32;
        (value & !mask) | ((field_value << mask.trailing_zeros()) & mask)
    }

    fn register_segment_key(&self, descriptor: &RegisterDescriptor) -> Result<String, Error> {
        Ok(self
            .descriptor
            .address_space(&descriptor.address_space_key)?
            .segment_containing(descriptor.start_address)
            .ok_or_else(|| {
                Error::TargetOperationFailure(format!(
                    "register \"{}\" does not resolve to a memory segment",
                    descriptor.key
                ))
            })?
            .key
            .clone())
    }

    fn read_register_u32(&mut self, descriptor: &RegisterDescriptor) -> Result<u32, Error> {
        let segment_key = self.register_segment_key(descriptor)?;
        let data = self.interface.read_memory(
            &descriptor.address_space_key,
            &segment_key,
            descriptor.start_address,
            4,
        )?;
        Ok(u32::from_le_bytes(data[..4].try_into().unwrap()))
    }

    fn write_register_u32(
        &mut self,
        descriptor: &RegisterDescriptor,
        value: u32,
    ) -> Result<(), Error> {
        let segment_key = self.register_segment_key(descriptor)?;
        self.interface.write_memory(
            &descriptor.address_space_key,
            &segment_key,
            descriptor.start_address,
            &value.to_le_bytes(),
        )
    }

    fn read_register_bytes(&mut self, descriptor: &RegisterDescriptor) -> Result<MemoryBuffer, Error> {
        let segment_key = self.register_segment_key(descriptor)?;
        self.interface.read_memory(
            &descriptor.address_space_key,
            &segment_key,
            descriptor.start_address,
            descriptor.size,
        )
    }

    fn write_register_bytes(
        &mut self,
        descriptor: &RegisterDescriptor,
        value: &[u8],
    ) -> Result<(), Error> {
        let segment_key = self.register_segment_key(descriptor)?;
        self.interface.write_memory(
            &descriptor.address_space_key,
            &segment_key,
            descriptor.start_address,
            value,
        )
    }

    /// Determines which program segment the mapped segment currently aliases,
    /// by probing the boot segment's boundary through the mapped segment.
    ///
    /// When boot is aliased, the access breaches the (smaller) boot segment
    /// and fails; a successful probe implies the main segment is aliased.
    /// The FLASH_STATR boot-mode field would be the obvious alternative, but
    /// not all parts implement it as documented.
    fn resolve_aliased_segment(&mut self) -> Result<MemorySegment, Error> {
        let probe_address = self.boot_segment.address_range.end
            - self.boot_segment.address_range.start
            + self.mapped_segment.address_range.start
            + 1;

        let accessible =
            self.interface.probe_memory("sys", &self.mapped_segment.key, probe_address)?;

        let segment =
            if accessible { self.main_segment.clone() } else { self.boot_segment.clone() };

        tracing::debug!("Aliased program memory segment: \"{}\"", segment.key);
        Ok(segment)
    }

    fn selected_segment(&self) -> MemorySegment {
        if self.selected_segment_key == self.boot_segment.key {
            self.boot_segment.clone()
        } else {
            self.main_segment.clone()
        }
    }

    fn de_alias_address(
        &self,
        address: MemoryAddress,
        aliased_segment: &MemorySegment,
    ) -> MemoryAddress {
        let de_aliased = address - self.mapped_segment.address_range.start
            + aliased_segment.address_range.start;

        tracing::debug!(
            "De-aliased mapped program memory address 0x{address:08x} to 0x{de_aliased:08x} \
             (segment: \"{}\")",
            aliased_segment.key
        );

        de_aliased
    }

    fn unlock_flash(&mut self) -> Result<(), Error> {
        let key = self.flash_control.key.clone();
        self.write_register_u32(&key, FLASH_KEY_1)?;
        self.write_register_u32(&key, FLASH_KEY_2)
    }

    fn unlock_boot_mode_field(&mut self) -> Result<(), Error> {
        let mode_key = self.flash_control.mode_key.clone();
        self.write_register_u32(&mode_key, FLASH_KEY_1)?;
        self.write_register_u32(&mode_key, FLASH_KEY_2)
    }

    fn set_boot_mode(&mut self, boot: bool) -> Result<(), Error> {
        self.unlock_flash()?;
        self.unlock_boot_mode_field()?;

        let status_register = self.flash_control.status.clone();
        let boot_lock = self.flash_control.boot_lock.clone();
        let boot_mode = self.flash_control.boot_mode.clone();

        let status = self.read_register_u32(&status_register)?;

        if Self::bit_field_value(status, &boot_lock) != 0 {
            return Err(Error::TargetOperationFailure(
                "failed to unlock boot mode field".to_owned(),
            ));
        }

        let status = Self::with_bit_field(status, &boot_mode, boot as u32);
        self.write_register_u32(&status_register, status)?;

        self.reset()
    }

    fn erase_main_flash_segment(&mut self) -> Result<(), Error> {
        self.unlock_flash()?;

        let status_register = self.flash_control.status.clone();
        let control_register = self.flash_control.control.clone();
        let busy = self.flash_control.busy.clone();
        let lock = self.flash_control.lock.clone();
        let main_segment_erase = self.flash_control.main_segment_erase.clone();
        let start_erase = self.flash_control.start_erase.clone();

        let status = self.read_register_u32(&status_register)?;
        if Self::bit_field_value(status, &busy) != 0 {
            return Err(Error::TargetOperationFailure("flash peripheral is unavailable".to_owned()));
        }

        let mut control = self.read_register_u32(&control_register)?;
        if Self::bit_field_value(control, &lock) != 0 {
            return Err(Error::TargetOperationFailure("failed to unlock flash".to_owned()));
        }

        // These bit fields must be written individually. Writing them in one
        // go makes the target misbehave.
        control = Self::with_bit_field(control, &main_segment_erase, 1);
        self.write_register_u32(&control_register, control)?;
        control = Self::with_bit_field(control, &start_erase, 1);
        self.write_register_u32(&control_register, control)?;

        let deadline = Instant::now() + ERASE_TIMEOUT;
        let mut status = self.read_register_u32(&status_register)?;
        while Self::bit_field_value(status, &busy) != 0 && Instant::now() < deadline {
            std::thread::sleep(ERASE_RESPONSE_DELAY);
            status = self.read_register_u32(&status_register)?;
        }

        let mut control = self.read_register_u32(&control_register)?;
        control = Self::with_bit_field(control, &main_segment_erase, 0);
        control = Self::with_bit_field(control, &start_erase, 0);
        self.write_register_u32(&control_register, control)?;

        if Self::bit_field_value(status, &busy) != 0 {
            return Err(Error::TargetOperationFailure("erase operation timed out".to_owned()));
        }

        Ok(())
    }

    fn program_mode_status(&mut self) -> Result<String, Error> {
        let aliased = self.resolve_aliased_segment()?;
        let mode =
            if aliased.key == self.boot_segment.key { "boot mode" } else { "user mode" };

        let program_counter = self.program_counter_impl()?;

        Ok(format!(
            "Program mode: \"{mode}\"\n\
             Aliased memory segment key: \"{}\"\n\
             Mapped address -> aliased address: 0x{:08X} -> 0x{:08X}\n\
             Program counter: 0x{program_counter:08X}\n",
            aliased.key,
            self.mapped_segment.address_range.start,
            aliased.address_range.start,
        ))
    }

    fn program_counter_impl(&mut self) -> Result<MemoryAddress, Error> {
        let program_counter = self.interface.program_counter()?;

        if self.mapped_segment.address_range.contains(program_counter) {
            let actual_aliased = self.resolve_aliased_segment()?;
            if actual_aliased.key != self.selected_segment_key {
                // The mapped segment no longer aliases the segment selected
                // for debugging - the program under debug switched modes at
                // runtime. Report the de-aliased address rather than hiding
                // the change from external consumers.
                let de_aliased = self.de_alias_address(program_counter, &actual_aliased);
                tracing::warn!(
                    "The mapped program memory segment is currently aliasing the \"{}\" segment \
                     - the program counter (0x{program_counter:08x}) has been de-aliased to \
                     0x{de_aliased:08x}",
                    actual_aliased.key
                );
                return Ok(de_aliased);
            }
        }

        Ok(program_counter)
    }

    fn read_gpio_register_cached(
        &mut self,
        cache: &mut BTreeMap<MemoryAddress, u32>,
        descriptor: &RegisterDescriptor,
    ) -> Result<u32, Error> {
        if let Some(&value) = cache.get(&descriptor.start_address) {
            return Ok(value);
        }

        let value = self.read_register_u32(descriptor)?;
        cache.insert(descriptor.start_address, value);
        Ok(value)
    }
}

impl Target for WchRiscV {
    fn descriptor(&self) -> &Arc<TargetDescriptor> {
        &self.descriptor
    }

    fn activate(&mut self) -> Result<(), Error> {
        if self.activated {
            return Ok(());
        }

        self.interface.init()?;
        self.interface.activate()?;

        self.interface.stop()?;
        self.interface.reset()?;

        let signature = self.interface.device_signature()?;
        if signature != self.descriptor.signature {
            return Err(Error::InvalidConfig(format!(
                "target id mismatch - the connected target reported \"{}\" but the description \
                 data expects \"{}\". This is likely due to an incorrect target name in the \
                 configuration file (bloom.yaml)",
                signature.to_hex(),
                self.descriptor.signature.to_hex()
            )));
        }

        self.selected_segment_key = self.resolve_aliased_segment()?.key;
        tracing::info!(
            "Selected program memory segment: \"{}\"",
            self.selected_segment_key
        );

        self.activated = true;
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), Error> {
        if let Err(error) = self.interface.stop() {
            tracing::error!("Failed to stop WCH RISC-V target during deactivation - {error}");
        }

        if let Err(error) = self.clear_all_breakpoints() {
            tracing::error!("Failed to clear breakpoints during deactivation - {error}");
        }

        if let Err(error) = self.interface.deactivate() {
            tracing::error!("Failed to deactivate WCH RISC-V target - {error}");
        }

        self.activated = false;
        Ok(())
    }

    fn breakpoint_resources(&self) -> BreakpointResources {
        let mut resources = self.descriptor.breakpoint_resources;

        if !self.config.hardware_breakpoints {
            resources.hardware_breakpoints = 0;
        }

        resources.reserved_hardware_breakpoints = if self.config.reserve_stepping_breakpoint {
            resources.hardware_breakpoints.min(1)
        } else {
            0
        };

        resources
    }

    fn execution_state(&mut self) -> Result<TargetExecutionState, Error> {
        self.interface.execution_state()
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.interface.stop()
    }

    fn run(&mut self) -> Result<(), Error> {
        self.interface.run()
    }

    fn step(&mut self) -> Result<(), Error> {
        self.interface.step()
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.interface.reset()
    }

    fn program_counter(&mut self) -> Result<MemoryAddress, Error> {
        self.program_counter_impl()
    }

    fn set_program_counter(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.interface.set_program_counter(address)
    }

    fn stack_pointer(&mut self) -> Result<u32, Error> {
        self.interface.read_cpu_register(2)
    }

    fn set_stack_pointer(&mut self, stack_pointer: u32) -> Result<(), Error> {
        self.interface.write_cpu_register(2, stack_pointer)
    }

    fn read_registers(
        &mut self,
        descriptors: &[RegisterDescriptor],
    ) -> Result<Vec<super::RegisterValue>, Error> {
        descriptors
            .iter()
            .map(|descriptor| {
                Ok(super::RegisterValue {
                    descriptor: descriptor.clone(),
                    value: self.read_register_bytes(descriptor)?,
                })
            })
            .collect()
    }

    fn write_registers(&mut self, values: &[super::RegisterValue]) -> Result<(), Error> {
        for value in values {
            self.write_register_bytes(&value.descriptor, &value.value)?;
        }

        Ok(())
    }

    fn read_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        length: MemorySize,
        excluded_ranges: &[AddressRange],
    ) -> Result<MemoryBuffer, Error> {
        if memory_segment_key == self.mapped_segment.key {
            let aliased = self.selected_segment();
            let transformed_address = self.de_alias_address(start_address, &aliased);
            let transformed_range =
                AddressRange::new(transformed_address, transformed_address + length - 1);

            if !aliased.address_range.contains_range(&transformed_range) {
                return Err(Error::RangeViolation(format!(
                    "mapped memory read (0x{start_address:08x}, {length} bytes) breaches the \
                     aliased segment \"{}\"",
                    aliased.key
                )));
            }

            let delta = transformed_address - start_address;
            let shifted_exclusions: Vec<AddressRange> = excluded_ranges
                .iter()
                .map(|range| AddressRange::new(range.start + delta, range.end + delta))
                .collect();

            return self.read_memory(
                address_space_key,
                &aliased.key,
                transformed_address,
                length,
                &shifted_exclusions,
            );
        }

        if excluded_ranges.is_empty() {
            return self.interface.read_memory(
                address_space_key,
                memory_segment_key,
                start_address,
                length,
            );
        }

        let mut buffer = vec![0x00u8; length as usize];
        let requested = AddressRange::new(start_address, start_address + length - 1);

        let mut sorted_exclusions: Vec<AddressRange> = excluded_ranges
            .iter()
            .filter(|range| range.intersects_range(&requested))
            .copied()
            .collect();
        sorted_exclusions.sort_by_key(|range| range.start);

        let mut cursor = requested.start;
        for exclusion in sorted_exclusions.iter().chain(std::iter::once(&AddressRange::new(
            requested.end + 1,
            requested.end + 1,
        ))) {
            let run_end = exclusion.start.max(cursor);
            if run_end > cursor {
                let run_length = run_end - cursor;
                let data = self.interface.read_memory(
                    address_space_key,
                    memory_segment_key,
                    cursor,
                    run_length,
                )?;
                let offset = (cursor - requested.start) as usize;
                buffer[offset..offset + run_length as usize].copy_from_slice(&data);
            }

            cursor = cursor.max(exclusion.end.saturating_add(1));
            if cursor > requested.end {
                break;
            }
        }

        Ok(buffer)
    }

    fn write_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        data: &[u8],
    ) -> Result<(), Error> {
        if memory_segment_key == self.mapped_segment.key {
            let aliased = self.selected_segment();

            if !aliased.debug_mode_access.writeable
                && (!self.programming_mode || !aliased.programming_mode_access.writeable)
            {
                return Err(Error::AccessDenied(format!(
                    "the selected program memory segment (\"{}\") does not permit write access \
                     in the current target mode",
                    aliased.key
                )));
            }

            let transformed_address = self.de_alias_address(start_address, &aliased);
            let transformed_range = AddressRange::new(
                transformed_address,
                transformed_address + data.len() as MemorySize - 1,
            );

            if !aliased.address_range.contains_range(&transformed_range) {
                return Err(Error::RangeViolation(format!(
                    "mapped memory write (0x{start_address:08x}, {} bytes) breaches the aliased \
                     segment \"{}\"",
                    data.len(),
                    aliased.key
                )));
            }

            return self.write_memory(
                address_space_key,
                &aliased.key,
                transformed_address,
                data,
            );
        }

        let segment = self
            .descriptor
            .address_space(address_space_key)?
            .segment(memory_segment_key)?
            .clone();

        if segment.segment_type == MemorySegmentType::Flash && !self.programming_mode {
            return Err(Error::ProgrammingModeRequired(
                "attempted flash memory write in the absence of an active programming session"
                    .to_owned(),
            ));
        }

        self.interface.write_memory(address_space_key, memory_segment_key, start_address, data)
    }

    fn erase_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
    ) -> Result<(), Error> {
        let segment = self
            .descriptor
            .address_space(address_space_key)?
            .segment(memory_segment_key)?
            .clone();

        match segment.segment_type {
            MemorySegmentType::Flash => {
                if !self.programming_mode {
                    return Err(Error::ProgrammingModeRequired(
                        "attempted flash memory erase in the absence of an active programming \
                         session"
                            .to_owned(),
                    ));
                }

                let effective_key = if segment.key == self.mapped_segment.key {
                    self.selected_segment().key
                } else {
                    segment.key.clone()
                };

                if effective_key == self.main_segment.key {
                    return self.erase_main_flash_segment();
                }

                tracing::debug!(
                    "Ignoring erase operation on \"{}\" segment - not supported",
                    segment.key
                );
                Ok(())
            }
            MemorySegmentType::Ram => {
                let blank = vec![0xFFu8; segment.size() as usize];
                self.interface.write_memory(
                    address_space_key,
                    &segment.key,
                    segment.address_range.start,
                    &blank,
                )
            }
            _ => {
                tracing::debug!(
                    "Ignoring erase operation on \"{}\" segment - not supported",
                    segment.key
                );
                Ok(())
            }
        }
    }

    fn set_breakpoint(&mut self, mut breakpoint: Breakpoint) -> Result<Breakpoint, Error> {
        // Breakpoints requested through the mapped segment are installed in
        // the segment it currently aliases.
        if breakpoint.memory_segment_key == self.mapped_segment.key {
            let aliased = self.selected_segment();
            breakpoint.address = self.de_alias_address(breakpoint.address, &aliased);
            breakpoint.memory_segment_key = aliased.key;
        }

        match breakpoint.kind {
            BreakpointKind::Software => {
                let break_instruction: &[u8] =
                    if breakpoint.size == 4 { &EBREAK } else { &C_EBREAK };

                let original_data = self.interface.read_memory(
                    &breakpoint.address_space_key,
                    &breakpoint.memory_segment_key,
                    breakpoint.address,
                    break_instruction.len() as MemorySize,
                )?;

                self.interface.write_memory(
                    &breakpoint.address_space_key,
                    &breakpoint.memory_segment_key,
                    breakpoint.address,
                    break_instruction,
                )?;

                breakpoint.size = break_instruction.len() as MemorySize;
                breakpoint.original_data = Some(original_data);
            }
            BreakpointKind::Hardware => {
                let resources = self.breakpoint_resources();
                let available = resources
                    .hardware_breakpoints
                    .saturating_sub(resources.reserved_hardware_breakpoints);

                let installed = self
                    .breakpoints
                    .iter()
                    .filter(|installed| installed.kind == BreakpointKind::Hardware)
                    .count() as u16;

                if installed >= available {
                    return Err(Error::BreakpointResourceExhausted(format!(
                        "all {available} available hardware breakpoint slots are in use"
                    )));
                }

                self.interface.set_hardware_breakpoint(breakpoint.address)?;
            }
        }

        self.breakpoints.push(breakpoint.clone());
        Ok(breakpoint)
    }

    fn remove_breakpoint(&mut self, breakpoint: &Breakpoint) -> Result<(), Error> {
        let mut address = breakpoint.address;
        let mut segment_key = breakpoint.memory_segment_key.clone();

        if segment_key == self.mapped_segment.key {
            let aliased = self.selected_segment();
            address = self.de_alias_address(address, &aliased);
            segment_key = aliased.key;
        }

        let position = self
            .breakpoints
            .iter()
            .position(|installed| {
                installed.address == address
                    && installed.memory_segment_key == segment_key
                    && installed.kind == breakpoint.kind
            })
            .ok_or_else(|| {
                Error::TargetOperationFailure(format!(
                    "no breakpoint installed at address 0x{address:08x}"
                ))
            })?;

        let installed = self.breakpoints[position].clone();

        match installed.kind {
            BreakpointKind::Software => {
                let original_data = installed.original_data.as_ref().ok_or_else(|| {
                    Error::TargetOperationFailure(
                        "software breakpoint ledger entry is missing its original instruction \
                         bytes"
                            .to_owned(),
                    )
                })?;

                self.interface.write_memory(
                    &installed.address_space_key,
                    &installed.memory_segment_key,
                    installed.address,
                    original_data,
                )?;
            }
            BreakpointKind::Hardware => {
                self.interface.clear_hardware_breakpoint(installed.address)?;
            }
        }

        self.breakpoints.remove(position);
        Ok(())
    }

    fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.clone()
    }

    fn clear_all_breakpoints(&mut self) -> Result<(), Error> {
        let breakpoints = self.breakpoints.clone();

        for breakpoint in breakpoints {
            if let Err(error) = self.remove_breakpoint(&breakpoint) {
                tracing::error!(
                    "Failed to remove breakpoint at 0x{:08x} - {error}",
                    breakpoint.address
                );
                self.breakpoints.retain(|installed| installed.address != breakpoint.address);
            }
        }

        Ok(())
    }

    fn enable_programming_mode(&mut self) -> Result<(), Error> {
        if self.programming_mode {
            return Ok(());
        }

        self.interface.enable_programming_mode()?;
        self.programming_mode = true;
        Ok(())
    }

    fn disable_programming_mode(&mut self) -> Result<(), Error> {
        if !self.programming_mode {
            return Ok(());
        }

        let mut first_error = None;

        if let Err(error) = self.interface.disable_programming_mode() {
            first_error.get_or_insert(error);
        }

        if let Err(error) = self.interface.stop() {
            first_error.get_or_insert(error);
        }

        self.programming_mode = false;

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn programming_mode_enabled(&self) -> bool {
        self.programming_mode
    }

    fn gpio_pad_states(&mut self, pads: &[Pad]) -> Result<Vec<(Pad, GpioPadState)>, Error> {
        let mut states = Vec::new();
        let mut cache = BTreeMap::new();

        let clock_enable_register = self.clock_enable_register.clone();

        for pad in pads {
            if pad.pad_type != PadType::Gpio {
                continue;
            }

            let Some(mapping) = self.gpio_pad_mappings.get(&pad.id) else { continue };

            let clock_enable_field = mapping.clock_enable_field.clone();
            let config_register = mapping.config_register.clone();
            let mode_field = mapping.mode_field.clone();
            let input_register = mapping.input_register.clone();
            let input_field = mapping.input_field.clone();
            let output_register = mapping.output_register.clone();
            let output_field = mapping.output_field.clone();

            let clock_enable_value =
                self.read_gpio_register_cached(&mut cache, &clock_enable_register)?;
            if Self::bit_field_value(clock_enable_value, &clock_enable_field) == 0 {
                // The port peripheral is disabled - no meaningful state for
                // this pad.
                continue;
            }

            let config_value = self.read_gpio_register_cached(&mut cache, &config_register)?;
            let mode = Self::bit_field_value(config_value, &mode_field);

            if mode == 0 {
                let input_value = self.read_gpio_register_cached(&mut cache, &input_register)?;
                states.push((
                    pad.clone(),
                    GpioPadState {
                        value: if Self::bit_field_value(input_value, &input_field) != 0 {
                            GpioValue::High
                        } else {
                            GpioValue::Low
                        },
                        direction: GpioDirection::Input,
                    },
                ));
                continue;
            }

            let output_value = self.read_gpio_register_cached(&mut cache, &output_register)?;
            states.push((
                pad.clone(),
                GpioPadState {
                    value: if Self::bit_field_value(output_value, &output_field) != 0 {
                        GpioValue::High
                    } else {
                        GpioValue::Low
                    },
                    direction: GpioDirection::Output,
                },
            ));
        }

        Ok(states)
    }

    fn set_gpio_pad_state(&mut self, pad: &Pad, state: GpioPadState) -> Result<(), Error> {
        let mapping = self
            .gpio_pad_mappings
            .get(&pad.id)
            .ok_or_else(|| Error::TargetOperationFailure(format!("unknown pad \"{}\"", pad.key)))?;

        let config_register = mapping.config_register.clone();
        let mode_field = mapping.mode_field.clone();
        let output_register = mapping.output_register.clone();
        let output_field = mapping.output_field.clone();

        let config_value = self.read_register_u32(&config_register)?;
        let current_direction = if Self::bit_field_value(config_value, &mode_field) == 0 {
            GpioDirection::Input
        } else {
            GpioDirection::Output
        };

        if current_direction != state.direction {
            let mode = match state.direction {
                GpioDirection::Input => 0,
                GpioDirection::Output => 1,
            };
            let config_value = Self::with_bit_field(config_value, &mode_field, mode);
            self.write_register_u32(&config_register, config_value)?;
        }

        if state.direction == GpioDirection::Output {
            let output_value = self.read_register_u32(&output_register)?;
            let output_value = Self::with_bit_field(
                output_value,
                &output_field,
                matches!(state.value, GpioValue::High) as u32,
            );
            self.write_register_u32(&output_register, output_value)?;
        }

        Ok(())
    }

    fn delta_block_size(
        &mut self,
        _address_space_key: &str,
        memory_segment_key: &str,
    ) -> Option<MemorySize> {
        let program_memory = memory_segment_key == self.mapped_segment.key
            || memory_segment_key == self.main_segment.key
            || memory_segment_key == self.boot_segment.key;

        program_memory.then_some(DELTA_BLOCK_SIZE)
    }

    /// Delta programming isn't always faster here: the tool has one write
    /// path suited to small transfers and another for bulk ones, and a write
    /// set with many fragments would take the slow path repeatedly. Abandon
    /// such sessions in favor of a full write.
    fn should_abandon_delta(&mut self, regions: &[DeltaRegion]) -> bool {
        regions.len() > 5
            || regions.iter().filter(|region| region.data.len() > 192).count() > 2
    }

    fn invoke_passthrough_command(
        &mut self,
        arguments: &[String],
    ) -> Result<Option<PassthroughResponse>, Error> {
        if arguments.first().map(String::as_str) != Some("program_mode") {
            return Ok(None);
        }

        if arguments.len() == 1 {
            return Ok(Some(PassthroughResponse {
                output: self.program_mode_status()?,
                target_reset: false,
            }));
        }

        match arguments[1].as_str() {
            "boot" => {
                let mut output = String::new();
                if self.resolve_aliased_segment()?.key == self.boot_segment.key {
                    output.push_str("Target is already in \"boot mode\"\nProceeding, anyway...\n\n");
                }

                self.set_boot_mode(true)?;

                output.push_str("Boot mode has been enabled\n");
                output.push_str(&format!(
                    "Program counter: 0x{:08X}\n",
                    self.program_counter_impl()?
                ));

                Ok(Some(PassthroughResponse { output, target_reset: true }))
            }
            "user" => {
                let mut output = String::new();
                if self.resolve_aliased_segment()?.key == self.main_segment.key {
                    output.push_str("Target is already in \"user mode\"\nProceeding, anyway...\n\n");
                }

                self.set_boot_mode(false)?;

                output.push_str("User mode has been enabled\n");
                output.push_str(&format!(
                    "Program counter: 0x{:08X}\n",
                    self.program_counter_impl()?
                ));

                Ok(Some(PassthroughResponse { output, target_reset: true }))
            }
            _ => Ok(None),
        }
    }

    fn passthrough_help(&self) -> Option<String> {
        Some(
            "program_mode\n\n   Reports the target's current program mode (boot/user).\n\n\
             program_mode [MODE]\n\n   Changes the program mode on the target. Triggers a target \
             reset.\n   Valid modes: \"boot\" and \"user\".\n"
                .to_owned(),
        )
    }
}

#[cfg(test)]
mod test {
    use crate::config::TargetConfig;
    use crate::targets::{DeltaRegion, Target, TargetRegistry};
    use crate::tools::simulator::SimulatedTool;
    use crate::tools::DebugTool;

    use super::*;

    fn target_config() -> TargetConfig {
        let raw = r#"
name: "ch32v003"
physical_interface: "sdi"
"#;
        serde_yaml::from_str(raw).unwrap()
    }

    fn adapter() -> WchRiscV {
        let registry = TargetRegistry::new();
        let descriptor = registry.descriptor("ch32v003").unwrap();
        let mut tool: Box<dyn DebugTool> = Box::new(SimulatedTool::new());
        tool.init().unwrap();
        WchRiscV::new(descriptor, &target_config(), tool.as_mut()).unwrap()
    }

    fn field(mask: u64) -> BitField {
        BitField { key: "field".to_owned(), name: "FIELD".to_owned(), mask }
    }

    fn region(length: usize) -> DeltaRegion {
        DeltaRegion { address: 0x0800_0000, data: vec![0x00; length] }
    }

    #[test]
    fn bit_field_extraction_and_insertion() {
        let mode1 = field(0x30);

        assert_eq!(WchRiscV::bit_field_value(0x0000_0020, &mode1), 0x2);
        assert_eq!(WchRiscV::with_bit_field(0x0000_00FF, &mode1, 0x1), 0x0000_00DF);
        // Values wider than the field are clipped to it.
        assert_eq!(WchRiscV::with_bit_field(0x0, &mode1, 0xFF), 0x30);
    }

    #[test]
    fn delta_sessions_with_many_fragments_are_abandoned() {
        let mut adapter = adapter();

        let few: Vec<DeltaRegion> = (0..5).map(|_| region(64)).collect();
        assert!(!adapter.should_abandon_delta(&few));

        let many: Vec<DeltaRegion> = (0..6).map(|_| region(64)).collect();
        assert!(adapter.should_abandon_delta(&many));
    }

    #[test]
    fn delta_sessions_with_several_large_fragments_are_abandoned() {
        let mut adapter = adapter();

        let two_large = vec![region(256), region(256), region(64)];
        assert!(!adapter.should_abandon_delta(&two_large));

        let three_large = vec![region(256), region(256), region(256)];
        assert!(adapter.should_abandon_delta(&three_large));
    }

    #[test]
    fn program_memory_segments_advertise_a_delta_block_size() {
        let mut adapter = adapter();

        assert_eq!(adapter.delta_block_size("sys", "main_program"), Some(64));
        assert_eq!(adapter.delta_block_size("sys", "mapped_program_memory"), Some(64));
        assert_eq!(adapter.delta_block_size("sys", "internal_ram"), None);
    }
}
