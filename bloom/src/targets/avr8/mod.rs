//! The AVR8 target adapter.
//!
//! Drives Microchip 8-bit AVR targets over debugWIRE, JTAG, PDI or UPDI.
//! Fuse-bit management (DWEN via ISP, OCDEN on JTAG, EESAVE around chip
//! erases) lives in the `fuses` submodule.

mod fuses;

use std::collections::BTreeMap;
use std::sync::Arc;

use bloom_target::{
    AddressRange, BreakpointResources, FuseEnableStrategy, MemoryAddress, MemoryBuffer,
    MemorySegment, MemorySegmentType, MemorySize, Pad, PadType, PhysicalInterface,
    RegisterDescriptor, TargetDescriptor,
};

use crate::config::TargetConfig;
use crate::error::Error;
use crate::tools::{Avr8DebugInterface, AvrIspInterface, DebugTool, TargetPowerInterface};

use super::{
    Breakpoint, BreakpointKind, DeltaRegion, GpioDirection, GpioPadState, GpioValue, Target,
    TargetExecutionState,
};

/// The AVR BREAK instruction, as stored in program memory.
const BREAK_INSTRUCTION: [u8; 2] = [0x98, 0x95];

/// Per-pad GPIO register mapping, produced once from the descriptor.
struct GpioPadMapping {
    register_mask: u8,
    data_direction_register: RegisterDescriptor,
    input_register: RegisterDescriptor,
    output_register: RegisterDescriptor,
}

/// Bookkeeping for an active programming session.
#[derive(Default)]
struct ProgrammingSession {
    /// True when the session programmed the EESAVE fuse bit and must restore
    /// it on exit.
    managing_eesave_fuse_bit: bool,
}

pub struct Avr8 {
    config: TargetConfig,
    descriptor: Arc<TargetDescriptor>,

    debug_interface: Box<dyn Avr8DebugInterface>,
    isp_interface: Option<Box<dyn AvrIspInterface>>,
    power_interface: Option<Box<dyn TargetPowerInterface>>,

    fuse_enable_strategy: FuseEnableStrategy,

    sp_register: Option<RegisterDescriptor>,
    sp_low_register: Option<RegisterDescriptor>,
    sp_high_register: Option<RegisterDescriptor>,

    gpio_pad_mappings: BTreeMap<usize, GpioPadMapping>,

    breakpoints: Vec<Breakpoint>,
    programming_session: Option<ProgrammingSession>,
    activated: bool,
}

impl Avr8 {
    pub fn new(
        descriptor: Arc<TargetDescriptor>,
        config: &TargetConfig,
        tool: &mut dyn DebugTool,
    ) -> Result<Self, Error> {
        if !descriptor.physical_interfaces.contains(&config.physical_interface) {
            // The list of supported interfaces in the description data may be
            // incomplete, so this is not fatal. Activation will fail if the
            // target truly lacks the interface.
            tracing::warn!(
                "The selected target does not appear to support the selected physical interface \
                 ({}). Target activation will likely fail.",
                config.physical_interface
            );
        }

        if config.manage_ocden_fuse_bit && config.physical_interface != PhysicalInterface::Jtag {
            tracing::warn!(
                "The 'manage_ocden_fuse_bit' parameter only applies to JTAG targets. It will be \
                 ignored in this session."
            );
        }

        let debug_interface =
            tool.avr8_debug_interface(&descriptor, config).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "debug tool (\"{}\") not supported by target (\"{}\")",
                    tool.name(),
                    descriptor.name
                ))
            })?;

        let isp_interface = descriptor
            .physical_interfaces
            .contains(&PhysicalInterface::Isp)
            .then(|| tool.avr_isp_interface(&descriptor, config))
            .flatten();

        if isp_interface.is_none()
            && config.manage_dwen_fuse_bit
            && config.physical_interface == PhysicalInterface::DebugWire
        {
            tracing::warn!(
                "The connected debug tool (or associated driver) does not provide any ISP \
                 interface. Bloom will be unable to manage the DWEN fuse bit."
            );
        }

        let power_interface = tool.target_power_interface();

        let cpu_registers = descriptor
            .try_peripheral("cpu")
            .and_then(|peripheral| peripheral.try_register_group("cpu"));

        let sp_register = cpu_registers.and_then(|group| group.try_register("sp")).cloned();
        let sp_low_register = cpu_registers.and_then(|group| group.try_register("spl")).cloned();
        let sp_high_register = cpu_registers.and_then(|group| group.try_register("sph")).cloned();

        let gpio_pad_mappings = Self::generate_gpio_pad_mappings(&descriptor);

        Ok(Self {
            fuse_enable_strategy: descriptor
                .fuse_enable_strategy
                .unwrap_or(FuseEnableStrategy::Clear),
            sp_register,
            sp_low_register,
            sp_high_register,
            gpio_pad_mappings,
            config: config.clone(),
            descriptor,
            debug_interface,
            isp_interface,
            power_interface,
            breakpoints: Vec::new(),
            programming_session: None,
            activated: false,
        })
    }

    /// Builds the pad-id -> GPIO register mapping from the descriptor's port
    /// peripherals.
    ///
    /// Two register layouts exist across AVR8 GPIO port modules: the newer
    /// form carries "dir"/"in"/"out" registers (recognisable by the presence
    /// of "outset"), the classic form carries "ddr"/"pin"/"port".
    fn generate_gpio_pad_mappings(
        descriptor: &TargetDescriptor,
    ) -> BTreeMap<usize, GpioPadMapping> {
        let mut mappings = BTreeMap::new();

        for peripheral in descriptor.peripherals_with_key_prefix("port") {
            let Some(port_group) = peripheral.register_groups.first() else {
                continue;
            };

            for signal in &peripheral.signals {
                let Some(index) = signal.index else { continue };

                if mappings.contains_key(&signal.pad_id) {
                    continue;
                }

                let register_mask = 0x01u8 << index;

                let registers = if port_group.try_register("outset").is_some() {
                    (
                        port_group.try_register("dir"),
                        port_group.try_register("in"),
                        port_group.try_register("out"),
                    )
                } else {
                    (
                        port_group.try_register("ddr"),
                        port_group.try_register("pin"),
                        port_group.try_register("port"),
                    )
                };

                if let (Some(direction), Some(input), Some(output)) = registers {
                    mappings.insert(
                        signal.pad_id,
                        GpioPadMapping {
                            register_mask,
                            data_direction_register: direction.clone(),
                            input_register: input.clone(),
                            output_register: output.clone(),
                        },
                    );
                }
            }
        }

        mappings
    }

    fn segment(
        &self,
        address_space_key: &str,
        memory_segment_key: &str,
    ) -> Result<MemorySegment, Error> {
        Ok(self
            .descriptor
            .address_space(address_space_key)?
            .segment(memory_segment_key)?
            .clone())
    }

    /// Reads a register through the debug interface, resolving its memory
    /// segment from the descriptor.
    fn read_register(&mut self, descriptor: &RegisterDescriptor) -> Result<MemoryBuffer, Error> {
        let space = self.descriptor.address_space(&descriptor.address_space_key)?;
        let segment_key = space
            .segment_containing(descriptor.start_address)
            .ok_or_else(|| {
                Error::TargetOperationFailure(format!(
                    "register \"{}\" does not resolve to a memory segment",
                    descriptor.key
                ))
            })?
            .key
            .clone();
        let space_key = space.key.clone();

        self.debug_interface.read_memory(
            &space_key,
            &segment_key,
            descriptor.start_address,
            descriptor.size,
        )
    }

    fn write_register(
        &mut self,
        descriptor: &RegisterDescriptor,
        value: &[u8],
    ) -> Result<(), Error> {
        let space = self.descriptor.address_space(&descriptor.address_space_key)?;
        let segment_key = space
            .segment_containing(descriptor.start_address)
            .ok_or_else(|| {
                Error::TargetOperationFailure(format!(
                    "register \"{}\" does not resolve to a memory segment",
                    descriptor.key
                ))
            })?
            .key
            .clone();
        let space_key = space.key.clone();

        self.debug_interface.write_memory(
            &space_key,
            &segment_key,
            descriptor.start_address,
            value,
        )
    }

    fn read_gpio_register_cached(
        &mut self,
        cache: &mut BTreeMap<MemoryAddress, u8>,
        descriptor: &RegisterDescriptor,
    ) -> Result<u8, Error> {
        if let Some(&value) = cache.get(&descriptor.start_address) {
            return Ok(value);
        }

        let value = self.read_register(descriptor)?[0];
        cache.insert(descriptor.start_address, value);
        Ok(value)
    }
}

impl Target for Avr8 {
    fn descriptor(&self) -> &Arc<TargetDescriptor> {
        &self.descriptor
    }

    fn activate(&mut self) -> Result<(), Error> {
        if self.activated {
            return Ok(());
        }

        self.debug_interface.init()?;

        match self.debug_interface.activate() {
            Ok(()) => {}
            Err(Error::DebugWireActivation(message)) => {
                if !self.config.manage_dwen_fuse_bit {
                    return Err(Error::TargetOperationFailure(format!(
                        "failed to activate debugWIRE physical interface ({message}) - check \
                         target connection and DWEN fuse bit. Bloom can manage the DWEN fuse bit \
                         automatically, via the 'manage_dwen_fuse_bit' parameter"
                    )));
                }

                tracing::warn!(
                    "Failed to activate the debugWIRE physical interface - attempting to access \
                     target via the ISP interface, for DWEN fuse bit inspection."
                );
                self.update_dwen_fuse_bit(true)?;

                if self.config.cycle_target_power_post_dwen_update {
                    self.cycle_target_power()?;
                }

                tracing::info!("Retrying debugWIRE physical interface activation");
                self.debug_interface.activate()?;
            }
            Err(error) => return Err(error),
        }

        self.debug_interface.stop()?;
        self.debug_interface.reset()?;

        if self.config.physical_interface == PhysicalInterface::Jtag
            && self.config.manage_ocden_fuse_bit
        {
            tracing::debug!("Attempting OCDEN fuse bit management");
            self.update_ocden_fuse_bit(true)?;
        }

        self.activated = true;

        // The signature obtained from the device must match the description
        // data we were constructed against.
        let signature = self.debug_interface.device_signature()?;
        if signature != self.descriptor.signature {
            return Err(Error::InvalidConfig(format!(
                "target signature mismatch - the connected target reported \"{}\" but the \
                 description data expects \"{}\". This is likely due to an incorrect target name \
                 in the configuration file (bloom.yaml)",
                signature.to_hex(),
                self.descriptor.signature.to_hex()
            )));
        }

        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), Error> {
        // Deactivation runs on partially-activated targets too, so every step
        // is best-effort.
        if let Err(error) = self.debug_interface.stop() {
            tracing::error!("Failed to stop AVR8 target during deactivation - {error}");
        }

        if let Err(error) = self.clear_all_breakpoints() {
            tracing::error!("Failed to clear breakpoints during deactivation - {error}");
        }

        let result = if self.config.physical_interface == PhysicalInterface::Jtag
            && self.config.manage_ocden_fuse_bit
        {
            tracing::debug!("Attempting OCDEN fuse bit management");
            self.update_ocden_fuse_bit(false)
        } else {
            self.debug_interface.deactivate()
        };

        if let Err(error) = result {
            tracing::error!("Failed to deactivate AVR8 target - {error}");
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
        self.debug_interface.execution_state()
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.debug_interface.stop()
    }

    fn run(&mut self) -> Result<(), Error> {
        self.debug_interface.run()
    }

    fn step(&mut self) -> Result<(), Error> {
        self.debug_interface.step()
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.debug_interface.reset()
    }

    fn program_counter(&mut self) -> Result<MemoryAddress, Error> {
        self.debug_interface.program_counter()
    }

    fn set_program_counter(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.debug_interface.set_program_counter(address)
    }

    fn stack_pointer(&mut self) -> Result<u32, Error> {
        if let Some(descriptor) = self.sp_register.clone() {
            let value = self.read_register(&descriptor)?;
            // SP is stored little-endian in the data space.
            return Ok(value
                .iter()
                .rev()
                .fold(0u32, |stack_pointer, &byte| (stack_pointer << 8) | u32::from(byte)));
        }

        let mut stack_pointer = 0u32;

        if let Some(descriptor) = self.sp_low_register.clone() {
            stack_pointer |= u32::from(self.read_register(&descriptor)?[0]);
        }

        if let Some(descriptor) = self.sp_high_register.clone() {
            stack_pointer |= u32::from(self.read_register(&descriptor)?[0]) << 8;
        }

        Ok(stack_pointer)
    }

    fn set_stack_pointer(&mut self, stack_pointer: u32) -> Result<(), Error> {
        if let Some(descriptor) = self.sp_register.clone() {
            let value = if descriptor.size > 1 {
                vec![stack_pointer as u8, (stack_pointer >> 8) as u8]
            } else {
                vec![stack_pointer as u8]
            };
            return self.write_register(&descriptor, &value);
        }

        if let Some(descriptor) = self.sp_low_register.clone() {
            self.write_register(&descriptor, &[stack_pointer as u8])?;
        }

        if let Some(descriptor) = self.sp_high_register.clone() {
            self.write_register(&descriptor, &[(stack_pointer >> 8) as u8])?;
        }

        Ok(())
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
                    value: self.read_register(descriptor)?,
                })
            })
            .collect()
    }

    fn write_registers(&mut self, values: &[super::RegisterValue]) -> Result<(), Error> {
        for value in values {
            self.write_register(&value.descriptor, &value.value)?;
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
        if excluded_ranges.is_empty() {
            return self.debug_interface.read_memory(
                address_space_key,
                memory_segment_key,
                start_address,
                length,
            );
        }

        // Excluded bytes are skipped on the wire and zero-filled in the
        // returned buffer.
        let mut buffer = vec![0x00u8; length as usize];
        let requested = AddressRange::new(start_address, start_address + length - 1);

        let mut cursor = requested.start;
        let mut sorted_exclusions: Vec<AddressRange> = excluded_ranges
            .iter()
            .filter(|range| range.intersects_range(&requested))
            .copied()
            .collect();
        sorted_exclusions.sort_by_key(|range| range.start);

        for exclusion in sorted_exclusions.iter().chain(std::iter::once(&AddressRange::new(
            requested.end + 1,
            requested.end + 1,
        ))) {
            let run_end = exclusion.start.max(cursor);
            if run_end > cursor {
                let run_length = run_end - cursor;
                let data = self.debug_interface.read_memory(
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
        let segment = self.segment(address_space_key, memory_segment_key)?;

        if segment.segment_type == MemorySegmentType::Flash && !self.programming_mode_enabled() {
            return Err(Error::ProgrammingModeRequired(
                "attempted flash memory write in the absence of an active programming session"
                    .to_owned(),
            ));
        }

        self.debug_interface.write_memory(
            address_space_key,
            memory_segment_key,
            start_address,
            data,
        )
    }

    fn erase_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
    ) -> Result<(), Error> {
        let segment = self.segment(address_space_key, memory_segment_key)?;

        if segment.segment_type == MemorySegmentType::Flash {
            if !self.programming_mode_enabled() {
                return Err(Error::ProgrammingModeRequired(
                    "attempted flash memory erase in the absence of an active programming session"
                        .to_owned(),
                ));
            }

            if self.config.physical_interface == PhysicalInterface::DebugWire {
                // debugWIRE targets do not need to be erased.
                return Ok(());
            }

            // Erasing program memory on JTAG and UPDI targets means a chip
            // erase, which would take the EEPROM with it unless the EESAVE
            // fuse bit is programmed. The fuse is restored at the end of the
            // programming session.
            if matches!(
                self.config.physical_interface,
                PhysicalInterface::Jtag | PhysicalInterface::Updi
            ) {
                if self.config.preserve_eeprom {
                    tracing::debug!("Inspecting EESAVE fuse bit");
                    let managing = self.update_eesave_fuse_bit(true)?;
                    if let Some(session) = self.programming_session.as_mut() {
                        session.managing_eesave_fuse_bit = managing;
                    }
                } else {
                    tracing::warn!(
                        "Performing chip-erase with preserve_eeprom disabled. All EEPROM data \
                         will be lost!"
                    );
                }

                return self.debug_interface.erase_chip();
            }

            return self.debug_interface.erase_program_memory();
        }

        match segment.segment_type {
            MemorySegmentType::Ram | MemorySegmentType::Eeprom => {
                // The debug interface does not have to support erasing RAM or
                // EEPROM - it's just a write.
                let blank = vec![0xFFu8; segment.size() as usize];
                self.write_memory(
                    address_space_key,
                    memory_segment_key,
                    segment.address_range.start,
                    &blank,
                )
            }
            _ => {
                if !segment.programming_mode_access.writeable {
                    return Err(Error::AccessDenied(format!(
                        "memory segment \"{}\" cannot be erased",
                        segment.key
                    )));
                }

                let blank = vec![0xFFu8; segment.size() as usize];
                self.debug_interface.write_memory(
                    address_space_key,
                    memory_segment_key,
                    segment.address_range.start,
                    &blank,
                )
            }
        }
    }

    fn set_breakpoint(&mut self, mut breakpoint: Breakpoint) -> Result<Breakpoint, Error> {
        match breakpoint.kind {
            BreakpointKind::Software => {
                let segment =
                    self.segment(&breakpoint.address_space_key, &breakpoint.memory_segment_key)?;

                if !segment.executable || !segment.debug_mode_access.writeable {
                    return Err(Error::AccessDenied(format!(
                        "software breakpoints require a writable code segment - segment \"{}\" \
                         does not qualify",
                        segment.key
                    )));
                }

                let original_data = self.debug_interface.read_memory(
                    &breakpoint.address_space_key,
                    &breakpoint.memory_segment_key,
                    breakpoint.address,
                    BREAK_INSTRUCTION.len() as MemorySize,
                )?;

                self.debug_interface.write_memory(
                    &breakpoint.address_space_key,
                    &breakpoint.memory_segment_key,
                    breakpoint.address,
                    &BREAK_INSTRUCTION,
                )?;

                breakpoint.size = BREAK_INSTRUCTION.len() as MemorySize;
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

                self.debug_interface.set_hardware_breakpoint(breakpoint.address)?;
            }
        }

        self.breakpoints.push(breakpoint.clone());
        Ok(breakpoint)
    }

    fn remove_breakpoint(&mut self, breakpoint: &Breakpoint) -> Result<(), Error> {
        let position = self
            .breakpoints
            .iter()
            .position(|installed| {
                installed.address == breakpoint.address
                    && installed.memory_segment_key == breakpoint.memory_segment_key
                    && installed.kind == breakpoint.kind
            })
            .ok_or_else(|| {
                Error::TargetOperationFailure(format!(
                    "no breakpoint installed at address 0x{:08x}",
                    breakpoint.address
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

                self.debug_interface.write_memory(
                    &installed.address_space_key,
                    &installed.memory_segment_key,
                    installed.address,
                    original_data,
                )?;
            }
            BreakpointKind::Hardware => {
                self.debug_interface.clear_hardware_breakpoint(installed.address)?;
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

        // A partial failure must not abort the cleanup loop.
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
        if self.programming_session.is_some() {
            return Ok(());
        }

        self.debug_interface.enable_programming_mode()?;
        self.programming_session = Some(ProgrammingSession::default());
        Ok(())
    }

    fn disable_programming_mode(&mut self) -> Result<(), Error> {
        let Some(session) = self.programming_session.take() else {
            return Ok(());
        };

        // Best-effort teardown: a failing step must not prevent the rest.
        let mut first_error = None;

        if session.managing_eesave_fuse_bit {
            if let Err(error) = self.update_eesave_fuse_bit(false) {
                tracing::error!("Failed to restore EESAVE fuse bit - {error}");
                first_error.get_or_insert(error);
            }
        }

        if let Err(error) = self.debug_interface.disable_programming_mode() {
            first_error.get_or_insert(error);
        }

        if let Err(error) = self.debug_interface.stop() {
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn programming_mode_enabled(&self) -> bool {
        self.programming_session.is_some()
    }

    fn gpio_pad_states(&mut self, pads: &[Pad]) -> Result<Vec<(Pad, GpioPadState)>, Error> {
        let mut states = Vec::new();

        // GPIO registers overlap across pads of one port, so cache reads by
        // start address.
        let mut cache = BTreeMap::new();

        for pad in pads {
            if pad.pad_type != PadType::Gpio {
                continue;
            }

            let Some(mapping) = self.gpio_pad_mappings.get(&pad.id) else { continue };

            let mask = mapping.register_mask;
            let direction_register = mapping.data_direction_register.clone();
            let input_register = mapping.input_register.clone();
            let output_register = mapping.output_register.clone();

            let direction_value = self.read_gpio_register_cached(&mut cache, &direction_register)?;
            let direction = if direction_value & mask != 0 {
                GpioDirection::Output
            } else {
                GpioDirection::Input
            };

            let state_register = match direction {
                GpioDirection::Output => output_register,
                GpioDirection::Input => input_register,
            };

            let state_value = self.read_gpio_register_cached(&mut cache, &state_register)?;

            states.push((
                pad.clone(),
                GpioPadState {
                    value: if state_value & mask != 0 { GpioValue::High } else { GpioValue::Low },
                    direction,
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

        let mask = mapping.register_mask;
        let direction_register = mapping.data_direction_register.clone();
        let output_register = mapping.output_register.clone();

        let direction_value = self.read_register(&direction_register)?[0];
        let new_direction_value = match state.direction {
            GpioDirection::Output => direction_value | mask,
            GpioDirection::Input => direction_value & !mask,
        };
        self.write_register(&direction_register, &[new_direction_value])?;

        if state.direction == GpioDirection::Output {
            let output_value = self.read_register(&output_register)?[0];
            let new_output_value = match state.value {
                GpioValue::High => output_value | mask,
                GpioValue::Low => output_value & !mask,
            };
            self.write_register(&output_register, &[new_output_value])?;
        }

        Ok(())
    }

    fn delta_block_size(
        &mut self,
        _address_space_key: &str,
        _memory_segment_key: &str,
    ) -> Option<MemorySize> {
        // The EDBG-class tools manage their own write granularity; delta
        // programming brings nothing here.
        None
    }

    fn should_abandon_delta(&mut self, _regions: &[DeltaRegion]) -> bool {
        false
    }

    fn invoke_passthrough_command(
        &mut self,
        _arguments: &[String],
    ) -> Result<Option<super::PassthroughResponse>, Error> {
        Ok(None)
    }
}
