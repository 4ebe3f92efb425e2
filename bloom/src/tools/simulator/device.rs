use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bloom_target::{
    FuseEnableStrategy, FuseValue, MemoryAddress, MemoryBuffer, MemorySize, MemorySegmentType,
    RegisterDescriptor, TargetDescriptor, TargetFamily, TargetSignature,
};

use crate::error::Error;
use crate::targets::TargetExecutionState;

const FLASH_KEY_1: u32 = 0x45670123;
const FLASH_KEY_2: u32 = 0xCDEF89AB;

/// A shared slot through which a [`super::SimulatedTool`] publishes its
/// device once constructed, so tests can inspect and manipulate it.
pub type DeviceSlot = Arc<Mutex<Option<Arc<Mutex<SimulatedDevice>>>>>;

/// Construction-time options for the simulated device.
#[derive(Clone, Default)]
pub struct SimulatorOptions {
    /// Memory overrides applied after the image is built:
    /// (address space key, segment key, start address, bytes).
    pub initial_memory: Vec<(String, String, MemoryAddress, Vec<u8>)>,
    /// Overrides the signature reported by the device.
    pub signature_override: Option<Vec<u8>>,
    /// Slot the tool publishes the constructed device into.
    pub device_slot: Option<DeviceSlot>,
}

/// Addresses of the WCH flash controller registers, resolved from the
/// descriptor at construction.
#[derive(Copy, Clone)]
struct FlashControlAddresses {
    keyr: MemoryAddress,
    statr: MemoryAddress,
    ctlr: MemoryAddress,
    modekeyr: MemoryAddress,
    boot_mode_mask: u32,
    boot_lock_mask: u32,
    lock_mask: u32,
    mer_mask: u32,
    strt_mask: u32,
}

/// The simulated device behind the simulator tool's interfaces.
///
/// Holds a byte image per memory segment, the execution state machine and
/// enough peripheral behavior (fuses, lock bits, the WCH flash controller and
/// mapped-segment aliasing) for the target adapters to operate unmodified. A
/// transcript of side-effecting operations supports test assertions.
pub struct SimulatedDevice {
    descriptor: Arc<TargetDescriptor>,
    signature_override: Option<Vec<u8>>,

    memories: HashMap<(String, String), MemoryBuffer>,
    cpu_registers: HashMap<u8, u32>,

    execution_state: TargetExecutionState,
    program_counter: MemoryAddress,
    programming_mode: bool,
    debug_interface_active: bool,
    hardware_breakpoints: Vec<MemoryAddress>,

    flash_control: Option<FlashControlAddresses>,
    flash_key_state: u8,
    boot_key_state: u8,

    fail_polls_remaining: u32,
    transcript: Vec<String>,
}

impl SimulatedDevice {
    pub fn new(descriptor: Arc<TargetDescriptor>, options: SimulatorOptions) -> Self {
        let mut memories = HashMap::new();

        for space in &descriptor.address_spaces {
            for segment in &space.memory_segments {
                let fill = match segment.segment_type {
                    MemorySegmentType::Flash
                    | MemorySegmentType::Eeprom
                    | MemorySegmentType::Fuses
                    | MemorySegmentType::Lockbits => 0xFF,
                    _ => 0x00,
                };

                let mut image = vec![fill; segment.size() as usize];

                if segment.segment_type == MemorySegmentType::Signature {
                    let signature = &descriptor.signature.0;
                    let copy_len = signature.len().min(image.len());
                    image[..copy_len]
                        .copy_from_slice(&signature[..copy_len]);
                }

                memories.insert((space.key.clone(), segment.key.clone()), image);
            }
        }

        let flash_control = (descriptor.family == TargetFamily::WchRiscV)
            .then(|| Self::resolve_flash_control(&descriptor))
            .flatten();

        let mut device = Self {
            descriptor,
            signature_override: options.signature_override,
            memories,
            cpu_registers: HashMap::new(),
            execution_state: TargetExecutionState::Running,
            program_counter: 0,
            programming_mode: false,
            debug_interface_active: false,
            hardware_breakpoints: Vec::new(),
            flash_control,
            flash_key_state: 0,
            boot_key_state: 0,
            fail_polls_remaining: 0,
            transcript: Vec::new(),
        };

        device.seed_defaults();

        for (space, segment, address, bytes) in options.initial_memory {
            device
                .write_memory(&space, &segment, address, &bytes)
                .expect("simulator initial memory override out of bounds");
        }

        device
    }

    /// Factory-default state: AVR fuses with DWEN and SPIEN programmed, the
    /// WCH flash controller locked with boot mode off.
    fn seed_defaults(&mut self) {
        match self.descriptor.family {
            TargetFamily::Avr8 => {
                let descriptor = self.descriptor.clone();
                if let Ok((register, _)) = descriptor.fuse_register_bit_field_pair("dwen") {
                    let address = register.start_address;
                    let _unused = self.write_memory("fuses", "fuses", address, &[0x99]);
                }
            }
            TargetFamily::WchRiscV => {
                if let Some(control) = self.flash_control {
                    let _unused = self.write_raw_sys(control.ctlr, &control.lock_mask.to_le_bytes());
                    let _unused =
                        self.write_raw_sys(control.statr, &control.boot_lock_mask.to_le_bytes());
                }

                // Stack pointer (x2) starts at the top of SRAM.
                if let Ok(space) = self.descriptor.address_space("sys") {
                    if let Ok(ram) = space.segment("internal_ram") {
                        self.cpu_registers.insert(2, ram.address_range.end + 1);
                    }
                }
            }
        }
    }

    fn resolve_flash_control(descriptor: &TargetDescriptor) -> Option<FlashControlAddresses> {
        let peripheral = descriptor.try_peripheral("flash")?;
        let group = peripheral.try_register_group("flash")?;

        let statr = group.try_register("statr")?;
        let ctlr = group.try_register("ctlr")?;

        Some(FlashControlAddresses {
            keyr: group.try_register("keyr")?.start_address,
            statr: statr.start_address,
            ctlr: ctlr.start_address,
            modekeyr: group.try_register("modekeyr")?.start_address,
            boot_mode_mask: statr.try_bit_field("boot_mode")?.mask as u32,
            boot_lock_mask: statr.try_bit_field("boot_lock")?.mask as u32,
            lock_mask: ctlr.try_bit_field("lock")?.mask as u32,
            mer_mask: ctlr.try_bit_field("mer")?.mask as u32,
            strt_mask: ctlr.try_bit_field("strt")?.mask as u32,
        })
    }

    pub fn record(&mut self, entry: impl Into<String>) {
        self.transcript.push(entry.into());
    }

    /// The transcript of side-effecting operations, in order.
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    pub fn signature(&self) -> TargetSignature {
        match &self.signature_override {
            Some(bytes) => TargetSignature(bytes.clone()),
            None => self.descriptor.signature.clone(),
        }
    }

    /// Makes the next `count` execution-state polls fail with a device
    /// communication failure.
    pub fn fail_next_polls(&mut self, count: u32) {
        self.fail_polls_remaining = count;
    }

    /// Attaches the debug interface. With `require_dwen` (debugWIRE), the
    /// attach fails unless the DWEN fuse bit is programmed.
    pub fn activate_debug_interface(&mut self, require_dwen: bool) -> Result<(), Error> {
        if require_dwen && self.descriptor.family == TargetFamily::Avr8 {
            let descriptor = self.descriptor.clone();
            if let Ok((register, field)) = descriptor.fuse_register_bit_field_pair("dwen") {
                let value = self.read_fuse_quiet(register)?;
                if !self.fuse_enabled(field.mask as FuseValue, value) {
                    return Err(Error::DebugWireActivation(
                        "the DWEN fuse bit is not programmed".to_owned(),
                    ));
                }
            }
        }

        self.debug_interface_active = true;
        self.record("debug.activate");
        Ok(())
    }

    pub fn deactivate_debug_interface(&mut self) {
        self.debug_interface_active = false;
        self.record("debug.deactivate");
    }

    pub fn execution_state(&mut self) -> Result<TargetExecutionState, Error> {
        if self.fail_polls_remaining > 0 {
            self.fail_polls_remaining -= 1;
            return Err(Error::DeviceCommunicationFailure(
                "simulated probe disconnect".to_owned(),
            ));
        }

        Ok(self.execution_state)
    }

    pub fn stop(&mut self) {
        self.execution_state = TargetExecutionState::Stopped;
    }

    pub fn run(&mut self) {
        self.execution_state = TargetExecutionState::Running;
    }

    /// Executes a single instruction step: the program counter advances and
    /// the device is stopped again by the time the tool reports back.
    pub fn step(&mut self) {
        self.program_counter += 2;
        self.execution_state = TargetExecutionState::Stopped;
    }

    pub fn reset(&mut self) {
        self.program_counter = 0;
        self.execution_state = TargetExecutionState::Stopped;
        self.record("reset");
    }

    /// Test hook: the running program halts at `program_counter` (e.g. a
    /// breakpoint hit).
    pub fn halt_at(&mut self, program_counter: MemoryAddress) {
        self.program_counter = program_counter;
        self.execution_state = TargetExecutionState::Stopped;
    }

    pub fn program_counter(&self) -> MemoryAddress {
        self.program_counter
    }

    pub fn set_program_counter(&mut self, address: MemoryAddress) {
        self.program_counter = address;
    }

    pub fn cpu_register(&self, number: u8) -> u32 {
        self.cpu_registers.get(&number).copied().unwrap_or(0)
    }

    pub fn set_cpu_register(&mut self, number: u8, value: u32) {
        self.cpu_registers.insert(number, value);
    }

    pub fn set_programming_mode(&mut self, enabled: bool) {
        self.programming_mode = enabled;
        self.record(if enabled { "programming_mode.enable" } else { "programming_mode.disable" });
    }

    pub fn programming_mode(&self) -> bool {
        self.programming_mode
    }

    pub fn set_hardware_breakpoint(&mut self, address: MemoryAddress) {
        self.hardware_breakpoints.push(address);
    }

    pub fn clear_hardware_breakpoint(&mut self, address: MemoryAddress) {
        self.hardware_breakpoints.retain(|&installed| installed != address);
    }

    pub fn hardware_breakpoints(&self) -> &[MemoryAddress] {
        &self.hardware_breakpoints
    }

    fn fuse_enabled(&self, mask: FuseValue, value: FuseValue) -> bool {
        match self.descriptor.fuse_enable_strategy.unwrap_or(FuseEnableStrategy::Clear) {
            FuseEnableStrategy::Set => (value & mask) == mask,
            FuseEnableStrategy::Clear => (value & mask) == 0,
        }
    }

    fn read_fuse_quiet(&mut self, descriptor: &RegisterDescriptor) -> Result<FuseValue, Error> {
        Ok(self.read_memory("fuses", "fuses", descriptor.start_address, 1)?[0])
    }

    pub fn read_fuse(&mut self, descriptor: &RegisterDescriptor) -> Result<FuseValue, Error> {
        let value = self.read_fuse_quiet(descriptor)?;
        self.record(format!("isp.read_fuse {} 0x{value:02x}", descriptor.key));
        Ok(value)
    }

    pub fn program_fuse(
        &mut self,
        descriptor: &RegisterDescriptor,
        value: FuseValue,
    ) -> Result<(), Error> {
        self.record(format!("isp.program_fuse {} 0x{value:02x}", descriptor.key));
        self.write_memory("fuses", "fuses", descriptor.start_address, &[value])
    }

    pub fn read_lock_bit_byte(&mut self) -> Result<u8, Error> {
        Ok(self.read_memory("lockbits", "lockbits", 0, 1)?[0])
    }

    pub fn erase_chip(&mut self) -> Result<(), Error> {
        self.record("erase_chip");

        let descriptor = self.descriptor.clone();
        let eesave_programmed = match descriptor.fuse_register_bit_field_pair("eesave") {
            Ok((register, field)) => {
                let mask = field.mask as FuseValue;
                let value = self.read_fuse_quiet(register)?;
                self.fuse_enabled(mask, value)
            }
            Err(_) => false,
        };

        self.fill_segments_of_type(MemorySegmentType::Flash, 0xFF);
        if !eesave_programmed {
            self.fill_segments_of_type(MemorySegmentType::Eeprom, 0xFF);
        }

        Ok(())
    }

    pub fn erase_program_memory(&mut self) -> Result<(), Error> {
        self.record("erase_program_memory");
        self.fill_segments_of_type(MemorySegmentType::Flash, 0xFF);
        Ok(())
    }

    fn fill_segments_of_type(&mut self, segment_type: MemorySegmentType, fill: u8) {
        for space in &self.descriptor.address_spaces {
            for segment in &space.memory_segments {
                if segment.segment_type != segment_type {
                    continue;
                }

                if let Some(image) =
                    self.memories.get_mut(&(space.key.clone(), segment.key.clone()))
                {
                    image.fill(fill);
                }
            }
        }
    }

    /// The segment the WCH mapped program memory segment currently aliases.
    fn aliased_segment_key(&self) -> &'static str {
        let boot_mode = self
            .flash_control
            .as_ref()
            .map(|control| {
                let statr = self.read_raw_sys_u32(control.statr);
                (statr & control.boot_mode_mask) != 0
            })
            .unwrap_or(false);

        if boot_mode {
            "boot_program"
        } else {
            "main_program"
        }
    }

    pub fn read_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        length: MemorySize,
    ) -> Result<MemoryBuffer, Error> {
        if memory_segment_key == "mapped_program_memory" {
            let aliased_key = self.aliased_segment_key();
            let (aliased_start, aliased_len) = self.segment_bounds(address_space_key, aliased_key)?;
            let mapped_start = self.segment_bounds(address_space_key, memory_segment_key)?.0;

            let offset = start_address - mapped_start;
            if offset + length > aliased_len {
                return Err(Error::TargetOperationFailure(format!(
                    "out-of-bounds access via mapped program memory (0x{:08x})",
                    start_address
                )));
            }

            return self.read_memory(address_space_key, aliased_key, aliased_start + offset, length);
        }

        let (segment_start, segment_len) = self.segment_bounds(address_space_key, memory_segment_key)?;
        let offset = start_address.checked_sub(segment_start).ok_or_else(|| {
            Error::TargetOperationFailure(format!("address 0x{start_address:08x} below segment"))
        })?;

        if offset + length > segment_len {
            return Err(Error::TargetOperationFailure(format!(
                "read of {length} bytes at 0x{start_address:08x} exceeds segment"
            )));
        }

        let image = &self.memories[&(address_space_key.to_owned(), memory_segment_key.to_owned())];
        Ok(image[offset as usize..(offset + length) as usize].to_vec())
    }

    pub fn write_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        data: &[u8],
    ) -> Result<(), Error> {
        if memory_segment_key == "mapped_program_memory" {
            let aliased_key = self.aliased_segment_key();
            let (aliased_start, aliased_len) = self.segment_bounds(address_space_key, aliased_key)?;
            let mapped_start = self.segment_bounds(address_space_key, memory_segment_key)?.0;

            let offset = start_address - mapped_start;
            if offset + data.len() as MemorySize > aliased_len {
                return Err(Error::TargetOperationFailure(format!(
                    "out-of-bounds access via mapped program memory (0x{:08x})",
                    start_address
                )));
            }

            return self.write_memory(address_space_key, aliased_key, aliased_start + offset, data);
        }

        let (segment_start, segment_len) = self.segment_bounds(address_space_key, memory_segment_key)?;
        let offset = start_address.checked_sub(segment_start).ok_or_else(|| {
            Error::TargetOperationFailure(format!("address 0x{start_address:08x} below segment"))
        })?;

        if offset + data.len() as MemorySize > segment_len {
            return Err(Error::TargetOperationFailure(format!(
                "write of {} bytes at 0x{start_address:08x} exceeds segment",
                data.len()
            )));
        }

        let image = self
            .memories
            .get_mut(&(address_space_key.to_owned(), memory_segment_key.to_owned()))
            .unwrap();
        image[offset as usize..offset as usize + data.len()].copy_from_slice(data);

        if data.len() == 4 {
            let value = u32::from_le_bytes(data.try_into().unwrap());
            self.flash_control_write(start_address, value);
        }

        Ok(())
    }

    fn segment_bounds(
        &self,
        address_space_key: &str,
        memory_segment_key: &str,
    ) -> Result<(MemoryAddress, MemorySize), Error> {
        let segment = self
            .descriptor
            .address_space(address_space_key)?
            .segment(memory_segment_key)?;
        Ok((segment.address_range.start, segment.size()))
    }

    fn read_raw_sys_u32(&self, address: MemoryAddress) -> u32 {
        let Ok(space) = self.descriptor.address_space("sys") else { return 0 };
        let Some(segment) = space.segment_containing(address) else { return 0 };
        let image = &self.memories[&("sys".to_owned(), segment.key.clone())];
        let offset = (address - segment.address_range.start) as usize;
        u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap())
    }

    fn write_raw_sys(&mut self, address: MemoryAddress, data: &[u8]) -> Result<(), Error> {
        let segment_key = self
            .descriptor
            .address_space("sys")?
            .segment_containing(address)
            .map(|segment| segment.key.clone())
            .ok_or_else(|| {
                Error::TargetOperationFailure(format!("unmapped address 0x{address:08x}"))
            })?;

        let (start, _) = self.segment_bounds("sys", &segment_key)?;
        let offset = address - start;

        let image = self.memories.get_mut(&("sys".to_owned(), segment_key)).unwrap();
        image[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Models the WCH flash controller's reaction to a 32-bit register write.
    fn flash_control_write(&mut self, address: MemoryAddress, value: u32) {
        let Some(control) = self.flash_control else { return };

        if address == control.keyr {
            self.flash_key_state = match (self.flash_key_state, value) {
                (0, FLASH_KEY_1) => 1,
                (1, FLASH_KEY_2) => {
                    let ctlr = self.read_raw_sys_u32(control.ctlr) & !control.lock_mask;
                    let _unused = self.write_raw_sys(control.ctlr, &ctlr.to_le_bytes());
                    0
                }
                _ => 0,
            };
            return;
        }

        if address == control.modekeyr {
            self.boot_key_state = match (self.boot_key_state, value) {
                (0, FLASH_KEY_1) => 1,
                (1, FLASH_KEY_2) => {
                    let statr = self.read_raw_sys_u32(control.statr) & !control.boot_lock_mask;
                    let _unused = self.write_raw_sys(control.statr, &statr.to_le_bytes());
                    0
                }
                _ => 0,
            };
            return;
        }

        if address == control.ctlr {
            let locked = (value & control.lock_mask) != 0;
            if !locked && (value & control.mer_mask) != 0 && (value & control.strt_mask) != 0 {
                self.record("flash.erase_main_segment");
                if let Some(image) =
                    self.memories.get_mut(&("sys".to_owned(), "main_program".to_owned()))
                {
                    image.fill(0xFF);
                }
            }
        }
    }
}
