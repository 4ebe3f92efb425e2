//! The simulator debug tool.
//!
//! An in-process [`DebugTool`] that services every family interface against a
//! [`SimulatedDevice`] - a memory image built from the target descriptor,
//! plus just enough behavioral modelling (execution state, fuses, lock bits,
//! the WCH flash controller) to exercise the target controller end-to-end
//! without hardware. The test suite drives it through [`DeviceSlot`].

mod device;

pub use device::{DeviceSlot, SimulatedDevice, SimulatorOptions};

use std::sync::{Arc, Mutex};

use bloom_target::{
    FuseValue, MemoryAddress, MemoryBuffer, MemorySize, PhysicalInterface, RegisterDescriptor,
    TargetDescriptor, TargetSignature,
};

use crate::config::TargetConfig;
use crate::error::Error;
use crate::targets::TargetExecutionState;

use super::{
    Avr8DebugInterface, AvrIspInterface, DebugTool, DebugToolError, RiscvDebugInterface,
    TargetPowerInterface,
};

/// The simulator tool driver.
pub struct SimulatedTool {
    initialised: bool,
    options: SimulatorOptions,
    device: Option<Arc<Mutex<SimulatedDevice>>>,
}

impl SimulatedTool {
    pub fn new() -> Self {
        Self::with_options(SimulatorOptions::default())
    }

    pub fn with_options(options: SimulatorOptions) -> Self {
        Self { initialised: false, options, device: None }
    }

    fn device(&mut self, descriptor: &Arc<TargetDescriptor>) -> Arc<Mutex<SimulatedDevice>> {
        if self.device.is_none() {
            let device = Arc::new(Mutex::new(SimulatedDevice::new(
                descriptor.clone(),
                self.options.clone(),
            )));

            if let Some(slot) = &self.options.device_slot {
                *slot.lock().unwrap() = Some(device.clone());
            }

            self.device = Some(device);
        }

        self.device.as_ref().unwrap().clone()
    }
}

impl Default for SimulatedTool {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugTool for SimulatedTool {
    fn name(&self) -> &str {
        "Simulator"
    }

    fn serial_number(&self) -> Option<String> {
        Some("SIM-0001".to_owned())
    }

    fn init(&mut self) -> Result<(), DebugToolError> {
        self.initialised = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DebugToolError> {
        self.initialised = false;
        Ok(())
    }

    fn initialised(&self) -> bool {
        self.initialised
    }

    fn avr8_debug_interface(
        &mut self,
        descriptor: &Arc<TargetDescriptor>,
        config: &TargetConfig,
    ) -> Option<Box<dyn Avr8DebugInterface>> {
        Some(Box::new(SimulatedAvr8Interface {
            device: self.device(descriptor),
            physical_interface: config.physical_interface,
        }))
    }

    fn avr_isp_interface(
        &mut self,
        descriptor: &Arc<TargetDescriptor>,
        _config: &TargetConfig,
    ) -> Option<Box<dyn AvrIspInterface>> {
        Some(Box::new(SimulatedIspInterface { device: self.device(descriptor) }))
    }

    fn riscv_debug_interface(
        &mut self,
        descriptor: &Arc<TargetDescriptor>,
        _config: &TargetConfig,
    ) -> Option<Box<dyn RiscvDebugInterface>> {
        Some(Box::new(SimulatedRiscvInterface { device: self.device(descriptor) }))
    }

    fn target_power_interface(&mut self) -> Option<Box<dyn TargetPowerInterface>> {
        self.device.as_ref().map(|device| {
            Box::new(SimulatedPowerInterface { device: device.clone() })
                as Box<dyn TargetPowerInterface>
        })
    }
}

struct SimulatedAvr8Interface {
    device: Arc<Mutex<SimulatedDevice>>,
    physical_interface: PhysicalInterface,
}

impl Avr8DebugInterface for SimulatedAvr8Interface {
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn activate(&mut self) -> Result<(), Error> {
        self.device
            .lock()
            .unwrap()
            .activate_debug_interface(self.physical_interface == PhysicalInterface::DebugWire)
    }

    fn deactivate(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().deactivate_debug_interface();
        Ok(())
    }

    fn device_signature(&mut self) -> Result<TargetSignature, Error> {
        Ok(self.device.lock().unwrap().signature())
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().stop();
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().run();
        Ok(())
    }

    fn step(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().step();
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().reset();
        Ok(())
    }

    fn execution_state(&mut self) -> Result<TargetExecutionState, Error> {
        self.device.lock().unwrap().execution_state()
    }

    fn program_counter(&mut self) -> Result<MemoryAddress, Error> {
        Ok(self.device.lock().unwrap().program_counter())
    }

    fn set_program_counter(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.device.lock().unwrap().set_program_counter(address);
        Ok(())
    }

    fn read_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        length: MemorySize,
    ) -> Result<MemoryBuffer, Error> {
        self.device.lock().unwrap().read_memory(
            address_space_key,
            memory_segment_key,
            start_address,
            length,
        )
    }

    fn write_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        data: &[u8],
    ) -> Result<(), Error> {
        self.device.lock().unwrap().write_memory(
            address_space_key,
            memory_segment_key,
            start_address,
            data,
        )
    }

    fn erase_chip(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().erase_chip()
    }

    fn erase_program_memory(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().erase_program_memory()
    }

    fn enable_programming_mode(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().set_programming_mode(true);
        Ok(())
    }

    fn disable_programming_mode(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().set_programming_mode(false);
        Ok(())
    }

    fn set_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.device.lock().unwrap().set_hardware_breakpoint(address);
        Ok(())
    }

    fn clear_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.device.lock().unwrap().clear_hardware_breakpoint(address);
        Ok(())
    }
}

struct SimulatedIspInterface {
    device: Arc<Mutex<SimulatedDevice>>,
}

impl AvrIspInterface for SimulatedIspInterface {
    fn activate(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().record("isp.activate");
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().record("isp.deactivate");
        Ok(())
    }

    fn device_signature(&mut self) -> Result<TargetSignature, Error> {
        Ok(self.device.lock().unwrap().signature())
    }

    fn read_fuse(&mut self, descriptor: &RegisterDescriptor) -> Result<FuseValue, Error> {
        self.device.lock().unwrap().read_fuse(descriptor)
    }

    fn program_fuse(
        &mut self,
        descriptor: &RegisterDescriptor,
        value: FuseValue,
    ) -> Result<(), Error> {
        self.device.lock().unwrap().program_fuse(descriptor, value)
    }

    fn read_lock_bit_byte(&mut self) -> Result<u8, Error> {
        self.device.lock().unwrap().read_lock_bit_byte()
    }
}

struct SimulatedRiscvInterface {
    device: Arc<Mutex<SimulatedDevice>>,
}

impl RiscvDebugInterface for SimulatedRiscvInterface {
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn activate(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().activate_debug_interface(false)
    }

    fn deactivate(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().deactivate_debug_interface();
        Ok(())
    }

    fn device_signature(&mut self) -> Result<TargetSignature, Error> {
        Ok(self.device.lock().unwrap().signature())
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().stop();
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().run();
        Ok(())
    }

    fn step(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().step();
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().reset();
        Ok(())
    }

    fn execution_state(&mut self) -> Result<TargetExecutionState, Error> {
        self.device.lock().unwrap().execution_state()
    }

    fn program_counter(&mut self) -> Result<MemoryAddress, Error> {
        Ok(self.device.lock().unwrap().program_counter())
    }

    fn set_program_counter(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.device.lock().unwrap().set_program_counter(address);
        Ok(())
    }

    fn read_cpu_register(&mut self, number: u8) -> Result<u32, Error> {
        Ok(self.device.lock().unwrap().cpu_register(number))
    }

    fn write_cpu_register(&mut self, number: u8, value: u32) -> Result<(), Error> {
        self.device.lock().unwrap().set_cpu_register(number, value);
        Ok(())
    }

    fn read_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        length: MemorySize,
    ) -> Result<MemoryBuffer, Error> {
        self.device.lock().unwrap().read_memory(
            address_space_key,
            memory_segment_key,
            start_address,
            length,
        )
    }

    fn write_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        data: &[u8],
    ) -> Result<(), Error> {
        self.device.lock().unwrap().write_memory(
            address_space_key,
            memory_segment_key,
            start_address,
            data,
        )
    }

    fn probe_memory(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        address: MemoryAddress,
    ) -> Result<bool, Error> {
        Ok(self
            .device
            .lock()
            .unwrap()
            .read_memory(address_space_key, memory_segment_key, address, 1)
            .is_ok())
    }

    fn set_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.device.lock().unwrap().set_hardware_breakpoint(address);
        Ok(())
    }

    fn clear_hardware_breakpoint(&mut self, address: MemoryAddress) -> Result<(), Error> {
        self.device.lock().unwrap().clear_hardware_breakpoint(address);
        Ok(())
    }

    fn enable_programming_mode(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().set_programming_mode(true);
        Ok(())
    }

    fn disable_programming_mode(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().set_programming_mode(false);
        Ok(())
    }
}

struct SimulatedPowerInterface {
    device: Arc<Mutex<SimulatedDevice>>,
}

impl TargetPowerInterface for SimulatedPowerInterface {
    fn enable_target_power(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().record("power.enable");
        Ok(())
    }

    fn disable_target_power(&mut self) -> Result<(), Error> {
        self.device.lock().unwrap().record("power.disable");
        Ok(())
    }
}
