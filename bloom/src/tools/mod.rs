//! Debug tool abstraction.
//!
//! A debug tool (probe) bridges host USB to the target's on-chip debug
//! interface. The target controller owns exactly one [`DebugTool`] instance;
//! target adapters drive the hardware through the family-specific interface
//! traits the tool hands out ([`Avr8DebugInterface`], [`AvrIspInterface`],
//! [`RiscvDebugInterface`]).
//!
//! Concrete USB/HID drivers live behind [`ToolRegistry`]; this crate ships
//! the in-process [`simulator`] tool, which implements every interface
//! against a simulated device and backs the test suite.

mod interfaces;
pub mod simulator;

pub use interfaces::{
    Avr8DebugInterface, AvrIspInterface, RiscvDebugInterface, TargetPowerInterface,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use bloom_target::TargetDescriptor;

use crate::config::TargetConfig;
use crate::error::Error;

/// An error in the debug tool driver.
#[derive(Debug, thiserror::Error)]
pub enum DebugToolError {
    /// The tool could not be found or opened.
    #[error("failed to open debug tool: {0}")]
    Open(String),
    /// The tool stopped responding.
    #[error("the debug tool is unresponsive: {0}")]
    Unresponsive(String),
    /// An operation was attempted before the tool was initialised.
    #[error("the debug tool has not been initialised")]
    NotInitialised,
}

/// A debug tool (probe) driver.
///
/// The target controller is the sole owner of the tool. Interface getters
/// return `None` when the tool (or its driver) cannot serve the requested
/// target family.
pub trait DebugTool: Send {
    /// The tool's display name.
    fn name(&self) -> &str;

    /// The tool's serial number, once connected.
    fn serial_number(&self) -> Option<String> {
        None
    }

    /// Establishes a connection to the tool.
    fn init(&mut self) -> Result<(), DebugToolError>;

    /// Severs the connection. Idempotent.
    fn close(&mut self) -> Result<(), DebugToolError>;

    /// True once [`DebugTool::init`] has succeeded.
    fn initialised(&self) -> bool;

    /// An AVR8 debug interface for the given target, if the tool supports
    /// the family and the configured physical interface.
    fn avr8_debug_interface(
        &mut self,
        descriptor: &Arc<TargetDescriptor>,
        config: &TargetConfig,
    ) -> Option<Box<dyn Avr8DebugInterface>> {
        let _unused = (descriptor, config);
        None
    }

    /// An AVR ISP interface, used for fuse access on debugWIRE targets.
    fn avr_isp_interface(
        &mut self,
        descriptor: &Arc<TargetDescriptor>,
        config: &TargetConfig,
    ) -> Option<Box<dyn AvrIspInterface>> {
        let _unused = (descriptor, config);
        None
    }

    /// A RISC-V debug interface for the given target, if supported.
    fn riscv_debug_interface(
        &mut self,
        descriptor: &Arc<TargetDescriptor>,
        config: &TargetConfig,
    ) -> Option<Box<dyn RiscvDebugInterface>> {
        let _unused = (descriptor, config);
        None
    }

    /// Target power control, if the tool can switch target power.
    fn target_power_interface(&mut self) -> Option<Box<dyn TargetPowerInterface>> {
        None
    }
}

type ToolFactory = Box<dyn Fn() -> Box<dyn DebugTool> + Send + Sync>;

/// Maps configuration tool names to driver constructors.
///
/// Construction never touches the device - connections are only established
/// via [`DebugTool::init`], during hardware acquisition.
pub struct ToolRegistry {
    factories: BTreeMap<String, ToolFactory>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        let mut registry = Self { factories: BTreeMap::new() };
        registry.register("simulator", || Box::new(simulator::SimulatedTool::new()));
        registry
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver constructor under a configuration name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn DebugTool> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// True if `name` maps to a known driver.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiates the driver registered under `name`.
    pub fn tool(&self, name: &str) -> Result<Box<dyn DebugTool>, Error> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "debug tool name (\"{name}\") not recognised - please check your configuration"
                ))
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_resolves_the_simulator() {
        let registry = ToolRegistry::new();
        assert!(registry.contains("simulator"));
        assert_eq!(registry.tool("simulator").unwrap().name(), "Simulator");
    }

    #[test]
    fn unknown_tool_name_is_invalid_config() {
        let registry = ToolRegistry::new();
        assert!(matches!(registry.tool("atmel-ice-2"), Err(Error::InvalidConfig(_))));
    }
}
