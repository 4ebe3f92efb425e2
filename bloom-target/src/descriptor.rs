use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    AddressSpace, BitField, DescriptorError, Pad, Peripheral, Pinout, RegisterDescriptor,
};

/// The target family, which selects the adapter driving the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFamily {
    /// Microchip (formerly Atmel) 8-bit AVR.
    Avr8,
    /// WCH RISC-V (CH32V and friends).
    WchRiscV,
}

/// The electrical/logical protocol between the debug tool and the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalInterface {
    /// debugWIRE (single-wire, via the reset pin).
    DebugWire,
    /// Program and Debug Interface.
    Pdi,
    /// JTAG.
    Jtag,
    /// Unified Program and Debug Interface.
    Updi,
    /// WCH's single-wire Serial Debug Interface.
    Sdi,
    /// In-System Programming (SPI). Programming only - never a debug
    /// interface.
    Isp,
}

impl fmt::Display for PhysicalInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DebugWire => "debugWIRE",
            Self::Pdi => "PDI",
            Self::Jtag => "JTAG",
            Self::Updi => "UPDI",
            Self::Sdi => "SDI",
            Self::Isp => "ISP",
        };
        f.write_str(name)
    }
}

/// A target signature - the id bytes read back from the silicon to confirm
/// the connected device matches the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSignature(pub Vec<u8>);

impl TargetSignature {
    /// Renders the signature as a lowercase hex string ("1e950f").
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

impl fmt::Display for TargetSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl From<&[u8]> for TargetSignature {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Which polarity of a fuse bit means "enabled".
///
/// Classic AVRs treat a programmed (zero) bit as enabled; newer parts invert
/// this. The strategy comes from the target description data and is applied
/// uniformly to every fuse on the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuseEnableStrategy {
    /// A set bit (0b1) means the fuse is enabled.
    Set,
    /// A cleared bit (0b0) means the fuse is enabled.
    Clear,
}

/// Breakpoint slots available on the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointResources {
    /// Number of hardware comparator slots.
    pub hardware_breakpoints: u16,
    /// Number of software breakpoints supported, if bounded. `None` means
    /// limited only by writable program memory.
    pub software_breakpoints: Option<u16>,
    /// Hardware slots carved out for the protocol server's use during
    /// single-stepping. Never available to ordinary breakpoint commands.
    pub reserved_hardware_breakpoints: u16,
}

/// A purchasable variant of the target (package, temperature grade, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Stable key, unique within the descriptor.
    pub key: String,
    /// Human-readable name (order code).
    pub name: String,
    /// Key of the pinout the variant uses.
    pub pinout_key: String,
}

/// The static description of a target, loaded once at activation and treated
/// as read-only shared data from then on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Target name ("atmega328p", "ch32v003", ...).
    pub name: String,
    /// The family, selecting the target adapter.
    pub family: TargetFamily,
    /// Vendor name.
    pub vendor: String,
    /// Expected signature of the connected device.
    pub signature: TargetSignature,
    /// Physical interfaces the target supports.
    pub physical_interfaces: Vec<PhysicalInterface>,
    /// All address spaces on the target.
    pub address_spaces: Vec<AddressSpace>,
    /// All peripherals on the target.
    pub peripherals: Vec<Peripheral>,
    /// All pads on the target.
    pub pads: Vec<Pad>,
    /// All package pinouts.
    pub pinouts: Vec<Pinout>,
    /// All purchasable variants.
    pub variants: Vec<Variant>,
    /// Breakpoint slots available on the target.
    pub breakpoint_resources: BreakpointResources,
    /// Fuse polarity, for targets with managed fuses.
    pub fuse_enable_strategy: Option<FuseEnableStrategy>,
}

impl TargetDescriptor {
    /// Looks up an address space by key.
    pub fn address_space(&self, key: &str) -> Result<&AddressSpace, DescriptorError> {
        self.try_address_space(key).ok_or_else(|| DescriptorError::UnknownKey {
            entity: "address space",
            key: key.to_owned(),
        })
    }

    /// Looks up an address space by key, returning `None` when absent.
    pub fn try_address_space(&self, key: &str) -> Option<&AddressSpace> {
        self.address_spaces.iter().find(|space| space.key == key)
    }

    /// Looks up a peripheral by key.
    pub fn peripheral(&self, key: &str) -> Result<&Peripheral, DescriptorError> {
        self.try_peripheral(key).ok_or_else(|| DescriptorError::UnknownKey {
            entity: "peripheral",
            key: key.to_owned(),
        })
    }

    /// Looks up a peripheral by key, returning `None` when absent.
    pub fn try_peripheral(&self, key: &str) -> Option<&Peripheral> {
        self.peripherals.iter().find(|peripheral| peripheral.key == key)
    }

    /// Looks up a pad by id.
    pub fn pad(&self, id: usize) -> Option<&Pad> {
        self.pads.iter().find(|pad| pad.id == id)
    }

    /// Returns every peripheral whose key begins with `prefix`. GPIO port
    /// peripherals are conventionally keyed "porta", "portb", ... so the
    /// adapters use this to enumerate them.
    pub fn peripherals_with_key_prefix(&self, prefix: &str) -> Vec<&Peripheral> {
        self.peripherals
            .iter()
            .filter(|peripheral| peripheral.key.starts_with(prefix))
            .collect()
    }

    /// Finds the fuse register holding the bit field with the given key
    /// ("dwen", "spien", "ocden", "jtagen", "eesave", ...), along with the
    /// bit field itself.
    ///
    /// Fuse registers are the registers of any peripheral register group
    /// living in a `Fuses`-typed segment; in practice the descriptor carries a
    /// dedicated "fuse" peripheral.
    pub fn fuse_register_bit_field_pair(
        &self,
        bit_field_key: &str,
    ) -> Result<(&RegisterDescriptor, &BitField), DescriptorError> {
        for peripheral in &self.peripherals {
            for group in &peripheral.register_groups {
                for register in &group.registers {
                    if let Some(field) = register.try_bit_field(bit_field_key) {
                        return Ok((register, field));
                    }
                }
            }
        }

        Err(DescriptorError::UnknownKey { entity: "fuse bit field", key: bit_field_key.to_owned() })
    }

    /// Validates every address space (segment bounds and disjointness).
    pub fn validate(&self) -> Result<(), DescriptorError> {
        for space in &self.address_spaces {
            space.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn signature_hex_rendering() {
        let signature = TargetSignature(vec![0x1E, 0x95, 0x0F]);
        assert_eq!(signature.to_hex(), "1e950f");
        assert_eq!(signature.to_string(), "0x1e950f");
    }

    #[test]
    fn physical_interface_names() {
        assert_eq!(PhysicalInterface::DebugWire.to_string(), "debugWIRE");
        assert_eq!(PhysicalInterface::Sdi.to_string(), "SDI");
    }

    #[test]
    fn descriptor_round_trips_through_yaml() {
        let raw = r#"
name: "attiny85"
family: "avr8"
vendor: "Microchip"
signature: [0x1E, 0x93, 0x0B]
physical_interfaces: ["debug_wire", "isp"]
fuse_enable_strategy: "clear"
breakpoint_resources:
  hardware_breakpoints: 1
  software_breakpoints: null
  reserved_hardware_breakpoints: 0
address_spaces:
  - key: "prog"
    name: "Program memory"
    endianness: "little"
    address_range: { start: 0x0000, end: 0x1FFF }
    memory_segments:
      - key: "internal_program_memory"
        name: "Internal flash"
        type: "flash"
        address_range: { start: 0x0000, end: 0x1FFF }
        page_size: 64
        executable: true
        debug_mode_access: { readable: true, writeable: true }
        programming_mode_access: { readable: true, writeable: true }
peripherals: []
pads: []
pinouts: []
variants: []
"#;

        let descriptor: TargetDescriptor = serde_yaml::from_str(raw).unwrap();
        descriptor.validate().unwrap();

        assert_eq!(descriptor.family, TargetFamily::Avr8);
        assert_eq!(descriptor.signature.to_hex(), "1e930b");
        assert_eq!(descriptor.fuse_enable_strategy, Some(FuseEnableStrategy::Clear));

        let reparsed: TargetDescriptor =
            serde_yaml::from_str(&serde_yaml::to_string(&descriptor).unwrap()).unwrap();
        assert_eq!(reparsed, descriptor);
    }
}
