use serde::{Deserialize, Serialize};

use crate::{DescriptorError, MemoryAddress, MemorySize};

/// Access rights for a register.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAccess {
    /// The register can be read via the debug interface.
    pub readable: bool,
    /// The register can be written via the debug interface.
    pub writeable: bool,
}

/// A named group of bits within a register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    /// Stable key, unique within the owning register.
    pub key: String,
    /// Human-readable name.
    pub name: String,
    /// Mask selecting the bits of the field, relative to the register value.
    pub mask: u64,
}

/// An immutable description of a single target register. The target holds the
/// live value; this descriptor only says where to find it and how wide it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// Stable key, unique within the owning register group.
    pub key: String,
    /// Human-readable name.
    pub name: String,
    /// Key of the owning peripheral.
    pub peripheral_key: String,
    /// Key of the owning register group.
    pub register_group_key: String,
    /// Key of the address space the register lives in.
    pub address_space_key: String,
    /// Address of the register's first byte.
    pub start_address: MemoryAddress,
    /// Width of the register, in bytes (1-8).
    pub size: MemorySize,
    /// Access rights.
    pub access: RegisterAccess,
    /// Bit fields within the register, if any are described.
    #[serde(default)]
    pub bit_fields: Vec<BitField>,
}

impl RegisterDescriptor {
    /// Address of the register's last byte.
    pub fn end_address(&self) -> MemoryAddress {
        self.start_address + self.size - 1
    }

    /// Looks up a bit field by key.
    pub fn bit_field(&self, key: &str) -> Result<&BitField, DescriptorError> {
        self.try_bit_field(key).ok_or_else(|| DescriptorError::UnknownKey {
            entity: "bit field",
            key: key.to_owned(),
        })
    }

    /// Looks up a bit field by key, returning `None` when absent.
    pub fn try_bit_field(&self, key: &str) -> Option<&BitField> {
        self.bit_fields.iter().find(|field| field.key == key)
    }
}

/// A named collection of registers within a peripheral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterGroup {
    /// Stable key, unique within the owning peripheral.
    pub key: String,
    /// Human-readable name.
    pub name: String,
    /// The registers in the group.
    pub registers: Vec<RegisterDescriptor>,
}

impl RegisterGroup {
    /// Looks up a register by key.
    pub fn register(&self, key: &str) -> Result<&RegisterDescriptor, DescriptorError> {
        self.try_register(key).ok_or_else(|| DescriptorError::UnknownKey {
            entity: "register",
            key: key.to_owned(),
        })
    }

    /// Looks up a register by key, returning `None` when absent.
    pub fn try_register(&self, key: &str) -> Option<&RegisterDescriptor> {
        self.registers.iter().find(|register| register.key == key)
    }
}

/// Connects a peripheral to a pad, optionally carrying the signal's index
/// within the peripheral (the bit number of a GPIO line, for example).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Key of the pad the signal is routed to.
    pub pad_key: String,
    /// Numeric id of the pad the signal is routed to.
    pub pad_id: usize,
    /// Index of the signal within the peripheral, if meaningful.
    pub index: Option<u8>,
}

/// A peripheral instance on the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peripheral {
    /// Stable key, unique within the descriptor.
    pub key: String,
    /// Human-readable name.
    pub name: String,
    /// Register groups belonging to the peripheral.
    pub register_groups: Vec<RegisterGroup>,
    /// Signals routed from the peripheral to pads.
    #[serde(default)]
    pub signals: Vec<Signal>,
}

impl Peripheral {
    /// Looks up a register group by key.
    pub fn register_group(&self, key: &str) -> Result<&RegisterGroup, DescriptorError> {
        self.try_register_group(key).ok_or_else(|| DescriptorError::UnknownKey {
            entity: "register group",
            key: key.to_owned(),
        })
    }

    /// Looks up a register group by key, returning `None` when absent.
    pub fn try_register_group(&self, key: &str) -> Option<&RegisterGroup> {
        self.register_groups.iter().find(|group| group.key == key)
    }

    /// Returns the first signal routed to the pad with the given key, if any.
    pub fn first_signal_for_pad(&self, pad_key: &str) -> Option<&Signal> {
        self.signals.iter().find(|signal| signal.pad_key == pad_key)
    }
}
