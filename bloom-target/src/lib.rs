//! Target description schema for the Bloom debug server.
//!
//! A [`TargetDescriptor`] is a static bundle of everything Bloom needs to know
//! about a particular target: its address spaces and memory segments, register
//! and peripheral layout, pads and pinouts, and the debug resources (breakpoint
//! slots, fuse metadata) available on the silicon.
//!
//! Descriptor data is produced externally (from target description files) and
//! consumed read-only by the target-control subsystem. All types in this crate
//! de/serialize with `serde`.

mod descriptor;
mod memory;
mod pad;
mod register;

pub use descriptor::{
    BreakpointResources, FuseEnableStrategy, PhysicalInterface, TargetDescriptor, TargetFamily,
    TargetSignature, Variant,
};
pub use memory::{
    AccessMode, AddressRange, AddressSpace, Endianness, MemorySegment, MemorySegmentType,
};
pub use pad::{Pad, PadType, Pin, Pinout, PinoutType};
pub use register::{
    BitField, Peripheral, RegisterAccess, RegisterDescriptor, RegisterGroup, Signal,
};

/// An address within a target address space.
pub type MemoryAddress = u32;

/// A size, in bytes, of a target memory region or access.
pub type MemorySize = u32;

/// Raw data read from, or to be written to, target memory.
pub type MemoryBuffer = Vec<u8>;

/// The value of a single fuse byte.
pub type FuseValue = u8;

/// Errors produced when validating or querying descriptor data.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    /// Two memory segments within one address space overlap.
    #[error("memory segments \"{0}\" and \"{1}\" overlap in address space \"{2}\"")]
    OverlappingSegments(String, String, String),
    /// A segment lies outside the bounds of its owning address space.
    #[error("memory segment \"{0}\" exceeds the bounds of address space \"{1}\"")]
    SegmentOutOfBounds(String, String),
    /// A lookup by key failed.
    #[error("unknown {entity} key \"{key}\"")]
    UnknownKey {
        /// The kind of entity that was looked up (address space, segment, ...).
        entity: &'static str,
        /// The key that failed to resolve.
        key: String,
    },
}
