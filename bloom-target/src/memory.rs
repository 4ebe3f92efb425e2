use serde::{Deserialize, Serialize};

use crate::{DescriptorError, MemoryAddress, MemorySize};

/// An inclusive range of target memory addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    /// First address covered by the range.
    pub start: MemoryAddress,
    /// Last address covered by the range (inclusive).
    pub end: MemoryAddress,
}

impl AddressRange {
    /// Constructs a new range. `start` must not exceed `end`.
    pub fn new(start: MemoryAddress, end: MemoryAddress) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Number of addresses covered by the range.
    pub fn len(&self) -> MemorySize {
        self.end - self.start + 1
    }

    /// Inclusive ranges are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns true if `address` falls within the range.
    pub fn contains(&self, address: MemoryAddress) -> bool {
        address >= self.start && address <= self.end
    }

    /// Returns true if `self` contains `other` fully.
    pub fn contains_range(&self, other: &AddressRange) -> bool {
        self.contains(other.start) && self.contains(other.end)
    }

    /// Returns true if `self` and `other` share at least one address.
    pub fn intersects_range(&self, other: &AddressRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Byte order of an address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    /// Least significant byte at the lowest address.
    Little,
    /// Most significant byte at the lowest address.
    Big,
}

/// Declares the type of a memory segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySegmentType {
    /// Non-volatile program memory.
    Flash,
    /// Volatile data memory.
    Ram,
    /// Non-volatile data memory.
    Eeprom,
    /// Memory-mapped peripheral or CPU registers.
    Registers,
    /// Configuration fuses.
    Fuses,
    /// Lock bits.
    Lockbits,
    /// Device signature bytes.
    Signature,
    /// Memory-mapped I/O.
    Io,
    /// Anything else.
    Other,
}

/// Access rights that apply to a memory segment in one particular target mode
/// (debugging or programming).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMode {
    /// The segment can be read in this mode.
    pub readable: bool,
    /// The segment can be written in this mode.
    pub writeable: bool,
}

impl AccessMode {
    /// Read-write access.
    pub const fn read_write() -> Self {
        Self { readable: true, writeable: true }
    }

    /// Read-only access.
    pub const fn read_only() -> Self {
        Self { readable: true, writeable: false }
    }

    /// No access at all.
    pub const fn none() -> Self {
        Self { readable: false, writeable: false }
    }
}

/// A named, bounded region within an address space.
///
/// Segments never overlap within their owning address space - every address
/// resolves to at most one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySegment {
    /// Stable key, unique within the owning address space.
    pub key: String,
    /// Human-readable name.
    pub name: String,
    #[serde(rename = "type")]
    /// The segment type.
    pub segment_type: MemorySegmentType,
    /// Addresses covered by the segment.
    pub address_range: AddressRange,
    /// Page size for paged memories (flash), if any.
    pub page_size: Option<MemorySize>,
    /// True if the target can execute code from this segment.
    pub executable: bool,
    /// Access rights whilst a debug session is active.
    pub debug_mode_access: AccessMode,
    /// Access rights whilst a programming session is active.
    pub programming_mode_access: AccessMode,
}

impl MemorySegment {
    /// Size of the segment, in bytes.
    pub fn size(&self) -> MemorySize {
        self.address_range.len()
    }
}

/// A named, bounded, linear region of target memory, partitioned into disjoint
/// [`MemorySegment`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressSpace {
    /// Stable key, unique within the descriptor.
    pub key: String,
    /// Human-readable name.
    pub name: String,
    /// Byte order of multi-byte values within the space.
    pub endianness: Endianness,
    /// Addresses covered by the space.
    pub address_range: AddressRange,
    /// The segments partitioning the space.
    pub memory_segments: Vec<MemorySegment>,
}

impl AddressSpace {
    /// Looks up a segment by key.
    pub fn segment(&self, key: &str) -> Result<&MemorySegment, DescriptorError> {
        self.memory_segments
            .iter()
            .find(|segment| segment.key == key)
            .ok_or_else(|| DescriptorError::UnknownKey { entity: "memory segment", key: key.to_owned() })
    }

    /// Resolves the segment containing `address`, if any.
    pub fn segment_containing(&self, address: MemoryAddress) -> Option<&MemorySegment> {
        self.memory_segments
            .iter()
            .find(|segment| segment.address_range.contains(address))
    }

    /// Confirms that all segments fall within the space and that no two
    /// segments overlap.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        for segment in &self.memory_segments {
            if !self.address_range.contains_range(&segment.address_range) {
                return Err(DescriptorError::SegmentOutOfBounds(
                    segment.key.clone(),
                    self.key.clone(),
                ));
            }
        }

        for (index, segment) in self.memory_segments.iter().enumerate() {
            for other in &self.memory_segments[(index + 1)..] {
                if segment.address_range.intersects_range(&other.address_range) {
                    return Err(DescriptorError::OverlappingSegments(
                        segment.key.clone(),
                        other.key.clone(),
                        self.key.clone(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn segment(key: &str, start: MemoryAddress, end: MemoryAddress) -> MemorySegment {
        MemorySegment {
            key: key.to_owned(),
            name: key.to_owned(),
            segment_type: MemorySegmentType::Ram,
            address_range: AddressRange::new(start, end),
            page_size: None,
            executable: false,
            debug_mode_access: AccessMode::read_write(),
            programming_mode_access: AccessMode::read_write(),
        }
    }

    fn space(segments: Vec<MemorySegment>) -> AddressSpace {
        AddressSpace {
            key: "data".to_owned(),
            name: "data".to_owned(),
            endianness: Endianness::Little,
            address_range: AddressRange::new(0x0000, 0xFFFF),
            memory_segments: segments,
        }
    }

    #[test]
    fn contains_range_identical() {
        let range = AddressRange::new(0, 10);
        assert!(range.contains_range(&AddressRange::new(0, 10)));
    }

    #[test]
    fn contains_range_larger() {
        let range = AddressRange::new(4, 8);
        assert!(!range.contains_range(&AddressRange::new(3, 9)));
    }

    #[test]
    fn contains_range_subset() {
        let range = AddressRange::new(4, 8);
        assert!(range.contains_range(&AddressRange::new(6, 8)));
    }

    #[test]
    fn contains_range_disjoint() {
        let range = AddressRange::new(4, 8);
        assert!(!range.contains_range(&AddressRange::new(0, 1)));
    }

    #[test]
    fn intersects_range_partial_overlap() {
        let range = AddressRange::new(4, 8);
        assert!(range.intersects_range(&AddressRange::new(3, 4)));
        assert!(range.intersects_range(&AddressRange::new(8, 9)));
    }

    #[test]
    fn intersects_range_disjoint() {
        let range = AddressRange::new(4, 8);
        assert!(!range.intersects_range(&AddressRange::new(0, 3)));
        assert!(!range.intersects_range(&AddressRange::new(9, 12)));
    }

    #[test]
    fn segment_resolution_is_unambiguous() {
        let space = space(vec![
            segment("a", 0x0000, 0x00FF),
            segment("b", 0x0100, 0x01FF),
        ]);

        space.validate().unwrap();
        assert_eq!(space.segment_containing(0x00FF).unwrap().key, "a");
        assert_eq!(space.segment_containing(0x0100).unwrap().key, "b");
        assert!(space.segment_containing(0x0200).is_none());
    }

    #[test]
    fn validate_rejects_overlapping_segments() {
        let space = space(vec![
            segment("a", 0x0000, 0x0100),
            segment("b", 0x0100, 0x01FF),
        ]);

        assert!(matches!(
            space.validate(),
            Err(DescriptorError::OverlappingSegments(..))
        ));
    }

    #[test]
    fn validate_rejects_out_of_bounds_segments() {
        let mut space = space(vec![segment("a", 0x0000, 0x00FF)]);
        space.address_range = AddressRange::new(0x0000, 0x007F);

        assert!(matches!(
            space.validate(),
            Err(DescriptorError::SegmentOutOfBounds(..))
        ));
    }
}
