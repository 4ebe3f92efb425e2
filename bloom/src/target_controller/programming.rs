//! Delta programming support.
//!
//! When a large flash write comes in during a programming session, the
//! controller reads back the affected range, diffs it against the incoming
//! buffer in adapter-advertised blocks, and writes only the runs of blocks
//! that differ. The adapter may veto a given write set, in which case the
//! full write proceeds.

use bloom_target::{MemoryAddress, MemorySize};

use crate::targets::DeltaRegion;

/// Diffs `incoming` against `current` in `block_size` blocks and returns the
/// contiguous runs of differing blocks, each clipped to the buffer length.
///
/// Both buffers describe the same range, starting at `start_address`. For any
/// input, writing the returned regions over `current` reproduces `incoming`
/// byte-for-byte.
pub(super) fn build_delta_regions(
    current: &[u8],
    incoming: &[u8],
    start_address: MemoryAddress,
    block_size: MemorySize,
) -> Vec<DeltaRegion> {
    debug_assert_eq!(current.len(), incoming.len());
    debug_assert!(block_size > 0);

    let block_size = block_size as usize;
    let mut regions: Vec<DeltaRegion> = Vec::new();

    let mut offset = 0;
    while offset < incoming.len() {
        let block_end = (offset + block_size).min(incoming.len());

        if current[offset..block_end] != incoming[offset..block_end] {
            let block_address = start_address + offset as MemoryAddress;

            match regions.last_mut() {
                Some(last)
                    if last.address + last.data.len() as MemoryAddress == block_address =>
                {
                    last.data.extend_from_slice(&incoming[offset..block_end]);
                }
                _ => {
                    regions.push(DeltaRegion {
                        address: block_address,
                        data: incoming[offset..block_end].to_vec(),
                    });
                }
            }
        }

        offset = block_end;
    }

    regions
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn apply(regions: &[DeltaRegion], base: &mut [u8], start_address: MemoryAddress) {
        for region in regions {
            let offset = (region.address - start_address) as usize;
            base[offset..offset + region.data.len()].copy_from_slice(&region.data);
        }
    }

    #[test]
    fn identical_buffers_produce_no_regions() {
        let image = vec![0xAB; 256];
        assert!(build_delta_regions(&image, &image, 0x100, 64).is_empty());
    }

    #[test]
    fn single_changed_byte_yields_one_block() {
        let current = vec![0xFF; 256];
        let mut incoming = current.clone();
        incoming[130] = 0x00;

        let regions = build_delta_regions(&current, &incoming, 0x0, 64);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].address, 128);
        assert_eq!(regions[0].data.len(), 64);
    }

    #[test]
    fn adjacent_differing_blocks_merge_into_one_region() {
        let current = vec![0xFF; 256];
        let mut incoming = current.clone();
        incoming[60] = 0x01; // block 0
        incoming[70] = 0x02; // block 1

        let regions = build_delta_regions(&current, &incoming, 0x0, 64);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].address, 0);
        assert_eq!(regions[0].data.len(), 128);
    }

    #[test]
    fn disjoint_differing_blocks_stay_separate() {
        let current = vec![0xFF; 256];
        let mut incoming = current.clone();
        incoming[0] = 0x01; // block 0
        incoming[200] = 0x02; // block 3

        let regions = build_delta_regions(&current, &incoming, 0x1000, 64);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].address, 0x1000);
        assert_eq!(regions[1].address, 0x1000 + 192);
    }

    #[test]
    fn trailing_partial_block_is_clipped() {
        let current = vec![0xFF; 100];
        let mut incoming = current.clone();
        incoming[99] = 0x00;

        let regions = build_delta_regions(&current, &incoming, 0x0, 64);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].address, 64);
        assert_eq!(regions[0].data.len(), 36);
    }

    // Applying the regions over the current image must reproduce the
    // incoming buffer byte-for-byte, for any block size.
    #[test_case(1)]
    #[test_case(16)]
    #[test_case(64)]
    #[test_case(300)]
    fn applying_regions_reproduces_the_incoming_buffer(block_size: MemorySize) {
        let current: Vec<u8> = (0..=255u8).cycle().take(777).collect();
        let mut incoming = current.clone();
        incoming[0] = 0xAA;
        incoming[300] = 0xBB;
        incoming[301] = 0xBC;
        incoming[776] = 0xCC;

        let regions = build_delta_regions(&current, &incoming, 0x0800, block_size);

        let mut result = current.clone();
        apply(&regions, &mut result, 0x0800);
        assert_eq!(result, incoming);
    }
}
