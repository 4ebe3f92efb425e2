use std::collections::HashMap;

use bloom_target::{MemoryAddress, MemorySize};

/// A read cache over program memory.
///
/// Flash contents only change through operations the controller itself
/// performs (writes, erases, software breakpoints, programming sessions), so
/// debug-mode reads can be served from a cached segment image. Any mutating
/// operation invalidates the affected segment.
#[derive(Default)]
pub(super) struct ProgramMemoryCache {
    /// Cached segment images, keyed by (address space key, segment key).
    images: HashMap<(String, String), CachedSegment>,
}

struct CachedSegment {
    start_address: MemoryAddress,
    data: Vec<u8>,
}

impl ProgramMemoryCache {
    /// Returns the cached bytes for a range, if the segment image is present.
    pub(super) fn read(
        &self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        length: MemorySize,
    ) -> Option<Vec<u8>> {
        let cached = self
            .images
            .get(&(address_space_key.to_owned(), memory_segment_key.to_owned()))?;

        let offset = start_address.checked_sub(cached.start_address)? as usize;
        let end = offset.checked_add(length as usize)?;
        cached.data.get(offset..end).map(<[u8]>::to_vec)
    }

    /// Stores a full segment image.
    pub(super) fn insert(
        &mut self,
        address_space_key: &str,
        memory_segment_key: &str,
        start_address: MemoryAddress,
        data: Vec<u8>,
    ) {
        self.images.insert(
            (address_space_key.to_owned(), memory_segment_key.to_owned()),
            CachedSegment { start_address, data },
        );
    }

    /// Drops the cached image for one segment.
    pub(super) fn invalidate(&mut self, address_space_key: &str, memory_segment_key: &str) {
        self.images.remove(&(address_space_key.to_owned(), memory_segment_key.to_owned()));
    }

    /// Drops everything.
    pub(super) fn clear(&mut self) {
        self.images.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_hits_within_the_cached_image() {
        let mut cache = ProgramMemoryCache::default();
        cache.insert("prog", "flash", 0x1000, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(cache.read("prog", "flash", 0x1002, 3), Some(vec![3, 4, 5]));
        assert_eq!(cache.read("prog", "flash", 0x1000, 8), Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn read_misses_outside_the_cached_image() {
        let mut cache = ProgramMemoryCache::default();
        cache.insert("prog", "flash", 0x1000, vec![0; 8]);

        assert_eq!(cache.read("prog", "flash", 0x0FFF, 2), None);
        assert_eq!(cache.read("prog", "flash", 0x1006, 4), None);
        assert_eq!(cache.read("prog", "other", 0x1000, 1), None);
    }

    #[test]
    fn invalidation_drops_the_segment() {
        let mut cache = ProgramMemoryCache::default();
        cache.insert("prog", "flash", 0x0, vec![0; 4]);

        cache.invalidate("prog", "flash");
        assert_eq!(cache.read("prog", "flash", 0x0, 1), None);
    }
}
