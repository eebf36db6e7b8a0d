//! Bounded cache of decoded block payloads.
//!
//! Admission is driven by a heat map: a separate table counting every lookup ever made
//! for each block index. A block only becomes cacheable on its second observed lookup,
//! which keeps a single sequential scan of an image from churning the cache. Eviction
//! removes the entry with the fewest recorded uses, preferring the lower index on ties.

use alloc::vec::Vec;

use hashbrown::HashMap;

use super::layout::BlockIndex;

/// Default number of decoded blocks kept per stream.
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

struct CacheEntry {
    payload: Vec<u8>,
    uses: u64,
}

/// Bounded block cache with heat-based admission.
pub struct BlockCache {
    capacity: usize,
    entries: HashMap<BlockIndex, CacheEntry>,
    heat: HashMap<BlockIndex, u64>,
}

impl BlockCache {
    /// Creates a cache holding at most `capacity` decoded blocks. A capacity of zero
    /// disables caching entirely (every lookup misses).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            heat: HashMap::new(),
        }
    }

    /// Looks up the decoded payload of `index`.
    ///
    /// Every call is recorded in the heat map, hit or miss, so the admission policy sees
    /// the full request stream.
    pub fn get(&mut self, index: BlockIndex) -> Option<&[u8]> {
        *self.heat.entry(index).or_insert(0) += 1;

        let entry = self.entries.get_mut(&index)?;
        entry.uses += 1;

        Some(entry.payload.as_slice())
    }

    /// Offers a freshly decoded payload for admission.
    ///
    /// The payload is copied in only once its index has been requested at least twice;
    /// colder blocks pass through untouched.
    pub fn offer(&mut self, index: BlockIndex, payload: &[u8]) {
        if self.capacity == 0 || self.entries.contains_key(&index) {
            return;
        }

        if self.heat.get(&index).copied().unwrap_or(0) < 2 {
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict_coldest();
        }

        log::debug!(target: "vafs", "cache admit block {index} ({} bytes)", payload.len());
        self.entries.insert(
            index,
            CacheEntry {
                payload: payload.to_vec(),
                uses: 1,
            },
        );
    }

    fn evict_coldest(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(index, entry)| (entry.uses, index.0))
            .map(|(index, _)| *index);

        if let Some(index) = victim {
            log::debug!(target: "vafs", "cache evict block {index}");
            self.entries.remove(&index);
        }
    }
}
