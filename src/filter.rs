//! Pluggable per-block codecs.
//!
//! A filter is an encode/decode pair applied to every block of the data stream. The
//! image only persists the *family* identifier; the callbacks themselves are supplied by
//! the consumer, either explicitly at open/create time or through the process-global
//! registry.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bytemuck::{Pod, Zeroable};
use conquer_once::spin::OnceCell;
use hashbrown::HashMap;
use spin::RwLock;

use crate::errors::IOResult;

/// Integer identifying a filter family on disk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FilterFamily(pub u32);

impl FilterFamily {
    /// No filter: blocks are stored verbatim.
    pub const NONE: Self = Self(0);
}

impl core::fmt::Display for FilterFamily {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// Block codec contract.
///
/// `decode(encode(x))` must reproduce `x` exactly; the engine checks the block CRC over
/// the decoded payload and fails the read otherwise.
pub trait Filter: Send + Sync {
    /// Encodes a decoded block payload into its stored form, returning an owned buffer.
    fn encode(&self, input: &[u8]) -> IOResult<Vec<u8>>;

    /// Decodes a stored block into `output`, returning the decoded byte count.
    ///
    /// `output` is exactly one block in size; implementations must never report more
    /// bytes than it holds.
    fn decode(&self, input: &[u8], output: &mut [u8]) -> IOResult<usize>;
}

/// Shared handle to a filter implementation.
pub type FilterOps = Arc<dyn Filter>;

fn filter_registry() -> &'static RwLock<HashMap<FilterFamily, FilterOps>> {
    static FILTERS: OnceCell<RwLock<HashMap<FilterFamily, FilterOps>>> = OnceCell::uninit();

    FILTERS
        .try_get_or_init(|| RwLock::new(HashMap::new()))
        .unwrap()
}

/// Registers `ops` as the process-wide codec for `family`, replacing any previous
/// registration. Explicit per-open codecs take precedence over the registry.
pub fn register_filter(family: FilterFamily, ops: FilterOps) {
    filter_registry().write().insert(family, ops);
}

/// Removes the process-wide codec for `family`, if any.
pub fn unregister_filter(family: FilterFamily) {
    filter_registry().write().remove(&family);
}

/// Looks up the process-wide codec registered for `family`.
pub fn registered_filter(family: FilterFamily) -> Option<FilterOps> {
    filter_registry().read().get(&family).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct XorFilter(u8);

    impl Filter for XorFilter {
        fn encode(&self, input: &[u8]) -> IOResult<Vec<u8>> {
            Ok(input.iter().map(|b| b ^ self.0).collect())
        }

        fn decode(&self, input: &[u8], output: &mut [u8]) -> IOResult<usize> {
            for (dst, src) in output.iter_mut().zip(input) {
                *dst = src ^ self.0;
            }

            Ok(input.len())
        }
    }

    #[test]
    fn registry_round_trip() {
        let family = FilterFamily(0x5A5A);

        assert!(registered_filter(family).is_none());

        register_filter(family, Arc::new(XorFilter(0x5A)));
        let ops = registered_filter(family).unwrap();

        let encoded = ops.encode(b"abc").unwrap();
        let mut decoded = [0u8; 3];
        assert_eq!(ops.decode(&encoded, &mut decoded).unwrap(), 3);
        assert_eq!(&decoded, b"abc");

        unregister_filter(family);
        assert!(registered_filter(family).is_none());
    }
}
