//! On-disk structures of a block stream.
//!
//! A block stream is laid out as `[StreamHeader][Block0]…[BlockN][BlockTable]`. The
//! header is written first as a placeholder and rewritten in place once the table
//! position and block count are known. Table entries address their block's encoded bytes
//! by absolute image offset.

use bytemuck::{Pod, Zeroable};

use crate::errors::{IOResult, VafsError};

/// Smallest accepted block size: 8 KiB.
pub const MIN_BLOCK_SIZE: u32 = 8 * 1024;

/// Largest accepted block size: 1 MiB.
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Block size of every descriptor stream.
pub const DESCRIPTOR_BLOCK_SIZE: u32 = 8 * 1024;

/// Default block size of a data stream.
pub const DEFAULT_DATA_BLOCK_SIZE: u32 = 128 * 1024;

/// Magic signature of a block stream header: `"VSM1"`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct StreamMagic(u32);

impl StreamMagic {
    pub const VALUE: Self = Self(0x314D_5356);

    pub fn is_valid(self) -> bool {
        self == Self::VALUE
    }
}

/// Index of a block within its stream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// A byte position inside a block stream, independent of the block size.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct StreamPosition {
    pub block: BlockIndex,
    pub offset: u32,
}

impl StreamPosition {
    /// Marker for a position that was never assigned (zero-length files).
    pub const INVALID: Self = Self {
        block: BlockIndex(u32::MAX),
        offset: u32::MAX,
    };

    pub fn new(block: BlockIndex, offset: u32) -> Self {
        Self { block, offset }
    }

    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }
}

impl core::fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.block, self.offset))
    }
}

/// Fixed header at the start of every block stream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct StreamHeader {
    /// Stream signature, [`StreamMagic::VALUE`].
    pub magic: StreamMagic,

    /// Decoded size of every block except possibly the last one.
    pub block_size: u32,

    /// Absolute image offset of the block table.
    pub block_table_offset: u32,

    /// Number of blocks, and of block table entries.
    pub block_count: u32,
}

impl StreamHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Validates the header of a stream opened for reading.
    ///
    /// # Errors
    ///
    /// [`VafsError::IoIntegrity`] on a bad magic or an out-of-range block size.
    pub fn validate(&self) -> IOResult<()> {
        if !self.magic.is_valid() {
            log::error!(target: "vafs", "bad stream magic {:#010x}", self.magic.0);
            return Err(VafsError::IoIntegrity);
        }

        if !block_size_is_valid(self.block_size) {
            log::error!(target: "vafs", "stream block size {} out of range", self.block_size);
            return Err(VafsError::IoIntegrity);
        }

        Ok(())
    }
}

/// Per-block flag bits. No flags are defined yet; the field is reserved on disk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockFlags(u16);

impl BlockFlags {
    pub const NONE: Self = Self(0);
}

/// One entry of the block table, addressing a single stored block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BlockTableEntry {
    /// Stored (encoded) size of the block in bytes.
    pub length_on_disk: u32,

    /// Absolute image offset of the block's first stored byte.
    pub offset: u32,

    /// CRC-32 of the *decoded* block payload.
    pub crc: u32,

    pub flags: BlockFlags,

    pub reserved: u16,
}

impl BlockTableEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Checks a block size against the accepted `[8 KiB, 1 MiB]` range.
pub fn block_size_is_valid(block_size: u32) -> bool {
    (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_disk_sizes_are_stable() {
        assert_eq!(StreamHeader::SIZE, 16);
        assert_eq!(BlockTableEntry::SIZE, 16);
        assert_eq!(core::mem::size_of::<StreamPosition>(), 8);
    }

    #[test]
    fn stream_magic_spells_vsm1() {
        assert_eq!(&StreamMagic::VALUE.0.to_le_bytes(), b"VSM1");
    }

    #[test]
    fn block_size_bounds() {
        assert!(!block_size_is_valid(MIN_BLOCK_SIZE - 1));
        assert!(block_size_is_valid(MIN_BLOCK_SIZE));
        assert!(block_size_is_valid(DEFAULT_DATA_BLOCK_SIZE));
        assert!(block_size_is_valid(MAX_BLOCK_SIZE));
        assert!(!block_size_is_valid(MAX_BLOCK_SIZE + 1));
    }

    #[test]
    fn header_validation_rejects_corruption() {
        let good = StreamHeader {
            magic: StreamMagic::VALUE,
            block_size: DESCRIPTOR_BLOCK_SIZE,
            block_table_offset: 64,
            block_count: 1,
        };
        assert!(good.validate().is_ok());

        let mut bad = good;
        bad.magic = StreamMagic(0xDEAD_BEEF);
        assert_eq!(bad.validate(), Err(VafsError::IoIntegrity));

        let mut bad = good;
        bad.block_size = 17;
        assert_eq!(bad.validate(), Err(VafsError::IoIntegrity));
    }
}
