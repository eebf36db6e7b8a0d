//! Block stream codec.
//!
//! A block stream chops a logical byte sequence into fixed-size blocks, each stored with
//! its own CRC and optional filter encoding, and addressed through a block table. Both
//! the descriptor stream and the data stream of an image use this codec; they differ
//! only in block size and in whether a filter applies.
//!
//! The write path is append-only: bytes accumulate in a staging buffer and are flushed
//! one full block at a time into a temporary device, so assembling an image never seeks
//! back into the primary device. The read path loads one block at a time into the same
//! staging buffer, consulting a bounded cache first, and verifies the payload CRC after
//! decoding.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bytemuck::{bytes_of, pod_read_unaligned};

use crate::crc32::crc32_calc;
use crate::device::{copy, DeviceSeek, MemoryDevice, StreamDevice};
use crate::errors::{CanFail, IOResult, VafsError};
use crate::filter::{FilterFamily, FilterOps};

pub(crate) mod cache;
pub(crate) mod layout;

pub use layout::{
    BlockIndex, StreamPosition, DEFAULT_DATA_BLOCK_SIZE, DESCRIPTOR_BLOCK_SIZE, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE,
};

use cache::BlockCache;
use layout::{block_size_is_valid, BlockFlags, BlockTableEntry, StreamHeader, StreamMagic};

/// Codec configuration of a stream's data path.
pub(crate) enum FilterState {
    /// Blocks are stored verbatim.
    Passthrough,

    /// Blocks run through the given codec on flush and load.
    Ops(FilterOps),

    /// The image names a filter family nobody provided callbacks for. The descriptor
    /// tree may still be readable; any block load through this stream fails.
    Unsupported(FilterFamily),
}

enum StreamMode {
    Write,
    Read,
}

/// Read/write codec for one block stream, layered over a stream device.
///
/// A write-mode stream owns a growable temporary device and can only append; a read-mode
/// stream owns a read-only view into the finished image. The owning image serializes all
/// access through a try-lock around this structure.
pub(crate) struct BlockStream {
    device: Box<dyn StreamDevice>,
    mode: StreamMode,
    block_size: u32,
    table: Vec<BlockTableEntry>,
    staging: Vec<u8>,

    /// Write mode: bytes staged for the next block. Read mode: decoded length of the
    /// block currently held in staging.
    staging_len: u32,

    /// Read mode: which block the staging buffer currently holds.
    current: Option<BlockIndex>,

    /// Read mode: logical cursor.
    cursor: StreamPosition,

    filter: FilterState,
    cache: BlockCache,
    finished: bool,
}

impl BlockStream {
    /// Creates a write-mode stream over a fresh temporary memory device.
    ///
    /// # Errors
    ///
    /// [`VafsError::InvalidArgument`] if `block_size` is outside `[8 KiB, 1 MiB]`.
    pub(crate) fn create(block_size: u32, filter: FilterState) -> IOResult<Self> {
        if !block_size_is_valid(block_size) {
            return Err(VafsError::InvalidArgument);
        }

        let mut staging = Vec::new();
        staging.try_reserve_exact(block_size as usize)?;
        staging.resize(block_size as usize, 0);

        let mut device = MemoryDevice::writable();

        // Placeholder header; rewritten in place by `finish` once the block table has
        // been emitted.
        device.write_all(&[0u8; StreamHeader::SIZE])?;

        Ok(Self {
            device: Box::new(device),
            mode: StreamMode::Write,
            block_size,
            table: Vec::new(),
            staging,
            staging_len: 0,
            current: None,
            cursor: StreamPosition::default(),
            filter,
            cache: BlockCache::new(0),
            finished: false,
        })
    }

    /// Opens a read-mode stream whose header sits at absolute image offset `base` of
    /// `device`.
    ///
    /// The block table is loaded and bounds-checked eagerly: every entry must address a
    /// byte range between the stream header and the table itself.
    pub(crate) fn open(
        device: Box<dyn StreamDevice>,
        base: u64,
        filter: FilterState,
        cache_capacity: usize,
    ) -> IOResult<Self> {
        let mut device = device;

        let mut raw_header = [0u8; StreamHeader::SIZE];
        device.seek(DeviceSeek::Start(base))?;
        device
            .read_exact(&mut raw_header)
            .map_err(|_| VafsError::IoIntegrity)?;

        let header: StreamHeader = pod_read_unaligned(&raw_header);
        header.validate()?;

        let table_offset = u64::from(header.block_table_offset);
        let blocks_start = base + StreamHeader::SIZE as u64;

        if table_offset < blocks_start {
            log::error!(target: "vafs", "block table offset {table_offset} inside stream header");
            return Err(VafsError::IoIntegrity);
        }

        device
            .seek(DeviceSeek::Start(table_offset))
            .map_err(|_| VafsError::IoIntegrity)?;

        let mut table = Vec::new();
        table.try_reserve_exact(header.block_count as usize)?;

        let mut raw_entry = [0u8; BlockTableEntry::SIZE];
        for index in 0..header.block_count {
            device
                .read_exact(&mut raw_entry)
                .map_err(|_| VafsError::IoIntegrity)?;

            let entry: BlockTableEntry = pod_read_unaligned(&raw_entry);
            let start = u64::from(entry.offset);
            let end = start + u64::from(entry.length_on_disk);

            if start < blocks_start || end > table_offset {
                log::error!(
                    target: "vafs",
                    "block {index} range [{start}, {end}) escapes stream region [{blocks_start}, {table_offset})"
                );
                return Err(VafsError::IoIntegrity);
            }

            table.push(entry);
        }

        let mut staging = Vec::new();
        staging.try_reserve_exact(header.block_size as usize)?;
        staging.resize(header.block_size as usize, 0);

        Ok(Self {
            device,
            mode: StreamMode::Read,
            block_size: header.block_size,
            table,
            staging,
            staging_len: 0,
            current: None,
            cursor: StreamPosition::default(),
            filter,
            cache: BlockCache::new(cache_capacity),
            finished: true,
        })
    }

    /// Current append position of a write-mode stream, used to assign descriptor and
    /// data positions to entries as they are emitted.
    pub(crate) fn position(&self) -> StreamPosition {
        StreamPosition::new(BlockIndex(self.table.len() as u32), self.staging_len)
    }

    /// Appends `buf` to the stream, flushing full blocks as the staging buffer fills.
    pub(crate) fn write_bytes(&mut self, buf: &[u8]) -> CanFail {
        if !matches!(self.mode, StreamMode::Write) || self.finished {
            return Err(VafsError::PermissionDenied);
        }

        let mut remaining = buf;

        while !remaining.is_empty() {
            let space = (self.block_size - self.staging_len) as usize;
            let take = usize::min(space, remaining.len());
            let start = self.staging_len as usize;

            self.staging[start..start + take].copy_from_slice(&remaining[..take]);
            self.staging_len += take as u32;
            remaining = &remaining[take..];

            if self.staging_len == self.block_size {
                self.flush_block()?;
            }
        }

        Ok(())
    }

    /// Encodes and appends the staged block, recording its table entry.
    fn flush_block(&mut self) -> CanFail {
        if self.staging_len == 0 {
            return Ok(());
        }

        let decoded = &self.staging[..self.staging_len as usize];
        let crc = crc32_calc(decoded);

        let offset = self.device.seek(DeviceSeek::Current(0))?;
        let offset = u32::try_from(offset).map_err(|_| VafsError::InvalidArgument)?;

        let length_on_disk = match &self.filter {
            FilterState::Ops(ops) => {
                let encoded = ops.encode(decoded)?;
                self.device.write_all(&encoded)?;
                encoded.len()
            }
            FilterState::Passthrough => {
                self.device.write_all(decoded)?;
                decoded.len()
            }
            FilterState::Unsupported(family) => {
                // A write-mode stream is never configured with an unresolvable family.
                log::error!(target: "vafs", "write through unsupported filter family {family}");
                return Err(VafsError::UnsupportedFilter);
            }
        };

        log::debug!(
            target: "vafs",
            "flush block {}: {} decoded bytes, {length_on_disk} on disk",
            self.table.len(),
            self.staging_len,
        );

        self.table.push(BlockTableEntry {
            length_on_disk: u32::try_from(length_on_disk).map_err(|_| VafsError::InvalidArgument)?,
            offset,
            crc,
            flags: BlockFlags::NONE,
            reserved: 0,
        });
        self.staging_len = 0;

        Ok(())
    }

    /// Finalizes a write-mode stream, given the absolute image offset `base` the stream
    /// will occupy: flushes the partial tail block, emits the block table (with offsets
    /// relocated to the image origin) and rewrites the stream header in place.
    ///
    /// Returns the total on-disk size of the stream.
    pub(crate) fn finish(&mut self, base: u64) -> IOResult<u64> {
        if !matches!(self.mode, StreamMode::Write) || self.finished {
            return Err(VafsError::PermissionDenied);
        }

        self.flush_block()?;

        let table_offset = self.device.seek(DeviceSeek::Current(0))? + base;
        let table_offset = u32::try_from(table_offset).map_err(|_| VafsError::InvalidArgument)?;

        for entry in &mut self.table {
            let relocated = u64::from(entry.offset) + base;
            entry.offset = u32::try_from(relocated).map_err(|_| VafsError::InvalidArgument)?;
        }

        for entry in &self.table {
            self.device.write_all(bytes_of(entry))?;
        }

        let total = self.device.seek(DeviceSeek::Current(0))?;

        let header = StreamHeader {
            magic: StreamMagic::VALUE,
            block_size: self.block_size,
            block_table_offset: table_offset,
            block_count: self.table.len() as u32,
        };

        self.device.seek(DeviceSeek::Start(0))?;
        self.device.write_all(bytes_of(&header))?;
        self.device.flush()?;

        self.finished = true;

        Ok(total)
    }

    /// Copies the finished temporary stream into `dst` at its current position.
    pub(crate) fn copy_into(&mut self, dst: &mut dyn StreamDevice) -> CanFail {
        if !self.finished {
            return Err(VafsError::InvalidArgument);
        }

        copy(dst, self.device.as_mut())
    }

    /// Positions the read cursor at `position` advanced by `skip` bytes, loading the
    /// target block.
    pub(crate) fn seek_to(&mut self, position: StreamPosition, skip: u64) -> CanFail {
        if !matches!(self.mode, StreamMode::Read) {
            return Err(VafsError::PermissionDenied);
        }

        let total = u64::from(position.offset) + skip;
        let block = u64::from(position.block.0) + total / u64::from(self.block_size);
        let offset = (total % u64::from(self.block_size)) as u32;

        let block = BlockIndex(u32::try_from(block).map_err(|_| VafsError::EndOfStream)?);

        if block.as_usize() >= self.table.len() {
            // Parking the cursor exactly at the end of the stream is allowed; reading
            // from there reports end-of-stream.
            if block.as_usize() == self.table.len() && offset == 0 {
                self.cursor = StreamPosition::new(block, 0);
                return Ok(());
            }

            return Err(VafsError::EndOfStream);
        }

        self.load_block(block)?;

        if offset > self.staging_len {
            return Err(VafsError::EndOfStream);
        }

        self.cursor = StreamPosition::new(block, offset);
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes at the cursor, crossing block boundaries as
    /// needed.
    pub(crate) fn read_bytes(&mut self, buf: &mut [u8]) -> CanFail {
        if !matches!(self.mode, StreamMode::Read) {
            return Err(VafsError::PermissionDenied);
        }

        let mut filled = 0;

        while filled < buf.len() {
            if self.cursor.block.as_usize() >= self.table.len() {
                return Err(VafsError::EndOfStream);
            }

            self.load_block(self.cursor.block)?;

            let available = (self.staging_len - self.cursor.offset) as usize;

            if available == 0 {
                // The staged block is exhausted; a short decoded block can only be the
                // final one, so advancing past it means running off the stream.
                if self.staging_len < self.block_size {
                    return Err(VafsError::EndOfStream);
                }

                self.cursor = StreamPosition::new(self.cursor.block.next(), 0);
                continue;
            }

            let take = usize::min(available, buf.len() - filled);
            let start = self.cursor.offset as usize;

            buf[filled..filled + take].copy_from_slice(&self.staging[start..start + take]);
            filled += take;
            self.cursor.offset += take as u32;
        }

        Ok(())
    }

    /// Brings `index` into the staging buffer, through the cache when possible.
    fn load_block(&mut self, index: BlockIndex) -> CanFail {
        if self.current == Some(index) {
            return Ok(());
        }

        if let Some(payload) = self.cache.get(index) {
            let len = payload.len();
            self.staging[..len].copy_from_slice(payload);
            self.staging_len = len as u32;
            self.current = Some(index);
            return Ok(());
        }

        let entry = *self
            .table
            .get(index.as_usize())
            .ok_or(VafsError::EndOfStream)?;

        let mut scratch = Vec::new();
        scratch.try_reserve_exact(entry.length_on_disk as usize)?;
        scratch.resize(entry.length_on_disk as usize, 0);

        self.device.seek(DeviceSeek::Start(u64::from(entry.offset)))?;
        self.device.read_exact(&mut scratch).map_err(|_| {
            log::error!(target: "vafs", "block {index} truncated on disk");
            VafsError::IoIntegrity
        })?;

        let decoded_len = match &self.filter {
            FilterState::Ops(ops) => ops.decode(&scratch, &mut self.staging)?,
            FilterState::Passthrough => {
                if scratch.len() > self.staging.len() {
                    log::error!(target: "vafs", "block {index} larger than the stream block size");
                    return Err(VafsError::IoIntegrity);
                }

                self.staging[..scratch.len()].copy_from_slice(&scratch);
                scratch.len()
            }
            FilterState::Unsupported(family) => {
                log::error!(target: "vafs", "no codec registered for filter family {family}");
                return Err(VafsError::UnsupportedFilter);
            }
        };

        if decoded_len > self.staging.len() {
            log::error!(target: "vafs", "filter decoded block {index} past the block size");
            return Err(VafsError::IoIntegrity);
        }

        // Only the final block may decode short.
        if index.as_usize() + 1 < self.table.len() && decoded_len != self.block_size as usize {
            log::error!(
                target: "vafs",
                "block {index} decoded to {decoded_len} bytes, expected {}",
                self.block_size
            );
            return Err(VafsError::IoIntegrity);
        }

        let decoded = &self.staging[..decoded_len];
        let crc = crc32_calc(decoded);

        if crc != entry.crc {
            log::error!(
                target: "vafs",
                "block {index} crc mismatch: computed {crc:#010x}, stored {:#010x}",
                entry.crc
            );
            return Err(VafsError::IoIntegrity);
        }

        log::debug!(target: "vafs", "load block {index}: {decoded_len} decoded bytes");

        self.cache.offer(index, decoded);
        self.staging_len = decoded_len as u32;
        self.current = Some(index);

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec;

    use crate::filter::Filter;

    const BS: u32 = MIN_BLOCK_SIZE;

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

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    /// Writes `payload` through a write-mode stream placed at image offset `base`, and
    /// returns the reopened read-mode stream over the resulting bytes.
    fn write_then_open(
        payload: &[u8],
        base: u64,
        write_filter: FilterState,
        read_filter: FilterState,
        cache_capacity: usize,
    ) -> BlockStream {
        let mut stream = BlockStream::create(BS, write_filter).unwrap();
        stream.write_bytes(payload).unwrap();
        stream.finish(base).unwrap();

        let mut image = MemoryDevice::writable();
        image.seek(DeviceSeek::Start(base)).unwrap();
        stream.copy_into(&mut image).unwrap();

        let reopened = MemoryDevice::read_only(image.into_inner());
        BlockStream::open(Box::new(reopened), base, read_filter, cache_capacity).unwrap()
    }

    #[test]
    fn round_trip_across_blocks() {
        let payload = pattern(BS as usize * 2 + 1000);
        let mut stream = write_then_open(
            &payload,
            128,
            FilterState::Passthrough,
            FilterState::Passthrough,
            0,
        );

        assert_eq!(stream.table.len(), 3);

        let mut readback = vec![0u8; payload.len()];
        stream.seek_to(StreamPosition::default(), 0).unwrap();
        stream.read_bytes(&mut readback).unwrap();
        assert_eq!(readback, payload);

        // Mid-stream seek crossing a block boundary.
        let mut tail = vec![0u8; 64];
        stream
            .seek_to(StreamPosition::default(), u64::from(BS) - 32)
            .unwrap();
        stream.read_bytes(&mut tail).unwrap();
        assert_eq!(tail, payload[BS as usize - 32..BS as usize + 32]);
    }

    #[test]
    fn exact_block_fill_emits_single_block() {
        let stream = write_then_open(
            &pattern(BS as usize),
            0,
            FilterState::Passthrough,
            FilterState::Passthrough,
            0,
        );
        assert_eq!(stream.table.len(), 1);

        let stream = write_then_open(
            &pattern(BS as usize + 1),
            0,
            FilterState::Passthrough,
            FilterState::Passthrough,
            0,
        );
        assert_eq!(stream.table.len(), 2);
        assert_eq!(stream.table[1].length_on_disk, 1);
    }

    #[test]
    fn reading_past_the_end_fails() {
        let payload = pattern(100);
        let mut stream = write_then_open(
            &payload,
            0,
            FilterState::Passthrough,
            FilterState::Passthrough,
            0,
        );

        let mut buf = vec![0u8; 101];
        stream.seek_to(StreamPosition::default(), 0).unwrap();
        assert_eq!(stream.read_bytes(&mut buf), Err(VafsError::EndOfStream));
    }

    #[test]
    fn filtered_stream_round_trips() {
        let payload = pattern(BS as usize + 123);
        let ops: FilterOps = Arc::new(XorFilter(0x5A));

        let mut stream = write_then_open(
            &payload,
            64,
            FilterState::Ops(ops.clone()),
            FilterState::Ops(ops),
            0,
        );

        let mut readback = vec![0u8; payload.len()];
        stream.seek_to(StreamPosition::default(), 0).unwrap();
        stream.read_bytes(&mut readback).unwrap();
        assert_eq!(readback, payload);
    }

    #[test]
    fn missing_filter_fails_block_loads() {
        let payload = pattern(256);
        let ops: FilterOps = Arc::new(XorFilter(0x21));

        let mut stream = write_then_open(
            &payload,
            0,
            FilterState::Ops(ops),
            FilterState::Unsupported(FilterFamily(9)),
            0,
        );

        let mut buf = vec![0u8; 16];
        assert_eq!(
            stream.seek_to(StreamPosition::default(), 0),
            Err(VafsError::UnsupportedFilter)
        );
        assert_eq!(stream.read_bytes(&mut buf), Err(VafsError::UnsupportedFilter));
    }

    #[test]
    fn corrupted_block_fails_with_integrity_error() {
        let payload = pattern(BS as usize * 2);

        let mut stream = BlockStream::create(BS, FilterState::Passthrough).unwrap();
        stream.write_bytes(&payload).unwrap();
        stream.finish(0).unwrap();

        let mut image = MemoryDevice::writable();
        stream.copy_into(&mut image).unwrap();

        let mut bytes = image.into_inner();

        // Flip one bit inside the second block's stored payload.
        let second_offset = stream.table[1].offset as usize;
        bytes[second_offset + 100] ^= 0x01;

        let mut reopened = BlockStream::open(
            Box::new(MemoryDevice::read_only(bytes)),
            0,
            FilterState::Passthrough,
            0,
        )
        .unwrap();

        let mut block = vec![0u8; BS as usize];
        reopened.seek_to(StreamPosition::default(), 0).unwrap();
        reopened.read_bytes(&mut block).unwrap();
        assert_eq!(block, payload[..BS as usize]);

        assert_eq!(
            reopened.seek_to(StreamPosition::new(BlockIndex(1), 0), 0),
            Err(VafsError::IoIntegrity)
        );
    }

    #[test]
    fn cached_reads_match_uncached_reads() {
        let payload = pattern(BS as usize * 3);

        for capacity in [0usize, 2, 32] {
            let mut stream = write_then_open(
                &payload,
                0,
                FilterState::Passthrough,
                FilterState::Passthrough,
                capacity,
            );

            // Re-read the same ranges repeatedly so the heat map admits blocks.
            for _ in 0..3 {
                let mut readback = vec![0u8; payload.len()];
                stream.seek_to(StreamPosition::default(), 0).unwrap();
                stream.read_bytes(&mut readback).unwrap();
                assert_eq!(readback, payload);
            }
        }
    }

    #[test]
    fn table_entry_escaping_stream_region_is_rejected() {
        let mut stream = BlockStream::create(BS, FilterState::Passthrough).unwrap();
        stream.write_bytes(&pattern(512)).unwrap();
        stream.finish(0).unwrap();

        let mut image = MemoryDevice::writable();
        stream.copy_into(&mut image).unwrap();
        let mut bytes = image.into_inner();

        // Corrupt the first table entry's offset so the block range escapes the region.
        let table_offset = {
            let header: StreamHeader = pod_read_unaligned(&bytes[..StreamHeader::SIZE]);
            header.block_table_offset as usize
        };
        bytes[table_offset + 4..table_offset + 8].copy_from_slice(&u32::MAX.to_le_bytes());

        assert_eq!(
            BlockStream::open(
                Box::new(MemoryDevice::read_only(bytes)),
                0,
                FilterState::Passthrough,
                0,
            )
            .err(),
            Some(VafsError::IoIntegrity)
        );
    }
}
