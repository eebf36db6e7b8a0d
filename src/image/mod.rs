//! Image lifecycle: creation, finalization and opening.
//!
//! An image is assembled write-only: content accumulates in two temporary memory-backed
//! block streams (descriptors and data) while the primary device holds nothing but a
//! zeroed header, so a creation abandoned half-way never leaves a readable image behind.
//! Finalization flushes the directory tree, computes the final two-stream layout, copies
//! the temporaries into place and patches the header last.
//!
//! Opening is the reverse: validate the header, read the feature table, match the stored
//! filter family against the available codecs, and hang two read-only block streams off
//! a shared view of the device.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bytemuck::{bytes_of, pod_read_unaligned};

use spin::{Mutex, MutexGuard, RwLock};

use crate::block::{
    BlockStream, FilterState, DEFAULT_DATA_BLOCK_SIZE, DESCRIPTOR_BLOCK_SIZE,
};
use crate::block::cache::DEFAULT_CACHE_CAPACITY;
use crate::descriptor::tree::{self, DirectoryNode, LockedDirectory, ROOT_NAME};
use crate::descriptor::Permissions;
use crate::device::{DeviceSeek, MemoryDevice, SharedDevice, StreamDevice};
use crate::errors::{CanFail, IOResult, VafsError};
use crate::filter::{registered_filter, FilterFamily, FilterOps};
use crate::handles::{DirectoryHandle, FileHandle, SymlinkHandle};
use crate::path::{self, FileStat, ResolvedNode};

pub(crate) mod feature;
pub(crate) mod header;

pub use feature::{Feature, FeatureGuid, FeatureTable, Overview};
pub use header::{Architecture, ImageHeader, ImageMagic, ImageVersion};

#[cfg(feature = "std")]
use crate::device::FileDevice;
#[cfg(feature = "std")]
use std::path::Path;

/// Parameters of a new image.
#[derive(Clone)]
pub struct CreateConfig {
    architecture: Architecture,
    block_size: u32,
    filter_family: FilterFamily,
    filter_ops: Option<FilterOps>,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::Unknown,
            block_size: DEFAULT_DATA_BLOCK_SIZE,
            filter_family: FilterFamily::NONE,
            filter_ops: None,
        }
    }
}

impl CreateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Architecture recorded in the image header.
    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    /// Data stream block size; must lie in `[8 KiB, 1 MiB]`.
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Applies a filter to every data block. When `ops` is `None` the codec is looked up
    /// in the process-global registry at creation time.
    pub fn filter(mut self, family: FilterFamily, ops: Option<FilterOps>) -> Self {
        self.filter_family = family;
        self.filter_ops = ops;
        self
    }
}

/// Parameters for opening a finished image.
#[derive(Clone)]
pub struct OpenOptions {
    cache_capacity: usize,
    filter_ops: Option<FilterOps>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            filter_ops: None,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of decoded blocks each stream may cache. Zero disables caching.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Explicit codec for the image's filter family, overriding the registry.
    pub fn filter_ops(mut self, ops: FilterOps) -> Self {
        self.filter_ops = Some(ops);
        self
    }
}

enum ImageMode {
    Writable,
    ReadOnly,
}

/// An archive image, either under assembly (write-only) or finished (read-only).
///
/// Sub-handles ([`DirectoryHandle`], [`FileHandle`], [`SymlinkHandle`]) borrow the
/// image, so the borrow checker keeps them from outliving it or spanning a `close`.
pub struct Vafs {
    mode: ImageMode,
    closed: bool,
    architecture: Architecture,
    attributes: u32,
    features: FeatureTable,
    filter_family: FilterFamily,
    totals: RwLock<Overview>,
    pub(crate) descriptors: Mutex<BlockStream>,
    pub(crate) data: Mutex<BlockStream>,
    root: LockedDirectory,

    /// The primary device, held only while assembling; finalization consumes it.
    primary: Option<Box<dyn StreamDevice>>,
}

impl Vafs {
    /// Creates a new image in a host file.
    #[cfg(feature = "std")]
    pub fn create<P: AsRef<Path>>(path: P, config: CreateConfig) -> IOResult<Self> {
        Self::create_device(Box::new(FileDevice::create(path)?), config)
    }

    /// Creates a new image over a caller-supplied device.
    pub fn create_device(mut device: Box<dyn StreamDevice>, config: CreateConfig) -> IOResult<Self> {
        let data_filter = if config.filter_family == FilterFamily::NONE {
            FilterState::Passthrough
        } else {
            let ops = config
                .filter_ops
                .clone()
                .or_else(|| registered_filter(config.filter_family))
                .ok_or(VafsError::UnsupportedFilter)?;

            FilterState::Ops(ops)
        };

        let descriptors = BlockStream::create(DESCRIPTOR_BLOCK_SIZE, FilterState::Passthrough)?;
        let data = BlockStream::create(config.block_size, data_filter)?;

        // Reserve the header region; the real header lands here last.
        device.seek(DeviceSeek::Start(0))?;
        device.write_all(&[0u8; ImageHeader::SIZE])?;

        let mut features = FeatureTable::new();
        features.add(Overview::default().to_feature())?;

        if config.filter_family != FilterFamily::NONE {
            features.add(feature::filter_feature(config.filter_family))?;
        }

        log::info!(
            target: "vafs",
            "assembling image: architecture {}, block size {}, filter family {}",
            config.architecture,
            config.block_size,
            config.filter_family,
        );

        Ok(Self {
            mode: ImageMode::Writable,
            closed: false,
            architecture: config.architecture,
            attributes: 0,
            features,
            filter_family: config.filter_family,
            totals: RwLock::new(Overview::default()),
            descriptors: Mutex::new(descriptors),
            data: Mutex::new(data),
            root: DirectoryNode::new_root(Permissions::new(0o777)),
            primary: Some(device),
        })
    }

    /// Opens a finished image from a host file.
    #[cfg(feature = "std")]
    pub fn open<P: AsRef<Path>>(path: P) -> IOResult<Self> {
        Self::open_with(path, OpenOptions::default())
    }

    /// Opens a finished image from a host file with explicit options.
    #[cfg(feature = "std")]
    pub fn open_with<P: AsRef<Path>>(path: P, options: OpenOptions) -> IOResult<Self> {
        Self::open_device_with(Box::new(FileDevice::open(path)?), options)
    }

    /// Opens a finished image from a byte buffer. The buffer is copied into an owned
    /// read-only device.
    pub fn open_memory(buffer: &[u8]) -> IOResult<Self> {
        Self::open_memory_with(buffer, OpenOptions::default())
    }

    /// Opens a finished image from a byte buffer with explicit options.
    pub fn open_memory_with(buffer: &[u8], options: OpenOptions) -> IOResult<Self> {
        let mut owned = Vec::new();
        owned.try_reserve_exact(buffer.len())?;
        owned.extend_from_slice(buffer);

        Self::open_device_with(Box::new(MemoryDevice::read_only(owned)), options)
    }

    /// Opens a finished image over a caller-supplied device.
    pub fn open_device(device: Box<dyn StreamDevice>) -> IOResult<Self> {
        Self::open_device_with(device, OpenOptions::default())
    }

    /// Opens a finished image over a caller-supplied device with explicit options.
    pub fn open_device_with(device: Box<dyn StreamDevice>, options: OpenOptions) -> IOResult<Self> {
        let shared = SharedDevice::new(device)?;
        let device_len = shared.len();

        let mut head_view = shared.fork();
        let mut raw_header = [0u8; ImageHeader::SIZE];
        head_view
            .read_exact(&mut raw_header)
            .map_err(|_| VafsError::IoIntegrity)?;

        let header: ImageHeader = pod_read_unaligned(&raw_header);
        header.validate(device_len)?;

        let feature_region =
            header.descriptor_block_offset as usize - ImageHeader::SIZE;
        let features = FeatureTable::read_from(
            &mut head_view,
            usize::from(header.feature_count),
            feature_region,
        )?;

        let filter_family = match features.query(FeatureGuid::FILTER) {
            Some(record) => feature::filter_family_of(record)?,
            None => FilterFamily::NONE,
        };

        let data_filter = if filter_family == FilterFamily::NONE {
            FilterState::Passthrough
        } else {
            match options
                .filter_ops
                .clone()
                .or_else(|| registered_filter(filter_family))
            {
                Some(ops) => FilterState::Ops(ops),
                None => FilterState::Unsupported(filter_family),
            }
        };

        let descriptors = BlockStream::open(
            Box::new(shared.fork()),
            u64::from(header.descriptor_block_offset),
            FilterState::Passthrough,
            options.cache_capacity,
        )?;

        let data = BlockStream::open(
            Box::new(shared.fork()),
            u64::from(header.data_block_offset),
            data_filter,
            options.cache_capacity,
        )?;

        let architecture = Architecture::from_raw(header.architecture);

        let totals = match features.query(FeatureGuid::OVERVIEW) {
            Some(record) => Overview::from_feature(record)?,
            None => Overview::default(),
        };

        log::info!(
            target: "vafs",
            "opened image: architecture {architecture}, {} features, descriptors at {}, data at {}",
            features.count(),
            header.descriptor_block_offset,
            header.data_block_offset,
        );

        Ok(Self {
            mode: ImageMode::ReadOnly,
            closed: false,
            architecture,
            attributes: header.attributes,
            features,
            filter_family,
            totals: RwLock::new(totals),
            descriptors: Mutex::new(descriptors),
            data: Mutex::new(data),
            root: DirectoryNode::open_at(
                alloc::string::String::from(ROOT_NAME),
                Permissions::new(0o755),
                header.root_descriptor,
            ),
            primary: None,
        })
    }

    /// Finalizes a writable image, or releases a read-only one.
    ///
    /// On a writable image this flushes the directory tree into the descriptor stream,
    /// finishes both streams, lays them out back to back after the feature table, copies
    /// them into the primary device and patches the header. The image refuses all
    /// further operations afterwards; a second `close` fails with
    /// [`VafsError::InvalidArgument`].
    pub fn close(&mut self) -> CanFail {
        if self.closed {
            return Err(VafsError::InvalidArgument);
        }

        self.closed = true;

        if matches!(self.mode, ImageMode::ReadOnly) {
            return Ok(());
        }

        let mut descriptors = self.descriptors.try_lock().ok_or(VafsError::WouldBlock)?;
        let mut data = self.data.try_lock().ok_or(VafsError::WouldBlock)?;

        tree::flush_directory(&self.root, &mut descriptors)?;

        let totals = *self.totals.read();
        self.features.update(totals.to_feature())?;

        let descriptor_base = (ImageHeader::SIZE + self.features.serialized_len()) as u64;
        let descriptor_len = descriptors.finish(descriptor_base)?;
        let data_base = descriptor_base + descriptor_len;
        data.finish(data_base)?;

        let primary = self.primary.as_mut().ok_or(VafsError::InvalidArgument)?;

        primary.seek(DeviceSeek::Start(ImageHeader::SIZE as u64))?;
        self.features.write_to(primary.as_mut())?;

        descriptors.copy_into(primary.as_mut())?;
        data.copy_into(primary.as_mut())?;

        let header = ImageHeader {
            magic: ImageMagic::VALUE,
            version: ImageVersion::CURRENT,
            architecture: self.architecture.as_raw(),
            feature_count: u16::try_from(self.features.count())
                .map_err(|_| VafsError::InvalidArgument)?,
            reserved: 0,
            attributes: self.attributes,
            descriptor_block_offset: u32::try_from(descriptor_base)
                .map_err(|_| VafsError::InvalidArgument)?,
            data_block_offset: u32::try_from(data_base)
                .map_err(|_| VafsError::InvalidArgument)?,
            root_descriptor: self.root.read().descriptors,
        };

        primary.seek(DeviceSeek::Start(0))?;
        primary.write_all(bytes_of(&header))?;
        primary.flush()?;

        log::info!(
            target: "vafs",
            "finalized image: {} files, {} directories, {} symlinks, {} content bytes",
            totals.files,
            totals.directories,
            totals.symlinks,
            totals.total_uncompressed_bytes,
        );

        Ok(())
    }

    /// Architecture recorded in the image header.
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Filter family the image was written with; [`FilterFamily::NONE`] when blocks are
    /// stored verbatim.
    pub fn filter_family(&self) -> FilterFamily {
        self.filter_family
    }

    /// Installs a feature record, to be persisted at finalization.
    pub fn feature_add(&mut self, feature: Feature) -> CanFail {
        self.assert_open()?;

        if matches!(self.mode, ImageMode::ReadOnly) {
            return Err(VafsError::PermissionDenied);
        }

        self.features.add(feature)
    }

    /// Looks up an installed feature record by GUID.
    pub fn feature_query(&self, guid: FeatureGuid) -> IOResult<&Feature> {
        self.assert_open()?;
        self.features.query(guid).ok_or(VafsError::NoSuchEntry)
    }

    /// Entry counts and content byte total of the image.
    pub fn overview(&self) -> Overview {
        *self.totals.read()
    }

    /// Opens the directory at `path`, resolving symlinks along the way.
    pub fn open_directory(&self, path: &str) -> IOResult<DirectoryHandle<'_>> {
        self.assert_open()?;

        match path::resolve(self, path, true)? {
            ResolvedNode::Directory(node) => Ok(DirectoryHandle::new(self, node)),
            _ => Err(VafsError::NotADirectory),
        }
    }

    /// Opens the file at `path`, resolving symlinks along the way, terminal ones
    /// included.
    pub fn open_file(&self, path: &str) -> IOResult<FileHandle<'_>> {
        self.assert_open()?;

        match path::resolve(self, path, true)? {
            ResolvedNode::File(node) => Ok(FileHandle::open(self, node)),
            ResolvedNode::Directory(_) => Err(VafsError::IsADirectory),
            ResolvedNode::Symlink(_) => Err(VafsError::InvalidArgument),
        }
    }

    /// Opens the symlink at `path` itself, without following it.
    pub fn open_symlink(&self, path: &str) -> IOResult<SymlinkHandle<'_>> {
        self.assert_open()?;

        match path::resolve(self, path, false)? {
            ResolvedNode::Symlink(node) => Ok(SymlinkHandle::new(self, node)),
            ResolvedNode::Directory(_) => Err(VafsError::IsADirectory),
            ResolvedNode::File(_) => Err(VafsError::InvalidArgument),
        }
    }

    /// Reports the type, permissions and size of the entry at `path` without following
    /// a terminal symlink.
    pub fn path_stat(&self, path: &str) -> IOResult<FileStat> {
        self.assert_open()?;
        path::stat(self, path)
    }

    pub(crate) fn root_directory(&self) -> LockedDirectory {
        self.root.clone()
    }

    pub(crate) fn assert_open(&self) -> CanFail {
        if self.closed {
            return Err(VafsError::InvalidArgument);
        }

        Ok(())
    }

    pub(crate) fn assert_readable(&self) -> CanFail {
        self.assert_open()?;

        if matches!(self.mode, ImageMode::Writable) {
            return Err(VafsError::PermissionDenied);
        }

        Ok(())
    }

    pub(crate) fn assert_writable(&self) -> CanFail {
        self.assert_open()?;

        if matches!(self.mode, ImageMode::ReadOnly) {
            return Err(VafsError::PermissionDenied);
        }

        Ok(())
    }

    /// Acquires the data stream, failing with [`VafsError::WouldBlock`] if another
    /// operation holds it.
    pub(crate) fn lock_data(&self) -> IOResult<MutexGuard<'_, BlockStream>> {
        self.data.try_lock().ok_or(VafsError::WouldBlock)
    }

    /// Ensures a lazily opened directory has its children attached, reading them off the
    /// descriptor stream if needed.
    pub(crate) fn load_directory(&self, directory: &LockedDirectory) -> CanFail {
        if directory.read().is_loaded() {
            return Ok(());
        }

        let mut descriptors = self.descriptors.try_lock().ok_or(VafsError::WouldBlock)?;
        tree::load_directory(directory, &mut descriptors)
    }

    pub(crate) fn note_file_created(&self) {
        self.totals.write().files += 1;
    }

    pub(crate) fn note_directory_created(&self) {
        self.totals.write().directories += 1;
    }

    pub(crate) fn note_symlink_created(&self) {
        self.totals.write().symlinks += 1;
    }

    pub(crate) fn note_bytes_written(&self, count: u64) {
        self.totals.write().total_uncompressed_bytes += count;
    }
}
