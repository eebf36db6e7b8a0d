//! On-disk descriptor records.
//!
//! The descriptor stream holds the whole directory graph as type-tagged, length-prefixed
//! records. A directory body is a `u32` child count followed by that many records; file
//! and directory records carry a fixed part plus their name appended inline, symlink
//! records carry name and target back to back.

use alloc::string::String;
use alloc::vec::Vec;

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};

use crate::block::{BlockStream, StreamPosition};
use crate::errors::{CanFail, IOResult, VafsError};

pub(crate) mod tree;

/// Maximum length of an entry name, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum length of a symlink target (and of a full path), in bytes.
pub const MAX_TARGET_LENGTH: usize = 4096;

/// Unix-style permission bit mask attached to files and directories.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Permissions(u32);

impl Permissions {
    pub const fn new(bits: u32) -> Self {
        Self(bits & 0o7777)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for Permissions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{:04o}", self.0))
    }
}

/// Type tag of a descriptor record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct DescriptorKind(u16);

impl DescriptorKind {
    pub(crate) const FILE: Self = Self(1);

    pub(crate) const DIRECTORY: Self = Self(2);

    pub(crate) const SYMLINK: Self = Self(3);
}

/// Common head of every descriptor record: the type tag and the total record length,
/// trailing strings included.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct RecordHead {
    kind: DescriptorKind,
    length: u16,
}

impl RecordHead {
    const SIZE: usize = core::mem::size_of::<Self>();
}

/// Fixed part of a file record; the name follows inline.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct FileRecord {
    /// First byte of the file's content in the data stream, or
    /// [`StreamPosition::INVALID`] for an empty file.
    data: StreamPosition,

    /// File content length in bytes.
    length: u32,

    permissions: Permissions,
}

/// Fixed part of a directory record; the name follows inline.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct DirectoryRecord {
    /// Position of the directory's body (child count plus records) in the descriptor
    /// stream.
    descriptors: StreamPosition,

    permissions: Permissions,
}

/// Fixed part of a symlink record; name and target follow back to back.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct SymlinkRecord {
    name_length: u16,
    target_length: u16,
}

/// A descriptor record parsed off the descriptor stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Descriptor {
    File {
        name: String,
        data: StreamPosition,
        length: u32,
        permissions: Permissions,
    },

    Directory {
        name: String,
        descriptors: StreamPosition,
        permissions: Permissions,
    },

    Symlink {
        name: String,
        target: String,
    },
}

/// Validates an entry name: non-empty UTF-8 of at most [`MAX_NAME_LENGTH`] bytes,
/// without separators.
pub(crate) fn validate_name(name: &str) -> CanFail {
    if name.is_empty() || name.contains('/') {
        return Err(VafsError::InvalidArgument);
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(VafsError::NameTooLong);
    }

    Ok(())
}

/// Validates a symlink target: non-empty UTF-8 of at most [`MAX_TARGET_LENGTH`] bytes.
pub(crate) fn validate_target(target: &str) -> CanFail {
    if target.is_empty() {
        return Err(VafsError::InvalidArgument);
    }

    if target.len() > MAX_TARGET_LENGTH {
        return Err(VafsError::NameTooLong);
    }

    Ok(())
}

/// Emits a directory body prefix: the number of child records that follow.
pub(crate) fn emit_count(stream: &mut BlockStream, count: u32) -> CanFail {
    stream.write_bytes(&count.to_le_bytes())
}

/// Emits one descriptor record at the stream's current position.
pub(crate) fn emit(stream: &mut BlockStream, descriptor: &Descriptor) -> CanFail {
    match descriptor {
        Descriptor::File {
            name,
            data,
            length,
            permissions,
        } => {
            let record = FileRecord {
                data: *data,
                length: *length,
                permissions: *permissions,
            };

            emit_head(stream, DescriptorKind::FILE, bytes_of(&record).len() + name.len())?;
            stream.write_bytes(bytes_of(&record))?;
            stream.write_bytes(name.as_bytes())
        }

        Descriptor::Directory {
            name,
            descriptors,
            permissions,
        } => {
            let record = DirectoryRecord {
                descriptors: *descriptors,
                permissions: *permissions,
            };

            emit_head(stream, DescriptorKind::DIRECTORY, bytes_of(&record).len() + name.len())?;
            stream.write_bytes(bytes_of(&record))?;
            stream.write_bytes(name.as_bytes())
        }

        Descriptor::Symlink { name, target } => {
            let record = SymlinkRecord {
                name_length: name.len() as u16,
                target_length: target.len() as u16,
            };

            let payload = bytes_of(&record).len() + name.len() + target.len();
            emit_head(stream, DescriptorKind::SYMLINK, payload)?;
            stream.write_bytes(bytes_of(&record))?;
            stream.write_bytes(name.as_bytes())?;
            stream.write_bytes(target.as_bytes())
        }
    }
}

fn emit_head(stream: &mut BlockStream, kind: DescriptorKind, payload: usize) -> CanFail {
    let length = RecordHead::SIZE + payload;
    let head = RecordHead {
        kind,
        length: u16::try_from(length).map_err(|_| VafsError::InvalidArgument)?,
    };

    stream.write_bytes(bytes_of(&head))
}

/// Reads the child count that prefixes a directory body.
pub(crate) fn parse_count(stream: &mut BlockStream) -> IOResult<u32> {
    let mut raw = [0u8; 4];
    stream.read_bytes(&mut raw)?;

    Ok(u32::from_le_bytes(raw))
}

/// Reads and parses one descriptor record at the stream's current position.
pub(crate) fn parse(stream: &mut BlockStream) -> IOResult<Descriptor> {
    let mut raw_head = [0u8; RecordHead::SIZE];
    stream.read_bytes(&mut raw_head)?;

    let head: RecordHead = pod_read_unaligned(&raw_head);
    let body_len = (head.length as usize)
        .checked_sub(RecordHead::SIZE)
        .ok_or_else(|| {
            log::error!(target: "vafs", "descriptor record shorter than its head");
            VafsError::IoIntegrity
        })?;

    let mut body = Vec::new();
    body.try_reserve_exact(body_len)?;
    body.resize(body_len, 0);
    stream.read_bytes(&mut body)?;

    match head.kind {
        DescriptorKind::FILE => {
            let fixed = core::mem::size_of::<FileRecord>();
            let record: FileRecord = take_fixed(&body, fixed)?;
            let name = parse_string(&body[fixed..], MAX_NAME_LENGTH)?;

            Ok(Descriptor::File {
                name,
                data: record.data,
                length: record.length,
                permissions: record.permissions,
            })
        }

        DescriptorKind::DIRECTORY => {
            let fixed = core::mem::size_of::<DirectoryRecord>();
            let record: DirectoryRecord = take_fixed(&body, fixed)?;
            let name = parse_string(&body[fixed..], MAX_NAME_LENGTH)?;

            Ok(Descriptor::Directory {
                name,
                descriptors: record.descriptors,
                permissions: record.permissions,
            })
        }

        DescriptorKind::SYMLINK => {
            let fixed = core::mem::size_of::<SymlinkRecord>();
            let record: SymlinkRecord = take_fixed(&body, fixed)?;

            let name_end = fixed + record.name_length as usize;
            let target_end = name_end + record.target_length as usize;

            if target_end != body.len() {
                log::error!(target: "vafs", "symlink record length disagrees with its strings");
                return Err(VafsError::IoIntegrity);
            }

            let name = parse_string(&body[fixed..name_end], MAX_NAME_LENGTH)?;
            let target = parse_string(&body[name_end..target_end], MAX_TARGET_LENGTH)?;

            Ok(Descriptor::Symlink { name, target })
        }

        kind => {
            log::error!(target: "vafs", "unknown descriptor type tag {}", kind.0);
            Err(VafsError::IoIntegrity)
        }
    }
}

fn take_fixed<T: Pod>(body: &[u8], fixed: usize) -> IOResult<T> {
    if body.len() < fixed {
        log::error!(target: "vafs", "descriptor record truncated");
        return Err(VafsError::IoIntegrity);
    }

    Ok(pod_read_unaligned(&body[..fixed]))
}

fn parse_string(raw: &[u8], max: usize) -> IOResult<String> {
    if raw.is_empty() || raw.len() > max {
        return Err(VafsError::IoIntegrity);
    }

    let text = core::str::from_utf8(raw).map_err(|_| VafsError::IoIntegrity)?;
    Ok(String::from(text))
}
