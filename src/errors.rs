//! Error types shared across the crate.
//!
//! Every fallible operation in the image engine returns [`VafsError`] through the
//! [`IOResult`] / [`CanFail`] aliases. Errors always surface to the caller: the engine
//! never retries I/O, and an integrity failure poisons only the operation that hit it,
//! not the whole image.

use core::fmt::{self, Display, Formatter};

/// `CanFail` is a return type for operations that are allowed to fail, and don't need to
/// return anything.
pub type CanFail = Result<(), VafsError>;

/// Standard result type for all image, stream and handle operations.
pub type IOResult<T> = Result<T, VafsError>;

/// `VafsError` defines the error kinds raised by image, block stream, descriptor and
/// handle operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VafsError {
    /// An argument was out of range (bad block size, oversized seek, zero-length name, ...),
    /// or an operation was attempted on an already closed image.
    InvalidArgument,

    /// A path component does not exist in its parent directory.
    NoSuchEntry,

    /// An entry with the same name already exists in the target directory, or a feature
    /// with the same GUID is already installed.
    AlreadyExists,

    /// A path component other than the last resolved to something that is not a directory.
    NotADirectory,

    /// A directory was found where a file or symlink was expected.
    IsADirectory,

    /// A write was attempted on a read-only image or device, or a read/seek was attempted
    /// on a write-only handle.
    PermissionDenied,

    /// The stream lock is held by another operation.
    WouldBlock,

    /// On-disk state failed validation: bad magic or version, truncated block, CRC
    /// mismatch, or a block table entry pointing outside its stream region.
    IoIntegrity,

    /// The image names a filter family for which no codec is registered.
    UnsupportedFilter,

    /// A name exceeds 255 bytes, or a full path exceeds 4096 bytes.
    NameTooLong,

    /// Symlink resolution crossed more than the maximum number of indirections.
    TooManyLinks,

    /// An allocation request could not be satisfied.
    OutOfMemory,

    /// A read was attempted past the last byte of a stream.
    EndOfStream,

    /// The backing device reported a host I/O failure.
    Io,
}

impl Display for VafsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidArgument => "invalid argument",
            Self::NoSuchEntry => "no such entry",
            Self::AlreadyExists => "entry already exists",
            Self::NotADirectory => "not a directory",
            Self::IsADirectory => "is a directory",
            Self::PermissionDenied => "permission denied",
            Self::WouldBlock => "operation would block",
            Self::IoIntegrity => "on-disk integrity check failed",
            Self::UnsupportedFilter => "unsupported filter family",
            Self::NameTooLong => "name too long",
            Self::TooManyLinks => "too many levels of symbolic links",
            Self::OutOfMemory => "out of memory",
            Self::EndOfStream => "end of stream",
            Self::Io => "host i/o failure",
        };

        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for VafsError {}

impl From<alloc::collections::TryReserveError> for VafsError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for VafsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NoSuchEntry,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            std::io::ErrorKind::UnexpectedEof => Self::EndOfStream,
            std::io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Io,
        }
    }
}
