//! Stream devices: uniform seek/read/write access to the bytes backing an image.
//!
//! A [`StreamDevice`] is the lowest layer of the engine. Everything above it (block
//! streams, descriptors, handles) only ever sees this contract, so an image can live in a
//! host file, an in-memory buffer, or any caller-supplied backend implementing the trait.
//!
//! Devices are single-cursor: `read` and `write` operate at the current position and
//! advance it. Serialization of multi-step sequences (seek then read, append runs) is the
//! responsibility of the owning block stream, which guards the device with a try-lock.

use alloc::boxed::Box;
use alloc::vec;

use crate::errors::{CanFail, IOResult, VafsError};

mod memory;
mod shared;

#[cfg(feature = "std")]
mod file;

#[cfg(feature = "std")]
pub use file::FileDevice;
pub use memory::MemoryDevice;
pub use shared::SharedDevice;

/// Size of the bounce buffer used by [`copy`].
const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Seek origin for [`StreamDevice::seek`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceSeek {
    /// Absolute offset from the start of the device.
    Start(u64),

    /// Signed offset from the current position.
    Current(i64),

    /// Signed offset from the end of the device.
    End(i64),
}

/// Abstraction over the persistent storage backing an image.
///
/// Implementations must uphold the following contract:
///
/// - `seek` returns the new absolute position. Seeking past the end of a read-only device
///   fails with [`VafsError::InvalidArgument`]; on a writable device the gap is filled
///   with zeroes by the next write.
/// - `read` may return fewer bytes than requested only when the end of the stream has
///   been reached. Zero means end-of-stream.
/// - `write` writes the whole buffer or fails. A read-only device fails with
///   [`VafsError::PermissionDenied`].
/// - `flush` pushes buffered bytes to the backing store. Durability of the host medium
///   itself is not implied.
pub trait StreamDevice: Send {
    /// Moves the device cursor and returns the new absolute position.
    fn seek(&mut self, pos: DeviceSeek) -> IOResult<u64>;

    /// Reads up to `buf.len()` bytes at the cursor, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> IOResult<usize>;

    /// Writes all of `buf` at the cursor, returning how many bytes were written.
    fn write(&mut self, buf: &[u8]) -> IOResult<usize>;

    /// Flushes buffered bytes to the backing store.
    fn flush(&mut self) -> CanFail;

    /// Fills `buf` entirely, failing with [`VafsError::EndOfStream`] if the device ends
    /// first.
    fn read_exact(&mut self, buf: &mut [u8]) -> CanFail {
        let mut filled = 0;

        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(VafsError::EndOfStream),
                n => filled += n,
            }
        }

        Ok(())
    }

    /// Writes `buf` entirely, failing with [`VafsError::Io`] on a partial write.
    fn write_all(&mut self, buf: &[u8]) -> CanFail {
        let mut written = 0;

        while written < buf.len() {
            match self.write(&buf[written..])? {
                0 => return Err(VafsError::Io),
                n => written += n,
            }
        }

        Ok(())
    }
}

impl StreamDevice for Box<dyn StreamDevice> {
    fn seek(&mut self, pos: DeviceSeek) -> IOResult<u64> {
        self.as_mut().seek(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> IOResult<usize> {
        self.as_mut().read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> IOResult<usize> {
        self.as_mut().write(buf)
    }

    fn flush(&mut self) -> CanFail {
        self.as_mut().flush()
    }
}

/// Transfers the full content of `src` into `dst` at its current position, using a
/// bounded bounce buffer.
///
/// `src` is rewound to its start first; `dst` is left positioned after the last byte
/// written.
///
/// # Errors
///
/// Propagates any read or write failure of the two devices.
pub fn copy(dst: &mut dyn StreamDevice, src: &mut dyn StreamDevice) -> CanFail {
    let mut bounce = vec![0u8; COPY_CHUNK_SIZE];

    src.seek(DeviceSeek::Start(0))?;

    loop {
        let read = src.read(&mut bounce)?;
        if read == 0 {
            return Ok(());
        }

        dst.write_all(&bounce[..read])?;
    }
}
