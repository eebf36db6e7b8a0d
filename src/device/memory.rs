//! Memory-backed stream device.
//!
//! Two flavours share this type: a writable buffer that grows geometrically as bytes are
//! appended (used for the temporary descriptor and data streams while an image is being
//! assembled), and a fixed read-only buffer wrapping the bytes of a finished image.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errors::{CanFail, IOResult, VafsError};

use super::{DeviceSeek, StreamDevice};

enum MemoryBuffer {
    /// Growable owned buffer. `Vec::len` is the logical device length.
    Writable(Vec<u8>),

    /// Fixed snapshot of a finished image. Shared so several streams can read the same
    /// bytes through independent cursors.
    ReadOnly(Arc<Vec<u8>>),
}

/// A [`StreamDevice`] over a contiguous in-memory byte buffer.
pub struct MemoryDevice {
    buffer: MemoryBuffer,
    position: u64,
}

impl MemoryDevice {
    /// Creates an empty, growable, writable memory device.
    pub fn writable() -> Self {
        Self {
            buffer: MemoryBuffer::Writable(Vec::new()),
            position: 0,
        }
    }

    /// Wraps an owned buffer as a fixed read-only device.
    pub fn read_only(bytes: Vec<u8>) -> Self {
        Self {
            buffer: MemoryBuffer::ReadOnly(Arc::new(bytes)),
            position: 0,
        }
    }

    /// Returns a second read-only device over the same underlying bytes, with its own
    /// independent cursor. Fails on a writable device.
    pub fn share(&self) -> IOResult<Self> {
        match &self.buffer {
            MemoryBuffer::Writable(_) => Err(VafsError::InvalidArgument),
            MemoryBuffer::ReadOnly(bytes) => Ok(Self {
                buffer: MemoryBuffer::ReadOnly(bytes.clone()),
                position: 0,
            }),
        }
    }

    /// Consumes the device, returning the owned buffer. A shared read-only buffer is
    /// copied out if other references are still alive.
    pub fn into_inner(self) -> Vec<u8> {
        match self.buffer {
            MemoryBuffer::Writable(bytes) => bytes,
            MemoryBuffer::ReadOnly(bytes) => {
                Arc::try_unwrap(bytes).unwrap_or_else(|shared| (*shared).clone())
            }
        }
    }

    fn len(&self) -> u64 {
        let len = match &self.buffer {
            MemoryBuffer::Writable(bytes) => bytes.len(),
            MemoryBuffer::ReadOnly(bytes) => bytes.len(),
        };

        len as u64
    }

    fn contents(&self) -> &[u8] {
        match &self.buffer {
            MemoryBuffer::Writable(bytes) => bytes,
            MemoryBuffer::ReadOnly(bytes) => bytes,
        }
    }

    /// Grows the buffer so that `required` bytes are addressable, doubling the previous
    /// capacity until it fits. Newly exposed bytes are zeroed.
    fn grow_to(bytes: &mut Vec<u8>, required: usize) -> CanFail {
        if required <= bytes.len() {
            return Ok(());
        }

        if required > bytes.capacity() {
            let mut target = usize::max(bytes.capacity(), 64);
            while target < required {
                target = target.saturating_mul(2);
            }

            bytes.try_reserve(target - bytes.len())?;
        }

        bytes.resize(required, 0);
        Ok(())
    }
}

impl StreamDevice for MemoryDevice {
    fn seek(&mut self, pos: DeviceSeek) -> IOResult<u64> {
        let len = self.len();

        let target = match pos {
            DeviceSeek::Start(offset) => Some(offset),
            DeviceSeek::Current(delta) => self.position.checked_add_signed(delta),
            DeviceSeek::End(delta) => len.checked_add_signed(delta),
        };

        let target = target.ok_or(VafsError::InvalidArgument)?;

        // A fixed buffer has nothing past its end; only a growable device may park the
        // cursor there for a later write.
        if matches!(self.buffer, MemoryBuffer::ReadOnly(_)) && target > len {
            return Err(VafsError::InvalidArgument);
        }

        self.position = target;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> IOResult<usize> {
        let contents = self.contents();
        let start = usize::try_from(self.position).map_err(|_| VafsError::InvalidArgument)?;

        if start >= contents.len() {
            return Ok(0);
        }

        let count = usize::min(buf.len(), contents.len() - start);
        buf[..count].copy_from_slice(&contents[start..start + count]);
        self.position += count as u64;

        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> IOResult<usize> {
        let MemoryBuffer::Writable(bytes) = &mut self.buffer else {
            return Err(VafsError::PermissionDenied);
        };

        let start = usize::try_from(self.position).map_err(|_| VafsError::InvalidArgument)?;
        let end = start.checked_add(buf.len()).ok_or(VafsError::InvalidArgument)?;

        Self::grow_to(bytes, end)?;
        bytes[start..end].copy_from_slice(buf);
        self.position = end as u64;

        Ok(buf.len())
    }

    fn flush(&mut self) -> CanFail {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_append_and_read_back() {
        let mut dev = MemoryDevice::writable();
        dev.write_all(b"hello").unwrap();
        dev.write_all(b" world").unwrap();

        dev.seek(DeviceSeek::Start(0)).unwrap();
        let mut buf = [0u8; 11];
        dev.read_exact(&mut buf).unwrap();

        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn seek_then_write_zero_fills_the_gap() {
        let mut dev = MemoryDevice::writable();
        dev.seek(DeviceSeek::Start(4)).unwrap();
        dev.write_all(b"x").unwrap();

        assert_eq!(dev.into_inner(), [0, 0, 0, 0, b'x']);
    }

    #[test]
    fn read_only_rejects_writes_and_far_seeks() {
        let mut dev = MemoryDevice::read_only(alloc::vec![1, 2, 3]);

        assert_eq!(dev.write(b"nope"), Err(VafsError::PermissionDenied));
        assert_eq!(dev.seek(DeviceSeek::Start(4)), Err(VafsError::InvalidArgument));
        assert_eq!(dev.seek(DeviceSeek::End(0)).unwrap(), 3);
    }

    #[test]
    fn short_read_at_end_of_stream() {
        let mut dev = MemoryDevice::read_only(alloc::vec![9; 4]);
        dev.seek(DeviceSeek::Start(2)).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(dev.read(&mut buf).unwrap(), 2);
        assert_eq!(dev.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn shared_cursors_are_independent() {
        let base = MemoryDevice::read_only((0u8..32).collect());
        let mut a = base.share().unwrap();
        let mut b = base.share().unwrap();

        a.seek(DeviceSeek::Start(10)).unwrap();

        let mut one = [0u8; 1];
        b.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 0);

        a.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 10);
    }
}
