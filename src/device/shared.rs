//! Read-side device sharing.
//!
//! A finished image is a single byte sequence, but its two block streams (descriptor and
//! data) need independent cursors over it. [`SharedDevice`] multiplexes one underlying
//! device between any number of readers: each clone keeps its own logical position and
//! re-seeks the inner device under a short-lived lock for every transfer, so no two
//! readers can observe each other's cursor movement.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Mutex;

use crate::errors::{CanFail, IOResult, VafsError};

use super::{DeviceSeek, StreamDevice};

/// A cloneable, read-only view over a single underlying [`StreamDevice`].
pub struct SharedDevice {
    inner: Arc<Mutex<Box<dyn StreamDevice>>>,
    position: u64,
    len: u64,
}

impl SharedDevice {
    /// Wraps `device` for shared read access. The device length is captured once; the
    /// image is immutable from this point on.
    pub fn new(mut device: Box<dyn StreamDevice>) -> IOResult<Self> {
        let len = device.seek(DeviceSeek::End(0))?;
        device.seek(DeviceSeek::Start(0))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(device)),
            position: 0,
            len,
        })
    }

    /// Returns a new view over the same device with its own cursor at position zero.
    pub fn fork(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            position: 0,
            len: self.len,
        }
    }

    /// Total length of the underlying device in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }
}

impl StreamDevice for SharedDevice {
    fn seek(&mut self, pos: DeviceSeek) -> IOResult<u64> {
        let target = match pos {
            DeviceSeek::Start(offset) => Some(offset),
            DeviceSeek::Current(delta) => self.position.checked_add_signed(delta),
            DeviceSeek::End(delta) => self.len.checked_add_signed(delta),
        };

        let target = target.ok_or(VafsError::InvalidArgument)?;

        if target > self.len {
            return Err(VafsError::InvalidArgument);
        }

        self.position = target;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> IOResult<usize> {
        let mut inner = self.inner.lock();

        inner.seek(DeviceSeek::Start(self.position))?;
        let read = inner.read(buf)?;
        drop(inner);

        self.position += read as u64;
        Ok(read)
    }

    fn write(&mut self, _buf: &[u8]) -> IOResult<usize> {
        Err(VafsError::PermissionDenied)
    }

    fn flush(&mut self) -> CanFail {
        Ok(())
    }
}
