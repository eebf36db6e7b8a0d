//! File-backed stream device, delegating to host file I/O.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::errors::{CanFail, IOResult, VafsError};

use super::{DeviceSeek, StreamDevice};

/// A [`StreamDevice`] over a host file.
pub struct FileDevice {
    file: File,
    writable: bool,
    /// Length at open time. Images are immutable once finished, so the bound stays valid
    /// for the lifetime of a read-only device.
    len: u64,
}

impl FileDevice {
    /// Creates (truncating) a file for a new image and opens it for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> IOResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            writable: true,
            len: 0,
        })
    }

    /// Opens an existing image file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> IOResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            file,
            writable: false,
            len,
        })
    }
}

impl StreamDevice for FileDevice {
    fn seek(&mut self, pos: DeviceSeek) -> IOResult<u64> {
        let target = match pos {
            DeviceSeek::Start(offset) => SeekFrom::Start(offset),
            DeviceSeek::Current(delta) => SeekFrom::Current(delta),
            DeviceSeek::End(delta) => SeekFrom::End(delta),
        };

        let new_pos = self.file.seek(target)?;

        if !self.writable && new_pos > self.len {
            // Rewind to a defined position before failing so the cursor is not left
            // dangling past the end.
            self.file.seek(SeekFrom::Start(self.len))?;
            return Err(VafsError::InvalidArgument);
        }

        if self.writable && new_pos > self.len {
            self.len = new_pos;
        }

        Ok(new_pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> IOResult<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> IOResult<usize> {
        if !self.writable {
            return Err(VafsError::PermissionDenied);
        }

        self.file.write_all(buf)?;
        let pos = self.file.stream_position()?;
        self.len = u64::max(self.len, pos);

        Ok(buf.len())
    }

    fn flush(&mut self) -> CanFail {
        Ok(self.file.flush()?)
    }
}
