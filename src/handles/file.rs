//! File handles.

use spin::MutexGuard;

use crate::block::BlockStream;
use crate::descriptor::tree::LockedFile;
use crate::descriptor::Permissions;
use crate::errors::{IOResult, VafsError};
use crate::image::Vafs;

/// Seek origin for [`FileHandle::seek`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileSeek {
    /// Absolute offset from the start of the file.
    Start(u64),

    /// Signed offset from the current position.
    Current(i64),

    /// Signed offset from the end of the file.
    End(i64),
}

enum HandleState {
    Open,
    Reading,
    Writing,
}

/// A handle to a regular file inside an image.
///
/// On a finished image the handle reads; on an image under assembly a handle obtained
/// through [`DirectoryHandle::create_file`](super::DirectoryHandle::create_file) writes.
/// The first write latches the file's position in the data stream and keeps the stream
/// locked so the content lands contiguously; dropping the handle releases the lock.
pub struct FileHandle<'img> {
    image: &'img Vafs,
    node: LockedFile,
    position: u64,
    state: HandleState,
    write_allowed: bool,
    write_guard: Option<MutexGuard<'img, BlockStream>>,
}

impl<'img> FileHandle<'img> {
    /// Wraps an existing file node for reading.
    pub(crate) fn open(image: &'img Vafs, node: LockedFile) -> Self {
        Self {
            image,
            node,
            position: 0,
            state: HandleState::Open,
            write_allowed: false,
            write_guard: None,
        }
    }

    /// Wraps a freshly created file node for writing.
    pub(crate) fn create(image: &'img Vafs, node: LockedFile) -> Self {
        Self {
            image,
            node,
            position: 0,
            state: HandleState::Open,
            write_allowed: true,
            write_guard: None,
        }
    }

    /// Content length in bytes.
    pub fn length(&self) -> u64 {
        u64::from(self.node.read().length)
    }

    /// Permission bits of the file.
    pub fn permissions(&self) -> Permissions {
        self.node.read().permissions
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the read position, clamping to the file bounds. Only valid while reading.
    pub fn seek(&mut self, pos: FileSeek) -> IOResult<u64> {
        self.image.assert_readable()?;

        if matches!(self.state, HandleState::Writing) {
            return Err(VafsError::PermissionDenied);
        }

        let length = self.length();

        let target = match pos {
            FileSeek::Start(offset) => Some(offset),
            FileSeek::Current(delta) => self.position.checked_add_signed(delta),
            FileSeek::End(delta) => length.checked_add_signed(delta),
        };

        self.position = u64::min(target.ok_or(VafsError::InvalidArgument)?, length);
        Ok(self.position)
    }

    /// Reads up to `buf.len()` bytes at the current position, returning how many were
    /// read. Zero means end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> IOResult<usize> {
        self.image.assert_readable()?;

        if matches!(self.state, HandleState::Writing) {
            return Err(VafsError::PermissionDenied);
        }
        self.state = HandleState::Reading;

        let (data, length) = {
            let node = self.node.read();
            (node.data, u64::from(node.length))
        };

        let remaining = length.saturating_sub(self.position);
        let count = usize::min(buf.len(), usize::try_from(remaining).unwrap_or(usize::MAX));

        if count == 0 {
            return Ok(0);
        }

        let mut stream = self.image.lock_data()?;
        stream.seek_to(data, self.position)?;
        stream.read_bytes(&mut buf[..count])?;
        drop(stream);

        self.position += count as u64;
        Ok(count)
    }

    /// Appends `buf` to the file.
    ///
    /// Only valid on a handle created through
    /// [`DirectoryHandle::create_file`](super::DirectoryHandle::create_file) while the
    /// image is still being assembled. The first write acquires the data stream lock and
    /// records the file's starting position; the lock is held until the handle is
    /// dropped so concurrent writers fail with [`VafsError::WouldBlock`] instead of
    /// interleaving.
    pub fn write(&mut self, buf: &[u8]) -> IOResult<usize> {
        self.image.assert_writable()?;

        if !self.write_allowed || matches!(self.state, HandleState::Reading) {
            return Err(VafsError::PermissionDenied);
        }
        self.state = HandleState::Writing;

        if buf.is_empty() {
            return Ok(0);
        }

        if self.write_guard.is_none() {
            self.write_guard = Some(self.image.lock_data()?);
        }

        let added = u32::try_from(buf.len()).map_err(|_| VafsError::InvalidArgument)?;
        let stream = self.write_guard.as_mut().ok_or(VafsError::WouldBlock)?;

        let start = stream.position();
        stream.write_bytes(buf)?;

        {
            let mut node = self.node.write();

            if node.data.is_invalid() {
                node.data = start;
            }

            node.length = node
                .length
                .checked_add(added)
                .ok_or(VafsError::InvalidArgument)?;
        }

        self.image.note_bytes_written(buf.len() as u64);
        self.position += buf.len() as u64;

        Ok(buf.len())
    }
}
