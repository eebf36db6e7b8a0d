//! Symlink handles.

use alloc::string::String;

use crate::descriptor::tree::LockedSymlink;
use crate::image::Vafs;

/// A handle to a symbolic link inside an image.
pub struct SymlinkHandle<'img> {
    _image: &'img Vafs,
    node: LockedSymlink,
}

impl<'img> SymlinkHandle<'img> {
    pub(crate) fn new(image: &'img Vafs, node: LockedSymlink) -> Self {
        Self {
            _image: image,
            node,
        }
    }

    /// Name of the link itself.
    pub fn name(&self) -> String {
        self.node.read().name.clone()
    }

    /// The raw target string the link was created with.
    pub fn target(&self) -> String {
        self.node.read().target.clone()
    }

    /// Copies the target into `buf`, truncating if it does not fit, and returns the
    /// number of bytes copied.
    pub fn copy_target(&self, buf: &mut [u8]) -> usize {
        let node = self.node.read();
        let bytes = node.target.as_bytes();
        let count = usize::min(bytes.len(), buf.len());

        buf[..count].copy_from_slice(&bytes[..count]);
        count
    }
}
