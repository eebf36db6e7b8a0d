//! Directory handles.

use alloc::string::String;

use crate::descriptor::tree::{self, ChildNode, LockedDirectory};
use crate::descriptor::Permissions;
use crate::errors::{CanFail, IOResult, VafsError};
use crate::image::Vafs;

use super::FileHandle;

/// Kind of a directory entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One enumerated directory entry.
///
/// Enumeration order is stable for a given image but otherwise unspecified; callers must
/// not rely on any particular ordering.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    pub permissions: Permissions,

    /// Content length for regular files, zero otherwise.
    pub size: u64,
}

/// A handle to a directory inside an image, doubling as an entry iterator.
pub struct DirectoryHandle<'img> {
    image: &'img Vafs,
    node: LockedDirectory,
    index: usize,
}

impl<'img> DirectoryHandle<'img> {
    pub(crate) fn new(image: &'img Vafs, node: LockedDirectory) -> Self {
        Self {
            image,
            node,
            index: 0,
        }
    }

    /// Permission bits of the directory.
    pub fn permissions(&self) -> Permissions {
        self.node.read().permissions
    }

    /// Returns the next entry and advances the iteration index, failing with
    /// [`VafsError::NoSuchEntry`] once the directory is exhausted.
    pub fn read_entry(&mut self) -> IOResult<DirectoryEntry> {
        self.image.assert_open()?;
        self.image.load_directory(&self.node)?;

        let child = self
            .node
            .read()
            .child_at(self.index)
            .ok_or(VafsError::NoSuchEntry)?;

        self.index += 1;
        Ok(describe(&child))
    }

    /// Restarts the iteration from the first entry.
    pub fn rewind(&mut self) {
        self.index = 0;
    }

    /// Opens the child directory `name`.
    pub fn open_directory(&self, name: &str) -> IOResult<DirectoryHandle<'img>> {
        match self.lookup(name)? {
            ChildNode::Directory(node) => Ok(DirectoryHandle::new(self.image, node)),
            _ => Err(VafsError::NotADirectory),
        }
    }

    /// Opens the child file `name` for reading.
    pub fn open_file(&self, name: &str) -> IOResult<FileHandle<'img>> {
        match self.lookup(name)? {
            ChildNode::File(node) => Ok(FileHandle::open(self.image, node)),
            ChildNode::Directory(_) => Err(VafsError::IsADirectory),
            ChildNode::Symlink(_) => Err(VafsError::InvalidArgument),
        }
    }

    /// Returns the target of the child symlink `name`.
    pub fn read_symlink(&self, name: &str) -> IOResult<String> {
        match self.lookup(name)? {
            ChildNode::Symlink(node) => Ok(node.read().target.clone()),
            _ => Err(VafsError::InvalidArgument),
        }
    }

    /// Creates an empty subdirectory. Only valid while the image is being assembled.
    pub fn create_directory(&self, name: &str, permissions: Permissions) -> IOResult<DirectoryHandle<'img>> {
        self.image.assert_writable()?;

        let node = tree::create_directory(&self.node, name, permissions)?;
        self.image.note_directory_created();

        Ok(DirectoryHandle::new(self.image, node))
    }

    /// Creates an empty file and returns a writable handle to it. Only valid while the
    /// image is being assembled.
    pub fn create_file(&self, name: &str, permissions: Permissions) -> IOResult<FileHandle<'img>> {
        self.image.assert_writable()?;

        let node = tree::create_file(&self.node, name, permissions)?;
        self.image.note_file_created();

        Ok(FileHandle::create(self.image, node))
    }

    /// Creates a symlink pointing at `target`. Only valid while the image is being
    /// assembled.
    pub fn create_symlink(&self, name: &str, target: &str) -> CanFail {
        self.image.assert_writable()?;

        tree::create_symlink(&self.node, name, target)?;
        self.image.note_symlink_created();

        Ok(())
    }

    fn lookup(&self, name: &str) -> IOResult<ChildNode> {
        self.image.assert_open()?;
        self.image.load_directory(&self.node)?;

        self.node
            .read()
            .find_child(name)
            .ok_or(VafsError::NoSuchEntry)
    }
}

impl Iterator for DirectoryHandle<'_> {
    type Item = IOResult<DirectoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_entry() {
            Ok(entry) => Some(Ok(entry)),
            Err(VafsError::NoSuchEntry) => None,
            Err(other) => Some(Err(other)),
        }
    }
}

fn describe(child: &ChildNode) -> DirectoryEntry {
    match child {
        ChildNode::File(node) => {
            let node = node.read();
            DirectoryEntry {
                name: node.name.clone(),
                kind: EntryKind::File,
                permissions: node.permissions,
                size: u64::from(node.length),
            }
        }

        ChildNode::Directory(node) => {
            let node = node.read();
            DirectoryEntry {
                name: node.name.clone(),
                kind: EntryKind::Directory,
                permissions: node.permissions,
                size: 0,
            }
        }

        ChildNode::Symlink(node) => {
            let node = node.read();
            DirectoryEntry {
                name: node.name.clone(),
                kind: EntryKind::Symlink,
                permissions: Permissions::new(0o777),
                size: 0,
            }
        }
    }
}
