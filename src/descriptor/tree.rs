//! In-memory directory tree.
//!
//! While an image is being assembled, every directory holds its children as owned nodes;
//! nothing touches the descriptor stream until finalization, when the tree is flushed
//! post-order so each directory knows its children's positions before emitting its own
//! body. On the read side the tree is rebuilt lazily: a directory starts out as a bare
//! position and pulls its child records off the descriptor stream on first use.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::block::{BlockStream, StreamPosition};
use crate::errors::{CanFail, IOResult, VafsError};

use super::{emit, emit_count, parse, parse_count, Descriptor, Permissions};

/// Shared handle to a directory node.
pub(crate) type LockedDirectory = Arc<RwLock<DirectoryNode>>;

/// Shared handle to a file node.
pub(crate) type LockedFile = Arc<RwLock<FileNode>>;

/// Shared handle to a symlink node.
pub(crate) type LockedSymlink = Arc<RwLock<SymlinkNode>>;

/// Name of the root directory.
pub(crate) const ROOT_NAME: &str = "root";

/// A regular file in the tree.
pub(crate) struct FileNode {
    pub(crate) name: String,
    pub(crate) permissions: Permissions,

    /// First content byte in the data stream; [`StreamPosition::INVALID`] until the
    /// first write, and forever for empty files.
    pub(crate) data: StreamPosition,

    pub(crate) length: u32,
}

/// A symbolic link in the tree.
pub(crate) struct SymlinkNode {
    pub(crate) name: String,
    pub(crate) target: String,
}

/// One child of a directory, tagged by kind.
#[derive(Clone)]
pub(crate) enum ChildNode {
    File(LockedFile),
    Directory(LockedDirectory),
    Symlink(LockedSymlink),
}

impl ChildNode {
    pub(crate) fn name(&self) -> String {
        match self {
            Self::File(node) => node.read().name.clone(),
            Self::Directory(node) => node.read().name.clone(),
            Self::Symlink(node) => node.read().name.clone(),
        }
    }
}

/// Load state of a directory opened from a finished image.
enum DirectoryState {
    /// Position known, children not read yet.
    Open,

    /// Children attached.
    Loaded,
}

/// A directory in the tree.
pub(crate) struct DirectoryNode {
    pub(crate) name: String,
    pub(crate) permissions: Permissions,

    /// Position of this directory's body in the descriptor stream. Assigned during the
    /// finalization flush on the write side; read off the parent record on the read
    /// side.
    pub(crate) descriptors: StreamPosition,

    state: DirectoryState,
    children: Vec<ChildNode>,
}

impl DirectoryNode {
    /// Creates the writable root of a new image.
    pub(crate) fn new_root(permissions: Permissions) -> LockedDirectory {
        Arc::new(RwLock::new(Self {
            name: String::from(ROOT_NAME),
            permissions,
            descriptors: StreamPosition::INVALID,
            state: DirectoryState::Loaded,
            children: Vec::new(),
        }))
    }

    /// Creates a directory reader over a finished image, positioned but not yet loaded.
    pub(crate) fn open_at(name: String, permissions: Permissions, descriptors: StreamPosition) -> LockedDirectory {
        Arc::new(RwLock::new(Self {
            name,
            permissions,
            descriptors,
            state: DirectoryState::Open,
            children: Vec::new(),
        }))
    }

    /// Creates an empty writable directory.
    fn new_writable(name: String, permissions: Permissions) -> LockedDirectory {
        Arc::new(RwLock::new(Self {
            name,
            permissions,
            descriptors: StreamPosition::INVALID,
            state: DirectoryState::Loaded,
            children: Vec::new(),
        }))
    }

    pub(crate) fn is_loaded(&self) -> bool {
        matches!(self.state, DirectoryState::Loaded)
    }

    pub(crate) fn child_count(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn child_at(&self, index: usize) -> Option<ChildNode> {
        self.children.get(index).cloned()
    }

    pub(crate) fn find_child(&self, name: &str) -> Option<ChildNode> {
        self.children
            .iter()
            .find(|child| child.name() == name)
            .cloned()
    }

    fn insert(&mut self, child: ChildNode) -> CanFail {
        let name = child.name();

        if self.find_child(&name).is_some() {
            return Err(VafsError::AlreadyExists);
        }

        self.children.push(child);
        Ok(())
    }
}

/// Attaches a new empty directory named `name` under `parent`.
pub(crate) fn create_directory(
    parent: &LockedDirectory,
    name: &str,
    permissions: Permissions,
) -> IOResult<LockedDirectory> {
    super::validate_name(name)?;

    let node = DirectoryNode::new_writable(String::from(name), permissions);
    parent.write().insert(ChildNode::Directory(node.clone()))?;

    Ok(node)
}

/// Attaches a new empty file named `name` under `parent`.
pub(crate) fn create_file(
    parent: &LockedDirectory,
    name: &str,
    permissions: Permissions,
) -> IOResult<LockedFile> {
    super::validate_name(name)?;

    let node = Arc::new(RwLock::new(FileNode {
        name: String::from(name),
        permissions,
        data: StreamPosition::INVALID,
        length: 0,
    }));
    parent.write().insert(ChildNode::File(node.clone()))?;

    Ok(node)
}

/// Attaches a new symlink named `name` pointing at `target` under `parent`.
pub(crate) fn create_symlink(
    parent: &LockedDirectory,
    name: &str,
    target: &str,
) -> IOResult<LockedSymlink> {
    super::validate_name(name)?;
    super::validate_target(target)?;

    let node = Arc::new(RwLock::new(SymlinkNode {
        name: String::from(name),
        target: String::from(target),
    }));
    parent.write().insert(ChildNode::Symlink(node.clone()))?;

    Ok(node)
}

/// Flushes `directory` and everything below it into the descriptor stream.
///
/// Child directories are flushed first so their body positions are known by the time the
/// parent emits their records; the directory's own position is recorded just before its
/// body goes out. The root is therefore the last body in the stream.
pub(crate) fn flush_directory(directory: &LockedDirectory, stream: &mut BlockStream) -> CanFail {
    let children: Vec<ChildNode> = {
        let node = directory.read();
        node.children.clone()
    };

    for child in &children {
        if let ChildNode::Directory(subdir) = child {
            flush_directory(subdir, stream)?;
        }
    }

    let mut node = directory.write();
    node.descriptors = stream.position();

    emit_count(stream, children.len() as u32)?;

    for child in &children {
        let descriptor = match child {
            ChildNode::File(file) => {
                let file = file.read();
                Descriptor::File {
                    name: file.name.clone(),
                    data: file.data,
                    length: file.length,
                    permissions: file.permissions,
                }
            }
            ChildNode::Directory(subdir) => {
                let subdir = subdir.read();
                Descriptor::Directory {
                    name: subdir.name.clone(),
                    descriptors: subdir.descriptors,
                    permissions: subdir.permissions,
                }
            }
            ChildNode::Symlink(symlink) => {
                let symlink = symlink.read();
                Descriptor::Symlink {
                    name: symlink.name.clone(),
                    target: symlink.target.clone(),
                }
            }
        };

        emit(stream, &descriptor)?;
    }

    Ok(())
}

/// Brings a lazily opened directory into the `Loaded` state by reading its body off the
/// descriptor stream. A no-op for directories that are already loaded.
pub(crate) fn load_directory(directory: &LockedDirectory, stream: &mut BlockStream) -> CanFail {
    if directory.read().is_loaded() {
        return Ok(());
    }

    let mut node = directory.write();

    // Lost the race against another loader between the two locks.
    if node.is_loaded() {
        return Ok(());
    }

    stream.seek_to(node.descriptors, 0)?;
    let count = parse_count(stream)?;

    let mut children = Vec::new();
    children.try_reserve_exact(count as usize)?;

    for _ in 0..count {
        let child = match parse(stream)? {
            Descriptor::File {
                name,
                data,
                length,
                permissions,
            } => ChildNode::File(Arc::new(RwLock::new(FileNode {
                name,
                permissions,
                data,
                length,
            }))),

            Descriptor::Directory {
                name,
                descriptors,
                permissions,
            } => ChildNode::Directory(DirectoryNode::open_at(name, permissions, descriptors)),

            Descriptor::Symlink { name, target } => {
                ChildNode::Symlink(Arc::new(RwLock::new(SymlinkNode { name, target })))
            }
        };

        children.push(child);
    }

    node.children = children;
    node.state = DirectoryState::Loaded;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::block::testing::round_trip_stream;

    #[test]
    fn duplicate_names_are_rejected() {
        let root = DirectoryNode::new_root(Permissions::new(0o777));

        create_file(&root, "entry", Permissions::new(0o644)).unwrap();

        assert_eq!(
            create_directory(&root, "entry", Permissions::new(0o755)).err(),
            Some(VafsError::AlreadyExists)
        );
        assert_eq!(
            create_symlink(&root, "entry", "elsewhere").err(),
            Some(VafsError::AlreadyExists)
        );
    }

    #[test]
    fn flush_then_lazy_load_rebuilds_the_tree() {
        let root = DirectoryNode::new_root(Permissions::new(0o777));

        let sub = create_directory(&root, "sub", Permissions::new(0o750)).unwrap();
        create_file(&sub, "inner", Permissions::new(0o600)).unwrap();
        create_file(&root, "top", Permissions::new(0o644)).unwrap();
        create_symlink(&root, "link", "sub/inner").unwrap();

        let mut stream = round_trip_stream(|out| flush_directory(&root, out));

        // The root body is emitted last; its position is where the reader starts.
        let reader = DirectoryNode::open_at(
            String::from(ROOT_NAME),
            Permissions::new(0o755),
            root.read().descriptors,
        );

        assert!(!reader.read().is_loaded());
        load_directory(&reader, &mut stream).unwrap();
        assert!(reader.read().is_loaded());
        assert_eq!(reader.read().child_count(), 3);

        let sub_child = reader.read().find_child("sub").unwrap();
        let ChildNode::Directory(sub_reader) = sub_child else {
            panic!("sub should reload as a directory");
        };

        load_directory(&sub_reader, &mut stream).unwrap();
        let inner = sub_reader.read().find_child("inner").unwrap();
        let ChildNode::File(inner) = inner else {
            panic!("inner should reload as a file");
        };

        assert_eq!(inner.read().permissions, Permissions::new(0o600));
        assert_eq!(inner.read().length, 0);

        let ChildNode::Symlink(link) = reader.read().find_child("link").unwrap() else {
            panic!("link should reload as a symlink");
        };
        assert_eq!(link.read().target, "sub/inner");
    }

    #[test]
    fn empty_directory_flushes_a_zero_count() {
        let root = DirectoryNode::new_root(Permissions::new(0o777));
        let mut stream = round_trip_stream(|out| flush_directory(&root, out));

        let reader = DirectoryNode::open_at(
            String::from(ROOT_NAME),
            Permissions::new(0o755),
            root.read().descriptors,
        );

        load_directory(&reader, &mut stream).unwrap();
        assert_eq!(reader.read().child_count(), 0);
    }
}
