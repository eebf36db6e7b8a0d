//! Typed handles into an image.
//!
//! Handles are thin views: they borrow the image and share its nodes, so they stay valid
//! exactly as long as the image itself. Opening a handle performs no I/O; directory
//! children and file bytes are pulled in on first use, under the owning stream's lock.

mod dir;
mod file;
mod symlink;

pub use dir::{DirectoryEntry, DirectoryHandle, EntryKind};
pub use file::{FileHandle, FileSeek};
pub use symlink::SymlinkHandle;
