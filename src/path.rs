//! Path resolution over the descriptor tree.
//!
//! Paths are `/`-separated; runs of separators collapse, and a leading `/` is ignored,
//! so `""`, `"/"` and `"//"` all denote the root directory. Symlinks restart the walk
//! from the root with the consumed prefix spliced against the link target, after
//! canonicalizing `.` and `..` segments. Resolution is bounded so a link cycle fails
//! instead of spinning.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::descriptor::tree::{ChildNode, LockedDirectory, LockedFile, LockedSymlink};
use crate::descriptor::{MAX_NAME_LENGTH, MAX_TARGET_LENGTH};
use crate::errors::{IOResult, VafsError};
use crate::image::Vafs;

/// Maximum number of symlink redirections a single walk may take.
pub const MAX_SYMLINK_REDIRECTS: usize = 40;

/// Directory type bits of a [`FileStat`] mode.
pub const MODE_DIRECTORY: u32 = 0o040000;

/// Regular-file type bits of a [`FileStat`] mode.
pub const MODE_REGULAR: u32 = 0o100000;

/// Symlink type bits of a [`FileStat`] mode.
pub const MODE_SYMLINK: u32 = 0o120000;

/// Mask isolating the type bits of a [`FileStat`] mode.
pub const MODE_TYPE_MASK: u32 = 0o170000;

/// Result of a path lookup: the entry's type and permission bits folded into a single
/// mode word, and its content size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileStat {
    /// `type_bits | permissions`.
    pub mode: u32,

    /// Content length for regular files, zero otherwise.
    pub size: u64,
}

/// Outcome of a tree walk.
pub(crate) enum ResolvedNode {
    Directory(LockedDirectory),
    File(LockedFile),
    Symlink(LockedSymlink),
}

/// Splits `path` into its components, collapsing separator runs and checking the
/// per-component and whole-path length bounds.
pub(crate) fn tokenize(path: &str) -> IOResult<Vec<String>> {
    if path.len() > MAX_TARGET_LENGTH {
        return Err(VafsError::NameTooLong);
    }

    let mut tokens = Vec::new();

    for token in path.split('/') {
        if token.is_empty() {
            continue;
        }

        if token.len() > MAX_NAME_LENGTH {
            return Err(VafsError::NameTooLong);
        }

        tokens.push(token.to_string());
    }

    Ok(tokens)
}

/// Removes `.` segments and applies `..` segments. A `..` at the root stays at the root.
fn canonicalize(tokens: Vec<String>) -> Vec<String> {
    let mut canonical: Vec<String> = Vec::new();

    for token in tokens {
        match token.as_str() {
            "." => (),
            ".." => {
                canonical.pop();
            }
            _ => canonical.push(token),
        }
    }

    canonical
}

/// Total byte length of a token list once rejoined with separators.
fn joined_length(tokens: &[String]) -> usize {
    tokens.iter().map(|t| t.len() + 1).sum()
}

/// Walks `path` from the root of `image`.
///
/// Symlinks found before the last component are always followed; a symlink in final
/// position is followed only when `follow_terminal` is set, and returned as-is
/// otherwise.
pub(crate) fn resolve(image: &Vafs, path: &str, follow_terminal: bool) -> IOResult<ResolvedNode> {
    let mut tokens = tokenize(path)?;
    let mut redirects = 0usize;

    'restart: loop {
        let mut current = image.root_directory();
        let mut consumed: Vec<String> = Vec::new();

        for position in 0..tokens.len() {
            let token = tokens[position].clone();
            let is_terminal = position + 1 == tokens.len();

            image.load_directory(&current)?;

            let child = current
                .read()
                .find_child(&token)
                .ok_or(VafsError::NoSuchEntry)?;

            match child {
                ChildNode::Directory(dir) => {
                    if is_terminal {
                        return Ok(ResolvedNode::Directory(dir));
                    }

                    consumed.push(token);
                    current = dir;
                }

                ChildNode::File(file) => {
                    if !is_terminal {
                        return Err(VafsError::NotADirectory);
                    }

                    return Ok(ResolvedNode::File(file));
                }

                ChildNode::Symlink(symlink) => {
                    if is_terminal && !follow_terminal {
                        return Ok(ResolvedNode::Symlink(symlink));
                    }

                    redirects += 1;
                    if redirects > MAX_SYMLINK_REDIRECTS {
                        return Err(VafsError::TooManyLinks);
                    }

                    let target = symlink.read().target.clone();
                    let mut spliced = if target.starts_with('/') {
                        // Absolute target: the consumed prefix is discarded.
                        Vec::new()
                    } else {
                        consumed
                    };

                    spliced.extend(tokenize(&target)?);
                    spliced.extend(tokens.drain(position + 1..));

                    let spliced = canonicalize(spliced);

                    if joined_length(&spliced) > MAX_TARGET_LENGTH {
                        return Err(VafsError::NameTooLong);
                    }

                    tokens = spliced;
                    continue 'restart;
                }
            }
        }

        // Ran out of components: the path denotes the current directory (the root for
        // an empty path).
        return Ok(ResolvedNode::Directory(current));
    }
}

/// Looks up `path` without following a terminal symlink and reports its mode and size.
pub(crate) fn stat(image: &Vafs, path: &str) -> IOResult<FileStat> {
    match resolve(image, path, false)? {
        ResolvedNode::Directory(dir) => {
            let dir = dir.read();
            Ok(FileStat {
                mode: MODE_DIRECTORY | dir.permissions.bits(),
                size: 0,
            })
        }

        ResolvedNode::File(file) => {
            let file = file.read();
            Ok(FileStat {
                mode: MODE_REGULAR | file.permissions.bits(),
                size: u64::from(file.length),
            })
        }

        ResolvedNode::Symlink(_) => Ok(FileStat {
            mode: MODE_SYMLINK | 0o777,
            size: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_collapses_separators() {
        assert_eq!(tokenize("").unwrap(), Vec::<String>::new());
        assert_eq!(tokenize("/").unwrap(), Vec::<String>::new());
        assert_eq!(tokenize("//a///b/").unwrap(), alloc::vec!["a", "b"]);
        assert_eq!(tokenize("a/b/c").unwrap(), alloc::vec!["a", "b", "c"]);
    }

    #[test]
    fn tokenizer_enforces_length_bounds() {
        let long_component = "c".repeat(MAX_NAME_LENGTH + 1);
        assert_eq!(tokenize(&long_component), Err(VafsError::NameTooLong));

        let ok_component = "c".repeat(MAX_NAME_LENGTH);
        assert!(tokenize(&ok_component).is_ok());

        let long_path = "a/".repeat(MAX_TARGET_LENGTH / 2 + 1);
        assert_eq!(tokenize(&long_path), Err(VafsError::NameTooLong));
    }

    #[test]
    fn canonicalize_applies_dot_segments() {
        let tokens: Vec<String> = ["a", "b", "..", "c", ".", "d"]
            .iter()
            .map(|t| t.to_string())
            .collect();

        assert_eq!(canonicalize(tokens), alloc::vec!["a", "c", "d"]);

        let above_root: Vec<String> = ["..", "..", "x"].iter().map(|t| t.to_string()).collect();
        assert_eq!(canonicalize(above_root), alloc::vec!["x"]);
    }
}
