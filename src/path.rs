//! Slash-separated path resolution

use std::collections::VecDeque;

use tracing::trace;

use crate::archive::Archive;
use crate::error::SquashfsError;
use crate::file::{File, FileType};

/// Resolve `path` starting at the directory `start`.
///
/// `.` and `..` are normalized while resolving; `..` never climbs past the
/// root. Symlinks in intermediate components are always followed; a symlink
/// in the final component is followed only when `follow` is set. Every
/// followed link counts against the archive's configured symlink depth.
pub(crate) fn resolve<'a>(
    archive: &'a Archive<'a>,
    start: &File<'a>,
    path: &str,
    follow: bool,
) -> Result<File<'a>, SquashfsError> {
    trace!(path, follow, "resolving");
    let root_ref = archive.superblock().root_inode;
    let max_symlinks = archive.config().max_symlink_depth;

    let mut stack: Vec<File<'a>> = if path.starts_with('/') {
        vec![archive.root()?]
    } else {
        vec![start.clone()]
    };
    let mut segments: VecDeque<String> =
        path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect();
    let mut symlinks = 0usize;

    while let Some(segment) = segments.pop_front() {
        if segment == "." {
            continue;
        }
        if segment == ".." {
            if stack.len() > 1 {
                stack.pop();
            } else if let Some(top) = stack.last_mut() {
                if top.inode_ref() != root_ref {
                    // the chain above the starting point is reconstructed
                    // through the recorded parent references
                    *top = File::open_by_ref(archive, top.parent_ref()?)?;
                }
            }
            continue;
        }

        let Some(dir) = stack.last() else {
            return Err(SquashfsError::Corrupt);
        };
        if !dir.is_dir() {
            return Err(SquashfsError::NotADirectory);
        }
        let mut iter = dir.dir_iterator()?;
        let entry = iter.lookup(segment.as_bytes())?;
        let child = iter.open(&entry)?;

        if child.file_type() == FileType::Symlink && (follow || !segments.is_empty()) {
            symlinks += 1;
            if symlinks > max_symlinks {
                return Err(SquashfsError::TooManySymlinks);
            }
            let target = child.symlink_target().ok_or(SquashfsError::Corrupt)?;
            let target = std::str::from_utf8(target)?;
            trace!(target, "following symlink");
            if target.starts_with('/') {
                stack.clear();
                stack.push(archive.root()?);
            }
            for piece in target.split('/').filter(|s| !s.is_empty()).rev() {
                segments.push_front(piece.to_string());
            }
            continue;
        }

        stack.push(child);
    }

    stack.pop().ok_or(SquashfsError::Corrupt)
}
