//! Depth-first traversal of a directory subtree

use tracing::trace;

use crate::archive::Archive;
use crate::error::SquashfsError;
use crate::file::{File, FileType};

/// Ancestor collision check interval, in stack frames
const RECURSION_CHECK_DEPTH: usize = 128;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TraversalState {
    /// Before the first [`TreeTraversal::next`]
    Init,
    /// Entered a directory; its entries come next
    DirectoryBegin,
    /// At a non-directory entry
    File,
    /// All entries of a directory have been visited
    DirectoryEnd,
}

struct Frame<'a> {
    file: File<'a>,
    iter: crate::dir::DirIterator<'a>,
    name: Vec<u8>,
}

/// Iterative depth-first walk over a subtree.
///
/// Uses an explicit stack of `(file, directory iterator)` frames instead of
/// recursion and checks for ancestor inode-ref collisions once the stack
/// grows past [`RECURSION_CHECK_DEPTH`] frames.
pub struct TreeTraversal<'a> {
    archive: &'a Archive<'a>,
    base: File<'a>,
    stack: Vec<Frame<'a>>,
    state: TraversalState,
    max_depth: usize,
    /// Holds the current file and name for `File` and `DirectoryEnd` states,
    /// where the file is not (or no longer) a stack frame
    current: Option<(File<'a>, Vec<u8>)>,
    finished: bool,
}

impl<'a> TreeTraversal<'a> {
    pub(crate) fn new(archive: &'a Archive<'a>, base: File<'a>) -> Self {
        Self {
            archive,
            base,
            stack: Vec::new(),
            state: TraversalState::Init,
            max_depth: usize::MAX,
            current: None,
            finished: false,
        }
    }

    /// Do not descend into directories more than `max_depth` frames deep;
    /// deeper directories are reported as plain entries.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    /// Advance to the next event. Returns `None` when the subtree has been
    /// fully visited; errors terminate the traversal.
    pub fn next(&mut self) -> Option<Result<TraversalState, SquashfsError>> {
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(Some(state)) => {
                self.state = state;
                Some(Ok(state))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }

    fn step(&mut self) -> Result<Option<TraversalState>, SquashfsError> {
        if self.state == TraversalState::Init {
            if !self.base.is_dir() {
                // a non-directory base is reported as a single entry
                self.current = Some((self.base.clone(), Vec::new()));
                return Ok(Some(TraversalState::File));
            }
            self.push_frame(self.base.clone(), Vec::new())?;
            return Ok(Some(TraversalState::DirectoryBegin));
        }

        self.current = None;
        let Some(frame) = self.stack.last_mut() else {
            return Ok(None);
        };
        let Some(entry) = frame.iter.next() else {
            // directory exhausted
            let done = match self.stack.pop() {
                Some(frame) => frame,
                None => return Ok(None),
            };
            self.current = Some((done.file, done.name));
            return Ok(Some(TraversalState::DirectoryEnd));
        };
        let entry = entry?;

        let child = match self.stack.last() {
            Some(frame) => frame.iter.open(&entry)?,
            None => return Err(SquashfsError::Corrupt),
        };
        trace!(name = %String::from_utf8_lossy(entry.name_bytes()), "visiting");

        if entry.file_type() == FileType::Directory && self.stack.len() < self.max_depth {
            self.push_frame(child, entry.name_bytes().to_vec())?;
            return Ok(Some(TraversalState::DirectoryBegin));
        }

        self.current = Some((child, entry.name_bytes().to_vec()));
        Ok(Some(TraversalState::File))
    }

    fn push_frame(&mut self, file: File<'a>, name: Vec<u8>) -> Result<(), SquashfsError> {
        let iter = file.dir_iterator()?;
        self.stack.push(Frame { file, iter, name });
        if self.stack.len() >= RECURSION_CHECK_DEPTH {
            self.check_recursion()?;
        }
        Ok(())
    }

    /// Verify that no ancestor frame shares the newest frame's inode ref
    fn check_recursion(&self) -> Result<(), SquashfsError> {
        let Some((top, ancestors)) = self.stack.split_last() else {
            return Ok(());
        };
        let inode_ref = top.file.inode_ref();
        if ancestors.iter().any(|frame| frame.file.inode_ref() == inode_ref) {
            return Err(SquashfsError::DirectoryRecursion);
        }
        Ok(())
    }

    pub fn state(&self) -> TraversalState {
        self.state
    }

    /// The file the last event was about
    pub fn current_file(&self) -> Option<&File<'a>> {
        match self.state {
            TraversalState::Init => None,
            TraversalState::DirectoryBegin => self.stack.last().map(|frame| &frame.file),
            TraversalState::File | TraversalState::DirectoryEnd => {
                self.current.as_ref().map(|(file, _)| file)
            }
        }
    }

    /// Name of the current entry; empty for the traversal base
    pub fn name(&self) -> &[u8] {
        match self.state {
            TraversalState::Init => &[],
            TraversalState::DirectoryBegin => {
                self.stack.last().map(|frame| frame.name.as_slice()).unwrap_or(&[])
            }
            TraversalState::File | TraversalState::DirectoryEnd => {
                self.current.as_ref().map(|(_, name)| name.as_slice()).unwrap_or(&[])
            }
        }
    }

    /// Number of directory frames currently entered
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Path segment at `index`, root-most first
    pub fn path_segment(&self, index: usize) -> Option<&[u8]> {
        self.segments().nth(index)
    }

    /// The current entry's path relative to the traversal base
    pub fn path(&self) -> String {
        let segments: Vec<String> =
            self.segments().map(|s| String::from_utf8_lossy(s).into_owned()).collect();
        segments.join("/")
    }

    fn segments(&self) -> impl Iterator<Item = &[u8]> {
        let leaf = match self.state {
            TraversalState::File | TraversalState::DirectoryEnd => {
                self.current.as_ref().map(|(_, name)| name.as_slice())
            }
            _ => None,
        };
        self.stack
            .iter()
            .map(|frame| frame.name.as_slice())
            .chain(leaf)
            .filter(|name| !name.is_empty())
    }

    /// The archive this traversal reads from
    pub fn archive(&self) -> &'a Archive<'a> {
        self.archive
    }
}
