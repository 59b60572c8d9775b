//! File Data
//!
//! File content is stored as a run of datablocks at `blocks_start`, described
//! by the inode's packed size-info words, optionally followed by a tail that
//! lives in a shared fragment block. [`FileContentIterator`] walks that run
//! chunk by chunk; [`FileReader`] layers exact random-access windows on top.

use std::sync::Arc;

use deku::prelude::*;
use tracing::trace;

use crate::archive::Archive;
use crate::compressor::{CompressionAction, Compressor, DefaultCompressor};
use crate::error::SquashfsError;
use crate::file::File;
use crate::mapper::MapReader;

// bitflag for data size field in inode for signifying that the data is uncompressed
const DATA_STORED_UNCOMPRESSED: u32 = 1 << 24;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DataSize(u32);

impl DataSize {
    #[inline]
    pub fn new(size: u32, uncompressed: bool) -> Self {
        let mut value: u32 = size;
        if value > DATA_STORED_UNCOMPRESSED {
            panic!("value is too big");
        }
        if uncompressed {
            value |= DATA_STORED_UNCOMPRESSED;
        }
        Self(value)
    }

    #[inline]
    pub fn new_compressed(size: u32) -> Self {
        Self::new(size, false)
    }

    #[inline]
    pub fn new_uncompressed(size: u32) -> Self {
        Self::new(size, true)
    }

    /// Sparse hole: nothing stored, logical content is zeroes
    #[inline]
    pub fn is_sparse(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn uncompressed(&self) -> bool {
        self.0 & DATA_STORED_UNCOMPRESSED != 0
    }

    /// Stored on-disk size
    #[inline]
    pub fn size(&self) -> u32 {
        self.0 & !DATA_STORED_UNCOMPRESSED
    }
}

enum Current {
    None,
    /// `n` bytes out of the archive's shared zero block
    Zero(usize),
    /// `n` bytes directly out of the current mapping
    Direct(usize),
    /// a decoded datablock
    Block(Arc<Vec<u8>>),
    /// a slice of a decoded fragment block
    Fragment { block: Arc<Vec<u8>>, start: usize, len: usize },
}

/// Walks a file's content: datablocks in order, then the fragment tail.
///
/// Sparse blocks are emitted from a shared zero buffer, compressed blocks are
/// decoded through the datablock cache, and adjacent uncompressed blocks are
/// coalesced into one chunk while they stay below the caller's desired size
/// and inside the current mapping.
pub struct FileContentIterator<'a> {
    archive: &'a Archive<'a>,
    file: &'a File<'a>,
    map: MapReader<'a>,
    compressor: Compressor,
    block_size: u64,
    file_size: u64,
    /// Next block to map
    block_index: usize,
    /// Zero bytes still owed from the current sparse run
    sparse_remaining: u64,
    /// Stored bytes consumed, relative to `blocks_start`
    disk_pos: u64,
    fragment_done: bool,
    finished: bool,
    current: Current,
}

impl<'a> FileContentIterator<'a> {
    pub(crate) fn new(file: &'a File<'a>) -> Result<Self, SquashfsError> {
        let archive = file.archive();
        let superblock = archive.superblock();
        if file.file_type() != crate::file::FileType::File {
            return Err(SquashfsError::NotAFile);
        }
        let map = MapReader::new(archive.mapper(), file.blocks_start(), superblock.bytes_used)?;
        Ok(Self {
            archive,
            file,
            map,
            compressor: superblock.compressor,
            block_size: superblock.block_size.into(),
            file_size: file.size(),
            block_index: 0,
            sparse_remaining: 0,
            disk_pos: 0,
            fragment_done: false,
            finished: false,
            current: Current::None,
        })
    }

    /// The next chunk, sized opportunistically towards `desired_size`.
    /// Returns `None` once the whole file has been emitted.
    pub fn next(&mut self, desired_size: usize) -> Result<Option<&[u8]>, SquashfsError> {
        self.current = Current::None;
        if self.finished {
            return Ok(None);
        }
        let desired_size = desired_size.max(1);

        if self.step(desired_size)? {
            Ok(Some(self.current_data()))
        } else {
            self.finished = true;
            Ok(None)
        }
    }

    /// Whether the current chunk is a sparse hole served from the zero block
    pub fn is_zero_block(&self) -> bool {
        matches!(self.current, Current::Zero(_))
    }

    /// The current chunk
    pub fn current_data(&self) -> &[u8] {
        match &self.current {
            Current::None => &[],
            Current::Zero(n) => &self.archive.zero_block()[..*n],
            Current::Direct(n) => &self.map.data()[..*n],
            Current::Block(block) => block,
            Current::Fragment { block, start, len } => &block[*start..*start + *len],
        }
    }

    pub fn current_len(&self) -> usize {
        match &self.current {
            Current::None => 0,
            Current::Zero(n) | Current::Direct(n) => *n,
            Current::Block(block) => block.len(),
            Current::Fragment { len, .. } => *len,
        }
    }

    /// Skip `offset` bytes forward from the start of the current chunk, then
    /// materialize a chunk. Whole blocks are skipped without mapping them.
    ///
    /// Returns the offset remaining within the returned chunk.
    pub fn skip(
        &mut self,
        offset: u64,
        desired_size: usize,
    ) -> Result<(u64, Option<&[u8]>), SquashfsError> {
        let mut offset = offset;
        let current_len = self.current_len() as u64;
        if offset < current_len {
            return Ok((offset, Some(self.current_data())));
        }
        offset -= current_len;
        self.current = Current::None;

        // zero bytes owed by the current sparse run never need mapping
        if self.sparse_remaining > 0 {
            let consumed = offset.min(self.sparse_remaining);
            self.sparse_remaining -= consumed;
            offset -= consumed;
        }

        if self.sparse_remaining == 0 {
            let blocks = self.file.block_sizes();
            while offset >= self.block_size && self.block_index < blocks.len() {
                let info = blocks[self.block_index];
                if u64::from(info.size()) > self.block_size {
                    return Err(SquashfsError::Corrupt);
                }
                self.disk_pos += u64::from(info.size());
                self.block_index += 1;
                offset -= self.block_size;
            }
        }

        let mut has_chunk = self.next(desired_size)?.is_some();
        while has_chunk {
            let len = self.current_len() as u64;
            if offset < len {
                break;
            }
            offset -= len;
            has_chunk = self.next(desired_size)?.is_some();
        }
        if has_chunk {
            Ok((offset, Some(self.current_data())))
        } else {
            Ok((offset, None))
        }
    }

    fn step(&mut self, desired_size: usize) -> Result<bool, SquashfsError> {
        if self.sparse_remaining > 0 {
            self.take_sparse();
            return Ok(true);
        }

        let blocks = self.file.block_sizes();
        if self.block_index < blocks.len() {
            let info = blocks[self.block_index];
            if u64::from(info.size()) > self.block_size {
                return Err(SquashfsError::Corrupt);
            }
            if info.is_sparse() {
                self.sparse_remaining = self.sparse_block_len();
                self.block_index += 1;
                self.take_sparse();
                return Ok(true);
            }
            if !info.uncompressed() {
                self.map_compressed(info)?;
                return Ok(true);
            }
            self.map_uncompressed(desired_size)?;
            return Ok(true);
        }

        if self.file.has_fragment() && !self.fragment_done {
            self.fragment_done = true;
            return self.map_fragment();
        }
        Ok(false)
    }

    /// Logical size of the sparse block at `block_index`: a full block, or the
    /// file's tail for the final block of a fragment-less file
    fn sparse_block_len(&self) -> u64 {
        let tail = self.file_size % self.block_size;
        let last = self.block_index + 1 == self.file.block_sizes().len();
        if last && !self.file.has_fragment() && tail != 0 {
            tail
        } else {
            self.block_size
        }
    }

    fn take_sparse(&mut self) {
        let chunk = self
            .sparse_remaining
            .min(self.archive.zero_block().len() as u64) as usize;
        self.sparse_remaining -= chunk as u64;
        self.current = Current::Zero(chunk);
    }

    fn map_compressed(&mut self, info: DataSize) -> Result<(), SquashfsError> {
        let stored = info.size() as usize;
        let delta = self.disk_pos - self.map.position();
        self.map.advance(delta, stored)?;
        self.disk_pos += stored as u64;

        let block_size = self.block_size as usize;
        let compressor = self.compressor;
        let address = self.map.address();
        let data = self.map.data();
        let block = self.archive.data_cache().get(address, stored, || {
            let mut out = Vec::with_capacity(block_size);
            DefaultCompressor.decompress(data, &mut out, compressor)?;
            if out.len() > block_size {
                return Err(SquashfsError::Corrupt);
            }
            Ok(out)
        })?;

        self.block_index += 1;
        self.current = Current::Block(block);
        Ok(())
    }

    fn map_uncompressed(&mut self, desired_size: usize) -> Result<(), SquashfsError> {
        let delta = self.disk_pos - self.map.position();
        self.map.advance(delta, 0)?;
        let remaining_direct = self.map.remaining_direct();

        let blocks = self.file.block_sizes();
        let mut outer = 0usize;
        while self.sparse_remaining == 0 && self.block_index < blocks.len() {
            let info = blocks[self.block_index];
            if info.is_sparse() || !info.uncompressed() {
                break;
            }
            if outer >= desired_size {
                break;
            }
            let stored = info.size() as usize;
            if stored as u64 > self.block_size {
                return Err(SquashfsError::Corrupt);
            }
            // a short stored block owes its trailing hole, except the last one
            if self.block_index + 1 != blocks.len() {
                self.sparse_remaining = self.block_size - stored as u64;
            }
            let new_outer = outer.checked_add(stored).ok_or(SquashfsError::Corrupt)?;
            // stop instead of crossing a mapping boundary, but always take at
            // least one block
            if new_outer > remaining_direct && outer > 0 {
                self.sparse_remaining = 0;
                break;
            }
            outer = new_outer;
            self.block_index += 1;
        }

        self.map.advance(0, outer)?;
        self.disk_pos += outer as u64;
        self.current = Current::Direct(outer);
        Ok(())
    }

    fn map_fragment(&mut self) -> Result<bool, SquashfsError> {
        let Some(frag_index) = self.file.fragment_index() else {
            return Ok(false);
        };
        let blocks_len = self.file.block_sizes().len() as u64;
        let tail = self.file_size - blocks_len * self.block_size;
        if tail == 0 {
            return Ok(false);
        }
        let tail = tail as usize;
        let offset = self.file.fragment_offset() as usize;

        let fragment = self.archive.fragment(frag_index.into())?;
        let stored = fragment.size.size() as usize;
        trace!(frag_index, start = fragment.start, stored, "mapping fragment");

        let mut map = MapReader::new(
            self.archive.mapper(),
            fragment.start,
            self.archive.superblock().bytes_used,
        )?;
        map.advance(0, stored)?;

        let block = if fragment.size.uncompressed() {
            Arc::new(map.data().to_vec())
        } else {
            let block_size = self.block_size as usize;
            let compressor = self.compressor;
            let data = map.data();
            self.archive.data_cache().get(map.address(), stored, || {
                let mut out = Vec::with_capacity(block_size);
                DefaultCompressor.decompress(data, &mut out, compressor)?;
                if out.len() > block_size {
                    return Err(SquashfsError::Corrupt);
                }
                Ok(out)
            })?
        };

        if offset + tail > block.len() {
            return Err(SquashfsError::Corrupt);
        }
        self.current = Current::Fragment { block, start: offset, len: tail };
        Ok(true)
    }
}

/// Buffered random-access reader over a [`FileContentIterator`].
///
/// Seeks are forward-only. A window that one chunk can satisfy is borrowed
/// straight from it; windows straddling chunks are assembled in a scratch
/// buffer.
pub struct FileReader<'a> {
    iter: FileContentIterator<'a>,
    file_size: u64,
    /// File offset where the iterator's current chunk starts
    chunk_pos: u64,
    chunk_len: u64,
    /// File offset of the current window's start
    window_pos: u64,
    /// Sequential position for the `io::Read` implementation
    read_pos: u64,
    scratch: Vec<u8>,
}

enum WindowSource {
    Direct(usize),
    Scratch,
}

impl<'a> FileReader<'a> {
    pub(crate) fn new(iter: FileContentIterator<'a>, file_size: u64) -> Self {
        Self {
            iter,
            file_size,
            chunk_pos: 0,
            chunk_len: 0,
            window_pos: 0,
            read_pos: 0,
            scratch: Vec::new(),
        }
    }

    /// Move the window `offset` bytes forward of its current start and expose
    /// exactly `size` bytes.
    pub fn advance(&mut self, offset: u64, size: usize) -> Result<&[u8], SquashfsError> {
        let target = self.window_pos.checked_add(offset).ok_or(SquashfsError::Corrupt)?;
        let end = target.checked_add(size as u64).ok_or(SquashfsError::Corrupt)?;
        if end > self.file_size {
            return Err(SquashfsError::OutOfBounds);
        }
        if target < self.chunk_pos {
            return Err(SquashfsError::OutOfBounds);
        }
        self.window_pos = target;
        if size == 0 {
            return Ok(&[]);
        }

        // land on the chunk containing `target`
        let (rem, has_chunk) = {
            let (rem, chunk) = self.iter.skip(target - self.chunk_pos, size)?;
            (rem, chunk.is_some())
        };
        if !has_chunk {
            return Err(SquashfsError::OutOfBounds);
        }
        self.chunk_len = self.iter.current_len() as u64;
        self.chunk_pos = target - rem;

        let source = if rem + size as u64 <= self.chunk_len {
            WindowSource::Direct(rem as usize)
        } else {
            self.fill_scratch(rem as usize, size)?;
            WindowSource::Scratch
        };
        match source {
            WindowSource::Direct(start) => Ok(&self.iter.current_data()[start..start + size]),
            WindowSource::Scratch => Ok(&self.scratch[..size]),
        }
    }

    /// Assemble `size` bytes starting `start` into the current chunk
    fn fill_scratch(&mut self, start: usize, size: usize) -> Result<(), SquashfsError> {
        self.scratch.clear();
        self.scratch.try_reserve(size)?;
        {
            let chunk = self.iter.current_data();
            let take = size.min(chunk.len() - start);
            self.scratch.extend_from_slice(&chunk[start..start + take]);
        }
        while self.scratch.len() < size {
            let has_chunk = self.iter.next(size - self.scratch.len())?.is_some();
            if !has_chunk {
                return Err(SquashfsError::OutOfBounds);
            }
            self.chunk_pos += self.chunk_len;
            self.chunk_len = self.iter.current_len() as u64;
            let need = size - self.scratch.len();
            let chunk = self.iter.current_data();
            let take = need.min(chunk.len());
            self.scratch.extend_from_slice(&chunk[..take]);
        }
        Ok(())
    }
}

impl std::io::Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.file_size - self.read_pos;
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        // interleaved advance() may have moved the window past the read
        // position; that would be a backward seek
        let Some(offset) = self.read_pos.checked_sub(self.window_pos) else {
            return Err(SquashfsError::OutOfBounds.into());
        };
        let window = self.advance(offset, n)?;
        buf[..n].copy_from_slice(window);
        self.read_pos += n as u64;
        Ok(n)
    }
}
