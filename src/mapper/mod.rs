//! Byte sources and the cursor used to read from them
//!
//! A [`Mapper`] presents an image as an addressable byte sequence, no matter
//! whether the bytes live in a local file, a caller-provided buffer or behind
//! an HTTP server with range-request support. The [`MapReader`] cursor turns a
//! mapper into contiguous forward-only views with strict bounds checking.

use std::borrow::Cow;

use crate::error::SquashfsError;

mod file;
#[cfg(feature = "http")]
mod http;
mod memory;

pub use file::FileMapper;
#[cfg(feature = "http")]
pub use http::HttpMapper;
pub use memory::SliceMapper;

/// A window of image bytes returned by [`Mapper::map`].
///
/// The window always covers at least the requested range, but a back-end is
/// free to return its natural window: the whole file for memory maps and
/// in-memory buffers, a block-aligned span for HTTP sources.
pub struct Mapping<'a> {
    /// Image address of the first byte of `data`
    start: u64,
    data: Cow<'a, [u8]>,
}

impl<'a> Mapping<'a> {
    pub fn new(start: u64, data: Cow<'a, [u8]>) -> Self {
        Self { start, data }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image address one past the last byte of this window
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

/// An addressable byte source backing an archive
pub trait Mapper: Send + Sync {
    /// Total number of addressable bytes
    fn size(&self) -> u64;

    /// Map `size` bytes starting at `address`.
    ///
    /// Fails with [`SquashfsError::OutOfBounds`] if the requested range ends
    /// past [`Mapper::size`].
    fn map(&self, address: u64, size: usize) -> Result<Mapping<'_>, SquashfsError>;
}

/// Adds a constant to every mapped address, so that archives embedded in a
/// larger file (firmware blobs, installers) can be read in place.
pub struct OffsetMapper<M: Mapper> {
    inner: M,
    offset: u64,
}

impl<M: Mapper> OffsetMapper<M> {
    pub fn new(inner: M, offset: u64) -> Result<Self, SquashfsError> {
        if offset > inner.size() {
            return Err(SquashfsError::OutOfBounds);
        }
        Ok(Self { inner, offset })
    }
}

impl<M: Mapper> Mapper for OffsetMapper<M> {
    fn size(&self) -> u64 {
        self.inner.size() - self.offset
    }

    fn map(&self, address: u64, size: usize) -> Result<Mapping<'_>, SquashfsError> {
        let address = address.checked_add(self.offset).ok_or(SquashfsError::Corrupt)?;
        let mut mapping = self.inner.map(address, size)?;
        mapping.start -= self.offset;
        Ok(mapping)
    }
}

/// Stateful forward cursor over a [`Mapper`], producing contiguous byte views.
///
/// The cursor is created over a `[start, upper_limit)` range of the image and
/// keeps one live [`Mapping`] that is replaced whenever a requested view falls
/// outside of it.
pub struct MapReader<'a> {
    mapper: &'a (dyn Mapper + 'a),
    /// Base image address of this cursor
    start: u64,
    /// Current position, relative to `start`
    offset: u64,
    /// Size of the current view
    size: usize,
    upper_limit: u64,
    mapping: Option<Mapping<'a>>,
}

impl<'a> MapReader<'a> {
    pub fn new(
        mapper: &'a (dyn Mapper + 'a),
        start: u64,
        upper_limit: u64,
    ) -> Result<Self, SquashfsError> {
        if start > upper_limit {
            return Err(SquashfsError::OutOfBounds);
        }
        Ok(Self { mapper, start, offset: 0, size: 0, upper_limit, mapping: None })
    }

    /// Move the view `delta` bytes forward of the current position and size it
    /// to `size` bytes.
    ///
    /// Overflowing offset arithmetic is [`SquashfsError::Corrupt`], running
    /// past `upper_limit` is [`SquashfsError::OutOfBounds`].
    pub fn advance(&mut self, delta: u64, size: usize) -> Result<(), SquashfsError> {
        let new_offset = self.offset.checked_add(delta).ok_or(SquashfsError::Corrupt)?;
        let end = self
            .start
            .checked_add(new_offset)
            .and_then(|v| v.checked_add(size as u64))
            .ok_or(SquashfsError::Corrupt)?;
        if end > self.upper_limit || end > self.mapper.size() {
            return Err(SquashfsError::OutOfBounds);
        }

        let address = self.start + new_offset;
        let covered = self
            .mapping
            .as_ref()
            .is_some_and(|m| address >= m.start() && end <= m.end());
        if !covered && size > 0 {
            self.mapping = Some(self.mapper.map(address, size)?);
        }
        self.offset = new_offset;
        self.size = size;
        Ok(())
    }

    /// The current view. Empty until the first sized [`Self::advance`].
    pub fn data(&self) -> &[u8] {
        if self.size == 0 {
            return &[];
        }
        let Some(mapping) = &self.mapping else {
            return &[];
        };
        let skip = (self.address() - mapping.start()) as usize;
        &mapping.data()[skip..skip + self.size]
    }

    /// Image address of the current position
    pub fn address(&self) -> u64 {
        self.start + self.offset
    }

    /// Current position, relative to the cursor base
    pub fn position(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes readable from the current position without a further mapping
    pub fn remaining_direct(&self) -> usize {
        let limit = match &self.mapping {
            Some(mapping) => mapping.end().min(self.upper_limit),
            None => self.upper_limit,
        };
        limit.saturating_sub(self.address()) as usize
    }
}
