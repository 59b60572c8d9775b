//! Metadata blocks and the logical stream over them
//!
//! Metadata (inodes, directory listings, lookup tables, xattrs) is stored as
//! a chain of metablocks: a 2-byte header followed by up to 8KiB of body,
//! compressed unless the header's high bit is set. [`MetablockReader`]
//! presents such a chain as one contiguous byte stream; positions inside that
//! stream are the "inner" offsets used by inode references and directory
//! offsets.

use crate::archive::Archive;
use crate::cache::ExtractCache;
use crate::compressor::{CompressionAction, Compressor, DefaultCompressor};
use crate::error::SquashfsError;
use crate::mapper::MapReader;

pub const METADATA_MAXSIZE: usize = 0x2000;

const METADATA_UNCOMPRESSED: u16 = 1 << 15;

/// Check is_compressed bit within raw `len`
pub fn is_compressed(len: u16) -> bool {
    len & METADATA_UNCOMPRESSED == 0
}

/// Get actual length of `data` following `len` from unedited `len`
pub fn len(len: u16) -> u16 {
    len & !(METADATA_UNCOMPRESSED)
}

pub(crate) struct MetablockReader<'a> {
    map: MapReader<'a>,
    cache: &'a ExtractCache,
    compressor: Compressor,
    /// Decoded stream bytes, append-only; `offset` indexes into this
    scratch: Vec<u8>,
    offset: usize,
    size: usize,
}

impl<'a> MetablockReader<'a> {
    pub fn new(
        archive: &'a Archive<'a>,
        start_address: u64,
        upper_limit: u64,
    ) -> Result<Self, SquashfsError> {
        let map = MapReader::new(archive.mapper(), start_address, upper_limit)?;
        Ok(Self {
            map,
            cache: archive.metablock_cache(),
            compressor: archive.superblock().compressor,
            scratch: Vec::new(),
            offset: 0,
            size: 0,
        })
    }

    /// Move the view `delta` bytes forward and size it to `size` bytes,
    /// decoding further metablocks as needed.
    pub fn advance(&mut self, delta: u64, size: usize) -> Result<(), SquashfsError> {
        if self.advance_up_to(delta, size)? < size {
            return Err(SquashfsError::OutOfBounds);
        }
        Ok(())
    }

    /// Like [`Self::advance`], but clamps the view to the bytes the stream
    /// still has when the chain ends early. Returns the granted view size.
    pub fn advance_up_to(&mut self, delta: u64, size: usize) -> Result<usize, SquashfsError> {
        let delta = usize::try_from(delta).map_err(|_| SquashfsError::Corrupt)?;
        let new_offset = self.offset.checked_add(delta).ok_or(SquashfsError::Corrupt)?;
        let end = new_offset.checked_add(size).ok_or(SquashfsError::Corrupt)?;

        while self.scratch.len() < end {
            if !self.read_next_metablock()? {
                break;
            }
        }

        self.offset = new_offset;
        self.size = size.min(self.scratch.len().saturating_sub(new_offset));
        Ok(self.size)
    }

    /// The current view
    pub fn data(&self) -> &[u8] {
        if self.size == 0 {
            return &[];
        }
        &self.scratch[self.offset..self.offset + self.size]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Decode one more metablock into the scratch buffer. Returns `false`
    /// when the chain has reached its upper limit.
    fn read_next_metablock(&mut self) -> Result<bool, SquashfsError> {
        let step = self.map.size() as u64;
        match self.map.advance(step, 2) {
            Ok(()) => {}
            Err(SquashfsError::OutOfBounds) => return Ok(false),
            Err(e) => return Err(e),
        }
        let header = self.map.data();
        let header = u16::from_le_bytes([header[0], header[1]]);
        let body_len = len(header) as usize;
        if body_len == 0 || body_len > METADATA_MAXSIZE {
            return Err(SquashfsError::Corrupt);
        }
        self.map.advance(2, body_len)?;

        if is_compressed(header) {
            let cache = self.cache;
            let compressor = self.compressor;
            let address = self.map.address();
            let data = self.map.data();
            let block = cache.get(address, data.len(), || {
                let mut out = Vec::with_capacity(METADATA_MAXSIZE);
                DefaultCompressor.decompress(data, &mut out, compressor)?;
                if out.len() > METADATA_MAXSIZE {
                    return Err(SquashfsError::Corrupt);
                }
                Ok(out)
            })?;
            self.scratch.extend_from_slice(&block);
        } else {
            self.scratch.extend_from_slice(self.map.data());
        }
        Ok(true)
    }
}
