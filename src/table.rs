//! Paged lookup tables
//!
//! The id, fragment, export and xattr-id tables share one layout: the
//! superblock points at an array of absolute addresses, one per 8KiB page of
//! the table's metablock-packed payload. A lookup computes the page from the
//! record index and reads the record out of that page's metablock chain.

use std::marker::PhantomData;

use deku::DekuContainerRead;
use tracing::trace;

use crate::archive::Archive;
use crate::error::SquashfsError;
use crate::mapper::MapReader;
use crate::metadata::{MetablockReader, METADATA_MAXSIZE};

/// Fixed-size record of a paged lookup table
pub(crate) trait TableRecord {
    const SIZE: usize;
}

pub(crate) struct Table<T> {
    /// Absolute address of each payload page's metablock chain
    pages: Vec<u64>,
    count: u64,
    _record: PhantomData<T>,
}

impl<T> Table<T>
where
    T: TableRecord + for<'a> DekuContainerRead<'a>,
{
    /// Read the page-address array stored at `start` for `count` records
    pub fn new(archive: &Archive<'_>, start: u64, count: u64) -> Result<Self, SquashfsError> {
        let payload_len = count.checked_mul(T::SIZE as u64).ok_or(SquashfsError::Corrupt)?;
        let page_count = payload_len.div_ceil(METADATA_MAXSIZE as u64);
        trace!(start, count, page_count, "loading lookup table");

        let list_len = usize::try_from(page_count * 8).map_err(|_| SquashfsError::Corrupt)?;
        let mut reader =
            MapReader::new(archive.mapper(), start, archive.superblock().bytes_used)?;
        reader.advance(0, list_len)?;

        let data = reader.data();
        let pages = data
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        Ok(Self { pages, count, _record: PhantomData })
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Record at `index`
    pub fn get(&self, archive: &Archive<'_>, index: u64) -> Result<T, SquashfsError> {
        if index >= self.count {
            return Err(SquashfsError::OutOfBounds);
        }
        let byte = index * T::SIZE as u64;
        let page = (byte / METADATA_MAXSIZE as u64) as usize;
        let offset = byte % METADATA_MAXSIZE as u64;

        let mut reader = MetablockReader::new(
            archive,
            self.pages[page],
            archive.superblock().bytes_used,
        )?;
        reader.advance(offset, T::SIZE)?;
        let (_, record) = T::from_bytes((reader.data(), 0))?;
        Ok(record)
    }
}
