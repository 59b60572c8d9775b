//! Caller-provided in-memory sources

use std::borrow::Cow;

use crate::error::SquashfsError;
use crate::mapper::{Mapper, Mapping};

/// Maps an image that is already materialized in memory
pub struct SliceMapper<'b> {
    data: &'b [u8],
}

impl<'b> SliceMapper<'b> {
    pub fn new(data: &'b [u8]) -> Self {
        Self { data }
    }

    /// Present only the first `size` bytes of `data` as the image
    pub fn with_size(data: &'b [u8], size: u64) -> Result<Self, SquashfsError> {
        let size = usize::try_from(size).map_err(|_| SquashfsError::OutOfBounds)?;
        let data = data.get(..size).ok_or(SquashfsError::OutOfBounds)?;
        Ok(Self { data })
    }
}

impl Mapper for SliceMapper<'_> {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn map(&self, address: u64, size: usize) -> Result<Mapping<'_>, SquashfsError> {
        let start = usize::try_from(address).map_err(|_| SquashfsError::OutOfBounds)?;
        let end = start.checked_add(size).ok_or(SquashfsError::Corrupt)?;
        if end > self.data.len() {
            return Err(SquashfsError::OutOfBounds);
        }
        // the natural window is everything from `address` to the end
        Ok(Mapping::new(address, Cow::Borrowed(&self.data[start..])))
    }
}
