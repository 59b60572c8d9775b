//! Data Fragment support

use deku::prelude::*;

use crate::data::DataSize;
use crate::table::TableRecord;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead)]
#[deku(endian = "little")]
pub struct Fragment {
    /// Absolute image address of the fragment block
    pub start: u64,
    pub size: DataSize,
    pub unused: u32,
}

impl TableRecord for Fragment {
    const SIZE: usize =
        core::mem::size_of::<u64>() + core::mem::size_of::<u32>() + core::mem::size_of::<u32>();
}
