use deku::prelude::*;

use crate::table::TableRecord;

/// 32 bit user and group IDs
#[derive(Debug, Copy, Clone, DekuRead, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Id {
    pub num: u32,
}

impl TableRecord for Id {
    const SIZE: usize = (u32::BITS / 8) as usize;
}
