use deku::prelude::*;

use crate::table::TableRecord;

/// NFS export support: inode reference by inode number
#[derive(Debug, Copy, Clone, DekuRead, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Export {
    pub num: u64,
}

impl TableRecord for Export {
    const SIZE: usize = (u64::BITS / 8) as usize;
}
