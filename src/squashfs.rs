//! Superblock parsing and validation

use deku::prelude::*;
use tracing::{error, trace};

use crate::compressor::Compressor;
use crate::error::SquashfsError;

/// 128KiB
pub const DEFAULT_BLOCK_SIZE: u32 = 0x20000;

/// 1MiB
pub const MAX_BLOCK_SIZE: u32 = 0x10_0000;

/// 4KiB
pub const MIN_BLOCK_SIZE: u32 = 0x1000;

/// "hsqs" on disk
pub const MAGIC: [u8; 4] = *b"hsqs";

/// Value of unpopulated optional table offsets
pub const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

const VERSION_MAJOR: u16 = 4;
const VERSION_MINOR: u16 = 0;

/// Contains important information about the archive, including the locations
/// of other sections
#[derive(Debug, Copy, Clone, DekuRead, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct SuperBlock {
    /// Must be set to 0x73717368 ("hsqs" on disk).
    pub magic: [u8; 4],
    /// The number of inodes stored in the archive.
    pub inode_count: u32,
    /// Last modification time of the archive. Count seconds since 00:00, Jan 1st 1970 UTC (not counting leap seconds).
    /// This is unsigned, so it expires in the year 2106 (as opposed to 2038).
    pub mod_time: u32,
    /// The size of a data block in bytes. Must be a power of two between 4096 (4k) and 1048576 (1 MiB).
    pub block_size: u32,
    /// The number of entries in the fragment table.
    pub frag_count: u32,
    /// Compressor used for data
    pub compressor: Compressor,
    /// The log2 of the block size. If the two fields do not agree, the archive is considered corrupted.
    pub block_log: u16,
    /// Bit wise OR of the flag bits
    pub flags: u16,
    /// The number of entries in the ID lookup table.
    pub id_count: u16,
    /// Major version of the format. Must be set to 4.
    pub version_major: u16,
    /// Minor version of the format. Must be set to 0.
    pub version_minor: u16,
    /// A reference to the inode of the root directory.
    pub root_inode: u64,
    /// The number of bytes used by the archive.
    /// Because SquashFS archives must be padded to a multiple of the underlying device block size, this can be less than the actual file size.
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

impl SuperBlock {
    /// Parse and validate the 96 superblock bytes against the source size
    pub(crate) fn parse(bytes: &[u8], source_size: u64) -> Result<Self, SquashfsError> {
        let (_, superblock) = SuperBlock::from_bytes((bytes, 0))?;
        trace!("{superblock:#08x?}");

        if superblock.magic != MAGIC {
            error!("invalid magic");
            return Err(SquashfsError::Corrupt);
        }

        if (superblock.version_major, superblock.version_minor) != (VERSION_MAJOR, VERSION_MINOR) {
            return Err(SquashfsError::UnsupportedVersion(
                superblock.version_major,
                superblock.version_minor,
            ));
        }

        let block_size = superblock.block_size;
        let power_of_two = block_size != 0 && (block_size & (block_size - 1)) == 0;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) || !power_of_two {
            error!("block_size({:#02x}) invalid", superblock.block_size);
            return Err(SquashfsError::Corrupt);
        }

        if block_size != 1u32.checked_shl(superblock.block_log.into()).unwrap_or(0) {
            error!("block_size != 1 << block_log");
            return Err(SquashfsError::Corrupt);
        }

        if superblock.bytes_used > source_size {
            error!("corrupted or invalid bytes_used");
            return Err(SquashfsError::Corrupt);
        }

        // check required fields
        if superblock.id_table > source_size {
            error!("corrupted or invalid id_table");
            return Err(SquashfsError::Corrupt);
        }
        if superblock.inode_table > source_size {
            error!("corrupted or invalid inode_table");
            return Err(SquashfsError::Corrupt);
        }
        if superblock.dir_table > source_size {
            error!("corrupted or invalid dir_table");
            return Err(SquashfsError::Corrupt);
        }

        // check optional fields
        if superblock.xattr_table != NOT_SET && superblock.xattr_table > source_size {
            error!("corrupted or invalid xattr_table");
            return Err(SquashfsError::Corrupt);
        }
        if superblock.frag_table != NOT_SET && superblock.frag_table > source_size {
            error!("corrupted or invalid frag_table");
            return Err(SquashfsError::Corrupt);
        }
        if superblock.export_table != NOT_SET && superblock.export_table > source_size {
            error!("corrupted or invalid export_table");
            return Err(SquashfsError::Corrupt);
        }

        Ok(superblock)
    }

    /// flag value
    pub fn inodes_uncompressed(&self) -> bool {
        self.flags & Flags::InodesStoredUncompressed as u16 != 0
    }

    /// flag value
    pub fn data_block_stored_uncompressed(&self) -> bool {
        self.flags & Flags::DataBlockStoredUncompressed as u16 != 0
    }

    /// flag value
    pub fn fragments_stored_uncompressed(&self) -> bool {
        self.flags & Flags::FragmentsStoredUncompressed as u16 != 0
    }

    /// flag value
    pub fn fragments_are_not_used(&self) -> bool {
        self.flags & Flags::FragmentsAreNotUsed as u16 != 0
    }

    /// flag value
    pub fn fragments_are_always_generated(&self) -> bool {
        self.flags & Flags::FragmentsAreAlwaysGenerated as u16 != 0
    }

    /// flag value
    pub fn data_has_been_deduplicated(&self) -> bool {
        self.flags & Flags::DataHasBeenDeduplicated as u16 != 0
    }

    /// flag value
    pub fn nfs_export_table_exists(&self) -> bool {
        self.flags & Flags::NFSExportTableExists as u16 != 0
    }

    /// flag value
    pub fn xattrs_are_stored_uncompressed(&self) -> bool {
        self.flags & Flags::XattrsAreStoredUncompressed as u16 != 0
    }

    /// flag value
    pub fn no_xattrs_in_archive(&self) -> bool {
        self.flags & Flags::NoXattrsInArchive as u16 != 0
    }

    /// flag value
    pub fn compressor_options_are_present(&self) -> bool {
        self.flags & Flags::CompressorOptionsArePresent as u16 != 0
    }
}

#[rustfmt::skip]
#[allow(dead_code)]
#[derive(Debug, Copy, Clone)]
pub enum Flags {
    InodesStoredUncompressed    = 0b0000_0000_0000_0001,
    DataBlockStoredUncompressed = 0b0000_0000_0000_0010,
    Unused                      = 0b0000_0000_0000_0100,
    FragmentsStoredUncompressed = 0b0000_0000_0000_1000,
    FragmentsAreNotUsed         = 0b0000_0000_0001_0000,
    FragmentsAreAlwaysGenerated = 0b0000_0000_0010_0000,
    DataHasBeenDeduplicated     = 0b0000_0000_0100_0000,
    NFSExportTableExists        = 0b0000_0000_1000_0000,
    XattrsAreStoredUncompressed = 0b0000_0001_0000_0000,
    NoXattrsInArchive           = 0b0000_0010_0000_0000,
    CompressorOptionsArePresent = 0b0000_0100_0000_0000,
}
