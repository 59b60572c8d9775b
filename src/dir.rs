//! Storage of directories with references to inodes
//!
//! For each directory inode, the directory table stores a linear list of all
//! entries, with references back to the inodes that describe those entries.
//! The list is made of runs: a header followed by up to 256 entries sharing
//! the header's metablock start and base inode number.

use deku::prelude::*;
use tracing::trace;

use crate::archive::Archive;
use crate::error::SquashfsError;
use crate::file::{File, FileType};
use crate::inode::InodeId;
use crate::metadata::{MetablockReader, METADATA_MAXSIZE};

/// Number of bytes a directory's `file_size` over-reports; the on-disk count
/// includes virtual "." and ".." entries that are never stored.
const DIR_SIZE_BIAS: u64 = 3;

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct DirHeader {
    /// One less than the number of entries following the header.
    ///
    /// A header must be followed by AT MOST 256 entries. If there are more
    /// entries, a new header MUST be emitted.
    #[deku(assert = "*count < 256")]
    pub count: u32,
    /// The location of the metadata block in the inode table where the inodes
    /// are stored. This is relative to the inode table start from the super
    /// block.
    pub start: u32,
    /// An arbitrary inode number.
    /// The entries that follow store their inode number as a difference to this.
    pub inode_num: u32,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct DirEntryHeader {
    /// An offset into the uncompressed inode metadata block.
    pub offset: u16,
    /// The difference of this inode's number to the reference stored in the header.
    pub inode_offset: i16,
    /// The inode type. For extended inodes, the basic type is stored here instead.
    pub t: u16,
    /// One less than the size of the entry name.
    pub name_size: u16,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DirectoryIndex {
    /// This stores a byte offset from the first directory header to the
    /// current header, as if the uncompressed directory metadata blocks were
    /// laid out in memory consecutively.
    pub(crate) index: u32,
    /// Start offset of a directory table metadata block, relative to the
    /// directory table start.
    pub(crate) start: u32,
    #[deku(assert = "*name_size < 256")]
    pub(crate) name_size: u32,
    #[deku(count = "*name_size + 1")]
    pub(crate) name: Vec<u8>,
}

/// One directory entry, in on-disk order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: Vec<u8>,
    inode_ref: u64,
    inode_number: u32,
    file_type: FileType,
}

impl DirEntry {
    pub fn name_bytes(&self) -> &[u8] {
        &self.name
    }

    pub fn name(&self) -> Result<&str, SquashfsError> {
        Ok(std::str::from_utf8(&self.name)?)
    }

    /// Composite reference locating the entry's inode in the inode table
    pub fn inode_ref(&self) -> u64 {
        self.inode_ref
    }

    pub fn inode_number(&self) -> u32 {
        self.inode_number
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }
}

/// Iterates the entries of one directory in on-disk order (sorted by name)
pub struct DirIterator<'a> {
    archive: &'a Archive<'a>,
    reader: MetablockReader<'a>,
    /// Inode ref of the directory being listed, recorded into opened children
    parent_ref: u64,
    /// Prefix index from an extended directory inode, for [`Self::lookup`]
    index: Vec<DirectoryIndex>,
    block_offset: u16,
    /// Listing bytes not yet consumed
    remaining_size: u64,
    /// Entries left in the current header run
    run_entries: u32,
    run_start: u32,
    run_inode_num: u32,
    /// Size of the last produced view, the delta for the next advance
    step: usize,
    started: bool,
    finished: bool,
}

impl<'a> DirIterator<'a> {
    pub(crate) fn new(
        archive: &'a Archive<'a>,
        parent_ref: u64,
        start_block: u32,
        block_offset: u16,
        file_size: u64,
        index: Vec<DirectoryIndex>,
    ) -> Result<Self, SquashfsError> {
        let superblock = archive.superblock();
        let address = superblock
            .dir_table
            .checked_add(u64::from(start_block))
            .ok_or(SquashfsError::Corrupt)?;
        let mut reader = MetablockReader::new(archive, address, superblock.bytes_used)?;

        // an empty directory stores only the virtual "." and ".." sizes
        let remaining_size = if file_size < 4 { 0 } else { file_size - DIR_SIZE_BIAS };
        if remaining_size > 0 {
            reader.advance(u64::from(block_offset), 0)?;
        }

        Ok(Self {
            archive,
            reader,
            parent_ref,
            index,
            block_offset,
            remaining_size,
            run_entries: 0,
            run_start: 0,
            run_inode_num: 0,
            step: 0,
            started: false,
            finished: false,
        })
    }

    /// Open the inode behind `entry`, recording this directory as its parent
    pub fn open(&self, entry: &DirEntry) -> Result<File<'a>, SquashfsError> {
        let file = File::open_by_ref(self.archive, entry.inode_ref())?;
        file.set_parent_ref(self.parent_ref);
        Ok(file)
    }

    fn read_header(&mut self) -> Result<(), SquashfsError> {
        if self.remaining_size < 12 {
            return Err(SquashfsError::Corrupt);
        }
        self.reader.advance(self.step as u64, 12)?;
        let (_, header) = DirHeader::from_bytes((self.reader.data(), 0))?;
        self.step = 12;
        self.remaining_size -= 12;
        self.run_entries = header.count + 1;
        self.run_start = header.start;
        self.run_inode_num = header.inode_num;
        Ok(())
    }

    fn read_entry(&mut self) -> Result<DirEntry, SquashfsError> {
        if self.remaining_size < 8 {
            return Err(SquashfsError::Corrupt);
        }
        self.reader.advance(self.step as u64, 8)?;
        let (_, entry) = DirEntryHeader::from_bytes((self.reader.data(), 0))?;

        let name_len = entry.name_size as usize + 1;
        let entry_len = 8 + name_len;
        if self.remaining_size < entry_len as u64 {
            return Err(SquashfsError::Corrupt);
        }
        self.reader.advance(0, entry_len)?;
        let name = self.reader.data()[8..].to_vec();
        self.step = entry_len;
        self.remaining_size -= entry_len as u64;
        self.run_entries -= 1;

        let inode_number = i64::from(self.run_inode_num) + i64::from(entry.inode_offset);
        let inode_number = u32::try_from(inode_number).map_err(|_| SquashfsError::Corrupt)?;
        let file_type = inode_id_from_raw(entry.t)?;

        Ok(DirEntry {
            name,
            inode_ref: (u64::from(self.run_start) << 16) | u64::from(entry.offset),
            inode_number,
            file_type: FileType::from_inode_id(file_type),
        })
    }

    /// Find `name`, using the extended directory index to skip ahead when the
    /// inode carries one. Relies on entries being sorted by name.
    pub fn lookup(&mut self, name: &[u8]) -> Result<DirEntry, SquashfsError> {
        if !self.started && !self.index.is_empty() {
            self.skip_to_indexed_run(name)?;
        }
        for entry in self {
            let entry = entry?;
            match entry.name_bytes().cmp(name) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(entry),
                std::cmp::Ordering::Greater => return Err(SquashfsError::NoSuchEntry),
            }
        }
        Err(SquashfsError::NoSuchEntry)
    }

    fn skip_to_indexed_run(&mut self, name: &[u8]) -> Result<(), SquashfsError> {
        let mut chosen: Option<&DirectoryIndex> = None;
        for index in &self.index {
            if index.name.as_slice() <= name {
                chosen = Some(index);
            } else {
                break;
            }
        }
        let Some(index) = chosen else {
            return Ok(());
        };

        trace!(index.index, index.start, "skipping to indexed run");
        let superblock = self.archive.superblock();
        let address = superblock
            .dir_table
            .checked_add(u64::from(index.start))
            .ok_or(SquashfsError::Corrupt)?;
        let inner =
            (u64::from(self.block_offset) + u64::from(index.index)) % METADATA_MAXSIZE as u64;

        let mut reader = MetablockReader::new(self.archive, address, superblock.bytes_used)?;
        reader.advance(inner, 0)?;
        self.reader = reader;
        self.remaining_size = self
            .remaining_size
            .checked_sub(u64::from(index.index))
            .ok_or(SquashfsError::Corrupt)?;
        self.run_entries = 0;
        self.step = 0;
        Ok(())
    }
}

impl Iterator for DirIterator<'_> {
    type Item = Result<DirEntry, SquashfsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.started = true;

        if self.run_entries == 0 {
            if self.remaining_size == 0 {
                self.finished = true;
                return None;
            }
            if let Err(e) = self.read_header() {
                self.finished = true;
                return Some(Err(e));
            }
        }

        match self.read_entry() {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

fn inode_id_from_raw(t: u16) -> Result<InodeId, SquashfsError> {
    Ok(match t {
        1 => InodeId::BasicDirectory,
        2 => InodeId::BasicFile,
        3 => InodeId::BasicSymlink,
        4 => InodeId::BasicBlockDevice,
        5 => InodeId::BasicCharacterDevice,
        6 => InodeId::BasicNamedPipe,
        7 => InodeId::BasicSocket,
        8 => InodeId::ExtendedDirectory,
        9 => InodeId::ExtendedFile,
        10 => InodeId::ExtendedSymlink,
        11 => InodeId::ExtendedBlockDevice,
        12 => InodeId::ExtendedCharacterDevice,
        13 => InodeId::ExtendedNamedPipe,
        14 => InodeId::ExtendedSocket,
        _ => return Err(SquashfsError::Corrupt),
    })
}
