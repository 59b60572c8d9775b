//! Extended attributes
//!
//! The xattr table has three layers: a super-header locating the key/value
//! region and the id count, a paged lookup table of per-inode records, and
//! the key/value region itself, a metablock chain. Values may be stored
//! out-of-line and referenced by an 8-byte ref ("indirect" values).

use deku::prelude::*;
use tracing::trace;

use crate::archive::Archive;
use crate::error::SquashfsError;
use crate::mapper::MapReader;
use crate::metadata::MetablockReader;
use crate::squashfs::NOT_SET;
use crate::table::{Table, TableRecord};

/// Bit in the key type marking an out-of-line value
const XATTR_VALUE_INDIRECT: u16 = 0x0100;

const PREFIX_USER: u16 = 0;
const PREFIX_TRUSTED: u16 = 1;
const PREFIX_SECURITY: u16 = 2;

/// Per-inode record of the xattr lookup table
#[derive(Debug, Copy, Clone, DekuRead, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrId {
    /// Composite reference into the key/value region
    pub xattr_ref: u64,
    /// Number of entries
    pub count: u32,
    /// Size of the entry listing in bytes
    pub size: u32,
}

impl TableRecord for XattrId {
    const SIZE: usize = 16;
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
struct XattrTableHeader {
    /// Absolute address of the key/value region
    table_start: u64,
    /// Number of entries in the lookup table
    xattr_ids: u32,
    unused: u32,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
struct XattrKeyHeader {
    t: u16,
    name_size: u16,
}

/// The archive's xattr table: lookup records plus the key/value region start
pub(crate) struct XattrTable {
    table: Table<XattrId>,
    /// Absolute address the composite refs are relative to
    start: u64,
}

impl XattrTable {
    pub fn new(archive: &Archive<'_>) -> Result<Self, SquashfsError> {
        let superblock = archive.superblock();
        if superblock.xattr_table == NOT_SET || superblock.no_xattrs_in_archive() {
            return Err(SquashfsError::NoXattr);
        }

        let mut reader =
            MapReader::new(archive.mapper(), superblock.xattr_table, superblock.bytes_used)?;
        reader.advance(0, 16)?;
        let (_, header) = XattrTableHeader::from_bytes((reader.data(), 0))?;
        trace!(?header, "xattr table");

        let pages = superblock.xattr_table.checked_add(16).ok_or(SquashfsError::Corrupt)?;
        let table = Table::new(archive, pages, header.xattr_ids.into())?;
        Ok(Self { table, start: header.table_start })
    }

    pub fn get(&self, archive: &Archive<'_>, index: u64) -> Result<XattrId, SquashfsError> {
        self.table.get(archive, index)
    }
}

/// One extended attribute, with the indirect value already resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrEntry {
    t: u16,
    name: Vec<u8>,
    value: Vec<u8>,
}

impl XattrEntry {
    /// Key type with the indirect bit masked off
    pub fn type_id(&self) -> u16 {
        self.t & !XATTR_VALUE_INDIRECT
    }

    /// Namespace prefix including the trailing dot, `None` for unknown types
    pub fn prefix(&self) -> Option<&'static str> {
        match self.type_id() {
            PREFIX_USER => Some("user."),
            PREFIX_TRUSTED => Some("trusted."),
            PREFIX_SECURITY => Some("security."),
            _ => None,
        }
    }

    /// Key name without the namespace prefix
    pub fn name_bytes(&self) -> &[u8] {
        &self.name
    }

    pub fn name(&self) -> Result<&str, SquashfsError> {
        Ok(std::str::from_utf8(&self.name)?)
    }

    /// `prefix` + `name`
    pub fn fullname(&self) -> Vec<u8> {
        let prefix = self.prefix().unwrap_or("");
        let mut fullname = Vec::with_capacity(prefix.len() + self.name.len());
        fullname.extend_from_slice(prefix.as_bytes());
        fullname.extend_from_slice(&self.name);
        fullname
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn value_size(&self) -> usize {
        self.value.len()
    }
}

fn prefix_len(type_id: u16) -> u64 {
    match type_id {
        PREFIX_USER => 5,
        PREFIX_TRUSTED => 8,
        PREFIX_SECURITY => 9,
        _ => 0,
    }
}

/// Walks the extended attributes of one inode in on-disk order
pub struct XattrIterator<'a> {
    archive: &'a Archive<'a>,
    reader: Option<MetablockReader<'a>>,
    /// Start of the key/value region, base for indirect refs
    region_start: u64,
    remaining_entries: u32,
    remaining_size: u64,
    /// Size of the last produced view, the delta for the next advance
    step: usize,
    finished: bool,
}

impl<'a> XattrIterator<'a> {
    pub(crate) fn new(
        archive: &'a Archive<'a>,
        xattr_index: Option<u32>,
    ) -> Result<Self, SquashfsError> {
        let empty = Self {
            archive,
            reader: None,
            region_start: 0,
            remaining_entries: 0,
            remaining_size: 0,
            step: 0,
            finished: true,
        };

        let Some(index) = xattr_index else {
            return Ok(empty);
        };
        let table = match archive.xattr_table() {
            Ok(table) => table,
            Err(SquashfsError::NoXattr) => return Ok(empty),
            Err(e) => return Err(e),
        };

        let record = table.get(archive, index.into())?;
        let outer = record.xattr_ref >> 16;
        let inner = record.xattr_ref & 0xffff;
        let start = table.start.checked_add(outer).ok_or(SquashfsError::Corrupt)?;

        let superblock = archive.superblock();
        let mut reader = MetablockReader::new(archive, start, superblock.bytes_used)?;
        reader.advance(inner, 0)?;

        Ok(Self {
            archive,
            reader: Some(reader),
            region_start: table.start,
            remaining_entries: record.count,
            remaining_size: record.size.into(),
            step: 0,
            finished: false,
        })
    }

    fn read_entry(&mut self) -> Result<XattrEntry, SquashfsError> {
        enum PendingValue {
            Inline(Vec<u8>),
            Indirect(u64),
        }

        let (key, name, pending) = {
            let reader = self.reader.as_mut().ok_or(SquashfsError::Corrupt)?;

            // key header, then name
            reader.advance(self.step as u64, 4)?;
            let (_, key) = XattrKeyHeader::from_bytes((reader.data(), 0))?;
            let name_size = key.name_size as usize;
            reader.advance(0, 4 + name_size)?;
            let name = reader.data()[4..].to_vec();

            // value header
            let value_offset = 4 + name_size;
            reader.advance(0, value_offset + 4)?;
            let data = reader.data();
            let stored_size = u32::from_le_bytes([
                data[value_offset],
                data[value_offset + 1],
                data[value_offset + 2],
                data[value_offset + 3],
            ]) as usize;

            let pending = if key.t & XATTR_VALUE_INDIRECT != 0 {
                if stored_size != 8 {
                    return Err(SquashfsError::Corrupt);
                }
                reader.advance(0, value_offset + 4 + 8)?;
                let data = reader.data();
                let mut reference = [0u8; 8];
                reference.copy_from_slice(&data[value_offset + 4..]);
                self.step = value_offset + 4 + 8;
                PendingValue::Indirect(u64::from_le_bytes(reference))
            } else {
                reader.advance(0, value_offset + 4 + stored_size)?;
                let value = reader.data()[value_offset + 4..].to_vec();
                self.step = value_offset + 4 + stored_size;
                PendingValue::Inline(value)
            };
            (key, name, pending)
        };

        let value = match pending {
            PendingValue::Inline(value) => value,
            PendingValue::Indirect(reference) => self.read_indirect_value(reference)?,
        };
        let value_size = value.len();
        let name_size = name.len();

        let processed = prefix_len(key.t & !XATTR_VALUE_INDIRECT)
            + name_size as u64
            + value_size as u64
            + 1;
        self.remaining_size = self
            .remaining_size
            .checked_sub(processed)
            .ok_or(SquashfsError::Corrupt)?;
        self.remaining_entries -= 1;

        Ok(XattrEntry { t: key.t, name, value })
    }

    /// Follow an 8-byte reference to a value stored elsewhere in the region
    fn read_indirect_value(&self, reference: u64) -> Result<Vec<u8>, SquashfsError> {
        let outer = reference >> 16;
        let inner = reference & 0xffff;
        let start = self.region_start.checked_add(outer).ok_or(SquashfsError::Corrupt)?;
        trace!(reference, "loading indirect xattr value");

        let superblock = self.archive.superblock();
        let mut reader = MetablockReader::new(self.archive, start, superblock.bytes_used)?;
        reader.advance(inner, 4)?;
        let data = reader.data();
        let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        reader.advance(0, 4 + size)?;
        Ok(reader.data()[4..].to_vec())
    }

    /// Find `name` (a full name such as `user.key`), short-circuiting on the
    /// on-disk sort order.
    pub fn lookup(&mut self, name: &[u8]) -> Result<XattrEntry, SquashfsError> {
        for entry in self {
            let entry = entry?;
            match entry.fullname().as_slice().cmp(name) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(entry),
                std::cmp::Ordering::Greater => return Err(SquashfsError::NoXattr),
            }
        }
        Err(SquashfsError::NoXattr)
    }
}

impl Iterator for XattrIterator<'_> {
    type Item = Result<XattrEntry, SquashfsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.remaining_entries == 0 {
            self.finished = true;
            if self.remaining_size != 0 {
                return Some(Err(SquashfsError::Corrupt));
            }
            return None;
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
