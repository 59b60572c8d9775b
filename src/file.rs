//! Opened inodes and their uniform capability surface

use std::cell::Cell;
use std::io::Cursor;

use deku::prelude::*;
use deku::reader::Reader;
use tracing::trace;

use crate::archive::Archive;
use crate::data::{DataSize, FileContentIterator, FileReader};
use crate::dir::DirIterator;
use crate::error::SquashfsError;
use crate::inode::{Inode, InodeId, InodeInner, NO_FRAGMENT, NO_XATTR};
use crate::metadata::MetablockReader;
use crate::path;
use crate::xattr::XattrIterator;

/// The seven kinds of files an archive can store
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    Directory,
    File,
    Symlink,
    BlockDevice,
    CharacterDevice,
    NamedPipe,
    Socket,
}

impl FileType {
    pub(crate) fn from_inode_id(id: InodeId) -> Self {
        match id.into_base_type() {
            InodeId::BasicDirectory => Self::Directory,
            InodeId::BasicFile => Self::File,
            InodeId::BasicSymlink => Self::Symlink,
            InodeId::BasicBlockDevice => Self::BlockDevice,
            InodeId::BasicCharacterDevice => Self::CharacterDevice,
            InodeId::BasicNamedPipe => Self::NamedPipe,
            InodeId::BasicSocket => Self::Socket,
            _ => unreachable!("into_base_type returns basic ids"),
        }
    }
}

/// An opened inode.
///
/// Decoded once from the inode metablock stream; accessors expose the
/// capability set uniformly, returning `None` for capabilities the variant
/// does not carry.
#[derive(Clone)]
pub struct File<'a> {
    archive: &'a Archive<'a>,
    inode_ref: u64,
    inode: Inode,
    /// Memoized parent directory reference, filled by directory iteration or
    /// on demand through the inode map
    parent_ref: Cell<Option<u64>>,
}

impl<'a> File<'a> {
    /// Decode the inode behind `inode_ref`.
    ///
    /// The variant payload length is not known up front (it depends on block
    /// counts, symlink length, index entries), so the stream window grows
    /// until the decode no longer reports missing input.
    pub(crate) fn open_by_ref(
        archive: &'a Archive<'a>,
        inode_ref: u64,
    ) -> Result<Self, SquashfsError> {
        let superblock = archive.superblock();
        let outer = inode_ref >> 16;
        let inner = inode_ref & 0xffff;
        let address =
            superblock.inode_table.checked_add(outer).ok_or(SquashfsError::Corrupt)?;
        trace!(outer, inner, "opening inode");

        let mut reader = MetablockReader::new(archive, address, superblock.dir_table)?;
        reader.advance(inner, 0)?;

        let mut window = 128;
        let inode = loop {
            let granted = reader.advance_up_to(0, window)?;
            let mut cursor = Cursor::new(reader.data());
            let mut deku_reader = Reader::new(&mut cursor);
            match Inode::from_reader_with_ctx(
                &mut deku_reader,
                (superblock.block_size, superblock.block_log),
            ) {
                Ok(inode) => break inode,
                Err(DekuError::Incomplete(_)) => {
                    if granted < window {
                        // the stream ended and the inode still does not parse
                        return Err(SquashfsError::Corrupt);
                    }
                    window = window.checked_mul(2).ok_or(SquashfsError::Corrupt)?;
                }
                Err(e) => return Err(e.into()),
            }
        };

        archive.register_inode(inode.header.inode_number, inode_ref);
        Ok(Self { archive, inode_ref, inode, parent_ref: Cell::new(None) })
    }

    pub(crate) fn archive(&self) -> &'a Archive<'a> {
        self.archive
    }

    pub fn inode_ref(&self) -> u64 {
        self.inode_ref
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_inode_id(self.inode.id)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn permissions(&self) -> u16 {
        self.inode.header.permissions
    }

    pub fn mtime(&self) -> u32 {
        self.inode.header.mtime
    }

    pub fn inode_number(&self) -> u32 {
        self.inode.header.inode_number
    }

    /// Index of the owner uid in the id table
    pub fn uid_index(&self) -> u16 {
        self.inode.header.uid
    }

    /// Index of the owner gid in the id table
    pub fn gid_index(&self) -> u16 {
        self.inode.header.gid
    }

    /// Owner uid, resolved through the id table
    pub fn uid(&self) -> Result<u32, SquashfsError> {
        self.archive.id(self.inode.header.uid.into())
    }

    /// Owner gid, resolved through the id table
    pub fn gid(&self) -> Result<u32, SquashfsError> {
        self.archive.id(self.inode.header.gid.into())
    }

    /// Logical size: content bytes for files, listing size for directories,
    /// target length for symlinks, 0 otherwise
    pub fn size(&self) -> u64 {
        match &self.inode.inner {
            InodeInner::BasicFile(file) => file.file_size.into(),
            InodeInner::ExtendedFile(file) => file.file_size,
            InodeInner::BasicDirectory(dir) => dir.file_size.into(),
            InodeInner::ExtendedDirectory(dir) => dir.file_size.into(),
            InodeInner::BasicSymlink(symlink) => symlink.target_size.into(),
            InodeInner::ExtendedSymlink(symlink) => symlink.target_size.into(),
            _ => 0,
        }
    }

    pub fn hard_links(&self) -> Option<u32> {
        match &self.inode.inner {
            InodeInner::BasicDirectory(dir) => Some(dir.link_count),
            InodeInner::ExtendedDirectory(dir) => Some(dir.link_count),
            InodeInner::BasicFile(_) => None,
            InodeInner::ExtendedFile(file) => Some(file.link_count),
            InodeInner::BasicSymlink(symlink) => Some(symlink.link_count),
            InodeInner::ExtendedSymlink(symlink) => Some(symlink.link_count),
            InodeInner::BasicBlockDevice(dev) | InodeInner::BasicCharacterDevice(dev) => {
                Some(dev.link_count)
            }
            InodeInner::ExtendedBlockDevice(dev) | InodeInner::ExtendedCharacterDevice(dev) => {
                Some(dev.link_count)
            }
            InodeInner::BasicNamedPipe(ipc) | InodeInner::BasicSocket(ipc) => Some(ipc.link_count),
            InodeInner::ExtendedNamedPipe(ipc) | InodeInner::ExtendedSocket(ipc) => {
                Some(ipc.link_count)
            }
        }
    }

    pub fn xattr_index(&self) -> Option<u32> {
        let index = match &self.inode.inner {
            InodeInner::ExtendedDirectory(dir) => dir.xattr_index,
            InodeInner::ExtendedFile(file) => file.xattr_index,
            InodeInner::ExtendedSymlink(symlink) => symlink.xattr_index,
            InodeInner::ExtendedBlockDevice(dev)
            | InodeInner::ExtendedCharacterDevice(dev) => dev.xattr_index,
            InodeInner::ExtendedNamedPipe(ipc) | InodeInner::ExtendedSocket(ipc) => {
                ipc.xattr_index
            }
            _ => return None,
        };
        (index != NO_XATTR).then_some(index)
    }

    pub fn fragment_index(&self) -> Option<u32> {
        let index = match &self.inode.inner {
            InodeInner::BasicFile(file) => file.frag_index,
            InodeInner::ExtendedFile(file) => file.frag_index,
            _ => return None,
        };
        (index != NO_FRAGMENT).then_some(index)
    }

    pub fn has_fragment(&self) -> bool {
        self.fragment_index().is_some()
    }

    /// Byte offset of this file's tail inside its fragment block
    pub fn fragment_offset(&self) -> u32 {
        match &self.inode.inner {
            InodeInner::BasicFile(file) => file.block_offset,
            InodeInner::ExtendedFile(file) => file.block_offset,
            _ => 0,
        }
    }

    /// Image address of this file's first data block
    pub fn blocks_start(&self) -> u64 {
        match &self.inode.inner {
            InodeInner::BasicFile(file) => file.blocks_start.into(),
            InodeInner::ExtendedFile(file) => file.blocks_start,
            _ => 0,
        }
    }

    pub fn block_sizes(&self) -> &[DataSize] {
        match &self.inode.inner {
            InodeInner::BasicFile(file) => &file.block_sizes,
            InodeInner::ExtendedFile(file) => &file.block_sizes,
            _ => &[],
        }
    }

    pub fn block_count(&self) -> u64 {
        self.block_sizes().len() as u64
    }

    pub fn symlink_target(&self) -> Option<&[u8]> {
        match &self.inode.inner {
            InodeInner::BasicSymlink(symlink) => Some(&symlink.target_path),
            InodeInner::ExtendedSymlink(symlink) => Some(&symlink.target_path),
            _ => None,
        }
    }

    pub fn device_number(&self) -> Option<u32> {
        match &self.inode.inner {
            InodeInner::BasicBlockDevice(dev) | InodeInner::BasicCharacterDevice(dev) => {
                Some(dev.device_number)
            }
            InodeInner::ExtendedBlockDevice(dev) | InodeInner::ExtendedCharacterDevice(dev) => {
                Some(dev.device_number)
            }
            _ => None,
        }
    }

    pub(crate) fn directory_block_start(&self) -> Option<u32> {
        match &self.inode.inner {
            InodeInner::BasicDirectory(dir) => Some(dir.block_index),
            InodeInner::ExtendedDirectory(dir) => Some(dir.block_index),
            _ => None,
        }
    }

    pub(crate) fn directory_block_offset(&self) -> Option<u16> {
        match &self.inode.inner {
            InodeInner::BasicDirectory(dir) => Some(dir.block_offset),
            InodeInner::ExtendedDirectory(dir) => Some(dir.block_offset),
            _ => None,
        }
    }

    pub(crate) fn directory_parent_inode(&self) -> Option<u32> {
        match &self.inode.inner {
            InodeInner::BasicDirectory(dir) => Some(dir.parent_inode),
            InodeInner::ExtendedDirectory(dir) => Some(dir.parent_inode),
            _ => None,
        }
    }

    pub(crate) fn set_parent_ref(&self, parent_ref: u64) {
        self.parent_ref.set(Some(parent_ref));
    }

    /// Inode reference of the parent directory.
    ///
    /// Known directly for files opened through directory iteration; otherwise
    /// resolved through the inode map (and export table) for directories,
    /// which record their parent's inode number on disk.
    pub fn parent_ref(&self) -> Result<u64, SquashfsError> {
        if let Some(parent_ref) = self.parent_ref.get() {
            return Ok(parent_ref);
        }
        let parent_inode = self.directory_parent_inode().ok_or(SquashfsError::NoSuchEntry)?;
        let parent_ref = self.archive.inode_ref_for_number(parent_inode)?;
        self.parent_ref.set(Some(parent_ref));
        Ok(parent_ref)
    }

    /// Iterate this directory's entries in on-disk order
    pub fn dir_iterator(&self) -> Result<DirIterator<'a>, SquashfsError> {
        let (start, offset, index) = match &self.inode.inner {
            InodeInner::BasicDirectory(dir) => (dir.block_index, dir.block_offset, Vec::new()),
            InodeInner::ExtendedDirectory(dir) => {
                (dir.block_index, dir.block_offset, dir.dir_index.clone())
            }
            _ => return Err(SquashfsError::NotADirectory),
        };
        DirIterator::new(self.archive, self.inode_ref, start, offset, self.size(), index)
    }

    /// Iterate this file's content chunk by chunk
    pub fn iterator(&self) -> Result<FileContentIterator<'_>, SquashfsError> {
        FileContentIterator::new(self)
    }

    /// Buffered random-access reader over this file's content
    pub fn reader(&self) -> Result<FileReader<'_>, SquashfsError> {
        Ok(FileReader::new(self.iterator()?, self.size()))
    }

    /// Iterate this inode's extended attributes
    pub fn xattr_iterator(&self) -> Result<XattrIterator<'a>, SquashfsError> {
        XattrIterator::new(self.archive, self.xattr_index())
    }

    /// Replace this symlink with its target, resolved relative to the parent
    /// directory. Fails with [`SquashfsError::NotASymlink`] for other types.
    pub fn resolve_symlink(&self) -> Result<File<'a>, SquashfsError> {
        let target = self.symlink_target().ok_or(SquashfsError::NotASymlink)?.to_vec();
        let target = std::str::from_utf8(&target)?.to_string();
        let parent = File::open_by_ref(self.archive, self.parent_ref()?)?;
        path::resolve(self.archive, &parent, &target, false)
    }

    /// Follow this symlink until a non-symlink is reached, bounded by the
    /// configured symlink depth.
    pub fn resolve_symlink_all(&self) -> Result<File<'a>, SquashfsError> {
        let mut current = self.clone();
        for _ in 0..self.archive.config().max_symlink_depth {
            if current.file_type() != FileType::Symlink {
                return Ok(current);
            }
            current = current.resolve_symlink()?;
        }
        if current.file_type() == FileType::Symlink {
            return Err(SquashfsError::TooManySymlinks);
        }
        Ok(current)
    }

}

impl std::fmt::Debug for File<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("inode_ref", &self.inode_ref)
            .field("inode_number", &self.inode_number())
            .field("file_type", &self.file_type())
            .field("size", &self.size())
            .finish()
    }
}
