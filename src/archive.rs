//! The opened archive and its shared state

use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use deku::ctx::Endian;
use deku::prelude::*;
use deku::reader::Reader;
use solana_nohash_hasher::IntMap;
use tracing::{error, info, trace};

use crate::cache::ExtractCache;
use crate::compressor::{
    CompressionAction, CompressionOptions, Compressor, DefaultCompressor,
};
use crate::error::SquashfsError;
use crate::export::Export;
use crate::file::File;
use crate::fragment::Fragment;
use crate::id::Id;
use crate::mapper::{FileMapper, Mapper, OffsetMapper, SliceMapper};
use crate::metadata;
use crate::path;
use crate::squashfs::{SuperBlock, NOT_SET};
use crate::table::Table;
use crate::traverse::TreeTraversal;
use crate::xattr::XattrTable;

/// Size of the shared zero buffer sparse chunks are served from
const ZERO_BLOCK_SIZE: usize = 16384;

/// Tunables of an opened archive; `Default` matches common use
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Constant added to every image address, for embedded archives
    pub archive_offset: u64,
    /// Fetch granularity of block-based mappers (HTTP). 128KiB
    pub mapper_block_size: usize,
    /// Block cache capacity of block-based mappers
    pub mapper_lru_size: usize,
    /// Capacity of the extract caches unless overridden per class
    pub compression_lru_size: usize,
    /// Capacity of the metablock extract cache
    pub metablock_lru_size: Option<usize>,
    /// Capacity of the datablock extract cache
    pub data_lru_size: Option<usize>,
    /// Bound on followed symlinks per resolution
    pub max_symlink_depth: usize,
    /// Overrides the source's own size, e.g. for partial buffers
    pub source_size: Option<u64>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archive_offset: 0,
            mapper_block_size: 0x20000,
            mapper_lru_size: 128,
            compression_lru_size: 128,
            metablock_lru_size: None,
            data_lru_size: None,
            max_symlink_depth: 100,
            source_size: None,
        }
    }
}

#[derive(Default)]
struct Tables {
    id: Option<Arc<Table<Id>>>,
    fragment: Option<Arc<Table<Fragment>>>,
    export: Option<Arc<Table<Export>>>,
    xattr: Option<Arc<XattrTable>>,
}

/// An opened SquashFS image.
///
/// Shareable between threads; iterators and readers borrow it and hold their
/// own cursors. The indirection tables are built lazily under one lock, the
/// two extract caches have their own.
pub struct Archive<'b> {
    mapper: Box<dyn Mapper + 'b>,
    config: ArchiveConfig,
    superblock: SuperBlock,
    compression_options: Option<CompressionOptions>,
    zero_block: Vec<u8>,
    metablock_cache: ExtractCache,
    data_cache: ExtractCache,
    tables: Mutex<Tables>,
    /// inode number -> inode ref, filled as inodes are opened
    inode_map: Mutex<IntMap<u32, u64>>,
}

impl<'b> Archive<'b> {
    /// Open a local image file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, SquashfsError> {
        Self::from_path_with_config(path, ArchiveConfig::default())
    }

    pub fn from_path_with_config<P: AsRef<Path>>(
        path: P,
        config: ArchiveConfig,
    ) -> Result<Self, SquashfsError> {
        Self::with_mapper(FileMapper::open(path)?, config)
    }

    /// Open an image already materialized in memory
    pub fn from_slice(data: &'b [u8]) -> Result<Self, SquashfsError> {
        Self::from_slice_with_config(data, ArchiveConfig::default())
    }

    pub fn from_slice_with_config(
        data: &'b [u8],
        config: ArchiveConfig,
    ) -> Result<Self, SquashfsError> {
        let mapper = match config.source_size {
            Some(size) => SliceMapper::with_size(data, size)?,
            None => SliceMapper::new(data),
        };
        Self::with_mapper(mapper, config)
    }

    /// Open an image behind an HTTP server with range-request support
    #[cfg(feature = "http")]
    pub fn from_url(url: &str) -> Result<Self, SquashfsError> {
        Self::from_url_with_config(url, ArchiveConfig::default())
    }

    #[cfg(feature = "http")]
    pub fn from_url_with_config(
        url: &str,
        config: ArchiveConfig,
    ) -> Result<Self, SquashfsError> {
        let mut mapper = crate::mapper::HttpMapper::new(
            url,
            config.mapper_block_size,
            config.mapper_lru_size,
        )?;
        if let Some(size) = config.source_size {
            mapper.set_size(size);
        }
        Self::with_mapper(mapper, config)
    }

    /// Open an image behind any byte source
    pub fn with_mapper<M: Mapper + 'b>(
        mapper: M,
        config: ArchiveConfig,
    ) -> Result<Self, SquashfsError> {
        let mapper: Box<dyn Mapper + 'b> = if config.archive_offset != 0 {
            Box::new(OffsetMapper::new(mapper, config.archive_offset)?)
        } else {
            Box::new(mapper)
        };

        let source_size = match config.source_size {
            Some(size) => size.min(mapper.size()),
            None => mapper.size(),
        };
        let superblock = {
            let mapping = mapper.map(0, 96)?;
            SuperBlock::parse(&mapping.data()[..96], source_size)?
        };
        let compression_options = Self::read_compression_options(&*mapper, &superblock);
        info!(
            compressor = ?superblock.compressor,
            block_size = superblock.block_size,
            inodes = superblock.inode_count,
            "opened archive"
        );

        let metablock_lru = config.metablock_lru_size.unwrap_or(config.compression_lru_size);
        let data_lru = config.data_lru_size.unwrap_or(config.compression_lru_size);
        Ok(Self {
            mapper,
            superblock,
            compression_options,
            zero_block: vec![0u8; ZERO_BLOCK_SIZE],
            metablock_cache: ExtractCache::new(metablock_lru),
            data_cache: ExtractCache::new(data_lru),
            tables: Mutex::new(Tables::default()),
            inode_map: Mutex::new(IntMap::default()),
            config,
        })
    }

    /// Compressor options metablock, directly after the superblock. Invalid
    /// options are dropped rather than failing the open.
    fn read_compression_options(
        mapper: &dyn Mapper,
        superblock: &SuperBlock,
    ) -> Option<CompressionOptions> {
        if superblock.compressor == Compressor::None
            || !superblock.compressor_options_are_present()
        {
            return None;
        }

        let result = (|| -> Result<CompressionOptions, SquashfsError> {
            let mapping = mapper.map(96, 2)?;
            let header = mapping.data();
            let header = u16::from_le_bytes([header[0], header[1]]);
            let body_len = metadata::len(header) as usize;
            if body_len == 0 || body_len > metadata::METADATA_MAXSIZE {
                return Err(SquashfsError::Corrupt);
            }
            let mapping = mapper.map(98, body_len)?;
            let bytes = if metadata::is_compressed(header) {
                let mut out = Vec::with_capacity(metadata::METADATA_MAXSIZE);
                DefaultCompressor.decompress(
                    &mapping.data()[..body_len],
                    &mut out,
                    superblock.compressor,
                )?;
                out
            } else {
                mapping.data()[..body_len].to_vec()
            };

            let mut cursor = Cursor::new(bytes);
            let mut reader = Reader::new(&mut cursor);
            Ok(CompressionOptions::from_reader_with_ctx(
                &mut reader,
                (Endian::Little, superblock.compressor),
            )?)
        })();

        match result {
            Ok(options) => {
                trace!("compression options: {options:02x?}");
                Some(options)
            }
            Err(e) => {
                error!("invalid compression options: {e:?}, not using");
                None
            }
        }
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    pub fn compression_options(&self) -> Option<&CompressionOptions> {
        self.compression_options.as_ref()
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub(crate) fn mapper(&self) -> &(dyn Mapper + '_) {
        &*self.mapper
    }

    pub(crate) fn metablock_cache(&self) -> &ExtractCache {
        &self.metablock_cache
    }

    pub(crate) fn data_cache(&self) -> &ExtractCache {
        &self.data_cache
    }

    pub(crate) fn zero_block(&self) -> &[u8] {
        &self.zero_block
    }

    /// Times the metablock decoder has run, for instrumentation
    pub fn metablock_decoder_invocations(&self) -> u64 {
        self.metablock_cache.misses()
    }

    /// Times the datablock decoder has run, for instrumentation
    pub fn data_decoder_invocations(&self) -> u64 {
        self.data_cache.misses()
    }

    /// The root directory
    pub fn root(&self) -> Result<File<'_>, SquashfsError> {
        File::open_by_ref(self, self.superblock.root_inode)
    }

    /// Resolve `path` from the root. With `follow_symlinks`, a symlink in the
    /// final component is followed too.
    pub fn open(&self, path: &str, follow_symlinks: bool) -> Result<File<'_>, SquashfsError> {
        let root = self.root()?;
        path::resolve(self, &root, path, follow_symlinks)
    }

    /// Open an inode directly by its 64-bit reference
    pub fn open_by_ref(&self, inode_ref: u64) -> Result<File<'_>, SquashfsError> {
        File::open_by_ref(self, inode_ref)
    }

    /// Depth-first traversal of the subtree rooted at `file`
    pub fn traversal<'s>(&'s self, file: &File<'s>) -> TreeTraversal<'s> {
        TreeTraversal::new(self, file.clone())
    }

    pub(crate) fn register_inode(&self, inode_number: u32, inode_ref: u64) {
        self.inode_map.lock().unwrap().insert(inode_number, inode_ref);
    }

    /// Inode ref for an inode number, from the memoized map or the export
    /// table when the archive carries one
    pub(crate) fn inode_ref_for_number(&self, inode_number: u32) -> Result<u64, SquashfsError> {
        if let Some(inode_ref) = self.inode_map.lock().unwrap().get(&inode_number) {
            return Ok(*inode_ref);
        }
        if inode_number == 0 {
            return Err(SquashfsError::NoSuchEntry);
        }
        match self.export_table() {
            Ok(table) => {
                // export records are indexed by inode number, 1-based
                let export = table
                    .get(self, u64::from(inode_number) - 1)
                    .map_err(|_| SquashfsError::NoSuchEntry)?;
                self.register_inode(inode_number, export.num);
                Ok(export.num)
            }
            Err(SquashfsError::NoExportTable) => Err(SquashfsError::NoSuchEntry),
            Err(e) => Err(e),
        }
    }

    /// Entry of the id table
    pub(crate) fn id(&self, index: u64) -> Result<u32, SquashfsError> {
        let table = self.id_table()?;
        Ok(table.get(self, index)?.num)
    }

    /// Entry of the fragment table
    pub(crate) fn fragment(&self, index: u64) -> Result<Fragment, SquashfsError> {
        let table = self.fragment_table()?;
        table.get(self, index)
    }

    fn id_table(&self) -> Result<Arc<Table<Id>>, SquashfsError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = &tables.id {
            return Ok(table.clone());
        }
        let table = Arc::new(Table::new(
            self,
            self.superblock.id_table,
            self.superblock.id_count.into(),
        )?);
        tables.id = Some(table.clone());
        Ok(table)
    }

    fn fragment_table(&self) -> Result<Arc<Table<Fragment>>, SquashfsError> {
        if self.superblock.frag_count == 0 || self.superblock.frag_table == NOT_SET {
            return Err(SquashfsError::NoFragmentTable);
        }
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = &tables.fragment {
            return Ok(table.clone());
        }
        let table = Arc::new(Table::new(
            self,
            self.superblock.frag_table,
            self.superblock.frag_count.into(),
        )?);
        tables.fragment = Some(table.clone());
        Ok(table)
    }

    pub(crate) fn export_table(&self) -> Result<Arc<Table<Export>>, SquashfsError> {
        if !self.superblock.nfs_export_table_exists() || self.superblock.export_table == NOT_SET {
            return Err(SquashfsError::NoExportTable);
        }
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = &tables.export {
            return Ok(table.clone());
        }
        let table = Arc::new(Table::new(
            self,
            self.superblock.export_table,
            self.superblock.inode_count.into(),
        )?);
        tables.export = Some(table.clone());
        Ok(table)
    }

    pub(crate) fn xattr_table(&self) -> Result<Arc<XattrTable>, SquashfsError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = &tables.xattr {
            return Ok(table.clone());
        }
        let table = Arc::new(XattrTable::new(self)?);
        tables.xattr = Some(table.clone());
        Ok(table)
    }
}
