//! Random-access reader for [SquashFS](https://en.wikipedia.org/wiki/SquashFS)
//! 4.0 archives.
//!
//! Nothing is extracted up front: opening an [`Archive`] parses and validates
//! the superblock only, and every later read maps, decodes and caches exactly
//! the blocks it touches. That makes the crate usable over sources where
//! whole-image reads are expensive, such as memory-mapped firmware blobs or
//! images behind an HTTP server with range-request support.
//!
//! ## Example
//! ```rust,no_run
//! use std::io::Read;
//!
//! use sqfs::Archive;
//!
//! let archive = Archive::from_path("image.squashfs").unwrap();
//!
//! // random access without reading the rest of the file
//! let file = archive.open("/usr/share/doc/notes.txt", true).unwrap();
//! let mut reader = file.reader().unwrap();
//! let window = reader.advance(4096, 512).unwrap();
//! assert_eq!(window.len(), 512);
//!
//! // or stream it
//! let mut content = Vec::new();
//! file.reader().unwrap().read_to_end(&mut content).unwrap();
//! ```
//!
//! ## Walking the tree
//! ```rust,no_run
//! use sqfs::{Archive, TraversalState};
//!
//! let archive = Archive::from_path("image.squashfs").unwrap();
//! let root = archive.root().unwrap();
//! let mut traversal = archive.traversal(&root);
//! while let Some(state) = traversal.next() {
//!     if state.unwrap() == TraversalState::File {
//!         println!("{}", traversal.path());
//!     }
//! }
//! ```

mod archive;
mod cache;
mod compressor;
mod data;
mod dir;
mod error;
mod export;
mod file;
mod fragment;
mod id;
mod inode;
mod mapper;
mod metadata;
mod path;
mod squashfs;
mod table;
mod traverse;
mod xattr;

pub use crate::archive::{Archive, ArchiveConfig};
pub use crate::compressor::{
    CompressionAction, CompressionOptions, Compressor, DefaultCompressor, Gzip, Lz4, Lzo, Xz,
    Zstd,
};
pub use crate::data::{DataSize, FileContentIterator, FileReader};
pub use crate::dir::{DirEntry, DirIterator, DirectoryIndex};
pub use crate::error::SquashfsError;
pub use crate::export::Export;
pub use crate::file::{File, FileType};
pub use crate::fragment::Fragment;
pub use crate::id::Id;
pub use crate::inode::{Inode, InodeHeader, InodeId, InodeInner, NO_FRAGMENT, NO_XATTR};
pub use crate::mapper::{FileMapper, MapReader, Mapper, Mapping, OffsetMapper, SliceMapper};
pub use crate::metadata::METADATA_MAXSIZE;
pub use crate::squashfs::{
    Flags, SuperBlock, DEFAULT_BLOCK_SIZE, MAGIC, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NOT_SET,
};
pub use crate::traverse::{TraversalState, TreeTraversal};
pub use crate::xattr::{XattrEntry, XattrId, XattrIterator};

#[cfg(feature = "http")]
pub use crate::mapper::HttpMapper;
