//! Byte-level builder for synthetic test images.
//!
//! Produces small but fully valid SquashFS 4.0 images without going through
//! any external tooling, so the tests are hermetic. Metadata and data can be
//! stored raw or gzip-compressed; the superblock always advertises gzip.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;

pub const METADATA_MAXSIZE: usize = 8192;

const INODE_BASIC_DIR: u16 = 1;
const INODE_BASIC_FILE: u16 = 2;
const INODE_BASIC_SYMLINK: u16 = 3;
const INODE_EXT_DIR: u16 = 8;
const INODE_EXT_FILE: u16 = 9;

const NO_FRAGMENT: u32 = 0xffff_ffff;
const NO_XATTR: u32 = 0xffff_ffff;
const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

const FLAG_NFS_EXPORT: u16 = 0x0080;

#[derive(Debug, Clone)]
pub struct Xattr {
    pub type_id: u16,
    pub name: String,
    pub value: Vec<u8>,
    pub indirect: bool,
}

impl Xattr {
    pub fn user(name: &str, value: &[u8]) -> Self {
        Self { type_id: 0, name: name.to_string(), value: value.to_vec(), indirect: false }
    }

    pub fn indirect(mut self) -> Self {
        self.indirect = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileOpts {
    /// gzip the stored datablocks
    pub compress: bool,
    /// store the tail in the shared fragment block
    pub fragment: bool,
    pub xattrs: Vec<Xattr>,
}

impl FileOpts {
    pub fn compressed() -> Self {
        Self { compress: true, ..Self::default() }
    }

    pub fn fragmented() -> Self {
        Self { fragment: true, ..Self::default() }
    }
}

enum Node {
    Dir(BTreeMap<String, Node>),
    File { content: Vec<u8>, opts: FileOpts },
    Symlink(String),
}

/// Logical byte stream chunked into metablocks on build
struct MetaStream {
    logical: Vec<u8>,
}

impl MetaStream {
    fn new() -> Self {
        Self { logical: Vec::new() }
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let offset = self.logical.len();
        self.logical.extend_from_slice(bytes);
        offset
    }

    fn len(&self) -> usize {
        self.logical.len()
    }

    /// Composite (outer << 16 | inner) ref for a logical offset, valid for
    /// uncompressed chunking where every full chunk occupies 2 + 8192 bytes
    fn ref_at(&self, logical: usize) -> u64 {
        let chunk = logical / METADATA_MAXSIZE;
        let inner = logical % METADATA_MAXSIZE;
        let outer = chunk * (METADATA_MAXSIZE + 2);
        ((outer as u64) << 16) | inner as u64
    }

    /// On-disk encoding: 2-byte headers + bodies
    fn encode(&self, compress: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if self.logical.is_empty() {
            return out;
        }
        for chunk in self.logical.chunks(METADATA_MAXSIZE) {
            if compress {
                let body = gzip(chunk);
                out.extend_from_slice(&(body.len() as u16).to_le_bytes());
                out.extend_from_slice(&body);
            } else {
                out.extend_from_slice(&(chunk.len() as u16 | 0x8000).to_le_bytes());
                out.extend_from_slice(chunk);
            }
        }
        out
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

struct SerializedInode {
    /// inner offset in the inode stream
    offset: u16,
    number: u32,
    /// base type stored in directory entries
    entry_type: u16,
}

pub struct ImageBuilder {
    block_size: u32,
    root: BTreeMap<String, Node>,
    compress_metadata: bool,
    extended_dirs: bool,
    with_export_table: bool,
    /// entry name -> forced self-reference, for loop images
    loop_entry: Option<String>,
}

impl ImageBuilder {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            root: BTreeMap::new(),
            compress_metadata: false,
            extended_dirs: false,
            with_export_table: false,
            loop_entry: None,
        }
    }

    pub fn compress_metadata(mut self) -> Self {
        self.compress_metadata = true;
        self
    }

    /// Emit every directory as an extended inode with a one-entry index
    pub fn extended_dirs(mut self) -> Self {
        self.extended_dirs = true;
        self
    }

    pub fn with_export_table(mut self) -> Self {
        self.with_export_table = true;
        self
    }

    /// Give the root directory an entry that points back at the root itself
    pub fn with_root_loop(mut self, name: &str) -> Self {
        self.loop_entry = Some(name.to_string());
        self
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.ensure_dir(path);
        self
    }

    pub fn file(mut self, path: &str, content: &[u8], opts: FileOpts) -> Self {
        let (dir, name) = self.split_parent(path);
        dir.insert(name, Node::File { content: content.to_vec(), opts });
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let (dir, name) = self.split_parent(path);
        dir.insert(name, Node::Symlink(target.to_string()));
        self
    }

    fn ensure_dir(&mut self, path: &str) {
        let mut current = &mut self.root;
        for piece in path.split('/').filter(|p| !p.is_empty()) {
            current = match current
                .entry(piece.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()))
            {
                Node::Dir(children) => children,
                _ => panic!("path component {piece} exists and is not a directory"),
            };
        }
    }

    fn split_parent(&mut self, path: &str) -> (&mut BTreeMap<String, Node>, String) {
        let mut pieces: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let name = pieces.pop().expect("empty path").to_string();
        let parent = pieces.join("/");
        self.ensure_dir(&parent);
        let mut current = &mut self.root;
        for piece in pieces {
            current = match current.get_mut(piece) {
                Some(Node::Dir(children)) => children,
                _ => unreachable!(),
            };
        }
        (current, name)
    }

    pub fn build(self) -> Vec<u8> {
        Builder::build(self)
    }
}

/// Per-file data placement gathered while writing the data section
struct DataInfo {
    blocks_start: u64,
    block_sizes: Vec<u32>,
    frag_index: u32,
    frag_offset: u32,
}

struct XattrOwner {
    /// logical offset of the entry list in the xattr region
    offset: usize,
    count: u32,
    size: u32,
}

struct Builder {
    block_size: u32,
    compress_metadata: bool,
    extended_dirs: bool,
    loop_entry: Option<String>,

    out: Vec<u8>,
    inode_stream: MetaStream,
    dir_stream: MetaStream,
    xattr_region: MetaStream,
    xattr_ids: Vec<XattrOwner>,
    fragments: Vec<(u64, u32)>,
    frag_buf: Vec<u8>,
    frag_compress: bool,
    next_inode: u32,
    /// inode number -> ref, for the export table
    refs_by_number: BTreeMap<u32, u64>,
    inode_count: u32,
}

impl Builder {
    fn build(spec: ImageBuilder) -> Vec<u8> {
        let mut builder = Builder {
            block_size: spec.block_size,
            compress_metadata: spec.compress_metadata,
            extended_dirs: spec.extended_dirs,
            loop_entry: spec.loop_entry,
            out: vec![0u8; 96],
            inode_stream: MetaStream::new(),
            dir_stream: MetaStream::new(),
            xattr_region: MetaStream::new(),
            xattr_ids: Vec::new(),
            fragments: Vec::new(),
            frag_buf: Vec::new(),
            frag_compress: false,
            next_inode: 0,
            refs_by_number: BTreeMap::new(),
            inode_count: 0,
        };

        let root = spec.root;
        let root_inode = builder.serialize_dir(&root, None);
        builder.flush_fragment();

        let root_ref = (root_inode.offset as u64) & 0xffff;
        builder.finish(spec.with_export_table, root_ref)
    }

    fn alloc_inode(&mut self) -> u32 {
        self.next_inode += 1;
        self.inode_count += 1;
        self.next_inode
    }

    // ---- data section -------------------------------------------------

    fn write_data(&mut self, content: &[u8], opts: &FileOpts) -> DataInfo {
        let block_size = self.block_size as usize;
        let blocks_start = self.out.len() as u64;
        let mut block_sizes = Vec::new();

        let full_blocks = if opts.fragment && !content.is_empty() {
            content.len() / block_size
        } else {
            content.len().div_ceil(block_size)
        };

        for index in 0..full_blocks {
            let start = index * block_size;
            let end = (start + block_size).min(content.len());
            let block = &content[start..end];
            if block.iter().all(|&b| b == 0) {
                // sparse
                block_sizes.push(0);
                continue;
            }
            if opts.compress {
                let compressed = gzip(block);
                block_sizes.push(compressed.len() as u32);
                self.out.extend_from_slice(&compressed);
            } else {
                block_sizes.push(block.len() as u32 | (1 << 24));
                self.out.extend_from_slice(block);
            }
        }

        let (frag_index, frag_offset) = if opts.fragment && !content.is_empty() {
            let tail = &content[full_blocks * block_size..];
            if tail.is_empty() {
                (NO_FRAGMENT, 0)
            } else {
                let offset = self.frag_buf.len() as u32;
                self.frag_buf.extend_from_slice(tail);
                self.frag_compress |= opts.compress;
                assert!(self.frag_buf.len() <= block_size, "fragment block overflow");
                (0, offset)
            }
        } else {
            (NO_FRAGMENT, 0)
        };

        DataInfo { blocks_start, block_sizes, frag_index, frag_offset }
    }

    fn flush_fragment(&mut self) {
        if self.frag_buf.is_empty() {
            return;
        }
        let start = self.out.len() as u64;
        let size = if self.frag_compress {
            let compressed = gzip(&self.frag_buf);
            self.out.extend_from_slice(&compressed);
            compressed.len() as u32
        } else {
            self.out.extend_from_slice(&self.frag_buf);
            self.frag_buf.len() as u32 | (1 << 24)
        };
        self.fragments.push((start, size));
    }

    // ---- xattrs -------------------------------------------------------

    fn write_xattrs(&mut self, xattrs: &[Xattr]) -> u32 {
        if xattrs.is_empty() {
            return NO_XATTR;
        }

        // out-of-line values first, recording their refs
        let mut indirect_refs = BTreeMap::new();
        for (i, xattr) in xattrs.iter().enumerate() {
            if xattr.indirect {
                let offset = self.xattr_region.len();
                let mut record = Vec::new();
                record.extend_from_slice(&(xattr.value.len() as u32).to_le_bytes());
                record.extend_from_slice(&xattr.value);
                self.xattr_region.write(&record);
                indirect_refs.insert(i, self.xattr_region.ref_at(offset));
            }
        }

        let offset = self.xattr_region.len();
        let mut size = 0u32;
        let mut entries = Vec::new();
        for (i, xattr) in xattrs.iter().enumerate() {
            let t = if xattr.indirect { xattr.type_id | 0x0100 } else { xattr.type_id };
            entries.extend_from_slice(&t.to_le_bytes());
            entries.extend_from_slice(&(xattr.name.len() as u16).to_le_bytes());
            entries.extend_from_slice(xattr.name.as_bytes());
            if xattr.indirect {
                entries.extend_from_slice(&8u32.to_le_bytes());
                entries.extend_from_slice(&indirect_refs[&i].to_le_bytes());
            } else {
                entries.extend_from_slice(&(xattr.value.len() as u32).to_le_bytes());
                entries.extend_from_slice(&xattr.value);
            }
            let prefix_len = match xattr.type_id {
                0 => 5,
                1 => 8,
                2 => 9,
                _ => 0,
            };
            size += prefix_len + xattr.name.len() as u32 + xattr.value.len() as u32 + 1;
        }
        self.xattr_region.write(&entries);

        let index = self.xattr_ids.len() as u32;
        self.xattr_ids.push(XattrOwner { offset, count: xattrs.len() as u32, size });
        index
    }

    // ---- inodes and directories ---------------------------------------

    fn header(&self, type_id: u16, inode_number: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&type_id.to_le_bytes());
        bytes.extend_from_slice(&0o644u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // uid index
        bytes.extend_from_slice(&0u16.to_le_bytes()); // gid index
        bytes.extend_from_slice(&0u32.to_le_bytes()); // mtime
        bytes.extend_from_slice(&inode_number.to_le_bytes());
        bytes
    }

    fn record(&mut self, offset: usize, number: u32, entry_type: u16) -> SerializedInode {
        let offset = u16::try_from(offset).expect("inode stream grew past one metablock");
        self.refs_by_number.insert(number, offset as u64);
        SerializedInode { offset, number, entry_type }
    }

    fn serialize_file(&mut self, content: &[u8], opts: &FileOpts) -> SerializedInode {
        let number = self.alloc_inode();
        let data = self.write_data(content, opts);
        let xattr_index = self.write_xattrs(&opts.xattrs);

        let mut bytes = if xattr_index == NO_XATTR {
            let mut bytes = self.header(INODE_BASIC_FILE, number);
            bytes.extend_from_slice(&(data.blocks_start as u32).to_le_bytes());
            bytes.extend_from_slice(&data.frag_index.to_le_bytes());
            bytes.extend_from_slice(&data.frag_offset.to_le_bytes());
            bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
            bytes
        } else {
            let mut bytes = self.header(INODE_EXT_FILE, number);
            bytes.extend_from_slice(&data.blocks_start.to_le_bytes());
            bytes.extend_from_slice(&(content.len() as u64).to_le_bytes());
            bytes.extend_from_slice(&0u64.to_le_bytes()); // sparse
            bytes.extend_from_slice(&1u32.to_le_bytes()); // link count
            bytes.extend_from_slice(&data.frag_index.to_le_bytes());
            bytes.extend_from_slice(&data.frag_offset.to_le_bytes());
            bytes.extend_from_slice(&xattr_index.to_le_bytes());
            bytes
        };
        for size in &data.block_sizes {
            bytes.extend_from_slice(&size.to_le_bytes());
        }

        let offset = self.inode_stream.write(&bytes);
        self.record(offset, number, INODE_BASIC_FILE)
    }

    fn serialize_symlink(&mut self, target: &str) -> SerializedInode {
        let number = self.alloc_inode();
        let mut bytes = self.header(INODE_BASIC_SYMLINK, number);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&(target.len() as u32).to_le_bytes());
        bytes.extend_from_slice(target.as_bytes());
        let offset = self.inode_stream.write(&bytes);
        self.record(offset, number, INODE_BASIC_SYMLINK)
    }

    /// Inodes a subtree will allocate, for predicting parent numbers
    fn count_inodes(node: &Node) -> u32 {
        match node {
            Node::Dir(children) => 1 + children.values().map(Self::count_inodes).sum::<u32>(),
            _ => 1,
        }
    }

    fn serialize_dir(
        &mut self,
        children: &BTreeMap<String, Node>,
        parent_number: Option<u32>,
    ) -> SerializedInode {
        // this directory's own number comes right after all its descendants
        let own_number =
            self.next_inode + children.values().map(Self::count_inodes).sum::<u32>() + 1;

        // children first, bottom-up
        let mut entries: Vec<(String, SerializedInode)> = Vec::new();
        for (name, node) in children {
            let serialized = match node {
                Node::Dir(grandchildren) => self.serialize_dir(grandchildren, Some(own_number)),
                Node::File { content, opts } => self.serialize_file(content, opts),
                Node::Symlink(target) => self.serialize_symlink(target),
            };
            entries.push((name.clone(), serialized));
        }

        let number = self.alloc_inode();
        assert_eq!(number, own_number);
        let subdirs = children.values().filter(|n| matches!(n, Node::Dir(_))).count() as u32;

        // the loop entry points back at this directory's own inode, which is
        // serialized right after the listing at a known offset
        let own_offset = self.inode_stream.len() as u16;
        if parent_number.is_none() {
            if let Some(name) = self.loop_entry.take() {
                entries.push((
                    name,
                    SerializedInode {
                        offset: own_offset,
                        number,
                        entry_type: INODE_BASIC_DIR,
                    },
                ));
                entries.sort_by(|a, b| a.0.cmp(&b.0));
            }
        }

        // listing
        let listing_offset = self.dir_stream.len();
        let mut listing = Vec::new();
        if !entries.is_empty() {
            let base = entries.iter().map(|(_, i)| i.number).min().unwrap();
            listing.extend_from_slice(&(entries.len() as u32 - 1).to_le_bytes());
            listing.extend_from_slice(&0u32.to_le_bytes()); // metablock start
            listing.extend_from_slice(&base.to_le_bytes());
            for (name, inode) in &entries {
                listing.extend_from_slice(&inode.offset.to_le_bytes());
                let delta = (inode.number as i64 - base as i64) as i16;
                listing.extend_from_slice(&delta.to_le_bytes());
                listing.extend_from_slice(&inode.entry_type.to_le_bytes());
                listing.extend_from_slice(&(name.len() as u16 - 1).to_le_bytes());
                listing.extend_from_slice(name.as_bytes());
            }
        }
        self.dir_stream.write(&listing);

        let file_size = listing.len() as u32 + 3;
        let parent = parent_number.unwrap_or(number + 1);
        let link_count = 2 + subdirs;

        let offset = if self.extended_dirs {
            let mut bytes = self.header(INODE_EXT_DIR, number);
            bytes.extend_from_slice(&link_count.to_le_bytes());
            bytes.extend_from_slice(&file_size.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes()); // block index
            bytes.extend_from_slice(&parent.to_le_bytes());
            let index_count: u16 = if entries.is_empty() { 0 } else { 1 };
            bytes.extend_from_slice(&index_count.to_le_bytes());
            bytes.extend_from_slice(&(listing_offset as u16).to_le_bytes());
            bytes.extend_from_slice(&NO_XATTR.to_le_bytes());
            if let Some((name, _)) = entries.first() {
                bytes.extend_from_slice(&0u32.to_le_bytes()); // index
                bytes.extend_from_slice(&0u32.to_le_bytes()); // start
                bytes.extend_from_slice(&(name.len() as u32 - 1).to_le_bytes());
                bytes.extend_from_slice(name.as_bytes());
            }
            self.inode_stream.write(&bytes)
        } else {
            let mut bytes = self.header(INODE_BASIC_DIR, number);
            bytes.extend_from_slice(&0u32.to_le_bytes()); // block index
            bytes.extend_from_slice(&link_count.to_le_bytes());
            bytes.extend_from_slice(&(file_size as u16).to_le_bytes());
            bytes.extend_from_slice(&(listing_offset as u16).to_le_bytes());
            bytes.extend_from_slice(&parent.to_le_bytes());
            self.inode_stream.write(&bytes)
        };
        assert_eq!(offset, own_offset as usize);
        self.record(offset, number, INODE_BASIC_DIR)
    }

    // ---- assembly -----------------------------------------------------

    fn write_lookup_table(&mut self, payload: &[u8]) -> u64 {
        // payload metablocks, then the page list the superblock points at
        let mut page_addresses = Vec::new();
        for chunk in payload.chunks(METADATA_MAXSIZE) {
            page_addresses.push(self.out.len() as u64);
            self.out.extend_from_slice(&(chunk.len() as u16 | 0x8000).to_le_bytes());
            self.out.extend_from_slice(chunk);
        }
        let table_start = self.out.len() as u64;
        for address in page_addresses {
            self.out.extend_from_slice(&address.to_le_bytes());
        }
        table_start
    }

    fn finish(mut self, with_export_table: bool, root_ref: u64) -> Vec<u8> {
        let inode_table = self.out.len() as u64;
        let encoded = self.inode_stream.encode(self.compress_metadata);
        self.out.extend_from_slice(&encoded);

        let dir_table = self.out.len() as u64;
        let encoded = self.dir_stream.encode(self.compress_metadata);
        self.out.extend_from_slice(&encoded);

        let frag_table = if self.fragments.is_empty() {
            NOT_SET
        } else {
            let mut payload = Vec::new();
            for (start, size) in &self.fragments {
                payload.extend_from_slice(&start.to_le_bytes());
                payload.extend_from_slice(&size.to_le_bytes());
                payload.extend_from_slice(&0u32.to_le_bytes());
            }
            self.write_lookup_table(&payload)
        };

        let export_table = if with_export_table {
            let mut payload = Vec::new();
            for number in 1..=self.inode_count {
                let inode_ref = self.refs_by_number.get(&number).copied().unwrap_or(0);
                payload.extend_from_slice(&inode_ref.to_le_bytes());
            }
            self.write_lookup_table(&payload)
        } else {
            NOT_SET
        };

        let id_table = {
            let payload = 0u32.to_le_bytes();
            self.write_lookup_table(&payload)
        };

        let xattr_table = if self.xattr_ids.is_empty() {
            NOT_SET
        } else {
            let region_start = self.out.len() as u64;
            let encoded = self.xattr_region.encode(false);
            self.out.extend_from_slice(&encoded);

            let mut payload = Vec::new();
            for owner in &self.xattr_ids {
                payload.extend_from_slice(&self.xattr_region.ref_at(owner.offset).to_le_bytes());
                payload.extend_from_slice(&owner.count.to_le_bytes());
                payload.extend_from_slice(&owner.size.to_le_bytes());
            }
            // id records page first, then the header + page list
            let mut page_addresses = Vec::new();
            for chunk in payload.chunks(METADATA_MAXSIZE) {
                page_addresses.push(self.out.len() as u64);
                self.out.extend_from_slice(&(chunk.len() as u16 | 0x8000).to_le_bytes());
                self.out.extend_from_slice(chunk);
            }
            let header_start = self.out.len() as u64;
            self.out.extend_from_slice(&region_start.to_le_bytes());
            self.out.extend_from_slice(&(self.xattr_ids.len() as u32).to_le_bytes());
            self.out.extend_from_slice(&0u32.to_le_bytes());
            for address in page_addresses {
                self.out.extend_from_slice(&address.to_le_bytes());
            }
            header_start
        };

        let bytes_used = self.out.len() as u64;

        let mut flags = 0u16;
        if with_export_table {
            flags |= FLAG_NFS_EXPORT;
        }

        let mut superblock = Vec::with_capacity(96);
        superblock.extend_from_slice(b"hsqs");
        superblock.extend_from_slice(&self.inode_count.to_le_bytes());
        superblock.extend_from_slice(&0u32.to_le_bytes()); // mod time
        superblock.extend_from_slice(&self.block_size.to_le_bytes());
        superblock.extend_from_slice(&(self.fragments.len() as u32).to_le_bytes());
        superblock.extend_from_slice(&1u16.to_le_bytes()); // gzip
        superblock.extend_from_slice(&(self.block_size.trailing_zeros() as u16).to_le_bytes());
        superblock.extend_from_slice(&flags.to_le_bytes());
        superblock.extend_from_slice(&1u16.to_le_bytes()); // id count
        superblock.extend_from_slice(&4u16.to_le_bytes());
        superblock.extend_from_slice(&0u16.to_le_bytes());
        superblock.extend_from_slice(&root_ref.to_le_bytes());
        superblock.extend_from_slice(&bytes_used.to_le_bytes());
        superblock.extend_from_slice(&id_table.to_le_bytes());
        superblock.extend_from_slice(&xattr_table.to_le_bytes());
        superblock.extend_from_slice(&inode_table.to_le_bytes());
        superblock.extend_from_slice(&dir_table.to_le_bytes());
        superblock.extend_from_slice(&frag_table.to_le_bytes());
        superblock.extend_from_slice(&export_table.to_le_bytes());
        assert_eq!(superblock.len(), 96);
        self.out[..96].copy_from_slice(&superblock);

        self.out
    }
}
