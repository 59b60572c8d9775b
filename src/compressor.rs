//! Types of supported compression algorithms

#[cfg(any(feature = "gzip", feature = "xz"))]
use std::io::Read;

use deku::prelude::*;

use crate::error::SquashfsError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(id_type = "u16")]
#[repr(u16)]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzma = 2,
    Lzo =  3,
    #[default]
    Xz =   4,
    Lz4 =  5,
    Zstd = 6,
}

/// Compressor-specific options stored in the metablock following the
/// superblock when [`crate::Flags::CompressorOptionsArePresent`] is set.
///
/// The reader surfaces these without interpreting them; decompression does
/// not need them.
#[derive(Debug, DekuRead, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian, compressor: Compressor")]
#[deku(id = "compressor")]
pub enum CompressionOptions {
    #[deku(id = "Compressor::Gzip")]
    Gzip(Gzip),

    #[deku(id = "Compressor::Lzo")]
    Lzo(Lzo),

    #[deku(id = "Compressor::Xz")]
    Xz(Xz),

    #[deku(id = "Compressor::Lz4")]
    Lz4(Lz4),

    #[deku(id = "Compressor::Zstd")]
    Zstd(Zstd),

    #[deku(id = "Compressor::Lzma")]
    Lzma,
}

#[derive(Debug, DekuRead, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Gzip {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

#[derive(Debug, DekuRead, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lzo {
    pub algorithm: u32,
    pub compression_level: u32,
}

#[derive(Debug, DekuRead, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Xz {
    pub dictionary_size: u32,
    pub filters: u32,
    // present in some vendor images, ignored by the kernel and by us
    #[deku(cond = "!deku::reader.end()")]
    pub bit_opts: Option<u16>,
    #[deku(cond = "!deku::reader.end()")]
    pub fb: Option<u16>,
}

#[derive(Debug, DekuRead, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lz4 {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, DekuRead, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Zstd {
    pub compression_level: u32,
}

/// Decompression hook.
///
/// [`DefaultCompressor`] handles every algorithm the crate was built with;
/// the trait exists so a vendor-specific decoder can be substituted.
pub trait CompressionAction {
    /// Decompress `bytes` into `out`. `out` arrives empty with its capacity
    /// set to the class block size, an upper bound for any decoded block.
    fn decompress(
        &self,
        bytes: &[u8],
        out: &mut Vec<u8>,
        compressor: Compressor,
    ) -> Result<(), SquashfsError>;
}

/// Decompressor over the feature-enabled back-ends
#[derive(Copy, Clone)]
pub struct DefaultCompressor;

impl CompressionAction for DefaultCompressor {
    fn decompress(
        &self,
        bytes: &[u8],
        out: &mut Vec<u8>,
        compressor: Compressor,
    ) -> Result<(), SquashfsError> {
        match compressor {
            Compressor::None => out.extend_from_slice(bytes),
            #[cfg(feature = "gzip")]
            Compressor::Gzip => {
                let mut decoder = flate2::read::ZlibDecoder::new(bytes);
                decoder.read_to_end(out).map_err(|_| SquashfsError::DecompressionFailed)?;
            }
            #[cfg(feature = "xz")]
            Compressor::Xz => {
                let mut decoder = liblzma::read::XzDecoder::new(bytes);
                decoder.read_to_end(out).map_err(|_| SquashfsError::DecompressionFailed)?;
            }
            #[cfg(feature = "xz")]
            Compressor::Lzma => {
                let stream = liblzma::stream::Stream::new_lzma_decoder(u64::MAX)
                    .map_err(|_| SquashfsError::DecompressionFailed)?;
                let mut decoder = liblzma::read::XzDecoder::new_stream(bytes, stream);
                decoder.read_to_end(out).map_err(|_| SquashfsError::DecompressionFailed)?;
            }
            #[cfg(feature = "lzo")]
            Compressor::Lzo => {
                out.resize(out.capacity(), 0);
                let (decoded, error) = rust_lzo::LZOContext::decompress_to_slice(bytes, out);
                let decoded = decoded.len();
                out.truncate(decoded);
                if error != rust_lzo::LZOError::OK {
                    return Err(SquashfsError::DecompressionFailed);
                }
            }
            #[cfg(feature = "zstd")]
            Compressor::Zstd => {
                let mut decoder = zstd::bulk::Decompressor::new()
                    .map_err(|_| SquashfsError::DecompressionFailed)?;
                decoder
                    .decompress_to_buffer(bytes, out)
                    .map_err(|_| SquashfsError::DecompressionFailed)?;
            }
            #[cfg(feature = "lz4")]
            Compressor::Lz4 => {
                out.resize(out.capacity(), 0u8);
                let decoded = lz4_flex::decompress_into(bytes, out.as_mut_slice())
                    .map_err(|_| SquashfsError::DecompressionFailed)?;
                out.truncate(decoded);
            }
            _ => return Err(SquashfsError::UnsupportedCompression(compressor)),
        }
        Ok(())
    }
}
