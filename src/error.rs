//! Errors

use std::collections::TryReserveError;
use std::{io, string};

use thiserror::Error;

use crate::compressor::Compressor;

/// Errors generated from library
#[derive(Error, Debug)]
pub enum SquashfsError {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] string::FromUtf8Error),

    #[error("string error: {0:?}")]
    StrUtf8(#[from] std::str::Utf8Error),

    #[error("corrupted or invalid squashfs image")]
    Corrupt,

    #[error("unsupported squashfs version {0}.{1}")]
    UnsupportedVersion(u16, u16),

    #[error("unsupported compression: {0:?}")]
    UnsupportedCompression(Compressor),

    #[error("read past the end of a table or the image")]
    OutOfBounds,

    #[error("decompression failed")]
    DecompressionFailed,

    #[error("no such file or directory")]
    NoSuchEntry,

    #[error("not a directory")]
    NotADirectory,

    #[error("not a file")]
    NotAFile,

    #[error("not a symlink")]
    NotASymlink,

    #[error("too many levels of symbolic links")]
    TooManySymlinks,

    #[error("directory loop detected")]
    DirectoryRecursion,

    #[error("image has no xattr table or no such xattr")]
    NoXattr,

    #[error("image has no export table")]
    NoExportTable,

    #[error("image has no fragment table")]
    NoFragmentTable,

    #[error("allocator try_reserve error")]
    TryReserveError(#[from] TryReserveError),
}

impl From<SquashfsError> for io::Error {
    fn from(value: SquashfsError) -> Self {
        use SquashfsError::*;
        match value {
            StdIo(io) => io,
            StringUtf8(_) => Self::from(io::ErrorKind::InvalidData),
            StrUtf8(_) => Self::from(io::ErrorKind::InvalidData),
            UnsupportedCompression(_) => Self::from(io::ErrorKind::Unsupported),
            UnsupportedVersion(..) => Self::from(io::ErrorKind::Unsupported),
            NoSuchEntry | NoExportTable | NoFragmentTable | NoXattr => {
                Self::from(io::ErrorKind::NotFound)
            }
            NotADirectory => Self::from(io::ErrorKind::InvalidInput),
            OutOfBounds => Self::from(io::ErrorKind::UnexpectedEof),
            Deku(_)
            | Corrupt
            | DecompressionFailed
            | NotAFile
            | NotASymlink
            | TooManySymlinks
            | DirectoryRecursion
            | TryReserveError(_) => Self::from(io::ErrorKind::InvalidData),
        }
    }
}
