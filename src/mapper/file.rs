//! Local file sources

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use crate::error::SquashfsError;
use crate::mapper::{Mapper, Mapping};

/// Maps a local image file.
///
/// With the `mmap` feature the whole file is memory-mapped once and every
/// [`Mapper::map`] is a slice of it; page faults do the actual I/O. Without
/// the feature, requests are served by positioned reads.
pub struct FileMapper {
    #[cfg(feature = "mmap")]
    map: memmap2::Mmap,
    #[cfg(not(feature = "mmap"))]
    file: std::sync::Mutex<fs::File>,
    size: u64,
}

impl FileMapper {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SquashfsError> {
        let file = fs::File::open(path)?;
        let size = file.metadata()?.len();
        #[cfg(feature = "mmap")]
        {
            // Safety: the mapping is read-only and the archive contract says
            // the image must not be mutated while it is open.
            let map = unsafe { memmap2::Mmap::map(&file)? };
            Ok(Self { map, size })
        }
        #[cfg(not(feature = "mmap"))]
        {
            Ok(Self { file: std::sync::Mutex::new(file), size })
        }
    }
}

impl Mapper for FileMapper {
    fn size(&self) -> u64 {
        self.size
    }

    #[cfg(feature = "mmap")]
    fn map(&self, address: u64, size: usize) -> Result<Mapping<'_>, SquashfsError> {
        let start = usize::try_from(address).map_err(|_| SquashfsError::OutOfBounds)?;
        let end = start.checked_add(size).ok_or(SquashfsError::Corrupt)?;
        if end > self.map.len() {
            return Err(SquashfsError::OutOfBounds);
        }
        Ok(Mapping::new(address, Cow::Borrowed(&self.map[start..])))
    }

    #[cfg(not(feature = "mmap"))]
    fn map(&self, address: u64, size: usize) -> Result<Mapping<'_>, SquashfsError> {
        use std::io::{Read, Seek, SeekFrom};

        let end = address.checked_add(size as u64).ok_or(SquashfsError::Corrupt)?;
        if end > self.size {
            return Err(SquashfsError::OutOfBounds);
        }
        let mut buf = vec![0u8; size];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(address))?;
        file.read_exact(&mut buf)?;
        Ok(Mapping::new(address, Cow::Owned(buf)))
    }
}
