//! HTTP range-request sources

use std::borrow::Cow;
use std::io::Read;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::trace;

use crate::error::SquashfsError;
use crate::mapper::{Mapper, Mapping};

/// Maps an image served over HTTP with `Range` request support.
///
/// Fetches are performed with block granularity and recently fetched blocks
/// are kept in a bounded cache, so sequential readers do not re-download.
pub struct HttpMapper {
    agent: ureq::Agent,
    url: String,
    size: u64,
    block_size: usize,
    blocks: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
}

impl HttpMapper {
    pub fn new(url: &str, block_size: usize, lru_size: usize) -> Result<Self, SquashfsError> {
        let agent = ureq::agent();
        let response = agent
            .head(url)
            .call()
            .map_err(|e| SquashfsError::StdIo(std::io::Error::other(e)))?;
        let size = response
            .header("content-length")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(SquashfsError::OutOfBounds)?;
        trace!(size, url, "remote image");

        let capacity = NonZeroUsize::new(lru_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            agent,
            url: url.to_string(),
            size,
            block_size: block_size.max(1),
            blocks: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Override the size reported by the server, e.g. for servers that do not
    /// answer HEAD requests correctly.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    fn fetch_block(&self, index: u64) -> Result<Arc<Vec<u8>>, SquashfsError> {
        if let Some(block) = self.blocks.lock().unwrap().get(&index) {
            return Ok(block.clone());
        }

        let start = index * self.block_size as u64;
        let end = (start + self.block_size as u64).min(self.size) - 1;
        trace!(index, start, end, "fetching block");
        let response = self
            .agent
            .get(&self.url)
            .set("Range", &format!("bytes={start}-{end}"))
            .call()
            .map_err(|e| SquashfsError::StdIo(std::io::Error::other(e)))?;

        let expected = (end - start + 1) as usize;
        let mut body = Vec::with_capacity(expected);
        response.into_reader().take(expected as u64).read_to_end(&mut body)?;
        if body.len() != expected {
            return Err(SquashfsError::OutOfBounds);
        }

        let block = Arc::new(body);
        self.blocks.lock().unwrap().put(index, block.clone());
        Ok(block)
    }
}

impl Mapper for HttpMapper {
    fn size(&self) -> u64 {
        self.size
    }

    fn map(&self, address: u64, size: usize) -> Result<Mapping<'_>, SquashfsError> {
        let end = address.checked_add(size as u64).ok_or(SquashfsError::Corrupt)?;
        if end > self.size {
            return Err(SquashfsError::OutOfBounds);
        }

        // assemble the requested range from block-granular fetches, returning
        // the whole block-aligned span as the window
        let block_size = self.block_size as u64;
        let first = address / block_size;
        let last = if size == 0 { first } else { (end - 1) / block_size };
        let mut data = Vec::with_capacity(((last - first + 1) * block_size) as usize);
        for index in first..=last {
            let block = self.fetch_block(index)?;
            data.extend_from_slice(&block);
        }
        Ok(Mapping::new(first * block_size, Cow::Owned(data)))
    }
}
