//! Bounded cache of decoded blocks
//!
//! Both metablocks and datablocks are decoded through an [`ExtractCache`]
//! keyed by their on-disk address. Decoded bytes are handed out as `Arc`
//! handles: eviction only drops the cache's own reference, so a block stays
//! alive for as long as any reader still holds it.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::trace;

use crate::error::SquashfsError;

pub(crate) struct ExtractCache {
    blocks: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ExtractCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            blocks: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Decoded block for `address`, decoding at most once per address.
    ///
    /// The whole operation holds the cache lock, which serializes concurrent
    /// decodes; in practice concurrent clients target different addresses.
    pub fn get<F>(
        &self,
        address: u64,
        input_size: usize,
        decode: F,
    ) -> Result<Arc<Vec<u8>>, SquashfsError>
    where
        F: FnOnce() -> Result<Vec<u8>, SquashfsError>,
    {
        if input_size == 0 {
            return Err(SquashfsError::Corrupt);
        }

        let mut blocks = self.blocks.lock().unwrap();
        if let Some(block) = blocks.get(&address) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(address, input_size, "decoding block");
        let block = Arc::new(decode()?);
        blocks.put(address, block.clone());
        Ok(block)
    }

    /// Number of cache hits, for instrumentation
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of decoder invocations, for instrumentation
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_once_per_address() {
        let cache = ExtractCache::new(4);
        for _ in 0..10 {
            let block = cache.get(0x40, 8, || Ok(vec![1, 2, 3])).unwrap();
            assert_eq!(&*block, &[1, 2, 3]);
        }
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 9);
    }

    #[test]
    fn evicted_blocks_stay_alive_while_held() {
        let cache = ExtractCache::new(1);
        let held = cache.get(0, 8, || Ok(vec![0xaa; 16])).unwrap();
        // push the first entry out
        let _ = cache.get(1, 8, || Ok(vec![0xbb; 16])).unwrap();
        assert_eq!(held[0], 0xaa);
        // re-reading the evicted address decodes again
        let _ = cache.get(0, 8, || Ok(vec![0xaa; 16])).unwrap();
        assert_eq!(cache.misses(), 3);
    }

    #[test]
    fn zero_sized_region_is_corrupt() {
        let cache = ExtractCache::new(4);
        assert!(matches!(
            cache.get(0, 0, || Ok(vec![])),
            Err(SquashfsError::Corrupt)
        ));
    }
}
