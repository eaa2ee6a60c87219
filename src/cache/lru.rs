#![forbid(unsafe_code)]

use std::sync::Arc;

use ::lru::LruCache;
use tracing::{debug, trace};

use super::{CachedPage, PageCache, PageCacheStats, PageSource};
use crate::types::{PageKey, Result};

struct LruEntry {
    page: CachedPage,
    usage: u32,
}

/// Recency-ordered cache with batched eviction.
///
/// A miss that finds `capacity` or more pages resident first evicts up to
/// `eviction_batch` unpinned pages, least recently used first. If every
/// resident page is pinned the new page is admitted anyway, so the cache can
/// temporarily hold more than `capacity` pages. Once it holds more than
/// `capacity + eviction_batch`, the release that unpins a page evicts down to
/// that bound again.
pub struct LruPageCache {
    source: Arc<dyn PageSource>,
    pages: LruCache<PageKey, LruEntry>,
    capacity: usize,
    eviction_batch: usize,
    stats: PageCacheStats,
}

impl LruPageCache {
    /// Creates a cache that starts evicting at `capacity` pages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `eviction_batch` is zero.
    pub fn new(source: Arc<dyn PageSource>, capacity: usize, eviction_batch: usize) -> Self {
        assert!(capacity > 0, "lru page cache capacity must be positive");
        assert!(eviction_batch > 0, "lru eviction batch must be positive");
        Self {
            source,
            pages: LruCache::unbounded(),
            capacity,
            eviction_batch,
            stats: PageCacheStats::default(),
        }
    }

    /// Soft capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most pages evicted by one eviction pass.
    pub fn eviction_batch(&self) -> usize {
        self.eviction_batch
    }

    /// Holders of a cached page, or `None` if the page is not resident.
    pub fn usage(&self, file_id: u64, page_index: u64) -> Option<u32> {
        self.pages
            .peek(&PageKey::new(file_id, page_index))
            .map(|entry| entry.usage)
    }

    fn unpinned_lru_first(&self, limit: usize) -> Vec<PageKey> {
        self.pages
            .iter()
            .rev()
            .filter(|(_, entry)| entry.usage == 0)
            .map(|(key, _)| *key)
            .take(limit)
            .collect()
    }

    fn evict(&mut self, victims: Vec<PageKey>) -> usize {
        let mut evicted = 0;
        for key in victims {
            if let Some(entry) = self.pages.pop(&key) {
                trace!(page = %key, "page_cache.lru.evict");
                self.source.release(entry.page);
                evicted += 1;
            }
        }
        self.stats.evictions += evicted as u64;
        evicted
    }

    fn make_room(&mut self) {
        let victims = self.unpinned_lru_first(self.eviction_batch);
        if victims.is_empty() {
            debug!(
                resident = self.pages.len(),
                capacity = self.capacity,
                "page_cache.lru.all_pinned"
            );
            return;
        }
        self.evict(victims);
    }

    fn shrink_to_bound(&mut self) {
        let bound = self.capacity + self.eviction_batch;
        let excess = self.pages.len().saturating_sub(bound);
        if excess > 0 {
            let victims = self.unpinned_lru_first(excess);
            let evicted = self.evict(victims);
            debug!(evicted, resident = self.pages.len(), "page_cache.lru.shrink");
        }
    }
}

impl PageCache for LruPageCache {
    fn load(
        &mut self,
        file_id: u64,
        page_index: u64,
        check_pinned: bool,
        page_count: u32,
    ) -> Result<Option<CachedPage>> {
        let key = PageKey::new(file_id, page_index);
        if let Some(entry) = self.pages.get_mut(&key) {
            entry.usage += 1;
            self.stats.hits += 1;
            return Ok(Some(entry.page.clone()));
        }

        self.stats.misses += 1;
        let Some(page) = self.source.load(key, check_pinned, page_count)? else {
            return Ok(None);
        };
        if self.pages.len() >= self.capacity {
            self.make_room();
        }
        self.pages.put(
            key,
            LruEntry {
                page: page.clone(),
                usage: 1,
            },
        );
        Ok(Some(page))
    }

    fn release(&mut self, page: CachedPage) {
        let key = page.key();
        let Some(entry) = self.pages.peek_mut(&key) else {
            self.stats.forwarded_releases += 1;
            self.source.release(page);
            return;
        };
        assert!(
            entry.usage > 0,
            "page {key} released more times than it was loaded"
        );
        entry.usage -= 1;
        if entry.usage == 0 {
            self.shrink_to_bound();
        }
    }

    fn release_file_pages(&mut self, file_id: u64) {
        let keys: Vec<PageKey> = self
            .pages
            .iter()
            .filter(|(key, _)| key.file_id == file_id)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(entry) = self.pages.pop(&key) {
                assert!(
                    entry.usage == 0,
                    "page {key} still has {} holders while releasing file {file_id}",
                    entry.usage
                );
                self.source.release(entry.page);
            }
        }
    }

    fn purge(&mut self, file_id: u64, page_index: u64) -> Option<CachedPage> {
        let key = PageKey::new(file_id, page_index);
        let entry = self.pages.pop(&key)?;
        assert!(
            entry.usage == 0,
            "page {key} still has {} holders while purging",
            entry.usage
        );
        Some(entry.page)
    }

    fn reset(&mut self) {
        while let Some((_, entry)) = self.pages.pop_lru() {
            self.source.release(entry.page);
        }
    }

    fn resident(&self) -> usize {
        self.pages.len()
    }

    fn stats(&self) -> PageCacheStats {
        self.stats
    }
}
