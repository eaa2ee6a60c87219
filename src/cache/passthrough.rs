#![forbid(unsafe_code)]

use std::sync::Arc;

use super::{CachedPage, PageCache, PageCacheStats, PageSource};
use crate::types::{PageKey, Result};

/// Cache that keeps nothing and forwards every call to the source.
pub struct PassthroughPageCache {
    source: Arc<dyn PageSource>,
    stats: PageCacheStats,
}

impl PassthroughPageCache {
    /// Wraps `source`.
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self {
            source,
            stats: PageCacheStats::default(),
        }
    }
}

impl PageCache for PassthroughPageCache {
    fn load(
        &mut self,
        file_id: u64,
        page_index: u64,
        check_pinned: bool,
        page_count: u32,
    ) -> Result<Option<CachedPage>> {
        self.stats.misses += 1;
        self.source
            .load(PageKey::new(file_id, page_index), check_pinned, page_count)
    }

    fn release(&mut self, page: CachedPage) {
        self.stats.forwarded_releases += 1;
        self.source.release(page);
    }

    fn release_file_pages(&mut self, _file_id: u64) {}

    fn purge(&mut self, _file_id: u64, _page_index: u64) -> Option<CachedPage> {
        None
    }

    fn reset(&mut self) {}

    fn resident(&self) -> usize {
        0
    }

    fn stats(&self) -> PageCacheStats {
        self.stats
    }
}
