#![forbid(unsafe_code)]
//! Bounded page caches sitting in front of a [`PageSource`].
//!
//! A cache hands out [`CachedPage`] handles. Every successful `load` must be
//! balanced by exactly one `release` of the same page; the cache counts those
//! holders and only gives a page back to the source once nobody holds it.
//!
//! Three strategies implement [`PageCache`]:
//!
//! * [`PassthroughPageCache`] forwards every call and caches nothing.
//! * [`TinyPageCache`] keeps a handful of slots, pinned by usage and evicted by
//!   lowest hit count.
//! * [`LruPageCache`] keeps up to a configured number of pages and evicts the
//!   least recently used unpinned ones in batches.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{PageKey, Result};

mod lru;
mod passthrough;
pub mod source;
mod tiny;

pub use self::lru::LruPageCache;
pub use passthrough::PassthroughPageCache;
pub use source::{FilePageSource, MemoryPageSource, SourceStats};
pub use tiny::TinyPageCache;

struct PageFrame {
    buf: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

/// Shared handle to one page buffer.
///
/// Clones refer to the same buffer. Writers go through [`CachedPage::write`],
/// which marks the buffer dirty so the source knows to write it back.
#[derive(Clone)]
pub struct CachedPage {
    key: PageKey,
    frame: Arc<PageFrame>,
}

impl CachedPage {
    /// Wraps a freshly loaded buffer.
    pub fn new(key: PageKey, data: Box<[u8]>) -> Self {
        Self {
            key,
            frame: Arc::new(PageFrame {
                buf: RwLock::new(data),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Identity of the page.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// File the page belongs to.
    pub fn file_id(&self) -> u64 {
        self.key.file_id
    }

    /// Index of the page within its file.
    pub fn page_index(&self) -> u64 {
        self.key.page_index
    }

    /// Shared access to the page bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.buf.read()
    }

    /// Exclusive access to the page bytes. Marks the page dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        let guard = self.frame.buf.write();
        self.frame.dirty.store(true, Ordering::Release);
        guard
    }

    /// True once the page was written since it was last marked clean.
    pub fn is_dirty(&self) -> bool {
        self.frame.dirty.load(Ordering::Acquire)
    }

    /// Clears the dirty flag after the page was persisted.
    pub fn mark_clean(&self) {
        self.frame.dirty.store(false, Ordering::Release);
    }

    /// True when both handles share one buffer.
    pub fn same_buffer(&self, other: &CachedPage) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame)
    }
}

impl fmt::Debug for CachedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedPage")
            .field("key", &self.key)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// The storage layer a cache loads pages from and releases them to.
///
/// The source counts its own holders: every `load` that returns a page must be
/// matched by one `release`.
pub trait PageSource: Send + Sync {
    /// Loads a page. `Ok(None)` means the page does not exist.
    ///
    /// `check_pinned` and `page_count` are forwarded from the caller
    /// unchanged; sources that do not track pinning or read-ahead ignore them.
    fn load(&self, key: PageKey, check_pinned: bool, page_count: u32) -> Result<Option<CachedPage>>;

    /// Drops one holder of `page`.
    fn release(&self, page: CachedPage);
}

/// Counters kept by every cache strategy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PageCacheStats {
    /// Loads served from a resident page.
    pub hits: u64,
    /// Loads that went to the source.
    pub misses: u64,
    /// Pages handed back to the source by eviction.
    pub evictions: u64,
    /// Releases of untracked pages forwarded to the source.
    pub forwarded_releases: u64,
}

/// Bounded cache of page handles.
pub trait PageCache {
    /// Returns the page, loading it from the source on a miss.
    fn load(
        &mut self,
        file_id: u64,
        page_index: u64,
        check_pinned: bool,
        page_count: u32,
    ) -> Result<Option<CachedPage>>;

    /// Loads a single page by key.
    fn load_page(&mut self, key: PageKey) -> Result<Option<CachedPage>> {
        self.load(key.file_id, key.page_index, false, 1)
    }

    /// Drops one holder of `page`.
    fn release(&mut self, page: CachedPage);

    /// Hands every cached page of `file_id` back to the source.
    ///
    /// # Panics
    ///
    /// Panics if one of those pages still has holders.
    fn release_file_pages(&mut self, file_id: u64);

    /// Removes a page from the cache without releasing it to the source.
    ///
    /// The caller takes over the cache's reference and must release the
    /// returned page to the source itself.
    ///
    /// # Panics
    ///
    /// Panics if the page still has holders.
    fn purge(&mut self, file_id: u64, page_index: u64) -> Option<CachedPage>;

    /// Releases every cached page to the source and empties the cache.
    fn reset(&mut self);

    /// Number of pages currently tracked.
    fn resident(&self) -> usize;

    /// Running counters.
    fn stats(&self) -> PageCacheStats;
}

impl<C: PageCache + ?Sized> PageCache for Box<C> {
    fn load(
        &mut self,
        file_id: u64,
        page_index: u64,
        check_pinned: bool,
        page_count: u32,
    ) -> Result<Option<CachedPage>> {
        (**self).load(file_id, page_index, check_pinned, page_count)
    }

    fn release(&mut self, page: CachedPage) {
        (**self).release(page)
    }

    fn release_file_pages(&mut self, file_id: u64) {
        (**self).release_file_pages(file_id)
    }

    fn purge(&mut self, file_id: u64, page_index: u64) -> Option<CachedPage> {
        (**self).purge(file_id, page_index)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn resident(&self) -> usize {
        (**self).resident()
    }

    fn stats(&self) -> PageCacheStats {
        (**self).stats()
    }
}
