#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{debug, trace};

use super::{CachedPage, PageCache, PageCacheStats, PageSource};
use crate::types::{PageKey, Result};

struct TinySlot {
    page: CachedPage,
    /// Outstanding holders. Goes negative when a holder releases a page the
    /// slot admitted without handing out; those releases are settled with the
    /// source when the slot is evicted.
    usage: i64,
    hits: u64,
}

/// Fixed number of slots; a miss takes a free slot or evicts the unpinned
/// slot with the fewest hits.
///
/// When every slot is pinned the page is returned without being cached and
/// its release goes straight to the source.
pub struct TinyPageCache {
    source: Arc<dyn PageSource>,
    slots: Vec<Option<TinySlot>>,
    stats: PageCacheStats,
}

impl TinyPageCache {
    /// Creates a cache with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(source: Arc<dyn PageSource>, capacity: usize) -> Self {
        assert!(capacity > 0, "tiny page cache needs at least one slot");
        Self {
            source,
            slots: (0..capacity).map(|_| None).collect(),
            stats: PageCacheStats::default(),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn position(&self, key: PageKey) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(s) if s.page.key() == key))
    }

    fn victim(&self) -> Option<usize> {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            return Some(free);
        }
        let mut best: Option<(usize, u64)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            if slot.usage > 0 {
                continue;
            }
            if best.map_or(true, |(_, hits)| slot.hits < hits) {
                best = Some((idx, slot.hits));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Gives the slot's page back to the source once per reference the
    /// cache still owes it.
    fn settle(&self, slot: TinySlot) {
        let owed = 1 + slot.usage.min(0).unsigned_abs();
        for _ in 1..owed {
            self.source.release(slot.page.clone());
        }
        self.source.release(slot.page);
    }
}

impl PageCache for TinyPageCache {
    fn load(
        &mut self,
        file_id: u64,
        page_index: u64,
        check_pinned: bool,
        page_count: u32,
    ) -> Result<Option<CachedPage>> {
        let key = PageKey::new(file_id, page_index);
        if let Some(idx) = self.position(key) {
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.usage += 1;
                slot.hits += 1;
                self.stats.hits += 1;
                return Ok(Some(slot.page.clone()));
            }
        }

        self.stats.misses += 1;
        let Some(page) = self.source.load(key, check_pinned, page_count)? else {
            return Ok(None);
        };
        match self.victim() {
            Some(idx) => {
                if let Some(old) = self.slots[idx].take() {
                    trace!(page = %old.page.key(), hits = old.hits, "page_cache.tiny.evict");
                    self.stats.evictions += 1;
                    self.settle(old);
                }
                self.slots[idx] = Some(TinySlot {
                    page: page.clone(),
                    usage: 1,
                    hits: 0,
                });
            }
            None => {
                debug!(page = %key, "page_cache.tiny.all_pinned");
            }
        }
        Ok(Some(page))
    }

    fn release(&mut self, page: CachedPage) {
        match self.position(page.key()) {
            Some(idx) => {
                if let Some(slot) = self.slots[idx].as_mut() {
                    slot.usage -= 1;
                }
            }
            None => {
                self.stats.forwarded_releases += 1;
                self.source.release(page);
            }
        }
    }

    fn release_file_pages(&mut self, file_id: u64) {
        for idx in 0..self.slots.len() {
            let matches = matches!(&self.slots[idx], Some(s) if s.page.file_id() == file_id);
            if !matches {
                continue;
            }
            if let Some(slot) = self.slots[idx].take() {
                assert!(
                    slot.usage <= 0,
                    "page {} still has {} holders while releasing file {}",
                    slot.page.key(),
                    slot.usage,
                    file_id
                );
                self.settle(slot);
            }
        }
    }

    fn purge(&mut self, file_id: u64, page_index: u64) -> Option<CachedPage> {
        let idx = self.position(PageKey::new(file_id, page_index))?;
        let slot = self.slots[idx].take()?;
        assert!(
            slot.usage <= 0,
            "page {} still has {} holders while purging",
            slot.page.key(),
            slot.usage
        );
        // Pay what the slot owes except the reference the caller takes over.
        for _ in 0..slot.usage.unsigned_abs() {
            self.source.release(slot.page.clone());
        }
        Some(slot.page)
    }

    fn reset(&mut self) {
        let slots: Vec<TinySlot> = self.slots.iter_mut().filter_map(Option::take).collect();
        for slot in slots {
            self.settle(slot);
        }
    }

    fn resident(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn stats(&self) -> PageCacheStats {
        self.stats
    }
}
