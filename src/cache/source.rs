#![forbid(unsafe_code)]
//! Underlying page sources: an in-memory arena and page files on disk.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::{CachedPage, PageSource};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{PageKey, Result, SombraError};

/// Counters kept by the sources in this module.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SourceStats {
    /// Successful loads.
    pub loads: u64,
    /// Releases.
    pub releases: u64,
    /// Pages written back to storage.
    pub writes: u64,
}

struct Slot {
    page: CachedPage,
    pins: u32,
}

#[derive(Default)]
struct Arena {
    pages: HashMap<PageKey, Slot>,
    file_lens: HashMap<u64, u64>,
    stats: SourceStats,
}

/// Page source backed by an arena of heap buffers keyed by [`PageKey`].
///
/// Pages live until their file is deleted; loads pin them and releases unpin
/// them. Releasing a page more often than it was loaded panics.
pub struct MemoryPageSource {
    page_size: usize,
    arena: Mutex<Arena>,
}

impl MemoryPageSource {
    /// Creates an empty arena of `page_size`-byte pages.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            arena: Mutex::new(Arena::default()),
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Appends a zeroed page to `file_id` and returns its key.
    pub fn allocate(&self, file_id: u64) -> PageKey {
        let mut guard = self.arena.lock();
        let arena = &mut *guard;
        let len = arena.file_lens.entry(file_id).or_insert(0);
        let key = PageKey::new(file_id, *len);
        *len += 1;
        arena.pages.insert(
            key,
            Slot {
                page: CachedPage::new(key, vec![0u8; self.page_size].into_boxed_slice()),
                pins: 0,
            },
        );
        trace!(page = %key, "memory_source.allocate");
        key
    }

    /// Copy of the current bytes of `key`.
    pub fn snapshot(&self, key: PageKey) -> Option<Vec<u8>> {
        let arena = self.arena.lock();
        arena.pages.get(&key).map(|slot| slot.page.read().to_vec())
    }

    /// Number of holders of `key`.
    pub fn pins(&self, key: PageKey) -> u32 {
        self.arena.lock().pages.get(&key).map_or(0, |slot| slot.pins)
    }

    /// Running counters.
    pub fn stats(&self) -> SourceStats {
        self.arena.lock().stats
    }

    /// Drops every page of `file_id`. Fails if any of them is still held.
    pub fn delete_file(&self, file_id: u64) -> Result<()> {
        let mut arena = self.arena.lock();
        if arena
            .pages
            .iter()
            .any(|(key, slot)| key.file_id == file_id && slot.pins > 0)
        {
            return Err(SombraError::Invalid("file still has pinned pages"));
        }
        arena.pages.retain(|key, _| key.file_id != file_id);
        arena.file_lens.remove(&file_id);
        Ok(())
    }
}

impl PageSource for MemoryPageSource {
    fn load(
        &self,
        key: PageKey,
        _check_pinned: bool,
        _page_count: u32,
    ) -> Result<Option<CachedPage>> {
        let mut guard = self.arena.lock();
        let arena = &mut *guard;
        let Some(slot) = arena.pages.get_mut(&key) else {
            return Ok(None);
        };
        slot.pins += 1;
        arena.stats.loads += 1;
        Ok(Some(slot.page.clone()))
    }

    fn release(&self, page: CachedPage) {
        let mut guard = self.arena.lock();
        let arena = &mut *guard;
        let key = page.key();
        let slot = arena
            .pages
            .get_mut(&key)
            .unwrap_or_else(|| panic!("release of unknown page {key}"));
        assert!(slot.pins > 0, "page {key} released without a matching load");
        slot.pins -= 1;
        arena.stats.releases += 1;
    }
}

struct FrameTable {
    frames: HashMap<PageKey, Slot>,
    stats: SourceStats,
}

/// Page source reading fixed-size pages from registered files.
///
/// Loaded pages stay resident while they have holders. Clean pages are
/// dropped on their last release; dirty ones stay until [`FilePageSource::flush`]
/// writes them back.
pub struct FilePageSource {
    page_size: usize,
    files: RwLock<HashMap<u64, Arc<dyn FileIo>>>,
    table: Mutex<FrameTable>,
}

impl FilePageSource {
    /// Creates a source with no files.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            files: RwLock::new(HashMap::new()),
            table: Mutex::new(FrameTable {
                frames: HashMap::new(),
                stats: SourceStats::default(),
            }),
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Makes `io` available as `file_id`.
    pub fn register_file(&self, file_id: u64, io: Arc<dyn FileIo>) {
        self.files.write().insert(file_id, io);
    }

    /// Opens (or creates) the file at `path` and registers it as `file_id`.
    pub fn open_file(&self, file_id: u64, path: impl AsRef<Path>) -> Result<()> {
        let io = StdFileIo::open(path)?;
        self.register_file(file_id, Arc::new(io));
        Ok(())
    }

    fn file(&self, file_id: u64) -> Result<Arc<dyn FileIo>> {
        self.files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or(SombraError::NotFound)
    }

    fn offset(&self, page_index: u64) -> Result<u64> {
        page_index
            .checked_mul(self.page_size as u64)
            .ok_or(SombraError::Invalid("page offset overflow"))
    }

    /// Number of whole pages stored in `file_id`.
    pub fn page_count(&self, file_id: u64) -> Result<u64> {
        Ok(self.file(file_id)?.len()? / self.page_size as u64)
    }

    /// Appends a zeroed page to `file_id` and returns its key.
    pub fn allocate_page(&self, file_id: u64) -> Result<PageKey> {
        let io = self.file(file_id)?;
        let index = io.len()? / self.page_size as u64;
        io.write_at(self.offset(index)?, &vec![0u8; self.page_size])?;
        Ok(PageKey::new(file_id, index))
    }

    /// Number of holders of `key`.
    pub fn pins(&self, key: PageKey) -> u32 {
        self.table.lock().frames.get(&key).map_or(0, |slot| slot.pins)
    }

    /// Running counters.
    pub fn stats(&self) -> SourceStats {
        self.table.lock().stats
    }

    /// Writes every dirty page back, syncs the touched files and retires
    /// pages nobody holds. Returns the number of pages written.
    pub fn flush(&self) -> Result<usize> {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        let mut touched = HashSet::new();
        let mut written = 0;
        for (key, slot) in table.frames.iter() {
            if !slot.page.is_dirty() {
                continue;
            }
            let io = self.file(key.file_id)?;
            io.write_at(self.offset(key.page_index)?, &slot.page.read())?;
            slot.page.mark_clean();
            touched.insert(key.file_id);
            written += 1;
        }
        for file_id in &touched {
            self.file(*file_id)?.sync_all()?;
        }
        table.stats.writes += written as u64;
        table.frames.retain(|_, slot| slot.pins > 0);
        debug!(pages = written, files = touched.len(), "file_source.flush");
        Ok(written)
    }
}

impl PageSource for FilePageSource {
    fn load(
        &self,
        key: PageKey,
        _check_pinned: bool,
        _page_count: u32,
    ) -> Result<Option<CachedPage>> {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        if let Some(slot) = table.frames.get_mut(&key) {
            slot.pins += 1;
            table.stats.loads += 1;
            return Ok(Some(slot.page.clone()));
        }
        let Some(io) = self.files.read().get(&key.file_id).cloned() else {
            return Ok(None);
        };
        let off = self.offset(key.page_index)?;
        if off.saturating_add(self.page_size as u64) > io.len()? {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.page_size];
        io.read_at(off, &mut buf)?;
        let page = CachedPage::new(key, buf.into_boxed_slice());
        table.frames.insert(
            key,
            Slot {
                page: page.clone(),
                pins: 1,
            },
        );
        table.stats.loads += 1;
        trace!(page = %key, "file_source.read");
        Ok(Some(page))
    }

    fn release(&self, page: CachedPage) {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        let key = page.key();
        let slot = table
            .frames
            .get_mut(&key)
            .unwrap_or_else(|| panic!("release of unknown page {key}"));
        assert!(slot.pins > 0, "page {key} released without a matching load");
        slot.pins -= 1;
        table.stats.releases += 1;
        if slot.pins == 0 && !slot.page.is_dirty() {
            table.frames.remove(&key);
        }
    }
}
