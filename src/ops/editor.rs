#![forbid(unsafe_code)]

use tracing::trace;

use super::{
    AddLeafEntry, AddNonLeafEntries, AppendRecord, BucketInit, ClusterInit, DecrementCounter,
    DeleteRecord, IncrementCounter, Mutation, PageOperation, RemoveLeafEntry, ReplaceRecord,
    SetNextPage, SetPrevPage, SetRecordLong, ShrinkNonLeafEntries, SwitchBucketLayout,
};
use crate::page::{self, Bucket, BucketLayout, ClusterPage, KeyCodec, NonLeafEntry};
use crate::types::{PageKey, Result, SombraError};

/// Mutates one page while capturing an operation record for every change.
///
/// Each method reads the inverse parameters from the current page image,
/// applies the forward mutation through the record's own `redo`, and queues
/// the record. A failed mutation leaves both the page and the queue
/// untouched.
pub struct PageEditor<'a> {
    key: PageKey,
    page: &'a mut [u8],
    ops: Vec<PageOperation>,
}

impl<'a> PageEditor<'a> {
    /// Starts editing `page`, which is identified by `key`.
    pub fn new(key: PageKey, page: &'a mut [u8]) -> Self {
        Self {
            key,
            page,
            ops: Vec::new(),
        }
    }

    /// Identity of the page being edited.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Current page image.
    pub fn page(&self) -> &[u8] {
        self.page
    }

    /// Records captured so far, in application order.
    pub fn operations(&self) -> &[PageOperation] {
        &self.ops
    }

    /// Finishes editing and returns the captured records.
    pub fn into_operations(self) -> Vec<PageOperation> {
        self.ops
    }

    fn apply(&mut self, mutation: impl Into<Mutation>) -> Result<()> {
        let op = PageOperation::new(self.key, mutation);
        op.redo(self.page)?;
        trace!(page = %self.key, op = op.operation_type().name(), "page_editor.apply");
        self.ops.push(op);
        Ok(())
    }

    fn cluster(&self) -> Result<ClusterPage<&[u8]>> {
        ClusterPage::open(&*self.page)
    }

    fn bucket(&self) -> Result<Bucket<&[u8]>> {
        Bucket::open(&*self.page)
    }

    /// Formats the page as an empty cluster page.
    pub fn init_cluster(&mut self) -> Result<()> {
        self.apply(ClusterInit)
    }

    /// Stores a record and returns the position it landed in.
    ///
    /// With `requested` set the record goes exactly there, and the slot must
    /// be free. Otherwise the first free slot is used.
    pub fn append_record(
        &mut self,
        version: u32,
        payload: &[u8],
        requested: Option<u32>,
    ) -> Result<u32> {
        let cluster = self.cluster()?;
        let position = match requested {
            Some(u32::MAX) => return Err(SombraError::Invalid("position out of range")),
            Some(position) if cluster.record(position)?.is_some() => {
                return Err(SombraError::Invalid("requested position is occupied"))
            }
            Some(position) => position,
            None => cluster.first_free_position(),
        };
        self.apply(AppendRecord {
            version,
            payload: payload.to_vec(),
            requested,
            position,
        })?;
        Ok(position)
    }

    /// Removes the record at `position`.
    pub fn delete_record(&mut self, position: u32) -> Result<()> {
        let old = self
            .cluster()?
            .record(position)?
            .map(|r| (r.version, r.payload.to_vec()))
            .ok_or(SombraError::NotFound)?;
        self.apply(DeleteRecord {
            position,
            old_version: old.0,
            old_payload: old.1,
        })
    }

    /// Overwrites the record at `position`.
    pub fn replace_record(&mut self, position: u32, version: u32, payload: &[u8]) -> Result<()> {
        let (old_version, old_payload) = self
            .cluster()?
            .record(position)?
            .map(|r| (r.version, r.payload.to_vec()))
            .ok_or(SombraError::NotFound)?;
        self.apply(ReplaceRecord {
            position,
            new_version: version,
            new_payload: payload.to_vec(),
            old_version,
            old_payload,
        })
    }

    /// Overwrites an i64 at `offset` within the payload at `position`.
    pub fn set_record_long(&mut self, position: u32, offset: u32, value: i64) -> Result<()> {
        let old = self.cluster()?.read_long(position, offset)?;
        self.apply(SetRecordLong {
            position,
            offset,
            new: value,
            old,
        })
    }

    /// Points the page at its next sibling.
    pub fn set_next_page(&mut self, next: u64) -> Result<()> {
        let old = page::next_page(self.page)?;
        self.apply(SetNextPage { new: next, old })
    }

    /// Points the page at its previous sibling.
    pub fn set_prev_page(&mut self, prev: u64) -> Result<()> {
        let old = page::prev_page(self.page)?;
        self.apply(SetPrevPage { new: prev, old })
    }

    /// Formats the page as an empty bucket.
    pub fn init_bucket(&mut self, is_leaf: bool) -> Result<()> {
        self.apply(BucketInit { is_leaf })
    }

    /// Inserts a leaf entry at `index` with the given starting counter.
    pub fn add_leaf_entry(
        &mut self,
        index: u32,
        key: &[u8],
        value: &[u8],
        counter: u32,
    ) -> Result<()> {
        let prior_size = self.bucket()?.size();
        if index > prior_size {
            return Err(SombraError::Invalid("bucket index out of range"));
        }
        self.apply(AddLeafEntry {
            index,
            prior_size,
            counter,
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Removes the leaf entry at `index`.
    pub fn remove_leaf_entry(&mut self, index: u32) -> Result<()> {
        let bucket = self.bucket()?;
        let prior_size = bucket.size();
        let entry = bucket.leaf_entry(index)?;
        let rec = RemoveLeafEntry {
            index,
            prior_size,
            counter: entry.counter,
            key: entry.key.to_vec(),
            value: entry.value.to_vec(),
        };
        self.apply(rec)
    }

    /// Adds one to the counter of the leaf entry at `index`.
    pub fn increment_counter(&mut self, index: u32) -> Result<()> {
        self.apply(IncrementCounter { index })
    }

    /// Subtracts one from the counter of the leaf entry at `index`.
    pub fn decrement_counter(&mut self, index: u32) -> Result<()> {
        self.apply(DecrementCounter { index })
    }

    /// Appends separator entries to a non-leaf bucket.
    pub fn add_non_leaf_entries(
        &mut self,
        entries: Vec<NonLeafEntry>,
        key_codec: KeyCodec,
    ) -> Result<()> {
        for entry in &entries {
            key_codec
                .check(&entry.key)
                .map_err(|_| SombraError::Invalid("key does not match codec"))?;
        }
        let size = self.bucket()?.size() as usize;
        let new_size = u32::try_from(size + entries.len())
            .map_err(|_| SombraError::Invalid("too many bucket entries"))?;
        self.apply(AddNonLeafEntries {
            new_size,
            key_codec,
            entries,
        })
    }

    /// Cuts a non-leaf bucket down to `new_size` entries.
    pub fn shrink_non_leaf_entries(&mut self, new_size: u32, key_codec: KeyCodec) -> Result<()> {
        let bucket = self.bucket()?;
        if new_size > bucket.size() {
            return Err(SombraError::Invalid("shrink beyond bucket size"));
        }
        let removed = bucket.non_leaf_entries(new_size)?;
        for entry in &removed {
            key_codec
                .check(&entry.key)
                .map_err(|_| SombraError::Invalid("key does not match codec"))?;
        }
        self.apply(ShrinkNonLeafEntries {
            new_size,
            key_codec,
            removed,
        })
    }

    /// Rewrites the bucket layout tag.
    pub fn switch_layout(&mut self, to: BucketLayout) -> Result<()> {
        let from = self.bucket()?.layout()?;
        self.apply(SwitchBucketLayout { from, to })
    }
}
