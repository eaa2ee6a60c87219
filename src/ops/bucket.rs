#![forbid(unsafe_code)]
//! Records mutating tree buckets.

use std::convert::TryFrom;
use std::fmt;

use super::{apply_all_or_nothing, OperationType, Replay};
use crate::page::{Bucket, BucketLayout, KeyCodec, NonLeafEntry};
use crate::primitives::bytes::{buf::Cursor, out};
use crate::types::{Result, SombraError};

fn bucket(page: &mut [u8]) -> Result<Bucket<&mut [u8]>> {
    Bucket::open(page)
}

/// Formats a page as an empty leaf or non-leaf bucket. Undo is a no-op.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BucketInit {
    /// Whether the new bucket is a leaf.
    pub is_leaf: bool,
}

impl Replay for BucketInit {
    const TYPE: OperationType = OperationType::BucketInit;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        Bucket::init(page, self.is_leaf).map(|_| ())
    }

    fn undo(&self, _page: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn body_len(&self) -> usize {
        1
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u8(dst, u8::from(self.is_leaf));
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        match cur.u8()? {
            0 => Ok(Self { is_leaf: false }),
            1 => Ok(Self { is_leaf: true }),
            _ => Err(SombraError::Corruption("invalid leaf flag")),
        }
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " leaf={}", self.is_leaf)
    }
}

/// Fields shared by leaf entry insertion and removal.
fn leaf_body_len(key: &[u8], value: &[u8]) -> usize {
    4 + 4 + 4 + out::bytes_len(key.len()) + out::bytes_len(value.len())
}

/// Inserts `entry` when the bucket is in its pre-insert state, does nothing
/// when it is already in its post-insert state.
fn guarded_insert(
    page: &mut [u8],
    index: u32,
    size_without: u32,
    counter: u32,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    let mut bucket = bucket(page)?;
    let size = bucket.size();
    if size == size_without {
        bucket.insert_leaf_entry(index, counter, key, value)
    } else if Some(size) == size_without.checked_add(1) {
        Ok(())
    } else {
        Err(SombraError::Corruption("bucket size does not match record"))
    }
}

/// Removes the entry at `index` when the bucket is in its pre-remove state,
/// does nothing when it is already in its post-remove state.
fn guarded_remove(page: &mut [u8], index: u32, size_with: u32) -> Result<()> {
    let mut bucket = bucket(page)?;
    let size = bucket.size();
    if size == size_with {
        bucket.remove_entry(index)
    } else if Some(size) == size_with.checked_sub(1) {
        Ok(())
    } else {
        Err(SombraError::Corruption("bucket size does not match record"))
    }
}

/// Inserts a leaf entry at `index`.
///
/// `prior_size` is the bucket size before the insert; redo skips the insert
/// when the bucket already holds one more entry than that.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddLeafEntry {
    /// Position of the new entry.
    pub index: u32,
    /// Bucket size before the insert.
    pub prior_size: u32,
    /// Initial counter.
    pub counter: u32,
    /// Entry key.
    pub key: Vec<u8>,
    /// Entry value.
    pub value: Vec<u8>,
}

impl Replay for AddLeafEntry {
    const TYPE: OperationType = OperationType::AddLeafEntry;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        guarded_insert(
            page,
            self.index,
            self.prior_size,
            self.counter,
            &self.key,
            &self.value,
        )
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        let size_with = self
            .prior_size
            .checked_add(1)
            .ok_or(SombraError::Corruption("bucket size overflow"))?;
        guarded_remove(page, self.index, size_with)
    }

    fn body_len(&self) -> usize {
        leaf_body_len(&self.key, &self.value)
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u32(dst, self.index);
        out::u32(dst, self.prior_size);
        out::u32(dst, self.counter);
        out::bytes(dst, &self.key);
        out::bytes(dst, &self.value);
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            index: cur.u32()?,
            prior_size: cur.u32()?,
            counter: cur.u32()?,
            key: cur.bytes()?,
            value: cur.bytes()?,
        })
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " index={} size={}->{} counter={} key={} value={}",
            self.index,
            self.prior_size,
            u64::from(self.prior_size) + 1,
            self.counter,
            hex::encode(&self.key),
            hex::encode(&self.value)
        )
    }
}

/// Removes the leaf entry at `index`, keeping its content for undo.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoveLeafEntry {
    /// Position of the removed entry.
    pub index: u32,
    /// Bucket size before the removal.
    pub prior_size: u32,
    /// Counter of the removed entry.
    pub counter: u32,
    /// Key of the removed entry.
    pub key: Vec<u8>,
    /// Value of the removed entry.
    pub value: Vec<u8>,
}

impl Replay for RemoveLeafEntry {
    const TYPE: OperationType = OperationType::RemoveLeafEntry;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        guarded_remove(page, self.index, self.prior_size)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        let size_without = self
            .prior_size
            .checked_sub(1)
            .ok_or(SombraError::Corruption("remove from empty bucket"))?;
        guarded_insert(
            page,
            self.index,
            size_without,
            self.counter,
            &self.key,
            &self.value,
        )
    }

    fn body_len(&self) -> usize {
        leaf_body_len(&self.key, &self.value)
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u32(dst, self.index);
        out::u32(dst, self.prior_size);
        out::u32(dst, self.counter);
        out::bytes(dst, &self.key);
        out::bytes(dst, &self.value);
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            index: cur.u32()?,
            prior_size: cur.u32()?,
            counter: cur.u32()?,
            key: cur.bytes()?,
            value: cur.bytes()?,
        })
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " index={} size={}->{} counter={} key={} value={}",
            self.index,
            self.prior_size,
            i64::from(self.prior_size) - 1,
            self.counter,
            hex::encode(&self.key),
            hex::encode(&self.value)
        )
    }
}

fn adjust_counter(page: &mut [u8], index: u32, delta: i8) -> Result<()> {
    let mut bucket = bucket(page)?;
    let current = bucket.leaf_entry(index)?.counter;
    let next = if delta >= 0 {
        current
            .checked_add(delta.unsigned_abs().into())
            .ok_or(SombraError::Corruption("leaf counter overflow"))?
    } else {
        current
            .checked_sub(delta.unsigned_abs().into())
            .ok_or(SombraError::Corruption("leaf counter underflow"))?
    };
    bucket.set_counter(index, next)
}

macro_rules! counter_record {
    ($(#[$doc:meta])* $name:ident, $redo:expr, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct $name {
            /// Leaf entry whose counter changes.
            pub index: u32,
        }

        impl Replay for $name {
            const TYPE: OperationType = OperationType::$name;

            fn redo(&self, page: &mut [u8]) -> Result<()> {
                adjust_counter(page, self.index, $redo)
            }

            fn undo(&self, page: &mut [u8]) -> Result<()> {
                adjust_counter(page, self.index, -$redo)
            }

            fn body_len(&self) -> usize {
                4
            }

            fn encode_body(&self, dst: &mut Vec<u8>) {
                out::u32(dst, self.index);
            }

            fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
                Ok(Self { index: cur.u32()? })
            }

            fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(" index={} ", $label), self.index)
            }
        }
    };
}

counter_record!(
    /// Adds one to a leaf entry counter. Redo is not idempotent.
    IncrementCounter,
    1,
    "+1"
);
counter_record!(
    /// Subtracts one from a leaf entry counter. Redo is not idempotent.
    DecrementCounter,
    -1,
    "-1"
);

fn entries_body_len(entries: &[NonLeafEntry]) -> usize {
    4 + entries
        .iter()
        .map(|e| 8 + 8 + out::bytes_len(e.key.len()))
        .sum::<usize>()
}

fn encode_entries(dst: &mut Vec<u8>, entries: &[NonLeafEntry]) {
    out::u32(dst, entries.len() as u32);
    for entry in entries {
        out::u64(dst, entry.left);
        out::u64(dst, entry.right);
        out::bytes(dst, &entry.key);
    }
}

fn decode_entries(cur: &mut Cursor<'_>, codec: KeyCodec) -> Result<Vec<NonLeafEntry>> {
    let count = cur.u32()? as usize;
    // Each entry needs at least its two pointers and a length prefix.
    if count > cur.remaining() / 20 {
        return Err(SombraError::Corruption("entry count exceeds record"));
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let left = cur.u64()?;
        let right = cur.u64()?;
        let key = cur.bytes()?;
        codec.check(&key)?;
        entries.push(NonLeafEntry { left, right, key });
    }
    Ok(entries)
}

fn describe_entries(
    f: &mut fmt::Formatter<'_>,
    codec: KeyCodec,
    entries: &[NonLeafEntry],
) -> fmt::Result {
    f.write_str(" [")?;
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(
            f,
            "{}<{}>{}",
            entry.left,
            codec.display(&entry.key),
            entry.right
        )?;
    }
    f.write_str("]")
}

fn base_size(new_size: u32, added: usize) -> Result<u32> {
    u32::try_from(added)
        .ok()
        .and_then(|n| new_size.checked_sub(n))
        .ok_or(SombraError::Corruption("entry run longer than bucket"))
}

fn truncate_to(bucket: &mut Bucket<&mut [u8]>, len: u32) -> Result<()> {
    if bucket.size() < len {
        return Err(SombraError::Corruption("bucket smaller than record expects"));
    }
    bucket.truncate(len)
}

/// Appends a run of non-leaf entries so the bucket ends with `new_size`
/// entries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddNonLeafEntries {
    /// Bucket size after the append.
    pub new_size: u32,
    /// How the separator keys are encoded.
    pub key_codec: KeyCodec,
    /// Appended entries, in order.
    pub entries: Vec<NonLeafEntry>,
}

impl Replay for AddNonLeafEntries {
    const TYPE: OperationType = OperationType::AddNonLeafEntries;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        let base = base_size(self.new_size, self.entries.len())?;
        apply_all_or_nothing(page, |scratch| {
            let mut bucket = bucket(scratch)?;
            truncate_to(&mut bucket, base)?;
            bucket.append_non_leaf(&self.entries)
        })
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        let base = base_size(self.new_size, self.entries.len())?;
        truncate_to(&mut bucket(page)?, base)
    }

    fn body_len(&self) -> usize {
        4 + 1 + entries_body_len(&self.entries)
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u32(dst, self.new_size);
        out::u8(dst, self.key_codec as u8);
        encode_entries(dst, &self.entries);
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        let new_size = cur.u32()?;
        let key_codec = KeyCodec::try_from(cur.u8()?)?;
        let entries = decode_entries(cur, key_codec)?;
        Ok(Self {
            new_size,
            key_codec,
            entries,
        })
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " new_size={} codec={}", self.new_size, self.key_codec)?;
        describe_entries(f, self.key_codec, &self.entries)
    }
}

/// Cuts a non-leaf bucket down to `new_size` entries, keeping the removed
/// tail for undo.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShrinkNonLeafEntries {
    /// Bucket size after the shrink.
    pub new_size: u32,
    /// How the separator keys are encoded.
    pub key_codec: KeyCodec,
    /// Entries that were cut, in order.
    pub removed: Vec<NonLeafEntry>,
}

impl Replay for ShrinkNonLeafEntries {
    const TYPE: OperationType = OperationType::ShrinkNonLeafEntries;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        truncate_to(&mut bucket(page)?, self.new_size)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        apply_all_or_nothing(page, |scratch| {
            let mut bucket = bucket(scratch)?;
            truncate_to(&mut bucket, self.new_size)?;
            bucket.append_non_leaf(&self.removed)
        })
    }

    fn body_len(&self) -> usize {
        4 + 1 + entries_body_len(&self.removed)
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u32(dst, self.new_size);
        out::u8(dst, self.key_codec as u8);
        encode_entries(dst, &self.removed);
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        let new_size = cur.u32()?;
        let key_codec = KeyCodec::try_from(cur.u8()?)?;
        let removed = decode_entries(cur, key_codec)?;
        Ok(Self {
            new_size,
            key_codec,
            removed,
        })
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " new_size={} codec={}", self.new_size, self.key_codec)?;
        describe_entries(f, self.key_codec, &self.removed)
    }
}

/// Changes the layout revision tag of a bucket.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SwitchBucketLayout {
    /// Layout before the switch.
    pub from: BucketLayout,
    /// Layout after the switch.
    pub to: BucketLayout,
}

impl Replay for SwitchBucketLayout {
    const TYPE: OperationType = OperationType::SwitchBucketLayout;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        bucket(page)?.set_layout(self.to);
        Ok(())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        bucket(page)?.set_layout(self.from);
        Ok(())
    }

    fn body_len(&self) -> usize {
        2
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u8(dst, self.from as u8);
        out::u8(dst, self.to as u8);
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            from: BucketLayout::try_from(cur.u8()?)?,
            to: BucketLayout::try_from(cur.u8()?)?,
        })
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " v{}->v{}", self.from as u8, self.to as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let mut bucket = Bucket::init(&mut buf[..], true).unwrap();
        for (i, (key, value)) in entries.iter().enumerate() {
            bucket.insert_leaf_entry(i as u32, 1, key, value).unwrap();
        }
        buf
    }

    fn non_leaf(n: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let mut bucket = Bucket::init(&mut buf[..], false).unwrap();
        let entries: Vec<NonLeafEntry> = (0..n).map(sample_entry).collect();
        bucket.append_non_leaf(&entries).unwrap();
        buf
    }

    fn sample_entry(i: u64) -> NonLeafEntry {
        NonLeafEntry {
            left: i,
            right: i + 1,
            key: (i * 10).to_be_bytes().to_vec(),
        }
    }

    #[test]
    fn add_leaf_entry_redo_is_guarded() -> Result<()> {
        let before = leaf(&[(b"a", b"1"), (b"c", b"3")]);
        let rec = AddLeafEntry {
            index: 1,
            prior_size: 2,
            counter: 1,
            key: b"b".to_vec(),
            value: b"2".to_vec(),
        };
        let mut page = before.clone();
        rec.redo(&mut page)?;
        let after = page.clone();
        rec.redo(&mut page)?;
        assert_eq!(page, after);
        assert_eq!(page, leaf(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]));
        rec.undo(&mut page)?;
        assert_eq!(page, before);

        let mut short = leaf(&[(b"a", b"1")]);
        assert!(matches!(rec.redo(&mut short), Err(SombraError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn remove_leaf_entry_undo_restores_entry() -> Result<()> {
        let before = leaf(&[(b"a", b"1"), (b"b", b"2")]);
        let rec = RemoveLeafEntry {
            index: 0,
            prior_size: 2,
            counter: 1,
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        };
        let mut page = before.clone();
        rec.redo(&mut page)?;
        rec.redo(&mut page)?;
        assert_eq!(page, leaf(&[(b"b", b"2")]));
        rec.undo(&mut page)?;
        assert_eq!(page, before);
        Ok(())
    }

    #[test]
    fn counters_move_in_opposite_directions() -> Result<()> {
        let before = leaf(&[(b"k", b"v")]);
        let mut page = before.clone();
        IncrementCounter { index: 0 }.redo(&mut page)?;
        IncrementCounter { index: 0 }.redo(&mut page)?;
        assert_eq!(Bucket::open(&page[..])?.leaf_entry(0)?.counter, 3);
        DecrementCounter { index: 0 }.undo(&mut page)?;
        assert_eq!(Bucket::open(&page[..])?.leaf_entry(0)?.counter, 4);
        DecrementCounter { index: 0 }.redo(&mut page)?;
        IncrementCounter { index: 0 }.undo(&mut page)?;
        IncrementCounter { index: 0 }.undo(&mut page)?;
        assert_eq!(page, before);
        let mut zeroed = page.clone();
        bucket(&mut zeroed)?.set_counter(0, 0)?;
        assert!(DecrementCounter { index: 0 }.redo(&mut zeroed).is_err());
        Ok(())
    }

    #[test]
    fn non_leaf_runs_append_and_shrink() -> Result<()> {
        let two = non_leaf(2);
        let four = non_leaf(4);
        let add = AddNonLeafEntries {
            new_size: 4,
            key_codec: KeyCodec::U64,
            entries: vec![sample_entry(2), sample_entry(3)],
        };
        let mut page = two.clone();
        add.redo(&mut page)?;
        assert_eq!(page, four);
        add.redo(&mut page)?;
        assert_eq!(page, four);
        add.undo(&mut page)?;
        assert_eq!(page, two);

        let shrink = ShrinkNonLeafEntries {
            new_size: 2,
            key_codec: KeyCodec::U64,
            removed: vec![sample_entry(2), sample_entry(3)],
        };
        let mut page = four.clone();
        shrink.redo(&mut page)?;
        assert_eq!(page, two);
        shrink.undo(&mut page)?;
        assert_eq!(page, four);
        Ok(())
    }

    #[test]
    fn non_leaf_run_that_does_not_fit_leaves_page_untouched() -> Result<()> {
        let mut page = non_leaf(1);
        let before = page.clone();
        let add = AddNonLeafEntries {
            new_size: 41,
            key_codec: KeyCodec::Bytes,
            entries: (1..41).map(sample_entry).collect(),
        };
        assert!(add.redo(&mut page).is_err());
        assert_eq!(page, before);
        Ok(())
    }

    #[test]
    fn layout_switch_is_reversible() -> Result<()> {
        let before = leaf(&[]);
        let mut page = before.clone();
        let rec = SwitchBucketLayout {
            from: BucketLayout::V2,
            to: BucketLayout::V1,
        };
        rec.redo(&mut page)?;
        assert_eq!(Bucket::open(&page[..])?.layout()?, BucketLayout::V1);
        rec.undo(&mut page)?;
        assert_eq!(page, before);
        Ok(())
    }

    #[test]
    fn u64_codec_rejects_wrong_key_width() {
        let mut bytes = Vec::new();
        out::u32(&mut bytes, 1);
        out::u64(&mut bytes, 1);
        out::u64(&mut bytes, 2);
        out::bytes(&mut bytes, b"abc");
        let mut cur = Cursor::new(&bytes);
        assert!(decode_entries(&mut cur, KeyCodec::U64).is_err());
        let mut cur = Cursor::new(&bytes);
        assert_eq!(decode_entries(&mut cur, KeyCodec::Bytes).unwrap().len(), 1);
    }
}
