#![forbid(unsafe_code)]
//! Tree index node ("bucket") layout.
//!
//! Entries are kept dense and ordered by position. Leaf entries carry a
//! reference counter, a key and a value; non-leaf entries carry the two child
//! page pointers around a separator key.

use std::convert::TryFrom;
use std::fmt;

use super::{expect_kind, format, header, slots, PageKind};
use crate::primitives::bytes::be;
use crate::types::{Result, SombraError};

const COUNTER_LEN: usize = 4;
const KEY_LEN_LEN: usize = 4;
const CHILD_PTRS_LEN: usize = 16;

/// On-page format revision of a bucket.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BucketLayout {
    /// Original layout.
    V1 = 1,
    /// Current layout.
    V2 = 2,
}

impl TryFrom<u8> for BucketLayout {
    type Error = SombraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(BucketLayout::V1),
            2 => Ok(BucketLayout::V2),
            _ => Err(SombraError::Corruption("unknown bucket layout")),
        }
    }
}

/// Interpretation of separator key bytes.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeyCodec {
    /// Arbitrary bytes.
    Bytes = 0,
    /// Big-endian u64.
    U64 = 1,
    /// UTF-8 text.
    Utf8 = 2,
}

impl TryFrom<u8> for KeyCodec {
    type Error = SombraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(KeyCodec::Bytes),
            1 => Ok(KeyCodec::U64),
            2 => Ok(KeyCodec::Utf8),
            _ => Err(SombraError::Corruption("unknown key codec")),
        }
    }
}

impl KeyCodec {
    /// Rejects keys that cannot be interpreted under this codec.
    pub fn check(self, key: &[u8]) -> Result<()> {
        match self {
            KeyCodec::Bytes => Ok(()),
            KeyCodec::U64 if key.len() == 8 => Ok(()),
            KeyCodec::U64 => Err(SombraError::Corruption("u64 key is not 8 bytes")),
            KeyCodec::Utf8 => std::str::from_utf8(key)
                .map(|_| ())
                .map_err(|_| SombraError::Corruption("key is not valid utf-8")),
        }
    }

    /// Renders a key for diagnostics.
    pub fn display(self, key: &[u8]) -> String {
        match self {
            KeyCodec::U64 if key.len() == 8 => be::get_u64(key, 0).to_string(),
            KeyCodec::Utf8 => match std::str::from_utf8(key) {
                Ok(text) => format!("{text:?}"),
                Err(_) => hex::encode(key),
            },
            _ => hex::encode(key),
        }
    }
}

impl fmt::Display for KeyCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyCodec::Bytes => "bytes",
            KeyCodec::U64 => "u64",
            KeyCodec::Utf8 => "utf8",
        };
        f.write_str(name)
    }
}

/// A leaf entry borrowed from the page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LeafEntry<'a> {
    /// Number of references held on the entry.
    pub counter: u32,
    /// Entry key.
    pub key: &'a [u8],
    /// Entry value.
    pub value: &'a [u8],
}

/// A separator key with the child pages on either side.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NonLeafEntry {
    /// Child holding keys below `key`.
    pub left: u64,
    /// Child holding keys at or above `key`.
    pub right: u64,
    /// Separator key.
    pub key: Vec<u8>,
}

impl NonLeafEntry {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHILD_PTRS_LEN + self.key.len());
        out.extend_from_slice(&self.left.to_be_bytes());
        out.extend_from_slice(&self.right.to_be_bytes());
        out.extend_from_slice(&self.key);
        out
    }

    fn decode(entry: &[u8]) -> Result<Self> {
        if entry.len() < CHILD_PTRS_LEN {
            return Err(SombraError::Corruption("non-leaf entry shorter than header"));
        }
        Ok(Self {
            left: be::get_u64(entry, 0),
            right: be::get_u64(entry, 8),
            key: entry[CHILD_PTRS_LEN..].to_vec(),
        })
    }
}

fn encode_leaf(counter: u32, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(COUNTER_LEN + KEY_LEN_LEN + key.len() + value.len());
    out.extend_from_slice(&counter.to_be_bytes());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

fn decode_leaf(entry: &[u8]) -> Result<LeafEntry<'_>> {
    if entry.len() < COUNTER_LEN + KEY_LEN_LEN {
        return Err(SombraError::Corruption("leaf entry shorter than header"));
    }
    let key_len = be::get_u32(entry, COUNTER_LEN) as usize;
    let key_start = COUNTER_LEN + KEY_LEN_LEN;
    if key_len > entry.len() - key_start {
        return Err(SombraError::Corruption("leaf key runs past entry"));
    }
    Ok(LeafEntry {
        counter: be::get_u32(entry, 0),
        key: &entry[key_start..key_start + key_len],
        value: &entry[key_start + key_len..],
    })
}

/// Tree node view over a page buffer.
#[derive(Debug)]
pub struct Bucket<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> Bucket<B> {
    /// Wraps an already formatted bucket.
    pub fn open(buf: B) -> Result<Self> {
        expect_kind(buf.as_ref(), PageKind::Bucket, "page is not a bucket")?;
        BucketLayout::try_from(buf.as_ref()[header::LAYOUT])?;
        Ok(Self { buf })
    }

    /// True for leaf buckets.
    pub fn is_leaf(&self) -> bool {
        self.buf.as_ref()[header::LEAF] != 0
    }

    /// Current layout revision.
    pub fn layout(&self) -> Result<BucketLayout> {
        BucketLayout::try_from(self.buf.as_ref()[header::LAYOUT])
    }

    /// Number of entries.
    pub fn size(&self) -> u32 {
        slots::count(self.buf.as_ref()) as u32
    }

    /// Bytes left for new entries.
    pub fn free_space(&self) -> usize {
        slots::free_space(self.buf.as_ref())
    }

    fn entry(&self, index: u32) -> Result<&[u8]> {
        slots::get(self.buf.as_ref(), index as usize)?
            .ok_or(SombraError::Invalid("bucket index out of range"))
    }

    /// Reads the leaf entry at `index`.
    pub fn leaf_entry(&self, index: u32) -> Result<LeafEntry<'_>> {
        if !self.is_leaf() {
            return Err(SombraError::Corruption("leaf access on non-leaf bucket"));
        }
        decode_leaf(self.entry(index)?)
    }

    /// Reads the non-leaf entry at `index`.
    pub fn non_leaf_entry(&self, index: u32) -> Result<NonLeafEntry> {
        if self.is_leaf() {
            return Err(SombraError::Corruption("non-leaf access on leaf bucket"));
        }
        NonLeafEntry::decode(self.entry(index)?)
    }

    /// Reads every non-leaf entry from `from` to the end.
    pub fn non_leaf_entries(&self, from: u32) -> Result<Vec<NonLeafEntry>> {
        (from..self.size())
            .map(|index| self.non_leaf_entry(index))
            .collect()
    }

    /// Returns the underlying buffer.
    pub fn into_inner(self) -> B {
        self.buf
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Bucket<B> {
    /// Formats `buf` as an empty bucket using the current layout.
    pub fn init(mut buf: B, is_leaf: bool) -> Result<Self> {
        format(buf.as_mut(), PageKind::Bucket, BucketLayout::V2 as u8, is_leaf)?;
        Ok(Self { buf })
    }

    /// Inserts a leaf entry at `index`, shifting later entries up.
    pub fn insert_leaf_entry(
        &mut self,
        index: u32,
        counter: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        if !self.is_leaf() {
            return Err(SombraError::Corruption("leaf insert on non-leaf bucket"));
        }
        let entry = encode_leaf(counter, key, value);
        slots::insert(self.buf.as_mut(), index as usize, &entry)
    }

    /// Removes the entry at `index`, shifting later entries down.
    pub fn remove_entry(&mut self, index: u32) -> Result<()> {
        slots::remove(self.buf.as_mut(), index as usize).map(|_| ())
    }

    /// Overwrites the counter of the leaf entry at `index`.
    pub fn set_counter(&mut self, index: u32, counter: u32) -> Result<()> {
        self.leaf_entry(index)?;
        let span = slots::span(self.buf.as_ref(), index as usize)?
            .ok_or(SombraError::Invalid("bucket index out of range"))?;
        be::put_u32(self.buf.as_mut(), span.start, counter);
        Ok(())
    }

    /// Appends non-leaf entries after the current last entry.
    pub fn append_non_leaf(&mut self, entries: &[NonLeafEntry]) -> Result<()> {
        if self.is_leaf() {
            return Err(SombraError::Corruption("non-leaf append on leaf bucket"));
        }
        let encoded: Vec<Vec<u8>> = entries.iter().map(NonLeafEntry::encode).collect();
        let needed: usize = encoded.iter().map(|e| e.len() + slots::SLOT_LEN).sum();
        if needed > self.free_space() {
            return Err(SombraError::Invalid("page full"));
        }
        for entry in &encoded {
            let at = slots::count(self.buf.as_ref());
            slots::insert(self.buf.as_mut(), at, entry)?;
        }
        Ok(())
    }

    /// Drops entries from the end until `len` remain.
    pub fn truncate(&mut self, len: u32) -> Result<()> {
        slots::truncate(self.buf.as_mut(), len as usize)
    }

    /// Rewrites the layout tag.
    pub fn set_layout(&mut self, layout: BucketLayout) {
        self.buf.as_mut()[header::LAYOUT] = layout as u8;
    }
}
