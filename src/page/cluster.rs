#![forbid(unsafe_code)]

use super::{expect_kind, format, slots, PageKind};
use crate::primitives::bytes::be;
use crate::types::{Result, SombraError};

const VERSION_LEN: usize = 4;

/// One versioned record stored in a cluster slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClusterRecord<'a> {
    /// Record version.
    pub version: u32,
    /// Opaque record bytes.
    pub payload: &'a [u8],
}

/// Slotted page of versioned records addressed by position.
///
/// Positions are stable: deleting a record leaves a hole that a later append
/// may reuse, and only trailing holes are dropped from the directory.
#[derive(Debug)]
pub struct ClusterPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> ClusterPage<B> {
    /// Wraps an already formatted cluster page.
    pub fn open(buf: B) -> Result<Self> {
        expect_kind(buf.as_ref(), PageKind::Cluster, "page is not a cluster page")?;
        Ok(Self { buf })
    }

    /// Returns the record at `position`, if the slot is occupied.
    pub fn record(&self, position: u32) -> Result<Option<ClusterRecord<'_>>> {
        let Some(entry) = slots::get(self.buf.as_ref(), position as usize)? else {
            return Ok(None);
        };
        if entry.len() < VERSION_LEN {
            return Err(SombraError::Corruption("cluster record shorter than header"));
        }
        Ok(Some(ClusterRecord {
            version: be::get_u32(entry, 0),
            payload: &entry[VERSION_LEN..],
        }))
    }

    /// Number of directory slots, holes included.
    pub fn slot_count(&self) -> u32 {
        slots::count(self.buf.as_ref()) as u32
    }

    /// Position an append without an explicit request would use.
    pub fn first_free_position(&self) -> u32 {
        slots::first_free(self.buf.as_ref()) as u32
    }

    /// Bytes left for directory growth and record data.
    pub fn free_space(&self) -> usize {
        slots::free_space(self.buf.as_ref())
    }

    /// Reads the big-endian i64 at `offset` within the payload at `position`.
    pub fn read_long(&self, position: u32, offset: u32) -> Result<i64> {
        let range = self.long_range(position, offset)?;
        Ok(be::get_i64(self.buf.as_ref(), range))
    }

    fn long_range(&self, position: u32, offset: u32) -> Result<usize> {
        let span = slots::span(self.buf.as_ref(), position as usize)?
            .ok_or(SombraError::Invalid("no record at position"))?;
        let start = span.start + VERSION_LEN + offset as usize;
        if start + 8 > span.end {
            return Err(SombraError::Invalid("long field outside record payload"));
        }
        Ok(start)
    }

    /// Returns the underlying buffer.
    pub fn into_inner(self) -> B {
        self.buf
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> ClusterPage<B> {
    /// Formats `buf` as an empty cluster page.
    pub fn init(mut buf: B) -> Result<Self> {
        format(buf.as_mut(), PageKind::Cluster, 0, false)?;
        Ok(Self { buf })
    }

    /// Stores a record at `position`, replacing any record already there.
    pub fn put_record(&mut self, position: u32, version: u32, payload: &[u8]) -> Result<()> {
        let mut entry = Vec::with_capacity(VERSION_LEN + payload.len());
        entry.extend_from_slice(&version.to_be_bytes());
        entry.extend_from_slice(payload);
        slots::put(self.buf.as_mut(), position as usize, &entry)
    }

    /// Frees the slot at `position`. Clearing an empty slot is a no-op.
    pub fn clear_record(&mut self, position: u32) -> Result<()> {
        slots::clear(self.buf.as_mut(), position as usize)
    }

    /// Overwrites the i64 at `offset` within the payload at `position`.
    pub fn write_long(&mut self, position: u32, offset: u32, value: i64) -> Result<()> {
        let start = self.long_range(position, offset)?;
        be::put_i64(self.buf.as_mut(), start, value);
        Ok(())
    }
}
