#![forbid(unsafe_code)]
//! Slot directory shared by cluster pages and buckets.
//!
//! Directory entry `i` holds the byte offset of entry `i`, or zero for a hole.
//! Live entries are packed downward from the page end in slot order, so the
//! entry of slot `i` ends where the nearest live entry before it begins.

use std::ops::Range;

use super::{header, PAGE_HDR_LEN};
use crate::primitives::bytes::be;
use crate::types::{Result, SombraError};

pub(crate) const SLOT_LEN: usize = 4;

pub(crate) fn count(buf: &[u8]) -> usize {
    be::get_u32(buf, header::COUNT) as usize
}

fn set_count(buf: &mut [u8], count: usize) {
    be::put_u32(buf, header::COUNT, count as u32);
}

pub(crate) fn free_ptr(buf: &[u8]) -> usize {
    be::get_u32(buf, header::FREE_PTR) as usize
}

fn set_free_ptr(buf: &mut [u8], free: usize) {
    be::put_u32(buf, header::FREE_PTR, free as u32);
}

const fn dir_slot(i: usize) -> usize {
    PAGE_HDR_LEN + i * SLOT_LEN
}

const fn dir_end(count: usize) -> usize {
    dir_slot(count)
}

fn offset(buf: &[u8], i: usize) -> usize {
    be::get_u32(buf, dir_slot(i)) as usize
}

fn set_offset(buf: &mut [u8], i: usize, off: usize) {
    be::put_u32(buf, dir_slot(i), off as u32);
}

/// Bytes still available between the directory and the entry data.
pub(crate) fn free_space(buf: &[u8]) -> usize {
    free_ptr(buf).saturating_sub(dir_end(count(buf)))
}

/// Checks the header fields the directory code relies on.
pub(crate) fn validate(buf: &[u8]) -> Result<()> {
    let free = free_ptr(buf);
    if free > buf.len() {
        return Err(SombraError::Corruption("free pointer past page end"));
    }
    let count = count(buf);
    if count > buf.len() / SLOT_LEN || dir_end(count) > free {
        return Err(SombraError::Corruption("slot directory overlaps entry data"));
    }
    Ok(())
}

/// Start of the data region that ends at slot `i`.
fn top_of(buf: &[u8], i: usize) -> usize {
    (0..i)
        .rev()
        .map(|j| offset(buf, j))
        .find(|&off| off != 0)
        .unwrap_or(buf.len())
}

/// Byte range of the entry at slot `i`, or `None` for a hole.
pub(crate) fn span(buf: &[u8], i: usize) -> Result<Option<Range<usize>>> {
    if i >= count(buf) {
        return Ok(None);
    }
    let off = offset(buf, i);
    if off == 0 {
        return Ok(None);
    }
    let top = top_of(buf, i);
    if off < free_ptr(buf) || off >= top || top > buf.len() {
        return Err(SombraError::Corruption("slot offset outside entry data"));
    }
    Ok(Some(off..top))
}

pub(crate) fn get(buf: &[u8], i: usize) -> Result<Option<&[u8]>> {
    Ok(span(buf, i)?.map(|range| &buf[range]))
}

fn entry_len(buf: &[u8], i: usize) -> Result<usize> {
    Ok(span(buf, i)?.map_or(0, |range| range.len()))
}

/// First hole in the directory, or the current count when there is none.
pub(crate) fn first_free(buf: &[u8]) -> usize {
    let count = count(buf);
    (0..count).find(|&i| offset(buf, i) == 0).unwrap_or(count)
}

/// Replaces the data of slot `i` (which must already be in the directory)
/// with `new`, shifting the data of later slots. Space must be checked by the
/// caller.
fn splice(buf: &mut [u8], i: usize, new: Option<&[u8]>) -> Result<()> {
    let count = count(buf);
    let free = free_ptr(buf);
    let top = top_of(buf, i);
    let in_data = |off: usize| (free..buf.len()).contains(&off);
    if top != buf.len() && !in_data(top) {
        return Err(SombraError::Corruption("slot offset outside entry data"));
    }
    if (i + 1..count).any(|j| offset(buf, j) != 0 && !in_data(offset(buf, j))) {
        return Err(SombraError::Corruption("slot offset outside entry data"));
    }
    let old_len = entry_len(buf, i)?;
    let new_len = new.map_or(0, <[u8]>::len);
    let below_end = top - old_len;
    let new_free = (free + old_len)
        .checked_sub(new_len)
        .ok_or(SombraError::Invalid("page full"))?;

    buf.copy_within(free..below_end, new_free);
    if new_free > free {
        buf[free..new_free].fill(0);
    }
    match new {
        Some(bytes) => {
            let start = top - new_len;
            buf[start..top].copy_from_slice(bytes);
            set_offset(buf, i, start);
        }
        None => set_offset(buf, i, 0),
    }
    for j in i + 1..count {
        let off = offset(buf, j);
        if off != 0 {
            set_offset(buf, j, off - free + new_free);
        }
    }
    set_free_ptr(buf, new_free);
    Ok(())
}

fn ensure_room(buf: &[u8], slots_after: usize, released: usize, needed: usize) -> Result<()> {
    if free_ptr(buf) + released < dir_end(slots_after) + needed {
        return Err(SombraError::Invalid("page full"));
    }
    Ok(())
}

/// Stores `bytes` at slot `i`, overwriting whatever was there. Slots past the
/// current count are created as holes.
pub(crate) fn put(buf: &mut [u8], i: usize, bytes: &[u8]) -> Result<()> {
    validate(buf)?;
    if bytes.is_empty() {
        return Err(SombraError::Invalid("entries must not be empty"));
    }
    let count = count(buf);
    let slots_after = count.max(i + 1);
    ensure_room(buf, slots_after, entry_len(buf, i)?, bytes.len())?;
    if i >= count {
        buf[dir_end(count)..dir_end(slots_after)].fill(0);
        set_count(buf, slots_after);
    }
    splice(buf, i, Some(bytes))
}

/// Turns slot `i` into a hole and drops trailing holes from the directory.
pub(crate) fn clear(buf: &mut [u8], i: usize) -> Result<()> {
    validate(buf)?;
    if i >= count(buf) {
        return Ok(());
    }
    splice(buf, i, None)?;
    let mut count = count(buf);
    while count > 0 && offset(buf, count - 1) == 0 {
        count -= 1;
    }
    set_count(buf, count);
    Ok(())
}

/// Inserts `bytes` at position `i` of a dense directory.
pub(crate) fn insert(buf: &mut [u8], i: usize, bytes: &[u8]) -> Result<()> {
    validate(buf)?;
    let count = count(buf);
    if i > count {
        return Err(SombraError::Invalid("entry index out of range"));
    }
    if bytes.is_empty() {
        return Err(SombraError::Invalid("entries must not be empty"));
    }
    ensure_room(buf, count + 1, 0, bytes.len())?;
    buf.copy_within(dir_slot(i)..dir_end(count), dir_slot(i + 1));
    set_offset(buf, i, 0);
    set_count(buf, count + 1);
    splice(buf, i, Some(bytes))
}

/// Removes position `i` of a dense directory and returns its bytes.
pub(crate) fn remove(buf: &mut [u8], i: usize) -> Result<Vec<u8>> {
    validate(buf)?;
    let count = count(buf);
    let removed = match get(buf, i)? {
        Some(bytes) => bytes.to_vec(),
        None => return Err(SombraError::Invalid("entry index out of range")),
    };
    splice(buf, i, None)?;
    buf.copy_within(dir_slot(i + 1)..dir_end(count), dir_slot(i));
    buf[dir_slot(count - 1)..dir_end(count)].fill(0);
    set_count(buf, count - 1);
    Ok(removed)
}

/// Drops entries from the end until `len` remain.
pub(crate) fn truncate(buf: &mut [u8], len: usize) -> Result<()> {
    validate(buf)?;
    if len > count(buf) {
        return Err(SombraError::Invalid("truncate beyond entry count"));
    }
    while count(buf) > len {
        let last = count(buf) - 1;
        remove(buf, last)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{format, PageKind};

    fn page() -> Vec<u8> {
        let mut buf = vec![0u8; 128];
        format(&mut buf, PageKind::Cluster, 0, false).unwrap();
        buf
    }

    fn formatted_copy(entries: &[Option<&[u8]>]) -> Vec<u8> {
        let mut buf = page();
        for (i, entry) in entries.iter().enumerate() {
            if let Some(bytes) = entry {
                put(&mut buf, i, bytes).unwrap();
            }
        }
        buf
    }

    #[test]
    fn corrupt_offsets_are_reported_not_followed() {
        let mut buf = page();
        put(&mut buf, 0, b"aaaa").unwrap();
        let intact = buf.clone();

        set_offset(&mut buf, 0, 4096);
        assert!(matches!(
            put(&mut buf, 1, b"b"),
            Err(SombraError::Corruption("slot offset outside entry data"))
        ));

        buf.copy_from_slice(&intact);
        put(&mut buf, 2, b"cc").unwrap();
        set_offset(&mut buf, 2, 8);
        assert!(matches!(
            put(&mut buf, 1, b"b"),
            Err(SombraError::Corruption("slot offset outside entry data"))
        ));
    }

    #[test]
    fn put_packs_entries_downward() {
        let buf = formatted_copy(&[Some(b"aaaa"), Some(b"bb")]);
        assert_eq!(count(&buf), 2);
        assert_eq!(span(&buf, 0).unwrap(), Some(124..128));
        assert_eq!(span(&buf, 1).unwrap(), Some(122..124));
        assert_eq!(free_ptr(&buf), 122);
        assert_eq!(get(&buf, 1).unwrap(), Some(&b"bb"[..]));
    }

    #[test]
    fn clear_restores_canonical_image() {
        let expected = formatted_copy(&[Some(b"aaaa")]);
        let mut buf = expected.clone();
        put(&mut buf, 1, b"bbbbbb").unwrap();
        clear(&mut buf, 1).unwrap();
        assert_eq!(buf, expected);
    }

    #[test]
    fn holes_in_the_middle_shift_later_entries() {
        let mut buf = formatted_copy(&[Some(b"aa"), Some(b"bbb"), Some(b"c")]);
        clear(&mut buf, 1).unwrap();
        assert_eq!(count(&buf), 3);
        assert_eq!(get(&buf, 1).unwrap(), None);
        assert_eq!(get(&buf, 2).unwrap(), Some(&b"c"[..]));
        assert_eq!(first_free(&buf), 1);
        put(&mut buf, 1, b"bbb").unwrap();
        assert_eq!(buf, formatted_copy(&[Some(b"aa"), Some(b"bbb"), Some(b"c")]));
    }

    #[test]
    fn put_past_count_creates_holes() {
        let mut buf = page();
        put(&mut buf, 2, b"zz").unwrap();
        assert_eq!(count(&buf), 3);
        assert_eq!(get(&buf, 0).unwrap(), None);
        clear(&mut buf, 2).unwrap();
        assert_eq!(buf, page());
    }

    #[test]
    fn dense_insert_and_remove_are_inverse() {
        let before = {
            let mut buf = page();
            insert(&mut buf, 0, b"one").unwrap();
            insert(&mut buf, 1, b"three").unwrap();
            buf
        };
        let mut buf = before.clone();
        insert(&mut buf, 1, b"two").unwrap();
        assert_eq!(get(&buf, 1).unwrap(), Some(&b"two"[..]));
        assert_eq!(get(&buf, 2).unwrap(), Some(&b"three"[..]));
        assert_eq!(remove(&mut buf, 1).unwrap(), b"two");
        assert_eq!(buf, before);
    }

    #[test]
    fn full_page_is_left_untouched() {
        let mut buf = page();
        let before = buf.clone();
        let big = vec![1u8; 128];
        assert!(matches!(put(&mut buf, 0, &big), Err(SombraError::Invalid("page full"))));
        assert_eq!(buf, before);
    }

    #[test]
    fn truncate_drops_tail_entries() {
        let mut buf = page();
        for (i, entry) in [&b"a"[..], b"b", b"c"].iter().enumerate() {
            insert(&mut buf, i, entry).unwrap();
        }
        truncate(&mut buf, 1).unwrap();
        let mut expected = page();
        insert(&mut expected, 0, b"a").unwrap();
        assert_eq!(buf, expected);
        assert!(truncate(&mut buf, 4).is_err());
    }

    #[test]
    fn corrupt_free_pointer_is_detected() {
        let mut buf = page();
        be::put_u32(&mut buf, header::FREE_PTR, 4096);
        assert!(matches!(validate(&buf), Err(SombraError::Corruption(_))));
    }
}
