#![forbid(unsafe_code)]
//! On-page layouts mutated by the operation records.
//!
//! Every page starts with the same 32-byte header:
//!
//! ```text
//! 0..8    next page pointer (u64::MAX = none)
//! 8..16   previous page pointer
//! 16      page kind
//! 17      bucket layout version
//! 18      leaf flag
//! 19      reserved
//! 20..24  entry count
//! 24..28  free pointer (lowest byte used by entry data)
//! 28..32  reserved
//! ```
//!
//! The slot directory follows the header and entry data is packed downward
//! from the end of the page, in slot order, without gaps. Every byte outside
//! the header, the directory and live entry data is zero, so a page image is a
//! pure function of its logical contents.

use std::convert::TryFrom;

use crate::primitives::bytes::be;
use crate::types::{Result, SombraError};

pub mod bucket;
pub mod cluster;
pub(crate) mod slots;

pub use bucket::{Bucket, BucketLayout, KeyCodec, LeafEntry, NonLeafEntry};
pub use cluster::{ClusterPage, ClusterRecord};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8192;
/// Smallest page the layouts accept.
pub const MIN_PAGE_SIZE: usize = 64;
/// Length of the common page header.
pub const PAGE_HDR_LEN: usize = 32;
/// Sibling pointer value meaning "no page".
pub const NO_PAGE: u64 = u64::MAX;

pub mod header {
    //! Byte offsets for fixed header fields.

    pub const NEXT_PAGE: usize = 0;
    pub const PREV_PAGE: usize = 8;
    pub const PAGE_KIND: usize = 16;
    pub const LAYOUT: usize = 17;
    pub const LEAF: usize = 18;
    pub const COUNT: usize = 20;
    pub const FREE_PTR: usize = 24;
}

/// Logical kind stored in the page header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Never formatted.
    Uninitialized = 0,
    /// Slotted page of versioned records.
    Cluster = 1,
    /// Tree index node.
    Bucket = 2,
}

impl TryFrom<u8> for PageKind {
    type Error = SombraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageKind::Uninitialized),
            1 => Ok(PageKind::Cluster),
            2 => Ok(PageKind::Bucket),
            _ => Err(SombraError::Corruption("unknown page kind")),
        }
    }
}

fn check_header(buf: &[u8]) -> Result<()> {
    if buf.len() < MIN_PAGE_SIZE {
        return Err(SombraError::Corruption("page shorter than minimum page size"));
    }
    if buf.len() > u32::MAX as usize {
        return Err(SombraError::Invalid("page larger than u32 offsets allow"));
    }
    Ok(())
}

/// Reads the kind byte of a page.
pub fn page_kind(buf: &[u8]) -> Result<PageKind> {
    check_header(buf)?;
    PageKind::try_from(buf[header::PAGE_KIND])
}

/// Returns the next-page pointer.
pub fn next_page(buf: &[u8]) -> Result<u64> {
    check_header(buf)?;
    Ok(be::get_u64(buf, header::NEXT_PAGE))
}

/// Returns the previous-page pointer.
pub fn prev_page(buf: &[u8]) -> Result<u64> {
    check_header(buf)?;
    Ok(be::get_u64(buf, header::PREV_PAGE))
}

/// Overwrites the next-page pointer.
pub fn set_next_page(buf: &mut [u8], value: u64) -> Result<()> {
    check_header(buf)?;
    be::put_u64(buf, header::NEXT_PAGE, value);
    Ok(())
}

/// Overwrites the previous-page pointer.
pub fn set_prev_page(buf: &mut [u8], value: u64) -> Result<()> {
    check_header(buf)?;
    be::put_u64(buf, header::PREV_PAGE, value);
    Ok(())
}

/// Zeroes the page and writes a fresh header for `kind`.
pub(crate) fn format(buf: &mut [u8], kind: PageKind, layout: u8, leaf: bool) -> Result<()> {
    check_header(buf)?;
    buf.fill(0);
    be::put_u64(buf, header::NEXT_PAGE, NO_PAGE);
    be::put_u64(buf, header::PREV_PAGE, NO_PAGE);
    buf[header::PAGE_KIND] = kind as u8;
    buf[header::LAYOUT] = layout;
    buf[header::LEAF] = u8::from(leaf);
    let len = buf.len() as u32;
    be::put_u32(buf, header::FREE_PTR, len);
    Ok(())
}

pub(crate) fn expect_kind(buf: &[u8], kind: PageKind, msg: &'static str) -> Result<()> {
    if page_kind(buf)? != kind {
        return Err(SombraError::Corruption(msg));
    }
    slots::validate(buf)
}
