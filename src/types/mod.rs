#![forbid(unsafe_code)]
//! Identifiers and the crate-wide error type.

use std::fmt;

pub mod checksum;

pub use checksum::{Checksum, Crc32Fast};

/// Identity of one fixed-size page: the owning file and the page index in it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageKey {
    /// Storage file the page belongs to.
    pub file_id: u64,
    /// Zero-based page index within the file.
    pub page_index: u64,
}

impl PageKey {
    /// Creates a page key.
    pub const fn new(file_id: u64, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_index)
    }
}

/// Log sequence number assigned by the operation log.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the page cache, the operation records and the log.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// Failure reported by the file layer.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persistent state that cannot be trusted.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the operation cannot honor.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A log frame carried a type code no decoder is registered for.
    #[error("unknown operation type code {0}")]
    UnknownOperation(u8),
    /// Replay targeted a page the page source does not know about.
    #[error("page {file_id}:{page_index} not found")]
    PageNotFound {
        /// File of the missing page.
        file_id: u64,
        /// Index of the missing page.
        page_index: u64,
    },
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
}

impl SombraError {
    /// Builds a [`SombraError::PageNotFound`] for `key`.
    pub fn page_not_found(key: PageKey) -> Self {
        SombraError::PageNotFound {
            file_id: key.file_id,
            page_index: key.page_index,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SombraError>;
