//! Page-level durability core for the Sombra storage engine.
//!
//! The crate is split into a bounded page cache that sits in front of an
//! underlying page source, and an operation log whose records describe
//! single-page mutations that can be redone during crash recovery or undone
//! during rollback.

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod logging;
pub mod ops;
pub mod page;
pub mod primitives;
pub mod recovery;
pub mod types;

pub use cache::{
    CachedPage, LruPageCache, PageCache, PageCacheStats, PageSource, PassthroughPageCache,
    TinyPageCache,
};
pub use ops::{LoggedOperation, Mutation, OperationType, PageEditor, PageOperation};
pub use primitives::wal::{OpLog, OpLogOptions};
pub use recovery::{recover_from_log, redo_all, rollback, undo_all, RecoveryStats};
pub use types::{Lsn, PageKey, Result, SombraError};
