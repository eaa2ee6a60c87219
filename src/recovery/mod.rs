#![forbid(unsafe_code)]
//! Replays logged page operations through a page cache.
//!
//! Redo runs records forward in LSN order during crash recovery; undo runs
//! them backwards when a transaction rolls back.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::cache::PageCache;
use crate::ops::{LoggedOperation, PageOperation};
use crate::primitives::wal::OpLog;
use crate::types::{Lsn, PageKey, Result, SombraError};

/// Outcome of a replay pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryStats {
    /// Records applied to pages.
    pub applied: u64,
    /// Records at or below the checkpoint that were not replayed.
    pub skipped: u64,
    /// Distinct pages touched by the applied records.
    pub pages_touched: usize,
}

#[derive(Copy, Clone)]
enum Direction {
    Redo,
    Undo,
}

impl Direction {
    fn apply(self, op: &PageOperation, page: &mut [u8]) -> Result<()> {
        match self {
            Direction::Redo => op.redo(page),
            Direction::Undo => op.undo(page),
        }
    }
}

fn replay_one<C: PageCache + ?Sized>(
    cache: &mut C,
    record: &LoggedOperation,
    direction: Direction,
) -> Result<()> {
    let key = record.op.page;
    let page = cache
        .load_page(key)?
        .ok_or_else(|| SombraError::page_not_found(key))?;
    let outcome = {
        let mut buf = page.write();
        direction.apply(&record.op, &mut buf)
    };
    cache.release(page);
    outcome
}

fn replay<'a, I, C>(
    records: I,
    cache: &mut C,
    direction: Direction,
    stats: &mut RecoveryStats,
) -> Result<()>
where
    I: IntoIterator<Item = &'a LoggedOperation>,
    C: PageCache + ?Sized,
{
    let records: Vec<&LoggedOperation> = records.into_iter().collect();
    let ordered = records.windows(2).all(|pair| match direction {
        Direction::Redo => pair[1].lsn > pair[0].lsn,
        Direction::Undo => pair[1].lsn < pair[0].lsn,
    });
    if !ordered {
        return Err(SombraError::Corruption(match direction {
            Direction::Redo => "redo records out of order",
            Direction::Undo => "undo records out of order",
        }));
    }

    let mut touched: HashSet<PageKey> = HashSet::new();
    for record in records {
        replay_one(cache, record, direction)?;
        touched.insert(record.op.page);
        stats.applied += 1;
    }
    stats.pages_touched += touched.len();
    Ok(())
}

/// Redoes `records`, which must be in increasing LSN order.
pub fn redo_all<'a, I, C>(records: I, cache: &mut C) -> Result<RecoveryStats>
where
    I: IntoIterator<Item = &'a LoggedOperation>,
    C: PageCache + ?Sized,
{
    let mut stats = RecoveryStats::default();
    replay(records, cache, Direction::Redo, &mut stats)?;
    debug!(
        applied = stats.applied,
        pages = stats.pages_touched,
        "recovery.redo.complete"
    );
    Ok(stats)
}

/// Undoes `records`, which must already be in decreasing LSN order.
pub fn undo_all<'a, I, C>(records: I, cache: &mut C) -> Result<RecoveryStats>
where
    I: IntoIterator<Item = &'a LoggedOperation>,
    C: PageCache + ?Sized,
{
    let mut stats = RecoveryStats::default();
    replay(records, cache, Direction::Undo, &mut stats)?;
    debug!(
        applied = stats.applied,
        pages = stats.pages_touched,
        "recovery.undo.complete"
    );
    Ok(stats)
}

/// Rolls back a transaction whose records are given in log order.
pub fn rollback<C>(records: &[LoggedOperation], cache: &mut C) -> Result<RecoveryStats>
where
    C: PageCache + ?Sized,
{
    undo_all(records.iter().rev(), cache)
}

/// Redoes every record in `log` written after `checkpoint`.
///
/// Pages are assumed to hold every change up to and including `checkpoint`.
/// Records at or below it are skipped, so counter records are never applied
/// twice.
pub fn recover_from_log<C>(log: &OpLog, cache: &mut C, checkpoint: Lsn) -> Result<RecoveryStats>
where
    C: PageCache + ?Sized,
{
    let mut pending = Vec::new();
    let mut skipped = 0u64;
    let mut iter = log.iter()?;
    while let Some(record) = iter.next_record()? {
        if record.lsn <= checkpoint {
            skipped += 1;
        } else {
            pending.push(record);
        }
    }
    let mut stats = redo_all(&pending, cache)?;
    stats.skipped = skipped;
    info!(
        checkpoint = checkpoint.0,
        applied = stats.applied,
        skipped = stats.skipped,
        pages = stats.pages_touched,
        "recovery.complete"
    );
    Ok(stats)
}
