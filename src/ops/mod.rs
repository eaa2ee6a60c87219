#![forbid(unsafe_code)]
//! Page operation records.
//!
//! A [`PageOperation`] describes one atomic mutation of exactly one page. It
//! carries both the forward parameters used by [`PageOperation::redo`] and the
//! inverse parameters used by [`PageOperation::undo`], so that undoing a redo
//! reproduces the prior page image byte for byte.
//!
//! Wire layout of an encoded record:
//!
//! ```text
//! [type u8][file_id u64][page_index u64][record fields...]
//! ```
//!
//! All integers are big-endian, byte strings are `[len u32][bytes]`.

use std::convert::TryFrom;
use std::fmt;

use crate::primitives::bytes::buf::Cursor;
use crate::types::{Lsn, PageKey, Result, SombraError};

mod bucket;
mod cluster;
mod editor;

pub use bucket::{
    AddLeafEntry, AddNonLeafEntries, BucketInit, DecrementCounter, IncrementCounter,
    RemoveLeafEntry, ShrinkNonLeafEntries, SwitchBucketLayout,
};
pub use cluster::{
    AppendRecord, ClusterInit, DeleteRecord, ReplaceRecord, SetNextPage, SetPrevPage,
    SetRecordLong,
};
pub use editor::PageEditor;

/// Bytes preceding the record fields: type code and page identity.
pub const RECORD_HEADER_LEN: usize = 1 + 8 + 8;

/// Stable type codes written ahead of every record.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[allow(missing_docs)]
pub enum OperationType {
    ClusterInit = 1,
    AppendRecord = 2,
    DeleteRecord = 3,
    ReplaceRecord = 4,
    SetNextPage = 5,
    SetPrevPage = 6,
    SetRecordLong = 7,
    BucketInit = 20,
    AddLeafEntry = 21,
    RemoveLeafEntry = 22,
    IncrementCounter = 23,
    DecrementCounter = 24,
    AddNonLeafEntries = 25,
    ShrinkNonLeafEntries = 26,
    SwitchBucketLayout = 27,
}

impl OperationType {
    /// Every known record type, in code order.
    pub const ALL: [OperationType; 15] = [
        OperationType::ClusterInit,
        OperationType::AppendRecord,
        OperationType::DeleteRecord,
        OperationType::ReplaceRecord,
        OperationType::SetNextPage,
        OperationType::SetPrevPage,
        OperationType::SetRecordLong,
        OperationType::BucketInit,
        OperationType::AddLeafEntry,
        OperationType::RemoveLeafEntry,
        OperationType::IncrementCounter,
        OperationType::DecrementCounter,
        OperationType::AddNonLeafEntries,
        OperationType::ShrinkNonLeafEntries,
        OperationType::SwitchBucketLayout,
    ];

    /// Numeric code on the wire.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Short snake_case name for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            OperationType::ClusterInit => "cluster_init",
            OperationType::AppendRecord => "append_record",
            OperationType::DeleteRecord => "delete_record",
            OperationType::ReplaceRecord => "replace_record",
            OperationType::SetNextPage => "set_next_page",
            OperationType::SetPrevPage => "set_prev_page",
            OperationType::SetRecordLong => "set_record_long",
            OperationType::BucketInit => "bucket_init",
            OperationType::AddLeafEntry => "add_leaf_entry",
            OperationType::RemoveLeafEntry => "remove_leaf_entry",
            OperationType::IncrementCounter => "increment_counter",
            OperationType::DecrementCounter => "decrement_counter",
            OperationType::AddNonLeafEntries => "add_non_leaf_entries",
            OperationType::ShrinkNonLeafEntries => "shrink_non_leaf_entries",
            OperationType::SwitchBucketLayout => "switch_bucket_layout",
        }
    }
}

impl TryFrom<u8> for OperationType {
    type Error = SombraError;

    fn try_from(code: u8) -> Result<Self> {
        OperationType::ALL
            .iter()
            .copied()
            .find(|ty| ty.code() == code)
            .ok_or(SombraError::UnknownOperation(code))
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Behavior every concrete record kind provides.
pub(crate) trait Replay: Sized {
    const TYPE: OperationType;

    fn redo(&self, page: &mut [u8]) -> Result<()>;
    fn undo(&self, page: &mut [u8]) -> Result<()>;
    fn body_len(&self) -> usize;
    fn encode_body(&self, out: &mut Vec<u8>);
    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self>;
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

/// The closed set of page mutations a record can describe.
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum Mutation {
    ClusterInit(ClusterInit),
    AppendRecord(AppendRecord),
    DeleteRecord(DeleteRecord),
    ReplaceRecord(ReplaceRecord),
    SetNextPage(SetNextPage),
    SetPrevPage(SetPrevPage),
    SetRecordLong(SetRecordLong),
    BucketInit(BucketInit),
    AddLeafEntry(AddLeafEntry),
    RemoveLeafEntry(RemoveLeafEntry),
    IncrementCounter(IncrementCounter),
    DecrementCounter(DecrementCounter),
    AddNonLeafEntries(AddNonLeafEntries),
    ShrinkNonLeafEntries(ShrinkNonLeafEntries),
    SwitchBucketLayout(SwitchBucketLayout),
}

macro_rules! dispatch_mutations {
    ($($kind:ident),* $(,)?) => {
        impl Mutation {
            /// Record type of this mutation.
            pub fn operation_type(&self) -> OperationType {
                match self {
                    $(Mutation::$kind(_) => <$kind as Replay>::TYPE,)*
                }
            }

            fn redo(&self, page: &mut [u8]) -> Result<()> {
                match self {
                    $(Mutation::$kind(m) => m.redo(page),)*
                }
            }

            fn undo(&self, page: &mut [u8]) -> Result<()> {
                match self {
                    $(Mutation::$kind(m) => m.undo(page),)*
                }
            }

            fn body_len(&self) -> usize {
                match self {
                    $(Mutation::$kind(m) => m.body_len(),)*
                }
            }

            fn encode_body(&self, out: &mut Vec<u8>) {
                match self {
                    $(Mutation::$kind(m) => m.encode_body(out),)*
                }
            }

            fn decode_body(ty: OperationType, cur: &mut Cursor<'_>) -> Result<Self> {
                match ty {
                    $(OperationType::$kind => Ok(Mutation::$kind($kind::decode_body(cur)?)),)*
                }
            }

            fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Mutation::$kind(m) => m.describe(f),)*
                }
            }
        }

        $(
            impl From<$kind> for Mutation {
                fn from(m: $kind) -> Self {
                    Mutation::$kind(m)
                }
            }
        )*
    };
}

dispatch_mutations!(
    ClusterInit,
    AppendRecord,
    DeleteRecord,
    ReplaceRecord,
    SetNextPage,
    SetPrevPage,
    SetRecordLong,
    BucketInit,
    AddLeafEntry,
    RemoveLeafEntry,
    IncrementCounter,
    DecrementCounter,
    AddNonLeafEntries,
    ShrinkNonLeafEntries,
    SwitchBucketLayout,
);

/// One logged mutation of one page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageOperation {
    /// Page the mutation applies to.
    pub page: PageKey,
    /// Forward and inverse parameters.
    pub mutation: Mutation,
}

impl PageOperation {
    /// Creates a record for `page`.
    pub fn new(page: PageKey, mutation: impl Into<Mutation>) -> Self {
        Self {
            page,
            mutation: mutation.into(),
        }
    }

    /// Record type.
    pub fn operation_type(&self) -> OperationType {
        self.mutation.operation_type()
    }

    /// Reapplies the forward mutation to `page`.
    ///
    /// Setting records are idempotent. Counter records are not; recovery
    /// avoids applying them twice by starting after the last checkpoint.
    pub fn redo(&self, page: &mut [u8]) -> Result<()> {
        self.mutation.redo(page)
    }

    /// Applies the inverse mutation to `page`.
    pub fn undo(&self, page: &mut [u8]) -> Result<()> {
        self.mutation.undo(page)
    }

    /// Exact number of bytes [`PageOperation::encode`] produces.
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_LEN + self.mutation.body_len()
    }

    /// Appends the wire form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.serialized_size());
        out.push(self.operation_type().code());
        out.extend_from_slice(&self.page.file_id.to_be_bytes());
        out.extend_from_slice(&self.page.page_index.to_be_bytes());
        self.mutation.encode_body(out);
    }

    /// Returns the wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        self.encode_into(&mut out);
        out
    }

    /// Decodes one record occupying all of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(src);
        let ty = OperationType::try_from(cur.u8()?)?;
        let page = PageKey::new(cur.u64()?, cur.u64()?);
        let mutation = Mutation::decode_body(ty, &mut cur)?;
        cur.finish()?;
        Ok(Self { page, mutation })
    }
}

impl fmt::Display for PageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} page={}", self.operation_type(), self.page)?;
        self.mutation.describe(f)
    }
}

/// A record together with the log position it was assigned.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoggedOperation {
    /// Position in the operation log.
    pub lsn: Lsn,
    /// The record itself.
    pub op: PageOperation,
}

/// Runs `f` against a scratch copy of `page` and publishes the result only
/// when it succeeds, so multi-step records never leave a half-applied page.
pub(crate) fn apply_all_or_nothing(
    page: &mut [u8],
    f: impl FnOnce(&mut [u8]) -> Result<()>,
) -> Result<()> {
    let mut scratch = page.to_vec();
    f(&mut scratch)?;
    page.copy_from_slice(&scratch);
    Ok(())
}

pub(crate) fn encode_opt_position(out: &mut Vec<u8>, position: Option<u32>) {
    out.extend_from_slice(&position.unwrap_or(u32::MAX).to_be_bytes());
}

pub(crate) fn decode_opt_position(cur: &mut Cursor<'_>) -> Result<Option<u32>> {
    let raw = cur.u32()?;
    Ok((raw != u32::MAX).then_some(raw))
}
