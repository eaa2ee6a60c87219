#![forbid(unsafe_code)]
//! Records mutating cluster pages and the common sibling pointers.

use std::fmt;

use super::{decode_opt_position, encode_opt_position, OperationType, Replay};
use crate::page::{self, ClusterPage};
use crate::primitives::bytes::{buf::Cursor, out};
use crate::types::Result;

fn cluster(page: &mut [u8]) -> Result<ClusterPage<&mut [u8]>> {
    ClusterPage::open(page)
}

/// Formats a page as an empty cluster page. Undo is a no-op: the page had no
/// meaningful prior content.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterInit;

impl Replay for ClusterInit {
    const TYPE: OperationType = OperationType::ClusterInit;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        ClusterPage::init(page).map(|_| ())
    }

    fn undo(&self, _page: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn body_len(&self) -> usize {
        0
    }

    fn encode_body(&self, _out: &mut Vec<u8>) {}

    fn decode_body(_cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(ClusterInit)
    }

    fn describe(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

/// Stores a new record in a free slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppendRecord {
    /// Version of the new record.
    pub version: u32,
    /// Bytes of the new record.
    pub payload: Vec<u8>,
    /// Position the caller asked for, if any.
    pub requested: Option<u32>,
    /// Position the record actually landed in.
    pub position: u32,
}

impl Replay for AppendRecord {
    const TYPE: OperationType = OperationType::AppendRecord;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        cluster(page)?.put_record(self.position, self.version, &self.payload)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        cluster(page)?.clear_record(self.position)
    }

    fn body_len(&self) -> usize {
        4 + out::bytes_len(self.payload.len()) + 4 + 4
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u32(dst, self.version);
        out::bytes(dst, &self.payload);
        encode_opt_position(dst, self.requested);
        out::u32(dst, self.position);
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            version: cur.u32()?,
            payload: cur.bytes()?,
            requested: decode_opt_position(cur)?,
            position: cur.u32()?,
        })
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " position={} version={} payload={}",
            self.position,
            self.version,
            hex::encode(&self.payload)
        )?;
        match self.requested {
            Some(requested) => write!(f, " requested={requested}"),
            None => f.write_str(" requested=any"),
        }
    }
}

/// Removes a record, remembering it for undo.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeleteRecord {
    /// Slot being freed.
    pub position: u32,
    /// Version held before the delete.
    pub old_version: u32,
    /// Bytes held before the delete.
    pub old_payload: Vec<u8>,
}

impl Replay for DeleteRecord {
    const TYPE: OperationType = OperationType::DeleteRecord;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        cluster(page)?.clear_record(self.position)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        cluster(page)?.put_record(self.position, self.old_version, &self.old_payload)
    }

    fn body_len(&self) -> usize {
        4 + 4 + out::bytes_len(self.old_payload.len())
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u32(dst, self.position);
        out::u32(dst, self.old_version);
        out::bytes(dst, &self.old_payload);
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            position: cur.u32()?,
            old_version: cur.u32()?,
            old_payload: cur.bytes()?,
        })
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " position={} old_version={} old_payload={}",
            self.position,
            self.old_version,
            hex::encode(&self.old_payload)
        )
    }
}

/// Overwrites a record in place.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplaceRecord {
    /// Slot being overwritten.
    pub position: u32,
    /// Version after the replace.
    pub new_version: u32,
    /// Bytes after the replace.
    pub new_payload: Vec<u8>,
    /// Version before the replace.
    pub old_version: u32,
    /// Bytes before the replace.
    pub old_payload: Vec<u8>,
}

impl Replay for ReplaceRecord {
    const TYPE: OperationType = OperationType::ReplaceRecord;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        cluster(page)?.put_record(self.position, self.new_version, &self.new_payload)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        cluster(page)?.put_record(self.position, self.old_version, &self.old_payload)
    }

    fn body_len(&self) -> usize {
        4 + 4
            + out::bytes_len(self.new_payload.len())
            + 4
            + out::bytes_len(self.old_payload.len())
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u32(dst, self.position);
        out::u32(dst, self.new_version);
        out::bytes(dst, &self.new_payload);
        out::u32(dst, self.old_version);
        out::bytes(dst, &self.old_payload);
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            position: cur.u32()?,
            new_version: cur.u32()?,
            new_payload: cur.bytes()?,
            old_version: cur.u32()?,
            old_payload: cur.bytes()?,
        })
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " position={} version={}->{} payload={}->{}",
            self.position,
            self.old_version,
            self.new_version,
            hex::encode(&self.old_payload),
            hex::encode(&self.new_payload)
        )
    }
}

macro_rules! sibling_pointer_record {
    ($(#[$doc:meta])* $name:ident, $setter:path) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct $name {
            /// Pointer after the change.
            pub new: u64,
            /// Pointer before the change.
            pub old: u64,
        }

        impl Replay for $name {
            const TYPE: OperationType = OperationType::$name;

            fn redo(&self, page: &mut [u8]) -> Result<()> {
                $setter(page, self.new)
            }

            fn undo(&self, page: &mut [u8]) -> Result<()> {
                $setter(page, self.old)
            }

            fn body_len(&self) -> usize {
                16
            }

            fn encode_body(&self, dst: &mut Vec<u8>) {
                out::u64(dst, self.new);
                out::u64(dst, self.old);
            }

            fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
                Ok(Self {
                    new: cur.u64()?,
                    old: cur.u64()?,
                })
            }

            fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, " {}->{}", pointer(self.old), pointer(self.new))
            }
        }
    };
}

fn pointer(value: u64) -> String {
    if value == page::NO_PAGE {
        "none".to_string()
    } else {
        value.to_string()
    }
}

sibling_pointer_record!(
    /// Rewrites the next-page pointer of any page kind.
    SetNextPage,
    page::set_next_page
);
sibling_pointer_record!(
    /// Rewrites the previous-page pointer of any page kind.
    SetPrevPage,
    page::set_prev_page
);

/// Overwrites an i64 field inside a record payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SetRecordLong {
    /// Slot of the record.
    pub position: u32,
    /// Byte offset of the field within the payload.
    pub offset: u32,
    /// Value after the change.
    pub new: i64,
    /// Value before the change.
    pub old: i64,
}

impl Replay for SetRecordLong {
    const TYPE: OperationType = OperationType::SetRecordLong;

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        cluster(page)?.write_long(self.position, self.offset, self.new)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        cluster(page)?.write_long(self.position, self.offset, self.old)
    }

    fn body_len(&self) -> usize {
        4 + 4 + 8 + 8
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        out::u32(dst, self.position);
        out::u32(dst, self.offset);
        out::i64(dst, self.new);
        out::i64(dst, self.old);
    }

    fn decode_body(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            position: cur.u32()?,
            offset: cur.u32()?,
            new: cur.i64()?,
            old: cur.i64()?,
        })
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " position={} offset={} value={}->{}",
            self.position, self.offset, self.old, self.new
        )
    }
}
