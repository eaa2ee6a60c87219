#![forbid(unsafe_code)]

use std::convert::TryInto;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::ops::{LoggedOperation, PageOperation};
use crate::primitives::io::FileIo;
use crate::types::checksum::crc32_of as compute_crc32;
use crate::types::{Lsn, Result, SombraError};

const OPLOG_MAGIC: [u8; 4] = *b"SOPL";
const OPLOG_FORMAT_VERSION: u16 = 1;
/// Length of the file header at offset 0.
pub const FILE_HEADER_LEN: usize = 32;
/// Length of the header in front of every record.
pub const FRAME_HEADER_LEN: usize = 32;
/// Largest encoded record a frame may carry.
pub const MAX_RECORD_LEN: usize = 64 << 20;

/// Configuration options for opening an operation log.
#[derive(Clone, Debug)]
pub struct OpLogOptions {
    /// Salt stored in the header; reopening with another salt fails.
    pub salt: u64,
    /// LSN assigned to the first record of a fresh log.
    pub start_lsn: Lsn,
    /// Fsync after every append.
    pub sync_on_append: bool,
}

impl OpLogOptions {
    /// Creates options with the given salt and start LSN.
    pub fn new(salt: u64, start_lsn: Lsn) -> Self {
        Self {
            salt,
            start_lsn,
            sync_on_append: false,
        }
    }
}

impl Default for OpLogOptions {
    fn default() -> Self {
        Self::new(0, Lsn(1))
    }
}

/// Statistics about operation log activity.
#[derive(Clone, Debug, Default)]
pub struct OpLogStats {
    /// Records appended since open or reset.
    pub records_appended: u64,
    /// Bytes appended, frame headers included.
    pub bytes_appended: u64,
    /// Sync operations performed.
    pub syncs: u64,
    /// Bytes of torn tail dropped when the log was opened.
    pub truncated_bytes: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
    start_lsn: Lsn,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&OPLOG_MAGIC);
        buf[4..6].copy_from_slice(&OPLOG_FORMAT_VERSION.to_be_bytes());
        buf[12..20].copy_from_slice(&self.salt.to_be_bytes());
        buf[20..28].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = compute_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(SombraError::Corruption("oplog header truncated"));
        }
        if src[0..4] != OPLOG_MAGIC {
            return Err(SombraError::Corruption("oplog magic mismatch"));
        }
        let version = u16::from_be_bytes(src[4..6].try_into().unwrap());
        if version != OPLOG_FORMAT_VERSION {
            return Err(SombraError::Corruption("oplog format version mismatch"));
        }
        if src[6..12].iter().any(|&b| b != 0) {
            return Err(SombraError::Corruption(
                "oplog reserved header bytes non-zero",
            ));
        }
        let stored_crc = u32::from_be_bytes(src[28..32].try_into().unwrap());
        if compute_crc32(&[&src[..28]]) != stored_crc {
            return Err(SombraError::Corruption("oplog header crc mismatch"));
        }
        Ok(Self {
            salt: u64::from_be_bytes(src[12..20].try_into().unwrap()),
            start_lsn: Lsn(u64::from_be_bytes(src[20..28].try_into().unwrap())),
        })
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    lsn: Lsn,
    payload_len: u32,
    prev_chain: u64,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[16..24].copy_from_slice(&self.prev_chain.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = compute_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FRAME_HEADER_LEN]) -> Result<Self> {
        let stored_crc = u32::from_be_bytes(src[28..32].try_into().unwrap());
        if compute_crc32(&[&src[..28]]) != stored_crc {
            return Err(SombraError::Corruption("oplog frame header crc mismatch"));
        }
        if src[12..16] != [0, 0, 0, 0] {
            return Err(SombraError::Corruption("oplog frame reserved bytes non-zero"));
        }
        Ok(Self {
            lsn: Lsn(u64::from_be_bytes(src[0..8].try_into().unwrap())),
            payload_len: u32::from_be_bytes(src[8..12].try_into().unwrap()),
            prev_chain: u64::from_be_bytes(src[16..24].try_into().unwrap()),
            payload_crc32: u32::from_be_bytes(src[24..28].try_into().unwrap()),
        })
    }
}

fn chain_after(prev_chain: u64, encoded_header: &[u8], payload: &[u8]) -> u64 {
    let frame_size = (FRAME_HEADER_LEN + payload.len()) as u64;
    let chain_crc = compute_crc32(&[&prev_chain.to_be_bytes(), encoded_header, payload]);
    (frame_size << 32) | u64::from(chain_crc)
}

struct OpLogState {
    header: FileHeader,
    append_offset: u64,
    prev_chain: u64,
    next_lsn: Lsn,
    stats: OpLogStats,
}

/// Durable, append-only log of page operation records.
///
/// Each record is stored in a frame whose header carries the LSN, the record
/// length, a CRC of the record and a CRC chain linking it to the previous
/// frame. A frame that fails any of those checks ends the log: it is a torn
/// tail from an interrupted append and is cut off when the log is reopened.
pub struct OpLog {
    io: Arc<dyn FileIo>,
    sync_on_append: bool,
    state: Mutex<OpLogState>,
}

impl OpLog {
    /// Opens or creates an operation log.
    ///
    /// An existing log must carry the same salt. Its frames are validated and
    /// anything after the last intact frame is truncated.
    pub fn open(io: Arc<dyn FileIo>, options: OpLogOptions) -> Result<Self> {
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                salt: options.salt,
                start_lsn: options.start_lsn,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.salt != options.salt {
                return Err(SombraError::Corruption("oplog salt mismatch"));
            }
            header
        };

        let mut iter = OpLogIterator::open(Arc::clone(&io))?;
        let mut records = 0u64;
        while iter.next_frame()?.is_some() {
            records += 1;
        }
        let valid_up_to = iter.valid_up_to();
        let mut stats = OpLogStats::default();
        let len = io.len()?;
        if valid_up_to < len {
            warn!(
                valid_up_to,
                len,
                dropped = len - valid_up_to,
                "oplog.open.torn_tail"
            );
            io.truncate(valid_up_to)?;
            io.sync_all()?;
            stats.truncated_bytes = len - valid_up_to;
        }
        let next_lsn = iter
            .last_lsn()
            .map_or(header.start_lsn, |lsn| Lsn(lsn.0 + 1));
        debug!(records, next_lsn = next_lsn.0, "oplog.open");
        Ok(Self {
            io,
            sync_on_append: options.sync_on_append,
            state: Mutex::new(OpLogState {
                header,
                append_offset: valid_up_to,
                prev_chain: iter.prev_chain,
                next_lsn,
                stats,
            }),
        })
    }

    /// Drops every record and restarts numbering at `start_lsn`.
    pub fn reset(&self, start_lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        let header = FileHeader {
            salt: state.header.salt,
            start_lsn,
        };
        // Old frames must be gone before the new start LSN is on disk.
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        self.io.write_at(0, &header.encode())?;
        self.io.sync_all()?;
        state.header = header;
        state.append_offset = FILE_HEADER_LEN as u64;
        state.prev_chain = 0;
        state.next_lsn = start_lsn;
        state.stats = OpLogStats::default();
        debug!(start_lsn = start_lsn.0, "oplog.reset");
        Ok(())
    }

    /// Appends one record and returns the LSN it was assigned.
    pub fn append(&self, op: &PageOperation) -> Result<Lsn> {
        let lsns = self.append_batch(std::slice::from_ref(op))?;
        Ok(lsns[0])
    }

    /// Appends records in order with a single write and returns their LSNs.
    ///
    /// Does not sync unless the log was opened with `sync_on_append`.
    pub fn append_batch(&self, ops: &[PageOperation]) -> Result<Vec<Lsn>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock();
        let mut buf = Vec::new();
        let mut lsns = Vec::with_capacity(ops.len());
        let mut chain = state.prev_chain;
        let mut lsn = state.next_lsn;
        for op in ops {
            let payload = op.encode();
            if payload.len() > MAX_RECORD_LEN {
                return Err(SombraError::Invalid("record exceeds oplog frame limit"));
            }
            let header = FrameHeader {
                lsn,
                payload_len: payload.len() as u32,
                prev_chain: chain,
                payload_crc32: compute_crc32(&[&payload]),
            };
            let encoded = header.encode();
            chain = chain_after(chain, &encoded, &payload);
            buf.extend_from_slice(&encoded);
            buf.extend_from_slice(&payload);
            lsns.push(lsn);
            lsn = Lsn(lsn.0 + 1);
        }
        self.io.write_at(state.append_offset, &buf)?;
        state.append_offset += buf.len() as u64;
        state.prev_chain = chain;
        state.next_lsn = lsn;
        state.stats.records_appended += ops.len() as u64;
        state.stats.bytes_appended += buf.len() as u64;
        trace!(
            records = ops.len(),
            bytes = buf.len(),
            last_lsn = lsn.0 - 1,
            "oplog.append"
        );
        if self.sync_on_append {
            self.io.sync_all()?;
            state.stats.syncs += 1;
        }
        Ok(lsns)
    }

    /// Syncs all appended records to persistent storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Creates an iterator over the records currently in the log.
    pub fn iter(&self) -> Result<OpLogIterator> {
        OpLogIterator::open(Arc::clone(&self.io))
    }

    /// Reads every record in log order.
    pub fn read_all(&self) -> Result<Vec<LoggedOperation>> {
        let mut iter = self.iter()?;
        let mut records = Vec::new();
        while let Some(record) = iter.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// LSN the next appended record will get.
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// LSN assigned to the first record after the last reset.
    pub fn start_lsn(&self) -> Lsn {
        self.state.lock().header.start_lsn
    }

    /// Returns current statistics for this log.
    pub fn stats(&self) -> OpLogStats {
        self.state.lock().stats.clone()
    }

    /// Returns the total size of the log file in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the log holds no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }
}

/// One frame as stored, before its record is decoded.
pub struct RawFrame {
    /// LSN of the frame.
    pub lsn: Lsn,
    /// Encoded record.
    pub payload: Vec<u8>,
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("lsn", &self.lsn)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Sequential reader over an operation log file.
///
/// Stops at the end of the intact prefix; see [`OpLogIterator::valid_up_to`].
pub struct OpLogIterator {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
    prev_chain: u64,
    valid_up_to: u64,
    salt: u64,
    start_lsn: Lsn,
    last_lsn: Option<Lsn>,
}

impl OpLogIterator {
    /// Opens a reader over `io` without modifying it.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let end = io.len()?;
        if end < FILE_HEADER_LEN as u64 {
            return Err(SombraError::Corruption("oplog truncated header"));
        }
        let mut header_buf = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut header_buf)?;
        let header = FileHeader::decode(&header_buf)?;
        Ok(Self {
            io,
            offset: FILE_HEADER_LEN as u64,
            end,
            prev_chain: 0,
            valid_up_to: FILE_HEADER_LEN as u64,
            salt: header.salt,
            start_lsn: header.start_lsn,
            last_lsn: None,
        })
    }

    fn stop(&mut self) -> Result<Option<RawFrame>> {
        self.offset = self.end;
        Ok(None)
    }

    /// Reads the next intact frame without decoding its record.
    ///
    /// Returns `None` at the end of the log or at the first torn frame.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            return self.stop();
        }
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        self.io.read_at(self.offset, &mut header_buf)?;
        let Ok(header) = FrameHeader::decode(&header_buf) else {
            return self.stop();
        };
        if header.prev_chain != self.prev_chain {
            return self.stop();
        }
        let payload_len = header.payload_len as usize;
        let payload_off = self.offset + FRAME_HEADER_LEN as u64;
        if payload_len > MAX_RECORD_LEN || payload_off + payload_len as u64 > self.end {
            return self.stop();
        }
        let mut payload = vec![0u8; payload_len];
        self.io.read_at(payload_off, &mut payload)?;
        if compute_crc32(&[&payload]) != header.payload_crc32 {
            return self.stop();
        }
        if header.lsn < self.start_lsn {
            return Err(SombraError::Corruption("oplog frame lsn below start_lsn"));
        }
        if self.last_lsn.is_some_and(|last| header.lsn <= last) {
            return Err(SombraError::Corruption("oplog lsn not increasing"));
        }
        self.prev_chain = chain_after(self.prev_chain, &header_buf, &payload);
        self.offset = payload_off + payload_len as u64;
        self.valid_up_to = self.offset;
        self.last_lsn = Some(header.lsn);
        Ok(Some(RawFrame {
            lsn: header.lsn,
            payload,
        }))
    }

    /// Reads and decodes the next record.
    ///
    /// A frame that passes its checksums but does not decode is an error,
    /// not the end of the log.
    pub fn next_record(&mut self) -> Result<Option<LoggedOperation>> {
        match self.next_frame()? {
            Some(frame) => Ok(Some(LoggedOperation {
                lsn: frame.lsn,
                op: PageOperation::decode(&frame.payload)?,
            })),
            None => Ok(None),
        }
    }

    /// Returns the file offset up to which frames have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    /// LSN of the last frame returned so far.
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_lsn
    }

    /// First LSN recorded in the file header.
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Salt recorded in the file header.
    pub fn salt(&self) -> u64 {
        self.salt
    }
}
