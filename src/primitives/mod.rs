//! Low-level primitives shared by the page layouts, the records and the log.
//!
//! Includes byte utilities, positioned file I/O and the operation log.

/// Byte-level encoding helpers.
///
/// Big-endian field access for page layouts and a checked cursor for decoding
/// log records.
pub mod bytes;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data at explicit offsets.
pub mod io;

/// Durable operation log.
///
/// Append-only, checksummed storage for page operation records.
pub mod wal;
