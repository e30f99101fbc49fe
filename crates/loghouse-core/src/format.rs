//! On-Disk Format Constants
//!
//! This module pins down the binary layout shared by the segment writer and
//! reader. Everything on disk is big-endian.
//!
//! ## Segment File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (4096 bytes)                                         │
//! │ - Magic: 0xBE01 (2 bytes)                                   │
//! │ - Reserved: 0 (2 bytes)                                     │
//! │ - Max file size (4 bytes)                                   │
//! │ - Checkpoint length (4 bytes)                               │
//! │ - Reserved: 0 (4 bytes)                                     │
//! │ - Histogram: up to 340 buckets of 12 bytes                  │
//! │   * first relative id (4 bytes)                             │
//! │   * first timestamp, unix seconds (4 bytes)                 │
//! │   * message count (4 bytes)                                 │
//! │   an all-zero bucket terminates the live area               │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Record 1                                                    │
//! │ - Type: 0xA1 (1 byte)                                       │
//! │ - Timestamp millis (8 bytes)                                │
//! │ - Routing key length (2 bytes)                              │
//! │ - Payload length (4 bytes)                                  │
//! │ - Routing key bytes                                         │
//! │ - Payload bytes                                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Record 2 ...                                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bytes past the checkpoint length are presumed torn by a crash and are
//! truncated the next time the segment is opened. There is no per-record
//! checksum; recovery is checkpoint truncation.
//!
//! ## Segment File Names
//!
//! `%016x-%016x.qdb`: first message id, then first message timestamp (the
//! signed millis formatted as 16 hex digits), so lexicographic file order
//! equals id order. Names are exactly 37 characters.

use crate::{Error, Result};

/// Magic number in the first two bytes of every segment file.
pub const SEGMENT_MAGIC: u16 = 0xBE01;

/// Fixed segment header size; records start at this offset.
pub const SEGMENT_HEADER_SIZE: u64 = 4096;

/// Byte offset of the histogram bucket area inside the header.
pub const BUCKETS_OFFSET: usize = 16;

/// Size of one histogram bucket record.
pub const BUCKET_SIZE: usize = 12;

/// Maximum number of histogram buckets: (4096 - 16) / 12.
pub const MAX_BUCKETS: usize = 340;

/// Record type tag of a message record.
pub const RECORD_TYPE_MESSAGE: u8 = 0xA1;

/// Fixed per-record overhead: type + timestamp + key length + payload length.
pub const RECORD_HEADER_SIZE: usize = 1 + 8 + 2 + 4;

/// The on-disk routing key length field is a u16 and is authoritative.
pub const MAX_ROUTING_KEY_SIZE: usize = u16::MAX as usize;

/// Segment file suffix.
pub const SEGMENT_SUFFIX: &str = ".qdb";

/// Exact segment file name length: 16 + 1 + 16 + 4.
pub const SEGMENT_FILE_NAME_LEN: usize = 37;

/// Build the file name for a segment from its first message id and the
/// timestamp of its first message.
pub fn segment_file_name(first_id: u64, first_timestamp: i64) -> String {
    format!("{first_id:016x}-{:016x}{SEGMENT_SUFFIX}", first_timestamp as u64)
}

/// Parse a segment file name back into (first id, first timestamp).
///
/// Names must be exactly 37 characters: anything else in the directory that
/// ends in `.qdb` is a sign of corruption or foreign files and is rejected.
pub fn parse_segment_file_name(name: &str) -> Result<(u64, i64)> {
    let malformed = || Error::BadFormat(format!("invalid segment file name [{name}]"));

    if name.len() != SEGMENT_FILE_NAME_LEN
        || !name.ends_with(SEGMENT_SUFFIX)
        || name.as_bytes()[16] != b'-'
    {
        return Err(malformed());
    }
    let first_id = u64::from_str_radix(&name[0..16], 16).map_err(|_| malformed())?;
    let first_timestamp =
        u64::from_str_radix(&name[17..33], 16).map_err(|_| malformed())? as i64;
    Ok((first_id, first_timestamp))
}
