//! Error Types for loghouse
//!
//! This module defines all error types that can occur in loghouse operations.
//!
//! ## Error Categories
//!
//! ### I/O Errors
//! - `Io`: Underlying file system operation failed
//!
//! ### Data Integrity Errors
//! - `BadFormat`: Bad segment magic, invalid header field or malformed
//!   segment file name
//! - `Corrupt`: Unexpected record type, oversized field or a record that
//!   straddles the end of its segment
//!
//! ### Request Errors
//! - `OutOfRange`: Message id or timestamp outside the buffer or segment,
//!   or a parameter outside its allowed bounds
//! - `MessageTooLarge`: Record does not fit in a fresh segment of the
//!   configured size
//! - `CursorClosed`: Blocked or subsequent operation on a closed cursor,
//!   or any operation on a closed buffer
//!
//! ### Internal Signals
//! - `SegmentFull`: An append does not fit in the current segment. The
//!   buffer translates this into a rollover; callers never observe it.
//!
//! All fallible functions return `Result<T>`, aliased to `Result<T, Error>`,
//! so call sites propagate with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad format: {0}")]
    BadFormat(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Rollover signal: the record does not fit in the current segment.
    #[error("segment is full")]
    SegmentFull,

    #[error("message of {size} bytes exceeds maximum payload size {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("cursor is closed")]
    CursorClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
