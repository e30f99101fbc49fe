//! Record Data Structure
//!
//! A record is a single message in the log: a caller-supplied timestamp, an
//! opaque routing key (UTF-8 text in practice) and an opaque payload.
//!
//! ## Ids
//!
//! Record ids are assigned by the buffer, not the caller. An id is the first
//! id of the owning segment plus the byte offset of the record inside that
//! segment's payload area, so ids are strictly increasing but **not**
//! contiguous: the gap between two consecutive ids equals the on-disk size
//! of the earlier record (`RECORD_HEADER_SIZE` + key bytes + payload bytes).
//!
//! ## Design Decisions
//! - `bytes::Bytes` payload for cheap cloning and slicing
//! - Serde derives so records can be dumped into JSON tooling
//! - The routing key is a `String`; the on-disk field is authoritative and
//!   bounds it at 65535 bytes

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::format::RECORD_HEADER_SIZE;

/// A single message read back from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Id assigned by the buffer at append time
    pub id: u64,

    /// Caller-supplied timestamp in milliseconds
    pub timestamp: i64,

    /// Routing key (opaque to the buffer)
    pub routing_key: String,

    /// Payload bytes
    pub payload: Bytes,
}

impl Record {
    pub fn new(id: u64, timestamp: i64, routing_key: String, payload: Bytes) -> Self {
        Self {
            id,
            timestamp,
            routing_key,
            payload,
        }
    }

    /// Exact size of this record on disk.
    pub fn size_on_disk(&self) -> usize {
        RECORD_HEADER_SIZE + self.routing_key.len() + self.payload.len()
    }
}
