//! # loghouse-storage
//!
//! An embedded, disk-backed message log: an append-only queue of
//! (timestamp, routing key, payload) records that supports sequential
//! replay from any message id or wall-clock timestamp, survives crashes by
//! checkpoint-truncation recovery, and reclaims space by dropping its
//! oldest segments.
//!
//! ## Usage
//!
//! ```ignore
//! use loghouse_storage::{BufferConfig, MessageBuffer};
//!
//! let buffer = MessageBuffer::open(
//!     "./data/events",
//!     BufferConfig {
//!         max_length: 10 * 1024 * 1024 * 1024, // keep ~10 GiB of history
//!         ..Default::default()
//!     },
//! )
//! .await?;
//!
//! // producers append
//! let id = buffer.append(now_ms, "orders", payload).await?;
//!
//! // consumers replay and tail
//! let mut cursor = buffer.cursor(0).await?;
//! while cursor.next_timeout(None).await? {
//!     handle(cursor.id(), cursor.routing_key(), cursor.payload().await?);
//! }
//! ```
//!
//! ## Durability
//!
//! Appends are durable once [`MessageBuffer::sync`] returns (or the
//! auto-sync interval has passed and its checkpoint completed). A crash
//! before that loses at most the un-synced tail of recent appends; it never
//! corrupts the log, because recovery truncates each segment back to its
//! last checkpoint.

mod buffer;
mod channel;
mod config;
mod cursor;
mod segment;
mod timeline;

pub use buffer::MessageBuffer;
pub use config::BufferConfig;
pub use cursor::MessageCursor;
pub use timeline::Timeline;

pub use loghouse_core::{Error, Record, Result};
