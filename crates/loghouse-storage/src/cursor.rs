//! Cursors over the whole buffer.
//!
//! A `MessageCursor` wraps a segment cursor and transparently steps to the
//! next segment when the wrapped one is exhausted, so callers see one
//! continuous stream. On the current segment `next` returns `false` instead
//! of advancing — call it again later (or use `next_timeout`) to tail new
//! appends.
//!
//! Blocking works through a small shared handle per cursor: the buffer
//! keeps a weak reference on its waiting list and pokes the handle's
//! `Notify` after every append; closing the cursor (or the whole buffer)
//! flips the closed flag and pokes it again, which surfaces `CursorClosed`
//! to a blocked caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use loghouse_core::{Error, Record, Result};

use crate::buffer::BufferInner;
use crate::segment::SegmentCursor;

/// Wake-up and cancellation state shared between a cursor, the buffer's
/// waiting list and whoever closes either of them.
#[derive(Debug)]
pub(crate) struct CursorShared {
    notify: Notify,
    closed: AtomicBool,
}

impl CursorShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// Forward iterator over the buffer's messages.
///
/// Starts "before" its first message; each successful `next` exposes one
/// record through the field accessors. Not for sharing between tasks — it
/// takes `&mut self` throughout.
#[derive(Debug)]
pub struct MessageCursor {
    buffer: Arc<BufferInner>,
    shared: Arc<CursorShared>,
    /// `None` until a cursor created on an empty buffer sees its first
    /// segment appear.
    inner: Option<SegmentCursor>,
}

impl MessageCursor {
    pub(crate) fn detached(buffer: Arc<BufferInner>) -> Self {
        Self {
            buffer,
            shared: CursorShared::new(),
            inner: None,
        }
    }

    pub(crate) fn attached(buffer: Arc<BufferInner>, cursor: SegmentCursor) -> Self {
        Self {
            buffer,
            shared: CursorShared::new(),
            inner: Some(cursor),
        }
    }

    /// Advance to the next message, or return `false` when the end of the
    /// buffer is reached. Calling again after `false` is fine: once another
    /// message has been appended it returns `true` again.
    pub async fn next(&mut self) -> Result<bool> {
        if self.shared.is_closed() || self.buffer.cursor_cancelled() {
            return Err(Error::CursorClosed);
        }
        loop {
            match &mut self.inner {
                None => match self.buffer.attach_oldest().await? {
                    None => return Ok(false),
                    Some(cursor) => self.inner = Some(cursor),
                },
                Some(cursor) => {
                    if cursor.next().await? {
                        return Ok(true);
                    }
                    let segment = Arc::clone(cursor.segment());
                    match self.buffer.advance_from(&segment).await? {
                        None => return Ok(false),
                        // replacing the cursor releases its segment handle
                        Some(next) => self.inner = Some(next),
                    }
                }
            }
        }
    }

    /// Like [`next`], but block up to `timeout` for a new message instead
    /// of returning `false` at the end of the buffer. `None` waits forever.
    /// Returns `false` on timeout; closing the cursor (or the buffer) wakes
    /// the call with `CursorClosed`.
    ///
    /// [`next`]: MessageCursor::next
    pub async fn next_timeout(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.buffer.register_waiter(&self.shared);
        let result = self.next_blocking(timeout).await;
        self.buffer.deregister_waiter(&self.shared);
        result
    }

    async fn next_blocking(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            // arm the wake-up before polling so an append landing between
            // the poll and the wait is not lost
            let shared = Arc::clone(&self.shared);
            let notified = shared.notified();
            if self.next().await? {
                return Ok(true);
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(false);
                    }
                }
            }
            if self.shared.is_closed() || self.buffer.cursor_cancelled() {
                return Err(Error::CursorClosed);
            }
        }
    }

    /// Id of the current message. Valid after `next` returned `true`.
    pub fn id(&self) -> u64 {
        self.inner.as_ref().map_or(0, |c| c.id())
    }

    /// Timestamp of the current message.
    pub fn timestamp(&self) -> i64 {
        self.inner.as_ref().map_or(0, |c| c.timestamp())
    }

    /// Routing key of the current message.
    pub fn routing_key(&self) -> &str {
        self.inner.as_ref().map_or("", |c| c.routing_key())
    }

    /// Payload size of the current message in bytes.
    pub fn payload_size(&self) -> usize {
        self.inner.as_ref().map_or(0, |c| c.payload_size())
    }

    /// Payload of the current message, read on demand. A repeated call
    /// returns empty.
    pub async fn payload(&mut self) -> Result<Bytes> {
        match &mut self.inner {
            Some(cursor) => cursor.payload().await,
            None => Ok(Bytes::new()),
        }
    }

    /// The current message as an owned [`Record`].
    pub async fn record(&mut self) -> Result<Record> {
        let payload = self.payload().await?;
        Ok(Record::new(
            self.id(),
            self.timestamp(),
            self.routing_key().to_string(),
            payload,
        ))
    }

    /// Release the segment handle and wake any blocked `next_timeout` with
    /// `CursorClosed`. Also happens on drop.
    pub fn close(&mut self) {
        self.shared.close();
        self.buffer.deregister_waiter(&self.shared);
        self.inner = None;
    }
}

impl Drop for MessageCursor {
    fn drop(&mut self) {
        self.shared.close();
        self.buffer.deregister_waiter(&self.shared);
    }
}
