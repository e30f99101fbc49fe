//! Message Buffer - the segment directory
//!
//! This module implements `MessageBuffer`, which composes the segment files
//! in one directory into a single logical, append-only log.
//!
//! ## What Does MessageBuffer Do?
//!
//! 1. **Routes appends** to the current (last) segment
//! 2. **Rolls over** to a fresh segment when an append no longer fits
//! 3. **Evicts** the oldest segments once the configured size cap is passed
//! 4. **Creates cursors** that seek by message id or timestamp and then
//!    stream forward across segment boundaries
//! 5. **Drives durability**: explicit `sync`, plus a re-armed auto-sync
//!    task after appends
//!
//! ## Architecture
//!
//! ```text
//! MessageBuffer
//!     │
//!     ├─ 0000000000000000-0000000000000000.qdb   (read-only)
//!     ├─ 0000000000002000-0000000000001f40.qdb   (read-only)
//!     └─ 0000000000004000-0000000000003e80.qdb   (current, shared)
//!            ▲                    ▲
//!            appends        cursors tailing for new data
//! ```
//!
//! Segment files are named `<first id>-<first timestamp>` in fixed-width
//! hex, so lexicographic order is id order and the whole index can be
//! rebuilt from a directory listing. Ids are dense across boundaries: the
//! first id of segment i+1 equals the first id of segment i plus its
//! payload bytes.
//!
//! ## Thread Safety
//!
//! All bookkeeping (the entry list, the current segment, the waiting-cursor
//! list) sits behind one mutex that is only held for bookkeeping, never
//! while notifying cursors. Blocked cursors are woken from a snapshot of
//! the waiting list after the lock is dropped, so a cursor closing
//! concurrently can never deadlock against an appender.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

use loghouse_core::format::{parse_segment_file_name, segment_file_name, SEGMENT_HEADER_SIZE, SEGMENT_SUFFIX};
use loghouse_core::{Error, Result};

use crate::config::BufferConfig;
use crate::cursor::{CursorShared, MessageCursor};
use crate::segment::{Segment, SegmentCursor};
use crate::timeline::{Timeline, TimelinePoint};

/// Compact the entry list once this many evicted entries pile up at its head.
const ENTRY_COMPACT_THRESHOLD: usize = 512;

/// A disk-backed message log in one directory.
///
/// Appends go to the tail; any number of cursors replay forward from a
/// message id or timestamp, optionally blocking for new data. Survives
/// crashes by checkpoint-truncation recovery, at the cost of losing at most
/// the un-synced tail of recent appends.
#[derive(Debug)]
pub struct MessageBuffer {
    inner: Arc<BufferInner>,
}

#[derive(Debug)]
pub(crate) struct BufferInner {
    dir: PathBuf,
    segment_length: u64,
    max_payload_size: usize,
    auto_sync_interval: Duration,
    background_cleanup: bool,
    max_length: AtomicU64,
    closed: AtomicBool,
    state: Mutex<DirState>,
    /// Cursors blocked in `next_timeout`, woken after each append.
    waiting: std::sync::Mutex<Vec<Weak<CursorShared>>>,
    sync_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// One directory entry per segment, oldest first from index `first`.
#[derive(Debug, Clone, Copy)]
struct SegmentEntry {
    first_id: u64,
    first_timestamp: i64,
}

#[derive(Debug)]
struct DirState {
    entries: Vec<SegmentEntry>,
    /// Index of the oldest live entry; eviction advances it.
    first: usize,
    /// First id handed to the initial segment of an empty buffer.
    seed_first_id: u64,
    current: Option<Arc<Segment>>,
    /// Length of the last file, tracked until `current` is actually opened.
    last_file_length: u64,
}

impl DirState {
    fn live(&self) -> &[SegmentEntry] {
        &self.entries[self.first..]
    }

    fn is_empty(&self) -> bool {
        self.first == self.entries.len()
    }

    fn push_entry(&mut self, entry: SegmentEntry) {
        if self.first >= ENTRY_COMPACT_THRESHOLD {
            self.entries.drain(..self.first);
            self.first = 0;
        }
        self.entries.push(entry);
    }
}

/// A segment picked under the directory lock; old segments are opened after
/// the lock is dropped.
enum Resolved {
    Shared(Arc<Segment>),
    Open { path: PathBuf, first_id: u64 },
}

impl MessageBuffer {
    /// Open the buffer in `dir`, creating the directory if needed. Existing
    /// segment files are indexed from their names alone; nothing is read
    /// until an append or cursor touches a segment.
    pub async fn open(dir: impl AsRef<Path>, config: BufferConfig) -> Result<MessageBuffer> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let mut names = Vec::new();
        let mut listing = fs::read_dir(&dir).await?;
        while let Some(entry) = listing.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(SEGMENT_SUFFIX) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut entries = Vec::with_capacity(names.len());
        for name in &names {
            let (first_id, first_timestamp) = parse_segment_file_name(name)?;
            entries.push(SegmentEntry {
                first_id,
                first_timestamp,
            });
        }
        let last_file_length = match names.last() {
            Some(name) => fs::metadata(dir.join(name)).await?.len(),
            None => 0,
        };

        tracing::info!(
            dir = %dir.display(),
            segments = entries.len(),
            "opened message buffer"
        );

        Ok(MessageBuffer {
            inner: Arc::new(BufferInner {
                dir,
                segment_length: config.resolved_segment_length(),
                max_payload_size: config.resolved_max_payload_size(),
                auto_sync_interval: config.auto_sync_interval,
                background_cleanup: config.background_cleanup,
                max_length: AtomicU64::new(config.max_length),
                closed: AtomicBool::new(false),
                state: Mutex::new(DirState {
                    entries,
                    first: 0,
                    seed_first_id: config.first_message_id,
                    current: None,
                    last_file_length,
                }),
                waiting: std::sync::Mutex::new(Vec::new()),
                sync_task: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Is this buffer still accepting operations?
    pub fn is_open(&self) -> bool {
        !self.inner.is_closed()
    }

    /// Append a message and return its id.
    pub async fn append(&self, timestamp: i64, routing_key: &str, payload: &[u8]) -> Result<u64> {
        self.inner.append(timestamp, routing_key, payload).await
    }

    /// Append a message whose payload is streamed from a reader. Exactly
    /// `payload_size` bytes are consumed; the record hits the file as one
    /// gathered write, so the payload is buffered first.
    pub async fn append_stream<R>(
        &self,
        timestamp: i64,
        routing_key: &str,
        payload: &mut R,
        payload_size: usize,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        if payload_size > self.inner.max_payload_size {
            return Err(Error::MessageTooLarge {
                size: payload_size,
                max: self.inner.max_payload_size,
            });
        }
        let mut buf = vec![0u8; payload_size];
        payload.read_exact(&mut buf).await?;
        self.inner.append(timestamp, routing_key, &buf).await
    }

    /// Id the next appended message will get.
    pub async fn next_message_id(&self) -> Result<u64> {
        self.inner.check_open()?;
        let mut state = self.inner.state.lock().await;
        if state.is_empty() {
            return Ok(state.seed_first_id);
        }
        let current = self.inner.ensure_current_open(&mut state).await?;
        Ok(current.next_message_id().await)
    }

    /// Cursor reading the first record with id >= `message_id` onwards; the
    /// id may fall between records.
    ///
    /// Use 0 for the oldest message and [`next_message_id`] for tailing only
    /// new messages; ids below the oldest surviving message clamp up to it,
    /// ids past the end fail with `OutOfRange`. Cursors are single-consumer:
    /// they take `&mut self` and are not meant to be shared.
    ///
    /// [`next_message_id`]: MessageBuffer::next_message_id
    pub async fn cursor(&self, message_id: u64) -> Result<MessageCursor> {
        self.inner.check_open()?;
        let next = self.next_message_id().await?;
        if message_id > next {
            return Err(Error::OutOfRange(format!(
                "message id {message_id} past end of buffer {next}"
            )));
        }

        let mut state = self.inner.state.lock().await;
        if state.is_empty() {
            return Ok(MessageCursor::detached(Arc::clone(&self.inner)));
        }
        let (index, start_id) = {
            let live = state.live();
            let start_id = message_id.max(live[0].first_id);
            let n = live.partition_point(|e| e.first_id <= start_id);
            (state.first + n - 1, start_id)
        };
        let resolved = self.inner.resolve_at(&mut state, index).await?;
        drop(state);

        let segment = self.inner.materialize(resolved).await?;
        let cursor = segment.cursor_at_or_after(start_id).await?;
        Ok(MessageCursor::attached(Arc::clone(&self.inner), cursor))
    }

    /// Cursor reading the first record with timestamp >= `timestamp`
    /// onwards. Meaningful when appends carry non-decreasing timestamps; if
    /// every record is older, the cursor tails for new data.
    pub async fn cursor_by_timestamp(&self, timestamp: i64) -> Result<MessageCursor> {
        self.inner.check_open()?;
        let mut state = self.inner.state.lock().await;
        if state.is_empty() {
            return Ok(MessageCursor::detached(Arc::clone(&self.inner)));
        }
        let index = {
            let live = state.live();
            // start at the last segment beginning strictly before the
            // target: with duplicate timestamps at rollover the match may
            // sit in an earlier segment than the rightmost candidate
            let n = live.partition_point(|e| e.first_timestamp < timestamp);
            state.first + n.saturating_sub(1)
        };
        let resolved = self.inner.resolve_at(&mut state, index).await?;
        drop(state);

        let segment = self.inner.materialize(resolved).await?;
        let cursor = segment.cursor_by_timestamp(timestamp).await?;
        Ok(MessageCursor::attached(Arc::clone(&self.inner), cursor))
    }

    /// Total bytes this buffer occupies on disk.
    pub async fn length(&self) -> Result<u64> {
        let state = self.inner.state.lock().await;
        self.inner.total_length(&state).await
    }

    /// Number of segment files.
    pub async fn segment_count(&self) -> usize {
        self.inner.state.lock().await.live().len()
    }

    /// Number of messages across all segments, answered from the segment
    /// histograms.
    pub async fn message_count(&self) -> Result<u64> {
        self.inner.check_open()?;
        let (entries, current) = {
            let state = self.inner.state.lock().await;
            (state.live().to_vec(), state.current.clone())
        };
        let Some((last, older)) = entries.split_last() else {
            return Ok(0);
        };
        let mut total = 0u64;
        for e in older {
            let seg = self.inner.open_entry(e).await?;
            total += seg.message_count().await;
        }
        total += match current {
            Some(seg) => seg.message_count().await,
            None => self.inner.open_entry(last).await?.message_count().await,
        };
        Ok(total)
    }

    /// Size cap in bytes; 0 means unlimited.
    pub fn max_length(&self) -> u64 {
        self.inner.max_length.load(Ordering::Relaxed)
    }

    /// Change the size cap and evict immediately if now over it.
    pub async fn set_max_length(&self, bytes: u64) -> Result<()> {
        self.inner.max_length.store(bytes, Ordering::Relaxed);
        self.inner.cleanup().await
    }

    /// Largest payload accepted by append.
    pub fn max_payload_size(&self) -> usize {
        self.inner.max_payload_size
    }

    /// Capacity of each segment file in bytes. Smaller segments give the
    /// histogram finer grain but put more files on disk.
    pub fn segment_length(&self) -> u64 {
        self.inner.segment_length
    }

    /// Delete oldest segments until the buffer fits its cap again. Runs
    /// automatically at rollover; callable directly after external changes.
    pub async fn cleanup(&self) -> Result<()> {
        self.inner.cleanup().await
    }

    /// Checkpoint the current segment with a durable fsync. After this
    /// returns, no prior append can be lost to a crash.
    pub async fn sync(&self) -> Result<()> {
        self.inner.sync_current().await
    }

    /// High-level timeline: one point per segment plus a trailing marker at
    /// (next message id, most recent timestamp). Message counts are unknown
    /// at this granularity and read as 0. `None` when the buffer is empty.
    pub async fn timeline(&self) -> Result<Option<Timeline>> {
        self.inner.check_open()?;
        let mut state = self.inner.state.lock().await;
        if state.is_empty() {
            return Ok(None);
        }
        let current = self.inner.ensure_current_open(&mut state).await?;
        let mut points: Vec<TimelinePoint> = state
            .live()
            .iter()
            .map(|e| TimelinePoint {
                id: e.first_id,
                timestamp: e.first_timestamp,
                count: 0,
            })
            .collect();
        let most_recent = current.most_recent_timestamp().await;
        let timestamp = if most_recent == 0 {
            points[points.len() - 1].timestamp
        } else {
            most_recent
        };
        points.push(TimelinePoint {
            id: current.next_message_id().await,
            timestamp,
            count: 0,
        });
        Ok(Some(Timeline::new(points)))
    }

    /// Detailed timeline from approximately `message_id` onwards: one point
    /// per histogram bucket of the segment holding that id, with real
    /// bucket counts. `None` when the message has been evicted or the
    /// buffer is empty.
    pub async fn timeline_at(&self, message_id: u64) -> Result<Option<Timeline>> {
        self.inner.check_open()?;
        let mut state = self.inner.state.lock().await;
        if state.is_empty() {
            return Ok(None);
        }
        let index = {
            let live = state.live();
            if message_id < live[0].first_id {
                return Ok(None);
            }
            let n = live.partition_point(|e| e.first_id <= message_id);
            state.first + n - 1
        };
        let resolved = self.inner.resolve_at(&mut state, index).await?;
        drop(state);

        let segment = self.inner.materialize(resolved).await?;
        let histogram = segment.histogram().await;
        if histogram.is_empty() {
            return Ok(None);
        }
        let mut points: Vec<TimelinePoint> = histogram
            .iter()
            .map(|b| TimelinePoint {
                id: b.first_message_id,
                timestamp: b.first_timestamp_secs as i64 * 1000,
                count: b.count as i64,
            })
            .collect();
        let most_recent = segment.most_recent_timestamp().await;
        let timestamp = if most_recent == 0 {
            points[points.len() - 1].timestamp
        } else {
            most_recent
        };
        points.push(TimelinePoint {
            id: segment.next_message_id().await,
            timestamp,
            count: 0,
        });
        Ok(Some(Timeline::new(points)))
    }

    /// Checkpoint and release the current segment, cancel the pending
    /// auto-sync and wake every blocked cursor with `CursorClosed`. Further
    /// operations fail; closing twice is fine.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl BufferInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::CursorClosed);
        }
        Ok(())
    }

    async fn append(
        self: &Arc<Self>,
        timestamp: i64,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64> {
        self.check_open()?;
        if payload.len() > self.max_payload_size {
            return Err(Error::MessageTooLarge {
                size: payload.len(),
                max: self.max_payload_size,
            });
        }

        let mut rolled = false;
        let id = {
            let mut state = self.state.lock().await;
            let current = if state.is_empty() {
                let entry = self.seed_entry(&state, timestamp);
                self.create_segment(&mut state, entry).await?
            } else {
                self.ensure_current_open(&mut state).await?
            };
            match current.append(timestamp, routing_key, payload).await {
                Ok(id) => id,
                Err(Error::SegmentFull) => {
                    rolled = true;
                    self.roll_over(&mut state, &current, timestamp, routing_key, payload)
                        .await?
                }
                Err(err) => return Err(err),
            }
        };

        if rolled {
            if self.background_cleanup {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = inner.cleanup().await {
                        tracing::warn!(error = %err, "background cleanup failed");
                    }
                });
            } else {
                self.cleanup().await?;
            }
        }
        // outside the directory lock, per the lock ordering rules
        self.notify_waiting();
        self.arm_auto_sync();
        Ok(id)
    }

    fn seed_entry(&self, state: &DirState, timestamp: i64) -> SegmentEntry {
        SegmentEntry {
            first_id: state.seed_first_id,
            first_timestamp: timestamp,
        }
    }

    async fn create_segment(
        &self,
        state: &mut DirState,
        entry: SegmentEntry,
    ) -> Result<Arc<Segment>> {
        let path = self
            .dir
            .join(segment_file_name(entry.first_id, entry.first_timestamp));
        let segment = Arc::new(
            Segment::open(&path, entry.first_id, Some(self.segment_length as u32)).await?,
        );
        state.push_entry(entry);
        state.current = Some(Arc::clone(&segment));
        Ok(segment)
    }

    async fn roll_over(
        &self,
        state: &mut DirState,
        current: &Arc<Segment>,
        timestamp: i64,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64> {
        let first_id = current.next_message_id().await;
        // the rotated file is immutable from here on; its final length must
        // be durable in the header before anyone re-opens the file, or
        // recovery could truncate live records
        current.checkpoint(true).await?;
        let segment = self
            .create_segment(
                state,
                SegmentEntry {
                    first_id,
                    first_timestamp: timestamp,
                },
            )
            .await?;
        tracing::debug!(
            dir = %self.dir.display(),
            first_id,
            "rolled over to a new segment"
        );
        match segment.append(timestamp, routing_key, payload).await {
            Ok(id) => Ok(id),
            Err(Error::SegmentFull) => Err(Error::MessageTooLarge {
                size: payload.len(),
                max: self.max_payload_size,
            }),
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn ensure_current_open(
        &self,
        state: &mut DirState,
    ) -> Result<Arc<Segment>> {
        if let Some(segment) = &state.current {
            return Ok(Arc::clone(segment));
        }
        let Some(entry) = state.live().last().copied() else {
            return Err(Error::OutOfRange("buffer is empty".to_string()));
        };
        let segment = Arc::new(
            Segment::open(
                &self
                    .dir
                    .join(segment_file_name(entry.first_id, entry.first_timestamp)),
                entry.first_id,
                None,
            )
            .await?,
        );
        state.current = Some(Arc::clone(&segment));
        Ok(segment)
    }

    async fn open_entry(&self, entry: &SegmentEntry) -> Result<Arc<Segment>> {
        Ok(Arc::new(
            Segment::open(
                &self
                    .dir
                    .join(segment_file_name(entry.first_id, entry.first_timestamp)),
                entry.first_id,
                None,
            )
            .await?,
        ))
    }

    /// Pick the segment at `index` (absolute into the entry list) under the
    /// lock; the last entry shares the current segment, older ones are
    /// opened by the caller after the lock is dropped.
    async fn resolve_at(&self, state: &mut DirState, index: usize) -> Result<Resolved> {
        if index + 1 == state.entries.len() {
            Ok(Resolved::Shared(self.ensure_current_open(state).await?))
        } else {
            let entry = state.entries[index];
            Ok(Resolved::Open {
                path: self
                    .dir
                    .join(segment_file_name(entry.first_id, entry.first_timestamp)),
                first_id: entry.first_id,
            })
        }
    }

    async fn materialize(&self, resolved: Resolved) -> Result<Arc<Segment>> {
        match resolved {
            Resolved::Shared(segment) => Ok(segment),
            Resolved::Open { path, first_id } => {
                Ok(Arc::new(Segment::open(&path, first_id, None).await?))
            }
        }
    }

    /// Oldest segment for a cursor that was created on an empty buffer;
    /// `None` while the buffer stays empty.
    pub(crate) async fn attach_oldest(&self) -> Result<Option<SegmentCursor>> {
        let resolved = {
            let mut state = self.state.lock().await;
            if state.is_empty() {
                return Ok(None);
            }
            let index = state.first;
            self.resolve_at(&mut state, index).await?
        };
        let segment = self.materialize(resolved).await?;
        let first = segment.first_message_id();
        Ok(Some(segment.cursor(first).await?))
    }

    /// Successor of `segment` for a cursor that exhausted it: `None` while
    /// tailing the current segment, `OutOfRange` when the cursor's segment
    /// was evicted underneath it. Resolution is by first id, so it stays
    /// correct across entry-list compaction.
    pub(crate) async fn advance_from(
        &self,
        segment: &Arc<Segment>,
    ) -> Result<Option<SegmentCursor>> {
        let resolved = {
            let mut state = self.state.lock().await;
            if let Some(current) = &state.current {
                if Arc::ptr_eq(current, segment) {
                    return Ok(None);
                }
            }
            let index = {
                let live = state.live();
                if live.is_empty() {
                    return Ok(None);
                }
                let first_id = segment.first_message_id();
                if first_id < live[0].first_id {
                    return Err(Error::OutOfRange(format!(
                        "segment with first id {first_id} was evicted"
                    )));
                }
                let n = live.partition_point(|e| e.first_id <= first_id);
                if n >= live.len() {
                    return Ok(None);
                }
                state.first + n
            };
            self.resolve_at(&mut state, index).await?
        };
        let next = self.materialize(resolved).await?;
        let first = next.first_message_id();
        Ok(Some(next.cursor(first).await?))
    }

    async fn total_length(&self, state: &DirState) -> Result<u64> {
        let live = state.live();
        let count = live.len() as u64;
        if count == 0 {
            return Ok(0);
        }
        let last_length = match &state.current {
            Some(segment) => segment.length().await,
            None => state.last_file_length,
        };
        Ok((count - 1) * SEGMENT_HEADER_SIZE + (live[live.len() - 1].first_id - live[0].first_id)
            + last_length)
    }

    pub(crate) async fn cleanup(&self) -> Result<()> {
        loop {
            let doomed = {
                let mut state = self.state.lock().await;
                let max = self.max_length.load(Ordering::Relaxed);
                // the last segment is never evicted: it anchors the next id
                if max == 0 || state.live().len() <= 1 {
                    return Ok(());
                }
                if self.total_length(&state).await? <= max {
                    return Ok(());
                }
                let entry = state.entries[state.first];
                state.first += 1;
                self.dir
                    .join(segment_file_name(entry.first_id, entry.first_timestamp))
            };
            tracing::info!(file = %doomed.display(), "evicting oldest segment");
            // cursors holding the file open keep reading their descriptor
            fs::remove_file(&doomed).await?;
        }
    }

    pub(crate) async fn sync_current(&self) -> Result<()> {
        let current = { self.state.lock().await.current.clone() };
        if let Some(segment) = current {
            segment.checkpoint(true).await?;
        }
        Ok(())
    }

    /// Re-arm the auto-sync task if none is pending. One shot: the task
    /// syncs once after the interval and the next append arms it again.
    fn arm_auto_sync(self: &Arc<Self>) {
        if self.auto_sync_interval.is_zero() || self.is_closed() {
            return;
        }
        let mut slot = self.sync_task_guard();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let inner = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.auto_sync_interval).await;
            if inner.is_closed() {
                return;
            }
            if let Err(err) = inner.sync_current().await {
                tracing::warn!(error = %err, "auto-sync failed");
            }
        }));
    }

    pub(crate) fn register_waiter(&self, shared: &Arc<CursorShared>) {
        let mut waiting = self.waiting_guard();
        waiting.retain(|w| w.strong_count() > 0);
        if !waiting
            .iter()
            .any(|w| w.as_ptr() == Arc::as_ptr(shared))
        {
            waiting.push(Arc::downgrade(shared));
        }
    }

    pub(crate) fn deregister_waiter(&self, shared: &Arc<CursorShared>) {
        self.waiting_guard()
            .retain(|w| w.strong_count() > 0 && w.as_ptr() != Arc::as_ptr(shared));
    }

    /// Wake every registered cursor. Works on a snapshot taken under the
    /// list lock and notifies outside it: never hold a buffer lock and a
    /// cursor's own synchronisation at the same time.
    fn notify_waiting(&self) {
        let snapshot: Vec<Arc<CursorShared>> = self
            .waiting_guard()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for cursor in snapshot {
            cursor.wake();
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.sync_task_guard().take() {
            task.abort();
        }
        let current = {
            let mut state = self.state.lock().await;
            if let Some(segment) = state.current.clone() {
                state.last_file_length = segment.length().await;
            }
            state.current.take()
        };
        if let Some(segment) = current {
            segment.checkpoint(true).await?;
        }
        let waiters: Vec<Arc<CursorShared>> = self
            .waiting_guard()
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        for cursor in waiters {
            cursor.close();
        }
        tracing::info!(dir = %self.dir.display(), "closed message buffer");
        Ok(())
    }

    pub(crate) fn cursor_cancelled(&self) -> bool {
        self.is_closed()
    }

    fn waiting_guard(&self) -> std::sync::MutexGuard<'_, Vec<Weak<CursorShared>>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sync_task_guard(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
        self.sync_task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::warn!(
                dir = %self.dir.display(),
                "message buffer dropped without close; unsynced appends may be lost on crash"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn config(segment_length: u64) -> BufferConfig {
        BufferConfig {
            segment_length,
            max_payload_size: segment_length as usize,
            auto_sync_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Append a message whose total on-disk size is `size` bytes.
    async fn append_sized(buffer: &MessageBuffer, timestamp: i64, size: usize) -> u64 {
        let payload = vec![0u8; size - 15];
        buffer.append(timestamp, "", &payload).await.unwrap()
    }

    fn list_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_first_message_id_and_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(
            dir.path(),
            BufferConfig {
                first_message_id: 0x1234,
                ..config(1 << 20)
            },
        )
        .await
        .unwrap();

        assert_eq!(append_sized(&buffer, 0x5678, 256).await, 0x1234);
        assert_eq!(
            list_files(dir.path()),
            vec!["0000000000001234-0000000000005678.qdb"]
        );
        buffer.sync().await.unwrap();
        assert_eq!(
            std::fs::metadata(dir.path().join("0000000000001234-0000000000005678.qdb"))
                .unwrap()
                .len(),
            4096 + 256
        );
        buffer.close().await.unwrap();

        // ids continue after reopen
        let buffer = MessageBuffer::open(dir.path(), config(1 << 20)).await.unwrap();
        assert_eq!(buffer.next_message_id().await.unwrap(), 0x1334);
        assert_eq!(append_sized(&buffer, 0x5678, 256).await, 0x1334);
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_rolls_over_and_counts_length() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(dir.path(), config(10000 + 4096)).await.unwrap();
        assert_eq!(buffer.segment_count().await, 0);
        assert_eq!(buffer.length().await.unwrap(), 0);

        let ts = 1_700_000_000_000i64;
        assert_eq!(append_sized(&buffer, ts, 5000).await, 0);
        assert_eq!(append_sized(&buffer, ts, 5000).await, 5000);
        assert_eq!(buffer.segment_count().await, 1);
        assert_eq!(buffer.length().await.unwrap(), 10000 + 4096);

        assert_eq!(append_sized(&buffer, ts, 5000).await, 10000);
        assert_eq!(buffer.segment_count().await, 2);
        assert_eq!(buffer.length().await.unwrap(), 15000 + 2 * 4096);

        assert_eq!(append_sized(&buffer, ts, 5000).await, 15000);
        assert_eq!(buffer.segment_count().await, 2);
        assert_eq!(buffer.length().await.unwrap(), 20000 + 2 * 4096);

        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollover_returns_id_in_new_segment() {
        let dir = tempfile::tempdir().unwrap();
        // capacity for exactly one 100-byte payload per segment
        let buffer = MessageBuffer::open(dir.path(), config(4096 + 115)).await.unwrap();
        let first = buffer.append(1, "", &[0u8; 100]).await.unwrap();
        assert_eq!(first, 0);
        let second = buffer.append(2, "", &[0u8; 100]).await.unwrap();
        assert_eq!(second, 115);
        assert_eq!(buffer.segment_count().await, 2);
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(
            dir.path(),
            BufferConfig {
                segment_length: 1 << 20,
                max_payload_size: 1024,
                auto_sync_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = buffer.append(0, "", &[0u8; 1025]).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { size: 1025, max: 1024 }));
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest_segments() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(dir.path(), config(8192 + 4096)).await.unwrap();
        for _ in 0..4 {
            append_sized(&buffer, 0, 8192).await;
        }
        assert_eq!(
            list_files(dir.path()),
            vec![
                "0000000000000000-0000000000000000.qdb",
                "0000000000002000-0000000000000000.qdb",
                "0000000000004000-0000000000000000.qdb",
                "0000000000006000-0000000000000000.qdb",
            ]
        );

        buffer.set_max_length((8192 + 4096) * 2).await.unwrap();
        assert_eq!(
            list_files(dir.path()),
            vec![
                "0000000000004000-0000000000000000.qdb",
                "0000000000006000-0000000000000000.qdb",
            ]
        );

        // the last segment survives any cap
        buffer.set_max_length(1).await.unwrap();
        assert_eq!(
            list_files(dir.path()),
            vec!["0000000000006000-0000000000000000.qdb"]
        );
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_cleanup_on_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let segment = 8192u64 + 4096;
        let buffer = MessageBuffer::open(
            dir.path(),
            BufferConfig {
                max_length: segment * 3,
                ..config(segment)
            },
        )
        .await
        .unwrap();
        for i in 0..4 {
            append_sized(&buffer, i, 8192).await;
        }
        // four segments were written; eviction kept the three newest
        assert_eq!(
            list_files(dir.path()),
            vec![
                "0000000000002000-0000000000000001.qdb",
                "0000000000004000-0000000000000002.qdb",
                "0000000000006000-0000000000000003.qdb",
            ]
        );
        assert!(buffer.length().await.unwrap() <= segment * 3);
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_publishes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(dir.path(), config(1 << 20)).await.unwrap();
        append_sized(&buffer, 0, 8192).await;

        let path = dir.path().join("0000000000000000-0000000000000000.qdb");
        let stored = |p: &Path| {
            let raw = std::fs::read(p).unwrap();
            u32::from_be_bytes(raw[8..12].try_into().unwrap())
        };
        // header still carries the creation checkpoint until a sync
        assert_eq!(stored(&path), 4096);
        buffer.sync().await.unwrap();
        assert_eq!(stored(&path), 4096 + 8192);
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_rejects_malformed_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("not-a-segment.qdb"), b"junk").unwrap();
        let err = MessageBuffer::open(dir.path(), config(1 << 20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)), "{err}");
    }

    #[tokio::test]
    async fn test_cursor_past_end_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(dir.path(), config(1 << 20)).await.unwrap();
        append_sized(&buffer, 0, 100).await;
        let next = buffer.next_message_id().await.unwrap();
        assert!(buffer.cursor(next).await.is_ok());
        assert!(matches!(
            buffer.cursor(next + 1).await.unwrap_err(),
            Error::OutOfRange(_)
        ));
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_count_spans_segments() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(dir.path(), config(8192 + 4096)).await.unwrap();
        for i in 0..6 {
            append_sized(&buffer, i, 4096).await;
        }
        assert_eq!(buffer.segment_count().await, 3);
        assert_eq!(buffer.message_count().await.unwrap(), 6);
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeline_projection() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(dir.path(), config(8192 + 4096)).await.unwrap();
        assert!(buffer.timeline().await.unwrap().is_none());

        for i in 0..4i64 {
            append_sized(&buffer, (i + 1) * 1000, 4096).await;
        }
        let timeline = buffer.timeline().await.unwrap().unwrap();
        // two full segments plus the trailing marker
        assert_eq!(timeline.size(), 3);
        assert_eq!(timeline.message_id(0), 0);
        assert_eq!(timeline.message_id(1), 8192);
        assert_eq!(timeline.message_id(2), 16384);
        assert_eq!(timeline.bytes(0), 8192);
        assert_eq!(timeline.bytes(2), 0);
        assert_eq!(timeline.timestamp(0), 1000);
        assert_eq!(timeline.timestamp(1), 3000);
        assert_eq!(timeline.timestamp(2), 4000);
        assert_eq!(timeline.count(0), 0);
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeline_at_exposes_bucket_counts() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(dir.path(), config(1 << 20)).await.unwrap();
        for i in 0..10i64 {
            buffer
                .append(i * 1000, "k", format!("payload-{i}").as_bytes())
                .await
                .unwrap();
        }
        let timeline = buffer.timeline_at(0).await.unwrap().unwrap();
        assert!(timeline.size() >= 2);
        let total: i64 = (0..timeline.size() - 1).map(|i| timeline.count(i)).sum();
        assert_eq!(total, 10);
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_stream() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(dir.path(), config(1 << 20)).await.unwrap();
        let payload = b"streamed payload bytes".to_vec();
        let mut reader = std::io::Cursor::new(payload.clone());
        let id = buffer
            .append_stream(42, "stream", &mut reader, payload.len())
            .await
            .unwrap();

        let mut cursor = buffer.cursor(id).await.unwrap();
        assert!(cursor.next().await.unwrap());
        assert_eq!(cursor.routing_key(), "stream");
        assert_eq!(cursor.payload().await.unwrap(), Bytes::from(payload));
        buffer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(dir.path(), config(1 << 20)).await.unwrap();
        append_sized(&buffer, 0, 100).await;
        assert!(buffer.is_open());
        buffer.close().await.unwrap();
        assert!(!buffer.is_open());
        assert!(matches!(
            buffer.append(0, "", b"x").await.unwrap_err(),
            Error::CursorClosed
        ));
        assert!(matches!(
            buffer.cursor(0).await.unwrap_err(),
            Error::CursorClosed
        ));
        // closing again is a no-op
        buffer.close().await.unwrap();
    }
}
