//! Segment Files
//!
//! A segment is one append-only file holding a contiguous id-range of
//! messages: a fixed 4096-byte header (magic, capacity, checkpoint length
//! and a time/id histogram) followed by message records. New records are
//! always appended at the end. The full byte layout lives in
//! `loghouse_core::format`.
//!
//! ## Crash Safety
//!
//! The header stores the file length at the last checkpoint. Recovery from a
//! crash is simply truncating the file back to that length: everything below
//! it was fsynced before the length was written, so it is known-good, and
//! anything past it may be a torn write. This discards messages appended
//! since the last checkpoint but needs no per-record checksums and is very
//! fast. A failed append never moves the in-memory length, so readers only
//! ever observe complete records.
//!
//! ## Histogram
//!
//! The header carries up to 340 buckets of (first relative id, first unix
//! second, message count), one per `(capacity - 4096) / 340` bytes of
//! records. Buckets are maintained in memory during appends; only a
//! checkpoint writes them out. They let an id or timestamp seek jump close
//! to the right file position instead of scanning the whole segment, and
//! they feed the per-segment timeline.
//!
//! ## Sharing
//!
//! The buffer hands the current segment to many cursors as `Arc<Segment>`;
//! old segments get a fresh `Segment` per cursor. Appends and checkpoints
//! serialise on the state mutex; cursors only take the file-handle mutex,
//! and only while refilling their read window.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use loghouse_core::format::{
    BUCKETS_OFFSET, BUCKET_SIZE, MAX_BUCKETS, MAX_ROUTING_KEY_SIZE, RECORD_HEADER_SIZE,
    RECORD_TYPE_MESSAGE, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC,
};
use loghouse_core::{Error, Result};

use crate::channel::{ChannelReader, SharedFile, CHANNEL_BUFFER_SIZE};

/// A single segment file. Created by the buffer at rollover (writable,
/// shared) or by a cursor reaching an older segment (reader-owned).
#[derive(Debug)]
pub(crate) struct Segment {
    path: PathBuf,
    first_id: u64,
    file: SharedFile,
    state: Mutex<SegmentState>,
}

#[derive(Debug)]
struct SegmentState {
    /// In-memory copy of the 4096-byte header; written out by checkpoints.
    header: Box<[u8]>,
    /// Current file length. Advanced only after a write fully completes.
    length: u64,
    last_checkpoint_length: u64,
    max_file_size: u64,
    bytes_per_bucket: u64,
    /// Live (in-progress) histogram bucket; flushed into `header` when the
    /// next bucket starts and at checkpoint.
    bucket: Option<Bucket>,
    bucket_index: usize,
    message_count: u64,
    most_recent_timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bucket {
    first_relative_id: u32,
    first_timestamp_secs: u32,
    count: u32,
}

/// One histogram bucket as surfaced to timeline queries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HistogramBucket {
    pub(crate) first_message_id: u64,
    pub(crate) first_timestamp_secs: u32,
    pub(crate) count: u32,
    pub(crate) size: u64,
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

fn unix_secs(timestamp: i64) -> u32 {
    (timestamp / 1000) as u32
}

impl Segment {
    /// Open an existing segment or create a new one.
    ///
    /// For an existing file the capacity comes from the header and
    /// `max_file_size` is ignored; recovery truncates anything past the last
    /// checkpoint. A new file requires `max_file_size` (at least the header
    /// size) and gets a fresh header with checkpoint length 4096.
    pub(crate) async fn open(
        path: &Path,
        first_id: u64,
        max_file_size: Option<u32>,
    ) -> Result<Segment> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;
        let file_size = file.metadata().await?.len();

        let state = if file_size == 0 {
            let max = max_file_size.ok_or_else(|| {
                Error::OutOfRange(format!(
                    "max file size required to create segment [{}]",
                    path.display()
                ))
            })?;
            if (max as u64) < SEGMENT_HEADER_SIZE {
                return Err(Error::OutOfRange(format!(
                    "max file size {max} below minimum {SEGMENT_HEADER_SIZE}"
                )));
            }
            let mut header = vec![0u8; SEGMENT_HEADER_SIZE as usize].into_boxed_slice();
            put_u16(&mut header, 0, SEGMENT_MAGIC);
            put_u32(&mut header, 4, max);
            put_u32(&mut header, 8, SEGMENT_HEADER_SIZE as u32);
            file.write_all(&header).await?;
            SegmentState {
                header,
                length: SEGMENT_HEADER_SIZE,
                last_checkpoint_length: SEGMENT_HEADER_SIZE,
                max_file_size: max as u64,
                bytes_per_bucket: (max as u64 - SEGMENT_HEADER_SIZE) / MAX_BUCKETS as u64,
                bucket: None,
                bucket_index: 0,
                message_count: 0,
                most_recent_timestamp: 0,
            }
        } else {
            if file_size < SEGMENT_HEADER_SIZE {
                return Err(Error::BadFormat(format!(
                    "segment [{}] is shorter than its header",
                    path.display()
                )));
            }
            let mut header = vec![0u8; SEGMENT_HEADER_SIZE as usize].into_boxed_slice();
            file.read_exact(&mut header).await?;

            let magic = get_u16(&header, 0);
            if magic != SEGMENT_MAGIC {
                return Err(Error::BadFormat(format!(
                    "bad magic 0x{magic:04x} in [{}]",
                    path.display()
                )));
            }
            let max = get_u32(&header, 4) as u64;
            if max < SEGMENT_HEADER_SIZE {
                return Err(Error::BadFormat(format!(
                    "max file size {max} in [{}] below minimum {SEGMENT_HEADER_SIZE}",
                    path.display()
                )));
            }
            let checkpoint = get_u32(&header, 8) as u64;
            if checkpoint < SEGMENT_HEADER_SIZE || checkpoint > file_size {
                return Err(Error::BadFormat(format!(
                    "checkpoint length {checkpoint} does not fit file size {file_size} in [{}]",
                    path.display()
                )));
            }
            if checkpoint < file_size {
                // torn tail from a crash mid-append
                file.set_len(checkpoint).await?;
                tracing::warn!(
                    file = %path.display(),
                    dropped = file_size - checkpoint,
                    "truncated segment to last checkpoint"
                );
            }

            // The bucket area ends at the first all-zero bucket. Bucket 0
            // legitimately starts at relative id 0, so scan from index 1.
            let mut live = MAX_BUCKETS;
            for i in 1..MAX_BUCKETS {
                if bucket_parse(&header, i) == ZERO_BUCKET {
                    live = i;
                    break;
                }
            }
            let (bucket, bucket_index, message_count) = if bucket_parse(&header, 0) == ZERO_BUCKET
            {
                (None, 0, 0)
            } else {
                let total: u64 = (0..live).map(|i| bucket_parse(&header, i).count as u64).sum();
                (Some(bucket_parse(&header, live - 1)), live - 1, total)
            };
            // the live bucket's first timestamp is the closest the header
            // gets to the most recent append; without it a reopened
            // segment would report no recent timestamp at all
            let most_recent_timestamp = bucket
                .map(|b| b.first_timestamp_secs as i64 * 1000)
                .unwrap_or(0);

            SegmentState {
                header,
                length: checkpoint,
                last_checkpoint_length: checkpoint,
                max_file_size: max,
                bytes_per_bucket: (max - SEGMENT_HEADER_SIZE) / MAX_BUCKETS as u64,
                bucket,
                bucket_index,
                message_count,
                most_recent_timestamp,
            }
        };

        Ok(Segment {
            path: path.to_path_buf(),
            first_id,
            file: Arc::new(Mutex::new(file)),
            state: Mutex::new(state),
        })
    }

    /// Id of the first message in this segment (from the file name).
    pub(crate) fn first_message_id(&self) -> u64 {
        self.first_id
    }

    pub(crate) async fn length(&self) -> u64 {
        self.state.lock().await.length
    }

    /// Id the next appended message would get.
    pub(crate) async fn next_message_id(&self) -> u64 {
        self.first_id + (self.state.lock().await.length - SEGMENT_HEADER_SIZE)
    }

    pub(crate) async fn message_count(&self) -> u64 {
        self.state.lock().await.message_count
    }

    /// Timestamp of the most recently appended message. On a reopened
    /// segment this is the last histogram bucket's first timestamp (second
    /// granularity) until the next append; 0 only for an empty segment.
    pub(crate) async fn most_recent_timestamp(&self) -> i64 {
        self.state.lock().await.most_recent_timestamp
    }

    /// Append a message and return its id.
    ///
    /// Returns `SegmentFull` when the record does not fit in the remaining
    /// capacity; the buffer turns that into a rollover.
    pub(crate) async fn append(
        &self,
        timestamp: i64,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64> {
        let key = routing_key.as_bytes();
        if key.len() > MAX_ROUTING_KEY_SIZE {
            return Err(Error::OutOfRange(format!(
                "routing key of {} bytes exceeds {MAX_ROUTING_KEY_SIZE}",
                key.len()
            )));
        }
        let record_size = (RECORD_HEADER_SIZE + key.len() + payload.len()) as u64;

        let mut state = self.state.lock().await;
        if state.length + record_size > state.max_file_size {
            return Err(Error::SegmentFull);
        }
        let start = state.length;

        let mut buf = BytesMut::with_capacity(record_size as usize);
        buf.put_u8(RECORD_TYPE_MESSAGE);
        buf.put_i64(timestamp);
        buf.put_u16(key.len() as u16);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(key);
        buf.put_slice(payload);

        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(start)).await?;
            file.write_all(&buf).await?;
        }
        // the length moves only once the whole record is on the file, so a
        // failed write leaves a tail for recovery to truncate
        state.length = start + record_size;

        let relative_id = start - SEGMENT_HEADER_SIZE;
        state.note_append(relative_id, timestamp);
        Ok(self.first_id + relative_id)
    }

    /// Sync all record data, then publish the new length (and histogram) in
    /// the header. The data fsync happens before the length moves, so after
    /// any crash every byte below the stored checkpoint length is good. The
    /// header write itself is only fsynced when `force` is set.
    pub(crate) async fn checkpoint(&self, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut file = self.file.lock().await;
        file.sync_all().await?;
        if state.length != state.last_checkpoint_length {
            let length = state.length as u32;
            put_u32(&mut state.header, 8, length);
            state.flush_live_bucket();
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(&state.header).await?;
            state.last_checkpoint_length = state.length;
            if force {
                file.sync_all().await?;
            }
        }
        Ok(())
    }

    /// Cursor positioned exactly at `message_id`, which must be a record
    /// boundary inside this segment (or its end, for tailing). Ids between
    /// records go through [`Segment::cursor_at_or_after`] instead.
    pub(crate) async fn cursor(self: &Arc<Self>, message_id: u64) -> Result<SegmentCursor> {
        let length = self.length().await;
        let span = length - SEGMENT_HEADER_SIZE;
        if message_id < self.first_id || message_id > self.first_id + span {
            return Err(Error::OutOfRange(format!(
                "message id {message_id} not in segment [{}]",
                self.path.display()
            )));
        }
        let position = SEGMENT_HEADER_SIZE + (message_id - self.first_id);
        Ok(SegmentCursor::new(Arc::clone(self), position, None, None))
    }

    /// Cursor that surfaces the first record with id >= `message_id`. The
    /// id may fall between records: the histogram narrows the start to a
    /// bucket boundary and the cursor scans forward from there.
    pub(crate) async fn cursor_at_or_after(
        self: &Arc<Self>,
        message_id: u64,
    ) -> Result<SegmentCursor> {
        let length = self.length().await;
        let span = length - SEGMENT_HEADER_SIZE;
        if message_id < self.first_id || message_id > self.first_id + span {
            return Err(Error::OutOfRange(format!(
                "message id {message_id} not in segment [{}]",
                self.path.display()
            )));
        }
        if message_id == self.first_id + span {
            // right at the end; only new appends can satisfy the cursor
            return Ok(SegmentCursor::new(
                Arc::clone(self),
                SEGMENT_HEADER_SIZE + span,
                None,
                None,
            ));
        }
        // bucket starts never move once created, so looking the bucket up
        // and reading its start under separate locks is fine
        let position = match self.find_bucket_by_id(message_id).await {
            Some(i) => {
                let state = self.state.lock().await;
                SEGMENT_HEADER_SIZE + state.bucket_at(i).first_relative_id as u64
            }
            None => SEGMENT_HEADER_SIZE,
        };
        Ok(SegmentCursor::new(
            Arc::clone(self),
            position,
            Some(message_id),
            None,
        ))
    }

    /// Cursor that will surface the first record with timestamp >= `timestamp`.
    ///
    /// The histogram narrows the starting position; the cursor then scans
    /// forward past older records. Meaningful when timestamps are appended
    /// in non-decreasing order.
    pub(crate) async fn cursor_by_timestamp(self: &Arc<Self>, timestamp: i64) -> Result<SegmentCursor> {
        let state = self.state.lock().await;
        let position = match state.find_seek_bucket(unix_secs(timestamp)) {
            Some(i) => SEGMENT_HEADER_SIZE + state.bucket_at(i).first_relative_id as u64,
            None => SEGMENT_HEADER_SIZE,
        };
        drop(state);
        Ok(SegmentCursor::new(
            Arc::clone(self),
            position,
            None,
            Some(timestamp),
        ))
    }

    /// Snapshot of the histogram with bucket sizes resolved.
    pub(crate) async fn histogram(&self) -> Vec<HistogramBucket> {
        let state = self.state.lock().await;
        let n = state.bucket_count();
        (0..n)
            .map(|i| {
                let b = state.bucket_at(i);
                let size = if i + 1 < n {
                    (state.bucket_at(i + 1).first_relative_id - b.first_relative_id) as u64
                } else {
                    state.length - SEGMENT_HEADER_SIZE - b.first_relative_id as u64
                };
                HistogramBucket {
                    first_message_id: self.first_id + b.first_relative_id as u64,
                    first_timestamp_secs: b.first_timestamp_secs,
                    count: b.count,
                    size,
                }
            })
            .collect()
    }

    /// Index of the bucket covering `message_id`; ids at or past the last
    /// bucket's start belong to the last bucket. `None` when the segment has
    /// no buckets or the id sits before the first one.
    pub(crate) async fn find_bucket_by_id(&self, message_id: u64) -> Option<usize> {
        if message_id < self.first_id {
            return None;
        }
        let state = self.state.lock().await;
        state.find_bucket_by_relative_id(message_id - self.first_id)
    }
}

const ZERO_BUCKET: Bucket = Bucket {
    first_relative_id: 0,
    first_timestamp_secs: 0,
    count: 0,
};

fn bucket_parse(header: &[u8], i: usize) -> Bucket {
    let off = BUCKETS_OFFSET + i * BUCKET_SIZE;
    Bucket {
        first_relative_id: get_u32(header, off),
        first_timestamp_secs: get_u32(header, off + 4),
        count: get_u32(header, off + 8),
    }
}

impl SegmentState {
    fn bucket_count(&self) -> usize {
        if self.bucket.is_some() {
            self.bucket_index + 1
        } else {
            0
        }
    }

    /// Bucket `i`, reading the live one from memory and flushed ones from
    /// the header buffer.
    fn bucket_at(&self, i: usize) -> Bucket {
        if let Some(b) = self.bucket {
            if i == self.bucket_index {
                return b;
            }
        }
        bucket_parse(&self.header, i)
    }

    fn flush_live_bucket(&mut self) {
        if let Some(b) = self.bucket {
            let off = BUCKETS_OFFSET + self.bucket_index * BUCKET_SIZE;
            put_u32(&mut self.header, off, b.first_relative_id);
            put_u32(&mut self.header, off + 4, b.first_timestamp_secs);
            put_u32(&mut self.header, off + 8, b.count);
        }
    }

    /// Histogram bookkeeping for one appended record.
    fn note_append(&mut self, relative_id: u64, timestamp: i64) {
        let secs = unix_secs(timestamp);
        match self.bucket {
            None => {
                self.bucket = Some(Bucket {
                    first_relative_id: relative_id as u32,
                    first_timestamp_secs: secs,
                    count: 1,
                });
                self.bucket_index = 0;
            }
            Some(b)
                if relative_id - b.first_relative_id as u64 >= self.bytes_per_bucket
                    && self.bucket_index < MAX_BUCKETS - 1 =>
            {
                // the live bucket is complete; everything past bucket 339
                // piles into the last bucket instead
                self.flush_live_bucket();
                self.bucket_index += 1;
                self.bucket = Some(Bucket {
                    first_relative_id: relative_id as u32,
                    first_timestamp_secs: secs,
                    count: 1,
                });
            }
            Some(ref mut b) => b.count += 1,
        }
        self.message_count += 1;
        self.most_recent_timestamp = timestamp;
    }

    /// Bucket whose id span covers `relative_id`; ids at or past the last
    /// bucket's start belong to the last bucket.
    fn find_bucket_by_relative_id(&self, relative_id: u64) -> Option<usize> {
        let n = self.bucket_count();
        if n == 0 || (self.bucket_at(0).first_relative_id as u64) > relative_id {
            return None;
        }
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.bucket_at(mid).first_relative_id as u64 <= relative_id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Some(lo - 1)
    }

    /// Last bucket starting strictly before the target second, so a forward
    /// scan from it can never skip a qualifying record even when adjacent
    /// buckets share a second. `None` means scan from the start of the
    /// segment.
    fn find_seek_bucket(&self, target_secs: u32) -> Option<usize> {
        let n = self.bucket_count();
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.bucket_at(mid).first_timestamp_secs < target_secs {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            None
        } else {
            Some(lo - 1)
        }
    }
}

/// Forward iterator over the records of one segment. Starts "before" its
/// first record; `next` advances and exposes the record fields, leaving the
/// payload unread until asked for.
#[derive(Debug)]
pub(crate) struct SegmentCursor {
    segment: Arc<Segment>,
    input: ChannelReader,
    id: u64,
    timestamp: i64,
    routing_key: String,
    /// Unread payload bytes of the current record; skipped by the next
    /// `next` if never fetched.
    payload_size: usize,
    /// Set when the requested id fell between records: the scan starts at a
    /// bucket boundary and records below this id are skipped.
    skip_until_id: Option<u64>,
    /// Set by timestamp cursors: records older than this are skipped.
    skip_until_timestamp: Option<i64>,
}

impl SegmentCursor {
    fn new(
        segment: Arc<Segment>,
        position: u64,
        skip_until_id: Option<u64>,
        skip_until_timestamp: Option<i64>,
    ) -> Self {
        let input = ChannelReader::new(segment.file.clone(), position, CHANNEL_BUFFER_SIZE);
        Self {
            segment,
            input,
            id: 0,
            timestamp: 0,
            routing_key: String::new(),
            payload_size: 0,
            skip_until_id,
            skip_until_timestamp,
        }
    }

    pub(crate) fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Advance to the next record, or return false at the end of the
    /// segment. Calling again after false is fine: an append in the
    /// meantime makes it return true.
    pub(crate) async fn next(&mut self) -> Result<bool> {
        loop {
            if self.payload_size > 0 {
                self.input.skip(self.payload_size as u64);
                self.payload_size = 0;
            }

            let length = self.segment.length().await;
            if self.input.position() >= length {
                return Ok(false);
            }
            let start = self.input.position();

            let record_type = self.input.read_u8().await?;
            if record_type != RECORD_TYPE_MESSAGE {
                return Err(Error::Corrupt(format!(
                    "unexpected record type 0x{record_type:02x} at {start} in [{}]",
                    self.segment.path.display()
                )));
            }
            let timestamp = self.input.read_i64().await?;
            let key_size = self.input.read_u16().await? as usize;
            let payload_size = self.input.read_u32().await? as u64;
            if self.input.position() + key_size as u64 + payload_size > length {
                return Err(Error::Corrupt(format!(
                    "record at {start} extends beyond length {length} in [{}]",
                    self.segment.path.display()
                )));
            }

            let mut key = vec![0u8; key_size];
            self.input.read_exact(&mut key).await?;
            self.routing_key = String::from_utf8_lossy(&key).into_owned();
            self.id = self.segment.first_id + (start - SEGMENT_HEADER_SIZE);
            self.timestamp = timestamp;
            self.payload_size = payload_size as usize;

            if let Some(target) = self.skip_until_id {
                if self.id < target {
                    continue;
                }
                self.skip_until_id = None;
            }
            if let Some(target) = self.skip_until_timestamp {
                if timestamp < target {
                    continue;
                }
                self.skip_until_timestamp = None;
            }
            return Ok(true);
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub(crate) fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub(crate) fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Read the current record's payload. A second call returns empty.
    pub(crate) async fn payload(&mut self) -> Result<Bytes> {
        let mut buf = vec![0u8; self.payload_size];
        self.input.read_exact(&mut buf).await?;
        self.payload_size = 0;
        Ok(Bytes::from(buf))
    }
}
