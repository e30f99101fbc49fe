//! Buffered big-endian reader over a shared file handle.
//!
//! Cursors read records through this: a window buffer anchored at an
//! absolute file position, refilled in bulk. The underlying handle is shared
//! with the appender (and other cursors on the same segment), so every
//! refill locks the handle and re-seeks before reading; between refills no
//! lock is held. Repositioning inside the current window is an O(1) cursor
//! move and only invalidates the window when the target falls outside it.

use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Buf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use loghouse_core::Result;

/// File handle shared between the appender and any number of readers.
pub(crate) type SharedFile = Arc<Mutex<File>>;

pub(crate) const CHANNEL_BUFFER_SIZE: usize = 8192;

#[derive(Debug)]
pub(crate) struct ChannelReader {
    file: SharedFile,
    buf: Box<[u8]>,
    /// Read cursor inside `buf`.
    pos: usize,
    /// End of valid data inside `buf`.
    end: usize,
    /// Absolute file position of the byte just past `buf[end]`.
    window_end: u64,
}

impl ChannelReader {
    pub(crate) fn new(file: SharedFile, position: u64, capacity: usize) -> Self {
        Self {
            file,
            buf: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            end: 0,
            window_end: position,
        }
    }

    /// Absolute file position of the next byte this reader will return.
    pub(crate) fn position(&self) -> u64 {
        self.window_end - (self.end - self.pos) as u64
    }

    /// Move to an absolute position. Targets inside the window are a cursor
    /// move; anything else drops the window.
    #[allow(dead_code)]
    pub(crate) fn set_position(&mut self, target: u64) {
        if target == self.position() {
            return;
        }
        let window_start = self.window_end - self.end as u64;
        if target < window_start || target >= self.window_end {
            self.pos = 0;
            self.end = 0;
            self.window_end = target;
        } else {
            self.pos = (target - window_start) as usize;
        }
    }

    /// Skip forward without touching the file.
    pub(crate) fn skip(&mut self, n: u64) {
        let remaining = (self.end - self.pos) as u64;
        if n < remaining {
            self.pos += n as usize;
        } else {
            self.pos = 0;
            self.end = 0;
            self.window_end += n - remaining;
        }
    }

    /// Refill the window, preserving unread bytes at the front. The shared
    /// handle is locked and re-seeked for each fill so concurrent appends on
    /// the same handle cannot disturb us.
    async fn fill(&mut self) -> Result<()> {
        let remaining = self.end - self.pos;
        self.buf.copy_within(self.pos..self.end, 0);
        self.pos = 0;
        self.end = remaining;

        let n = {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(self.window_end)).await?;
            file.read(&mut self.buf[self.end..]).await?
        };
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read past end of file at position {}", self.window_end),
            )
            .into());
        }
        self.end += n;
        self.window_end += n as u64;
        Ok(())
    }

    async fn require(&mut self, n: usize) -> Result<()> {
        while self.end - self.pos < n {
            self.fill().await?;
        }
        Ok(())
    }

    pub(crate) async fn read_u8(&mut self) -> Result<u8> {
        self.require(1).await?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    #[allow(dead_code)]
    pub(crate) async fn read_i16(&mut self) -> Result<i16> {
        self.require(2).await?;
        let mut window = &self.buf[self.pos..];
        let v = window.get_i16();
        self.pos += 2;
        Ok(v)
    }

    pub(crate) async fn read_u16(&mut self) -> Result<u16> {
        self.require(2).await?;
        let mut window = &self.buf[self.pos..];
        let v = window.get_u16();
        self.pos += 2;
        Ok(v)
    }

    #[allow(dead_code)]
    pub(crate) async fn read_i32(&mut self) -> Result<i32> {
        self.require(4).await?;
        let mut window = &self.buf[self.pos..];
        let v = window.get_i32();
        self.pos += 4;
        Ok(v)
    }

    pub(crate) async fn read_u32(&mut self) -> Result<u32> {
        self.require(4).await?;
        let mut window = &self.buf[self.pos..];
        let v = window.get_u32();
        self.pos += 4;
        Ok(v)
    }

    pub(crate) async fn read_i64(&mut self) -> Result<i64> {
        self.require(8).await?;
        let mut window = &self.buf[self.pos..];
        let v = window.get_i64();
        self.pos += 8;
        Ok(v)
    }

    /// Bulk read into a caller buffer, refilling as needed.
    pub(crate) async fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < dst.len() {
            if self.pos == self.end {
                self.fill().await?;
            }
            let n = (dst.len() - off).min(self.end - self.pos);
            dst[off..off + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            off += n;
        }
        Ok(())
    }
}
