//! Byte-stream sources feeding the frame parser.
//!
//! The parser consumes one byte at a time through the [`ByteSource`]
//! capability.  Two interchangeable sources exist:
//!
//! | Source | Delivery | Used for |
//! |---|---|---|
//! | [`RingBuffer`] | push: BLE notifications are written in | transparent-UART over BLE |
//! | [`SerialBridge`] | pull: bytes are read from an `AsyncRead` on demand | wired serial adapters |
//!
//! Unlike the discovery queue, both paths are lossless: a full ring buffer
//! suspends the writer instead of truncating its payload.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::central::NotificationSink;
use crate::error::LinkClosed;

/// A byte-at-a-time stream with an explicit close.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Wait for the next byte.  Fails with [`LinkClosed`] once the source has
    /// been closed, including for reads already waiting at that moment.
    async fn read_byte(&self) -> Result<u8, LinkClosed>;

    /// Number of bytes that can be read without waiting.
    fn buffered(&self) -> usize;

    /// Close the source.  Idempotent.
    fn close(&self);
}

// ── Ring storage ──────────────────────────────────────────────────────────────

struct Ring {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
    closed: bool,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
            closed: false,
        }
    }

    /// Copy as much of `data` as fits; returns the number of bytes stored.
    fn push(&mut self, data: &[u8]) -> usize {
        let cap = self.buf.len();
        let n = data.len().min(cap - self.len);
        for (i, &b) in data[..n].iter().enumerate() {
            self.buf[(self.head + self.len + i) % cap] = b;
        }
        self.len += n;
        n
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let b = self.buf[self.head];
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        Some(b)
    }
}

// ── RingBuffer ────────────────────────────────────────────────────────────────

/// Fixed-capacity single-producer / single-consumer byte queue.
///
/// The producer is the BLE notification pump (through [`NotificationSink`]),
/// the consumer is the frame parser.  The mutex is held only for the
/// push/pop bookkeeping; waiting happens on two [`Notify`]s outside it.
pub struct RingBuffer {
    ring: Mutex<Ring>,
    /// Signalled after bytes are pushed (or on close).
    readable: Notify,
    /// Signalled after bytes are popped (or on close).
    writable: Notify,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            ring: Mutex::new(Ring::new(capacity)),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        // No critical section can panic half-way, so a poisoned ring is
        // still consistent.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Store as much of `data` as currently fits without waiting.
    pub fn try_write(&self, data: &[u8]) -> Result<usize, LinkClosed> {
        let n = {
            let mut ring = self.lock();
            if ring.closed {
                return Err(LinkClosed);
            }
            ring.push(data)
        };
        if n > 0 {
            self.readable.notify_one();
        }
        Ok(n)
    }

    /// Store all of `data`, waiting for the consumer whenever the buffer is
    /// full.  Fails if the buffer is closed before everything was stored.
    pub async fn write(&self, mut data: &[u8]) -> Result<(), LinkClosed> {
        while !data.is_empty() {
            let space = self.writable.notified();
            let n = self.try_write(data)?;
            data = &data[n..];
            if n == 0 {
                space.await;
            }
        }
        Ok(())
    }

    /// Pop one byte if one is available.
    pub fn try_read_byte(&self) -> Result<Option<u8>, LinkClosed> {
        let popped = {
            let mut ring = self.lock();
            if ring.closed {
                return Err(LinkClosed);
            }
            ring.pop()
        };
        if popped.is_some() {
            self.writable.notify_one();
        }
        Ok(popped)
    }

    /// Wait for and pop the next byte.
    pub async fn read_byte(&self) -> Result<u8, LinkClosed> {
        loop {
            let data = self.readable.notified();
            if let Some(b) = self.try_read_byte()? {
                return Ok(b);
            }
            data.await;
        }
    }

    pub fn buffered(&self) -> usize {
        self.lock().len
    }

    /// Close the buffer and wake any waiting reader or writer.
    pub fn close(&self) {
        {
            let mut ring = self.lock();
            if ring.closed {
                return;
            }
            ring.closed = true;
        }
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
        self.writable.notify_one();
    }
}

#[async_trait]
impl ByteSource for RingBuffer {
    async fn read_byte(&self) -> Result<u8, LinkClosed> {
        RingBuffer::read_byte(self).await
    }

    fn buffered(&self) -> usize {
        RingBuffer::buffered(self)
    }

    fn close(&self) {
        RingBuffer::close(self)
    }
}

#[async_trait]
impl NotificationSink for RingBuffer {
    async fn notify(&self, data: &[u8]) {
        if self.write(data).await.is_err() {
            debug!("bridge closed, dropping {} notification bytes", data.len());
        }
    }

    fn closed(&self) {
        debug!("notification link closed");
        self.close();
    }
}

// ── SerialBridge ──────────────────────────────────────────────────────────────

/// Poll-based byte source over any [`AsyncRead`] (a tty, a pipe, a socket).
///
/// Reads are held back until `startup_delay` has elapsed since construction;
/// wired adapters emit garbage while they power up.  After that the reader
/// is polled for a chunk whenever the internal buffer runs dry.  EOF closes
/// the bridge.
pub struct SerialBridge<R> {
    reader: tokio::sync::Mutex<R>,
    ring: RingBuffer,
    chunk_len: usize,
    ready_at: Instant,
    shutdown: CancellationToken,
}

impl<R> SerialBridge<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// `chunk_len` bounds a single read from `reader` and sizes the internal
    /// buffer.
    pub fn new(reader: R, startup_delay: Duration, chunk_len: usize) -> Self {
        let chunk_len = chunk_len.max(1);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            ring: RingBuffer::new(chunk_len),
            chunk_len,
            ready_at: Instant::now() + startup_delay,
            shutdown: CancellationToken::new(),
        }
    }

    async fn fill(&self) -> Result<(), LinkClosed> {
        let mut chunk = vec![0u8; self.chunk_len];
        let mut reader = self.reader.lock().await;
        let read = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(LinkClosed),
            read = reader.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => {
                debug!("serial source reached EOF");
                self.close_inner();
                Err(LinkClosed)
            }
            Ok(n) => {
                // The ring is empty when fill() runs and holds chunk_len bytes.
                self.ring.try_write(&chunk[..n]).map(|_| ())
            }
            Err(e) => {
                debug!("serial read failed: {e}");
                self.close_inner();
                Err(LinkClosed)
            }
        }
    }

    fn close_inner(&self) {
        self.shutdown.cancel();
        self.ring.close();
    }
}

#[async_trait]
impl<R> ByteSource for SerialBridge<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_byte(&self) -> Result<u8, LinkClosed> {
        tokio::select! {
            _ = self.shutdown.cancelled() => return Err(LinkClosed),
            _ = tokio::time::sleep_until(self.ready_at) => {}
        }
        loop {
            if let Some(b) = self.ring.try_read_byte()? {
                return Ok(b);
            }
            self.fill().await?;
        }
    }

    fn buffered(&self) -> usize {
        self.ring.buffered()
    }

    fn close(&self) {
        self.close_inner();
    }
}
