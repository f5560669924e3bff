//! Paged ring buffer backing connection I/O.
//!
//! The buffer addresses an unbounded byte space with three cursors:
//!
//! ```text
//!   head          position          length
//!    |-----------------|----------------|
//!    oldest byte       read/write       highest byte
//!    still needed      cursor           written
//! ```
//!
//! `head <= position <= length` always holds. Storage is a queue of fixed-size
//! blocks; once `head` moves past a block it is returned to a small pool and
//! reused for new data. Page views never cross a block boundary, so callers
//! moving large spans (socket reads and writes, stream payloads) loop page by
//! page.

use crate::error::ProtocolError;
use crate::RING_BUFFER_BLOCK_SIZE;
use bytes::Buf;
use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// Number of released blocks kept around for reuse.
const MAX_POOLED_BLOCKS: usize = 4;

/// A growable, block-structured circular byte buffer.
pub struct RingBuffer {
    block_size: usize,
    blocks: VecDeque<Box<[u8]>>,
    /// Absolute index of `blocks[0]`.
    first_block: u64,
    pool: Vec<Box<[u8]>>,
    head: u64,
    position: u64,
    length: u64,
}

impl RingBuffer {
    /// Creates a ring buffer with the default block size.
    pub fn new() -> Self {
        Self::with_block_size(RING_BUFFER_BLOCK_SIZE)
    }

    /// Creates a ring buffer with the given block size.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0, "ring buffer block size must be non-zero");
        Self {
            block_size,
            blocks: VecDeque::new(),
            first_block: 0,
            pool: Vec::new(),
            head: 0,
            position: 0,
            length: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Bytes between `position` and `length`.
    pub fn available(&self) -> u64 {
        self.length - self.position
    }

    /// Bytes between `head` and `length`.
    pub fn buffered(&self) -> u64 {
        self.length - self.head
    }

    /// Number of blocks currently backing live data.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Moves the read/write cursor.
    ///
    /// # Panics
    ///
    /// Panics if `position` is outside `[head, length]`.
    pub fn set_position(&mut self, position: u64) {
        assert!(
            position >= self.head && position <= self.length,
            "ring position {} outside [{}, {}]",
            position,
            self.head,
            self.length
        );
        self.position = position;
    }

    /// Extends the buffer to `length` bytes. The contents of the grown region
    /// are unspecified until written.
    ///
    /// # Panics
    ///
    /// Panics if `length` is below the current position.
    pub fn set_length(&mut self, length: u64) {
        assert!(
            length >= self.position,
            "ring length {} below position {}",
            length,
            self.position
        );
        self.ensure_capacity(length);
        self.length = length;
    }

    /// Discards everything from `at` onwards, pulling `position` back if needed.
    ///
    /// # Panics
    ///
    /// Panics if `at` is outside `[head, length]`.
    pub fn truncate(&mut self, at: u64) {
        assert!(
            at >= self.head && at <= self.length,
            "ring truncate {} outside [{}, {}]",
            at,
            self.head,
            self.length
        );
        self.length = at;
        self.position = self.position.min(at);
    }

    /// Marks everything before `head` as consumed and recycles whole blocks
    /// that are no longer reachable.
    ///
    /// # Panics
    ///
    /// Panics if `head` moves backwards or past `position`.
    pub fn set_head(&mut self, head: u64) {
        assert!(
            head >= self.head && head <= self.position,
            "ring head {} outside [{}, {}]",
            head,
            self.head,
            self.position
        );
        self.head = head;

        let block_size = self.block_size as u64;
        while !self.blocks.is_empty() && (self.first_block + 1) * block_size <= self.head {
            if let Some(block) = self.blocks.pop_front() {
                if self.pool.len() < MAX_POOLED_BLOCKS {
                    self.pool.push(block);
                }
            }
            self.first_block += 1;
        }

        if self.blocks.is_empty() {
            self.first_block = self.head / block_size;
        }
    }

    /// Writes `data` at `position`, growing `length` when writing past it.
    pub fn write(&mut self, data: &[u8]) {
        let end = self.position + data.len() as u64;
        self.ensure_capacity(end);

        let mut written = 0;
        while written < data.len() {
            let chunk = self.slice_mut_at(self.position, data.len() - written);
            let n = chunk.len();
            chunk.copy_from_slice(&data[written..written + n]);
            written += n;
            self.position += n as u64;
        }

        if self.position > self.length {
            self.length = self.position;
        }
    }

    /// Reads exactly `buf.len()` bytes from `position`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.require(buf.len() as u64)?;

        let mut filled = 0;
        while filled < buf.len() {
            let chunk = self.slice_at(self.position, buf.len() - filled);
            let n = chunk.len();
            buf[filled..filled + n].copy_from_slice(chunk);
            filled += n;
            self.position += n as u64;
        }
        Ok(())
    }

    /// Advances `position` by `count` bytes without copying them.
    pub fn skip(&mut self, count: u64) -> Result<(), ProtocolError> {
        self.require(count)?;
        self.position += count;
        Ok(())
    }

    /// Returns a read view starting at `offset`, bounded by the block
    /// boundary, by `length` and by `max`.
    pub fn page(&self, offset: u64, max: usize) -> Result<&[u8], ProtocolError> {
        self.check_range(offset)?;
        let max = max.min((self.length - offset) as usize);
        Ok(self.slice_at(offset, max))
    }

    /// Writable equivalent of [`page`](Self::page).
    pub fn page_mut(&mut self, offset: u64, max: usize) -> Result<&mut [u8], ProtocolError> {
        self.check_range(offset)?;
        let max = max.min((self.length - offset) as usize);
        Ok(self.slice_mut_at(offset, max))
    }

    /// Returns the writable remainder of the block holding `length`, for
    /// reading socket data in place. Commit with [`set_length`](Self::set_length).
    pub fn write_buffer(&mut self) -> &mut [u8] {
        self.ensure_capacity(self.length + 1);
        let block_size = self.block_size;
        self.slice_mut_at(self.length, block_size)
    }

    /// Returns a `Buf` over the next `len` bytes at `position`.
    pub fn reader(&mut self, len: usize) -> Result<RingReader<'_>, ProtocolError> {
        self.require(len as u64)?;
        Ok(RingReader {
            ring: self,
            remaining: len,
        })
    }

    /// Copies `len` bytes from `position` into `sink`, one page at a time.
    pub fn read_to<W: Write + ?Sized>(&mut self, sink: &mut W, len: u64) -> io::Result<()> {
        self.require(len).map_err(to_io)?;

        let mut remaining = len;
        while remaining > 0 {
            let max = remaining.min(self.block_size as u64) as usize;
            let chunk = self.slice_at(self.position, max);
            let n = chunk.len();
            sink.write_all(chunk)?;
            self.position += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Appends `len` bytes read from `source` directly into block storage.
    ///
    /// `position` must be at `length`.
    pub fn write_from<R: Read + ?Sized>(&mut self, source: &mut R, len: u64) -> io::Result<()> {
        debug_assert_eq!(self.position, self.length);

        let mut remaining = len;
        while remaining > 0 {
            let to_boundary = self.block_size - (self.position % self.block_size as u64) as usize;
            let n = (remaining.min(to_boundary as u64)) as usize;
            let start = self.position;
            self.set_length(self.length + n as u64);
            let page = self.slice_mut_at(start, n);
            if let Err(e) = source.read_exact(page) {
                self.truncate(start);
                return Err(e);
            }
            self.position += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    fn require(&self, needed: u64) -> Result<(), ProtocolError> {
        let available = self.available();
        if available < needed {
            return Err(ProtocolError::BufferUnderflow { needed, available });
        }
        Ok(())
    }

    fn check_range(&self, offset: u64) -> Result<(), ProtocolError> {
        if offset < self.head || offset >= self.length {
            return Err(ProtocolError::OutOfRange {
                offset,
                head: self.head,
                length: self.length,
            });
        }
        Ok(())
    }

    fn ensure_capacity(&mut self, end: u64) {
        let block_size = self.block_size as u64;
        while (self.first_block + self.blocks.len() as u64) * block_size < end {
            let block = self
                .pool
                .pop()
                .unwrap_or_else(|| vec![0u8; self.block_size].into_boxed_slice());
            self.blocks.push_back(block);
        }
    }

    fn locate(&self, offset: u64) -> (usize, usize) {
        let block_size = self.block_size as u64;
        let index = (offset / block_size - self.first_block) as usize;
        (index, (offset % block_size) as usize)
    }

    fn slice_at(&self, offset: u64, max: usize) -> &[u8] {
        let (index, local) = self.locate(offset);
        let n = (self.block_size - local).min(max);
        &self.blocks[index][local..local + n]
    }

    fn slice_mut_at(&mut self, offset: u64, max: usize) -> &mut [u8] {
        let (index, local) = self.locate(offset);
        let n = (self.block_size - local).min(max);
        &mut self.blocks[index][local..local + n]
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("block_size", &self.block_size)
            .field("blocks", &self.blocks.len())
            .field("head", &self.head)
            .field("position", &self.position)
            .field("length", &self.length)
            .finish()
    }
}

fn to_io(err: ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string())
}

/// A bounded `Buf` view over a ring buffer, advancing its position as it is
/// consumed. Lets protobuf decoding run directly against ring pages.
pub struct RingReader<'a> {
    ring: &'a mut RingBuffer,
    remaining: usize,
}

impl Buf for RingReader<'_> {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        if self.remaining == 0 {
            return &[];
        }
        self.ring.slice_at(self.ring.position, self.remaining)
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining, "advance past end of ring reader");
        self.ring.position += cnt as u64;
        self.remaining -= cnt;
    }
}
