//! Transport session: the send queue, its pump, and receive helpers.
//!
//! Outgoing packages are framed directly into a shared send ring under a
//! mutex. A single pump task drains the ring one page at a time; bytes queued
//! while a write is in flight simply accumulate. Incoming bytes are read into
//! the writable tail of a receive ring owned by the connection's I/O task.

use crate::error::ChannelError;
use parking_lot::Mutex;
use protochannel_protocol::codec::{
    write_control_package, write_error_package, write_message_package, write_stream_package,
};
use protochannel_protocol::{
    ErrorCode, MessageHeader, PackageType, ProtocolError, RingBuffer, StreamHeader,
};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

struct SendState {
    ring: RingBuffer,
    closing: bool,
    aborted: bool,
}

/// Outgoing side of a connection.
pub struct SendQueue {
    state: Mutex<SendState>,
    /// Wakes the pump when bytes are queued or the queue is closed.
    ready: Notify,
    /// Wakes producers waiting for the ring to drain.
    drained: Notify,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::with_ring(RingBuffer::new())
    }

    pub fn with_ring(ring: RingBuffer) -> Self {
        Self {
            state: Mutex::new(SendState {
                ring,
                closing: false,
                aborted: false,
            }),
            ready: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Frames bytes into the send ring under the queue lock and wakes the pump.
    ///
    /// The closure must leave the ring position at its length. A failed
    /// closure must not leave partial packages behind (the package helpers in
    /// `protochannel_protocol::codec` roll themselves back).
    pub fn send<F>(&self, frame: F) -> Result<(), ChannelError>
    where
        F: FnOnce(&mut RingBuffer) -> Result<(), ProtocolError>,
    {
        {
            let mut state = self.state.lock();
            if state.closing || state.aborted {
                return Err(ChannelError::Disposed);
            }
            frame(&mut state.ring)?;
        }
        self.ready.notify_one();
        Ok(())
    }

    pub fn send_error(&self, code: ErrorCode) -> Result<(), ChannelError> {
        tracing::debug!("Queueing error package: {}", code);
        self.send(|ring| write_error_package(ring, code))
    }

    pub fn send_control<M: prost::Message>(
        &self,
        package_type: PackageType,
        message: &M,
    ) -> Result<(), ChannelError> {
        self.send(|ring| write_control_package(ring, package_type, message))
    }

    pub fn send_message<M: prost::Message>(
        &self,
        header: MessageHeader,
        message: &M,
    ) -> Result<(), ChannelError> {
        self.send(|ring| write_message_package(ring, &header, message))
    }

    /// Sends a message whose body was already encoded.
    pub fn send_encoded(&self, header: MessageHeader, body: &[u8]) -> Result<(), ChannelError> {
        self.send(|ring| {
            let marker = protochannel_protocol::begin_package(ring);
            if let Err(e) = header.write(ring) {
                ring.truncate(marker);
                return Err(e);
            }
            ring.write(body);
            protochannel_protocol::end_package(ring, PackageType::Message, marker)
        })
    }

    pub fn send_stream_package(
        &self,
        header: StreamHeader,
        body: &[u8],
    ) -> Result<(), ChannelError> {
        self.send(|ring| write_stream_package(ring, &header, body))
    }

    /// Stops accepting packages. The pump drains what is queued, then shuts
    /// the writer down.
    pub fn close(&self) {
        self.state.lock().closing = true;
        self.ready.notify_one();
        self.drained.notify_waiters();
    }

    /// Stops accepting packages and discards anything not yet written.
    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.ready.notify_one();
        self.drained.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closing || state.aborted
    }

    /// Bytes queued but not yet written.
    pub fn pending_bytes(&self) -> u64 {
        self.state.lock().ring.buffered()
    }

    /// Waits until at most `limit` bytes are queued or the queue is closed.
    pub async fn wait_writable(&self, limit: u64) {
        loop {
            let drained = self.drained.notified();
            {
                let state = self.state.lock();
                if state.ring.buffered() <= limit || state.closing || state.aborted {
                    return;
                }
            }
            drained.await;
        }
    }

    /// Copies the next unsent page into `scratch`, returning its length.
    fn next_page(&self, scratch: &mut [u8]) -> PumpStep {
        let state = self.state.lock();
        if state.aborted {
            return PumpStep::Stop;
        }
        if state.ring.buffered() > 0 {
            let head = state.ring.head();
            return match state.ring.page(head, scratch.len()) {
                Ok(page) => {
                    scratch[..page.len()].copy_from_slice(page);
                    PumpStep::Write(page.len())
                }
                Err(_) => PumpStep::Stop,
            };
        }
        if state.closing {
            return PumpStep::Shutdown;
        }
        PumpStep::Wait
    }

    fn consumed(&self, count: usize) {
        {
            let mut state = self.state.lock();
            let head = state.ring.head() + count as u64;
            state.ring.set_head(head);
        }
        self.drained.notify_waiters();
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

enum PumpStep {
    Write(usize),
    Wait,
    Shutdown,
    Stop,
}

/// Drains the send queue into `writer` until the queue is closed and empty,
/// or aborted. A write failure aborts the queue.
pub async fn send_pump<W>(queue: &SendQueue, mut writer: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut scratch = vec![0u8; protochannel_protocol::RING_BUFFER_BLOCK_SIZE];

    loop {
        match queue.next_page(&mut scratch) {
            PumpStep::Write(n) => {
                let written = async {
                    writer.write_all(&scratch[..n]).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::debug!("Send pump write failed: {}", e);
                    queue.abort();
                    return Err(e);
                }
                queue.consumed(n);
            }
            PumpStep::Wait => queue.ready.notified().await,
            PumpStep::Shutdown => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            PumpStep::Stop => return Ok(()),
        }
    }
}

/// Writes everything queued so far without a pump task. Used during
/// connection bring-up before the pump is started.
pub async fn flush_direct<W>(queue: &SendQueue, writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut scratch = vec![0u8; protochannel_protocol::RING_BUFFER_BLOCK_SIZE];
    loop {
        match queue.next_page(&mut scratch) {
            PumpStep::Write(n) => {
                writer.write_all(&scratch[..n]).await?;
                queue.consumed(n);
            }
            _ => break,
        }
    }
    writer.flush().await
}

/// Reads once from `reader` into the writable tail of `ring` and commits the
/// bytes. Returns the number of bytes read; zero means the peer closed.
pub async fn fill<R>(reader: &mut R, ring: &mut RingBuffer) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let n = reader.read(ring.write_buffer()).await?;
    ring.set_length(ring.length() + n as u64);
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protochannel_protocol::{MessageKind, PackageReader, StreamPackageKind};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pump_delivers_packages_in_order() {
        let queue = Arc::new(SendQueue::with_ring(RingBuffer::with_block_size(8)));
        let (client, mut server) = tokio::io::duplex(64);

        let pump_queue = queue.clone();
        let pump = tokio::spawn(async move { send_pump(&pump_queue, client).await });

        for i in 0..10u16 {
            queue
                .send_stream_package(StreamHeader::new(StreamPackageKind::Data, i), &[i as u8; 5])
                .unwrap();
        }
        queue.close();

        let mut ring = RingBuffer::new();
        while fill(&mut server, &mut ring).await.unwrap() > 0 {}
        pump.await.unwrap().unwrap();

        let mut reader = PackageReader::new();
        for i in 0..10u16 {
            let package = reader.next(&mut ring).unwrap().unwrap();
            assert_eq!(package.package_type, PackageType::Stream);
            assert_eq!(package.length, 8);
            let header = StreamHeader::read(&mut ring).unwrap();
            assert_eq!(header.association_id, i);
            ring.skip(5).unwrap();
        }
        assert_eq!(ring.available(), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_is_disposed() {
        let queue = SendQueue::new();
        queue.close();
        let result = queue.send_error(ErrorCode::InvalidProtocol);
        assert!(matches!(result, Err(ChannelError::Disposed)));
    }

    #[tokio::test]
    async fn test_abort_discards_queued_bytes() {
        let queue = SendQueue::new();
        queue.send_error(ErrorCode::InvalidProtocol).unwrap();
        queue.abort();

        let (client, mut server) = tokio::io::duplex(64);
        send_pump(&queue, client).await.unwrap();

        let mut ring = RingBuffer::new();
        assert_eq!(fill(&mut server, &mut ring).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_flush_direct() {
        let queue = SendQueue::new();
        queue
            .send_message(
                MessageHeader::new(MessageKind::OneWay, 1, 0),
                &protochannel_protocol::HandshakeResponse { protocol: 2 },
            )
            .unwrap();

        let mut out = Vec::new();
        flush_direct(&queue, &mut out).await.unwrap();
        assert_eq!(queue.pending_bytes(), 0);
        assert_eq!(out[2] & 0x7, PackageType::Message as u8);
    }

    #[tokio::test]
    async fn test_wait_writable_returns_after_drain() {
        let queue = Arc::new(SendQueue::new());
        queue
            .send_stream_package(StreamHeader::new(StreamPackageKind::Data, 1), &[0u8; 100])
            .unwrap();

        let waiter_queue = queue.clone();
        let waiter = tokio::spawn(async move { waiter_queue.wait_writable(0).await });

        let mut out = Vec::new();
        flush_direct(&queue, &mut out).await.unwrap();
        waiter.await.unwrap();
        assert_eq!(out.len(), 106);
    }

    #[tokio::test]
    async fn test_fill_reports_eof() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);
        let mut ring = RingBuffer::new();
        assert_eq!(fill(&mut server, &mut ring).await.unwrap(), 0);
        assert_eq!(ring.length(), 0);
    }
}
