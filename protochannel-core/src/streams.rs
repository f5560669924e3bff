//! Stream association layer.
//!
//! A stream transfer is a `Request` stream package carrying a
//! [`StreamRequest`](protochannel_protocol::StreamRequest) descriptor,
//! followed by `Data` packages with raw bytes, all tagged with the same
//! association id. The receiver asks its [`StreamManager`] for a sink, copies
//! data straight from ring pages into it and answers with an `Accepted` or
//! `Rejected` acknowledgement. Handlers pick completed streams up through
//! [`OperationContext::take_stream`](crate::OperationContext::take_stream).

use crate::error::StreamError;
use parking_lot::Mutex;
use protochannel_protocol::{RingBuffer, StreamPackageKind};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Default upper bound for streams held in memory (16 MiB).
pub const DEFAULT_MAX_STREAM_SIZE: u64 = 16 * 1024 * 1024;

/// Describes an announced stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub association_id: u16,
    pub length: u64,
    pub name: String,
    pub content_type: String,
}

impl StreamDescriptor {
    pub fn from_request(
        association_id: u16,
        request: protochannel_protocol::StreamRequest,
    ) -> Self {
        Self {
            association_id,
            length: request.length,
            name: request.stream_name,
            content_type: request.content_type,
        }
    }
}

/// Storage for an incoming stream.
pub trait StreamSink: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> StreamSink for T {}

/// Provides sinks for incoming streams, or refuses them.
pub trait StreamManager: Send + Sync {
    fn create_sink(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<Box<dyn StreamSink>, StreamError>;
}

/// Keeps streams in memory, refusing any above `max_size`.
#[derive(Debug, Clone)]
pub struct MemoryStreamManager {
    max_size: u64,
}

impl MemoryStreamManager {
    pub fn new(max_size: u64) -> Self {
        Self { max_size }
    }
}

impl Default for MemoryStreamManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STREAM_SIZE)
    }
}

impl StreamManager for MemoryStreamManager {
    fn create_sink(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<Box<dyn StreamSink>, StreamError> {
        check_size(descriptor, self.max_size)?;
        Ok(Box::new(Cursor::new(Vec::with_capacity(
            descriptor.length as usize,
        ))))
    }
}

/// Spools streams to anonymous temporary files in `dir`. The files are
/// removed by the OS once the sink is dropped.
#[derive(Debug, Clone)]
pub struct DiskStreamManager {
    dir: PathBuf,
    max_size: u64,
}

impl DiskStreamManager {
    pub fn new(dir: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            dir: dir.into(),
            max_size,
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

impl StreamManager for DiskStreamManager {
    fn create_sink(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<Box<dyn StreamSink>, StreamError> {
        check_size(descriptor, self.max_size)?;
        let file = tempfile::tempfile_in(&self.dir)?;
        tracing::debug!(
            "Spooling stream {} ({} bytes) to {}",
            descriptor.association_id,
            descriptor.length,
            self.dir.display()
        );
        Ok(Box::new(file))
    }
}

fn check_size(descriptor: &StreamDescriptor, max: u64) -> Result<(), StreamError> {
    if descriptor.length > max {
        return Err(StreamError::TooLarge {
            association_id: descriptor.association_id,
            length: descriptor.length,
            max,
        });
    }
    Ok(())
}

/// A fully received stream, positioned at its start.
pub struct ReceivedStream {
    descriptor: StreamDescriptor,
    sink: Box<dyn StreamSink>,
}

impl ReceivedStream {
    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn content_type(&self) -> &str {
        &self.descriptor.content_type
    }

    pub fn len(&self) -> u64 {
        self.descriptor.length
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.length == 0
    }

    /// Reads the whole stream into memory.
    pub fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.descriptor.length as usize);
        self.sink.read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn into_sink(self) -> Box<dyn StreamSink> {
        self.sink
    }
}

impl Read for ReceivedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sink.read(buf)
    }
}

impl std::fmt::Debug for ReceivedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedStream")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

enum StreamSlot {
    Receiving {
        descriptor: StreamDescriptor,
        sink: Box<dyn StreamSink>,
        received: u64,
    },
    Complete(ReceivedStream),
}

impl StreamSlot {
    fn length(&self) -> u64 {
        match self {
            StreamSlot::Receiving { descriptor, .. } => descriptor.length,
            StreamSlot::Complete(stream) => stream.descriptor.length,
        }
    }
}

/// Per-connection bounds on streams held for handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Streams being received or waiting to be taken.
    pub max_streams: usize,
    /// Sum of the declared lengths of those streams.
    pub max_buffered: u64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            max_buffered: DEFAULT_MAX_BUFFERED,
        }
    }
}

/// Default number of streams one connection may hold.
pub const DEFAULT_MAX_STREAMS: usize = 64;

/// Default number of stream bytes one connection may hold (64 MiB).
pub const DEFAULT_MAX_BUFFERED: u64 = 64 * 1024 * 1024;

/// Rejections remembered so a handler can still learn why a stream is gone.
const REJECTED_HISTORY: usize = 32;

#[derive(Default)]
struct Slots {
    streams: HashMap<u16, StreamSlot>,
    buffered: u64,
    rejected: VecDeque<(u16, String)>,
}

impl Slots {
    fn insert(&mut self, id: u16, slot: StreamSlot) {
        self.buffered += slot.length();
        if let Some(old) = self.streams.insert(id, slot) {
            self.buffered -= old.length();
        }
    }

    fn remove(&mut self, id: u16) -> Option<StreamSlot> {
        let slot = self.streams.remove(&id)?;
        self.buffered -= slot.length();
        Some(slot)
    }

    fn reject(&mut self, id: u16, reason: String) -> Option<StreamPackageKind> {
        tracing::warn!("Stream {} rejected: {}", id, reason);
        self.rejected.retain(|(r, _)| *r != id);
        if self.rejected.len() == REJECTED_HISTORY {
            self.rejected.pop_front();
        }
        self.rejected.push_back((id, reason));
        Some(StreamPackageKind::Rejected)
    }

    fn take_rejection(&mut self, id: u16) -> Option<String> {
        let index = self.rejected.iter().position(|(r, _)| *r == id)?;
        self.rejected.remove(index).map(|(_, reason)| reason)
    }
}

/// Per-connection table of incoming streams keyed by association id.
///
/// Only streams being received or waiting for a handler occupy a slot; a
/// rejected stream releases its sink at once and leaves a short reason in a
/// bounded history.
#[derive(Default)]
pub struct StreamTable {
    slots: Mutex<Slots>,
    limits: StreamLimits,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: StreamLimits) -> Self {
        Self {
            slots: Mutex::default(),
            limits,
        }
    }

    pub fn limits(&self) -> StreamLimits {
        self.limits
    }

    /// Registers an announced stream. Returns the acknowledgement to send
    /// right away, if the outcome is already known.
    pub fn begin(
        &self,
        descriptor: StreamDescriptor,
        manager: &dyn StreamManager,
    ) -> Option<StreamPackageKind> {
        let id = descriptor.association_id;
        let mut slots = self.slots.lock();
        if slots.remove(id).is_some() {
            tracing::debug!("Stream {} replaced an earlier stream with the same id", id);
        }
        slots.rejected.retain(|(r, _)| *r != id);

        if slots.streams.len() >= self.limits.max_streams
            || slots.buffered.saturating_add(descriptor.length) > self.limits.max_buffered
        {
            let err = StreamError::ConnectionLimit {
                association_id: id,
                streams: slots.streams.len(),
                buffered: slots.buffered,
            };
            return slots.reject(id, err.to_string());
        }

        match manager.create_sink(&descriptor) {
            Ok(mut sink) if descriptor.length == 0 => match sink.seek(SeekFrom::Start(0)) {
                Ok(_) => {
                    let stream = ReceivedStream { descriptor, sink };
                    slots.insert(id, StreamSlot::Complete(stream));
                    Some(StreamPackageKind::Accepted)
                }
                Err(e) => slots.reject(id, e.to_string()),
            },
            Ok(sink) => {
                slots.insert(
                    id,
                    StreamSlot::Receiving {
                        descriptor,
                        sink,
                        received: 0,
                    },
                );
                None
            }
            Err(e) => slots.reject(id, e.to_string()),
        }
    }

    /// Copies `len` bytes of stream data from the ring position into the sink
    /// for `association_id`. Data for unknown, rejected or already complete
    /// streams is skipped. Returns the acknowledgement to send once the
    /// outcome is known.
    pub fn write_data(
        &self,
        association_id: u16,
        ring: &mut RingBuffer,
        len: u64,
    ) -> Option<StreamPackageKind> {
        let mut slots = self.slots.lock();
        let (descriptor, mut sink, received) = match slots.remove(association_id) {
            Some(StreamSlot::Receiving {
                descriptor,
                sink,
                received,
            }) => (descriptor, sink, received),
            Some(complete) => {
                slots.insert(association_id, complete);
                tracing::debug!("Discarding data past the end of stream {}", association_id);
                return None;
            }
            None => {
                tracing::debug!("Discarding data for unknown stream {}", association_id);
                return None;
            }
        };

        let remaining = descriptor.length - received;
        if len > remaining {
            let reason = format!(
                "received {} bytes past declared length {}",
                len - remaining,
                descriptor.length
            );
            return slots.reject(association_id, reason);
        }

        if let Err(e) = ring.read_to(&mut sink, len) {
            return slots.reject(association_id, e.to_string());
        }
        if received + len < descriptor.length {
            slots.insert(
                association_id,
                StreamSlot::Receiving {
                    descriptor,
                    sink,
                    received: received + len,
                },
            );
            return None;
        }
        match sink.seek(SeekFrom::Start(0)) {
            Ok(_) => {
                let stream = ReceivedStream { descriptor, sink };
                slots.insert(association_id, StreamSlot::Complete(stream));
                Some(StreamPackageKind::Accepted)
            }
            Err(e) => slots.reject(association_id, e.to_string()),
        }
    }

    /// Removes a completed stream. Rejected and incomplete streams yield
    /// errors; a rejection is reported once, an incomplete stream is kept.
    pub fn take(&self, association_id: u16) -> Result<ReceivedStream, StreamError> {
        let mut slots = self.slots.lock();
        match slots.remove(association_id) {
            Some(StreamSlot::Complete(stream)) => Ok(stream),
            Some(StreamSlot::Receiving {
                descriptor,
                sink,
                received,
            }) => {
                let err = StreamError::Incomplete {
                    association_id,
                    received,
                    length: descriptor.length,
                };
                slots.insert(
                    association_id,
                    StreamSlot::Receiving {
                        descriptor,
                        sink,
                        received,
                    },
                );
                Err(err)
            }
            None => match slots.take_rejection(association_id) {
                Some(reason) => Err(StreamError::Rejected {
                    association_id,
                    reason,
                }),
                None => Err(StreamError::NotFound(association_id)),
            },
        }
    }

    /// Number of streams holding a sink.
    pub fn len(&self) -> usize {
        self.slots.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().streams.is_empty()
    }

    /// Declared bytes of the streams holding a sink.
    pub fn buffered(&self) -> u64 {
        self.slots.lock().buffered
    }

    /// Drops every sink. Temporary files go with them.
    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.streams.clear();
        slots.buffered = 0;
        slots.rejected.clear();
    }
}
