//! Connection bring-up and the receive loop.

use crate::error::ClientError;
use crate::pending::{CloseReason, PendingResponses, PendingTable};
use crate::stream::ClientStream;
use crate::tls::TlsClientConfig;
use parking_lot::Mutex;
use protochannel_core::{
    fill, flush_direct, send_pump, Channel, ChannelError, ChannelParts, LogErrorHook,
    MemoryStreamManager, SendQueue, Service, StreamTable,
};
use protochannel_protocol::{
    read_error_code, read_message, write_prolog, ErrorCode, HandshakeRequest, HandshakeResponse,
    PackageReader, PackageType, ProtocolError, RingBuffer, MAX_PACKAGE_SIZE, STREAM_HEADER_SIZE,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::task::JoinHandle;

/// Default size of one stream data package.
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 16 * 1024;

/// Largest stream chunk that fits in one package.
pub const MAX_STREAM_CHUNK_SIZE: usize = MAX_PACKAGE_SIZE as usize - STREAM_HEADER_SIZE;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Host address.
    pub addr: SocketAddr,
    /// Bound on TCP connect, TLS and the protocol handshake.
    pub connect_timeout: Duration,
    /// Bound on each request and stream acknowledgement.
    pub request_timeout: Duration,
    /// Protocol to pick from the host's range; the highest offered if None.
    pub protocol: Option<u32>,
    /// Bytes per stream data package.
    pub stream_chunk_size: usize,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            protocol: None,
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
            tls: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_protocol(mut self, protocol: u32) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_stream_chunk_size(mut self, size: usize) -> Self {
        self.stream_chunk_size = size.clamp(1, MAX_STREAM_CHUNK_SIZE);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }
}

/// A negotiated connection to a host.
pub struct Connection {
    config: ConnectionConfig,
    protocol: u32,
    offered: (u32, u32),
    queue: Arc<SendQueue>,
    pending: Arc<PendingTable>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<io::Result<()>>)>>,
}

impl Connection {
    /// Connects and negotiates a protocol. Requests from the host are
    /// refused with `InvalidMessageType`.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        Self::connect_with_service(config, Arc::new(Service::empty()), ()).await
    }

    /// Connects and serves `service` for requests the host sends back.
    pub async fn connect_with_service<S: Send + 'static>(
        config: ConnectionConfig,
        service: Arc<Service<S>>,
        handler: S,
    ) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);
        let mut stream =
            ClientStream::connect(config.addr, config.connect_timeout, config.tls.as_ref()).await?;

        let queue = Arc::new(SendQueue::new());
        let mut ring = RingBuffer::new();
        let mut packages = PackageReader::new();

        queue.send(|ring| {
            write_prolog(ring);
            Ok(())
        })?;
        flush_direct(&queue, &mut stream).await?;

        let offer = tokio::time::timeout(
            config.connect_timeout,
            read_handshake(&mut stream, &mut ring, &mut packages),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)?;
        let offer = match offer {
            Ok(offer) => offer,
            Err(ClientError::Violation(code)) => {
                if queue.send_error(code).is_ok() {
                    let _ = flush_direct(&queue, &mut stream).await;
                }
                return Err(ClientError::Violation(code));
            }
            Err(e) => return Err(e),
        };

        let protocol = config.protocol.unwrap_or(offer.protocol_max);
        if protocol < offer.protocol_min || protocol > offer.protocol_max {
            return Err(ClientError::ProtocolNotOffered {
                requested: protocol,
                min: offer.protocol_min,
                max: offer.protocol_max,
            });
        }
        queue.send_control(PackageType::Handshake, &HandshakeResponse { protocol })?;
        flush_direct(&queue, &mut stream).await?;
        tracing::debug!(
            "Connected to {} with protocol {} ({}..={} offered)",
            config.addr,
            protocol,
            offer.protocol_min,
            offer.protocol_max
        );

        let pending = Arc::new(PendingTable::new());
        let parts = ChannelParts {
            queue: queue.clone(),
            streams: Arc::new(StreamTable::new()),
            stream_manager: Arc::new(MemoryStreamManager::default()),
            hook: Arc::new(LogErrorHook),
            observer: None,
        };
        let channel = Channel::new(
            handler,
            service,
            protocol,
            parts,
            PendingResponses(pending.clone()),
        );

        let (reader, writer) = tokio::io::split(stream);
        let pump_queue = queue.clone();
        let pump = tokio::spawn(async move { send_pump(&pump_queue, writer).await });
        let receiver = tokio::spawn(receive_loop(
            reader,
            ring,
            packages,
            channel,
            queue.clone(),
            pending.clone(),
        ));

        Ok(Self {
            config,
            protocol,
            offered: (offer.protocol_min, offer.protocol_max),
            queue,
            pending,
            tasks: Mutex::new(Some((receiver, pump))),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Protocol negotiated with the host.
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    /// Protocol range the host advertised.
    pub fn offered(&self) -> (u32, u32) {
        self.offered
    }

    pub(crate) fn queue(&self) -> &SendQueue {
        &self.queue
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Maps a failed send to the reason the connection went away.
    pub(crate) fn send_failed(&self, e: ChannelError) -> ClientError {
        match e {
            ChannelError::Disposed => self
                .pending
                .closed_error()
                .unwrap_or(ClientError::ConnectionClosed),
            other => other.into(),
        }
    }

    /// Returns whether the connection can still carry requests.
    pub fn is_connected(&self) -> bool {
        !self.queue.is_closed() && self.pending.closed_error().is_none()
    }

    /// Returns the number of outstanding requests and uploads.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Flushes queued packages, closes the write side and waits for the host
    /// to close its side.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection to {}", self.config.addr);
        self.queue.close();

        let tasks = self.tasks.lock().take();
        if let Some((receiver, pump)) = tasks {
            if let Ok(Err(e)) = pump.await {
                tracing::debug!("Send pump ended: {}", e);
            }
            let abort = receiver.abort_handle();
            if tokio::time::timeout(self.config.request_timeout, receiver)
                .await
                .is_err()
            {
                tracing::debug!("Host did not close the connection, dropping it");
                abort.abort();
            }
        }
        self.pending.close(CloseReason::PeerClosed);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.queue.close();
    }
}

async fn read_handshake(
    stream: &mut ClientStream,
    ring: &mut RingBuffer,
    packages: &mut PackageReader,
) -> Result<HandshakeRequest, ClientError> {
    loop {
        if let Some(header) = packages.next(ring)? {
            let start = ring.position();
            let len = header.length as usize;
            let result = match header.package_type {
                PackageType::Handshake => {
                    read_message::<HandshakeRequest>(ring, len).map_err(ClientError::from)
                }
                PackageType::Error => read_error_code(ring, len)
                    .map_err(ClientError::from)
                    .and_then(|code| Err(ClientError::Remote(code))),
                _ => Err(ClientError::Violation(ErrorCode::InvalidPackageType)),
            };
            PackageReader::finish(ring, start, &header);
            let position = ring.position();
            ring.set_head(position);
            return result;
        }
        if fill(stream, ring).await? == 0 {
            return Err(ClientError::ConnectionClosed);
        }
    }
}

fn process_buffered<S: Send + 'static>(
    channel: &mut Channel<S, PendingResponses>,
    packages: &mut PackageReader,
    ring: &mut RingBuffer,
) -> Result<(), ChannelError> {
    loop {
        let header = match packages.next(ring) {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(()),
            Err(ProtocolError::InvalidPackageType(_)) => {
                return Err(ChannelError::Violation(ErrorCode::InvalidPackageType))
            }
            Err(e) => return Err(e.into()),
        };
        channel.process(ring, &header)?;
    }
}

async fn receive_loop<S: Send + 'static>(
    mut reader: ReadHalf<ClientStream>,
    mut ring: RingBuffer,
    mut packages: PackageReader,
    mut channel: Channel<S, PendingResponses>,
    queue: Arc<SendQueue>,
    pending: Arc<PendingTable>,
) {
    let ended = loop {
        // Bytes that arrived with the handshake are processed first.
        let processed = process_buffered(&mut channel, &mut packages, &mut ring);
        let position = ring.position();
        ring.set_head(position);
        if let Err(e) = processed {
            break Err(e);
        }

        match fill(&mut reader, &mut ring).await {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(ChannelError::Io(e)),
        }
    };

    match ended {
        Ok(()) => {
            tracing::debug!("Host closed the connection");
            pending.close(CloseReason::PeerClosed);
            channel.close().await;
            queue.close();
        }
        Err(ChannelError::Violation(code)) => {
            tracing::warn!("Host violated the protocol: {}", code);
            if let Err(e) = queue.send_error(code) {
                tracing::debug!("Could not queue error package: {}", e);
            }
            queue.close();
            pending.close(CloseReason::Violation(code));
            channel.abort();
        }
        Err(ChannelError::Remote(code)) => {
            tracing::debug!("Host reported error: {}", code);
            queue.abort();
            pending.close(CloseReason::Remote(code));
            channel.abort();
        }
        Err(e) => {
            tracing::debug!("Connection failed: {}", e);
            queue.abort();
            pending.close(CloseReason::Failed(e.to_string()));
            channel.abort();
        }
    }
}
