//! Host-side connection state machine.
//!
//! A connection walks `Authenticating -> ReceivingProlog -> ReceivingHandshake
//! -> Connected`. The handler instance for a connection is created only once
//! the peer has picked a protocol inside the host's range; from then on every
//! package goes through the shared [`Channel`].

use crate::config::ProtocolConfig;
use protochannel_core::{
    fill, send_pump, Channel, ChannelError, ChannelObserver, ChannelParts, RejectResponses,
    SendQueue, Service, StreamLimits, StreamManager, StreamTable, UnhandledError,
    UnhandledErrorHook,
};
use protochannel_protocol::{
    read_error_code, read_message, read_prolog, ErrorCode, HandshakeRequest, HandshakeResponse,
    PackageHeader, PackageReader, PackageType, ProtocolError, RingBuffer,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

/// Lifecycle of a host connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the transport (and TLS, when configured) to be ready.
    Authenticating,
    ReceivingProlog,
    ReceivingHandshake,
    Connected,
    Disposed,
}

/// Creates the handler instance for a negotiated protocol number.
pub type HandlerFactory<S> = dyn Fn(u32) -> S + Send + Sync;

/// Host-wide pieces every connection shares.
pub struct HostContext<S> {
    pub service: Arc<Service<S>>,
    pub factory: Arc<HandlerFactory<S>>,
    pub protocol: ProtocolConfig,
    pub stream_manager: Arc<dyn StreamManager>,
    pub stream_limits: StreamLimits,
    pub hook: Arc<dyn UnhandledErrorHook>,
    pub observer: Option<Arc<dyn ChannelObserver>>,
}

impl<S> Clone for HostContext<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            factory: self.factory.clone(),
            protocol: self.protocol,
            stream_manager: self.stream_manager.clone(),
            stream_limits: self.stream_limits,
            hook: self.hook.clone(),
            observer: self.observer.clone(),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The peer closed its side.
    PeerClosed,
    /// The host is shutting down.
    Shutdown,
    /// The peer broke the protocol and was told so.
    Violation(ErrorCode),
    /// The peer sent an `Error` package.
    Remote(ErrorCode),
    /// Transport failure or another local fault.
    Failed(String),
}

/// One accepted connection.
pub struct HostConnection<S> {
    host: HostContext<S>,
    parts: ChannelParts,
    state: ConnectionState,
    reader: PackageReader,
    channel: Option<Channel<S, RejectResponses>>,
}

impl<S: Send + 'static> HostConnection<S> {
    pub fn new(host: HostContext<S>) -> Self {
        let parts = ChannelParts {
            queue: Arc::new(SendQueue::new()),
            streams: Arc::new(StreamTable::with_limits(host.stream_limits)),
            stream_manager: host.stream_manager.clone(),
            hook: host.hook.clone(),
            observer: host.observer.clone(),
        };
        Self {
            host,
            parts,
            state: ConnectionState::Authenticating,
            reader: PackageReader::new(),
            channel: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Protocol negotiated during the handshake.
    pub fn protocol(&self) -> Option<u32> {
        self.channel.as_ref().map(|channel| channel.protocol())
    }

    pub fn queue(&self) -> &Arc<SendQueue> {
        &self.parts.queue
    }

    /// Marks the transport as ready for the prolog.
    pub fn authenticated(&mut self) {
        if self.state == ConnectionState::Authenticating {
            self.state = ConnectionState::ReceivingProlog;
        }
    }

    /// Consumes every complete unit (prolog or package) buffered in `ring`.
    /// Returns `Ok` once more data is needed.
    pub fn process(&mut self, ring: &mut RingBuffer) -> Result<(), ChannelError> {
        loop {
            match self.state {
                ConnectionState::Authenticating => return Ok(()),
                ConnectionState::Disposed => return Err(ChannelError::Disposed),
                ConnectionState::ReceivingProlog => {
                    let prolog = match read_prolog(ring)? {
                        Some(prolog) => prolog,
                        None => return Ok(()),
                    };
                    prolog.validate().map_err(ChannelError::Violation)?;
                    self.parts.queue.send_control(
                        PackageType::Handshake,
                        &HandshakeRequest {
                            protocol_min: self.host.protocol.min,
                            protocol_max: self.host.protocol.max,
                        },
                    )?;
                    self.state = ConnectionState::ReceivingHandshake;
                }
                ConnectionState::ReceivingHandshake => {
                    let header = match self.next_package(ring)? {
                        Some(header) => header,
                        None => return Ok(()),
                    };
                    let start = ring.position();
                    let result = self.handshake(ring, &header);
                    PackageReader::finish(ring, start, &header);
                    result?;
                }
                ConnectionState::Connected => {
                    let header = match self.next_package(ring)? {
                        Some(header) => header,
                        None => return Ok(()),
                    };
                    match self.channel.as_mut() {
                        Some(channel) => channel.process(ring, &header)?,
                        None => return Err(ChannelError::Disposed),
                    }
                }
            }
        }
    }

    fn next_package(
        &mut self,
        ring: &mut RingBuffer,
    ) -> Result<Option<PackageHeader>, ChannelError> {
        match self.reader.next(ring) {
            Ok(header) => Ok(header),
            Err(ProtocolError::InvalidPackageType(kind)) => {
                tracing::debug!("Invalid package type {}", kind);
                Err(ChannelError::Violation(ErrorCode::InvalidPackageType))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn handshake(
        &mut self,
        ring: &mut RingBuffer,
        header: &PackageHeader,
    ) -> Result<(), ChannelError> {
        let len = header.length as usize;
        match header.package_type {
            PackageType::Handshake => {}
            PackageType::Error => return Err(ChannelError::Remote(read_error_code(ring, len)?)),
            _ => return Err(ChannelError::Violation(ErrorCode::InvalidPackageType)),
        }

        let response: HandshakeResponse = read_message(ring, len)?;
        if !self.host.protocol.contains(response.protocol) {
            tracing::debug!(
                "Peer chose protocol {} outside {}..={}",
                response.protocol,
                self.host.protocol.min,
                self.host.protocol.max
            );
            return Err(ChannelError::Violation(ErrorCode::InvalidProtocol));
        }

        let handler = (self.host.factory)(response.protocol);
        self.channel = Some(Channel::new(
            handler,
            self.host.service.clone(),
            response.protocol,
            self.parts.clone(),
            RejectResponses,
        ));
        self.state = ConnectionState::Connected;
        tracing::debug!("Negotiated protocol {}", response.protocol);
        Ok(())
    }

    /// Drives the connection over `stream` until it ends.
    pub async fn run<T>(mut self, stream: T, mut shutdown: broadcast::Receiver<()>) -> Disconnect
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let queue = self.parts.queue.clone();
        let pump = tokio::spawn(async move { send_pump(&queue, writer).await });

        self.authenticated();
        let mut ring = RingBuffer::new();
        let ended = loop {
            let read = tokio::select! {
                read = fill(&mut reader, &mut ring) => read,
                _ = shutdown.recv() => break Ok(Disconnect::Shutdown),
            };
            match read {
                Ok(0) => break Ok(Disconnect::PeerClosed),
                Ok(_) => {}
                Err(e) => break Err(ChannelError::Io(e)),
            }

            let processed = self.process(&mut ring);
            let position = ring.position();
            ring.set_head(position);
            if let Err(e) = processed {
                break Err(e);
            }
        };

        let disconnect = self.teardown(ended).await;
        match pump.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Send pump ended: {}", e),
            Err(e) => tracing::debug!("Send pump task failed: {}", e),
        }
        disconnect
    }

    async fn teardown(&mut self, ended: Result<Disconnect, ChannelError>) -> Disconnect {
        self.state = ConnectionState::Disposed;
        let channel = self.channel.take();
        let queue = self.parts.queue.clone();

        let disconnect = match ended {
            Ok(Disconnect::PeerClosed) => {
                if let Some(channel) = channel {
                    channel.close().await;
                }
                queue.close();
                return Disconnect::PeerClosed;
            }
            Ok(disconnect) => {
                queue.close();
                disconnect
            }
            Err(ChannelError::Violation(code)) => {
                tracing::warn!("Protocol violation, closing connection: {}", code);
                if let Err(e) = queue.send_error(code) {
                    tracing::debug!("Could not queue error package: {}", e);
                }
                queue.close();
                Disconnect::Violation(code)
            }
            Err(ChannelError::Remote(code)) => {
                tracing::debug!("Peer reported error: {}", code);
                queue.abort();
                Disconnect::Remote(code)
            }
            Err(source @ ChannelError::UnexpectedResponse { .. }) => {
                let message = source.to_string();
                self.host.hook.on_error(&UnhandledError::Connection { source });
                queue.abort();
                Disconnect::Failed(message)
            }
            Err(e) => {
                tracing::debug!("Connection failed: {}", e);
                queue.abort();
                Disconnect::Failed(e.to_string())
            }
        };

        if let Some(channel) = channel {
            channel.abort();
        }
        self.parts.streams.clear();
        disconnect
    }
}
