//! Steady-state package processing shared by hosts and clients.
//!
//! Once a connection is `Connected`, every `Message`, `Stream` and `Error`
//! package goes through [`Channel::process`]. Requests and one-way messages
//! are validated against the service registry and queued on the executor;
//! responses and stream acknowledgements go to the endpoint's
//! [`ResponseHandler`].

use crate::dispatch::{Executor, PendingRequest, UnhandledErrorHook};
use crate::error::ChannelError;
use crate::service::Service;
use crate::streams::{StreamDescriptor, StreamManager, StreamTable};
use crate::transport::SendQueue;
use protochannel_protocol::codec::read_error_code;
use protochannel_protocol::{
    read_message, ErrorCode, MessageHeader, MessageKind, PackageHeader, PackageReader,
    PackageType, ProtocolError, RingBuffer, StreamHeader, StreamPackageKind, StreamRequest,
    MESSAGE_HEADER_SIZE, STREAM_HEADER_SIZE,
};
use std::sync::Arc;

/// Receives what a channel cannot handle itself: responses to requests this
/// side issued and acknowledgements for streams it sent.
pub trait ResponseHandler: Send {
    fn on_response(&mut self, header: MessageHeader, body: Vec<u8>) -> Result<(), ChannelError>;

    fn on_stream_ack(&mut self, association_id: u16, accepted: bool) -> Result<(), ChannelError>;
}

/// For endpoints that never issue requests: any response is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectResponses;

impl ResponseHandler for RejectResponses {
    fn on_response(&mut self, header: MessageHeader, _body: Vec<u8>) -> Result<(), ChannelError> {
        Err(ChannelError::UnexpectedResponse {
            association_id: header.association_id,
        })
    }

    fn on_stream_ack(&mut self, association_id: u16, accepted: bool) -> Result<(), ChannelError> {
        tracing::debug!(
            "Ignoring stream acknowledgement for {} (accepted={})",
            association_id,
            accepted
        );
        Ok(())
    }
}

/// Observes channel activity, e.g. to feed metrics. All methods default to
/// doing nothing.
pub trait ChannelObserver: Send + Sync {
    fn package_received(&self, _package_type: PackageType) {}

    fn message_dispatched(&self, _kind: MessageKind) {}

    fn stream_finished(&self, _accepted: bool) {}
}

/// Everything a channel needs apart from handler state and the registry.
#[derive(Clone)]
pub struct ChannelParts {
    pub queue: Arc<SendQueue>,
    pub streams: Arc<StreamTable>,
    pub stream_manager: Arc<dyn StreamManager>,
    pub hook: Arc<dyn UnhandledErrorHook>,
    pub observer: Option<Arc<dyn ChannelObserver>>,
}

/// A connected channel.
pub struct Channel<S, R> {
    service: Arc<Service<S>>,
    executor: Executor,
    parts: ChannelParts,
    responses: R,
    protocol: u32,
}

impl<S: Send + 'static, R: ResponseHandler> Channel<S, R> {
    /// Starts the executor for `handler` and returns the connected channel.
    pub fn new(
        handler: S,
        service: Arc<Service<S>>,
        protocol: u32,
        parts: ChannelParts,
        responses: R,
    ) -> Self {
        let executor = Executor::spawn(
            handler,
            service.clone(),
            protocol,
            parts.queue.clone(),
            parts.streams.clone(),
            parts.hook.clone(),
        );
        Self {
            service,
            executor,
            parts,
            responses,
            protocol,
        }
    }

    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    pub fn responses(&mut self) -> &mut R {
        &mut self.responses
    }

    /// Handles one complete package whose payload starts at the ring
    /// position. The position is left at the package end, even on error.
    pub fn process(
        &mut self,
        ring: &mut RingBuffer,
        header: &PackageHeader,
    ) -> Result<(), ChannelError> {
        if let Some(observer) = &self.parts.observer {
            observer.package_received(header.package_type);
        }

        let start = ring.position();
        let len = header.length as usize;
        let result = match header.package_type {
            PackageType::Message => self.process_message(ring, len),
            PackageType::Stream => self.process_stream(ring, len),
            PackageType::Error => match read_error_code(ring, len) {
                Ok(code) => Err(ChannelError::Remote(code)),
                Err(e) => Err(e.into()),
            },
            PackageType::Handshake => Err(ChannelError::Violation(ErrorCode::InvalidPackageType)),
        };
        PackageReader::finish(ring, start, header);
        result
    }

    fn process_message(&mut self, ring: &mut RingBuffer, len: usize) -> Result<(), ChannelError> {
        if len < MESSAGE_HEADER_SIZE {
            return Err(ChannelError::Violation(ErrorCode::InvalidMessageType));
        }
        let header = match MessageHeader::read(ring) {
            Ok(header) => header,
            Err(ProtocolError::InvalidMessageKind(kind)) => {
                tracing::debug!("Invalid message kind {}", kind);
                return Err(ChannelError::Violation(ErrorCode::InvalidMessageType));
            }
            Err(e) => return Err(e.into()),
        };
        let body_len = len - MESSAGE_HEADER_SIZE;

        match header.kind {
            MessageKind::Response => {
                let mut body = vec![0u8; body_len];
                ring.read(&mut body)?;
                self.responses.on_response(header, body)
            }
            MessageKind::Request | MessageKind::OneWay => self.dispatch(ring, header, body_len),
        }
    }

    fn dispatch(
        &mut self,
        ring: &mut RingBuffer,
        header: MessageHeader,
        body_len: usize,
    ) -> Result<(), ChannelError> {
        let registration = self
            .service
            .message(header.message_type)
            .ok_or(ChannelError::Violation(ErrorCode::InvalidMessageType))?;
        let method = self
            .service
            .method(header.message_type)
            .ok_or(ChannelError::Violation(ErrorCode::InvalidMessageType))?;

        let is_one_way = header.kind == MessageKind::OneWay;
        if method.is_one_way() && !is_one_way {
            return Err(ChannelError::Violation(ErrorCode::ExpectedIsOneWay));
        }
        if !method.is_one_way() && is_one_way {
            return Err(ChannelError::Violation(ErrorCode::ExpectedRequest));
        }

        let message = registration.decode(ring, body_len)?;
        tracing::debug!(
            "Dispatching {} (association {})",
            method.name(),
            header.association_id
        );
        if let Some(observer) = &self.parts.observer {
            observer.message_dispatched(header.kind);
        }

        self.executor.submit(PendingRequest {
            message,
            message_type: header.message_type,
            association_id: header.association_id,
            is_one_way,
        })
    }

    fn process_stream(&mut self, ring: &mut RingBuffer, len: usize) -> Result<(), ChannelError> {
        if len < STREAM_HEADER_SIZE {
            return Err(ChannelError::Violation(ErrorCode::InvalidPackageType));
        }
        let header = match StreamHeader::read(ring) {
            Ok(header) => header,
            Err(ProtocolError::InvalidStreamKind(kind)) => {
                tracing::debug!("Invalid stream package kind {}", kind);
                return Err(ChannelError::Violation(ErrorCode::InvalidPackageType));
            }
            Err(e) => return Err(e.into()),
        };
        let id = header.association_id;
        let body_len = len - STREAM_HEADER_SIZE;

        let ack = match header.kind {
            StreamPackageKind::Request => {
                let request: StreamRequest = read_message(ring, body_len)?;
                let descriptor = StreamDescriptor::from_request(id, request);
                tracing::debug!(
                    "Incoming stream {} '{}' ({} bytes, {})",
                    id,
                    descriptor.name,
                    descriptor.length,
                    descriptor.content_type
                );
                self.parts
                    .streams
                    .begin(descriptor, self.parts.stream_manager.as_ref())
            }
            StreamPackageKind::Data => self.parts.streams.write_data(id, ring, body_len as u64),
            StreamPackageKind::Accepted => return self.responses.on_stream_ack(id, true),
            StreamPackageKind::Rejected => return self.responses.on_stream_ack(id, false),
        };

        if let Some(kind) = ack {
            if let Some(observer) = &self.parts.observer {
                observer.stream_finished(kind == StreamPackageKind::Accepted);
            }
            self.parts
                .queue
                .send_stream_package(StreamHeader::new(kind, id), &[])?;
        }
        Ok(())
    }

    /// Lets queued handlers finish, then releases stream sinks.
    pub async fn close(self) {
        self.executor.drain().await;
        self.parts.streams.clear();
    }

    /// Drops queued handlers and releases stream sinks.
    pub fn abort(self) {
        self.executor.abort();
        self.parts.streams.clear();
    }
}
