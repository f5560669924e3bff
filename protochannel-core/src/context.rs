//! Per-invocation context handed to service handlers.

use crate::error::{ChannelError, StreamError};
use crate::service::ServiceMessage;
use crate::streams::{ReceivedStream, StreamTable};
use crate::transport::SendQueue;
use protochannel_protocol::{MessageHeader, MessageKind};
use std::sync::Arc;

/// What a handler knows about the call it is serving.
pub struct OperationContext {
    association_id: u16,
    message_type: u32,
    protocol: u32,
    queue: Arc<SendQueue>,
    streams: Arc<StreamTable>,
}

impl OperationContext {
    pub fn new(
        association_id: u16,
        message_type: u32,
        protocol: u32,
        queue: Arc<SendQueue>,
        streams: Arc<StreamTable>,
    ) -> Self {
        Self {
            association_id,
            message_type,
            protocol,
            queue,
            streams,
        }
    }

    /// Association id of the message being handled.
    pub fn association_id(&self) -> u16 {
        self.association_id
    }

    /// Type id of the message being handled.
    pub fn message_type(&self) -> u32 {
        self.message_type
    }

    /// Protocol number negotiated for this connection.
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    /// Takes a completed incoming stream out of the connection's stream table.
    pub fn take_stream(&self, association_id: u16) -> Result<ReceivedStream, StreamError> {
        self.streams.take(association_id)
    }

    /// Sends a one-way message back to the peer.
    pub fn post<M: ServiceMessage>(&self, message: &M) -> Result<(), ChannelError> {
        self.queue.send_message(
            MessageHeader::new(MessageKind::OneWay, M::MESSAGE_ID, 0),
            message,
        )
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("association_id", &self.association_id)
            .field("message_type", &self.message_type)
            .field("protocol", &self.protocol)
            .finish()
    }
}
