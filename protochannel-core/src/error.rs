//! Core error types.

use protochannel_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Errors that end a channel (connection) or a send on it.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer broke the protocol. An `Error` package with this code is
    /// sent before the connection is torn down.
    #[error("protocol violation: {0}")]
    Violation(ErrorCode),

    /// The peer sent an `Error` package.
    #[error("peer reported error: {0}")]
    Remote(ErrorCode),

    /// A response arrived on a channel that never issues requests.
    #[error("unexpected response message (association {association_id})")]
    UnexpectedResponse { association_id: u16 },

    #[error("connection disposed")]
    Disposed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Returns the code to report to the peer, if this error is a violation
    /// the peer should be told about.
    pub fn violation_code(&self) -> Option<ErrorCode> {
        match self {
            ChannelError::Violation(code) => Some(*code),
            _ => None,
        }
    }

    /// Returns a short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelError::Violation(_) => "violation",
            ChannelError::Remote(_) => "remote",
            ChannelError::UnexpectedResponse { .. } => "unexpected_response",
            ChannelError::Disposed => "disposed",
            ChannelError::Protocol(_) => "protocol",
            ChannelError::Io(_) => "io",
        }
    }
}

/// Errors returned by service method handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Errors from the stream association layer.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The sink provider refused the stream or storing it failed.
    #[error("stream {association_id} rejected: {reason}")]
    Rejected { association_id: u16, reason: String },

    #[error("stream {association_id} exceeds maximum size ({length} > {max})")]
    TooLarge {
        association_id: u16,
        length: u64,
        max: u64,
    },

    /// The connection already holds as many streams or bytes as allowed.
    #[error("stream {association_id} over connection limit ({streams} held, {buffered} bytes)")]
    ConnectionLimit {
        association_id: u16,
        streams: usize,
        buffered: u64,
    },

    #[error("no stream with association id {0}")]
    NotFound(u16),

    #[error("stream {association_id} incomplete: {received} of {length} bytes")]
    Incomplete {
        association_id: u16,
        received: u64,
        length: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while building a service registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("message id {id} registered for both {existing} and {new}")]
    DuplicateMessageId {
        id: u32,
        existing: &'static str,
        new: &'static str,
    },

    #[error("message id {0} already has a method")]
    DuplicateMethod(u32),

    #[error("message id {0} does not fit in 22 bits")]
    MessageIdOutOfRange(u32),
}
