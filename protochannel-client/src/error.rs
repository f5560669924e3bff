//! Client error types.

use protochannel_core::ChannelError;
use protochannel_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("channel error: {0}")]
    Channel(ChannelError),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("request timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    /// The host sent an `Error` package.
    #[error("host reported error: {0}")]
    Remote(ErrorCode),

    /// The host broke the protocol; it was sent this code.
    #[error("host protocol violation: {0}")]
    Violation(ErrorCode),

    #[error("protocol {requested} not offered by host ({min}..={max})")]
    ProtocolNotOffered { requested: u32, min: u32, max: u32 },

    #[error("stream {association_id} rejected by host")]
    StreamRejected { association_id: u16 },

    #[error("unexpected response type {actual} (expected {expected})")]
    UnexpectedResponseType { expected: u32, actual: u32 },

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("too many outstanding requests")]
    TooManyPending,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl From<ChannelError> for ClientError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Remote(code) => ClientError::Remote(code),
            ChannelError::Violation(code) => ClientError::Violation(code),
            ChannelError::Disposed => ClientError::ConnectionClosed,
            ChannelError::Io(e) => ClientError::Io(e),
            ChannelError::Protocol(ProtocolError::Io(e)) => ClientError::Io(e),
            ChannelError::Protocol(e) => ClientError::Protocol(e),
            other => ClientError::Channel(other),
        }
    }
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectTimeout
                | ClientError::Timeout
                | ClientError::ConnectionClosed
                | ClientError::TooManyPending
        )
    }
}
