//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("buffer underflow: need {needed} bytes, {available} available")]
    BufferUnderflow { needed: u64, available: u64 },

    #[error("offset {offset} outside buffered range [{head}, {length})")]
    OutOfRange { offset: u64, head: u64, length: u64 },

    #[error("package too large: {size} bytes (max {max})")]
    PackageTooLarge { size: u64, max: u32 },

    #[error("invalid package type: {0}")]
    InvalidPackageType(u8),

    #[error("invalid message kind: {0}")]
    InvalidMessageKind(u8),

    #[error("message type id {0} does not fit in 22 bits")]
    MessageTypeOutOfRange(u32),

    #[error("invalid stream package kind: {0}")]
    InvalidStreamKind(u8),

    #[error("unknown error code: {0}")]
    UnknownErrorCode(u32),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error codes carried in `Error` packages.
///
/// These numbers are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// The prolog magic did not match.
    InvalidProtocolHeader = 1,
    /// Unsupported format version or protocol number outside the advertised range.
    InvalidProtocol = 2,
    /// A package type that is not allowed in the current connection state.
    InvalidPackageType = 3,
    /// Unknown message type id, or no method is bound to it.
    InvalidMessageType = 4,
    /// The method is one-way but the frame was sent as a request.
    ExpectedIsOneWay = 5,
    /// The method expects a request but the frame was sent one-way.
    ExpectedRequest = 6,
}

impl ErrorCode {
    /// Returns the wire number of this code.
    pub fn number(self) -> u32 {
        self as u32
    }

    /// Maps a wire number back to an error code.
    pub fn from_number(number: u32) -> Result<Self, ProtocolError> {
        match number {
            1 => Ok(ErrorCode::InvalidProtocolHeader),
            2 => Ok(ErrorCode::InvalidProtocol),
            3 => Ok(ErrorCode::InvalidPackageType),
            4 => Ok(ErrorCode::InvalidMessageType),
            5 => Ok(ErrorCode::ExpectedIsOneWay),
            6 => Ok(ErrorCode::ExpectedRequest),
            n => Err(ProtocolError::UnknownErrorCode(n)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidProtocolHeader => write!(f, "INVALID_PROTOCOL_HEADER"),
            ErrorCode::InvalidProtocol => write!(f, "INVALID_PROTOCOL"),
            ErrorCode::InvalidPackageType => write!(f, "INVALID_PACKAGE_TYPE"),
            ErrorCode::InvalidMessageType => write!(f, "INVALID_MESSAGE_TYPE"),
            ErrorCode::ExpectedIsOneWay => write!(f, "EXPECTED_IS_ONE_WAY"),
            ErrorCode::ExpectedRequest => write!(f, "EXPECTED_REQUEST"),
        }
    }
}
