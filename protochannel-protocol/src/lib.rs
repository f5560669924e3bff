//! # protochannel-protocol
//!
//! Wire protocol implementation for protochannel.
//!
//! This crate provides:
//! - A paged ring buffer used for both directions of connection I/O
//! - Package framing (3-byte `length:21 | type:3` headers)
//! - Message headers (kind, message type id, association id)
//! - Stream package headers for out-of-band binary payloads
//! - Protobuf control messages exchanged during bring-up
//! - Error codes and protocol constants

pub mod codec;
pub mod error;
pub mod message;
pub mod package;
pub mod ring;
pub mod wire;

pub use codec::{
    read_error_code, read_message, read_prolog, write_control_package, write_error_package,
    write_message, write_message_package, write_prolog, write_stream_package, Prolog,
};
pub use error::{ErrorCode, ProtocolError};
pub use message::{MessageHeader, MessageKind, MESSAGE_HEADER_SIZE};
pub use package::{
    begin_package, end_package, PackageHeader, PackageReader, PackageType, StreamHeader,
    StreamPackageKind, PACKAGE_HEADER_SIZE, STREAM_HEADER_SIZE,
};
pub use ring::{RingBuffer, RingReader};
pub use wire::{Error, HandshakeRequest, HandshakeResponse, StreamRequest};

/// Magic bytes opening every connection prolog: "PCHN".
pub const MAGIC: [u8; 4] = *b"PCHN";

/// Protocol format version carried in the prolog.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the prolog in bytes (magic + version).
pub const PROLOG_SIZE: usize = 8;

/// Default port for protochannel hosts.
pub const DEFAULT_PORT: u16 = 7410;

/// Size of one ring buffer block (4 KiB).
pub const RING_BUFFER_BLOCK_SIZE: usize = 4096;

/// Maximum package payload size (21-bit length field).
pub const MAX_PACKAGE_SIZE: u32 = (1 << 21) - 1;

/// Largest message type id that fits the 22-bit field of a message header.
pub const MAX_MESSAGE_TYPE_ID: u32 = (1 << 22) - 1;
