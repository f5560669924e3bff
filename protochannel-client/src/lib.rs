//! # protochannel-client
//!
//! Client library for protochannel hosts.
//!
//! This crate provides:
//! - Async TCP connection with prolog and protocol negotiation
//! - Typed requests, one-way messages and stream uploads
//! - Association-id bookkeeping for outstanding calls
//! - Optional TLS support

pub mod client;
pub mod connection;
pub mod error;
pub mod pending;
pub mod stream;
pub mod tls;

pub use client::Client;
pub use connection::{
    Connection, ConnectionConfig, DEFAULT_STREAM_CHUNK_SIZE, MAX_STREAM_CHUNK_SIZE,
};
pub use error::ClientError;
pub use pending::{CloseReason, PendingResponses, PendingTable, RawResponse};
pub use stream::ClientStream;
pub use tls::TlsClientConfig;
