//! # protochannel-core
//!
//! Connection engine for protochannel.
//!
//! This crate provides:
//! - The send queue and pump, plus receive helpers over any async stream
//! - The service registry and typed method builder
//! - The per-connection executor that serializes handler invocations
//! - The stream association layer and sink providers
//! - Steady-state package processing shared by hosts and clients

pub mod channel;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod service;
pub mod streams;
pub mod transport;

pub use channel::{Channel, ChannelObserver, ChannelParts, RejectResponses, ResponseHandler};
pub use context::OperationContext;
pub use dispatch::{Executor, LogErrorHook, PendingRequest, UnhandledError, UnhandledErrorHook};
pub use error::{ChannelError, HandlerError, ServiceError, StreamError};
pub use service::{Method, Reply, Service, ServiceBuilder, ServiceMessage};
pub use streams::{
    DiskStreamManager, MemoryStreamManager, ReceivedStream, StreamDescriptor, StreamLimits,
    StreamManager, StreamSink, StreamTable, DEFAULT_MAX_BUFFERED, DEFAULT_MAX_STREAMS,
    DEFAULT_MAX_STREAM_SIZE,
};
pub use transport::{fill, flush_direct, send_pump, SendQueue};
