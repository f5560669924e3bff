//! # protochannel-server
//!
//! Host side of protochannel.
//!
//! This crate provides:
//! - The host connection state machine (prolog, handshake, steady state)
//! - The TCP accept loop with connection limits and shutdown
//! - YAML and environment configuration
//! - Optional TLS support
//! - Prometheus metrics and their HTTP endpoint
//! - A small demo service

pub mod config;
pub mod connection;
pub mod demo;
pub mod error;
pub mod metrics;
pub mod server;
pub mod stream;
pub mod tls;

pub use config::{
    Config, ConfigError, MetricsConfig, NetworkConfig, ProtocolConfig, StreamConfig, TlsConfig,
};
pub use connection::{ConnectionState, Disconnect, HandlerFactory, HostConnection, HostContext};
pub use error::ServerError;
pub use metrics::{run_metrics_server, Metrics};
pub use server::{HostConfig, ProtoHost, ServerStats};
pub use stream::HostStream;
pub use tls::build_acceptor;
