//! Prometheus metrics for the protochannel host.
//!
//! This module provides:
//! - Metrics registry with connection, package, dispatch and stream counters
//! - A [`ChannelObserver`] implementation that feeds them
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use protochannel_core::ChannelObserver;
use protochannel_protocol::{ErrorCode, MessageKind, PackageType};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Connection lifetime histogram buckets (in seconds).
const LIFETIME_BUCKETS: &[f64] = &[0.01, 0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0];

/// Prometheus metrics for the host.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Connection lifetime.
    pub connection_duration: Histogram,
    /// Packages received by package type.
    pub packages_received_total: CounterVec,
    /// Requests and one-way messages dispatched, by kind.
    pub messages_dispatched_total: CounterVec,
    /// Handler failures and panics.
    pub handler_faults_total: Counter,
    /// Finished incoming streams by outcome.
    pub streams_total: CounterVec,
    /// Violations that closed a connection, by error code.
    pub protocol_violations_total: CounterVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "protochannel_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "protochannel_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "protochannel_connection_duration_seconds",
                "Connection lifetime in seconds",
            )
            .buckets(LIFETIME_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(connection_duration.clone()))?;

        let packages_received_total = CounterVec::new(
            Opts::new(
                "protochannel_packages_received_total",
                "Packages received by package type",
            ),
            &["type"],
        )?;
        registry.register(Box::new(packages_received_total.clone()))?;

        let messages_dispatched_total = CounterVec::new(
            Opts::new(
                "protochannel_messages_dispatched_total",
                "Messages dispatched to handlers by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(messages_dispatched_total.clone()))?;

        let handler_faults_total = Counter::with_opts(Opts::new(
            "protochannel_handler_faults_total",
            "Handler invocations that failed or panicked",
        ))?;
        registry.register(Box::new(handler_faults_total.clone()))?;

        let streams_total = CounterVec::new(
            Opts::new(
                "protochannel_streams_total",
                "Incoming streams by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(streams_total.clone()))?;

        let protocol_violations_total = CounterVec::new(
            Opts::new(
                "protochannel_protocol_violations_total",
                "Protocol violations by error code",
            ),
            &["code"],
        )?;
        registry.register(Box::new(protocol_violations_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connection_duration,
            packages_received_total,
            messages_dispatched_total,
            handler_faults_total,
            streams_total,
            protocol_violations_total,
        })
    }

    pub fn record_violation(&self, code: ErrorCode) {
        self.protocol_violations_total
            .with_label_values(&[&code.to_string()])
            .inc();
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl ChannelObserver for Metrics {
    fn package_received(&self, package_type: PackageType) {
        let label = match package_type {
            PackageType::Handshake => "handshake",
            PackageType::Message => "message",
            PackageType::Error => "error",
            PackageType::Stream => "stream",
        };
        self.packages_received_total.with_label_values(&[label]).inc();
    }

    fn message_dispatched(&self, kind: MessageKind) {
        let label = match kind {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::OneWay => "one_way",
        };
        self.messages_dispatched_total
            .with_label_values(&[label])
            .inc();
    }

    fn stream_finished(&self, accepted: bool) {
        let label = if accepted { "accepted" } else { "rejected" };
        self.streams_total.with_label_values(&[label]).inc();
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            ),
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "encoding failed",
                )
            }
        },
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
