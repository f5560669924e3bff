//! TCP host implementation.

use crate::config::{Config, NetworkConfig, ProtocolConfig};
use crate::connection::{Disconnect, HandlerFactory, HostConnection, HostContext};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::stream::HostStream;
use protochannel_core::{
    ChannelObserver, LogErrorHook, MemoryStreamManager, Service, StreamLimits, StreamManager,
    UnhandledError, UnhandledErrorHook,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

/// Host configuration.
#[derive(Clone)]
pub struct HostConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Protocol numbers accepted during the handshake.
    pub protocol: ProtocolConfig,
    /// Sink provider for incoming streams.
    pub stream_manager: Arc<dyn StreamManager>,
    /// Per-connection bounds on held streams.
    pub stream_limits: StreamLimits,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("protocol", &self.protocol)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        let network = NetworkConfig::default();
        Self {
            bind_addr: network.bind_addr,
            max_connections: network.max_connections,
            protocol: ProtocolConfig::default(),
            stream_manager: Arc::new(MemoryStreamManager::default()),
            stream_limits: StreamLimits::default(),
            tls_acceptor: None,
            metrics: None,
        }
    }
}

impl HostConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds host settings from loaded configuration. Metrics are attached
    /// separately so the caller can also serve them.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        config.validate()?;
        let mut host = Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            protocol: config.protocol,
            stream_manager: config.streams.manager(),
            stream_limits: config.streams.limits(),
            tls_acceptor: None,
            metrics: None,
        };
        if config.tls.enabled {
            host = host.with_tls(crate::tls::build_acceptor(&config.tls)?);
        }
        Ok(host)
    }

    /// Sets the accepted protocol range.
    pub fn with_protocol(mut self, min: u32, max: u32) -> Self {
        self.protocol = ProtocolConfig { min, max };
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_stream_manager(mut self, manager: Arc<dyn StreamManager>) -> Self {
        self.stream_manager = manager;
        self
    }

    pub fn with_stream_limits(mut self, limits: StreamLimits) -> Self {
        self.stream_limits = limits;
        self
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Host statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub violations_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Counts handler faults before passing them on.
struct MeteredHook {
    inner: Arc<dyn UnhandledErrorHook>,
    metrics: Arc<Metrics>,
}

impl UnhandledErrorHook for MeteredHook {
    fn on_error(&self, error: &UnhandledError) {
        if let UnhandledError::Handler { .. } = error {
            self.metrics.handler_faults_total.inc();
        }
        self.inner.on_error(error);
    }
}

/// Runs one accepted connection to completion and records how it ended.
async fn serve_connection<S: Send + 'static>(
    connection: HostConnection<S>,
    tcp_stream: TcpStream,
    addr: SocketAddr,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    metrics: Option<Arc<Metrics>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Receiver<()>,
) {
    let started = Instant::now();
    match HostStream::accept(tcp_stream, tls_acceptor.as_deref()).await {
        Ok(stream) => {
            let tls_status = if stream.is_tls() { " (TLS)" } else { "" };
            tracing::info!("Client connected: {}{}", addr, tls_status);

            let disconnect = connection.run(stream, shutdown).await;
            match &disconnect {
                Disconnect::Violation(code) => {
                    stats.violations_total.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref metrics) = metrics {
                        metrics.record_violation(*code);
                    }
                }
                Disconnect::Failed(_) | Disconnect::Remote(_) => {
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
                Disconnect::PeerClosed | Disconnect::Shutdown => {}
            }
            tracing::info!("Client disconnected: {} ({:?})", addr, disconnect);
        }
        Err(e) => {
            tracing::warn!("[{}] {}", addr, e);
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    if let Some(ref metrics) = metrics {
        metrics.connections_active.dec();
        metrics
            .connection_duration
            .observe(started.elapsed().as_secs_f64());
    }
}

/// Accepts connections and serves `service` on each of them.
///
/// Every connection gets its own handler instance, created by the factory
/// with the protocol number the peer negotiated.
pub struct ProtoHost<S> {
    config: HostConfig,
    service: Arc<Service<S>>,
    factory: Arc<HandlerFactory<S>>,
    hook: Arc<dyn UnhandledErrorHook>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl<S: Send + 'static> ProtoHost<S> {
    /// Creates a new host.
    pub fn new<F>(config: HostConfig, service: Service<S>, factory: F) -> Self
    where
        F: Fn(u32) -> S + Send + Sync + 'static,
    {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            service: Arc::new(service),
            factory: Arc::new(factory),
            hook: Arc::new(LogErrorHook),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Replaces the default logging hook for faults nobody on the wire is
    /// told about.
    pub fn with_hook(mut self, hook: impl UnhandledErrorHook) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Binds the configured address and runs the host.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Runs the host on an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!(
            "Host listening on {} ({}, protocols {}..={})",
            local_addr,
            tls_mode,
            self.config.protocol.min,
            self.config.protocol.max
        );

        let context = self.context();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let connection = HostConnection::new(context.clone());
                            let tls_acceptor = self.config.tls_acceptor.clone();
                            let metrics = self.config.metrics.clone();
                            let stats = self.stats.clone();
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(serve_connection(
                                connection,
                                tcp_stream,
                                addr,
                                tls_acceptor,
                                metrics,
                                stats,
                                conn_shutdown,
                            ));
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Host shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn context(&self) -> HostContext<S> {
        let (hook, observer): (Arc<dyn UnhandledErrorHook>, Option<Arc<dyn ChannelObserver>>) =
            match &self.config.metrics {
                Some(metrics) => (
                    Arc::new(MeteredHook {
                        inner: self.hook.clone(),
                        metrics: metrics.clone(),
                    }),
                    Some(metrics.clone()),
                ),
                None => (self.hook.clone(), None),
            };
        HostContext {
            service: self.service.clone(),
            factory: self.factory.clone(),
            protocol: self.config.protocol,
            stream_manager: self.config.stream_manager.clone(),
            stream_limits: self.config.stream_limits,
            hook,
            observer,
        }
    }

    /// Initiates host shutdown. Open connections are closed too.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the host is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns host statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{self, DemoSession, Note, Ping, Pong, Upload, UploadReceipt};
    use parking_lot::Mutex;
    use protochannel_client::{Client, ClientError, ConnectionConfig};
    use protochannel_core::{HandlerError, OperationContext, ServiceMessage};
    use protochannel_protocol::codec::write_control_package;
    use protochannel_protocol::{
        read_error_code, read_message, write_prolog, ErrorCode, HandshakeRequest,
        HandshakeResponse, PackageReader, PackageType, RingBuffer,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Clone, PartialEq, prost::Message)]
    struct Simple {
        #[prost(uint32, tag = "1")]
        value: u32,
    }

    impl ServiceMessage for Simple {
        const MESSAGE_ID: u32 = 100;
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Boom {}

    impl ServiceMessage for Boom {
        const MESSAGE_ID: u32 = 101;
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Unregistered {}

    impl ServiceMessage for Unregistered {
        const MESSAGE_ID: u32 = 999;
    }

    /// Echo service whose handler state is the negotiated protocol.
    fn echo_host(created: Arc<Mutex<Vec<u32>>>) -> ProtoHost<u32> {
        let service = Service::builder()
            .method(|_: &mut u32, _: &mut OperationContext, request: Simple| Ok(request))
            .method(|_: &mut u32, _: &mut OperationContext, _: Boom| -> Result<Boom, HandlerError> {
                panic!("boom")
            })
            .build()
            .unwrap();
        ProtoHost::new(
            HostConfig::default().with_protocol(2, 3),
            service,
            move |protocol: u32| {
                created.lock().push(protocol);
                protocol
            },
        )
    }

    async fn start<S: Send + 'static>(host: ProtoHost<S>) -> (Arc<ProtoHost<S>>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let host = Arc::new(host);
        let runner = host.clone();
        tokio::spawn(async move { runner.run_on(listener).await });
        (host, addr)
    }

    fn encode(frame: impl FnOnce(&mut RingBuffer)) -> Vec<u8> {
        let mut ring = RingBuffer::new();
        frame(&mut ring);
        let mut bytes = vec![0u8; ring.length() as usize];
        ring.set_position(0);
        ring.read(&mut bytes).unwrap();
        bytes
    }

    /// Writes raw bytes and collects everything the host sends until it
    /// closes the connection.
    async fn exchange_raw(addr: SocketAddr, bytes: &[u8]) -> RingBuffer {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        let mut ring = RingBuffer::new();
        ring.write(&out);
        ring.set_position(0);
        ring
    }

    #[test]
    fn test_host_config_builders() {
        let config = HostConfig::new(([127, 0, 0, 1], 0).into())
            .with_protocol(2, 5)
            .with_max_connections(3);
        assert_eq!(config.protocol, ProtocolConfig { min: 2, max: 5 });
        assert_eq!(config.max_connections, 3);
        assert!(!config.tls_enabled());
        assert!(!config.metrics_enabled());
        assert!(format!("{:?}", config).contains("tls_enabled: false"));
    }

    #[test]
    fn test_from_config_rejects_bad_range() {
        let mut config = Config::default();
        config.protocol = ProtocolConfig { min: 4, max: 1 };
        assert!(matches!(
            HostConfig::from_config(&config),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let host = Arc::new(ProtoHost::new(
            HostConfig::default(),
            Service::<()>::empty(),
            |_| (),
        ));
        assert!(!host.is_running());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let runner = host.clone();
        let task = tokio::spawn(async move { runner.run_on(listener).await });

        while !host.is_running() {
            tokio::task::yield_now().await;
        }
        host.shutdown();
        task.await.unwrap().unwrap();
        assert!(!host.is_running());
    }

    #[tokio::test]
    async fn test_echo_with_highest_offered_protocol() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let (host, addr) = start(echo_host(created.clone())).await;

        let client = Client::connect(ConnectionConfig::new(addr)).await.unwrap();
        assert_eq!(client.protocol(), 3);
        assert_eq!(client.connection().offered(), (2, 3));

        let response: Simple = client.request(&Simple { value: 42 }).await.unwrap();
        assert_eq!(response, Simple { value: 42 });
        assert_eq!(*created.lock(), vec![3]);
        assert_eq!(client.pending_count(), 0);

        client.close().await.unwrap();
        assert!(!client.is_connected());
        assert_eq!(host.stats().connections_total.load(Ordering::Relaxed), 1);
        host.shutdown();
    }

    #[tokio::test]
    async fn test_client_picks_protocol() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let (host, addr) = start(echo_host(created.clone())).await;

        let client = Client::connect(ConnectionConfig::new(addr).with_protocol(2))
            .await
            .unwrap();
        assert_eq!(client.protocol(), 2);
        client.close().await.unwrap();

        let result = Client::connect(ConnectionConfig::new(addr).with_protocol(5)).await;
        assert!(matches!(
            result,
            Err(ClientError::ProtocolNotOffered {
                requested: 5,
                min: 2,
                max: 3
            })
        ));
        assert_eq!(*created.lock(), vec![2]);
        host.shutdown();
    }

    #[tokio::test]
    async fn test_rogue_protocol_is_refused() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let (host, addr) = start(echo_host(created.clone())).await;

        let bytes = encode(|ring| {
            write_prolog(ring);
            write_control_package(ring, PackageType::Handshake, &HandshakeResponse { protocol: 1 })
                .unwrap();
        });
        let mut out = exchange_raw(addr, &bytes).await;

        let mut packages = PackageReader::new();
        let header = packages.next(&mut out).unwrap().unwrap();
        assert_eq!(header.package_type, PackageType::Handshake);
        let offer: HandshakeRequest = read_message(&mut out, header.length as usize).unwrap();
        assert_eq!((offer.protocol_min, offer.protocol_max), (2, 3));

        let header = packages.next(&mut out).unwrap().unwrap();
        assert_eq!(header.package_type, PackageType::Error);
        assert_eq!(
            read_error_code(&mut out, header.length as usize).unwrap(),
            ErrorCode::InvalidProtocol
        );
        assert!(created.lock().is_empty());
        host.shutdown();
    }

    #[tokio::test]
    async fn test_bad_magic_is_refused() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let (host, addr) = start(echo_host(created)).await;

        let mut out = exchange_raw(addr, b"HTTP\0\0\0\x01").await;
        let header = PackageReader::new().next(&mut out).unwrap().unwrap();
        assert_eq!(header.package_type, PackageType::Error);
        assert_eq!(
            read_error_code(&mut out, header.length as usize).unwrap(),
            ErrorCode::InvalidProtocolHeader
        );

        host.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_message_closes_connection() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let (host, addr) = start(echo_host(created)).await;

        let client = Client::connect(ConnectionConfig::new(addr)).await.unwrap();
        let result = client.request::<Unregistered, Simple>(&Unregistered {}).await;
        assert!(matches!(
            result,
            Err(ClientError::Remote(ErrorCode::InvalidMessageType))
        ));
        assert!(!client.is_connected());
        assert!(matches!(
            client.request::<Simple, Simple>(&Simple { value: 1 }).await,
            Err(ClientError::Remote(ErrorCode::InvalidMessageType))
        ));
        host.shutdown();
    }

    #[tokio::test]
    async fn test_handler_panic_keeps_connection() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let faults = Arc::new(AtomicU64::new(0));
        let counter = faults.clone();
        let host = echo_host(created).with_hook(move |error: &UnhandledError| {
            if let UnhandledError::Handler { .. } = error {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let (host, addr) = start(host).await;

        let config = ConnectionConfig::new(addr).with_request_timeout(Duration::from_millis(200));
        let client = Client::connect(config).await.unwrap();
        assert!(matches!(
            client.request::<Boom, Boom>(&Boom {}).await,
            Err(ClientError::Timeout)
        ));
        assert_eq!(client.pending_count(), 0);

        let response: Simple = client.request(&Simple { value: 7 }).await.unwrap();
        assert_eq!(response.value, 7);
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        client.close().await.unwrap();
        host.shutdown();
    }

    fn demo_host(config: HostConfig) -> ProtoHost<DemoSession> {
        ProtoHost::new(config, demo::service().unwrap(), DemoSession::new)
    }

    #[tokio::test]
    async fn test_one_way_and_requests_interleave() {
        let (host, addr) = start(demo_host(HostConfig::default())).await;
        let client = Client::connect(ConnectionConfig::new(addr)).await.unwrap();

        client.one_way(&Note { text: "first".into() }).unwrap();
        let pong: Pong = client
            .request(&Ping {
                seq: 1,
                text: "hi".into(),
            })
            .await
            .unwrap();
        assert_eq!((pong.seq, pong.text.as_str(), pong.protocol), (1, "hi", 1));
        client.one_way(&Note { text: "second".into() }).unwrap();

        let id = client.send_bytes(b"", "empty", "text/plain").await.unwrap();
        let receipt: UploadReceipt = client
            .request(&Upload {
                stream_id: id as u32,
            })
            .await
            .unwrap();
        assert_eq!(receipt.notes, 2);
        assert_eq!(receipt.size, 0);

        client.close().await.unwrap();
        host.shutdown();
    }

    #[tokio::test]
    async fn test_one_way_sent_as_request_is_a_violation() {
        let (host, addr) = start(demo_host(HostConfig::default())).await;
        let client = Client::connect(ConnectionConfig::new(addr)).await.unwrap();

        let result = client
            .request::<Note, Pong>(&Note {
                text: "oops".into(),
            })
            .await;
        assert!(matches!(
            result,
            Err(ClientError::Remote(ErrorCode::ExpectedIsOneWay))
        ));
        host.shutdown();
    }

    #[tokio::test]
    async fn test_stream_upload_accepted() {
        let (host, addr) = start(demo_host(HostConfig::default())).await;
        let config = ConnectionConfig::new(addr).with_stream_chunk_size(7);
        let client = Client::connect(config).await.unwrap();

        let content: Vec<u8> = (0..100u8).collect();
        let id = client
            .send_bytes(&content, "numbers.bin", "application/octet-stream")
            .await
            .unwrap();
        let receipt: UploadReceipt = client
            .request(&Upload {
                stream_id: id as u32,
            })
            .await
            .unwrap();
        assert_eq!(receipt.name, "numbers.bin");
        assert_eq!(receipt.content_type, "application/octet-stream");
        assert_eq!(receipt.size, 100);
        assert_eq!(receipt.checksum, demo::checksum(&content));

        client.close().await.unwrap();
        host.shutdown();
    }

    #[tokio::test]
    async fn test_slow_stream_source_does_not_block_requests() {
        let (host, addr) = start(demo_host(HostConfig::default())).await;
        let client = Client::connect(ConnectionConfig::new(addr)).await.unwrap();
        let (mut feed, mut source) = tokio::io::duplex(64);

        let upload = async {
            client
                .send_stream(&mut source, 10, "slow", "text/plain")
                .await
        };
        let meanwhile = async {
            feed.write_all(&[1u8; 4]).await.unwrap();
            // The upload is parked waiting for more data here.
            let started = std::time::Instant::now();
            client
                .one_way(&Note {
                    text: "meanwhile".into(),
                })
                .unwrap();
            let pong: Pong = client
                .request(&Ping {
                    seq: 9,
                    text: String::new(),
                })
                .await
                .unwrap();
            let waited = started.elapsed();
            feed.write_all(&[2u8; 6]).await.unwrap();
            (pong, waited)
        };
        let (id, (pong, waited)) = tokio::join!(upload, meanwhile);
        assert_eq!(pong.seq, 9);
        assert!(waited < Duration::from_secs(1), "waited {:?}", waited);

        let receipt: UploadReceipt = client
            .request(&Upload {
                stream_id: id.unwrap() as u32,
            })
            .await
            .unwrap();
        assert_eq!(receipt.size, 10);
        assert_eq!(receipt.notes, 1);
        assert_eq!(receipt.checksum, demo::checksum(&[1, 1, 1, 1, 2, 2, 2, 2, 2, 2]));

        client.close().await.unwrap();
        host.shutdown();
    }

    #[tokio::test]
    async fn test_stream_over_limit_rejected() {
        let config = HostConfig::default()
            .with_stream_manager(Arc::new(MemoryStreamManager::new(4)));
        let (host, addr) = start(demo_host(config)).await;
        let client = Client::connect(ConnectionConfig::new(addr)).await.unwrap();

        let result = client.send_bytes(&[1u8; 10], "big", "text/plain").await;
        assert!(matches!(result, Err(ClientError::StreamRejected { .. })));

        // The connection is still usable.
        let pong: Pong = client
            .request(&Ping {
                seq: 2,
                text: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(pong.seq, 2);
        client.close().await.unwrap();
        host.shutdown();
    }

    #[tokio::test]
    async fn test_unclaimed_streams_bounded_per_connection() {
        let config = HostConfig::default().with_stream_limits(StreamLimits {
            max_streams: 1,
            max_buffered: 1024,
        });
        let (host, addr) = start(demo_host(config)).await;
        let client = Client::connect(ConnectionConfig::new(addr)).await.unwrap();

        let first = client.send_bytes(b"one", "a", "text/plain").await.unwrap();
        let second = client.send_bytes(b"two", "b", "text/plain").await;
        assert!(matches!(second, Err(ClientError::StreamRejected { .. })));

        // Claiming the held stream makes room for another.
        let receipt: UploadReceipt = client
            .request(&Upload {
                stream_id: first as u32,
            })
            .await
            .unwrap();
        assert_eq!(receipt.size, 3);
        let third = client.send_bytes(b"three", "c", "text/plain").await;
        assert!(third.is_ok());

        client.close().await.unwrap();
        host.shutdown();
    }
}
