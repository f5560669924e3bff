//! protochannel - demo host
//!
//! Serves the ping/note/upload demo service over the protochannel transport.

use protochannel_server::demo::{self, DemoSession};
use protochannel_server::{run_metrics_server, Config, HostConfig, Metrics, ProtoHost};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if PROTOCHANNEL_CONFIG is set, then env overrides)
    let config_path = std::env::var("PROTOCHANNEL_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting protochannel host");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Protocols: {}..={}",
        config.protocol.min,
        config.protocol.max
    );
    match &config.streams.spool_dir {
        Some(dir) => tracing::info!("  Stream spool: {}", dir.display()),
        None => tracing::info!("  Stream spool: memory"),
    }
    if config.tls.enabled {
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    let mut host_config = match HostConfig::from_config(&config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    // Metrics endpoint shares the shutdown signal with the host
    let (metrics_shutdown, _) = broadcast::channel::<()>(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        host_config = host_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        None
    };

    let host = Arc::new(ProtoHost::new(
        host_config,
        demo::service()?,
        DemoSession::new,
    ));

    // Spawn shutdown signal handler
    let shutdown_host = host.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping host...");
        shutdown_host.shutdown();
        let _ = metrics_shutdown.send(());
    });

    // Run host (blocks until shutdown)
    host.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Host stopped");
    Ok(())
}
