//! protochannel-cli - Command-line client for the protochannel demo host
//!
//! Each invocation connects, negotiates a protocol, runs one command and
//! closes the connection.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use protochannel_client::{Client, ConnectionConfig, TlsClientConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "protochannel-cli")]
#[command(about = "Command-line client for protochannel hosts")]
#[command(version)]
struct Cli {
    /// Host address
    #[arg(short, long, default_value = "127.0.0.1:7410")]
    server: SocketAddr,

    /// Protocol to negotiate (defaults to the highest the host offers)
    #[arg(short, long, env = "PROTOCHANNEL_PROTOCOL")]
    protocol: Option<u32>,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "PROTOCHANNEL_TLS")]
    tls: bool,

    /// Path to CA certificate for host verification
    #[arg(long, env = "PROTOCHANNEL_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "PROTOCHANNEL_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "PROTOCHANNEL_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip host certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to the host address)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send ping requests and print the round trip time
    Ping {
        /// Number of pings
        #[arg(short, long, default_value = "1")]
        count: u32,

        /// Text echoed back by the host
        #[arg(short, long, default_value = "")]
        text: String,
    },

    /// Send a one-way note the host logs
    Note {
        /// Note text
        text: String,
    },

    /// Upload a file as a stream and print the host's receipt
    Upload {
        /// File to upload
        file: PathBuf,

        /// Stream name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Content type
        #[arg(short = 'c', long, default_value = "application/octet-stream")]
        content_type: String,
    },

    /// Show the negotiated protocol
    Info,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Build TLS config if any TLS option is set
    let tls_config =
        if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
            let mut tls = TlsClientConfig::new();
            if let Some(ref path) = cli.ca_cert {
                tls = tls.with_ca_cert(path.clone());
            }
            match (&cli.client_cert, &cli.client_key) {
                (Some(cert), Some(key)) => {
                    tls = tls.with_client_cert(cert.clone(), key.clone());
                }
                (None, None) => {}
                _ => {
                    eprintln!(
                        "{}: --client-cert and --client-key must be used together",
                        "Error".red()
                    );
                    std::process::exit(1);
                }
            }
            if cli.insecure {
                tls = tls.with_insecure();
            }
            if let Some(ref name) = cli.server_name {
                tls = tls.with_server_name(name.clone());
            }
            Some(tls)
        } else {
            None
        };

    let mut config = ConnectionConfig::new(cli.server)
        .with_request_timeout(Duration::from_secs(cli.timeout));
    if let Some(protocol) = cli.protocol {
        config = config.with_protocol(protocol);
    }
    if let Some(tls) = tls_config {
        config = config.with_tls(tls);
    }

    let client = match Client::connect(config).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}: {}", "Connection failed".red(), e);
            std::process::exit(1);
        }
    };

    match commands::execute(&client, cli.command).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    client.close().await?;
    Ok(())
}
