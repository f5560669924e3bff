//! Client stream, plain TCP or TLS.

use crate::error::ClientError;
use crate::tls::TlsClientConfig;
use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;

pin_project! {
    /// A client stream that can be either plain TCP or TLS.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: Box<ClientTlsStream<TcpStream>> },
    }
}

impl ClientStream {
    /// Connects within `timeout` and upgrades to TLS when enabled.
    pub async fn connect(
        addr: SocketAddr,
        timeout: Duration,
        tls: Option<&TlsClientConfig>,
    ) -> Result<Self, ClientError> {
        let tcp_stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;
        tcp_stream.set_nodelay(true).ok();

        let tls = match tls {
            Some(tls) if tls.enabled => tls,
            _ => return Ok(ClientStream::Plain { stream: tcp_stream }),
        };

        let (connector, server_name) = tls.connector(&addr.ip().to_string())?;
        tracing::debug!("Performing TLS handshake with {}", addr);
        let stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
        Ok(ClientStream::Tls {
            stream: Box::new(stream),
        })
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
