//! Accepted connection stream, plain TCP or TLS.

use crate::error::ServerError;
use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::TlsAcceptor;

pin_project! {
    /// A host-side connection stream.
    #[project = HostStreamProj]
    pub enum HostStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: Box<ServerTlsStream<TcpStream>> },
    }
}

impl HostStream {
    /// Completes the TLS handshake when an acceptor is configured.
    pub async fn accept(
        stream: TcpStream,
        acceptor: Option<&TlsAcceptor>,
    ) -> Result<Self, ServerError> {
        match acceptor {
            Some(acceptor) => acceptor
                .accept(stream)
                .await
                .map(|stream| HostStream::Tls {
                    stream: Box::new(stream),
                })
                .map_err(|e| ServerError::TlsHandshake(e.to_string())),
            None => Ok(HostStream::Plain { stream }),
        }
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, HostStream::Tls { .. })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            HostStream::Plain { stream } => stream.peer_addr(),
            HostStream::Tls { stream } => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for HostStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            HostStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            HostStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HostStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            HostStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            HostStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            HostStreamProj::Plain { stream } => stream.poll_flush(cx),
            HostStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            HostStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            HostStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
