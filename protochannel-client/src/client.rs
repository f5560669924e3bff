//! High-level protochannel client.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::pending::RawResponse;
use protochannel_core::{Service, ServiceMessage};
use protochannel_protocol::{
    MessageHeader, MessageKind, StreamHeader, StreamPackageKind, StreamRequest,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Typed request, one-way and stream upload API over one connection.
pub struct Client {
    connection: Connection,
}

impl Client {
    /// Connects and negotiates a protocol.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        Ok(Self {
            connection: Connection::connect(config).await?,
        })
    }

    /// Connects and serves `service` for requests the host sends back.
    pub async fn connect_with_service<S: Send + 'static>(
        config: ConnectionConfig,
        service: Arc<Service<S>>,
        handler: S,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            connection: Connection::connect_with_service(config, service, handler).await?,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Protocol negotiated with the host.
    pub fn protocol(&self) -> u32 {
        self.connection.protocol()
    }

    /// Sends a request and waits for its response.
    pub async fn request<Req, Resp>(&self, request: &Req) -> Result<Resp, ClientError>
    where
        Req: ServiceMessage,
        Resp: ServiceMessage,
    {
        let raw = self.request_raw(request).await?;
        if raw.message_type != Resp::MESSAGE_ID {
            return Err(ClientError::UnexpectedResponseType {
                expected: Resp::MESSAGE_ID,
                actual: raw.message_type,
            });
        }
        Ok(Resp::decode(raw.body.as_slice())?)
    }

    /// Sends a request and returns the undecoded response.
    pub async fn request_raw<Req: ServiceMessage>(
        &self,
        request: &Req,
    ) -> Result<RawResponse, ClientError> {
        let pending = self.connection.pending();
        let (association_id, rx) = pending.register_call()?;
        let header = MessageHeader::new(MessageKind::Request, Req::MESSAGE_ID, association_id);
        if let Err(e) = self.connection.queue().send_message(header, request) {
            pending.remove(association_id);
            return Err(self.connection.send_failed(e));
        }

        let timeout = self.connection.config().request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(pending
                .closed_error()
                .unwrap_or(ClientError::ConnectionClosed)),
            Err(_) => {
                pending.remove(association_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Sends a message that gets no response.
    pub fn one_way<M: ServiceMessage>(&self, message: &M) -> Result<(), ClientError> {
        let header = MessageHeader::new(MessageKind::OneWay, M::MESSAGE_ID, 0);
        self.connection
            .queue()
            .send_message(header, message)
            .map_err(|e| self.connection.send_failed(e))
    }

    /// Uploads `length` bytes from `source` as a stream and waits for the
    /// host to accept it. Each chunk is read before the send queue is
    /// locked, so a slow source never stalls other traffic.
    ///
    /// Returns the stream's association id; pass it in a request so the
    /// handler can pick the stream up.
    pub async fn send_stream<R>(
        &self,
        source: &mut R,
        length: u64,
        name: &str,
        content_type: &str,
    ) -> Result<u16, ClientError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let pending = self.connection.pending();
        let (association_id, mut rx) = pending.register_stream()?;
        let result = self
            .upload(association_id, &mut rx, source, length, name, content_type)
            .await;
        if result.is_err() {
            pending.remove(association_id);
        }
        result.map(|()| association_id)
    }

    /// Uploads an in-memory buffer as a stream.
    pub async fn send_bytes(
        &self,
        data: &[u8],
        name: &str,
        content_type: &str,
    ) -> Result<u16, ClientError> {
        let mut source = data;
        self.send_stream(&mut source, data.len() as u64, name, content_type)
            .await
    }

    async fn upload<R>(
        &self,
        association_id: u16,
        rx: &mut crate::pending::StreamReceiver,
        source: &mut R,
        length: u64,
        name: &str,
        content_type: &str,
    ) -> Result<(), ClientError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let queue = self.connection.queue();
        let announce = StreamRequest {
            length,
            stream_name: name.to_string(),
            content_type: content_type.to_string(),
        };
        let header = StreamHeader::new(StreamPackageKind::Request, association_id);
        queue
            .send_stream_package(header, &prost::Message::encode_to_vec(&announce))
            .map_err(|e| self.connection.send_failed(e))?;

        let chunk_size = self.connection.config().stream_chunk_size as u64;
        let data = StreamHeader::new(StreamPackageKind::Data, association_id);
        let mut chunk = vec![0u8; length.min(chunk_size) as usize];
        let mut remaining = length;
        while remaining > 0 {
            // The host may reject before all data is sent.
            if let Ok(ack) = rx.try_recv() {
                return ack;
            }
            queue.wait_writable(4 * chunk_size).await;

            let n = remaining.min(chunk_size) as usize;
            source.read_exact(&mut chunk[..n]).await?;
            queue
                .send_stream_package(data, &chunk[..n])
                .map_err(|e| self.connection.send_failed(e))?;
            remaining -= n as u64;
        }
        tracing::debug!("Stream {} sent ({} bytes)", association_id, length);

        let timeout = self.connection.config().request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => Err(self
                .connection
                .pending()
                .closed_error()
                .unwrap_or(ClientError::ConnectionClosed)),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Number of requests and uploads awaiting an answer.
    pub fn pending_count(&self) -> usize {
        self.connection.pending_count()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Closes the connection gracefully.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connection.close().await
    }
}
