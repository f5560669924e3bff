//! Ping-pong demo service served by the `protochannel` binary and used by
//! `protochannel-cli`.

use protochannel_core::{HandlerError, OperationContext, Service, ServiceError, ServiceMessage};
use std::io::Read;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ping {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
    #[prost(string, tag = "2")]
    pub text: String,
}

impl ServiceMessage for Ping {
    const MESSAGE_ID: u32 = 1;
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Pong {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
    #[prost(string, tag = "2")]
    pub text: String,
    /// Protocol the connection negotiated.
    #[prost(uint32, tag = "3")]
    pub protocol: u32,
}

impl ServiceMessage for Pong {
    const MESSAGE_ID: u32 = 2;
}

/// One-way note; the host logs it.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Note {
    #[prost(string, tag = "1")]
    pub text: String,
}

impl ServiceMessage for Note {
    const MESSAGE_ID: u32 = 3;
}

/// Asks the host to consume a stream that was sent earlier.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Upload {
    #[prost(uint32, tag = "1")]
    pub stream_id: u32,
}

impl ServiceMessage for Upload {
    const MESSAGE_ID: u32 = 4;
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UploadReceipt {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub content_type: String,
    #[prost(uint64, tag = "3")]
    pub size: u64,
    /// CRC32C of the content.
    #[prost(uint32, tag = "4")]
    pub checksum: u32,
    /// Notes received on this connection so far.
    #[prost(uint64, tag = "5")]
    pub notes: u64,
}

impl ServiceMessage for UploadReceipt {
    const MESSAGE_ID: u32 = 5;
}

/// Per-connection state of the demo service.
#[derive(Debug, Default)]
pub struct DemoSession {
    pub protocol: u32,
    pub notes: u64,
}

impl DemoSession {
    pub fn new(protocol: u32) -> Self {
        Self { protocol, notes: 0 }
    }
}

pub fn service() -> Result<Service<DemoSession>, ServiceError> {
    Service::builder()
        .method(|session: &mut DemoSession, _: &mut OperationContext, ping: Ping| {
            Ok(Pong {
                seq: ping.seq,
                text: ping.text,
                protocol: session.protocol,
            })
        })
        .one_way(|session: &mut DemoSession, _: &mut OperationContext, note: Note| {
            session.notes += 1;
            tracing::info!("Note #{}: {}", session.notes, note.text);
            Ok(())
        })
        .method(|session: &mut DemoSession, ctx: &mut OperationContext, upload: Upload| {
            let id = u16::try_from(upload.stream_id)
                .map_err(|_| HandlerError::failed("stream id out of range"))?;
            let mut stream = ctx.take_stream(id)?;
            let mut checksum = 0u32;
            let mut size = 0u64;
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream
                    .read(&mut chunk)
                    .map_err(|e| HandlerError::failed(e.to_string()))?;
                if n == 0 {
                    break;
                }
                size += n as u64;
                checksum = crc32c::crc32c_append(checksum, &chunk[..n]);
            }
            Ok(UploadReceipt {
                name: stream.name().to_string(),
                content_type: stream.content_type().to_string(),
                size,
                checksum,
                notes: session.notes,
            })
        })
        .build()
}

/// Checksum the host reports for `data`.
pub fn checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_shape() {
        let service = service().unwrap();
        assert_eq!(service.message_count(), 5);
        assert_eq!(service.method_count(), 3);
        assert!(service.method(Note::MESSAGE_ID).unwrap().is_one_way());
        assert_eq!(
            service.method(Upload::MESSAGE_ID).unwrap().response_type(),
            Some(UploadReceipt::MESSAGE_ID)
        );
        assert!(service.method(Pong::MESSAGE_ID).is_none());
    }

    #[test]
    fn test_checksum() {
        // Standard CRC32C check value.
        assert_eq!(checksum(b"123456789"), 0xE306_9283);
        assert_eq!(checksum(&[]), 0);
        assert_ne!(checksum(b"ab"), checksum(b"ba"));
    }

    #[test]
    fn test_checksum_across_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let chunked = data
            .chunks(4096)
            .fold(0u32, |crc, chunk| crc32c::crc32c_append(crc, chunk));
        assert_eq!(chunked, checksum(&data));
    }
}
