//! Encoding and decoding of prologs, protobuf bodies and whole packages
//! against ring buffers.

use crate::error::{ErrorCode, ProtocolError};
use crate::message::MessageHeader;
use crate::package::{begin_package, end_package, PackageType, StreamHeader};
use crate::ring::RingBuffer;
use crate::wire;
use crate::{MAGIC, PROLOG_SIZE, PROTOCOL_VERSION};

/// Connection prolog: magic bytes followed by the format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prolog {
    pub magic: [u8; 4],
    pub version: u32,
}

impl Prolog {
    /// The prolog this implementation sends.
    pub fn current() -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
        }
    }

    /// Checks magic and version, returning the error code to report on mismatch.
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.magic != MAGIC {
            return Err(ErrorCode::InvalidProtocolHeader);
        }
        if self.version != PROTOCOL_VERSION {
            return Err(ErrorCode::InvalidProtocol);
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; PROLOG_SIZE] {
        let mut bytes = [0u8; PROLOG_SIZE];
        bytes[..4].copy_from_slice(&self.magic);
        bytes[4..].copy_from_slice(&self.version.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: [u8; PROLOG_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            version: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Writes the current prolog at the ring position.
pub fn write_prolog(ring: &mut RingBuffer) {
    ring.write(&Prolog::current().encode());
}

/// Reads a prolog once all of its bytes are buffered.
pub fn read_prolog(ring: &mut RingBuffer) -> Result<Option<Prolog>, ProtocolError> {
    if ring.available() < PROLOG_SIZE as u64 {
        return Ok(None);
    }
    let mut bytes = [0u8; PROLOG_SIZE];
    ring.read(&mut bytes)?;
    Ok(Some(Prolog::decode(bytes)))
}

/// Serializes a protobuf message at the ring position.
pub fn write_message<M: prost::Message>(ring: &mut RingBuffer, message: &M) {
    ring.write(&message.encode_to_vec());
}

/// Decodes a protobuf message from the next `len` bytes of the ring.
pub fn read_message<M: prost::Message + Default>(
    ring: &mut RingBuffer,
    len: usize,
) -> Result<M, ProtocolError> {
    Ok(M::decode(ring.reader(len)?)?)
}

/// Frames a control message (handshake or error) as a single package.
pub fn write_control_package<M: prost::Message>(
    ring: &mut RingBuffer,
    package_type: PackageType,
    message: &M,
) -> Result<(), ProtocolError> {
    let marker = begin_package(ring);
    write_message(ring, message);
    end_package(ring, package_type, marker)
}

/// Frames an `Error` package carrying `code`.
pub fn write_error_package(ring: &mut RingBuffer, code: ErrorCode) -> Result<(), ProtocolError> {
    write_control_package(
        ring,
        PackageType::Error,
        &wire::Error {
            error_number: code.number(),
        },
    )
}

/// Frames a `Message` package: header plus protobuf body.
pub fn write_message_package<M: prost::Message>(
    ring: &mut RingBuffer,
    header: &MessageHeader,
    message: &M,
) -> Result<(), ProtocolError> {
    let marker = begin_package(ring);
    if let Err(e) = header.write(ring) {
        ring.truncate(marker);
        return Err(e);
    }
    write_message(ring, message);
    end_package(ring, PackageType::Message, marker)
}

/// Frames a `Stream` package with a raw body.
pub fn write_stream_package(
    ring: &mut RingBuffer,
    header: &StreamHeader,
    body: &[u8],
) -> Result<(), ProtocolError> {
    let marker = begin_package(ring);
    header.write(ring);
    ring.write(body);
    end_package(ring, PackageType::Stream, marker)
}

/// Decodes the body of an `Error` package into its code.
pub fn read_error_code(ring: &mut RingBuffer, len: usize) -> Result<ErrorCode, ProtocolError> {
    let error: wire::Error = read_message(ring, len)?;
    ErrorCode::from_number(error.error_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, MESSAGE_HEADER_SIZE};
    use crate::package::{PackageReader, StreamPackageKind, PACKAGE_HEADER_SIZE};

    #[test]
    fn test_prolog_layout() {
        let mut ring = RingBuffer::new();
        write_prolog(&mut ring);
        ring.set_position(0);
        let mut bytes = [0u8; PROLOG_SIZE];
        ring.read(&mut bytes).unwrap();
        assert_eq!(bytes, [b'P', b'C', b'H', b'N', 0, 0, 0, 1]);
    }

    #[test]
    fn test_prolog_partial() {
        let mut ring = RingBuffer::new();
        ring.write(&MAGIC);
        ring.set_position(0);
        assert!(read_prolog(&mut ring).unwrap().is_none());
        assert_eq!(ring.position(), 0);
    }

    #[test]
    fn test_prolog_validation() {
        assert!(Prolog::current().validate().is_ok());

        let bad_magic = Prolog {
            magic: *b"HTTP",
            version: PROTOCOL_VERSION,
        };
        assert_eq!(bad_magic.validate(), Err(ErrorCode::InvalidProtocolHeader));

        let bad_version = Prolog {
            magic: MAGIC,
            version: 2,
        };
        assert_eq!(bad_version.validate(), Err(ErrorCode::InvalidProtocol));
    }

    #[test]
    fn test_control_package() {
        let mut ring = RingBuffer::with_block_size(4);
        let handshake = wire::HandshakeRequest {
            protocol_min: 2,
            protocol_max: 3,
        };
        write_control_package(&mut ring, PackageType::Handshake, &handshake).unwrap();
        ring.set_position(0);

        let header = PackageReader::new().next(&mut ring).unwrap().unwrap();
        assert_eq!(header.package_type, PackageType::Handshake);
        let decoded: wire::HandshakeRequest =
            read_message(&mut ring, header.length as usize).unwrap();
        assert_eq!(decoded, handshake);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_error_package() {
        let mut ring = RingBuffer::new();
        write_error_package(&mut ring, ErrorCode::ExpectedRequest).unwrap();
        ring.set_position(0);

        let header = PackageReader::new().next(&mut ring).unwrap().unwrap();
        assert_eq!(header.package_type, PackageType::Error);
        let code = read_error_code(&mut ring, header.length as usize).unwrap();
        assert_eq!(code, ErrorCode::ExpectedRequest);
    }

    #[test]
    fn test_message_package() {
        let mut ring = RingBuffer::with_block_size(3);
        let header = MessageHeader::new(MessageKind::Request, 7, 42);
        let body = wire::HandshakeResponse { protocol: 3 };
        write_message_package(&mut ring, &header, &body).unwrap();
        ring.set_position(0);

        let package = PackageReader::new().next(&mut ring).unwrap().unwrap();
        assert_eq!(package.package_type, PackageType::Message);
        assert_eq!(
            package.length as usize,
            MESSAGE_HEADER_SIZE + prost::Message::encoded_len(&body)
        );
        assert_eq!(MessageHeader::read(&mut ring).unwrap(), header);
        let decoded: wire::HandshakeResponse =
            read_message(&mut ring, package.length as usize - MESSAGE_HEADER_SIZE).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_message_package_bad_type_rolls_back() {
        let mut ring = RingBuffer::new();
        let header = MessageHeader::new(MessageKind::OneWay, u32::MAX, 1);
        let result = write_message_package(&mut ring, &header, &wire::Error::default());
        assert!(result.is_err());
        assert_eq!(ring.length(), 0);
    }

    #[test]
    fn test_stream_package() {
        let mut ring = RingBuffer::new();
        let header = StreamHeader::new(StreamPackageKind::Data, 9);
        write_stream_package(&mut ring, &header, b"chunk").unwrap();
        assert_eq!(ring.length() as usize, PACKAGE_HEADER_SIZE + 3 + 5);

        ring.set_position(0);
        let package = PackageReader::new().next(&mut ring).unwrap().unwrap();
        assert_eq!(package.package_type, PackageType::Stream);
        assert_eq!(StreamHeader::read(&mut ring).unwrap(), header);
    }

    #[test]
    fn test_read_message_truncated_body_fails() {
        let mut ring = RingBuffer::new();
        write_message(
            &mut ring,
            &wire::StreamRequest {
                length: 10,
                stream_name: "file.bin".into(),
                content_type: "application/octet-stream".into(),
            },
        );
        ring.set_position(0);
        let result: Result<wire::StreamRequest, _> = read_message(&mut ring, 4);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
