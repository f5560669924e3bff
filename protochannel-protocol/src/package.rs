//! Package framing.
//!
//! Every unit on the wire after the prolog is a package:
//!
//! ```text
//! +------------------------------+------------------+
//! | header (3 bytes, big-endian) | payload          |
//! | length:21 << 3 | type:3      | `length` bytes   |
//! +------------------------------+------------------+
//! ```
//!
//! Outgoing packages are written straight into the send ring: the header slot
//! is reserved first and patched once the payload length is known.

use crate::error::ProtocolError;
use crate::ring::RingBuffer;
use crate::MAX_PACKAGE_SIZE;

/// Size of the package header in bytes.
pub const PACKAGE_HEADER_SIZE: usize = 3;

/// Size of the stream package header (kind + association id).
pub const STREAM_HEADER_SIZE: usize = 3;

/// Package types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PackageType {
    Handshake = 0,
    Message = 1,
    Error = 2,
    Stream = 3,
}

impl TryFrom<u8> for PackageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(PackageType::Handshake),
            1 => Ok(PackageType::Message),
            2 => Ok(PackageType::Error),
            3 => Ok(PackageType::Stream),
            n => Err(ProtocolError::InvalidPackageType(n)),
        }
    }
}

/// A decoded package header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageHeader {
    pub package_type: PackageType,
    pub length: u32,
}

impl PackageHeader {
    pub fn new(package_type: PackageType, length: u32) -> Self {
        Self {
            package_type,
            length,
        }
    }

    /// Encodes the header into its 3-byte wire form.
    pub fn encode(&self) -> Result<[u8; PACKAGE_HEADER_SIZE], ProtocolError> {
        if self.length > MAX_PACKAGE_SIZE {
            return Err(ProtocolError::PackageTooLarge {
                size: self.length as u64,
                max: MAX_PACKAGE_SIZE,
            });
        }
        let value = (self.length << 3) | self.package_type as u32;
        let bytes = value.to_be_bytes();
        Ok([bytes[1], bytes[2], bytes[3]])
    }

    /// Decodes a 3-byte wire header.
    pub fn decode(bytes: [u8; PACKAGE_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let value = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        let package_type = PackageType::try_from((value & 0x7) as u8)?;
        Ok(Self {
            package_type,
            length: value >> 3,
        })
    }
}

/// Reserves space for a package header at the ring position and returns the
/// marker to pass to [`end_package`].
pub fn begin_package(ring: &mut RingBuffer) -> u64 {
    let marker = ring.position();
    ring.write(&[0u8; PACKAGE_HEADER_SIZE]);
    marker
}

/// Finalizes the package started at `marker` by patching in its header.
///
/// The payload is everything written between the reserved header and the
/// current position. If it exceeds the 21-bit limit the whole package is
/// rolled back and `PackageTooLarge` is returned.
pub fn end_package(
    ring: &mut RingBuffer,
    package_type: PackageType,
    marker: u64,
) -> Result<(), ProtocolError> {
    let end = ring.position();
    let size = end - marker - PACKAGE_HEADER_SIZE as u64;
    if size > MAX_PACKAGE_SIZE as u64 {
        ring.truncate(marker);
        return Err(ProtocolError::PackageTooLarge {
            size,
            max: MAX_PACKAGE_SIZE,
        });
    }

    let header = PackageHeader::new(package_type, size as u32).encode()?;
    ring.set_position(marker);
    ring.write(&header);
    ring.set_position(end);
    Ok(())
}

/// Incremental package parser over a receive ring.
///
/// `next` yields a header only once the whole payload is buffered; the ring
/// position is then at the first payload byte. Callers must leave the
/// position at `payload_start + length` before asking for the next package
/// (see [`PackageReader::finish`]).
#[derive(Debug, Default)]
pub struct PackageReader {
    pending: Option<PackageHeader>,
}

impl PackageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next complete package, or `None` when more data is needed.
    pub fn next(&mut self, ring: &mut RingBuffer) -> Result<Option<PackageHeader>, ProtocolError> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if ring.available() < PACKAGE_HEADER_SIZE as u64 {
                    return Ok(None);
                }
                let mut bytes = [0u8; PACKAGE_HEADER_SIZE];
                ring.read(&mut bytes)?;
                let header = PackageHeader::decode(bytes)?;
                self.pending = Some(header);
                header
            }
        };

        if ring.available() < header.length as u64 {
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(header))
    }

    /// Forces the ring position to the end of a package whose payload started
    /// at `payload_start`, regardless of how much of it was consumed.
    pub fn finish(ring: &mut RingBuffer, payload_start: u64, header: &PackageHeader) {
        ring.set_position(payload_start + header.length as u64);
    }
}

/// Kinds of stream packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamPackageKind {
    /// Announces a stream: body is a `StreamRequest`.
    Request = 0,
    /// A chunk of raw stream bytes.
    Data = 1,
    /// The receiver stored the complete stream.
    Accepted = 2,
    /// The receiver refused the stream or failed to store it.
    Rejected = 3,
}

impl TryFrom<u8> for StreamPackageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(StreamPackageKind::Request),
            1 => Ok(StreamPackageKind::Data),
            2 => Ok(StreamPackageKind::Accepted),
            3 => Ok(StreamPackageKind::Rejected),
            n => Err(ProtocolError::InvalidStreamKind(n)),
        }
    }
}

/// Header at the start of every stream package payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub kind: StreamPackageKind,
    pub association_id: u16,
}

impl StreamHeader {
    pub fn new(kind: StreamPackageKind, association_id: u16) -> Self {
        Self {
            kind,
            association_id,
        }
    }

    pub fn encode(&self) -> [u8; STREAM_HEADER_SIZE] {
        let id = self.association_id.to_be_bytes();
        [self.kind as u8, id[0], id[1]]
    }

    pub fn decode(bytes: [u8; STREAM_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: StreamPackageKind::try_from(bytes[0])?,
            association_id: u16::from_be_bytes([bytes[1], bytes[2]]),
        })
    }

    /// Writes the header at the ring position.
    pub fn write(&self, ring: &mut RingBuffer) {
        ring.write(&self.encode());
    }

    /// Reads a header from the ring position.
    pub fn read(ring: &mut RingBuffer) -> Result<Self, ProtocolError> {
        let mut bytes = [0u8; STREAM_HEADER_SIZE];
        ring.read(&mut bytes)?;
        Self::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let header = PackageHeader::new(PackageType::Message, 5);
        // 5 << 3 | 1 = 41
        assert_eq!(header.encode().unwrap(), [0, 0, 41]);

        let header = PackageHeader::new(PackageType::Stream, MAX_PACKAGE_SIZE);
        assert_eq!(header.encode().unwrap(), [0xFF, 0xFF, 0xFB]);
    }

    #[test]
    fn test_header_too_large() {
        let header = PackageHeader::new(PackageType::Message, MAX_PACKAGE_SIZE + 1);
        assert!(matches!(
            header.encode(),
            Err(ProtocolError::PackageTooLarge { .. })
        ));
    }

    #[test]
    fn test_invalid_package_type() {
        // type bits = 5
        assert!(matches!(
            PackageHeader::decode([0, 0, 5]),
            Err(ProtocolError::InvalidPackageType(5))
        ));
    }

    #[test]
    fn test_begin_end_package() {
        let mut ring = RingBuffer::with_block_size(4);
        let marker = begin_package(&mut ring);
        ring.write(b"payload");
        end_package(&mut ring, PackageType::Handshake, marker).unwrap();

        assert_eq!(ring.length(), 10);
        ring.set_position(0);
        let mut reader = PackageReader::new();
        let header = reader.next(&mut ring).unwrap().unwrap();
        assert_eq!(header, PackageHeader::new(PackageType::Handshake, 7));

        let mut payload = [0u8; 7];
        ring.read(&mut payload).unwrap();
        assert_eq!(&payload, b"payload");
    }

    #[test]
    fn test_end_package_rolls_back_oversize() {
        let mut ring = RingBuffer::new();
        ring.write(b"keep");
        let marker = begin_package(&mut ring);
        ring.write(&vec![0u8; MAX_PACKAGE_SIZE as usize + 1]);

        let result = end_package(&mut ring, PackageType::Message, marker);
        assert!(matches!(result, Err(ProtocolError::PackageTooLarge { .. })));
        assert_eq!(ring.length(), 4);
        assert_eq!(ring.position(), 4);
    }

    #[test]
    fn test_reader_waits_for_full_package() {
        let mut ring = RingBuffer::with_block_size(8);
        let mut reader = PackageReader::new();

        ring.write(&[0]);
        ring.set_position(0);
        assert!(reader.next(&mut ring).unwrap().is_none());

        // Rest of header: length 4, type Message
        ring.set_position(1);
        ring.write(&[0, (4 << 3) | 1]);
        ring.set_position(0);
        assert!(reader.next(&mut ring).unwrap().is_none());
        assert_eq!(ring.position(), 3);

        ring.set_position(3);
        ring.write(b"ab");
        ring.set_position(3);
        assert!(reader.next(&mut ring).unwrap().is_none());

        ring.set_position(5);
        ring.write(b"cd");
        ring.set_position(3);
        let header = reader.next(&mut ring).unwrap().unwrap();
        assert_eq!(header.package_type, PackageType::Message);
        assert_eq!(header.length, 4);
    }

    #[test]
    fn test_finish_skips_unread_payload() {
        let mut ring = RingBuffer::new();
        for body in [&b"first"[..], &b"second"[..]] {
            let marker = begin_package(&mut ring);
            ring.write(body);
            end_package(&mut ring, PackageType::Message, marker).unwrap();
        }
        ring.set_position(0);

        let mut reader = PackageReader::new();
        let first = reader.next(&mut ring).unwrap().unwrap();
        let start = ring.position();
        ring.skip(1).unwrap();
        PackageReader::finish(&mut ring, start, &first);

        let second = reader.next(&mut ring).unwrap().unwrap();
        assert_eq!(second.length, 6);
    }

    #[test]
    fn test_stream_header() {
        let header = StreamHeader::new(StreamPackageKind::Accepted, 0x1234);
        assert_eq!(header.encode(), [2, 0x12, 0x34]);
        assert_eq!(StreamHeader::decode([2, 0x12, 0x34]).unwrap(), header);
        assert!(matches!(
            StreamHeader::decode([9, 0, 0]),
            Err(ProtocolError::InvalidStreamKind(9))
        ));
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(length in 0u32..=MAX_PACKAGE_SIZE, ty in 0u8..4) {
            let header = PackageHeader::new(PackageType::try_from(ty).unwrap(), length);
            let decoded = PackageHeader::decode(header.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, header);
        }
    }
}
