//! Message headers carried inside `Message` packages.
//!
//! ```text
//! +---------------------------------+----------------------+---------------+
//! | kind:2 | type_id:22 (3 bytes BE)| association id (u16) | protobuf body |
//! +---------------------------------+----------------------+---------------+
//! ```

use crate::error::ProtocolError;
use crate::ring::RingBuffer;
use crate::MAX_MESSAGE_TYPE_ID;

/// Size of the message header (type word + association id).
pub const MESSAGE_HEADER_SIZE: usize = 5;

/// Message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    OneWay = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(MessageKind::Request),
            1 => Ok(MessageKind::Response),
            2 => Ok(MessageKind::OneWay),
            n => Err(ProtocolError::InvalidMessageKind(n)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub message_type: u32,
    pub association_id: u16,
}

impl MessageHeader {
    pub fn new(kind: MessageKind, message_type: u32, association_id: u16) -> Self {
        Self {
            kind,
            message_type,
            association_id,
        }
    }

    pub fn encode(&self) -> Result<[u8; MESSAGE_HEADER_SIZE], ProtocolError> {
        if self.message_type > MAX_MESSAGE_TYPE_ID {
            return Err(ProtocolError::MessageTypeOutOfRange(self.message_type));
        }
        let word = (self.message_type << 2) | self.kind as u32;
        let word = word.to_be_bytes();
        let id = self.association_id.to_be_bytes();
        Ok([word[1], word[2], word[3], id[0], id[1]])
    }

    pub fn decode(bytes: [u8; MESSAGE_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let word = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        Ok(Self {
            kind: MessageKind::try_from((word & 0x3) as u8)?,
            message_type: word >> 2,
            association_id: u16::from_be_bytes([bytes[3], bytes[4]]),
        })
    }

    pub fn write(&self, ring: &mut RingBuffer) -> Result<(), ProtocolError> {
        ring.write(&self.encode()?);
        Ok(())
    }

    pub fn read(ring: &mut RingBuffer) -> Result<Self, ProtocolError> {
        let mut bytes = [0u8; MESSAGE_HEADER_SIZE];
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
        let header = MessageHeader::new(MessageKind::Response, 3, 0x0102);
        // 3 << 2 | 1 = 13
        assert_eq!(header.encode().unwrap(), [0, 0, 13, 1, 2]);
    }

    #[test]
    fn test_type_id_out_of_range() {
        let header = MessageHeader::new(MessageKind::Request, MAX_MESSAGE_TYPE_ID + 1, 0);
        assert!(matches!(
            header.encode(),
            Err(ProtocolError::MessageTypeOutOfRange(_))
        ));
    }

    #[test]
    fn test_invalid_kind() {
        assert!(matches!(
            MessageHeader::decode([0, 0, 3, 0, 0]),
            Err(ProtocolError::InvalidMessageKind(3))
        ));
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            kind in 0u8..3,
            message_type in 0u32..=MAX_MESSAGE_TYPE_ID,
            association_id in any::<u16>(),
        ) {
            let header = MessageHeader::new(
                MessageKind::try_from(kind).unwrap(),
                message_type,
                association_id,
            );
            let mut ring = RingBuffer::with_block_size(2);
            header.write(&mut ring).unwrap();
            ring.set_position(0);
            prop_assert_eq!(MessageHeader::read(&mut ring).unwrap(), header);
        }
    }
}
