use rkyv::{rancor, Archive, Deserialize, Serialize};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const MAX_MESSAGE_SIZE: usize = 1024;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x54455448;
pub const DEFAULT_PORT: u16 = 27115;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
}

impl PacketHeader {
    pub fn new() -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[inline]
pub fn sequence_lte(s1: u32, s2: u32) -> bool {
    s2.wrapping_sub(s1) < SEQUENCE_WRAP_THRESHOLD
}

/// One application message as it travels the wire. The channel is implied
/// by the frame variant carrying it.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireMessage {
    pub kind: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SequencedMessage {
    pub sequence: u32,
    pub message: WireMessage,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Frame {
    ConnectionRequest { client_id: u64, key: Vec<u8> },
    Challenge { key: Vec<u8> },
    ChallengeResponse { proof: Vec<u8> },
    Accepted { client_index: u32 },
    Denied { reason: String },
    Disconnect,
    KeepAlive,
    Unreliable { messages: Vec<WireMessage> },
    Reliable { messages: Vec<SequencedMessage> },
    Ack { cumulative: u32 },
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub frame: Frame,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

impl Packet {
    pub fn new(frame: Frame) -> Self {
        Self {
            header: PacketHeader::new(),
            frame,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        rkyv::from_bytes::<Self, rancor::Error>(data).map_err(PacketError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_comparison_wraps() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));

        assert!(sequence_lte(1, 1));
        assert!(sequence_lte(1, 2));
        assert!(!sequence_lte(2, 1));
        assert!(sequence_lte(u32::MAX, 0));
    }

    #[test]
    fn handshake_frame_round_trip() {
        let packet = Packet::new(Frame::ConnectionRequest {
            client_id: 0xDEAD_BEEF_CAFE_F00D,
            key: vec![7; 32],
        });

        let bytes = packet.serialize().unwrap();
        assert!(bytes.len() <= MAX_PACKET_SIZE);

        let decoded = Packet::deserialize(&bytes).unwrap();
        assert!(decoded.header.is_valid());
        match decoded.frame {
            Frame::ConnectionRequest { client_id, key } => {
                assert_eq!(client_id, 0xDEAD_BEEF_CAFE_F00D);
                assert_eq!(key, vec![7; 32]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn payload_frame_round_trip() {
        let packet = Packet::new(Frame::Reliable {
            messages: vec![
                SequencedMessage {
                    sequence: 1,
                    message: WireMessage {
                        kind: 42,
                        payload: b"hello".to_vec(),
                    },
                },
                SequencedMessage {
                    sequence: 2,
                    message: WireMessage {
                        kind: 43,
                        payload: Vec::new(),
                    },
                },
            ],
        });

        let bytes = packet.serialize().unwrap();
        let decoded = Packet::deserialize(&bytes).unwrap();
        match decoded.frame {
            Frame::Reliable { messages } => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].sequence, 1);
                assert_eq!(messages[0].message.kind, 42);
                assert_eq!(messages[0].message.payload, b"hello");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn stale_header_is_rejected() {
        let mut packet = Packet::new(Frame::KeepAlive);
        packet.header.version = PROTOCOL_VERSION + 1;
        assert!(!packet.header.is_valid());

        packet.header = PacketHeader::new();
        packet.header.magic = 0;
        assert!(!packet.header.is_valid());
    }
}
