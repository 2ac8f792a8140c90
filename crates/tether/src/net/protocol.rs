use bitflags::bitflags;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PACKET_HEADER_SIZE: usize = 10;
/// Snapshot datagrams carry the server time (ms) right after the packet header.
pub const SNAPSHOT_PREFIX_SIZE: usize = 4;
pub const SNAPSHOT_DATAGRAM_OVERHEAD: usize = PACKET_HEADER_SIZE + SNAPSHOT_PREFIX_SIZE;
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 60;

const SEQUENCE_WRAP_THRESHOLD: u16 = u16::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ConnectRequest = 1,
    ConnectAccepted = 2,
    ConnectDenied = 3,
    Disconnect = 4,
    KeepAlive = 5,
    Snapshot = 6,
    Rpc = 7,
    Ack = 8,
    EntityRemoved = 9,
    OwnerChanged = 10,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::ConnectRequest,
            2 => Self::ConnectAccepted,
            3 => Self::ConnectDenied,
            4 => Self::Disconnect,
            5 => Self::KeepAlive,
            6 => Self::Snapshot,
            7 => Self::Rpc,
            8 => Self::Ack,
            9 => Self::EntityRemoved,
            10 => Self::OwnerChanged,
            _ => return None,
        })
    }

    /// Kinds a sender without an established peer slot may use.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::ConnectRequest | Self::ConnectAccepted | Self::ConnectDenied
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        /// Body was passed through the session's packet codec.
        const SEALED = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: MessageKind,
    pub flags: PacketFlags,
    pub sequence: u16,
    pub ack: u16,
    pub ack_bits: u32,
}

impl PacketHeader {
    pub fn new(kind: MessageKind, sequence: u16, ack: u16, ack_bits: u32) -> Self {
        Self {
            kind,
            flags: PacketFlags::empty(),
            sequence,
            ack,
            ack_bits,
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.kind as u8;
        out[1] = self.flags.bits();
        out[2..4].copy_from_slice(&self.sequence.to_le_bytes());
        out[4..6].copy_from_slice(&self.ack.to_le_bytes());
        out[6..10].copy_from_slice(&self.ack_bits.to_le_bytes());
    }

    pub fn read(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::Truncated { len: bytes.len() });
        }
        let kind = MessageKind::from_u8(bytes[0]).ok_or(PacketError::UnknownKind(bytes[0]))?;

        Ok(Self {
            kind,
            flags: PacketFlags::from_bits_truncate(bytes[1]),
            sequence: u16::from_le_bytes([bytes[2], bytes[3]]),
            ack: u16::from_le_bytes([bytes[4], bytes[5]]),
            ack_bits: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        })
    }

    /// Reads only the sequence number, assuming the length was already checked.
    #[inline]
    pub fn peek_sequence(bytes: &[u8]) -> u16 {
        u16::from_le_bytes([bytes[2], bytes[3]])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum WireTarget {
    Server,
    All,
    Owner { id: u16, generation: u8 },
    AllExceptOwner { id: u16, generation: u8 },
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct RpcFrame {
    pub sequence: u32,
    pub reliable: bool,
    pub sender: u16,
    pub target: WireTarget,
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Every non-snapshot body. The archived variant must agree with the header kind.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Message {
    ConnectRequest {
        protocol: u32,
        salt: u64,
    },
    ConnectAccepted {
        peer_id: u16,
        salt: u64,
        server_time_ms: u32,
    },
    ConnectDenied {
        reason: String,
    },
    Disconnect {
        reason: u8,
    },
    KeepAlive,
    Rpc(RpcFrame),
    Ack {
        sequences: Vec<u32>,
    },
    EntityRemoved {
        sequence: u32,
        id: u16,
        generation: u8,
    },
    OwnerChanged {
        sequence: u32,
        id: u16,
        generation: u8,
        owner: Option<u16>,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ConnectRequest { .. } => MessageKind::ConnectRequest,
            Self::ConnectAccepted { .. } => MessageKind::ConnectAccepted,
            Self::ConnectDenied { .. } => MessageKind::ConnectDenied,
            Self::Disconnect { .. } => MessageKind::Disconnect,
            Self::KeepAlive => MessageKind::KeepAlive,
            Self::Rpc(_) => MessageKind::Rpc,
            Self::Ack { .. } => MessageKind::Ack,
            Self::EntityRemoved { .. } => MessageKind::EntityRemoved,
            Self::OwnerChanged { .. } => MessageKind::OwnerChanged,
        }
    }

    /// Sequence used by the reliable channel, if the message travels on it.
    pub fn reliable_sequence(&self) -> Option<u32> {
        match self {
            Self::Rpc(frame) if frame.reliable => Some(frame.sequence),
            Self::EntityRemoved { sequence, .. } | Self::OwnerChanged { sequence, .. } => {
                Some(*sequence)
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<AlignedVec, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self).map_err(PacketError::Serialize)
    }

    pub fn decode(body: &[u8]) -> Result<Self, PacketError> {
        // Datagram bodies start at an arbitrary offset; archived data needs alignment.
        let mut aligned = AlignedVec::<16>::with_capacity(body.len());
        aligned.extend_from_slice(body);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated ({len} bytes)")]
    Truncated { len: usize },
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("header says {header:?} but body decodes as {body:?}")]
    KindMismatch {
        header: MessageKind,
        body: MessageKind,
    },
    #[error("packet too large ({len} bytes)")]
    TooLarge { len: usize },
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(!sequence_greater_than(5, 5));
        assert!(sequence_greater_than(0, u16::MAX));
        assert!(!sequence_greater_than(u16::MAX, 0));
    }

    #[test]
    fn test_header_layout() {
        let header = PacketHeader::new(MessageKind::Snapshot, 0x1234, 0x0102, 0xDEADBEEF);
        let mut bytes = [0u8; PACKET_HEADER_SIZE];
        header.write(&mut bytes);

        assert_eq!(bytes[0], MessageKind::Snapshot as u8);
        assert_eq!(PacketHeader::peek_sequence(&bytes), 0x1234);
        assert_eq!(PacketHeader::read(&bytes).unwrap(), header);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = [0u8; PACKET_HEADER_SIZE];
        bytes[0] = 200;
        assert!(matches!(
            PacketHeader::read(&bytes),
            Err(PacketError::UnknownKind(200))
        ));
    }

    #[test]
    fn test_message_decodes_from_unaligned_offset() {
        let message = Message::Rpc(RpcFrame {
            sequence: 7,
            reliable: true,
            sender: 3,
            target: WireTarget::Owner {
                id: 12,
                generation: 2,
            },
            subject: "fire".to_string(),
            payload: vec![1, 2, 3],
        });

        let encoded = message.encode().unwrap();
        let mut datagram = vec![0u8; 3];
        datagram.extend_from_slice(&encoded);

        let decoded = Message::decode(&datagram[3..]).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.reliable_sequence(), Some(7));
    }
}
