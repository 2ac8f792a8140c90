use super::peer::PeerId;
use super::protocol::{
    MAX_PACKET_SIZE, MessageKind, PACKET_HEADER_SIZE, PacketHeader, sequence_greater_than,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    TooShort,
    TooLarge,
    UnknownKind(u8),
    Replayed { sequence: u16, last: u16 },
    UnknownPeer,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatorCounters {
    pub accepted: u64,
    pub too_short: u64,
    pub too_large: u64,
    pub unknown_kind: u64,
    pub replayed: u64,
}

impl ValidatorCounters {
    pub fn rejected(&self) -> u64 {
        self.too_short + self.too_large + self.unknown_kind + self.replayed
    }
}

/// Integrity and replay gate run on every inbound datagram before anything
/// else looks at it. Per-peer state is a table sized once at construction.
#[derive(Debug)]
pub struct PacketValidator {
    last_accepted: Vec<Option<u16>>,
    max_size: usize,
    counters: ValidatorCounters,
}

impl PacketValidator {
    pub fn new(peer_slots: usize) -> Self {
        Self::with_max_size(peer_slots, MAX_PACKET_SIZE)
    }

    pub fn with_max_size(peer_slots: usize, max_size: usize) -> Self {
        Self {
            last_accepted: vec![None; peer_slots],
            max_size,
            counters: ValidatorCounters::default(),
        }
    }

    pub fn validate(&mut self, peer: PeerId, bytes: &[u8]) -> bool {
        match self.check(peer, bytes) {
            Ok(()) => true,
            Err(err) => {
                log::trace!("dropping datagram from {:?}: {:?}", peer, err);
                false
            }
        }
    }

    pub fn check(&mut self, peer: PeerId, bytes: &[u8]) -> Result<(), ValidationError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            self.counters.too_short += 1;
            return Err(ValidationError::TooShort);
        }
        if bytes.len() > self.max_size {
            self.counters.too_large += 1;
            return Err(ValidationError::TooLarge);
        }
        let Some(kind) = MessageKind::from_u8(bytes[0]) else {
            self.counters.unknown_kind += 1;
            return Err(ValidationError::UnknownKind(bytes[0]));
        };

        if peer == PeerId::UNASSIGNED {
            // Strangers only get structural checks, and only for the handshake.
            if !kind.is_handshake() {
                return Err(ValidationError::UnknownPeer);
            }
            self.counters.accepted += 1;
            return Ok(());
        }

        let Some(slot) = self.last_accepted.get_mut(peer.index()) else {
            return Err(ValidationError::UnknownPeer);
        };

        let sequence = PacketHeader::peek_sequence(bytes);
        if let Some(last) = *slot {
            if !sequence_greater_than(sequence, last) {
                self.counters.replayed += 1;
                return Err(ValidationError::Replayed { sequence, last });
            }
        }

        *slot = Some(sequence);
        self.counters.accepted += 1;
        Ok(())
    }

    pub fn reset_peer(&mut self, peer: PeerId) {
        if let Some(slot) = self.last_accepted.get_mut(peer.index()) {
            *slot = None;
        }
    }

    pub fn counters(&self) -> &ValidatorCounters {
        &self.counters
    }
}
