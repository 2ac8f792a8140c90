use std::collections::VecDeque;
use std::net::SocketAddr;

use glam::Vec3;

use super::connection::ConnectionState;
use super::health::PeerHealth;
use super::protocol::{MessageKind, PacketHeader};
use super::tracking::{AckTracker, ReceiveTracker};
use crate::replication::DatagramId;
use crate::rpc::{ReceiveWindow, ReliableQueue};

const MAX_TRACKED_PACKETS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u16);

impl PeerId {
    pub const SERVER: PeerId = PeerId(0);
    pub const UNASSIGNED: PeerId = PeerId(u16::MAX);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            PeerId::SERVER => write!(f, "server"),
            PeerId::UNASSIGNED => write!(f, "unassigned"),
            PeerId(id) => write!(f, "peer#{}", id),
        }
    }
}

/// One remote end of the link: the server keeps one per client, a client
/// keeps exactly one for the server.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    pub salt: u64,
    pub connected_at: f64,
    pub last_receive_time: f64,
    pub last_send_time: f64,
    pub point_of_interest: Option<Vec3>,
    pub ack_tracker: AckTracker,
    pub receive_tracker: ReceiveTracker,
    pub reliable: ReliableQueue,
    pub received: ReceiveWindow,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    send_sequence: u16,
    /// Packet sequence and the snapshot datagram it carried, oldest first.
    snapshots_in_flight: VecDeque<(u16, DatagramId)>,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, salt: u64, now: f64) -> Self {
        Self {
            id,
            addr,
            state: ConnectionState::Connected,
            salt,
            connected_at: now,
            last_receive_time: now,
            last_send_time: now,
            point_of_interest: None,
            ack_tracker: AckTracker::new(MAX_TRACKED_PACKETS),
            receive_tracker: ReceiveTracker::new(),
            reliable: ReliableQueue::new(),
            received: ReceiveWindow::new(),
            bytes_sent: 0,
            bytes_received: 0,
            send_sequence: 0,
            snapshots_in_flight: VecDeque::with_capacity(MAX_TRACKED_PACKETS),
        }
    }

    /// Stamps the next outgoing header with fresh sequence and piggybacked acks.
    pub fn next_header(&mut self, kind: MessageKind, now: f64) -> PacketHeader {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.ack_tracker.track_packet(sequence, now);
        self.last_send_time = now;

        let (ack, ack_bits) = self.receive_tracker.ack_data();
        PacketHeader::new(kind, sequence, ack, ack_bits)
    }

    pub fn on_receive(&mut self, header: &PacketHeader, len: usize, now: f64) {
        self.receive_tracker.record_received(header.sequence);
        self.ack_tracker.process_ack(header.ack, header.ack_bits, now);
        self.last_receive_time = now;
        self.bytes_received += len as u64;
    }

    /// Remembers that the packet sent as `sequence` carried snapshot datagram `id`.
    pub fn track_snapshot(&mut self, sequence: u16, id: DatagramId) {
        if self.snapshots_in_flight.len() >= MAX_TRACKED_PACKETS {
            self.snapshots_in_flight.pop_front();
        }
        self.snapshots_in_flight.push_back((sequence, id));
    }

    /// Moves the snapshot datagrams of packets declared lost into `out`.
    /// Other lost packets are forgotten.
    pub fn take_lost_snapshots(&mut self, out: &mut Vec<DatagramId>) {
        for sequence in self.ack_tracker.drain_lost() {
            let found = self
                .snapshots_in_flight
                .iter()
                .position(|&(sent, _)| sent == sequence);
            if let Some((_, id)) = found.and_then(|index| self.snapshots_in_flight.remove(index)) {
                out.push(id);
            }
        }
    }

    pub fn health(&self, now: f64) -> PeerHealth {
        let last_ack = self.ack_tracker.last_ack_time().unwrap_or(self.connected_at);
        PeerHealth {
            rtt_ms: self.ack_tracker.srtt(),
            queue_depth: self.reliable.len(),
            silence_secs: (now - last_ack).max(0.0) as f32,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn headers_carry_increasing_sequences() {
        let mut peer = Peer::new(PeerId(1), addr(), 7, 0.0);

        let first = peer.next_header(MessageKind::KeepAlive, 0.0);
        let second = peer.next_header(MessageKind::KeepAlive, 0.0);

        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(peer.ack_tracker.unacked_count(), 2);
    }

    #[test]
    fn silence_measured_from_last_ack() {
        let mut peer = Peer::new(PeerId(1), addr(), 7, 0.0);
        assert!((peer.health(3.0).silence_secs - 3.0).abs() < 1e-6);

        peer.next_header(MessageKind::KeepAlive, 3.0);
        let reply = PacketHeader::new(MessageKind::KeepAlive, 0, 0, 0);
        peer.on_receive(&reply, 10, 3.1);

        assert!(peer.health(4.0).silence_secs < 1.0);
    }

    #[test]
    fn lost_snapshot_packets_map_to_datagrams() {
        let mut peer = Peer::new(PeerId(1), addr(), 7, 0.0);
        let mut sequences = Vec::new();
        for id in 0..4 {
            let header = peer.next_header(MessageKind::Snapshot, 0.0);
            peer.track_snapshot(header.sequence, 100 + id);
            sequences.push(header.sequence);
        }
        peer.next_header(MessageKind::KeepAlive, 0.9);

        // Only the keep-alive (sequence 4) made it back.
        let reply = PacketHeader::new(MessageKind::KeepAlive, 0, 4, 0);
        peer.on_receive(&reply, 10, 1.0);

        let mut lost = Vec::new();
        peer.take_lost_snapshots(&mut lost);
        assert_eq!(lost, vec![100, 101, 102, 103]);

        lost.clear();
        peer.take_lost_snapshots(&mut lost);
        assert!(lost.is_empty());
    }

    #[test]
    fn display_names() {
        assert_eq!(PeerId::SERVER.to_string(), "server");
        assert_eq!(PeerId(3).to_string(), "peer#3");
    }
}
