use std::collections::VecDeque;

use super::protocol::sequence_greater_than;

const ACK_WINDOW: u16 = 32;
const LOSS_SMOOTHING: f32 = 0.05;
/// A packet is lost once one sent this many later has been acked.
const REORDER_THRESHOLD: u16 = 3;
/// Floor for the time-based loss rule, in seconds.
const MIN_LOSS_DELAY: f64 = 0.025;

#[derive(Debug, Clone, Copy)]
pub struct PendingPacket {
    pub sequence: u16,
    pub send_time: f64,
    pub acked: bool,
    pub lost: bool,
}

/// Sent-packet bookkeeping: RTT estimation from acks and a rolling loss ratio.
#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<PendingPacket>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
    has_sample: bool,
    loss: f32,
    acked_total: u64,
    lost_total: u64,
    last_ack_time: Option<f64>,
    newly_lost: VecDeque<u16>,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
            has_sample: false,
            loss: 0.0,
            acked_total: 0,
            lost_total: 0,
            last_ack_time: None,
            newly_lost: VecDeque::with_capacity(max_pending),
        }
    }

    pub fn track_packet(&mut self, sequence: u16, now: f64) {
        while self.pending.len() >= self.max_pending {
            if let Some(evicted) = self.pending.pop_front() {
                if !evicted.acked && !evicted.lost {
                    self.declare_lost(evicted.sequence);
                }
            }
        }

        self.pending.push_back(PendingPacket {
            sequence,
            send_time: now,
            acked: false,
            lost: false,
        });
    }

    /// Applies an ack header. Returns the number of newly acknowledged packets.
    pub fn process_ack(&mut self, ack: u16, ack_bits: u32, now: f64) -> usize {
        let mut newly_acked = 0;
        let mut outcomes = 0usize;
        let mut rtt_sample = None;

        for pending in &mut self.pending {
            if pending.acked || pending.lost {
                continue;
            }

            let is_acked = if pending.sequence == ack {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                diff <= ACK_WINDOW && (ack_bits & (1 << (diff - 1))) != 0
            } else {
                false
            };

            if is_acked {
                pending.acked = true;
                newly_acked += 1;
                outcomes += 1;
                // Older packets in the bitfield waited on the peer's next send.
                if pending.sequence == ack {
                    rtt_sample = Some(((now - pending.send_time) * 1000.0) as f32);
                }
            }
        }

        if let Some(rtt) = rtt_sample {
            self.update_rtt(rtt);
        }
        if newly_acked > 0 {
            self.last_ack_time = Some(now);
        }
        for _ in 0..outcomes {
            self.record_outcome(true);
        }

        // The peer acked something sent after these, so they are either
        // reordered or gone. Enough later packets, or enough time, says gone.
        let loss_delay = (self.srtt as f64 * 1.125 / 1000.0).max(MIN_LOSS_DELAY);
        for index in 0..self.pending.len() {
            let packet = self.pending[index];
            if packet.acked || packet.lost || !sequence_greater_than(ack, packet.sequence) {
                continue;
            }
            let behind = ack.wrapping_sub(packet.sequence);
            if behind >= REORDER_THRESHOLD || now - packet.send_time > loss_delay {
                self.pending[index].lost = true;
                self.declare_lost(packet.sequence);
            }
        }

        while self
            .pending
            .front()
            .is_some_and(|front| front.acked || front.lost)
        {
            self.pending.pop_front();
        }

        newly_acked
    }

    fn declare_lost(&mut self, sequence: u16) {
        self.record_outcome(false);
        if self.newly_lost.len() >= self.max_pending {
            self.newly_lost.pop_front();
        }
        self.newly_lost.push_back(sequence);
    }

    /// Sequences declared lost since the last call.
    pub fn drain_lost(&mut self) -> std::collections::vec_deque::Drain<'_, u16> {
        self.newly_lost.drain(..)
    }

    fn record_outcome(&mut self, delivered: bool) {
        if delivered {
            self.acked_total += 1;
        } else {
            self.lost_total += 1;
        }
        let sample = if delivered { 0.0 } else { 1.0 };
        self.loss += (sample - self.loss) * LOSS_SMOOTHING;
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        if !self.has_sample {
            self.srtt = rtt;
            self.rtt_var = rtt / 2.0;
            self.has_sample = true;
            return;
        }

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    /// Smoothed fraction of packets lost, 0.0..=1.0.
    pub fn loss(&self) -> f32 {
        self.loss
    }

    pub fn lost_total(&self) -> u64 {
        self.lost_total
    }

    pub fn last_ack_time(&self) -> Option<f64> {
        self.last_ack_time
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.iter().filter(|p| !p.acked && !p.lost).count()
    }
}

/// Inbound side of the ack header: the newest sequence seen plus a bitmask
/// of the 32 before it.
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    latest: Option<u16>,
    history: u32,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&mut self, sequence: u16) {
        let Some(latest) = self.latest else {
            self.latest = Some(sequence);
            self.history = 0;
            return;
        };

        if sequence_greater_than(sequence, latest) {
            let shift = sequence.wrapping_sub(latest) as u32;
            self.history = if shift > ACK_WINDOW as u32 {
                0
            } else {
                self.history.checked_shl(shift).unwrap_or(0) | 1 << (shift - 1)
            };
            self.latest = Some(sequence);
        } else {
            let age = latest.wrapping_sub(sequence);
            if (1..=ACK_WINDOW).contains(&age) {
                self.history |= 1 << (age - 1);
            }
        }
    }

    /// `(ack, ack_bits)`: bit `n` set means `ack - n - 1` was received.
    pub fn ack_data(&self) -> (u16, u32) {
        (self.latest.unwrap_or(0), self.history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_receives_fill_history() {
        let mut tracker = ReceiveTracker::new();
        for sequence in 1..=3 {
            tracker.record_received(sequence);
        }
        assert_eq!(tracker.ack_data(), (3, 0b11));
    }

    #[test]
    fn gaps_and_late_arrivals() {
        let mut tracker = ReceiveTracker::new();
        tracker.record_received(10);
        tracker.record_received(13);
        assert_eq!(tracker.ack_data(), (13, 0b100));

        // 11 shows up late.
        tracker.record_received(11);
        assert_eq!(tracker.ack_data(), (13, 0b110));
    }

    #[test]
    fn history_survives_wraparound() {
        let mut tracker = ReceiveTracker::new();
        tracker.record_received(u16::MAX);
        tracker.record_received(0);
        assert_eq!(tracker.ack_data(), (0, 0b1));
    }

    #[test]
    fn test_ack_tracker_rtt() {
        let mut tracker = AckTracker::new(32);

        tracker.track_packet(1, 0.0);
        let acked = tracker.process_ack(1, 0, 0.080);

        assert_eq!(acked, 1);
        assert!((tracker.srtt() - 80.0).abs() < 0.01);
        assert_eq!(tracker.last_ack_time(), Some(0.080));
    }

    #[test]
    fn test_ack_bitfield_acks_older_packets() {
        let mut tracker = AckTracker::new(32);

        for seq in 0..4 {
            tracker.track_packet(seq, 0.0);
        }
        // ack 3 plus bits for 2 and 0; 1 still outstanding
        let acked = tracker.process_ack(3, 0b101, 0.05);

        assert_eq!(acked, 3);
        assert_eq!(tracker.unacked_count(), 1);
    }

    #[test]
    fn rtt_samples_only_the_newest_ack() {
        let mut tracker = AckTracker::new(32);
        tracker.track_packet(0, 0.0);
        tracker.track_packet(1, 0.2);

        // 0 sat at the peer until 1 showed up; its age is not round-trip time.
        tracker.process_ack(1, 0b1, 0.25);

        assert!((tracker.srtt() - 50.0).abs() < 0.01);
    }

    #[test]
    fn later_acks_declare_gaps_lost() {
        let mut tracker = AckTracker::new(64);
        tracker.track_packet(0, 0.0);
        tracker.process_ack(0, 0, 0.05);
        for seq in 1..7 {
            tracker.track_packet(seq, 1.0);
        }
        // 6 and 5 arrived, nothing older did. 1..=3 are three or more
        // behind; 4 is only two behind but long overdue.
        tracker.process_ack(6, 0b1, 1.5);

        let lost: Vec<u16> = tracker.drain_lost().collect();
        assert_eq!(lost, vec![1, 2, 3, 4]);
        assert_eq!(tracker.unacked_count(), 0);
        assert!(tracker.drain_lost().next().is_none());
    }

    #[test]
    fn fresh_gap_waits_for_reordering() {
        let mut tracker = AckTracker::new(64);
        tracker.track_packet(0, 0.0);
        tracker.process_ack(0, 0, 0.1);
        tracker.track_packet(1, 1.0);
        tracker.track_packet(2, 1.0);

        // 2 came back first, right away. 1 may still be in flight.
        tracker.process_ack(2, 0, 1.01);
        assert!(tracker.drain_lost().next().is_none());
        assert_eq!(tracker.unacked_count(), 1);

        // A late 1 is still counted as delivered.
        assert_eq!(tracker.process_ack(2, 0b1, 1.02), 1);
        assert_eq!(tracker.lost_total(), 0);
    }

    #[test]
    fn evicted_packets_count_as_lost() {
        let mut tracker = AckTracker::new(2);
        for seq in 0..4 {
            tracker.track_packet(seq, 0.0);
        }
        assert_eq!(tracker.drain_lost().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_loss_rises_when_packets_fall_out_of_window() {
        let mut tracker = AckTracker::new(256);

        for seq in 0..100u16 {
            tracker.track_packet(seq, 0.0);
        }
        tracker.process_ack(99, 0, 0.1);

        assert!(tracker.loss() > 0.5);
        assert!(tracker.lost_total() >= 60);
    }
}
