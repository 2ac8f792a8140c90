use std::collections::VecDeque;

use crate::net::Message;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub sequence: u32,
    pub message: Message,
    pub last_sent: Option<f64>,
    pub sends: u32,
}

impl QueuedMessage {
    pub fn is_due(&self, now: f64, resend_interval: f64) -> bool {
        match self.last_sent {
            None => true,
            Some(sent) => now - sent >= resend_interval,
        }
    }
}

/// Outbound reliable channel for one link. Entries stay until acked and are
/// resent on an interval; the depth doubles as the slow-consumer signal.
#[derive(Debug, Default)]
pub struct ReliableQueue {
    pending: VecDeque<QueuedMessage>,
    next_sequence: u32,
}

impl ReliableQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next sequence and queues the message built with it.
    pub fn push_with(&mut self, build: impl FnOnce(u32) -> Message) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        self.pending.push_back(QueuedMessage {
            sequence,
            message: build(sequence),
            last_sent: None,
            sends: 0,
        });

        sequence
    }

    pub fn ack(&mut self, sequences: &[u32]) -> usize {
        let before = self.pending.len();
        self.pending.retain(|m| !sequences.contains(&m.sequence));
        before - self.pending.len()
    }

    /// Copies every message due for (re)transmission into `out` and stamps it.
    pub fn collect_due(&mut self, now: f64, resend_interval: f64, out: &mut Vec<Message>) {
        for queued in &mut self.pending {
            if queued.is_due(now, resend_interval) {
                queued.last_sent = Some(now);
                queued.sends += 1;
                out.push(queued.message.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

const WINDOW_BITS: u32 = 64;

/// Remembers which reliable sequences already arrived so resends are
/// delivered once. Anything older than the window counts as seen.
#[derive(Debug, Default)]
pub struct ReceiveWindow {
    highest: Option<u32>,
    seen: u64,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a sequence is offered.
    pub fn accept(&mut self, sequence: u32) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(sequence);
            self.seen = 0;
            return true;
        };

        let ahead = sequence.wrapping_sub(highest);
        if ahead != 0 && ahead < u32::MAX / 2 {
            self.seen = if ahead >= WINDOW_BITS {
                0
            } else {
                (self.seen << ahead) | (1 << (ahead - 1))
            };
            self.highest = Some(sequence);
            return true;
        }

        let behind = highest.wrapping_sub(sequence);
        if behind == 0 || behind > WINDOW_BITS {
            return false;
        }

        let bit = 1u64 << (behind - 1);
        if self.seen & bit != 0 {
            return false;
        }
        self.seen |= bit;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keep_alive(_: u32) -> Message {
        Message::KeepAlive
    }

    #[test]
    fn sequences_increase() {
        let mut queue = ReliableQueue::new();
        assert_eq!(queue.push_with(keep_alive), 0);
        assert_eq!(queue.push_with(keep_alive), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn resend_after_interval_until_acked() {
        let mut queue = ReliableQueue::new();
        let seq = queue.push_with(|sequence| Message::EntityRemoved {
            sequence,
            id: 4,
            generation: 1,
        });

        let mut out = Vec::new();
        queue.collect_due(0.0, 0.2, &mut out);
        assert_eq!(out.len(), 1);

        out.clear();
        queue.collect_due(0.1, 0.2, &mut out);
        assert!(out.is_empty());

        queue.collect_due(0.25, 0.2, &mut out);
        assert_eq!(out.len(), 1);

        assert_eq!(queue.ack(&[seq]), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn window_rejects_duplicates() {
        let mut window = ReceiveWindow::new();

        assert!(window.accept(10));
        assert!(!window.accept(10));
        assert!(window.accept(12));
        assert!(window.accept(11));
        assert!(!window.accept(11));
        assert!(!window.accept(12));
    }

    #[test]
    fn window_treats_ancient_as_seen() {
        let mut window = ReceiveWindow::new();

        assert!(window.accept(100));
        assert!(window.accept(300));
        assert!(!window.accept(100));
        assert!(window.accept(299));
    }
}
