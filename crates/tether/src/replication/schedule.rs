use std::cmp::Ordering;

use crate::net::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, SNAPSHOT_PREFIX_SIZE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub slot: u16,
    pub accumulator: f32,
    pub size: usize,
}

/// Highest accumulator first; lower slot wins ties so the order is stable.
fn by_priority(a: &Candidate, b: &Candidate) -> Ordering {
    b.accumulator
        .total_cmp(&a.accumulator)
        .then(a.slot.cmp(&b.slot))
}

/// Framing every snapshot datagram carries around its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramLimits {
    /// Packet header plus whatever the packet codec adds when sealing.
    pub framing: usize,
    pub max_size: usize,
}

impl DatagramLimits {
    pub const fn with_codec_overhead(codec_overhead: usize) -> Self {
        Self {
            framing: PACKET_HEADER_SIZE + codec_overhead,
            max_size: MAX_PACKET_SIZE,
        }
    }

    /// Wire bytes of a datagram before its first snapshot.
    pub const fn overhead(&self) -> usize {
        self.framing + SNAPSHOT_PREFIX_SIZE
    }

    /// Whether a datagram whose body is `body_len` bytes fits on the wire.
    pub const fn fits(&self, body_len: usize) -> bool {
        self.framing + body_len <= self.max_size
    }
}

impl Default for DatagramLimits {
    fn default() -> Self {
        Self::with_codec_overhead(0)
    }
}

/// Tracks what a flush costs on the wire. Snapshots are packed back to back
/// into datagrams; each new datagram pays its framing and timestamp.
#[derive(Debug, Clone, Copy)]
pub struct FlushBudget {
    limit: usize,
    used: usize,
    datagram_fill: usize,
    datagram: DatagramLimits,
}

impl FlushBudget {
    pub fn new(limit: usize) -> Self {
        Self::with_limits(limit, DatagramLimits::default())
    }

    pub fn with_limits(limit: usize, datagram: DatagramLimits) -> Self {
        Self {
            limit,
            used: 0,
            datagram_fill: 0,
            datagram,
        }
    }

    /// Wire bytes a snapshot of `size` would add right now.
    pub fn cost(&self, size: usize) -> usize {
        if self.datagram_fill > 0 && self.datagram_fill + size <= self.datagram.max_size {
            size
        } else {
            self.datagram.overhead() + size
        }
    }

    pub fn fits(&self, size: usize) -> bool {
        self.used + self.cost(size) <= self.limit
    }

    pub fn try_take(&mut self, size: usize) -> bool {
        if !self.fits(size) {
            return false;
        }
        let cost = self.cost(size);
        if cost > size {
            self.datagram_fill = self.datagram.overhead() + size;
        } else {
            self.datagram_fill += size;
        }
        self.used += cost;
        true
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Picks the snapshots for one flush. The primary window fills
/// `budget - reserved_slots * largest` in priority order and stops at the
/// first candidate that does not fit; the reserved slots then go to the
/// best remaining candidates that still fit the full budget.
///
/// `candidates` is reordered in place. Selected slots land in `out` in
/// packing order. Returns the wire bytes the selection costs.
pub fn select_for_flush(
    candidates: &mut [Candidate],
    budget: usize,
    reserved_slots: usize,
    datagram: DatagramLimits,
    out: &mut Vec<u16>,
) -> usize {
    out.clear();
    if candidates.is_empty() {
        return 0;
    }

    let largest = candidates.iter().map(|c| c.size).max().unwrap_or(0);
    let smallest = candidates.iter().map(|c| c.size).min().unwrap_or(1).max(1);
    let reserve = reserved_slots.saturating_mul(largest);

    let mut flush = FlushBudget::with_limits(budget.saturating_sub(reserve), datagram);

    // Nothing past `window` could fit even if every pick were the smallest.
    let window = (flush.limit() / smallest).clamp(1, candidates.len());
    if window < candidates.len() {
        candidates.select_nth_unstable_by(window - 1, by_priority);
    }
    candidates[..window].sort_unstable_by(by_priority);

    let mut taken = 0;
    for candidate in &candidates[..window] {
        if !flush.try_take(candidate.size) {
            break;
        }
        out.push(candidate.slot);
        taken += 1;
    }

    if reserved_slots == 0 {
        return flush.used();
    }

    flush.set_limit(budget);
    let rest = &mut candidates[taken..];
    let reserved = reserved_slots.min(rest.len());
    if reserved == 0 {
        return flush.used();
    }
    if reserved < rest.len() {
        rest.select_nth_unstable_by(reserved - 1, by_priority);
    }
    rest[..reserved].sort_unstable_by(by_priority);

    for candidate in &rest[..reserved] {
        if flush.try_take(candidate.size) {
            out.push(candidate.slot);
        }
    }

    flush.used()
}
