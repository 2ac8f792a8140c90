use super::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PeerStats {
    pub peer: Option<PeerId>,
    pub rtt_ms: f32,
    pub jitter_ms: f32,
    pub loss: f32,
    pub queue_depth: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Read-only view refreshed once per tick.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub bytes_sent_per_sec: f32,
    pub bytes_received_per_sec: f32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub snapshots_sent: u64,
    pub snapshots_received: u64,
    pub snapshots_rejected: u64,
    pub packet_loss: f32,
    pub jitter_ms: f32,
    pub arena_overflows: u64,
    pub arena_high_water: usize,
    pub max_queue_depth: usize,
    pub effective_send_rate: f32,
    pub validator_rejections: u64,
    pub rpcs_dispatched: u64,
    pub connected_peers: usize,
    pub peers: Vec<PeerStats>,
}

impl NetworkStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn worst_peer(&self) -> Option<&PeerStats> {
        self.peers.iter().max_by(|a, b| a.rtt_ms.total_cmp(&b.rtt_ms))
    }
}

/// Turns running byte totals into a per-second figure over 1 s windows.
#[derive(Debug, Clone, Default)]
pub struct ThroughputMeter {
    window_start: f64,
    window_base: u64,
    per_sec: f32,
}

impl ThroughputMeter {
    const WINDOW_SECS: f64 = 1.0;

    pub fn new(now: f64) -> Self {
        Self {
            window_start: now,
            window_base: 0,
            per_sec: 0.0,
        }
    }

    pub fn update(&mut self, total: u64, now: f64) -> f32 {
        let elapsed = now - self.window_start;
        if elapsed >= Self::WINDOW_SECS {
            self.per_sec = (total.saturating_sub(self.window_base) as f64 / elapsed) as f32;
            self.window_start = now;
            self.window_base = total;
        }
        self.per_sec
    }
}
