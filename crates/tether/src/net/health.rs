use crate::config::HealthThresholds;
use crate::events::DisconnectReason;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PeerHealth {
    pub rtt_ms: f32,
    pub queue_depth: usize,
    pub silence_secs: f32,
}

impl PeerHealth {
    /// First threshold the peer breaks, if any.
    pub fn check(&self, thresholds: &HealthThresholds) -> Option<DisconnectReason> {
        if self.queue_depth > thresholds.max_queue_depth {
            return Some(DisconnectReason::SlowConsumer);
        }
        if self.rtt_ms > thresholds.max_rtt_ms {
            return Some(DisconnectReason::HighLatency);
        }
        if self.silence_secs > thresholds.max_silence_secs {
            return Some(DisconnectReason::Silent);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_peer_passes() {
        let health = PeerHealth {
            rtt_ms: 80.0,
            queue_depth: 3,
            silence_secs: 0.5,
        };
        assert_eq!(health.check(&HealthThresholds::default()), None);
    }

    #[test]
    fn each_threshold_trips() {
        let thresholds = HealthThresholds::default();
        let base = PeerHealth::default();

        let slow = PeerHealth {
            queue_depth: 257,
            ..base
        };
        assert_eq!(slow.check(&thresholds), Some(DisconnectReason::SlowConsumer));
        assert_eq!(DisconnectReason::SlowConsumer.as_str(), "slow consumer");

        let laggy = PeerHealth {
            rtt_ms: 501.0,
            ..base
        };
        assert_eq!(laggy.check(&thresholds), Some(DisconnectReason::HighLatency));

        let quiet = PeerHealth {
            silence_secs: 10.5,
            ..base
        };
        assert_eq!(quiet.check(&thresholds), Some(DisconnectReason::Silent));
    }

    #[test]
    fn queue_depth_at_limit_is_tolerated() {
        let health = PeerHealth {
            queue_depth: 256,
            ..Default::default()
        };
        assert_eq!(health.check(&HealthThresholds::default()), None);
    }
}
