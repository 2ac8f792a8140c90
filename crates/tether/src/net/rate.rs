use crate::config::AdaptiveRateConfig;

const HIGH_SCALE: f32 = 0.5;
const MODERATE_SCALE: f32 = 0.75;

/// Send rate after backing off for the observed link quality.
pub fn effective_send_rate(nominal: f32, loss: f32, rtt_ms: f32, config: &AdaptiveRateConfig) -> f32 {
    if loss >= config.high_loss || rtt_ms >= config.high_rtt_ms {
        nominal * HIGH_SCALE
    } else if loss >= config.moderate_loss || rtt_ms >= config.moderate_rtt_ms {
        nominal * MODERATE_SCALE
    } else {
        nominal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_link_runs_nominal() {
        let config = AdaptiveRateConfig::default();
        assert_eq!(effective_send_rate(20.0, 0.01, 40.0, &config), 20.0);
    }

    #[test]
    fn moderate_conditions_back_off() {
        let config = AdaptiveRateConfig::default();
        assert_eq!(effective_send_rate(20.0, 0.05, 40.0, &config), 15.0);
        assert_eq!(effective_send_rate(20.0, 0.0, 150.0, &config), 15.0);
    }

    #[test]
    fn high_conditions_halve() {
        let config = AdaptiveRateConfig::default();
        assert_eq!(effective_send_rate(20.0, 0.12, 40.0, &config), 10.0);
        assert_eq!(effective_send_rate(20.0, 0.06, 320.0, &config), 10.0);
    }
}
