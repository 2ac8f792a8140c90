use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::arena::DEFAULT_ARENA_CAPACITY;
use crate::net::{DEFAULT_PORT, DEFAULT_TICK_RATE, MAX_PACKET_SIZE, SNAPSHOT_DATAGRAM_OVERHEAD};

pub const MIN_INTERPOLATION_DELAY_MS: f32 = 50.0;
pub const MAX_INTERPOLATION_DELAY_MS: f32 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Role {
    #[default]
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub role: Role,
    pub port: u16,
    pub max_peers: usize,
    pub max_entities: usize,
    pub tick_rate: u32,
    pub send_rate: u32,
    pub event_budget: usize,
    pub burst_budget: usize,
    pub burst_window_secs: f32,
    /// Datagram bytes per flush per peer, headers included.
    pub bandwidth_budget: usize,
    pub reserved_slots: usize,
    pub full_sync_interval_secs: f32,
    pub arena_capacity: usize,
    pub local_origin: Vec3,
    pub keep_alive_interval_secs: f32,
    pub reliable_resend_secs: f32,
    pub encryption: bool,
    pub connection: ConnectionConfig,
    pub health: HealthThresholds,
    pub interpolation: InterpolationConfig,
    pub prediction: PredictionConfig,
    pub adaptive: AdaptiveRateConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            port: DEFAULT_PORT,
            max_peers: 16,
            max_entities: 512,
            tick_rate: DEFAULT_TICK_RATE,
            send_rate: 20,
            event_budget: 64,
            burst_budget: 512,
            burst_window_secs: 2.0,
            bandwidth_budget: 4096,
            reserved_slots: 2,
            full_sync_interval_secs: 5.0,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            local_origin: Vec3::ZERO,
            keep_alive_interval_secs: 0.25,
            reliable_resend_secs: 0.2,
            encryption: false,
            connection: ConnectionConfig::default(),
            health: HealthThresholds::default(),
            interpolation: InterpolationConfig::default(),
            prediction: PredictionConfig::default(),
            adaptive: AdaptiveRateConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn server() -> Self {
        Self::default()
    }

    pub fn client() -> Self {
        Self {
            role: Role::Client,
            ..Self::default()
        }
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::ZeroRate("tick_rate"));
        }
        if self.send_rate == 0 {
            return Err(ConfigError::ZeroRate("send_rate"));
        }
        if self.send_rate > self.tick_rate {
            return Err(ConfigError::SendRateAboveTickRate {
                send_rate: self.send_rate,
                tick_rate: self.tick_rate,
            });
        }
        if self.max_peers == 0 || self.max_peers >= u16::MAX as usize {
            return Err(ConfigError::MaxPeers(self.max_peers));
        }
        if self.max_entities == 0 || self.max_entities > u16::MAX as usize {
            return Err(ConfigError::MaxEntities(self.max_entities));
        }
        if self.event_budget == 0 || self.burst_budget < self.event_budget {
            return Err(ConfigError::EventBudget {
                budget: self.event_budget,
                burst: self.burst_budget,
            });
        }
        if self.bandwidth_budget <= SNAPSHOT_DATAGRAM_OVERHEAD {
            return Err(ConfigError::BandwidthBudget(self.bandwidth_budget));
        }
        if self.arena_capacity < MAX_PACKET_SIZE {
            return Err(ConfigError::ArenaCapacity(self.arena_capacity));
        }
        if self.interpolation.buffer_depth < 2 {
            return Err(ConfigError::BufferDepth(self.interpolation.buffer_depth));
        }

        self.interpolation.delay_ms = self
            .interpolation
            .delay_ms
            .clamp(MIN_INTERPOLATION_DELAY_MS, MAX_INTERPOLATION_DELAY_MS);

        Ok(())
    }

    pub fn tick_interval(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }

    /// Send ticks between forced full syncs.
    pub fn full_sync_every(&self) -> u64 {
        ((self.full_sync_interval_secs * self.send_rate as f32).ceil() as u64).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub retry_interval_secs: f32,
    pub max_retries: u32,
    pub timeout_secs: f32,
    pub disconnect_linger_secs: f32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 0.5,
            max_retries: 10,
            timeout_secs: 10.0,
            disconnect_linger_secs: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub max_rtt_ms: f32,
    pub max_queue_depth: usize,
    pub max_silence_secs: f32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_rtt_ms: 500.0,
            max_queue_depth: 256,
            max_silence_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    pub delay_ms: f32,
    pub buffer_depth: usize,
    pub extrapolation_limit_ms: f32,
    pub time_correction_rate: f32,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            delay_ms: 100.0,
            buffer_depth: 4,
            extrapolation_limit_ms: 250.0,
            time_correction_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub history: usize,
    pub error_threshold: f32,
    pub correction_speed: f32,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            history: 128,
            error_threshold: 0.01,
            correction_speed: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveRateConfig {
    pub moderate_loss: f32,
    pub high_loss: f32,
    pub moderate_rtt_ms: f32,
    pub high_rtt_ms: f32,
}

impl Default for AdaptiveRateConfig {
    fn default() -> Self {
        Self {
            moderate_loss: 0.05,
            high_loss: 0.10,
            moderate_rtt_ms: 150.0,
            high_rtt_ms: 300.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroRate(&'static str),
    #[error("send rate {send_rate} Hz exceeds tick rate {tick_rate} Hz")]
    SendRateAboveTickRate { send_rate: u32, tick_rate: u32 },
    #[error("max peers {0} out of range")]
    MaxPeers(usize),
    #[error("max entities {0} out of range")]
    MaxEntities(usize),
    #[error("event budget {budget} must be non-zero and not above burst budget {burst}")]
    EventBudget { budget: usize, burst: usize },
    #[error("bandwidth budget {0} cannot fit a single snapshot datagram")]
    BandwidthBudget(usize),
    #[error("arena capacity {0} is smaller than one datagram")]
    ArenaCapacity(usize),
    #[error("interpolation buffer depth {0} must be at least 2")]
    BufferDepth(usize),
    #[error("encryption enabled but no packet codec installed")]
    MissingCodec,
    #[error("packet codec adds {0} bytes, leaving no room for a snapshot")]
    CodecOverhead(usize),
}
