use std::collections::VecDeque;

use crate::config::ConnectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }
}

/// What the owner of the link must do after an `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    SendConnectRequest { attempt: u32 },
    RetriesExhausted,
    TimedOut,
    Closed,
}

/// Lifecycle of the local end of the link. Time only moves through
/// `update`, so the machine is deterministic under test.
#[derive(Debug)]
pub struct ConnectionFsm {
    config: ConnectionConfig,
    state: ConnectionState,
    state_timer: f32,
    silence_timer: f32,
    retries: u32,
    watch_silence: bool,
    transitions: VecDeque<(ConnectionState, ConnectionState)>,
}

impl ConnectionFsm {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            state_timer: 0.0,
            silence_timer: 0.0,
            retries: 0,
            watch_silence: false,
            transitions: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    fn transition(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        log::debug!("link {} -> {}", self.state.as_str(), to.as_str());
        self.transitions.push_back((self.state, to));
        self.state = to;
        self.state_timer = 0.0;
        self.silence_timer = 0.0;
    }

    /// Server side: the link is up as soon as the socket is bound.
    pub fn listen(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.watch_silence = false;
        self.transition(ConnectionState::Connected);
        true
    }

    pub fn begin_connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.retries = 0;
        self.watch_silence = true;
        self.transition(ConnectionState::Connecting);
        true
    }

    pub fn accepted(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.transition(ConnectionState::Connected);
        true
    }

    pub fn begin_disconnect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.transition(ConnectionState::Disconnecting);
                true
            }
            _ => false,
        }
    }

    pub fn force_disconnect(&mut self) {
        self.transition(ConnectionState::Disconnected);
    }

    /// Any valid inbound traffic keeps the link alive.
    pub fn touch(&mut self) {
        self.silence_timer = 0.0;
    }

    pub fn update(&mut self, dt: f32) -> Option<LinkAction> {
        self.state_timer += dt;
        self.silence_timer += dt;

        match self.state {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting => {
                if self.state_timer < self.config.retry_interval_secs {
                    return None;
                }
                self.state_timer = 0.0;
                self.retries += 1;

                if self.retries > self.config.max_retries {
                    log::warn!(
                        "giving up after {} connection attempts",
                        self.config.max_retries
                    );
                    self.transition(ConnectionState::Disconnected);
                    return Some(LinkAction::RetriesExhausted);
                }
                Some(LinkAction::SendConnectRequest {
                    attempt: self.retries,
                })
            }
            ConnectionState::Connected => {
                if self.watch_silence && self.silence_timer >= self.config.timeout_secs {
                    log::warn!("link timed out after {:.1}s of silence", self.silence_timer);
                    self.transition(ConnectionState::Disconnected);
                    return Some(LinkAction::TimedOut);
                }
                None
            }
            ConnectionState::Disconnecting => {
                if self.state_timer >= self.config.disconnect_linger_secs {
                    self.transition(ConnectionState::Disconnected);
                    return Some(LinkAction::Closed);
                }
                None
            }
        }
    }

    pub fn drain_transitions(
        &mut self,
    ) -> impl Iterator<Item = (ConnectionState, ConnectionState)> + '_ {
        self.transitions.drain(..)
    }
}
