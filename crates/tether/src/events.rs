use std::net::SocketAddr;

use crate::net::{ConnectionState, PeerId};
use crate::replication::EntityHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ConnectionFailed {
        reason: String,
    },
    PeerConnected {
        peer: PeerId,
        addr: SocketAddr,
    },
    PeerDisconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    RpcReceived {
        subject: String,
        sender: PeerId,
    },
    Replication(ReplicationEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationEvent {
    Started {
        handle: EntityHandle,
    },
    Stopped {
        handle: EntityHandle,
    },
    OwnershipChanged {
        handle: EntityHandle,
        owner: Option<PeerId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    Graceful = 0,
    Timeout = 1,
    Kicked = 2,
    SlowConsumer = 3,
    HighLatency = 4,
    Silent = 5,
    ServerShutdown = 6,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::SlowConsumer => "slow consumer",
            DisconnectReason::HighLatency => "high latency",
            DisconnectReason::Silent => "silent",
            DisconnectReason::ServerShutdown => "server shutdown",
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Timeout,
            2 => Self::Kicked,
            3 => Self::SlowConsumer,
            4 => Self::HighLatency,
            5 => Self::Silent,
            6 => Self::ServerShutdown,
            _ => Self::Graceful,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
