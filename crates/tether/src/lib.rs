//! Real-time state replication over unreliable datagrams.
//!
//! A server registers entities and [`NetworkManager::tick`] streams their
//! transforms to every connected client under a per-tick byte budget,
//! prioritised by how long each entity has waited. Clients buffer the
//! snapshots and render them slightly in the past, with optional local
//! prediction for the entities they drive. Reliable RPCs and ownership
//! changes share the same link.

pub mod arena;
pub mod config;
pub mod events;
pub mod manager;
pub mod net;
pub mod replication;
pub mod rpc;

pub use arena::{ArenaBlock, ArenaError, FrameArena};
pub use config::{ConfigError, NetworkConfig, Role};
pub use events::{DisconnectReason, NetworkEvent, ReplicationEvent};
pub use manager::{EventSubscriber, ManagerError, NetworkManager};
pub use net::{
    ConnectionState, LinkConditioner, LinkConditions, MemoryNetwork, MemoryTransport, NetworkStats,
    PacketCodec, PeerId, Transport, UdpTransport,
};
pub use replication::{
    EntityHandle, EntityRef, InverseDistanceWeight, PriorityWeight, QuantProfile, ReplicationError,
    Sample, SampleKind, Transform, UniformWeight,
};
pub use rpc::{PendingRpc, Reliability, RpcTarget};
