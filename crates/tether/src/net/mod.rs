mod codec;
mod conditioner;
mod connection;
mod health;
mod peer;
mod protocol;
mod rate;
mod stats;
mod tracking;
mod transport;
mod validator;

pub use codec::{CodecError, PacketCodec};
pub use conditioner::{LinkConditioner, LinkConditions};
pub use connection::{ConnectionFsm, ConnectionState, LinkAction};
pub use health::PeerHealth;
pub use peer::{Peer, PeerId};
pub use protocol::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, MAX_PACKET_SIZE, Message, MessageKind, PACKET_HEADER_SIZE,
    PROTOCOL_VERSION, PacketError, PacketFlags, PacketHeader, RpcFrame, SNAPSHOT_DATAGRAM_OVERHEAD,
    SNAPSHOT_PREFIX_SIZE, WireTarget, sequence_greater_than,
};
pub use rate::effective_send_rate;
pub use stats::{NetworkStats, PeerStats, ThroughputMeter};
pub use tracking::{AckTracker, PendingPacket, ReceiveTracker};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, TransportError, UdpTransport};
pub use validator::{PacketValidator, ValidationError, ValidatorCounters};
