mod dispatcher;
mod queue;

pub use dispatcher::{RpcDispatcher, RpcHandler};
pub use queue::{QueuedMessage, ReceiveWindow, ReliableQueue};

use crate::net::{PeerId, WireTarget};
use crate::replication::EntityHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    Server,
    All,
    Owner(EntityHandle),
    AllExceptOwner(EntityHandle),
}

impl RpcTarget {
    pub fn to_wire(self) -> WireTarget {
        match self {
            Self::Server => WireTarget::Server,
            Self::All => WireTarget::All,
            Self::Owner(handle) => WireTarget::Owner {
                id: handle.id,
                generation: handle.generation,
            },
            Self::AllExceptOwner(handle) => WireTarget::AllExceptOwner {
                id: handle.id,
                generation: handle.generation,
            },
        }
    }

    pub fn from_wire(target: WireTarget) -> Self {
        match target {
            WireTarget::Server => Self::Server,
            WireTarget::All => Self::All,
            WireTarget::Owner { id, generation } => Self::Owner(EntityHandle::new(id, generation)),
            WireTarget::AllExceptOwner { id, generation } => {
                Self::AllExceptOwner(EntityHandle::new(id, generation))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    #[default]
    Reliable,
    Unreliable,
}

impl Reliability {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Reliable)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRpc {
    pub subject: String,
    pub payload: Vec<u8>,
    pub target: RpcTarget,
    pub reliability: Reliability,
    pub sender: PeerId,
}
