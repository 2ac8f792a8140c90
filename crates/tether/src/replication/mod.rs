mod delivery;
mod entity;
mod handle;
mod interpolation;
mod manager;
mod prediction;
mod quantize;
mod remote;
mod schedule;
mod snapshot;

pub use delivery::{DatagramId, DeliveryLog};
pub use entity::{EntityRef, InverseDistanceWeight, PriorityWeight, Transform, UniformWeight};
pub use handle::{EntityHandle, SlotTable, generation_newer};
pub use interpolation::{RenderClock, Sample, SampleKind, SnapshotRing, TimedTransform, blend};
pub use manager::{FlushReport, ReceiveReport, ReplicatedEntityState, ReplicationManager};
pub use prediction::Predictor;
pub use quantize::{ProfileCodec, QuantProfile, decode_smallest_three, encode_smallest_three};
pub use remote::{ApplyOutcome, RemoteEntity, RemoteTable};
pub use schedule::{Candidate, DatagramLimits, FlushBudget, select_for_flush};
pub use snapshot::{
    DecodedSnapshot, DirtyFields, INPUT_ACK_SIZE, SNAPSHOT_HEADER_SIZE, SnapshotError,
    SnapshotHeader, body_size, decode_snapshot, encode_snapshot, encoded_size,
};

use crate::arena::ArenaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    #[error("entity handle {0} is stale")]
    StaleHandle(EntityHandle),
    #[error("entity table full ({0} slots)")]
    CapacityReached(usize),
    #[error("only the server registers replicated entities")]
    NotAuthority,
    #[error("prediction is not enabled for {0}")]
    PredictionDisabled(EntityHandle),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}
