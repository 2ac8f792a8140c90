use super::entity::{EntityRef, Transform};
use super::handle::{EntityHandle, generation_newer};
use super::interpolation::{Sample, SnapshotRing};
use super::prediction::Predictor;
use super::quantize::QuantProfile;
use super::snapshot::DecodedSnapshot;
use crate::events::ReplicationEvent;
use crate::net::PeerId;

#[inline]
fn sequence_newer(a: u8, b: u8) -> bool {
    a != b && a.wrapping_sub(b) < 128
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Started,
    Replaced,
    Stale,
    OutOfOrder,
    OutOfRange,
}

impl ApplyOutcome {
    pub fn accepted(self) -> bool {
        matches!(self, Self::Applied | Self::Started | Self::Replaced)
    }
}

/// Receiver's copy of one entity replicated from the server.
pub struct RemoteEntity {
    pub handle: EntityHandle,
    pub latest: Transform,
    pub last_sequence: u8,
    pub profile: QuantProfile,
    pub input_ack: Option<u16>,
    pub owner: Option<PeerId>,
    ring: SnapshotRing,
    binding: Option<Box<dyn EntityRef>>,
    predictor: Option<Predictor>,
}

impl RemoteEntity {
    fn new(handle: EntityHandle, depth: usize, sequence: u8) -> Self {
        Self {
            handle,
            latest: Transform::default(),
            last_sequence: sequence,
            profile: QuantProfile::default(),
            input_ack: None,
            owner: None,
            ring: SnapshotRing::new(depth),
            binding: None,
            predictor: None,
        }
    }

    fn merge(&mut self, snapshot: &DecodedSnapshot, server_time: f64) {
        self.latest = snapshot.apply_to(&self.latest);
        self.last_sequence = snapshot.header.sequence;
        self.profile = snapshot.profile;
        self.ring.push(self.latest, server_time);

        if let Some(ack) = snapshot.input_ack {
            self.input_ack = Some(ack);
            if let Some(predictor) = &mut self.predictor {
                if let Some(correction) = predictor.reconcile(&self.latest, ack) {
                    log::trace!("{} corrected by {:.3}", self.handle, correction.length());
                }
            }
        }
    }

    pub fn sample(&self, render_time: f64, max_extrapolation: f64) -> Option<Sample> {
        self.ring.sample(render_time, max_extrapolation)
    }

    pub fn bind(&mut self, binding: Box<dyn EntityRef>) {
        self.binding = Some(binding);
    }

    pub fn unbind(&mut self) -> Option<Box<dyn EntityRef>> {
        self.binding.take()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn set_predictor(&mut self, predictor: Option<Predictor>) {
        self.predictor = predictor;
    }

    pub fn predictor(&self) -> Option<&Predictor> {
        self.predictor.as_ref()
    }

    pub fn predictor_mut(&mut self) -> Option<&mut Predictor> {
        self.predictor.as_mut()
    }

    /// Applies one predicted input and shows it on the bound entity at once.
    pub fn predict(&mut self, after: Transform) -> Option<u16> {
        let predictor = self.predictor.as_mut()?;
        let sequence = predictor.apply_input(after);
        if let Some(binding) = &mut self.binding {
            binding.write(&predictor.visual());
        }
        Some(sequence)
    }

    /// Writes this frame's state to the bound host entity.
    pub fn render(&mut self, render_time: f64, max_extrapolation: f64, dt: f32) {
        let Some(binding) = &mut self.binding else {
            return;
        };
        if let Some(predictor) = &mut self.predictor {
            predictor.update(dt);
            binding.write(&predictor.visual());
        } else if let Some(sample) = self.ring.sample(render_time, max_extrapolation) {
            binding.write(&sample.transform);
        }
    }

    pub fn buffered(&self) -> usize {
        self.ring.len()
    }
}

#[derive(Default)]
struct RemoteSlot {
    entity: Option<RemoteEntity>,
    retired: Option<u8>,
    /// Ownership that arrived before the entity's first snapshot.
    early_owner: Option<(u8, Option<PeerId>)>,
}

/// Remote entities indexed by slot id. Each slot remembers the generation
/// it last saw so late packets for a removed entity cannot resurrect it.
pub struct RemoteTable {
    slots: Vec<RemoteSlot>,
    depth: usize,
    live: usize,
}

impl RemoteTable {
    pub fn new(max_entities: usize, depth: usize) -> Self {
        Self {
            slots: (0..max_entities).map(|_| RemoteSlot::default()).collect(),
            depth,
            live: 0,
        }
    }

    pub fn apply(
        &mut self,
        snapshot: &DecodedSnapshot,
        server_time: f64,
        events: &mut Vec<ReplicationEvent>,
    ) -> ApplyOutcome {
        let header = snapshot.header;
        let Some(slot) = self.slots.get_mut(header.entity_id as usize) else {
            return ApplyOutcome::OutOfRange;
        };
        let handle = EntityHandle::new(header.entity_id, header.generation);

        let outcome = match slot.entity.as_ref().map(|e| e.handle.generation) {
            Some(current) if current == header.generation => ApplyOutcome::Applied,
            Some(current) if generation_newer(header.generation, current) => ApplyOutcome::Replaced,
            Some(_) => return ApplyOutcome::Stale,
            None if slot
                .retired
                .is_some_and(|retired| !generation_newer(header.generation, retired)) =>
            {
                return ApplyOutcome::Stale;
            }
            None => ApplyOutcome::Started,
        };

        if outcome != ApplyOutcome::Applied {
            if let Some(old) = slot.entity.take() {
                events.push(ReplicationEvent::Stopped { handle: old.handle });
            } else {
                self.live += 1;
            }
            let mut entity = RemoteEntity::new(handle, self.depth, header.sequence);
            events.push(ReplicationEvent::Started { handle });
            if let Some((_, owner)) = slot
                .early_owner
                .take()
                .filter(|(generation, _)| *generation == header.generation)
            {
                entity.owner = owner;
                events.push(ReplicationEvent::OwnershipChanged { handle, owner });
            }
            slot.entity = Some(entity);
        }

        let Some(entity) = slot.entity.as_mut() else {
            return ApplyOutcome::Stale;
        };
        if outcome == ApplyOutcome::Applied
            && !sequence_newer(header.sequence, entity.last_sequence)
        {
            return ApplyOutcome::OutOfOrder;
        }

        entity.merge(snapshot, server_time);
        outcome
    }

    /// Drops the entity if `handle` is its generation or newer.
    pub fn remove(&mut self, handle: EntityHandle, events: &mut Vec<ReplicationEvent>) -> bool {
        let Some(slot) = self.slots.get_mut(handle.id as usize) else {
            return false;
        };

        if slot
            .retired
            .is_none_or(|retired| generation_newer(handle.generation, retired))
        {
            slot.retired = Some(handle.generation);
        }

        let covered = slot.entity.as_ref().is_some_and(|e| {
            e.handle.generation == handle.generation
                || generation_newer(handle.generation, e.handle.generation)
        });
        if !covered {
            return false;
        }

        if let Some(old) = slot.entity.take() {
            self.live -= 1;
            events.push(ReplicationEvent::Stopped { handle: old.handle });
        }
        true
    }

    pub fn set_owner(
        &mut self,
        handle: EntityHandle,
        owner: Option<PeerId>,
        events: &mut Vec<ReplicationEvent>,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(handle.id as usize) else {
            return false;
        };
        let Some(entity) = slot.entity.as_mut().filter(|e| e.handle == handle) else {
            let current = slot.entity.as_ref().map(|e| e.handle.generation).or(slot.retired);
            if current.is_none_or(|current| generation_newer(handle.generation, current)) {
                slot.early_owner = Some((handle.generation, owner));
            }
            return false;
        };
        if entity.owner != owner {
            entity.owner = owner;
            events.push(ReplicationEvent::OwnershipChanged { handle, owner });
        }
        true
    }

    pub fn get(&self, handle: EntityHandle) -> Option<&RemoteEntity> {
        self.slots
            .get(handle.id as usize)
            .and_then(|slot| slot.entity.as_ref())
            .filter(|e| e.handle == handle)
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut RemoteEntity> {
        self.slots
            .get_mut(handle.id as usize)
            .and_then(|slot| slot.entity.as_mut())
            .filter(|e| e.handle == handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteEntity> {
        self.slots.iter().filter_map(|slot| slot.entity.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemoteEntity> {
        self.slots.iter_mut().filter_map(|slot| slot.entity.as_mut())
    }

    /// Forgets everything, e.g. after the link to the server drops.
    pub fn clear(&mut self, events: &mut Vec<ReplicationEvent>) {
        for slot in &mut self.slots {
            if let Some(old) = slot.entity.take() {
                events.push(ReplicationEvent::Stopped { handle: old.handle });
            }
            slot.retired = None;
            slot.early_owner = None;
        }
        self.live = 0;
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};

    use super::*;
    use crate::replication::snapshot::{DirtyFields, SnapshotHeader};

    fn snapshot(id: u16, generation: u8, sequence: u8, x: f32) -> DecodedSnapshot {
        DecodedSnapshot {
            header: SnapshotHeader {
                entity_id: id,
                generation,
                dirty: DirtyFields::POSITION,
                quant_profile: 0,
                sequence,
            },
            profile: QuantProfile::Standard,
            position: Some(Vec3::new(x, 0.0, 0.0)),
            rotation: None,
            velocity: None,
            input_ack: None,
        }
    }

    #[test]
    fn first_snapshot_starts_entity() {
        let mut table = RemoteTable::new(8, 4);
        let mut events = Vec::new();

        let outcome = table.apply(&snapshot(3, 1, 0, 2.0), 0.0, &mut events);

        assert_eq!(outcome, ApplyOutcome::Started);
        assert_eq!(
            events,
            vec![ReplicationEvent::Started {
                handle: EntityHandle::new(3, 1)
            }]
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_generation_never_touches_newer_entity() {
        let mut table = RemoteTable::new(8, 4);
        let mut events = Vec::new();

        table.apply(&snapshot(3, 5, 0, 1.0), 0.0, &mut events);
        let outcome = table.apply(&snapshot(3, 4, 9, 99.0), 0.1, &mut events);

        assert_eq!(outcome, ApplyOutcome::Stale);
        let entity = table.get(EntityHandle::new(3, 5)).unwrap();
        assert_eq!(entity.latest.position.x, 1.0);
        assert!(table.get(EntityHandle::new(3, 4)).is_none());
    }

    #[test]
    fn newer_generation_replaces_slot() {
        let mut table = RemoteTable::new(8, 4);
        let mut events = Vec::new();

        table.apply(&snapshot(3, 255, 0, 1.0), 0.0, &mut events);
        events.clear();
        let outcome = table.apply(&snapshot(3, 0, 0, 7.0), 0.1, &mut events);

        assert_eq!(outcome, ApplyOutcome::Replaced);
        assert_eq!(
            events,
            vec![
                ReplicationEvent::Stopped {
                    handle: EntityHandle::new(3, 255)
                },
                ReplicationEvent::Started {
                    handle: EntityHandle::new(3, 0)
                },
            ]
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn out_of_order_sequence_dropped() {
        let mut table = RemoteTable::new(8, 4);
        let mut events = Vec::new();

        table.apply(&snapshot(1, 0, 10, 1.0), 0.0, &mut events);
        assert_eq!(
            table.apply(&snapshot(1, 0, 9, 5.0), 0.1, &mut events),
            ApplyOutcome::OutOfOrder
        );
        assert_eq!(
            table.apply(&snapshot(1, 0, 11, 5.0), 0.1, &mut events),
            ApplyOutcome::Applied
        );
    }

    #[test]
    fn removed_entity_not_resurrected_by_late_packet() {
        let mut table = RemoteTable::new(8, 4);
        let mut events = Vec::new();
        let handle = EntityHandle::new(2, 3);

        table.apply(&snapshot(2, 3, 0, 1.0), 0.0, &mut events);
        assert!(table.remove(handle, &mut events));
        assert_eq!(
            table.apply(&snapshot(2, 3, 1, 1.0), 0.1, &mut events),
            ApplyOutcome::Stale
        );
        assert_eq!(
            table.apply(&snapshot(2, 4, 0, 1.0), 0.1, &mut events),
            ApplyOutcome::Started
        );
    }

    #[test]
    fn out_of_range_ids_ignored() {
        let mut table = RemoteTable::new(4, 4);
        let mut events = Vec::new();
        assert_eq!(
            table.apply(&snapshot(40, 0, 0, 1.0), 0.0, &mut events),
            ApplyOutcome::OutOfRange
        );
        assert!(events.is_empty());
    }

    #[test]
    fn deltas_merge_onto_latest() {
        let mut table = RemoteTable::new(4, 4);
        let mut events = Vec::new();

        let mut full = snapshot(0, 0, 0, 1.0);
        full.rotation = Some(Quat::from_rotation_y(1.0));
        table.apply(&full, 0.0, &mut events);
        table.apply(&snapshot(0, 0, 1, 2.0), 0.05, &mut events);

        let entity = table.get(EntityHandle::new(0, 0)).unwrap();
        assert_eq!(entity.latest.position.x, 2.0);
        assert_eq!(entity.latest.rotation, Quat::from_rotation_y(1.0));
        assert_eq!(entity.buffered(), 2);
    }

    #[test]
    fn bound_entity_receives_rendered_state() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut table = RemoteTable::new(4, 4);
        let mut events = Vec::new();
        table.apply(&snapshot(0, 0, 0, 0.0), 0.0, &mut events);
        table.apply(&snapshot(0, 0, 1, 10.0), 0.1, &mut events);

        let host = Rc::new(RefCell::new(Transform::default()));
        let entity = table.get_mut(EntityHandle::new(0, 0)).unwrap();
        entity.bind(Box::new(Rc::clone(&host)));
        entity.render(0.05, 0.25, 0.016);

        assert!((host.borrow().position.x - 5.0).abs() < 1e-3);
    }

    #[test]
    fn owner_before_first_snapshot_is_kept() {
        let mut table = RemoteTable::new(4, 4);
        let mut events = Vec::new();
        let handle = EntityHandle::new(1, 0);

        assert!(!table.set_owner(handle, Some(PeerId(3)), &mut events));
        table.apply(&snapshot(1, 0, 0, 1.0), 0.0, &mut events);

        assert_eq!(table.get(handle).unwrap().owner, Some(PeerId(3)));
        assert_eq!(
            events,
            vec![
                ReplicationEvent::Started { handle },
                ReplicationEvent::OwnershipChanged {
                    handle,
                    owner: Some(PeerId(3)),
                },
            ]
        );
    }
}
