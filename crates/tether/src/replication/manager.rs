use glam::Vec3;

use super::ReplicationError;
use super::delivery::{DatagramId, DeliveryLog};
use super::entity::{EntityRef, InverseDistanceWeight, PriorityWeight, Transform};
use super::handle::{EntityHandle, SlotTable};
use super::interpolation::{RenderClock, Sample};
use super::prediction::Predictor;
use super::quantize::QuantProfile;
use super::remote::{RemoteEntity, RemoteTable};
use super::schedule::{Candidate, DatagramLimits, select_for_flush};
use super::snapshot::{DirtyFields, SnapshotHeader, decode_snapshot, encode_snapshot, encoded_size};
use crate::arena::{ArenaBlock, ArenaError, FrameArena};
use crate::config::{NetworkConfig, PredictionConfig};
use crate::events::ReplicationEvent;
use crate::net::{PeerId, SNAPSHOT_PREFIX_SIZE};

const MIN_BASE_PRIORITY: f32 = 0.01;
const MIN_WEIGHT: f32 = 0.05;
/// Snapshot datagrams remembered for loss repair.
const DELIVERY_LOG_CAPACITY: usize = 1024;

/// Sender-side bookkeeping for one registered entity.
#[derive(Debug, Clone)]
pub struct ReplicatedEntityState {
    pub content_hash: u64,
    pub sent_hash: Option<u64>,
    pub epoch: u32,
    pub sent_epoch: u32,
    pub ticks_since_full_sync: u64,
    pub base_priority: f32,
    pub accumulator: f32,
    pub profile: QuantProfile,
    pub sequence: u8,
    pub current: Transform,
    pub last_sent: Transform,
    pub needs_full_sync: bool,
    pub prediction: bool,
    pub input_ack: Option<u16>,
    pub owner: Option<PeerId>,
    input_ack_pending: bool,
    pending: DirtyFields,
    /// Fields carried by datagrams a peer never received.
    lost: DirtyFields,
}

impl ReplicatedEntityState {
    fn new(profile: QuantProfile, base_priority: f32) -> Self {
        Self {
            content_hash: 0,
            sent_hash: None,
            epoch: 0,
            sent_epoch: 0,
            ticks_since_full_sync: 0,
            base_priority: base_priority.max(MIN_BASE_PRIORITY),
            accumulator: 0.0,
            profile,
            sequence: 0,
            current: Transform::default(),
            last_sent: Transform::default(),
            needs_full_sync: true,
            prediction: false,
            input_ack: None,
            owner: None,
            input_ack_pending: false,
            pending: DirtyFields::empty(),
            lost: DirtyFields::empty(),
        }
    }

    fn changed(&self) -> bool {
        self.sent_hash != Some(self.content_hash) || self.epoch != self.sent_epoch
    }

    pub fn is_dirty(&self) -> bool {
        self.needs_full_sync || self.changed() || self.input_ack_pending || !self.lost.is_empty()
    }

    /// Fields the next snapshot carries: what moved since the last send plus
    /// whatever went missing on the wire. A change the field comparison
    /// cannot see (hash collision or a forced epoch bump) sends everything.
    fn outgoing(&self) -> DirtyFields {
        let mut dirty = if self.needs_full_sync || self.sent_hash.is_none() {
            DirtyFields::TRANSFORM
        } else {
            let fields = DirtyFields::between(&self.last_sent, &self.current);
            if fields.is_empty() && self.changed() {
                DirtyFields::TRANSFORM
            } else {
                fields
            }
        };
        dirty |= self.lost & DirtyFields::TRANSFORM;
        if self.prediction && self.input_ack.is_some() {
            dirty |= DirtyFields::INPUT_ACK;
        }
        dirty
    }

    fn mark_sent(&mut self) {
        if self.pending.contains(DirtyFields::TRANSFORM) {
            self.needs_full_sync = false;
            // The first send keeps the registration stagger.
            if self.sent_hash.is_some() {
                self.ticks_since_full_sync = 0;
            }
        }
        self.accumulator = 0.0;
        self.sent_hash = Some(self.content_hash);
        self.sent_epoch = self.epoch;
        self.input_ack_pending = false;
        self.lost = DirtyFields::empty();
        self.last_sent = self.current;
        self.sequence = self.sequence.wrapping_add(1);
    }
}

struct LocalEntity {
    entity: Box<dyn EntityRef>,
    state: ReplicatedEntityState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub candidates: usize,
    pub selected: usize,
    pub encoded: usize,
    pub wire_bytes: usize,
    pub overflowed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    pub applied: usize,
    pub rejected: usize,
}

/// Decides what state goes out each send tick and rebuilds what comes in.
///
/// The server side owns the registered entities: it detects change through
/// content hashes, grows each dirty entity's priority accumulator, picks the
/// best set that fits the byte budget and encodes it straight into the frame
/// arena. The receiving side keeps a generation-checked remote table and
/// feeds the per-entity jitter buffers.
pub struct ReplicationManager {
    entities: SlotTable<LocalEntity>,
    remotes: RemoteTable,
    weight: Box<dyn PriorityWeight>,
    origin: Vec3,
    reserved_slots: usize,
    full_sync_every: u64,
    extrapolation_limit: f64,
    prediction: PredictionConfig,
    clock: RenderClock,
    candidates: Vec<Candidate>,
    selection: Vec<u16>,
    datagrams: Vec<ArenaBlock>,
    datagram_ids: Vec<DatagramId>,
    datagram_limits: DatagramLimits,
    delivery: DeliveryLog,
    events: Vec<ReplicationEvent>,
    overflowing: bool,
    overflow_count: u64,
    snapshots_encoded: u64,
    snapshots_applied: u64,
    snapshots_rejected: u64,
}

impl ReplicationManager {
    pub fn new(config: &NetworkConfig) -> Self {
        let interpolation = &config.interpolation;
        Self {
            entities: SlotTable::new(config.max_entities),
            remotes: RemoteTable::new(config.max_entities, interpolation.buffer_depth),
            weight: Box::new(InverseDistanceWeight::default()),
            origin: config.local_origin,
            reserved_slots: config.reserved_slots,
            full_sync_every: config.full_sync_every(),
            extrapolation_limit: interpolation.extrapolation_limit_ms as f64 / 1000.0,
            prediction: config.prediction.clone(),
            clock: RenderClock::new(
                interpolation.delay_ms as f64 / 1000.0,
                interpolation.time_correction_rate as f64,
            ),
            candidates: Vec::with_capacity(config.max_entities),
            selection: Vec::with_capacity(config.max_entities),
            datagrams: Vec::with_capacity(16),
            datagram_ids: Vec::with_capacity(16),
            datagram_limits: DatagramLimits::default(),
            delivery: DeliveryLog::new(DELIVERY_LOG_CAPACITY),
            events: Vec::new(),
            overflowing: false,
            overflow_count: 0,
            snapshots_encoded: 0,
            snapshots_applied: 0,
            snapshots_rejected: 0,
        }
    }

    pub fn set_priority_weight(&mut self, weight: Box<dyn PriorityWeight>) {
        self.weight = weight;
    }

    /// Leaves room for what the packet codec adds to every datagram.
    pub fn set_codec_overhead(&mut self, overhead: usize) {
        self.datagram_limits = DatagramLimits::with_codec_overhead(overhead);
    }

    pub fn datagram_limits(&self) -> DatagramLimits {
        self.datagram_limits
    }

    pub fn register(
        &mut self,
        entity: Box<dyn EntityRef>,
        profile: QuantProfile,
        base_priority: f32,
    ) -> Result<EntityHandle, ReplicationError> {
        let current = entity.read();
        let handle = self.entities.insert(LocalEntity {
            entity,
            state: ReplicatedEntityState::new(profile, base_priority),
        })?;

        if let Some(local) = self.entities.get_mut(handle) {
            local.state.current = current;
            local.state.content_hash = current.content_hash();
            // Spread heartbeats so entities registered together resync apart.
            local.state.ticks_since_full_sync = handle.id as u64 % self.full_sync_every;
        }
        self.events.push(ReplicationEvent::Started { handle });
        log::debug!("registered {} ({:?}, priority {:.2})", handle, profile, base_priority);
        Ok(handle)
    }

    pub fn unregister(&mut self, handle: EntityHandle) -> Result<(), ReplicationError> {
        self.entities
            .remove(handle)
            .ok_or(ReplicationError::StaleHandle(handle))?;
        self.events.push(ReplicationEvent::Stopped { handle });
        log::debug!("unregistered {}", handle);
        Ok(())
    }

    fn state_mut(&mut self, handle: EntityHandle) -> Result<&mut ReplicatedEntityState, ReplicationError> {
        self.entities
            .get_mut(handle)
            .map(|local| &mut local.state)
            .ok_or(ReplicationError::StaleHandle(handle))
    }

    pub fn state(&self, handle: EntityHandle) -> Option<&ReplicatedEntityState> {
        self.entities.get(handle).map(|local| &local.state)
    }

    pub fn contains(&self, handle: EntityHandle) -> bool {
        self.entities.contains(handle)
    }

    pub fn set_priority(&mut self, handle: EntityHandle, value: f32) -> Result<(), ReplicationError> {
        self.state_mut(handle)?.base_priority = value.max(MIN_BASE_PRIORITY);
        Ok(())
    }

    pub fn set_quant_profile(
        &mut self,
        handle: EntityHandle,
        profile: QuantProfile,
    ) -> Result<(), ReplicationError> {
        let state = self.state_mut(handle)?;
        if state.profile != profile {
            state.profile = profile;
            // Receivers decode deltas with the profile of each snapshot, but
            // fields quantised under the old profile should not linger.
            state.needs_full_sync = true;
        }
        Ok(())
    }

    pub fn enable_prediction(&mut self, handle: EntityHandle, enabled: bool) -> Result<(), ReplicationError> {
        let state = self.state_mut(handle)?;
        state.prediction = enabled;
        if !enabled {
            state.input_ack = None;
            state.input_ack_pending = false;
        }
        Ok(())
    }

    /// Forces the entity dirty even if its content hash did not move.
    pub fn mark_mutated(&mut self, handle: EntityHandle) -> Result<(), ReplicationError> {
        let state = self.state_mut(handle)?;
        state.epoch = state.epoch.wrapping_add(1);
        Ok(())
    }

    pub fn set_owner(&mut self, handle: EntityHandle, owner: Option<PeerId>) -> Result<bool, ReplicationError> {
        let state = self.state_mut(handle)?;
        if state.owner == owner {
            return Ok(false);
        }
        state.owner = owner;
        self.events.push(ReplicationEvent::OwnershipChanged { handle, owner });
        Ok(true)
    }

    pub fn owner(&self, handle: EntityHandle) -> Option<PeerId> {
        self.state(handle).and_then(|state| state.owner)
    }

    pub fn owned_by(&self, peer: PeerId) -> impl Iterator<Item = EntityHandle> + '_ {
        self.entities
            .iter()
            .filter(move |(_, local)| local.state.owner == Some(peer))
            .map(|(handle, _)| handle)
    }

    pub fn acknowledge_input(&mut self, handle: EntityHandle, sequence: u16) -> Result<(), ReplicationError> {
        let state = self.state_mut(handle)?;
        if !state.prediction {
            return Err(ReplicationError::PredictionDisabled(handle));
        }
        state.input_ack = Some(sequence);
        state.input_ack_pending = true;
        Ok(())
    }

    /// Every entity goes out in full on its next selection, e.g. after a peer joins.
    pub fn request_full_sync(&mut self) {
        for (_, local) in self.entities.iter_mut() {
            local.state.needs_full_sync = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.entities.iter().map(|(handle, _)| handle)
    }

    /// Runs one send tick: dirty check, accumulation, selection and encoding.
    /// The resulting datagram bodies are in [`Self::datagrams`] until the
    /// arena is reset.
    pub fn prepare_flush(
        &mut self,
        arena: &mut FrameArena,
        budget: usize,
        interest: &[Vec3],
        server_time_ms: u32,
    ) -> FlushReport {
        self.datagrams.clear();
        self.datagram_ids.clear();
        self.candidates.clear();
        let mut report = FlushReport::default();

        for (handle, local) in self.entities.iter_mut() {
            let state = &mut local.state;
            state.current = local.entity.read();
            state.content_hash = state.current.content_hash();
            state.ticks_since_full_sync += 1;
            if state.ticks_since_full_sync >= self.full_sync_every {
                state.needs_full_sync = true;
            }

            if !state.is_dirty() {
                continue;
            }

            let weight = interest_weight(self.weight.as_ref(), &state.current, interest);
            state.accumulator += state.base_priority * weight;
            state.pending = state.outgoing();
            self.candidates.push(Candidate {
                slot: handle.id,
                accumulator: state.accumulator,
                size: encoded_size(state.profile, state.pending),
            });
        }

        report.candidates = self.candidates.len();
        if self.candidates.is_empty() {
            self.overflowing = false;
            return report;
        }

        report.wire_bytes = select_for_flush(
            &mut self.candidates,
            budget,
            self.reserved_slots,
            self.datagram_limits,
            &mut self.selection,
        );
        report.selected = self.selection.len();

        for &slot in &self.selection {
            let Some(handle) = self.entities.handle_at(slot) else {
                continue;
            };
            let Some(local) = self.entities.get_mut(handle) else {
                continue;
            };

            let mut out = Outgoing {
                datagrams: &mut self.datagrams,
                ids: &mut self.datagram_ids,
                delivery: &mut self.delivery,
                limits: self.datagram_limits,
            };
            match out.encode(arena, handle, &local.state, self.origin, server_time_ms) {
                Ok(()) => {
                    local.state.mark_sent();
                    report.encoded += 1;
                }
                Err(err) => {
                    if !self.overflowing {
                        log::warn!(
                            "arena overflow after {} of {} snapshots: {}",
                            report.encoded,
                            report.selected,
                            err
                        );
                    }
                    report.overflowed = true;
                    break;
                }
            }
        }

        if report.overflowed {
            self.overflow_count += 1;
        }
        self.overflowing = report.overflowed;
        self.snapshots_encoded += report.encoded as u64;
        report
    }

    /// Snapshot datagram bodies built by the last flush: server time followed
    /// by packed snapshots. The packet header is not included.
    pub fn datagrams(&self) -> &[ArenaBlock] {
        &self.datagrams
    }

    /// Delivery ids of [`Self::datagrams`], index for index. Hand one back to
    /// [`Self::requeue_lost`] when a peer never received that datagram.
    pub fn datagram_ids(&self) -> &[DatagramId] {
        &self.datagram_ids
    }

    /// Marks the fields a lost datagram carried for sending again. Entities
    /// that were unregistered since are skipped. Returns how many entities
    /// were affected.
    pub fn requeue_lost(&mut self, id: DatagramId) -> usize {
        let Some(entries) = self.delivery.entries(id) else {
            return 0;
        };
        let mut requeued = 0;
        for &(handle, fields) in entries {
            if let Some(local) = self.entities.get_mut(handle) {
                local.state.lost |= fields & DirtyFields::TRANSFORM;
                requeued += 1;
            }
        }
        requeued
    }

    pub fn accumulator(&self, handle: EntityHandle) -> Option<f32> {
        self.state(handle).map(|state| state.accumulator)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn snapshots_encoded(&self) -> u64 {
        self.snapshots_encoded
    }

    // Receive side.

    /// Applies one snapshot datagram body. An undecodable snapshot drops the
    /// rest of the datagram since its length cannot be known.
    pub fn receive_datagram(&mut self, body: &[u8], local_time: f64) -> ReceiveReport {
        let mut report = ReceiveReport::default();
        let Some((prefix, mut rest)) = body.split_first_chunk::<SNAPSHOT_PREFIX_SIZE>() else {
            report.rejected += 1;
            self.snapshots_rejected += 1;
            return report;
        };

        let server_time = u32::from_le_bytes(*prefix) as f64 / 1000.0;
        self.clock.observe(server_time, local_time);

        while !rest.is_empty() {
            match decode_snapshot(rest, self.origin) {
                Ok((snapshot, consumed)) => {
                    rest = &rest[consumed..];
                    let outcome = self.remotes.apply(&snapshot, server_time, &mut self.events);
                    if outcome.accepted() {
                        report.applied += 1;
                    } else {
                        log::trace!("snapshot for {} ignored: {:?}", snapshot.header.entity_id, outcome);
                        report.rejected += 1;
                    }
                }
                Err(err) => {
                    log::trace!("dropping rest of snapshot datagram: {}", err);
                    report.rejected += 1;
                    break;
                }
            }
        }

        self.snapshots_applied += report.applied as u64;
        self.snapshots_rejected += report.rejected as u64;
        report
    }

    pub fn remove_remote(&mut self, handle: EntityHandle) -> bool {
        self.remotes.remove(handle, &mut self.events)
    }

    pub fn set_remote_owner(&mut self, handle: EntityHandle, owner: Option<PeerId>) -> bool {
        self.remotes.set_owner(handle, owner, &mut self.events)
    }

    pub fn remote(&self, handle: EntityHandle) -> Option<&RemoteEntity> {
        self.remotes.get(handle)
    }

    pub fn remotes(&self) -> &RemoteTable {
        &self.remotes
    }

    fn remote_mut(&mut self, handle: EntityHandle) -> Result<&mut RemoteEntity, ReplicationError> {
        self.remotes
            .get_mut(handle)
            .ok_or(ReplicationError::StaleHandle(handle))
    }

    /// Attaches a host entity that receives the interpolated state every tick.
    pub fn bind_remote(
        &mut self,
        handle: EntityHandle,
        binding: Box<dyn EntityRef>,
    ) -> Result<(), ReplicationError> {
        self.remote_mut(handle)?.bind(binding);
        Ok(())
    }

    pub fn enable_remote_prediction(
        &mut self,
        handle: EntityHandle,
        enabled: bool,
    ) -> Result<(), ReplicationError> {
        let config = self.prediction.clone();
        let remote = self.remote_mut(handle)?;
        let predictor = enabled.then(|| Predictor::new(&config, remote.latest));
        remote.set_predictor(predictor);
        Ok(())
    }

    pub fn predict_input(&mut self, handle: EntityHandle, after: Transform) -> Result<u16, ReplicationError> {
        self.remote_mut(handle)?
            .predict(after)
            .ok_or(ReplicationError::PredictionDisabled(handle))
    }

    /// Interpolated state of a remote entity as of `local_time`.
    pub fn sample(&self, handle: EntityHandle, local_time: f64) -> Option<Sample> {
        let render_time = self.clock.server_now(local_time) - self.clock.delay();
        self.remotes.get(handle)?.sample(render_time, self.extrapolation_limit)
    }

    /// Pushes this frame's interpolated or predicted state into bound entities.
    pub fn render(&mut self, local_time: f64, dt: f32) {
        if !self.clock.is_synced() {
            return;
        }
        let render_time = self.clock.render_time(local_time);
        for remote in self.remotes.iter_mut() {
            remote.render(render_time, self.extrapolation_limit, dt);
        }
    }

    pub fn clock(&self) -> &RenderClock {
        &self.clock
    }

    /// Drops all remote state, e.g. when the link to the server goes away.
    pub fn clear_remotes(&mut self) {
        self.remotes.clear(&mut self.events);
        self.clock.reset();
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied
    }

    pub fn snapshots_rejected(&self) -> u64 {
        self.snapshots_rejected
    }

    pub fn drain_events(&mut self) -> std::vec::Drain<'_, ReplicationEvent> {
        self.events.drain(..)
    }
}

fn interest_weight(weight: &dyn PriorityWeight, entity: &Transform, interest: &[Vec3]) -> f32 {
    if interest.is_empty() {
        return 1.0;
    }
    interest
        .iter()
        .map(|poi| weight.weight(entity, *poi))
        .fold(0.0, f32::max)
        .max(MIN_WEIGHT)
}

/// Where a flush writes: the datagram bodies in the arena, their delivery
/// ids, and the record of what each carries.
struct Outgoing<'a> {
    datagrams: &'a mut Vec<ArenaBlock>,
    ids: &'a mut Vec<DatagramId>,
    delivery: &'a mut DeliveryLog,
    limits: DatagramLimits,
}

impl Outgoing<'_> {
    /// Appends one snapshot to the current datagram, opening a new one when
    /// it would pass the packet size. Packing mirrors
    /// [`super::schedule::FlushBudget`].
    fn encode(
        &mut self,
        arena: &mut FrameArena,
        handle: EntityHandle,
        state: &ReplicatedEntityState,
        origin: Vec3,
        server_time_ms: u32,
    ) -> Result<(), ReplicationError> {
        let size = encoded_size(state.profile, state.pending);
        let fits = self
            .datagrams
            .last()
            .is_some_and(|datagram| self.limits.fits(datagram.len() + size));
        if !fits {
            let prefix = arena.alloc(SNAPSHOT_PREFIX_SIZE)?;
            arena
                .block_mut(&prefix)
                .copy_from_slice(&server_time_ms.to_le_bytes());
            self.datagrams.push(prefix);
            self.ids.push(self.delivery.open());
        }

        let (Some(datagram), Some(&id)) = (self.datagrams.last_mut(), self.ids.last()) else {
            return Err(ArenaError::NotLast.into());
        };
        let body = match arena.grow(datagram, size) {
            Ok(body) => body,
            Err(err) => {
                if datagram.len() == SNAPSHOT_PREFIX_SIZE {
                    self.datagrams.pop();
                    self.ids.pop();
                    self.delivery.discard_last(id);
                }
                return Err(err.into());
            }
        };

        let header = SnapshotHeader {
            entity_id: handle.id,
            generation: handle.generation,
            dirty: state.pending,
            quant_profile: state.profile as u8,
            sequence: state.sequence,
        };
        encode_snapshot(
            &header,
            state.profile,
            &state.current,
            state.input_ack.unwrap_or(0),
            origin,
            arena.block_mut(&body),
        )?;
        self.delivery.record(handle, state.pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::net::SNAPSHOT_DATAGRAM_OVERHEAD;

    const STANDARD_POSE: usize = 16;

    fn config() -> NetworkConfig {
        NetworkConfig {
            reserved_slots: 2,
            ..NetworkConfig::default()
        }
    }

    fn shared(x: f32) -> Rc<RefCell<Transform>> {
        Rc::new(RefCell::new(Transform::from_position(Vec3::new(x, 1.0, 0.0))))
    }

    /// Moves every entity so position and rotation are both dirty.
    fn wiggle(entities: &[Rc<RefCell<Transform>>], step: f32) {
        for entity in entities {
            let mut transform = entity.borrow_mut();
            transform.position.x += step;
            transform.rotation = glam::Quat::from_rotation_y(step);
        }
    }

    fn register_all(
        manager: &mut ReplicationManager,
        entities: &[Rc<RefCell<Transform>>],
        priorities: &[f32],
    ) -> Vec<EntityHandle> {
        entities
            .iter()
            .zip(priorities)
            .map(|(entity, &priority)| {
                manager
                    .register(Box::new(Rc::clone(entity)), QuantProfile::Standard, priority)
                    .unwrap()
            })
            .collect()
    }

    fn sent_ids(manager: &ReplicationManager, arena: &FrameArena) -> Vec<u16> {
        let mut ids = Vec::new();
        for datagram in manager.datagrams() {
            let bytes = arena.block(datagram);
            let mut rest = &bytes[SNAPSHOT_PREFIX_SIZE..];
            while !rest.is_empty() {
                let (snapshot, used) = decode_snapshot(rest, Vec3::ZERO).unwrap();
                ids.push(snapshot.header.entity_id);
                rest = &rest[used..];
            }
        }
        ids
    }

    /// Registers, sends the first full sync, then forgets the event noise.
    fn primed(priorities: &[f32]) -> (ReplicationManager, FrameArena, Vec<Rc<RefCell<Transform>>>, Vec<EntityHandle>) {
        let mut manager = ReplicationManager::new(&config());
        let mut arena = FrameArena::new(64 * 1024);
        let entities: Vec<_> = (0..priorities.len()).map(|i| shared(i as f32)).collect();
        let handles = register_all(&mut manager, &entities, priorities);
        manager.prepare_flush(&mut arena, 100_000, &[], 0);
        manager.drain_events().for_each(drop);
        (manager, arena, entities, handles)
    }

    #[test]
    fn basic_flush_sends_top_two_and_accumulates_third() {
        let (mut manager, mut arena, entities, handles) = primed(&[3.0, 1.0, 1.0]);
        wiggle(&entities, 0.5);
        arena.reset();

        let budget = SNAPSHOT_DATAGRAM_OVERHEAD + 2 * STANDARD_POSE;
        let report = manager.prepare_flush(&mut arena, budget, &[], 50);

        assert_eq!(report.encoded, 2);
        assert!(report.wire_bytes <= budget);
        assert_eq!(sent_ids(&manager, &arena), vec![0, 1]);
        assert_eq!(manager.accumulator(handles[0]), Some(0.0));
        assert_eq!(manager.accumulator(handles[1]), Some(0.0));
        assert_eq!(manager.accumulator(handles[2]), Some(1.0));
    }

    #[test]
    fn starved_entity_eventually_sent() {
        let (mut manager, mut arena, entities, handles) = primed(&[3.0, 1.0, 1.0]);
        let budget = SNAPSHOT_DATAGRAM_OVERHEAD + 2 * STANDARD_POSE;

        wiggle(&entities, 0.5);
        arena.reset();
        manager.prepare_flush(&mut arena, budget, &[], 50);

        wiggle(&entities, 0.5);
        arena.reset();
        manager.prepare_flush(&mut arena, budget, &[], 100);

        // Accumulators were 3, 1, 2: the starved entity overtakes the tie.
        assert_eq!(sent_ids(&manager, &arena), vec![0, 2]);
        assert_eq!(manager.accumulator(handles[1]), Some(1.0));
    }

    #[test]
    fn unchanged_entities_are_not_candidates() {
        let (mut manager, mut arena, _entities, handles) = primed(&[1.0, 1.0]);
        arena.reset();

        let report = manager.prepare_flush(&mut arena, 4096, &[], 50);

        assert_eq!(report.candidates, 0);
        assert!(manager.datagrams().is_empty());
        assert_eq!(manager.accumulator(handles[0]), Some(0.0));
    }

    #[test]
    fn delta_carries_only_changed_fields() {
        let (mut manager, mut arena, entities, _) = primed(&[1.0]);
        entities[0].borrow_mut().velocity = Vec3::new(0.0, 0.0, 2.0);
        arena.reset();

        manager.prepare_flush(&mut arena, 4096, &[], 50);

        let bytes = arena.block(&manager.datagrams()[0]);
        let (snapshot, _) = decode_snapshot(&bytes[SNAPSHOT_PREFIX_SIZE..], Vec3::ZERO).unwrap();
        assert_eq!(snapshot.header.dirty, DirtyFields::VELOCITY);
        assert_eq!(snapshot.header.sequence, 1);
    }

    #[test]
    fn mark_mutated_forces_full_transform() {
        let (mut manager, mut arena, _entities, handles) = primed(&[1.0]);
        manager.mark_mutated(handles[0]).unwrap();
        arena.reset();

        manager.prepare_flush(&mut arena, 4096, &[], 50);

        let bytes = arena.block(&manager.datagrams()[0]);
        let (snapshot, _) = decode_snapshot(&bytes[SNAPSHOT_PREFIX_SIZE..], Vec3::ZERO).unwrap();
        assert_eq!(snapshot.header.dirty, DirtyFields::TRANSFORM);
    }

    #[test]
    fn heartbeat_resends_idle_entities() {
        let (mut manager, mut arena, _entities, _) = primed(&[1.0]);
        let every = config().full_sync_every();

        let mut resent = 0;
        for tick in 0..every {
            arena.reset();
            resent += manager.prepare_flush(&mut arena, 4096, &[], tick as u32).encoded;
        }
        assert_eq!(resent, 1);
    }

    #[test]
    fn arena_overflow_keeps_accumulators() {
        let (mut manager, _, entities, handles) = primed(&[1.0, 1.0, 1.0, 1.0]);
        wiggle(&entities, 1.0);

        // Room for the prefix and exactly one pose.
        let mut small = FrameArena::new(SNAPSHOT_PREFIX_SIZE + STANDARD_POSE);
        let report = manager.prepare_flush(&mut small, 4096, &[], 50);

        assert!(report.overflowed);
        assert_eq!(report.encoded, 1);
        assert_eq!(manager.overflow_count(), 1);
        assert_eq!(manager.accumulator(handles[0]), Some(0.0));
        for handle in &handles[1..] {
            assert_eq!(manager.accumulator(*handle), Some(1.0));
        }
    }

    #[test]
    fn default_weight_favours_entities_near_interest() {
        let (mut manager, mut arena, entities, handles) = primed(&[1.0, 1.0]);
        // Slot 0 would win a tie, so put it far away.
        let spots = [Vec3::new(1000.0, 0.0, 0.0), Vec3::ZERO];
        for (entity, spot) in entities.iter().zip(spots) {
            let mut transform = entity.borrow_mut();
            transform.position = spot;
            transform.rotation = glam::Quat::from_rotation_y(0.5);
        }
        arena.reset();

        let budget = SNAPSHOT_DATAGRAM_OVERHEAD + STANDARD_POSE;
        manager.prepare_flush(&mut arena, budget, &[Vec3::ZERO], 50);

        assert_eq!(sent_ids(&manager, &arena), vec![1]);
        assert!(manager.accumulator(handles[0]).unwrap() < 0.1);
    }

    #[test]
    fn profile_change_resends_full_transform() {
        let (mut manager, mut arena, _entities, handles) = primed(&[1.0]);
        manager.set_quant_profile(handles[0], QuantProfile::Standard).unwrap();
        arena.reset();
        assert_eq!(manager.prepare_flush(&mut arena, 4096, &[], 50).candidates, 0);

        manager.set_quant_profile(handles[0], QuantProfile::High).unwrap();
        arena.reset();
        manager.prepare_flush(&mut arena, 4096, &[], 100);

        let bytes = arena.block(&manager.datagrams()[0]);
        let (snapshot, _) = decode_snapshot(&bytes[SNAPSHOT_PREFIX_SIZE..], Vec3::ZERO).unwrap();
        assert_eq!(snapshot.header.dirty, DirtyFields::TRANSFORM);
        assert_eq!(QuantProfile::from_u8(snapshot.header.quant_profile), Some(QuantProfile::High));
    }

    #[test]
    fn lost_datagram_fields_are_sent_again() {
        let (mut manager, mut arena, entities, handles) = primed(&[1.0, 1.0]);
        wiggle(&entities[..1], 0.5);
        arena.reset();
        manager.prepare_flush(&mut arena, 4096, &[], 50);
        let lost = manager.datagram_ids()[0];

        arena.reset();
        assert_eq!(manager.prepare_flush(&mut arena, 4096, &[], 100).candidates, 0);

        assert_eq!(manager.requeue_lost(lost), 1);
        arena.reset();
        manager.prepare_flush(&mut arena, 4096, &[], 150);

        assert_eq!(sent_ids(&manager, &arena), vec![handles[0].id]);
        let bytes = arena.block(&manager.datagrams()[0]);
        let (snapshot, _) = decode_snapshot(&bytes[SNAPSHOT_PREFIX_SIZE..], Vec3::ZERO).unwrap();
        assert_eq!(snapshot.header.dirty, DirtyFields::POSITION | DirtyFields::ROTATION);

        arena.reset();
        assert_eq!(manager.prepare_flush(&mut arena, 4096, &[], 200).candidates, 0);
    }

    #[test]
    fn requeue_skips_unregistered_entities() {
        let (mut manager, mut arena, entities, handles) = primed(&[1.0]);
        wiggle(&entities, 0.5);
        arena.reset();
        manager.prepare_flush(&mut arena, 4096, &[], 50);
        let lost = manager.datagram_ids()[0];

        manager.unregister(handles[0]).unwrap();
        assert_eq!(manager.requeue_lost(lost), 0);
    }

    #[test]
    fn point_of_interest_scales_growth() {
        let (mut manager, mut arena, entities, handles) = primed(&[1.0, 1.0]);
        manager.set_priority_weight(Box::new(InverseDistanceWeight { falloff: 10.0 }));
        entities[0].borrow_mut().position = Vec3::ZERO;
        entities[1].borrow_mut().position = Vec3::new(1000.0, 0.0, 0.0);
        arena.reset();

        // Budget too small for anything so both keep their accumulators.
        manager.prepare_flush(&mut arena, SNAPSHOT_DATAGRAM_OVERHEAD, &[Vec3::ZERO], 50);

        let near = manager.accumulator(handles[0]).unwrap();
        let far = manager.accumulator(handles[1]).unwrap();
        assert!((near - 1.0).abs() < 1e-6);
        assert!((far - MIN_WEIGHT).abs() < 1e-6);
    }

    #[test]
    fn stale_handles_rejected() {
        let (mut manager, _, _, handles) = primed(&[1.0]);
        manager.unregister(handles[0]).unwrap();

        assert_eq!(
            manager.set_priority(handles[0], 2.0),
            Err(ReplicationError::StaleHandle(handles[0]))
        );
        assert_eq!(
            manager.unregister(handles[0]),
            Err(ReplicationError::StaleHandle(handles[0]))
        );

        let again = manager
            .register(Box::new(Transform::default()), QuantProfile::High, 1.0)
            .unwrap();
        assert_eq!(again.id, handles[0].id);
        assert_ne!(again.generation, handles[0].generation);
    }

    #[test]
    fn input_ack_requires_prediction() {
        let (mut manager, mut arena, _, handles) = primed(&[1.0]);
        assert_eq!(
            manager.acknowledge_input(handles[0], 4),
            Err(ReplicationError::PredictionDisabled(handles[0]))
        );

        manager.enable_prediction(handles[0], true).unwrap();
        manager.acknowledge_input(handles[0], 4).unwrap();
        arena.reset();
        manager.prepare_flush(&mut arena, 4096, &[], 50);

        let bytes = arena.block(&manager.datagrams()[0]);
        let (snapshot, _) = decode_snapshot(&bytes[SNAPSHOT_PREFIX_SIZE..], Vec3::ZERO).unwrap();
        assert_eq!(snapshot.input_ack, Some(4));
        assert!(!snapshot.header.dirty.intersects(DirtyFields::TRANSFORM));
    }

    #[test]
    fn owner_changes_emit_events() {
        let (mut manager, _, _, handles) = primed(&[1.0]);
        assert!(manager.set_owner(handles[0], Some(PeerId(3))).unwrap());
        assert!(!manager.set_owner(handles[0], Some(PeerId(3))).unwrap());

        let events: Vec<_> = manager.drain_events().collect();
        assert_eq!(
            events,
            vec![ReplicationEvent::OwnershipChanged {
                handle: handles[0],
                owner: Some(PeerId(3))
            }]
        );
        assert_eq!(manager.owned_by(PeerId(3)).collect::<Vec<_>>(), vec![handles[0]]);
    }

    #[test]
    fn sender_and_receiver_converge() {
        let (mut sender, mut arena, entities, handles) = primed(&[1.0, 1.0]);
        let mut receiver = ReplicationManager::new(&NetworkConfig::client());

        entities[1].borrow_mut().position = Vec3::new(4.0, 2.0, -1.0);
        sender.request_full_sync();
        arena.reset();
        sender.prepare_flush(&mut arena, 4096, &[], 1000);

        for datagram in sender.datagrams() {
            let report = receiver.receive_datagram(arena.block(datagram), 0.0);
            assert_eq!(report.rejected, 0);
        }

        let remote = receiver.remote(handles[1]).unwrap();
        assert!((remote.latest.position - Vec3::new(4.0, 2.0, -1.0)).length() < 0.02);
        assert_eq!(receiver.remotes().len(), 2);
    }

    #[test]
    fn unknown_profile_drops_rest_of_datagram() {
        let mut receiver = ReplicationManager::new(&NetworkConfig::client());
        let mut body = vec![0u8; SNAPSHOT_PREFIX_SIZE];
        let mut snapshot = [0u8; 12];
        SnapshotHeader {
            entity_id: 1,
            generation: 0,
            dirty: DirtyFields::POSITION,
            quant_profile: 9,
            sequence: 0,
        }
        .write(&mut snapshot);
        body.extend_from_slice(&snapshot);
        body.extend_from_slice(&snapshot);

        let report = receiver.receive_datagram(&body, 0.0);
        assert_eq!(report, ReceiveReport { applied: 0, rejected: 1 });
        assert!(receiver.remotes().is_empty());
    }
}
