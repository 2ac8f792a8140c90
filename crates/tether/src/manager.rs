use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use glam::Vec3;
use rustc_hash::FxHashMap;

use crate::arena::FrameArena;
use crate::config::{ConfigError, NetworkConfig, Role};
use crate::events::{DisconnectReason, NetworkEvent};
use crate::net::{
    CodecError, ConnectionFsm, ConnectionState, LinkAction, MAX_PACKET_SIZE, Message, MessageKind,
    NetworkStats, PACKET_HEADER_SIZE, PROTOCOL_VERSION, PacketCodec, PacketError, PacketFlags,
    PacketHeader, PacketValidator, Peer, PeerId, PeerStats, RpcFrame, SNAPSHOT_PREFIX_SIZE,
    ThroughputMeter, Transport, TransportError, effective_send_rate,
};
use crate::replication::{
    DatagramId, DatagramLimits, DirtyFields, EntityHandle, EntityRef, PriorityWeight, QuantProfile,
    ReplicationError, ReplicationManager, Sample, Transform, encoded_size,
};
use crate::rpc::{PendingRpc, Reliability, RpcDispatcher, RpcTarget};

const MAX_PENDING_EVENTS: usize = 4096;
const MAX_ACKS_PER_MESSAGE: usize = 128;
/// Room an RPC frame needs besides its subject and payload.
const RPC_FRAME_OVERHEAD: usize = 64;

pub type EventSubscriber = Box<dyn FnMut(&NetworkEvent)>;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error("operation needs the {0:?} role")]
    WrongRole(Role),
    #[error("link is {}", .0.as_str())]
    InvalidState(ConnectionState),
    #[error("not connected")]
    NotConnected,
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Socket plus the optional codec. Every outbound datagram goes through here.
struct Link<T> {
    transport: T,
    codec: Option<Box<dyn PacketCodec>>,
    /// Set on a client once the server assigned it an id.
    client_id: Option<PeerId>,
    packet: Vec<u8>,
}

impl<T: Transport> Link<T> {
    /// Both ends of a link name it by the client's id; handshakes by
    /// [`PeerId::UNASSIGNED`].
    fn codec_peer(&self, peer: PeerId, kind: MessageKind) -> PeerId {
        if kind.is_handshake() {
            PeerId::UNASSIGNED
        } else {
            self.client_id.unwrap_or(peer)
        }
    }

    fn send(
        &mut self,
        peer: PeerId,
        addr: SocketAddr,
        header: &PacketHeader,
        body: &[u8],
    ) -> Result<usize, ManagerError> {
        let mut header = *header;
        let peer = self.codec_peer(peer, header.kind);
        self.packet.clear();
        self.packet.resize(PACKET_HEADER_SIZE, 0);
        match &mut self.codec {
            Some(codec) => {
                header.flags |= PacketFlags::SEALED;
                codec.seal(peer, body, &mut self.packet)?;
            }
            None => self.packet.extend_from_slice(body),
        }
        header.write(&mut self.packet[..PACKET_HEADER_SIZE]);

        Ok(self.transport.send_to(&self.packet, addr)?)
    }
}

fn publish(
    subscribers: &mut [EventSubscriber],
    pending: &mut VecDeque<NetworkEvent>,
    event: NetworkEvent,
) {
    for subscriber in subscribers.iter_mut() {
        subscriber(&event);
    }
    if pending.len() == MAX_PENDING_EVENTS {
        pending.pop_front();
    }
    pending.push_back(event);
}

/// The one object a host talks to. It owns the transport, the link state
/// machine, the peers and the replication core, and does all of its work
/// inside [`NetworkManager::tick`] on the calling thread.
pub struct NetworkManager<T: Transport> {
    config: NetworkConfig,
    link: Link<T>,
    fsm: ConnectionFsm,
    validator: PacketValidator,
    peers: Vec<Option<Peer>>,
    addresses: FxHashMap<SocketAddr, PeerId>,
    pending_acks: Vec<Vec<u32>>,
    replication: ReplicationManager,
    dispatcher: RpcDispatcher,
    arena: FrameArena,
    pending_events: VecDeque<NetworkEvent>,
    subscribers: Vec<EventSubscriber>,
    stats: NetworkStats,
    sent_meter: ThroughputMeter,
    received_meter: ThroughputMeter,
    rng: fastrand::Rng,
    now: f64,
    send_timer: f64,
    burst_until: f64,
    send_rate: f32,
    local_id: PeerId,
    server_addr: Option<SocketAddr>,
    salt: u64,
    recv_buf: Box<[u8]>,
    opened: Vec<u8>,
    due: Vec<Message>,
    interest: Vec<Vec3>,
    doomed: Vec<(PeerId, DisconnectReason)>,
    lost_snapshots: Vec<DatagramId>,
}

impl<T: Transport> NetworkManager<T> {
    pub fn new(mut config: NetworkConfig, transport: T) -> Result<Self, ManagerError> {
        config.validate()?;

        // Slot 0 is the server itself on the server and the server peer on a client.
        let slots = match config.role {
            Role::Server => config.max_peers + 1,
            Role::Client => 1,
        };

        Ok(Self {
            link: Link {
                transport,
                codec: None,
                client_id: None,
                packet: Vec::with_capacity(MAX_PACKET_SIZE),
            },
            fsm: ConnectionFsm::new(config.connection.clone()),
            validator: PacketValidator::new(slots),
            peers: (0..slots).map(|_| None).collect(),
            addresses: FxHashMap::default(),
            pending_acks: vec![Vec::new(); slots],
            replication: ReplicationManager::new(&config),
            dispatcher: RpcDispatcher::new(),
            arena: FrameArena::new(config.arena_capacity),
            pending_events: VecDeque::new(),
            subscribers: Vec::new(),
            stats: NetworkStats::default(),
            sent_meter: ThroughputMeter::new(0.0),
            received_meter: ThroughputMeter::new(0.0),
            rng: fastrand::Rng::new(),
            now: 0.0,
            send_timer: 0.0,
            burst_until: 0.0,
            send_rate: config.send_rate as f32,
            local_id: match config.role {
                Role::Server => PeerId::SERVER,
                Role::Client => PeerId::UNASSIGNED,
            },
            server_addr: None,
            salt: 0,
            recv_buf: vec![0u8; MAX_PACKET_SIZE + 1].into_boxed_slice(),
            opened: Vec::with_capacity(MAX_PACKET_SIZE),
            due: Vec::new(),
            interest: Vec::with_capacity(slots),
            doomed: Vec::new(),
            lost_snapshots: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn state(&self) -> ConnectionState {
        self.fsm.state()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.transport.local_addr()
    }

    /// Id the server assigned to us; [`PeerId::SERVER`] on the server.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn transport(&self) -> &T {
        &self.link.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.link.transport
    }

    /// Installs the codec every datagram body goes through. Snapshot packing
    /// shrinks by the codec's overhead so sealed datagrams still fit.
    pub fn set_packet_codec(&mut self, codec: impl PacketCodec + 'static) -> Result<(), ManagerError> {
        let overhead = codec.overhead();
        let largest = encoded_size(QuantProfile::None, DirtyFields::all());
        if !DatagramLimits::with_codec_overhead(overhead).fits(SNAPSHOT_PREFIX_SIZE + largest) {
            return Err(ConfigError::CodecOverhead(overhead).into());
        }
        self.link.codec = Some(Box::new(codec));
        self.replication.set_codec_overhead(overhead);
        Ok(())
    }

    fn require_role(&self, role: Role) -> Result<(), ManagerError> {
        if self.config.role != role {
            return Err(ManagerError::WrongRole(role));
        }
        Ok(())
    }

    fn check_codec(&self) -> Result<(), ManagerError> {
        if self.config.encryption && self.link.codec.is_none() {
            return Err(ConfigError::MissingCodec.into());
        }
        Ok(())
    }

    // Link lifecycle.

    pub fn listen(&mut self) -> Result<(), ManagerError> {
        self.require_role(Role::Server)?;
        self.check_codec()?;
        if !self.fsm.listen() {
            return Err(ManagerError::InvalidState(self.fsm.state()));
        }
        log::info!("listening on {}", self.local_addr());
        self.forward_events();
        Ok(())
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), ManagerError> {
        self.require_role(Role::Client)?;
        self.check_codec()?;
        if !self.fsm.begin_connect() {
            return Err(ManagerError::InvalidState(self.fsm.state()));
        }

        self.server_addr = Some(addr);
        self.salt = self.rng.u64(..);
        log::info!("connecting to {}", addr);
        self.send_connect_request();
        self.forward_events();
        Ok(())
    }

    /// Tells every peer we are leaving and lingers briefly before closing.
    pub fn disconnect(&mut self) {
        let reason = match self.config.role {
            Role::Server => DisconnectReason::ServerShutdown,
            Role::Client => DisconnectReason::Graceful,
        };
        self.fsm.begin_disconnect();
        for index in 0..self.peers.len() {
            if self.peers[index].is_some() {
                self.drop_peer(PeerId(index as u16), reason, true);
            }
        }
        self.forward_events();
    }

    /// Stops a listening server. Peers are told [`DisconnectReason::ServerShutdown`]
    /// and the link lingers in Disconnecting until ticked closed.
    pub fn shutdown(&mut self) {
        self.disconnect();
    }

    pub fn kick(&mut self, peer: PeerId) -> Result<(), ManagerError> {
        self.require_role(Role::Server)?;
        if self.peer(peer).is_none() {
            return Err(ManagerError::UnknownPeer(peer));
        }
        self.drop_peer(peer, DisconnectReason::Kicked, true);
        self.forward_events();
        Ok(())
    }

    // Registration.

    pub fn register(
        &mut self,
        entity: impl EntityRef + 'static,
        profile: QuantProfile,
        base_priority: f32,
    ) -> Result<EntityHandle, ReplicationError> {
        if self.config.role != Role::Server {
            return Err(ReplicationError::NotAuthority);
        }
        let handle = self
            .replication
            .register(Box::new(entity), profile, base_priority)?;
        self.forward_events();
        Ok(handle)
    }

    pub fn unregister(&mut self, handle: EntityHandle) -> Result<(), ReplicationError> {
        self.replication.unregister(handle)?;
        self.broadcast_reliable(|sequence| Message::EntityRemoved {
            sequence,
            id: handle.id,
            generation: handle.generation,
        });
        self.forward_events();
        Ok(())
    }

    pub fn set_priority(&mut self, handle: EntityHandle, value: f32) -> Result<(), ReplicationError> {
        self.replication.set_priority(handle, value)
    }

    pub fn set_quant_profile(
        &mut self,
        handle: EntityHandle,
        profile: QuantProfile,
    ) -> Result<(), ReplicationError> {
        self.replication.set_quant_profile(handle, profile)
    }

    /// On the server this adds input acks to the entity's snapshots; on a
    /// client it starts predicting the remote entity locally.
    pub fn enable_prediction(&mut self, handle: EntityHandle, enabled: bool) -> Result<(), ReplicationError> {
        match self.config.role {
            Role::Server => self.replication.enable_prediction(handle, enabled),
            Role::Client => self.replication.enable_remote_prediction(handle, enabled),
        }
    }

    pub fn mark_mutated(&mut self, handle: EntityHandle) -> Result<(), ReplicationError> {
        self.replication.mark_mutated(handle)
    }

    pub fn set_owner(&mut self, handle: EntityHandle, owner: Option<PeerId>) -> Result<(), ReplicationError> {
        if self.config.role != Role::Server {
            return Err(ReplicationError::NotAuthority);
        }
        if self.replication.set_owner(handle, owner)? {
            self.broadcast_reliable(|sequence| Message::OwnerChanged {
                sequence,
                id: handle.id,
                generation: handle.generation,
                owner: owner.map(|peer| peer.0),
            });
        }
        self.forward_events();
        Ok(())
    }

    pub fn owner(&self, handle: EntityHandle) -> Option<PeerId> {
        match self.config.role {
            Role::Server => self.replication.owner(handle),
            Role::Client => self.replication.remote(handle).and_then(|remote| remote.owner),
        }
    }

    pub fn acknowledge_input(&mut self, handle: EntityHandle, sequence: u16) -> Result<(), ReplicationError> {
        self.replication.acknowledge_input(handle, sequence)
    }

    pub fn predict_input(&mut self, handle: EntityHandle, after: Transform) -> Result<u16, ReplicationError> {
        self.replication.predict_input(handle, after)
    }

    pub fn bind_remote(
        &mut self,
        handle: EntityHandle,
        entity: impl EntityRef + 'static,
    ) -> Result<(), ReplicationError> {
        self.replication.bind_remote(handle, Box::new(entity))
    }

    pub fn sample(&self, handle: EntityHandle) -> Option<Sample> {
        self.replication.sample(handle, self.now)
    }

    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    pub fn set_point_of_interest(&mut self, peer: PeerId, point: Option<Vec3>) -> Result<(), ManagerError> {
        let slot = self
            .peers
            .get_mut(peer.index())
            .and_then(Option::as_mut)
            .ok_or(ManagerError::UnknownPeer(peer))?;
        slot.point_of_interest = point;
        Ok(())
    }

    pub fn set_priority_weight(&mut self, weight: impl PriorityWeight + 'static) {
        self.replication.set_priority_weight(Box::new(weight));
    }

    // RPC and events.

    pub fn register_rpc_handler(
        &mut self,
        subject: impl Into<String>,
        handler: impl FnMut(&PendingRpc) + 'static,
    ) {
        self.dispatcher.register(subject, Box::new(handler));
    }

    /// Lock held while RPC handlers run; share it with whatever they touch.
    pub fn rpc_lock(&self) -> Arc<Mutex<()>> {
        self.dispatcher.lock_handle()
    }

    pub fn send_rpc(
        &mut self,
        subject: &str,
        payload: &[u8],
        target: RpcTarget,
        reliability: Reliability,
    ) -> Result<(), ManagerError> {
        let room = MAX_PACKET_SIZE - self.replication.datagram_limits().framing;
        if subject.len() + payload.len() + RPC_FRAME_OVERHEAD > room {
            return Err(PacketError::TooLarge {
                len: subject.len() + payload.len(),
            }
            .into());
        }

        let rpc = PendingRpc {
            subject: subject.to_owned(),
            payload: payload.to_vec(),
            target,
            reliability,
            sender: self.local_id,
        };

        match self.config.role {
            Role::Client => {
                if self.fsm.state() != ConnectionState::Connected || self.peers[0].is_none() {
                    return Err(ManagerError::NotConnected);
                }
                self.send_rpc_to(PeerId::SERVER, &rpc);
            }
            Role::Server => self.route_rpc(rpc, PeerId::SERVER),
        }
        Ok(())
    }

    pub fn subscribe(&mut self, subscriber: impl FnMut(&NetworkEvent) + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = NetworkEvent> + '_ {
        self.pending_events.drain(..)
    }

    // Peers and stats.

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id.index()).and_then(Option::as_ref)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().flatten()
    }

    pub fn connected_peers(&self) -> usize {
        self.peers().filter(|peer| peer.is_connected()).count()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn effective_send_rate(&self) -> f32 {
        self.send_rate
    }

    // The tick.

    pub fn tick(&mut self, dt: f32) {
        self.now += dt as f64;
        self.arena.reset();

        self.update_link(dt);
        self.poll();

        let dispatched = self.dispatcher.dispatch();
        if dispatched > 0 {
            log::trace!("dispatched {} rpcs", dispatched);
        }

        self.replication.render(self.now, dt);

        if self.fsm.state() == ConnectionState::Connected {
            self.send_timer += dt as f64;
            let interval = 1.0 / self.send_rate.max(1.0) as f64;
            if self.send_timer >= interval {
                // Never bank more than one interval after a long frame.
                self.send_timer = (self.send_timer - interval).min(interval);
                self.update_send_rate();
                if self.config.role == Role::Server {
                    self.flush_snapshots();
                }
            }

            self.flush_reliable();
            self.send_keep_alives();
            self.check_health();
        }

        self.forward_events();
        self.update_stats();
    }

    fn update_link(&mut self, dt: f32) {
        match self.fsm.update(dt) {
            Some(LinkAction::SendConnectRequest { attempt }) => {
                log::debug!("connect attempt {}", attempt);
                self.send_connect_request();
            }
            Some(LinkAction::RetriesExhausted) => {
                self.server_addr = None;
                publish(
                    &mut self.subscribers,
                    &mut self.pending_events,
                    NetworkEvent::ConnectionFailed {
                        reason: "no response from server".to_owned(),
                    },
                );
            }
            Some(LinkAction::TimedOut) => {
                if self.peers[0].is_some() && self.config.role == Role::Client {
                    self.drop_peer(PeerId::SERVER, DisconnectReason::Timeout, false);
                }
            }
            Some(LinkAction::Closed) => log::info!("link closed"),
            None => {}
        }
    }

    fn poll(&mut self) {
        let budget = if self.now < self.burst_until {
            self.config.burst_budget
        } else {
            self.config.event_budget
        };

        let mut buf = std::mem::take(&mut self.recv_buf);
        for _ in 0..budget {
            match self.link.transport.poll_recv(&mut buf) {
                Ok(Some((len, from))) => {
                    self.stats.record_received(len);
                    self.handle_datagram(&buf[..len], from);
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("receive failed: {}", err);
                    break;
                }
            }
        }
        self.recv_buf = buf;
    }

    fn handle_datagram(&mut self, packet: &[u8], from: SocketAddr) {
        let known = self.addresses.get(&from).copied();
        let Ok(header) = PacketHeader::read(packet) else {
            self.validator.validate(known.unwrap_or(PeerId::UNASSIGNED), packet);
            return;
        };

        let gate = if header.kind.is_handshake() {
            PeerId::UNASSIGNED
        } else {
            known.unwrap_or(PeerId::UNASSIGNED)
        };
        if !self.validator.validate(gate, packet) {
            return;
        }

        let sealed = header.flags.contains(PacketFlags::SEALED);
        let body = &packet[PACKET_HEADER_SIZE..];
        let codec_peer = self.link.codec_peer(gate, header.kind);
        let mut opened = std::mem::take(&mut self.opened);
        opened.clear();

        let body = match (&mut self.link.codec, sealed) {
            (Some(codec), true) => {
                if let Err(err) = codec.open(codec_peer, body, &mut opened) {
                    log::trace!("dropping datagram from {}: {}", from, err);
                    self.opened = opened;
                    return;
                }
                &opened[..]
            }
            (None, false) => body,
            _ => {
                log::trace!("dropping datagram from {}: codec mismatch", from);
                self.opened = opened;
                return;
            }
        };

        if let Some(id) = known.filter(|_| !header.kind.is_handshake()) {
            if let Some(peer) = self.peers.get_mut(id.index()).and_then(Option::as_mut) {
                peer.on_receive(&header, packet.len(), self.now);
                peer.take_lost_snapshots(&mut self.lost_snapshots);
            }
            self.fsm.touch();
            self.requeue_lost_snapshots(id);
        }

        self.route(&header, known, from, body, packet.len());
        self.opened = opened;
    }

    fn requeue_lost_snapshots(&mut self, peer: PeerId) {
        if self.lost_snapshots.is_empty() {
            return;
        }
        let mut requeued = 0;
        for id in self.lost_snapshots.drain(..) {
            requeued += self.replication.requeue_lost(id);
        }
        if requeued > 0 {
            log::trace!("{} lost snapshots to {}, resending", requeued, peer);
        }
    }

    fn route(&mut self, header: &PacketHeader, known: Option<PeerId>, from: SocketAddr, body: &[u8], len: usize) {
        if header.kind == MessageKind::Snapshot {
            if self.config.role == Role::Client && known.is_some() {
                self.replication.receive_datagram(body, self.now);
            }
            return;
        }

        let message = match Message::decode(body) {
            Ok(message) if message.kind() == header.kind => message,
            Ok(message) => {
                log::trace!("dropping {:?} framed as {:?}", message.kind(), header.kind);
                return;
            }
            Err(err) => {
                log::trace!("dropping undecodable {:?} from {}: {}", header.kind, from, err);
                return;
            }
        };

        match (message, known) {
            (Message::ConnectRequest { protocol, salt }, _) => self.on_connect_request(from, protocol, salt),
            (Message::ConnectAccepted { peer_id, salt, .. }, _) => {
                self.on_connect_accepted(from, header, len, peer_id, salt)
            }
            (Message::ConnectDenied { reason }, _) => self.on_connect_denied(from, reason),
            (_, None) => {}
            (Message::Disconnect { reason }, Some(id)) => {
                self.drop_peer(id, DisconnectReason::from_u8(reason), false);
            }
            (Message::KeepAlive, Some(_)) => {}
            (Message::Ack { sequences }, Some(id)) => {
                if let Some(peer) = self.peers.get_mut(id.index()).and_then(Option::as_mut) {
                    peer.reliable.ack(&sequences);
                }
            }
            (Message::Rpc(frame), Some(id)) => self.on_rpc(id, frame),
            (Message::EntityRemoved { sequence, id, generation }, Some(peer)) => {
                if self.accept_reliable(peer, sequence) && self.config.role == Role::Client {
                    self.replication
                        .remove_remote(EntityHandle::new(id, generation));
                }
            }
            (
                Message::OwnerChanged {
                    sequence,
                    id,
                    generation,
                    owner,
                },
                Some(peer),
            ) => {
                if self.accept_reliable(peer, sequence) && self.config.role == Role::Client {
                    self.replication
                        .set_remote_owner(EntityHandle::new(id, generation), owner.map(PeerId));
                }
            }
        }
    }

    /// Queues the ack and reports whether this is the first delivery.
    fn accept_reliable(&mut self, peer: PeerId, sequence: u32) -> bool {
        let Some(slot) = self.peers.get_mut(peer.index()).and_then(Option::as_mut) else {
            return false;
        };
        if let Some(acks) = self.pending_acks.get_mut(peer.index()) {
            acks.push(sequence);
        }
        slot.received.accept(sequence)
    }

    // Handshake.

    fn send_connect_request(&mut self) {
        let Some(addr) = self.server_addr else {
            return;
        };
        let message = Message::ConnectRequest {
            protocol: PROTOCOL_VERSION,
            salt: self.salt,
        };
        if let Err(err) = self.send_unsequenced(addr, &message) {
            log::warn!("connect request to {} failed: {}", addr, err);
        }
    }

    fn on_connect_request(&mut self, from: SocketAddr, protocol: u32, salt: u64) {
        if self.config.role != Role::Server || self.fsm.state() != ConnectionState::Connected {
            return;
        }

        if let Some(&id) = self.addresses.get(&from) {
            // Our accept was lost; say it again.
            if self.peer(id).is_some_and(|peer| peer.salt == salt) {
                self.send_accept(id);
            }
            return;
        }

        if protocol != PROTOCOL_VERSION {
            self.deny(from, format!("protocol mismatch: {} != {}", protocol, PROTOCOL_VERSION));
            return;
        }

        let Some(index) = (1..self.peers.len()).find(|&index| self.peers[index].is_none()) else {
            self.deny(from, "server full".to_owned());
            return;
        };

        let id = PeerId(index as u16);
        self.peers[index] = Some(Peer::new(id, from, salt, self.now));
        self.addresses.insert(from, id);
        self.pending_acks[index].clear();
        self.validator.reset_peer(id);
        self.burst_until = self.now + self.config.burst_window_secs as f64;
        self.replication.request_full_sync();

        self.send_accept(id);
        let owned: Vec<(EntityHandle, PeerId)> = self
            .replication
            .handles()
            .filter_map(|handle| self.replication.owner(handle).map(|owner| (handle, owner)))
            .collect();
        for (handle, owner) in owned {
            if let Some(peer) = self.peers[index].as_mut() {
                peer.reliable.push_with(|sequence| Message::OwnerChanged {
                    sequence,
                    id: handle.id,
                    generation: handle.generation,
                    owner: Some(owner.0),
                });
            }
        }

        log::info!("{} connected from {}", id, from);
        publish(
            &mut self.subscribers,
            &mut self.pending_events,
            NetworkEvent::PeerConnected { peer: id, addr: from },
        );
    }

    fn send_accept(&mut self, id: PeerId) {
        let Some(salt) = self.peer(id).map(|peer| peer.salt) else {
            return;
        };
        let message = Message::ConnectAccepted {
            peer_id: id.0,
            salt,
            server_time_ms: (self.now * 1000.0) as u32,
        };
        if let Err(err) = self.send_message(id, &message) {
            log::warn!("accept to {} failed: {}", id, err);
        }
    }

    fn deny(&mut self, addr: SocketAddr, reason: String) {
        log::info!("denied {}: {}", addr, reason);
        let message = Message::ConnectDenied {
            reason: reason.clone(),
        };
        if let Err(err) = self.send_unsequenced(addr, &message) {
            log::debug!("deny to {} failed: {}", addr, err);
        }
        publish(
            &mut self.subscribers,
            &mut self.pending_events,
            NetworkEvent::ConnectionDenied { addr, reason },
        );
    }

    fn on_connect_accepted(&mut self, from: SocketAddr, header: &PacketHeader, len: usize, peer_id: u16, salt: u64) {
        if self.config.role != Role::Client
            || self.fsm.state() != ConnectionState::Connecting
            || self.server_addr != Some(from)
            || salt != self.salt
        {
            return;
        }

        self.fsm.accepted();
        self.local_id = PeerId(peer_id);
        self.link.client_id = Some(self.local_id);

        let mut server = Peer::new(PeerId::SERVER, from, salt, self.now);
        server.on_receive(header, len, self.now);
        self.peers[0] = Some(server);
        self.addresses.insert(from, PeerId::SERVER);
        self.pending_acks[0].clear();
        self.validator.reset_peer(PeerId::SERVER);
        self.burst_until = self.now + self.config.burst_window_secs as f64;

        log::info!("connected to {} as {}", from, self.local_id);
        publish(
            &mut self.subscribers,
            &mut self.pending_events,
            NetworkEvent::PeerConnected {
                peer: PeerId::SERVER,
                addr: from,
            },
        );
    }

    fn on_connect_denied(&mut self, from: SocketAddr, reason: String) {
        if self.config.role != Role::Client
            || self.fsm.state() != ConnectionState::Connecting
            || self.server_addr != Some(from)
        {
            return;
        }
        log::warn!("connection denied by {}: {}", from, reason);
        self.fsm.force_disconnect();
        self.server_addr = None;
        publish(
            &mut self.subscribers,
            &mut self.pending_events,
            NetworkEvent::ConnectionFailed { reason },
        );
    }

    fn drop_peer(&mut self, id: PeerId, reason: DisconnectReason, notify: bool) {
        let Some(mut peer) = self.peers.get_mut(id.index()).and_then(Option::take) else {
            return;
        };

        if notify {
            let message = Message::Disconnect { reason: reason as u8 };
            let sent = message.encode().map_err(ManagerError::from).and_then(|body| {
                let header = peer.next_header(MessageKind::Disconnect, self.now);
                self.link.send(id, peer.addr, &header, &body)
            });
            if let Err(err) = sent {
                log::debug!("disconnect notice to {} failed: {}", id, err);
            }
        }

        self.addresses.remove(&peer.addr);
        self.validator.reset_peer(id);
        if let Some(acks) = self.pending_acks.get_mut(id.index()) {
            acks.clear();
        }

        match reason {
            DisconnectReason::Graceful | DisconnectReason::Kicked | DisconnectReason::ServerShutdown => {
                log::info!("{} disconnected: {}", id, reason)
            }
            _ => log::warn!("{} disconnected: {}", id, reason),
        }

        match self.config.role {
            Role::Server => {
                let owned: Vec<EntityHandle> = self.replication.owned_by(id).collect();
                for handle in owned {
                    if self.replication.set_owner(handle, None).unwrap_or(false) {
                        self.broadcast_reliable(|sequence| Message::OwnerChanged {
                            sequence,
                            id: handle.id,
                            generation: handle.generation,
                            owner: None,
                        });
                    }
                }
            }
            Role::Client => {
                if matches!(
                    self.fsm.state(),
                    ConnectionState::Connected | ConnectionState::Connecting
                ) {
                    self.fsm.force_disconnect();
                }
                self.server_addr = None;
                self.link.client_id = None;
                self.local_id = PeerId::UNASSIGNED;
                self.replication.clear_remotes();
            }
        }

        publish(
            &mut self.subscribers,
            &mut self.pending_events,
            NetworkEvent::PeerDisconnected { peer: id, reason },
        );
    }

    // Sending.

    fn send_unsequenced(&mut self, addr: SocketAddr, message: &Message) -> Result<(), ManagerError> {
        let body = message.encode()?;
        let header = PacketHeader::new(message.kind(), 0, 0, 0);
        let sent = self.link.send(PeerId::UNASSIGNED, addr, &header, &body)?;
        self.stats.record_sent(sent);
        Ok(())
    }

    fn send_message(&mut self, id: PeerId, message: &Message) -> Result<(), ManagerError> {
        let body = message.encode()?;
        let peer = self
            .peers
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(ManagerError::UnknownPeer(id))?;
        let header = peer.next_header(message.kind(), self.now);
        let sent = self.link.send(id, peer.addr, &header, &body)?;
        peer.bytes_sent += sent as u64;
        self.stats.record_sent(sent);
        Ok(())
    }

    fn broadcast_reliable(&mut self, build: impl Fn(u32) -> Message) {
        for peer in self.peers.iter_mut().flatten() {
            if peer.is_connected() {
                peer.reliable.push_with(&build);
            }
        }
    }

    fn send_rpc_to(&mut self, id: PeerId, rpc: &PendingRpc) {
        let frame = |sequence: u32| RpcFrame {
            sequence,
            reliable: rpc.reliability.is_reliable(),
            sender: rpc.sender.0,
            target: rpc.target.to_wire(),
            subject: rpc.subject.clone(),
            payload: rpc.payload.clone(),
        };

        if rpc.reliability.is_reliable() {
            if let Some(peer) = self.peers.get_mut(id.index()).and_then(Option::as_mut) {
                peer.reliable.push_with(|sequence| Message::Rpc(frame(sequence)));
            }
        } else if let Err(err) = self.send_message(id, &Message::Rpc(frame(0))) {
            log::debug!("unreliable rpc to {} failed: {}", id, err);
        }
    }

    fn deliver_locally(&mut self, rpc: PendingRpc) {
        publish(
            &mut self.subscribers,
            &mut self.pending_events,
            NetworkEvent::RpcReceived {
                subject: rpc.subject.clone(),
                sender: rpc.sender,
            },
        );
        self.dispatcher.enqueue(rpc);
    }

    /// Server side: resolves an RPC's target against the ownership table.
    /// `from` is the peer it arrived from and never gets it echoed back.
    fn route_rpc(&mut self, rpc: PendingRpc, from: PeerId) {
        let relay_to_all_except = |this: &mut Self, skip: Option<PeerId>| {
            for index in 1..this.peers.len() {
                let id = PeerId(index as u16);
                let connected = this.peers[index].as_ref().is_some_and(Peer::is_connected);
                if connected && id != from && Some(id) != skip {
                    this.send_rpc_to(id, &rpc);
                }
            }
        };

        match rpc.target {
            RpcTarget::Server => self.deliver_locally(rpc),
            RpcTarget::All => {
                relay_to_all_except(self, None);
                self.deliver_locally(rpc);
            }
            RpcTarget::Owner(handle) => match self.replication.owner(handle) {
                Some(owner) if owner != PeerId::SERVER && self.peer(owner).is_some() => {
                    if owner != from {
                        self.send_rpc_to(owner, &rpc);
                    }
                }
                _ => self.deliver_locally(rpc),
            },
            RpcTarget::AllExceptOwner(handle) => {
                let owner = self.replication.owner(handle);
                relay_to_all_except(self, owner);
                if owner != Some(PeerId::SERVER) {
                    self.deliver_locally(rpc);
                }
            }
        }
    }

    fn on_rpc(&mut self, from: PeerId, frame: RpcFrame) {
        if frame.reliable && !self.accept_reliable(from, frame.sequence) {
            return;
        }

        let rpc = PendingRpc {
            subject: frame.subject,
            payload: frame.payload,
            target: RpcTarget::from_wire(frame.target),
            reliability: if frame.reliable {
                Reliability::Reliable
            } else {
                Reliability::Unreliable
            },
            // A client cannot speak for anyone else; relayed frames keep their origin.
            sender: match self.config.role {
                Role::Server => from,
                Role::Client => PeerId(frame.sender),
            },
        };

        match self.config.role {
            Role::Server => self.route_rpc(rpc, from),
            Role::Client => self.deliver_locally(rpc),
        }
    }

    fn flush_snapshots(&mut self) {
        self.interest.clear();
        let mut targets = 0;
        for peer in self.peers.iter().flatten().filter(|peer| peer.is_connected()) {
            targets += 1;
            if let Some(point) = peer.point_of_interest {
                self.interest.push(point);
            }
        }
        if targets == 0 {
            return;
        }

        let server_time_ms = (self.now * 1000.0) as u32;
        let report = self.replication.prepare_flush(
            &mut self.arena,
            self.config.bandwidth_budget,
            &self.interest,
            server_time_ms,
        );
        if report.encoded > 0 {
            log::trace!(
                "flushed {}/{} snapshots in {} bytes",
                report.encoded,
                report.candidates,
                report.wire_bytes
            );
        }

        let datagrams = self.replication.datagrams();
        for (block, &id) in datagrams.iter().zip(self.replication.datagram_ids()) {
            let body = self.arena.block(block);
            for peer in self.peers.iter_mut().flatten() {
                if !peer.is_connected() {
                    continue;
                }
                let header = peer.next_header(MessageKind::Snapshot, self.now);
                // A send that fails shows up as a gap in the peer's acks.
                peer.track_snapshot(header.sequence, id);
                match self.link.send(peer.id, peer.addr, &header, body) {
                    Ok(sent) => {
                        peer.bytes_sent += sent as u64;
                        self.stats.record_sent(sent);
                    }
                    Err(err) => log::debug!("snapshot to {} failed: {}", peer.id, err),
                }
            }
        }
    }

    fn flush_reliable(&mut self) {
        let resend = self.config.reliable_resend_secs as f64;
        let mut due = std::mem::take(&mut self.due);

        for index in 0..self.peers.len() {
            let Some(peer) = self.peers[index].as_mut() else {
                continue;
            };
            due.clear();
            peer.reliable.collect_due(self.now, resend, &mut due);

            let acks = &mut self.pending_acks[index];
            while !acks.is_empty() {
                let take = acks.len().min(MAX_ACKS_PER_MESSAGE);
                due.push(Message::Ack {
                    sequences: acks.drain(..take).collect(),
                });
            }

            let id = PeerId(index as u16);
            for message in due.drain(..) {
                if let Err(err) = self.send_message(id, &message) {
                    log::debug!("send to {} failed: {}", id, err);
                }
            }
        }

        self.due = due;
    }

    fn send_keep_alives(&mut self) {
        let interval = self.config.keep_alive_interval_secs as f64;
        for index in 0..self.peers.len() {
            let idle = self.peers[index]
                .as_ref()
                .is_some_and(|peer| self.now - peer.last_send_time >= interval);
            if idle {
                let id = PeerId(index as u16);
                if let Err(err) = self.send_message(id, &Message::KeepAlive) {
                    log::debug!("keep-alive to {} failed: {}", id, err);
                }
            }
        }
    }

    fn check_health(&mut self) {
        self.doomed.clear();
        for peer in self.peers.iter().flatten() {
            if let Some(reason) = peer.health(self.now).check(&self.config.health) {
                self.doomed.push((peer.id, reason));
            }
        }

        let mut doomed = std::mem::take(&mut self.doomed);
        for (id, reason) in doomed.drain(..) {
            self.drop_peer(id, reason, true);
        }
        self.doomed = doomed;
    }

    fn update_send_rate(&mut self) {
        let (loss, rtt) = self
            .peers
            .iter()
            .flatten()
            .map(|peer| (peer.ack_tracker.loss(), peer.ack_tracker.srtt()))
            .fold((0.0f32, 0.0f32), |(loss, rtt), (l, r)| (loss.max(l), rtt.max(r)));

        let rate = effective_send_rate(self.config.send_rate as f32, loss, rtt, &self.config.adaptive);
        if rate != self.send_rate {
            log::debug!("send rate {:.1} -> {:.1} Hz", self.send_rate, rate);
            self.send_rate = rate;
        }
    }

    fn forward_events(&mut self) {
        for (from, to) in self.fsm.drain_transitions() {
            publish(
                &mut self.subscribers,
                &mut self.pending_events,
                NetworkEvent::ConnectionStateChanged { from, to },
            );
        }
        for event in self.replication.drain_events() {
            publish(
                &mut self.subscribers,
                &mut self.pending_events,
                NetworkEvent::Replication(event),
            );
        }
    }

    fn update_stats(&mut self) {
        let stats = &mut self.stats;
        stats.peers.clear();
        stats.packet_loss = 0.0;
        stats.jitter_ms = 0.0;
        stats.max_queue_depth = 0;

        for peer in self.peers.iter().flatten() {
            let entry = PeerStats {
                peer: Some(peer.id),
                rtt_ms: peer.ack_tracker.srtt(),
                jitter_ms: peer.ack_tracker.rtt_var(),
                loss: peer.ack_tracker.loss(),
                queue_depth: peer.reliable.len(),
                bytes_sent: peer.bytes_sent,
                bytes_received: peer.bytes_received,
            };
            stats.packet_loss = stats.packet_loss.max(entry.loss);
            stats.jitter_ms = stats.jitter_ms.max(entry.jitter_ms);
            stats.max_queue_depth = stats.max_queue_depth.max(entry.queue_depth);
            stats.peers.push(entry);
        }

        stats.connected_peers = stats.peers.len();
        stats.bytes_sent_per_sec = self.sent_meter.update(stats.bytes_sent, self.now);
        stats.bytes_received_per_sec = self.received_meter.update(stats.bytes_received, self.now);
        stats.snapshots_sent = self.replication.snapshots_encoded();
        stats.snapshots_received = self.replication.snapshots_applied();
        stats.snapshots_rejected = self.replication.snapshots_rejected();
        stats.arena_overflows = self.replication.overflow_count();
        stats.arena_high_water = self.arena.high_water();
        stats.effective_send_rate = self.send_rate;
        stats.validator_rejections = self.validator.counters().rejected();
        stats.rpcs_dispatched = self.dispatcher.dispatched();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{MemoryNetwork, MemoryTransport};

    const DT: f32 = 1.0 / 60.0;

    fn server(network: &MemoryNetwork) -> NetworkManager<MemoryTransport> {
        let mut server = NetworkManager::new(NetworkConfig::server(), network.endpoint()).unwrap();
        server.listen().unwrap();
        server
    }

    fn client(network: &MemoryNetwork, server: SocketAddr) -> NetworkManager<MemoryTransport> {
        let mut client = NetworkManager::new(NetworkConfig::client(), network.endpoint()).unwrap();
        client.connect(server).unwrap();
        client
    }

    fn pump(server: &mut NetworkManager<MemoryTransport>, clients: &mut [NetworkManager<MemoryTransport>], ticks: usize) {
        for _ in 0..ticks {
            server.tick(DT);
            for client in clients.iter_mut() {
                client.tick(DT);
            }
        }
    }

    #[test]
    fn encryption_without_codec_refuses_to_listen() {
        let network = MemoryNetwork::new();
        let config = NetworkConfig {
            encryption: true,
            ..NetworkConfig::server()
        };
        let mut server = NetworkManager::new(config, network.endpoint()).unwrap();
        assert!(matches!(
            server.listen(),
            Err(ManagerError::Config(ConfigError::MissingCodec))
        ));
    }

    #[test]
    fn roles_are_enforced() {
        let network = MemoryNetwork::new();
        let mut client = NetworkManager::new(NetworkConfig::client(), network.endpoint()).unwrap();
        assert!(matches!(client.listen(), Err(ManagerError::WrongRole(Role::Server))));
        assert_eq!(
            client
                .register(Transform::default(), QuantProfile::Standard, 1.0)
                .unwrap_err(),
            ReplicationError::NotAuthority
        );
    }

    #[test]
    fn handshake_assigns_ids() {
        let network = MemoryNetwork::new();
        let mut server = server(&network);
        let mut clients = vec![client(&network, server.local_addr()), client(&network, server.local_addr())];

        pump(&mut server, &mut clients, 3);

        assert_eq!(server.connected_peers(), 2);
        assert_eq!(clients[0].state(), ConnectionState::Connected);
        assert_eq!(clients[0].local_id(), PeerId(1));
        assert_eq!(clients[1].local_id(), PeerId(2));

        let connected = server
            .drain_events()
            .filter(|event| matches!(event, NetworkEvent::PeerConnected { .. }))
            .count();
        assert_eq!(connected, 2);
    }

    #[test]
    fn full_server_denies() {
        let network = MemoryNetwork::new();
        let config = NetworkConfig {
            max_peers: 1,
            ..NetworkConfig::server()
        };
        let mut server = NetworkManager::new(config, network.endpoint()).unwrap();
        server.listen().unwrap();
        let mut clients = vec![client(&network, server.local_addr())];
        pump(&mut server, &mut clients, 2);

        clients.push(client(&network, server.local_addr()));
        pump(&mut server, &mut clients, 3);

        assert_eq!(clients[1].state(), ConnectionState::Disconnected);
        assert!(clients[1].drain_events().any(|event| matches!(
            event,
            NetworkEvent::ConnectionFailed { reason } if reason == "server full"
        )));
    }

    #[test]
    fn kick_notifies_client() {
        let network = MemoryNetwork::new();
        let mut server = server(&network);
        let mut clients = vec![client(&network, server.local_addr())];
        pump(&mut server, &mut clients, 3);

        server.kick(PeerId(1)).unwrap();
        pump(&mut server, &mut clients, 2);

        assert_eq!(server.connected_peers(), 0);
        assert_eq!(clients[0].state(), ConnectionState::Disconnected);
        assert!(clients[0].drain_events().any(|event| event
            == NetworkEvent::PeerDisconnected {
                peer: PeerId::SERVER,
                reason: DisconnectReason::Kicked,
            }));
    }

    #[test]
    fn subscribers_see_every_event() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let network = MemoryNetwork::new();
        let mut server = server(&network);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        server.subscribe(move |event| sink.borrow_mut().push(event.clone()));

        let handle = server
            .register(Transform::default(), QuantProfile::Standard, 1.0)
            .unwrap();

        assert_eq!(
            seen.borrow().last(),
            Some(&NetworkEvent::Replication(crate::events::ReplicationEvent::Started { handle }))
        );
    }
}
