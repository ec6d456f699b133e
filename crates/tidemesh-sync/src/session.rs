//! One client's synchronization state behind a single event queue.
//!
//! [`ClientSession`] owns every protocol component and is driven by
//! [`SessionInput`]s: signaling events, peer-link events, timer ticks and
//! user actions. Everything it wants the UI to know comes out as
//! [`SessionEvent`]s via [`ClientSession::drain_events`]. It does no I/O of
//! its own; messages leave through the [`SignalSink`] and [`PeerTransport`]
//! it was built with.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use tidemesh_config::Config;
use tidemesh_net::{
    DenyReason, EntityId, EntitySnapshot, GameEvent, JoinRegion, LinkEvent, Nonce, PeerId,
    PeerMessage, PeerTransport, Pose, PoseSync, RegionId, SignalMessage, SignalSink, SlotName,
    SlotOccupied, SlotVacated, SubjectId, SyncSnapshot,
};

use crate::claim::{ClaimCoordinator, ClaimError, ClaimOptions, ClaimOutcome, ClaimResolution};
use crate::control::{ControlBindings, ControlError, EntityControlState, EntityControlStateMachine};
use crate::entity::{ControllableEntity, EntityRegistry};
use crate::mesh::{MeshEvent, MeshOptions, PeerMeshManager};
use crate::region::{ProximityUpdate, RegionMembership};
use crate::remote_pose::RemotePoses;
use crate::roster::{CrewRoster, Occupant};

// ---------------------------------------------------------------------------
// Options, inputs, events
// ---------------------------------------------------------------------------

/// Tunables for every component of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Edge length of a square region in world units.
    pub region_size: f32,
    /// Minimum spacing of periodic pose broadcasts.
    pub pose_broadcast_interval: Duration,
    /// How far behind the newest remote sample observers render.
    pub interpolation_delay: Duration,
    /// Peer mesh options.
    pub mesh: MeshOptions,
    /// Claim protocol options.
    pub claims: ClaimOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            region_size: config.identity.region_size,
            pose_broadcast_interval: config.control.pose_broadcast_interval(),
            interpolation_delay: config.control.interpolation_delay(),
            mesh: MeshOptions::from(&config.mesh),
            claims: ClaimOptions::from(&config.claims),
        }
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone)]
pub enum SessionInput {
    /// The signaling channel opened (first time or after a reconnect).
    SignalConnected,
    /// The signaling channel dropped; it will retry.
    SignalDisconnected,
    /// The signaling channel gave up.
    SignalTerminated,
    /// A message from the relay.
    Signal(SignalMessage),
    /// A peer-link event.
    Link(LinkEvent),
    /// Periodic timer.
    Tick,
    /// User wants to occupy a slot.
    Claim {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
    },
    /// User leaves a slot.
    Release {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
    },
    /// User abandons a pending claim.
    Cancel {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
    },
    /// User moves to another seat of the entity they occupy.
    Transfer {
        /// Entity.
        entity: EntityId,
        /// Target slot.
        to: SlotName,
    },
    /// The local avatar moved.
    MoveLocal(Pose),
    /// The local driver moved an entity.
    UpdateEntityPose {
        /// Entity.
        entity: EntityId,
        /// New pose.
        pose: Pose,
    },
    /// Something happened to a driven entity that peers must see now.
    DiscreteEvent(EntityId),
    /// An entity entered the known world.
    SpawnEntity(ControllableEntity),
    /// An entity left the known world.
    DespawnEntity(EntityId),
    /// Gameplay event for every linked peer.
    SendGameEvent(GameEvent),
}

/// Why a claim did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The relay said no.
    Denied(DenyReason),
    /// The relay never confirmed the claim.
    TimedOut,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(reason) => reason.fmt(f),
            Self::TimedOut => f.write_str("the server did not answer in time"),
        }
    }
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An entity's control state changed.
    ControlChanged {
        /// Entity.
        entity: EntityId,
        /// New state.
        state: EntityControlState,
    },
    /// A claim failed.
    ClaimRejected {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
        /// Why.
        reason: RejectReason,
    },
    /// The relay freed a slot we held (typically while we were disconnected).
    ControlLost {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
    },
    /// The relay says someone else holds a slot we controlled.
    InvariantViolation {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
        /// Holder according to the relay.
        holder: PeerId,
    },
    /// A new remote pose sample was accepted.
    RemotePose {
        /// Subject.
        subject: SubjectId,
        /// Reported pose.
        pose: Pose,
    },
    /// The proximate peer set changed.
    ProximityChanged {
        /// Newly proximate.
        entered: Vec<PeerId>,
        /// No longer proximate.
        left: Vec<PeerId>,
    },
    /// The relay connection is gone for good; all control was reset.
    TerminallyDisconnected,
    /// A gameplay event from a peer.
    GameEvent {
        /// Sender.
        from: PeerId,
        /// Event.
        event: GameEvent,
    },
}

/// Synchronous refusal of a user action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Claim protocol refused.
    #[error(transparent)]
    Claim(#[from] ClaimError),
    /// Control state refused.
    #[error(transparent)]
    Control(#[from] ControlError),
}

// ---------------------------------------------------------------------------
// ClientSession
// ---------------------------------------------------------------------------

/// All synchronization state of one client.
pub struct ClientSession<S: SignalSink, T: PeerTransport, B: ControlBindings> {
    local: PeerId,
    epoch: Instant,
    signal: S,
    bindings: B,
    regions: RegionMembership,
    mesh: PeerMeshManager<T>,
    claims: ClaimCoordinator,
    control: EntityControlStateMachine,
    remote: RemotePoses,
    roster: CrewRoster,
    entities: EntityRegistry,
    local_pose: Option<Pose>,
    /// Region last announced by a direct send rather than the greeting.
    joined: Option<RegionId>,
    terminated: bool,
    events: Vec<SessionEvent>,
}

impl<S: SignalSink, T: PeerTransport, B: ControlBindings> ClientSession<S, T, B> {
    /// Create a session. `now` anchors outgoing pose timestamps.
    pub fn new(
        local: PeerId,
        signal: S,
        transport: T,
        bindings: B,
        options: SessionOptions,
        now: Instant,
    ) -> Self {
        Self {
            regions: RegionMembership::new(local.clone(), options.region_size),
            mesh: PeerMeshManager::new(local.clone(), transport, options.mesh),
            claims: ClaimCoordinator::new(local.clone(), options.claims),
            control: EntityControlStateMachine::new(options.pose_broadcast_interval),
            remote: RemotePoses::new(options.interpolation_delay),
            roster: CrewRoster::new(),
            entities: EntityRegistry::new(),
            local,
            epoch: now,
            signal,
            bindings,
            local_pose: None,
            joined: None,
            terminated: false,
            events: Vec::new(),
        }
    }

    // --- read-only views ---

    /// Local peer id.
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Take every event produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Control state of an entity.
    pub fn control_state(&self, entity: &EntityId) -> EntityControlState {
        match self.entities.get(entity) {
            Some(record) => self.control.state(record),
            None => self.control.local_state(entity),
        }
    }

    /// Advisory seat map of an entity.
    pub fn roster(&self, entity: &EntityId) -> Option<&BTreeMap<SlotName, Occupant>> {
        self.roster.seats(entity)
    }

    /// Seats of an entity held by other peers.
    pub fn crew(&self, entity: &EntityId) -> Vec<(SlotName, PeerId)> {
        self.roster.remote_occupants(entity)
    }

    /// Pose to render for a subject at `now`: authoritative for what the
    /// local client owns, interpolated for everything else.
    pub fn interpolated_pose(&self, subject: &SubjectId, now: Instant) -> Option<Pose> {
        match subject {
            SubjectId::Player(peer) if *peer == self.local => self.local_pose,
            SubjectId::Entity(id) => match self.entities.get(id) {
                Some(record) if self.control.drives_locally(record) => Some(record.pose),
                Some(record) => self.remote.sample(subject, now).or(Some(record.pose)),
                None => self.remote.sample(subject, now),
            },
            SubjectId::Player(_) => self.remote.sample(subject, now),
        }
    }

    /// Known entity.
    pub fn entity(&self, id: &EntityId) -> Option<&ControllableEntity> {
        self.entities.get(id)
    }

    /// Every known entity.
    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    /// Region membership.
    pub fn regions(&self) -> &RegionMembership {
        &self.regions
    }

    /// Peer mesh.
    pub fn mesh(&self) -> &PeerMeshManager<T> {
        &self.mesh
    }

    /// The link backend, for runtimes that pre-filter its events.
    pub fn transport_mut(&mut self) -> &mut T {
        self.mesh.transport_mut()
    }

    /// Claim coordinator.
    pub fn claims(&self) -> &ClaimCoordinator {
        &self.claims
    }

    /// The signaling sink.
    pub fn signal(&self) -> &S {
        &self.signal
    }

    /// The signaling sink, mutably.
    pub fn signal_mut(&mut self) -> &mut S {
        &mut self.signal
    }

    /// The host bindings.
    pub fn bindings(&self) -> &B {
        &self.bindings
    }

    /// `true` once the relay connection was given up.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn timestamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn emit(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    fn note_change(&mut self, entity: &EntityId, before: EntityControlState) {
        let after = self.control_state(entity);
        if after != before {
            self.emit(SessionEvent::ControlChanged {
                entity: entity.clone(),
                state: after,
            });
        }
    }

    // --- dispatch ---

    /// Feed one input. Only user actions can fail.
    pub fn handle(&mut self, input: SessionInput, now: Instant) -> Result<(), SessionError> {
        match input {
            SessionInput::SignalConnected => self.on_connected(now),
            SessionInput::SignalDisconnected => {
                tracing::info!("signaling disconnected, waiting for reconnect");
                self.claims.on_disconnected();
            }
            SessionInput::SignalTerminated => self.on_terminated(),
            SessionInput::Signal(msg) => self.on_signal(msg, now),
            SessionInput::Link(event) => {
                if let Some(event) = self.mesh.handle_link_event(event, &mut self.signal, now) {
                    self.on_mesh_event(event, now);
                }
            }
            SessionInput::Tick => self.on_tick(now),
            SessionInput::Claim { entity, slot } => {
                self.claim(&entity, &slot, now)?;
            }
            SessionInput::Release { entity, slot } => {
                self.release(&entity, &slot, now)?;
            }
            SessionInput::Cancel { entity, slot } => {
                self.cancel(&entity, &slot);
            }
            SessionInput::Transfer { entity, to } => {
                self.transfer(&entity, &to, now)?;
            }
            SessionInput::MoveLocal(pose) => self.move_local(pose, now),
            SessionInput::UpdateEntityPose { entity, pose } => {
                self.update_entity_pose(&entity, pose)?;
            }
            SessionInput::DiscreteEvent(entity) => self.control.mark_discrete_event(&entity),
            SessionInput::SpawnEntity(entity) => {
                tracing::debug!("entity {} spawned in region {}", entity.id, entity.region);
                self.entities.spawn(entity);
            }
            SessionInput::DespawnEntity(id) => self.despawn(&id, now),
            SessionInput::SendGameEvent(event) => {
                self.mesh.broadcast(&PeerMessage::GameEvent(event));
            }
        }
        Ok(())
    }

    // --- user actions ---

    /// Ask the relay for a slot.
    pub fn claim(&mut self, entity: &EntityId, slot: &SlotName, now: Instant) -> Result<Nonce, SessionError> {
        let record = self
            .entities
            .get(entity)
            .ok_or_else(|| ClaimError::UnknownEntity(entity.clone()))?;
        if !record.has_slot(slot) {
            return Err(ClaimError::UnknownSlot {
                entity: entity.clone(),
                slot: slot.clone(),
            }
            .into());
        }
        if !self.regions.allows_claim(record.region) {
            return Err(ClaimError::OutOfRegion(entity.clone()).into());
        }
        let local = self.control.local_state(entity);
        if local != EntityControlState::Unowned {
            return Err(ControlError::Busy {
                entity: entity.clone(),
                state: local,
            }
            .into());
        }

        let before = self.control_state(entity);
        let nonce = self.claims.claim(entity, slot, now, &mut self.signal)?;
        self.control.begin_claim(entity, slot, nonce)?;
        self.note_change(entity, before);
        Ok(nonce)
    }

    /// Leave a held slot. Sent now, or on reconnect if the channel is down.
    pub fn release(&mut self, entity: &EntityId, slot: &SlotName, now: Instant) -> Result<Nonce, SessionError> {
        if !self.claims.is_held(entity, slot) {
            return Err(ClaimError::NotHeld {
                entity: entity.clone(),
                slot: slot.clone(),
            }
            .into());
        }
        let before = self.control_state(entity);
        self.control.begin_release(entity, slot)?;
        let pose = self
            .entities
            .get(entity)
            .filter(|record| record.is_driving(slot))
            .map(|record| record.pose);
        let nonce = self.claims.release(entity, slot, pose, now, &mut self.signal)?;
        self.note_change(entity, before);
        self.process_claim_outcomes(now);
        Ok(nonce)
    }

    /// Abandon a pending claim. Returns `false` if none was pending.
    pub fn cancel(&mut self, entity: &EntityId, slot: &SlotName) -> bool {
        if !self.claims.cancel(entity, slot) {
            return false;
        }
        let before = self.control_state(entity);
        self.control.claim_failed(entity, slot);
        self.note_change(entity, before);
        true
    }

    /// Release the current seat of `entity`, then claim `to`.
    pub fn transfer(&mut self, entity: &EntityId, to: &SlotName, now: Instant) -> Result<Nonce, SessionError> {
        if !self.signal.is_open() {
            return Err(ClaimError::ChannelDown.into());
        }
        let from = self
            .control
            .controlled_slot(entity)
            .cloned()
            .ok_or_else(|| ControlError::NotController(entity.clone()))?;
        if from == *to {
            return Err(ClaimError::AlreadyHeld {
                entity: entity.clone(),
                slot: from,
            }
            .into());
        }
        if !self.entities.get(entity).is_some_and(|record| record.has_slot(to)) {
            return Err(ClaimError::UnknownSlot {
                entity: entity.clone(),
                slot: to.clone(),
            }
            .into());
        }
        tracing::info!("transferring {entity} from {from} to {to}");
        self.release(entity, &from, now)?;
        self.claim(entity, to, now)
    }

    /// The local avatar moved.
    pub fn move_local(&mut self, pose: Pose, now: Instant) {
        self.local_pose = Some(pose);
        if let Some(change) = self.regions.update_local_position(pose.position) {
            tracing::info!("entered region {} (from {:?})", change.to, change.from);
            self.send_join(change.to);
            let update = self.regions.recompute();
            self.apply_proximity(update, now);
        }
    }

    /// The local driver moved an entity.
    pub fn update_entity_pose(&mut self, entity: &EntityId, pose: Pose) -> Result<(), SessionError> {
        let region = self.regions.region_at(pose.position);
        let record = self
            .entities
            .get_mut(entity)
            .ok_or_else(|| ControlError::NotController(entity.clone()))?;
        self.control.set_pose(record, pose)?;
        record.region = region;
        Ok(())
    }

    fn despawn(&mut self, id: &EntityId, now: Instant) {
        let before = self.control_state(id);
        match self.control.local_state(id) {
            EntityControlState::Controlling { slot } => {
                let pose = self
                    .entities
                    .get(id)
                    .filter(|record| record.is_driving(&slot))
                    .map(|record| record.pose);
                if let Err(err) = self.claims.release(id, &slot, pose, now, &mut self.signal) {
                    tracing::debug!("release of despawned {id}: {err}");
                }
            }
            EntityControlState::PendingClaim { slot, .. } => {
                self.claims.cancel(id, &slot);
            }
            _ => {}
        }
        self.control.force_reset(id, &mut self.bindings);
        self.control.remove(id);
        self.roster.remove_entity(id);
        self.remote.forget(&SubjectId::Entity(id.clone()));
        if self.entities.despawn(id).is_some() {
            tracing::debug!("entity {id} despawned");
        }
        if before != EntityControlState::Unowned {
            self.emit(SessionEvent::ControlChanged {
                entity: id.clone(),
                state: EntityControlState::Unowned,
            });
        }
        self.process_claim_outcomes(now);
    }

    // --- signaling ---

    /// Announce `region` now, and as the greeting of every later connection
    /// so nothing reaches the relay ahead of it.
    fn send_join(&mut self, region: RegionId) {
        let join = SignalMessage::JoinRegion(JoinRegion {
            region,
            peer_id: self.local.clone(),
        });
        self.signal.set_greeting(join.clone());
        if self.signal.send(join) {
            self.joined = Some(region);
        } else {
            self.joined = None;
            tracing::debug!("join of region {region} deferred until reconnect");
        }
    }

    fn on_connected(&mut self, now: Instant) {
        tracing::info!("signaling connected");
        self.terminated = false;
        // The greeting may predate the last region change.
        if let Some(region) = self.regions.local_region()
            && self.joined != Some(region)
        {
            self.send_join(region);
        }
        self.claims.on_connected(now, &mut self.signal);
        self.process_claim_outcomes(now);
    }

    fn on_terminated(&mut self) {
        tracing::warn!("relay unreachable, resetting all control");
        self.terminated = true;
        self.joined = None;
        let dropped = self.claims.force_reset();
        let reset = self.control.force_reset_all(&mut self.bindings);
        tracing::info!(
            "dropped {} claim(s), reset {} entit(ies)",
            dropped.len(),
            reset.len()
        );
        for entity in reset {
            self.emit(SessionEvent::ControlChanged {
                entity,
                state: EntityControlState::Unowned,
            });
        }
        self.roster = CrewRoster::new();
        self.remote.clear();
        self.mesh.clear();
        let update = self.regions.clear_peers();
        if !update.is_unchanged() {
            self.emit(SessionEvent::ProximityChanged {
                entered: update.entered,
                left: update.left,
            });
        }
        self.emit(SessionEvent::TerminallyDisconnected);
    }

    fn on_signal(&mut self, msg: SignalMessage, now: Instant) {
        match &msg {
            SignalMessage::RegionUpdate(update) => {
                let update = self.regions.apply_region_update(update.region, &update.peers);
                self.apply_proximity(update, now);
            }
            SignalMessage::SignalOffer(_)
            | SignalMessage::SignalAnswer(_)
            | SignalMessage::SignalCandidate(_) => self.mesh.handle_signal(&msg, now),
            SignalMessage::ClaimGranted(_)
            | SignalMessage::ClaimDenied(_)
            | SignalMessage::ReleaseAck(_)
            | SignalMessage::ClaimState(_) => {
                self.claims.handle_signal(&msg, now, &mut self.signal);
                self.process_claim_outcomes(now);
            }
            SignalMessage::Ping(_) | SignalMessage::Pong(_) => {}
            SignalMessage::JoinRegion(_)
            | SignalMessage::ClaimEntity(_)
            | SignalMessage::ReleaseEntity(_)
            | SignalMessage::QueryClaimState(_) => {
                tracing::warn!("unexpected client-bound message from relay: {msg:?}");
            }
        }
    }

    fn apply_proximity(&mut self, update: ProximityUpdate, now: Instant) {
        if update.is_unchanged() {
            return;
        }
        self.mesh
            .set_proximate(&update.proximate, |peer| self.regions.region_of(peer), now);
        for peer in &update.left {
            self.forget_peer(peer);
        }
        self.emit(SessionEvent::ProximityChanged {
            entered: update.entered,
            left: update.left,
        });
    }

    fn forget_peer(&mut self, peer: &PeerId) {
        self.roster.forget_peer(peer);
        self.remote.forget(&SubjectId::Player(peer.clone()));
        for entity in self.control.forget_peer(peer) {
            self.remote.forget(&SubjectId::Entity(entity.clone()));
            let state = self.control_state(&entity);
            self.emit(SessionEvent::ControlChanged { entity, state });
        }
    }

    // --- claims ---

    fn process_claim_outcomes(&mut self, now: Instant) {
        loop {
            let batch = self.claims.drain();
            if batch.is_empty() {
                break;
            }
            for resolution in batch {
                self.apply_outcome(resolution, now);
            }
        }
    }

    fn apply_outcome(&mut self, resolution: ClaimResolution, now: Instant) {
        let ClaimResolution {
            entity,
            slot,
            outcome,
        } = resolution;
        let before = self.control_state(&entity);
        match outcome {
            ClaimOutcome::Granted { was_late, state } => {
                self.on_granted(&entity, &slot, was_late, state, now);
            }
            ClaimOutcome::Denied { reason } => {
                self.control.claim_failed(&entity, &slot);
                if let DenyReason::Occupied { by } = &reason {
                    self.roster.set(&entity, &slot, Occupant::Peer(by.clone()));
                }
                self.emit(SessionEvent::ClaimRejected {
                    entity: entity.clone(),
                    slot,
                    reason: RejectReason::Denied(reason),
                });
            }
            ClaimOutcome::TimedOut => {
                self.control.claim_failed(&entity, &slot);
                self.emit(SessionEvent::ClaimRejected {
                    entity: entity.clone(),
                    slot,
                    reason: RejectReason::TimedOut,
                });
            }
            ClaimOutcome::AbandonedGrantReleased => {
                tracing::debug!("abandoned grant for {entity}/{slot} released");
            }
            ClaimOutcome::Revoked { holder } => {
                self.control.force_reset(&entity, &mut self.bindings);
                self.roster.vacate(&entity, &slot);
                match holder {
                    Some(holder) => {
                        self.roster.set(&entity, &slot, Occupant::Peer(holder.clone()));
                        self.emit(SessionEvent::InvariantViolation {
                            entity: entity.clone(),
                            slot,
                            holder,
                        });
                    }
                    None => self.emit(SessionEvent::ControlLost {
                        entity: entity.clone(),
                        slot,
                    }),
                }
            }
            ClaimOutcome::Released => {
                self.control.released(&entity, &slot, &mut self.bindings);
                if self.roster.occupant(&entity, &slot) == Some(&Occupant::Local) {
                    self.roster.vacate(&entity, &slot);
                }
                self.mesh.broadcast(&PeerMessage::SlotVacated(SlotVacated {
                    entity: entity.clone(),
                    slot,
                }));
            }
            ClaimOutcome::ReleaseAcknowledged | ClaimOutcome::ReleaseUnconfirmed => {}
        }
        self.note_change(&entity, before);
    }

    fn on_granted(
        &mut self,
        id: &EntityId,
        slot: &SlotName,
        was_late: bool,
        state: EntitySnapshot,
        now: Instant,
    ) {
        let Some(record) = self.entities.get_mut(id) else {
            tracing::warn!("grant for unknown entity {id}/{slot}, releasing");
            if let Err(err) = self.claims.release(id, slot, None, now, &mut self.signal) {
                tracing::debug!("release of unknown {id}: {err}");
            }
            return;
        };
        if was_late {
            tracing::info!("late grant for {id}/{slot} confirmed by reconciliation");
        }
        if record.is_driving(slot)
            && let Some(pose) = state.last_pose
        {
            record.pose = pose;
        }
        self.control.grant(record, slot, &mut self.bindings);
        self.roster.seed_from_grant(id, &state, &self.local);
        self.roster.set(id, slot, Occupant::Local);
        self.remote.forget(&SubjectId::Entity(id.clone()));
        self.mesh.broadcast(&PeerMessage::SlotOccupied(SlotOccupied {
            entity: id.clone(),
            slot: slot.clone(),
            peer: self.local.clone(),
        }));
    }

    // --- peers ---

    fn on_mesh_event(&mut self, event: MeshEvent, now: Instant) {
        match event {
            MeshEvent::LinkOpened(peer) => {
                tracing::info!("link to {peer} open");
                let snapshot = self.sync_snapshot(now);
                self.mesh.send_to(&peer, &PeerMessage::Sync(snapshot));
            }
            MeshEvent::LinkLost(peer) => tracing::debug!("link to {peer} lost"),
            MeshEvent::GaveUp(_) => {}
            MeshEvent::Message { peer, msg } => self.on_peer_message(peer, msg, now),
        }
    }

    fn sync_snapshot(&self, now: Instant) -> SyncSnapshot {
        let timestamp_ms = self.timestamp(now);
        let mut poses = Vec::new();
        if let Some(pose) = self.local_pose {
            poses.push(PoseSync {
                subject: SubjectId::Player(self.local.clone()),
                pose,
                timestamp_ms,
            });
        }
        for record in self.entities.iter() {
            if self.control.drives_locally(record) {
                poses.push(PoseSync {
                    subject: SubjectId::Entity(record.id.clone()),
                    pose: record.pose,
                    timestamp_ms,
                });
            }
        }
        let occupied = self
            .claims
            .held_slots()
            .filter(|(entity, slot)| self.control.controlled_slot(entity) == Some(*slot))
            .map(|(entity, slot)| SlotOccupied {
                entity: entity.clone(),
                slot: slot.clone(),
                peer: self.local.clone(),
            })
            .collect();
        SyncSnapshot {
            sender: self.local.clone(),
            poses,
            occupied,
        }
    }

    fn on_peer_message(&mut self, peer: PeerId, msg: PeerMessage, now: Instant) {
        match msg {
            PeerMessage::PoseSync(sample) => self.apply_remote_pose(&peer, sample, now),
            PeerMessage::SlotOccupied(occupied) => self.apply_occupied(&peer, occupied),
            PeerMessage::SlotVacated(vacated) => self.apply_vacated(&peer, vacated),
            PeerMessage::Sync(snapshot) => {
                if snapshot.sender != peer {
                    tracing::warn!("sync from {peer} claims sender {}", snapshot.sender);
                    return;
                }
                for occupied in snapshot.occupied {
                    self.apply_occupied(&peer, occupied);
                }
                for sample in snapshot.poses {
                    self.apply_remote_pose(&peer, sample, now);
                }
            }
            PeerMessage::GameEvent(event) => self.emit(SessionEvent::GameEvent { from: peer, event }),
        }
    }

    fn apply_remote_pose(&mut self, peer: &PeerId, sample: PoseSync, now: Instant) {
        match &sample.subject {
            SubjectId::Player(subject) if subject != peer => {
                tracing::warn!("{peer} sent a pose for player {subject}");
                return;
            }
            SubjectId::Player(_) => {}
            SubjectId::Entity(id) => {
                let Some(record) = self.entities.get(id) else {
                    tracing::trace!("pose for unknown entity {id}");
                    return;
                };
                if self.control.drives_locally(record) {
                    tracing::debug!("ignoring pose for {id} from {peer}: driven locally");
                    return;
                }
                if let Some(driver) = self.control.remote_occupant(id, record.driving_slot())
                    && driver != peer
                {
                    tracing::debug!("ignoring pose for {id} from {peer}: driven by {driver}");
                    return;
                }
            }
        }
        if self
            .remote
            .push(sample.subject.clone(), sample.pose, sample.timestamp_ms, now)
        {
            self.emit(SessionEvent::RemotePose {
                subject: sample.subject,
                pose: sample.pose,
            });
        }
    }

    fn apply_occupied(&mut self, peer: &PeerId, occupied: SlotOccupied) {
        let SlotOccupied { entity, slot, peer: occupant } = occupied;
        if occupant != *peer {
            tracing::warn!("{peer} advertised {occupant} in {entity}/{slot}");
            return;
        }
        let before = self.control_state(&entity);
        let replaced = self.control.remote_occupied(&entity, &slot, peer);
        self.roster.set(&entity, &slot, Occupant::Peer(peer.clone()));
        let driving = self
            .entities
            .get(&entity)
            .is_some_and(|record| record.is_driving(&slot));
        if driving && replaced.as_ref() != Some(peer) {
            self.remote.forget(&SubjectId::Entity(entity.clone()));
        }
        if self.claims.is_held(&entity, &slot) {
            tracing::warn!("{peer} says it holds {entity}/{slot}, which we hold; asking the relay");
            self.claims.verify(&entity, &slot, &mut self.signal);
        }
        self.note_change(&entity, before);
    }

    fn apply_vacated(&mut self, peer: &PeerId, vacated: SlotVacated) {
        let SlotVacated { entity, slot } = vacated;
        let before = self.control_state(&entity);
        if self.control.remote_vacated(&entity, &slot, peer)
            || self.roster.occupant(&entity, &slot) == Some(&Occupant::Peer(peer.clone()))
        {
            self.roster.vacate(&entity, &slot);
        }
        self.note_change(&entity, before);
    }

    // --- timers ---

    fn on_tick(&mut self, now: Instant) {
        for event in self.mesh.tick(now) {
            self.on_mesh_event(event, now);
        }
        self.claims.tick(now, &mut self.signal);
        self.process_claim_outcomes(now);
        self.broadcast_poses(now);
    }

    fn broadcast_poses(&mut self, now: Instant) {
        let timestamp_ms = self.timestamp(now);
        let mut samples = Vec::new();
        if let Some(pose) = self.local_pose {
            let subject = SubjectId::Player(self.local.clone());
            if self.control.broadcaster().due(&subject, now) {
                samples.push(PoseSync {
                    subject,
                    pose,
                    timestamp_ms,
                });
            }
        }
        for record in self.entities.iter() {
            if !self.control.drives_locally(record) {
                continue;
            }
            let subject = SubjectId::Entity(record.id.clone());
            if self.control.broadcaster().due(&subject, now) {
                samples.push(PoseSync {
                    subject,
                    pose: record.pose,
                    timestamp_ms,
                });
            }
        }
        for sample in samples {
            self.mesh.broadcast(&PeerMessage::PoseSync(sample));
        }
    }
}
