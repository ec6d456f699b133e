//! Per-entity control state and the exclusive side effects tied to it.
//!
//! Local control moves `Unowned → PendingClaim → Controlling → PendingRelease
//! → Unowned`. Seats held by remote peers are tracked alongside; an entity
//! the local client does not control reports `ObservingRemoteControl` while
//! any peer sits in it.
//!
//! Entering `Controlling` acquires a set of [`ControlBinding`]s through the
//! host's [`ControlBindings`]; leaving it releases exactly the recorded set,
//! in reverse order, once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use tidemesh_net::{EntityId, Nonce, PeerId, Pose, SlotName, SubjectId};

use crate::entity::ControllableEntity;

// ---------------------------------------------------------------------------
// State and bindings
// ---------------------------------------------------------------------------

/// Control state of one entity as seen by the local client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityControlState {
    /// Nobody known to occupy the entity.
    Unowned,
    /// A claim is in flight.
    PendingClaim {
        /// Slot requested.
        slot: SlotName,
        /// Nonce of the request.
        nonce: Nonce,
    },
    /// The local client occupies `slot`.
    Controlling {
        /// Slot held.
        slot: SlotName,
    },
    /// Release issued but not yet sent; bindings are still held.
    PendingRelease {
        /// Slot being released.
        slot: SlotName,
    },
    /// A remote peer occupies the entity.
    ObservingRemoteControl {
        /// Remote occupant.
        peer: PeerId,
        /// Its slot (the driving slot when occupied).
        slot: SlotName,
    },
}

/// Exclusive local side effects of occupying an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlBinding {
    /// The entity's static collision shape is detached while driven.
    StaticCollider,
    /// The camera follows the entity.
    CameraTarget,
    /// The avatar's animation rig is bound to the seat.
    AnimationRig,
    /// The avatar moves with the entity.
    MovementParent,
}

impl ControlBinding {
    /// Bindings for occupying `slot` of `entity`, in acquisition order.
    pub fn for_slot(entity: &ControllableEntity, slot: &SlotName) -> &'static [ControlBinding] {
        const DRIVING: &[ControlBinding] = &[
            ControlBinding::StaticCollider,
            ControlBinding::MovementParent,
            ControlBinding::CameraTarget,
            ControlBinding::AnimationRig,
        ];
        const PASSENGER: &[ControlBinding] = &[
            ControlBinding::MovementParent,
            ControlBinding::CameraTarget,
            ControlBinding::AnimationRig,
        ];
        if entity.is_driving(slot) {
            DRIVING
        } else {
            PASSENGER
        }
    }
}

/// Host-side implementation of control bindings (physics, camera, animation).
pub trait ControlBindings {
    /// Apply `binding` to `entity`.
    fn acquire(&mut self, entity: &EntityId, binding: ControlBinding);

    /// Undo `binding` on `entity`.
    fn release(&mut self, entity: &EntityId, binding: ControlBinding);
}

/// Refused control operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// The local client does not control the entity through the required slot.
    #[error("not in control of {0}")]
    NotController(EntityId),
    /// A claim or release for the entity is already in progress or held.
    #[error("{entity} is busy ({state:?})")]
    Busy {
        /// Entity.
        entity: EntityId,
        /// Its current local state.
        state: EntityControlState,
    },
}

// ---------------------------------------------------------------------------
// Pose broadcast pacing
// ---------------------------------------------------------------------------

/// Rate limiter for outgoing pose samples, per subject.
#[derive(Debug)]
pub struct PoseBroadcaster {
    interval: Duration,
    last: HashMap<SubjectId, Instant>,
    forced: HashSet<SubjectId>,
}

impl PoseBroadcaster {
    /// Broadcast each subject at most once per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
            forced: HashSet::new(),
        }
    }

    /// Broadcast `subject` on the next check regardless of the interval.
    pub fn force(&mut self, subject: SubjectId) {
        self.forced.insert(subject);
    }

    /// `true` if `subject` should be broadcast now. Records the broadcast.
    pub fn due(&mut self, subject: &SubjectId, now: Instant) -> bool {
        let forced = self.forced.remove(subject);
        let elapsed = self
            .last
            .get(subject)
            .is_none_or(|at| now.saturating_duration_since(*at) >= self.interval);
        if forced || elapsed {
            self.last.insert(subject.clone(), now);
            true
        } else {
            false
        }
    }

    /// Drop pacing state for `subject`.
    pub fn forget(&mut self, subject: &SubjectId) {
        self.last.remove(subject);
        self.forced.remove(subject);
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ControlEntry {
    /// Never `ObservingRemoteControl`.
    local: EntityControlState,
    remote: BTreeMap<SlotName, PeerId>,
    bindings: Vec<ControlBinding>,
}

impl Default for ControlEntry {
    fn default() -> Self {
        Self {
            local: EntityControlState::Unowned,
            remote: BTreeMap::new(),
            bindings: Vec::new(),
        }
    }
}

impl ControlEntry {
    fn is_idle(&self) -> bool {
        self.local == EntityControlState::Unowned
            && self.remote.is_empty()
            && self.bindings.is_empty()
    }
}

/// Control state of every entity the local client knows about.
#[derive(Debug)]
pub struct EntityControlStateMachine {
    entries: BTreeMap<EntityId, ControlEntry>,
    broadcaster: PoseBroadcaster,
}

impl EntityControlStateMachine {
    /// Create a machine pacing pose broadcasts at `pose_interval`.
    pub fn new(pose_interval: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            broadcaster: PoseBroadcaster::new(pose_interval),
        }
    }

    /// Combined state of an entity.
    pub fn state(&self, entity: &ControllableEntity) -> EntityControlState {
        let Some(entry) = self.entries.get(&entity.id) else {
            return EntityControlState::Unowned;
        };
        if entry.local != EntityControlState::Unowned {
            return entry.local.clone();
        }
        let driving = entity.driving_slot();
        entry
            .remote
            .get_key_value(driving)
            .or_else(|| entry.remote.iter().next())
            .map(|(slot, peer)| EntityControlState::ObservingRemoteControl {
                peer: peer.clone(),
                slot: slot.clone(),
            })
            .unwrap_or(EntityControlState::Unowned)
    }

    /// Local state of an entity by id, ignoring remote occupants.
    pub fn local_state(&self, entity: &EntityId) -> EntityControlState {
        self.entries
            .get(entity)
            .map(|e| e.local.clone())
            .unwrap_or(EntityControlState::Unowned)
    }

    /// The slot the local client controls, if any.
    pub fn controlled_slot(&self, entity: &EntityId) -> Option<&SlotName> {
        match &self.entries.get(entity)?.local {
            EntityControlState::Controlling { slot } => Some(slot),
            _ => None,
        }
    }

    /// `true` if the local client drives `entity` and so owns its pose.
    pub fn drives_locally(&self, entity: &ControllableEntity) -> bool {
        self.controlled_slot(&entity.id)
            .is_some_and(|slot| entity.is_driving(slot))
    }

    /// Bindings currently held for an entity.
    pub fn bindings(&self, entity: &EntityId) -> &[ControlBinding] {
        self.entries
            .get(entity)
            .map(|e| e.bindings.as_slice())
            .unwrap_or(&[])
    }

    /// Remote peer in `slot`, as last advertised.
    pub fn remote_occupant(&self, entity: &EntityId, slot: &SlotName) -> Option<&PeerId> {
        self.entries.get(entity)?.remote.get(slot)
    }

    fn entry(&mut self, entity: &EntityId) -> &mut ControlEntry {
        self.entries.entry(entity.clone()).or_default()
    }

    fn prune(&mut self, entity: &EntityId) {
        if self.entries.get(entity).is_some_and(ControlEntry::is_idle) {
            self.entries.remove(entity);
        }
    }

    // --- local transitions ---

    /// `Unowned → PendingClaim`.
    pub fn begin_claim(
        &mut self,
        entity: &EntityId,
        slot: &SlotName,
        nonce: Nonce,
    ) -> Result<(), ControlError> {
        let entry = self.entry(entity);
        if entry.local != EntityControlState::Unowned {
            return Err(ControlError::Busy {
                entity: entity.clone(),
                state: entry.local.clone(),
            });
        }
        entry.local = EntityControlState::PendingClaim {
            slot: slot.clone(),
            nonce,
        };
        Ok(())
    }

    /// A pending claim was denied, timed out or cancelled: back to `Unowned`.
    pub fn claim_failed(&mut self, entity: &EntityId, slot: &SlotName) {
        if let Some(entry) = self.entries.get_mut(entity)
            && matches!(&entry.local, EntityControlState::PendingClaim { slot: s, .. } if s == slot)
        {
            entry.local = EntityControlState::Unowned;
        }
        self.prune(entity);
    }

    /// The relay granted `slot`: enter `Controlling` and acquire bindings.
    ///
    /// Accepted from `Unowned` as well as `PendingClaim`, since a late grant
    /// confirmed by reconciliation may land after the local state moved on.
    pub fn grant(
        &mut self,
        entity: &ControllableEntity,
        slot: &SlotName,
        bindings: &mut impl ControlBindings,
    ) {
        let entry = self.entries.entry(entity.id.clone()).or_default();
        match &entry.local {
            EntityControlState::Controlling { slot: held } if held == slot => return,
            EntityControlState::Unowned | EntityControlState::PendingClaim { .. } => {}
            other => {
                tracing::warn!("grant for {}/{slot} while {other:?}", entity.id);
            }
        }
        for binding in std::mem::take(&mut entry.bindings).into_iter().rev() {
            bindings.release(&entity.id, binding);
        }
        for &binding in ControlBinding::for_slot(entity, slot) {
            bindings.acquire(&entity.id, binding);
            entry.bindings.push(binding);
        }
        entry.remote.remove(slot);
        entry.local = EntityControlState::Controlling { slot: slot.clone() };
        if entity.is_driving(slot) {
            self.broadcaster.force(SubjectId::Entity(entity.id.clone()));
        }
    }

    /// `Controlling → PendingRelease`. Bindings stay until the release is
    /// sent.
    pub fn begin_release(&mut self, entity: &EntityId, slot: &SlotName) -> Result<(), ControlError> {
        match self.entries.get_mut(entity) {
            Some(entry)
                if matches!(&entry.local, EntityControlState::Controlling { slot: s } if s == slot) =>
            {
                entry.local = EntityControlState::PendingRelease { slot: slot.clone() };
                Ok(())
            }
            _ => Err(ControlError::NotController(entity.clone())),
        }
    }

    /// The release left for the relay: release bindings, back to `Unowned`.
    pub fn released(&mut self, entity: &EntityId, slot: &SlotName, bindings: &mut impl ControlBindings) {
        let Some(entry) = self.entries.get_mut(entity) else {
            return;
        };
        if !matches!(&entry.local, EntityControlState::PendingRelease { slot: s } if s == slot) {
            return;
        }
        for binding in std::mem::take(&mut entry.bindings).into_iter().rev() {
            bindings.release(entity, binding);
        }
        entry.local = EntityControlState::Unowned;
        self.broadcaster.forget(&SubjectId::Entity(entity.clone()));
        self.prune(entity);
    }

    /// Drop local control of one entity without the protocol (revocation,
    /// despawn). Returns `true` if anything was held or pending.
    pub fn force_reset(&mut self, entity: &EntityId, bindings: &mut impl ControlBindings) -> bool {
        let Some(entry) = self.entries.get_mut(entity) else {
            return false;
        };
        let had = entry.local != EntityControlState::Unowned || !entry.bindings.is_empty();
        for binding in std::mem::take(&mut entry.bindings).into_iter().rev() {
            bindings.release(entity, binding);
        }
        entry.local = EntityControlState::Unowned;
        self.broadcaster.forget(&SubjectId::Entity(entity.clone()));
        self.prune(entity);
        had
    }

    /// Reset every entity (terminal disconnect). Remote observations are
    /// dropped as well. Returns the entities that had local state.
    pub fn force_reset_all(&mut self, bindings: &mut impl ControlBindings) -> Vec<EntityId> {
        let mut reset = Vec::new();
        for (id, entry) in std::mem::take(&mut self.entries) {
            if entry.local != EntityControlState::Unowned || !entry.bindings.is_empty() {
                reset.push(id.clone());
            }
            for binding in entry.bindings.into_iter().rev() {
                bindings.release(&id, binding);
            }
            self.broadcaster.forget(&SubjectId::Entity(id));
        }
        reset
    }

    /// Forget an entity entirely (it left the known world). Callers release
    /// bindings first with [`force_reset`](Self::force_reset).
    pub fn remove(&mut self, entity: &EntityId) {
        self.entries.remove(entity);
        self.broadcaster.forget(&SubjectId::Entity(entity.clone()));
    }

    // --- remote observations ---

    /// A peer advertised that it holds `slot`. Returns the peer it replaced.
    pub fn remote_occupied(&mut self, entity: &EntityId, slot: &SlotName, peer: &PeerId) -> Option<PeerId> {
        self.entry(entity).remote.insert(slot.clone(), peer.clone())
    }

    /// A peer advertised that it left `slot`. Only that peer's entry is
    /// cleared.
    pub fn remote_vacated(&mut self, entity: &EntityId, slot: &SlotName, peer: &PeerId) -> bool {
        let removed = self.entries.get_mut(entity).is_some_and(|entry| {
            if entry.remote.get(slot) == Some(peer) {
                entry.remote.remove(slot);
                true
            } else {
                false
            }
        });
        self.prune(entity);
        removed
    }

    /// Drop every seat advertised by `peer`. Returns the affected entities.
    pub fn forget_peer(&mut self, peer: &PeerId) -> Vec<EntityId> {
        let mut affected = Vec::new();
        for (id, entry) in &mut self.entries {
            let before = entry.remote.len();
            entry.remote.retain(|_, p| p != peer);
            if entry.remote.len() != before {
                affected.push(id.clone());
            }
        }
        self.entries.retain(|_, e| !e.is_idle());
        affected
    }

    // --- pose ---

    /// Write a new pose. Only the local driver may do so.
    pub fn set_pose(&mut self, entity: &mut ControllableEntity, pose: Pose) -> Result<(), ControlError> {
        if !self.drives_locally(entity) {
            return Err(ControlError::NotController(entity.id.clone()));
        }
        entity.pose = pose;
        Ok(())
    }

    /// Broadcast the entity's pose on the next tick.
    pub fn mark_discrete_event(&mut self, entity: &EntityId) {
        self.broadcaster.force(SubjectId::Entity(entity.clone()));
    }

    /// Broadcast pacing, shared with the local avatar.
    pub fn broadcaster(&mut self) -> &mut PoseBroadcaster {
        &mut self.broadcaster
    }
}
