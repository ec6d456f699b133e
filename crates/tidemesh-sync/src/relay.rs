//! Relay-side arbitration: region membership, signaling pass-through and the
//! authoritative slot occupancy table.
//!
//! [`RelayState`] is a pure function of its inputs: each inbound message from
//! a bound peer yields the messages to send back out. The relay server runs
//! it in a single task; the multi-client simulation runs it in-process.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use tidemesh_config::RelayConfig;
use tidemesh_net::{
    ClaimDenied, ClaimEntity, ClaimGranted, ClaimState, DenyReason, EntityId, EntitySnapshot,
    JoinRegion, Nonce, PeerId, Pong, Pose, RegionId, RegionUpdate, ReleaseAck, ReleaseEntity,
    SignalMessage, SignalPayload, SlotName, SlotOccupant,
};

// ---------------------------------------------------------------------------
// OccupancyTable
// ---------------------------------------------------------------------------

/// Result of a claim, replayed verbatim for a resent nonce.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimDecision {
    /// The requester now holds the slot.
    Granted(EntitySnapshot),
    /// The requester does not.
    Denied(DenyReason),
}

#[derive(Debug, Clone)]
enum Decision {
    Claim(ClaimDecision),
    Release,
}

/// Who holds which slot. The single source of truth for occupancy.
#[derive(Debug)]
pub struct OccupancyTable {
    slots: BTreeMap<(EntityId, SlotName), PeerId>,
    poses: HashMap<EntityId, Pose>,
    known: Option<HashSet<EntityId>>,
    decisions: HashMap<(PeerId, Nonce), Decision>,
    decision_order: VecDeque<(PeerId, Nonce)>,
    max_decisions: usize,
}

impl Default for OccupancyTable {
    fn default() -> Self {
        Self::new(None, 1_024)
    }
}

impl OccupancyTable {
    /// Create a table. `known` restricts claims to a fixed set of entities;
    /// `None` accepts any id. At most `max_decisions` nonces are remembered.
    pub fn new(known: Option<HashSet<EntityId>>, max_decisions: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            poses: HashMap::new(),
            known,
            decisions: HashMap::new(),
            decision_order: VecDeque::new(),
            max_decisions: max_decisions.max(1),
        }
    }

    /// Build from relay configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        let known = (!config.known_entities.is_empty()).then(|| {
            config
                .known_entities
                .iter()
                .map(|id| EntityId::new(id.as_str()))
                .collect()
        });
        Self::new(known, config.decision_cache_size)
    }

    fn remember(&mut self, key: (PeerId, Nonce), decision: Decision) {
        if self.decisions.insert(key.clone(), decision).is_none() {
            self.decision_order.push_back(key);
        }
        while self.decision_order.len() > self.max_decisions {
            if let Some(old) = self.decision_order.pop_front() {
                self.decisions.remove(&old);
            }
        }
    }

    /// Current holder of a slot.
    pub fn query(&self, entity: &EntityId, slot: &SlotName) -> Option<&PeerId> {
        self.slots.get(&(entity.clone(), slot.clone()))
    }

    /// Occupied slots of an entity plus its last released pose.
    pub fn snapshot(&self, entity: &EntityId) -> EntitySnapshot {
        EntitySnapshot {
            last_pose: self.poses.get(entity).copied(),
            occupants: self
                .slots
                .iter()
                .filter(|((e, _), _)| e == entity)
                .map(|((_, slot), peer)| SlotOccupant {
                    slot: slot.clone(),
                    peer: peer.clone(),
                })
                .collect(),
        }
    }

    /// Every occupied slot.
    pub fn occupied(&self) -> impl Iterator<Item = (&EntityId, &SlotName, &PeerId)> {
        self.slots.iter().map(|((e, s), p)| (e, s, p))
    }

    /// Decide a claim atomically. A nonce seen before from the same
    /// requester returns the original decision without re-deciding.
    pub fn claim(
        &mut self,
        requester: &PeerId,
        entity: &EntityId,
        slot: &SlotName,
        nonce: Nonce,
    ) -> ClaimDecision {
        let key = (requester.clone(), nonce);
        if let Some(Decision::Claim(decision)) = self.decisions.get(&key) {
            tracing::debug!("replaying decision for {requester} nonce {nonce}");
            return decision.clone();
        }

        let decision = self.decide(requester, entity, slot);
        self.remember(key, Decision::Claim(decision.clone()));
        decision
    }

    fn decide(&mut self, requester: &PeerId, entity: &EntityId, slot: &SlotName) -> ClaimDecision {
        if self.known.as_ref().is_some_and(|known| !known.contains(entity)) {
            return ClaimDecision::Denied(DenyReason::UnknownEntity);
        }
        match self.query(entity, slot) {
            Some(holder) if holder == requester => {
                return ClaimDecision::Granted(self.snapshot(entity));
            }
            Some(holder) => {
                return ClaimDecision::Denied(DenyReason::Occupied { by: holder.clone() });
            }
            None => {}
        }
        let seated = self
            .slots
            .iter()
            .find(|((e, _), p)| e == entity && *p == requester)
            .map(|((_, s), _)| s.clone());
        if let Some(seat) = seated {
            return ClaimDecision::Denied(DenyReason::AlreadySeated { slot: seat });
        }

        self.slots
            .insert((entity.clone(), slot.clone()), requester.clone());
        tracing::info!("{requester} now holds {entity}/{slot}");
        ClaimDecision::Granted(self.snapshot(entity))
    }

    /// Process a release. Only the holder frees the slot; anything else is
    /// acknowledged without effect. Returns `true` if the slot was freed.
    pub fn release(
        &mut self,
        requester: &PeerId,
        entity: &EntityId,
        slot: &SlotName,
        nonce: Nonce,
        pose: Option<Pose>,
    ) -> bool {
        let key = (requester.clone(), nonce);
        if matches!(self.decisions.get(&key), Some(Decision::Release)) {
            tracing::debug!("duplicate release from {requester} nonce {nonce}");
            return false;
        }
        self.remember(key, Decision::Release);

        let slot_key = (entity.clone(), slot.clone());
        if self.slots.get(&slot_key) != Some(requester) {
            tracing::debug!("release of {entity}/{slot} from non-holder {requester}");
            return false;
        }
        self.slots.remove(&slot_key);
        if let Some(pose) = pose {
            self.poses.insert(entity.clone(), pose);
        }
        tracing::info!("{requester} released {entity}/{slot}");
        true
    }

    /// Free every slot of a departed session. Returns the freed slots.
    pub fn release_all_for(&mut self, peer: &PeerId) -> Vec<(EntityId, SlotName)> {
        let freed: Vec<(EntityId, SlotName)> = self
            .slots
            .iter()
            .filter(|(_, p)| *p == peer)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &freed {
            self.slots.remove(key);
        }
        self.decisions.retain(|(p, _), _| p != peer);
        self.decision_order.retain(|(p, _)| p != peer);
        if !freed.is_empty() {
            tracing::info!("freed {} slot(s) held by departed {peer}", freed.len());
        }
        freed
    }
}

// ---------------------------------------------------------------------------
// RelayState
// ---------------------------------------------------------------------------

/// A message the relay sends to one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    /// Recipient.
    pub to: PeerId,
    /// Message.
    pub msg: SignalMessage,
}

/// All relay state: who is where and who holds what.
#[derive(Debug, Default)]
pub struct RelayState {
    regions: HashMap<RegionId, BTreeSet<PeerId>>,
    locations: HashMap<PeerId, RegionId>,
    occupancy: OccupancyTable,
}

impl RelayState {
    /// Relay over an occupancy table.
    pub fn new(occupancy: OccupancyTable) -> Self {
        Self {
            regions: HashMap::new(),
            locations: HashMap::new(),
            occupancy,
        }
    }

    /// The occupancy table.
    pub fn occupancy(&self) -> &OccupancyTable {
        &self.occupancy
    }

    /// Region a peer last joined.
    pub fn region_of(&self, peer: &PeerId) -> Option<RegionId> {
        self.locations.get(peer).copied()
    }

    /// Members of a region.
    pub fn members(&self, region: RegionId) -> Vec<PeerId> {
        self.regions
            .get(&region)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn region_update(&self, region: RegionId, out: &mut Vec<Outbound>) {
        let peers = self.members(region);
        for to in &peers {
            out.push(Outbound {
                to: to.clone(),
                msg: SignalMessage::RegionUpdate(RegionUpdate {
                    region,
                    peers: peers.clone(),
                }),
            });
        }
    }

    fn leave_region(&mut self, peer: &PeerId) -> Option<RegionId> {
        let region = self.locations.remove(peer)?;
        if let Some(members) = self.regions.get_mut(&region) {
            members.remove(peer);
            if members.is_empty() {
                self.regions.remove(&region);
            }
        }
        Some(region)
    }

    /// Handle one message from `from`. Returns what to send.
    pub fn handle(&mut self, from: &PeerId, msg: SignalMessage) -> Vec<Outbound> {
        let mut out = Vec::new();
        let reply = |msg| Outbound {
            to: from.clone(),
            msg,
        };
        match msg {
            SignalMessage::JoinRegion(JoinRegion { region, peer_id }) => {
                if &peer_id != from {
                    tracing::warn!("{from} tried to join as {peer_id}");
                    return out;
                }
                let previous = self.leave_region(from);
                self.regions.entry(region).or_default().insert(from.clone());
                self.locations.insert(from.clone(), region);
                tracing::debug!("{from} joined region {region} (was {previous:?})");
                if let Some(old) = previous
                    && old != region
                {
                    self.region_update(old, &mut out);
                }
                self.region_update(region, &mut out);
            }

            SignalMessage::SignalOffer(p) => self.forward(from, p, SignalMessage::SignalOffer, &mut out),
            SignalMessage::SignalAnswer(p) => self.forward(from, p, SignalMessage::SignalAnswer, &mut out),
            SignalMessage::SignalCandidate(p) => {
                self.forward(from, p, SignalMessage::SignalCandidate, &mut out)
            }

            SignalMessage::ClaimEntity(ClaimEntity {
                entity,
                slot,
                nonce,
            }) => {
                let msg = match self.occupancy.claim(from, &entity, &slot, nonce) {
                    ClaimDecision::Granted(state) => SignalMessage::ClaimGranted(ClaimGranted {
                        entity,
                        slot,
                        nonce,
                        state,
                    }),
                    ClaimDecision::Denied(reason) => SignalMessage::ClaimDenied(ClaimDenied {
                        entity,
                        slot,
                        nonce,
                        reason,
                    }),
                };
                out.push(reply(msg));
            }
            SignalMessage::ReleaseEntity(ReleaseEntity {
                entity,
                slot,
                pose,
                nonce,
            }) => {
                self.occupancy.release(from, &entity, &slot, nonce, pose);
                out.push(reply(SignalMessage::ReleaseAck(ReleaseAck {
                    entity,
                    slot,
                    nonce,
                })));
            }
            SignalMessage::QueryClaimState(q) => {
                let claimed_by = self.occupancy.query(&q.entity, &q.slot).cloned();
                out.push(reply(SignalMessage::ClaimState(ClaimState {
                    entity: q.entity,
                    slot: q.slot,
                    claimed_by,
                })));
            }

            SignalMessage::Ping(ping) => {
                out.push(reply(SignalMessage::Pong(Pong { nonce: ping.nonce })));
            }
            SignalMessage::Pong(_) => {}

            other @ (SignalMessage::RegionUpdate(_)
            | SignalMessage::ClaimGranted(_)
            | SignalMessage::ClaimDenied(_)
            | SignalMessage::ReleaseAck(_)
            | SignalMessage::ClaimState(_)) => {
                tracing::warn!("ignoring relay-only message from {from}: {other:?}");
            }
        }
        out
    }

    fn forward(
        &self,
        from: &PeerId,
        mut payload: SignalPayload,
        wrap: fn(SignalPayload) -> SignalMessage,
        out: &mut Vec<Outbound>,
    ) {
        if !self.locations.contains_key(&payload.recipient) {
            tracing::debug!("dropping signal from {from} to unknown {}", payload.recipient);
            return;
        }
        payload.sender = from.clone();
        out.push(Outbound {
            to: payload.recipient.clone(),
            msg: wrap(payload),
        });
    }

    /// A peer's session ended: leave its region and free its slots.
    pub fn disconnect(&mut self, peer: &PeerId) -> Vec<Outbound> {
        let mut out = Vec::new();
        if let Some(region) = self.leave_region(peer) {
            self.region_update(region, &mut out);
        }
        self.occupancy.release_all_for(peer);
        out
    }
}
