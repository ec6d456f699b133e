//! Claim/release protocol for shared movable entities.
//!
//! The relay is the only authority on who occupies a slot. This side keeps
//! one pending request per slot, each with a single deadline:
//!
//! ```text
//!   claim ──send──▶ AwaitingResponse ──grant──▶ held
//!                        │  └──deny──▶ (discarded, Denied)
//!                   claim timeout
//!                        ▼
//!                   Reconciling ──claim_state(us)──▶ held (was_late)
//!                        └──other / timeout──▶ (discarded, TimedOut)
//! ```
//!
//! Releases are sent before local exclusive state is torn down and kept
//! until acknowledged, so they can be resent with the same nonce after a
//! reconnect. Every asynchronous result lands in an outbox drained with
//! [`ClaimCoordinator::drain`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tidemesh_config::ClaimConfig;
use tidemesh_net::{
    ClaimEntity, DenyReason, EntityId, EntitySnapshot, Nonce, PeerId, Pose, QueryClaimState,
    ReleaseEntity, SignalMessage, SignalSink, SlotName, SlotOccupant,
};

type SlotKey = (EntityId, SlotName);

fn key(entity: &EntityId, slot: &SlotName) -> SlotKey {
    (entity.clone(), slot.clone())
}

// ---------------------------------------------------------------------------
// Options, errors, outcomes
// ---------------------------------------------------------------------------

/// Protocol bounds.
#[derive(Debug, Clone)]
pub struct ClaimOptions {
    /// Window for a grant or denial.
    pub claim_timeout: Duration,
    /// Window for the reconciliation answer.
    pub query_timeout: Duration,
    /// Window for a release acknowledgement.
    pub release_ack_timeout: Duration,
    /// Resends of an unacknowledged release.
    pub max_release_resends: u32,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self::from(&ClaimConfig::default())
    }
}

impl From<&ClaimConfig> for ClaimOptions {
    fn from(config: &ClaimConfig) -> Self {
        Self {
            claim_timeout: config.claim_timeout(),
            query_timeout: config.query_timeout(),
            release_ack_timeout: config.release_ack_timeout(),
            max_release_resends: config.max_release_resends,
        }
    }
}

/// Synchronous refusal of a claim or release.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    /// The signaling channel is not open.
    #[error("not connected to the relay")]
    ChannelDown,
    /// A claim for this slot is already in flight.
    #[error("a claim for {entity}/{slot} is already pending")]
    AlreadyPending {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
    },
    /// The slot is already held locally.
    #[error("{entity}/{slot} is already held")]
    AlreadyHeld {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
    },
    /// The entity is not in the known world.
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    /// The entity has no such seat.
    #[error("{entity} has no slot {slot}")]
    UnknownSlot {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
    },
    /// The entity is outside the local region.
    #[error("{0} is not in your region")]
    OutOfRegion(EntityId),
    /// Release of a slot that is not held.
    #[error("{entity}/{slot} is not held")]
    NotHeld {
        /// Entity.
        entity: EntityId,
        /// Slot.
        slot: SlotName,
    },
}

/// Where a pending request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPhase {
    /// Waiting for a grant or denial.
    AwaitingResponse,
    /// Claim window passed; waiting for `claim_state`.
    Reconciling,
}

/// An in-flight attempt to occupy a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    /// Target entity.
    pub entity: EntityId,
    /// Target slot.
    pub slot: SlotName,
    /// Local peer.
    pub requester: PeerId,
    /// Idempotency key.
    pub nonce: Nonce,
    /// When the claim was sent.
    pub issued_at: Instant,
}

/// Asynchronous result of a claim or release.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The slot is ours. `was_late` when confirmed by reconciliation.
    Granted {
        /// Confirmed by `claim_state` rather than a grant.
        was_late: bool,
        /// Relay state handed over with the grant.
        state: EntitySnapshot,
    },
    /// The relay said no.
    Denied {
        /// Why.
        reason: DenyReason,
    },
    /// No grant and reconciliation did not confirm one (fail closed).
    TimedOut,
    /// A grant arrived for a cancelled or unknown request and was released.
    AbandonedGrantReleased,
    /// The relay no longer has us holding a slot we believed we held, either
    /// because someone else does or because it freed the slot.
    Revoked {
        /// Holder according to the relay.
        holder: Option<PeerId>,
    },
    /// The release left for the relay; local exclusive state may go.
    Released,
    /// The relay acknowledged the release.
    ReleaseAcknowledged,
    /// The release was never acknowledged and was given up.
    ReleaseUnconfirmed,
}

/// One outcome for one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimResolution {
    /// Entity.
    pub entity: EntityId,
    /// Slot.
    pub slot: SlotName,
    /// What happened.
    pub outcome: ClaimOutcome,
}

// ---------------------------------------------------------------------------
// Internal records
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingClaim {
    request: ClaimRequest,
    phase: ClaimPhase,
    deadline: Instant,
    cancelled: bool,
}

#[derive(Debug)]
struct OutgoingRelease {
    msg: ReleaseEntity,
    /// Written on the current connection.
    sent: bool,
    /// `Released` already reported.
    announced: bool,
    /// No outcomes for abandoned grants.
    silent: bool,
    deadline: Option<Instant>,
    resends: u32,
}

// ---------------------------------------------------------------------------
// ClaimCoordinator
// ---------------------------------------------------------------------------

/// Client side of the claim/release protocol.
pub struct ClaimCoordinator {
    local: PeerId,
    options: ClaimOptions,
    pending: BTreeMap<SlotKey, PendingClaim>,
    held: BTreeMap<SlotKey, Nonce>,
    releases: BTreeMap<SlotKey, OutgoingRelease>,
    verifying: BTreeSet<SlotKey>,
    outbox: Vec<ClaimResolution>,
}

impl ClaimCoordinator {
    /// Create a coordinator for `local`.
    pub fn new(local: PeerId, options: ClaimOptions) -> Self {
        Self {
            local,
            options,
            pending: BTreeMap::new(),
            held: BTreeMap::new(),
            releases: BTreeMap::new(),
            verifying: BTreeSet::new(),
            outbox: Vec::new(),
        }
    }

    /// Take every outcome produced since the last drain.
    pub fn drain(&mut self) -> Vec<ClaimResolution> {
        std::mem::take(&mut self.outbox)
    }

    fn resolve(&mut self, (entity, slot): SlotKey, outcome: ClaimOutcome) {
        self.outbox.push(ClaimResolution {
            entity,
            slot,
            outcome,
        });
    }

    // --- queries ---

    /// `true` if the slot is held locally.
    pub fn is_held(&self, entity: &EntityId, slot: &SlotName) -> bool {
        self.held.contains_key(&key(entity, slot))
    }

    /// Every held slot.
    pub fn held_slots(&self) -> impl Iterator<Item = (&EntityId, &SlotName)> {
        self.held.keys().map(|(e, s)| (e, s))
    }

    /// The active (not cancelled) request for a slot.
    pub fn pending_request(&self, entity: &EntityId, slot: &SlotName) -> Option<&ClaimRequest> {
        self.pending
            .get(&key(entity, slot))
            .filter(|p| !p.cancelled)
            .map(|p| &p.request)
    }

    /// Phase of the active request for a slot.
    pub fn pending_phase(&self, entity: &EntityId, slot: &SlotName) -> Option<ClaimPhase> {
        self.pending
            .get(&key(entity, slot))
            .filter(|p| !p.cancelled)
            .map(|p| p.phase)
    }

    /// `true` while a release of the slot awaits its acknowledgement.
    pub fn release_in_flight(&self, entity: &EntityId, slot: &SlotName) -> bool {
        self.releases.contains_key(&key(entity, slot))
    }

    // --- user operations ---

    /// Send a claim. The result arrives later as an outcome.
    pub fn claim(
        &mut self,
        entity: &EntityId,
        slot: &SlotName,
        now: Instant,
        signal: &mut impl SignalSink,
    ) -> Result<Nonce, ClaimError> {
        if !signal.is_open() {
            return Err(ClaimError::ChannelDown);
        }
        let k = key(entity, slot);
        if self.pending.get(&k).is_some_and(|p| !p.cancelled) {
            return Err(ClaimError::AlreadyPending {
                entity: entity.clone(),
                slot: slot.clone(),
            });
        }
        if self.held.contains_key(&k) {
            return Err(ClaimError::AlreadyHeld {
                entity: entity.clone(),
                slot: slot.clone(),
            });
        }

        let nonce = Nonce::random();
        let msg = SignalMessage::ClaimEntity(ClaimEntity {
            entity: entity.clone(),
            slot: slot.clone(),
            nonce,
        });
        if !signal.send(msg) {
            return Err(ClaimError::ChannelDown);
        }

        tracing::debug!("claiming {entity}/{slot} (nonce {nonce})");
        self.pending.insert(
            k,
            PendingClaim {
                request: ClaimRequest {
                    entity: entity.clone(),
                    slot: slot.clone(),
                    requester: self.local.clone(),
                    nonce,
                    issued_at: now,
                },
                phase: ClaimPhase::AwaitingResponse,
                deadline: now + self.options.claim_timeout,
                cancelled: false,
            },
        );
        Ok(nonce)
    }

    /// Abandon a pending claim. A grant that still arrives for it is
    /// released immediately. Returns `false` if nothing was pending.
    pub fn cancel(&mut self, entity: &EntityId, slot: &SlotName) -> bool {
        match self.pending.get_mut(&key(entity, slot)) {
            Some(p) if !p.cancelled => {
                tracing::debug!("cancelled claim for {entity}/{slot}");
                p.cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Release a held slot with the entity's final pose.
    ///
    /// The release is sent now if the channel is open, otherwise as soon as
    /// it reopens. [`ClaimOutcome::Released`] is reported once it is sent.
    pub fn release(
        &mut self,
        entity: &EntityId,
        slot: &SlotName,
        pose: Option<Pose>,
        now: Instant,
        signal: &mut impl SignalSink,
    ) -> Result<Nonce, ClaimError> {
        let k = key(entity, slot);
        if self.held.remove(&k).is_none() {
            return Err(ClaimError::NotHeld {
                entity: entity.clone(),
                slot: slot.clone(),
            });
        }
        self.verifying.remove(&k);
        Ok(self.queue_release(k, pose, false, now, signal))
    }

    /// Ask the relay who holds a slot we hold. A different answer revokes it.
    pub fn verify(&mut self, entity: &EntityId, slot: &SlotName, signal: &mut impl SignalSink) {
        let k = key(entity, slot);
        if !self.held.contains_key(&k) {
            return;
        }
        let query = SignalMessage::QueryClaimState(QueryClaimState {
            entity: entity.clone(),
            slot: slot.clone(),
        });
        if signal.send(query) {
            self.verifying.insert(k);
        }
    }

    fn queue_release(
        &mut self,
        k: SlotKey,
        pose: Option<Pose>,
        silent: bool,
        now: Instant,
        signal: &mut impl SignalSink,
    ) -> Nonce {
        let nonce = Nonce::random();
        let msg = ReleaseEntity {
            entity: k.0.clone(),
            slot: k.1.clone(),
            pose,
            nonce,
        };
        self.releases.insert(
            k.clone(),
            OutgoingRelease {
                msg,
                sent: false,
                announced: false,
                silent,
                deadline: None,
                resends: 0,
            },
        );
        self.try_send_release(&k, now, signal);
        nonce
    }

    fn try_send_release(&mut self, k: &SlotKey, now: Instant, signal: &mut impl SignalSink) {
        let Some(release) = self.releases.get_mut(k) else {
            return;
        };
        if !signal.send(SignalMessage::ReleaseEntity(release.msg.clone())) {
            tracing::debug!("release of {}/{} deferred until reconnect", k.0, k.1);
            release.sent = false;
            return;
        }
        release.sent = true;
        release.deadline = Some(now + self.options.release_ack_timeout);
        if !release.announced {
            release.announced = true;
            if !release.silent {
                self.resolve(k.clone(), ClaimOutcome::Released);
            }
        }
    }

    // --- inbound ---

    /// Handle a claim-related message from the relay. Other messages are
    /// ignored.
    pub fn handle_signal(&mut self, msg: &SignalMessage, now: Instant, signal: &mut impl SignalSink) {
        match msg {
            SignalMessage::ClaimGranted(grant) => {
                let k = key(&grant.entity, &grant.slot);
                if let Some(pending) = self.pending.remove(&k) {
                    if pending.cancelled {
                        tracing::info!("releasing grant for cancelled claim {}/{}", k.0, k.1);
                        self.queue_release(k.clone(), None, true, now, signal);
                        self.resolve(k, ClaimOutcome::AbandonedGrantReleased);
                    } else {
                        let was_late = pending.phase == ClaimPhase::Reconciling;
                        tracing::info!("claim granted for {}/{}", k.0, k.1);
                        self.held.insert(k.clone(), grant.nonce);
                        self.resolve(
                            k,
                            ClaimOutcome::Granted {
                                was_late,
                                state: grant.state.clone(),
                            },
                        );
                    }
                } else if self.held.contains_key(&k) {
                    tracing::debug!("duplicate grant for held {}/{}", k.0, k.1);
                } else {
                    tracing::warn!("unsolicited grant for {}/{}, releasing", k.0, k.1);
                    self.queue_release(k.clone(), None, true, now, signal);
                    self.resolve(k, ClaimOutcome::AbandonedGrantReleased);
                }
            }
            SignalMessage::ClaimDenied(denied) => {
                let k = key(&denied.entity, &denied.slot);
                let matches = self
                    .pending
                    .get(&k)
                    .is_some_and(|p| p.request.nonce == denied.nonce);
                if !matches {
                    tracing::debug!("stale denial for {}/{}", k.0, k.1);
                    return;
                }
                if let Some(pending) = self.pending.remove(&k)
                    && !pending.cancelled
                {
                    tracing::info!("claim denied for {}/{}: {}", k.0, k.1, denied.reason);
                    self.resolve(
                        k,
                        ClaimOutcome::Denied {
                            reason: denied.reason.clone(),
                        },
                    );
                }
            }
            SignalMessage::ReleaseAck(ack) => {
                let k = key(&ack.entity, &ack.slot);
                let matches = self.releases.get(&k).is_some_and(|r| r.msg.nonce == ack.nonce);
                if let Some(release) = matches.then(|| self.releases.remove(&k)).flatten()
                    && !release.silent
                {
                    self.resolve(k, ClaimOutcome::ReleaseAcknowledged);
                }
            }
            SignalMessage::ClaimState(state) => {
                let k = key(&state.entity, &state.slot);
                let ours = state.claimed_by.as_ref() == Some(&self.local);

                let reconciling = self
                    .pending
                    .get(&k)
                    .is_some_and(|p| p.phase == ClaimPhase::Reconciling);
                if reconciling && let Some(pending) = self.pending.remove(&k) {
                    match (ours, pending.cancelled) {
                        (true, true) => {
                            self.queue_release(k.clone(), None, true, now, signal);
                            self.resolve(k, ClaimOutcome::AbandonedGrantReleased);
                        }
                        (true, false) => {
                            tracing::info!("reconciliation confirms {}/{} is ours", k.0, k.1);
                            self.held.insert(k.clone(), pending.request.nonce);
                            let state = EntitySnapshot {
                                last_pose: None,
                                occupants: vec![SlotOccupant {
                                    slot: k.1.clone(),
                                    peer: self.local.clone(),
                                }],
                            };
                            self.resolve(k, ClaimOutcome::Granted { was_late: true, state });
                        }
                        (false, true) => {}
                        (false, false) => {
                            tracing::info!("reconciliation: {}/{} not ours, claim failed", k.0, k.1);
                            self.resolve(k, ClaimOutcome::TimedOut);
                        }
                    }
                    return;
                }

                if self.verifying.remove(&k) && !ours && self.held.remove(&k).is_some() {
                    match &state.claimed_by {
                        Some(holder) => tracing::error!(
                            "relay reports {holder} holding {}/{} which we control",
                            k.0,
                            k.1
                        ),
                        None => tracing::warn!("relay no longer holds {}/{} for us", k.0, k.1),
                    }
                    self.resolve(
                        k,
                        ClaimOutcome::Revoked {
                            holder: state.claimed_by.clone(),
                        },
                    );
                }
            }
            _ => {}
        }
    }

    // --- timers and connection lifecycle ---

    /// Advance deadlines: start reconciliation, fail closed, resend releases.
    pub fn tick(&mut self, now: Instant, signal: &mut impl SignalSink) {
        let expired: Vec<SlotKey> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            let Some(pending) = self.pending.get_mut(&k) else {
                continue;
            };
            if pending.phase == ClaimPhase::AwaitingResponse {
                let query = SignalMessage::QueryClaimState(QueryClaimState {
                    entity: k.0.clone(),
                    slot: k.1.clone(),
                });
                if signal.send(query) {
                    tracing::debug!("no answer for {}/{}, querying claim state", k.0, k.1);
                    pending.phase = ClaimPhase::Reconciling;
                    pending.deadline = now + self.options.query_timeout;
                    continue;
                }
            }
            let cancelled = pending.cancelled;
            self.pending.remove(&k);
            if !cancelled {
                tracing::warn!("claim for {}/{} timed out", k.0, k.1);
                self.resolve(k, ClaimOutcome::TimedOut);
            }
        }

        let keys: Vec<SlotKey> = self.releases.keys().cloned().collect();
        for k in keys {
            let Some(release) = self.releases.get_mut(&k) else {
                continue;
            };
            if !release.sent {
                if signal.is_open() {
                    self.try_send_release(&k, now, signal);
                }
                continue;
            }
            if release.deadline.is_some_and(|d| now < d) {
                continue;
            }
            if release.resends < self.options.max_release_resends {
                release.resends += 1;
                tracing::debug!("resending release of {}/{} ({})", k.0, k.1, release.resends);
                self.try_send_release(&k, now, signal);
            } else {
                tracing::warn!("release of {}/{} never acknowledged, dropping", k.0, k.1);
                let silent = release.silent;
                self.releases.remove(&k);
                if !silent {
                    self.resolve(k, ClaimOutcome::ReleaseUnconfirmed);
                }
            }
        }
    }

    /// The signaling channel (re)opened: resend outstanding releases with
    /// their original nonces and verify every held slot.
    pub fn on_connected(&mut self, now: Instant, signal: &mut impl SignalSink) {
        let keys: Vec<SlotKey> = self.releases.keys().cloned().collect();
        for k in keys {
            self.try_send_release(&k, now, signal);
        }
        let held: Vec<SlotKey> = self.held.keys().cloned().collect();
        for (entity, slot) in held {
            self.verify(&entity, &slot, signal);
        }
    }

    /// The signaling channel dropped. Releases are marked unsent.
    pub fn on_disconnected(&mut self) {
        for release in self.releases.values_mut() {
            release.sent = false;
        }
        self.verifying.clear();
    }

    /// Forget everything (terminal disconnect). Returns the slots that were
    /// held or pending.
    pub fn force_reset(&mut self) -> Vec<(EntityId, SlotName)> {
        let mut slots: Vec<SlotKey> = std::mem::take(&mut self.held).into_keys().collect();
        slots.extend(std::mem::take(&mut self.pending).into_keys());
        self.releases.clear();
        self.verifying.clear();
        self.outbox.clear();
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemesh_net::{ClaimDenied, ClaimGranted, ClaimState, ReleaseAck};

    #[derive(Default)]
    struct FakeSignal {
        sent: Vec<SignalMessage>,
        down: bool,
    }

    impl SignalSink for FakeSignal {
        fn send(&mut self, msg: SignalMessage) -> bool {
            if self.down {
                return false;
            }
            self.sent.push(msg);
            true
        }
        fn is_open(&self) -> bool {
            !self.down
        }
        fn set_greeting(&mut self, _: SignalMessage) {}
    }

    fn boat() -> EntityId {
        EntityId::new("boat_7")
    }

    fn coordinator() -> ClaimCoordinator {
        ClaimCoordinator::new(PeerId::new("alice"), ClaimOptions::default())
    }

    fn grant(nonce: Nonce) -> SignalMessage {
        SignalMessage::ClaimGranted(ClaimGranted {
            entity: boat(),
            slot: SlotName::pilot(),
            nonce,
            state: EntitySnapshot::default(),
        })
    }

    fn claim_state(holder: Option<&str>) -> SignalMessage {
        SignalMessage::ClaimState(ClaimState {
            entity: boat(),
            slot: SlotName::pilot(),
            claimed_by: holder.map(PeerId::new),
        })
    }

    fn outcomes(c: &mut ClaimCoordinator) -> Vec<ClaimOutcome> {
        c.drain().into_iter().map(|r| r.outcome).collect()
    }

    fn count_claims(signal: &FakeSignal) -> usize {
        signal
            .sent
            .iter()
            .filter(|m| matches!(m, SignalMessage::ClaimEntity(_)))
            .count()
    }

    #[test]
    fn test_claim_requires_open_channel() {
        let mut c = coordinator();
        let mut signal = FakeSignal {
            down: true,
            ..Default::default()
        };
        let result = c.claim(&boat(), &SlotName::pilot(), Instant::now(), &mut signal);
        assert_eq!(result, Err(ClaimError::ChannelDown));
        assert!(signal.sent.is_empty());
    }

    #[test]
    fn test_grant_makes_slot_held() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let now = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), now, &mut signal).unwrap();
        assert!(matches!(
            c.claim(&boat(), &SlotName::pilot(), now, &mut signal),
            Err(ClaimError::AlreadyPending { .. })
        ));

        c.handle_signal(&grant(nonce), now, &mut signal);
        assert!(c.is_held(&boat(), &SlotName::pilot()));
        assert_eq!(
            outcomes(&mut c),
            vec![ClaimOutcome::Granted {
                was_late: false,
                state: EntitySnapshot::default()
            }]
        );
        assert!(matches!(
            c.claim(&boat(), &SlotName::pilot(), now, &mut signal),
            Err(ClaimError::AlreadyHeld { .. })
        ));
    }

    #[test]
    fn test_denial_discards_request_without_retry() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let now = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), now, &mut signal).unwrap();
        let reason = DenyReason::Occupied {
            by: PeerId::new("bob"),
        };
        c.handle_signal(
            &SignalMessage::ClaimDenied(ClaimDenied {
                entity: boat(),
                slot: SlotName::pilot(),
                nonce,
                reason: reason.clone(),
            }),
            now,
            &mut signal,
        );
        assert_eq!(outcomes(&mut c), vec![ClaimOutcome::Denied { reason }]);
        assert!(c.pending_request(&boat(), &SlotName::pilot()).is_none());

        c.tick(now + Duration::from_secs(60), &mut signal);
        assert_eq!(count_claims(&signal), 1);
    }

    #[test]
    fn test_timeout_reconciles_to_late_grant() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let start = Instant::now();
        c.claim(&boat(), &SlotName::pilot(), start, &mut signal).unwrap();

        c.tick(start + Duration::from_secs(9), &mut signal);
        assert_eq!(c.pending_phase(&boat(), &SlotName::pilot()), Some(ClaimPhase::AwaitingResponse));

        c.tick(start + Duration::from_secs(10), &mut signal);
        assert_eq!(c.pending_phase(&boat(), &SlotName::pilot()), Some(ClaimPhase::Reconciling));
        assert!(matches!(
            signal.sent.last(),
            Some(SignalMessage::QueryClaimState(_))
        ));

        c.handle_signal(&claim_state(Some("alice")), start + Duration::from_secs(11), &mut signal);
        let out = outcomes(&mut c);
        assert!(matches!(out.as_slice(), [ClaimOutcome::Granted { was_late: true, .. }]));
        assert!(c.is_held(&boat(), &SlotName::pilot()));
        assert_eq!(count_claims(&signal), 1, "claim must never be resent");
    }

    #[test]
    fn test_reconciliation_fails_closed() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let start = Instant::now();
        c.claim(&boat(), &SlotName::pilot(), start, &mut signal).unwrap();
        c.tick(start + Duration::from_secs(10), &mut signal);

        // No answer within the query window.
        c.tick(start + Duration::from_secs(13), &mut signal);
        assert_eq!(outcomes(&mut c), vec![ClaimOutcome::TimedOut]);
        assert!(!c.is_held(&boat(), &SlotName::pilot()));
    }

    #[test]
    fn test_reconciliation_reports_other_holder() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let start = Instant::now();
        c.claim(&boat(), &SlotName::pilot(), start, &mut signal).unwrap();
        c.tick(start + Duration::from_secs(10), &mut signal);
        c.handle_signal(&claim_state(Some("bob")), start, &mut signal);
        assert_eq!(outcomes(&mut c), vec![ClaimOutcome::TimedOut]);
    }

    #[test]
    fn test_cancelled_claim_grant_is_released() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let now = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), now, &mut signal).unwrap();
        assert!(c.cancel(&boat(), &SlotName::pilot()));
        assert!(!c.cancel(&boat(), &SlotName::pilot()));

        c.handle_signal(&grant(nonce), now, &mut signal);
        assert_eq!(outcomes(&mut c), vec![ClaimOutcome::AbandonedGrantReleased]);
        assert!(!c.is_held(&boat(), &SlotName::pilot()));
        assert!(matches!(
            signal.sent.last(),
            Some(SignalMessage::ReleaseEntity(ReleaseEntity { pose: None, .. }))
        ));
    }

    #[test]
    fn test_unsolicited_grant_is_released() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        c.handle_signal(&grant(Nonce(99)), Instant::now(), &mut signal);
        assert_eq!(outcomes(&mut c), vec![ClaimOutcome::AbandonedGrantReleased]);
        assert_eq!(signal.sent.len(), 1);
    }

    #[test]
    fn test_duplicate_grant_ignored() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let now = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), now, &mut signal).unwrap();
        c.handle_signal(&grant(nonce), now, &mut signal);
        c.drain();
        c.handle_signal(&grant(nonce), now, &mut signal);
        assert!(c.drain().is_empty());
        assert!(c.is_held(&boat(), &SlotName::pilot()));
    }

    #[test]
    fn test_release_resend_reuses_nonce() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let now = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), now, &mut signal).unwrap();
        c.handle_signal(&grant(nonce), now, &mut signal);
        c.drain();

        let release_nonce = c
            .release(&boat(), &SlotName::pilot(), Some(Pose::default()), now, &mut signal)
            .unwrap();
        assert_eq!(outcomes(&mut c), vec![ClaimOutcome::Released]);

        c.on_disconnected();
        c.on_connected(now + Duration::from_secs(1), &mut signal);
        let nonces: Vec<Nonce> = signal
            .sent
            .iter()
            .filter_map(|m| match m {
                SignalMessage::ReleaseEntity(r) => Some(r.nonce),
                _ => None,
            })
            .collect();
        assert_eq!(nonces, vec![release_nonce, release_nonce]);
        assert!(c.drain().is_empty(), "Released is reported once");

        c.handle_signal(
            &SignalMessage::ReleaseAck(ReleaseAck {
                entity: boat(),
                slot: SlotName::pilot(),
                nonce: release_nonce,
            }),
            now,
            &mut signal,
        );
        assert_eq!(outcomes(&mut c), vec![ClaimOutcome::ReleaseAcknowledged]);
        assert!(!c.release_in_flight(&boat(), &SlotName::pilot()));
    }

    #[test]
    fn test_release_deferred_while_down() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let now = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), now, &mut signal).unwrap();
        c.handle_signal(&grant(nonce), now, &mut signal);
        c.drain();

        signal.down = true;
        c.release(&boat(), &SlotName::pilot(), None, now, &mut signal).unwrap();
        assert!(c.drain().is_empty());
        assert!(c.release_in_flight(&boat(), &SlotName::pilot()));

        signal.down = false;
        c.on_connected(now, &mut signal);
        assert_eq!(outcomes(&mut c), vec![ClaimOutcome::Released]);
    }

    #[test]
    fn test_unacknowledged_release_given_up() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let start = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), start, &mut signal).unwrap();
        c.handle_signal(&grant(nonce), start, &mut signal);
        c.release(&boat(), &SlotName::pilot(), None, start, &mut signal).unwrap();
        c.drain();

        for i in 1..=4 {
            c.tick(start + Duration::from_secs(5 * i), &mut signal);
        }
        let releases = signal
            .sent
            .iter()
            .filter(|m| matches!(m, SignalMessage::ReleaseEntity(_)))
            .count();
        assert_eq!(releases, 4, "one send plus three resends");
        assert_eq!(outcomes(&mut c), vec![ClaimOutcome::ReleaseUnconfirmed]);
    }

    #[test]
    fn test_release_of_unheld_slot_rejected() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let result = c.release(&boat(), &SlotName::pilot(), None, Instant::now(), &mut signal);
        assert!(matches!(result, Err(ClaimError::NotHeld { .. })));
    }

    #[test]
    fn test_verification_revokes_lost_slot() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let now = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), now, &mut signal).unwrap();
        c.handle_signal(&grant(nonce), now, &mut signal);
        c.drain();

        c.on_connected(now, &mut signal);
        c.handle_signal(&claim_state(Some("bob")), now, &mut signal);
        assert_eq!(
            outcomes(&mut c),
            vec![ClaimOutcome::Revoked {
                holder: Some(PeerId::new("bob"))
            }]
        );
        assert!(!c.is_held(&boat(), &SlotName::pilot()));
    }

    #[test]
    fn test_verification_confirming_holder_is_quiet() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let now = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), now, &mut signal).unwrap();
        c.handle_signal(&grant(nonce), now, &mut signal);
        c.drain();

        c.verify(&boat(), &SlotName::pilot(), &mut signal);
        c.handle_signal(&claim_state(Some("alice")), now, &mut signal);
        assert!(c.drain().is_empty());
        assert!(c.is_held(&boat(), &SlotName::pilot()));
    }

    #[test]
    fn test_force_reset_forgets_everything() {
        let mut c = coordinator();
        let mut signal = FakeSignal::default();
        let now = Instant::now();
        let nonce = c.claim(&boat(), &SlotName::pilot(), now, &mut signal).unwrap();
        c.handle_signal(&grant(nonce), now, &mut signal);
        c.claim(&EntityId::new("horse_2"), &SlotName::new("rider"), now, &mut signal)
            .unwrap();

        let slots = c.force_reset();
        assert_eq!(slots.len(), 2);
        assert_eq!(c.held_slots().count(), 0);
        assert!(c.drain().is_empty());
    }
}
