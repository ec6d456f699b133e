//! Network message types and serialization.
//!
//! Two message families travel on two transports:
//!
//! - [`SignalMessage`]: client ⇄ relay over the signaling channel (reliable,
//!   ordered, authoritative for claims).
//! - [`PeerMessage`]: client ⇄ client over direct peer links (best-effort,
//!   ordered per peer only).
//!
//! Every message is wrapped in an [`Envelope`] naming its type as a string,
//! serialized with [`postcard`], and prefixed with a protocol version byte:
//!
//! ```text
//! [version: u8] [postcard(Envelope { kind: String, body: Vec<u8> })]
//! ```
//!
//! The string tag lets a receiver skip a message type it does not know
//! (a newer peer or relay) without losing the stream.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::ids::{EntityId, Nonce, PeerId, Pose, RegionId, SlotName, SubjectId};

/// Current wire-protocol version. Prepended to every serialized message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Type tag plus opaque body. The body is the postcard encoding of the
/// payload struct named by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Message type, e.g. `"claim_entity"`.
    pub kind: String,
    /// Postcard-encoded payload.
    pub body: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Signaling messages
// ---------------------------------------------------------------------------

/// Messages exchanged with the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SignalMessage {
    // --- Membership ---
    /// Client announces the region it now occupies.
    JoinRegion(JoinRegion),
    /// Relay publishes the full member list of a region.
    RegionUpdate(RegionUpdate),

    // --- Peer-link handshake pass-through ---
    /// Initiator's connection offer.
    SignalOffer(SignalPayload),
    /// Responder's answer.
    SignalAnswer(SignalPayload),
    /// Connectivity candidate, either direction.
    SignalCandidate(SignalPayload),

    // --- Claims ---
    /// Request exclusive occupancy of a slot.
    ClaimEntity(ClaimEntity),
    /// Relay granted the claim.
    ClaimGranted(ClaimGranted),
    /// Relay denied the claim.
    ClaimDenied(ClaimDenied),
    /// Give up a held slot.
    ReleaseEntity(ReleaseEntity),
    /// Relay processed the release.
    ReleaseAck(ReleaseAck),
    /// Ask who holds a slot (reconciliation after a lost response).
    QueryClaimState(QueryClaimState),
    /// Answer to [`SignalMessage::QueryClaimState`].
    ClaimState(ClaimState),

    // --- System ---
    /// Heartbeat ping.
    Ping(Ping),
    /// Heartbeat pong.
    Pong(Pong),
}

/// Client joins (or moves to) a region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRegion {
    /// Region being joined.
    pub region: RegionId,
    /// The joining client.
    pub peer_id: PeerId,
}

/// Full membership of one region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionUpdate {
    /// Region described.
    pub region: RegionId,
    /// Every peer currently in the region, the recipient included.
    pub peers: Vec<PeerId>,
}

/// Opaque handshake payload addressed to one peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalPayload {
    /// Peer the relay forwards this to.
    pub recipient: PeerId,
    /// Peer that produced it.
    pub sender: PeerId,
    /// Transport-specific bytes, never inspected by the relay.
    pub payload: Vec<u8>,
}

/// Claim request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimEntity {
    /// Target entity.
    pub entity: EntityId,
    /// Target slot.
    pub slot: SlotName,
    /// Idempotency key; resends reuse it.
    pub nonce: Nonce,
}

/// One occupied slot as seen by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotOccupant {
    /// Slot name.
    pub slot: SlotName,
    /// Current holder.
    pub peer: PeerId,
}

/// Relay-side state of an entity handed to a new controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
    /// Pose stored by the last release, if any.
    pub last_pose: Option<Pose>,
    /// All occupied slots of the entity, the granted one included.
    pub occupants: Vec<SlotOccupant>,
}

/// Claim granted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimGranted {
    /// Entity claimed.
    pub entity: EntityId,
    /// Slot claimed.
    pub slot: SlotName,
    /// Nonce of the request being answered.
    pub nonce: Nonce,
    /// Entity state at grant time.
    pub state: EntitySnapshot,
}

/// Why the relay denied a claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DenyReason {
    /// Someone else holds the slot.
    Occupied {
        /// The holder.
        by: PeerId,
    },
    /// The requester already holds another slot of this entity.
    AlreadySeated {
        /// The slot already held.
        slot: SlotName,
    },
    /// The relay does not know the entity.
    UnknownEntity,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Occupied { by } => write!(f, "that seat is taken by {by}"),
            Self::AlreadySeated { slot } => {
                write!(f, "you are already in the {slot} seat; leave it first")
            }
            Self::UnknownEntity => f.write_str("that object no longer exists"),
        }
    }
}

/// Claim denied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimDenied {
    /// Entity requested.
    pub entity: EntityId,
    /// Slot requested.
    pub slot: SlotName,
    /// Nonce of the request being answered.
    pub nonce: Nonce,
    /// Reason shown to the user.
    pub reason: DenyReason,
}

/// Release of a held slot, carrying the final pose.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseEntity {
    /// Entity released.
    pub entity: EntityId,
    /// Slot released.
    pub slot: SlotName,
    /// Final pose, or `None` when the releaser never drove the entity
    /// (an abandoned grant). The relay keeps its stored pose on `None`.
    pub pose: Option<Pose>,
    /// Idempotency key; resends reuse it.
    pub nonce: Nonce,
}

/// Acknowledgement of a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseAck {
    /// Entity released.
    pub entity: EntityId,
    /// Slot released.
    pub slot: SlotName,
    /// Nonce of the release being acknowledged.
    pub nonce: Nonce,
}

/// Reconciliation query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryClaimState {
    /// Entity asked about.
    pub entity: EntityId,
    /// Slot asked about.
    pub slot: SlotName,
}

/// Reconciliation answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimState {
    /// Entity asked about.
    pub entity: EntityId,
    /// Slot asked about.
    pub slot: SlotName,
    /// Current holder, if any.
    pub claimed_by: Option<PeerId>,
}

/// Heartbeat ping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    /// Echoed back in the pong.
    pub nonce: u64,
}

/// Heartbeat pong (response to [`Ping`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pong {
    /// Nonce of the ping.
    pub nonce: u64,
}

// ---------------------------------------------------------------------------
// Peer messages
// ---------------------------------------------------------------------------

/// Messages exchanged directly between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PeerMessage {
    /// Latest pose of a player or entity.
    PoseSync(PoseSync),
    /// Advisory: sender holds a slot.
    SlotOccupied(SlotOccupied),
    /// Advisory: a slot became free.
    SlotVacated(SlotVacated),
    /// Snapshot sent once when a link opens.
    Sync(SyncSnapshot),
    /// Opaque gameplay event for the host application.
    GameEvent(GameEvent),
}

/// One pose sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoseSync {
    /// Player or entity described.
    pub subject: SubjectId,
    /// Pose at `timestamp_ms`.
    pub pose: Pose,
    /// Sender clock, milliseconds. Receivers drop samples older than the
    /// newest they have seen for the subject.
    pub timestamp_ms: u64,
}

/// Advisory occupied event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotOccupied {
    /// Entity.
    pub entity: EntityId,
    /// Slot.
    pub slot: SlotName,
    /// Occupant.
    pub peer: PeerId,
}

/// Advisory vacated event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotVacated {
    /// Entity.
    pub entity: EntityId,
    /// Slot.
    pub slot: SlotName,
}

/// Link-open snapshot so a new peer need not wait for the next broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSnapshot {
    /// Sender of the snapshot.
    pub sender: PeerId,
    /// Sender's avatar pose plus the poses of every entity it drives.
    pub poses: Vec<PoseSync>,
    /// Slots the sender holds.
    pub occupied: Vec<SlotOccupied>,
}

/// Gameplay event riding the peer channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameEvent {
    /// Application-defined event type.
    pub kind: String,
    /// Application-defined bytes.
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during message (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The envelope names a message type this build does not know.
    #[error("unknown message type: {0}")]
    UnknownKind(String),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

impl MessageError {
    /// `true` for errors a receiver skips silently-ish (logged, not fatal).
    pub fn is_forward_compatible(&self) -> bool {
        matches!(self, Self::UnknownKind(_))
    }
}

// ---------------------------------------------------------------------------
// Envelope codec
// ---------------------------------------------------------------------------

/// A message family that can be carried in an [`Envelope`].
pub trait WireMessage: Sized {
    /// Type tag written into the envelope.
    fn kind(&self) -> &'static str;

    /// Postcard encoding of the payload struct.
    fn encode_body(&self) -> Result<Vec<u8>, postcard::Error>;

    /// Rebuild a message from its tag and body.
    fn decode_body(kind: &str, body: &[u8]) -> Result<Self, MessageError>;
}

fn body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
    Ok(postcard::from_bytes(bytes)?)
}

impl WireMessage for SignalMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::JoinRegion(_) => "join_region",
            Self::RegionUpdate(_) => "region_update",
            Self::SignalOffer(_) => "signal_offer",
            Self::SignalAnswer(_) => "signal_answer",
            Self::SignalCandidate(_) => "signal_candidate",
            Self::ClaimEntity(_) => "claim_entity",
            Self::ClaimGranted(_) => "claim_granted",
            Self::ClaimDenied(_) => "claim_denied",
            Self::ReleaseEntity(_) => "release_entity",
            Self::ReleaseAck(_) => "release_ack",
            Self::QueryClaimState(_) => "query_claim_state",
            Self::ClaimState(_) => "claim_state",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, postcard::Error> {
        match self {
            Self::JoinRegion(m) => postcard::to_allocvec(m),
            Self::RegionUpdate(m) => postcard::to_allocvec(m),
            Self::SignalOffer(m) | Self::SignalAnswer(m) | Self::SignalCandidate(m) => {
                postcard::to_allocvec(m)
            }
            Self::ClaimEntity(m) => postcard::to_allocvec(m),
            Self::ClaimGranted(m) => postcard::to_allocvec(m),
            Self::ClaimDenied(m) => postcard::to_allocvec(m),
            Self::ReleaseEntity(m) => postcard::to_allocvec(m),
            Self::ReleaseAck(m) => postcard::to_allocvec(m),
            Self::QueryClaimState(m) => postcard::to_allocvec(m),
            Self::ClaimState(m) => postcard::to_allocvec(m),
            Self::Ping(m) => postcard::to_allocvec(m),
            Self::Pong(m) => postcard::to_allocvec(m),
        }
    }

    fn decode_body(kind: &str, bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(match kind {
            "join_region" => Self::JoinRegion(body(bytes)?),
            "region_update" => Self::RegionUpdate(body(bytes)?),
            "signal_offer" => Self::SignalOffer(body(bytes)?),
            "signal_answer" => Self::SignalAnswer(body(bytes)?),
            "signal_candidate" => Self::SignalCandidate(body(bytes)?),
            "claim_entity" => Self::ClaimEntity(body(bytes)?),
            "claim_granted" => Self::ClaimGranted(body(bytes)?),
            "claim_denied" => Self::ClaimDenied(body(bytes)?),
            "release_entity" => Self::ReleaseEntity(body(bytes)?),
            "release_ack" => Self::ReleaseAck(body(bytes)?),
            "query_claim_state" => Self::QueryClaimState(body(bytes)?),
            "claim_state" => Self::ClaimState(body(bytes)?),
            "ping" => Self::Ping(body(bytes)?),
            "pong" => Self::Pong(body(bytes)?),
            other => return Err(MessageError::UnknownKind(other.to_string())),
        })
    }
}

impl WireMessage for PeerMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::PoseSync(_) => "pose_sync",
            Self::SlotOccupied(_) => "slot_occupied",
            Self::SlotVacated(_) => "slot_vacated",
            Self::Sync(_) => "sync",
            Self::GameEvent(_) => "game_event",
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, postcard::Error> {
        match self {
            Self::PoseSync(m) => postcard::to_allocvec(m),
            Self::SlotOccupied(m) => postcard::to_allocvec(m),
            Self::SlotVacated(m) => postcard::to_allocvec(m),
            Self::Sync(m) => postcard::to_allocvec(m),
            Self::GameEvent(m) => postcard::to_allocvec(m),
        }
    }

    fn decode_body(kind: &str, bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(match kind {
            "pose_sync" => Self::PoseSync(body(bytes)?),
            "slot_occupied" => Self::SlotOccupied(body(bytes)?),
            "slot_vacated" => Self::SlotVacated(body(bytes)?),
            "sync" => Self::Sync(body(bytes)?),
            "game_event" => Self::GameEvent(body(bytes)?),
            other => return Err(MessageError::UnknownKind(other.to_string())),
        })
    }
}

/// Serialize a message into a versioned, enveloped binary payload.
pub fn encode<M: WireMessage>(msg: &M) -> Result<Vec<u8>, MessageError> {
    let envelope = Envelope {
        kind: msg.kind().to_string(),
        body: msg.encode_body()?,
    };
    let encoded = postcard::to_allocvec(&envelope)?;
    let mut out = Vec::with_capacity(1 + encoded.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&encoded);
    Ok(out)
}

/// Deserialize a versioned, enveloped payload.
///
/// An unknown `kind` yields [`MessageError::UnknownKind`]; callers log and
/// skip it.
pub fn decode<M: WireMessage>(data: &[u8]) -> Result<M, MessageError> {
    let (&version, rest) = data.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    let envelope: Envelope = postcard::from_bytes(rest)?;
    M::decode_body(&envelope.kind, &envelope.body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn claim() -> SignalMessage {
        SignalMessage::ClaimEntity(ClaimEntity {
            entity: EntityId::new("boat_7"),
            slot: SlotName::pilot(),
            nonce: Nonce(42),
        })
    }

    #[test]
    fn test_claim_roundtrip() {
        let msg = claim();
        let bytes = encode(&msg).unwrap();
        let decoded: SignalMessage = decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_grant_carries_snapshot() {
        let msg = SignalMessage::ClaimGranted(ClaimGranted {
            entity: EntityId::new("ship_1"),
            slot: SlotName::new("gunnerPort"),
            nonce: Nonce(7),
            state: EntitySnapshot {
                last_pose: Some(Pose::new(Vec3::new(10.0, 0.0, -4.0), 1.5)),
                occupants: vec![SlotOccupant {
                    slot: SlotName::pilot(),
                    peer: PeerId::new("carol"),
                }],
            },
        });
        let decoded: SignalMessage = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_kind_tags_match_protocol_names() {
        assert_eq!(claim().kind(), "claim_entity");
        let query = SignalMessage::QueryClaimState(QueryClaimState {
            entity: EntityId::new("boat_7"),
            slot: SlotName::pilot(),
        });
        assert_eq!(query.kind(), "query_claim_state");
        let vacated = PeerMessage::SlotVacated(SlotVacated {
            entity: EntityId::new("boat_7"),
            slot: SlotName::pilot(),
        });
        assert_eq!(vacated.kind(), "slot_vacated");
    }

    #[test]
    fn test_unknown_kind_is_forward_compatible() {
        let envelope = Envelope {
            kind: "weather_report".to_string(),
            body: vec![1, 2, 3],
        };
        let mut bytes = vec![PROTOCOL_VERSION];
        bytes.extend(postcard::to_allocvec(&envelope).unwrap());

        let err = decode::<SignalMessage>(&bytes).unwrap_err();
        assert!(matches!(err, MessageError::UnknownKind(ref k) if k == "weather_report"));
        assert!(err.is_forward_compatible());
    }

    #[test]
    fn test_peer_message_not_decodable_as_signal() {
        let msg = PeerMessage::GameEvent(GameEvent {
            kind: "cannon_fired".to_string(),
            payload: vec![9],
        });
        let bytes = encode(&msg).unwrap();
        assert!(matches!(
            decode::<SignalMessage>(&bytes),
            Err(MessageError::UnknownKind(_))
        ));
        let back: PeerMessage = decode(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_sync_snapshot_roundtrip() {
        let peer = PeerId::new("alice");
        let msg = PeerMessage::Sync(SyncSnapshot {
            sender: peer.clone(),
            poses: vec![PoseSync {
                subject: SubjectId::Player(peer.clone()),
                pose: Pose::new(Vec3::new(1.0, 2.0, 3.0), 0.25),
                timestamp_ms: 1_000,
            }],
            occupied: vec![SlotOccupied {
                entity: EntityId::new("horse_2"),
                slot: SlotName::new("rider"),
                peer,
            }],
        });
        let back: PeerMessage = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut bytes = encode(&claim()).unwrap();
        bytes[0] = 255;
        assert!(matches!(
            decode::<SignalMessage>(&bytes),
            Err(MessageError::UnsupportedVersion(255))
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            decode::<SignalMessage>(&[]),
            Err(MessageError::EmptyPayload)
        ));
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let result = decode::<SignalMessage>(&[PROTOCOL_VERSION, 0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn test_version_byte_is_first_byte() {
        let bytes = encode(&SignalMessage::Ping(Ping { nonce: 1 })).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
    }

    #[test]
    fn test_deny_reason_is_human_readable() {
        let reason = DenyReason::Occupied {
            by: PeerId::new("bob"),
        };
        assert_eq!(reason.to_string(), "that seat is taken by bob");
    }
}
