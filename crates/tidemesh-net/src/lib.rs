//! Wire protocol and socket plumbing for tidemesh.
//!
//! - [`ids`] and [`messages`]: identifiers and the enveloped, versioned
//!   message families for signaling and peer links.
//! - [`framing`]: length-prefixed frames over any `AsyncRead`/`AsyncWrite`.
//! - [`signaling`]: the reconnecting relay connection.
//! - [`peer_link`]: direct TCP links between peers.

pub mod framing;
pub mod ids;
pub mod messages;
pub mod peer_link;
pub mod reconnection;
pub mod signaling;

pub use framing::{FrameConfig, FrameError, read_frame, read_message, write_frame, write_message};
pub use ids::{EntityId, Nonce, PeerId, Pose, RegionId, SlotName, SubjectId};
pub use messages::{
    ClaimDenied, ClaimEntity, ClaimGranted, ClaimState, DenyReason, EntitySnapshot, GameEvent,
    JoinRegion, MessageError, PROTOCOL_VERSION, PeerMessage, Ping, Pong, PoseSync,
    QueryClaimState, RegionUpdate, ReleaseAck, ReleaseEntity, SignalMessage, SignalPayload,
    SlotOccupant, SlotOccupied, SlotVacated, SyncSnapshot, WireMessage,
};
pub use peer_link::{DirectLinkBackend, LinkError, LinkEvent, LinkEventKind, PeerTransport};
pub use reconnection::{RetryPolicy, RetryState};
pub use signaling::{
    ConnectionState, DisconnectCode, SignalSink, SignalingChannel,
    SignalingEvent, SignalingHandle, SignalingOptions,
};
