//! Sans-IO synchronization core for tidemesh.
//!
//! Every type here is driven by explicit inputs and an explicit `now`; none
//! of them own a socket or a timer. The client runtime and the relay server
//! feed them from their event loops.
//!
//! - [`region`]: grid cell membership and proximity sets.
//! - [`mesh`]: which peer links should exist, with staggered connects and
//!   bounded retries.
//! - [`claim`]: relay-arbitrated claims and releases with reconciliation.
//! - [`control`]: per-entity control state and host bindings.
//! - [`session`]: one client wired together.
//! - [`relay`]: the relay's authoritative occupancy table and routing.

pub mod claim;
pub mod control;
pub mod entity;
pub mod mesh;
pub mod region;
pub mod relay;
pub mod remote_pose;
pub mod roster;
pub mod session;

#[cfg(test)]
mod simulation_tests;

pub use claim::{
    ClaimCoordinator, ClaimError, ClaimOptions, ClaimOutcome, ClaimPhase, ClaimRequest,
    ClaimResolution,
};
pub use control::{
    ControlBinding, ControlBindings, ControlError, EntityControlState, EntityControlStateMachine,
    PoseBroadcaster,
};
pub use entity::{ControllableEntity, EntityCategory, EntityRegistry};
pub use mesh::{LinkState, MeshEvent, MeshOptions, Peer, PeerMeshManager};
pub use region::{ProximityUpdate, RegionChange, RegionMembership};
pub use relay::{ClaimDecision, OccupancyTable, Outbound, RelayState};
pub use remote_pose::{RemotePoses, lerp_pose};
pub use roster::{CrewRoster, Occupant};
pub use session::{
    ClientSession, RejectReason, SessionError, SessionEvent, SessionInput, SessionOptions,
};
