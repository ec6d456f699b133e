//! Tidemesh relay: the signaling server and sole claim arbiter.
//!
//! - [`hub`]: the single task owning [`tidemesh_sync::RelayState`].
//! - [`server`]: TCP accept loop and per-connection framing.

pub mod hub;
pub mod server;

pub use hub::{ConnectionId, Hub, HubCommand};
pub use server::{RelayError, RelayServer, ServerConfig};
