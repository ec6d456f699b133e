//! Identifiers and pose types shared by every message on the wire.

use std::fmt;

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Globally unique participant id, stable for a session.
///
/// Ordering is byte-wise on the string; the lower id of any pair initiates
/// the direct link between them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a peer id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a random id for sessions started without a configured one.
    pub fn random() -> Self {
        Self(format!("peer-{:016x}", rand::random::<u64>()))
    }

    /// `true` if this side opens the direct link to `other`.
    pub fn initiates_with(&self, other: &PeerId) -> bool {
        self < other
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable id of a shared world object, assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    /// Create an entity id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named seat or role on a controllable entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotName(pub String);

impl SlotName {
    /// The driving slot of multi-seat entities.
    pub const PILOT: &'static str = "pilot";

    /// Create a slot name from anything string-like.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The `pilot` slot.
    pub fn pilot() -> Self {
        Self(Self::PILOT.to_string())
    }

    /// Borrow the raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A square region (chunk) of the world, in chunk coordinates on the
/// horizontal plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId {
    /// Chunk X.
    pub x: i32,
    /// Chunk Z.
    pub z: i32,
}

impl RegionId {
    /// Create a region id from chunk coordinates.
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The region containing `position`, for square regions of
    /// `region_size` world units. Non-positive sizes collapse to region 0,0.
    pub fn from_position(position: Vec3, region_size: f32) -> Self {
        if region_size <= 0.0 {
            return Self::new(0, 0);
        }
        Self {
            x: (position.x / region_size).floor() as i32,
            z: (position.z / region_size).floor() as i32,
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.x, self.z)
    }
}

/// Idempotency key for claims and releases. Resends reuse the same nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Nonce(pub u64);

impl Nonce {
    /// A fresh random nonce.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Position and heading of a player or entity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    /// World-space position.
    pub position: Vec3,
    /// Heading around the vertical axis, radians.
    pub heading: f32,
}

impl Pose {
    /// Create a pose.
    pub fn new(position: Vec3, heading: f32) -> Self {
        Self { position, heading }
    }
}

/// What a pose sample describes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubjectId {
    /// A participant's own avatar.
    Player(PeerId),
    /// A shared entity.
    Entity(EntityId),
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Player(peer) => write!(f, "player/{peer}"),
            Self::Entity(entity) => write!(f, "entity/{entity}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_peer_id_initiates() {
        let a = PeerId::new("alice");
        let b = PeerId::new("bob");
        assert!(a.initiates_with(&b));
        assert!(!b.initiates_with(&a));
        assert!(!a.initiates_with(&a));
    }

    #[test]
    fn test_region_from_position_floors_negative() {
        let region = RegionId::from_position(Vec3::new(-1.0, 50.0, 130.0), 64.0);
        assert_eq!(region, RegionId::new(-1, 2));
        let origin = RegionId::from_position(Vec3::new(0.0, 0.0, 63.9), 64.0);
        assert_eq!(origin, RegionId::new(0, 0));
    }

    #[test]
    fn test_region_zero_size_collapses() {
        let region = RegionId::from_position(Vec3::new(500.0, 0.0, 500.0), 0.0);
        assert_eq!(region, RegionId::new(0, 0));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
        assert_ne!(Nonce::random(), Nonce::random());
    }

    #[test]
    fn test_subject_display() {
        let subject = SubjectId::Entity(EntityId::new("boat_7"));
        assert_eq!(subject.to_string(), "entity/boat_7");
    }

    #[test]
    fn test_pose_json_shape() {
        let pose = Pose::new(Vec3::new(1.0, 2.0, 3.0), 0.5);
        let json = serde_json::to_string(&pose).unwrap();
        let back: Pose = serde_json::from_str(&json).unwrap();
        assert_eq!(pose, back);
    }
}
