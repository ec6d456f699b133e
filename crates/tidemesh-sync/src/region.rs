//! Region membership: which chunk the local client and each peer occupy.
//!
//! The relay publishes the full member list of a region whenever it changes.
//! The local client's proximate set is the member list of its own region,
//! minus itself. Changes to that set drive the peer mesh. Member lists of
//! regions more than one step from the local region are dropped, since the
//! relay stops refreshing them.

use std::collections::{BTreeSet, HashMap};

use glam::Vec3;
use tidemesh_net::{PeerId, RegionId};

/// The local client crossed a region boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionChange {
    /// Previous region, `None` on the first position update.
    pub from: Option<RegionId>,
    /// New region.
    pub to: RegionId,
}

/// New proximate set plus what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProximityUpdate {
    /// Every peer currently proximate.
    pub proximate: BTreeSet<PeerId>,
    /// Peers that became proximate.
    pub entered: Vec<PeerId>,
    /// Peers that stopped being proximate.
    pub left: Vec<PeerId>,
}

impl ProximityUpdate {
    /// `true` if nothing entered or left.
    pub fn is_unchanged(&self) -> bool {
        self.entered.is_empty() && self.left.is_empty()
    }
}

/// Region bookkeeping for one client.
#[derive(Debug)]
pub struct RegionMembership {
    local: PeerId,
    region_size: f32,
    local_region: Option<RegionId>,
    members: HashMap<RegionId, BTreeSet<PeerId>>,
    last_seen: HashMap<PeerId, RegionId>,
    proximate: BTreeSet<PeerId>,
}

impl RegionMembership {
    /// Create membership tracking for `local` with square regions of
    /// `region_size` world units.
    pub fn new(local: PeerId, region_size: f32) -> Self {
        Self {
            local,
            region_size,
            local_region: None,
            members: HashMap::new(),
            last_seen: HashMap::new(),
            proximate: BTreeSet::new(),
        }
    }

    /// Region of the local client, once a position is known.
    pub fn local_region(&self) -> Option<RegionId> {
        self.local_region
    }

    /// The region containing `position`.
    pub fn region_at(&self, position: Vec3) -> RegionId {
        RegionId::from_position(position, self.region_size)
    }

    /// Record the local position. Returns the change if the region differs.
    pub fn update_local_position(&mut self, position: Vec3) -> Option<RegionChange> {
        let to = self.region_at(position);
        if self.local_region == Some(to) {
            return None;
        }
        let from = self.local_region.replace(to);
        tracing::debug!("local region {from:?} -> {to}");
        self.forget_outside(to);
        Some(RegionChange { from, to })
    }

    fn forget_outside(&mut self, center: RegionId) {
        let before = self.members.len();
        self.members.retain(|region, _| is_neighbour(*region, center));
        self.last_seen.retain(|_, region| is_neighbour(*region, center));
        if self.members.len() < before {
            tracing::trace!("dropped {} distant regions", before - self.members.len());
        }
    }

    /// Replace the member list of `region`.
    ///
    /// Listed peers are removed from whatever region they were in before.
    /// Returns the proximity diff, which is empty unless `region` is the
    /// local region.
    pub fn apply_region_update(&mut self, region: RegionId, peers: &[PeerId]) -> ProximityUpdate {
        let listed: BTreeSet<PeerId> = peers.iter().filter(|p| **p != self.local).cloned().collect();

        for peer in &listed {
            if let Some(previous) = self.last_seen.insert(peer.clone(), region)
                && previous != region
                && let Some(set) = self.members.get_mut(&previous)
            {
                set.remove(peer);
            }
        }
        if let Some(old) = self.members.get(&region) {
            for gone in old.difference(&listed) {
                if self.last_seen.get(gone) == Some(&region) {
                    self.last_seen.remove(gone);
                }
            }
        }
        self.members.insert(region, listed);

        self.recompute()
    }

    /// Recompute the proximate set from the members of the local region.
    pub fn recompute(&mut self) -> ProximityUpdate {
        let next: BTreeSet<PeerId> = self
            .local_region
            .and_then(|region| self.members.get(&region))
            .cloned()
            .unwrap_or_default();

        let entered = next.difference(&self.proximate).cloned().collect();
        let left = self.proximate.difference(&next).cloned().collect();
        self.proximate = next;
        ProximityUpdate {
            proximate: self.proximate.clone(),
            entered,
            left,
        }
    }

    /// Last region a peer was reported in.
    pub fn region_of(&self, peer: &PeerId) -> Option<RegionId> {
        self.last_seen.get(peer).copied()
    }

    /// Current proximate set.
    pub fn proximate(&self) -> &BTreeSet<PeerId> {
        &self.proximate
    }

    /// `true` if `peer` is in the local region.
    pub fn is_proximate(&self, peer: &PeerId) -> bool {
        self.proximate.contains(peer)
    }

    /// Claim-locality: only entities in the local region may be claimed.
    pub fn allows_claim(&self, entity_region: RegionId) -> bool {
        self.local_region == Some(entity_region)
    }

    /// Forget every peer (terminal disconnect). The local region is kept.
    pub fn clear_peers(&mut self) -> ProximityUpdate {
        self.members.clear();
        self.last_seen.clear();
        self.recompute()
    }
}

fn is_neighbour(a: RegionId, b: RegionId) -> bool {
    a.x.abs_diff(b.x) <= 1 && a.z.abs_diff(b.z) <= 1
}
