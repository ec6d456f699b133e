//! Advisory crew roster: who sits where on each multi-seat entity.
//!
//! Fed by relay grants (our own seat plus the relay's view of the others)
//! and by `slot_occupied` / `slot_vacated` broadcasts from peers. It is only
//! a hint for the UI; the relay's occupancy table is the authority, and a
//! stale entry is corrected when the relay denies a claim.

use std::collections::BTreeMap;

use tidemesh_net::{EntityId, EntitySnapshot, PeerId, SlotName};

/// Occupant of a seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Occupant {
    /// The local client.
    Local,
    /// A remote peer.
    Peer(PeerId),
}

/// Seat map per entity.
#[derive(Debug, Default)]
pub struct CrewRoster {
    seats: BTreeMap<EntityId, BTreeMap<SlotName, Occupant>>,
}

impl CrewRoster {
    /// Empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupant of one seat.
    pub fn occupant(&self, entity: &EntityId, slot: &SlotName) -> Option<&Occupant> {
        self.seats.get(entity)?.get(slot)
    }

    /// All known seats of an entity.
    pub fn seats(&self, entity: &EntityId) -> Option<&BTreeMap<SlotName, Occupant>> {
        self.seats.get(entity)
    }

    /// Record an occupant. Returns the previous one.
    pub fn set(&mut self, entity: &EntityId, slot: &SlotName, occupant: Occupant) -> Option<Occupant> {
        self.seats
            .entry(entity.clone())
            .or_default()
            .insert(slot.clone(), occupant)
    }

    /// Clear a seat. Returns who was there.
    pub fn vacate(&mut self, entity: &EntityId, slot: &SlotName) -> Option<Occupant> {
        let seats = self.seats.get_mut(entity)?;
        let previous = seats.remove(slot);
        if seats.is_empty() {
            self.seats.remove(entity);
        }
        previous
    }

    /// Replace an entity's seats with the relay's view from a grant.
    pub fn seed_from_grant(&mut self, entity: &EntityId, snapshot: &EntitySnapshot, local: &PeerId) {
        let seats = snapshot
            .occupants
            .iter()
            .map(|o| {
                let occupant = if &o.peer == local {
                    Occupant::Local
                } else {
                    Occupant::Peer(o.peer.clone())
                };
                (o.slot.clone(), occupant)
            })
            .collect();
        self.seats.insert(entity.clone(), seats);
    }

    /// Seats of an entity held by a remote peer.
    pub fn remote_occupants(&self, entity: &EntityId) -> Vec<(SlotName, PeerId)> {
        self.seats
            .get(entity)
            .into_iter()
            .flatten()
            .filter_map(|(slot, occupant)| match occupant {
                Occupant::Peer(peer) => Some((slot.clone(), peer.clone())),
                Occupant::Local => None,
            })
            .collect()
    }

    /// Drop everything known about an entity.
    pub fn remove_entity(&mut self, entity: &EntityId) {
        self.seats.remove(entity);
    }

    /// Drop every seat of a peer that went away.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        for seats in self.seats.values_mut() {
            seats.retain(|_, occupant| *occupant != Occupant::Peer(peer.clone()));
        }
        self.seats.retain(|_, seats| !seats.is_empty());
    }
}
