//! Shared movable entities known to the local client.

use std::collections::BTreeMap;

use tidemesh_net::{EntityId, Pose, RegionId, SlotName};

/// Kind of controllable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityCategory {
    /// Boats, ships, carts: may carry several seats.
    Vehicle,
    /// Towed objects such as artillery pieces.
    Tow,
    /// Rideable animals.
    Mount,
}

impl EntityCategory {
    /// Name of the implicit slot of a single-seat entity of this category.
    pub fn implicit_slot(self) -> SlotName {
        match self {
            Self::Vehicle => SlotName::pilot(),
            Self::Tow => SlotName::new("driver"),
            Self::Mount => SlotName::new("rider"),
        }
    }
}

/// A shared, movable resource with named seats.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllableEntity {
    /// Stable id.
    pub id: EntityId,
    /// What kind of thing it is.
    pub category: EntityCategory,
    slots: Vec<SlotName>,
    /// Last known pose.
    pub pose: Pose,
    /// Region the entity sits in.
    pub region: RegionId,
}

impl ControllableEntity {
    /// Create an entity. An empty `slots` list gets the category's implicit
    /// single slot.
    pub fn new(
        id: EntityId,
        category: EntityCategory,
        slots: Vec<SlotName>,
        pose: Pose,
        region: RegionId,
    ) -> Self {
        let slots = if slots.is_empty() {
            vec![category.implicit_slot()]
        } else {
            slots
        };
        Self {
            id,
            category,
            slots,
            pose,
            region,
        }
    }

    /// Ordered seats. Never empty.
    pub fn slots(&self) -> &[SlotName] {
        &self.slots
    }

    /// The slot whose occupant owns the entity's pose: `pilot` when present,
    /// otherwise the first (sole) slot.
    pub fn driving_slot(&self) -> &SlotName {
        self.slots
            .iter()
            .find(|s| s.as_str() == SlotName::PILOT)
            .unwrap_or(&self.slots[0])
    }

    /// `true` if `slot` is the driving slot.
    pub fn is_driving(&self, slot: &SlotName) -> bool {
        self.driving_slot() == slot
    }

    /// `true` if the entity has a seat named `slot`.
    pub fn has_slot(&self, slot: &SlotName) -> bool {
        self.slots.contains(slot)
    }
}

/// Every controllable entity in the client's known world.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, ControllableEntity>,
}

impl EntityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entity. Returns the previous record, if any.
    pub fn spawn(&mut self, entity: ControllableEntity) -> Option<ControllableEntity> {
        self.entities.insert(entity.id.clone(), entity)
    }

    /// Remove an entity.
    pub fn despawn(&mut self, id: &EntityId) -> Option<ControllableEntity> {
        self.entities.remove(id)
    }

    /// Look up an entity.
    pub fn get(&self, id: &EntityId) -> Option<&ControllableEntity> {
        self.entities.get(id)
    }

    /// Look up an entity mutably.
    pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut ControllableEntity> {
        self.entities.get_mut(id)
    }

    /// Number of known entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// `true` if no entities are known.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Iterate in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ControllableEntity> {
        self.entities.values()
    }
}
