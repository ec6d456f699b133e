//! Console host: control bindings that log instead of driving a renderer.

use std::collections::BTreeSet;

use tidemesh_net::EntityId;
use tidemesh_sync::{ControlBinding, ControlBindings};

/// Tracks which bindings are live and logs every change.
#[derive(Debug, Default)]
pub struct ConsoleBindings {
    active: BTreeSet<(EntityId, BindingKey)>,
}

// ControlBinding has no Ord; keep a sortable mirror for the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BindingKey {
    StaticCollider,
    CameraTarget,
    AnimationRig,
    MovementParent,
}

impl From<ControlBinding> for BindingKey {
    fn from(binding: ControlBinding) -> Self {
        match binding {
            ControlBinding::StaticCollider => Self::StaticCollider,
            ControlBinding::CameraTarget => Self::CameraTarget,
            ControlBinding::AnimationRig => Self::AnimationRig,
            ControlBinding::MovementParent => Self::MovementParent,
        }
    }
}

impl ConsoleBindings {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live bindings.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// `true` if `binding` is live for `entity`.
    pub fn is_active(&self, entity: &EntityId, binding: ControlBinding) -> bool {
        self.active.contains(&(entity.clone(), binding.into()))
    }
}

impl ControlBindings for ConsoleBindings {
    fn acquire(&mut self, entity: &EntityId, binding: ControlBinding) {
        if !self.active.insert((entity.clone(), binding.into())) {
            tracing::warn!("{binding:?} already bound for {entity}");
            return;
        }
        tracing::info!("bound {binding:?} to {entity}");
    }

    fn release(&mut self, entity: &EntityId, binding: ControlBinding) {
        if !self.active.remove(&(entity.clone(), binding.into())) {
            tracing::warn!("{binding:?} was not bound for {entity}");
            return;
        }
        tracing::info!("unbound {binding:?} from {entity}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release_track_live_bindings() {
        let mut bindings = ConsoleBindings::new();
        let boat = EntityId::new("boat_7");
        bindings.acquire(&boat, ControlBinding::CameraTarget);
        bindings.acquire(&boat, ControlBinding::StaticCollider);
        assert_eq!(bindings.active_count(), 2);
        assert!(bindings.is_active(&boat, ControlBinding::CameraTarget));

        bindings.release(&boat, ControlBinding::CameraTarget);
        assert!(!bindings.is_active(&boat, ControlBinding::CameraTarget));
        assert_eq!(bindings.active_count(), 1);
    }

    #[test]
    fn test_double_acquire_is_ignored() {
        let mut bindings = ConsoleBindings::new();
        let boat = EntityId::new("boat_7");
        bindings.acquire(&boat, ControlBinding::AnimationRig);
        bindings.acquire(&boat, ControlBinding::AnimationRig);
        assert_eq!(bindings.active_count(), 1);
        bindings.release(&boat, ControlBinding::AnimationRig);
        bindings.release(&boat, ControlBinding::AnimationRig);
        assert_eq!(bindings.active_count(), 0);
    }
}
