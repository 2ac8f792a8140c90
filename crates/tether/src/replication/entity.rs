use std::cell::RefCell;
use std::hash::Hasher;
use std::rc::Rc;

use glam::{Quat, Vec3};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// Replicated attributes of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
}

impl Transform {
    pub fn new(position: Vec3, rotation: Quat, velocity: Vec3) -> Self {
        Self {
            position,
            rotation,
            velocity,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Order-independent content hash: each field hashes on its own and the
    /// results are summed.
    pub fn content_hash(&self) -> u64 {
        field_hash(0, &self.position.to_array())
            .wrapping_add(field_hash(1, &self.rotation.to_array()))
            .wrapping_add(field_hash(2, &self.velocity.to_array()))
    }
}

fn field_hash(tag: u8, components: &[f32]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u8(tag);
    for component in components {
        hasher.write_u32(component.to_bits());
    }
    hasher.finish()
}

/// The host's view of an entity: the core only ever reads and writes the
/// replicated transform through this.
pub trait EntityRef {
    fn read(&self) -> Transform;
    fn write(&mut self, transform: &Transform);
}

impl EntityRef for Transform {
    fn read(&self) -> Transform {
        *self
    }

    fn write(&mut self, transform: &Transform) {
        *self = *transform;
    }
}

impl<T: EntityRef> EntityRef for Rc<RefCell<T>> {
    fn read(&self) -> Transform {
        self.borrow().read()
    }

    fn write(&mut self, transform: &Transform) {
        self.borrow_mut().write(transform);
    }
}

/// Scales an entity's priority growth by how much a peer cares about it.
pub trait PriorityWeight {
    fn weight(&self, entity: &Transform, point_of_interest: Vec3) -> f32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UniformWeight;

impl PriorityWeight for UniformWeight {
    fn weight(&self, _entity: &Transform, _point_of_interest: Vec3) -> f32 {
        1.0
    }
}

/// `1 / (1 + d / falloff)`: 1.0 at the point of interest, 0.5 at `falloff`.
#[derive(Debug, Clone, Copy)]
pub struct InverseDistanceWeight {
    pub falloff: f32,
}

impl Default for InverseDistanceWeight {
    fn default() -> Self {
        Self { falloff: 50.0 }
    }
}

impl PriorityWeight for InverseDistanceWeight {
    fn weight(&self, entity: &Transform, point_of_interest: Vec3) -> f32 {
        let distance = entity.position.distance(point_of_interest);
        1.0 / (1.0 + distance / self.falloff.max(f32::EPSILON))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tracks_every_field() {
        let base = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));
        let moved = Transform {
            position: Vec3::new(1.0, 2.0, 3.01),
            ..base
        };
        let turned = Transform {
            rotation: Quat::from_rotation_y(0.1),
            ..base
        };
        let pushed = Transform {
            velocity: Vec3::X,
            ..base
        };

        assert_eq!(base.content_hash(), base.content_hash());
        assert_ne!(base.content_hash(), moved.content_hash());
        assert_ne!(base.content_hash(), turned.content_hash());
        assert_ne!(base.content_hash(), pushed.content_hash());
    }

    #[test]
    fn swapping_fields_changes_hash() {
        let a = Transform::new(Vec3::X, Quat::IDENTITY, Vec3::Y);
        let b = Transform::new(Vec3::Y, Quat::IDENTITY, Vec3::X);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn shared_entity_ref_writes_through() {
        let shared = Rc::new(RefCell::new(Transform::default()));
        let mut handle = Rc::clone(&shared);

        handle.write(&Transform::from_position(Vec3::splat(4.0)));
        assert_eq!(shared.borrow().position, Vec3::splat(4.0));
        assert_eq!(handle.read().position, Vec3::splat(4.0));
    }

    #[test]
    fn inverse_distance_falls_off() {
        let weight = InverseDistanceWeight { falloff: 10.0 };
        let near = Transform::from_position(Vec3::ZERO);
        let far = Transform::from_position(Vec3::new(10.0, 0.0, 0.0));

        assert!((weight.weight(&near, Vec3::ZERO) - 1.0).abs() < 1e-6);
        assert!((weight.weight(&far, Vec3::ZERO) - 0.5).abs() < 1e-6);
        assert_eq!(UniformWeight.weight(&far, Vec3::ZERO), 1.0);
    }
}
