use std::cell::RefCell;
use std::f32::consts::TAU;
use std::rc::Rc;

use glam::{Quat, Vec3};
use tether::{EntityHandle, NetworkManager, QuantProfile, ReplicationError, Transform, Transport};

/// A body the demo moves around. The replication core reads it through the
/// shared cell every flush.
struct Body {
    handle: EntityHandle,
    state: Rc<RefCell<Transform>>,
    radius: f32,
    height: f32,
    speed: f32,
    phase: f32,
}

/// Entities circling the origin at different radii and speeds, plus a few
/// that stay put and only go out on the heartbeat.
pub struct DemoWorld {
    bodies: Vec<Body>,
    time: f32,
}

impl DemoWorld {
    pub fn populate<T: Transport>(
        network: &mut NetworkManager<T>,
        count: usize,
    ) -> Result<Self, ReplicationError> {
        let mut bodies = Vec::with_capacity(count);
        for i in 0..count {
            let fraction = i as f32 / count.max(1) as f32;
            let radius = 5.0 + 40.0 * fraction;
            let phase = fraction * TAU;
            let speed = if i % 8 == 7 { 0.0 } else { 0.2 + (i % 5) as f32 * 0.15 };

            let state = Rc::new(RefCell::new(Transform::from_position(Vec3::new(
                radius * phase.cos(),
                (i % 3) as f32,
                radius * phase.sin(),
            ))));
            // Far bodies matter less and tolerate coarser positions.
            let (profile, priority) = if radius > 35.0 {
                (QuantProfile::World, 0.5)
            } else {
                (QuantProfile::Standard, 1.0)
            };
            let handle = network.register(Rc::clone(&state), profile, priority)?;

            bodies.push(Body {
                handle,
                state,
                radius,
                height: (i % 3) as f32,
                speed,
                phase,
            });
        }

        log::info!("demo world populated with {} entities", bodies.len());
        Ok(Self { bodies, time: 0.0 })
    }

    pub fn step(&mut self, dt: f32) {
        self.time += dt;
        for body in &mut self.bodies {
            if body.speed == 0.0 {
                continue;
            }
            let angle = body.phase + self.time * body.speed;
            let (sin, cos) = angle.sin_cos();
            let mut state = body.state.borrow_mut();
            state.position = Vec3::new(body.radius * cos, body.height, body.radius * sin);
            state.velocity = Vec3::new(-sin, 0.0, cos) * body.radius * body.speed;
            state.rotation = Quat::from_rotation_y(-angle);
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Handle handed to the `n`th peer to drive.
    pub fn avatar(&self, n: usize) -> Option<EntityHandle> {
        if self.bodies.is_empty() {
            return None;
        }
        Some(self.bodies[n % self.bodies.len()].handle)
    }
}
