use std::collections::VecDeque;

use glam::{Quat, Vec3};

use super::entity::Transform;
use crate::config::PredictionConfig;
use crate::net::sequence_greater_than;

#[derive(Debug, Clone, Copy)]
struct PredictedInput {
    sequence: u16,
    after: Transform,
}

/// Local prediction for one controlled entity. Inputs are applied at once
/// and remembered; when the server acknowledges one, any divergence shifts
/// the predicted state and is blended out visually instead of snapping.
#[derive(Debug)]
pub struct Predictor {
    history: VecDeque<PredictedInput>,
    capacity: usize,
    next_sequence: u16,
    last_acked: Option<u16>,
    state: Transform,
    position_error: Vec3,
    rotation_error: Quat,
    error_threshold: f32,
    correction_speed: f32,
}

impl Predictor {
    pub fn new(config: &PredictionConfig, initial: Transform) -> Self {
        let capacity = config.history.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            next_sequence: 0,
            last_acked: None,
            state: initial,
            position_error: Vec3::ZERO,
            rotation_error: Quat::IDENTITY,
            error_threshold: config.error_threshold,
            correction_speed: config.correction_speed,
        }
    }

    /// Records the state the host reached after applying one input and
    /// returns the sequence the server should acknowledge.
    pub fn apply_input(&mut self, after: Transform) -> u16 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(PredictedInput { sequence, after });
        self.state = after;

        sequence
    }

    /// Compares the authoritative state at `acked` with what was predicted.
    /// Returns the positional correction applied, if any.
    pub fn reconcile(&mut self, authoritative: &Transform, acked: u16) -> Option<Vec3> {
        if let Some(last) = self.last_acked {
            if !sequence_greater_than(acked, last) {
                return None;
            }
        }
        self.last_acked = Some(acked);

        while self
            .history
            .front()
            .is_some_and(|input| sequence_greater_than(acked, input.sequence))
        {
            self.history.pop_front();
        }

        let predicted = match self.history.front() {
            Some(input) if input.sequence == acked => input.after,
            _ => return None,
        };
        self.history.pop_front();

        let position_delta = authoritative.position - predicted.position;
        let rotation_delta = authoritative.rotation * predicted.rotation.inverse();
        let rotation_diverged = predicted.rotation.angle_between(authoritative.rotation) > self.error_threshold;

        if position_delta.length() < self.error_threshold && !rotation_diverged {
            return None;
        }

        let velocity_delta = authoritative.velocity - predicted.velocity;
        self.state.position += position_delta;
        self.state.rotation = (rotation_delta * self.state.rotation).normalize();
        self.state.velocity += velocity_delta;
        for input in &mut self.history {
            input.after.position += position_delta;
            input.after.rotation = (rotation_delta * input.after.rotation).normalize();
            input.after.velocity += velocity_delta;
        }

        // Keep the visual where it was; the error then decays in `update`.
        self.position_error -= position_delta;
        self.rotation_error = (self.rotation_error * rotation_delta.inverse()).normalize();

        Some(position_delta)
    }

    pub fn update(&mut self, dt: f32) {
        let decay = (-self.correction_speed * dt).exp();
        self.position_error *= decay;
        self.rotation_error = self.rotation_error.slerp(Quat::IDENTITY, 1.0 - decay);
    }

    /// Predicted state plus the not-yet-blended correction.
    pub fn visual(&self) -> Transform {
        Transform {
            position: self.state.position + self.position_error,
            rotation: (self.rotation_error * self.state.rotation).normalize(),
            velocity: self.state.velocity,
        }
    }

    pub fn predicted(&self) -> &Transform {
        &self.state
    }

    pub fn pending_inputs(&self) -> usize {
        self.history.len()
    }

    pub fn last_acked(&self) -> Option<u16> {
        self.last_acked
    }

    pub fn position_error(&self) -> Vec3 {
        self.position_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictor() -> Predictor {
        Predictor::new(&PredictionConfig::default(), Transform::default())
    }

    #[test]
    fn correction_blends_instead_of_snapping() {
        let mut prediction = predictor();

        let start = Transform::from_position(Vec3::new(0.0, 2.0, 0.0));
        let seq = prediction.apply_input(start);

        let server = Transform::from_position(Vec3::new(0.5, 2.0, 0.0));
        let correction = prediction.reconcile(&server, seq).unwrap();
        assert!((correction.x - 0.5).abs() < 1e-6);

        // Logic moved, the visual did not.
        assert!((prediction.predicted().position - server.position).length() < 1e-6);
        assert!((prediction.visual().position - start.position).length() < 1e-6);

        prediction.update(0.05);
        let visual = prediction.visual().position;
        assert!(visual.x > start.position.x + 0.1);
        assert!(visual.x < server.position.x);

        for _ in 0..60 {
            prediction.update(1.0 / 60.0);
        }
        assert!((prediction.visual().position - server.position).length() < 0.01);
    }

    #[test]
    fn later_inputs_shift_with_correction() {
        let mut prediction = predictor();
        let first = prediction.apply_input(Transform::from_position(Vec3::X));
        prediction.apply_input(Transform::from_position(Vec3::X * 2.0));

        prediction.reconcile(&Transform::from_position(Vec3::new(1.0, 1.0, 0.0)), first);

        assert_eq!(prediction.pending_inputs(), 1);
        assert!((prediction.predicted().position - Vec3::new(2.0, 1.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn matching_state_needs_no_correction() {
        let mut prediction = predictor();
        let state = Transform::from_position(Vec3::new(3.0, 0.0, 0.0));
        let seq = prediction.apply_input(state);

        assert_eq!(prediction.reconcile(&state, seq), None);
        assert_eq!(prediction.position_error(), Vec3::ZERO);
        assert_eq!(prediction.pending_inputs(), 0);
    }

    #[test]
    fn stale_acks_ignored() {
        let mut prediction = predictor();
        let a = prediction.apply_input(Transform::default());
        let b = prediction.apply_input(Transform::default());

        prediction.reconcile(&Transform::default(), b);
        assert_eq!(
            prediction.reconcile(&Transform::from_position(Vec3::X), a),
            None
        );
        assert_eq!(prediction.last_acked(), Some(b));
    }

    #[test]
    fn history_is_bounded() {
        let config = PredictionConfig {
            history: 8,
            ..Default::default()
        };
        let mut prediction = Predictor::new(&config, Transform::default());
        for _ in 0..20 {
            prediction.apply_input(Transform::default());
        }
        assert_eq!(prediction.pending_inputs(), 8);
    }
}
