use std::collections::VecDeque;

use glam::Quat;

use super::entity::Transform;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedTransform {
    pub transform: Transform,
    pub server_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Interpolated,
    Extrapolated,
    Held,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub transform: Transform,
    pub kind: SampleKind,
}

/// Jitter buffer for one remote entity: the most recent states ordered by
/// server time, never more than `depth` of them.
#[derive(Debug, Clone)]
pub struct SnapshotRing {
    samples: VecDeque<TimedTransform>,
    depth: usize,
}

impl SnapshotRing {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            samples: VecDeque::with_capacity(depth),
            depth,
        }
    }

    pub fn push(&mut self, transform: Transform, server_time: f64) {
        let entry = TimedTransform {
            transform,
            server_time,
        };

        let insert_at = self
            .samples
            .iter()
            .position(|s| s.server_time >= server_time)
            .unwrap_or(self.samples.len());

        if let Some(existing) = self.samples.get_mut(insert_at) {
            if existing.server_time == server_time {
                *existing = entry;
                return;
            }
        }

        if self.samples.len() == self.depth {
            if insert_at == 0 {
                // Older than everything we keep.
                return;
            }
            self.samples.pop_front();
            self.samples.insert(insert_at - 1, entry);
        } else {
            self.samples.insert(insert_at, entry);
        }
    }

    pub fn latest(&self) -> Option<&TimedTransform> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// State at server time `t`: blended between the bracketing pair,
    /// projected along the last velocity for at most `max_extrapolation`
    /// seconds past the newest sample, or held at the oldest one.
    pub fn sample(&self, t: f64, max_extrapolation: f64) -> Option<Sample> {
        let first = self.samples.front()?;
        if t <= first.server_time {
            return Some(Sample {
                transform: first.transform,
                kind: SampleKind::Held,
            });
        }

        for (from, to) in self.samples.iter().zip(self.samples.iter().skip(1)) {
            if from.server_time <= t && t <= to.server_time {
                let span = to.server_time - from.server_time;
                let alpha = if span > 0.0 {
                    ((t - from.server_time) / span) as f32
                } else {
                    1.0
                };
                return Some(Sample {
                    transform: blend(&from.transform, &to.transform, alpha),
                    kind: SampleKind::Interpolated,
                });
            }
        }

        let last = self.samples.back()?;
        let ahead = t - last.server_time;
        let projected = ahead.min(max_extrapolation.max(0.0)) as f32;

        let mut transform = last.transform;
        transform.position += last.transform.velocity * projected;

        Some(Sample {
            transform,
            kind: if ahead <= max_extrapolation {
                SampleKind::Extrapolated
            } else {
                SampleKind::Held
            },
        })
    }
}

pub fn blend(from: &Transform, to: &Transform, alpha: f32) -> Transform {
    Transform {
        position: from.position.lerp(to.position, alpha),
        rotation: slerp_shortest(from.rotation, to.rotation, alpha),
        velocity: from.velocity.lerp(to.velocity, alpha),
    }
}

fn slerp_shortest(from: Quat, to: Quat, alpha: f32) -> Quat {
    if from.dot(to) < 0.0 {
        from.slerp(-to, alpha)
    } else {
        from.slerp(to, alpha)
    }
}

/// Maps local time onto the server timeline. The offset is smoothed so a
/// single late packet does not yank render time around, and render time
/// never runs backwards.
#[derive(Debug, Clone)]
pub struct RenderClock {
    offset: f64,
    synced: bool,
    correction_rate: f64,
    delay: f64,
    last_render_time: f64,
}

impl RenderClock {
    pub fn new(delay_secs: f64, correction_rate: f64) -> Self {
        Self {
            offset: 0.0,
            synced: false,
            correction_rate,
            delay: delay_secs,
            last_render_time: f64::NEG_INFINITY,
        }
    }

    pub fn observe(&mut self, server_time: f64, local_time: f64) {
        let measured = server_time - local_time;
        if !self.synced {
            self.offset = measured;
            self.synced = true;
            return;
        }
        self.offset += (measured - self.offset) * self.correction_rate;
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn server_now(&self, local_time: f64) -> f64 {
        local_time + self.offset
    }

    pub fn render_time(&mut self, local_time: f64) -> f64 {
        let target = self.server_now(local_time) - self.delay;
        self.last_render_time = self.last_render_time.max(target);
        self.last_render_time
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn reset(&mut self) {
        self.synced = false;
        self.offset = 0.0;
        self.last_render_time = f64::NEG_INFINITY;
    }
}
