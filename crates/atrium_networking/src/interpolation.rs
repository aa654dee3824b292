//! # Pose Interpolation
//!
//! Remote entities are rendered between their last two known network poses,
//! not predicted. Each received update becomes the new target; the visual
//! pose glides toward it over one network period. A teleport re-latches
//! both interpolators so the entity snaps instead of sliding across the
//! world.

use atrium_shared::{Quat, Vec3};

/// Position interpolator between network updates.
#[derive(Clone, Debug)]
pub struct Vec3Interpolator {
    prev: Vec3,
    curr: Vec3,
    /// Expected seconds between updates.
    interval: f32,
    elapsed: f32,
}

impl Vec3Interpolator {
    /// Creates an interpolator latched at `initial`, expecting updates every
    /// `interval` seconds.
    #[must_use]
    pub const fn new(initial: Vec3, interval: f32) -> Self {
        Self {
            prev: initial,
            curr: initial,
            interval,
            elapsed: 0.0,
        }
    }

    /// Feeds a new network target.
    pub fn push(&mut self, target: Vec3) {
        self.prev = self.sample();
        self.curr = target;
        self.elapsed = 0.0;
    }

    /// Snaps both endpoints to `pose` (teleport).
    pub fn latch(&mut self, pose: Vec3) {
        self.prev = pose;
        self.curr = pose;
        self.elapsed = 0.0;
    }

    /// Advances interpolation time.
    pub fn advance(&mut self, dt: f32) {
        self.elapsed += dt;
    }

    /// Current interpolated value.
    #[must_use]
    pub fn sample(&self) -> Vec3 {
        let t = (self.elapsed / self.interval).clamp(0.0, 1.0);
        self.prev.lerp(self.curr, t)
    }

    /// The most recent network target.
    #[must_use]
    pub const fn target(&self) -> Vec3 {
        self.curr
    }
}

/// Orientation interpolator between network updates.
#[derive(Clone, Debug)]
pub struct QuatInterpolator {
    prev: Quat,
    curr: Quat,
    interval: f32,
    elapsed: f32,
}

impl QuatInterpolator {
    /// Creates an interpolator latched at `initial`.
    #[must_use]
    pub const fn new(initial: Quat, interval: f32) -> Self {
        Self {
            prev: initial,
            curr: initial,
            interval,
            elapsed: 0.0,
        }
    }

    /// Feeds a new network target.
    pub fn push(&mut self, target: Quat) {
        self.prev = self.sample();
        self.curr = target;
        self.elapsed = 0.0;
    }

    /// Snaps both endpoints to `pose` (teleport).
    pub fn latch(&mut self, pose: Quat) {
        self.prev = pose;
        self.curr = pose;
        self.elapsed = 0.0;
    }

    /// Advances interpolation time.
    pub fn advance(&mut self, dt: f32) {
        self.elapsed += dt;
    }

    /// Current interpolated value.
    #[must_use]
    pub fn sample(&self) -> Quat {
        let t = (self.elapsed / self.interval).clamp(0.0, 1.0);
        self.prev.slerp(self.curr, t)
    }

    /// The most recent network target.
    #[must_use]
    pub const fn target(&self) -> Quat {
        self.curr
    }
}

/// Combined position + orientation interpolation for one remote entity.
#[derive(Clone, Debug)]
pub struct PoseInterpolator {
    /// Position track.
    pub position: Vec3Interpolator,
    /// Orientation track.
    pub rotation: QuatInterpolator,
    /// Count of teleports observed; remotes snap when it changes.
    pub teleport_count: u32,
}

impl PoseInterpolator {
    /// Creates a pose interpolator latched at the given pose.
    #[must_use]
    pub const fn new(position: Vec3, rotation: Quat, interval: f32) -> Self {
        Self {
            position: Vec3Interpolator::new(position, interval),
            rotation: QuatInterpolator::new(rotation, interval),
            teleport_count: 0,
        }
    }

    /// Feeds a network update. `teleport` forces a snap instead of a glide.
    pub fn push(&mut self, position: Vec3, rotation: Quat, teleport: bool) {
        if teleport {
            self.position.latch(position);
            self.rotation.latch(rotation);
            self.teleport_count = self.teleport_count.wrapping_add(1);
        } else {
            self.position.push(position);
            self.rotation.push(rotation);
        }
    }

    /// Advances both tracks.
    pub fn advance(&mut self, dt: f32) {
        self.position.advance(dt);
        self.rotation.advance(dt);
    }

    /// Current interpolated pose.
    #[must_use]
    pub fn sample(&self) -> (Vec3, Quat) {
        (self.position.sample(), self.rotation.sample())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_glides_to_target() {
        let mut interp = Vec3Interpolator::new(Vec3::ZERO, 0.125);
        interp.push(Vec3::new(10.0, 0.0, 0.0));

        // Halfway through the interval: halfway there.
        interp.advance(0.0625);
        assert!((interp.sample().x - 5.0).abs() < 0.01);

        // Past the interval: clamped at the target.
        interp.advance(1.0);
        assert!((interp.sample().x - 10.0).abs() < 1e-5);
    }

    #[test]
    fn test_push_rebases_from_current_sample() {
        let mut interp = Vec3Interpolator::new(Vec3::ZERO, 0.125);
        interp.push(Vec3::new(10.0, 0.0, 0.0));
        interp.advance(0.0625);
        // New target mid-glide: the glide restarts from the sampled pose,
        // not from the stale target, so there is no visible jump.
        interp.push(Vec3::new(0.0, 0.0, 8.0));
        let here = interp.sample();
        assert!((here.x - 5.0).abs() < 0.01);
        assert!(here.z.abs() < 0.01);
    }

    #[test]
    fn test_teleport_snaps_immediately() {
        let mut pose = PoseInterpolator::new(Vec3::ZERO, Quat::IDENTITY, 0.125);
        pose.push(Vec3::new(100.0, 0.0, 0.0), Quat::from_yaw(1.0), true);
        let (p, q) = pose.sample();
        assert!((p.x - 100.0).abs() < 1e-5);
        assert!(q.dot(Quat::from_yaw(1.0)).abs() > 0.9999);
        assert_eq!(pose.teleport_count, 1);
    }

    #[test]
    fn test_rotation_glides() {
        let mut interp = QuatInterpolator::new(Quat::IDENTITY, 0.125);
        let target = Quat::from_yaw(1.0);
        interp.push(target);
        interp.advance(0.0625);
        let mid = interp.sample();
        let expected = Quat::IDENTITY.slerp(target, 0.5);
        assert!(mid.dot(expected).abs() > 0.9999);
    }
}
