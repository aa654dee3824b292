//! # Tick Engine
//!
//! Orchestrates the four phases of every frame:
//!
//! 1. `fixed_update` at exactly 1/50 s, repeated until the accumulator is
//!    drained (the physics step lives here)
//! 2. `update` with the variable frame delta
//! 3. `late_update`
//! 4. `post_late_update`
//!
//! Only hot entities participate in the update phases. Inbound packets,
//! asset completions and chat work drain into the world *between* frames,
//! never mid-phase. The server clamps the variable delta so a lag spike
//! becomes several honest frames instead of one explosive step.

use atrium_shared::constants::MAX_FRAME_DELTA;

use crate::world::World;

/// Per-frame timing record.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickStats {
    /// Frames run.
    pub frames: u64,
    /// Fixed steps run.
    pub fixed_steps: u64,
    /// Frames whose delta hit the clamp.
    pub clamped_frames: u64,
}

/// Fixed-accumulator tick engine.
pub struct TickEngine {
    fixed_delta: f32,
    accumulator: f32,
    stats: TickStats,
}

impl TickEngine {
    /// Creates an engine stepping physics at `tick_rate` Hz.
    #[must_use]
    pub fn new(tick_rate: u32) -> Self {
        Self {
            fixed_delta: 1.0 / tick_rate.max(1) as f32,
            accumulator: 0.0,
            stats: TickStats::default(),
        }
    }

    /// The fixed step duration.
    #[must_use]
    pub const fn fixed_delta(&self) -> f32 {
        self.fixed_delta
    }

    /// Runs one frame over the world.
    pub fn advance(&mut self, world: &mut World, dt: f32) {
        let dt = if dt > MAX_FRAME_DELTA {
            self.stats.clamped_frames += 1;
            MAX_FRAME_DELTA
        } else {
            dt
        };

        // Between frames: packets, completions, chat-driven work.
        world.drain_between_frames();

        // Phase 1: fixed steps.
        self.accumulator += dt;
        while self.accumulator >= self.fixed_delta {
            self.accumulator -= self.fixed_delta;
            world.fixed_update(self.fixed_delta);
            self.stats.fixed_steps += 1;
        }

        // Phases 2-4: variable rate over the hot set.
        world.update(dt);
        world.late_update(dt);
        world.post_late_update(dt);

        self.stats.frames += 1;
    }

    /// Timing statistics.
    #[must_use]
    pub const fn stats(&self) -> TickStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::testutil::server_world;

    #[test]
    fn test_fixed_steps_accumulate() {
        let mut engine = TickEngine::new(50);
        let mut world = server_world();
        // 0.1 s at 50 Hz is 5 fixed steps.
        engine.advance(&mut world, 0.1);
        assert_eq!(engine.stats().fixed_steps, 5);
        assert_eq!(engine.stats().frames, 1);
    }

    #[test]
    fn test_small_frames_carry_remainder() {
        let mut engine = TickEngine::new(50);
        let mut world = server_world();
        // Three 12 ms frames: 36 ms, one 20 ms step fires, 16 ms carries.
        for _ in 0..3 {
            engine.advance(&mut world, 0.012);
        }
        assert_eq!(engine.stats().fixed_steps, 1);
    }

    #[test]
    fn test_lag_spike_clamped() {
        let mut engine = TickEngine::new(50);
        let mut world = server_world();
        engine.advance(&mut world, 10.0);
        let stats = engine.stats();
        assert_eq!(stats.clamped_frames, 1);
        // The clamp bounds per-frame work.
        assert!(stats.fixed_steps <= (MAX_FRAME_DELTA / 0.02).ceil() as u64);
    }
}
