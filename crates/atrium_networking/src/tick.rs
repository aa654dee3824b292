//! # Frame Pacer
//!
//! Fixed-rate frame loop controller for the headless server.
//!
//! The world's own tick engine turns frame deltas into 50 Hz physics steps;
//! this type only decides *when a frame runs* and keeps timing statistics.
//! It sleeps for the bulk of the wait and spins the last stretch so the
//! cadence stays honest under coarse OS timers.

use std::time::{Duration, Instant};

/// Frame timing statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameStats {
    /// Minimum frame duration observed (microseconds).
    pub min_frame_us: u64,
    /// Maximum frame duration observed (microseconds).
    pub max_frame_us: u64,
    /// Rolling average frame duration (microseconds).
    pub avg_frame_us: u64,
    /// Frames that exceeded the budget.
    pub late_frames: u64,
    /// Total frames measured.
    pub total_frames: u64,
}

/// Fixed-rate frame pacer.
pub struct FramePacer {
    frame_duration: Duration,
    last_frame: Instant,
    frame_count: u64,
    stats: FrameStats,
}

impl FramePacer {
    /// Creates a pacer running at `rate` frames per second.
    #[must_use]
    pub fn new(rate: u32) -> Self {
        let frame_duration = Duration::from_micros(1_000_000 / u64::from(rate.max(1)));
        Self {
            frame_duration,
            last_frame: Instant::now(),
            frame_count: 0,
            stats: FrameStats {
                min_frame_us: u64::MAX,
                avg_frame_us: frame_duration.as_micros() as u64,
                ..FrameStats::default()
            },
        }
    }

    /// Marks the start of a frame; returns (frame start, seconds since the
    /// previous frame start).
    #[must_use]
    pub fn begin_frame(&mut self) -> (Instant, f32) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frame_count += 1;
        (now, dt)
    }

    /// Marks the end of a frame; records statistics.
    pub fn end_frame(&mut self, start: Instant) {
        let duration_us = start.elapsed().as_micros() as u64;
        self.stats.total_frames += 1;
        self.stats.min_frame_us = self.stats.min_frame_us.min(duration_us);
        self.stats.max_frame_us = self.stats.max_frame_us.max(duration_us);
        // Rolling average, biased to history.
        self.stats.avg_frame_us = (self.stats.avg_frame_us * 15 + duration_us) / 16;
        if duration_us > self.frame_duration.as_micros() as u64 {
            self.stats.late_frames += 1;
        }
    }

    /// Sleeps until the next frame is due.
    pub fn wait_for_next_frame(&self) {
        let elapsed = self.last_frame.elapsed();
        if elapsed >= self.frame_duration {
            return;
        }
        let remaining = self.frame_duration - elapsed;
        // Sleep coarse, spin fine.
        if remaining > Duration::from_micros(1000) {
            std::thread::sleep(remaining - Duration::from_micros(500));
        }
        while self.last_frame.elapsed() < self.frame_duration {
            std::hint::spin_loop();
        }
    }

    /// Total frames begun.
    #[must_use]
    pub const fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Timing statistics so far.
    #[must_use]
    pub const fn stats(&self) -> FrameStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_advance_and_record() {
        let mut pacer = FramePacer::new(1000);
        for _ in 0..5 {
            let (start, dt) = pacer.begin_frame();
            assert!(dt >= 0.0);
            pacer.end_frame(start);
            pacer.wait_for_next_frame();
        }
        assert_eq!(pacer.frame_count(), 5);
        assert_eq!(pacer.stats().total_frames, 5);
    }

    #[test]
    fn test_pacer_holds_rate_roughly() {
        let mut pacer = FramePacer::new(200);
        let begin = Instant::now();
        for _ in 0..20 {
            let (start, _) = pacer.begin_frame();
            pacer.end_frame(start);
            pacer.wait_for_next_frame();
        }
        let elapsed = begin.elapsed();
        // 20 frames at 200 Hz is 100 ms; allow generous slop for CI.
        assert!(elapsed >= Duration::from_millis(80), "ran too fast: {elapsed:?}");
    }
}
