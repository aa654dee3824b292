//! # World & Network Constants
//!
//! Default configuration for the ATRIUM runtime. Every knob here can be
//! overridden at startup through `Settings`; these are the values a world
//! runs with when nothing overrides them.

// =============================================================================
// SIMULATION
// =============================================================================

/// Fixed physics step rate (ticks per second).
pub const TICK_RATE: u32 = 50;

/// Fixed physics step duration in seconds.
pub const FIXED_DELTA: f32 = 1.0 / TICK_RATE as f32;

/// Ceiling applied to the variable frame delta on the server, so a lag
/// spike is absorbed over several frames instead of one huge step.
pub const MAX_FRAME_DELTA: f32 = 1.0 / 5.0;

// =============================================================================
// NETWORK
// =============================================================================

/// Player pose / authoring stroke broadcast rate (per second).
pub const NETWORK_RATE: f32 = 8.0;

/// Keepalive ping period in seconds.
pub const PING_RATE: f32 = 1.0;

/// Seconds without a pong before a connection is dropped.
pub const PING_TIMEOUT_SECS: f32 = 10.0;

/// Default bind address for the world server.
pub const SERVER_BIND: &str = "0.0.0.0:4000";

/// Hard cap on a single encoded packet (snapshots included).
pub const MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;

/// Maximum nesting depth the payload decoder accepts.
pub const MAX_VALUE_DEPTH: usize = 32;

/// Maximum single string/bytes/collection length the decoder accepts.
pub const MAX_VALUE_LEN: usize = MAX_PACKET_SIZE;

/// Malformed packets tolerated inside [`MALFORMED_WINDOW_SECS`] before the
/// socket is closed.
pub const MALFORMED_CLOSE_THRESHOLD: u32 = 3;

/// Span of the malformed-packet accounting window, in seconds.
pub const MALFORMED_WINDOW_SECS: u64 = 10;

// =============================================================================
// WORLD
// =============================================================================

/// Default world identifier.
pub const WORLD_ID: &str = "world";

/// Persistence flush period in seconds.
pub const SAVE_INTERVAL_SECS: f32 = 60.0;

/// Upload cap in megabytes.
pub const PUBLIC_MAX_UPLOAD_SIZE_MB: u64 = 100;

/// Chat log retention.
pub const CHAT_MAX_MESSAGES: usize = 50;

// =============================================================================
// CHARACTER CONTROLLER
// =============================================================================

/// Gravity acceleration (m/s^2).
pub const GRAVITY: f32 = 9.81;

/// Default capsule radius (m).
pub const CAPSULE_RADIUS: f32 = 0.3;

/// Default capsule height, end to end (m).
pub const CAPSULE_HEIGHT: f32 = 1.8;

/// Default jump apex height (m).
pub const JUMP_HEIGHT: f32 = 1.5;

/// Ground sweep length below the capsule base (m).
pub const GROUND_SWEEP_DISTANCE: f32 = 0.22;

/// Slope angle above which the player slips, in degrees.
pub const MAX_GROUND_ANGLE_DEG: f32 = 60.0;

/// Airborne time before the fall state engages, in seconds.
pub const FALL_DEAD_BAND_SECS: f32 = 0.1;

/// Walking speed (m/s).
pub const WALK_SPEED: f32 = 4.0;

/// Running speed (m/s).
pub const RUN_SPEED: f32 = 8.0;

/// Camera zoom bounds (m).
pub const ZOOM_MIN: f32 = 2.0;
/// Camera zoom upper bound (m).
pub const ZOOM_MAX: f32 = 100.0;

/// App scale clamp while scaling, per axis.
pub const APP_SCALE_MIN: f32 = 0.1;
/// App scale clamp upper bound, per axis.
pub const APP_SCALE_MAX: f32 = 10.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delta_matches_rate() {
        assert!((FIXED_DELTA * TICK_RATE as f32 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_network_slower_than_tick() {
        assert!(NETWORK_RATE < TICK_RATE as f32);
    }
}
