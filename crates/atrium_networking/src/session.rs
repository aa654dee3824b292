//! # Session State
//!
//! Per-socket state owned by the simulation thread: who the socket is, what
//! it may do, whether it is still alive, and when its pose stream last
//! flushed.
//!
//! The socket itself lives on a tokio task; a [`Session`] is the simulation
//! thread's ledger entry for it.

use std::time::Instant;

use atrium_core::EntityId;

/// Unique identifier for a connected socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    /// The session id a client uses for its server peer.
    pub const SERVER: Self = Self(0);
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// Keepalive bookkeeping for one socket.
#[derive(Clone, Debug)]
pub struct PingState {
    /// When the last ping went out, if one is outstanding.
    pub sent_at: Option<Instant>,
    /// When the last pong (or any proof of life) arrived.
    pub last_seen: Instant,
    /// Smoothed round-trip estimate in microseconds.
    pub rtt_us: u32,
    /// When the next ping is due.
    pub next_ping_at: Instant,
}

impl PingState {
    fn new(now: Instant) -> Self {
        Self {
            sent_at: None,
            last_seen: now,
            rtt_us: 0,
            next_ping_at: now,
        }
    }

    /// Records an outgoing ping.
    pub fn ping_sent(&mut self, now: Instant, interval_secs: f32) {
        self.sent_at = Some(now);
        self.next_ping_at = now + std::time::Duration::from_secs_f32(interval_secs);
    }

    /// Records an incoming pong; folds the sample into the RTT estimate.
    pub fn pong_received(&mut self, now: Instant) {
        self.last_seen = now;
        if let Some(sent) = self.sent_at.take() {
            let sample = now.duration_since(sent).as_micros() as u32;
            // Rolling average, biased to history.
            self.rtt_us = if self.rtt_us == 0 {
                sample
            } else {
                (self.rtt_us * 7 + sample) / 8
            };
        }
    }

    /// True when nothing has been heard for longer than `timeout_secs`.
    #[must_use]
    pub fn timed_out(&self, now: Instant, timeout_secs: f32) -> bool {
        now.duration_since(self.last_seen).as_secs_f32() > timeout_secs
    }
}

/// Per-socket state: identity, roles, dirty-set, ping.
#[derive(Clone, Debug)]
pub struct Session {
    /// Socket identifier.
    pub id: SessionId,
    /// User record id once authenticated.
    pub user_id: Option<String>,
    /// Player entity minted for this socket.
    pub player_entity: Option<EntityId>,
    /// Auth token issued in the snapshot.
    pub auth_token: Option<String>,
    /// Keepalive state.
    pub ping: PingState,
    /// Seconds of accumulated time since the last pose-stream flush.
    pub pose_stream_accum: f32,
}

impl Session {
    /// Creates a fresh, unauthenticated session.
    #[must_use]
    pub fn new(id: SessionId, now: Instant) -> Self {
        Self {
            id,
            user_id: None,
            player_entity: None,
            auth_token: None,
            ping: PingState::new(now),
            pose_stream_accum: 0.0,
        }
    }

    /// True once the socket has been authenticated and owns a player.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.user_id.is_some() && self.player_entity.is_some()
    }

    /// Advances the pose-stream accumulator; returns true when a flush at
    /// `rate` per second is due, consuming one period.
    pub fn pose_stream_due(&mut self, dt: f32, rate: f32) -> bool {
        self.pose_stream_accum += dt;
        let period = 1.0 / rate;
        if self.pose_stream_accum >= period {
            // Consume one period, carrying the remainder so the stream
            // keeps cadence instead of drifting.
            self.pose_stream_accum -= period;
            self.pose_stream_accum = self.pose_stream_accum.min(period);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pose_stream_cadence() {
        let mut s = Session::new(SessionId(1), Instant::now());
        let rate = 8.0;
        let mut flushes = 0;
        // 2 seconds at 100 Hz frames.
        for _ in 0..200 {
            if s.pose_stream_due(0.01, rate) {
                flushes += 1;
            }
        }
        assert!((15..=17).contains(&flushes), "got {flushes} flushes");
    }

    #[test]
    fn test_ping_rtt_and_timeout() {
        let t0 = Instant::now();
        let mut ping = PingState::new(t0);
        ping.ping_sent(t0, 1.0);
        ping.pong_received(t0 + Duration::from_millis(50));
        assert!(ping.rtt_us > 0);
        assert!(!ping.timed_out(t0 + Duration::from_secs(5), 10.0));
        assert!(ping.timed_out(t0 + Duration::from_secs(20), 10.0));
    }

    #[test]
    fn test_session_liveness() {
        let mut s = Session::new(SessionId(3), Instant::now());
        assert!(!s.is_live());
        s.user_id = Some("u".to_owned());
        s.player_entity = Some(atrium_core::EntityId::random());
        assert!(s.is_live());
    }
}
