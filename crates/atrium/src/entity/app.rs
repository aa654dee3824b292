//! # App Entity
//!
//! A scripted interactive object defined by a blueprint. Apps rebuild
//! whenever their blueprint changes; builds are asynchronous, generation
//! checked, and crash-isolated - a broken asset or script turns the app
//! into the crash block, never takes down the world.

use std::collections::VecDeque;

use atrium_core::NodeId;
use atrium_networking::{PoseInterpolator, SessionId};
use atrium_shared::constants::{APP_SCALE_MAX, APP_SCALE_MIN, NETWORK_RATE};
use atrium_shared::{Quat, Transform, Value, Vec2, Vec3};

use crate::scripts::HandlerSet;

/// App presentation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppState {
    /// Built and running.
    Active,
    /// Being dragged by its mover.
    Moving,
    /// Being rotated by its mover.
    Rotating,
    /// Being scaled by its mover.
    Scaling,
    /// A remote upload is still in progress; showing the placeholder.
    Loading,
    /// Build or script failure; showing the crash block.
    Crashed,
}

impl AppState {
    /// Whether the scene subtree is active in this state.
    #[must_use]
    pub const fn subtree_active(self) -> bool {
        matches!(self, Self::Active | Self::Moving | Self::Rotating | Self::Scaling)
    }
}

/// Authoring transform mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransformMode {
    /// Not being authored.
    #[default]
    None,
    /// Translating.
    Move,
    /// Rotating.
    Rotate,
    /// Scaling.
    Scale,
}

impl TransformMode {
    /// Wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Move => "move",
            Self::Rotate => "rotate",
            Self::Scale => "scale",
        }
    }

    /// Parses the wire form.
    #[must_use]
    pub fn from_str_tag(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "move" => Some(Self::Move),
            "rotate" => Some(Self::Rotate),
            "scale" => Some(Self::Scale),
            _ => None,
        }
    }
}

/// An entity event held while a rebuild is in flight.
#[derive(Clone, Debug, PartialEq)]
pub struct DeferredEvent {
    /// Blueprint version the sender built against.
    pub version: u32,
    /// Event name.
    pub name: String,
    /// Event payload.
    pub data: Value,
    /// Originating socket, when the event came off the wire.
    pub origin: Option<SessionId>,
}

/// What to do with an incoming entity event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventDisposition {
    /// Matches the running version: fire now.
    Fire,
    /// Belongs to a build in flight or a future version: hold it.
    Defer,
    /// Older than the running version: drop it.
    Discard,
}

/// A live script attached to an app.
#[derive(Clone, Debug)]
pub struct ScriptInstance {
    /// Blueprint version the script was built from.
    pub version: u32,
    /// Handlers the script defines.
    pub handlers: HandlerSet,
}

/// A scripted interactive object.
pub struct App {
    /// Blueprint this app instantiates.
    pub blueprint_id: String,
    /// Socket currently dragging the app, if any.
    pub mover: Option<SessionId>,
    /// Socket still uploading the app's model, if any.
    pub uploader: Option<SessionId>,
    /// Authoring mode.
    pub transform_mode: TransformMode,
    /// Script-owned opaque state, replicated on rebuild boundaries.
    pub state_value: Value,
    /// World transform of the app root.
    pub transform: Transform,
    /// Root of the app's scene subtree, when built.
    pub root: Option<NodeId>,
    /// Running script, when the blueprint has one and the build succeeded.
    pub script: Option<ScriptInstance>,
    /// Events held across rebuild boundaries.
    pub deferred: VecDeque<DeferredEvent>,
    /// Build generation; every rebuild request bumps it, and an in-flight
    /// build that no longer matches aborts at its next checkpoint.
    pub generation: u32,
    /// True while a build is in flight.
    pub building: bool,
    /// Set when a fetch or script failed; the next build shows the crash
    /// block.
    pub crashed_flag: bool,
    /// Presentation state.
    pub status: AppState,
    /// Blueprint version of the last completed build.
    pub built_version: u32,
    /// Interpolators used when a foreign session moves this app.
    pub interp: PoseInterpolator,
    /// Accumulator for the authoring stroke stream.
    pub stream_accum: f32,
}

impl App {
    /// Creates an unbuilt app for a blueprint.
    #[must_use]
    pub fn new(blueprint_id: String) -> Self {
        Self {
            blueprint_id,
            mover: None,
            uploader: None,
            transform_mode: TransformMode::None,
            state_value: Value::object(),
            transform: Transform::IDENTITY,
            root: None,
            script: None,
            deferred: VecDeque::new(),
            generation: 0,
            building: false,
            crashed_flag: false,
            status: AppState::Loading,
            built_version: 0,
            interp: PoseInterpolator::new(Vec3::ZERO, Quat::IDENTITY, 1.0 / NETWORK_RATE),
            stream_accum: 0.0,
        }
    }

    /// Starts a new build; returns its generation. Any earlier in-flight
    /// build is now superseded.
    pub fn begin_build(&mut self) -> u32 {
        self.generation += 1;
        self.building = true;
        self.generation
    }

    /// True when `generation` is still the current build.
    #[must_use]
    pub const fn build_current(&self, generation: u32) -> bool {
        self.generation == generation
    }

    /// Decides what to do with an entity event at `version`.
    #[must_use]
    pub fn classify_event(&self, version: u32, blueprint_version: u32) -> EventDisposition {
        if self.building {
            return EventDisposition::Defer;
        }
        if version > blueprint_version {
            EventDisposition::Defer
        } else if version < blueprint_version {
            EventDisposition::Discard
        } else {
            EventDisposition::Fire
        }
    }

    /// Holds an event for later.
    pub fn defer_event(&mut self, event: DeferredEvent) {
        self.deferred.push_back(event);
    }

    /// Drains the deferred queue after a build to `current_version`: events
    /// for that version fire in order, older ones are discarded, and the
    /// first future-version event stops the drain (it belongs to the next
    /// rebuild).
    pub fn drain_deferred(&mut self, current_version: u32) -> Vec<DeferredEvent> {
        let mut fire = Vec::new();
        while let Some(event) = self.deferred.front() {
            if event.version > current_version {
                break;
            }
            let event = self.deferred.pop_front().filter(|e| e.version == current_version);
            if let Some(event) = event {
                fire.push(event);
            }
        }
        fire
    }

    /// The state an app lands in when a build completes.
    #[must_use]
    pub fn resolve_state(&self, self_session: SessionId) -> AppState {
        if self.crashed_flag {
            return AppState::Crashed;
        }
        if self.mover == Some(self_session) {
            return match self.transform_mode {
                TransformMode::Rotate => AppState::Rotating,
                TransformMode::Scale => AppState::Scaling,
                TransformMode::None | TransformMode::Move => AppState::Moving,
            };
        }
        if self.uploader.is_some() && self.uploader != Some(self_session) {
            return AppState::Loading;
        }
        AppState::Active
    }

    // ------------------------------------------------------------------
    // Authoring strokes
    // ------------------------------------------------------------------

    /// One pointer stroke while moving: the cursor's ground hit places the
    /// app; `ShiftLeft` switches to vertical raise/lower by pointer-Y.
    pub fn author_move(&mut self, ground_point: Option<Vec3>, pointer: Vec2, shift: bool) {
        if shift {
            self.transform.position.y -= pointer.y * 0.01;
        } else if let Some(point) = ground_point {
            self.transform.position = point;
        }
    }

    /// One pointer stroke while rotating: pointer-X turns the Y axis,
    /// Shift+pointer-Y turns the X axis.
    pub fn author_rotate(&mut self, pointer: Vec2, shift: bool) {
        let rotation = if shift {
            Quat::from_axis_angle(Vec3::X, pointer.y * 0.01)
        } else {
            Quat::from_yaw(pointer.x * 0.01)
        };
        self.transform.rotation = (rotation * self.transform.rotation).normalized();
    }

    /// One pointer stroke while scaling: pointer-Y scales uniformly with
    /// Shift, else per-axis along Y. Scale is clamped to the legal range.
    pub fn author_scale(&mut self, pointer: Vec2, shift: bool) {
        let factor = 1.0 - pointer.y * 0.01;
        if shift {
            self.transform.scale = self.transform.scale * factor;
        } else {
            self.transform.scale.y *= factor;
        }
        self.transform.scale = self
            .transform
            .scale
            .clamp_components(APP_SCALE_MIN, APP_SCALE_MAX);
    }

    /// A left-click commit: authoring ends, the mover tag clears, and the
    /// entity returns to ACTIVE pending rebuild. Returns the final
    /// transform to broadcast.
    pub fn commit_authoring(&mut self) -> Transform {
        self.mover = None;
        self.transform_mode = TransformMode::None;
        self.state_value = Value::object();
        self.transform
    }

    /// Advances the authoring stroke accumulator; true when a stroke
    /// broadcast is due at `rate` per second.
    pub fn stream_due(&mut self, dt: f32, rate: f32) -> bool {
        self.stream_accum += dt;
        let period = 1.0 / rate;
        if self.stream_accum >= period {
            self.stream_accum -= period;
            self.stream_accum = self.stream_accum.min(period);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(version: u32, name: &str) -> DeferredEvent {
        DeferredEvent {
            version,
            name: name.to_owned(),
            data: Value::Null,
            origin: None,
        }
    }

    #[test]
    fn test_generation_supersession() {
        let mut app = App::new("bp".to_owned());
        let g1 = app.begin_build();
        let g2 = app.begin_build();
        assert!(!app.build_current(g1));
        assert!(app.build_current(g2));
    }

    #[test]
    fn test_event_classification() {
        let mut app = App::new("bp".to_owned());
        app.building = false;
        assert_eq!(app.classify_event(3, 3), EventDisposition::Fire);
        assert_eq!(app.classify_event(2, 3), EventDisposition::Discard);
        assert_eq!(app.classify_event(4, 3), EventDisposition::Defer);
        app.building = true;
        assert_eq!(app.classify_event(3, 3), EventDisposition::Defer);
    }

    #[test]
    fn test_drain_fires_current_discards_stale_keeps_future() {
        let mut app = App::new("bp".to_owned());
        app.defer_event(event(2, "stale"));
        app.defer_event(event(3, "now-a"));
        app.defer_event(event(3, "now-b"));
        app.defer_event(event(4, "future"));
        app.defer_event(event(3, "behind-future"));

        let fired = app.drain_deferred(3);
        let names: Vec<&str> = fired.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["now-a", "now-b"]);
        // The future event and everything behind it stay queued, in order.
        assert_eq!(app.deferred.len(), 2);
        assert_eq!(app.deferred[0].name, "future");

        // Next rebuild at v4 releases it.
        let fired = app.drain_deferred(4);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].name, "future");
        assert!(app.deferred.is_empty());
    }

    #[test]
    fn test_resolve_state_priorities() {
        let me = SessionId(1);
        let mut app = App::new("bp".to_owned());
        assert_eq!(app.resolve_state(me), AppState::Active);

        app.uploader = Some(SessionId(2));
        assert_eq!(app.resolve_state(me), AppState::Loading);

        app.mover = Some(me);
        app.transform_mode = TransformMode::Scale;
        assert_eq!(app.resolve_state(me), AppState::Scaling);

        app.crashed_flag = true;
        assert_eq!(app.resolve_state(me), AppState::Crashed);
    }

    #[test]
    fn test_subtree_activity_by_state() {
        assert!(AppState::Active.subtree_active());
        assert!(AppState::Moving.subtree_active());
        assert!(AppState::Rotating.subtree_active());
        assert!(AppState::Scaling.subtree_active());
        assert!(!AppState::Loading.subtree_active());
        assert!(!AppState::Crashed.subtree_active());
    }

    #[test]
    fn test_scale_clamped() {
        let mut app = App::new("bp".to_owned());
        for _ in 0..2000 {
            app.author_scale(Vec2::new(0.0, -10.0), true);
        }
        let s = app.transform.scale;
        assert!(s.x <= APP_SCALE_MAX && s.y <= APP_SCALE_MAX && s.z <= APP_SCALE_MAX);

        for _ in 0..4000 {
            app.author_scale(Vec2::new(0.0, 10.0), true);
        }
        let s = app.transform.scale;
        assert!(s.x >= APP_SCALE_MIN && s.y >= APP_SCALE_MIN && s.z >= APP_SCALE_MIN);
    }

    #[test]
    fn test_commit_clears_mover_and_state() {
        let mut app = App::new("bp".to_owned());
        app.mover = Some(SessionId(1));
        app.transform_mode = TransformMode::Move;
        app.state_value = Value::Int(5);
        let t = app.commit_authoring();
        assert!(app.mover.is_none());
        assert_eq!(app.transform_mode, TransformMode::None);
        assert_eq!(app.state_value, Value::object());
        assert_eq!(t, app.transform);
    }

    #[test]
    fn test_move_strokes() {
        let mut app = App::new("bp".to_owned());
        app.author_move(Some(Vec3::new(3.0, 0.0, 4.0)), Vec2::ZERO, false);
        assert_eq!(app.transform.position, Vec3::new(3.0, 0.0, 4.0));
        // Shift: vertical only, ground hit ignored.
        app.author_move(Some(Vec3::ZERO), Vec2::new(0.0, -50.0), true);
        assert!((app.transform.position.y - 0.5).abs() < 1e-5);
        assert!((app.transform.position.x - 3.0).abs() < 1e-5);
    }
}
