//! # Local Player
//!
//! The self-owned capsule controller: ground sweep, slope and platform
//! handling, the jump/fall state machine, camera and input, and the pose
//! stream toward peers.
//!
//! The fixed-rate step runs the physics policy in a strict order; get the
//! order wrong and players slide off elevators or jitter on ramps.

use atrium_shared::constants::{
    CAPSULE_HEIGHT, CAPSULE_RADIUS, FALL_DEAD_BAND_SECS, GRAVITY, GROUND_SWEEP_DISTANCE,
    JUMP_HEIGHT, MAX_GROUND_ANGLE_DEG, RUN_SPEED, WALK_SPEED, ZOOM_MAX, ZOOM_MIN,
};
use atrium_shared::value::obj;
use atrium_shared::{Quat, Transform, UserRecord, Value, Vec2, Vec3};

use crate::physics::{BodyId, CombineMode, LayerMask, PhysicsScene};

/// Animation-clip token, selected by the controller state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Emote {
    /// Standing.
    #[default]
    Idle,
    /// Walking.
    Walk,
    /// Running.
    Run,
    /// Airborne (jumping or falling).
    Float,
}

impl Emote {
    /// Wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Walk => "walk",
            Self::Run => "run",
            Self::Float => "float",
        }
    }

    /// Parses the wire form; unknown tokens read as idle.
    #[must_use]
    pub fn from_str_tag(s: &str) -> Self {
        match s {
            "walk" => Self::Walk,
            "run" => Self::Run,
            "float" => Self::Float,
            _ => Self::Idle,
        }
    }
}

/// Frame input assembled by the platform layer (keyboard/mouse or touch).
#[derive(Clone, Copy, Debug, Default)]
pub struct InputState {
    /// Raw movement axes: x = strafe right, y = forward.
    pub axes: Vec2,
    /// Left touch-stick vector in pixels, when touch is driving.
    pub stick: Option<Vec2>,
    /// Space pressed this frame.
    pub jump: bool,
    /// Shift held.
    pub shift: bool,
    /// Pointer delta under pointer lock (or touch pan).
    pub pointer_delta: Vec2,
    /// Scroll wheel delta.
    pub scroll: f32,
}

/// Touch-stick radius at which the stick saturates, in pixels.
const STICK_MAX_RADIUS: f32 = 50.0;

/// Stick deflection (fraction of max) that starts a run.
const STICK_RUN_THRESHOLD: f32 = 0.5;

/// Third-person orbit camera.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    /// Yaw around the player, radians.
    pub yaw: f32,
    /// Pitch, clamped to +/- 90 degrees.
    pub pitch: f32,
    /// Orbit distance.
    pub zoom: f32,
    /// Smoothed world position of the camera.
    pub position: Vec3,
}

impl Camera {
    fn new() -> Self {
        Self {
            yaw: 0.0,
            pitch: 0.0,
            zoom: 6.0,
            position: Vec3::ZERO,
        }
    }

    /// Where the camera wants to be for a player at `target`.
    #[must_use]
    pub fn desired_position(&self, target: Vec3) -> Vec3 {
        let back = Quat::from_yaw(self.yaw)
            .rotate(Quat::from_axis_angle(Vec3::X, self.pitch).rotate(Vec3::Z * -self.zoom));
        target + Vec3::UP * 1.6 + back
    }
}

/// Platform-tracking record: the body under our feet and where it was last
/// tick.
#[derive(Clone, Copy, Debug)]
pub struct PlatformTrack {
    /// The supporting body.
    pub actor: BodyId,
    /// Its transform at the previous fixed step.
    pub prev: Transform,
}

/// The avatar this process controls.
pub struct PlayerLocal {
    /// User identity.
    pub user: UserRecord,
    /// Capsule body in the physics scene.
    pub body: BodyId,
    /// Capsule radius.
    pub capsule_radius: f32,
    /// Capsule end-to-end height.
    pub capsule_height: f32,
    /// Controller mass.
    pub mass: f32,
    /// Jump apex height.
    pub jump_height: f32,

    /// World position (capsule base).
    pub position: Vec3,
    /// Avatar base orientation (yaw-facing).
    pub rotation: Quat,

    /// Standing on walkable ground this step.
    pub grounded: bool,
    /// Surface normal under the capsule.
    pub ground_normal: Vec3,
    /// Surface angle from vertical, degrees.
    pub ground_angle: f32,
    /// On ground too steep to stand on.
    pub slipping: bool,
    /// Jump impulse applied, liftoff pending.
    pub jumped: bool,
    /// Airborne from a jump.
    pub jumping: bool,
    /// Airborne and falling past the dead-band.
    pub falling: bool,
    /// Seconds of downward motion while airborne.
    pub fall_timer: f32,
    /// The platform currently carrying us.
    pub platform: Option<PlatformTrack>,

    /// World-space move direction (unit when moving).
    pub move_dir: Vec3,
    /// Input wants motion this frame.
    pub moving: bool,
    /// Run modifier engaged.
    pub running: bool,

    /// Orbit camera.
    pub camera: Camera,
    /// Current emote token.
    pub emote: Emote,

    /// Pose stream accumulator.
    net_accum: f32,
    /// Pose broadcast period (1 / network rate).
    net_period: f32,
    /// Next pose broadcast must carry the teleport flag.
    teleport_pending: bool,
    /// Grounded state of the previous fixed step.
    was_grounded: bool,
}

impl PlayerLocal {
    /// Creates the local player and its capsule body at `spawn`.
    pub fn new(user: UserRecord, scene: &mut dyn PhysicsScene, spawn: Vec3, network_rate: f32) -> Self {
        let body = scene.add_body(
            crate::physics::BodyShape::Capsule {
                radius: CAPSULE_RADIUS,
                height: CAPSULE_HEIGHT,
            },
            crate::physics::BodyMotion::Dynamic,
            1.0,
            LayerMask::PLAYER,
            Transform::from_position(spawn),
        );
        // The controller owns gravity by hand (step 5); the scene never
        // applies its own to the capsule.
        scene.set_gravity_enabled(body, false);
        Self {
            user,
            body,
            capsule_radius: CAPSULE_RADIUS,
            capsule_height: CAPSULE_HEIGHT,
            mass: 1.0,
            jump_height: JUMP_HEIGHT,
            position: spawn,
            rotation: Quat::IDENTITY,
            grounded: false,
            ground_normal: Vec3::UP,
            ground_angle: 0.0,
            slipping: false,
            jumped: false,
            jumping: false,
            falling: false,
            fall_timer: 0.0,
            platform: None,
            move_dir: Vec3::ZERO,
            moving: false,
            running: false,
            camera: Camera::new(),
            emote: Emote::Idle,
            net_accum: 0.0,
            net_period: 1.0 / network_rate,
            teleport_pending: false,
            was_grounded: false,
        }
    }

    /// One 50 Hz physics step. The steps run in a strict order.
    pub fn fixed_update(&mut self, scene: &mut dyn PhysicsScene, input: &InputState, dt: f32) {
        self.position = scene
            .body_transform(self.body)
            .map_or(self.position, |t| t.position);

        // 1. Platform tracking: port the capsule along whatever rigid body
        //    is under it (elevators, rotating disks, see-saws).
        self.track_platform(scene);

        // 2. Ground sweep.
        let sweep_origin = self.position + Vec3::UP * (self.capsule_radius + 0.02);
        let sweep = scene.sweep_sphere_down(
            sweep_origin,
            self.capsule_radius - 0.01,
            GROUND_SWEEP_DISTANCE,
            LayerMask::WALKABLE,
            Some(self.body),
        );
        self.slipping = false;
        match sweep {
            Some(hit) => {
                self.ground_normal = hit.normal;
                self.ground_angle = hit.normal.dot(Vec3::UP).clamp(-1.0, 1.0).acos().to_degrees();
                if self.ground_angle > MAX_GROUND_ANGLE_DEG {
                    self.grounded = false;
                    self.slipping = true;
                } else {
                    self.grounded = true;
                }
            }
            None => {
                self.grounded = false;
                self.ground_normal = Vec3::UP;
                self.ground_angle = 0.0;
            }
        }
        if !self.grounded {
            self.platform = None;
        }

        // 3. Material swap: zero-friction against walls while airborne,
        //    absorb platform friction while grounded.
        scene.set_material_mode(
            self.body,
            if self.grounded { CombineMode::Max } else { CombineMode::Min },
        );

        // 4. Jump / fall state machine.
        if self.grounded {
            if input.jump && !self.jumped && !self.jumping {
                let impulse = (2.0 * GRAVITY * self.jump_height).sqrt() / self.mass.sqrt();
                scene.apply_impulse(self.body, Vec3::UP * impulse);
                self.jumped = true;
            } else if self.jumped {
                self.jumping = true;
                self.jumped = false;
            } else {
                self.jumping = false;
                self.falling = false;
                self.fall_timer = 0.0;
            }
        } else {
            let vy = scene.body_velocity(self.body).map_or(0.0, |v| v.y);
            if vy < 0.0 {
                // Dead-band before the fall state engages, so walking over
                // small steps does not flicker the animation.
                self.fall_timer += dt;
                if self.fall_timer > FALL_DEAD_BAND_SECS {
                    self.falling = true;
                }
            } else {
                self.fall_timer = 0.0;
            }
        }

        // 5. Gravity: off entirely while grounded; a grounded dynamic
        //    platform still feels our weight so see-saws respond.
        if self.grounded {
            if let Some(track) = self.platform {
                if scene.is_dynamic(track.actor) {
                    scene.apply_force(track.actor, Vec3::new(0.0, -GRAVITY * 0.2 * self.mass, 0.0));
                }
            }
        } else {
            scene.apply_force(self.body, Vec3::new(0.0, -GRAVITY * self.mass, 0.0));
        }

        // 6. Velocity shaping.
        if let Some(velocity) = scene.body_velocity(self.body) {
            let normal = if self.grounded { self.ground_normal } else { Vec3::UP };
            let along_normal = velocity.project_onto(normal);
            let tangent = velocity - along_normal;
            // Drag on the ground-parallel component stops ice-skating up
            // ramps.
            let tangent = tangent * (1.0 - (10.0 * dt).min(1.0));
            let mut shaped = tangent
                + if self.grounded && !self.jumping {
                    // Null the normal-direction velocity so elevators carry
                    // the capsule instead of leaving it behind.
                    Vec3::ZERO
                } else {
                    along_normal
                };
            if self.was_grounded && !self.grounded && !self.jumping && !self.jumped {
                // Walked off an edge: snap-down hint instead of a float.
                shaped.y = -5.0;
            }
            if self.slipping {
                shaped.y += -0.5;
            }
            scene.set_body_velocity(self.body, shaped);
        }

        // 7. Move force, aligned to the slope.
        if self.moving {
            let move_speed = if self.running { RUN_SPEED } else { WALK_SPEED } * self.mass;
            let slope_align = Quat::from_rotation_arc(Vec3::UP, self.ground_normal);
            let dir = slope_align.rotate(self.move_dir);
            scene.apply_force(self.body, dir * (10.0 * move_speed));
        }

        self.was_grounded = self.grounded;
        self.position = scene
            .body_transform(self.body)
            .map_or(self.position, |t| t.position);
    }

    fn track_platform(&mut self, scene: &mut dyn PhysicsScene) {
        if !self.grounded {
            self.platform = None;
            return;
        }
        let origin = self.position + Vec3::UP * 0.1;
        let hit = scene.raycast(origin, -Vec3::UP, 2.0, LayerMask::WALKABLE, Some(self.body));
        let Some(actor) = hit.and_then(|h| h.actor) else {
            self.platform = None;
            return;
        };
        let Some(current) = scene.body_transform(actor) else {
            self.platform = None;
            return;
        };
        match self.platform {
            Some(track) if track.actor == actor => {
                // Premultiply the platform's delta transform onto the
                // capsule pose, then transfer its yaw to the avatar base.
                let delta = current.mul(track.prev.inverse());
                let ported = delta.transform_point(self.position);
                let mut pose = scene.body_transform(self.body).unwrap_or_default();
                pose.position = ported;
                scene.set_body_transform(self.body, pose);
                self.position = ported;
                self.rotation = (delta.rotation.yaw_only() * self.rotation).normalized();
                self.platform = Some(PlatformTrack { actor, prev: current });
            }
            _ => {
                self.platform = Some(PlatformTrack { actor, prev: current });
            }
        }
    }

    /// Variable-rate update: camera, input assembly, facing, emote, pose
    /// stream. Returns the `entityModified` payload when a pose broadcast
    /// is due.
    pub fn update(&mut self, input: &InputState, entity_id_hex: &str, dt: f32) -> Option<Value> {
        // Camera: pointer orbit, pitch clamp, wheel zoom.
        self.camera.yaw -= input.pointer_delta.x * 0.003;
        self.camera.pitch = (self.camera.pitch - input.pointer_delta.y * 0.003)
            .clamp(-std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2);
        self.camera.zoom = (self.camera.zoom + input.scroll * 0.5).clamp(ZOOM_MIN, ZOOM_MAX);

        // Movement axes: keyboard, or the left touch stick.
        let (axes, stick_run) = match input.stick {
            Some(stick) => {
                let clamped = Vec2::new(
                    stick.x / STICK_MAX_RADIUS,
                    -stick.y / STICK_MAX_RADIUS,
                );
                let len = clamped.length();
                let axes = if len > 1.0 {
                    Vec2::new(clamped.x / len, clamped.y / len)
                } else {
                    clamped
                };
                (axes, len > STICK_RUN_THRESHOLD)
            }
            None => (input.axes, false),
        };
        self.running = input.shift || stick_run;

        let raw = Vec3::new(axes.x, 0.0, axes.y);
        self.moving = raw.length() > 0.01;
        if self.moving {
            // Normalize, then rotate into the camera's frame.
            self.move_dir = Quat::from_yaw(self.camera.yaw).rotate(raw.normalized());
            // Slerp the avatar base toward the move direction.
            let target = Quat::from_yaw(self.move_dir.x.atan2(self.move_dir.z));
            let t = 1.0 - 0.000_000_01_f32.powf(dt);
            self.rotation = self.rotation.slerp(target, t);
        } else {
            self.move_dir = Vec3::ZERO;
        }

        // Emote from the state machine.
        self.emote = if self.jumping || self.falling {
            Emote::Float
        } else if self.moving && self.running {
            Emote::Run
        } else if self.moving {
            Emote::Walk
        } else {
            Emote::Idle
        };

        // Pose stream at the network rate.
        self.net_accum += dt;
        if self.net_accum >= self.net_period {
            self.net_accum -= self.net_period;
            self.net_accum = self.net_accum.min(self.net_period);
            let mut payload = obj(&[
                ("id", Value::Str(entity_id_hex.to_owned())),
                ("p", Value::from_vec3(self.position)),
                ("q", Value::from_quat(self.rotation)),
                ("e", Value::Str(self.emote.as_str().to_owned())),
            ]);
            if self.teleport_pending {
                payload.set("t", Value::Bool(true));
                self.teleport_pending = false;
            }
            return Some(payload);
        }
        None
    }

    /// Late phase: glide the camera toward its desired position, snapping
    /// when the gap says we teleported.
    pub fn late_update(&mut self, dt: f32) {
        let desired = self.camera.desired_position(self.position);
        if desired.distance(self.camera.position) > 20.0 {
            self.camera.position = desired;
        } else {
            let t = 1.0 - 0.000_01_f32.powf(dt);
            self.camera.position = self.camera.position.lerp(desired, t);
        }
    }

    /// Teleports the capsule: direct pose set, no interpolation, and the
    /// next pose broadcast carries `t=true` so remotes snap.
    pub fn teleport(&mut self, scene: &mut dyn PhysicsScene, position: Vec3, yaw: Option<f32>) {
        let mut pose = scene.body_transform(self.body).unwrap_or_default();
        pose.position = position;
        scene.set_body_transform(self.body, pose);
        scene.set_body_velocity(self.body, Vec3::ZERO);
        self.position = position;
        if let Some(yaw) = yaw {
            self.rotation = Quat::from_yaw(yaw);
        }
        self.teleport_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::{AnalyticScene, BodyMotion, BodyShape};

    fn setup() -> (AnalyticScene, PlayerLocal) {
        let mut scene = AnalyticScene::new(GRAVITY);
        let player = PlayerLocal::new(
            UserRecord::default(),
            &mut scene,
            Vec3::new(0.0, 0.1, 0.0),
            8.0,
        );
        (scene, player)
    }

    fn step(scene: &mut AnalyticScene, player: &mut PlayerLocal, input: &InputState, ticks: u32) {
        for _ in 0..ticks {
            player.fixed_update(scene, input, 0.02);
            scene.step(0.02);
        }
    }

    #[test]
    fn test_settles_grounded_on_flat_floor() {
        let (mut scene, mut player) = setup();
        step(&mut scene, &mut player, &InputState::default(), 50);
        assert!(player.grounded);
        assert!(!player.falling);
        assert!(player.position.y.abs() < 0.1);
    }

    #[test]
    fn test_walks_at_walk_speed() {
        let (mut scene, mut player) = setup();
        step(&mut scene, &mut player, &InputState::default(), 25);

        let input = InputState {
            axes: Vec2::new(0.0, 1.0),
            ..InputState::default()
        };
        // Assemble move_dir through the variable-rate path.
        let _ = player.update(&input, "00", 0.016);
        let start = player.position;
        step(&mut scene, &mut player, &input, 150);
        let travelled = (player.position - start).length();
        let speed = travelled / 3.0;
        assert!(
            (speed - WALK_SPEED).abs() < 1.0,
            "expected ~{WALK_SPEED} m/s, got {speed}"
        );
    }

    #[test]
    fn test_jump_leaves_ground_and_lands() {
        let (mut scene, mut player) = setup();
        step(&mut scene, &mut player, &InputState::default(), 25);
        assert!(player.grounded);

        let jump = InputState {
            jump: true,
            ..InputState::default()
        };
        step(&mut scene, &mut player, &jump, 2);
        let mut peak: f32 = 0.0;
        for _ in 0..200 {
            player.fixed_update(&mut scene, &InputState::default(), 0.02);
            scene.step(0.02);
            peak = peak.max(player.position.y);
        }
        assert!(peak > 0.5, "jump should gain height, peaked at {peak}");
        assert!(player.grounded, "player should land again");
        assert!(!player.jumping);
    }

    #[test]
    fn test_steep_slope_slips() {
        let mut scene = AnalyticScene::new(GRAVITY);
        // 65 degrees: tan(65) ~ 2.14 rise per meter.
        scene.add_slope(-10.0, 10.0, -10.0, 10.0, 0.0, 2.14, 0.0);
        let mut player = PlayerLocal::new(
            UserRecord::default(),
            &mut scene,
            Vec3::new(0.0, 21.5, 0.0),
            8.0,
        );
        // Place the capsule on the slope surface at x=0 (h = 21.4).
        step(&mut scene, &mut player, &InputState::default(), 10);
        assert!(player.slipping, "65 degree ground must slip");
        assert!(!player.grounded);
    }

    #[test]
    fn test_platform_carries_player() {
        let mut scene = AnalyticScene::new(GRAVITY);
        let platform = scene.add_body(
            BodyShape::Box {
                half: Vec3::new(2.0, 0.5, 2.0),
            },
            BodyMotion::Kinematic,
            100.0,
            LayerMask::PROP,
            Transform::from_position(Vec3::new(0.0, 0.5, 0.0)),
        );
        let mut player = PlayerLocal::new(
            UserRecord::default(),
            &mut scene,
            Vec3::new(0.0, 1.05, 0.0),
            8.0,
        );
        step(&mut scene, &mut player, &InputState::default(), 10);
        assert!(player.grounded);

        // Push the platform 1 m over 1 s; the player rides along.
        let start_x = player.position.x;
        for i in 1..=50 {
            let x = i as f32 / 50.0;
            scene.set_body_transform(platform, Transform::from_position(Vec3::new(x, 0.5, 0.0)));
            player.fixed_update(&mut scene, &InputState::default(), 0.02);
            scene.step(0.02);
        }
        let carried = player.position.x - start_x;
        assert!(
            (carried - 1.0).abs() < 0.01,
            "player should ride the platform 1 m, moved {carried}"
        );
    }

    #[test]
    fn test_camera_pitch_clamped() {
        let (_, mut player) = setup();
        let input = InputState {
            pointer_delta: Vec2::new(0.0, -100_000.0),
            ..InputState::default()
        };
        let _ = player.update(&input, "00", 0.016);
        assert!(player.camera.pitch.abs() <= std::f32::consts::FRAC_PI_2 + 1e-6);

        let input = InputState {
            scroll: 1_000_000.0,
            ..InputState::default()
        };
        let _ = player.update(&input, "00", 0.016);
        assert!(player.camera.zoom <= ZOOM_MAX);
    }

    #[test]
    fn test_pose_stream_cadence_and_teleport_flag() {
        let (mut scene, mut player) = setup();
        let mut broadcasts = 0;
        let mut saw_teleport = false;
        player.teleport(&mut scene, Vec3::new(5.0, 0.0, 5.0), Some(1.0));
        for _ in 0..125 {
            if let Some(payload) = player.update(&InputState::default(), "ab", 0.016) {
                broadcasts += 1;
                if payload.get("t").and_then(Value::as_bool) == Some(true) {
                    saw_teleport = true;
                }
            }
        }
        // 2 seconds at 8 Hz.
        assert!((14..=18).contains(&broadcasts), "got {broadcasts}");
        assert!(saw_teleport, "first broadcast after teleport must carry t=true");
        assert!((player.position - Vec3::new(5.0, 0.0, 5.0)).length() < 1e-5);
    }

    #[test]
    fn test_emote_follows_state() {
        let (mut scene, mut player) = setup();
        step(&mut scene, &mut player, &InputState::default(), 25);
        let _ = player.update(&InputState::default(), "00", 0.016);
        assert_eq!(player.emote, Emote::Idle);

        let run = InputState {
            axes: Vec2::new(0.0, 1.0),
            shift: true,
            ..InputState::default()
        };
        let _ = player.update(&run, "00", 0.016);
        assert_eq!(player.emote, Emote::Run);
    }
}
