//! # Remote Player
//!
//! An interpolated replica of a foreign player. No prediction: the replica
//! glides between the authoritative poses in the stream, and snaps when a
//! teleport flag arrives. On the server the replica additionally owns a
//! kinematic capsule so server-side apps can observe contacts.

use atrium_networking::PoseInterpolator;
use atrium_shared::constants::{CAPSULE_HEIGHT, CAPSULE_RADIUS};
use atrium_shared::{Quat, Transform, UserRecord, Value, Vec3};

use super::player_local::Emote;
use crate::physics::{BodyId, BodyMotion, BodyShape, LayerMask, PhysicsScene};

/// A replica of a foreign player.
pub struct PlayerRemote {
    /// User identity.
    pub user: UserRecord,
    /// Interpolated world position (capsule base).
    pub position: Vec3,
    /// Interpolated orientation.
    pub rotation: Quat,
    /// Latest emote token from the stream.
    pub emote: Emote,
    /// Pose interpolators fed by the stream.
    pub interp: PoseInterpolator,
    /// Kinematic capsule on the server, for app contact queries.
    pub body: Option<BodyId>,
}

impl PlayerRemote {
    /// Creates a replica latched at the given pose.
    #[must_use]
    pub fn new(user: UserRecord, position: Vec3, rotation: Quat) -> Self {
        Self {
            user,
            position,
            rotation,
            emote: Emote::Idle,
            interp: PoseInterpolator::new(position, rotation, 1.0 / atrium_shared::constants::NETWORK_RATE),
            body: None,
        }
    }

    /// Attaches the server-side kinematic capsule.
    pub fn attach_body(&mut self, scene: &mut dyn PhysicsScene) {
        if self.body.is_none() {
            self.body = Some(scene.add_body(
                BodyShape::Capsule {
                    radius: CAPSULE_RADIUS,
                    height: CAPSULE_HEIGHT,
                },
                BodyMotion::Kinematic,
                1.0,
                LayerMask::PLAYER,
                Transform::from_position(self.position),
            ));
        }
    }

    /// Releases the server-side capsule.
    pub fn detach_body(&mut self, scene: &mut dyn PhysicsScene) {
        if let Some(body) = self.body.take() {
            scene.remove_body(body);
        }
    }

    /// Applies one `entityModified` pose-stream record: `p`, `q`, `e`, and
    /// the teleport flag `t`.
    pub fn apply_stream(&mut self, payload: &Value) {
        let position = payload.get("p").and_then(Value::as_vec3);
        let rotation = payload.get("q").and_then(Value::as_quat);
        let teleport = payload.get("t").and_then(Value::as_bool).unwrap_or(false);
        match (position, rotation) {
            (Some(p), Some(q)) => self.interp.push(p, q, teleport),
            (Some(p), None) => self.interp.push(p, self.interp.rotation.target(), teleport),
            (None, Some(q)) => self.interp.push(self.interp.position.target(), q, teleport),
            (None, None) => {}
        }
        if let Some(emote) = payload.get("e").and_then(Value::as_str) {
            self.emote = Emote::from_str_tag(emote);
        }
    }

    /// Per-frame advance: move the interpolators, sample the replica pose,
    /// and drive the server capsule when one is attached.
    pub fn update(&mut self, scene: Option<&mut dyn PhysicsScene>, dt: f32) {
        self.interp.advance(dt);
        let (position, rotation) = self.interp.sample();
        self.position = position;
        self.rotation = rotation;
        if let (Some(scene), Some(body)) = (scene, self.body) {
            scene.set_body_transform(
                body,
                Transform::new(position, rotation, Vec3::ONE),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_shared::value::obj;

    fn stream(p: Vec3, teleport: bool) -> Value {
        let mut v = obj(&[
            ("p", Value::from_vec3(p)),
            ("q", Value::from_quat(Quat::IDENTITY)),
            ("e", Value::Str("run".to_owned())),
        ]);
        if teleport {
            v.set("t", Value::Bool(true));
        }
        v
    }

    #[test]
    fn test_stream_glides() {
        let mut remote = PlayerRemote::new(UserRecord::default(), Vec3::ZERO, Quat::IDENTITY);
        remote.apply_stream(&stream(Vec3::new(8.0, 0.0, 0.0), false));
        remote.update(None, 1.0 / 16.0);
        assert!(remote.position.x > 3.0 && remote.position.x < 5.0, "x={}", remote.position.x);
        assert_eq!(remote.emote, Emote::Run);
    }

    #[test]
    fn test_teleport_snaps() {
        let mut remote = PlayerRemote::new(UserRecord::default(), Vec3::ZERO, Quat::IDENTITY);
        remote.apply_stream(&stream(Vec3::new(100.0, 0.0, 0.0), true));
        remote.update(None, 0.0);
        assert!((remote.position.x - 100.0).abs() < 1e-5);
        assert_eq!(remote.interp.teleport_count, 1);
    }

    #[test]
    fn test_server_capsule_follows() {
        let mut scene = crate::physics::AnalyticScene::new(9.81);
        let mut remote = PlayerRemote::new(UserRecord::default(), Vec3::ZERO, Quat::IDENTITY);
        remote.attach_body(&mut scene);
        remote.apply_stream(&stream(Vec3::new(4.0, 0.0, 0.0), true));
        remote.update(Some(&mut scene), 0.0);
        let body = remote.body.unwrap();
        let pos = scene.body_transform(body).unwrap().position;
        assert!((pos.x - 4.0).abs() < 1e-5);

        remote.detach_body(&mut scene);
        assert!(remote.body.is_none());
    }
}
