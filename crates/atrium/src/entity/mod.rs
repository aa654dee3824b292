//! # Entities
//!
//! Everything live in the world is an [`Entity`]: a common replicated
//! record plus a kind-specific variant - the local player (self-owned
//! capsule controller), a remote player (interpolated replica), or an app
//! (scripted interactive object).
//!
//! The common record carries what every peer agrees on: id, owner, the
//! mutable data object, a monotone version counter, and the hot flag that
//! opts the entity into per-frame update phases.

mod app;
mod player_local;
mod player_remote;
mod store;

pub use app::{App, AppState, DeferredEvent, EventDisposition, ScriptInstance, TransformMode};
pub use player_local::{Camera, Emote, InputState, PlayerLocal};
pub use player_remote::PlayerRemote;
pub use store::EntityStore;

use atrium_core::EntityId;
use atrium_networking::SessionId;
use atrium_shared::{EntityKindTag, EntityRecord, Quat, UserRecord, Value, Vec3};

/// The kind-specific half of an entity.
pub enum EntityKind {
    /// The avatar this process controls.
    PlayerLocal(PlayerLocal),
    /// A replica of a foreign player.
    PlayerRemote(PlayerRemote),
    /// A scripted interactive object.
    App(App),
}

/// A live entity.
pub struct Entity {
    /// Process-unique identifier, never reused within a session.
    pub id: EntityId,
    /// Socket considered authoritative for this entity's transient state.
    pub owner: SessionId,
    /// Mutable replicated record; `entityModified` merges into it.
    pub data: Value,
    /// Monotone version counter.
    pub version: u64,
    /// Whether the tick engine walks this entity's update phases.
    pub hot: bool,
    /// Kind-specific state.
    pub kind: EntityKind,
}

impl Entity {
    /// Creates an entity shell.
    #[must_use]
    pub fn new(id: EntityId, owner: SessionId, kind: EntityKind) -> Self {
        Self {
            id,
            owner,
            data: Value::object(),
            version: 0,
            hot: false,
            kind,
        }
    }

    /// Wire kind tag.
    #[must_use]
    pub const fn kind_tag(&self) -> EntityKindTag {
        match self.kind {
            EntityKind::PlayerLocal(_) | EntityKind::PlayerRemote(_) => EntityKindTag::Player,
            EntityKind::App(_) => EntityKindTag::App,
        }
    }

    /// True for either player variant.
    #[must_use]
    pub const fn is_player(&self) -> bool {
        matches!(self.kind, EntityKind::PlayerLocal(_) | EntityKind::PlayerRemote(_))
    }

    /// The app variant, if this is an app.
    #[must_use]
    pub const fn as_app(&self) -> Option<&App> {
        match &self.kind {
            EntityKind::App(app) => Some(app),
            _ => None,
        }
    }

    /// Mutable app view.
    pub fn as_app_mut(&mut self) -> Option<&mut App> {
        match &mut self.kind {
            EntityKind::App(app) => Some(app),
            _ => None,
        }
    }

    /// Current world position.
    #[must_use]
    pub fn position(&self) -> Vec3 {
        match &self.kind {
            EntityKind::PlayerLocal(p) => p.position,
            EntityKind::PlayerRemote(p) => p.position,
            EntityKind::App(a) => a.transform.position,
        }
    }

    /// Current orientation.
    #[must_use]
    pub fn rotation(&self) -> Quat {
        match &self.kind {
            EntityKind::PlayerLocal(p) => p.rotation,
            EntityKind::PlayerRemote(p) => p.rotation,
            EntityKind::App(a) => a.transform.rotation,
        }
    }

    /// User record, for player entities.
    #[must_use]
    pub const fn user(&self) -> Option<&UserRecord> {
        match &self.kind {
            EntityKind::PlayerLocal(p) => Some(&p.user),
            EntityKind::PlayerRemote(p) => Some(&p.user),
            EntityKind::App(_) => None,
        }
    }

    /// Merges an `entityModified` partial record into the entity data and
    /// bumps the version.
    pub fn merge_modified(&mut self, changes: &Value) {
        if let (Value::Object(target), Some(incoming)) = (&mut self.data, changes.as_object()) {
            for (key, value) in incoming {
                if key == "id" {
                    continue;
                }
                target.insert(key.clone(), value.clone());
            }
        }
        self.version += 1;
    }

    /// Durable record for snapshots and the store.
    #[must_use]
    pub fn to_record(&self) -> EntityRecord {
        let (scale, state, blueprint, uploader, mover) = match &self.kind {
            EntityKind::App(app) => (
                Some(app.transform.scale),
                Some(app.state_value.clone()),
                Some(app.blueprint_id.clone()),
                app.uploader.map(|s| s.to_string()),
                app.mover.map(|s| s.to_string()),
            ),
            _ => (None, None, None, None, None),
        };
        EntityRecord {
            id: self.id.to_hex(),
            kind: self.kind_tag(),
            blueprint,
            position: self.position(),
            quaternion: self.rotation(),
            scale,
            state,
            user: self.user().cloned(),
            uploader,
            mover,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_shared::value::obj;

    fn app_entity() -> Entity {
        Entity::new(EntityId::random(), SessionId(4), EntityKind::App(App::new("bp".to_owned())))
    }

    #[test]
    fn test_version_is_monotone_across_merges() {
        let mut entity = app_entity();
        assert_eq!(entity.version, 0);
        let mut last = entity.version;
        for i in 0..5 {
            entity.merge_modified(&obj(&[("n", Value::Int(i))]));
            assert!(entity.version > last);
            last = entity.version;
        }
    }

    #[test]
    fn test_merge_skips_id_and_keeps_other_fields() {
        let mut entity = app_entity();
        entity.merge_modified(&obj(&[
            ("id", Value::Str("spoofed".to_owned())),
            ("color", Value::Str("red".to_owned())),
        ]));
        entity.merge_modified(&obj(&[("size", Value::Int(3))]));
        assert!(entity.data.get("id").is_none());
        assert_eq!(entity.data.get("color").and_then(Value::as_str), Some("red"));
        assert_eq!(entity.data.get("size").and_then(Value::as_int), Some(3));
    }

    #[test]
    fn test_app_record_carries_transient_tags() {
        let mut entity = app_entity();
        if let EntityKind::App(app) = &mut entity.kind {
            app.mover = Some(SessionId(7));
            app.transform.position = Vec3::new(1.0, 2.0, 3.0);
        }
        let record = entity.to_record();
        assert_eq!(record.kind, EntityKindTag::App);
        assert_eq!(record.mover.as_deref(), Some("sess-7"));
        assert_eq!(record.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(record.blueprint.as_deref(), Some("bp"));
    }
}
