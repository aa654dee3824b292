//! World records shared between client and server.
//!
//! These are the durable shapes: they ride inside snapshot payloads and are
//! what the persistence store commits. Transient per-socket fields (mover,
//! uploader) never appear here.

use serde::{Deserialize, Serialize};

use crate::math::{Quat, Vec3};
use crate::value::{obj, Value};

/// A user identity: survives reconnects, owned by the server.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable user id (hex token).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Role grants ("admin", "builder").
    pub roles: Vec<String>,
    /// Avatar asset url, if the user picked one.
    pub avatar: Option<String>,
}

impl UserRecord {
    /// True if the user holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// True if the user may author world content.
    #[must_use]
    pub fn is_builder(&self) -> bool {
        self.has_role("admin") || self.has_role("builder")
    }

    /// Wire form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        obj(&[
            ("id", Value::Str(self.id.clone())),
            ("name", Value::Str(self.name.clone())),
            (
                "roles",
                Value::Array(self.roles.iter().cloned().map(Value::Str).collect()),
            ),
            (
                "avatar",
                self.avatar.clone().map_or(Value::Null, Value::Str),
            ),
        ])
    }

    /// Parses the wire form.
    #[must_use]
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            id: v.get("id")?.as_str()?.to_owned(),
            name: v.get("name")?.as_str()?.to_owned(),
            roles: v
                .get("roles")?
                .as_array()?
                .iter()
                .filter_map(|r| r.as_str().map(str::to_owned))
                .collect(),
            avatar: match v.get("avatar") {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            },
        })
    }
}

/// Immutable-by-version template: model + script + config.
///
/// Any modification produces `version + 1`; script listeners gate events
/// against the version they were built from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Blueprint id (hex token).
    pub id: String,
    /// Monotone version counter.
    pub version: u32,
    /// Model or avatar asset url.
    pub model: Option<String>,
    /// Script asset url.
    pub script: Option<String>,
    /// Opaque config map of typed asset references, script-defined keys.
    pub config: Value,
    /// Fetch assets before the world reports ready.
    pub preload: bool,
}

impl Blueprint {
    /// Wire form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        obj(&[
            ("id", Value::Str(self.id.clone())),
            ("version", Value::Int(i64::from(self.version))),
            ("model", self.model.clone().map_or(Value::Null, Value::Str)),
            ("script", self.script.clone().map_or(Value::Null, Value::Str)),
            ("config", self.config.clone()),
            ("preload", Value::Bool(self.preload)),
        ])
    }

    /// Parses the wire form.
    #[must_use]
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            id: v.get("id")?.as_str()?.to_owned(),
            version: u32::try_from(v.get("version")?.as_int()?).ok()?,
            model: match v.get("model") {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            },
            script: match v.get("script") {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            },
            config: v.get("config").cloned().unwrap_or(Value::Null),
            preload: v.get("preload").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// Entity kind discriminator on the wire and in the store.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKindTag {
    /// A connected player's avatar.
    Player = 0,
    /// A scripted interactive object.
    App = 1,
}

impl EntityKindTag {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::App => "app",
        }
    }

    /// Parses the wire name.
    #[must_use]
    pub fn from_str_tag(s: &str) -> Option<Self> {
        match s {
            "player" => Some(Self::Player),
            "app" => Some(Self::App),
            _ => None,
        }
    }
}

/// Durable entity shape: what a snapshot carries and the store commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity id (hex token).
    pub id: String,
    /// Kind discriminator.
    pub kind: EntityKindTag,
    /// Blueprint id, for apps.
    pub blueprint: Option<String>,
    /// Position.
    pub position: Vec3,
    /// Orientation.
    pub quaternion: Quat,
    /// Per-axis scale, when not unit.
    pub scale: Option<Vec3>,
    /// Script-owned opaque state, snapshotted on rebuild boundaries.
    pub state: Option<Value>,
    /// User identity, for players.
    pub user: Option<UserRecord>,
    /// Session currently uploading this entity's model, if any.
    pub uploader: Option<String>,
    /// Session currently dragging this entity, if any.
    pub mover: Option<String>,
}

impl EntityRecord {
    /// Wire form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut v = obj(&[
            ("id", Value::Str(self.id.clone())),
            ("type", Value::Str(self.kind.as_str().to_owned())),
            ("position", Value::from_vec3(self.position)),
            ("quaternion", Value::from_quat(self.quaternion)),
        ]);
        if let Some(bp) = &self.blueprint {
            v.set("blueprint", Value::Str(bp.clone()));
        }
        if let Some(scale) = self.scale {
            v.set("scale", Value::from_vec3(scale));
        }
        if let Some(state) = &self.state {
            v.set("state", state.clone());
        }
        if let Some(user) = &self.user {
            v.set("user", user.to_value());
        }
        if let Some(uploader) = &self.uploader {
            v.set("uploader", Value::Str(uploader.clone()));
        }
        if let Some(mover) = &self.mover {
            v.set("mover", Value::Str(mover.clone()));
        }
        v
    }

    /// Parses the wire form.
    #[must_use]
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            id: v.get("id")?.as_str()?.to_owned(),
            kind: EntityKindTag::from_str_tag(v.get("type")?.as_str()?)?,
            blueprint: match v.get("blueprint") {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            },
            position: v.get("position")?.as_vec3()?,
            quaternion: v.get("quaternion")?.as_quat()?,
            scale: v.get("scale").and_then(Value::as_vec3),
            state: v.get("state").cloned(),
            user: v.get("user").and_then(UserRecord::from_value),
            uploader: match v.get("uploader") {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            },
            mover: match v.get("mover") {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            },
        })
    }
}

/// One chat line. The log keeps at most the most recent 50.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id (hex token).
    pub id: String,
    /// Originating entity, or None for server-minted messages.
    pub from: Option<String>,
    /// Display name at send time ("System" for server messages).
    pub from_name: Option<String>,
    /// Message body.
    pub body: String,
    /// Seconds since the Unix epoch.
    pub created_at: f64,
}

impl ChatMessage {
    /// Wire form. Server-originated messages carry `from: null`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        obj(&[
            ("id", Value::Str(self.id.clone())),
            ("from", self.from.clone().map_or(Value::Null, Value::Str)),
            (
                "fromName",
                self.from_name.clone().map_or(Value::Null, Value::Str),
            ),
            ("body", Value::Str(self.body.clone())),
            ("createdAt", Value::Float(self.created_at)),
        ])
    }

    /// Parses the wire form.
    #[must_use]
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            id: v.get("id")?.as_str()?.to_owned(),
            from: match v.get("from") {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            },
            from_name: match v.get("fromName") {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            },
            body: v.get("body")?.as_str()?.to_owned(),
            created_at: v.get("createdAt").and_then(Value::as_f64).unwrap_or(0.0),
        })
    }
}

/// Where new players appear.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnPoint {
    /// Spawn position.
    pub position: Vec3,
    /// Spawn orientation.
    pub quaternion: Quat,
}

impl Default for SpawnPoint {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            quaternion: Quat::IDENTITY,
        }
    }
}
