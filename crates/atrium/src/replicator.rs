//! # Replicator
//!
//! Snapshot-on-join plus delta broadcast of entity, blueprint and chat
//! mutations.
//!
//! Every inbound packet is dispatched by name to a handler that (a)
//! optionally role-checks, (b) mutates local state, and (c) re-broadcasts
//! to every other socket, passing the originating session so it is
//! skipped. `entityEvent` additionally fans out to the target entity's
//! event gate.
//!
//! Interest policy today: every connected socket receives every entity
//! event. The [`InterestPolicy`] seam exists so spatial filtering can slot
//! in without touching the dispatch.

use std::time::Instant;

use atrium_core::EntityId;
use atrium_networking::{NetEvent, Session, SessionId};
use atrium_shared::value::obj;
use atrium_shared::{Blueprint, ChatMessage, EntityKindTag, EntityRecord, PacketName, Value, Vec3};

use crate::chat::{parse_command, ChatLog, CommandOutcome};
use crate::entity::{Entity, EntityKind, TransformMode};
use crate::world::{World, WorldRole};

/// Decides which sessions observe an entity event.
pub trait InterestPolicy {
    /// True when `viewer` should receive an event at `target_position`.
    fn include(&self, viewer: SessionId, target_position: Vec3) -> bool;
}

/// The current product policy: everyone sees everything.
pub struct Everyone;

impl InterestPolicy for Everyone {
    fn include(&self, _viewer: SessionId, _target_position: Vec3) -> bool {
        true
    }
}

/// Entry point: one network event into the world.
pub fn handle_net_event(world: &mut World, event: NetEvent) {
    match event {
        NetEvent::Connected { session, remote } => {
            tracing::info!(%session, %remote, "socket connected");
            world
                .sessions
                .insert(session, Session::new(session, Instant::now()));
            if world.role == WorldRole::Server {
                on_connect(world, session, None);
            }
        }
        NetEvent::Packet {
            session,
            name,
            payload,
        } => dispatch(world, session, name, &payload),
        NetEvent::Disconnected { session } => {
            tracing::info!(%session, "socket disconnected");
            world.forget_session(session);
        }
    }
}

/// Connect admission: authenticate, rehydrate or mint the user, spawn the
/// player, send the snapshot, announce the arrival.
pub fn on_connect(world: &mut World, session: SessionId, token: Option<&str>) {
    let user = world.authenticate(session, token);
    let auth_token = world.mint_auth_token(&user.id);
    let player_id = world.spawn_player(session, user, false);
    if let Some(entry) = world.sessions.get_mut(&session) {
        entry.user_id = world
            .entities
            .get(player_id)
            .and_then(Entity::user)
            .map(|u| u.id.clone());
        entry.player_entity = Some(player_id);
        entry.auth_token = Some(auth_token.clone());
    }

    let snapshot = snapshot_payload(world, player_id, &auth_token);
    world.send_to(session, PacketName::Snapshot, &snapshot);

    if let Some(entity) = world.entities.get(player_id) {
        let record = entity.to_record();
        world.broadcast(PacketName::EntityAdded, &record.to_value(), Some(session));
    }
}

/// Builds the full world state for a joining socket.
#[must_use]
pub fn snapshot_payload(world: &World, player_id: EntityId, auth_token: &str) -> Value {
    obj(&[
        ("id", Value::Str(player_id.to_hex())),
        ("serverTime", Value::Float(world.now_secs())),
        (
            "chat",
            Value::Array(world.chat.iter().map(ChatMessage::to_value).collect()),
        ),
        (
            "blueprints",
            Value::Array(
                world
                    .blueprints
                    .serialize()
                    .iter()
                    .map(Blueprint::to_value)
                    .collect(),
            ),
        ),
        (
            "entities",
            Value::Array(
                world
                    .entities
                    .serialize()
                    .iter()
                    .map(EntityRecord::to_value)
                    .collect(),
            ),
        ),
        ("authToken", Value::Str(auth_token.to_owned())),
    ])
}

/// Dispatches one decoded packet.
pub fn dispatch(world: &mut World, session: SessionId, name: PacketName, payload: &Value) {
    match name {
        PacketName::Snapshot => {
            // Only the server speaks snapshots; one arriving at the server
            // is a peer misbehaving, not state to apply.
            if world.role == WorldRole::Client {
                apply_snapshot(world, payload);
            } else {
                tracing::warn!(%session, "ignoring snapshot from a client");
            }
        }
        PacketName::EntityAdded => on_entity_added(world, session, payload),
        PacketName::EntityModified => on_entity_modified(world, session, payload),
        PacketName::EntityRemoved => on_entity_removed(world, session, payload),
        PacketName::EntityEvent => on_entity_event(world, session, payload),
        PacketName::BlueprintAdded | PacketName::BlueprintModified => {
            on_blueprint(world, session, name, payload);
        }
        PacketName::ChatAdded => on_chat(world, session, payload),
        PacketName::PlayerTeleport => on_player_teleport(world, payload),
        PacketName::Ping => world.send_to(session, PacketName::Pong, &Value::Null),
        PacketName::Pong => {
            if let Some(entry) = world.sessions.get_mut(&session) {
                entry.ping.pong_received(Instant::now());
            }
        }
    }
}

/// Client-side: install the authoritative world state from the join
/// snapshot. The client answers nothing proactively.
fn apply_snapshot(world: &mut World, payload: &Value) {
    let Some(my_id_hex) = payload.get("id").and_then(Value::as_str).map(str::to_owned) else {
        tracing::warn!("snapshot without an assigned id");
        return;
    };
    world.auth_token = payload
        .get("authToken")
        .and_then(Value::as_str)
        .map(str::to_owned);

    if let Some(chat) = payload.get("chat").and_then(Value::as_array) {
        let messages = chat.iter().filter_map(ChatMessage::from_value).collect();
        world.chat.deserialize(messages);
    }
    if let Some(blueprints) = payload.get("blueprints").and_then(Value::as_array) {
        world
            .blueprints
            .deserialize(blueprints.iter().filter_map(Blueprint::from_value).collect());
    }
    if let Some(entities) = payload.get("entities").and_then(Value::as_array) {
        let records: Vec<EntityRecord> =
            entities.iter().filter_map(EntityRecord::from_value).collect();
        world.install_snapshot_entities(&records, &my_id_hex);
    }
    world.preload_flagged_blueprints();
}

fn on_entity_added(world: &mut World, session: SessionId, payload: &Value) {
    let Some(record) = EntityRecord::from_value(payload) else {
        tracing::warn!(%session, "entityAdded with a bad record");
        return;
    };
    match record.kind {
        EntityKindTag::App => {
            world.add_app_from_record(session, &record);
        }
        EntityKindTag::Player => {
            let Some(id) = EntityId::from_hex(&record.id) else { return };
            if world.entities.get(id).is_some() {
                return;
            }
            let user = record.user.clone().unwrap_or_default();
            let mut remote =
                crate::entity::PlayerRemote::new(user, record.position, record.quaternion);
            if world.role == WorldRole::Server {
                remote.attach_body(world.physics.as_mut());
            }
            let mut entity = Entity::new(id, session, EntityKind::PlayerRemote(remote));
            entity.hot = true;
            world.entities.add(entity, false);
            world.entities.set_hot(id, true);
        }
    }
    if world.role == WorldRole::Server {
        world.broadcast(PacketName::EntityAdded, payload, Some(session));
    }
}

fn on_entity_modified(world: &mut World, session: SessionId, payload: &Value) {
    let Some(id) = payload
        .get("id")
        .and_then(Value::as_str)
        .and_then(EntityId::from_hex)
    else {
        tracing::warn!(%session, "entityModified without id");
        return;
    };
    let local_session = world.local_session;
    let Some(entity) = world.entities.get_mut(id) else {
        return;
    };
    entity.merge_modified(payload);

    let mut needs_rebuild = false;
    match &mut entity.kind {
        EntityKind::PlayerRemote(remote) => {
            remote.apply_stream(payload);
            if let Some(user_value) = payload.get("user") {
                if let Some(user) = atrium_shared::UserRecord::from_value(user_value) {
                    remote.user = user;
                }
            }
        }
        EntityKind::PlayerLocal(_) => {
            // Our own avatar: nobody else is authoritative for it.
        }
        EntityKind::App(app) => {
            if let Some(bp) = payload.get("blueprint").and_then(Value::as_str) {
                app.blueprint_id = bp.to_owned();
                needs_rebuild = true;
            }
            if let Some(uploader) = payload.get("uploader") {
                let was = app.uploader.take();
                app.uploader = uploader
                    .as_str()
                    .and_then(|s| s.strip_prefix("sess-"))
                    .and_then(|s| s.parse().ok())
                    .map(SessionId);
                if was.is_some() && app.uploader.is_none() {
                    // Upload finished: swap the placeholder for the real
                    // model.
                    needs_rebuild = true;
                }
            }
            if let Some(mover) = payload.get("mover") {
                let was = app.mover.take();
                app.mover = mover
                    .as_str()
                    .and_then(|s| s.strip_prefix("sess-"))
                    .and_then(|s| s.parse().ok())
                    .map(SessionId);
                if was.is_some() && app.mover.is_none() {
                    // Commit: authored transform is final, back to ACTIVE.
                    needs_rebuild = true;
                }
            }
            if let Some(mode) = payload
                .get("transformMode")
                .and_then(Value::as_str)
                .and_then(TransformMode::from_str_tag)
            {
                app.transform_mode = mode;
            }
            let position = payload.get("position").and_then(Value::as_vec3);
            let quaternion = payload.get("quaternion").and_then(Value::as_quat);
            if app.mover.is_some() && app.mover != Some(local_session) {
                // A foreign authoring stroke: glide, do not snap.
                if position.is_some() || quaternion.is_some() {
                    app.interp.push(
                        position.unwrap_or(app.transform.position),
                        quaternion.unwrap_or(app.transform.rotation),
                        false,
                    );
                }
            } else {
                if let Some(p) = position {
                    app.transform.position = p;
                }
                if let Some(q) = quaternion {
                    app.transform.rotation = q;
                }
            }
            if let Some(scale) = payload.get("scale").and_then(Value::as_vec3) {
                app.transform.scale = scale;
            }
            if let Some(state) = payload.get("state") {
                // A null state is a clear (authoring commit), not a literal.
                app.state_value = if state.is_null() {
                    Value::object()
                } else {
                    state.clone()
                };
            }
        }
    }
    world.dirty.mark_entity(id);
    world.refresh_app_hot(id);
    if needs_rebuild {
        world.rebuild_app_fresh(id);
    }
    if world.role == WorldRole::Server {
        world.broadcast(PacketName::EntityModified, payload, Some(session));
    }
}

fn on_entity_removed(world: &mut World, session: SessionId, payload: &Value) {
    let Some(id) = payload
        .get("id")
        .and_then(Value::as_str)
        .and_then(EntityId::from_hex)
    else {
        return;
    };
    if let Some(mut entity) = world.entities.remove(id) {
        match &mut entity.kind {
            EntityKind::App(app) => {
                // Unbuild: supersede any in-flight build, run destroy, drop
                // the scene subtree.
                let _ = app.begin_build();
                if let Some(script) = app.script.take() {
                    if script.handlers.destroy {
                        let ctx = crate::scripts::ScriptCtx {
                            app_id: id.to_hex(),
                            position: app.transform.position,
                            state: app.state_value.clone(),
                            time: world.sandbox.now(),
                        };
                        if let Err(err) = world.sandbox.call(
                            &app.blueprint_id,
                            script.version,
                            "destroy",
                            &ctx,
                            &crate::scripts::HandlerArgs::None,
                            false,
                        ) {
                            tracing::warn!(%err, app = %id, "destroy handler failed");
                        }
                    }
                }
                if let Some(root) = app.root.take() {
                    world.scene.remove_subtree(root);
                }
            }
            EntityKind::PlayerRemote(remote) => {
                remote.detach_body(world.physics.as_mut());
            }
            EntityKind::PlayerLocal(_) => {}
        }
        world.dirty.mark_entity_removed(id);
        if world.role == WorldRole::Server {
            world.broadcast(PacketName::EntityRemoved, payload, Some(session));
        }
    }
}

fn on_entity_event(world: &mut World, session: SessionId, payload: &Value) {
    let Some(parts) = payload.as_array() else {
        tracing::warn!(%session, "entityEvent with a non-array payload");
        return;
    };
    let (Some(id), Some(version), Some(name)) = (
        parts.first().and_then(Value::as_str).and_then(EntityId::from_hex),
        parts.get(1).and_then(Value::as_int),
        parts.get(2).and_then(Value::as_str).map(str::to_owned),
    ) else {
        tracing::warn!(%session, "entityEvent with a bad tuple");
        return;
    };
    let data = parts.get(3).cloned().unwrap_or(Value::Null);
    let Ok(version) = u32::try_from(version) else { return };

    world.entity_event(id, version, &name, &data, Some(session));

    if world.role == WorldRole::Server {
        // Interest-aware fan-out (everyone, today).
        let target = world.entities.get(id).map_or(Vec3::ZERO, Entity::position);
        let receivers: Vec<SessionId> = world
            .sessions
            .keys()
            .copied()
            .filter(|s| *s != session && world.interest.include(*s, target))
            .collect();
        for receiver in receivers {
            world.send_to(receiver, PacketName::EntityEvent, payload);
        }
    }
}

fn on_blueprint(world: &mut World, session: SessionId, name: PacketName, payload: &Value) {
    let Some(blueprint) = Blueprint::from_value(payload) else {
        tracing::warn!(%session, "blueprint packet with a bad record");
        return;
    };
    let id = blueprint.id.clone();
    let changed = world.blueprints.upsert_replicated(blueprint);
    if !changed {
        return;
    }
    world.dirty.mark_blueprint(&id);

    // Every app on this blueprint rebuilds against the new version.
    let affected: Vec<EntityId> = world
        .entities
        .iter()
        .filter(|e| e.as_app().is_some_and(|a| a.blueprint_id == id))
        .map(|e| e.id)
        .collect();
    for app_id in affected {
        world.rebuild_app_fresh(app_id);
    }

    if world.role == WorldRole::Server {
        world.broadcast(name, payload, Some(session));
    }
}

fn on_chat(world: &mut World, session: SessionId, payload: &Value) {
    let Some(message) = ChatMessage::from_value(payload) else {
        tracing::warn!(%session, "chatAdded with a bad record");
        return;
    };
    if world.role == WorldRole::Client {
        world.chat.add(message);
        return;
    }
    match parse_command(&message.body) {
        CommandOutcome::NotACommand => {
            world.chat.add(message);
            world.dirty.chat = true;
            world.broadcast(PacketName::ChatAdded, payload, Some(session));
        }
        CommandOutcome::SetName { name } => apply_set_name(world, session, name),
        CommandOutcome::GrantAdmin { code } => apply_grant_admin(world, session, &code),
        CommandOutcome::SpawnSet => apply_spawn(world, session, true),
        CommandOutcome::SpawnClear => apply_spawn(world, session, false),
        CommandOutcome::Unknown { command } => {
            system_reply(world, session, format!("unknown command /{command}"));
        }
    }
}

fn on_player_teleport(world: &mut World, payload: &Value) {
    let Some(local_id) = world.entities.local_player() else {
        return;
    };
    let Some(position) = payload.get("position").and_then(Value::as_vec3) else {
        return;
    };
    let yaw = payload.get("yaw").and_then(Value::as_f32);
    if let Some(mut entity) = world.entities.take(local_id) {
        if let EntityKind::PlayerLocal(player) = &mut entity.kind {
            player.teleport(world.physics.as_mut(), position, yaw);
        }
        world.entities.put_back(entity);
    }
}

fn system_reply(world: &mut World, session: SessionId, body: String) {
    let notice = ChatLog::system_message(body, World::epoch_secs());
    world.send_to(session, PacketName::ChatAdded, &notice.to_value());
}

fn apply_set_name(world: &mut World, session: SessionId, name: String) {
    let Some(player_id) = world.entities.player_of_session(session) else {
        return;
    };
    let mut user_payload = None;
    if let Some(entity) = world.entities.get_mut(player_id) {
        if let EntityKind::PlayerRemote(remote) = &mut entity.kind {
            remote.user.name = name.clone();
            user_payload = Some(remote.user.to_value());
            entity.version += 1;
        }
    }
    if let Some(user_value) = user_payload {
        let user_id = user_value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if let Some(user) = world.users.get_mut(&user_id) {
            user.name = name;
            world.dirty.mark_user(&user_id);
        }
        let payload = obj(&[
            ("id", Value::Str(player_id.to_hex())),
            ("user", user_value),
        ]);
        world.broadcast(PacketName::EntityModified, &payload, None);
    }
}

fn apply_grant_admin(world: &mut World, session: SessionId, code: &str) {
    let granted = world
        .settings
        .admin_code
        .as_deref()
        .is_some_and(|expected| !expected.is_empty() && expected == code);
    if !granted {
        system_reply(world, session, "invalid admin code".to_owned());
        return;
    }
    let Some(player_id) = world.entities.player_of_session(session) else {
        return;
    };
    if let Some(entity) = world.entities.get_mut(player_id) {
        if let EntityKind::PlayerRemote(remote) = &mut entity.kind {
            if !remote.user.has_role("admin") {
                remote.user.roles.push("admin".to_owned());
            }
            let user_id = remote.user.id.clone();
            let roles = remote.user.roles.clone();
            if let Some(user) = world.users.get_mut(&user_id) {
                user.roles = roles;
            }
            world.dirty.mark_user(&user_id);
        }
    }
    system_reply(world, session, "admin granted".to_owned());
}

fn apply_spawn(world: &mut World, session: SessionId, set: bool) {
    let Some(player_id) = world.entities.player_of_session(session) else {
        return;
    };
    let authorized = world
        .entities
        .get(player_id)
        .and_then(Entity::user)
        .is_some_and(atrium_shared::UserRecord::is_builder);
    if !authorized {
        system_reply(world, session, "you are not allowed to do that".to_owned());
        return;
    }
    if set {
        let entity = world.entities.get(player_id);
        let (position, quaternion) =
            entity.map_or((Vec3::ZERO, atrium_shared::Quat::IDENTITY), |e| {
                (e.position(), e.rotation())
            });
        world.spawn = atrium_shared::SpawnPoint { position, quaternion };
        system_reply(world, session, "spawn set".to_owned());
    } else {
        world.spawn = atrium_shared::SpawnPoint::default();
        system_reply(world, session, "spawn cleared".to_owned());
    }
    world.dirty.spawn = true;
}
