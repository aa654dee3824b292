//! # World
//!
//! The simulation-thread owner of everything: entity store, blueprint
//! registry, asset cache, chat log, event bus, scene graph, physics seam,
//! script sandbox, sessions and dirty sets. There are no singletons; every
//! collaborator is a field here and is passed down explicitly.
//!
//! A `World` runs in one of two roles. The **server** owns identity,
//! admission and persistence and rebroadcasts every mutation. A **client**
//! applies the authoritative stream, simulates its own avatar, and runs the
//! same app scripts.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use atrium_core::{EntityId, EventBus, Node, SceneGraph};
use atrium_networking::{NetCommand, NetEvent, Session, SessionId, WsClient, WsServer};
use atrium_shared::value::obj;
use atrium_shared::{
    encode, Blueprint, EntityRecord, PacketName, SpawnPoint, Transform, UserRecord, Value, Vec3,
};

use crate::assets::{Asset, AssetCache, AssetKey, AssetType, AssetWaiter};
use crate::blueprints::BlueprintRegistry;
use crate::chat::ChatLog;
use crate::entity::{
    App, AppState, DeferredEvent, Entity, EntityKind, EntityStore, InputState, PlayerLocal,
    PlayerRemote, ScriptInstance, TransformMode,
};
use crate::persistence::{DirtySets, Persistence, SaveBatch, StatusReport, WorldStore};
use crate::physics::PhysicsScene;
use crate::replicator;
use crate::scripts::{HandlerArgs, ScriptCtx, ScriptSandbox};
use crate::settings::Settings;

/// Which side of the wire this world is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorldRole {
    /// Authoritative server.
    Server,
    /// Tick-synchronized client.
    Client,
}

/// An outbound packet decision, drained in the post-late phase.
#[derive(Debug)]
pub enum Outbound {
    /// Send to one session.
    To(SessionId, Vec<u8>),
    /// Send to every session except the originator.
    Broadcast {
        /// Originating session to skip.
        except: Option<SessionId>,
        /// Encoded packet.
        bytes: Vec<u8>,
    },
    /// Close a session's socket.
    Kick(SessionId),
}

/// The socket stack a world flushes its outbox through.
pub enum NetSink {
    /// Server listener handle.
    Server(WsServer),
    /// Client socket handle.
    Client(WsClient),
}

/// The world.
pub struct World {
    /// Configuration, loaded once.
    pub settings: Settings,
    /// Server or client.
    pub role: WorldRole,
    /// Our own session id (SERVER on the server, the assigned id on a
    /// client once the snapshot lands).
    pub local_session: SessionId,

    /// Live entities.
    pub entities: EntityStore,
    /// Blueprint catalog.
    pub blueprints: BlueprintRegistry,
    /// Scripted-resource cache.
    pub assets: AssetCache,
    /// Chat ring.
    pub chat: ChatLog,
    /// Local named events.
    pub bus: EventBus,
    /// Scene-graph arena.
    pub scene: SceneGraph,
    /// Rigid-body collaborator.
    pub physics: Box<dyn PhysicsScene>,
    /// Script sandbox.
    pub sandbox: ScriptSandbox,

    /// Connected sockets (server) or the server peer (client).
    pub sessions: HashMap<SessionId, Session>,
    /// User catalog by user id (server).
    pub users: HashMap<String, UserRecord>,
    /// Auth token -> user id (server).
    auth_tokens: HashMap<String, String>,
    /// World spawn pose.
    pub spawn: SpawnPoint,

    /// Unsaved changes.
    pub dirty: DirtySets,
    /// Flush driver.
    pub persistence: Persistence,
    /// Persistence backend (server only).
    pub store: Option<Box<dyn WorldStore>>,
    /// Broadcast filter; everyone by default.
    pub interest: Box<dyn replicator::InterestPolicy>,

    /// Frame input for the local player (client).
    pub input: InputState,
    /// Token the server handed us (client).
    pub auth_token: Option<String>,

    outbox: Vec<Outbound>,
    injected: VecDeque<NetEvent>,
    net_rx: Option<crossbeam_channel::Receiver<NetEvent>>,
    sink: Option<NetSink>,
    started: Instant,
    frames: u64,
}

impl World {
    /// Creates a world.
    #[must_use]
    pub fn new(
        settings: Settings,
        role: WorldRole,
        physics: Box<dyn PhysicsScene>,
        assets: AssetCache,
        store: Option<Box<dyn WorldStore>>,
    ) -> Self {
        let save_interval = settings.save_interval;
        Self {
            settings,
            role,
            local_session: SessionId::SERVER,
            entities: EntityStore::new(),
            blueprints: BlueprintRegistry::new(),
            assets,
            chat: ChatLog::new(),
            bus: EventBus::new(),
            scene: SceneGraph::new(),
            physics,
            sandbox: ScriptSandbox::new(),
            sessions: HashMap::new(),
            users: HashMap::new(),
            auth_tokens: HashMap::new(),
            spawn: SpawnPoint::default(),
            dirty: DirtySets::default(),
            persistence: Persistence::new(save_interval),
            store,
            interest: Box::new(replicator::Everyone),
            input: InputState::default(),
            auth_token: None,
            outbox: Vec::new(),
            injected: VecDeque::new(),
            net_rx: None,
            sink: None,
            started: Instant::now(),
            frames: 0,
        }
    }

    /// Attaches the socket stack.
    pub fn attach_net(&mut self, sink: NetSink, rx: crossbeam_channel::Receiver<NetEvent>) {
        self.sink = Some(sink);
        self.net_rx = Some(rx);
    }

    /// Seconds since the world started.
    #[must_use]
    pub fn now_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Wall-clock seconds since the Unix epoch, for chat timestamps.
    #[must_use]
    pub fn epoch_secs() -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64())
    }

    /// Feeds a network event directly (tests and in-process peers).
    pub fn inject_net_event(&mut self, event: NetEvent) {
        self.injected.push_back(event);
    }

    /// Queues an encoded packet toward one session.
    pub fn send_to(&mut self, session: SessionId, name: PacketName, payload: &Value) {
        match encode(name, payload) {
            Ok(bytes) => self.outbox.push(Outbound::To(session, bytes)),
            Err(err) => tracing::error!(%err, packet = name.as_str(), "encode failed"),
        }
    }

    /// Queues an encoded packet to every session except `except`.
    pub fn broadcast(&mut self, name: PacketName, payload: &Value, except: Option<SessionId>) {
        match encode(name, payload) {
            Ok(bytes) => self.outbox.push(Outbound::Broadcast { except, bytes }),
            Err(err) => tracing::error!(%err, packet = name.as_str(), "encode failed"),
        }
    }

    /// Queues a socket close.
    pub fn kick(&mut self, session: SessionId) {
        self.outbox.push(Outbound::Kick(session));
    }

    /// Takes the pending outbound packets (tests and in-process peers).
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    // ====================================================================
    // FRAME PHASES (driven by the tick engine)
    // ====================================================================

    /// Drains sockets, asset completions and keepalive work. Runs between
    /// frames, never mid-phase.
    pub fn drain_between_frames(&mut self) {
        // Injected events first, then the socket channel.
        while let Some(event) = self.injected.pop_front() {
            replicator::handle_net_event(self, event);
        }
        if let Some(rx) = self.net_rx.take() {
            while let Ok(event) = rx.try_recv() {
                replicator::handle_net_event(self, event);
            }
            self.net_rx = Some(rx);
        }

        // Asset completions.
        let drained = self.assets.drain();
        for resolved in drained.resolved {
            for waiter in resolved.waiters {
                match waiter {
                    AssetWaiter::AppBuild { entity, generation } => {
                        self.continue_app_build(entity, generation);
                    }
                    AssetWaiter::ScriptFetch {
                        entity,
                        generation,
                        request,
                    } => {
                        self.deliver_script_fetch(entity, generation, request, &resolved.key, resolved.outcome.as_ref().is_ok());
                    }
                    AssetWaiter::Preload { .. } => {}
                }
            }
        }
        for group in drained.preloads_ready {
            self.bus.emit("ready", &Value::Int(i64::from(group)));
        }

        // Keepalive.
        let now = Instant::now();
        let ping_rate = self.settings.ping_rate;
        let mut to_ping = Vec::new();
        let mut to_drop = Vec::new();
        for session in self.sessions.values_mut() {
            if session
                .ping
                .timed_out(now, atrium_shared::constants::PING_TIMEOUT_SECS)
            {
                to_drop.push(session.id);
            } else if now >= session.ping.next_ping_at {
                session.ping.ping_sent(now, ping_rate);
                to_ping.push(session.id);
            }
        }
        for session in to_ping {
            self.send_to(session, PacketName::Ping, &Value::Null);
        }
        for session in to_drop {
            tracing::info!(%session, "keepalive timeout, dropping");
            self.kick(session);
            replicator::handle_net_event(self, NetEvent::Disconnected { session });
        }
    }

    /// Fixed 50 Hz phase: controllers, script `fixed_update`, the physics
    /// step.
    pub fn fixed_update(&mut self, dt: f32) {
        for id in self.entities.hot_ids() {
            let Some(mut entity) = self.entities.take(id) else {
                continue;
            };
            let mut crashed = false;
            match &mut entity.kind {
                EntityKind::PlayerLocal(player) => {
                    player.fixed_update(self.physics.as_mut(), &self.input, dt);
                }
                EntityKind::App(_) => {
                    crashed = self.call_app_handler(&mut entity, "fixed_update", &HandlerArgs::Dt(dt));
                }
                EntityKind::PlayerRemote(_) => {}
            }
            self.entities.put_back(entity);
            if crashed {
                self.crash_app(id);
            }
        }
        self.physics.step(dt);
    }

    /// Variable phase: remote interpolation, script `update`, pose stream,
    /// authoring strokes, persistence clock.
    pub fn update(&mut self, dt: f32) {
        for id in self.entities.hot_ids() {
            let Some(mut entity) = self.entities.take(id) else {
                continue;
            };
            let id_hex = entity.id.to_hex();
            let mut crashed = false;
            match &mut entity.kind {
                EntityKind::PlayerLocal(player) => {
                    if let Some(payload) = player.update(&self.input, &id_hex, dt) {
                        self.broadcast(PacketName::EntityModified, &payload, None);
                    }
                }
                EntityKind::PlayerRemote(remote) => {
                    remote.update(Some(self.physics.as_mut()), dt);
                }
                EntityKind::App(app) => {
                    // Authoring stroke stream while we are the mover.
                    if app.mover == Some(self.local_session)
                        && app.stream_due(dt, self.settings.network_rate)
                    {
                        let mut payload = obj(&[
                            ("id", Value::Str(id_hex.clone())),
                            ("position", Value::from_vec3(app.transform.position)),
                            ("quaternion", Value::from_quat(app.transform.rotation)),
                        ]);
                        if app.transform_mode == TransformMode::Scale {
                            payload.set("scale", Value::from_vec3(app.transform.scale));
                        }
                        self.broadcast(PacketName::EntityModified, &payload, None);
                    }
                    // Foreign mover: glide toward the streamed pose.
                    if app.mover.is_some() && app.mover != Some(self.local_session) {
                        app.interp.advance(dt);
                        let (p, q) = app.interp.sample();
                        app.transform.position = p;
                        app.transform.rotation = q;
                    }
                    crashed = self.call_app_handler(&mut entity, "update", &HandlerArgs::Dt(dt));
                }
            }
            self.entities.put_back(entity);
            if crashed {
                self.crash_app(id);
            }
        }

        // Persistence interval.
        if self.persistence.due(dt) {
            self.flush_dirty();
        }
    }

    /// Late phase: cameras and script `late_update`.
    pub fn late_update(&mut self, dt: f32) {
        for id in self.entities.hot_ids() {
            let Some(mut entity) = self.entities.take(id) else {
                continue;
            };
            let mut crashed = false;
            match &mut entity.kind {
                EntityKind::PlayerLocal(player) => player.late_update(dt),
                EntityKind::App(_) => {
                    crashed = self.call_app_handler(&mut entity, "late_update", &HandlerArgs::Dt(dt));
                }
                EntityKind::PlayerRemote(_) => {}
            }
            self.entities.put_back(entity);
            if crashed {
                self.crash_app(id);
            }
        }
    }

    /// Post-late phase: flush the outbox through the socket stack.
    pub fn post_late_update(&mut self, _dt: f32) {
        self.frames += 1;
        if self.sink.is_none() {
            return;
        }
        let outbox = std::mem::take(&mut self.outbox);
        let Some(sink) = &self.sink else { return };
        for item in outbox {
            match (sink, item) {
                (NetSink::Server(server), Outbound::To(session, bytes)) => {
                    server.send(NetCommand::Send { session, bytes });
                }
                (NetSink::Server(server), Outbound::Broadcast { except, bytes }) => {
                    server.send(NetCommand::Broadcast { except, bytes });
                }
                (NetSink::Server(server), Outbound::Kick(session)) => {
                    server.send(NetCommand::Kick { session });
                }
                (NetSink::Client(client), Outbound::To(_, bytes))
                | (NetSink::Client(client), Outbound::Broadcast { bytes, .. }) => {
                    client.send(bytes);
                }
                (NetSink::Client(client), Outbound::Kick(_)) => client.close(),
            }
        }
    }

    // ====================================================================
    // USERS & SESSIONS
    // ====================================================================

    /// Authenticates a socket: token rehydrates its user, otherwise a
    /// fresh guest identity is minted.
    pub fn authenticate(&mut self, session: SessionId, token: Option<&str>) -> UserRecord {
        if let Some(user_id) = token.and_then(|t| self.auth_tokens.get(t)).cloned() {
            if let Some(user) = self.users.get(&user_id) {
                return user.clone();
            }
        }
        let user = UserRecord {
            id: atrium_core::short_id(),
            name: format!("guest-{}", &atrium_core::short_id()[..4]),
            roles: Vec::new(),
            avatar: None,
        };
        self.users.insert(user.id.clone(), user.clone());
        self.dirty.mark_user(&user.id);
        tracing::debug!(%session, user = %user.id, "minted guest identity");
        user
    }

    /// Mints (and indexes) a fresh auth token for a user.
    pub fn mint_auth_token(&mut self, user_id: &str) -> String {
        let token = format!("{}{}", atrium_core::short_id(), atrium_core::short_id());
        self.auth_tokens.insert(token.clone(), user_id.to_owned());
        token
    }

    /// Spawns a player entity for a session.
    pub fn spawn_player(&mut self, session: SessionId, user: UserRecord, local: bool) -> EntityId {
        let id = EntityId::random();
        let kind = if local {
            let player = PlayerLocal::new(
                user,
                self.physics.as_mut(),
                self.spawn.position,
                self.settings.network_rate,
            );
            EntityKind::PlayerLocal(player)
        } else {
            let mut remote =
                PlayerRemote::new(user, self.spawn.position, self.spawn.quaternion);
            if self.role == WorldRole::Server {
                remote.attach_body(self.physics.as_mut());
            }
            EntityKind::PlayerRemote(remote)
        };
        let mut entity = Entity::new(id, session, kind);
        entity.hot = true;
        self.entities.add(entity, local);
        self.entities.set_hot(id, true);
        self.dirty.mark_entity(id);
        id
    }

    /// Removes a session's player and clears authoring tags pointing at the
    /// departed socket; affected apps rebuild.
    pub fn forget_session(&mut self, session: SessionId) {
        self.sessions.remove(&session);
        if let Some(player_id) = self.entities.player_of_session(session) {
            if let Some(mut entity) = self.entities.remove(player_id) {
                if let EntityKind::PlayerRemote(remote) = &mut entity.kind {
                    remote.detach_body(self.physics.as_mut());
                }
                self.dirty.mark_entity_removed(player_id);
                let payload = obj(&[("id", Value::Str(player_id.to_hex()))]);
                self.broadcast(PacketName::EntityRemoved, &payload, Some(session));
            }
        }
        for app_id in self.entities.apps_tagged_by(session) {
            if let Some(app) = self.entities.get_mut(app_id).and_then(Entity::as_app_mut) {
                if app.mover == Some(session) {
                    app.mover = None;
                }
                if app.uploader == Some(session) {
                    app.uploader = None;
                }
            }
            self.rebuild_app_fresh(app_id);
            let payload = obj(&[
                ("id", Value::Str(app_id.to_hex())),
                ("mover", Value::Null),
                ("uploader", Value::Null),
            ]);
            self.broadcast(PacketName::EntityModified, &payload, Some(session));
        }
    }

    // ====================================================================
    // APP LIFECYCLE
    // ====================================================================

    /// Rebuilds the entity store from snapshot records: our own record
    /// becomes the local player, foreign players become replicas, apps
    /// become shells whose first builds start immediately.
    pub fn install_snapshot_entities(&mut self, records: &[EntityRecord], my_id_hex: &str) {
        let physics = self.physics.as_mut();
        let network_rate = self.settings.network_rate;
        self.entities.deserialize(records, |record| {
            let id = EntityId::from_hex(&record.id)?;
            match record.kind {
                atrium_shared::EntityKindTag::App => {
                    // Shells only; builds start once the store settles.
                    let entity =
                        Entity::new(id, SessionId::SERVER, EntityKind::App(app_shell(record)));
                    Some((entity, false))
                }
                atrium_shared::EntityKindTag::Player => {
                    let user = record.user.clone().unwrap_or_default();
                    let is_self = record.id == my_id_hex;
                    let mut entity = if is_self {
                        let player =
                            PlayerLocal::new(user, physics, record.position, network_rate);
                        Entity::new(id, SessionId::SERVER, EntityKind::PlayerLocal(player))
                    } else {
                        let remote =
                            PlayerRemote::new(user, record.position, record.quaternion);
                        Entity::new(id, SessionId::SERVER, EntityKind::PlayerRemote(remote))
                    };
                    entity.hot = true;
                    Some((entity, is_self))
                }
            }
        });
        for record in records {
            if record.kind == atrium_shared::EntityKindTag::App {
                if let Some(id) = EntityId::from_hex(&record.id) {
                    self.dirty.mark_entity(id);
                    self.request_app_build(id);
                }
            }
        }
    }

    /// Creates an app entity shell from a record (snapshot, entityAdded)
    /// and kicks off its first build.
    pub fn add_app_from_record(&mut self, owner: SessionId, record: &EntityRecord) -> Option<EntityId> {
        let id = EntityId::from_hex(&record.id)?;
        let entity = Entity::new(id, owner, EntityKind::App(app_shell(record)));
        if !self.entities.add(entity, false) {
            return None;
        }
        self.dirty.mark_entity(id);
        self.request_app_build(id);
        Some(id)
    }

    /// Rebuild triggered by a content change (new blueprint version, upload
    /// finished, authoring commit): the crash flag resets so a fixed
    /// blueprint gets a clean attempt.
    pub fn rebuild_app_fresh(&mut self, id: EntityId) {
        if let Some(app) = self.entities.get_mut(id).and_then(Entity::as_app_mut) {
            app.crashed_flag = false;
        }
        self.request_app_build(id);
    }

    /// Starts (or restarts) an app build. Any in-flight build for the app
    /// is superseded by the new generation.
    pub fn request_app_build(&mut self, id: EntityId) {
        let Some(entity) = self.entities.get_mut(id) else {
            return;
        };
        let Some(app) = entity.as_app_mut() else { return };
        let generation = app.begin_build();
        let blueprint_id = app.blueprint_id.clone();
        let uploader_is_foreign =
            app.uploader.is_some() && app.uploader != Some(self.local_session);

        let Some(blueprint) = self.blueprints.get(&blueprint_id).cloned() else {
            // Step 1 failure: no blueprint, straight to the crash block.
            self.finish_app_build(id, generation);
            return;
        };

        let mut wanted = Vec::new();
        if let Some(script_url) = &blueprint.script {
            wanted.push(AssetKey::new(AssetType::Script, script_url.clone()));
        }
        if !uploader_is_foreign {
            if let Some(model_url) = &blueprint.model {
                let ty = if model_url.ends_with(".vrm") {
                    AssetType::Avatar
                } else {
                    AssetType::Model
                };
                wanted.push(AssetKey::new(ty, model_url.clone()));
            }
        }

        if wanted.is_empty() {
            self.finish_app_build(id, generation);
            return;
        }
        for key in wanted {
            self.assets.load(key, AssetWaiter::AppBuild { entity: id, generation });
        }
    }

    /// An awaited asset resolved; finish the build if everything is in and
    /// the generation still stands.
    fn continue_app_build(&mut self, id: EntityId, generation: u32) {
        let Some(entity) = self.entities.get(id) else { return };
        let Some(app) = entity.as_app() else { return };
        if !app.build_current(generation) || !app.building {
            // Superseded build: abort without touching state.
            return;
        }
        let Some(blueprint) = self.blueprints.get(&app.blueprint_id) else {
            self.finish_app_build(id, generation);
            return;
        };
        let uploader_is_foreign =
            app.uploader.is_some() && app.uploader != Some(self.local_session);
        let mut all_resolved = true;
        if let Some(script_url) = &blueprint.script {
            let key = AssetKey::new(AssetType::Script, script_url.clone());
            all_resolved &= self.assets.outcome(&key).is_some();
        }
        if !uploader_is_foreign {
            if let Some(model_url) = &blueprint.model {
                let ty = if model_url.ends_with(".vrm") {
                    AssetType::Avatar
                } else {
                    AssetType::Model
                };
                let key = AssetKey::new(ty, model_url.clone());
                all_resolved &= self.assets.outcome(&key).is_some();
            }
        }
        if all_resolved {
            self.finish_app_build(id, generation);
        }
    }

    /// Completes a build: unbuild the previous version, stamp the new scene
    /// subtree, start the script, drain deferred events.
    fn finish_app_build(&mut self, id: EntityId, generation: u32) {
        let Some(mut entity) = self.entities.take(id) else { return };
        let entity_hex = entity.id.to_hex();
        let Some(app) = entity.as_app_mut() else {
            self.entities.put_back(entity);
            return;
        };
        if !app.build_current(generation) {
            // A newer build superseded us mid-flight.
            self.entities.put_back(entity);
            return;
        }

        let blueprint = self.blueprints.get(&app.blueprint_id).cloned();
        let mut crashed = app.crashed_flag;
        let mut script_source = None;
        let mut model_label = String::from("crash-block");

        match &blueprint {
            None => crashed = true,
            Some(bp) => {
                if let Some(script_url) = &bp.script {
                    let key = AssetKey::new(AssetType::Script, script_url.clone());
                    match self.assets.outcome(&key) {
                        Some(Ok(asset)) => {
                            if let Asset::Script(source) = asset.as_ref() {
                                script_source = Some(source.clone());
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(%err, app = %entity_hex, "script fetch failed");
                            crashed = true;
                        }
                        None => crashed = true,
                    }
                }
                let uploader_is_foreign =
                    app.uploader.is_some() && app.uploader != Some(self.local_session);
                if uploader_is_foreign {
                    model_label = String::from("placeholder-cube");
                } else if let Some(model_url) = &bp.model {
                    let ty = if model_url.ends_with(".vrm") {
                        AssetType::Avatar
                    } else {
                        AssetType::Model
                    };
                    match self.assets.outcome(&AssetKey::new(ty, model_url.clone())) {
                        Some(Ok(_)) => model_label = model_url.clone(),
                        Some(Err(err)) => {
                            tracing::warn!(%err, app = %entity_hex, "model fetch failed");
                            crashed = true;
                        }
                        None => crashed = true,
                    }
                }
                // No model at all leaves `model_label` at the crash-block
                // default: an empty root always shows the built-in
                // crash-block model, crashed or not.
            }
        }

        // Unbuild the previous version: tell the old script goodbye, drop
        // the old subtree, release the script instance.
        if let Some(prev) = app.script.take() {
            if prev.handlers.destroy {
                let ctx = ScriptCtx {
                    app_id: entity_hex.clone(),
                    position: app.transform.position,
                    state: app.state_value.clone(),
                    time: self.sandbox.now(),
                };
                if let Err(err) = self.sandbox.call(
                    &app.blueprint_id,
                    prev.version,
                    "destroy",
                    &ctx,
                    &HandlerArgs::None,
                    false,
                ) {
                    // Destroy failures cannot stop the unbuild.
                    tracing::warn!(%err, app = %entity_hex, "destroy handler failed");
                }
            }
        }
        if let Some(old_root) = app.root.take() {
            self.scene.remove_subtree(old_root);
        }

        app.crashed_flag = crashed;
        let status = app.resolve_state(self.local_session);
        app.status = status;
        app.building = false;
        let version = blueprint.as_ref().map_or(0, |bp| bp.version);
        app.built_version = version;

        // Stamp the new subtree: the decoded model's factory when one is
        // ready, a named stand-in node otherwise.
        let template = blueprint
            .as_ref()
            .filter(|_| status.subtree_active())
            .and_then(|bp| bp.model.as_ref())
            .and_then(|model_url| {
                let ty = if model_url.ends_with(".vrm") {
                    AssetType::Avatar
                } else {
                    AssetType::Model
                };
                self.assets.get(ty, model_url)
            })
            .and_then(|asset| match asset.as_ref() {
                Asset::Scene(template) => Some(template.clone()),
                _ => None,
            });
        let root = match &template {
            Some(template) if model_label == template.url => {
                template.instantiate(&mut self.scene, None, app.transform)
            }
            _ => {
                let label = if status == AppState::Crashed {
                    "crash-block".to_owned()
                } else {
                    model_label
                };
                self.scene.insert(Node::new(label, app.transform), None)
            }
        };
        if let Some(node) = self.scene.get_mut(root) {
            node.active = status.subtree_active();
            // Physics participates only when the app is not being carried.
            node.layer = if status == AppState::Moving
                || status == AppState::Rotating
                || status == AppState::Scaling
            {
                0
            } else {
                crate::physics::LayerMask::PROP.0
            };
        }
        app.root = Some(root);

        // Pose interpolators for foreign authoring strokes.
        app.interp = atrium_networking::PoseInterpolator::new(
            app.transform.position,
            app.transform.rotation,
            1.0 / self.settings.network_rate,
        );

        let blueprint_id = app.blueprint_id.clone();
        if status == AppState::Active && !crashed {
            if let Some(source) = script_source {
                match self.sandbox.compile(&blueprint_id, version, &source) {
                    Ok(handlers) => {
                        app.script = Some(ScriptInstance { version, handlers });
                    }
                    Err(err) => {
                        tracing::warn!(%err, app = %entity_hex, "script compile failed");
                        app.crashed_flag = true;
                    }
                }
            }
        }
        let deferred = app.drain_deferred(version);
        let compile_crashed = app.crashed_flag && !crashed;
        let has_start = app.script.as_ref().is_some_and(|s| s.handlers.start);
        let has_script = app.script.is_some();

        self.entities.put_back(entity);
        self.refresh_app_hot(id);
        self.sandbox.retire_versions(&blueprint_id, version);

        if compile_crashed {
            // Compile failed after state resolution: rebuild into the
            // crash block.
            self.request_app_build(id);
            return;
        }

        // Run start (or just the top-level statements); a throw routes to
        // the crash path.
        if has_script && status == AppState::Active {
            let ok = if has_start {
                self.run_script_handler(id, "start", &HandlerArgs::None, true)
            } else {
                self.run_script_globals(id)
            };
            if !ok {
                self.crash_app(id);
                return;
            }
        }

        // Replay events held across the rebuild, in order; a throwing
        // listener is logged, later events still fire.
        for event in deferred {
            self.fire_app_event(id, &event);
        }
    }

    /// Recomputes an app's hot membership: scripts with update-phase
    /// handlers tick, and so does any app with a live mover (stroke
    /// streaming on the authoring side, interpolation everywhere else).
    pub fn refresh_app_hot(&mut self, id: EntityId) {
        let Some(hot) = self.entities.get(id).and_then(Entity::as_app).map(|app| {
            let scripted = app
                .script
                .as_ref()
                .is_some_and(|s| s.handlers.needs_tick())
                && app.status == AppState::Active;
            scripted || app.mover.is_some()
        }) else {
            return;
        };
        self.entities.set_hot(id, hot);
    }

    /// Runs only the top-level statements of an app's script.
    fn run_script_globals(&mut self, id: EntityId) -> bool {
        let Some(entity) = self.entities.get(id) else { return true };
        let Some(app) = entity.as_app() else { return true };
        let Some(script) = &app.script else { return true };
        let ctx = ScriptCtx {
            app_id: id.to_hex(),
            position: app.transform.position,
            state: app.state_value.clone(),
            time: self.sandbox.now(),
        };
        let version = script.version;
        let blueprint_id = app.blueprint_id.clone();
        match self.sandbox.run_globals(&blueprint_id, version, &ctx) {
            Ok(effects) => {
                if let Some(app) = self.entities.get_mut(id).and_then(Entity::as_app_mut) {
                    Self::apply_effects_to(app, &mut self.bus, &mut self.assets, &mut self.dirty, &mut self.outbox, id, version, effects);
                }
                true
            }
            Err(err) => {
                tracing::warn!(%err, app = %id, "script globals failed");
                false
            }
        }
    }

    /// Routes a script failure: mark crashed and rebuild into the crash
    /// block. Peers observe the rebuild through an entityModified cycle.
    pub fn crash_app(&mut self, id: EntityId) {
        if let Some(app) = self.entities.get_mut(id).and_then(Entity::as_app_mut) {
            app.crashed_flag = true;
        }
        self.request_app_build(id);
        let payload = obj(&[("id", Value::Str(id.to_hex()))]);
        self.broadcast(PacketName::EntityModified, &payload, None);
    }

    /// Dispatches an entity event to an app, honoring the version gate.
    pub fn entity_event(
        &mut self,
        id: EntityId,
        version: u32,
        name: &str,
        data: &Value,
        origin: Option<SessionId>,
    ) {
        let Some(entity) = self.entities.get_mut(id) else { return };
        let Some(app) = entity.as_app_mut() else { return };
        let blueprint_version = app.built_version;
        match app.classify_event(version, blueprint_version) {
            crate::entity::EventDisposition::Discard => {}
            crate::entity::EventDisposition::Defer => {
                app.defer_event(DeferredEvent {
                    version,
                    name: name.to_owned(),
                    data: data.clone(),
                    origin,
                });
            }
            crate::entity::EventDisposition::Fire => {
                let event = DeferredEvent {
                    version,
                    name: name.to_owned(),
                    data: data.clone(),
                    origin,
                };
                self.fire_app_event(id, &event);
            }
        }
    }

    fn fire_app_event(&mut self, id: EntityId, event: &DeferredEvent) {
        let has_handler = self
            .entities
            .get(id)
            .and_then(Entity::as_app)
            .and_then(|a| a.script.as_ref())
            .is_some_and(|s| s.handlers.on_event);
        if !has_handler {
            return;
        }
        let args = HandlerArgs::Event {
            name: event.name.clone(),
            data: event.data.clone(),
        };
        // Listener isolation: a throw here is logged, not propagated.
        if !self.run_script_handler(id, "on_event", &args, false) {
            tracing::warn!(app = %id, event = %event.name, "event listener failed");
        }
    }

    /// Calls one script phase handler on an app entity already taken from
    /// the store. Effects are applied afterwards. Returns true when the
    /// script threw and the app must crash.
    fn call_app_handler(&mut self, entity: &mut Entity, handler: &str, args: &HandlerArgs) -> bool {
        let id = entity.id;
        let Some(app) = entity.as_app_mut() else { return false };
        let Some(script) = &app.script else { return false };
        let wanted = match handler {
            "fixed_update" => script.handlers.fixed_update,
            "update" => script.handlers.update,
            "late_update" => script.handlers.late_update,
            _ => false,
        };
        if !wanted || app.status != AppState::Active {
            return false;
        }
        let ctx = ScriptCtx {
            app_id: id.to_hex(),
            position: app.transform.position,
            state: app.state_value.clone(),
            time: self.sandbox.now(),
        };
        let version = script.version;
        let blueprint_id = app.blueprint_id.clone();
        match self
            .sandbox
            .call(&blueprint_id, version, handler, &ctx, args, false)
        {
            Ok(effects) => {
                Self::apply_effects_to(app, &mut self.bus, &mut self.assets, &mut self.dirty, &mut self.outbox, id, version, effects);
                false
            }
            Err(err) => {
                tracing::warn!(%err, app = %id, handler, "script failed; crashing app");
                true
            }
        }
    }

    /// Runs a handler on an app that is still in the store. Returns false
    /// when the script threw.
    fn run_script_handler(&mut self, id: EntityId, handler: &str, args: &HandlerArgs, run_globals: bool) -> bool {
        let Some(entity) = self.entities.get(id) else { return true };
        let Some(app) = entity.as_app() else { return true };
        let Some(script) = &app.script else { return true };
        let ctx = ScriptCtx {
            app_id: id.to_hex(),
            position: app.transform.position,
            state: app.state_value.clone(),
            time: self.sandbox.now(),
        };
        let version = script.version;
        let blueprint_id = app.blueprint_id.clone();
        match self
            .sandbox
            .call(&blueprint_id, version, handler, &ctx, args, run_globals)
        {
            Ok(effects) => {
                if let Some(app) = self.entities.get_mut(id).and_then(Entity::as_app_mut) {
                    Self::apply_effects_to(app, &mut self.bus, &mut self.assets, &mut self.dirty, &mut self.outbox, id, version, effects);
                }
                true
            }
            Err(err) => {
                tracing::warn!(%err, app = %id, handler, "script failed");
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_effects_to(
        app: &mut App,
        bus: &mut EventBus,
        assets: &mut AssetCache,
        dirty: &mut DirtySets,
        outbox: &mut Vec<Outbound>,
        id: EntityId,
        version: u32,
        effects: crate::scripts::ScriptEffects,
    ) {
        if let Some(state) = effects.state {
            app.state_value = state;
            dirty.mark_entity(id);
        }
        if let Some(target) = effects.move_to {
            app.transform.position = target;
            dirty.mark_entity(id);
        }
        for (name, data) in effects.emits {
            bus.emit(&name, &data);
        }
        for (name, data) in effects.sends {
            let payload = Value::Array(vec![
                Value::Str(id.to_hex()),
                Value::Int(i64::from(version)),
                Value::Str(name),
                data,
            ]);
            match encode(PacketName::EntityEvent, &payload) {
                Ok(bytes) => outbox.push(Outbound::Broadcast { except: None, bytes }),
                Err(err) => tracing::error!(%err, "entity event encode failed"),
            }
        }
        for (request, url) in effects.fetches {
            let ty = match url.rsplit_once('.').map(|(_, ext)| ext) {
                Some("js" | "rhai") => AssetType::Script,
                Some("glb") => AssetType::Model,
                Some("vrm") => AssetType::Avatar,
                Some("hdr") => AssetType::Hdr,
                _ => AssetType::Texture,
            };
            assets.load(
                AssetKey::new(ty, url),
                AssetWaiter::ScriptFetch {
                    entity: id,
                    generation: app.generation,
                    request,
                },
            );
        }
    }

    fn deliver_script_fetch(
        &mut self,
        id: EntityId,
        generation: u32,
        request: i64,
        key: &AssetKey,
        ok: bool,
    ) {
        let current = self
            .entities
            .get(id)
            .and_then(Entity::as_app)
            .map(|a| (a.generation, a.script.as_ref().map(|s| s.handlers.on_fetch)));
        let Some((live_generation, on_fetch)) = current else { return };
        if live_generation != generation {
            // Unbuild/rebuild aborted the fetch: drop the response.
            return;
        }
        if on_fetch != Some(true) {
            return;
        }
        let body = match self.assets.outcome(key) {
            Some(Ok(asset)) => match asset.as_ref() {
                Asset::Script(source) => source.clone(),
                _ => key.url.clone(),
            },
            Some(Err(err)) => err.to_string(),
            None => String::new(),
        };
        let args = HandlerArgs::Fetch { request, ok, body };
        if !self.run_script_handler(id, "on_fetch", &args, false) {
            tracing::warn!(app = %id, "on_fetch listener failed");
        }
    }

    /// Local authoring: take the mover tag on an app and enter a transform
    /// mode. The grab is announced so peers switch to interpolation.
    pub fn begin_app_authoring(&mut self, id: EntityId, mode: TransformMode) {
        let Some(app) = self.entities.get_mut(id).and_then(Entity::as_app_mut) else {
            return;
        };
        app.mover = Some(self.local_session);
        app.transform_mode = mode;
        let payload = obj(&[
            ("id", Value::Str(id.to_hex())),
            ("mover", Value::Str(self.local_session.to_string())),
            ("transformMode", Value::Str(mode.as_str().to_owned())),
        ]);
        self.refresh_app_hot(id);
        self.request_app_build(id);
        self.broadcast(PacketName::EntityModified, &payload, None);
    }

    /// Local authoring commit (left click): clear the mover, broadcast the
    /// final transform with cleared state, rebuild into ACTIVE.
    pub fn commit_app_authoring(&mut self, id: EntityId) {
        let Some(app) = self.entities.get_mut(id).and_then(Entity::as_app_mut) else {
            return;
        };
        let transform = app.commit_authoring();
        let payload = obj(&[
            ("id", Value::Str(id.to_hex())),
            ("mover", Value::Null),
            ("transformMode", Value::Str(TransformMode::None.as_str().to_owned())),
            ("position", Value::from_vec3(transform.position)),
            ("quaternion", Value::from_quat(transform.rotation)),
            ("scale", Value::from_vec3(transform.scale)),
            ("state", Value::Null),
        ]);
        self.dirty.mark_entity(id);
        self.refresh_app_hot(id);
        self.rebuild_app_fresh(id);
        self.broadcast(PacketName::EntityModified, &payload, None);
    }

    // ====================================================================
    // UPLOAD ADMISSION & PERSISTENCE
    // ====================================================================

    /// Admission check for a local file drop: oversize uploads register no
    /// blueprint and add no entity; the author gets a private system chat
    /// notice and the socket stays open.
    pub fn admit_upload(&mut self, session: SessionId, declared_bytes: u64, blueprint_id: &str) -> bool {
        if declared_bytes <= self.settings.max_upload_bytes() {
            return true;
        }
        self.blueprints.remove(blueprint_id);
        let notice = ChatLog::system_message(
            format!(
                "upload rejected: {} MB exceeds the {} MB limit",
                declared_bytes / (1024 * 1024),
                self.settings.max_upload_size_mb
            ),
            Self::epoch_secs(),
        );
        self.send_to(session, PacketName::ChatAdded, &notice.to_value());
        false
    }

    /// Serializes the dirty sets into a batch and commits it.
    pub fn flush_dirty(&mut self) {
        let Some(mut store) = self.store.take() else {
            return;
        };
        let mut batch = SaveBatch::default();
        for id in &self.dirty.entities {
            if let Some(entity) = self.entities.get(*id) {
                batch.entities.push(entity.to_record());
            }
        }
        batch.removed_entities = self
            .dirty
            .removed_entities
            .iter()
            .map(|id| EntityId::to_hex(*id))
            .collect();
        for id in &self.dirty.blueprints {
            if let Some(bp) = self.blueprints.get(id) {
                batch.blueprints.push(bp.clone());
            }
        }
        for id in &self.dirty.users {
            if let Some(user) = self.users.get(id) {
                batch.users.push(user.clone());
            }
        }
        if self.dirty.spawn {
            batch.spawn = Some(self.spawn);
        }
        if self.dirty.chat {
            batch.chat = Some(self.chat.serialize());
        }
        if self.persistence.flush(store.as_mut(), &batch) {
            self.dirty = DirtySets::default();
        }
        self.store = Some(store);
    }

    /// Liveness report for the HTTP collaborator.
    #[must_use]
    pub fn status(&self) -> StatusReport {
        StatusReport {
            world: self.settings.world.clone(),
            uptime_secs: self.now_secs(),
            tick_rate: self.settings.tick_rate,
            achieved_fps: if self.now_secs() > 0.0 {
                self.frames as f64 / self.now_secs()
            } else {
                0.0
            },
            sessions: self.sessions.len(),
            entities: self.entities.len(),
        }
    }

    /// Queues every preload-flagged blueprint's assets and returns the
    /// preload group ticket; the bus emits `ready` when they all resolve.
    pub fn preload_flagged_blueprints(&mut self) -> u32 {
        let mut keys = Vec::new();
        for blueprint in self.blueprints.serialize() {
            if !blueprint.preload {
                continue;
            }
            if let Some(model) = &blueprint.model {
                let ty = if model.ends_with(".vrm") {
                    AssetType::Avatar
                } else {
                    AssetType::Model
                };
                keys.push(AssetKey::new(ty, model.clone()));
            }
            if let Some(script) = &blueprint.script {
                keys.push(AssetKey::new(AssetType::Script, script.clone()));
            }
        }
        self.assets.preload(keys)
    }

    /// Registers a blueprint minted locally (authoring path).
    pub fn mint_blueprint(&mut self, blueprint: Blueprint) {
        let payload = blueprint.to_value();
        if self.blueprints.add(blueprint.clone()) {
            self.dirty.mark_blueprint(&blueprint.id);
            self.broadcast(PacketName::BlueprintAdded, &payload, None);
        }
    }
}

fn parse_session_tag(tag: &str) -> Option<SessionId> {
    tag.strip_prefix("sess-")?.parse().ok().map(SessionId)
}

fn app_shell(record: &EntityRecord) -> App {
    let mut app = App::new(record.blueprint.clone().unwrap_or_default());
    app.transform = Transform::new(
        record.position,
        record.quaternion,
        record.scale.unwrap_or(Vec3::ONE),
    );
    if let Some(state) = &record.state {
        app.state_value = state.clone();
    }
    app.uploader = record.uploader.as_deref().and_then(parse_session_tag);
    app.mover = record.mover.as_deref().and_then(parse_session_tag);
    app
}

/// Scaffolding for tests and in-process simulations: a ready-to-tick world
/// with the analytic physics scene and an in-memory fetcher + store.
pub mod testutil {
    use std::sync::Arc;

    use super::{World, WorldRole};
    use crate::assets::{AssetCache, MapFetcher};
    use crate::persistence::MemoryStore;
    use crate::physics::AnalyticScene;
    use crate::settings::Settings;

    /// A server world with no sockets attached.
    #[must_use]
    pub fn server_world() -> World {
        server_world_with_fetcher(Arc::new(MapFetcher::new()))
    }

    /// A server world over a caller-seeded fetcher.
    #[must_use]
    pub fn server_world_with_fetcher(fetcher: Arc<MapFetcher>) -> World {
        let settings = Settings::default();
        World::new(
            settings,
            WorldRole::Server,
            Box::new(AnalyticScene::new(atrium_shared::constants::GRAVITY)),
            AssetCache::new(fetcher, false),
            Some(Box::new(MemoryStore::default())),
        )
    }

    /// A client world with no sockets attached.
    #[must_use]
    pub fn client_world() -> World {
        let settings = Settings::default();
        World::new(
            settings,
            WorldRole::Client,
            Box::new(AnalyticScene::new(atrium_shared::constants::GRAVITY)),
            AssetCache::new(Arc::new(MapFetcher::new()), true),
            None,
        )
    }
}
