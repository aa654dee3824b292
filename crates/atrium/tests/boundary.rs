//! Boundary scenarios: the end-to-end contracts of the replication engine,
//! driven through injected network events instead of live sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use atrium::assets::{asset_url_for, MapFetcher};
use atrium::entity::{AppState, EntityKind, InputState};
use atrium::physics::{AnalyticScene, BodyMotion, BodyShape, LayerMask, PhysicsScene};
use atrium::world::testutil::{client_world, server_world_with_fetcher};
use atrium::world::{Outbound, World};
use atrium::TickEngine;
use atrium_core::EntityId;
use atrium_networking::{NetEvent, SessionId};
use atrium_shared::value::obj;
use atrium_shared::{decode, Blueprint, PacketName, Transform, Value, Vec2, Vec3};

fn connect(world: &mut World, session: SessionId) {
    world.inject_net_event(NetEvent::Connected {
        session,
        remote: "127.0.0.1:9".parse().unwrap(),
    });
    world.drain_between_frames();
}

fn packet(world: &mut World, session: SessionId, name: PacketName, payload: Value) {
    world.inject_net_event(NetEvent::Packet {
        session,
        name,
        payload,
    });
}

/// Pumps drains until the app with `id` finishes building (asset fetches
/// resolve on worker threads).
fn pump_until_built(world: &mut World, id: EntityId) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        world.drain_between_frames();
        let building = world
            .entities
            .get(id)
            .and_then(|e| e.as_app())
            .map_or(true, |app| app.building);
        if !building {
            return;
        }
        assert!(Instant::now() < deadline, "app never finished building");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn outbox_packets(world: &mut World) -> Vec<(Option<SessionId>, PacketName, Value)> {
    world
        .take_outbox()
        .into_iter()
        .filter_map(|item| match item {
            Outbound::To(session, bytes) => {
                let (name, payload) = decode(&bytes).unwrap();
                Some((Some(session), name, payload))
            }
            Outbound::Broadcast { bytes, .. } => {
                let (name, payload) = decode(&bytes).unwrap();
                Some((None, name, payload))
            }
            Outbound::Kick(_) => None,
        })
        .collect()
}

// ============================================================================
// SCENARIO 1: SNAPSHOT ON JOIN
// ============================================================================

#[test]
fn snapshot_on_join_installs_both_players() {
    let mut server = server_world_with_fetcher(Arc::new(MapFetcher::new()));
    connect(&mut server, SessionId(1));
    let _ = server.take_outbox();

    connect(&mut server, SessionId(2));
    let packets = outbox_packets(&mut server);

    // B got a snapshot; everyone else got an entityAdded.
    let snapshot = packets
        .iter()
        .find(|(to, name, _)| *to == Some(SessionId(2)) && *name == PacketName::Snapshot)
        .map(|(_, _, payload)| payload.clone())
        .expect("snapshot for the joining socket");
    assert!(packets
        .iter()
        .any(|(to, name, _)| to.is_none() && *name == PacketName::EntityAdded));

    // A blank client applies the snapshot.
    let mut client = client_world();
    packet(&mut client, SessionId::SERVER, PacketName::Snapshot, snapshot);
    client.drain_between_frames();

    let (players, apps) = client.entities.census();
    assert_eq!(players, 2, "A and B exactly");
    assert_eq!(apps, 0);
    assert!(client.entities.local_player().is_some());
    assert!(client.auth_token.is_some());

    // B broadcasts nothing proactively.
    assert!(client.take_outbox().is_empty());
}

// ============================================================================
// SCENARIO 2: REBUILD SUPERSESSION
// ============================================================================

fn seeded_world() -> (Arc<MapFetcher>, World) {
    let fetcher = Arc::new(MapFetcher::new());
    let world = server_world_with_fetcher(Arc::clone(&fetcher));
    (fetcher, world)
}

fn blueprint_value(id: &str, version: u32, model: Option<&str>, script: Option<&str>) -> Value {
    Blueprint {
        id: id.to_owned(),
        version,
        model: model.map(str::to_owned),
        script: script.map(str::to_owned),
        config: Value::object(),
        preload: false,
    }
    .to_value()
}

fn app_record(id: EntityId, blueprint: &str) -> Value {
    obj(&[
        ("id", Value::Str(id.to_hex())),
        ("type", Value::Str("app".to_owned())),
        ("blueprint", Value::Str(blueprint.to_owned())),
        ("position", Value::from_vec3(Vec3::ZERO)),
        (
            "quaternion",
            Value::from_quat(atrium_shared::Quat::IDENTITY),
        ),
    ])
}

#[test]
fn rebuild_supersession_keeps_only_the_newest_build() {
    let (fetcher, mut world) = seeded_world();
    let m1 = asset_url_for(b"model-one", "glb");
    let m2 = asset_url_for(b"model-two", "glb");
    fetcher.put(m1.clone(), b"model-one".to_vec());
    fetcher.put(m2.clone(), b"model-two".to_vec());

    connect(&mut world, SessionId(1));
    packet(
        &mut world,
        SessionId(1),
        PacketName::BlueprintAdded,
        blueprint_value("b1", 0, Some(&m1), None),
    );
    packet(
        &mut world,
        SessionId(1),
        PacketName::BlueprintAdded,
        blueprint_value("b2", 0, Some(&m2), None),
    );
    world.drain_between_frames();

    let app_id = EntityId::random();
    packet(
        &mut world,
        SessionId(1),
        PacketName::EntityAdded,
        app_record(app_id, "b1"),
    );
    // Before b1's model resolves, the app is switched to b2.
    packet(
        &mut world,
        SessionId(1),
        PacketName::EntityModified,
        obj(&[
            ("id", Value::Str(app_id.to_hex())),
            ("blueprint", Value::Str("b2".to_owned())),
        ]),
    );
    pump_until_built(&mut world, app_id);

    let app = world.entities.get(app_id).unwrap().as_app().unwrap();
    assert_eq!(app.status, AppState::Active);
    assert_eq!(app.blueprint_id, "b2");

    // Exactly one root; it is b2's model, and no b1 subtree survives.
    let root = app.root.expect("built root");
    assert_eq!(world.scene.get(root).unwrap().name, m2);
    assert_eq!(world.scene.len(), 1);
    assert_eq!(world.scene.roots().len(), 1);
}

// ============================================================================
// SCENARIO 3: EVENT CROSS-REBUILD
// ============================================================================

#[test]
fn entity_event_held_across_rebuild_fires_at_its_version() {
    let (fetcher, mut world) = seeded_world();
    let script_url = asset_url_for(b"fn on_event(name, data) { app.set_state(#{ got: name }); }", "js");
    fetcher.put(
        script_url.clone(),
        b"fn on_event(name, data) { app.set_state(#{ got: name }); }".to_vec(),
    );

    connect(&mut world, SessionId(1));
    packet(
        &mut world,
        SessionId(1),
        PacketName::BlueprintAdded,
        blueprint_value("bp", 0, None, Some(&script_url)),
    );
    world.drain_between_frames();

    let app_id = EntityId::random();
    packet(
        &mut world,
        SessionId(1),
        PacketName::EntityAdded,
        app_record(app_id, "bp"),
    );
    pump_until_built(&mut world, app_id);
    let app = world.entities.get(app_id).unwrap().as_app().unwrap();
    assert_eq!(app.built_version, 0);
    // A blueprint with no model leaves the root empty, so the built-in
    // crash-block model stands in even though the app is running fine.
    assert_eq!(app.status, AppState::Active);
    assert_eq!(
        world.scene.get(app.root.unwrap()).unwrap().name,
        "crash-block"
    );

    // Rebuild to version 1 begins...
    packet(
        &mut world,
        SessionId(1),
        PacketName::BlueprintModified,
        blueprint_value("bp", 1, None, Some(&script_url)),
    );
    // ...and an event for version 2 arrives while the rebuild is in
    // flight.
    packet(
        &mut world,
        SessionId(1),
        PacketName::EntityEvent,
        Value::Array(vec![
            Value::Str(app_id.to_hex()),
            Value::Int(2),
            Value::Str("tick".to_owned()),
            Value::object(),
        ]),
    );
    pump_until_built(&mut world, app_id);

    // Build to v1 completed; the v2 event is retained, not fired.
    let app = world.entities.get(app_id).unwrap().as_app().unwrap();
    assert_eq!(app.built_version, 1);
    assert!(app.state_value.get("got").is_none(), "v2 event must not fire at v1");
    assert_eq!(app.deferred.len(), 1);

    // The next rebuild, to v2, releases it in order.
    packet(
        &mut world,
        SessionId(1),
        PacketName::BlueprintModified,
        blueprint_value("bp", 2, None, Some(&script_url)),
    );
    pump_until_built(&mut world, app_id);

    let app = world.entities.get(app_id).unwrap().as_app().unwrap();
    assert_eq!(app.built_version, 2);
    assert_eq!(
        app.state_value.get("got").and_then(Value::as_str),
        Some("tick"),
        "the held event fires once its version is current"
    );
    assert!(app.deferred.is_empty());
}

// ============================================================================
// SCENARIO 4: PLATFORM RIDE
// ============================================================================

#[test]
fn platform_ride_carries_the_player() {
    let mut scene = AnalyticScene::new(9.81);
    let platform = scene.add_body(
        BodyShape::Box {
            half: Vec3::new(2.0, 0.5, 2.0),
        },
        BodyMotion::Kinematic,
        100.0,
        LayerMask::PROP,
        Transform::from_position(Vec3::new(0.0, 0.5, 0.0)),
    );

    let mut world = World::new(
        atrium::Settings::default(),
        atrium::world::WorldRole::Client,
        Box::new(scene),
        atrium::assets::AssetCache::new(Arc::new(MapFetcher::new()), true),
        None,
    );
    world.spawn.position = Vec3::new(0.0, 1.05, 0.0);
    let player_id = world.spawn_player(SessionId::SERVER, atrium_shared::UserRecord::default(), true);

    let mut engine = TickEngine::new(50);
    // Settle.
    for _ in 0..10 {
        engine.advance(&mut world, 0.02);
    }
    let start = world.entities.get(player_id).unwrap().position();

    // A peer pushes the platform 1 m over 1 s.
    for i in 1..=50 {
        let x = i as f32 / 50.0;
        world
            .physics
            .set_body_transform(platform, Transform::from_position(Vec3::new(x, 0.5, 0.0)));
        engine.advance(&mut world, 0.02);
    }

    let end = world.entities.get(player_id).unwrap().position();
    let carried = end.x - start.x;
    assert!(
        (carried - 1.0).abs() <= 0.01,
        "expected a 1 m ride within 10 mm, got {carried}"
    );
    // No penetration: the capsule base stays at or above the platform top.
    assert!(end.y >= 0.99, "player sank into the platform: y={}", end.y);
}

// ============================================================================
// SCENARIO 5: SLOPE GRIP
// ============================================================================

#[test]
fn slope_grip_at_45_and_slip_at_65() {
    // 45 degrees: stand still without oscillation or drift.
    let mut scene = AnalyticScene::new(9.81);
    scene.add_slope(-20.0, 20.0, -20.0, 20.0, 0.0, 1.0, 0.0);
    let mut world = World::new(
        atrium::Settings::default(),
        atrium::world::WorldRole::Client,
        Box::new(scene),
        atrium::assets::AssetCache::new(Arc::new(MapFetcher::new()), true),
        None,
    );
    world.spawn.position = Vec3::new(0.0, 20.1, 0.0);
    let player_id = world.spawn_player(SessionId::SERVER, atrium_shared::UserRecord::default(), true);

    let mut engine = TickEngine::new(50);
    // Walk onto the slope briefly, then release input.
    world.input = InputState {
        axes: Vec2::new(1.0, 0.0),
        ..InputState::default()
    };
    for _ in 0..25 {
        engine.advance(&mut world, 0.02);
    }
    world.input = InputState::default();
    for _ in 0..50 {
        engine.advance(&mut world, 0.02);
    }

    let before = world.entities.get(player_id).unwrap().position();
    let mut max_vy: f32 = 0.0;
    for _ in 0..50 {
        engine.advance(&mut world, 0.02);
        if let Some(vy) = world.physics.body_velocity(capsule_of(&world, player_id)) {
            max_vy = max_vy.max(vy.y.abs());
        }
    }
    let after = world.entities.get(player_id).unwrap().position();
    let drift = Vec3::new(after.x - before.x, 0.0, after.z - before.z).length() / 1.0;
    assert!(max_vy <= 0.01, "vertical oscillation too large: {max_vy}");
    assert!(drift < 0.01, "horizontal drift too large: {drift} m/s");

    // 65 degrees: slipping, not grounded, sliding down.
    let mut scene = AnalyticScene::new(9.81);
    scene.add_slope(-20.0, 20.0, -20.0, 20.0, 0.0, 2.14, 0.0);
    let mut world = World::new(
        atrium::Settings::default(),
        atrium::world::WorldRole::Client,
        Box::new(scene),
        atrium::assets::AssetCache::new(Arc::new(MapFetcher::new()), true),
        None,
    );
    world.spawn.position = Vec3::new(0.0, 42.9, 0.0);
    let player_id = world.spawn_player(SessionId::SERVER, atrium_shared::UserRecord::default(), true);
    let mut engine = TickEngine::new(50);
    for _ in 0..25 {
        engine.advance(&mut world, 0.02);
    }
    let entity = world.entities.get(player_id).unwrap();
    match &entity.kind {
        EntityKind::PlayerLocal(player) => {
            assert!(player.slipping, "65 degree ground must slip");
            assert!(!player.grounded);
        }
        _ => unreachable!(),
    }
}

fn capsule_of(world: &World, player_id: EntityId) -> atrium::physics::BodyId {
    match &world.entities.get(player_id).unwrap().kind {
        EntityKind::PlayerLocal(player) => player.body,
        _ => unreachable!(),
    }
}

// ============================================================================
// SCENARIO 6: OVERSIZE UPLOAD
// ============================================================================

#[test]
fn oversize_upload_is_rejected_cleanly() {
    let (_fetcher, mut world) = seeded_world();
    connect(&mut world, SessionId(1));
    let _ = world.take_outbox();
    let entities_before = world.entities.len();

    // The builder mints the blueprint locally, then admission runs against
    // the declared size: 200 MB over a 100 MB cap.
    world.mint_blueprint(Blueprint {
        id: "big".to_owned(),
        version: 0,
        model: Some("asset://aa.glb".to_owned()),
        script: None,
        config: Value::object(),
        preload: false,
    });
    let admitted = world.admit_upload(SessionId(1), 200 * 1024 * 1024, "big");
    assert!(!admitted);

    // No blueprint survives, no entity was added.
    assert!(world.blueprints.get("big").is_none());
    assert_eq!(world.entities.len(), entities_before);

    // The author got a private system chat notice, and nobody was kicked.
    let outbox = world.take_outbox();
    let mut saw_notice = false;
    for item in &outbox {
        match item {
            Outbound::To(session, bytes) => {
                let (name, payload) = decode(bytes).unwrap();
                if *session == SessionId(1) && name == PacketName::ChatAdded {
                    let body = payload.get("body").and_then(Value::as_str).unwrap_or("");
                    assert!(body.contains("limit"), "notice should explain the cap: {body}");
                    assert!(payload.get("from").is_some_and(Value::is_null));
                    saw_notice = true;
                }
            }
            Outbound::Kick(_) => panic!("socket must stay open"),
            Outbound::Broadcast { .. } => {}
        }
    }
    assert!(saw_notice, "author must get a system chat notice");
    assert!(world.sessions.contains_key(&SessionId(1)));
}

// ============================================================================
// CONVERGENCE LAW
// ============================================================================

#[test]
fn peers_converge_on_identical_state_from_the_same_stream() {
    let (fetcher, mut server) = seeded_world();
    let model = asset_url_for(b"shared-model", "glb");
    fetcher.put(model.clone(), b"shared-model".to_vec());

    connect(&mut server, SessionId(1));
    let _ = server.take_outbox();

    // One ordered mutation stream.
    let app_id = EntityId::random();
    let stream = vec![
        (PacketName::BlueprintAdded, blueprint_value("bp", 0, Some(&model), None)),
        (PacketName::EntityAdded, app_record(app_id, "bp")),
        (
            PacketName::EntityModified,
            obj(&[
                ("id", Value::Str(app_id.to_hex())),
                ("position", Value::from_vec3(Vec3::new(3.0, 0.0, -1.0))),
                ("state", obj(&[("n", Value::Int(4))])),
            ]),
        ),
    ];

    let mut peer_a = client_world();
    let mut peer_b = client_world();
    for (name, payload) in &stream {
        packet(&mut peer_a, SessionId::SERVER, *name, payload.clone());
        packet(&mut peer_b, SessionId::SERVER, *name, payload.clone());
    }
    peer_a.drain_between_frames();
    peer_b.drain_between_frames();

    assert_eq!(peer_a.blueprints.serialize(), peer_b.blueprints.serialize());
    assert_eq!(peer_a.entities.serialize(), peer_b.entities.serialize());
}

// ============================================================================
// UPLOAD LIFECYCLE (placeholder -> real model)
// ============================================================================

#[test]
fn foreign_upload_shows_placeholder_until_uploader_clears() {
    let (fetcher, mut world) = seeded_world();
    let model = asset_url_for(b"uploaded-model", "glb");

    connect(&mut world, SessionId(1));
    connect(&mut world, SessionId(2));
    packet(
        &mut world,
        SessionId(2),
        PacketName::BlueprintAdded,
        blueprint_value("up", 0, Some(&model), None),
    );
    world.drain_between_frames();

    // Session 2 is still uploading; everyone else shows the placeholder.
    let app_id = EntityId::random();
    let mut record = app_record(app_id, "up");
    record.set("uploader", Value::Str("sess-2".to_owned()));
    packet(&mut world, SessionId(2), PacketName::EntityAdded, record);
    pump_until_built(&mut world, app_id);

    let app = world.entities.get(app_id).unwrap().as_app().unwrap();
    assert_eq!(app.status, AppState::Loading);
    let root = app.root.unwrap();
    assert_eq!(world.scene.get(root).unwrap().name, "placeholder-cube");

    // Upload finishes: bytes land in the cache, uploader clears, rebuild
    // swaps in the real model.
    fetcher.put(model.clone(), b"uploaded-model".to_vec());
    packet(
        &mut world,
        SessionId(2),
        PacketName::EntityModified,
        obj(&[
            ("id", Value::Str(app_id.to_hex())),
            ("uploader", Value::Null),
        ]),
    );
    pump_until_built(&mut world, app_id);

    let app = world.entities.get(app_id).unwrap().as_app().unwrap();
    assert_eq!(app.status, AppState::Active);
    assert_eq!(world.scene.get(app.root.unwrap()).unwrap().name, model);
}
