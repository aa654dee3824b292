//! # Entity Store
//!
//! Indexed map of live entities: primary id index, player sub-index, hot
//! sub-index, and the local player reference. Hot membership toggles are
//! O(1); the hot walk preserves insertion order.

use std::collections::{HashMap, HashSet};

use atrium_core::EntityId;
use atrium_shared::EntityRecord;

use super::Entity;

/// Indexed map of live entities.
#[derive(Default)]
pub struct EntityStore {
    entities: HashMap<EntityId, Entity>,
    players: HashSet<EntityId>,
    hot_set: HashSet<EntityId>,
    hot_order: Vec<EntityId>,
    local_player: Option<EntityId>,
}

impl EntityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True when no entities are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Adds an entity. `local` marks it as this process's own player.
    ///
    /// Ids are unique process-wide: inserting a duplicate replaces nothing
    /// and returns false.
    pub fn add(&mut self, entity: Entity, local: bool) -> bool {
        let id = entity.id;
        if self.entities.contains_key(&id) {
            return false;
        }
        if entity.is_player() {
            self.players.insert(id);
        }
        if entity.hot {
            self.hot_set.insert(id);
            self.hot_order.push(id);
        }
        if local {
            self.local_player = Some(id);
        }
        self.entities.insert(id, entity);
        true
    }

    /// Looks up an entity.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Takes an entity out of the store for a phase call; pair with
    /// [`EntityStore::put_back`]. Indexes are preserved.
    pub fn take(&mut self, id: EntityId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    /// Returns a taken entity.
    pub fn put_back(&mut self, entity: Entity) {
        self.entities.insert(entity.id, entity);
    }

    /// Removes an entity for good.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        self.players.remove(&id);
        if self.hot_set.remove(&id) {
            self.hot_order.retain(|e| *e != id);
        }
        if self.local_player == Some(id) {
            self.local_player = None;
        }
        self.entities.remove(&id)
    }

    /// Toggles hot membership.
    pub fn set_hot(&mut self, id: EntityId, hot: bool) {
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };
        entity.hot = hot;
        if hot {
            if self.hot_set.insert(id) {
                self.hot_order.push(id);
            }
        } else if self.hot_set.remove(&id) {
            self.hot_order.retain(|e| *e != id);
        }
    }

    /// The hot walk-set, in insertion order.
    #[must_use]
    pub fn hot_ids(&self) -> Vec<EntityId> {
        self.hot_order.clone()
    }

    /// Player entity ids.
    pub fn player_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.players.iter().copied()
    }

    /// All entity ids.
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Iterates all entities.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// The local player entity id, when this process owns one.
    #[must_use]
    pub const fn local_player(&self) -> Option<EntityId> {
        self.local_player
    }

    /// Durable records for every entity, sorted by id for a stable order.
    #[must_use]
    pub fn serialize(&self) -> Vec<EntityRecord> {
        let mut out: Vec<EntityRecord> = self.entities.values().map(Entity::to_record).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Rebuilds the store from durable records. The kind-specific halves
    /// (controller, interpolators, app shells) need world collaborators, so
    /// the caller supplies `build`; a record it declines is skipped. The
    /// bool in the pair marks the local player.
    pub fn deserialize<F>(&mut self, records: &[EntityRecord], mut build: F)
    where
        F: FnMut(&EntityRecord) -> Option<(Entity, bool)>,
    {
        self.entities.clear();
        self.players.clear();
        self.hot_set.clear();
        self.hot_order.clear();
        self.local_player = None;
        for record in records {
            if let Some((entity, local)) = build(record) {
                self.add(entity, local);
            }
        }
    }

    /// Counts entities of each kind: (players, apps).
    #[must_use]
    pub fn census(&self) -> (usize, usize) {
        let players = self.players.len();
        (players, self.entities.len() - players)
    }

    /// Apps owned (as mover or uploader) by a departing session, so the
    /// world can clear the tags and rebuild.
    #[must_use]
    pub fn apps_tagged_by(&self, session: atrium_networking::SessionId) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| {
                e.as_app()
                    .is_some_and(|a| a.mover == Some(session) || a.uploader == Some(session))
            })
            .map(|e| e.id)
            .collect()
    }

    /// The player entity belonging to a session, if connected.
    #[must_use]
    pub fn player_of_session(&self, session: atrium_networking::SessionId) -> Option<EntityId> {
        self.players
            .iter()
            .copied()
            .find(|id| self.entities.get(id).is_some_and(|e| e.owner == session))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{App, EntityKind, PlayerRemote};
    use super::*;
    use atrium_networking::SessionId;
    use atrium_shared::UserRecord;

    fn player(owner: SessionId) -> Entity {
        Entity::new(
            EntityId::random(),
            owner,
            EntityKind::PlayerRemote(PlayerRemote::new(
                UserRecord::default(),
                atrium_shared::Vec3::ZERO,
                atrium_shared::Quat::IDENTITY,
            )),
        )
    }

    fn app(owner: SessionId) -> Entity {
        Entity::new(EntityId::random(), owner, EntityKind::App(App::new("bp".to_owned())))
    }

    #[test]
    fn test_add_indexes_players() {
        let mut store = EntityStore::new();
        let p = player(SessionId(1));
        let pid = p.id;
        let a = app(SessionId(1));
        store.add(p, false);
        store.add(a, false);
        assert_eq!(store.len(), 2);
        assert_eq!(store.player_ids().collect::<Vec<_>>(), vec![pid]);
        assert_eq!(store.census(), (1, 1));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut store = EntityStore::new();
        let p = player(SessionId(1));
        let id = p.id;
        assert!(store.add(p, false));
        let mut clone = player(SessionId(2));
        clone.id = id;
        assert!(!store.add(clone, false));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id).unwrap().owner, SessionId(1));
    }

    #[test]
    fn test_hot_toggle_and_order() {
        let mut store = EntityStore::new();
        let a = app(SessionId(1));
        let b = app(SessionId(1));
        let (ida, idb) = (a.id, b.id);
        store.add(a, false);
        store.add(b, false);

        store.set_hot(ida, true);
        store.set_hot(idb, true);
        assert_eq!(store.hot_ids(), vec![ida, idb]);

        // Re-marking hot does not duplicate.
        store.set_hot(ida, true);
        assert_eq!(store.hot_ids(), vec![ida, idb]);

        store.set_hot(ida, false);
        assert_eq!(store.hot_ids(), vec![idb]);
    }

    #[test]
    fn test_remove_cleans_indexes() {
        let mut store = EntityStore::new();
        let p = player(SessionId(1));
        let id = p.id;
        store.add(p, true);
        store.set_hot(id, true);
        assert_eq!(store.local_player(), Some(id));

        store.remove(id);
        assert!(store.get(id).is_none());
        assert!(store.hot_ids().is_empty());
        assert_eq!(store.player_ids().count(), 0);
        assert_eq!(store.local_player(), None);
    }

    #[test]
    fn test_tagged_apps_found_for_session() {
        let mut store = EntityStore::new();
        let mut a = app(SessionId(1));
        if let EntityKind::App(inner) = &mut a.kind {
            inner.mover = Some(SessionId(9));
        }
        let ida = a.id;
        store.add(a, false);
        store.add(app(SessionId(1)), false);
        assert_eq!(store.apps_tagged_by(SessionId(9)), vec![ida]);
        assert!(store.apps_tagged_by(SessionId(5)).is_empty());
    }

    #[test]
    fn test_take_put_back_preserves_size() {
        let mut store = EntityStore::new();
        let a = app(SessionId(1));
        let id = a.id;
        store.add(a, false);
        let taken = store.take(id).unwrap();
        store.put_back(taken);
        assert_eq!(store.len(), 1);
    }
}
