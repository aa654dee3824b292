//! # Persistence
//!
//! Dirty-set bookkeeping and the periodic flush through the external store
//! collaborator. A failed commit degrades to a log line; the dirty records
//! stay dirty and the next interval retries them.

use std::collections::HashSet;

use atrium_core::EntityId;
use atrium_shared::{Blueprint, ChatMessage, EntityRecord, SpawnPoint, UserRecord};

/// Store collaborator failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistError {
    /// The backend rejected or lost the commit.
    #[error("store commit failed: {0}")]
    Commit(String),
    /// The backend could not produce the saved world.
    #[error("store load failed: {0}")]
    Load(String),
}

/// One flush worth of records.
#[derive(Debug, Default, Clone)]
pub struct SaveBatch {
    /// Entities to upsert.
    pub entities: Vec<EntityRecord>,
    /// Entity ids removed since the last flush.
    pub removed_entities: Vec<String>,
    /// Blueprints to upsert.
    pub blueprints: Vec<Blueprint>,
    /// Users to upsert.
    pub users: Vec<UserRecord>,
    /// Current spawn point, when it changed.
    pub spawn: Option<SpawnPoint>,
    /// Chat snapshot, when it changed.
    pub chat: Option<Vec<ChatMessage>>,
}

impl SaveBatch {
    /// True when there is nothing to commit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.removed_entities.is_empty()
            && self.blueprints.is_empty()
            && self.users.is_empty()
            && self.spawn.is_none()
            && self.chat.is_none()
    }
}

/// The external persistence backend (database, disk, test stub).
pub trait WorldStore {
    /// Commits one batch atomically, or fails it as a whole.
    fn commit(&mut self, batch: &SaveBatch) -> Result<(), PersistError>;
}

/// In-memory store for tests and throwaway worlds.
#[derive(Default)]
pub struct MemoryStore {
    /// Batches committed, in order.
    pub committed: Vec<SaveBatch>,
    /// When set, every commit fails (failure-path tests).
    pub fail_commits: bool,
}

impl WorldStore for MemoryStore {
    fn commit(&mut self, batch: &SaveBatch) -> Result<(), PersistError> {
        if self.fail_commits {
            return Err(PersistError::Commit("memory store set to fail".to_owned()));
        }
        self.committed.push(batch.clone());
        Ok(())
    }
}

/// Dirty-sets for everything the store owns.
#[derive(Debug, Default)]
pub struct DirtySets {
    /// Entities with unsaved changes.
    pub entities: HashSet<EntityId>,
    /// Entities removed since the last flush.
    pub removed_entities: HashSet<EntityId>,
    /// Blueprint ids with unsaved changes.
    pub blueprints: HashSet<String>,
    /// User ids with unsaved changes.
    pub users: HashSet<String>,
    /// Spawn point changed.
    pub spawn: bool,
    /// Chat log changed.
    pub chat: bool,
}

impl DirtySets {
    /// True when nothing is dirty.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.entities.is_empty()
            && self.removed_entities.is_empty()
            && self.blueprints.is_empty()
            && self.users.is_empty()
            && !self.spawn
            && !self.chat
    }

    /// Marks an entity dirty.
    pub fn mark_entity(&mut self, id: EntityId) {
        self.entities.insert(id);
    }

    /// Marks an entity removed (and no longer dirty).
    pub fn mark_entity_removed(&mut self, id: EntityId) {
        self.entities.remove(&id);
        self.removed_entities.insert(id);
    }

    /// Marks a blueprint dirty.
    pub fn mark_blueprint(&mut self, id: &str) {
        self.blueprints.insert(id.to_owned());
    }

    /// Marks a user dirty.
    pub fn mark_user(&mut self, id: &str) {
        self.users.insert(id.to_owned());
    }
}

/// Periodic flush driver.
pub struct Persistence {
    interval: f32,
    accum: f32,
    /// Total successful flushes.
    pub flush_count: u64,
    /// Total failed flushes.
    pub failure_count: u64,
}

impl Persistence {
    /// Creates a driver flushing every `interval` seconds.
    #[must_use]
    pub fn new(interval: f32) -> Self {
        Self {
            interval,
            accum: 0.0,
            flush_count: 0,
            failure_count: 0,
        }
    }

    /// Advances time; true when a flush is due.
    pub fn due(&mut self, dt: f32) -> bool {
        self.accum += dt;
        if self.accum >= self.interval {
            self.accum = 0.0;
            true
        } else {
            false
        }
    }

    /// Commits a batch through the store. On failure the caller keeps its
    /// dirty sets so the next interval retries.
    pub fn flush(&mut self, store: &mut dyn WorldStore, batch: &SaveBatch) -> bool {
        if batch.is_empty() {
            return true;
        }
        match store.commit(batch) {
            Ok(()) => {
                self.flush_count += 1;
                true
            }
            Err(err) => {
                self.failure_count += 1;
                tracing::warn!(%err, "persistence flush failed; will retry next interval");
                false
            }
        }
    }
}

/// Liveness report for the external HTTP collaborator's /health + /status.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// World identifier.
    pub world: String,
    /// Seconds since the world started.
    pub uptime_secs: f64,
    /// Configured fixed tick rate.
    pub tick_rate: u32,
    /// Average achieved frame rate.
    pub achieved_fps: f64,
    /// Connected session count.
    pub sessions: usize,
    /// Live entity count.
    pub entities: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_tracking() {
        let mut dirty = DirtySets::default();
        assert!(dirty.is_clean());
        let id = EntityId::random();
        dirty.mark_entity(id);
        dirty.mark_blueprint("bp");
        assert!(!dirty.is_clean());

        // Removal supersedes dirtiness.
        dirty.mark_entity_removed(id);
        assert!(!dirty.entities.contains(&id));
        assert!(dirty.removed_entities.contains(&id));
    }

    #[test]
    fn test_flush_interval() {
        let mut p = Persistence::new(60.0);
        assert!(!p.due(30.0));
        assert!(p.due(30.0));
        assert!(!p.due(1.0));
    }

    #[test]
    fn test_failed_flush_counts_and_retries() {
        let mut p = Persistence::new(60.0);
        let mut store = MemoryStore {
            fail_commits: true,
            ..MemoryStore::default()
        };
        let batch = SaveBatch {
            blueprints: vec![Blueprint::default()],
            ..SaveBatch::default()
        };
        assert!(!p.flush(&mut store, &batch));
        assert_eq!(p.failure_count, 1);

        store.fail_commits = false;
        assert!(p.flush(&mut store, &batch));
        assert_eq!(store.committed.len(), 1);
    }

    #[test]
    fn test_empty_batch_skips_store() {
        let mut p = Persistence::new(60.0);
        let mut store = MemoryStore::default();
        assert!(p.flush(&mut store, &SaveBatch::default()));
        assert!(store.committed.is_empty());
        assert_eq!(p.flush_count, 0);
    }
}
