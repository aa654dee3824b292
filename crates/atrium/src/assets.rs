//! # Asset Cache
//!
//! Content-addressed, type-indexed, dedup-in-flight loader for scripted
//! resources.
//!
//! ## Contract
//!
//! - `asset://<hash>.<ext>` urls are content-addressed: two keys with the
//!   same hash are the same bytes
//! - For each (type, url) key at most one fetch is ever in flight; every
//!   caller observes the same outcome, success or failure
//! - Fetching and decoding run on worker threads; outcomes are delivered
//!   to the simulation thread through a completion queue drained between
//!   frames
//!
//! Decode adapters are deliberately thin here: a model becomes a scene
//! factory template, an emote becomes a clip token, a script becomes source
//! text for the sandbox. The heavyweight decoders are external
//! collaborators; a build may substitute the placeholder factory for avatar
//! decoding without breaking replication, because blueprint identity is
//! what crosses the wire.

use std::collections::HashMap;
use std::sync::Arc;

use atrium_core::{EntityId, Node, NodeId, SceneGraph};
use atrium_shared::Transform;

// ============================================================================
// KEYS & URLS
// ============================================================================

/// Asset type, part of the cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetType {
    /// Scene-graph model (glb).
    Model,
    /// Avatar rig (vrm).
    Avatar,
    /// Animation clip token.
    Emote,
    /// Plain texture (jpg, png).
    Texture,
    /// Environment map (hdr).
    Hdr,
    /// App script source (js on the wire, rhai here).
    Script,
}

impl AssetType {
    /// Maps a content-addressed extension to its asset type.
    #[must_use]
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "glb" => Some(Self::Model),
            "vrm" => Some(Self::Avatar),
            "hdr" => Some(Self::Hdr),
            "jpg" | "png" => Some(Self::Texture),
            "js" | "rhai" => Some(Self::Script),
            _ => None,
        }
    }
}

/// Cache key: (type, url).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssetKey {
    /// Asset type.
    pub ty: AssetType,
    /// Source url, usually `asset://<hash>.<ext>`.
    pub url: String,
}

impl AssetKey {
    /// Creates a key.
    #[must_use]
    pub fn new(ty: AssetType, url: impl Into<String>) -> Self {
        Self { ty, url: url.into() }
    }
}

/// Splits an `asset://<hash>.<ext>` url into (hash, ext).
#[must_use]
pub fn parse_asset_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("asset://")?;
    let (hash, ext) = rest.rsplit_once('.')?;
    if hash.is_empty() || ext.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((hash, ext))
}

/// Mints the content-addressed url for a byte payload.
#[must_use]
pub fn asset_url_for(bytes: &[u8], ext: &str) -> String {
    format!("asset://{}.{ext}", blake3::hash(bytes).to_hex())
}

// ============================================================================
// DECODED ARTIFACTS
// ============================================================================

/// A decoded model: a factory that stamps a scene subtree per instance.
#[derive(Clone, Debug)]
pub struct ModelTemplate {
    /// Source url, for logging and dedup.
    pub url: String,
    /// Decoded payload size.
    pub size: usize,
    /// True for the placeholder the server substitutes when it refuses to
    /// decode avatars.
    pub placeholder: bool,
}

impl ModelTemplate {
    /// Stamps one instance of the model under `parent`.
    pub fn instantiate(&self, scene: &mut SceneGraph, parent: Option<NodeId>, local: Transform) -> NodeId {
        let mut node = Node::new(self.url.clone(), local);
        node.layer = crate::physics::LayerMask::PROP.0;
        scene.insert(node, parent)
    }
}

/// A decoded texture or environment map.
#[derive(Clone, Debug)]
pub struct TextureHandle {
    /// Source url.
    pub url: String,
    /// Decoded payload size.
    pub size: usize,
}

/// A decoded asset, by type.
#[derive(Clone, Debug)]
pub enum Asset {
    /// Scene-graph factory (models and avatars).
    Scene(ModelTemplate),
    /// Animation clip token.
    Clip(String),
    /// Texture handle.
    Texture(TextureHandle),
    /// Script source text, compiled later by the sandbox per blueprint
    /// version.
    Script(String),
}

/// Asset subsystem failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetError {
    /// The fetch collaborator failed.
    #[error("fetch failed for {url}: {reason}")]
    Fetch {
        /// Requested url.
        url: String,
        /// Collaborator-provided reason.
        reason: String,
    },
    /// The payload did not decode for its declared type.
    #[error("decode failed for {url}: {reason}")]
    Decode {
        /// Requested url.
        url: String,
        /// What went wrong.
        reason: String,
    },
}

// ============================================================================
// FETCH COLLABORATOR
// ============================================================================

/// The external fetch collaborator (HTTP endpoint, disk store, test stub).
///
/// Runs on a worker thread; must not touch simulation state.
pub trait AssetFetcher: Send + Sync + 'static {
    /// Fetches raw bytes for a url.
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String>;
}

/// Fetcher for tests and single-process worlds: a preloaded url -> bytes map.
#[derive(Default)]
pub struct MapFetcher {
    entries: std::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl MapFetcher {
    /// Creates an empty fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers bytes for a url.
    pub fn put(&self, url: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(url.into(), bytes);
        }
    }
}

impl AssetFetcher for MapFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        self.entries
            .lock()
            .map_err(|_| "fetcher poisoned".to_owned())?
            .get(url)
            .cloned()
            .ok_or_else(|| format!("not found: {url}"))
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Who asked for an asset; handed back verbatim when the fetch resolves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetWaiter {
    /// An app build awaiting its model/script.
    AppBuild {
        /// Building entity.
        entity: EntityId,
        /// Build generation the request belongs to.
        generation: u32,
    },
    /// A script-issued fetch.
    ScriptFetch {
        /// Requesting entity.
        entity: EntityId,
        /// Build generation (the abort token).
        generation: u32,
        /// Script-visible request id.
        request: i64,
    },
    /// A preload group member.
    Preload {
        /// Group ticket.
        group: u32,
    },
}

struct Completion {
    key: AssetKey,
    outcome: Result<Asset, AssetError>,
}

/// A resolved key with its waiters, surfaced by [`AssetCache::drain`].
pub struct ResolvedAsset {
    /// The key that resolved.
    pub key: AssetKey,
    /// Shared outcome.
    pub outcome: Result<Arc<Asset>, AssetError>,
    /// Everyone who was waiting.
    pub waiters: Vec<AssetWaiter>,
}

/// Outcome of one between-frames drain.
#[derive(Default)]
pub struct DrainOutcome {
    /// Keys that resolved this frame, with their waiters.
    pub resolved: Vec<ResolvedAsset>,
    /// Preload groups whose last item resolved this frame.
    pub preloads_ready: Vec<u32>,
}

impl DrainOutcome {
    /// True when nothing resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.preloads_ready.is_empty()
    }
}

/// Content-addressed, type-indexed, dedup-in-flight asset loader.
pub struct AssetCache {
    fetcher: Arc<dyn AssetFetcher>,
    ready: HashMap<AssetKey, Result<Arc<Asset>, AssetError>>,
    pending: HashMap<AssetKey, Vec<AssetWaiter>>,
    completion_tx: crossbeam_channel::Sender<Completion>,
    completion_rx: crossbeam_channel::Receiver<Completion>,
    preload_groups: HashMap<u32, usize>,
    next_preload_group: u32,
    /// Servers refuse avatar decoding and substitute the placeholder.
    decode_avatars: bool,
}

impl AssetCache {
    /// Creates a cache over a fetch collaborator.
    #[must_use]
    pub fn new(fetcher: Arc<dyn AssetFetcher>, decode_avatars: bool) -> Self {
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        Self {
            fetcher,
            ready: HashMap::new(),
            pending: HashMap::new(),
            completion_tx,
            completion_rx,
            preload_groups: HashMap::new(),
            next_preload_group: 0,
            decode_avatars,
        }
    }

    /// True when a successful result is cached for the key.
    #[must_use]
    pub fn has(&self, ty: AssetType, url: &str) -> bool {
        self.ready
            .get(&AssetKey::new(ty, url))
            .is_some_and(Result::is_ok)
    }

    /// Returns the cached asset without fetching.
    #[must_use]
    pub fn get(&self, ty: AssetType, url: &str) -> Option<Arc<Asset>> {
        match self.ready.get(&AssetKey::new(ty, url)) {
            Some(Ok(asset)) => Some(Arc::clone(asset)),
            _ => None,
        }
    }

    /// Returns the memoized outcome (success or failure) without fetching.
    #[must_use]
    pub fn outcome(&self, key: &AssetKey) -> Option<Result<Arc<Asset>, AssetError>> {
        self.ready.get(key).cloned()
    }

    /// Requests an asset on behalf of `waiter`.
    ///
    /// If the outcome is already known the waiter is still serviced through
    /// the completion queue (next drain), so callers observe one delivery
    /// path regardless of cache state. If a fetch is in flight the waiter
    /// joins it; otherwise a fetch starts. At most one fetch per key.
    pub fn load(&mut self, key: AssetKey, waiter: AssetWaiter) {
        if let Some(outcome) = self.ready.get(&key) {
            // Re-announce the memoized outcome for this waiter.
            let _ = self.completion_tx.send(Completion {
                key: key.clone(),
                outcome: outcome
                    .as_ref()
                    .map(|a| a.as_ref().clone())
                    .map_err(Clone::clone),
            });
            self.pending.entry(key).or_default().push(waiter);
            return;
        }
        if let Some(waiters) = self.pending.get_mut(&key) {
            waiters.push(waiter);
            return;
        }
        self.pending.insert(key.clone(), vec![waiter]);
        self.spawn_fetch(key);
    }

    /// Publishes locally-sourced bytes under a key, satisfying any pending
    /// fetch for it.
    pub fn insert(&mut self, ty: AssetType, url: &str, bytes: &[u8]) {
        let key = AssetKey::new(ty, url);
        let outcome = decode_asset(ty, url, bytes, self.decode_avatars);
        let _ = self.completion_tx.send(Completion { key, outcome });
    }

    /// Starts a preload group over the given keys; returns the group ticket
    /// reported in [`DrainOutcome::preloads_ready`] once every key resolves.
    pub fn preload(&mut self, keys: Vec<AssetKey>) -> u32 {
        self.next_preload_group += 1;
        let group = self.next_preload_group;
        // An empty group reports ready at the next drain.
        self.preload_groups.insert(group, keys.len());
        for key in keys {
            self.load(key, AssetWaiter::Preload { group });
        }
        group
    }

    /// Drains completed fetches. Call between frames, never mid-phase.
    pub fn drain(&mut self) -> DrainOutcome {
        let mut out = DrainOutcome::default();
        while let Ok(completion) = self.completion_rx.try_recv() {
            let shared = match completion.outcome {
                Ok(asset) => Ok(Arc::new(asset)),
                Err(err) => Err(err),
            };
            // First resolution memoizes; re-announcements keep the original.
            let memoized = self
                .ready
                .entry(completion.key.clone())
                .or_insert_with(|| shared.clone())
                .clone();
            let waiters = self.pending.remove(&completion.key).unwrap_or_default();
            for waiter in &waiters {
                if let AssetWaiter::Preload { group } = waiter {
                    if let Some(remaining) = self.preload_groups.get_mut(group) {
                        *remaining = remaining.saturating_sub(1);
                    }
                }
            }
            out.resolved.push(ResolvedAsset {
                key: completion.key,
                outcome: memoized,
                waiters,
            });
        }
        self.preload_groups.retain(|group, remaining| {
            if *remaining == 0 {
                out.preloads_ready.push(*group);
                false
            } else {
                true
            }
        });
        out
    }

    /// Number of fetches currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending
            .keys()
            .filter(|key| !self.ready.contains_key(*key))
            .count()
    }

    fn spawn_fetch(&self, key: AssetKey) {
        let fetcher = Arc::clone(&self.fetcher);
        let tx = self.completion_tx.clone();
        let decode_avatars = self.decode_avatars;
        std::thread::spawn(move || {
            let outcome = match fetcher.fetch(&key.url) {
                Ok(bytes) => decode_asset(key.ty, &key.url, &bytes, decode_avatars),
                Err(reason) => Err(AssetError::Fetch {
                    url: key.url.clone(),
                    reason,
                }),
            };
            if tx.send(Completion { key, outcome }).is_err() {
                // Cache dropped while the fetch was in flight; nobody is
                // left to care about the result.
            }
        });
    }
}

fn decode_asset(ty: AssetType, url: &str, bytes: &[u8], decode_avatars: bool) -> Result<Asset, AssetError> {
    match ty {
        AssetType::Model => Ok(Asset::Scene(ModelTemplate {
            url: url.to_owned(),
            size: bytes.len(),
            placeholder: false,
        })),
        AssetType::Avatar => {
            if decode_avatars {
                Ok(Asset::Scene(ModelTemplate {
                    url: url.to_owned(),
                    size: bytes.len(),
                    placeholder: false,
                }))
            } else {
                // The replication contract only needs symmetric blueprint
                // identity, not symmetric decoding.
                Ok(Asset::Scene(ModelTemplate {
                    url: url.to_owned(),
                    size: 0,
                    placeholder: true,
                }))
            }
        }
        AssetType::Emote => {
            let (hash, _) = parse_asset_url(url).unwrap_or((url, ""));
            Ok(Asset::Clip(hash.to_owned()))
        }
        AssetType::Texture | AssetType::Hdr => Ok(Asset::Texture(TextureHandle {
            url: url.to_owned(),
            size: bytes.len(),
        })),
        AssetType::Script => match std::str::from_utf8(bytes) {
            Ok(source) => Ok(Asset::Script(source.to_owned())),
            Err(_) => Err(AssetError::Decode {
                url: url.to_owned(),
                reason: "script is not utf-8".to_owned(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn drain_until(cache: &mut AssetCache, want: usize) -> Vec<ResolvedAsset> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut resolved = Vec::new();
        while resolved.len() < want {
            assert!(Instant::now() < deadline, "timed out waiting for assets");
            resolved.extend(cache.drain().resolved);
            std::thread::sleep(Duration::from_millis(1));
        }
        resolved
    }

    fn waiter() -> AssetWaiter {
        AssetWaiter::AppBuild {
            entity: EntityId::random(),
            generation: 1,
        }
    }

    #[test]
    fn test_asset_url_grammar() {
        assert_eq!(parse_asset_url("asset://a1b2.glb"), Some(("a1b2", "glb")));
        assert!(parse_asset_url("https://x/y.glb").is_none());
        assert!(parse_asset_url("asset://nope").is_none());
        assert!(parse_asset_url("asset://xyz!.glb").is_none());
    }

    #[test]
    fn test_content_addressing_is_deterministic() {
        let a = asset_url_for(b"hello", "glb");
        let b = asset_url_for(b"hello", "glb");
        let c = asset_url_for(b"other", "glb");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(parse_asset_url(&a).is_some());
    }

    #[test]
    fn test_load_resolves_and_memoizes() {
        let fetcher = Arc::new(MapFetcher::new());
        fetcher.put("asset://ab.glb", b"model-bytes".to_vec());
        let mut cache = AssetCache::new(fetcher, true);

        cache.load(AssetKey::new(AssetType::Model, "asset://ab.glb"), waiter());
        let resolved = drain_until(&mut cache, 1);
        assert!(resolved[0].outcome.is_ok());
        assert!(cache.has(AssetType::Model, "asset://ab.glb"));
        assert!(cache.get(AssetType::Model, "asset://ab.glb").is_some());
    }

    #[test]
    fn test_failure_is_memoized_for_later_loads() {
        let fetcher = Arc::new(MapFetcher::new());
        let mut cache = AssetCache::new(fetcher, true);
        let key = AssetKey::new(AssetType::Model, "asset://dead.glb");

        cache.load(key.clone(), waiter());
        let resolved = drain_until(&mut cache, 1);
        assert!(resolved[0].outcome.is_err());

        // Subsequent requests observe the same outcome without a new fetch.
        cache.load(key.clone(), waiter());
        let resolved = drain_until(&mut cache, 1);
        assert!(resolved[0].outcome.is_err());
        assert!(!cache.has(AssetType::Model, "asset://dead.glb"));
    }

    #[test]
    fn test_single_flight_shares_one_fetch() {
        let fetcher = Arc::new(MapFetcher::new());
        fetcher.put("asset://cc.js", b"let x = 1;".to_vec());
        let mut cache = AssetCache::new(fetcher, true);
        let key = AssetKey::new(AssetType::Script, "asset://cc.js");

        cache.load(key.clone(), waiter());
        cache.load(key.clone(), waiter());
        cache.load(key, waiter());

        let resolved = drain_until(&mut cache, 1);
        // One resolution carries all three waiters.
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].waiters.len(), 3);
    }

    #[test]
    fn test_insert_publishes_locally() {
        let fetcher = Arc::new(MapFetcher::new());
        let mut cache = AssetCache::new(fetcher, true);
        cache.insert(AssetType::Script, "asset://ee.js", b"app.log(1)");
        let _ = drain_until(&mut cache, 1);
        assert!(cache.has(AssetType::Script, "asset://ee.js"));
    }

    #[test]
    fn test_preload_signals_when_all_resolve() {
        let fetcher = Arc::new(MapFetcher::new());
        fetcher.put("asset://01.glb", vec![1]);
        fetcher.put("asset://02.png", vec![2]);
        let mut cache = AssetCache::new(fetcher, true);
        let group = cache.preload(vec![
            AssetKey::new(AssetType::Model, "asset://01.glb"),
            AssetKey::new(AssetType::Texture, "asset://02.png"),
        ]);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "preload never became ready");
            let out = cache.drain();
            if out.preloads_ready.contains(&group) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_server_avatar_substitution() {
        let out = decode_asset(AssetType::Avatar, "asset://aa.vrm", b"riggy", false).unwrap();
        match out {
            Asset::Scene(template) => assert!(template.placeholder),
            other => panic!("unexpected asset {other:?}"),
        }
    }
}
