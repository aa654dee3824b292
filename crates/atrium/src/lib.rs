//! # ATRIUM World Runtime
//!
//! The authoritative server and tick-synchronized client runtime of a
//! shared real-time 3D world. Players connect over a persistent binary
//! WebSocket, spawn as capsule-controlled avatars, and interact with
//! user-scripted objects ("apps") that run identically on both sides.
//!
//! ## The spine
//!
//! ```text
//! socket bytes -> codec -> replicator dispatch
//!     -> blueprint registry / entity store / chat log
//!     -> event bus -> app scripts
//! ```
//!
//! Each frame the tick engine advances the hot entity set (fixed 50 Hz
//! physics plus variable-rate phases); the local player streams its pose at
//! the network rate; persistence flushes dirty records on an interval.
//!
//! ## Authority model
//!
//! The server owns identity, admission and persistence. Gameplay state is
//! mostly trusted to its owner: your avatar is yours, your app scripts'
//! outputs are yours. Remote poses are interpolated, never predicted.

pub mod assets;
pub mod blueprints;
pub mod chat;
pub mod entity;
pub mod game_loop;
pub mod persistence;
pub mod physics;
pub mod replicator;
pub mod scripts;
pub mod settings;
pub mod world;

pub use assets::{Asset, AssetCache, AssetError, AssetFetcher, AssetKey, AssetType};
pub use blueprints::BlueprintRegistry;
pub use chat::{ChatLog, CommandOutcome};
pub use entity::{App, AppState, Entity, EntityKind, EntityStore, PlayerLocal, PlayerRemote, TransformMode};
pub use game_loop::TickEngine;
pub use persistence::{DirtySets, PersistError, Persistence, StatusReport, WorldStore};
pub use physics::{AnalyticScene, BodyId, CombineMode, LayerMask, PhysicsScene, RayHit, SweepHit};
pub use replicator::{Everyone, InterestPolicy};
pub use scripts::{HandlerSet, ScriptError, ScriptSandbox};
pub use settings::Settings;
pub use world::World;
