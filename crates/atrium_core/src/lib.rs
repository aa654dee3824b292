//! # ATRIUM Core
//!
//! The pieces everything else stands on:
//!
//! - **Identifiers**: opaque 16-byte tokens, unique process-wide, never
//!   reused within a session
//! - **EventBus**: named local events with per-listener failure isolation
//! - **Scene graph**: arena-indexed node tree with weak upward references
//!
//! ## Architecture Rules
//!
//! 1. **One owner** - all of this state lives on the simulation thread
//! 2. **No upward strong references** - parents own children, children hold
//!    ids
//! 3. **Listener failures stay local** - a throwing listener never takes
//!    down the emit

pub mod events;
pub mod id;
pub mod scene;

pub use events::{EventBus, ListenerError, ListenerId};
pub use id::{short_id, EntityId};
pub use scene::{Node, NodeId, SceneGraph};
