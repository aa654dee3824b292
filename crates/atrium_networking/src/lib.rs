//! # ATRIUM Networking
//!
//! The wire between worlds and the people in them.
//!
//! ## Architecture
//!
//! - **Transport**: binary WebSocket frames, one packet per frame; tokio
//!   tasks own the sockets and speak to the simulation thread exclusively
//!   through channels
//! - **Session**: per-socket identity, roles, keepalive and pose-stream
//!   bookkeeping, owned by the simulation thread
//! - **Tick**: fixed-rate frame pacer for the headless server
//! - **Interpolation**: position/orientation interpolators for remote
//!   entities, with teleport re-latching
//!
//! ## Threading Model
//!
//! ```text
//! tokio tasks                      simulation thread
//! ┌───────────────┐  NetEvent   ┌──────────────────────┐
//! │ socket reader ├────────────►│ drain between frames │
//! │ socket writer │◄────────────┤ NetCommand           │
//! └───────────────┘             └──────────────────────┘
//! ```
//!
//! Packets are processed in arrival order per socket; broadcasts are
//! non-atomic across sockets.

pub mod interpolation;
pub mod session;
pub mod tick;
pub mod transport;

pub use interpolation::{PoseInterpolator, QuatInterpolator, Vec3Interpolator};
pub use session::{Session, SessionId};
pub use tick::{FramePacer, FrameStats};
pub use transport::{NetCommand, NetEvent, NetError, WsClient, WsServer};
