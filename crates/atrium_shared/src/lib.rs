//! # ATRIUM Shared
//!
//! Types that both sides of the wire must agree on: math, the packet codec,
//! the world records that ride inside packets, and the configuration
//! constants.
//!
//! This crate is deliberately I/O-free. The networking crate frames the
//! bytes; this crate only defines what the bytes mean.

pub mod constants;
pub mod math;
pub mod protocol;
pub mod records;
pub mod value;

pub use math::{Euler, Mat4, Quat, Transform, Vec2, Vec3};
pub use protocol::{decode, encode, MalformedWindow, PacketName, ProtocolError};
pub use records::{Blueprint, ChatMessage, EntityKindTag, EntityRecord, SpawnPoint, UserRecord};
pub use value::Value;
