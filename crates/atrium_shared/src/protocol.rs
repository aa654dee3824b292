//! # Packet Codec
//!
//! Binary framing for named messages with a typed payload.
//!
//! ## Wire format
//!
//! Each packet is `1 tag byte + value tree` (see [`crate::value`]). The tag
//! set is closed: both sides are built from the same enum, and an unknown
//! tag is a protocol error, not an extension point.
//!
//! Round-trip law: `decode(encode(name, payload)) == (name, payload)` for
//! every representable payload.

use std::time::{Duration, Instant};

use crate::constants::MAX_PACKET_SIZE;
use crate::value::{Cursor, Value};

/// Packet name, mapped to a 1-byte tag for compactness.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketName {
    /// Server -> Client: full world state on join.
    Snapshot = 0,
    /// An entity appeared.
    EntityAdded = 1,
    /// Partial entity record changed (always carries `id`).
    EntityModified = 2,
    /// An entity was removed.
    EntityRemoved = 3,
    /// Scripted event targeted at one entity: `[id, version, name, data]`.
    EntityEvent = 4,
    /// A blueprint was minted.
    BlueprintAdded = 5,
    /// A blueprint changed (version bumped).
    BlueprintModified = 6,
    /// Chat message appended.
    ChatAdded = 7,
    /// Server moved a player; remotes must snap.
    PlayerTeleport = 8,
    /// Keepalive probe.
    Ping = 9,
    /// Keepalive reply.
    Pong = 10,
}

impl PacketName {
    /// All packet names, in tag order.
    pub const ALL: [Self; 11] = [
        Self::Snapshot,
        Self::EntityAdded,
        Self::EntityModified,
        Self::EntityRemoved,
        Self::EntityEvent,
        Self::BlueprintAdded,
        Self::BlueprintModified,
        Self::ChatAdded,
        Self::PlayerTeleport,
        Self::Ping,
        Self::Pong,
    ];

    /// Parses a tag byte.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Snapshot),
            1 => Some(Self::EntityAdded),
            2 => Some(Self::EntityModified),
            3 => Some(Self::EntityRemoved),
            4 => Some(Self::EntityEvent),
            5 => Some(Self::BlueprintAdded),
            6 => Some(Self::BlueprintModified),
            7 => Some(Self::ChatAdded),
            8 => Some(Self::PlayerTeleport),
            9 => Some(Self::Ping),
            10 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Wire name, as it appears in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::EntityAdded => "entityAdded",
            Self::EntityModified => "entityModified",
            Self::EntityRemoved => "entityRemoved",
            Self::EntityEvent => "entityEvent",
            Self::BlueprintAdded => "blueprintAdded",
            Self::BlueprintModified => "blueprintModified",
            Self::ChatAdded => "chatAdded",
            Self::PlayerTeleport => "playerTeleport",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

/// Errors surfaced by the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Input does not parse as a packet.
    #[error("malformed packet")]
    Malformed,
    /// The name tag or a value tag is outside the closed set.
    #[error("unknown tag {0}")]
    UnknownTag(u8),
    /// Input ended mid-value.
    #[error("truncated packet")]
    Truncated,
    /// Value tree nested deeper than the decoder allows.
    #[error("value tree too deep")]
    DepthExceeded,
    /// Encoded packet exceeds the size cap.
    #[error("packet exceeds {MAX_PACKET_SIZE} bytes")]
    Oversize,
}

/// Encodes a named packet.
pub fn encode(name: PacketName, payload: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(64);
    out.push(name as u8);
    payload.write(&mut out);
    if out.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::Oversize);
    }
    Ok(out)
}

/// Decodes a packet into its name and payload.
///
/// Trailing bytes after the payload are a protocol error: a well-formed
/// sender never produces them, and tolerating them would let malformed
/// frames slip through unnoticed.
pub fn decode(bytes: &[u8]) -> Result<(PacketName, Value), ProtocolError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::Oversize);
    }
    let mut cursor = Cursor::new(bytes);
    let tag = cursor.read_u8()?;
    let name = PacketName::from_u8(tag).ok_or(ProtocolError::UnknownTag(tag))?;
    let payload = Value::read(&mut cursor)?;
    if cursor.remaining() != 0 {
        return Err(ProtocolError::Malformed);
    }
    Ok((name, payload))
}

/// Sliding window of decode failures for one socket.
///
/// One bad frame is tolerated (bugs happen); repeated malformation within
/// the window means the peer is broken or hostile and the socket should be
/// closed.
#[derive(Debug)]
pub struct MalformedWindow {
    window: Duration,
    threshold: u32,
    count: u32,
    window_start: Option<Instant>,
}

impl MalformedWindow {
    /// Creates a window with the given span and strike threshold.
    #[must_use]
    pub const fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            count: 0,
            window_start: None,
        }
    }

    /// Records one malformed packet. Returns true when the socket should be
    /// closed.
    pub fn record(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) <= self.window => {
                self.count += 1;
            }
            _ => {
                self.window_start = Some(now);
                self.count = 1;
            }
        }
        self.count >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::obj;

    #[test]
    fn test_tag_roundtrip() {
        for name in PacketName::ALL {
            assert_eq!(PacketName::from_u8(name as u8), Some(name));
        }
        assert_eq!(PacketName::from_u8(11), None);
        assert_eq!(PacketName::from_u8(255), None);
    }

    #[test]
    fn test_encode_decode_identity() {
        let payload = obj(&[
            ("id", Value::Str("0011223344556677".to_owned())),
            ("p", Value::Array(vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)])),
            ("t", Value::Bool(true)),
        ]);
        let bytes = encode(PacketName::EntityModified, &payload).unwrap();
        let (name, decoded) = decode(&bytes).unwrap();
        assert_eq!(name, PacketName::EntityModified);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_unknown_name_tag_rejected() {
        let mut bytes = encode(PacketName::Ping, &Value::Null).unwrap();
        bytes[0] = 200;
        assert!(matches!(decode(&bytes), Err(ProtocolError::UnknownTag(200))));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut bytes = encode(PacketName::Pong, &Value::Null).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(ProtocolError::Malformed)));
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(matches!(decode(&[]), Err(ProtocolError::Truncated)));
    }

    #[test]
    fn test_malformed_window_trips_on_burst() {
        let mut w = MalformedWindow::new(Duration::from_secs(10), 3);
        let t0 = Instant::now();
        assert!(!w.record(t0));
        assert!(!w.record(t0 + Duration::from_secs(1)));
        assert!(w.record(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_malformed_window_resets_after_span() {
        let mut w = MalformedWindow::new(Duration::from_secs(1), 2);
        let t0 = Instant::now();
        assert!(!w.record(t0));
        // Next strike lands outside the window: the count restarts.
        assert!(!w.record(t0 + Duration::from_secs(5)));
        assert!(w.record(t0 + Duration::from_secs(5)));
    }
}
