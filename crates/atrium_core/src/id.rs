//! # Identifiers
//!
//! Entity identifiers are opaque 16-byte tokens. They are random, unique
//! process-wide, and never reused after removal within a session - the
//! store asserts the first property, the entropy carries the rest.

use rand::RngCore;

/// Opaque 16-byte entity identifier.
///
/// Displays as 32 lowercase hex characters; that hex form is what crosses
/// the wire and lands in the store.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EntityId(pub [u8; 16]);

impl EntityId {
    /// Mints a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// View the token bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex wire form.
    #[must_use]
    pub fn to_hex(self) -> String {
        let mut out = String::with_capacity(32);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Parses the hex wire form.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(bytes))
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Short random id for scripts and chat messages: 10 hex characters.
///
/// This is the id generator the sandbox exposes; collisions are acceptable
/// at script scope, which is why it is not an [`EntityId`].
#[must_use]
pub fn short_id() -> String {
    let mut bytes = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(10);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = EntityId::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(EntityId::from_hex(&hex), Some(id));
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(EntityId::from_hex("short").is_none());
        assert!(EntityId::from_hex(&"zz".repeat(16)).is_none());
        // 32 chars but multibyte utf-8
        assert!(EntityId::from_hex(&"é".repeat(16)).is_none());
    }

    #[test]
    fn test_random_ids_distinct() {
        let a = EntityId::random();
        let b = EntityId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_id_shape() {
        let id = short_id();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
