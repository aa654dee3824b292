//! # Payload Value Tree
//!
//! The self-describing typed tree carried by every packet: null, bool,
//! integer, float, string, bytes, array, object.
//!
//! ## Design
//!
//! - One tag byte per node, little-endian scalars, u32 length prefixes
//! - Encoding is canonical: objects are ordered maps, so
//!   `decode(encode(v)) == v` and equal trees encode to equal bytes
//! - The decoder is bounded: nesting depth and collection lengths are
//!   capped so a hostile peer cannot make it allocate unbounded memory

use std::collections::BTreeMap;

use crate::constants::{MAX_VALUE_DEPTH, MAX_VALUE_LEN};
use crate::math::{Quat, Vec3};
use crate::protocol::ProtocolError;

/// Tag bytes for value nodes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ValueTag {
    Null = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    Str = 4,
    Bytes = 5,
    Array = 6,
    Object = 7,
}

impl ValueTag {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Null),
            1 => Some(Self::Bool),
            2 => Some(Self::Int),
            3 => Some(Self::Float),
            4 => Some(Self::Str),
            5 => Some(Self::Bytes),
            6 => Some(Self::Array),
            7 => Some(Self::Object),
            _ => None,
        }
    }
}

/// A self-describing payload value.
///
/// Every packet payload is one of these trees. Partial records (such as
/// `entityModified`) are objects whose present keys are the modified fields.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent / cleared field.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes (asset payloads, auth tokens).
    Bytes(Vec<u8>),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// Keyed record. Ordered map so encoding is canonical.
    Object(BTreeMap<String, Value>),
}

impl Default for Value {
    /// Absent value, matching the `Null` variant's semantics.
    fn default() -> Self {
        Self::Null
    }
}

impl Value {
    /// Empty object.
    #[must_use]
    pub fn object() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Returns the field of an object, if this is an object and the key is
    /// present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Inserts a field, if this is an object. Returns self for chaining.
    pub fn set(&mut self, key: &str, value: Value) -> &mut Self {
        if let Self::Object(map) = self {
            map.insert(key.to_owned(), value);
        }
        self
    }

    /// Removes a field from an object.
    pub fn unset(&mut self, key: &str) -> Option<Value> {
        match self {
            Self::Object(map) => map.remove(key),
            _ => None,
        }
    }

    /// True if this is `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Boolean view.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view. Floats with integral values do not coerce.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view as f64; accepts both Int and Float.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Numeric view as f32.
    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        self.as_f64().map(|f| f as f32)
    }

    /// String view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Bytes view.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Array view.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(a) => Some(a.as_slice()),
            _ => None,
        }
    }

    /// Object view.
    #[must_use]
    pub const fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Decodes a `[x, y, z]` float array as a vector.
    #[must_use]
    pub fn as_vec3(&self) -> Option<Vec3> {
        let a = self.as_array()?;
        if a.len() != 3 {
            return None;
        }
        Some(Vec3::new(a[0].as_f32()?, a[1].as_f32()?, a[2].as_f32()?))
    }

    /// Decodes a `[x, y, z, w]` float array as a quaternion.
    #[must_use]
    pub fn as_quat(&self) -> Option<Quat> {
        let a = self.as_array()?;
        if a.len() != 4 {
            return None;
        }
        Some(Quat::new(
            a[0].as_f32()?,
            a[1].as_f32()?,
            a[2].as_f32()?,
            a[3].as_f32()?,
        ))
    }

    /// Encodes a vector as a `[x, y, z]` float array.
    #[must_use]
    pub fn from_vec3(v: Vec3) -> Self {
        Self::Array(vec![
            Self::Float(f64::from(v.x)),
            Self::Float(f64::from(v.y)),
            Self::Float(f64::from(v.z)),
        ])
    }

    /// Encodes a quaternion as a `[x, y, z, w]` float array.
    #[must_use]
    pub fn from_quat(q: Quat) -> Self {
        Self::Array(vec![
            Self::Float(f64::from(q.x)),
            Self::Float(f64::from(q.y)),
            Self::Float(f64::from(q.z)),
            Self::Float(f64::from(q.w)),
        ])
    }

    /// Writes this value onto the end of `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null => out.push(ValueTag::Null as u8),
            Self::Bool(b) => {
                out.push(ValueTag::Bool as u8);
                out.push(u8::from(*b));
            }
            Self::Int(i) => {
                out.push(ValueTag::Int as u8);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Self::Float(f) => {
                out.push(ValueTag::Float as u8);
                out.extend_from_slice(&f.to_le_bytes());
            }
            Self::Str(s) => {
                out.push(ValueTag::Str as u8);
                write_len(out, s.len());
                out.extend_from_slice(s.as_bytes());
            }
            Self::Bytes(b) => {
                out.push(ValueTag::Bytes as u8);
                write_len(out, b.len());
                out.extend_from_slice(b);
            }
            Self::Array(items) => {
                out.push(ValueTag::Array as u8);
                write_len(out, items.len());
                for item in items {
                    item.write(out);
                }
            }
            Self::Object(map) => {
                out.push(ValueTag::Object as u8);
                write_len(out, map.len());
                for (key, value) in map {
                    write_len(out, key.len());
                    out.extend_from_slice(key.as_bytes());
                    value.write(out);
                }
            }
        }
    }

    /// Reads one value from the cursor.
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        Self::read_at_depth(cursor, 0)
    }

    fn read_at_depth(cursor: &mut Cursor<'_>, depth: usize) -> Result<Self, ProtocolError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(ProtocolError::DepthExceeded);
        }
        let tag = cursor.read_u8()?;
        let tag = ValueTag::from_u8(tag).ok_or(ProtocolError::UnknownTag(tag))?;
        match tag {
            ValueTag::Null => Ok(Self::Null),
            ValueTag::Bool => Ok(Self::Bool(cursor.read_u8()? != 0)),
            ValueTag::Int => Ok(Self::Int(i64::from_le_bytes(cursor.read_exact::<8>()?))),
            ValueTag::Float => Ok(Self::Float(f64::from_le_bytes(cursor.read_exact::<8>()?))),
            ValueTag::Str => {
                let len = cursor.read_len()?;
                let bytes = cursor.read_slice(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::Malformed)?;
                Ok(Self::Str(s.to_owned()))
            }
            ValueTag::Bytes => {
                let len = cursor.read_len()?;
                Ok(Self::Bytes(cursor.read_slice(len)?.to_vec()))
            }
            ValueTag::Array => {
                let len = cursor.read_len()?;
                let mut items = Vec::new();
                for _ in 0..len {
                    items.push(Self::read_at_depth(cursor, depth + 1)?);
                }
                Ok(Self::Array(items))
            }
            ValueTag::Object => {
                let len = cursor.read_len()?;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key_len = cursor.read_len()?;
                    let key_bytes = cursor.read_slice(key_len)?;
                    let key = std::str::from_utf8(key_bytes)
                        .map_err(|_| ProtocolError::Malformed)?
                        .to_owned();
                    map.insert(key, Self::read_at_depth(cursor, depth + 1)?);
                }
                Ok(Self::Object(map))
            }
        }
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u32).to_le_bytes());
}

/// Bounds-checked byte cursor for decoding.
pub struct Cursor<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor over a buffer.
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        if self.position >= self.buffer.len() {
            return Err(ProtocolError::Truncated);
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    /// Reads a fixed-size array.
    pub fn read_exact<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let slice = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Reads a byte slice of the given length.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.position + len > self.buffer.len() {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    /// Reads a u32 length prefix, rejecting lengths the peer could not have
    /// actually sent.
    pub fn read_len(&mut self) -> Result<usize, ProtocolError> {
        let len = u32::from_le_bytes(self.read_exact::<4>()?) as usize;
        if len > MAX_VALUE_LEN || len > self.remaining() {
            return Err(ProtocolError::Malformed);
        }
        Ok(len)
    }
}

// Serde bridge so opaque Value fields can ride inside persisted records.
// Mirrors the usual dynamic-value mapping: Bytes as seq of u8 is acceptable
// for the store formats we target.
impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Str(s) => serializer.serialize_str(s),
            Self::Bytes(b) => serializer.serialize_bytes(b),
            Self::Array(items) => {
                use serde::ser::SerializeSeq;
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(map) => {
                use serde::ser::SerializeMap;
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
        }
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> serde::de::Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("any payload value")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E: serde::de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D: serde::Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
                serde::Deserialize::deserialize(d)
            }

            fn visit_bool<E: serde::de::Error>(self, b: bool) -> Result<Value, E> {
                Ok(Value::Bool(b))
            }

            fn visit_i64<E: serde::de::Error>(self, i: i64) -> Result<Value, E> {
                Ok(Value::Int(i))
            }

            fn visit_u64<E: serde::de::Error>(self, u: u64) -> Result<Value, E> {
                i64::try_from(u)
                    .map(Value::Int)
                    .map_err(|_| E::custom("integer out of range"))
            }

            fn visit_f64<E: serde::de::Error>(self, f: f64) -> Result<Value, E> {
                Ok(Value::Float(f))
            }

            fn visit_str<E: serde::de::Error>(self, s: &str) -> Result<Value, E> {
                Ok(Value::Str(s.to_owned()))
            }

            fn visit_bytes<E: serde::de::Error>(self, b: &[u8]) -> Result<Value, E> {
                Ok(Value::Bytes(b.to_vec()))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
                let mut map = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Builder-style helper for object payloads.
#[must_use]
pub fn obj(fields: &[(&str, Value)]) -> Value {
    let mut map = BTreeMap::new();
    for (key, value) in fields {
        map.insert((*key).to_owned(), value.clone());
    }
    Value::Object(map)
}
