// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Chunk hashing and the `Hash` newtype.
//!
//! Determinism contract
//! - A chunk hash is a BLAKE3 digest over a canonical byte stream encoding of
//!   the chunk's JSON payload, prefixed with the `b"chunk:"` domain tag.
//! - The encoding is fixed and architecture-independent: every value is
//!   emitted as a one-byte type tag followed by its body; lengths are 8-byte
//!   little-endian; numbers are IEEE-754 double bits (little-endian); object
//!   keys are visited in lexicographic order (`serde_json::Map` iterates
//!   sorted, which the encoding relies on).
//! - Changing any of this changes every hash in every store and must be
//!   treated as a format-version bump.

use blake3::Hasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A 32-byte BLAKE3 content hash.
///
/// Thin newtype over `[u8; 32]`; the `Display` impl renders lowercase hex for
/// keys, logs, and error messages, and serde round-trips the same hex form so
/// hashes can be embedded in JSON payloads (commit records, client maps).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// View the hash as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses a lowercase-hex hash as produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hash hex"))
    }
}

/// Computes the content hash of a chunk payload.
pub fn chunk_hash(data: &Value) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(b"chunk:");
    hash_value(&mut hasher, data);
    Hash(hasher.finalize().into())
}

fn hash_value(hasher: &mut Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(&[0u8]);
        }
        Value::Bool(b) => {
            hasher.update(&[1u8, u8::from(*b)]);
        }
        Value::Number(n) => {
            // All numbers hash as IEEE-754 doubles, matching the JSON data
            // model the wire protocol speaks.
            hasher.update(&[2u8]);
            hasher.update(&n.as_f64().unwrap_or_default().to_le_bytes());
        }
        Value::String(s) => {
            hasher.update(&[3u8]);
            hash_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update(&[4u8]);
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update(&[5u8]);
            hasher.update(&(map.len() as u64).to_le_bytes());
            for (key, item) in map {
                hash_str(hasher, key);
                hash_value(hasher, item);
            }
        }
    }
}

fn hash_str(hasher: &mut Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}
