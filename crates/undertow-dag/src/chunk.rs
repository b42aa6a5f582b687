// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Immutable chunk values.

use std::sync::Arc;

use serde_json::Value;

use crate::hash::{chunk_hash, Hash};

/// An immutable `(hash, data, refs)` triple.
///
/// `data` is a JSON-shaped payload behind an `Arc` — sharing the allocation
/// between the cache, transactions, and subscribers is safe because nothing
/// ever mutates a chunk in place. `refs` lists the hashes this chunk keeps
/// alive (deduplicated, first-occurrence order); weak back-references (a
/// snapshot's basis, a replayed commit's original) are deliberately **not**
/// refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    hash: Hash,
    data: Arc<Value>,
    refs: Arc<[Hash]>,
}

impl Chunk {
    /// Creates a chunk, computing its content hash.
    pub fn new(data: Value, refs: &[Hash]) -> Self {
        let hash = chunk_hash(&data);
        Self::with_hash(hash, Arc::new(data), refs)
    }

    /// Rebuilds a chunk from storage with a known hash.
    ///
    /// The hash is trusted; storage is the integrity boundary and verifies on
    /// the way in, not on every read.
    pub(crate) fn with_hash(hash: Hash, data: Arc<Value>, refs: &[Hash]) -> Self {
        let mut deduped: Vec<Hash> = Vec::with_capacity(refs.len());
        for r in refs {
            if !deduped.contains(r) {
                deduped.push(*r);
            }
        }
        Self {
            hash,
            data,
            refs: deduped.into(),
        }
    }

    /// The content hash.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The JSON payload.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Shared handle onto the payload.
    pub fn data_arc(&self) -> Arc<Value> {
        Arc::clone(&self.data)
    }

    /// Hashes this chunk holds strong references to.
    pub fn refs(&self) -> &[Hash] {
        &self.refs
    }

    /// Approximate in-memory size, used for the lazy-dag cache budget.
    pub fn size_bytes(&self) -> usize {
        json_size(&self.data) + self.refs.len() * 32
    }
}

/// Rough byte footprint of a JSON value.
///
/// This is a budget estimate, not an exact allocation count: scalars cost a
/// word, strings their length, containers the sum of their parts plus a small
/// per-entry overhead.
pub fn json_size(value: &Value) -> usize {
    const SCALAR: usize = 8;
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => SCALAR,
        Value::String(s) => SCALAR + s.len(),
        Value::Array(items) => SCALAR + items.iter().map(json_size).sum::<usize>(),
        Value::Object(map) => {
            SCALAR
                + map
                    .iter()
                    .map(|(k, v)| SCALAR + k.len() + json_size(v))
                    .sum::<usize>()
        }
    }
}
