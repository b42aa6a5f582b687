// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Node representation, codec, and the content-defined cut rule.
//!
//! At-rest layout (chunk payload): `[level, entries]` where `level == 0`
//! marks a leaf with `entries = [[key, value], ...]` and `level > 0` an
//! internal node with `entries = [[max_key, child_hash_hex], ...]`. Internal
//! child hashes are also the chunk's refs, so the dag GC keeps subtrees
//! alive exactly as long as some root reaches them.

use serde_json::{json, Value};

use undertow_dag::{Chunk, DagError, DagResult, Hash};

/// Expected node fan-out. The cut probability is `1 / TARGET_FANOUT`, so
/// node sizes are geometric around this value.
pub const TARGET_FANOUT: u32 = 16;

/// Returns `true` when `key` closes its node at `level`.
///
/// Level-salted so the same key cuts independently at each level; a run of
/// identical decisions up the tree would otherwise build a degenerate spine.
pub(crate) fn is_cut(level: u32, key: &str) -> bool {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"btree-cut:");
    hasher.update(&level.to_le_bytes());
    hasher.update(key.as_bytes());
    u32::from(hasher.finalize().as_bytes()[0]) < 256 / TARGET_FANOUT
}

/// Splits an entry run into canonical node runs: a cut entry closes its run,
/// the trailing partial run (if any) forms the final node.
pub(crate) fn rechunk<T>(entries: Vec<(String, T)>, level: u32) -> Vec<Vec<(String, T)>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    for entry in entries {
        let closes = is_cut(level, &entry.0);
        current.push(entry);
        if closes {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Leaf(Vec<(String, Value)>),
    Internal {
        level: u32,
        children: Vec<(String, Hash)>,
    },
}

impl Node {
    pub(crate) fn level(&self) -> u32 {
        match self {
            Node::Leaf(_) => 0,
            Node::Internal { level, .. } => *level,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Node::Leaf(entries) => entries.is_empty(),
            Node::Internal { children, .. } => children.is_empty(),
        }
    }

    /// Max key of this subtree; `None` only for the empty leaf.
    pub(crate) fn max_key(&self) -> Option<&str> {
        match self {
            Node::Leaf(entries) => entries.last().map(|(k, _)| k.as_str()),
            Node::Internal { children, .. } => children.last().map(|(k, _)| k.as_str()),
        }
    }

    pub(crate) fn encode(&self) -> Chunk {
        match self {
            Node::Leaf(entries) => {
                let body: Vec<Value> = entries
                    .iter()
                    .map(|(k, v)| json!([k, v]))
                    .collect();
                Chunk::new(json!([0, body]), &[])
            }
            Node::Internal { level, children } => {
                let body: Vec<Value> = children
                    .iter()
                    .map(|(k, h)| json!([k, h.to_string()]))
                    .collect();
                let refs: Vec<Hash> = children.iter().map(|(_, h)| *h).collect();
                Chunk::new(json!([level, body]), &refs)
            }
        }
    }

    pub(crate) fn decode(chunk: &Chunk) -> DagResult<Node> {
        let corrupt = || DagError::Corrupt(format!("malformed b-tree node {}", chunk.hash()));
        let Value::Array(parts) = chunk.data() else {
            return Err(corrupt());
        };
        let (Some(level), Some(Value::Array(body))) = (parts.first(), parts.get(1)) else {
            return Err(corrupt());
        };
        let level = level.as_u64().ok_or_else(corrupt)?;
        let level = u32::try_from(level).map_err(|_| corrupt())?;
        if level == 0 {
            let mut entries = Vec::with_capacity(body.len());
            for pair in body {
                let Value::Array(kv) = pair else {
                    return Err(corrupt());
                };
                let (Some(Value::String(key)), Some(value)) = (kv.first(), kv.get(1)) else {
                    return Err(corrupt());
                };
                entries.push((key.clone(), value.clone()));
            }
            Ok(Node::Leaf(entries))
        } else {
            let mut children = Vec::with_capacity(body.len());
            for pair in body {
                let Value::Array(kv) = pair else {
                    return Err(corrupt());
                };
                let (Some(Value::String(key)), Some(Value::String(hex))) =
                    (kv.first(), kv.get(1))
                else {
                    return Err(corrupt());
                };
                let hash = Hash::from_hex(hex).ok_or_else(corrupt)?;
                children.push((key.clone(), hash));
            }
            Ok(Node::Internal { level, children })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn leaf_codec_roundtrip() {
        let node = Node::Leaf(vec![
            ("a".into(), json!(1)),
            ("b".into(), json!({"x": [true, null]})),
        ]);
        let chunk = node.encode();
        assert!(chunk.refs().is_empty());
        assert_eq!(Node::decode(&chunk).unwrap(), node);
    }

    #[test]
    fn internal_codec_roundtrip_with_refs() {
        let c1 = Node::Leaf(vec![("a".into(), json!(1))]).encode();
        let c2 = Node::Leaf(vec![("z".into(), json!(2))]).encode();
        let node = Node::Internal {
            level: 1,
            children: vec![("a".into(), c1.hash()), ("z".into(), c2.hash())],
        };
        let chunk = node.encode();
        assert_eq!(chunk.refs(), &[c1.hash(), c2.hash()]);
        assert_eq!(Node::decode(&chunk).unwrap(), node);
    }

    #[test]
    fn rechunk_closes_runs_at_cuts() {
        // Find one cut key and one non-cut key at level 0.
        let cut = (0..10_000)
            .map(|i| format!("k{i}"))
            .find(|k| is_cut(0, k))
            .unwrap();
        let plain = (0..10_000)
            .map(|i| format!("k{i}"))
            .find(|k| !is_cut(0, k))
            .unwrap();

        let runs = rechunk(vec![(cut.clone(), 1u8), (plain.clone(), 2u8)], 0);
        assert_eq!(runs.len(), 2, "cut entry closes the first run");
        let runs = rechunk(vec![(plain, 1u8), (cut, 2u8)], 0);
        assert_eq!(runs.len(), 1, "trailing cut closes a single run");
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        let bad = Chunk::new(json!({"not": "a node"}), &[]);
        assert!(Node::decode(&bad).is_err());
        let bad = Chunk::new(json!([0, [["key-without-value"]]]), &[]);
        assert!(Node::decode(&bad).is_err());
        let bad = Chunk::new(json!([1, [["k", "nothex"]]]), &[]);
        assert!(Node::decode(&bad).is_err());
    }
}
