// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persistent key layout.
//!
//! One kv store carries one dag:
//!
//! - `chunks/{hash}` — CBOR `(data, refs)` record.
//! - `refs/{hash}`   — CBOR refcount.
//! - `heads/{name}`  — hash in lowercase hex.

use crate::hash::Hash;

pub(crate) fn chunk_key(hash: Hash) -> String {
    format!("chunks/{hash}")
}

pub(crate) fn ref_count_key(hash: Hash) -> String {
    format!("refs/{hash}")
}

pub(crate) fn head_key(name: &str) -> String {
    format!("heads/{name}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::hash::chunk_hash;
    use serde_json::json;

    #[test]
    fn key_namespaces_are_disjoint() {
        let h = chunk_hash(&json!(1));
        assert!(chunk_key(h).starts_with("chunks/"));
        assert!(ref_count_key(h).starts_with("refs/"));
        assert_eq!(head_key("main"), "heads/main");
    }
}
