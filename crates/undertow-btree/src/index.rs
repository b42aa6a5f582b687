// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Index key codec and extraction.
//!
//! Index trees are ordinary B-trees whose keys pack a `(secondary, primary)`
//! pair: `\0{secondary}\0{primary}`. The leading NUL keeps index keys out of
//! any user key namespace; the middle NUL delimits the secondary key, which
//! therefore must not contain NUL itself (primary keys may — the split is
//! first-from-the-left after the secondary).

use serde_json::Value;

/// Errors from index key extraction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexKeyError {
    /// The json pointer resolved to nothing and the index does not allow
    /// empty values.
    #[error("[IDX_NO_VALUE] no value at {pointer:?} for key {key:?}")]
    NoValue {
        /// The configured json pointer.
        pointer: String,
        /// The primary key being indexed.
        key: String,
    },
    /// The resolved value is neither a string nor an array of strings.
    #[error("[IDX_BAD_VALUE] unindexable value at {pointer:?} for key {key:?}")]
    UnindexableValue {
        /// The configured json pointer.
        pointer: String,
        /// The primary key being indexed.
        key: String,
    },
    /// A secondary key contains NUL, which the codec reserves.
    #[error("[IDX_NUL_IN_SECONDARY] secondary key for {key:?} contains NUL")]
    NulInSecondary {
        /// The primary key being indexed.
        key: String,
    },
}

/// Packs a `(secondary, primary)` pair into an index tree key.
pub fn encode_index_key(secondary: &str, primary: &str) -> String {
    format!("\u{0}{secondary}\u{0}{primary}")
}

/// Prefix covering every index entry whose secondary key starts with
/// `secondary_prefix`.
pub fn encode_index_scan_prefix(secondary_prefix: &str) -> String {
    format!("\u{0}{secondary_prefix}")
}

/// Splits an index tree key back into `(secondary, primary)`.
pub fn decode_index_key(encoded: &str) -> Option<(&str, &str)> {
    let rest = encoded.strip_prefix('\u{0}')?;
    let split = rest.find('\u{0}')?;
    Some((&rest[..split], &rest[split + 1..]))
}

/// Computes the index tree keys for one `(key, value)` entry.
///
/// The json pointer selects the secondary key material: a string indexes
/// once, an array of strings once per element. A missing target indexes
/// under the empty secondary when `allow_empty` is set and errors otherwise.
pub fn index_keys(
    key: &str,
    value: &Value,
    json_pointer: &str,
    allow_empty: bool,
) -> Result<Vec<String>, IndexKeyError> {
    let target = value.pointer(json_pointer);
    let secondaries: Vec<&str> = match target {
        None | Some(Value::Null) => {
            if allow_empty {
                vec![""]
            } else {
                return Err(IndexKeyError::NoValue {
                    pointer: json_pointer.to_owned(),
                    key: key.to_owned(),
                });
            }
        }
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let Value::String(s) = item else {
                    return Err(IndexKeyError::UnindexableValue {
                        pointer: json_pointer.to_owned(),
                        key: key.to_owned(),
                    });
                };
                out.push(s.as_str());
            }
            out
        }
        Some(_) => {
            return Err(IndexKeyError::UnindexableValue {
                pointer: json_pointer.to_owned(),
                key: key.to_owned(),
            });
        }
    };

    let mut keys = Vec::with_capacity(secondaries.len());
    for secondary in secondaries {
        if secondary.contains('\u{0}') {
            return Err(IndexKeyError::NulInSecondary {
                key: key.to_owned(),
            });
        }
        keys.push(encode_index_key(secondary, key));
    }
    Ok(keys)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn codec_roundtrip() {
        let encoded = encode_index_key("alice", "user/1");
        assert_eq!(decode_index_key(&encoded), Some(("alice", "user/1")));
        // Primary keys may contain NUL; the first delimiter wins.
        let tricky = encode_index_key("a", "p\u{0}q");
        assert_eq!(decode_index_key(&tricky), Some(("a", "p\u{0}q")));
        assert_eq!(decode_index_key("no-prefix"), None);
    }

    #[test]
    fn scan_prefix_covers_matching_secondaries() {
        let prefix = encode_index_scan_prefix("ali");
        assert!(encode_index_key("alice", "k").starts_with(&prefix));
        assert!(!encode_index_key("bob", "k").starts_with(&prefix));
    }

    #[test]
    fn string_target_indexes_once() {
        let keys = index_keys("u/1", &json!({"name": "alice"}), "/name", false).unwrap();
        assert_eq!(keys, vec![encode_index_key("alice", "u/1")]);
    }

    #[test]
    fn array_target_indexes_per_element() {
        let keys = index_keys("u/1", &json!({"tags": ["a", "b"]}), "/tags", false).unwrap();
        assert_eq!(
            keys,
            vec![encode_index_key("a", "u/1"), encode_index_key("b", "u/1")]
        );
    }

    #[test]
    fn missing_target_honors_allow_empty() {
        let value = json!({"other": 1});
        assert!(matches!(
            index_keys("u/1", &value, "/name", false),
            Err(IndexKeyError::NoValue { .. })
        ));
        let keys = index_keys("u/1", &value, "/name", true).unwrap();
        assert_eq!(keys, vec![encode_index_key("", "u/1")]);
    }

    #[test]
    fn non_string_target_is_rejected() {
        let value = json!({"n": 7});
        assert!(matches!(
            index_keys("u/1", &value, "/n", false),
            Err(IndexKeyError::UnindexableValue { .. })
        ));
        assert!(matches!(
            index_keys("u/1", &json!({"t": ["ok", 3]}), "/t", false),
            Err(IndexKeyError::UnindexableValue { .. })
        ));
    }

    #[test]
    fn nul_in_secondary_is_rejected() {
        let value = json!({"name": "bad\u{0}name"});
        assert!(matches!(
            index_keys("u/1", &value, "/name", false),
            Err(IndexKeyError::NulInSecondary { .. })
        ));
    }
}
