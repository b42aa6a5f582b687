// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pull-response patch operations.
//!
//! The wire shape is `{"op": "...", ...}` per §the pull endpoint; application
//! order matters and is the order of the array. Application itself lives on
//! [`crate::WriteTx::apply_patch`] so index maintenance runs through the same
//! path as user writes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One element of a pull-response patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PatchOp {
    /// Remove every key.
    Clear,
    /// Set `key` to `value`.
    Put {
        /// Target key.
        key: String,
        /// New value.
        value: Value,
    },
    /// Shallow-merge fields into the object at `key`.
    ///
    /// The existing value (an object; anything else restarts from `{}`) is
    /// first restricted to the `constrain` field set when given, then the
    /// `merge` fields are written over it.
    Update {
        /// Target key.
        key: String,
        /// Fields to write.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge: Option<Map<String, Value>>,
        /// Fields to keep from the existing object.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        constrain: Option<Vec<String>>,
    },
    /// Remove `key` if present.
    Del {
        /// Target key.
        key: String,
    },
}
