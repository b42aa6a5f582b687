// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client and client-group identifiers.
//!
//! Opaque strings in the protocol; wrapped so a client ID can never be
//! passed where a group ID belongs. Both serialize as bare strings, which
//! also makes them usable as JSON object keys in commit records.

use serde::{Deserialize, Serialize};

/// Identifier of one client (one tab, one lazy dag).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a client group (clients sharing mutators, indexes, and a
/// server-side commit history).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientGroupId(pub String);

impl std::fmt::Display for ClientGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientGroupId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
