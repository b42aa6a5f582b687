// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Immutable ordered map over dag chunks.
//!
//! Every node of the tree is a [`undertow_dag::Chunk`]; internal nodes hold
//! `(max_key_of_subtree, child_hash)` pairs and leaf nodes hold sorted
//! `(key, value)` entries. Writes never mutate a node: they stage new chunks
//! along the edited path and return a new root hash, leaving untouched
//! subtrees shared by hash with every previous version.
//!
//! # Canonical Shape
//!
//! Node boundaries are content-defined: an entry closes its node when a
//! keyed, level-salted digest of its key falls under a fixed cut
//! probability (`1 / TARGET_FANOUT`). The tree's shape is therefore a pure
//! function of the key set — and, with values, the root hash is a pure
//! function of the key→value map, no matter the order of the puts and dels
//! that produced it. Node sizes are geometric around [`TARGET_FANOUT`]
//! rather than bounded by hard min/max constants; an edit rewrites at most
//! the nodes on the edited path plus one right-hand neighbour per level.
//!
//! The empty map is a single empty leaf, which is also what total deletion
//! collapses back to.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod diff;
mod index;
mod map;
mod node;

pub use diff::{diff, DiffOp};
pub use index::{
    decode_index_key, encode_index_key, encode_index_scan_prefix, index_keys, IndexKeyError,
};
pub use map::{BTree, ScanOptions};
pub use node::TARGET_FANOUT;
