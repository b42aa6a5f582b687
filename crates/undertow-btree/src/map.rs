// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The ordered-map API: reads, scans, and canonical edits.
//!
//! Edits are path-copying: a put or del rewrites the nodes from the touched
//! leaf up to the root, consuming at most one right-hand neighbour per level
//! when a deletion erases a node-closing cut. Every rewritten run is
//! re-chunked with the same cut rule that built it, so the post-edit tree is
//! byte-identical to the tree a fresh bulk load of the same map would
//! produce.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use undertow_dag::{ChunkRead, ChunkWrite, DagError, DagResult, Hash};

use crate::node::{is_cut, rechunk, Node};

/// Hard ceiling on tree height; the cut rule makes anything near this
/// unreachable, so hitting it means corrupt or adversarial data.
const MAX_HEIGHT: u32 = 64;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An immutable B-tree identified by its root chunk.
///
/// The struct is a thin handle — copying it copies the root hash. All I/O
/// goes through the dag access passed per call, so one handle can be used
/// against a persistent transaction, a lazy one, or a recovery scratch dag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTree {
    root: Hash,
}

/// Bounds for [`BTree::scan`].
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Only keys with this prefix are yielded.
    pub prefix: String,
    /// Inclusive lower bound (exclusive with
    /// [`start_exclusive`](Self::start_exclusive)).
    pub start_key: Option<String>,
    /// Excludes `start_key` itself from the results.
    pub start_exclusive: bool,
    /// Maximum number of entries to yield.
    pub limit: Option<usize>,
}

enum EditOp<'a> {
    Put(&'a str, &'a Value),
    Del(&'a str),
}

impl EditOp<'_> {
    fn key(&self) -> &str {
        match self {
            EditOp::Put(key, _) | EditOp::Del(key) => key,
        }
    }
}

struct EditResult {
    /// Canonical replacement run at the edited node's level.
    nodes: Vec<(String, Hash)>,
    /// Whether the right-hand neighbour passed in was folded into `nodes`.
    consumed_right: bool,
    changed: bool,
}

impl EditResult {
    fn unchanged() -> Self {
        Self {
            nodes: Vec::new(),
            consumed_right: false,
            changed: false,
        }
    }
}

impl BTree {
    /// Handle onto an existing tree.
    pub fn at(root: Hash) -> Self {
        Self { root }
    }

    /// Stages an empty tree (a single empty leaf).
    pub fn init(dag: &mut dyn ChunkWrite) -> Self {
        let chunk = Node::Leaf(Vec::new()).encode();
        let root = chunk.hash();
        dag.stage_chunk(chunk);
        Self { root }
    }

    /// The root chunk hash. A pure function of the key→value map.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Returns the value under `key`, if present.
    pub async fn get(&self, dag: &dyn ChunkRead, key: &str) -> DagResult<Option<Value>> {
        let mut hash = self.root;
        loop {
            match Node::decode(&dag.must_chunk(hash).await?)? {
                Node::Leaf(entries) => {
                    return Ok(entries
                        .binary_search_by(|(k, _)| k.as_str().cmp(key))
                        .ok()
                        .map(|i| entries[i].1.clone()));
                }
                Node::Internal { children, .. } => {
                    let idx = children.partition_point(|(mk, _)| mk.as_str() < key);
                    let Some((_, child)) = children.get(idx) else {
                        return Ok(None);
                    };
                    hash = *child;
                }
            }
        }
    }

    /// Returns `true` when `key` is present.
    pub async fn has(&self, dag: &dyn ChunkRead, key: &str) -> DagResult<bool> {
        Ok(self.get(dag, key).await?.is_some())
    }

    /// Yields `(key, value)` entries in ascending key order within the scan
    /// bounds.
    pub async fn scan(
        &self,
        dag: &dyn ChunkRead,
        opts: &ScanOptions,
    ) -> DagResult<Vec<(String, Value)>> {
        let mut lower = opts.prefix.clone();
        if let Some(start) = &opts.start_key {
            if start.as_str() > lower.as_str() {
                lower.clone_from(start);
            }
        }
        let mut out = Vec::new();
        scan_node(dag, self.root, &lower, opts, &mut out).await?;
        Ok(out)
    }

    /// Sets `key` to `value`. Returns `false` when the value was already
    /// present unchanged.
    pub async fn put(
        &mut self,
        dag: &mut dyn ChunkWrite,
        key: &str,
        value: Value,
    ) -> DagResult<bool> {
        self.apply(dag, EditOp::Put(key, &value)).await
    }

    /// Removes `key`. Returns `false` when the key was absent.
    pub async fn del(&mut self, dag: &mut dyn ChunkWrite, key: &str) -> DagResult<bool> {
        self.apply(dag, EditOp::Del(key)).await
    }

    /// Resets to the empty tree.
    pub fn clear(&mut self, dag: &mut dyn ChunkWrite) {
        *self = Self::init(dag);
    }

    async fn apply(&mut self, dag: &mut dyn ChunkWrite, op: EditOp<'_>) -> DagResult<bool> {
        let root_level = Node::decode(&dag.must_chunk(self.root).await?)?.level();
        let result = edit_rec(dag, self.root, None, &op).await?;
        if !result.changed {
            return Ok(false);
        }
        let mut nodes = result.nodes;
        if nodes.is_empty() {
            *self = Self::init(dag);
            return Ok(true);
        }

        // Build parent levels until a single node covers the run.
        let mut level = root_level;
        while nodes.len() > 1 {
            level += 1;
            if level > MAX_HEIGHT {
                return Err(DagError::Corrupt("b-tree spine exceeds height cap".into()));
            }
            let mut next = Vec::new();
            for run in rechunk(nodes, level) {
                next.push(write_internal(dag, level, run)?);
            }
            nodes = next;
        }

        // Collapse a single-child spine so the root is the lowest node that
        // covers the whole map.
        let (_, mut root) = nodes.remove(0);
        loop {
            match Node::decode(&dag.must_chunk(root).await?)? {
                Node::Internal { children, .. } if children.len() == 1 => root = children[0].1,
                _ => break,
            }
        }
        self.root = root;
        Ok(true)
    }
}

fn write_leaf(
    dag: &mut dyn ChunkWrite,
    entries: Vec<(String, Value)>,
) -> DagResult<(String, Hash)> {
    let max_key = entries
        .last()
        .map(|(k, _)| k.clone())
        .ok_or_else(|| DagError::Corrupt("attempted to write empty b-tree run".into()))?;
    let chunk = Node::Leaf(entries).encode();
    let hash = chunk.hash();
    dag.stage_chunk(chunk);
    Ok((max_key, hash))
}

fn write_internal(
    dag: &mut dyn ChunkWrite,
    level: u32,
    children: Vec<(String, Hash)>,
) -> DagResult<(String, Hash)> {
    let max_key = children
        .last()
        .map(|(k, _)| k.clone())
        .ok_or_else(|| DagError::Corrupt("attempted to write empty b-tree run".into()))?;
    let chunk = Node::Internal { level, children }.encode();
    let hash = chunk.hash();
    dag.stage_chunk(chunk);
    Ok((max_key, hash))
}

fn edit_rec<'a>(
    dag: &'a mut dyn ChunkWrite,
    hash: Hash,
    right: Option<Hash>,
    op: &'a EditOp<'a>,
) -> BoxFut<'a, DagResult<EditResult>> {
    Box::pin(async move {
        match Node::decode(&dag.must_chunk(hash).await?)? {
            Node::Leaf(entries) => edit_leaf(dag, entries, right, op).await,
            Node::Internal { level, children } => {
                edit_internal(dag, level, children, right, op).await
            }
        }
    })
}

async fn edit_leaf(
    dag: &mut dyn ChunkWrite,
    mut entries: Vec<(String, Value)>,
    right: Option<Hash>,
    op: &EditOp<'_>,
) -> DagResult<EditResult> {
    let mut consumed_right = false;
    match op {
        EditOp::Put(key, value) => {
            match entries.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
                Ok(i) => {
                    if entries[i].1 == **value {
                        return Ok(EditResult::unchanged());
                    }
                    entries[i].1 = (*value).clone();
                }
                Err(i) => entries.insert(i, ((*key).to_owned(), (*value).clone())),
            }
        }
        EditOp::Del(key) => {
            let Ok(i) = entries.binary_search_by(|(k, _)| k.as_str().cmp(key)) else {
                return Ok(EditResult::unchanged());
            };
            let was_last = i + 1 == entries.len();
            let closed_run = is_cut(0, key);
            entries.remove(i);
            let tail_open = entries.last().map_or(true, |(k, _)| !is_cut(0, k));
            if was_last && closed_run && tail_open {
                if let Some(right_hash) = right {
                    let Node::Leaf(right_entries) =
                        Node::decode(&dag.must_chunk(right_hash).await?)?
                    else {
                        return Err(DagError::Corrupt("leaf sibling is not a leaf".into()));
                    };
                    entries.extend(right_entries);
                    consumed_right = true;
                }
            }
        }
    }

    let mut nodes = Vec::new();
    for run in rechunk(entries, 0) {
        nodes.push(write_leaf(dag, run)?);
    }
    Ok(EditResult {
        nodes,
        consumed_right,
        changed: true,
    })
}

async fn edit_internal(
    dag: &mut dyn ChunkWrite,
    level: u32,
    children: Vec<(String, Hash)>,
    right: Option<Hash>,
    op: &EditOp<'_>,
) -> DagResult<EditResult> {
    if children.is_empty() {
        return Err(DagError::Corrupt("empty internal b-tree node".into()));
    }
    let key = op.key();
    let idx = children.partition_point(|(mk, _)| mk.as_str() < key);
    let i = if idx == children.len() {
        match op {
            // Key beyond the max: grows through the rightmost child.
            EditOp::Put(..) => children.len() - 1,
            EditOp::Del(_) => return Ok(EditResult::unchanged()),
        }
    } else {
        idx
    };

    // The child's right-hand neighbour is either our next child or, when the
    // edit lands in our last child, the first child of our own neighbour.
    let mut right_node: Option<Node> = None;
    let (child_right, right_from_sibling) = if i + 1 < children.len() {
        (Some(children[i + 1].1), false)
    } else if let Some(right_hash) = right {
        let node = Node::decode(&dag.must_chunk(right_hash).await?)?;
        let Node::Internal {
            children: sibling_children,
            ..
        } = &node
        else {
            return Err(DagError::Corrupt("internal sibling is not internal".into()));
        };
        let first = sibling_children
            .first()
            .map(|(_, h)| *h)
            .ok_or_else(|| DagError::Corrupt("empty internal b-tree node".into()))?;
        right_node = Some(node);
        (Some(first), true)
    } else {
        (None, false)
    };

    let result = edit_rec(dag, children[i].1, child_right, op).await?;
    if !result.changed {
        return Ok(EditResult::unchanged());
    }

    let mut entries: Vec<(String, Hash)> = children[..i].to_vec();
    entries.extend(result.nodes);
    let mut consumed_right = false;
    if result.consumed_right {
        if right_from_sibling {
            let Some(Node::Internal {
                children: sibling_children,
                ..
            }) = right_node
            else {
                return Err(DagError::Corrupt("internal sibling is not internal".into()));
            };
            entries.extend(sibling_children.into_iter().skip(1));
            consumed_right = true;
        } else {
            entries.extend(children[i + 2..].iter().cloned());
        }
    } else {
        entries.extend(children[i + 1..].iter().cloned());
    }

    if entries.is_empty() {
        return Ok(EditResult {
            nodes: Vec::new(),
            consumed_right,
            changed: true,
        });
    }
    let mut nodes = Vec::new();
    for run in rechunk(entries, level) {
        nodes.push(write_internal(dag, level, run)?);
    }
    Ok(EditResult {
        nodes,
        consumed_right,
        changed: true,
    })
}

/// Returns `false` once the scan is complete (limit hit or keys past the
/// prefix range).
fn scan_node<'a>(
    dag: &'a dyn ChunkRead,
    hash: Hash,
    lower: &'a str,
    opts: &'a ScanOptions,
    out: &'a mut Vec<(String, Value)>,
) -> BoxFut<'a, DagResult<bool>> {
    Box::pin(async move {
        match Node::decode(&dag.must_chunk(hash).await?)? {
            Node::Leaf(entries) => {
                for (key, value) in entries {
                    if key.as_str() < lower {
                        continue;
                    }
                    if opts.start_exclusive && opts.start_key.as_deref() == Some(key.as_str()) {
                        continue;
                    }
                    if !key.starts_with(&opts.prefix) {
                        return Ok(key.as_str() < opts.prefix.as_str());
                    }
                    if opts.limit.is_some_and(|limit| out.len() >= limit) {
                        return Ok(false);
                    }
                    out.push((key, value));
                }
                Ok(true)
            }
            Node::Internal { children, .. } => {
                let idx = children.partition_point(|(mk, _)| mk.as_str() < lower);
                for (_, child) in &children[idx..] {
                    if opts.limit.is_some_and(|limit| out.len() >= limit) {
                        return Ok(false);
                    }
                    if !scan_node(dag, *child, lower, opts, out).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    })
}
