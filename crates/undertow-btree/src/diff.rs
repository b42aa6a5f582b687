// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Lockstep tree diff.
//!
//! Walks two trees as merged sorted entry streams. Before either cursor
//! descends, the walk compares the subtrees both are about to enter; equal
//! child hashes are skipped wholesale, so the cost is proportional to the
//! changed region, not the tree. Canonical chunking makes the skip fire
//! reliably: identical key runs produce identical chunks on both sides.

use serde_json::Value;

use undertow_dag::{ChunkRead, DagResult, Hash};

use crate::node::Node;

/// One element of a diff stream, keyed ascending, never `old == new`.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    /// Key present only in the new tree.
    Add {
        /// The added key.
        key: String,
        /// Its value in the new tree.
        new_value: Value,
    },
    /// Key present in both trees with different values.
    Change {
        /// The changed key.
        key: String,
        /// Its value in the old tree.
        old_value: Value,
        /// Its value in the new tree.
        new_value: Value,
    },
    /// Key present only in the old tree.
    Del {
        /// The removed key.
        key: String,
        /// Its value in the old tree.
        old_value: Value,
    },
}

impl DiffOp {
    /// The key this op is about.
    pub fn key(&self) -> &str {
        match self {
            DiffOp::Add { key, .. } | DiffOp::Change { key, .. } | DiffOp::Del { key, .. } => key,
        }
    }

    /// The value after the op, if the key survives it.
    pub fn new_value(&self) -> Option<&Value> {
        match self {
            DiffOp::Add { new_value, .. } | DiffOp::Change { new_value, .. } => Some(new_value),
            DiffOp::Del { .. } => None,
        }
    }

    /// The value before the op, if the key existed.
    pub fn old_value(&self) -> Option<&Value> {
        match self {
            DiffOp::Change { old_value, .. } | DiffOp::Del { old_value, .. } => Some(old_value),
            DiffOp::Add { .. } => None,
        }
    }
}

/// Computes the ops that transform the tree at `old_root` into the one at
/// `new_root`.
pub async fn diff(
    dag: &dyn ChunkRead,
    old_root: Hash,
    new_root: Hash,
) -> DagResult<Vec<DiffOp>> {
    let mut out = Vec::new();
    if old_root == new_root {
        return Ok(out);
    }
    let mut old = Cursor::new(dag, old_root).await?;
    let mut new = Cursor::new(dag, new_root).await?;

    loop {
        // Skip subtrees shared by hash while both cursors sit at a descent
        // point.
        while let (Some(ha), Some(hb)) = (old.peek_child(), new.peek_child()) {
            if ha != hb {
                break;
            }
            old.skip_child();
            new.skip_child();
        }

        let old_key = old.peek_entry(dag).await?.map(|(k, _)| k.clone());
        let new_key = new.peek_entry(dag).await?.map(|(k, _)| k.clone());
        match (old_key, new_key) {
            (None, None) => break,
            (Some(_), None) => {
                if let Some((key, old_value)) = old.take_entry() {
                    out.push(DiffOp::Del { key, old_value });
                }
            }
            (None, Some(_)) => {
                if let Some((key, new_value)) = new.take_entry() {
                    out.push(DiffOp::Add { key, new_value });
                }
            }
            (Some(ka), Some(kb)) => match ka.cmp(&kb) {
                std::cmp::Ordering::Less => {
                    if let Some((key, old_value)) = old.take_entry() {
                        out.push(DiffOp::Del { key, old_value });
                    }
                }
                std::cmp::Ordering::Greater => {
                    if let Some((key, new_value)) = new.take_entry() {
                        out.push(DiffOp::Add { key, new_value });
                    }
                }
                std::cmp::Ordering::Equal => {
                    let a = old.take_entry();
                    let b = new.take_entry();
                    if let (Some((key, old_value)), Some((_, new_value))) = (a, b) {
                        if old_value != new_value {
                            out.push(DiffOp::Change {
                                key,
                                old_value,
                                new_value,
                            });
                        }
                    }
                }
            },
        }
    }
    Ok(out)
}

struct Frame {
    node: Node,
    idx: usize,
}

impl Frame {
    fn len(&self) -> usize {
        match &self.node {
            Node::Leaf(entries) => entries.len(),
            Node::Internal { children, .. } => children.len(),
        }
    }
}

/// In-order walker yielding leaf entries, with an exposed descent point so
/// the diff can skip shared subtrees before committing to them.
struct Cursor {
    stack: Vec<Frame>,
    current: Option<(String, Value)>,
}

impl Cursor {
    async fn new(dag: &dyn ChunkRead, root: Hash) -> DagResult<Self> {
        let node = Node::decode(&dag.must_chunk(root).await?)?;
        Ok(Self {
            stack: vec![Frame { node, idx: 0 }],
            current: None,
        })
    }

    fn normalize(&mut self) {
        while let Some(top) = self.stack.last() {
            if top.idx < top.len() {
                break;
            }
            self.stack.pop();
        }
    }

    /// The subtree this cursor would descend into next, if its next step is
    /// a descent (rather than yielding a buffered or leaf entry).
    fn peek_child(&mut self) -> Option<Hash> {
        if self.current.is_some() {
            return None;
        }
        self.normalize();
        match self.stack.last() {
            Some(Frame {
                node: Node::Internal { children, .. },
                idx,
            }) => children.get(*idx).map(|(_, h)| *h),
            _ => None,
        }
    }

    /// Advances past the child returned by the last `peek_child`.
    fn skip_child(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.idx += 1;
        }
    }

    async fn peek_entry(&mut self, dag: &dyn ChunkRead) -> DagResult<Option<&(String, Value)>> {
        if self.current.is_none() {
            loop {
                self.normalize();
                let Some(top) = self.stack.last_mut() else {
                    break;
                };
                match &top.node {
                    Node::Leaf(entries) => {
                        self.current = Some(entries[top.idx].clone());
                        top.idx += 1;
                        break;
                    }
                    Node::Internal { children, .. } => {
                        let child = children[top.idx].1;
                        top.idx += 1;
                        let node = Node::decode(&dag.must_chunk(child).await?)?;
                        self.stack.push(Frame { node, idx: 0 });
                    }
                }
            }
        }
        Ok(self.current.as_ref())
    }

    fn take_entry(&mut self) -> Option<(String, Value)> {
        self.current.take()
    }
}
