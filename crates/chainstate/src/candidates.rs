//! Chain tips that could become the active tip, ordered by work.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap};

use primitive_types::U256;

use crate::blockindex::NodeId;
use crate::tree::BlockTree;

/// Sort key where greater means better: more work, then earlier sequence id,
/// then lower node id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkKey {
    work: U256,
    sequence: Reverse<u64>,
    id: Reverse<NodeId>,
}

impl WorkKey {
    pub fn of(tree: &BlockTree, id: NodeId) -> Self {
        let node = tree.node(id);
        Self {
            work: node.chain_work,
            sequence: Reverse(node.sequence_id),
            id: Reverse(id),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id.0
    }
}

pub fn compare_work(tree: &BlockTree, a: NodeId, b: NodeId) -> Ordering {
    WorkKey::of(tree, a).cmp(&WorkKey::of(tree, b))
}

/// Whether `a` ranks strictly above `b`.
pub fn better_than(tree: &BlockTree, a: NodeId, b: NodeId) -> bool {
    compare_work(tree, a, b) == Ordering::Greater
}

#[derive(Debug, Default)]
pub struct CandidateSet {
    ordered: BTreeSet<WorkKey>,
    keys: HashMap<NodeId, WorkKey>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn insert(&mut self, tree: &BlockTree, id: NodeId) {
        let key = WorkKey::of(tree, id);
        if let Some(previous) = self.keys.insert(id, key) {
            self.ordered.remove(&previous);
        }
        self.ordered.insert(key);
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => self.ordered.remove(&key),
            None => false,
        }
    }

    pub fn best(&self) -> Option<NodeId> {
        self.ordered.last().map(WorkKey::id)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ordered.iter().rev().map(WorkKey::id)
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.keys.clear();
    }

    /// Drops every candidate ranked below `tip`.
    ///
    /// # Panics
    ///
    /// If nothing is left afterwards; the tip or something better must
    /// always remain.
    pub fn prune(&mut self, tree: &BlockTree, tip: NodeId) {
        let keep = self.ordered.split_off(&WorkKey::of(tree, tip));
        for dropped in std::mem::replace(&mut self.ordered, keep) {
            self.keys.remove(&dropped.id());
        }
        assert!(
            !self.ordered.is_empty(),
            "candidate set empty after pruning below the active tip"
        );
    }
}
