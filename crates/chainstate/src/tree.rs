//! Arena of block index nodes and the active chain view over it.

use std::collections::HashMap;

use chaind_consensus::constants::MEDIAN_TIME_SPAN;
use chaind_consensus::{hash256_to_hex, Hash256};
use chaind_pow::block_proof;
use chaind_primitives::BlockHeader;
use primitive_types::U256;

use crate::blockindex::{BlockIndexNode, NodeId, BLOCK_VALID_TREE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    DuplicateHeader(Hash256),
    OrphanHeader { hash: Hash256, parent: Hash256 },
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeError::DuplicateHeader(hash) => {
                write!(f, "header {} already known", hash256_to_hex(hash))
            }
            TreeError::OrphanHeader { hash, parent } => write!(
                f,
                "header {} has unknown parent {}",
                hash256_to_hex(hash),
                hash256_to_hex(parent)
            ),
        }
    }
}

impl std::error::Error for TreeError {}

/// Turn the lowest set bit off.
fn invert_lowest_one(value: i32) -> i32 {
    value & (value - 1)
}

/// Height the skip pointer of a node at `height` points to.
pub fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    // Clearing low bits keeps ancestor walks at O(log n) steps.
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Debug, Default)]
pub struct BlockTree {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash256, NodeId>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        &mut self.nodes[id.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Adds a header whose parent is already in the tree. A header with a
    /// null previous hash starts a new root.
    pub fn insert(&mut self, header: &BlockHeader) -> Result<NodeId, TreeError> {
        let hash = header.hash();
        if self.by_hash.contains_key(&hash) {
            return Err(TreeError::DuplicateHeader(hash));
        }
        let parent = if header.prev_block == [0u8; 32] {
            None
        } else {
            Some(self.lookup(&header.prev_block).ok_or(TreeError::OrphanHeader {
                hash,
                parent: header.prev_block,
            })?)
        };

        let proof = block_proof(header.bits);
        let (height, chain_work, skip) = match parent {
            Some(parent_id) => {
                let parent_node = self.node(parent_id);
                let height = parent_node.height + 1;
                let work = parent_node.chain_work.saturating_add(proof);
                (height, work, self.ancestor(parent_id, skip_height(height)))
            }
            None => (0, proof, None),
        };

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(BlockIndexNode {
            hash,
            header: header.clone(),
            parent,
            skip,
            height,
            chain_work,
            status: BLOCK_VALID_TREE,
            tx_count: 0,
            chain_tx: 0,
            sequence_id: 0,
            block_pos: None,
            undo_pos: None,
        });
        self.by_hash.insert(hash, id);
        Ok(id)
    }

    /// The ancestor of `id` at exactly `height`.
    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        let start = self.node(id);
        if height > start.height || height < 0 {
            return None;
        }

        let mut walk = id;
        let mut walk_height = start.height;
        while walk_height > height {
            let node = self.node(walk);
            let skip_to = skip_height(walk_height);
            let skip_prev = skip_height(walk_height - 1);
            match node.skip {
                // Only follow the skip pointer if the parent's skip would not
                // land closer to the target.
                Some(skip)
                    if skip_to == height
                        || (skip_to > height
                            && !(skip_prev < skip_to - 2 && skip_prev >= height)) =>
                {
                    walk = skip;
                    walk_height = skip_to;
                }
                _ => {
                    walk = node.parent?;
                    walk_height -= 1;
                }
            }
        }
        Some(walk)
    }

    /// Lowest common ancestor of `a` and `b`, if they share a root.
    pub fn find_fork(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let (mut a, mut b) = (a, b);
        let (height_a, height_b) = (self.node(a).height, self.node(b).height);
        if height_a > height_b {
            a = self.ancestor(a, height_b)?;
        } else if height_b > height_a {
            b = self.ancestor(b, height_a)?;
        }
        while a != b {
            a = self.node(a).parent?;
            b = self.node(b).parent?;
        }
        Some(a)
    }

    pub fn is_ancestor(&self, ancestor: NodeId, of: NodeId) -> bool {
        self.ancestor(of, self.node(ancestor).height) == Some(ancestor)
    }

    /// Median timestamp of the last eleven blocks ending at `id`.
    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.node(current);
            times.push(node.time());
            cursor = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    pub fn work(&self, id: NodeId) -> U256 {
        self.node(id).chain_work
    }
}

/// The height-indexed chain from genesis to the current tip.
#[derive(Debug, Default, Clone)]
pub struct ActiveChain {
    chain: Vec<NodeId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.chain.last().copied()
    }

    pub fn genesis(&self) -> Option<NodeId> {
        self.chain.first().copied()
    }

    /// Height of the tip, or -1 when empty.
    pub fn height(&self) -> i32 {
        self.chain.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<NodeId> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.chain.get(height).copied())
    }

    pub fn contains(&self, tree: &BlockTree, id: NodeId) -> bool {
        self.at(tree.node(id).height) == Some(id)
    }

    pub fn next(&self, tree: &BlockTree, id: NodeId) -> Option<NodeId> {
        if self.contains(tree, id) {
            self.at(tree.node(id).height + 1)
        } else {
            None
        }
    }

    /// Points the chain at `tip`, rewriting only the entries that differ.
    pub fn set_tip(&mut self, tree: &BlockTree, tip: Option<NodeId>) {
        let Some(tip) = tip else {
            self.chain.clear();
            return;
        };
        let len = tree.node(tip).height as usize + 1;
        self.chain.truncate(len);
        let unset_from = self.chain.len();
        self.chain.resize(len, tip);

        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let height = tree.node(id).height as usize;
            if height < unset_from && self.chain[height] == id {
                break;
            }
            self.chain[height] = id;
            cursor = tree.node(id).parent;
        }
    }

    /// Highest node of the active chain that is an ancestor of `id`.
    pub fn find_fork(&self, tree: &BlockTree, id: NodeId) -> Option<NodeId> {
        let mut cursor = if tree.node(id).height > self.height() {
            tree.ancestor(id, self.height())
        } else {
            Some(id)
        };
        while let Some(current) = cursor {
            if self.contains(tree, current) {
                return Some(current);
            }
            cursor = tree.node(current).parent;
        }
        None
    }

    /// Block hashes going back from `id`, dense for the first ten and then
    /// doubling the step, always ending at genesis.
    pub fn locator(&self, tree: &BlockTree, id: NodeId) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1i32;
        let mut cursor = id;
        loop {
            let node = tree.node(cursor);
            hashes.push(node.hash);
            if node.height == 0 {
                break;
            }
            let height = (node.height - step).max(0);
            cursor = if self.contains(tree, cursor) {
                match self.at(height) {
                    Some(next) => next,
                    None => break,
                }
            } else {
                match tree.ancestor(cursor, height) {
                    Some(next) => next,
                    None => break,
                }
            };
            if hashes.len() > 10 {
                step *= 2;
            }
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(parent: &Hash256, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: *parent,
            merkle_root: [0u8; 32],
            time,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    fn build_chain(tree: &mut BlockTree, len: usize) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(len);
        let mut prev = [0u8; 32];
        for height in 0..len {
            let id = tree
                .insert(&child(&prev, 1_000 + height as u32 * 600, 0))
                .expect("insert");
            prev = tree.node(id).hash;
            ids.push(id);
        }
        ids
    }

    #[test]
    fn skip_heights_are_lower() {
        assert_eq!(skip_height(0), 0);
        assert_eq!(skip_height(1), 0);
        assert_eq!(skip_height(2), 0);
        assert_eq!(skip_height(4), 0);
        assert_eq!(skip_height(6), 4);
        assert_eq!(skip_height(7), 1);
        for height in 2..5_000 {
            assert!(skip_height(height) < height);
        }
    }

    #[test]
    fn insert_rejects_duplicates_and_orphans() {
        let mut tree = BlockTree::new();
        let genesis = child(&[0u8; 32], 1_000, 0);
        let id = tree.insert(&genesis).expect("genesis");
        assert_eq!(
            tree.insert(&genesis),
            Err(TreeError::DuplicateHeader(tree.node(id).hash))
        );
        let orphan = child(&[9u8; 32], 1_600, 0);
        assert!(matches!(
            tree.insert(&orphan),
            Err(TreeError::OrphanHeader { parent, .. }) if parent == [9u8; 32]
        ));
    }

    #[test]
    fn ancestor_reaches_every_height() {
        let mut tree = BlockTree::new();
        let ids = build_chain(&mut tree, 600);
        let tip = *ids.last().expect("tip");
        for height in 0..600 {
            let found = tree.ancestor(tip, height).expect("ancestor");
            assert_eq!(tree.node(found).height, height);
            assert_eq!(found, ids[height as usize]);
        }
        assert_eq!(tree.ancestor(tip, 600), None);
        assert_eq!(tree.ancestor(tip, -1), None);
    }

    #[test]
    fn work_strictly_increases() {
        let mut tree = BlockTree::new();
        let ids = build_chain(&mut tree, 50);
        for pair in ids.windows(2) {
            assert!(tree.work(pair[1]) > tree.work(pair[0]));
        }
    }

    #[test]
    fn fork_and_set_tip_follow_the_branch() {
        let mut tree = BlockTree::new();
        let main = build_chain(&mut tree, 20);
        let mut prev = tree.node(main[9]).hash;
        let mut side = Vec::new();
        for offset in 0..15u32 {
            let id = tree
                .insert(&child(&prev, 50_000 + offset, 1))
                .expect("side");
            prev = tree.node(id).hash;
            side.push(id);
        }
        let side_tip = *side.last().expect("tip");
        assert_eq!(tree.find_fork(main[19], side_tip), Some(main[9]));

        let mut chain = ActiveChain::new();
        chain.set_tip(&tree, Some(main[19]));
        assert_eq!(chain.height(), 19);
        assert_eq!(chain.find_fork(&tree, side_tip), Some(main[9]));

        chain.set_tip(&tree, Some(side_tip));
        assert_eq!(chain.height(), 24);
        for height in 0..=24 {
            let id = chain.at(height).expect("entry");
            assert_eq!(tree.node(id).height, height);
            if height > 0 {
                assert_eq!(tree.parent(id), chain.at(height - 1));
            }
        }
        assert!(chain.contains(&tree, main[9]));
        assert!(!chain.contains(&tree, main[10]));

        chain.set_tip(&tree, Some(main[5]));
        assert_eq!(chain.tip(), Some(main[5]));
        assert_eq!(chain.next(&tree, main[4]), Some(main[5]));
        assert_eq!(chain.next(&tree, main[5]), None);
    }

    #[test]
    fn locator_ends_at_genesis() {
        let mut tree = BlockTree::new();
        let ids = build_chain(&mut tree, 100);
        let mut chain = ActiveChain::new();
        chain.set_tip(&tree, ids.last().copied());
        let locator = chain.locator(&tree, ids[99]);
        assert_eq!(locator.first(), Some(&tree.node(ids[99]).hash));
        assert_eq!(locator.last(), Some(&tree.node(ids[0]).hash));
        assert_eq!(locator[10], tree.node(ids[89]).hash);
        assert_eq!(locator[11], tree.node(ids[88]).hash);
        assert_eq!(locator[12], tree.node(ids[86]).hash);
    }

    #[test]
    fn median_time_past_uses_eleven_blocks() {
        let mut tree = BlockTree::new();
        let ids = build_chain(&mut tree, 30);
        // Times are 1000 + 600h, so the median of heights 19..=29 is height 24.
        assert_eq!(tree.median_time_past(ids[29]), 1_000 + 24 * 600);
        assert_eq!(tree.median_time_past(ids[0]), 1_000);
    }
}
