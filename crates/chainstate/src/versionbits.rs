//! BIP9 soft-fork deployment state, evaluated per retarget period.

use std::collections::HashMap;

use chaind_consensus::deployments::{
    ALL_DEPLOYMENTS, LAST_OLD_BLOCK_VERSION, VERSION_BITS_TOP_BITS,
};
use chaind_consensus::{ConsensusParams, DeploymentPos, MAX_VERSION_BITS_DEPLOYMENTS};

use crate::blockindex::NodeId;
use crate::tree::BlockTree;

/// Blocks inspected when looking for unknown upgrade bits.
pub const UNKNOWN_VERSION_WINDOW: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdState::Defined => "defined",
            ThresholdState::Started => "started",
            ThresholdState::LockedIn => "locked_in",
            ThresholdState::Active => "active",
            ThresholdState::Failed => "failed",
        }
    }
}

/// Signalling progress within the current period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitsStatistics {
    pub period: u32,
    pub threshold: u32,
    pub elapsed: u32,
    pub count: u32,
    /// Whether the threshold can still be reached this period.
    pub possible: bool,
}

fn period_boundary(tree: &BlockTree, prev: NodeId, period: i32) -> Option<NodeId> {
    let height = tree.node(prev).height;
    tree.ancestor(prev, height - ((height + 1) % period))
}

/// Memoized deployment states keyed by the last block of a period. `None`
/// stands for "before genesis".
#[derive(Debug, Default)]
pub struct VersionBitsCache {
    states: [HashMap<Option<NodeId>, ThresholdState>; MAX_VERSION_BITS_DEPLOYMENTS],
}

impl VersionBitsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        for states in &mut self.states {
            states.clear();
        }
    }

    /// State of `pos` for the block that would follow `prev`.
    pub fn state(
        &mut self,
        tree: &BlockTree,
        prev: Option<NodeId>,
        params: &ConsensusParams,
        pos: DeploymentPos,
    ) -> ThresholdState {
        let deployment = params.deployment(pos);
        let period = params.miner_confirmation_window as i32;
        let threshold = params.rule_change_activation_threshold;
        let cache = &mut self.states[pos.index()];

        let mut cursor = prev.and_then(|id| period_boundary(tree, id, period));
        let mut to_compute = Vec::new();
        while !cache.contains_key(&cursor) {
            let Some(id) = cursor else {
                cache.insert(None, ThresholdState::Defined);
                break;
            };
            if tree.median_time_past(id) < deployment.start_time {
                cache.insert(cursor, ThresholdState::Defined);
                break;
            }
            to_compute.push(id);
            cursor = tree.ancestor(id, tree.node(id).height - period);
        }

        let mut state = cache
            .get(&cursor)
            .copied()
            .unwrap_or(ThresholdState::Defined);
        while let Some(id) = to_compute.pop() {
            let time = tree.median_time_past(id);
            state = match state {
                ThresholdState::Defined if time >= deployment.timeout => ThresholdState::Failed,
                ThresholdState::Defined if time >= deployment.start_time => {
                    ThresholdState::Started
                }
                ThresholdState::Started if time >= deployment.timeout => ThresholdState::Failed,
                ThresholdState::Started => {
                    let mut count = 0u32;
                    let mut walk = Some(id);
                    for _ in 0..period {
                        let Some(node) = walk else { break };
                        if deployment.signalled_by(tree.node(node).header.version) {
                            count += 1;
                        }
                        walk = tree.parent(node);
                    }
                    if count >= threshold {
                        ThresholdState::LockedIn
                    } else {
                        ThresholdState::Started
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                other => other,
            };
            cache.insert(Some(id), state);
        }
        state
    }

    /// First height at which the current state of `pos` held.
    pub fn state_since_height(
        &mut self,
        tree: &BlockTree,
        prev: Option<NodeId>,
        params: &ConsensusParams,
        pos: DeploymentPos,
    ) -> i32 {
        let initial = self.state(tree, prev, params, pos);
        if initial == ThresholdState::Defined {
            return 0;
        }
        let period = params.miner_confirmation_window as i32;
        let Some(mut boundary) = prev.and_then(|id| period_boundary(tree, id, period)) else {
            return 0;
        };
        while let Some(earlier) = tree.ancestor(boundary, tree.node(boundary).height - period) {
            if self.state(tree, Some(earlier), params, pos) != initial {
                break;
            }
            boundary = earlier;
        }
        tree.node(boundary).height + 1
    }

    /// Version a new block on top of `prev` should carry.
    pub fn compute_block_version(
        &mut self,
        tree: &BlockTree,
        prev: Option<NodeId>,
        params: &ConsensusParams,
    ) -> i32 {
        let mut version = VERSION_BITS_TOP_BITS;
        for pos in ALL_DEPLOYMENTS {
            if matches!(
                self.state(tree, prev, params, pos),
                ThresholdState::Started | ThresholdState::LockedIn
            ) {
                version |= params.deployment(pos).mask() as i32;
            }
        }
        version
    }

    /// How many of the last [`UNKNOWN_VERSION_WINDOW`] blocks up to `tip` set
    /// version bits this node does not expect.
    pub fn unknown_version_count(
        &mut self,
        tree: &BlockTree,
        tip: Option<NodeId>,
        params: &ConsensusParams,
    ) -> usize {
        let mut count = 0;
        let mut cursor = tip;
        for _ in 0..UNKNOWN_VERSION_WINDOW {
            let Some(id) = cursor else { break };
            let parent = tree.parent(id);
            let expected = self.compute_block_version(tree, parent, params);
            let version = tree.node(id).header.version;
            if version > LAST_OLD_BLOCK_VERSION && (version & !expected) != 0 {
                count += 1;
            }
            cursor = parent;
        }
        count
    }
}

/// Signalling statistics for the period containing `node`.
pub fn statistics(
    tree: &BlockTree,
    node: Option<NodeId>,
    params: &ConsensusParams,
    pos: DeploymentPos,
) -> BitsStatistics {
    let period = params.miner_confirmation_window;
    let threshold = params.rule_change_activation_threshold;
    let mut stats = BitsStatistics {
        period,
        threshold,
        elapsed: 0,
        count: 0,
        possible: true,
    };
    let Some(id) = node else {
        return stats;
    };
    let deployment = params.deployment(pos);
    let height = tree.node(id).height;
    let end_of_previous = height - ((height + 1) % period as i32);
    stats.elapsed = (height - end_of_previous) as u32;

    let mut cursor = Some(id);
    while let Some(current) = cursor {
        if tree.node(current).height <= end_of_previous {
            break;
        }
        if deployment.signalled_by(tree.node(current).header.version) {
            stats.count += 1;
        }
        cursor = tree.parent(current);
    }
    stats.possible = period - threshold >= stats.elapsed - stats.count;
    stats
}
