//! Context-free and contextual block/transaction rules.

use std::collections::HashSet;

use chaind_consensus::constants::{
    BIP34_MIN_BLOCK_VERSION, BIP65_MIN_BLOCK_VERSION, BIP66_MIN_BLOCK_VERSION,
    COINBASE_MATURITY, LOCKTIME_THRESHOLD, LOCKTIME_VERIFY_SEQUENCE, MAX_BLOCK_SIGOPS,
    MAX_BLOCK_SIZE, MAX_FUTURE_BLOCK_TIME, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_GRANULARITY, SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use chaind_consensus::money::{money_range, Amount, MAX_MONEY};
use chaind_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use chaind_pow::{check_proof_of_work, get_next_work_required};
use chaind_primitives::hash::hash_pair;
use chaind_primitives::{Block, BlockHeader, Transaction};
use chaind_script::flags::{
    ScriptFlags, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY,
    SCRIPT_VERIFY_DERSIG, SCRIPT_VERIFY_NONE, SCRIPT_VERIFY_P2SH,
};
use chaind_script::sigops::legacy_sigop_count;
use chaind_script::ScriptError;

use crate::blockindex::NodeId;
use crate::coins::Coin;
use crate::tree::BlockTree;

/// Reject codes as relayed to peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectCode {
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Checkpoint,
}

impl RejectCode {
    pub fn code(self) -> u8 {
        match self {
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Checkpoint => 0x43,
        }
    }
}

/// A consensus rule violation. `dos` is the penalty for whoever relayed the
/// data; `corruption_possible` means the data may have been damaged in
/// transit, so the block itself must not be marked invalid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub code: RejectCode,
    pub reason: String,
    pub dos: u32,
    pub corruption_possible: bool,
}

impl ValidationError {
    pub fn invalid(dos: u32, reason: impl Into<String>) -> Self {
        Self {
            code: RejectCode::Invalid,
            reason: reason.into(),
            dos,
            corruption_possible: false,
        }
    }

    pub fn nonstandard(reason: impl Into<String>) -> Self {
        Self {
            code: RejectCode::Nonstandard,
            reason: reason.into(),
            dos: 0,
            corruption_possible: false,
        }
    }

    pub fn with_corruption(mut self) -> Self {
        self.corruption_possible = true;
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {:#04x}", self.reason, self.code.code())?;
        if self.dos > 0 {
            write!(f, ", dos {}", self.dos)?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for ValidationError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderRejection {
    HighHash,
    BadDiffBits,
    TimeTooOld,
    TimeTooNew,
    BadVersion(i32),
    CheckpointMismatch,
    ForkBeforeCheckpoint,
    PrevBlockNotFound,
    PrevBlockInvalid,
    DuplicateInvalid,
}

impl HeaderRejection {
    pub fn reason(&self) -> String {
        match self {
            HeaderRejection::HighHash => "high-hash".to_string(),
            HeaderRejection::BadDiffBits => "bad-diffbits".to_string(),
            HeaderRejection::TimeTooOld => "time-too-old".to_string(),
            HeaderRejection::TimeTooNew => "time-too-new".to_string(),
            HeaderRejection::BadVersion(version) => format!("bad-version(0x{version:08x})"),
            HeaderRejection::CheckpointMismatch => "checkpoint mismatch".to_string(),
            HeaderRejection::ForkBeforeCheckpoint => "bad-fork-prior-to-checkpoint".to_string(),
            HeaderRejection::PrevBlockNotFound => "prev-blk-not-found".to_string(),
            HeaderRejection::PrevBlockInvalid => "bad-prevblk".to_string(),
            HeaderRejection::DuplicateInvalid => "duplicate".to_string(),
        }
    }

    pub fn dos(&self) -> u32 {
        match self {
            HeaderRejection::TimeTooOld
            | HeaderRejection::TimeTooNew
            | HeaderRejection::DuplicateInvalid => 0,
            HeaderRejection::PrevBlockNotFound => 10,
            HeaderRejection::HighHash => 50,
            _ => 100,
        }
    }

    pub fn code(&self) -> RejectCode {
        match self {
            HeaderRejection::BadVersion(_) => RejectCode::Obsolete,
            HeaderRejection::CheckpointMismatch | HeaderRejection::ForkBeforeCheckpoint => {
                RejectCode::Checkpoint
            }
            HeaderRejection::DuplicateInvalid => RejectCode::Duplicate,
            _ => RejectCode::Invalid,
        }
    }
}

impl std::fmt::Display for HeaderRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for HeaderRejection {}

impl From<HeaderRejection> for ValidationError {
    fn from(rejection: HeaderRejection) -> Self {
        Self {
            code: rejection.code(),
            reason: rejection.reason(),
            dos: rejection.dos(),
            corruption_possible: false,
        }
    }
}

/// Merkle root over `txids` and whether two equal siblings were hashed
/// together anywhere in the tree, which lets different transaction lists
/// produce the same root.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        for pair in layer.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if layer.len() % 2 == 1 {
            if let Some(last) = layer.last().copied() {
                layer.push(last);
            }
        }
        layer = layer
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    (layer[0], mutated)
}

pub fn block_merkle_root(block: &Block) -> (Hash256, bool) {
    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    merkle_root(&txids)
}

/// Rules that hold for any transaction regardless of the chain.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::invalid(10, "bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::invalid(10, "bad-txns-vout-empty"));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE as usize {
        return Err(ValidationError::invalid(100, "bad-txns-oversize"));
    }

    let mut total: Amount = 0;
    for out in &tx.vout {
        if out.value < 0 {
            return Err(ValidationError::invalid(100, "bad-txns-vout-negative"));
        }
        if out.value > MAX_MONEY {
            return Err(ValidationError::invalid(100, "bad-txns-vout-toolarge"));
        }
        total += out.value;
        if !money_range(total) {
            return Err(ValidationError::invalid(100, "bad-txns-txouttotal-toolarge"));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(&input.prevout) {
            return Err(ValidationError::invalid(100, "bad-txns-inputs-duplicate"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(ValidationError::invalid(100, "bad-cb-length"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationError::invalid(10, "bad-txns-prevout-null"));
    }
    Ok(())
}

pub fn check_block_header(
    header: &BlockHeader,
    params: &ConsensusParams,
    check_pow: bool,
) -> Result<(), HeaderRejection> {
    if check_pow && check_proof_of_work(&header.hash(), header.bits, params).is_err() {
        return Err(HeaderRejection::HighHash);
    }
    Ok(())
}

/// Context-free block checks: header, merkle commitment, size, coinbase
/// placement, transactions and legacy sigops.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    check_pow: bool,
    check_merkle_root: bool,
) -> Result<(), ValidationError> {
    check_block_header(&block.header, params, check_pow)?;

    if check_merkle_root {
        let (root, mutated) = block_merkle_root(block);
        if root != block.header.merkle_root {
            return Err(ValidationError::invalid(100, "bad-txnmrklroot").with_corruption());
        }
        if mutated {
            return Err(ValidationError::invalid(100, "bad-txns-duplicate").with_corruption());
        }
    }

    if block.transactions.is_empty()
        || block.transactions.len() > MAX_BLOCK_SIZE as usize
        || block.consensus_encode().len() > MAX_BLOCK_SIZE as usize
    {
        return Err(ValidationError::invalid(100, "bad-blk-length"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::invalid(100, "bad-cb-missing"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::invalid(100, "bad-cb-multiple"));
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let sigops: u32 = block.transactions.iter().map(legacy_sigop_count).sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ValidationError::invalid(100, "bad-blk-sigops"));
    }
    Ok(())
}

/// Highest checkpoint whose block is already in the tree.
pub fn last_known_checkpoint(tree: &BlockTree, params: &ConsensusParams) -> Option<i32> {
    params
        .checkpoints
        .iter()
        .filter(|checkpoint| tree.lookup(&checkpoint.hash).is_some())
        .map(|checkpoint| checkpoint.height)
        .max()
}

/// Header checks that need the parent: difficulty, timestamps, version
/// floors of enforced soft forks, and checkpoints.
pub fn contextual_check_header(
    header: &BlockHeader,
    prev: NodeId,
    tree: &BlockTree,
    params: &ConsensusParams,
    adjusted_time: i64,
) -> Result<(), HeaderRejection> {
    let prev_node = tree.node(prev);
    let height = prev_node.height + 1;

    let ancestor = |h: i64| {
        i32::try_from(h)
            .ok()
            .and_then(|h| tree.ancestor(prev, h))
            .map(|id| tree.node(id).header_info())
    };
    let required = get_next_work_required(
        Some(&prev_node.header_info()),
        i64::from(header.time),
        &ancestor,
        params,
    )
    .map_err(|_| HeaderRejection::BadDiffBits)?;
    if header.bits != required {
        return Err(HeaderRejection::BadDiffBits);
    }

    if i64::from(header.time) <= tree.median_time_past(prev) {
        return Err(HeaderRejection::TimeTooOld);
    }
    if i64::from(header.time) > adjusted_time + MAX_FUTURE_BLOCK_TIME {
        return Err(HeaderRejection::TimeTooNew);
    }

    let floors = [
        (BIP34_MIN_BLOCK_VERSION, params.bip34_height),
        (BIP66_MIN_BLOCK_VERSION, params.bip66_height),
        (BIP65_MIN_BLOCK_VERSION, params.bip65_height),
    ];
    for (min_version, activation) in floors {
        if header.version < min_version && height >= activation {
            return Err(HeaderRejection::BadVersion(header.version));
        }
    }

    if let Some(checkpoint) = params.checkpoint_at(height) {
        if checkpoint.hash != header.hash() {
            return Err(HeaderRejection::CheckpointMismatch);
        }
    }
    if let Some(checkpoint_height) = last_known_checkpoint(tree, params) {
        if height < checkpoint_height {
            return Err(HeaderRejection::ForkBeforeCheckpoint);
        }
    }
    Ok(())
}

/// Block checks that need the parent: transaction finality and the BIP34
/// coinbase height commitment. `lock_time_cutoff` is the parent's
/// median-time-past once BIP113 applies, otherwise the block's own time.
pub fn contextual_check_block(
    block: &Block,
    height: i32,
    lock_time_cutoff: i64,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    for tx in &block.transactions {
        if !is_final_tx(tx, height, lock_time_cutoff) {
            return Err(ValidationError::invalid(10, "bad-txns-nonfinal"));
        }
    }

    if height >= params.bip34_height {
        let expected = coinbase_height_script(height);
        let matches = block
            .transactions
            .first()
            .and_then(|tx| tx.vin.first())
            .is_some_and(|input| input.script_sig.starts_with(&expected));
        if !matches {
            return Err(ValidationError::invalid(100, "bad-cb-height"));
        }
    }
    Ok(())
}

pub fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = i64::from(tx.lock_time);
    let compare = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        block_time
    };
    if lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Smallest height and time a block must exceed for `tx` to be included,
/// or -1 when unconstrained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceLocks {
    pub min_height: i32,
    pub min_time: i64,
}

/// BIP68 relative lock times of `tx` in the block `node`, given the heights
/// at which each spent coin was created. Inputs without a relative lock get
/// their entry in `prev_heights` zeroed.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    lock_flags: u32,
    prev_heights: &mut [i32],
    tree: &BlockTree,
    node: NodeId,
) -> SequenceLocks {
    let mut locks = SequenceLocks {
        min_height: -1,
        min_time: -1,
    };
    let enforce = tx.version >= 2 && lock_flags & LOCKTIME_VERIFY_SEQUENCE != 0;
    if !enforce {
        return locks;
    }

    for (input, coin_height) in tx.vin.iter().zip(prev_heights.iter_mut()) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            *coin_height = 0;
            continue;
        }
        let value = i64::from(input.sequence & SEQUENCE_LOCKTIME_MASK);
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let coin_time = tree
                .ancestor(node, (*coin_height - 1).max(0))
                .map(|id| tree.median_time_past(id))
                .unwrap_or(0);
            locks.min_time = locks
                .min_time
                .max(coin_time + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1);
        } else {
            locks.min_height = locks.min_height.max(*coin_height + value as i32 - 1);
        }
    }
    locks
}

pub fn evaluate_sequence_locks(tree: &BlockTree, node: NodeId, locks: SequenceLocks) -> bool {
    let block_time = tree
        .parent(node)
        .map(|parent| tree.median_time_past(parent))
        .unwrap_or(0);
    locks.min_height < tree.node(node).height && locks.min_time < block_time
}

/// Script flags in force for a block at `height` stamped `time`.
pub fn block_script_flags(
    height: i32,
    time: u32,
    csv_active: bool,
    params: &ConsensusParams,
) -> ScriptFlags {
    let mut flags = SCRIPT_VERIFY_NONE;
    if time >= params.bip16_switch_time {
        flags |= SCRIPT_VERIFY_P2SH;
    }
    if height >= params.bip66_height {
        flags |= SCRIPT_VERIFY_DERSIG;
    }
    if height >= params.bip65_height {
        flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if csv_active {
        flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
    }
    flags
}

/// Whether BIP30 must be checked for the block at `node`.
/// The two historical duplicate coinbases are exempt, and once the BIP34
/// activation block is an ancestor of the parent, duplicate txids are
/// impossible.
pub fn enforce_bip30(
    tree: &BlockTree,
    node: NodeId,
    params: &ConsensusParams,
) -> bool {
    let entry = tree.node(node);
    if params.is_bip30_exception(entry.height, &entry.hash) {
        return false;
    }
    let bip34_active = tree
        .parent(node)
        .and_then(|parent| tree.ancestor(parent, params.bip34_height))
        .is_some_and(|id| tree.node(id).hash == params.bip34_hash);
    !bip34_active
}

/// The script prefix BIP34 requires in a coinbase at `height`.
pub fn coinbase_height_script(height: i32) -> Vec<u8> {
    script_push_int(i64::from(height))
}

fn script_push_int(value: i64) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1NEGATE: u8 = 0x4f;
    const OP_1: u8 = 0x51;
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![OP_1 + (value as u8 - 1)];
    }
    let data = script_num_to_vec(value);
    let mut script = Vec::with_capacity(data.len() + 1);
    script.push(data.len() as u8);
    script.extend_from_slice(&data);
    script
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let sign_bit = 0x80u8;
    if let Some(last) = result.last_mut() {
        if (*last & sign_bit) != 0 {
            result.push(if value < 0 { sign_bit } else { 0 });
        } else if value < 0 {
            *last |= sign_bit;
        }
    }
    result
}

/// Value checks for a non-coinbase `tx` spending `spent` in a block at
/// `spend_height`. Returns the fee.
pub fn check_tx_inputs(
    tx: &Transaction,
    spent: &[Coin],
    spend_height: i32,
) -> Result<Amount, ValidationError> {
    let mut value_in: Amount = 0;
    for coin in spent {
        if coin.coinbase && spend_height - (coin.height as i32) < COINBASE_MATURITY {
            return Err(ValidationError::invalid(
                0,
                "bad-txns-premature-spend-of-coinbase",
            ));
        }
        if !money_range(coin.out.value) {
            return Err(ValidationError::invalid(100, "bad-txns-inputvalues-outofrange"));
        }
        value_in += coin.out.value;
        if !money_range(value_in) {
            return Err(ValidationError::invalid(100, "bad-txns-inputvalues-outofrange"));
        }
    }

    let value_out: Amount = tx.vout.iter().map(|out| out.value).sum();
    if value_in < value_out {
        return Err(ValidationError::invalid(100, "bad-txns-in-belowout"));
    }
    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(ValidationError::invalid(100, "bad-txns-fee-outofrange"));
    }
    Ok(fee)
}

/// Maps a failed script check onto the block-level rejection.
pub fn script_rejection(err: &ScriptError) -> ValidationError {
    match err {
        ScriptError::Mandatory(_) => ValidationError::invalid(100, err.to_string()),
        ScriptError::NonMandatory(_) => ValidationError::nonstandard(err.to_string()),
        ScriptError::Internal(_) => ValidationError::invalid(0, err.to_string()).with_corruption(),
    }
}

pub fn describe_block(hash: &Hash256, height: i32) -> String {
    format!("{} (height {height})", hash256_to_hex(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaind_consensus::{consensus_params, Network};
    use chaind_primitives::{OutPoint, TxIn, TxOut};

    fn hash(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    fn tx(inputs: Vec<OutPoint>, values: &[i64]) -> Transaction {
        Transaction {
            version: 2,
            vin: inputs
                .into_iter()
                .map(|prevout| TxIn {
                    prevout,
                    script_sig: vec![0x51, 0x51],
                    sequence: SEQUENCE_FINAL,
                })
                .collect(),
            vout: values
                .iter()
                .map(|value| TxOut {
                    value: *value,
                    script_pubkey: vec![0x51],
                })
                .collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn merkle_mutation_on_any_equal_pair() {
        let (_, mutated) = merkle_root(&[hash(1), hash(1), hash(2), hash(3)]);
        assert!(mutated);
        let (_, mutated) = merkle_root(&[hash(1), hash(2), hash(3), hash(3)]);
        assert!(mutated);
    }

    #[test]
    fn merkle_odd_duplication_is_not_mutation() {
        let (root, mutated) = merkle_root(&[hash(1), hash(2), hash(3)]);
        assert!(!mutated);
        let (same_root, mutated) = merkle_root(&[hash(1), hash(2), hash(3), hash(3)]);
        assert!(mutated);
        assert_eq!(root, same_root);
        assert_eq!(merkle_root(&[hash(9)]).0, hash(9));
    }

    #[test]
    fn transaction_rejections_name_the_rule() {
        let reason = |tx: &Transaction| check_transaction(tx).map_err(|err| err.reason);
        let spend = OutPoint::new(hash(4), 0);

        assert_eq!(reason(&tx(vec![], &[1])), Err("bad-txns-vin-empty".to_string()));
        assert_eq!(reason(&tx(vec![spend.clone()], &[])), Err("bad-txns-vout-empty".to_string()));
        assert_eq!(
            reason(&tx(vec![spend.clone()], &[-1])),
            Err("bad-txns-vout-negative".to_string())
        );
        assert_eq!(
            reason(&tx(vec![spend.clone()], &[MAX_MONEY, 1])),
            Err("bad-txns-txouttotal-toolarge".to_string())
        );
        assert_eq!(
            reason(&tx(vec![spend.clone(), spend.clone()], &[1])),
            Err("bad-txns-inputs-duplicate".to_string())
        );
        assert_eq!(
            reason(&tx(vec![spend.clone(), OutPoint::null()], &[1])),
            Err("bad-txns-prevout-null".to_string())
        );
        let mut coinbase = tx(vec![OutPoint::null()], &[1]);
        coinbase.vin[0].script_sig = vec![0x51];
        assert_eq!(reason(&coinbase), Err("bad-cb-length".to_string()));
        assert_eq!(reason(&tx(vec![spend], &[MAX_MONEY])), Ok(()));
    }

    #[test]
    fn coinbase_height_scripts() {
        assert_eq!(coinbase_height_script(0), vec![0x00]);
        assert_eq!(coinbase_height_script(16), vec![0x60]);
        assert_eq!(coinbase_height_script(17), vec![0x01, 0x11]);
        assert_eq!(coinbase_height_script(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(coinbase_height_script(227_931), vec![0x03, 0x5b, 0x7a, 0x03]);
    }

    #[test]
    fn finality_uses_height_or_time() {
        let mut locked = tx(vec![OutPoint::new(hash(1), 0)], &[1]);
        locked.lock_time = 100;
        locked.vin[0].sequence = 0;
        assert!(!is_final_tx(&locked, 100, 0));
        assert!(is_final_tx(&locked, 101, 0));

        locked.lock_time = LOCKTIME_THRESHOLD + 10;
        assert!(!is_final_tx(&locked, 1_000_000, i64::from(LOCKTIME_THRESHOLD + 10)));
        assert!(is_final_tx(&locked, 0, i64::from(LOCKTIME_THRESHOLD + 11)));

        locked.vin[0].sequence = SEQUENCE_FINAL;
        assert!(is_final_tx(&locked, 0, 0));
    }

    #[test]
    fn bip34_commitment_is_checked_from_activation() {
        let mut params = consensus_params(Network::Regtest);
        params.bip34_height = 5;
        let mut coinbase = tx(vec![OutPoint::null()], &[1]);
        coinbase.vin[0].script_sig = vec![0x55, 0x00];
        let block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: hash(0),
                merkle_root: hash(0),
                time: 0,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions: vec![coinbase],
        };
        assert!(contextual_check_block(&block, 4, 0, &params).is_ok());
        assert!(contextual_check_block(&block, 5, 0, &params).is_ok());
        assert_eq!(
            contextual_check_block(&block, 6, 0, &params).map_err(|err| err.reason),
            Err("bad-cb-height".to_string())
        );
    }

    #[test]
    fn bip30_is_enforced_on_the_bip34_activation_block() {
        let mut tree = BlockTree::new();
        let mut prev = [0u8; 32];
        let mut ids = Vec::new();
        for nonce in 0..4 {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: hash(0),
                time: nonce,
                bits: 0x207f_ffff,
                nonce,
            };
            prev = header.hash();
            ids.push(tree.insert(&header).expect("insert"));
        }
        let mut params = consensus_params(Network::Regtest);
        params.bip34_height = 2;
        params.bip34_hash = tree.node(ids[2]).hash;

        assert!(enforce_bip30(&tree, ids[1], &params));
        // Activation counts from the parent, so the activation block itself still checks.
        assert!(enforce_bip30(&tree, ids[2], &params));
        assert!(!enforce_bip30(&tree, ids[3], &params));
    }

    #[test]
    fn header_rejections_classify() {
        let err = ValidationError::from(HeaderRejection::TimeTooOld);
        assert_eq!(err.reason, "time-too-old");
        assert_eq!(err.dos, 0);
        assert_eq!(HeaderRejection::BadVersion(1).code(), RejectCode::Obsolete);
        assert_eq!(HeaderRejection::BadVersion(1).reason(), "bad-version(0x00000001)");
        assert_eq!(HeaderRejection::HighHash.dos(), 50);
    }

    #[test]
    fn script_flags_follow_activation() {
        let params = consensus_params(Network::Regtest);
        let early = block_script_flags(1, params.bip16_switch_time, false, &params);
        assert_eq!(early, SCRIPT_VERIFY_P2SH);
        let late = block_script_flags(params.bip65_height, params.bip16_switch_time, true, &params);
        assert_eq!(
            late,
            SCRIPT_VERIFY_P2SH
                | SCRIPT_VERIFY_DERSIG
                | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
                | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
        );
    }
}
