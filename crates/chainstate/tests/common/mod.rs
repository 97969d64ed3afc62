#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chaind_chainstate::state::ChainState;
use chaind_chainstate::validation::{block_merkle_root, coinbase_height_script};
use chaind_chainstate::ChainStateConfig;
use chaind_consensus::money::Amount;
use chaind_consensus::{block_subsidy, consensus_params, ChainParams, Hash256, Network};
use chaind_pow::check_proof_of_work;
use chaind_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use chaind_script::{AcceptAllVerifier, ScriptVerifier};
use chaind_storage::memory::MemoryStore;

pub const REGTEST_BITS: u32 = 0x207f_ffff;
pub const GENESIS_TIME: u32 = 1_296_688_602;

pub fn config(dir: &Path) -> ChainStateConfig {
    ChainStateConfig::new(Network::Regtest, dir)
}

pub fn open(dir: &Path, store: &Arc<MemoryStore>) -> ChainState<MemoryStore> {
    open_with(config(dir), store)
}

pub fn open_with(config: ChainStateConfig, store: &Arc<MemoryStore>) -> ChainState<MemoryStore> {
    open_with_verifier(config, store, Arc::new(AcceptAllVerifier))
}

pub fn open_with_params(
    params: ChainParams,
    dir: &Path,
    store: &Arc<MemoryStore>,
) -> ChainState<MemoryStore> {
    let verifier = Arc::new(AcceptAllVerifier);
    ChainState::open_with_params(params, config(dir), Arc::clone(store), verifier)
        .expect("open chain state")
}

pub fn open_with_verifier(
    config: ChainStateConfig,
    store: &Arc<MemoryStore>,
    verifier: Arc<dyn ScriptVerifier>,
) -> ChainState<MemoryStore> {
    ChainState::open(config, Arc::clone(store), verifier).expect("open chain state")
}

/// Where the next block goes.
#[derive(Clone, Copy, Debug)]
pub struct Tip {
    pub hash: Hash256,
    pub height: i32,
    pub time: u32,
}

impl Tip {
    pub fn of(block: &Block, height: i32) -> Self {
        Self {
            hash: block.hash(),
            height,
            time: block.header.time,
        }
    }
}

pub fn genesis_tip(state: &ChainState<MemoryStore>) -> Tip {
    let tip = state.tip().expect("tip").expect("genesis connected");
    assert_eq!(tip.height, 0);
    Tip {
        hash: tip.hash,
        height: 0,
        time: tip.time,
    }
}

pub fn coinbase(height: i32, tag: u8, value: Amount) -> Transaction {
    let mut script_sig = coinbase_height_script(height);
    script_sig.extend_from_slice(&[0x01, tag]);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, value: Amount) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Mines a block on `tip` from an explicit transaction list.
pub fn mine(prev: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    mine_with_version(prev, time, 4, transactions)
}

pub fn mine_with_version(
    prev: Hash256,
    time: u32,
    version: i32,
    transactions: Vec<Transaction>,
) -> Block {
    let params = consensus_params(Network::Regtest);
    let mut block = Block {
        header: BlockHeader {
            version,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    while check_proof_of_work(&block.header.hash(), block.header.bits, &params).is_err() {
        block.header.nonce += 1;
    }
    block
}

/// Block on `tip` paying the full subsidy plus `fees` to an anyone-can-spend
/// coinbase. `tag` keeps sibling blocks distinct.
pub fn next_block(tip: &Tip, tag: u8, fees: Amount, extra: Vec<Transaction>) -> Block {
    next_block_with_version(tip, 4, tag, fees, extra)
}

pub fn next_block_with_version(
    tip: &Tip,
    version: i32,
    tag: u8,
    fees: Amount,
    extra: Vec<Transaction>,
) -> Block {
    let params = consensus_params(Network::Regtest);
    let height = tip.height + 1;
    let mut transactions = vec![coinbase(height, tag, block_subsidy(height, &params) + fees)];
    transactions.extend(extra);
    mine_with_version(tip.hash, tip.time + 600 + u32::from(tag), version, transactions)
}

/// Extends `tip` by `count` empty blocks, processing each one.
pub fn extend(
    state: &ChainState<MemoryStore>,
    tip: Tip,
    count: usize,
    tag: u8,
) -> (Tip, Vec<Block>) {
    let mut tip = tip;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let block = next_block(&tip, tag, 0, Vec::new());
        state.process_block(&block).expect("process block");
        tip = Tip::of(&block, tip.height + 1);
        blocks.push(block);
    }
    (tip, blocks)
}

/// Builds `count` blocks on `tip` without submitting them.
pub fn build_branch(tip: Tip, count: usize, tag: u8) -> Vec<Block> {
    let mut tip = tip;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let block = next_block(&tip, tag, 0, Vec::new());
        tip = Tip::of(&block, tip.height + 1);
        blocks.push(block);
    }
    blocks
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

pub fn tip_hash(state: &ChainState<MemoryStore>) -> Hash256 {
    state.tip().expect("tip").expect("active tip").hash
}
