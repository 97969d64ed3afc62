mod common;

use std::sync::Arc;

use chaind_chainstate::blockindex::BLOCK_FAILED_VALID;
use chaind_chainstate::state::ChainState;
use chaind_chainstate::{
    ChainStateError, CoinsCache, CoinsDb, FlushMode, ThresholdState, ValidationError,
};
use chaind_consensus::constants::MAX_BLOCK_SIGOPS;
use chaind_consensus::deployments::VERSION_BITS_TOP_BITS;
use chaind_consensus::money::COIN;
use chaind_consensus::{chain_params, DeploymentPos, Network};
use chaind_primitives::{Block, OutPoint, Transaction};
use chaind_storage::memory::MemoryStore;

use common::*;

const OP_CHECKSIG: u8 = 0xac;

/// Stores `block` and connects it against a fresh view of the flushed coin
/// database, returning the rejection.
fn connect_rejection(
    state: &ChainState<MemoryStore>,
    store: &Arc<MemoryStore>,
    block: &Block,
) -> ValidationError {
    state.accept_block(block).expect("accept");
    state.flush(FlushMode::Always).expect("flush");
    let mut view = CoinsCache::new(CoinsDb::new(Arc::clone(store)));
    match state.connect_block(block, &mut view, false) {
        Err(ChainStateError::Validation(err)) => err,
        other => panic!("expected a validation failure, got {other:?}"),
    }
}

fn assert_failed(state: &ChainState<MemoryStore>, block: &Block) {
    let node = state.block_index(&block.hash()).expect("lookup").expect("indexed");
    assert_ne!(node.status & BLOCK_FAILED_VALID, 0);
}

fn coinbase_paying_to(tip: &Tip, script_pubkey: Vec<u8>) -> Block {
    let mut cb = coinbase(tip.height + 1, 1, 50 * COIN);
    cb.vout[0].script_pubkey = script_pubkey;
    mine(tip.hash, tip.time + 600, vec![cb])
}

#[test]
fn duplicate_of_unspent_coinbase_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let state = open(dir.path(), &store);

    let genesis = genesis_tip(&state);
    let (tip, blocks) = extend(&state, genesis, 1, 1);
    let duplicate = mine(tip.hash, tip.time + 600, vec![blocks[0].transactions[0].clone()]);

    let err = connect_rejection(&state, &store, &duplicate);
    assert_eq!(err.reason, "bad-txns-BIP30");
    assert_eq!(err.dos, 100);

    state.process_block(&duplicate).expect("accepted, then rejected on connect");
    assert_eq!(tip_hash(&state), tip.hash);
    assert_failed(&state, &duplicate);
    let original = state
        .coin(&coinbase_outpoint(&blocks[0]))
        .expect("coin lookup")
        .expect("original coinbase kept");
    assert_eq!(original.height, 1);
}

#[test]
fn duplicate_of_spent_coinbase_connects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let state = open(dir.path(), &store);

    let genesis = genesis_tip(&state);
    let (tip, blocks) = extend(&state, genesis, 100, 1);
    let first = blocks[0].transactions[0].clone();
    let spending = next_block(&tip, 1, 0, vec![spend(coinbase_outpoint(&blocks[0]), 50 * COIN)]);
    state.process_block(&spending).expect("spend first coinbase");
    let tip = Tip::of(&spending, tip.height + 1);

    let duplicate = mine(tip.hash, tip.time + 600, vec![first]);
    state.process_block(&duplicate).expect("duplicate of a spent coinbase");
    assert_eq!(tip_hash(&state), duplicate.hash());
    let coin = state
        .coin(&coinbase_outpoint(&duplicate))
        .expect("coin lookup")
        .expect("recreated coinbase");
    assert_eq!(coin.height, 102);
}

#[test]
fn spending_more_than_the_inputs_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let state = open(dir.path(), &store);

    let genesis = genesis_tip(&state);
    let (tip, blocks) = extend(&state, genesis, 100, 1);
    let inflating = spend(coinbase_outpoint(&blocks[0]), 50 * COIN + 1);
    let block = next_block(&tip, 2, 0, vec![inflating]);

    let err = connect_rejection(&state, &store, &block);
    assert_eq!(err.reason, "bad-txns-in-belowout");
    assert_eq!(err.dos, 100);

    state.process_block(&block).expect("accepted, then rejected on connect");
    assert_eq!(tip_hash(&state), tip.hash);
    assert_failed(&state, &block);
}

#[test]
fn legacy_sigops_are_capped_per_block() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let state = open(dir.path(), &store);
    let genesis = genesis_tip(&state);

    let at_limit = coinbase_paying_to(&genesis, vec![OP_CHECKSIG; MAX_BLOCK_SIGOPS as usize]);
    state.process_block(&at_limit).expect("block at the sigop limit");
    assert_eq!(tip_hash(&state), at_limit.hash());

    let tip = Tip::of(&at_limit, 1);
    let over = coinbase_paying_to(&tip, vec![OP_CHECKSIG; MAX_BLOCK_SIGOPS as usize + 1]);
    match state.process_block(&over) {
        Err(ChainStateError::Validation(err)) => {
            assert_eq!(err.reason, "bad-blk-sigops");
            assert_eq!(err.dos, 100);
        }
        other => panic!("expected sigop rejection, got {other:?}"),
    }
    assert_eq!(tip_hash(&state), tip.hash);
    assert_failed(&state, &over);
}

fn extend_signalling(
    state: &ChainState<MemoryStore>,
    tip: Tip,
    count: usize,
) -> (Tip, Vec<Block>) {
    let mut tip = tip;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let block = next_block_with_version(&tip, VERSION_BITS_TOP_BITS | 1, 1, 0, Vec::new());
        state.process_block(&block).expect("process block");
        tip = Tip::of(&block, tip.height + 1);
        blocks.push(block);
    }
    (tip, blocks)
}

fn relative_height_lock(prevout: OutPoint, blocks: u32) -> Transaction {
    let mut tx = spend(prevout, 50 * COIN);
    tx.version = 2;
    tx.vin[0].sequence = blocks;
    tx
}

#[test]
fn relative_lock_times_bind_once_csv_activates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut params = chain_params(Network::Regtest);
    params.consensus.miner_confirmation_window = 10;
    params.consensus.rule_change_activation_threshold = 8;
    let state = open_with_params(params, dir.path(), &store);

    let csv = |state: &ChainState<MemoryStore>| {
        state.deployment_state(DeploymentPos::Csv).expect("deployment state")
    };

    let genesis = genesis_tip(&state);
    assert_eq!(csv(&state), ThresholdState::Defined);
    let (tip, blocks) = extend_signalling(&state, genesis, 9);
    assert_eq!(csv(&state), ThresholdState::Started);
    let (tip, _) = extend_signalling(&state, tip, 10);
    assert_eq!(csv(&state), ThresholdState::LockedIn);
    let (tip, _) = extend_signalling(&state, tip, 10);
    assert_eq!(csv(&state), ThresholdState::Active);

    // Mature the height 1 coinbase and move it into a fresh coin at height 101.
    let (tip, _) = extend(&state, tip, 71, 1);
    let funding = spend(coinbase_outpoint(&blocks[0]), 50 * COIN);
    let funded = OutPoint::new(funding.txid(), 0);
    let funding_block = next_block(&tip, 1, 0, vec![funding]);
    state.process_block(&funding_block).expect("funding block");
    let tip = Tip::of(&funding_block, 101);

    let early = next_block(&tip, 2, 0, vec![relative_height_lock(funded.clone(), 10)]);
    let err = connect_rejection(&state, &store, &early);
    assert_eq!(err.reason, "bad-txns-nonfinal");
    assert_eq!(err.dos, 100);
    state.process_block(&early).expect("accepted, then rejected on connect");
    assert_failed(&state, &early);

    // A lock of 10 blocks on a coin from 101 first clears at height 111.
    let (tip, _) = extend(&state, tip, 8, 1);
    let boundary = next_block(&tip, 2, 0, vec![relative_height_lock(funded.clone(), 10)]);
    state.process_block(&boundary).expect("accepted, then rejected on connect");
    assert_eq!(tip_hash(&state), tip.hash);
    assert_failed(&state, &boundary);

    let (tip, _) = extend(&state, tip, 1, 1);
    let unlocked = next_block(&tip, 2, 0, vec![relative_height_lock(funded.clone(), 10)]);
    state.process_block(&unlocked).expect("lock satisfied");
    assert_eq!(tip_hash(&state), unlocked.hash());
    assert!(state.coin(&funded).expect("coin lookup").is_none());
}
