mod common;

use std::sync::Arc;

use chaind_consensus::hash256_to_hex;
use chaind_consensus::money::COIN;
use chaind_log::Level;
use chaind_storage::memory::MemoryStore;

use common::*;

#[test]
fn tip_updates_and_invalid_chains_are_reported() {
    chaind_log::set_stderr_enabled(false);
    chaind_log::enable_capture(4096);
    chaind_log::clear_captured_logs();

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let state = open(dir.path(), &store);

    let genesis = genesis_tip(&state);
    let (tip, _) = extend(&state, genesis, 1, 1);
    let greedy = next_block(&tip, 1, COIN, Vec::new());
    state.process_block(&greedy).expect("accepted, then rejected on connect");

    let logs = chaind_log::capture_snapshot(4096);
    let tip_hex = hash256_to_hex(&tip.hash);
    let greedy_hex = hash256_to_hex(&greedy.hash());
    assert!(logs.iter().any(|entry| entry.level == Level::Info
        && entry.msg.contains("UpdateTip")
        && entry.msg.contains(&tip_hex)));
    assert!(logs.iter().any(|entry| entry.level == Level::Warn
        && entry.msg.contains("invalid chain found")
        && entry.msg.contains(&greedy_hex)));
    assert!(logs
        .iter()
        .any(|entry| entry.level == Level::Warn && entry.msg.contains("bad-cb-amount")));
    assert!(!logs.iter().any(|entry| entry.level == Level::Error));

    chaind_log::disable_capture();
}
