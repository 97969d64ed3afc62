use chaind_primitives::{OutPoint, Transaction, TxIn, TxOut};
use chaind_script::opcodes::{OP_CHECKMULTISIG, OP_CHECKSIG, OP_EQUAL, OP_HASH160};
use chaind_script::sigops::{legacy_sigop_count, p2sh_sigops_for_tx};
use chaind_script::standard::{classify_script_pubkey, is_unspendable, ScriptType};

fn p2sh_script() -> Vec<u8> {
    let mut script = vec![OP_HASH160, 0x14];
    script.extend_from_slice(&[0x22; 20]);
    script.push(OP_EQUAL);
    script
}

fn spend(script_sig: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([9u8; 32], 0),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 1_000,
            script_pubkey: vec![OP_CHECKSIG],
        }],
        lock_time: 0,
    }
}

#[test]
fn classify_p2sh() {
    assert_eq!(classify_script_pubkey(&p2sh_script()), ScriptType::P2Sh);
    assert!(!is_unspendable(&p2sh_script()));
}

#[test]
fn legacy_count_covers_inputs_and_outputs() {
    let tx = spend(vec![OP_CHECKSIG, OP_CHECKMULTISIG]);
    assert_eq!(legacy_sigop_count(&tx), 1 + 20 + 1);
}

#[test]
fn p2sh_count_uses_spent_outputs() {
    let redeem = [0x53, OP_CHECKMULTISIG];
    let mut script_sig = vec![0x00, redeem.len() as u8];
    script_sig.extend_from_slice(&redeem);
    let tx = spend(script_sig);

    let spent = [TxOut {
        value: 5_000,
        script_pubkey: p2sh_script(),
    }];
    assert_eq!(p2sh_sigops_for_tx(&tx, &spent), 3);

    let plain = [TxOut {
        value: 5_000,
        script_pubkey: vec![OP_CHECKSIG],
    }];
    assert_eq!(p2sh_sigops_for_tx(&tx, &plain), 0);
}

#[test]
fn coinbase_has_no_p2sh_sigops() {
    let mut tx = spend(vec![0x01, 0x01]);
    tx.vin[0].prevout = OutPoint::null();
    assert!(tx.is_coinbase());
    assert_eq!(p2sh_sigops_for_tx(&tx, &[]), 0);
}
