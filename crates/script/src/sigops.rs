//! Signature operation counting.

use chaind_primitives::transaction::{Transaction, TxOut};

use crate::opcodes::{
    decode_op_n, is_push_only, Instructions, OP_1, OP_16, OP_CHECKMULTISIG,
    OP_CHECKMULTISIGVERIFY, OP_CHECKSIG, OP_CHECKSIGVERIFY,
};
use crate::standard::is_p2sh;

/// Multisig without a preceding small-int key count is charged this much.
pub const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// Counts sigops in a script. With `accurate`, `OP_CHECKMULTISIG` preceded by
/// `OP_1..OP_16` counts as that many instead of the maximum.
pub fn script_sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = 0xffu8;
    for instruction in Instructions::new(script) {
        match instruction.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    decode_op_n(last_opcode).unwrap_or(MAX_PUBKEYS_PER_MULTISIG)
                } else {
                    MAX_PUBKEYS_PER_MULTISIG
                };
            }
            _ => {}
        }
        last_opcode = instruction.opcode;
    }
    count
}

/// Sigops of a P2SH redeem script, which is the last push of `script_sig`.
pub fn p2sh_sigop_count(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_p2sh(script_pubkey) || !is_push_only(script_sig) {
        return 0;
    }
    let redeem_script = Instructions::new(script_sig)
        .last()
        .map(|instruction| instruction.data)
        .unwrap_or(&[]);
    script_sigop_count(redeem_script, true)
}

/// Legacy count: every input script and output script, inaccurately.
pub fn legacy_sigop_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| script_sigop_count(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| script_sigop_count(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// P2SH count for a non-coinbase transaction given its spent outputs, in
/// input order.
pub fn p2sh_sigops_for_tx(tx: &Transaction, spent: &[TxOut]) -> u32 {
    if tx.is_coinbase() {
        return 0;
    }
    tx.vin
        .iter()
        .zip(spent)
        .map(|(input, prev)| p2sh_sigop_count(&prev.script_pubkey, &input.script_sig))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{OP_EQUAL, OP_HASH160};

    #[test]
    fn multisig_accuracy() {
        let script = [OP_1 + 1, OP_1 + 2, OP_CHECKMULTISIG];
        assert_eq!(script_sigop_count(&script, true), 3);
        assert_eq!(script_sigop_count(&script, false), 20);
        assert_eq!(script_sigop_count(&[OP_CHECKSIG, OP_CHECKSIGVERIFY], false), 2);
    }

    #[test]
    fn p2sh_counts_redeem_script() {
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&[0u8; 20]);
        script_pubkey.push(OP_EQUAL);

        let redeem = [OP_1 + 1, OP_CHECKMULTISIG];
        let mut script_sig = vec![0x00, redeem.len() as u8];
        script_sig.extend_from_slice(&redeem);
        assert_eq!(p2sh_sigop_count(&script_pubkey, &script_sig), 2);
        assert_eq!(p2sh_sigop_count(&[OP_CHECKSIG], &script_sig), 0);
    }
}
