//! Per-transaction hashes shared by every input's signature check.

use chaind_consensus::Hash256;
use chaind_primitives::encoding::{Encodable, Encoder};
use chaind_primitives::hash::sha256d;
use chaind_primitives::transaction::Transaction;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrecomputedTxData {
    pub hash_prevouts: Hash256,
    pub hash_sequence: Hash256,
    pub hash_outputs: Hash256,
}

impl PrecomputedTxData {
    pub fn new(tx: &Transaction) -> Self {
        Self {
            hash_prevouts: hash_prevouts(tx),
            hash_sequence: hash_sequence(tx),
            hash_outputs: hash_outputs(tx),
        }
    }
}

fn hash_prevouts(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::with_capacity(tx.vin.len() * 36);
    for input in &tx.vin {
        input.prevout.consensus_encode(&mut encoder);
    }
    sha256d(&encoder.into_inner())
}

fn hash_sequence(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::with_capacity(tx.vin.len() * 4);
    for input in &tx.vin {
        encoder.write_u32_le(input.sequence);
    }
    sha256d(&encoder.into_inner())
}

fn hash_outputs(tx: &Transaction) -> Hash256 {
    let mut encoder = Encoder::new();
    for output in &tx.vout {
        output.consensus_encode(&mut encoder);
    }
    sha256d(&encoder.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaind_primitives::outpoint::OutPoint;
    use chaind_primitives::transaction::{TxIn, TxOut};

    #[test]
    fn hashes_change_with_their_inputs() {
        let mut tx = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([1u8; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 5,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let before = PrecomputedTxData::new(&tx);
        tx.vin[0].sequence = 0;
        let after = PrecomputedTxData::new(&tx);
        assert_eq!(before.hash_prevouts, after.hash_prevouts);
        assert_eq!(before.hash_outputs, after.hash_outputs);
        assert_ne!(before.hash_sequence, after.hash_sequence);
    }
}
