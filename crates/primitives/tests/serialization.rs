use chaind_consensus::{chain_params, hash256_to_hex, Hash256, Network};
use chaind_primitives::block::{genesis_block, Block, BlockHeader, HEADER_SIZE};
use chaind_primitives::outpoint::OutPoint;
use chaind_primitives::transaction::{Transaction, TxIn, TxOut};

fn seq_hash(start: u8) -> Hash256 {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

fn push_hash_le(buffer: &mut Vec<u8>, start: u8) {
    for byte in 0u8..=0x1f {
        buffer.push(start.wrapping_add(byte));
    }
}

#[test]
fn serialize_block_header() {
    let header = BlockHeader {
        version: 4,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x01020304,
        bits: 0x0a0b0c0d,
        nonce: 0xdeadbeef,
    };

    let encoded = header.consensus_encode();
    let mut expected = Vec::new();
    expected.extend_from_slice(&4i32.to_le_bytes());
    push_hash_le(&mut expected, 0x00);
    push_hash_le(&mut expected, 0x20);
    expected.extend_from_slice(&0x01020304u32.to_le_bytes());
    expected.extend_from_slice(&0x0a0b0c0du32.to_le_bytes());
    expected.extend_from_slice(&0xdeadbeefu32.to_le_bytes());

    assert_eq!(encoded.len(), HEADER_SIZE);
    assert_eq!(encoded, expected);
    let decoded = BlockHeader::consensus_decode(&encoded).expect("decode header");
    assert_eq!(decoded, header);
}

#[test]
fn serialize_transaction() {
    let tx = Transaction {
        version: 2,
        vin: vec![TxIn {
            prevout: OutPoint::new(seq_hash(0x40), 3),
            script_sig: vec![0x51],
            sequence: 0xffff_fffe,
        }],
        vout: vec![
            TxOut {
                value: 1_000,
                script_pubkey: vec![0x76, 0xa9],
            },
            TxOut {
                value: 0,
                script_pubkey: vec![0x6a],
            },
        ],
        lock_time: 77,
    };

    let encoded = tx.consensus_encode();
    let mut expected = Vec::new();
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.push(1);
    push_hash_le(&mut expected, 0x40);
    expected.extend_from_slice(&3u32.to_le_bytes());
    expected.extend_from_slice(&[1, 0x51]);
    expected.extend_from_slice(&0xffff_fffeu32.to_le_bytes());
    expected.push(2);
    expected.extend_from_slice(&1_000i64.to_le_bytes());
    expected.extend_from_slice(&[2, 0x76, 0xa9]);
    expected.extend_from_slice(&0i64.to_le_bytes());
    expected.extend_from_slice(&[1, 0x6a]);
    expected.extend_from_slice(&77u32.to_le_bytes());

    assert_eq!(encoded, expected);
    assert_eq!(tx.serialized_size(), expected.len());
    assert!(!tx.is_coinbase());
    assert_eq!(Transaction::consensus_decode(&encoded).expect("decode"), tx);
}

#[test]
fn trailing_bytes_are_rejected() {
    let params = chain_params(Network::Regtest);
    let mut bytes = genesis_block(&params.genesis).consensus_encode();
    bytes.push(0);
    assert!(Block::consensus_decode(&bytes).is_err());
}

#[test]
fn genesis_blocks_hash_to_known_values() {
    for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
        let params = chain_params(network);
        let block = genesis_block(&params.genesis);
        assert_eq!(block.hash(), params.consensus.hash_genesis_block);
        assert!(block.transactions[0].is_coinbase());
    }

    let mainnet = genesis_block(&chain_params(Network::Mainnet).genesis);
    assert_eq!(
        hash256_to_hex(&mainnet.header.merkle_root),
        "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
    );
    let decoded = Block::consensus_decode(&mainnet.consensus_encode()).expect("decode");
    assert_eq!(decoded, mainnet);
}
