//! Block header and block types.

use chaind_consensus::{GenesisParams, Hash256};

use crate::encoding::{read_vec, write_vec, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut};

pub const HEADER_SIZE: usize = 80;

const GENESIS_TIMESTAMP: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
const GENESIS_OUTPUT_KEY: [u8; 65] = [
    0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71, 0x30,
    0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0, 0xea, 0x1f,
    0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04, 0xe5,
    0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c, 0x70,
    0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn is_null(&self) -> bool {
        self.bits == 0
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        Ok(crate::encoding::decode(bytes)?)
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        Encodable::consensus_encode(&self.header, encoder);
        write_vec(encoder, &self.transactions);
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = <BlockHeader as Decodable>::consensus_decode(decoder)?;
        let transactions = read_vec(decoder)?;
        Ok(Self {
            header,
            transactions,
        })
    }
}

#[derive(Debug)]
pub enum BlockDecodeError {
    Decode(DecodeError),
}

impl From<DecodeError> for BlockDecodeError {
    fn from(error: DecodeError) -> Self {
        BlockDecodeError::Decode(error)
    }
}

impl std::fmt::Display for BlockDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDecodeError::Decode(error) => write!(f, "block decode failed: {error}"),
        }
    }
}

impl std::error::Error for BlockDecodeError {}

/// Builds the genesis block for the given header parameters. The coinbase is
/// shared by every network; only the header fields differ.
pub fn genesis_block(params: &GenesisParams) -> Block {
    let mut script_sig = Vec::with_capacity(8 + GENESIS_TIMESTAMP.len());
    script_sig.push(0x04);
    script_sig.extend_from_slice(&486_604_799u32.to_le_bytes());
    script_sig.extend_from_slice(&[0x01, 0x04]);
    script_sig.push(GENESIS_TIMESTAMP.len() as u8);
    script_sig.extend_from_slice(GENESIS_TIMESTAMP);

    let mut script_pubkey = Vec::with_capacity(67);
    script_pubkey.push(GENESIS_OUTPUT_KEY.len() as u8);
    script_pubkey.extend_from_slice(&GENESIS_OUTPUT_KEY);
    script_pubkey.push(0xac);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: params.reward,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let merkle_root = coinbase.txid();
    Block {
        header: BlockHeader {
            version: params.version,
            prev_block: [0u8; 32],
            merkle_root,
            time: params.time,
            bits: params.bits,
            nonce: params.nonce,
        },
        transactions: vec![coinbase],
    }
}
