//! Block index nodes and their persisted form.

use chaind_consensus::Hash256;
use chaind_pow::difficulty::HeaderInfo;
use chaind_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use chaind_primitives::BlockHeader;
use primitive_types::U256;

use crate::flatfiles::FileLocation;

pub const BLOCK_VALID_UNKNOWN: u32 = 0;
/// Parsed, version ok, hash satisfies the claimed target.
pub const BLOCK_VALID_HEADER: u32 = 1;
/// All parents found, difficulty and timestamps checked against the parent.
pub const BLOCK_VALID_TREE: u32 = 2;
/// Context-free transaction checks passed and the parent chain has data.
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
/// Outputs do not overspend, no double spends, coinbase amount ok.
pub const BLOCK_VALID_CHAIN: u32 = 4;
/// Scripts and signatures ok.
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 7;

pub const BLOCK_HAVE_DATA: u32 = 8;
pub const BLOCK_HAVE_UNDO: u32 = 16;
pub const BLOCK_FAILED_VALID: u32 = 32;
pub const BLOCK_FAILED_CHILD: u32 = 64;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

const RECORD_VERSION: u8 = 1;

/// Stable handle into the block tree arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub parent: Option<NodeId>,
    pub skip: Option<NodeId>,
    pub height: i32,
    pub chain_work: U256,
    pub status: u32,
    pub tx_count: u32,
    /// Transactions up to and including this block; zero until every
    /// ancestor's data is known.
    pub chain_tx: u64,
    /// Order in which the block's data became connectable. Zero for blocks
    /// loaded from disk.
    pub sequence_id: u64,
    pub block_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
}

impl BlockIndexNode {
    pub fn validity(&self) -> u32 {
        self.status & BLOCK_VALID_MASK
    }

    pub fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    /// Whether the node reached `up_to` without being marked failed.
    pub fn is_valid(&self, up_to: u32) -> bool {
        debug_assert!(up_to & !BLOCK_VALID_MASK == 0);
        !self.is_failed() && self.validity() >= up_to
    }

    /// Raises the validity stage; returns whether anything changed.
    pub fn raise_validity(&mut self, up_to: u32) -> bool {
        if self.is_failed() || self.validity() >= up_to {
            return false;
        }
        self.status = (self.status & !BLOCK_VALID_MASK) | up_to;
        true
    }

    pub fn has_data(&self) -> bool {
        self.status & BLOCK_HAVE_DATA != 0
    }

    pub fn has_undo(&self) -> bool {
        self.status & BLOCK_HAVE_UNDO != 0
    }

    pub fn time(&self) -> i64 {
        i64::from(self.header.time)
    }

    pub fn header_info(&self) -> HeaderInfo {
        HeaderInfo {
            height: i64::from(self.height),
            time: self.time(),
            bits: self.header.bits,
        }
    }

    pub fn to_record(&self) -> BlockIndexRecord {
        BlockIndexRecord {
            height: self.height,
            status: self.status,
            tx_count: self.tx_count,
            block_pos: self.block_pos.filter(|_| self.has_data()),
            undo_pos: self.undo_pos.filter(|_| self.has_undo()),
            header: self.header.clone(),
        }
    }
}

/// What the block index column stores per hash. Work, chain tx counts, skip
/// pointers and sequence ids are rebuilt on load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexRecord {
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub block_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
    pub header: BlockHeader,
}

impl BlockIndexRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(128);
        encoder.write_u8(RECORD_VERSION);
        encoder.write_var_int(self.height as u64);
        encoder.write_var_int(u64::from(self.status));
        encoder.write_var_int(u64::from(self.tx_count));
        if self.status & BLOCK_HAVE_DATA != 0 {
            if let Some(pos) = &self.block_pos {
                pos.write(&mut encoder);
            }
        }
        if self.status & BLOCK_HAVE_UNDO != 0 {
            if let Some(pos) = &self.undo_pos {
                pos.write(&mut encoder);
            }
        }
        Encodable::consensus_encode(&self.header, &mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != RECORD_VERSION {
            return Err(DecodeError::InvalidData("unknown block index record version"));
        }
        let height = i32::try_from(decoder.read_var_int()?)
            .map_err(|_| DecodeError::InvalidData("block height out of range"))?;
        let status = u32::try_from(decoder.read_var_int()?)
            .map_err(|_| DecodeError::InvalidData("block status out of range"))?;
        let tx_count = u32::try_from(decoder.read_var_int()?)
            .map_err(|_| DecodeError::InvalidData("transaction count out of range"))?;
        let block_pos = if status & BLOCK_HAVE_DATA != 0 {
            Some(FileLocation::read(&mut decoder)?)
        } else {
            None
        };
        let undo_pos = if status & BLOCK_HAVE_UNDO != 0 {
            Some(FileLocation::read(&mut decoder)?)
        } else {
            None
        };
        let header = <BlockHeader as Decodable>::consensus_decode(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            height,
            status,
            tx_count,
            block_pos,
            undo_pos,
            header,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: [3u8; 32],
            merkle_root: [4u8; 32],
            time: 1_600_000_000,
            bits: 0x207f_ffff,
            nonce: 7,
        }
    }

    #[test]
    fn record_keeps_positions_only_with_matching_flags() {
        let pos = FileLocation {
            file_id: 2,
            offset: 4096,
            len: 250,
        };
        let record = BlockIndexRecord {
            height: 812,
            status: BLOCK_VALID_SCRIPTS | BLOCK_HAVE_DATA | BLOCK_HAVE_UNDO,
            tx_count: 3,
            block_pos: Some(pos),
            undo_pos: Some(FileLocation { offset: 12, ..pos }),
            header: header(),
        };
        let decoded = BlockIndexRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);

        let headers_only = BlockIndexRecord {
            status: BLOCK_VALID_TREE,
            block_pos: None,
            undo_pos: None,
            tx_count: 0,
            ..record
        };
        let bytes = headers_only.encode();
        assert_eq!(bytes.len(), 1 + 2 + 1 + 1 + 80);
        assert_eq!(BlockIndexRecord::decode(&bytes).expect("decode"), headers_only);
    }

    #[test]
    fn validity_is_monotone_and_blocked_by_failure() {
        let mut node = BlockIndexNode {
            hash: [1u8; 32],
            header: header(),
            parent: None,
            skip: None,
            height: 0,
            chain_work: U256::zero(),
            status: BLOCK_VALID_TREE,
            tx_count: 0,
            chain_tx: 0,
            sequence_id: 0,
            block_pos: None,
            undo_pos: None,
        };
        assert!(node.raise_validity(BLOCK_VALID_TRANSACTIONS));
        assert!(!node.raise_validity(BLOCK_VALID_TREE));
        assert_eq!(node.validity(), BLOCK_VALID_TRANSACTIONS);

        node.status |= BLOCK_FAILED_CHILD;
        assert!(!node.is_valid(BLOCK_VALID_TREE));
        assert!(!node.raise_validity(BLOCK_VALID_SCRIPTS));
    }
}
