//! Undo records and the apply/rollback of a block against a coin cache.

use chaind_consensus::constants::MAX_OUTPUTS_PER_BLOCK;
use chaind_consensus::Hash256;
use chaind_log::log_error;
use chaind_primitives::encoding::{DecodeError, Decoder, Encoder};
use chaind_primitives::{sha256d, Block, OutPoint, Transaction};
use chaind_script::standard::is_unspendable;

use crate::coins::Coin;
use crate::view::{CoinView, CoinsCache, ViewError};

const CHECKSUM_LEN: usize = 32;

/// The coin an input consumed. A height of zero means the creating
/// transaction's metadata was not recorded and must be recovered from a
/// sibling output on rollback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInUndo {
    pub coin: Coin,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxUndo {
    pub prevouts: Vec<TxInUndo>,
}

/// One [`TxUndo`] per non-coinbase transaction, in block order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(self.txs.len() as u64);
        for tx in &self.txs {
            encoder.write_compact_size(tx.prevouts.len() as u64);
            for prevout in &tx.prevouts {
                prevout.coin.write(&mut encoder);
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx_count = decoder.read_compact_size()? as usize;
        let mut txs = Vec::with_capacity(tx_count.min(decoder.remaining()));
        for _ in 0..tx_count {
            let count = decoder.read_compact_size()? as usize;
            let mut prevouts = Vec::with_capacity(count.min(decoder.remaining()));
            for _ in 0..count {
                prevouts.push(TxInUndo {
                    coin: Coin::read(&mut decoder)?,
                });
            }
            txs.push(TxUndo { prevouts });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txs })
    }

    /// Serialized record followed by a checksum binding it to the parent
    /// block, as written to the undo files.
    pub fn encode_with_checksum(&self, prev_hash: &Hash256) -> Vec<u8> {
        let mut bytes = self.encode();
        let checksum = undo_checksum(prev_hash, &bytes);
        bytes.extend_from_slice(&checksum);
        bytes
    }

    pub fn decode_with_checksum(bytes: &[u8], prev_hash: &Hash256) -> Result<Self, DecodeError> {
        if bytes.len() < CHECKSUM_LEN {
            return Err(DecodeError::UnexpectedEof);
        }
        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if undo_checksum(prev_hash, body).as_slice() != checksum {
            return Err(DecodeError::InvalidData("undo checksum mismatch"));
        }
        Self::decode(body)
    }
}

fn undo_checksum(prev_hash: &Hash256, body: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(prev_hash.len() + body.len());
    data.extend_from_slice(prev_hash);
    data.extend_from_slice(body);
    sha256d(&data)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectResult {
    /// Every output and input was restored exactly.
    Clean,
    /// Rolled back, but the coin set did not look the way the block left it.
    Unclean,
    /// The undo data does not fit the block; nothing sensible can be done.
    Failed,
}

/// Spends the inputs of `tx` and adds its outputs at `height`, returning what
/// the spends consumed.
///
/// # Panics
///
/// If an input's coin is missing. Callers check input availability first.
pub fn connect_tx<V: CoinView>(
    tx: &Transaction,
    cache: &mut CoinsCache<V>,
    height: u32,
) -> Result<TxUndo, ViewError> {
    let coinbase = tx.is_coinbase();
    let mut undo = TxUndo::default();
    if !coinbase {
        undo.prevouts.reserve(tx.vin.len());
        for input in &tx.vin {
            match cache.spend_coin(&input.prevout)? {
                Some(coin) => undo.prevouts.push(TxInUndo { coin }),
                None => panic!(
                    "connect_tx: input {}:{} is missing or already spent",
                    chaind_consensus::hash256_to_hex(&input.prevout.hash),
                    input.prevout.index
                ),
            }
        }
    }
    add_outputs(tx, cache, height, coinbase);
    Ok(undo)
}

/// Adds every output of `tx`. Coinbase outputs may replace an existing coin,
/// which only happens for the historical duplicate coinbases.
pub fn add_outputs<V: CoinView>(
    tx: &Transaction,
    cache: &mut CoinsCache<V>,
    height: u32,
    overwrite: bool,
) {
    let txid = tx.txid();
    let coinbase = tx.is_coinbase();
    for (index, out) in tx.vout.iter().enumerate() {
        cache.add_coin(
            OutPoint::new(txid, index as u32),
            Coin::new(out.clone(), height, coinbase),
            overwrite,
        );
    }
}

/// Puts an input's previous coin back into the cache.
pub fn apply_tx_in_undo<V: CoinView>(
    undo: TxInUndo,
    cache: &mut CoinsCache<V>,
    outpoint: &OutPoint,
) -> Result<DisconnectResult, ViewError> {
    let mut coin = undo.coin;
    if coin.is_spent() {
        return Ok(DisconnectResult::Failed);
    }
    let mut clean = true;
    if cache.have_coin(outpoint)? {
        clean = false;
    }
    if coin.height == 0 {
        let mut sibling = None;
        for index in 0..MAX_OUTPUTS_PER_BLOCK {
            if let Some(found) = cache.peek_coin(&OutPoint::new(outpoint.hash, index))? {
                sibling = Some(found);
                break;
            }
        }
        match sibling {
            Some(found) => {
                coin.height = found.height;
                coin.coinbase = found.coinbase;
            }
            None => return Ok(DisconnectResult::Failed),
        }
    }
    cache.add_coin(outpoint.clone(), coin, !clean);
    Ok(if clean {
        DisconnectResult::Clean
    } else {
        DisconnectResult::Unclean
    })
}

/// Reverses `block` at `height` in `cache` using its undo record.
pub fn disconnect_block<V: CoinView>(
    block: &Block,
    undo: &BlockUndo,
    height: u32,
    cache: &mut CoinsCache<V>,
) -> Result<DisconnectResult, ViewError> {
    if undo.txs.len() + 1 != block.transactions.len() {
        log_error!(
            "disconnect_block: block and undo data inconsistent ({} txs, {} undo records)",
            block.transactions.len(),
            undo.txs.len()
        );
        return Ok(DisconnectResult::Failed);
    }

    let mut clean = true;
    for (position, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        let coinbase = tx.is_coinbase();
        for (index, out) in tx.vout.iter().enumerate() {
            if is_unspendable(&out.script_pubkey) {
                continue;
            }
            match cache.spend_coin(&OutPoint::new(txid, index as u32))? {
                Some(coin) => {
                    if &coin.out != out || coin.height != height || coin.coinbase != coinbase {
                        clean = false;
                    }
                }
                None => clean = false,
            }
        }

        if position == 0 {
            continue;
        }
        let tx_undo = &undo.txs[position - 1];
        if tx_undo.prevouts.len() != tx.vin.len() {
            log_error!(
                "disconnect_block: undo record for tx {} has {} entries, expected {}",
                chaind_consensus::hash256_to_hex(&txid),
                tx_undo.prevouts.len(),
                tx.vin.len()
            );
            return Ok(DisconnectResult::Failed);
        }
        for (input, prevout) in tx.vin.iter().zip(&tx_undo.prevouts).rev() {
            match apply_tx_in_undo(prevout.clone(), cache, &input.prevout)? {
                DisconnectResult::Clean => {}
                DisconnectResult::Unclean => clean = false,
                DisconnectResult::Failed => return Ok(DisconnectResult::Failed),
            }
        }
    }

    cache.set_best_block(block.header.prev_block);
    Ok(if clean {
        DisconnectResult::Clean
    } else {
        DisconnectResult::Unclean
    })
}
