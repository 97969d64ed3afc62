//! Coins and the database-backed base of the coin view stack.

use std::sync::Arc;

use chaind_consensus::Hash256;
use chaind_log::{log_category, Category};
use chaind_primitives::encoding::{DecodeError, Decoder, Encoder};
use chaind_primitives::{OutPoint, TxOut};
use chaind_storage::{Column, KeyValueStore, WriteBatch};

use crate::view::{CacheEntry, CoinMap, CoinView, ViewError, CACHE_DIRTY};

pub const OUTPOINT_KEY_LEN: usize = 36;
pub const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

/// An unspent output plus the height and coinbase flag of the transaction
/// that created it. A spent coin is represented by a null output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coin {
    pub out: TxOut,
    pub height: u32,
    pub coinbase: bool,
}

impl Coin {
    pub fn new(out: TxOut, height: u32, coinbase: bool) -> Self {
        Self {
            out,
            height,
            coinbase,
        }
    }

    pub fn spent() -> Self {
        Self {
            out: TxOut::null(),
            height: 0,
            coinbase: false,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.out.is_null()
    }

    pub fn clear(&mut self) {
        *self = Self::spent();
    }

    /// Heap bytes held by the coin, for cache accounting.
    pub fn dynamic_usage(&self) -> usize {
        self.out.script_pubkey.capacity()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(16 + self.out.script_pubkey.len());
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_var_int((u64::from(self.height) << 1) | u64::from(self.coinbase));
        encoder.write_var_int(self.out.value.max(0) as u64);
        encoder.write_var_bytes(&self.out.script_pubkey);
    }

    pub fn read(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let code = decoder.read_var_int()?;
        let height = u32::try_from(code >> 1)
            .map_err(|_| DecodeError::InvalidData("coin height out of range"))?;
        let value = i64::try_from(decoder.read_var_int()?)
            .map_err(|_| DecodeError::InvalidData("coin value out of range"))?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            out: TxOut {
                value,
                script_pubkey,
            },
            height,
            coinbase: code & 1 == 1,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let coin = Self::read(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(coin)
    }
}

pub fn outpoint_key(outpoint: &OutPoint) -> [u8; OUTPOINT_KEY_LEN] {
    let mut key = [0u8; OUTPOINT_KEY_LEN];
    key[..32].copy_from_slice(&outpoint.hash);
    key[32..].copy_from_slice(&outpoint.index.to_le_bytes());
    key
}

/// The coin set as stored in the key-value engine.
pub struct CoinsDb<S> {
    store: Arc<S>,
}

impl<S> Clone for CoinsDb<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore> CoinsDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Visits every stored coin in key order.
    pub fn for_each_coin(
        &self,
        mut visit: impl FnMut(OutPoint, Coin),
    ) -> Result<(), ViewError> {
        let mut decode_error = None;
        self.store.for_each_prefix(Column::Utxo, &[], &mut |key: &[u8], value: &[u8]| {
            if key.len() != OUTPOINT_KEY_LEN {
                return Ok(());
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key[..32]);
            let mut index = [0u8; 4];
            index.copy_from_slice(&key[32..]);
            match Coin::decode(value) {
                Ok(coin) => visit(OutPoint::new(hash, u32::from_le_bytes(index)), coin),
                Err(err) => {
                    decode_error.get_or_insert(err);
                }
            }
            Ok(())
        })?;
        match decode_error {
            Some(err) => Err(ViewError::CorruptCoin(err)),
            None => Ok(()),
        }
    }
}

impl<S: KeyValueStore> CoinView for CoinsDb<S> {
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ViewError> {
        match self.store.get(Column::Utxo, &outpoint_key(outpoint))? {
            Some(bytes) => Ok(Some(Coin::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, ViewError> {
        Ok(self.store.contains(Column::Utxo, &outpoint_key(outpoint))?)
    }

    fn best_block(&mut self) -> Result<Hash256, ViewError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| ViewError::CorruptCoin(DecodeError::InvalidData("best block"))),
            None => Ok([0u8; 32]),
        }
    }

    fn batch_write(&mut self, entries: CoinMap, best_block: Hash256) -> Result<(), ViewError> {
        let mut batch = WriteBatch::new();
        batch.reserve(entries.len() + 1);
        let (mut written, mut erased) = (0usize, 0usize);
        for (outpoint, CacheEntry { coin, flags }) in entries {
            if flags & CACHE_DIRTY == 0 {
                continue;
            }
            if coin.is_spent() {
                batch.delete(Column::Utxo, outpoint_key(&outpoint));
                erased += 1;
            } else {
                batch.put(Column::Utxo, outpoint_key(&outpoint), coin.encode());
                written += 1;
            }
        }
        if best_block != [0u8; 32] {
            batch.put(Column::Meta, META_BEST_BLOCK_KEY, best_block);
        }
        self.store.write_batch(&batch)?;
        log_category!(
            Category::CoinDb,
            "committed {} changed coins ({} erased) to coin database",
            written + erased,
            erased
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::CACHE_FRESH;
    use chaind_storage::memory::MemoryStore;

    fn coin(value: i64, height: u32, coinbase: bool) -> Coin {
        Coin::new(
            TxOut {
                value,
                script_pubkey: vec![0x51, 0x52],
            },
            height,
            coinbase,
        )
    }

    #[test]
    fn coin_encoding_packs_height_and_coinbase() {
        let original = coin(5_000_000_000, 300, true);
        let bytes = original.encode();
        // 601 needs two var-int bytes, the value five.
        assert_eq!(&bytes[..2], &[0x83, 0x59]);
        assert_eq!(Coin::decode(&bytes).expect("decode"), original);

        let mut trailing = bytes;
        trailing.push(0);
        assert_eq!(Coin::decode(&trailing), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn batch_write_puts_and_deletes_dirty_entries() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(Arc::clone(&store));
        let live = OutPoint::new([1u8; 32], 0);
        let gone = OutPoint::new([1u8; 32], 1);
        let clean = OutPoint::new([2u8; 32], 0);

        let mut entries = CoinMap::default();
        entries.insert(live.clone(), CacheEntry::new(coin(10, 1, false), CACHE_DIRTY | CACHE_FRESH));
        entries.insert(gone.clone(), CacheEntry::new(coin(20, 1, false), CACHE_DIRTY));
        entries.insert(clean.clone(), CacheEntry::new(coin(30, 1, false), 0));
        db.batch_write(entries, [7u8; 32]).expect("write");
        assert!(db.have_coin(&gone).expect("have"));
        assert!(!db.have_coin(&clean).expect("have"));

        let mut entries = CoinMap::default();
        entries.insert(gone.clone(), CacheEntry::new(Coin::spent(), CACHE_DIRTY));
        db.batch_write(entries, [8u8; 32]).expect("write");

        assert_eq!(db.get_coin(&live).expect("get"), Some(coin(10, 1, false)));
        assert_eq!(db.get_coin(&gone).expect("get"), None);
        assert_eq!(db.best_block().expect("best"), [8u8; 32]);

        let mut seen = Vec::new();
        db.for_each_coin(|outpoint, _| seen.push(outpoint)).expect("scan");
        assert_eq!(seen, vec![live]);
    }
}
