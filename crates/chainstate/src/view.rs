//! Layered coin views.
//!
//! A [`CoinsCache`] sits on top of any other [`CoinView`] (the database or
//! another cache) and records changes locally until [`CoinsCache::flush`]
//! pushes them down. Entries carry two flags:
//!
//! * `DIRTY`: the entry differs from the parent and must be written on flush.
//! * `FRESH`: the parent has no unspent version of this coin, so a spent
//!   fresh entry can simply be dropped instead of written as a deletion.

use std::collections::HashMap;

use chaind_consensus::Hash256;
use chaind_primitives::encoding::DecodeError;
use chaind_primitives::OutPoint;
use chaind_script::standard::is_unspendable;
use chaind_storage::StoreError;

use crate::coins::Coin;

pub const CACHE_DIRTY: u8 = 1 << 0;
pub const CACHE_FRESH: u8 = 1 << 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub coin: Coin,
    pub flags: u8,
}

impl CacheEntry {
    pub fn new(coin: Coin, flags: u8) -> Self {
        Self { coin, flags }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & CACHE_DIRTY != 0
    }

    pub fn is_fresh(&self) -> bool {
        self.flags & CACHE_FRESH != 0
    }
}

pub type CoinMap = HashMap<OutPoint, CacheEntry>;

#[derive(Debug)]
pub enum ViewError {
    Store(StoreError),
    CorruptCoin(DecodeError),
}

impl std::fmt::Display for ViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewError::Store(err) => write!(f, "coin database: {err}"),
            ViewError::CorruptCoin(err) => write!(f, "corrupt coin record: {err}"),
        }
    }
}

impl std::error::Error for ViewError {}

impl From<StoreError> for ViewError {
    fn from(err: StoreError) -> Self {
        ViewError::Store(err)
    }
}

impl From<DecodeError> for ViewError {
    fn from(err: DecodeError) -> Self {
        ViewError::CorruptCoin(err)
    }
}

pub trait CoinView {
    /// The unspent coin at `outpoint`, if any.
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ViewError>;

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, ViewError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    /// Hash of the block the view is consistent with; all zero when unknown.
    fn best_block(&mut self) -> Result<Hash256, ViewError>;

    /// Absorbs the dirty entries of a child cache.
    fn batch_write(&mut self, entries: CoinMap, best_block: Hash256) -> Result<(), ViewError>;
}

impl<T: CoinView + ?Sized> CoinView for &mut T {
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ViewError> {
        (**self).get_coin(outpoint)
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, ViewError> {
        (**self).have_coin(outpoint)
    }

    fn best_block(&mut self) -> Result<Hash256, ViewError> {
        (**self).best_block()
    }

    fn batch_write(&mut self, entries: CoinMap, best_block: Hash256) -> Result<(), ViewError> {
        (**self).batch_write(entries, best_block)
    }
}

const ENTRY_OVERHEAD: usize = std::mem::size_of::<(OutPoint, CacheEntry)>() + 16;

fn entry_usage(coin: &Coin) -> usize {
    ENTRY_OVERHEAD + coin.dynamic_usage()
}

pub struct CoinsCache<V> {
    base: V,
    entries: CoinMap,
    best_block: Option<Hash256>,
    usage: usize,
}

impl<V: CoinView> CoinsCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            entries: CoinMap::new(),
            best_block: None,
            usage: 0,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut V {
        &mut self.base
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated bytes held by cached entries.
    pub fn dynamic_usage(&self) -> usize {
        self.usage
    }

    pub fn entry(&self, outpoint: &OutPoint) -> Option<&CacheEntry> {
        self.entries.get(outpoint)
    }

    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.entries
            .get(outpoint)
            .is_some_and(|entry| !entry.coin.is_spent())
    }

    /// Looks the coin up locally, pulling it from the parent on a miss. A
    /// coin the parent does not have is remembered as a spent fresh entry.
    fn fetch(&mut self, outpoint: &OutPoint) -> Result<&mut CacheEntry, ViewError> {
        if !self.entries.contains_key(outpoint) {
            let entry = match self.base.get_coin(outpoint)? {
                Some(coin) => CacheEntry::new(coin, 0),
                None => CacheEntry::new(Coin::spent(), CACHE_FRESH),
            };
            self.usage += entry_usage(&entry.coin);
            self.entries.insert(outpoint.clone(), entry);
        }
        self.entries
            .get_mut(outpoint)
            .ok_or(ViewError::CorruptCoin(DecodeError::InvalidData("cache entry vanished")))
    }

    /// Adds a new unspent coin.
    ///
    /// Outputs that can never be spent are dropped.
    ///
    /// # Panics
    ///
    /// If `coin` is spent, or if an unspent coin already sits at `outpoint`
    /// and `allow_overwrite` is false.
    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, allow_overwrite: bool) {
        assert!(!coin.is_spent(), "attempted to add a spent coin");
        if is_unspendable(&coin.out.script_pubkey) {
            return;
        }

        let added_usage = entry_usage(&coin);
        let flags = match self.entries.get_mut(&outpoint) {
            Some(existing) => {
                if !allow_overwrite && !existing.coin.is_spent() {
                    panic!("attempted to overwrite an unspent coin without allow_overwrite");
                }
                // A spent entry that was never written here hides nothing
                // live in the parent, so the new coin can stay fresh.
                let fresh = !allow_overwrite && !existing.is_dirty();
                self.usage -= entry_usage(&existing.coin);
                existing.coin = coin;
                existing.flags |= CACHE_DIRTY | if fresh { CACHE_FRESH } else { 0 };
                existing.flags
            }
            None => {
                // An overwrite may shadow a live coin further down the stack.
                let flags = CACHE_DIRTY | if allow_overwrite { 0 } else { CACHE_FRESH };
                self.entries.insert(outpoint, CacheEntry::new(coin, flags));
                flags
            }
        };
        debug_assert!(flags & CACHE_DIRTY != 0);
        self.usage += added_usage;
    }

    /// Spends the coin at `outpoint`, returning it if it was unspent.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ViewError> {
        let entry = self.fetch(outpoint)?;
        if entry.coin.is_spent() {
            return Ok(None);
        }
        let fresh = entry.is_fresh();
        let coin = std::mem::replace(&mut entry.coin, Coin::spent());
        entry.flags |= CACHE_DIRTY;
        self.usage -= coin.dynamic_usage();
        if fresh {
            self.entries.remove(outpoint);
            self.usage -= ENTRY_OVERHEAD;
        }
        Ok(Some(coin))
    }

    /// The unspent coin at `outpoint`, cloned out of the cache.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ViewError> {
        let entry = self.fetch(outpoint)?;
        Ok((!entry.coin.is_spent()).then(|| entry.coin.clone()))
    }

    /// Like [`access_coin`](Self::access_coin) but leaves the cache untouched
    /// on a miss.
    pub fn peek_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ViewError> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok((!entry.coin.is_spent()).then(|| entry.coin.clone())),
            None => self.base.get_coin(outpoint),
        }
    }

    /// Drops a clean entry so memory can be reclaimed.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if let Some(entry) = self.entries.get(outpoint) {
            if entry.flags == 0 {
                self.usage -= entry_usage(&entry.coin);
                self.entries.remove(outpoint);
            }
        }
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    /// Pushes every change into the parent and empties the cache.
    pub fn flush(&mut self) -> Result<(), ViewError> {
        let best = self.best_block()?;
        let entries = std::mem::take(&mut self.entries);
        self.usage = 0;
        self.base.batch_write(entries, best)
    }

    pub fn into_base(self) -> V {
        self.base
    }
}

impl<V: CoinView> CoinView for CoinsCache<V> {
    fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ViewError> {
        self.access_coin(outpoint)
    }

    fn best_block(&mut self) -> Result<Hash256, ViewError> {
        match self.best_block {
            Some(hash) => Ok(hash),
            None => {
                let hash = self.base.best_block()?;
                self.best_block = Some(hash);
                Ok(hash)
            }
        }
    }

    fn batch_write(&mut self, entries: CoinMap, best_block: Hash256) -> Result<(), ViewError> {
        for (outpoint, child) in entries {
            if !child.is_dirty() {
                continue;
            }
            match self.entries.get_mut(&outpoint) {
                None => {
                    // Nothing to tell the parent about a coin that was both
                    // created and spent below it.
                    if child.is_fresh() && child.coin.is_spent() {
                        continue;
                    }
                    // Only a fresh child proves the grandparent lacks it too.
                    let flags = CACHE_DIRTY | (child.flags & CACHE_FRESH);
                    self.usage += entry_usage(&child.coin);
                    self.entries
                        .insert(outpoint, CacheEntry::new(child.coin, flags));
                }
                Some(ours) => {
                    if child.is_fresh() && !ours.coin.is_spent() {
                        panic!(
                            "FRESH flag misapplied to a cache entry with an unspent parent coin"
                        );
                    }
                    if ours.is_fresh() && child.coin.is_spent() {
                        self.usage -= entry_usage(&ours.coin);
                        self.entries.remove(&outpoint);
                    } else {
                        self.usage -= ours.coin.dynamic_usage();
                        self.usage += child.coin.dynamic_usage();
                        ours.coin = child.coin;
                        ours.flags |= CACHE_DIRTY;
                    }
                }
            }
        }
        self.best_block = Some(best_block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaind_primitives::TxOut;

    /// A parent view that only knows what it was seeded with and records
    /// what it was asked to absorb.
    #[derive(Default)]
    struct SeededView {
        coins: HashMap<OutPoint, Coin>,
        written: Vec<CoinMap>,
        best: Hash256,
    }

    impl CoinView for SeededView {
        fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ViewError> {
            Ok(self.coins.get(outpoint).cloned())
        }

        fn best_block(&mut self) -> Result<Hash256, ViewError> {
            Ok(self.best)
        }

        fn batch_write(
            &mut self,
            entries: CoinMap,
            best_block: Hash256,
        ) -> Result<(), ViewError> {
            self.written.push(entries);
            self.best = best_block;
            Ok(())
        }
    }

    fn coin(value: i64) -> Coin {
        Coin::new(
            TxOut {
                value,
                script_pubkey: vec![0x51],
            },
            10,
            false,
        )
    }

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new([n; 32], 0)
    }

    #[test]
    fn overwrite_requires_permission() {
        let mut cache = CoinsCache::new(SeededView::default());
        cache.add_coin(outpoint(1), coin(5), false);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.add_coin(outpoint(1), coin(6), false);
        }));
        assert!(result.is_err());

        let mut cache = CoinsCache::new(SeededView::default());
        cache.add_coin(outpoint(1), coin(5), false);
        cache.add_coin(outpoint(1), coin(6), true);
        let entry = cache.entry(&outpoint(1)).expect("entry");
        assert!(entry.is_dirty());
        assert_eq!(entry.coin, coin(6));
    }

    #[test]
    #[should_panic(expected = "spent coin")]
    fn adding_a_spent_coin_panics() {
        let mut cache = CoinsCache::new(SeededView::default());
        cache.add_coin(outpoint(1), Coin::spent(), false);
    }

    #[test]
    fn unspendable_outputs_are_not_cached() {
        let mut cache = CoinsCache::new(SeededView::default());
        let mut burn = coin(5);
        burn.out.script_pubkey = vec![0x6a, 0x01, 0x00];
        cache.add_coin(outpoint(1), burn, false);
        assert!(cache.is_empty());
    }

    #[test]
    fn misses_are_memoized_and_spends_of_fresh_coins_vanish() {
        let mut base = SeededView::default();
        base.coins.insert(outpoint(1), coin(5));
        let mut cache = CoinsCache::new(base);

        assert_eq!(cache.access_coin(&outpoint(1)).expect("get"), Some(coin(5)));
        assert_eq!(cache.entry(&outpoint(1)).map(|e| e.flags), Some(0));
        assert_eq!(cache.access_coin(&outpoint(2)).expect("get"), None);
        assert_eq!(cache.entry(&outpoint(2)).map(|e| e.flags), Some(CACHE_FRESH));

        cache.add_coin(outpoint(2), coin(7), false);
        assert_eq!(
            cache.entry(&outpoint(2)).map(|e| e.flags),
            Some(CACHE_DIRTY | CACHE_FRESH)
        );
        assert_eq!(cache.spend_coin(&outpoint(2)).expect("spend"), Some(coin(7)));
        assert!(cache.entry(&outpoint(2)).is_none());

        assert_eq!(cache.spend_coin(&outpoint(1)).expect("spend"), Some(coin(5)));
        let spent = cache.entry(&outpoint(1)).expect("kept");
        assert!(spent.is_dirty() && spent.coin.is_spent());
        assert_eq!(cache.spend_coin(&outpoint(1)).expect("spend"), None);
    }

    #[test]
    fn fresh_spent_child_entry_is_not_materialized() {
        let mut parent = CoinsCache::new(SeededView::default());
        {
            let mut child = CoinsCache::new(&mut parent);
            child.add_coin(outpoint(3), coin(9), false);
            child.spend_coin(&outpoint(3)).expect("spend");
            let mut entries = CoinMap::new();
            let spent_fresh = CacheEntry::new(Coin::spent(), CACHE_DIRTY | CACHE_FRESH);
            entries.insert(outpoint(4), spent_fresh);
            child.base_mut().batch_write(entries, [1u8; 32]).expect("write");
            child.flush().expect("flush");
        }
        assert!(parent.entry(&outpoint(3)).is_none());
        assert!(parent.entry(&outpoint(4)).is_none());
        assert!(parent.is_empty());
    }

    #[test]
    fn flush_propagates_fresh_only_from_fresh_children() {
        let mut base = SeededView::default();
        base.coins.insert(outpoint(1), coin(5));
        let mut parent = CoinsCache::new(base);
        {
            let mut child = CoinsCache::new(&mut parent);
            child.add_coin(outpoint(2), coin(6), false);
            child.spend_coin(&outpoint(1)).expect("spend");
            child.set_best_block([2u8; 32]);
            child.flush().expect("flush");
            assert!(child.is_empty());
            assert_eq!(child.dynamic_usage(), 0);
        }
        let created = parent.entry(&outpoint(2)).expect("created");
        assert_eq!(created.flags, CACHE_DIRTY | CACHE_FRESH);
        let spent = parent.entry(&outpoint(1)).expect("spent");
        assert_eq!(spent.flags, CACHE_DIRTY);
        assert!(spent.coin.is_spent());
        assert_eq!(parent.best_block().expect("best"), [2u8; 32]);

        parent.flush().expect("flush");
        let written = &parent.base().written[0];
        assert_eq!(written.len(), 2);
        assert_eq!(parent.base().best, [2u8; 32]);
    }

    #[test]
    #[should_panic(expected = "FRESH flag misapplied")]
    fn fresh_child_over_live_parent_is_fatal() {
        let mut parent = CoinsCache::new(SeededView::default());
        parent.add_coin(outpoint(1), coin(5), false);
        let mut entries = CoinMap::new();
        entries.insert(outpoint(1), CacheEntry::new(coin(6), CACHE_DIRTY | CACHE_FRESH));
        let _ = parent.batch_write(entries, [0u8; 32]);
    }

    #[test]
    fn overwriting_a_live_parent_coin_stays_visible_to_flush() {
        let mut base = SeededView::default();
        base.coins.insert(outpoint(1), coin(5));
        let mut parent = CoinsCache::new(base);
        assert_eq!(parent.access_coin(&outpoint(1)).expect("get"), Some(coin(5)));

        // Replaced, then flushed: the parent takes the new coin.
        {
            let mut child = CoinsCache::new(&mut parent);
            child.add_coin(outpoint(1), coin(6), true);
            assert_eq!(child.entry(&outpoint(1)).map(|e| e.flags), Some(CACHE_DIRTY));
            child.flush().expect("flush");
        }
        assert_eq!(parent.access_coin(&outpoint(1)).expect("get"), Some(coin(6)));

        // Replaced and spent below: the spend must reach the parent.
        {
            let mut child = CoinsCache::new(&mut parent);
            child.add_coin(outpoint(1), coin(7), true);
            assert_eq!(child.spend_coin(&outpoint(1)).expect("spend"), Some(coin(7)));
            let spent = child.entry(&outpoint(1)).expect("spend is remembered");
            assert!(spent.is_dirty() && spent.coin.is_spent());
            child.flush().expect("flush");
        }
        assert_eq!(parent.access_coin(&outpoint(1)).expect("get"), None);
    }

    #[test]
    fn best_block_is_pulled_lazily() {
        let base = SeededView {
            best: [9u8; 32],
            ..SeededView::default()
        };
        let mut cache = CoinsCache::new(base);
        assert_eq!(cache.best_block().expect("best"), [9u8; 32]);
        cache.set_best_block([3u8; 32]);
        assert_eq!(cache.best_block().expect("best"), [3u8; 32]);
        assert_eq!(cache.base_mut().best_block().expect("best"), [9u8; 32]);
    }
}
