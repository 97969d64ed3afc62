//! The chain state machine: header and block acceptance, best-chain
//! activation, reorganisation, invalidation and database verification.
//!
//! Two locks guard the mutable state. `chain` owns the active chain, the
//! candidate tips and the tip coin cache; `index` owns the block tree and
//! everything derived from it. Whenever both are needed `chain` is taken
//! first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chaind_consensus::constants::{LOCKTIME_VERIFY_SEQUENCE, MAX_BLOCK_SIGOPS};
use chaind_consensus::money::{money_range, Amount};
use chaind_consensus::{
    block_subsidy, chain_params, hash256_to_hex, ChainParams, DeploymentPos, Hash256,
};
use chaind_log::{log_category, log_error, log_info, log_warn, Category};
use chaind_primitives::{genesis_block, Block, BlockHeader, OutPoint, TxOut};
use chaind_script::flags::SCRIPT_VERIFY_P2SH;
use chaind_script::sigops::{legacy_sigop_count, p2sh_sigops_for_tx};
use chaind_script::{PrecomputedTxData, ScriptCheck, ScriptVerifier};
use chaind_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;
use rayon::prelude::*;

use crate::blockindex::{
    BlockIndexNode, BlockIndexRecord, NodeId, BLOCK_FAILED_CHILD, BLOCK_FAILED_MASK,
    BLOCK_FAILED_VALID, BLOCK_HAVE_DATA, BLOCK_HAVE_UNDO, BLOCK_VALID_SCRIPTS,
    BLOCK_VALID_TRANSACTIONS,
};
use crate::candidates::{better_than, CandidateSet};
use crate::coins::{Coin, CoinsDb};
use crate::config::{ChainStateConfig, MAX_CHECK_LEVEL};
use crate::filemeta::{FileInfoTracker, FileKind};
use crate::flatfiles::{
    FileLocation, FlatFileError, FlatFileStore, BLOCK_FILE_PREFIX, UNDO_FILE_PREFIX,
};
use crate::metrics::{elapsed_us, ConnectMetrics, ConnectMetricsDelta, ConnectMetricsSnapshot};
use crate::tree::{ActiveChain, BlockTree, TreeError};
use crate::undo::{connect_tx, disconnect_block, BlockUndo, DisconnectResult};
use crate::validation::{
    block_script_flags, calculate_sequence_locks, check_block, check_block_header,
    check_tx_inputs, contextual_check_block, contextual_check_header, describe_block,
    enforce_bip30, evaluate_sequence_locks, script_rejection, HeaderRejection, ValidationError,
};
use crate::versionbits::{
    statistics, BitsStatistics, ThresholdState, VersionBitsCache, UNKNOWN_VERSION_WINDOW,
};
use crate::view::{CoinView, CoinsCache, ViewError};

pub const META_REINDEXING_KEY: &[u8] = b"reindexing";

#[derive(Debug)]
pub enum ChainStateError {
    Validation(ValidationError),
    InvalidHeader(HeaderRejection),
    Tree(TreeError),
    UnknownBlock(Hash256),
    InvalidRequest(&'static str),
    Store(StoreError),
    View(ViewError),
    FlatFile(FlatFileError),
    CorruptIndex(String),
    VerifyFailed(String),
    Fatal(String),
    /// A previous fatal error stopped the chain state; it must be reopened.
    Aborted,
}

impl ChainStateError {
    /// Errors after which the in-memory state can no longer be trusted to
    /// match disk.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainStateError::Store(_)
                | ChainStateError::View(_)
                | ChainStateError::FlatFile(_)
                | ChainStateError::CorruptIndex(_)
                | ChainStateError::Fatal(_)
                | ChainStateError::Aborted
        )
    }

    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            ChainStateError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Validation(err) => write!(f, "invalid block: {err}"),
            ChainStateError::InvalidHeader(err) => write!(f, "invalid header: {err}"),
            ChainStateError::Tree(err) => write!(f, "{err}"),
            ChainStateError::UnknownBlock(hash) => {
                write!(f, "unknown block {}", hash256_to_hex(hash))
            }
            ChainStateError::InvalidRequest(message) => write!(f, "{message}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::View(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::CorruptIndex(message) => write!(f, "corrupt block index: {message}"),
            ChainStateError::VerifyFailed(message) => write!(f, "verification failed: {message}"),
            ChainStateError::Fatal(message) => write!(f, "{message}"),
            ChainStateError::Aborted => write!(f, "chain state aborted after a fatal error"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<HeaderRejection> for ChainStateError {
    fn from(err: HeaderRejection) -> Self {
        ChainStateError::InvalidHeader(err)
    }
}

impl From<TreeError> for ChainStateError {
    fn from(err: TreeError) -> Self {
        ChainStateError::Tree(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<ViewError> for ChainStateError {
    fn from(err: ViewError) -> Self {
        ChainStateError::View(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

/// When `flush` writes the index and coin cache through to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Only if the coin cache has outgrown its budget.
    IfNeeded,
    /// As `IfNeeded`, or once the flush interval has passed.
    Periodic,
    Always,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i32,
    pub chain_work: U256,
    pub chain_tx: u64,
    pub time: u32,
}

impl ChainTip {
    fn of(node: &BlockIndexNode) -> Self {
        Self {
            hash: node.hash,
            height: node.height,
            chain_work: node.chain_work,
            chain_tx: node.chain_tx,
            time: node.header.time,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: u32,
    pub disconnected: u32,
    pub reconnected: u32,
    pub good_transactions: u64,
    pub interrupted: bool,
}

struct IndexState {
    tree: BlockTree,
    best_header: Option<NodeId>,
    best_invalid: Option<NodeId>,
    /// Blocks whose data arrived before their parent's, keyed by parent.
    unlinked: HashMap<NodeId, Vec<NodeId>>,
    dirty: HashSet<NodeId>,
    next_sequence: u64,
    versionbits: VersionBitsCache,
    files: FileInfoTracker,
}

struct ChainInner<S> {
    active: ActiveChain,
    candidates: CandidateSet,
    coins: CoinsCache<CoinsDb<S>>,
    last_write: Instant,
}

struct ScriptJob {
    tx_index: usize,
    input_index: usize,
    prevout: TxOut,
}

pub struct ChainState<S: KeyValueStore> {
    params: ChainParams,
    config: ChainStateConfig,
    store: Arc<S>,
    blocks: FlatFileStore,
    undo: FlatFileStore,
    verifier: Arc<dyn ScriptVerifier>,
    index: Mutex<IndexState>,
    chain: Mutex<ChainInner<S>>,
    aborted: AtomicBool,
    mock_time: AtomicI64,
    metrics: ConnectMetrics,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Opens the chain state for `config.network`, loading any persisted
    /// block index and connecting genesis on first start.
    pub fn open(
        config: ChainStateConfig,
        store: Arc<S>,
        verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self, ChainStateError> {
        let params = chain_params(config.network);
        Self::open_with_params(params, config, store, verifier)
    }

    pub fn open_with_params(
        params: ChainParams,
        config: ChainStateConfig,
        store: Arc<S>,
        verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self, ChainStateError> {
        let blocks_dir = config.blocks_dir();
        let blocks =
            FlatFileStore::open(blocks_dir.clone(), BLOCK_FILE_PREFIX, config.max_block_file_size)?;
        let undo = FlatFileStore::open(blocks_dir, UNDO_FILE_PREFIX, config.max_block_file_size)?;
        let files = FileInfoTracker::load(store.as_ref())?;

        let state = Self {
            index: Mutex::new(IndexState {
                tree: BlockTree::new(),
                best_header: None,
                best_invalid: None,
                unlinked: HashMap::new(),
                dirty: HashSet::new(),
                next_sequence: 1,
                versionbits: VersionBitsCache::new(),
                files,
            }),
            chain: Mutex::new(ChainInner {
                active: ActiveChain::new(),
                candidates: CandidateSet::new(),
                coins: CoinsCache::new(CoinsDb::new(Arc::clone(&store))),
                last_write: Instant::now(),
            }),
            params,
            config,
            store,
            blocks,
            undo,
            verifier,
            aborted: AtomicBool::new(false),
            mock_time: AtomicI64::new(0),
            metrics: ConnectMetrics::default(),
        };

        let loaded = state.load_block_index()?;
        if loaded == 0 {
            state.init_genesis()?;
        } else if state.tip()?.is_none() {
            state.activate_best_chain(None)?;
        }
        Ok(state)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &ChainStateConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn lock_chain(&self) -> Result<MutexGuard<'_, ChainInner<S>>, ChainStateError> {
        self.chain
            .lock()
            .map_err(|_| ChainStateError::Fatal("chain lock poisoned".to_string()))
    }

    fn lock_index(&self) -> Result<MutexGuard<'_, IndexState>, ChainStateError> {
        self.index
            .lock()
            .map_err(|_| ChainStateError::Fatal("block index lock poisoned".to_string()))
    }

    #[allow(clippy::type_complexity)]
    fn lock_all(
        &self,
    ) -> Result<(MutexGuard<'_, ChainInner<S>>, MutexGuard<'_, IndexState>), ChainStateError> {
        let chain = self.lock_chain()?;
        let index = self.lock_index()?;
        Ok((chain, index))
    }

    fn ensure_running(&self) -> Result<(), ChainStateError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(ChainStateError::Aborted);
        }
        Ok(())
    }

    /// Latches the abort flag on the first fatal error passing through.
    fn checked<T>(&self, result: Result<T, ChainStateError>) -> Result<T, ChainStateError> {
        if let Err(err) = &result {
            if err.is_fatal() && !matches!(err, ChainStateError::Aborted) {
                log_error!("*** {err}");
                log_error!("chain state aborted; restart to recover");
                self.aborted.store(true, Ordering::Release);
            }
        }
        result
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Overrides the clock used for the future-timestamp rule. `None`
    /// restores the system clock.
    pub fn set_mock_time(&self, time: Option<i64>) {
        self.mock_time.store(time.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn adjusted_time(&self) -> i64 {
        let mock = self.mock_time.load(Ordering::Relaxed);
        if mock != 0 {
            return mock;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> ConnectMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn load_block_index(&self) -> Result<usize, ChainStateError> {
        let (mut chain_guard, mut index_guard) = self.lock_all()?;
        let chain = &mut *chain_guard;
        let index = &mut *index_guard;

        let mut records = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::BlockIndex, &[])? {
            let record = BlockIndexRecord::decode(&value).map_err(|err| {
                let entry = <[u8; 32]>::try_from(key.as_slice())
                    .map(|hash| hash256_to_hex(&hash))
                    .unwrap_or_else(|_| format!("with {}-byte key", key.len()));
                ChainStateError::CorruptIndex(format!("entry {entry}: {err}"))
            })?;
            records.push(record);
        }
        records.sort_by_key(|record| record.height);
        let loaded = records.len();

        for record in records {
            let id = index
                .tree
                .insert(&record.header)
                .map_err(|err| ChainStateError::CorruptIndex(err.to_string()))?;
            let parent = index.tree.parent(id);
            let parent_chain_tx = parent.map(|parent| index.tree.node(parent).chain_tx);

            let node = index.tree.node_mut(id);
            if node.height != record.height {
                return Err(ChainStateError::CorruptIndex(format!(
                    "block {} stored at height {} but links at {}",
                    hash256_to_hex(&node.hash),
                    record.height,
                    node.height
                )));
            }
            node.status = record.status;
            node.tx_count = record.tx_count;
            node.block_pos = record.block_pos;
            node.undo_pos = record.undo_pos;
            if node.tx_count > 0 {
                match (parent, parent_chain_tx) {
                    (None, _) => node.chain_tx = u64::from(node.tx_count),
                    (Some(parent), Some(0)) => {
                        node.chain_tx = 0;
                        index.unlinked.entry(parent).or_default().push(id);
                    }
                    (Some(_), parent_tx) => {
                        node.chain_tx = parent_tx.unwrap_or(0) + u64::from(node.tx_count)
                    }
                }
            }

            let node = index.tree.node(id);
            if node.is_valid(BLOCK_VALID_TRANSACTIONS) && (node.chain_tx > 0 || parent.is_none()) {
                chain.candidates.insert(&index.tree, id);
            }
            if node.is_failed()
                && index
                    .best_invalid
                    .map_or(true, |best| node.chain_work > index.tree.work(best))
            {
                index.best_invalid = Some(id);
            }
            if !node.is_failed()
                && index
                    .best_header
                    .map_or(true, |best| node.chain_work > index.tree.work(best))
            {
                index.best_header = Some(id);
            }
        }

        let best_block = chain.coins.best_block()?;
        if best_block != [0u8; 32] {
            let tip = index.tree.lookup(&best_block).ok_or_else(|| {
                ChainStateError::CorruptIndex(format!(
                    "coin database best block {} is not in the block index",
                    hash256_to_hex(&best_block)
                ))
            })?;
            chain.active.set_tip(&index.tree, Some(tip));
            chain.candidates.insert(&index.tree, tip);
            chain.candidates.prune(&index.tree, tip);
        }

        if loaded > 0 {
            let tip = chain.active.tip().map(|tip| index.tree.node(tip));
            log_info!(
                "loaded block index: {} entries, tip {}",
                loaded,
                tip.map(|node| describe_block(&node.hash, node.height))
                    .unwrap_or_else(|| "none".to_string())
            );
        }
        Ok(loaded)
    }

    fn init_genesis(&self) -> Result<(), ChainStateError> {
        let genesis = genesis_block(&self.params.genesis);
        if genesis.hash() != self.params.consensus.hash_genesis_block {
            return Err(ChainStateError::Fatal(format!(
                "genesis block {} does not match the network parameters",
                hash256_to_hex(&genesis.hash())
            )));
        }
        log_info!("initializing block index with genesis {}", hash256_to_hex(&genesis.hash()));
        self.accept_block(&genesis)?;
        self.activate_best_chain(None)?;
        self.flush(FlushMode::Always)
    }

    /// Validates and indexes a header, returning its hash. Already known
    /// headers are accepted again unless they were marked invalid.
    pub fn accept_header(&self, header: &BlockHeader) -> Result<Hash256, ChainStateError> {
        self.ensure_running()?;
        let mut index = self.lock_index()?;
        let id = self.accept_header_locked(&mut index, header)?;
        Ok(index.tree.node(id).hash)
    }

    fn accept_header_locked(
        &self,
        index: &mut IndexState,
        header: &BlockHeader,
    ) -> Result<NodeId, ChainStateError> {
        let consensus = &self.params.consensus;
        let hash = header.hash();
        if let Some(id) = index.tree.lookup(&hash) {
            if index.tree.node(id).is_failed() {
                return Err(HeaderRejection::DuplicateInvalid.into());
            }
            return Ok(id);
        }

        check_block_header(header, consensus, true)?;
        if hash != consensus.hash_genesis_block {
            let prev = index
                .tree
                .lookup(&header.prev_block)
                .ok_or(HeaderRejection::PrevBlockNotFound)?;
            if index.tree.node(prev).is_failed() {
                return Err(HeaderRejection::PrevBlockInvalid.into());
            }
            contextual_check_header(header, prev, &index.tree, consensus, self.adjusted_time())?;
        }

        let id = index.tree.insert(header)?;
        index.dirty.insert(id);
        if index
            .best_header
            .map_or(true, |best| index.tree.work(id) > index.tree.work(best))
        {
            index.best_header = Some(id);
        }
        log_category!(
            Category::Validation,
            "accepted header {}",
            describe_block(&hash, index.tree.node(id).height)
        );
        Ok(id)
    }

    /// Checks a block, stores it in the block files and makes it a
    /// candidate tip once all its ancestors' data is present. Does not
    /// connect it.
    pub fn accept_block(&self, block: &Block) -> Result<Hash256, ChainStateError> {
        self.ensure_running()?;
        let result = self.accept_block_inner(block);
        self.checked(result)
    }

    fn accept_block_inner(&self, block: &Block) -> Result<Hash256, ChainStateError> {
        let (mut chain_guard, mut index_guard) = self.lock_all()?;
        let chain = &mut *chain_guard;
        let index = &mut *index_guard;
        let id = self.accept_block_locked(chain, index, block)?;
        self.flush_state(chain, index, FlushMode::IfNeeded)?;
        Ok(index.tree.node(id).hash)
    }

    fn accept_block_locked(
        &self,
        chain: &mut ChainInner<S>,
        index: &mut IndexState,
        block: &Block,
    ) -> Result<NodeId, ChainStateError> {
        let id = self.accept_header_locked(index, &block.header)?;
        if index.tree.node(id).has_data() {
            return Ok(id);
        }

        let consensus = &self.params.consensus;
        let height = index.tree.node(id).height;
        let mut checked = check_block(block, consensus, true, true);
        if checked.is_ok() {
            let prev = index.tree.parent(id);
            let cutoff = self.lock_time_cutoff(index, prev, block.header.time);
            checked = contextual_check_block(block, height, cutoff, consensus);
        }
        if let Err(err) = checked {
            if !err.corruption_possible {
                self.invalid_block_found(chain, index, id, &err);
            }
            return Err(err.into());
        }

        let location = self.blocks.append(&block.consensus_encode())?;
        index
            .files
            .record(FileKind::Blocks, location, height, block.header.time);
        self.received_block_transactions(chain, index, id, block.transactions.len() as u32, location);
        log_category!(
            Category::Validation,
            "stored block {} at file {} offset {}",
            describe_block(&index.tree.node(id).hash, height),
            location.file_id,
            location.offset
        );
        Ok(id)
    }

    /// Finality is judged against the parent's median time once BIP113 is
    /// active, otherwise against the block's own timestamp.
    fn lock_time_cutoff(&self, index: &mut IndexState, prev: Option<NodeId>, time: u32) -> i64 {
        match prev {
            Some(prev)
                if index.versionbits.state(
                    &index.tree,
                    Some(prev),
                    &self.params.consensus,
                    DeploymentPos::Csv,
                ) == ThresholdState::Active =>
            {
                index.tree.median_time_past(prev)
            }
            _ => i64::from(time),
        }
    }

    fn received_block_transactions(
        &self,
        chain: &mut ChainInner<S>,
        index: &mut IndexState,
        id: NodeId,
        tx_count: u32,
        location: FileLocation,
    ) {
        let node = index.tree.node_mut(id);
        node.tx_count = tx_count;
        node.chain_tx = 0;
        node.block_pos = Some(location);
        node.status |= BLOCK_HAVE_DATA;
        node.raise_validity(BLOCK_VALID_TRANSACTIONS);
        index.dirty.insert(id);

        let parent = index.tree.parent(id);
        if let Some(parent) = parent {
            if index.tree.node(parent).chain_tx == 0 {
                index.unlinked.entry(parent).or_default().push(id);
                return;
            }
        }

        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let parent_tx = index
                .tree
                .parent(current)
                .map_or(0, |parent| index.tree.node(parent).chain_tx);
            let sequence = index.next_sequence;
            index.next_sequence += 1;
            let node = index.tree.node_mut(current);
            node.chain_tx = parent_tx + u64::from(node.tx_count);
            node.sequence_id = sequence;

            let eligible = !index.tree.node(current).is_failed()
                && chain
                    .active
                    .tip()
                    .map_or(true, |tip| !better_than(&index.tree, tip, current));
            if eligible {
                chain.candidates.insert(&index.tree, current);
            }
            if let Some(children) = index.unlinked.remove(&current) {
                queue.extend(children);
            }
        }
    }

    /// Accepts `block` and moves the active chain to the best candidate.
    pub fn process_block(&self, block: &Block) -> Result<Hash256, ChainStateError> {
        let hash = self.accept_block(block)?;
        self.activate_best_chain(None)?;
        Ok(hash)
    }

    /// Best candidate whose ancestry back to the active chain is fully
    /// available and not known invalid. Candidates that fail that test are
    /// dropped along the way.
    fn find_most_work_chain(
        &self,
        chain: &mut ChainInner<S>,
        index: &mut IndexState,
    ) -> Option<NodeId> {
        loop {
            let candidate = chain.candidates.best()?;
            let mut invalid_ancestor = false;
            let mut test = Some(candidate);
            while let Some(current) = test {
                if chain.active.contains(&index.tree, current) {
                    break;
                }
                let node = index.tree.node(current);
                let failed = node.is_failed();
                let missing_data = !node.has_data();
                if failed || missing_data {
                    if failed
                        && index.best_invalid.map_or(true, |best| {
                            index.tree.work(candidate) > index.tree.work(best)
                        })
                    {
                        index.best_invalid = Some(candidate);
                    }
                    let mut walk = candidate;
                    while walk != current {
                        if failed {
                            index.tree.node_mut(walk).status |= BLOCK_FAILED_CHILD;
                            index.dirty.insert(walk);
                        } else if let Some(parent) = index.tree.parent(walk) {
                            let waiting = index.unlinked.entry(parent).or_default();
                            if !waiting.contains(&walk) {
                                waiting.push(walk);
                            }
                        }
                        chain.candidates.remove(walk);
                        match index.tree.parent(walk) {
                            Some(parent) => walk = parent,
                            None => break,
                        }
                    }
                    chain.candidates.remove(current);
                    invalid_ancestor = true;
                    break;
                }
                test = index.tree.parent(current);
            }
            if !invalid_ancestor {
                return Some(candidate);
            }
        }
    }

    /// Connects the most-work valid chain, a bounded batch of blocks per
    /// lock hold. Returns early without error once `interrupt` is set.
    pub fn activate_best_chain(
        &self,
        interrupt: Option<&AtomicBool>,
    ) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        let result = self.activate_best_chain_inner(interrupt);
        self.checked(result)
    }

    fn activate_best_chain_inner(
        &self,
        interrupt: Option<&AtomicBool>,
    ) -> Result<(), ChainStateError> {
        loop {
            if interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                log_info!("best chain activation interrupted");
                break;
            }
            let (mut chain_guard, mut index_guard) = self.lock_all()?;
            let chain = &mut *chain_guard;
            let index = &mut *index_guard;
            let Some(most_work) = self.find_most_work_chain(chain, index) else {
                break;
            };
            if chain.active.tip() == Some(most_work) {
                break;
            }
            self.activate_best_chain_step(chain, index, most_work)?;
        }

        let (mut chain, mut index) = self.lock_all()?;
        self.flush_state(&mut chain, &mut index, FlushMode::Periodic)
    }

    /// Disconnects back to the fork with `most_work`, then connects towards
    /// it until the tip gains work or a block proves invalid.
    fn activate_best_chain_step(
        &self,
        chain: &mut ChainInner<S>,
        index: &mut IndexState,
        most_work: NodeId,
    ) -> Result<(), ChainStateError> {
        let old_tip = chain.active.tip();
        let fork = chain.active.find_fork(&index.tree, most_work);

        while let Some(tip) = chain.active.tip() {
            if Some(tip) == fork {
                break;
            }
            if self.disconnect_tip_locked(chain, index)? == DisconnectResult::Failed {
                return Err(ChainStateError::Fatal(format!(
                    "failed to disconnect block {}",
                    hash256_to_hex(&index.tree.node(tip).hash)
                )));
            }
        }

        let target = index.tree.node(most_work).height;
        let batch = i32::try_from(self.config.max_connect_batch.max(1)).unwrap_or(i32::MAX);
        let mut height = fork.map_or(-1, |fork| index.tree.node(fork).height);
        'connect: while height < target {
            let batch_end = height.saturating_add(batch).min(target);
            let mut to_connect = Vec::new();
            let mut cursor = index.tree.ancestor(most_work, batch_end);
            while let Some(id) = cursor {
                if index.tree.node(id).height <= height {
                    break;
                }
                to_connect.push(id);
                cursor = index.tree.parent(id);
            }
            to_connect.reverse();
            height = batch_end;

            for id in to_connect {
                match self.connect_tip(chain, index, id) {
                    Ok(()) => {
                        chain.candidates.prune(&index.tree, id);
                        let gained = old_tip.map_or(true, |old| {
                            index.tree.work(id) > index.tree.work(old)
                        });
                        if gained {
                            break 'connect;
                        }
                    }
                    Err(ChainStateError::Validation(err)) => {
                        if err.corruption_possible {
                            return Err(ChainStateError::Validation(err));
                        }
                        self.invalid_block_found(chain, index, id, &err);
                        break 'connect;
                    }
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(())
    }

    fn connect_tip(
        &self,
        chain: &mut ChainInner<S>,
        index: &mut IndexState,
        id: NodeId,
    ) -> Result<(), ChainStateError> {
        let start = Instant::now();
        let block = self.read_block_at(&index.tree, id)?;
        let delta = {
            let mut view = CoinsCache::new(&mut chain.coins);
            let delta = self.connect_block_locked(index, &block, id, &mut view, false)?;
            view.flush()?;
            delta
        };
        chain.active.set_tip(&index.tree, Some(id));
        self.flush_state(chain, index, FlushMode::IfNeeded)?;

        let elapsed = start.elapsed();
        self.metrics.record_connect(elapsed, &delta);
        log_category!(
            Category::Bench,
            "connect {}: {:.2}ms (inputs {}us, {} script checks in {}us, undo {} bytes in {}us)",
            describe_block(&index.tree.node(id).hash, index.tree.node(id).height),
            elapsed.as_secs_f64() * 1000.0,
            delta.inputs_us,
            delta.script_checks,
            delta.script_us,
            delta.undo_bytes,
            delta.undo_us
        );
        self.update_tip(chain, index);
        Ok(())
    }

    /// Applies `block` to `view` under every consensus rule that needs the
    /// spent coins. `block` must already be indexed and `view` must sit at
    /// its parent. With `just_check` nothing is written and scripts are not
    /// run.
    pub fn connect_block<V: CoinView>(
        &self,
        block: &Block,
        view: &mut CoinsCache<V>,
        just_check: bool,
    ) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        let mut index = self.lock_index()?;
        let hash = block.hash();
        let id = index
            .tree
            .lookup(&hash)
            .ok_or(ChainStateError::UnknownBlock(hash))?;
        self.connect_block_locked(&mut index, block, id, view, just_check)
            .map(|_| ())
    }

    fn connect_block_locked<V: CoinView>(
        &self,
        index: &mut IndexState,
        block: &Block,
        id: NodeId,
        view: &mut CoinsCache<V>,
        just_check: bool,
    ) -> Result<ConnectMetricsDelta, ChainStateError> {
        let consensus = &self.params.consensus;
        let mut delta = ConnectMetricsDelta::default();
        check_block(block, consensus, !just_check, !just_check)?;

        let (hash, height, parent) = {
            let node = index.tree.node(id);
            (node.hash, node.height, node.parent)
        };
        let prev_hash = parent.map_or([0u8; 32], |parent| index.tree.node(parent).hash);
        let view_best = view.best_block()?;
        if view_best != prev_hash {
            return Err(ChainStateError::Fatal(format!(
                "coin view at {} cannot connect {} on parent {}",
                hash256_to_hex(&view_best),
                describe_block(&hash, height),
                hash256_to_hex(&prev_hash)
            )));
        }

        // Genesis outputs are never spendable.
        if hash == consensus.hash_genesis_block {
            if !just_check {
                view.set_best_block(hash);
            }
            return Ok(delta);
        }

        if enforce_bip30(&index.tree, id, consensus) {
            for tx in &block.transactions {
                let txid = tx.txid();
                for vout in 0..tx.vout.len() as u32 {
                    if view.have_coin(&OutPoint::new(txid, vout))? {
                        return Err(ValidationError::invalid(100, "bad-txns-BIP30").into());
                    }
                }
            }
        }

        let csv_active = index
            .versionbits
            .state(&index.tree, parent, consensus, DeploymentPos::Csv)
            == ThresholdState::Active;
        let lock_flags = if csv_active { LOCKTIME_VERIFY_SEQUENCE } else { 0 };
        let script_flags = block_script_flags(height, block.header.time, csv_active, consensus);
        let run_scripts = !just_check && self.config.check_scripts;

        let inputs_start = Instant::now();
        let mut fees: Amount = 0;
        let mut sigops = 0u32;
        let mut undo = BlockUndo {
            txs: Vec::with_capacity(block.transactions.len().saturating_sub(1)),
        };
        let mut jobs = Vec::new();
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            sigops += legacy_sigop_count(tx);
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(ValidationError::invalid(100, "bad-blk-sigops").into());
            }

            if !tx.is_coinbase() {
                let mut spent: Vec<Coin> = Vec::with_capacity(tx.vin.len());
                for input in &tx.vin {
                    match view.access_coin(&input.prevout)? {
                        Some(coin) => spent.push(coin),
                        None => {
                            return Err(ValidationError::invalid(
                                100,
                                "bad-txns-inputs-missingorspent",
                            )
                            .into())
                        }
                    }
                }

                let mut prev_heights: Vec<i32> =
                    spent.iter().map(|coin| coin.height as i32).collect();
                let locks =
                    calculate_sequence_locks(tx, lock_flags, &mut prev_heights, &index.tree, id);
                if !evaluate_sequence_locks(&index.tree, id, locks) {
                    return Err(ValidationError::invalid(100, "bad-txns-nonfinal").into());
                }

                if script_flags & SCRIPT_VERIFY_P2SH != 0 {
                    let spent_outs: Vec<TxOut> = spent.iter().map(|coin| coin.out.clone()).collect();
                    sigops += p2sh_sigops_for_tx(tx, &spent_outs);
                    if sigops > MAX_BLOCK_SIGOPS {
                        return Err(ValidationError::invalid(100, "bad-blk-sigops").into());
                    }
                }

                fees += check_tx_inputs(tx, &spent, height)?;
                if !money_range(fees) {
                    return Err(ValidationError::invalid(100, "bad-txns-fee-outofrange").into());
                }

                if run_scripts {
                    jobs.extend(spent.into_iter().enumerate().map(|(input_index, coin)| {
                        ScriptJob {
                            tx_index,
                            input_index,
                            prevout: coin.out,
                        }
                    }));
                }
            }

            let tx_undo = connect_tx(tx, view, height as u32)?;
            if !tx.is_coinbase() {
                undo.txs.push(tx_undo);
            }
        }
        delta.inputs_us = elapsed_us(inputs_start.elapsed());

        let reward = fees + block_subsidy(height, consensus);
        let coinbase_out: Amount = block.transactions[0].vout.iter().map(|out| out.value).sum();
        if coinbase_out > reward {
            log_category!(
                Category::Validation,
                "coinbase of {} pays too much (actual={} vs limit={})",
                describe_block(&hash, height),
                coinbase_out,
                reward
            );
            return Err(ValidationError::invalid(100, "bad-cb-amount").into());
        }

        if !jobs.is_empty() {
            let script_start = Instant::now();
            let precomputed: Vec<PrecomputedTxData> = block
                .transactions
                .iter()
                .map(PrecomputedTxData::new)
                .collect();
            let verifier = &self.verifier;
            let result = jobs.par_iter().try_for_each(|job| {
                let check = ScriptCheck {
                    script_pubkey: &job.prevout.script_pubkey,
                    amount: job.prevout.value,
                    tx: &block.transactions[job.tx_index],
                    input_index: job.input_index,
                    flags: script_flags,
                    precomputed: &precomputed[job.tx_index],
                };
                verifier
                    .verify(&check)
                    .map_err(|err| (job.tx_index, job.input_index, err))
            });
            delta.script_us = elapsed_us(script_start.elapsed());
            delta.script_checks = jobs.len() as u64;
            if let Err((tx_index, input_index, err)) = result {
                log_warn!(
                    "script validation failed for tx {} input {}: {}",
                    hash256_to_hex(&block.transactions[tx_index].txid()),
                    input_index,
                    err
                );
                return Err(script_rejection(&err).into());
            }
        }

        if just_check {
            return Ok(delta);
        }

        let needs_undo = {
            let node = index.tree.node(id);
            !node.has_undo() || !node.is_valid(BLOCK_VALID_SCRIPTS)
        };
        if needs_undo {
            let undo_start = Instant::now();
            let bytes = undo.encode_with_checksum(&prev_hash);
            let location = self.undo.append(&bytes)?;
            index
                .files
                .record(FileKind::Undo, location, height, block.header.time);
            let node = index.tree.node_mut(id);
            node.undo_pos = Some(location);
            node.status |= BLOCK_HAVE_UNDO;
            index.dirty.insert(id);
            delta.undo_us = elapsed_us(undo_start.elapsed());
            delta.undo_bytes = bytes.len() as u64;
        }
        if index.tree.node_mut(id).raise_validity(BLOCK_VALID_SCRIPTS) {
            index.dirty.insert(id);
        }
        view.set_best_block(hash);
        Ok(delta)
    }

    /// Rolls the active tip back onto its parent.
    pub fn disconnect_tip(&self) -> Result<DisconnectResult, ChainStateError> {
        self.ensure_running()?;
        let result = self.disconnect_tip_inner();
        self.checked(result)
    }

    fn disconnect_tip_inner(&self) -> Result<DisconnectResult, ChainStateError> {
        let (mut chain_guard, mut index_guard) = self.lock_all()?;
        let chain = &mut *chain_guard;
        let index = &mut *index_guard;
        let tip = chain
            .active
            .tip()
            .ok_or(ChainStateError::InvalidRequest("no active tip"))?;
        if index.tree.parent(tip).is_none() {
            return Err(ChainStateError::InvalidRequest(
                "cannot disconnect the genesis block",
            ));
        }
        self.disconnect_tip_locked(chain, index)
    }

    fn disconnect_tip_locked(
        &self,
        chain: &mut ChainInner<S>,
        index: &mut IndexState,
    ) -> Result<DisconnectResult, ChainStateError> {
        let start = Instant::now();
        let tip = chain
            .active
            .tip()
            .ok_or_else(|| ChainStateError::Fatal("disconnect without an active tip".to_string()))?;
        let (hash, height, parent) = {
            let node = index.tree.node(tip);
            (node.hash, node.height, node.parent)
        };
        let block = self.read_block_at(&index.tree, tip)?;
        let undo = self.read_undo_at(&index.tree, tip)?;

        let result = {
            let mut view = CoinsCache::new(&mut chain.coins);
            let result = disconnect_block(&block, &undo, height as u32, &mut view)?;
            if result != DisconnectResult::Failed {
                view.flush()?;
            }
            result
        };
        match result {
            DisconnectResult::Failed => {
                log_error!("failed to disconnect block {}", describe_block(&hash, height));
                return Ok(result);
            }
            DisconnectResult::Unclean => log_warn!(
                "block {} disconnected with an inconsistent coin set",
                describe_block(&hash, height)
            ),
            DisconnectResult::Clean => {}
        }

        chain.active.set_tip(&index.tree, parent);
        self.flush_state(chain, index, FlushMode::IfNeeded)?;
        self.metrics.record_disconnect(start.elapsed());
        self.update_tip(chain, index);
        Ok(result)
    }

    /// Marks `hash` invalid and rolls the active chain back below it.
    /// Call `activate_best_chain` afterwards to settle on the next best tip.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        let result = self.invalidate_block_inner(hash);
        self.checked(result)
    }

    fn invalidate_block_inner(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        let (mut chain_guard, mut index_guard) = self.lock_all()?;
        let chain = &mut *chain_guard;
        let index = &mut *index_guard;
        let id = index
            .tree
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        if index.tree.parent(id).is_none() {
            return Err(ChainStateError::InvalidRequest(
                "cannot invalidate the genesis block",
            ));
        }

        index.tree.node_mut(id).status |= BLOCK_FAILED_VALID;
        index.dirty.insert(id);
        chain.candidates.remove(id);

        while chain.active.contains(&index.tree, id) {
            let Some(tip) = chain.active.tip() else {
                break;
            };
            if tip != id {
                index.tree.node_mut(tip).status |= BLOCK_FAILED_CHILD;
                index.dirty.insert(tip);
            }
            chain.candidates.remove(tip);
            if self.disconnect_tip_locked(chain, index)? == DisconnectResult::Failed {
                return Err(ChainStateError::Fatal(format!(
                    "failed to disconnect block {}",
                    hash256_to_hex(&index.tree.node(tip).hash)
                )));
            }
        }
        self.mark_descendants_failed(chain, index, id);

        // The new tip may have been pruned from the candidates while a
        // better chain was active.
        let tip = chain.active.tip();
        let ids: Vec<NodeId> = index.tree.ids().collect();
        for other in ids {
            let node = index.tree.node(other);
            if node.is_valid(BLOCK_VALID_TRANSACTIONS)
                && node.chain_tx > 0
                && tip.map_or(true, |tip| !better_than(&index.tree, tip, other))
            {
                chain.candidates.insert(&index.tree, other);
            }
        }

        self.invalid_chain_found(chain, index, id);
        Ok(())
    }

    /// Clears the failure flags of `hash`, its descendants and ancestors.
    /// Call `activate_best_chain` afterwards to reconnect.
    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        let (mut chain_guard, mut index_guard) = self.lock_all()?;
        let chain = &mut *chain_guard;
        let index = &mut *index_guard;
        let id = index
            .tree
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        let height = index.tree.node(id).height;
        let tip = chain.active.tip();

        let ids: Vec<NodeId> = index.tree.ids().collect();
        for other in ids {
            if !index.tree.node(other).is_failed() || index.tree.ancestor(other, height) != Some(id)
            {
                continue;
            }
            index.tree.node_mut(other).status &= !BLOCK_FAILED_MASK;
            index.dirty.insert(other);
            let node = index.tree.node(other);
            if node.is_valid(BLOCK_VALID_TRANSACTIONS)
                && node.chain_tx > 0
                && tip.map_or(true, |tip| better_than(&index.tree, other, tip))
            {
                chain.candidates.insert(&index.tree, other);
            }
            if index.best_invalid == Some(other) {
                index.best_invalid = None;
            }
        }

        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = index.tree.node_mut(current);
            if node.status & BLOCK_FAILED_MASK != 0 {
                node.status &= !BLOCK_FAILED_MASK;
                index.dirty.insert(current);
            }
            cursor = index.tree.parent(current);
        }
        log_info!("reconsidering block {}", describe_block(hash, height));
        Ok(())
    }

    fn invalid_block_found(
        &self,
        chain: &mut ChainInner<S>,
        index: &mut IndexState,
        id: NodeId,
        err: &ValidationError,
    ) {
        let node = index.tree.node_mut(id);
        node.status |= BLOCK_FAILED_VALID;
        log_warn!(
            "invalid block {}: {err}",
            describe_block(&node.hash, node.height)
        );
        index.dirty.insert(id);
        chain.candidates.remove(id);
        self.mark_descendants_failed(chain, index, id);
        self.invalid_chain_found(chain, index, id);
    }

    fn mark_descendants_failed(&self, chain: &mut ChainInner<S>, index: &mut IndexState, id: NodeId) {
        let ids: Vec<NodeId> = index.tree.ids().collect();
        for other in ids {
            if other == id || !index.tree.is_ancestor(id, other) {
                continue;
            }
            let node = index.tree.node_mut(other);
            if node.status & BLOCK_FAILED_CHILD == 0 {
                node.status |= BLOCK_FAILED_CHILD;
                index.dirty.insert(other);
            }
            chain.candidates.remove(other);
        }
    }

    fn invalid_chain_found(&self, chain: &ChainInner<S>, index: &mut IndexState, id: NodeId) {
        if index
            .best_invalid
            .map_or(true, |best| index.tree.work(id) > index.tree.work(best))
        {
            index.best_invalid = Some(id);
        }
        let node = index.tree.node(id);
        log_warn!(
            "invalid chain found: block={} height={} log2_work={:.6} time={}",
            hash256_to_hex(&node.hash),
            node.height,
            log2_work(&node.chain_work),
            node.header.time
        );
        if let Some(tip) = chain.active.tip() {
            let tip = index.tree.node(tip);
            log_warn!(
                "current best: block={} height={} log2_work={:.6} time={}",
                hash256_to_hex(&tip.hash),
                tip.height,
                log2_work(&tip.chain_work),
                tip.header.time
            );
        }
    }

    fn update_tip(&self, chain: &ChainInner<S>, index: &mut IndexState) {
        let Some(tip) = chain.active.tip() else {
            return;
        };
        let node = index.tree.node(tip);
        log_info!(
            "UpdateTip: new best={} height={} version={:#010x} log2_work={:.8} tx={} time={} cache={:.1}MiB({}txo)",
            hash256_to_hex(&node.hash),
            node.height,
            node.header.version,
            log2_work(&node.chain_work),
            node.chain_tx,
            node.header.time,
            chain.coins.dynamic_usage() as f64 / (1024.0 * 1024.0),
            chain.coins.len()
        );

        let unexpected = index.versionbits.unknown_version_count(
            &index.tree,
            Some(tip),
            &self.params.consensus,
        );
        if unexpected > UNKNOWN_VERSION_WINDOW / 2 {
            log_warn!(
                "{} of the last {} blocks have an unexpected version",
                unexpected,
                UNKNOWN_VERSION_WINDOW
            );
        }
    }

    /// Writes dirty index entries and file statistics, then the coin cache.
    pub fn flush(&self, mode: FlushMode) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        let result = self.lock_all().and_then(|(mut chain, mut index)| {
            self.flush_state(&mut chain, &mut index, mode)
        });
        self.checked(result)
    }

    fn flush_state(
        &self,
        chain: &mut ChainInner<S>,
        index: &mut IndexState,
        mode: FlushMode,
    ) -> Result<(), ChainStateError> {
        let cache_bytes = chain.coins.dynamic_usage();
        let cache_full = cache_bytes > self.config.coins_cache_bytes;
        let interval_due =
            chain.last_write.elapsed() >= Duration::from_secs(self.config.flush_interval_secs);
        let write = match mode {
            FlushMode::Always => true,
            FlushMode::IfNeeded => cache_full,
            FlushMode::Periodic => cache_full || interval_due,
        };
        if !write {
            return Ok(());
        }

        let start = Instant::now();
        self.blocks.sync()?;
        self.undo.sync()?;

        let mut dirty: Vec<NodeId> = index.dirty.iter().copied().collect();
        dirty.sort_unstable();
        let mut batch = WriteBatch::new();
        batch.reserve(dirty.len() + 4);
        index.files.write_dirty(&mut batch);
        for id in &dirty {
            let node = index.tree.node(*id);
            batch.put(Column::BlockIndex, node.hash, node.to_record().encode());
        }
        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }
        index.dirty.clear();

        let coins = chain.coins.len();
        chain.coins.flush()?;
        chain.last_write = Instant::now();
        self.metrics.record_flush(start.elapsed());
        log_category!(
            Category::CoinDb,
            "flushed {} index entries and {} coins ({:.1}MiB) in {}ms",
            dirty.len(),
            coins,
            cache_bytes as f64 / (1024.0 * 1024.0),
            start.elapsed().as_millis()
        );
        Ok(())
    }

    /// Runs `verify_db` with the configured level and depth.
    pub fn verify_on_startup(&self, interrupt: &AtomicBool) -> Result<VerifyReport, ChainStateError> {
        self.verify_db(self.config.check_level, self.config.check_blocks, interrupt)
    }

    /// Re-checks the last `check_blocks` active blocks (all of them when 0)
    /// against their stored data. Levels build on each other: 0 reads the
    /// blocks, 1 re-runs context-free checks, 2 reads undo data, 3
    /// disconnects into a scratch cache and 4 reconnects on top of it.
    /// Nothing reaches the store.
    pub fn verify_db(
        &self,
        check_level: u32,
        check_blocks: u32,
        interrupt: &AtomicBool,
    ) -> Result<VerifyReport, ChainStateError> {
        self.ensure_running()?;
        let (mut chain_guard, mut index_guard) = self.lock_all()?;
        let chain = &mut *chain_guard;
        let index = &mut *index_guard;
        let consensus = &self.params.consensus;

        let mut report = VerifyReport::default();
        let Some(tip) = chain.active.tip() else {
            return Ok(report);
        };
        if index.tree.parent(tip).is_none() {
            return Ok(report);
        }
        let level = check_level.min(MAX_CHECK_LEVEL);
        let tip_height = chain.active.height();
        let depth = match i32::try_from(check_blocks) {
            Ok(depth) if depth > 0 && depth <= tip_height => depth,
            _ => tip_height,
        };
        log_info!("verifying last {depth} blocks at level {level}");

        let cache_limit = self.config.coins_cache_bytes;
        let mut view = CoinsCache::new(&mut chain.coins);
        let mut state_node = tip;
        let mut failure: Option<NodeId> = None;
        let mut good_transactions = 0u64;
        let mut cursor = tip;
        while let Some(parent) = index.tree.parent(cursor) {
            if interrupt.load(Ordering::Relaxed) {
                report.interrupted = true;
                return Ok(report);
            }
            let height = index.tree.node(cursor).height;
            if height <= tip_height - depth {
                break;
            }

            let block = self.read_block_at(&index.tree, cursor).map_err(|err| {
                ChainStateError::VerifyFailed(format!("block at height {height} unreadable: {err}"))
            })?;
            if level >= 1 {
                check_block(&block, consensus, true, true).map_err(|err| {
                    ChainStateError::VerifyFailed(format!("bad block at height {height}: {err}"))
                })?;
            }
            if level >= 2 {
                let undo = self.read_undo_at(&index.tree, cursor).map_err(|err| {
                    ChainStateError::VerifyFailed(format!(
                        "undo data at height {height} unreadable: {err}"
                    ))
                })?;
                let within_budget =
                    view.dynamic_usage() + view.base().dynamic_usage() <= cache_limit;
                if level >= 3 && cursor == state_node && within_budget {
                    match disconnect_block(&block, &undo, height as u32, &mut view)? {
                        DisconnectResult::Failed => {
                            return Err(ChainStateError::VerifyFailed(format!(
                                "irrecoverable inconsistency in block data at height {height}"
                            )))
                        }
                        DisconnectResult::Unclean => {
                            good_transactions = 0;
                            failure = Some(cursor);
                        }
                        DisconnectResult::Clean => {
                            good_transactions += block.transactions.len() as u64;
                        }
                    }
                    state_node = parent;
                    report.disconnected += 1;
                }
            }
            report.checked += 1;
            cursor = parent;
        }

        if let Some(failed) = failure {
            return Err(ChainStateError::VerifyFailed(format!(
                "coin database inconsistencies found (last {} blocks, {} good transactions before that)",
                tip_height - index.tree.node(failed).height + 1,
                good_transactions
            )));
        }
        report.good_transactions = good_transactions;

        if level >= 4 {
            let mut cursor = state_node;
            while cursor != tip {
                if interrupt.load(Ordering::Relaxed) {
                    report.interrupted = true;
                    return Ok(report);
                }
                let Some(next) = chain.active.next(&index.tree, cursor) else {
                    break;
                };
                let height = index.tree.node(next).height;
                let block = self.read_block_at(&index.tree, next).map_err(|err| {
                    ChainStateError::VerifyFailed(format!(
                        "block at height {height} unreadable: {err}"
                    ))
                })?;
                self.connect_block_locked(index, &block, next, &mut view, false)
                    .map_err(|err| {
                        ChainStateError::VerifyFailed(format!(
                            "found unconnectable block at height {height}: {err}"
                        ))
                    })?;
                report.reconnected += 1;
                cursor = next;
            }
        }

        log_info!(
            "no coin database inconsistencies in last {} blocks ({} transactions)",
            report.checked,
            good_transactions
        );
        Ok(report)
    }

    fn read_block_at(&self, tree: &BlockTree, id: NodeId) -> Result<Block, ChainStateError> {
        let node = tree.node(id);
        let location = node.block_pos.filter(|_| node.has_data()).ok_or_else(|| {
            ChainStateError::CorruptIndex(format!(
                "no block data for {}",
                describe_block(&node.hash, node.height)
            ))
        })?;
        let bytes = self.blocks.read(location)?;
        let block = Block::consensus_decode(&bytes).map_err(|err| {
            ChainStateError::CorruptIndex(format!(
                "block {} unreadable: {err}",
                describe_block(&node.hash, node.height)
            ))
        })?;
        if block.hash() != node.hash {
            return Err(ChainStateError::CorruptIndex(format!(
                "block data at file {} offset {} does not hash to {}",
                location.file_id,
                location.offset,
                hash256_to_hex(&node.hash)
            )));
        }
        Ok(block)
    }

    fn read_undo_at(&self, tree: &BlockTree, id: NodeId) -> Result<BlockUndo, ChainStateError> {
        let node = tree.node(id);
        let location = node.undo_pos.filter(|_| node.has_undo()).ok_or_else(|| {
            ChainStateError::CorruptIndex(format!(
                "no undo data for {}",
                describe_block(&node.hash, node.height)
            ))
        })?;
        let prev_hash = node
            .parent
            .map_or([0u8; 32], |parent| tree.node(parent).hash);
        let bytes = self.undo.read(location)?;
        BlockUndo::decode_with_checksum(&bytes, &prev_hash).map_err(|err| {
            ChainStateError::CorruptIndex(format!(
                "undo data for {} unreadable: {err}",
                describe_block(&node.hash, node.height)
            ))
        })
    }

    pub fn tip(&self) -> Result<Option<ChainTip>, ChainStateError> {
        let (chain, index) = self.lock_all()?;
        Ok(chain.active.tip().map(|tip| ChainTip::of(index.tree.node(tip))))
    }

    /// Height of the active tip, -1 when there is none.
    pub fn height(&self) -> Result<i32, ChainStateError> {
        Ok(self.lock_chain()?.active.height())
    }

    pub fn best_header(&self) -> Result<Option<ChainTip>, ChainStateError> {
        let index = self.lock_index()?;
        Ok(index.best_header.map(|id| ChainTip::of(index.tree.node(id))))
    }

    pub fn best_invalid(&self) -> Result<Option<Hash256>, ChainStateError> {
        let index = self.lock_index()?;
        Ok(index.best_invalid.map(|id| index.tree.node(id).hash))
    }

    pub fn block_index(&self, hash: &Hash256) -> Result<Option<BlockIndexNode>, ChainStateError> {
        let index = self.lock_index()?;
        Ok(index.tree.lookup(hash).map(|id| index.tree.node(id).clone()))
    }

    pub fn header_count(&self) -> Result<usize, ChainStateError> {
        Ok(self.lock_index()?.tree.len())
    }

    pub fn active_hash_at(&self, height: i32) -> Result<Option<Hash256>, ChainStateError> {
        let (chain, index) = self.lock_all()?;
        Ok(chain.active.at(height).map(|id| index.tree.node(id).hash))
    }

    pub fn is_on_active_chain(&self, hash: &Hash256) -> Result<bool, ChainStateError> {
        let (chain, index) = self.lock_all()?;
        Ok(index
            .tree
            .lookup(hash)
            .is_some_and(|id| chain.active.contains(&index.tree, id)))
    }

    /// Tip hashes that could still become the active tip, best first.
    pub fn candidate_tips(&self) -> Result<Vec<Hash256>, ChainStateError> {
        let (chain, index) = self.lock_all()?;
        Ok(chain
            .candidates
            .iter()
            .map(|id| index.tree.node(id).hash)
            .collect())
    }

    /// Block locator from `from`, or from the active tip.
    pub fn locator(&self, from: Option<&Hash256>) -> Result<Vec<Hash256>, ChainStateError> {
        let (chain, index) = self.lock_all()?;
        let start = match from {
            Some(hash) => index
                .tree
                .lookup(hash)
                .ok_or(ChainStateError::UnknownBlock(*hash))?,
            None => match chain.active.tip() {
                Some(tip) => tip,
                None => return Ok(Vec::new()),
            },
        };
        Ok(chain.active.locator(&index.tree, start))
    }

    pub fn median_time_past(&self, hash: &Hash256) -> Result<Option<i64>, ChainStateError> {
        let index = self.lock_index()?;
        Ok(index
            .tree
            .lookup(hash)
            .map(|id| index.tree.median_time_past(id)))
    }

    /// Unspent coin at `outpoint` as seen by the active tip.
    pub fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainStateError> {
        let mut chain = self.lock_chain()?;
        Ok(chain.coins.access_coin(outpoint)?)
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let index = self.lock_index()?;
        match index.tree.lookup(hash) {
            Some(id) if index.tree.node(id).has_data() => {
                self.read_block_at(&index.tree, id).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Deployment state for the block after the active tip.
    pub fn deployment_state(&self, pos: DeploymentPos) -> Result<ThresholdState, ChainStateError> {
        let (chain, mut index) = self.lock_all()?;
        let index = &mut *index;
        Ok(index
            .versionbits
            .state(&index.tree, chain.active.tip(), &self.params.consensus, pos))
    }

    pub fn deployment_since_height(&self, pos: DeploymentPos) -> Result<i32, ChainStateError> {
        let (chain, mut index) = self.lock_all()?;
        let index = &mut *index;
        Ok(index.versionbits.state_since_height(
            &index.tree,
            chain.active.tip(),
            &self.params.consensus,
            pos,
        ))
    }

    pub fn deployment_statistics(
        &self,
        pos: DeploymentPos,
    ) -> Result<Option<BitsStatistics>, ChainStateError> {
        let (chain, index) = self.lock_all()?;
        Ok(chain
            .active
            .tip()
            .map(|tip| statistics(&index.tree, Some(tip), &self.params.consensus, pos)))
    }

    /// Version a block built on the active tip should carry.
    pub fn compute_block_version(&self) -> Result<i32, ChainStateError> {
        let (chain, mut index) = self.lock_all()?;
        let index = &mut *index;
        Ok(index.versionbits.compute_block_version(
            &index.tree,
            chain.active.tip(),
            &self.params.consensus,
        ))
    }

    pub fn set_reindexing(&self, reindexing: bool) -> Result<(), ChainStateError> {
        if reindexing {
            self.store.put(Column::Meta, META_REINDEXING_KEY, &[1])?;
        } else {
            self.store.delete(Column::Meta, META_REINDEXING_KEY)?;
        }
        log_category!(Category::Reindex, "reindexing flag set to {reindexing}");
        Ok(())
    }

    pub fn is_reindexing(&self) -> Result<bool, ChainStateError> {
        Ok(self.store.contains(Column::Meta, META_REINDEXING_KEY)?)
    }
}

/// log2 of the cumulative work, for logging.
pub fn log2_work(work: &U256) -> f64 {
    let bits = work.bits();
    if bits == 0 {
        return 0.0;
    }
    let shift = bits.saturating_sub(64);
    let top = (*work >> shift).low_u64() as f64;
    top.log2() + shift as f64
}
