//! Chain state: the in-memory block-index DAG, the active best chain and
//! its cumulative work, orphan blocks, difficulty retargeting, and the
//! connect/disconnect/reorganize protocol over the persistent store.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::checkpoints::{CheckpointMode, CheckpointState};
use crate::constants::*;
use crate::economic::proof_of_work_reward;
use crate::error::{ChainError, NodeError, Rejection};
use crate::mempool::Mempool;
use crate::params::{hardened_checkpoints, ChainParams};
use crate::pow::{block_work, check_proof_of_work, compress_target, expand_target, U256};
use crate::script;
use crate::serialize::compact_size_len;
use crate::store::{BlockStore, DiskBlockIndex, DiskTxPos, StoreBatch, TxIndexEntry};
use crate::types::{short_hash, Block, BlockHeader, Hash, Transaction, ZERO_HASH};

/// Grandfathered duplicate-coinbase blocks exempt from the no-overwrite
/// rule.
const OVERWRITE_EXCEPTIONS: [(i32, &str); 2] = [
    (91842, "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
    (91880, "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
];

/// In-flight tx-index changes layered over the persistent store. `None`
/// marks an erased entry.
pub type TxIndexOverlay = HashMap<Hash, Option<TxIndexEntry>>;

/// A resolved previous transaction with its index entry.
#[derive(Debug, Clone)]
pub struct PrevTx {
    pub entry: TxIndexEntry,
    pub tx: Transaction,
}

/// Result of input resolution.
pub enum FetchedInputs {
    Complete(HashMap<Hash, PrevTx>),
    /// Some previous transactions are unknown; the transaction may be
    /// held as an orphan.
    Missing,
}

/// Where and at what height a spend is being evaluated.
pub struct SpendContext {
    pub height: i32,
    /// Deepest indexed block to walk maturity checks from.
    pub walk_from: Option<Hash>,
    pub in_block: bool,
    pub for_miner: bool,
    pub strict_p2sh: bool,
}

/// Position context for connecting a block.
pub struct ConnectCtx {
    pub id: Option<Hash>,
    pub height: i32,
    pub time: u32,
    pub file: u32,
    pub block_pos: u32,
}

/// Node of the block-index DAG. Parent and best-chain child are keys into
/// the arena, never owning references.
#[derive(Debug, Clone)]
pub struct BlockIndexNode {
    pub id: Hash,
    pub version: i32,
    pub prev: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: i32,
    pub file: u32,
    pub block_pos: u32,
    /// Best-chain child, `None` off the best chain or at the tip.
    pub next: Option<Hash>,
    pub chain_work: U256,
}

impl BlockIndexNode {
    pub fn header(&self, prev: Hash) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: prev,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    fn to_disk(&self) -> DiskBlockIndex {
        DiskBlockIndex {
            version: self.version,
            prev: self.prev,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
            height: self.height,
            file: self.file,
            block_pos: self.block_pos,
            next: self.next.unwrap_or(ZERO_HASH),
        }
    }
}

/// A block admitted by AcceptBlock.
#[derive(Debug, Clone, Copy)]
pub struct AcceptedBlock {
    pub id: Hash,
    pub height: i32,
    pub became_tip: bool,
}

/// Outcome of the gossip ingress.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The block (and possibly queued orphans) connected; relay the listed
    /// ids to peers.
    Accepted { relay: Vec<Hash> },
    /// Parent unknown; held in the orphan pool. The caller should request
    /// the ancestor chain toward `root` and `missing_parent` directly.
    Orphan { root: Hash, missing_parent: Hash },
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> Result<(), Rejection> {
    if tx.inputs.is_empty() {
        return Err(Rejection::dos(10, "transaction with no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(Rejection::dos(10, "transaction with no outputs"));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE {
        return Err(Rejection::dos(100, "transaction over size limit"));
    }

    let mut value_out: i64 = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(Rejection::dos(100, "negative output value"));
        }
        if output.value > MAX_MONEY {
            return Err(Rejection::dos(100, "output value over the money limit"));
        }
        value_out += output.value;
        if !(0..=MAX_MONEY).contains(&value_out) {
            return Err(Rejection::dos(100, "output total out of range"));
        }
    }

    let mut seen = std::collections::HashSet::new();
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(Rejection::benign("duplicate input outpoint"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(Rejection::dos(100, "coinbase script size"));
        }
    } else {
        for input in &tx.inputs {
            if input.prevout.is_null() {
                return Err(Rejection::dos(10, "null previous outpoint"));
            }
        }
    }

    Ok(())
}

/// Legacy signature-operation count over all scripts of a transaction.
pub fn legacy_sigops(tx: &Transaction) -> usize {
    let inputs: usize = tx.inputs.iter().map(|i| script::sigop_count(&i.script_sig, false)).sum();
    let outputs: usize =
        tx.outputs.iter().map(|o| script::sigop_count(&o.script_pubkey, false)).sum();
    inputs + outputs
}

/// The chain-state singleton: exclusive owner of the block index and the
/// orphan pools, gatekeeper of the store.
pub struct ChainState {
    pub params: ChainParams,
    pub store: BlockStore,
    pub checkpoints: CheckpointState,

    index: HashMap<Hash, BlockIndexNode>,
    best: Option<Hash>,
    best_work: U256,
    best_invalid_work: U256,
    genesis: Option<Hash>,

    orphan_blocks: HashMap<Hash, Block>,
    orphans_by_prev: HashMap<Hash, Vec<Hash>>,

    time_offsets: Vec<i64>,
    mock_time: Option<i64>,

    ibd_last_best: Option<Hash>,
    ibd_last_update: i64,
    /// Exposed as configuration: both heuristics are timing-sensitive.
    pub ibd_update_window: i64,
    pub ibd_tip_age: i64,
}

impl ChainState {
    /// Open the chain over a store, loading the persisted index or
    /// bootstrapping the genesis block into an empty one.
    pub fn open(params: ChainParams, store: BlockStore, mode: CheckpointMode) -> Result<Self, ChainError> {
        let checkpoints =
            CheckpointState::new(mode, hardened_checkpoints(params.network));
        let mut chain = ChainState {
            params,
            store,
            checkpoints,
            index: HashMap::new(),
            best: None,
            best_work: U256::ZERO,
            best_invalid_work: U256::ZERO,
            genesis: None,
            orphan_blocks: HashMap::new(),
            orphans_by_prev: HashMap::new(),
            time_offsets: vec![0],
            mock_time: None,
            ibd_last_best: None,
            ibd_last_update: 0,
            ibd_update_window: 10,
            ibd_tip_age: 4 * 60 * 60,
        };
        chain.load()?;
        if chain.index.is_empty() {
            chain.bootstrap_genesis()?;
        }
        chain.verify_checkpoint_key()?;
        Ok(chain)
    }

    fn load(&mut self) -> Result<(), ChainError> {
        let mut entries = self.store.load_block_index()?;
        entries.sort_by_key(|(_, e)| e.height);

        for (id, e) in entries {
            let parent_work = if e.prev == ZERO_HASH {
                U256::ZERO
            } else {
                match self.index.get(&e.prev) {
                    Some(p) => p.chain_work,
                    None => {
                        return Err(NodeError::Corruption(format!(
                            "block index entry {} has unknown parent",
                            short_hash(&id)
                        ))
                        .into())
                    }
                }
            };
            let node = BlockIndexNode {
                id,
                version: e.version,
                prev: e.prev,
                merkle_root: e.merkle_root,
                time: e.time,
                bits: e.bits,
                nonce: e.nonce,
                height: e.height,
                file: e.file,
                block_pos: e.block_pos,
                next: if e.next == ZERO_HASH { None } else { Some(e.next) },
                chain_work: parent_work.saturating_add(&block_work(e.bits)),
            };
            if node.prev == ZERO_HASH {
                self.genesis = Some(id);
            }
            self.index.insert(id, node);
        }

        if let Some(best) = self.store.best_chain()? {
            let work = self
                .index
                .get(&best)
                .ok_or_else(|| NodeError::Corruption("best chain hash not in index".into()))?
                .chain_work;
            self.best = Some(best);
            self.best_work = work;
        }
        self.best_invalid_work = self.store.best_invalid_work()?;
        self.checkpoints.sync_checkpoint = self.store.sync_checkpoint()?;
        Ok(())
    }

    fn bootstrap_genesis(&mut self) -> Result<(), ChainError> {
        let genesis = self.params.genesis.clone();
        let id = self.params.genesis_hash;
        info!(block = %short_hash(&id), "writing genesis block");

        let (file, block_pos) = self.store.append_block(&genesis, true)?;
        let node = BlockIndexNode {
            id,
            version: genesis.header.version,
            prev: ZERO_HASH,
            merkle_root: genesis.header.merkle_root,
            time: genesis.header.time,
            bits: genesis.header.bits,
            nonce: genesis.header.nonce,
            height: 0,
            file,
            block_pos,
            next: None,
            chain_work: block_work(genesis.header.bits),
        };
        let mut batch = self.store.batch();
        batch.set_block_index(&id, &node.to_disk());
        batch.set_best_chain(&id);
        self.store.commit(batch)?;

        self.best = Some(id);
        self.best_work = node.chain_work;
        self.genesis = Some(id);
        self.index.insert(id, node);

        self.store.set_sync_checkpoint(&id)?;
        self.checkpoints.sync_checkpoint = Some(id);
        Ok(())
    }

    /// Reset sync checkpointing when the configured master key changed.
    fn verify_checkpoint_key(&mut self) -> Result<(), ChainError> {
        let configured = self.params.checkpoint_master_key.clone();
        match self.store.checkpoint_pubkey()? {
            Some(stored) if stored == configured => {}
            _ => {
                self.store.set_checkpoint_pubkey(&configured)?;
                if let Some(genesis) = self.genesis {
                    self.store.set_sync_checkpoint(&genesis)?;
                    self.checkpoints.sync_checkpoint = Some(genesis);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // time

    pub fn set_mock_time(&mut self, time: i64) {
        self.mock_time = Some(time);
    }

    /// Record a peer's clock offset; offsets beyond 70 minutes are
    /// ignored.
    pub fn add_time_sample(&mut self, offset: i64) {
        if offset.abs() < 70 * 60 {
            self.time_offsets.push(offset);
            if self.time_offsets.len() > 200 {
                self.time_offsets.remove(0);
            }
        }
    }

    fn system_time(&self) -> i64 {
        if let Some(mock) = self.mock_time {
            return mock;
        }
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    /// Network-adjusted time: local clock plus the median peer offset.
    pub fn adjusted_time(&self) -> i64 {
        let mut offsets = self.time_offsets.clone();
        offsets.sort_unstable();
        self.system_time() + offsets[offsets.len() / 2]
    }

    // ------------------------------------------------------------------
    // index accessors

    pub fn get(&self, id: &Hash) -> Option<&BlockIndexNode> {
        self.index.get(id)
    }

    pub fn best_hash(&self) -> Option<Hash> {
        self.best
    }

    pub fn best_work(&self) -> U256 {
        self.best_work
    }

    pub fn genesis_hash(&self) -> Option<Hash> {
        self.genesis
    }

    pub fn tip(&self) -> Option<&BlockIndexNode> {
        self.best.and_then(|id| self.index.get(&id))
    }

    pub fn height(&self) -> i32 {
        self.tip().map(|n| n.height).unwrap_or(-1)
    }

    pub fn contains_block(&self, id: &Hash) -> bool {
        self.index.contains_key(id)
    }

    pub fn has_orphan(&self, id: &Hash) -> bool {
        self.orphan_blocks.contains_key(id)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphan_blocks.len()
    }

    pub fn main_chain_contains(&self, id: &Hash) -> bool {
        match self.index.get(id) {
            Some(node) => node.next.is_some() || self.best == Some(*id),
            None => false,
        }
    }

    /// Walk orphans back to the root of their detached chain.
    pub fn orphan_root(&self, id: &Hash) -> Hash {
        let mut cursor = *id;
        while let Some(block) = self.orphan_blocks.get(&cursor) {
            if !self.orphan_blocks.contains_key(&block.header.prev_block) {
                return cursor;
            }
            cursor = block.header.prev_block;
        }
        cursor
    }

    /// The parent hash an orphan chain ultimately needs.
    pub fn wanted_by_orphan(&self, id: &Hash) -> Hash {
        let root = self.orphan_root(id);
        match self.orphan_blocks.get(&root) {
            Some(block) => block.header.prev_block,
            None => *id,
        }
    }

    /// Median of the last eleven block times ending at `id`.
    pub fn median_time_past(&self, id: &Hash) -> i64 {
        let mut times = Vec::with_capacity(11);
        let mut cursor = Some(*id);
        for _ in 0..11 {
            let node = match cursor.and_then(|c| self.index.get(&c)) {
                Some(n) => n,
                None => break,
            };
            times.push(node.time as i64);
            cursor = if node.prev == ZERO_HASH { None } else { Some(node.prev) };
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Damped average of recent block times: stamps closer together than
    /// `min_delay` are pushed apart before averaging. Returns zero when
    /// fewer than `span` blocks exist.
    pub fn average_time_past(&self, id: &Hash, span: u32, min_delay: u32) -> i64 {
        if span == 0 {
            return 0;
        }
        let mut times = vec![0u32; span as usize];
        let mut cursor = Some(*id);
        for i in (0..span as usize).rev() {
            let node = match cursor.and_then(|c| self.index.get(&c)) {
                Some(n) => n,
                None => break,
            };
            times[i] = node.time;
            cursor = if node.prev == ZERO_HASH { None } else { Some(node.prev) };
        }
        if times[0] == 0 {
            return 0;
        }
        let mut temp = times[0];
        let mut accum = temp as u64;
        for &t in &times[1..] {
            if t < temp + min_delay {
                temp += min_delay;
            } else {
                temp = t;
            }
            accum += temp as u64;
        }
        (accum / span as u64) as i64
    }

    // ------------------------------------------------------------------
    // difficulty

    /// The compact target required for the block following `prev`.
    pub fn next_work_required(&self, prev: Option<&Hash>, block_time: u32) -> u32 {
        let limit_bits = self.params.pow_limit_bits;
        let prev_node = match prev.and_then(|p| self.index.get(p)) {
            Some(node) => node,
            None => return limit_bits,
        };
        let height = prev_node.height + 1;

        let (spacing, base_timespan) = self.params.spacing_and_timespan(height);
        let mut timespan = base_timespan;

        // unconditional reset at the hash-function switch
        if self.params.modern_era(height) && height == self.params.modern_era_height() {
            return compress_target(&self.params.switch_limit);
        }

        let mut interval = timespan / spacing;
        let hard_fork = self.params.is_hard_fork_height(height);

        if (height as i64) % interval != 0 && !hard_fork {
            if self.params.is_testnet() {
                // minimum-difficulty reset after two missed spacings
                if block_time as i64 > prev_node.time as i64 + spacing * 2 {
                    return limit_bits;
                }
                // otherwise inherit the last regular-difficulty block
                let mut cursor = prev_node;
                while cursor.prev != ZERO_HASH
                    && (cursor.height as i64) % interval != 0
                    && cursor.bits == limit_bits
                {
                    cursor = match self.index.get(&cursor.prev) {
                        Some(n) => n,
                        None => break,
                    };
                }
                return cursor.bits;
            }
            return prev_node.bits;
        }

        // widened basic window after the averaging fork
        if self.params.averaging_active(height) {
            interval *= 5;
            timespan *= 5;
        }

        // the first retarget after genesis has fewer blocks than a window
        if interval >= height as i64 {
            interval = height as i64 - 1;
        }

        let mut first = prev_node;
        for _ in 0..interval {
            match self.index.get(&first.prev) {
                Some(n) => first = n,
                None => break,
            }
        }
        let mut actual_timespan = prev_node.time as i64 - first.time as i64;
        debug!(actual_timespan, "retarget: timespan before bounds");

        if self.params.averaging_active(height) {
            // second sample over a window four times wider, then average
            // and damp toward the ideal with weight 9:1
            let extended_interval = interval * 4;
            for _ in 0..extended_interval {
                match self.index.get(&first.prev) {
                    Some(n) => first = n,
                    None => break,
                }
            }
            let extended = (prev_node.time as i64 - first.time as i64) / 5;
            let averaged = (actual_timespan + extended) / 2;
            actual_timespan = (averaged + 9 * timespan) / 10;
            debug!(extended, averaged, actual_timespan, "retarget: damped timespan");
        }

        // adjustment clamps tighten with every hard fork
        let mut max_timespan = timespan * 4;
        let mut min_timespan = timespan / 4;
        if height >= FORK_ONE {
            max_timespan = timespan * 99 / 55;
            min_timespan = timespan * 55 / 99;
        }
        if height >= FORK_THREE {
            max_timespan = timespan * 109 / 100;
            min_timespan = timespan * 100 / 109;
        }
        if self.params.averaging_active(height) {
            max_timespan = timespan * 102 / 100;
            min_timespan = timespan * 100 / 102;
        }
        if self.params.modern_era(height) {
            max_timespan = timespan * 105 / 100;
        }
        actual_timespan = actual_timespan.clamp(min_timespan, max_timespan);

        let prev_target = match expand_target(prev_node.bits) {
            Some(t) => t,
            None => return limit_bits,
        };
        let mut new_target =
            prev_target.mul_u64(actual_timespan as u64).div_u64(timespan as u64);
        if new_target > self.params.pow_limit {
            new_target = self.params.pow_limit;
        }
        debug!(
            before = %format_args!("{:08x}", prev_node.bits),
            after = %format_args!("{:08x}", compress_target(&new_target)),
            "retarget"
        );
        compress_target(&new_target)
    }

    // ------------------------------------------------------------------
    // initial download heuristic

    pub fn is_initial_block_download(&self) -> bool {
        let tip = match self.tip() {
            Some(t) => t,
            None => return true,
        };
        if tip.height < self.checkpoints.total_blocks_estimate() {
            return true;
        }
        let now = self.system_time();
        now - self.ibd_last_update < self.ibd_update_window
            && (tip.time as i64) < now - self.ibd_tip_age
    }

    fn record_tip(&mut self, id: Hash) {
        let node = &self.index[&id];
        self.best = Some(id);
        self.best_work = node.chain_work;
        if self.ibd_last_best != Some(id) {
            self.ibd_last_best = Some(id);
            self.ibd_last_update = self.system_time();
        }
        info!(
            best = %short_hash(&id),
            height = node.height,
            "new best chain"
        );
    }

    // ------------------------------------------------------------------
    // locators

    /// Exponentially spaced ids from a starting block back to genesis.
    pub fn block_locator(&self, from: Option<Hash>) -> Vec<Hash> {
        let mut have = Vec::new();
        let mut cursor = from.or(self.best);
        let mut step: i32 = 1;
        while let Some(id) = cursor {
            let node = match self.index.get(&id) {
                Some(n) => n,
                None => break,
            };
            have.push(id);
            if node.height == 0 {
                break;
            }
            let target = (node.height - step).max(0);
            let mut walk = node;
            while walk.height > target {
                walk = match self.index.get(&walk.prev) {
                    Some(n) => n,
                    None => break,
                };
            }
            cursor = Some(walk.id);
            if have.len() > 10 {
                step = step.saturating_mul(2);
            }
        }
        have
    }

    /// Youngest locator entry on our main chain; genesis if none match.
    pub fn find_fork_point(&self, locator: &[Hash]) -> Option<Hash> {
        for id in locator {
            if self.main_chain_contains(id) {
                return Some(*id);
            }
        }
        self.genesis
    }

    /// Up to `limit` main-chain block ids after `from`, excluding the
    /// stop hash, for getblocks replies.
    pub fn main_chain_after(&self, from: &Hash, stop: Option<&Hash>, limit: usize) -> Vec<Hash> {
        let mut out = Vec::new();
        let mut cursor = self.index.get(from).and_then(|n| n.next);
        while let Some(id) = cursor {
            if stop == Some(&id) || out.len() >= limit {
                break;
            }
            out.push(id);
            cursor = self.index.get(&id).and_then(|n| n.next);
        }
        out
    }

    /// Main-chain headers after `from`, including the stop hash, for
    /// getheaders replies.
    pub fn headers_after(&self, from: &Hash, stop: Option<&Hash>, limit: usize) -> Vec<BlockHeader> {
        let mut out = Vec::new();
        let mut cursor = self.index.get(from).and_then(|n| n.next);
        while let Some(id) = cursor {
            let node = match self.index.get(&id) {
                Some(n) => n,
                None => break,
            };
            out.push(node.header(node.prev));
            if out.len() >= limit || stop == Some(&id) {
                break;
            }
            cursor = node.next;
        }
        out
    }

    // ------------------------------------------------------------------
    // context-free block checks

    fn pow_height_hint(&self, block: &Block) -> i32 {
        match self.index.get(&block.header.prev_block) {
            Some(parent) => parent.height + 1,
            None => block.declared_height(),
        }
    }

    /// Context-free block checks, verifiable before an orphan is stored.
    pub fn check_block(&self, block: &Block, check_pow: bool, check_merkle: bool) -> Result<(), Rejection> {
        if block.transactions.is_empty()
            || block.transactions.len() > MAX_BLOCK_SIZE
            || block.serialized_size() > MAX_BLOCK_SIZE
        {
            return Err(Rejection::dos(100, "block size limits failed"));
        }

        if check_pow {
            let pow = self.params.pow_hash(&block.header, self.pow_height_hint(block));
            if !check_proof_of_work(&pow, block.header.bits, &self.params.pow_limit) {
                return Err(Rejection::dos(50, "proof of work verification failed"));
            }
        }

        if (block.header.time as i64) > self.adjusted_time() + 2 * 60 * 60 {
            return Err(Rejection::benign("block timestamp too far in the future"));
        }

        if !block.transactions[0].is_coinbase() {
            return Err(Rejection::dos(100, "first transaction is not the coinbase"));
        }
        for tx in &block.transactions[1..] {
            if tx.is_coinbase() {
                return Err(Rejection::dos(100, "more than one coinbase"));
            }
        }

        for tx in &block.transactions {
            check_transaction(tx)?;
        }

        let mut seen = std::collections::HashSet::new();
        for tx in &block.transactions {
            if !seen.insert(tx.txid()) {
                return Err(Rejection::dos(100, "duplicate transaction"));
            }
        }

        let sigops: usize = block.transactions.iter().map(legacy_sigops).sum();
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(Rejection::dos(100, "out-of-bounds signature operation count"));
        }

        if check_merkle && block.merkle_root() != block.header.merkle_root {
            return Err(Rejection::dos(100, "merkle root mismatch"));
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // input resolution and connection

    fn read_overlay_entry(
        &self,
        overlay: &TxIndexOverlay,
        txid: &Hash,
    ) -> Result<Option<TxIndexEntry>, ChainError> {
        match overlay.get(txid) {
            Some(Some(entry)) => Ok(Some(entry.clone())),
            Some(None) => Ok(None),
            None => Ok(self.store.read_tx_index(txid)?),
        }
    }

    /// Resolve every non-coinbase input: the in-flight overlay first, then
    /// the persistent index, then the mempool.
    pub fn fetch_inputs(
        &self,
        tx: &Transaction,
        overlay: &TxIndexOverlay,
        in_block: bool,
        for_miner: bool,
        pool: Option<&Mempool>,
    ) -> Result<FetchedInputs, ChainError> {
        let mut map = HashMap::new();
        if tx.is_coinbase() {
            return Ok(FetchedInputs::Complete(map));
        }

        for input in &tx.inputs {
            let prev_txid = input.prevout.txid;
            if map.contains_key(&prev_txid) {
                continue;
            }

            let found = self.read_overlay_entry(overlay, &prev_txid)?;
            if found.is_none() && (in_block || for_miner) {
                if for_miner {
                    return Ok(FetchedInputs::Missing);
                }
                return Err(Rejection::benign(format!(
                    "previous transaction {} has no index entry",
                    short_hash(&prev_txid)
                ))
                .into());
            }

            let (entry, prev_tx) = match found {
                Some(entry) if entry.pos != DiskTxPos::MEMORY && !entry.pos.is_null() => {
                    let prev_tx = self.store.read_tx_at(&entry.pos)?;
                    (entry, prev_tx)
                }
                maybe_entry => {
                    // in memory: the pool holds the transaction
                    let prev_tx = match pool.and_then(|p| p.lookup(&prev_txid)) {
                        Some(t) => t.clone(),
                        None => return Ok(FetchedInputs::Missing),
                    };
                    let entry = maybe_entry.unwrap_or_else(|| {
                        TxIndexEntry::new(DiskTxPos::NULL, prev_tx.outputs.len())
                    });
                    (entry, prev_tx)
                }
            };
            map.insert(prev_txid, PrevTx { entry, tx: prev_tx });
        }

        // every referenced output index must exist
        for input in &tx.inputs {
            let prev = &map[&input.prevout.txid];
            let n = input.prevout.index as usize;
            if n >= prev.tx.outputs.len() || n >= prev.entry.spent.len() {
                return Err(Rejection::dos(
                    100,
                    format!(
                        "prevout index {} out of range for {}",
                        n,
                        short_hash(&input.prevout.txid)
                    ),
                )
                .into());
            }
        }

        Ok(FetchedInputs::Complete(map))
    }

    /// Sum of resolved input values, range-checked.
    pub fn value_in(
        &self,
        tx: &Transaction,
        inputs: &HashMap<Hash, PrevTx>,
    ) -> Result<i64, Rejection> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        let mut total: i64 = 0;
        for input in &tx.inputs {
            let prev = inputs
                .get(&input.prevout.txid)
                .ok_or_else(|| Rejection::benign("unresolved input"))?;
            let value = prev.tx.outputs[input.prevout.index as usize].value;
            total = total.checked_add(value).unwrap_or(i64::MAX);
            if !(0..=MAX_MONEY).contains(&value) || !(0..=MAX_MONEY).contains(&total) {
                return Err(Rejection::dos(100, "input values out of range"));
            }
        }
        Ok(total)
    }

    /// Spend context for mempool acceptance dry runs.
    pub fn mempool_spend_context(&self) -> SpendContext {
        SpendContext {
            height: self.height(),
            walk_from: self.best,
            in_block: false,
            for_miner: false,
            strict_p2sh: true,
        }
    }

    /// Two-pass input connection: cheap value and maturity checks first,
    /// then signature verification, spent-marking and the fee tally.
    #[allow(clippy::too_many_arguments)]
    pub fn connect_inputs(
        &self,
        tx: &Transaction,
        inputs: &mut HashMap<Hash, PrevTx>,
        overlay: &mut TxIndexOverlay,
        pos_this_tx: DiskTxPos,
        walk_from: Option<Hash>,
        in_block: bool,
        for_miner: bool,
        strict_p2sh: bool,
    ) -> Result<i64, ChainError> {
        let spend = SpendContext {
            height: match walk_from.and_then(|w| self.index.get(&w)) {
                Some(node) => {
                    if in_block || !for_miner {
                        node.height
                    } else {
                        node.height + 1
                    }
                }
                None => self.height(),
            },
            walk_from,
            in_block,
            for_miner,
            strict_p2sh,
        };
        self.connect_inputs_at(tx, inputs, overlay, pos_this_tx, &spend)
    }

    pub fn connect_inputs_at(
        &self,
        tx: &Transaction,
        inputs: &mut HashMap<Hash, PrevTx>,
        overlay: &mut TxIndexOverlay,
        pos_this_tx: DiskTxPos,
        spend: &SpendContext,
    ) -> Result<i64, ChainError> {
        if tx.is_coinbase() {
            return Ok(0);
        }

        // pass one: inexpensive checks only
        let mut value_in: i64 = 0;
        for input in &tx.inputs {
            let prev = inputs
                .get(&input.prevout.txid)
                .ok_or_else(|| Rejection::benign("unresolved input"))?;
            let n = input.prevout.index as usize;
            if n >= prev.tx.outputs.len() || n >= prev.entry.spent.len() {
                return Err(Rejection::dos(100, "prevout index out of range").into());
            }

            if prev.tx.is_coinbase() {
                self.check_coinbase_maturity(&prev.entry, spend)?;
            }

            let value = prev.tx.outputs[n].value;
            value_in = value_in.checked_add(value).unwrap_or(i64::MAX);
            if !(0..=MAX_MONEY).contains(&value) || !(0..=MAX_MONEY).contains(&value_in) {
                return Err(Rejection::dos(100, "input values out of range").into());
            }
        }

        // pass two: double-spend checks and signature verification
        let skip_signatures =
            spend.in_block && self.height() < self.checkpoints.total_blocks_estimate();
        for (i, input) in tx.inputs.iter().enumerate() {
            let prev = inputs
                .get_mut(&input.prevout.txid)
                .ok_or_else(|| Rejection::benign("unresolved input"))?;
            let n = input.prevout.index as usize;

            // no DoS score: a double spend is how the network looks
            // during races, not proof of malice
            if !prev.entry.spent[n].is_null() {
                return Err(Rejection::benign(format!(
                    "input already spent at {}:{}",
                    prev.entry.spent[n].file, prev.entry.spent[n].tx_pos
                ))
                .into());
            }

            if !skip_signatures {
                let prev_script = &prev.tx.outputs[n].script_pubkey;
                if !self.params.verifier.verify(prev_script, tx, i, spend.strict_p2sh, 0) {
                    if spend.strict_p2sh
                        && self.params.verifier.verify(prev_script, tx, i, false, 0)
                    {
                        // transition leniency: old clients may relay such
                        // spends, so no score
                        return Err(Rejection::benign("strict pay-to-script-hash check failed")
                            .into());
                    }
                    return Err(Rejection::dos(100, "signature verification failed").into());
                }
            }

            prev.entry.spent[n] = pos_this_tx;
            if spend.in_block || spend.for_miner {
                overlay.insert(input.prevout.txid, Some(prev.entry.clone()));
            }
        }

        let value_out = tx.value_out();
        if value_in < value_out {
            return Err(Rejection::dos(100, "value in below value out").into());
        }
        let fee = value_in - value_out;
        if !(0..=MAX_MONEY).contains(&fee) {
            return Err(Rejection::dos(100, "fee out of range").into());
        }
        Ok(fee)
    }

    /// A coinbase needs BASE_MATURITY blocks on top of it before it can
    /// be spent; walk recent ancestors comparing disk positions.
    fn check_coinbase_maturity(
        &self,
        entry: &TxIndexEntry,
        spend: &SpendContext,
    ) -> Result<(), ChainError> {
        let mut cursor = spend.walk_from;
        while let Some(id) = cursor {
            let node = match self.index.get(&id) {
                Some(n) => n,
                None => break,
            };
            if spend.height - node.height >= self.params.base_maturity {
                break;
            }
            if node.block_pos == entry.pos.block_pos && node.file == entry.pos.file {
                return Err(Rejection::benign(format!(
                    "tried to spend coinbase at depth {}",
                    spend.height - node.height
                ))
                .into());
            }
            cursor = if node.prev == ZERO_HASH { None } else { Some(node.prev) };
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // block connection

    fn overwrite_exempt(&self, ctx: &ConnectCtx) -> bool {
        let id = match ctx.id {
            Some(id) => id,
            None => return false,
        };
        OVERWRITE_EXCEPTIONS.iter().any(|(height, hash)| {
            *height == ctx.height
                && crate::types::hash_from_hex(hash).map(|h| h == id).unwrap_or(false)
        })
    }

    /// Connect a block's transactions against the tx-index overlay.
    /// `just_check` validates a candidate without real disk positions.
    pub fn connect_block(
        &self,
        block: &Block,
        ctx: &ConnectCtx,
        overlay: &mut TxIndexOverlay,
        pool: Option<&Mempool>,
        just_check: bool,
    ) -> Result<i64, ChainError> {
        // re-check in case an earlier version let a bad block in
        self.check_block(block, !just_check, !just_check)
            .map_err(ChainError::Rejected)?;

        // no overwriting an indexed transaction that still has unspent
        // outputs, except the two grandfathered blocks
        let enforce_no_overwrite = !self.overwrite_exempt(ctx);

        let strict_p2sh = ctx.time >= P2SH_SWITCH_TIME;

        let base_pos =
            ctx.block_pos as usize + 80 + compact_size_len(block.transactions.len() as u64);
        let mut tx_offset = base_pos;

        let mut fees: i64 = 0;
        let mut sigops: usize = 0;

        for tx in &block.transactions {
            let txid = tx.txid();

            if enforce_no_overwrite {
                if let Some(existing) = self.read_overlay_entry(overlay, &txid)? {
                    if existing.spent.iter().any(|pos| pos.is_null()) {
                        return Err(Rejection::benign(format!(
                            "transaction {} would overwrite an unspent predecessor",
                            short_hash(&txid)
                        ))
                        .into());
                    }
                }
            }

            sigops += legacy_sigops(tx);
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(Rejection::dos(100, "too many signature operations").into());
            }

            let pos_this_tx = if just_check {
                DiskTxPos::MEMORY
            } else {
                DiskTxPos { file: ctx.file, block_pos: ctx.block_pos, tx_pos: tx_offset as u32 }
            };
            tx_offset += tx.serialized_size();

            if !tx.is_coinbase() {
                let mut fetched = match self.fetch_inputs(tx, overlay, true, false, pool)? {
                    FetchedInputs::Complete(map) => map,
                    FetchedInputs::Missing => {
                        return Err(Rejection::benign("inputs unavailable").into())
                    }
                };

                if strict_p2sh {
                    // count sigops done by pay-to-script-hash inputs so a
                    // rogue miner cannot make verification quadratic
                    for input in &tx.inputs {
                        let prev = &fetched[&input.prevout.txid];
                        let prev_script =
                            &prev.tx.outputs[input.prevout.index as usize].script_pubkey;
                        if script::is_pay_to_script_hash(prev_script) {
                            sigops += script::p2sh_sigop_count(&input.script_sig);
                        }
                    }
                    if sigops > MAX_BLOCK_SIGOPS {
                        return Err(Rejection::dos(100, "too many signature operations").into());
                    }
                }

                let spend = SpendContext {
                    height: ctx.height,
                    walk_from: ctx.id.or(self.best),
                    in_block: true,
                    for_miner: false,
                    strict_p2sh,
                };
                fees += self.connect_inputs_at(tx, &mut fetched, overlay, pos_this_tx, &spend)?;
            }

            overlay.insert(txid, Some(TxIndexEntry::new(pos_this_tx, tx.outputs.len())));
        }

        let reward = proof_of_work_reward(self.params.network, ctx.height, fees);
        let coinbase_out = block.transactions[0].value_out();
        if coinbase_out > reward {
            return Err(Rejection::benign(format!(
                "coinbase pays too much: {} over the limit {}",
                coinbase_out, reward
            ))
            .into());
        }

        Ok(fees)
    }

    /// Undo a block: clear its spends in reverse order, then drop its
    /// transactions from the index.
    pub fn disconnect_block(
        &self,
        block: &Block,
        overlay: &mut TxIndexOverlay,
    ) -> Result<(), ChainError> {
        for tx in block.transactions.iter().rev() {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let mut entry = self
                        .read_overlay_entry(overlay, &input.prevout.txid)?
                        .ok_or_else(|| {
                            NodeError::Corruption(format!(
                                "missing index entry for {} during disconnect",
                                short_hash(&input.prevout.txid)
                            ))
                        })?;
                    let n = input.prevout.index as usize;
                    if n >= entry.spent.len() {
                        return Err(NodeError::Corruption(
                            "spent vector shorter than prevout index".into(),
                        )
                        .into());
                    }
                    entry.spent[n] = DiskTxPos::NULL;
                    overlay.insert(input.prevout.txid, Some(entry));
                }
            }
            overlay.insert(tx.txid(), None);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // best-chain selection

    fn batch_from_overlay(&self, overlay: &TxIndexOverlay) -> StoreBatch {
        let mut batch = self.store.batch();
        for (txid, entry) in overlay {
            match entry {
                Some(e) => batch.set_tx_index(txid, e),
                None => batch.erase_tx_index(txid),
            }
        }
        batch
    }

    fn invalid_chain_found(&mut self, id: Hash) {
        let (work, height) = match self.index.get(&id) {
            Some(node) => (node.chain_work, node.height),
            None => return,
        };
        if work > self.best_invalid_work {
            self.best_invalid_work = work;
            let mut batch = self.store.batch();
            batch.set_best_invalid_work(&work);
            if let Err(e) = self.store.commit(batch) {
                warn!(error = %e, "failed to persist best invalid work");
            }
        }
        warn!(
            block = %short_hash(&id),
            height,
            "invalid chain found"
        );
    }

    /// Attach a block extending the current best chain: connect inside a
    /// durable batch, commit, link pointers, clean the mempool.
    fn set_best_chain_inner(
        &mut self,
        mempool: &mut Mempool,
        block: &Block,
        id: Hash,
    ) -> Result<(), ChainError> {
        let node = self.index.get(&id).ok_or_else(|| {
            NodeError::Corruption("connecting a block missing from the index".into())
        })?;
        let ctx = ConnectCtx {
            id: Some(id),
            height: node.height,
            time: node.time,
            file: node.file,
            block_pos: node.block_pos,
        };
        let parent = node.prev;

        let mut overlay = TxIndexOverlay::new();
        match self.connect_block(block, &ctx, &mut overlay, None, false) {
            Ok(_) => {}
            Err(ChainError::Rejected(r)) => {
                self.invalid_chain_found(id);
                return Err(ChainError::Rejected(r));
            }
            Err(fatal) => return Err(fatal),
        }

        let mut batch = self.batch_from_overlay(&overlay);
        batch.set_best_chain(&id);
        if let Some(parent_node) = self.index.get(&parent) {
            let mut disk = parent_node.to_disk();
            disk.next = id;
            batch.set_block_index(&parent, &disk);
        }
        self.store.commit(batch)?;

        if let Some(parent_node) = self.index.get_mut(&parent) {
            parent_node.next = Some(id);
        }
        self.record_tip(id);

        for tx in &block.transactions {
            mempool.remove(tx);
        }
        mempool.bump_updates();
        Ok(())
    }

    /// Switch the best chain to `pivot`, disconnecting back to the fork
    /// and connecting the new branch, all inside one durable batch.
    fn reorganize(&mut self, mempool: &mut Mempool, pivot: Hash) -> Result<(), ChainError> {
        info!("reorganize");
        let old_tip = self
            .best
            .ok_or_else(|| NodeError::Corruption("reorganize without a best chain".into()))?;

        // find the fork by walking both branches to a common ancestor
        let mut fork = old_tip;
        let mut longer = pivot;
        loop {
            while self.node(&longer)?.height > self.node(&fork)?.height {
                longer = self.node(&longer)?.prev;
            }
            if fork == longer {
                break;
            }
            fork = self.node(&fork)?.prev;
        }

        let mut disconnect = Vec::new();
        let mut cursor = old_tip;
        while cursor != fork {
            disconnect.push(cursor);
            cursor = self.node(&cursor)?.prev;
        }
        let mut connect = Vec::new();
        cursor = pivot;
        while cursor != fork {
            connect.push(cursor);
            cursor = self.node(&cursor)?.prev;
        }
        connect.reverse();

        info!(
            disconnect = disconnect.len(),
            connect = connect.len(),
            fork = %short_hash(&fork),
            "reorganize: switching branches"
        );

        let mut overlay = TxIndexOverlay::new();
        let mut resurrect: Vec<Transaction> = Vec::new();
        for id in &disconnect {
            let node = self.node(id)?;
            let (file, pos) = (node.file, node.block_pos);
            let block = self.store.read_block(file, pos)?;
            if block.hash() != *id {
                return Err(NodeError::Corruption("block file does not match index".into()).into());
            }
            self.disconnect_block(&block, &mut overlay)?;
            for tx in &block.transactions {
                if !tx.is_coinbase() {
                    resurrect.push(tx.clone());
                }
            }
        }

        let mut delete: Vec<Transaction> = Vec::new();
        for id in &connect {
            let node = self.node(id)?;
            let ctx = ConnectCtx {
                id: Some(*id),
                height: node.height,
                time: node.time,
                file: node.file,
                block_pos: node.block_pos,
            };
            let block = self.store.read_block(ctx.file, ctx.block_pos)?;
            if block.hash() != *id {
                return Err(NodeError::Corruption("block file does not match index".into()).into());
            }
            match self.connect_block(&block, &ctx, &mut overlay, None, false) {
                Ok(_) => {}
                Err(ChainError::Rejected(r)) => {
                    self.invalid_chain_found(pivot);
                    return Err(ChainError::Rejected(Rejection {
                        reason: format!(
                            "reorganize: connect of {} failed: {}",
                            short_hash(id),
                            r.reason
                        ),
                        dos: r.dos,
                    }));
                }
                Err(fatal) => return Err(fatal),
            }
            for tx in &block.transactions {
                delete.push(tx.clone());
            }
        }

        // commit everything at once, including the rewired child links
        let mut batch = self.batch_from_overlay(&overlay);
        batch.set_best_chain(&pivot);

        let mut next_updates: Vec<(Hash, Option<Hash>)> = Vec::new();
        for id in &disconnect {
            next_updates.push((*id, None));
        }
        next_updates.push((fork, None));
        let mut parent = fork;
        for id in &connect {
            next_updates.push((parent, Some(*id)));
            parent = *id;
        }
        next_updates.push((pivot, None));

        for (id, next) in &next_updates {
            if let Some(node) = self.index.get(id) {
                let mut disk = node.to_disk();
                disk.next = next.unwrap_or(ZERO_HASH);
                batch.set_block_index(id, &disk);
            }
        }
        self.store.commit(batch)?;

        for (id, next) in next_updates {
            if let Some(node) = self.index.get_mut(&id) {
                node.next = next;
            }
        }
        self.record_tip(pivot);

        // resurrect the losing branch's transactions, then drop the ones
        // the winning branch confirmed
        for tx in resurrect {
            let _ = mempool.accept(self, tx, false, false);
        }
        for tx in &delete {
            mempool.remove(tx);
        }
        mempool.bump_updates();

        info!("reorganize: done");
        Ok(())
    }

    fn node(&self, id: &Hash) -> Result<&BlockIndexNode, ChainError> {
        self.index.get(id).ok_or_else(|| {
            ChainError::Fatal(NodeError::Corruption(format!(
                "dangling block index reference {}",
                short_hash(id)
            )))
        })
    }

    /// Make `id` the best chain. Fast path when it extends the tip, a
    /// reorganization otherwise; blocks above the pivot reconnect one at
    /// a time afterwards, non-fatally.
    pub fn set_best_chain(
        &mut self,
        mempool: &mut Mempool,
        block: &Block,
        id: Hash,
    ) -> Result<(), ChainError> {
        if self.best.is_none() || (self.genesis == Some(id) && self.best == self.genesis) {
            // the genesis bootstrap path
            let mut batch = self.store.batch();
            batch.set_best_chain(&id);
            self.store.commit(batch)?;
            self.record_tip(id);
            return Ok(());
        }

        if Some(block.header.prev_block) == self.best {
            return self.set_best_chain_inner(mempool, block, id);
        }

        // the first ancestor whose work alone beats the current tip is the
        // pivot; everything above it reconnects afterwards
        let mut pivot = id;
        let mut postponed = Vec::new();
        loop {
            let parent = self.node(&pivot)?.prev;
            let parent_work = match self.index.get(&parent) {
                Some(p) => p.chain_work,
                None => break,
            };
            if parent_work > self.best_work {
                postponed.push(pivot);
                pivot = parent;
            } else {
                break;
            }
        }
        if !postponed.is_empty() {
            debug!(count = postponed.len(), "postponing reconnects past the pivot");
        }

        if let Err(e) = self.reorganize(mempool, pivot) {
            if matches!(e, ChainError::Rejected(_)) {
                self.invalid_chain_found(id);
            }
            return Err(e);
        }

        // reconnect the postponed blocks; failures here are not fatal, the
        // reorganization itself already succeeded
        for pid in postponed.iter().rev() {
            let node = match self.index.get(pid) {
                Some(n) => n,
                None => break,
            };
            let (file, pos) = (node.file, node.block_pos);
            let block = match self.store.read_block(file, pos) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "postponed reconnect: read failed");
                    break;
                }
            };
            if self.set_best_chain_inner(mempool, &block, *pid).is_err() {
                break;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // acceptance

    /// Full contextual acceptance of a block whose parent is known.
    pub fn accept_block(
        &mut self,
        mempool: &mut Mempool,
        block: &Block,
    ) -> Result<AcceptedBlock, ChainError> {
        let id = block.hash();
        if self.index.contains_key(&id) {
            return Err(Rejection::benign("block already in the index").into());
        }
        if block.transactions.is_empty() || !block.transactions[0].is_coinbase() {
            return Err(Rejection::dos(100, "first transaction is not the coinbase").into());
        }

        let parent = match self.index.get(&block.header.prev_block) {
            Some(p) => p.clone(),
            None => return Err(Rejection::dos(10, "previous block not found").into()),
        };
        let height = parent.height + 1;

        // version-2 blocks commit to their height in the coinbase
        if block.header.time > self.params.v2_switch_time() {
            let coinbase_sig = &block.transactions[0].inputs[0].script_sig;
            if !script::starts_with_height(coinbase_sig, height) {
                return Err(Rejection::dos(100, "incorrect block height in coinbase").into());
            }
        }

        // only version-2 blocks after the switch fork
        if self.params.modern_era(height) && block.header.version != 2 {
            return Err(Rejection::dos(100, "incorrect block version").into());
        }

        let required = self.next_work_required(Some(&parent.id), block.header.time);
        if block.header.bits != required {
            return Err(Rejection::dos(
                100,
                format!("incorrect proof of work for height {}", height),
            )
            .into());
        }

        let now = self.adjusted_time();
        let time = block.header.time as i64;
        let parent_median = self.median_time_past(&parent.id);

        if time <= parent_median {
            return Err(Rejection::dos(
                20,
                format!("block at height {} has a time stamp behind the median", height),
            )
            .into());
        }

        if self.params.soft_fork_one_active(height) {
            if time > now + 10 * 60 {
                return Err(Rejection::dos(5, "time stamp too far in the future").into());
            }
            if time <= parent_median + BLOCK_LIMITER_TIME {
                return Err(Rejection::dos(5, "rejected by the block limiter").into());
            }
            if time <= parent.time as i64 - 10 * 60 {
                return Err(Rejection::dos(20, "time stamp too far in the past").into());
            }
        }

        if !self.is_initial_block_download() && self.params.soft_fork_two_active(height) {
            if time > now + 5 * 60 {
                return Err(Rejection::dos(5, "time stamp too far in the future").into());
            }
            let average = self.average_time_past(&parent.id, 5, 45);
            if time > now + 60 && average + BLOCK_LIMITER_TIME > now {
                return Err(Rejection::dos(5, "rejected by the future travel detector").into());
            }
        }

        for tx in &block.transactions {
            if !tx.is_final(height, time) {
                return Err(Rejection::dos(10, "contains a non-final transaction").into());
            }
        }

        if !self.checkpoints.check_hardened(height, &id) {
            return Err(Rejection::dos(
                100,
                format!("rejected by a hardened checkpoint at height {}", height),
            )
            .into());
        }

        if !self.is_initial_block_download()
            && self.checkpoints.mode != CheckpointMode::Permissive
        {
            let satisfies = self.check_sync_checkpoint(&parent.id);
            if !satisfies {
                match self.checkpoints.mode {
                    CheckpointMode::Strict => {
                        return Err(Rejection::benign(format!(
                            "block at height {} rejected by synchronized checkpointing",
                            height
                        ))
                        .into());
                    }
                    CheckpointMode::Advisory => {
                        warn!(height, "block fails synchronized checkpointing");
                    }
                    CheckpointMode::Permissive => {}
                }
            }
        }

        // everything checked: write, index, maybe promote to best
        let sync = !self.is_initial_block_download() || (height + 1) % 100 == 0;
        let (file, block_pos) = self.store.append_block(block, sync)?;

        let node = BlockIndexNode {
            id,
            version: block.header.version,
            prev: parent.id,
            merkle_root: block.header.merkle_root,
            time: block.header.time,
            bits: block.header.bits,
            nonce: block.header.nonce,
            height,
            file,
            block_pos,
            next: None,
            chain_work: parent.chain_work.saturating_add(&block_work(block.header.bits)),
        };
        let work = node.chain_work;
        let mut batch = self.store.batch();
        batch.set_block_index(&id, &node.to_disk());
        self.store.commit(batch)?;
        self.index.insert(id, node);

        let mut became_tip = false;
        if work > self.best_work {
            self.set_best_chain(mempool, block, id)?;
            became_tip = self.best == Some(id);
        }

        Ok(AcceptedBlock { id, height, became_tip })
    }

    /// Whether extending `parent` keeps us on the side of the current
    /// sync checkpoint.
    pub fn check_sync_checkpoint(&self, parent: &Hash) -> bool {
        let cp_id = match self.checkpoints.sync_checkpoint {
            Some(id) => id,
            None => return true,
        };
        let cp = match self.index.get(&cp_id) {
            Some(node) => node,
            None => return true,
        };
        let parent_node = match self.index.get(parent) {
            Some(node) => node,
            None => return false,
        };
        if parent_node.height < cp.height {
            // forking before the checkpoint
            return false;
        }
        // the checkpoint must be an ancestor
        let mut cursor = parent_node;
        while cursor.height > cp.height {
            cursor = match self.index.get(&cursor.prev) {
                Some(n) => n,
                None => return false,
            };
        }
        cursor.id == cp_id
    }

    /// Apply a verified sync checkpoint, reorganizing onto its branch if
    /// needed. Returns false when the checkpointed block is unknown and
    /// was queued as pending.
    pub fn apply_sync_checkpoint(
        &mut self,
        mempool: &mut Mempool,
        cp_hash: Hash,
    ) -> Result<bool, ChainError> {
        if !self.index.contains_key(&cp_hash) {
            self.checkpoints.pending = Some(cp_hash);
            return Ok(false);
        }
        self.checkpoints.pending = None;

        if !self.main_chain_contains(&cp_hash) {
            let node = self.node(&cp_hash)?;
            let (file, pos) = (node.file, node.block_pos);
            let block = self.store.read_block(file, pos)?;
            self.set_best_chain(mempool, &block, cp_hash)?;
        }

        self.checkpoints.sync_checkpoint = Some(cp_hash);
        self.store.set_sync_checkpoint(&cp_hash)?;
        info!(checkpoint = %short_hash(&cp_hash), "sync checkpoint applied");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // gossip ingress

    /// Process a block from the network, the miner or an import: checks,
    /// orphan handling, acceptance and orphan-chain drainage.
    pub fn process_block(
        &mut self,
        mempool: &mut Mempool,
        block: Block,
        from_peer: bool,
    ) -> Result<ProcessOutcome, ChainError> {
        let id = block.hash();
        if self.index.contains_key(&id) {
            return Err(Rejection::benign("block already in the index").into());
        }
        if self.orphan_blocks.contains_key(&id) {
            return Err(Rejection::benign("block already in the orphan pool").into());
        }

        self.check_block(&block, true, true).map_err(ChainError::Rejected)?;

        // history cannot be rewritten below the last checkpoint
        let last_checkpoint =
            self.checkpoints.last_hardened(|hash| self.index.contains_key(hash));
        if let Some((_, cp_hash)) = last_checkpoint {
            if Some(block.header.prev_block) != self.best {
                let cp_time = self.index[cp_hash].time;
                if block.header.time < cp_time {
                    return Err(Rejection::dos(
                        100,
                        "block time stamp before the last checkpoint",
                    )
                    .into());
                }
            }
        }

        if !self.index.contains_key(&block.header.prev_block) {
            debug!(
                block = %short_hash(&id),
                parent = %short_hash(&block.header.prev_block),
                "orphan block"
            );
            if from_peer {
                let parent = block.header.prev_block;
                self.orphan_blocks.insert(id, block);
                self.orphans_by_prev.entry(parent).or_default().push(id);
                let root = self.orphan_root(&id);
                let missing = self.wanted_by_orphan(&id);
                return Ok(ProcessOutcome::Orphan { root, missing_parent: missing });
            }
            return Err(Rejection::benign("orphan block from a non-peer source").into());
        }

        let mut relay = Vec::new();
        let accepted = self.accept_block(mempool, &block)?;
        if accepted.became_tip {
            relay.push(accepted.id);
        }

        // drain orphans whose parent just connected
        let mut queue = vec![id];
        let mut i = 0;
        while i < queue.len() {
            let parent = queue[i];
            i += 1;
            let children = self.orphans_by_prev.remove(&parent).unwrap_or_default();
            for child in children {
                let orphan = match self.orphan_blocks.remove(&child) {
                    Some(b) => b,
                    None => continue,
                };
                match self.accept_block(mempool, &orphan) {
                    Ok(acc) => {
                        if acc.became_tip {
                            relay.push(acc.id);
                        }
                        queue.push(child);
                    }
                    Err(e) => {
                        debug!(block = %short_hash(&child), error = %e, "orphan rejected");
                    }
                }
            }
        }

        debug!(block = %short_hash(&id), "block accepted");
        Ok(ProcessOutcome::Accepted { relay })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxIn, TxOut};

    fn coinbase_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x02],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut { value: 50 * COIN, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn spend_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint { txid: [5; 32], index: 0 },
                script_sig: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut { value: 1000, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    #[test]
    fn check_transaction_structure_rules() {
        let mut tx = spend_tx();
        assert!(check_transaction(&tx).is_ok());

        let empty_in = Transaction { inputs: vec![], ..tx.clone() };
        assert_eq!(check_transaction(&empty_in).unwrap_err().dos, 10);

        let empty_out = Transaction { outputs: vec![], ..tx.clone() };
        assert_eq!(check_transaction(&empty_out).unwrap_err().dos, 10);

        tx.outputs[0].value = -5;
        assert_eq!(check_transaction(&tx).unwrap_err().dos, 100);
        tx.outputs[0].value = MAX_MONEY + 1;
        assert_eq!(check_transaction(&tx).unwrap_err().dos, 100);
    }

    #[test]
    fn check_transaction_output_sum_overflow() {
        let mut tx = spend_tx();
        tx.outputs = vec![
            TxOut { value: MAX_MONEY, script_pubkey: vec![] },
            TxOut { value: MAX_MONEY, script_pubkey: vec![] },
        ];
        assert_eq!(check_transaction(&tx).unwrap_err().dos, 100);
    }

    #[test]
    fn check_transaction_duplicate_inputs() {
        let mut tx = spend_tx();
        tx.inputs.push(tx.inputs[0].clone());
        let err = check_transaction(&tx).unwrap_err();
        assert_eq!(err.dos, 0);
    }

    #[test]
    fn check_transaction_coinbase_script_bounds() {
        let mut cb = coinbase_tx();
        assert!(check_transaction(&cb).is_ok());

        cb.inputs[0].script_sig = vec![0x01];
        assert_eq!(check_transaction(&cb).unwrap_err().dos, 100);

        cb.inputs[0].script_sig = vec![0; 101];
        assert_eq!(check_transaction(&cb).unwrap_err().dos, 100);
    }

    #[test]
    fn check_transaction_null_prevout() {
        let mut tx = spend_tx();
        tx.inputs[0].prevout = OutPoint::null();
        tx.inputs.push(TxIn {
            prevout: OutPoint { txid: [1; 32], index: 0 },
            script_sig: vec![],
            sequence: SEQUENCE_FINAL,
        });
        // two inputs, one null: not a coinbase, so the null input scores
        assert_eq!(check_transaction(&tx).unwrap_err().dos, 10);
    }

    #[test]
    fn legacy_sigops_counts_all_scripts() {
        let mut tx = spend_tx();
        tx.inputs[0].script_sig = vec![script::OP_CHECKSIG];
        tx.outputs[0].script_pubkey = vec![script::OP_CHECKSIG, script::OP_CHECKMULTISIG];
        assert_eq!(legacy_sigops(&tx), 22);
    }
}
