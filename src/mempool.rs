//! The memory pool: candidate unconfirmed transactions with per-outpoint
//! conflict detection, the relay fee policy and the free-relay rate
//! limiter, plus the capped orphan-transaction pool.

use std::collections::HashMap;

use rand::seq::IteratorRandom;
use tracing::debug;

use crate::chain::{ChainState, FetchedInputs, TxIndexOverlay};
use crate::constants::{
    MAX_BLOCK_SIZE_GEN, MAX_MONEY, MAX_ORPHAN_TRANSACTIONS, MIN_RELAY_TX_FEE, MIN_TX_FEE, TX_DUST,
};
use crate::error::{ChainError, Rejection};
use crate::script::{self, MAX_SCRIPT_SIG_SIZE};
use crate::store::DiskTxPos;
use crate::types::{short_hash, Hash, OutPoint, Transaction};

/// Which fee schedule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeMode {
    Relay,
    Block,
    Send,
}

/// Minimum fee for a transaction of `size` bytes. Free transactions are
/// allowed below the small-size thresholds; every dust output charges one
/// extra base fee; non-send modes scale the price up as the candidate
/// block approaches full.
pub fn get_min_fee(tx: &Transaction, size: usize, allow_free: bool, mode: FeeMode) -> i64 {
    let base_fee = if mode == FeeMode::Relay { MIN_RELAY_TX_FEE } else { MIN_TX_FEE };
    let new_block_size = if mode == FeeMode::Send { size } else { 1000 + size };
    let mut min_fee = (1 + size as i64 / 1000) * base_fee;

    if allow_free {
        match mode {
            FeeMode::Send => {
                if size < 2000 {
                    min_fee = 0;
                }
            }
            _ => {
                if new_block_size < 11_000 {
                    min_fee = 0;
                }
            }
        }
    }

    for output in &tx.outputs {
        if output.value < TX_DUST {
            min_fee += base_fee;
        }
    }

    if mode != FeeMode::Send && new_block_size >= MAX_BLOCK_SIZE_GEN / 2 {
        if new_block_size >= MAX_BLOCK_SIZE_GEN {
            return MAX_MONEY;
        }
        min_fee *= (MAX_BLOCK_SIZE_GEN / (MAX_BLOCK_SIZE_GEN - new_block_size)) as i64;
        if !(0..=MAX_MONEY).contains(&min_fee) {
            min_fee = MAX_MONEY;
        }
    }

    min_fee
}

/// Standardness of a loose transaction: current version, push-only input
/// scripts of bounded size, standard output templates.
pub fn is_standard_tx(tx: &Transaction) -> bool {
    if tx.version != 1 {
        return false;
    }
    for input in &tx.inputs {
        if input.script_sig.len() > MAX_SCRIPT_SIG_SIZE || !script::is_push_only(&input.script_sig)
        {
            return false;
        }
    }
    tx.outputs.iter().all(|o| script::is_standard(&o.script_pubkey))
}

/// Standardness of the scripts a transaction spends.
pub fn are_inputs_standard(tx: &Transaction, inputs: &HashMap<Hash, crate::chain::PrevTx>) -> bool {
    if tx.is_coinbase() {
        return true;
    }
    for input in &tx.inputs {
        let prev = match inputs.get(&input.prevout.txid) {
            Some(p) => p,
            None => return false,
        };
        let prev_out = match prev.tx.outputs.get(input.prevout.index as usize) {
            Some(o) => o,
            None => return false,
        };
        if script::classify(&prev_out.script_pubkey) == script::ScriptType::NonStandard {
            return false;
        }
    }
    true
}

/// Exponentially decaying byte counter limiting free relay, with a
/// ten-minute half-life.
#[derive(Debug, Clone)]
pub struct FreeRelayLimiter {
    count: f64,
    last_time: i64,
}

impl FreeRelayLimiter {
    pub fn new() -> Self {
        FreeRelayLimiter { count: 0.0, last_time: 0 }
    }

    /// Admit `size` free bytes at time `now` under `budget`, updating the
    /// counter when admitted.
    pub fn allow(&mut self, size: usize, now: i64, budget: f64) -> bool {
        let elapsed = (now - self.last_time).max(0);
        self.count *= (1.0 - 1.0 / 600.0f64).powi(elapsed as i32);
        self.last_time = now;
        if self.count > budget {
            return false;
        }
        self.count += size as f64;
        true
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

impl Default for FreeRelayLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a pool submission that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAddOutcome {
    Accepted,
    /// Inputs unknown; the caller may hold the transaction as an orphan.
    MissingInputs,
}

/// The transaction memory pool.
pub struct Mempool {
    map_tx: HashMap<Hash, Transaction>,
    map_next_tx: HashMap<OutPoint, (Hash, u32)>,
    updates: u64,
    free_limiter: FreeRelayLimiter,
    /// Free-relay budget knob, thousand-bytes per minute.
    pub limit_free_relay: i64,
}

impl Mempool {
    pub fn new(limit_free_relay: i64) -> Self {
        Mempool {
            map_tx: HashMap::new(),
            map_next_tx: HashMap::new(),
            updates: 0,
            free_limiter: FreeRelayLimiter::new(),
            limit_free_relay,
        }
    }

    pub fn len(&self) -> usize {
        self.map_tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map_tx.is_empty()
    }

    pub fn exists(&self, txid: &Hash) -> bool {
        self.map_tx.contains_key(txid)
    }

    pub fn lookup(&self, txid: &Hash) -> Option<&Transaction> {
        self.map_tx.get(txid)
    }

    /// The transaction in the pool spending an outpoint, if any.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<&Hash> {
        self.map_next_tx.get(outpoint).map(|(txid, _)| txid)
    }

    pub fn query_hashes(&self) -> Vec<Hash> {
        self.map_tx.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hash, &Transaction)> {
        self.map_tx.iter()
    }

    /// Monotonic counter bumped on every pool mutation and best-chain
    /// change; the miner watches it.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn bump_updates(&mut self) {
        self.updates += 1;
    }

    /// The full accept pipeline. `check_inputs` is disabled when
    /// resurrecting transactions during a reorganization.
    pub fn accept(
        &mut self,
        chain: &ChainState,
        tx: Transaction,
        check_inputs: bool,
        from_us: bool,
    ) -> Result<PoolAddOutcome, ChainError> {
        crate::chain::check_transaction(&tx).map_err(ChainError::Rejected)?;

        // coinbases are only valid inside blocks
        if tx.is_coinbase() {
            return Err(Rejection::dos(100, "coinbase as individual tx").into());
        }

        if tx.lock_time > i32::MAX as u32 {
            return Err(Rejection::benign("lock time beyond the 31-bit range").into());
        }

        if !chain.params.is_testnet() && !is_standard_tx(&tx) {
            return Err(Rejection::benign("nonstandard transaction type").into());
        }

        let txid = tx.txid();
        if self.map_tx.contains_key(&txid) {
            return Err(Rejection::benign("already in the pool").into());
        }
        if check_inputs && chain.store.contains_tx(&txid)? {
            return Err(Rejection::benign("already in the transaction index").into());
        }

        // conflicts with pool entries: replacement is disabled
        for input in &tx.inputs {
            if self.map_next_tx.contains_key(&input.prevout) {
                return Err(Rejection::benign("conflicts with a pool transaction").into());
            }
        }

        if check_inputs {
            let mut overlay = TxIndexOverlay::new();
            let mut fetched = match chain.fetch_inputs(&tx, &overlay, false, false, Some(&*self))? {
                FetchedInputs::Complete(map) => map,
                FetchedInputs::Missing => return Ok(PoolAddOutcome::MissingInputs),
            };

            if !chain.params.is_testnet() && !are_inputs_standard(&tx, &fetched) {
                return Err(Rejection::benign("nonstandard transaction input").into());
            }

            let value_in = chain.value_in(&tx, &fetched).map_err(ChainError::Rejected)?;
            let fees = value_in - tx.value_out();
            let size = tx.serialized_size();

            let min_fee = get_min_fee(&tx, size, true, FeeMode::Relay);
            if fees < min_fee {
                return Err(Rejection::benign(format!(
                    "not enough fees: {} < {}",
                    fees, min_fee
                ))
                .into());
            }

            // rate-limit free relay against penny flooding
            if fees < MIN_RELAY_TX_FEE {
                let budget = self.limit_free_relay as f64 * 10.0 * 1000.0;
                let now = chain.adjusted_time();
                if !from_us && !self.free_limiter.allow(size, now, budget) {
                    return Err(Rejection::benign("free transaction rejected by rate limiter")
                        .into());
                }
            }

            // full input connection in dry-run mode, signatures included
            chain.connect_inputs(
                &tx,
                &mut fetched,
                &mut overlay,
                DiskTxPos::MEMORY,
                chain.best_hash(),
                false,
                false,
                true,
            )?;
        }

        debug!(tx = %short_hash(&txid), pool = self.map_tx.len() + 1, "accepted to mempool");
        self.add_unchecked(txid, tx);
        Ok(PoolAddOutcome::Accepted)
    }

    /// Insert without validation. Callers go through [`Mempool::accept`].
    pub fn add_unchecked(&mut self, txid: Hash, tx: Transaction) {
        for (n, input) in tx.inputs.iter().enumerate() {
            self.map_next_tx.insert(input.prevout, (txid, n as u32));
        }
        self.map_tx.insert(txid, tx);
        self.updates += 1;
    }

    pub fn remove(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        if self.map_tx.remove(&txid).is_some() {
            for input in &tx.inputs {
                self.map_next_tx.remove(&input.prevout);
            }
            self.updates += 1;
        }
    }
}

/// Orphan transactions waiting for their inputs, bounded by random
/// eviction.
pub struct OrphanTxPool {
    map: HashMap<Hash, Transaction>,
    by_prev: HashMap<Hash, Vec<Hash>>,
    cap: usize,
}

impl OrphanTxPool {
    pub fn new() -> Self {
        Self::with_cap(MAX_ORPHAN_TRANSACTIONS)
    }

    pub fn with_cap(cap: usize) -> Self {
        OrphanTxPool { map: HashMap::new(), by_prev: HashMap::new(), cap }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.map.contains_key(txid)
    }

    /// Insert an orphan, evicting uniformly at random above the cap.
    /// Returns the number of evictions.
    pub fn add(&mut self, tx: Transaction) -> usize {
        let txid = tx.txid();
        if self.map.contains_key(&txid) {
            return 0;
        }
        for input in &tx.inputs {
            self.by_prev.entry(input.prevout.txid).or_default().push(txid);
        }
        self.map.insert(txid, tx);

        let mut evicted = 0;
        let mut rng = rand::thread_rng();
        while self.map.len() > self.cap {
            let victim = match self.map.keys().choose(&mut rng) {
                Some(k) => *k,
                None => break,
            };
            self.remove(&victim);
            evicted += 1;
        }
        evicted
    }

    pub fn remove(&mut self, txid: &Hash) {
        if let Some(tx) = self.map.remove(txid) {
            for input in &tx.inputs {
                if let Some(children) = self.by_prev.get_mut(&input.prevout.txid) {
                    children.retain(|c| c != txid);
                    if children.is_empty() {
                        self.by_prev.remove(&input.prevout.txid);
                    }
                }
            }
        }
    }

    /// Orphans spending outputs of `parent`, cloned for re-submission.
    pub fn dependents_of(&self, parent: &Hash) -> Vec<Transaction> {
        self.by_prev
            .get(parent)
            .map(|ids| ids.iter().filter_map(|id| self.map.get(id)).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for OrphanTxPool {
    fn default() -> Self {
        Self::new()
    }
}
