//! The miner: builds block templates from the mempool by priority then
//! fee rate, manages the coinbase extra nonce, and runs the nonce search
//! loop, submitting solved blocks through the same ingress as network
//! blocks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::chain::{ChainState, ConnectCtx, FetchedInputs, ProcessOutcome, SpendContext, TxIndexOverlay};
use crate::constants::{COIN, MAX_BLOCK_SIGOPS, MIN_TX_FEE, SEQUENCE_FINAL};
use crate::economic::proof_of_work_reward;
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::net::NetEngine;
use crate::node::Node;
use crate::pow::{expand_target, U256};
use crate::script;
use crate::store::DiskTxPos;
use crate::types::{short_hash, Block, BlockHeader, Hash, OutPoint, Transaction, TxIn, TxOut, ZERO_HASH};

/// Template construction limits, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct TemplateLimits {
    pub max_size: usize,
    pub min_size: usize,
    pub priority_size: usize,
}

impl TemplateLimits {
    pub fn from_config(config: &crate::config::NodeConfig) -> Self {
        TemplateLimits {
            max_size: config.block_max_size,
            min_size: config.block_min_size,
            priority_size: config.block_priority_size,
        }
    }
}

/// Priority at which a transaction no longer counts as high priority.
fn priority_floor() -> f64 {
    COIN as f64 * 144.0 / 250.0
}

struct Candidate {
    tx: Transaction,
    txid: Hash,
    size: usize,
    priority: f64,
    fee_per_kb: f64,
    depends: HashSet<Hash>,
}

/// Build a candidate block on the current tip: a coinbase paying the
/// reward plus fees to `coinbase_script`, then mempool transactions by
/// priority until the priority budget is spent, by fee rate afterwards.
pub fn create_new_block(
    chain: &ChainState,
    mempool: &Mempool,
    coinbase_script: Vec<u8>,
    limits: &TemplateLimits,
) -> Result<Block, ChainError> {
    let tip = chain
        .tip()
        .ok_or_else(|| crate::error::NodeError::Corruption("mining without a chain".into()))?;
    let tip_id = tip.id;
    let tip_height = tip.height;
    let height = tip_height + 1;

    let mut coinbase = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![script::OP_0, script::OP_0],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut { value: 0, script_pubkey: coinbase_script }],
        lock_time: 0,
    };

    // height of the block each indexed transaction landed in, for input
    // age in the priority formula
    let mut position_heights: HashMap<(u32, u32), i32> = HashMap::new();
    let mut cursor = Some(tip_id);
    while let Some(id) = cursor {
        let node = match chain.get(&id) {
            Some(n) => n,
            None => break,
        };
        position_heights.insert((node.file, node.block_pos), node.height);
        cursor = if node.prev == ZERO_HASH { None } else { Some(node.prev) };
    }

    let block_time = {
        let median = chain.median_time_past(&tip_id);
        std::cmp::max(median + 1, chain.adjusted_time()) as u32
    };

    // gather candidates with priorities and in-pool dependencies
    let mut ready: Vec<Candidate> = Vec::new();
    let mut waiting: Vec<Candidate> = Vec::new();
    for (txid, tx) in mempool.iter() {
        if tx.is_coinbase() || !tx.is_final(height, block_time as i64) {
            continue;
        }
        let size = tx.serialized_size();
        let mut priority = 0.0;
        let mut total_in: i64 = 0;
        let mut depends = HashSet::new();
        let mut resolvable = true;

        for input in &tx.inputs {
            if let Some(parent) = mempool.lookup(&input.prevout.txid) {
                // in-pool parent: counts toward the fee but carries no age
                if let Some(out) = parent.outputs.get(input.prevout.index as usize) {
                    total_in += out.value;
                }
                depends.insert(input.prevout.txid);
                continue;
            }
            let entry = match chain.store.read_tx_index(&input.prevout.txid) {
                Ok(Some(e)) => e,
                _ => {
                    resolvable = false;
                    break;
                }
            };
            let prev_tx = match chain.store.read_tx_at(&entry.pos) {
                Ok(t) => t,
                Err(_) => {
                    resolvable = false;
                    break;
                }
            };
            let value = match prev_tx.outputs.get(input.prevout.index as usize) {
                Some(out) => out.value,
                None => {
                    resolvable = false;
                    break;
                }
            };
            total_in += value;
            let depth = position_heights
                .get(&(entry.pos.file, entry.pos.block_pos))
                .map(|h| (height - h).max(1))
                .unwrap_or(1);
            priority += value as f64 * depth as f64;
        }
        if !resolvable {
            continue;
        }

        priority /= size as f64;
        let fees = total_in - tx.value_out();
        let fee_per_kb = fees as f64 / (size as f64 / 1000.0);

        let candidate =
            Candidate { tx: tx.clone(), txid: *txid, size, priority, fee_per_kb, depends };
        if candidate.depends.is_empty() {
            ready.push(candidate);
        } else {
            waiting.push(candidate);
        }
    }

    // selection loop
    let mut overlay = TxIndexOverlay::new();
    let mut included: Vec<Transaction> = Vec::new();
    let mut block_size = 1000usize;
    let mut block_sigops = 100usize;
    let mut fees_total: i64 = 0;
    let mut sorted_by_fee = limits.priority_size == 0;

    while !ready.is_empty() {
        // highest priority first, highest fee rate after the cutover
        let best = if sorted_by_fee {
            ready
                .iter()
                .enumerate()
                .max_by(|a, b| {
                    a.1.fee_per_kb
                        .partial_cmp(&b.1.fee_per_kb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .unwrap_or(0)
        } else {
            ready
                .iter()
                .enumerate()
                .max_by(|a, b| {
                    a.1.priority.partial_cmp(&b.1.priority).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .unwrap_or(0)
        };
        let candidate = ready.swap_remove(best);

        if block_size + candidate.size >= limits.max_size {
            continue;
        }
        let tx_sigops = crate::chain::legacy_sigops(&candidate.tx);
        if block_sigops + tx_sigops >= MAX_BLOCK_SIGOPS {
            continue;
        }

        // skip free transactions once past the minimum block size
        if sorted_by_fee
            && candidate.fee_per_kb < MIN_TX_FEE as f64
            && block_size + candidate.size >= limits.min_size
        {
            continue;
        }

        // cut over from priority to fee ordering
        if !sorted_by_fee
            && (block_size + candidate.size >= limits.priority_size
                || candidate.priority < priority_floor())
        {
            sorted_by_fee = true;
        }

        // dependencies are already in the block, so connection can only
        // fail for real reasons
        let mut trial_overlay = overlay.clone();
        let mut fetched =
            match chain.fetch_inputs(&candidate.tx, &trial_overlay, false, true, Some(mempool)) {
                Ok(FetchedInputs::Complete(map)) => map,
                Ok(FetchedInputs::Missing) => continue,
                Err(_) => continue,
            };
        let spend = SpendContext {
            height,
            walk_from: Some(tip_id),
            in_block: false,
            for_miner: true,
            strict_p2sh: true,
        };
        let tx_fees = match chain.connect_inputs_at(
            &candidate.tx,
            &mut fetched,
            &mut trial_overlay,
            DiskTxPos::MEMORY,
            &spend,
        ) {
            Ok(fees) => fees,
            Err(_) => continue,
        };
        trial_overlay.insert(
            candidate.txid,
            Some(crate::store::TxIndexEntry::new(DiskTxPos::MEMORY, candidate.tx.outputs.len())),
        );
        overlay = trial_overlay;

        block_size += candidate.size;
        block_sigops += tx_sigops;
        fees_total += tx_fees;
        debug!(
            tx = %short_hash(&candidate.txid),
            priority = candidate.priority,
            fee_per_kb = candidate.fee_per_kb,
            "template transaction"
        );
        let included_id = candidate.txid;
        included.push(candidate.tx);

        // wake transactions that were waiting on this one
        let mut still_waiting = Vec::new();
        for mut w in waiting {
            w.depends.remove(&included_id);
            if w.depends.is_empty() {
                // fee becomes known once parents resolve in the block
                ready.push(w);
            } else {
                still_waiting.push(w);
            }
        }
        waiting = still_waiting;
    }

    info!(transactions = included.len(), size = block_size, "created block template");

    coinbase.outputs[0].value = proof_of_work_reward(chain.params.network, height, fees_total);
    let mut transactions = vec![coinbase];
    transactions.extend(included);

    let mut block = Block {
        header: BlockHeader {
            version: 2,
            prev_block: tip_id,
            merkle_root: ZERO_HASH,
            time: block_time,
            bits: chain.next_work_required(Some(&tip_id), block_time),
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.merkle_root();

    // dry-run the full connection to finalize validity
    let ctx = ConnectCtx { id: None, height, time: block.header.time, file: 0, block_pos: 0 };
    let mut check_overlay = TxIndexOverlay::new();
    chain.connect_block(&block, &ctx, &mut check_overlay, Some(mempool), true)?;

    Ok(block)
}

/// Extra-nonce state for one worker, reset whenever the tip moves.
#[derive(Debug, Default)]
pub struct ExtraNonce {
    value: u32,
    last_prev: Hash,
}

/// Bump the extra nonce in the coinbase script and rebuild the merkle
/// root. The script starts with the height, as version-2 blocks require.
pub fn increment_extra_nonce(block: &mut Block, height: i32, state: &mut ExtraNonce) {
    if state.last_prev != block.header.prev_block {
        state.value = 0;
        state.last_prev = block.header.prev_block;
    }
    state.value += 1;

    let mut script_sig = script::push_number(height as i64);
    script_sig.extend_from_slice(&script::push_number(state.value as i64));
    debug_assert!(script_sig.len() <= 100);
    block.transactions[0].inputs[0].script_sig = script_sig;
    block.header.merkle_root = block.merkle_root();
}

/// Validate a solved header and submit the block through the normal
/// ingress. Stale solutions are dropped.
pub fn check_work(
    chain: &mut ChainState,
    mempool: &mut Mempool,
    block: Block,
) -> Result<Vec<Hash>, ChainError> {
    let height = chain
        .get(&block.header.prev_block)
        .map(|parent| parent.height + 1)
        .unwrap_or_default();
    let pow = chain.params.pow_hash(&block.header, height);
    let target = expand_target(block.header.bits)
        .ok_or_else(|| crate::error::Rejection::benign("unencodable target"))?;
    if U256::from_le_bytes(&pow) > target {
        return Err(crate::error::Rejection::benign("hash above target").into());
    }
    if Some(block.header.prev_block) != chain.best_hash() {
        return Err(crate::error::Rejection::benign("generated block is stale").into());
    }

    info!(
        block = %short_hash(&block.hash()),
        reward = block.transactions[0].value_out(),
        "proof of work found"
    );
    match chain.process_block(mempool, block, false)? {
        ProcessOutcome::Accepted { relay } => Ok(relay),
        ProcessOutcome::Orphan { .. } => {
            Err(crate::error::Rejection::benign("generated block became an orphan").into())
        }
    }
}

/// One mining worker: rebuild the template when the chain or pool moves,
/// search nonces, and submit solutions.
pub fn miner_loop(node: Arc<Node>, engine: Option<Arc<NetEngine>>, coinbase_script: Vec<u8>) {
    info!("miner started");
    let limits = TemplateLimits::from_config(&node.config);
    let mut extra_nonce = ExtraNonce::default();

    while !node.is_shutdown() {
        // wait for a connection and for the chain to catch up
        if let Some(engine) = &engine {
            let syncing = {
                let chain = node.chain.lock().unwrap();
                chain.is_initial_block_download()
            };
            if engine.peer_count() == 0 || syncing {
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        }

        let (mut block, template_updates, template_tip, height) = {
            let chain = node.chain.lock().unwrap();
            let mempool = node.mempool.lock().unwrap();
            let tip = match chain.best_hash() {
                Some(t) => t,
                None => continue,
            };
            let block = match create_new_block(&chain, &mempool, coinbase_script.clone(), &limits)
            {
                Ok(b) => b,
                Err(e) => {
                    debug!(error = %e, "template construction failed");
                    drop(mempool);
                    drop(chain);
                    thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };
            (block, mempool.updates(), tip, chain.height() + 1)
        };
        increment_extra_nonce(&mut block, height, &mut extra_nonce);

        let target = match expand_target(block.header.bits) {
            Some(t) => t,
            None => continue,
        };
        let started = Node::unix_time();

        'search: loop {
            for _ in 0..256 {
                let pow = {
                    let chain = node.chain.lock().unwrap();
                    chain.params.pow_hash(&block.header, height)
                };
                if U256::from_le_bytes(&pow) <= target {
                    let relay = {
                        let mut chain = node.chain.lock().unwrap();
                        let mut mempool = node.mempool.lock().unwrap();
                        check_work(&mut chain, &mut mempool, block.clone())
                    };
                    match relay {
                        Ok(hashes) => {
                            if let Some(engine) = &engine {
                                for hash in hashes {
                                    engine.announce_block(hash);
                                }
                            }
                        }
                        Err(e) => debug!(error = %e, "solved block not accepted"),
                    }
                    break 'search;
                }
                block.header.nonce = block.header.nonce.wrapping_add(1);
                if block.header.nonce == 0 {
                    // nonce space exhausted; refresh the template
                    break 'search;
                }
            }

            if node.is_shutdown() {
                return;
            }
            {
                let chain = node.chain.lock().unwrap();
                if chain.best_hash() != Some(template_tip) {
                    break 'search;
                }
            }
            let pool_updates = node.mempool.lock().unwrap().updates();
            if pool_updates != template_updates && Node::unix_time() - started > 60 {
                break 'search;
            }
        }
    }
    info!("miner stopped");
}
