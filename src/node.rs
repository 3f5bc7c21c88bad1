//! The node context: every shared singleton of the engine behind explicit
//! locks, threaded through the component APIs.
//!
//! Lock order, outer to inner: `chain` → `mempool` → `orphan_txs` → the
//! small auxiliary maps → per-peer locks. Never acquire in reverse.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::info;

use crate::chain::ChainState;
use crate::checkpoints::SyncCheckpoint;
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::mempool::{Mempool, OrphanTxPool};
use crate::params::{ChainParams, Network};
use crate::peer::{AddrBook, BanList};
use crate::store::BlockStore;
use crate::types::Hash;
use crate::wire::{AlertPayload, Inv};

/// Recently relayed transactions kept for getdata replies, expiring after
/// fifteen minutes.
#[derive(Default)]
pub struct RelayCache {
    entries: HashMap<Inv, (i64, crate::types::Transaction)>,
}

impl RelayCache {
    const EXPIRY_SECS: i64 = 15 * 60;

    pub fn insert(&mut self, inv: Inv, tx: crate::types::Transaction, now: i64) {
        self.entries.retain(|_, (stamp, _)| now - *stamp < Self::EXPIRY_SECS);
        self.entries.insert(inv, (now, tx));
    }

    pub fn get(&self, inv: &Inv) -> Option<&crate::types::Transaction> {
        self.entries.get(inv).map(|(_, tx)| tx)
    }
}

/// Shared node state. Replaces the global singletons of older designs so
/// lock membership is visible in function signatures.
pub struct Node {
    pub config: NodeConfig,
    pub params: ChainParams,

    pub chain: Mutex<ChainState>,
    pub mempool: Mutex<Mempool>,
    pub orphan_txs: Mutex<OrphanTxPool>,

    pub already_asked: Mutex<HashMap<Inv, u64>>,
    pub addr_book: Mutex<AddrBook>,
    pub bans: Mutex<BanList>,
    pub alerts: Mutex<HashMap<Hash, AlertPayload>>,
    pub latest_checkpoint: Mutex<Option<SyncCheckpoint>>,
    pub relay_cache: Mutex<RelayCache>,
    /// Best heights claimed by peers, for the download estimate.
    pub peer_heights: Mutex<Vec<i32>>,

    /// Random nonce detecting connections to ourselves.
    pub local_nonce: u64,
    shutdown: AtomicBool,
}

impl Node {
    /// Open the store and chain under the configured data directory and
    /// assemble the context.
    pub fn open(config: NodeConfig) -> Result<Arc<Node>> {
        config.validate()?;
        let network = if config.testnet { Network::Testnet } else { Network::Mainnet };
        let params = ChainParams::new(network);

        let data_dir = Path::new(&config.data_dir);
        let store = BlockStore::open(data_dir, params.magic)?;
        let chain = ChainState::open(params.clone(), store, config.checkpoint_mode())
            .map_err(|e| match e {
                crate::error::ChainError::Fatal(f) => f,
                crate::error::ChainError::Rejected(r) => NodeError::Corruption(r.reason),
            })?;

        Ok(Self::assemble(config, params, chain))
    }

    /// Assemble a node around an already-open chain (tests drive this
    /// directly with temporary stores).
    pub fn assemble(config: NodeConfig, params: ChainParams, mut chain: ChainState) -> Arc<Node> {
        chain.ibd_update_window = config.ibd_update_window_secs;
        chain.ibd_tip_age = config.ibd_tip_age_secs;
        let limit_free_relay = config.limit_free_relay;
        info!(
            network = ?params.network,
            height = chain.height(),
            "node context ready"
        );
        Arc::new(Node {
            config,
            params,
            chain: Mutex::new(chain),
            mempool: Mutex::new(Mempool::new(limit_free_relay)),
            orphan_txs: Mutex::new(OrphanTxPool::new()),
            already_asked: Mutex::new(HashMap::new()),
            addr_book: Mutex::new(AddrBook::new()),
            bans: Mutex::new(BanList::new()),
            alerts: Mutex::new(HashMap::new()),
            latest_checkpoint: Mutex::new(None),
            relay_cache: Mutex::new(RelayCache::default()),
            peer_heights: Mutex::new(Vec::new()),
            local_nonce: rand::thread_rng().gen::<u64>() | 1,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Median of the best heights peers reported, floored by the
    /// checkpoint estimate.
    pub fn peer_height_estimate(&self) -> i32 {
        let mut heights = self.peer_heights.lock().unwrap().clone();
        let checkpoint_floor =
            self.chain.lock().unwrap().checkpoints.total_blocks_estimate();
        if heights.is_empty() {
            return checkpoint_floor;
        }
        heights.sort_unstable();
        heights[heights.len() / 2].max(checkpoint_floor)
    }

    pub fn record_peer_height(&self, height: i32) {
        let mut heights = self.peer_heights.lock().unwrap();
        heights.push(height);
        if heights.len() > 5 {
            heights.remove(0);
        }
    }

    pub fn unix_time() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    pub fn unix_micros() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0)
    }
}
