//! Shared fixtures: a chain over a temporary store with a pass-through
//! proof-of-work hasher, and block construction helpers.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use embercoin::chain::ChainState;
use embercoin::checkpoints::CheckpointMode;
use embercoin::constants::{COIN, SEQUENCE_FINAL};
use embercoin::crypto::{PowHasher, PowProfile};
use embercoin::economic::proof_of_work_reward;
use embercoin::mempool::Mempool;
use embercoin::params::ChainParams;
use embercoin::script::{self, AcceptAllVerifier};
use embercoin::store::BlockStore;
use embercoin::types::{Block, BlockHeader, Hash, OutPoint, Transaction, TxIn, TxOut, ZERO_HASH};

/// Test hasher: every header satisfies any target, so chains can be built
/// without mining.
pub struct ZeroPow;

impl PowHasher for ZeroPow {
    fn pow_hash(&self, _header: &[u8], _profile: PowProfile) -> Hash {
        [0u8; 32]
    }
}

pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "embercoin-test-{}-{}-{}",
        tag,
        std::process::id(),
        rand::random::<u32>()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn test_params() -> ChainParams {
    ChainParams::mainnet()
        .with_hasher(Arc::new(ZeroPow))
        .with_verifier(Arc::new(AcceptAllVerifier))
}

/// A fresh chain over a temporary store, clock pinned well past genesis.
pub fn test_chain(tag: &str) -> ChainState {
    let params = test_params();
    let store = BlockStore::open_temporary(&scratch_dir(tag), params.magic).unwrap();
    let mut chain = ChainState::open(params, store, CheckpointMode::Strict).unwrap();
    let genesis_time = chain.params.genesis.header.time as i64;
    chain.set_mock_time(genesis_time + 90 * 250);
    chain
}

/// Standard pay-to-pubkey-hash template so pool transactions pass the
/// standardness rules.
pub fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut s = vec![0x76, 0xa9, 0x14];
    s.extend_from_slice(&[tag; 20]);
    s.extend_from_slice(&[0x88, 0xac]);
    s
}

/// A block extending `parent`: coinbase paying the full reward, then the
/// given transactions. `extra` varies the coinbase so siblings differ.
pub fn make_block(chain: &ChainState, parent: Hash, txs: Vec<Transaction>, extra: u8) -> Block {
    let parent_node = chain.get(&parent).expect("parent in index");
    let height = parent_node.height + 1;
    let time = parent_node.time + 90;

    let mut script_sig = script::push_number(height as i64);
    script_sig.extend_from_slice(&script::push_number(extra as i64 + 1));
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxIn { prevout: OutPoint::null(), script_sig, sequence: SEQUENCE_FINAL }],
        outputs: vec![TxOut {
            value: proof_of_work_reward(chain.params.network, height, 0),
            script_pubkey: p2pkh_script(extra),
        }],
        lock_time: 0,
    };

    let mut transactions = vec![coinbase];
    transactions.extend(txs);

    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: parent,
            merkle_root: ZERO_HASH,
            time,
            bits: chain.next_work_required(Some(&parent), time),
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.merkle_root();
    block
}

/// Extend the best chain by `count` coinbase-only blocks.
pub fn extend_chain(chain: &mut ChainState, mempool: &mut Mempool, count: usize) -> Vec<Hash> {
    let mut added = Vec::new();
    for _ in 0..count {
        let tip = chain.best_hash().unwrap();
        let block = make_block(chain, tip, vec![], 0);
        let id = block.hash();
        chain.process_block(mempool, block, false).unwrap();
        assert_eq!(chain.best_hash(), Some(id));
        added.push(id);
    }
    added
}

/// A standard transaction spending one output of the coinbase in `block`.
pub fn spend_coinbase(block_id: &Hash, chain: &ChainState, pay: i64, tag: u8) -> Transaction {
    let node = chain.get(block_id).expect("block in index");
    let block = chain.store.read_block(node.file, node.block_pos).unwrap();
    let coinbase_txid = block.transactions[0].txid();
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint { txid: coinbase_txid, index: 0 },
            script_sig: vec![0x51],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut { value: pay, script_pubkey: p2pkh_script(tag) }],
        lock_time: 0,
    }
}

pub fn coin(units: i64) -> i64 {
    units * COIN
}
