//! Difficulty retargeting across real chains: carry-over between
//! retargets, the full recalculation at an interval boundary, and the
//! testnet minimum-difficulty rules.

mod common;

use std::sync::Arc;

use common::*;
use embercoin::chain::ChainState;
use embercoin::checkpoints::CheckpointMode;
use embercoin::mempool::Mempool;
use embercoin::params::ChainParams;
use embercoin::pow::{compress_target, expand_target};
use embercoin::script::AcceptAllVerifier;
use embercoin::store::BlockStore;

fn testnet_chain(tag: &str) -> ChainState {
    let params = ChainParams::testnet()
        .with_hasher(Arc::new(ZeroPow))
        .with_verifier(Arc::new(AcceptAllVerifier));
    let store = BlockStore::open_temporary(&scratch_dir(tag), params.magic).unwrap();
    let mut chain = ChainState::open(params, store, CheckpointMode::Strict).unwrap();
    let genesis_time = chain.params.genesis.header.time as i64;
    chain.set_mock_time(genesis_time + 90 * 250);
    chain
}

#[test]
fn bits_carry_over_between_retargets() {
    let mut chain = test_chain("carry");
    let mut mempool = Mempool::new(15);
    let blocks = extend_chain(&mut chain, &mut mempool, 20);

    let genesis_bits = chain.params.genesis.header.bits;
    for id in &blocks {
        assert_eq!(chain.get(id).unwrap().bits, genesis_bits);
    }
}

#[test]
fn genesis_has_no_work_requirement() {
    let chain = test_chain("no-prev");
    assert_eq!(chain.next_work_required(None, 0), chain.params.pow_limit_bits);
}

#[test]
fn testnet_retargets_at_interval_boundary() {
    let mut chain = testnet_chain("boundary");
    let mut mempool = Mempool::new(15);

    // era-three testnet parameters: 45-second spacing, 126-block window.
    // our blocks land 90 seconds apart, so the retarget at height 126
    // relaxes the target; it clamps at the proof-of-work limit.
    let blocks = extend_chain(&mut chain, &mut mempool, 126);
    let retarget_block = chain.get(&blocks[125]).unwrap();
    assert_eq!(retarget_block.height, 126);
    assert_eq!(retarget_block.bits, chain.params.pow_limit_bits);

    // the genesis target was tighter than the limit
    assert!(
        expand_target(chain.params.genesis.header.bits).unwrap()
            < expand_target(chain.params.pow_limit_bits).unwrap()
    );
}

#[test]
fn testnet_resets_after_two_missed_spacings() {
    let mut chain = testnet_chain("reset");
    let mut mempool = Mempool::new(15);
    extend_chain(&mut chain, &mut mempool, 3);

    let tip = chain.best_hash().unwrap();
    let tip_time = chain.get(&tip).unwrap().time;

    // just inside two spacings: the previous target carries over
    let bits_on_time = chain.next_work_required(Some(&tip), tip_time + 90);
    assert_eq!(bits_on_time, chain.params.genesis.header.bits);

    // past two spacings: reset to the minimum difficulty
    let bits_late = chain.next_work_required(Some(&tip), tip_time + 91);
    assert_eq!(bits_late, chain.params.pow_limit_bits);
}

#[test]
fn testnet_walks_past_reset_blocks_for_inheritance() {
    let mut chain = testnet_chain("walk");
    let mut mempool = Mempool::new(15);
    extend_chain(&mut chain, &mut mempool, 3);

    // accept a minimum-difficulty block after a stall
    let tip = chain.best_hash().unwrap();
    let tip_node_time = chain.get(&tip).unwrap().time;
    let mut stalled = make_block(&chain, tip, vec![], 7);
    stalled.header.time = tip_node_time + 200;
    stalled.header.bits = chain.next_work_required(Some(&tip), stalled.header.time);
    stalled.header.merkle_root = stalled.merkle_root();
    assert_eq!(stalled.header.bits, chain.params.pow_limit_bits);
    let stalled_id = stalled.hash();
    chain.process_block(&mut mempool, stalled, false).unwrap();

    // the next on-time block inherits the last regular difficulty, not
    // the reset one
    let bits_next =
        chain.next_work_required(Some(&stalled_id), tip_node_time + 200 + 90);
    assert_eq!(bits_next, chain.params.genesis.header.bits);
}

#[test]
fn modern_era_resets_to_switch_limit() {
    let chain = test_chain("switch-limit");
    // the reset target at the hash-function switch has its own compact
    // form, below the general proof-of-work limit
    let switch_bits = compress_target(&chain.params.switch_limit);
    assert_eq!(switch_bits, 0x1d3f_ffff);
    assert!(
        expand_target(switch_bits).unwrap() < expand_target(chain.params.pow_limit_bits).unwrap()
    );
}
