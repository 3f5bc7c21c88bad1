//! Mempool acceptance scenarios: double-spend rejection, fee policy,
//! free-relay rate limiting, maturity, and orphan transaction handling.

mod common;

use common::*;
use embercoin::constants::{COIN, SEQUENCE_FINAL};
use embercoin::error::ChainError;
use embercoin::mempool::{Mempool, OrphanTxPool, PoolAddOutcome};
use embercoin::types::{OutPoint, Transaction, TxIn, TxOut};

#[test]
fn accepts_standard_spend_with_fee() {
    let mut chain = test_chain("accept");
    let mut mempool = Mempool::new(15);
    let blocks = extend_chain(&mut chain, &mut mempool, 101);

    let tx = spend_coinbase(&blocks[0], &chain, 49 * COIN, 1);
    let txid = tx.txid();
    let outcome = mempool.accept(&chain, tx, true, false).unwrap();
    assert_eq!(outcome, PoolAddOutcome::Accepted);
    assert!(mempool.exists(&txid));
}

#[test]
fn double_spend_rejected_without_score() {
    let mut chain = test_chain("double-spend");
    let mut mempool = Mempool::new(15);
    let blocks = extend_chain(&mut chain, &mut mempool, 101);

    let t1 = spend_coinbase(&blocks[0], &chain, 49 * COIN, 1);
    mempool.accept(&chain, t1, true, false).unwrap();
    let pool_size = mempool.len();
    let updates = mempool.updates();

    // T2 spends the same outpoint: rejected, replacement is disabled,
    // and the submitter is not scored
    let t2 = spend_coinbase(&blocks[0], &chain, 48 * COIN, 2);
    let err = mempool.accept(&chain, t2, true, false).unwrap_err();
    match err {
        ChainError::Rejected(r) => assert_eq!(r.dos, 0),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(mempool.len(), pool_size);
    assert_eq!(mempool.updates(), updates);
}

#[test]
fn coinbase_rejected_as_loose_transaction() {
    let mut chain = test_chain("loose-coinbase");
    let mut mempool = Mempool::new(15);
    extend_chain(&mut chain, &mut mempool, 1);

    let tip = chain.best_hash().unwrap();
    let node = chain.get(&tip).unwrap();
    let block = chain.store.read_block(node.file, node.block_pos).unwrap();
    let err = mempool.accept(&chain, block.transactions[0].clone(), true, false).unwrap_err();
    assert_eq!(err.dos_score(), 100);
}

#[test]
fn immature_coinbase_spend_rejected() {
    let mut chain = test_chain("immature");
    let mut mempool = Mempool::new(15);
    let blocks = extend_chain(&mut chain, &mut mempool, 50);

    // fifty confirmations are not enough
    let tx = spend_coinbase(&blocks[0], &chain, 49 * COIN, 1);
    let err = mempool.accept(&chain, tx, true, false).unwrap_err();
    assert_eq!(err.dos_score(), 0);
    assert!(err.to_string().contains("coinbase"));
}

#[test]
fn missing_inputs_signal_orphan_promotion() {
    let mut chain = test_chain("missing");
    let mut mempool = Mempool::new(15);
    extend_chain(&mut chain, &mut mempool, 101);

    let tx = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint { txid: [0xAB; 32], index: 0 },
            script_sig: vec![0x51],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut { value: COIN, script_pubkey: p2pkh_script(1) }],
        lock_time: 0,
    };
    let outcome = mempool.accept(&chain, tx.clone(), true, false).unwrap();
    assert_eq!(outcome, PoolAddOutcome::MissingInputs);

    // the caller promotes it into the orphan pool
    let mut orphans = OrphanTxPool::new();
    orphans.add(tx.clone());
    assert!(orphans.contains(&tx.txid()));
    assert_eq!(orphans.dependents_of(&[0xAB; 32]).len(), 1);
}

#[test]
fn orphan_connects_once_parent_arrives() {
    let mut chain = test_chain("orphan-chain");
    let mut mempool = Mempool::new(15);
    let blocks = extend_chain(&mut chain, &mut mempool, 101);

    let parent = spend_coinbase(&blocks[0], &chain, 49 * COIN, 1);
    let parent_id = parent.txid();
    let child = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint { txid: parent_id, index: 0 },
            script_sig: vec![0x51],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut { value: 48 * COIN, script_pubkey: p2pkh_script(2) }],
        lock_time: 0,
    };

    // child first: inputs missing
    assert_eq!(
        mempool.accept(&chain, child.clone(), true, false).unwrap(),
        PoolAddOutcome::MissingInputs
    );

    // parent, then the child connects against the in-pool parent
    assert_eq!(
        mempool.accept(&chain, parent, true, false).unwrap(),
        PoolAddOutcome::Accepted
    );
    assert_eq!(
        mempool.accept(&chain, child.clone(), true, false).unwrap(),
        PoolAddOutcome::Accepted
    );
    assert!(mempool.exists(&child.txid()));
}

#[test]
fn insufficient_fee_rejected() {
    let mut chain = test_chain("low-fee");
    let mut mempool = Mempool::new(15);
    let blocks = extend_chain(&mut chain, &mut mempool, 101);

    // an output below the dust bound demands an extra base fee the
    // transaction does not pay
    let node = chain.get(&blocks[0]).unwrap();
    let funding = chain.store.read_block(node.file, node.block_pos).unwrap();
    let tx = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint { txid: funding.transactions[0].txid(), index: 0 },
            script_sig: vec![0x51],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![
            TxOut { value: 100, script_pubkey: p2pkh_script(1) },
            TxOut { value: 50 * COIN - 101, script_pubkey: p2pkh_script(2) },
        ],
        lock_time: 0,
    };
    let err = mempool.accept(&chain, tx, true, false).unwrap_err();
    assert!(err.to_string().contains("fees"));
}

#[test]
fn free_relay_rate_limited() {
    let mut chain = test_chain("free-relay");
    let mut mempool = Mempool::new(0); // zero budget: one free ride only
    let blocks = extend_chain(&mut chain, &mut mempool, 110);

    // full-value spends of mature coinbases: zero fee, no dust outputs
    let free_tx = |i: usize, tag: u8| spend_coinbase(&blocks[i], &chain, 50 * COIN, tag);

    assert_eq!(
        mempool.accept(&chain, free_tx(0, 1), true, false).unwrap(),
        PoolAddOutcome::Accepted
    );
    let err = mempool.accept(&chain, free_tx(1, 2), true, false).unwrap_err();
    assert!(err.to_string().contains("rate limiter"));

    // transactions of our own bypass the limiter
    assert_eq!(
        mempool.accept(&chain, free_tx(2, 3), true, true).unwrap(),
        PoolAddOutcome::Accepted
    );
}

#[test]
fn nonstandard_rejected_on_mainnet() {
    let mut chain = test_chain("nonstandard");
    let mut mempool = Mempool::new(15);
    let blocks = extend_chain(&mut chain, &mut mempool, 101);

    let mut tx = spend_coinbase(&blocks[0], &chain, 49 * COIN, 1);
    tx.outputs[0].script_pubkey = vec![0x6a]; // bare OP_RETURN-style oddity
    let err = mempool.accept(&chain, tx, true, false).unwrap_err();
    assert!(err.to_string().contains("nonstandard"));
}

#[test]
fn resurrection_path_skips_input_checks() {
    let mut chain = test_chain("resurrect");
    let mut mempool = Mempool::new(15);
    extend_chain(&mut chain, &mut mempool, 2);

    // inputs reference nothing we know, but the resurrection path only
    // applies structural and conflict rules
    let tx = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint { txid: [0xEE; 32], index: 0 },
            script_sig: vec![0x51],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut { value: COIN, script_pubkey: p2pkh_script(9) }],
        lock_time: 0,
    };
    assert_eq!(
        mempool.accept(&chain, tx.clone(), false, false).unwrap(),
        PoolAddOutcome::Accepted
    );

    // the same outpoint cannot be taken twice even on this path
    let mut conflicting = tx;
    conflicting.outputs[0].value = 2 * COIN;
    let err = mempool.accept(&chain, conflicting, false, false).unwrap_err();
    assert_eq!(err.dos_score(), 0);
}
