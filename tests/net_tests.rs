//! Peer-engine scenarios driven through the message handlers: handshake,
//! inventory exchange, transaction and block relay, orphan fetching, and
//! signed checkpoint application.

mod common;

use std::sync::Arc;

use common::*;
use embercoin::checkpoints::{CheckpointMode, SyncCheckpoint};
use embercoin::config::NodeConfig;
use embercoin::constants::{COIN, NODE_NETWORK, PROTOCOL_VERSION};
use embercoin::mempool::Mempool;
use embercoin::net::{handle_message, Broadcast};
use embercoin::node::Node;
use embercoin::peer::{HandshakeState, Peer};
use embercoin::store::BlockStore;
use embercoin::types::ZERO_HASH;
use embercoin::wire::{Inv, NetAddress, NetworkMessage, VersionPayload, MSG_BLOCK};

fn test_node_with_params(params: embercoin::ChainParams, tag: &str) -> Arc<Node> {
    let store = BlockStore::open_temporary(&scratch_dir(tag), params.magic).unwrap();
    let mut chain =
        embercoin::chain::ChainState::open(params.clone(), store, CheckpointMode::Strict).unwrap();
    chain.set_mock_time(chain.params.genesis.header.time as i64 + 90 * 250);
    Node::assemble(NodeConfig::default(), params, chain)
}

fn test_node(tag: &str) -> Arc<Node> {
    test_node_with_params(test_params(), tag)
}

fn remote_peer() -> Peer {
    Peer::new(3, "203.0.113.50:9555".parse().unwrap(), true, Node::unix_time())
}

fn handshake(node: &Node, peer: &mut Peer) {
    let payload = VersionPayload {
        version: PROTOCOL_VERSION,
        services: NODE_NETWORK,
        timestamp: Node::unix_time(),
        addr_recv: NetAddress { services: 0, ip: [0; 16], port: 0 },
        addr_from: NetAddress { services: 0, ip: [0; 16], port: 0 },
        nonce: node.local_nonce ^ 0x5555,
        sub_version: "/peer:1.0/".into(),
        start_height: 0,
    };
    handle_message(node, peer, NetworkMessage::Version(payload)).unwrap();
    handle_message(node, peer, NetworkMessage::Verack).unwrap();
    assert_eq!(peer.state, HandshakeState::Handshaken);
    peer.send_queue.clear();
}

fn grow_chain(node: &Node, count: usize) -> Vec<embercoin::types::Hash> {
    let mut chain = node.chain.lock().unwrap();
    let mut mempool = node.mempool.lock().unwrap();
    let blocks = extend_chain(&mut chain, &mut mempool, count);
    // step the clock past the update window so the node no longer counts
    // as syncing
    let now = chain.adjusted_time();
    chain.set_mock_time(now + 11);
    blocks
}

#[test]
fn transaction_relay_and_orphan_resolution() {
    let node = test_node("tx-relay");
    let mut peer = remote_peer();
    handshake(&node, &mut peer);
    let blocks = grow_chain(&node, 101);

    let parent = {
        let chain = node.chain.lock().unwrap();
        spend_coinbase(&blocks[0], &chain, 49 * COIN, 1)
    };
    let parent_id = parent.txid();
    let child = embercoin::types::Transaction {
        version: 1,
        inputs: vec![embercoin::types::TxIn {
            prevout: embercoin::types::OutPoint { txid: parent_id, index: 0 },
            script_sig: vec![0x51],
            sequence: 0xffff_ffff,
        }],
        outputs: vec![embercoin::types::TxOut {
            value: 48 * COIN,
            script_pubkey: p2pkh_script(2),
        }],
        lock_time: 0,
    };
    let child_id = child.txid();

    // the child arrives first and parks in the orphan pool
    let broadcasts = handle_message(&node, &mut peer, NetworkMessage::Tx(child)).unwrap();
    assert!(broadcasts.is_empty());
    assert!(node.orphan_txs.lock().unwrap().contains(&child_id));

    // the parent arrives: both are accepted and announced
    let broadcasts = handle_message(&node, &mut peer, NetworkMessage::Tx(parent)).unwrap();
    let announced: Vec<_> = broadcasts
        .iter()
        .filter_map(|b| match b {
            Broadcast::TxInventory(inv) => Some(inv.hash),
            _ => None,
        })
        .collect();
    assert!(announced.contains(&parent_id));
    assert!(announced.contains(&child_id));
    assert!(node.mempool.lock().unwrap().exists(&child_id));
    assert!(!node.orphan_txs.lock().unwrap().contains(&child_id));
}

#[test]
fn block_relay_reaches_broadcast() {
    let node = test_node("block-relay");
    let mut peer = remote_peer();
    handshake(&node, &mut peer);
    grow_chain(&node, 2);

    let block = {
        let chain = node.chain.lock().unwrap();
        let tip = chain.best_hash().unwrap();
        make_block(&chain, tip, vec![], 5)
    };
    let id = block.hash();

    let broadcasts = handle_message(&node, &mut peer, NetworkMessage::Block(block)).unwrap();
    assert!(matches!(broadcasts.as_slice(), [Broadcast::BlockInventory(h)] if *h == id));
    assert_eq!(node.chain.lock().unwrap().best_hash(), Some(id));
}

#[test]
fn orphan_block_triggers_ancestor_fetch() {
    let node = test_node("orphan-fetch");
    let mut peer = remote_peer();
    handshake(&node, &mut peer);
    grow_chain(&node, 2);

    // a block whose parent we have never seen
    let orphan = {
        let chain = node.chain.lock().unwrap();
        let tip = chain.best_hash().unwrap();
        let mut block = make_block(&chain, tip, vec![], 9);
        block.header.prev_block = [0x44; 32];
        block.header.merkle_root = block.merkle_root();
        block
    };
    let orphan_id = orphan.hash();

    let broadcasts = handle_message(&node, &mut peer, NetworkMessage::Block(orphan)).unwrap();
    assert!(broadcasts.is_empty());
    assert!(node.chain.lock().unwrap().has_orphan(&orphan_id));

    // the handler asked this peer for the gap toward the orphan root
    let sent_getblocks = peer
        .send_queue
        .iter()
        .any(|m| matches!(m, NetworkMessage::GetBlocks(l) if l.hash_stop == orphan_id));
    assert!(sent_getblocks);
    // and scheduled a direct request for the missing parent
    let due = peer.due_requests(u64::MAX);
    assert!(due.contains(&Inv::block([0x44; 32])));
}

#[test]
fn getblocks_inventory_batches_follow_locator() {
    let node = test_node("getblocks");
    let mut peer = remote_peer();
    handshake(&node, &mut peer);
    let blocks = grow_chain(&node, 10);

    let locator = {
        let chain = node.chain.lock().unwrap();
        let genesis = chain.genesis_hash().unwrap();
        chain.block_locator(Some(genesis))
    };
    handle_message(
        &node,
        &mut peer,
        NetworkMessage::GetBlocks(embercoin::wire::LocatorPayload {
            version: PROTOCOL_VERSION as u32,
            locator,
            hash_stop: ZERO_HASH,
        }),
    )
    .unwrap();

    let announced: Vec<_> = peer.inv_to_send.iter().map(|inv| inv.hash).collect();
    for id in &blocks {
        assert!(announced.contains(id), "missing inventory for a chain block");
    }
    assert!(peer.inv_to_send.iter().all(|inv| inv.kind == MSG_BLOCK));
}

#[test]
fn getheaders_returns_chain_headers() {
    let node = test_node("getheaders");
    let mut peer = remote_peer();
    handshake(&node, &mut peer);
    let blocks = grow_chain(&node, 6);

    let locator = {
        let chain = node.chain.lock().unwrap();
        chain.block_locator(Some(chain.genesis_hash().unwrap()))
    };
    handle_message(
        &node,
        &mut peer,
        NetworkMessage::GetHeaders(embercoin::wire::LocatorPayload {
            version: PROTOCOL_VERSION as u32,
            locator,
            hash_stop: ZERO_HASH,
        }),
    )
    .unwrap();

    match peer.send_queue.pop_front() {
        Some(NetworkMessage::Headers(headers)) => {
            assert_eq!(headers.len(), 6);
            assert_eq!(headers[0].hash(), blocks[0]);
        }
        other => panic!("expected headers, got {:?}", other.map(|m| m.command())),
    }
}

#[test]
fn signed_checkpoint_applies_and_relays() {
    use secp256k1::{rand as secp_rand, Secp256k1};

    let secp = Secp256k1::new();
    let (sk, pk) = secp.generate_keypair(&mut secp_rand::thread_rng());
    let mut params = test_params();
    params.checkpoint_master_key = pk.serialize().to_vec();

    let node = test_node_with_params(params, "sync-cp");
    let mut peer = remote_peer();
    handshake(&node, &mut peer);
    let blocks = grow_chain(&node, 5);

    let pinned = blocks[3];
    let checkpoint = SyncCheckpoint::create(&sk, pinned);
    let broadcasts =
        handle_message(&node, &mut peer, NetworkMessage::Checkpoint(checkpoint)).unwrap();
    assert!(matches!(broadcasts.as_slice(), [Broadcast::Checkpoint(_)]));
    assert_eq!(
        node.chain.lock().unwrap().checkpoints.sync_checkpoint,
        Some(pinned)
    );

    // a forged checkpoint is refused
    let (wrong_sk, _) = secp.generate_keypair(&mut secp_rand::thread_rng());
    let forged = SyncCheckpoint::create(&wrong_sk, blocks[4]);
    let err = handle_message(&node, &mut peer, NetworkMessage::Checkpoint(forged)).unwrap_err();
    assert_eq!(err.dos, 0);
    assert_eq!(
        node.chain.lock().unwrap().checkpoints.sync_checkpoint,
        Some(pinned)
    );
}

#[test]
fn alert_verifies_and_relays() {
    use secp256k1::{rand as secp_rand, Secp256k1};

    let secp = Secp256k1::new();
    let (sk, pk) = secp.generate_keypair(&mut secp_rand::thread_rng());
    let mut params = test_params();
    params.alert_key = pk.serialize().to_vec();

    let node = test_node_with_params(params, "alert");
    let mut peer = remote_peer();
    handshake(&node, &mut peer);

    let unsigned = embercoin::wire::UnsignedAlert {
        version: 1,
        relay_until: Node::unix_time() + 3600,
        expiration: Node::unix_time() + 3600,
        id: 1,
        cancel: 0,
        set_cancel: vec![],
        min_ver: 0,
        max_ver: 99_999,
        set_sub_ver: vec![],
        priority: 10,
        comment: String::new(),
        status_bar: "test alert".into(),
        reserved: String::new(),
    };
    let alert = embercoin::wire::AlertPayload::create(&sk, &unsigned);

    let broadcasts =
        handle_message(&node, &mut peer, NetworkMessage::Alert(alert.clone())).unwrap();
    assert!(matches!(broadcasts.as_slice(), [Broadcast::Alert(_)]));

    // duplicates are silently ignored
    let broadcasts = handle_message(&node, &mut peer, NetworkMessage::Alert(alert)).unwrap();
    assert!(broadcasts.is_empty());

    // a badly signed alert scores
    let (wrong_sk, _) = secp.generate_keypair(&mut secp_rand::thread_rng());
    let forged = embercoin::wire::AlertPayload::create(&wrong_sk, &unsigned);
    let err = handle_message(&node, &mut peer, NetworkMessage::Alert(forged)).unwrap_err();
    assert_eq!(err.dos, 10);
}

#[test]
fn version_seeds_block_download() {
    let node = test_node("seed-download");
    grow_chain(&node, 1);
    let mut peer = Peer::new(4, "203.0.113.60:9555".parse().unwrap(), false, Node::unix_time());

    let payload = VersionPayload {
        version: PROTOCOL_VERSION,
        services: NODE_NETWORK,
        timestamp: Node::unix_time(),
        addr_recv: NetAddress { services: 0, ip: [0; 16], port: 0 },
        addr_from: NetAddress { services: 0, ip: [0; 16], port: 0 },
        nonce: 99,
        sub_version: "/peer:1.0/".into(),
        start_height: 500_000,
    };
    handle_message(&node, &mut peer, NetworkMessage::Version(payload)).unwrap();

    // the peer claims more chain than us: a getblocks poll goes out
    assert!(peer
        .send_queue
        .iter()
        .any(|m| matches!(m, NetworkMessage::GetBlocks(l) if l.hash_stop == ZERO_HASH)));
}
