//! The peer-to-peer engine: message handlers behind the version/verack
//! state machine, inventory exchange and ask-for scheduling, misbehavior
//! scoring, and the socket threads that move frames.
//!
//! Handlers are plain functions over the node context and one peer's
//! state, so the protocol logic runs the same way under tests as under
//! live sockets. They run while holding the chain lock for the duration
//! of one invocation, giving every handler a consistent snapshot.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chain::ProcessOutcome;
use crate::constants::*;
use crate::crypto::sha256d;
use crate::error::Rejection;
use crate::mempool::PoolAddOutcome;
use crate::node::Node;
use crate::peer::{HandshakeState, Peer};
use crate::types::{short_hash, Hash, ZERO_HASH};
use crate::wire::{
    encode_frame, FrameBuffer, Inv, LocatorPayload, NetAddress, NetworkMessage, TimedNetAddress,
    VersionPayload, MSG_BLOCK, MSG_TX,
};

/// Side effects a handler requests beyond its own peer's queues.
#[derive(Debug, Clone)]
pub enum Broadcast {
    /// Announce a transaction to every negotiated peer.
    TxInventory(Inv),
    /// Announce a block to peers whose reported height is near the tip.
    BlockInventory(Hash),
    /// Relay a verified alert.
    Alert(crate::wire::AlertPayload),
    /// Relay a verified sync checkpoint.
    Checkpoint(crate::checkpoints::SyncCheckpoint),
    /// Relay a fresh address to one or two deterministic peers.
    Address(TimedNetAddress),
}

/// Whether an inventory object is already known locally. Locks are taken
/// in the canonical chain → mempool → orphan order.
pub fn already_have(node: &Node, inv: &Inv) -> bool {
    match inv.kind {
        MSG_TX => {
            {
                let chain = node.chain.lock().unwrap();
                if chain.store.contains_tx(&inv.hash).unwrap_or(false) {
                    return true;
                }
            }
            if node.mempool.lock().unwrap().exists(&inv.hash) {
                return true;
            }
            node.orphan_txs.lock().unwrap().contains(&inv.hash)
        }
        MSG_BLOCK => {
            let chain = node.chain.lock().unwrap();
            chain.contains_block(&inv.hash) || chain.has_orphan(&inv.hash)
        }
        _ => true,
    }
}

/// Our version message for a given peer.
pub fn version_message(node: &Node, peer: &Peer) -> NetworkMessage {
    let height = node.chain.lock().unwrap().height();
    NetworkMessage::Version(VersionPayload {
        version: PROTOCOL_VERSION,
        services: NODE_NETWORK,
        timestamp: Node::unix_time(),
        addr_recv: NetAddress::from_socket(peer.addr, 0),
        addr_from: NetAddress { services: NODE_NETWORK, ip: [0; 16], port: 0 },
        nonce: node.local_nonce,
        sub_version: format!("/Embercoin:{}/", env!("CARGO_PKG_VERSION")),
        start_height: height,
    })
}

fn push_getblocks(node: &Node, peer: &mut Peer, from: Option<Hash>, stop: Hash) {
    let chain = node.chain.lock().unwrap();
    let anchor = from.or_else(|| chain.best_hash()).unwrap_or(ZERO_HASH);
    if peer.last_getblocks == Some((anchor, stop)) {
        return;
    }
    peer.last_getblocks = Some((anchor, stop));
    let locator = chain.block_locator(Some(anchor));
    peer.push(NetworkMessage::GetBlocks(LocatorPayload {
        version: PROTOCOL_VERSION as u32,
        locator,
        hash_stop: stop,
    }));
}

/// Dispatch one decoded message. The caller applies the returned
/// denial-of-service score and broadcasts.
pub fn handle_message(
    node: &Node,
    peer: &mut Peer,
    message: NetworkMessage,
) -> Result<Vec<Broadcast>, Rejection> {
    // a version message must come first
    if peer.state == HandshakeState::Fresh && !matches!(message, NetworkMessage::Version(_)) {
        return Err(Rejection::dos(1, "message before version"));
    }

    match message {
        NetworkMessage::Version(payload) => handle_version(node, peer, payload),
        NetworkMessage::Verack => {
            peer.state = HandshakeState::Handshaken;
            Ok(vec![])
        }
        NetworkMessage::Addr(addresses) => handle_addr(node, peer, addresses),
        NetworkMessage::Inv(inventory) => handle_inv(node, peer, inventory),
        NetworkMessage::GetData(inventory) => handle_getdata(node, peer, inventory),
        NetworkMessage::GetBlocks(locator) => handle_getblocks(node, peer, locator),
        NetworkMessage::GetHeaders(locator) => handle_getheaders(node, peer, locator),
        NetworkMessage::Headers(_) => Ok(vec![]),
        NetworkMessage::Tx(tx) => handle_tx(node, peer, tx),
        NetworkMessage::Block(block) => handle_block(node, peer, block),
        NetworkMessage::GetAddr => handle_getaddr(node, peer),
        NetworkMessage::MempoolQuery => handle_mempool_query(node, peer),
        NetworkMessage::Ping(nonce) => {
            peer.push(NetworkMessage::Pong(nonce));
            Ok(vec![])
        }
        NetworkMessage::Pong(nonce) => {
            if peer.ping_nonce == nonce && nonce != 0 {
                peer.pong_stamp_micros = Node::unix_micros();
                peer.ping_time_ms =
                    Some(peer.pong_stamp_micros.saturating_sub(peer.ping_stamp_micros) / 1000);
            }
            Ok(vec![])
        }
        NetworkMessage::Alert(alert) => handle_alert(node, peer, alert),
        NetworkMessage::Checkpoint(checkpoint) => handle_checkpoint(node, peer, checkpoint),
    }
}

fn handle_version(
    node: &Node,
    peer: &mut Peer,
    payload: VersionPayload,
) -> Result<Vec<Broadcast>, Rejection> {
    // only the first version message counts
    if peer.state != HandshakeState::Fresh {
        return Ok(vec![]);
    }

    if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&payload.version) {
        info!(peer = peer.id, version = payload.version, "incompatible peer version");
        peer.disconnect = true;
        return Ok(vec![]);
    }

    // self connection detected by nonce
    if payload.nonce == node.local_nonce {
        debug!(peer = peer.id, "connected to self, disconnecting");
        peer.disconnect = true;
        return Ok(vec![]);
    }

    peer.version = payload.version;
    peer.services = payload.services;
    peer.sub_version = payload.sub_version.clone();
    peer.start_height = payload.start_height;
    peer.state = HandshakeState::VersionReceived;

    // learn our external address as the peer sees it
    if peer.inbound && payload.addr_recv.is_routable() {
        peer.addr_local = Some(payload.addr_recv);
    }

    {
        let mut chain = node.chain.lock().unwrap();
        let offset = payload.timestamp - chain.adjusted_time();
        chain.add_time_sample(offset);
    }

    // be shy: answer an inbound version before acknowledging
    if peer.inbound {
        let version = version_message(node, peer);
        peer.push(version);
    }
    peer.push(NetworkMessage::Verack);

    if !peer.inbound {
        // ask for addresses while our view of the network is small
        if node.addr_book.lock().unwrap().len() < 1000 {
            peer.push(NetworkMessage::GetAddr);
            peer.requested_addresses = true;
        }
        let addr = NetAddress::from_socket(peer.addr, payload.services);
        node.addr_book.lock().unwrap().good(addr, Node::unix_time() as u32);
    }

    // seed block download when the peer claims more chain than we have
    let our_height = node.chain.lock().unwrap().height();
    if payload.services & NODE_NETWORK != 0 && payload.start_height > our_height {
        push_getblocks(node, peer, None, ZERO_HASH);
    }

    // share every known alert and the current sync checkpoint
    for alert in node.alerts.lock().unwrap().values() {
        peer.push(NetworkMessage::Alert(alert.clone()));
    }
    if let Some(cp) = node.latest_checkpoint.lock().unwrap().clone() {
        peer.push(NetworkMessage::Checkpoint(cp));
    }

    node.record_peer_height(payload.start_height);
    info!(
        peer = peer.id,
        version = payload.version,
        height = payload.start_height,
        "version handshake"
    );
    Ok(vec![])
}

fn handle_addr(
    node: &Node,
    peer: &mut Peer,
    addresses: Vec<TimedNetAddress>,
) -> Result<Vec<Broadcast>, Rejection> {
    if addresses.len() > 1000 {
        return Err(Rejection::dos(20, format!("oversized addr message: {}", addresses.len())));
    }

    let now = node.chain.lock().unwrap().adjusted_time();
    let since = now - 10 * 60;
    let mut broadcasts = Vec::new();
    let count = addresses.len();

    for mut timed in addresses {
        // repair absent or future time stamps
        if timed.time <= 100_000_000 || timed.time as i64 > now + 10 * 60 {
            timed.time = (now - 5 * 24 * 60 * 60) as u32;
        }
        peer.known_addresses.insert(timed.addr);

        let reachable = timed.addr.is_routable();
        if timed.time as i64 > since && !peer.requested_addresses && count <= 10 && reachable {
            broadcasts.push(Broadcast::Address(timed));
        }
        if reachable {
            node.addr_book.lock().unwrap().add(timed);
        }
    }

    if count < 1000 {
        peer.requested_addresses = false;
    }
    Ok(broadcasts)
}

fn handle_inv(
    node: &Node,
    peer: &mut Peer,
    inventory: Vec<Inv>,
) -> Result<Vec<Broadcast>, Rejection> {
    if inventory.len() > MAX_INV_SZ {
        return Err(Rejection::dos(20, format!("oversized inv message: {}", inventory.len())));
    }

    // the last block entry, for continuation requests on long side chains
    let last_block = inventory.iter().rposition(|inv| inv.kind == MSG_BLOCK);

    let now_micros = Node::unix_micros();
    for (i, inv) in inventory.iter().enumerate() {
        peer.known_inventory.insert(*inv);

        let have = already_have(node, inv);
        if !have {
            let mut asked = node.already_asked.lock().unwrap();
            peer.ask_for(*inv, &mut asked, now_micros);
            continue;
        }

        if inv.kind == MSG_BLOCK {
            let orphan_root = {
                let chain = node.chain.lock().unwrap();
                if chain.has_orphan(&inv.hash) {
                    Some(chain.orphan_root(&inv.hash))
                } else {
                    None
                }
            };
            if let Some(root) = orphan_root {
                // we hold it as an orphan: fill the gap below it
                push_getblocks(node, peer, None, root);
            } else if Some(i) == last_block {
                // we already had the terminal block of this batch; ask for
                // the continuation from there
                push_getblocks(node, peer, Some(inv.hash), ZERO_HASH);
            }
        }
    }
    Ok(vec![])
}

fn handle_getdata(
    node: &Node,
    peer: &mut Peer,
    inventory: Vec<Inv>,
) -> Result<Vec<Broadcast>, Rejection> {
    if inventory.len() > MAX_INV_SZ {
        return Err(Rejection::dos(20, format!("oversized getdata message: {}", inventory.len())));
    }

    for inv in inventory {
        match inv.kind {
            MSG_BLOCK => {
                let block = {
                    let chain = node.chain.lock().unwrap();
                    match chain.get(&inv.hash) {
                        Some(bi) => chain.store.read_block(bi.file, bi.block_pos).ok(),
                        None => None,
                    }
                };
                if let Some(block) = block {
                    peer.push(NetworkMessage::Block(block));
                }
            }
            MSG_TX => {
                let cached = node.relay_cache.lock().unwrap().get(&inv).cloned();
                let tx = match cached {
                    Some(tx) => Some(tx),
                    None => node.mempool.lock().unwrap().lookup(&inv.hash).cloned(),
                };
                if let Some(tx) = tx {
                    peer.push(NetworkMessage::Tx(tx));
                }
            }
            _ => {}
        }
    }
    Ok(vec![])
}

fn handle_getblocks(
    node: &Node,
    peer: &mut Peer,
    request: LocatorPayload,
) -> Result<Vec<Broadcast>, Rejection> {
    let now = Node::unix_time();
    if now - peer.last_getblocks_reply < LOCATOR_RESPONSE_INTERVAL as i64 {
        return Err(Rejection::benign("getblocks spam"));
    }
    peer.last_getblocks_reply = now;

    let chain = node.chain.lock().unwrap();
    let fork = match chain.find_fork_point(&request.locator) {
        Some(f) => f,
        None => return Ok(vec![]),
    };
    let stop =
        if request.hash_stop == ZERO_HASH { None } else { Some(request.hash_stop) };
    let ids = chain.main_chain_after(&fork, stop.as_ref(), GETBLOCKS_LIMIT);
    debug!(
        peer = peer.id,
        from = %short_hash(&fork),
        count = ids.len(),
        "getblocks"
    );
    let last_height = ids
        .last()
        .or(Some(&fork))
        .and_then(|id| chain.get(id))
        .map(|n| n.height)
        .unwrap_or(0);
    let best = chain.best_hash();
    let advertise_best = match (best, ids.last()) {
        (Some(best_id), last) => {
            chain.height() - last_height < 4000 && last != Some(&best_id)
        }
        _ => false,
    };

    for id in &ids {
        peer.push_inventory(Inv::block(*id));
    }
    if advertise_best {
        if let Some(best_id) = best {
            peer.push_inventory(Inv::block(best_id));
        }
    }
    Ok(vec![])
}

fn handle_getheaders(
    node: &Node,
    peer: &mut Peer,
    request: LocatorPayload,
) -> Result<Vec<Broadcast>, Rejection> {
    let now = Node::unix_time();
    if now - peer.last_getheaders_reply < LOCATOR_RESPONSE_INTERVAL as i64 {
        return Err(Rejection::benign("getheaders spam"));
    }
    peer.last_getheaders_reply = now;

    let chain = node.chain.lock().unwrap();
    let headers = if request.locator.is_empty() {
        // a null locator asks for the stop block itself onward
        match chain.get(&request.hash_stop) {
            Some(node_ref) => {
                let mut headers = vec![node_ref.header(node_ref.prev)];
                headers.extend(chain.headers_after(
                    &request.hash_stop,
                    None,
                    GETHEADERS_LIMIT - 1,
                ));
                headers
            }
            None => return Ok(vec![]),
        }
    } else {
        match chain.find_fork_point(&request.locator) {
            Some(fork) => {
                let stop =
                    if request.hash_stop == ZERO_HASH { None } else { Some(request.hash_stop) };
                chain.headers_after(&fork, stop.as_ref(), GETHEADERS_LIMIT)
            }
            None => Vec::new(),
        }
    };
    peer.push(NetworkMessage::Headers(headers));
    Ok(vec![])
}

fn handle_tx(
    node: &Node,
    peer: &mut Peer,
    tx: crate::types::Transaction,
) -> Result<Vec<Broadcast>, Rejection> {
    let txid = tx.txid();
    let inv = Inv::tx(txid);
    peer.known_inventory.insert(inv);

    let chain = node.chain.lock().unwrap();
    let mut mempool = node.mempool.lock().unwrap();
    let mut broadcasts = Vec::new();

    match mempool.accept(&chain, tx.clone(), true, false) {
        Ok(PoolAddOutcome::Accepted) => {
            let now = chain.adjusted_time();
            node.relay_cache.lock().unwrap().insert(inv, tx, now);
            node.already_asked.lock().unwrap().remove(&inv);
            broadcasts.push(Broadcast::TxInventory(inv));

            // connect any orphans that were waiting for this transaction
            let mut work = vec![txid];
            let mut i = 0;
            while i < work.len() {
                let parent = work[i];
                i += 1;
                let dependents = node.orphan_txs.lock().unwrap().dependents_of(&parent);
                for orphan in dependents {
                    let orphan_id = orphan.txid();
                    let orphan_inv = Inv::tx(orphan_id);
                    match mempool.accept(&chain, orphan.clone(), true, false) {
                        Ok(PoolAddOutcome::Accepted) => {
                            debug!(tx = %short_hash(&orphan_id), "accepted orphan transaction");
                            node.relay_cache.lock().unwrap().insert(orphan_inv, orphan, now);
                            node.already_asked.lock().unwrap().remove(&orphan_inv);
                            broadcasts.push(Broadcast::TxInventory(orphan_inv));
                            node.orphan_txs.lock().unwrap().remove(&orphan_id);
                            work.push(orphan_id);
                        }
                        Ok(PoolAddOutcome::MissingInputs) => {}
                        Err(_) => {
                            debug!(tx = %short_hash(&orphan_id), "dropping invalid orphan");
                            node.orphan_txs.lock().unwrap().remove(&orphan_id);
                        }
                    }
                }
            }
            Ok(broadcasts)
        }
        Ok(PoolAddOutcome::MissingInputs) => {
            let evicted = node.orphan_txs.lock().unwrap().add(tx);
            if evicted > 0 {
                debug!(evicted, "orphan transaction pool overflow");
            }
            Ok(vec![])
        }
        Err(e) => {
            let dos = e.dos_score();
            Err(Rejection { reason: e.to_string(), dos })
        }
    }
}

fn handle_block(
    node: &Node,
    peer: &mut Peer,
    block: crate::types::Block,
) -> Result<Vec<Broadcast>, Rejection> {
    let hash = block.hash();
    let declared = block.declared_height();

    let mut chain = node.chain.lock().unwrap();
    let mut mempool = node.mempool.lock().unwrap();

    // a block far past our tip cannot be verified any time soon
    if declared > chain.height() + 5000 {
        debug!(
            block = %short_hash(&hash),
            declared,
            "discarding distant block"
        );
        return Ok(vec![]);
    }

    let inv = Inv::block(hash);
    peer.known_inventory.insert(inv);
    debug!(block = %short_hash(&hash), peer = peer.id, "received block");

    match chain.process_block(&mut mempool, block, true) {
        Ok(ProcessOutcome::Accepted { relay }) => {
            node.already_asked.lock().unwrap().remove(&inv);
            Ok(relay.into_iter().map(Broadcast::BlockInventory).collect())
        }
        Ok(ProcessOutcome::Orphan { root, missing_parent }) => {
            // fetch the gap: the ancestor chain toward the orphan's root,
            // plus the missing parent directly
            let ibd = chain.is_initial_block_download();
            drop(mempool);
            drop(chain);
            push_getblocks(node, peer, None, root);
            if !ibd {
                let mut asked = node.already_asked.lock().unwrap();
                peer.ask_for(Inv::block(missing_parent), &mut asked, Node::unix_micros());
            }
            Ok(vec![])
        }
        Err(e) => {
            let dos = e.dos_score();
            Err(Rejection { reason: e.to_string(), dos })
        }
    }
}

fn handle_getaddr(node: &Node, peer: &mut Peer) -> Result<Vec<Broadcast>, Rejection> {
    peer.addr_to_send.clear();
    for addr in node.addr_book.lock().unwrap().all() {
        peer.push_address(addr);
    }
    Ok(vec![])
}

fn handle_mempool_query(node: &Node, peer: &mut Peer) -> Result<Vec<Broadcast>, Rejection> {
    let hashes = node.mempool.lock().unwrap().query_hashes();
    let inventory: Vec<Inv> =
        hashes.into_iter().take(MAX_INV_SZ).map(Inv::tx).collect();
    if !inventory.is_empty() {
        peer.push(NetworkMessage::Inv(inventory));
    }
    Ok(vec![])
}

fn handle_alert(
    node: &Node,
    _peer: &mut Peer,
    alert: crate::wire::AlertPayload,
) -> Result<Vec<Broadcast>, Rejection> {
    let hash = alert.hash();
    if node.alerts.lock().unwrap().contains_key(&hash) {
        return Ok(vec![]);
    }
    // a modest score only: the sender may simply run different keys
    let unsigned = alert.verify(&node.params.alert_key)?;
    if !unsigned.is_in_effect(Node::unix_time()) {
        return Err(Rejection::dos(10, "expired alert"));
    }
    warn!(id = unsigned.id, status = %unsigned.status_bar, "network alert");
    node.alerts.lock().unwrap().insert(hash, alert.clone());
    Ok(vec![Broadcast::Alert(alert)])
}

fn handle_checkpoint(
    node: &Node,
    peer: &mut Peer,
    checkpoint: crate::checkpoints::SyncCheckpoint,
) -> Result<Vec<Broadcast>, Rejection> {
    let master_key = {
        let chain = node.chain.lock().unwrap();
        chain.params.checkpoint_master_key.clone()
    };
    let pinned = checkpoint.verify(&master_key)?;

    let mut chain = node.chain.lock().unwrap();
    let mut mempool = node.mempool.lock().unwrap();
    match chain.apply_sync_checkpoint(&mut mempool, pinned) {
        Ok(true) => {
            *node.latest_checkpoint.lock().unwrap() = Some(checkpoint.clone());
            Ok(vec![Broadcast::Checkpoint(checkpoint)])
        }
        Ok(false) => {
            // the pinned block is unknown; ask this peer for it
            drop(mempool);
            let ibd = chain.is_initial_block_download();
            drop(chain);
            if !ibd {
                let mut asked = node.already_asked.lock().unwrap();
                peer.ask_for(Inv::block(pinned), &mut asked, Node::unix_micros());
            }
            Ok(vec![])
        }
        Err(e) => Err(Rejection::benign(format!("sync checkpoint not applied: {}", e))),
    }
}

/// Run one decoded frame through the state machine, applying misbehavior
/// scoring and ban policy. Returns broadcasts for the engine to apply.
pub fn dispatch_frame(
    node: &Node,
    peer: &mut Peer,
    command: &str,
    payload: &[u8],
) -> Vec<Broadcast> {
    let message = match NetworkMessage::decode_payload(command, payload) {
        Ok(Some(m)) => m,
        Ok(None) => return vec![],
        Err(e) => {
            debug!(peer = peer.id, command, error = %e, "undecodable payload");
            return vec![];
        }
    };

    match handle_message(node, peer, message) {
        Ok(broadcasts) => broadcasts,
        Err(rejection) => {
            debug!(peer = peer.id, command, reason = %rejection.reason, "message rejected");
            if rejection.dos > 0 && peer.misbehaving(rejection.dos, node.config.ban_score) {
                let until = Node::unix_time() + node.config.ban_time_secs as i64;
                node.bans.lock().unwrap().ban(peer.addr.ip(), until);
            }
            vec![]
        }
    }
}

/// Periodic per-peer upkeep: keep-alive pings, inactivity timeouts, and
/// the batched address/inventory/getdata flushes. `trickle` is true for
/// the one peer selected this tick.
pub fn maintain_peer(node: &Node, peer: &mut Peer, trickle: bool) {
    let now = Node::unix_time();
    let now_micros = Node::unix_micros();

    // inactivity rules
    if peer.last_recv == 0 || peer.last_send == 0 {
        if now - peer.connected_at > HANDSHAKE_TIMEOUT as i64 {
            debug!(peer = peer.id, "no messages in the first seconds, dropping");
            peer.disconnect = true;
            return;
        }
    } else if now - peer.last_recv > QUIET_RECV_TIMEOUT as i64
        || now - peer.last_send > QUIET_SEND_TIMEOUT as i64
    {
        info!(peer = peer.id, "connection idle too long, dropping");
        peer.disconnect = true;
        return;
    }

    if peer.state != HandshakeState::Handshaken {
        return;
    }

    // keep-alive ping, nonce doubling as a time stamp
    if now_micros.saturating_sub(peer.ping_stamp_micros) > PING_INTERVAL * 1_000_000
        && peer.send_queue.is_empty()
    {
        peer.ping_nonce = now_micros;
        peer.ping_stamp_micros = now_micros;
        peer.push(NetworkMessage::Ping(now_micros));
    }
    if peer.ping_time_ms.is_some()
        && peer.ping_stamp_micros.saturating_sub(peer.pong_stamp_micros)
            > PONG_TIMEOUT * 1_000_000
    {
        info!(peer = peer.id, "pings timed out, dropping");
        peer.disconnect = true;
        return;
    }

    // address batch rides the trickle tick
    if trickle && !peer.addr_to_send.is_empty() {
        let batch: Vec<TimedNetAddress> = peer.addr_to_send.drain(..).collect();
        for chunk in batch.chunks(1000) {
            peer.push(NetworkMessage::Addr(chunk.to_vec()));
        }
    }

    // inventory: blocks go out immediately, a quarter of transaction
    // announcements blast through, the rest wait for the trickle
    let mut send_now = Vec::new();
    let mut wait = Vec::new();
    for inv in std::mem::take(&mut peer.inv_to_send) {
        if peer.known_inventory.contains(&inv) {
            continue;
        }
        if inv.kind == MSG_TX && !trickle {
            let mut salted = Vec::with_capacity(40);
            salted.extend_from_slice(&inv.hash);
            salted.extend_from_slice(&node.local_nonce.to_le_bytes());
            if sha256d(&salted)[0] & 3 != 0 {
                wait.push(inv);
                continue;
            }
        }
        peer.known_inventory.insert(inv);
        send_now.push(inv);
    }
    peer.inv_to_send = wait;
    for chunk in send_now.chunks(1000) {
        peer.push(NetworkMessage::Inv(chunk.to_vec()));
    }

    // due getdata requests
    let due = peer.due_requests(now_micros);
    let mut requests = Vec::new();
    for inv in due {
        if !already_have(node, &inv) {
            node.already_asked.lock().unwrap().insert(inv, now_micros);
            requests.push(inv);
        }
    }
    for chunk in requests.chunks(1000) {
        peer.push(NetworkMessage::GetData(chunk.to_vec()));
    }
}

/// The connection manager: listener, outbound connector bounded by the
/// outbound cap, per-peer socket threads and the maintenance loop.
pub struct NetEngine {
    node: Arc<Node>,
    peers: Mutex<HashMap<u64, Arc<Mutex<Peer>>>>,
    next_peer_id: AtomicU64,
    outbound_count: AtomicUsize,
    trickle_counter: AtomicU64,
}

impl NetEngine {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        Arc::new(NetEngine {
            node,
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            outbound_count: AtomicUsize::new(0),
            trickle_counter: AtomicU64::new(0),
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn listen_port(&self) -> u16 {
        if self.node.config.port != 0 {
            self.node.config.port
        } else {
            self.node.params.default_port
        }
    }

    /// Start the listener, connector and maintenance threads.
    pub fn start(self: &Arc<Self>) -> std::io::Result<Vec<thread::JoinHandle<()>>> {
        let mut handles = Vec::new();

        if self.node.config.listen {
            let listener = TcpListener::bind(("0.0.0.0", self.listen_port()))?;
            listener.set_nonblocking(true)?;
            let engine = Arc::clone(self);
            handles.push(thread::Builder::new().name("net-accept".into()).spawn(move || {
                engine.accept_loop(listener);
            })?);
        }

        let engine = Arc::clone(self);
        handles.push(thread::Builder::new().name("net-connect".into()).spawn(move || {
            engine.connect_loop();
        })?);

        let engine = Arc::clone(self);
        handles.push(thread::Builder::new().name("net-maintain".into()).spawn(move || {
            engine.maintenance_loop();
        })?);

        Ok(handles)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while !self.node.is_shutdown() {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let now = Node::unix_time();
                    if self.node.bans.lock().unwrap().is_banned(&addr.ip(), now) {
                        debug!(%addr, "rejecting banned peer");
                        continue;
                    }
                    self.spawn_peer(stream, addr, true);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(250));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(Duration::from_millis(250));
                }
            }
        }
    }

    fn connect_loop(self: Arc<Self>) {
        // operator-specified peers first, then address book selection
        loop {
            if self.node.is_shutdown() {
                return;
            }

            let connected: std::collections::HashSet<SocketAddr> = self
                .peers
                .lock()
                .unwrap()
                .values()
                .map(|p| p.lock().unwrap().addr)
                .collect();

            let mut targets: Vec<SocketAddr> = Vec::new();
            let explicit = if !self.node.config.connect.is_empty() {
                self.node.config.connect.clone()
            } else {
                self.node.config.add_nodes.clone()
            };
            for entry in explicit {
                if let Ok(addr) = entry.parse::<SocketAddr>() {
                    if !connected.contains(&addr) {
                        targets.push(addr);
                    }
                }
            }

            let pinned_only = !self.node.config.connect.is_empty();
            if !pinned_only && self.outbound_count.load(Ordering::SeqCst) < self.node.config.max_outbound
            {
                let pick = self.node.addr_book.lock().unwrap().select(&connected);
                if let Some(addr) = pick {
                    targets.push(addr.to_socket());
                }
            }

            for addr in targets {
                if self.outbound_count.load(Ordering::SeqCst) >= self.node.config.max_outbound {
                    break;
                }
                let now = Node::unix_time();
                if self.node.bans.lock().unwrap().is_banned(&addr.ip(), now) {
                    continue;
                }
                match TcpStream::connect_timeout(&addr, Duration::from_secs(5)) {
                    Ok(stream) => {
                        self.outbound_count.fetch_add(1, Ordering::SeqCst);
                        self.spawn_peer(stream, addr, false);
                    }
                    Err(e) => debug!(%addr, error = %e, "outbound connect failed"),
                }
            }

            thread::sleep(Duration::from_millis(2000));
        }
    }

    fn maintenance_loop(self: Arc<Self>) {
        while !self.node.is_shutdown() {
            let peers: Vec<(u64, Arc<Mutex<Peer>>)> = self
                .peers
                .lock()
                .unwrap()
                .iter()
                .map(|(id, p)| (*id, Arc::clone(p)))
                .collect();

            // one trickle peer per tick
            let tick = self.trickle_counter.fetch_add(1, Ordering::SeqCst);
            let trickle_target =
                if peers.is_empty() { None } else { Some(peers[(tick as usize) % peers.len()].0) };

            for (id, peer) in peers {
                // try-lock only: a busy peer is simply deferred this tick
                if let Ok(mut guard) = peer.try_lock() {
                    maintain_peer(&self.node, &mut guard, trickle_target == Some(id));
                }
            }

            self.node.bans.lock().unwrap().sweep(Node::unix_time());
            thread::sleep(Duration::from_millis(500));
        }
    }

    fn spawn_peer(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, inbound: bool) {
        let id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(Mutex::new(Peer::new(id, addr, inbound, Node::unix_time())));
        self.peers.lock().unwrap().insert(id, Arc::clone(&peer));
        info!(peer = id, %addr, inbound, "peer connected");

        let engine = Arc::clone(self);
        let name = format!("peer-{}", id);
        let _ = thread::Builder::new().name(name).spawn(move || {
            engine.peer_thread(stream, peer, id, inbound);
        });
    }

    fn peer_thread(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: Arc<Mutex<Peer>>,
        id: u64,
        inbound: bool,
    ) {
        let _ = stream.set_read_timeout(Some(Duration::from_millis(250)));
        let _ = stream.set_nodelay(true);
        let mut frames = FrameBuffer::new(self.node.params.magic);
        let mut read_buf = [0u8; 64 * 1024];

        // an outbound connection speaks first
        if !inbound {
            let version = {
                let guard = peer.lock().unwrap();
                version_message(&self.node, &guard)
            };
            peer.lock().unwrap().push(version);
        }

        loop {
            if self.node.is_shutdown() {
                break;
            }

            match stream.read(&mut read_buf) {
                Ok(0) => break,
                Ok(n) => {
                    frames.extend(&read_buf[..n]);
                    peer.lock().unwrap().last_recv = Node::unix_time();
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => break,
            }

            while let Some((command, payload)) = frames.next_frame() {
                let broadcasts = {
                    let mut guard = peer.lock().unwrap();
                    dispatch_frame(&self.node, &mut guard, &command, &payload)
                };
                self.apply_broadcasts(id, broadcasts);
            }

            // drain the send queue onto the socket
            let outgoing: Vec<NetworkMessage> = {
                let mut guard = peer.lock().unwrap();
                guard.send_queue.drain(..).collect()
            };
            if !outgoing.is_empty() {
                let mut wire = Vec::new();
                for message in &outgoing {
                    wire.extend_from_slice(&encode_frame(&self.node.params.magic, message));
                }
                if stream.write_all(&wire).is_err() {
                    break;
                }
                peer.lock().unwrap().last_send = Node::unix_time();
            }

            if peer.lock().unwrap().disconnect {
                break;
            }
        }

        self.peers.lock().unwrap().remove(&id);
        if !inbound {
            self.outbound_count.fetch_sub(1, Ordering::SeqCst);
        }
        info!(peer = id, "peer disconnected");
    }

    /// Apply handler side effects to the peer set.
    pub fn apply_broadcasts(&self, from: u64, broadcasts: Vec<Broadcast>) {
        if broadcasts.is_empty() {
            return;
        }
        let peers: Vec<(u64, Arc<Mutex<Peer>>)> = self
            .peers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, p)| (*id, Arc::clone(p)))
            .collect();
        let (best_height, estimate) = {
            let chain = self.node.chain.lock().unwrap();
            (chain.height(), chain.checkpoints.total_blocks_estimate())
        };

        for broadcast in broadcasts {
            match &broadcast {
                Broadcast::TxInventory(inv) => {
                    for (id, peer) in &peers {
                        if *id == from {
                            continue;
                        }
                        if let Ok(mut guard) = peer.try_lock() {
                            if guard.state == HandshakeState::Handshaken {
                                guard.push_inventory(*inv);
                            }
                        }
                    }
                }
                Broadcast::BlockInventory(hash) => {
                    for (_, peer) in &peers {
                        if let Ok(mut guard) = peer.try_lock() {
                            let floor = if guard.start_height != -1 {
                                guard.start_height - 2000
                            } else {
                                estimate
                            };
                            if guard.state == HandshakeState::Handshaken && best_height > floor {
                                guard.push_inventory(Inv::block(*hash));
                            }
                        }
                    }
                }
                Broadcast::Alert(alert) => {
                    for (id, peer) in &peers {
                        if *id == from {
                            continue;
                        }
                        if let Ok(mut guard) = peer.try_lock() {
                            guard.push(NetworkMessage::Alert(alert.clone()));
                        }
                    }
                }
                Broadcast::Checkpoint(cp) => {
                    for (_, peer) in &peers {
                        if let Ok(mut guard) = peer.try_lock() {
                            guard.push(NetworkMessage::Checkpoint(cp.clone()));
                        }
                    }
                }
                Broadcast::Address(addr) => {
                    // deterministic per-day targets so the same relays
                    // repeat for 24 hours
                    let day = (Node::unix_time() / (24 * 60 * 60)) as u64;
                    let mut ranked: Vec<(Hash, u64)> = peers
                        .iter()
                        .map(|(id, _)| {
                            let mut seed = Vec::with_capacity(34);
                            seed.extend_from_slice(&addr.addr.ip);
                            seed.extend_from_slice(&day.to_le_bytes());
                            seed.extend_from_slice(&self.node.local_nonce.to_le_bytes());
                            seed.extend_from_slice(&id.to_le_bytes());
                            (sha256d(&seed), *id)
                        })
                        .collect();
                    ranked.sort();
                    for (_, id) in ranked.into_iter().take(2) {
                        if id == from {
                            continue;
                        }
                        if let Some(peer) = self.peers.lock().unwrap().get(&id) {
                            if let Ok(mut guard) = peer.try_lock() {
                                guard.push_address(*addr);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Announce a locally produced block, as if it had arrived from the
    /// network.
    pub fn announce_block(&self, hash: Hash) {
        self.apply_broadcasts(0, vec![Broadcast::BlockInventory(hash)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainState;
    use crate::checkpoints::CheckpointMode;
    use crate::config::NodeConfig;
    use crate::params::ChainParams;
    use crate::store::BlockStore;

    fn test_node() -> Arc<Node> {
        let params = ChainParams::mainnet();
        let dir = std::env::temp_dir().join(format!(
            "embercoin-net-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let store = BlockStore::open_temporary(&dir, params.magic).unwrap();
        let chain = ChainState::open(params.clone(), store, CheckpointMode::Strict).unwrap();
        Node::assemble(NodeConfig::default(), params, chain)
    }

    fn test_peer() -> Peer {
        Peer::new(7, "203.0.113.10:9555".parse().unwrap(), true, Node::unix_time())
    }

    fn version_payload(node: &Node) -> VersionPayload {
        VersionPayload {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp: Node::unix_time(),
            addr_recv: NetAddress { services: 0, ip: [0; 16], port: 0 },
            addr_from: NetAddress { services: 0, ip: [0; 16], port: 0 },
            nonce: node.local_nonce + 1,
            sub_version: "/peer:1.0/".into(),
            start_height: 0,
        }
    }

    #[test]
    fn message_before_version_scores_one() {
        let node = test_node();
        let mut peer = test_peer();
        let err = handle_message(&node, &mut peer, NetworkMessage::Ping(1)).unwrap_err();
        assert_eq!(err.dos, 1);
    }

    #[test]
    fn version_handshake_transitions() {
        let node = test_node();
        let mut peer = test_peer();

        handle_message(&node, &mut peer, NetworkMessage::Version(version_payload(&node)))
            .unwrap();
        assert_eq!(peer.state, HandshakeState::VersionReceived);
        // inbound peers get our version before the verack
        let commands: Vec<&str> = peer.send_queue.iter().map(|m| m.command()).collect();
        assert!(commands.contains(&"version"));
        assert!(commands.contains(&"verack"));

        handle_message(&node, &mut peer, NetworkMessage::Verack).unwrap();
        assert_eq!(peer.state, HandshakeState::Handshaken);
    }

    #[test]
    fn incompatible_version_disconnects() {
        let node = test_node();
        let mut peer = test_peer();
        let mut payload = version_payload(&node);
        payload.version = MIN_PROTOCOL_VERSION - 1;
        handle_message(&node, &mut peer, NetworkMessage::Version(payload)).unwrap();
        assert!(peer.disconnect);
    }

    #[test]
    fn self_connection_detected() {
        let node = test_node();
        let mut peer = test_peer();
        let mut payload = version_payload(&node);
        payload.nonce = node.local_nonce;
        handle_message(&node, &mut peer, NetworkMessage::Version(payload)).unwrap();
        assert!(peer.disconnect);
    }

    fn handshake(node: &Node, peer: &mut Peer) {
        handle_message(node, peer, NetworkMessage::Version(version_payload(node))).unwrap();
        handle_message(node, peer, NetworkMessage::Verack).unwrap();
        peer.send_queue.clear();
    }

    #[test]
    fn oversized_addr_scores_twenty() {
        let node = test_node();
        let mut peer = test_peer();
        handshake(&node, &mut peer);

        let addr = TimedNetAddress {
            time: Node::unix_time() as u32,
            addr: NetAddress { services: 1, ip: [1; 16], port: 9555 },
        };
        let err = handle_message(&node, &mut peer, NetworkMessage::Addr(vec![addr; 1001]))
            .unwrap_err();
        assert_eq!(err.dos, 20);
    }

    #[test]
    fn oversized_inv_scores_twenty() {
        let node = test_node();
        let mut peer = test_peer();
        handshake(&node, &mut peer);

        let inv = vec![Inv::tx([1; 32]); MAX_INV_SZ + 1];
        let err = handle_message(&node, &mut peer, NetworkMessage::Inv(inv)).unwrap_err();
        assert_eq!(err.dos, 20);
    }

    #[test]
    fn unknown_inventory_is_scheduled() {
        let node = test_node();
        let mut peer = test_peer();
        handshake(&node, &mut peer);

        let inv = Inv::tx([9; 32]);
        handle_message(&node, &mut peer, NetworkMessage::Inv(vec![inv])).unwrap();
        assert!(peer.known_inventory.contains(&inv));
        let due = peer.due_requests(u64::MAX);
        assert_eq!(due, vec![inv]);
    }

    #[test]
    fn getdata_returns_indexed_block() {
        let node = test_node();
        let mut peer = test_peer();
        handshake(&node, &mut peer);

        let genesis_hash = node.params.genesis_hash;
        handle_message(
            &node,
            &mut peer,
            NetworkMessage::GetData(vec![Inv::block(genesis_hash)]),
        )
        .unwrap();
        match peer.send_queue.pop_front() {
            Some(NetworkMessage::Block(block)) => assert_eq!(block.hash(), genesis_hash),
            other => panic!("expected a block reply, got {:?}", other.map(|m| m.command())),
        }
    }

    #[test]
    fn getblocks_is_rate_limited() {
        let node = test_node();
        let mut peer = test_peer();
        handshake(&node, &mut peer);

        let request = LocatorPayload {
            version: PROTOCOL_VERSION as u32,
            locator: vec![node.params.genesis_hash],
            hash_stop: ZERO_HASH,
        };
        handle_message(&node, &mut peer, NetworkMessage::GetBlocks(request.clone())).unwrap();
        let err =
            handle_message(&node, &mut peer, NetworkMessage::GetBlocks(request)).unwrap_err();
        assert_eq!(err.dos, 0);
    }

    #[test]
    fn ping_echoes_pong() {
        let node = test_node();
        let mut peer = test_peer();
        handshake(&node, &mut peer);

        handle_message(&node, &mut peer, NetworkMessage::Ping(0x1234)).unwrap();
        assert_eq!(peer.send_queue.pop_front(), Some(NetworkMessage::Pong(0x1234)));
    }

    #[test]
    fn misbehavior_accumulates_to_ban() {
        let node = test_node();
        let mut peer = test_peer();
        handshake(&node, &mut peer);

        let oversized = vec![Inv::tx([1; 32]); MAX_INV_SZ + 1];
        for _ in 0..5 {
            let payload = NetworkMessage::Inv(oversized.clone()).encode_payload();
            dispatch_frame(&node, &mut peer, "inv", &payload);
        }
        assert!(peer.disconnect);
        assert!(node
            .bans
            .lock()
            .unwrap()
            .is_banned(&peer.addr.ip(), Node::unix_time()));
    }

    #[test]
    fn distant_block_is_discarded() {
        let node = test_node();
        let mut peer = test_peer();
        handshake(&node, &mut peer);

        // a block declaring height far past our tip is ignored outright
        let mut block = node.params.genesis.clone();
        block.transactions[0].inputs[0].script_sig = crate::script::push_number(100_000);
        let result = handle_message(&node, &mut peer, NetworkMessage::Block(block)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn mempool_query_lists_pool() {
        let node = test_node();
        let mut peer = test_peer();
        handshake(&node, &mut peer);

        handle_message(&node, &mut peer, NetworkMessage::MempoolQuery).unwrap();
        assert!(peer.send_queue.is_empty());
    }
}
