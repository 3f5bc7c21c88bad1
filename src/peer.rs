//! Per-peer state: handshake progress, send queues, the bounded
//! known-inventory set, the time-keyed ask-for queue, misbehavior
//! scoring, bans and the address book.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};

use rand::seq::IteratorRandom;
use tracing::{debug, info};

use crate::constants::ASKFOR_RETRY_MICROS;
use crate::wire::{Inv, NetAddress, NetworkMessage, TimedNetAddress};

/// Set container keeping only the most recently inserted N elements.
#[derive(Debug, Clone)]
pub struct MruSet<T> {
    set: HashSet<T>,
    queue: VecDeque<T>,
    cap: usize,
}

impl<T: std::hash::Hash + Eq + Clone> MruSet<T> {
    pub fn new(cap: usize) -> Self {
        MruSet { set: HashSet::new(), queue: VecDeque::new(), cap }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.set.contains(value)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Insert, evicting the oldest element at capacity. Returns true when
    /// the value was not already present.
    pub fn insert(&mut self, value: T) -> bool {
        if !self.set.insert(value.clone()) {
            return false;
        }
        if self.cap > 0 && self.queue.len() == self.cap {
            if let Some(old) = self.queue.pop_front() {
                self.set.remove(&old);
            }
        }
        self.queue.push_back(value);
        true
    }
}

/// Message state machine of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing received yet; only a version message is acceptable.
    Fresh,
    /// Version received, verack outstanding.
    VersionReceived,
    /// Fully negotiated.
    Handshaken,
}

/// One connected peer. Jointly owned by the connection manager and the
/// worker threads via reference counting; buffers are mutated only under
/// the peer's lock.
pub struct Peer {
    pub id: u64,
    pub addr: SocketAddr,
    pub inbound: bool,

    pub state: HandshakeState,
    pub version: i32,
    pub services: u64,
    pub sub_version: String,
    pub start_height: i32,
    /// Our external address as the peer reported it.
    pub addr_local: Option<NetAddress>,

    pub send_queue: VecDeque<NetworkMessage>,
    pub inv_to_send: Vec<Inv>,
    pub known_inventory: MruSet<Inv>,
    pub addr_to_send: Vec<TimedNetAddress>,
    pub known_addresses: HashSet<NetAddress>,
    /// Inventory to request, keyed by due time in microseconds.
    pub ask_for: BTreeMap<u64, Vec<Inv>>,

    pub misbehavior: u16,
    pub disconnect: bool,
    /// We sent getaddr and await the reply.
    pub requested_addresses: bool,

    pub connected_at: i64,
    pub last_send: i64,
    pub last_recv: i64,

    pub ping_nonce: u64,
    pub ping_stamp_micros: u64,
    pub pong_stamp_micros: u64,
    pub ping_time_ms: Option<u64>,

    pub last_getblocks_reply: i64,
    pub last_getheaders_reply: i64,
    /// Last getblocks request issued, to suppress duplicates.
    pub last_getblocks: Option<(crate::types::Hash, crate::types::Hash)>,
}

impl Peer {
    pub fn new(id: u64, addr: SocketAddr, inbound: bool, now: i64) -> Self {
        Peer {
            id,
            addr,
            inbound,
            state: HandshakeState::Fresh,
            version: 0,
            services: 0,
            sub_version: String::new(),
            start_height: -1,
            addr_local: None,
            send_queue: VecDeque::new(),
            inv_to_send: Vec::new(),
            known_inventory: MruSet::new(50_000),
            addr_to_send: Vec::new(),
            known_addresses: HashSet::new(),
            ask_for: BTreeMap::new(),
            misbehavior: 0,
            disconnect: false,
            requested_addresses: false,
            connected_at: now,
            last_send: 0,
            last_recv: 0,
            ping_nonce: 0,
            ping_stamp_micros: 0,
            pong_stamp_micros: 0,
            ping_time_ms: None,
            last_getblocks_reply: 0,
            last_getheaders_reply: 0,
            last_getblocks: None,
        }
    }

    /// Queue a message for the socket writer.
    pub fn push(&mut self, message: NetworkMessage) {
        self.send_queue.push_back(message);
    }

    /// Queue inventory for the batched announcement cycle, unless the
    /// peer already knows it.
    pub fn push_inventory(&mut self, inv: Inv) {
        if !self.known_inventory.contains(&inv) {
            self.inv_to_send.push(inv);
        }
    }

    pub fn push_address(&mut self, addr: TimedNetAddress) {
        if self.known_addresses.insert(addr.addr) {
            self.addr_to_send.push(addr);
        }
    }

    /// Schedule a getdata for unknown inventory: at most one request per
    /// retry interval per object, across all peers.
    pub fn ask_for(&mut self, inv: Inv, already_asked: &mut HashMap<Inv, u64>, now_micros: u64) {
        let previous = already_asked.get(&inv).copied().unwrap_or(0);
        let due = if previous == 0 {
            now_micros
        } else {
            (previous + ASKFOR_RETRY_MICROS).max(now_micros)
        };
        already_asked.insert(inv, due);
        self.ask_for.entry(due).or_default().push(inv);
    }

    /// Pull the requests that have come due.
    pub fn due_requests(&mut self, now_micros: u64) -> Vec<Inv> {
        let mut due = Vec::new();
        let keys: Vec<u64> = self.ask_for.range(..=now_micros).map(|(k, _)| *k).collect();
        for key in keys {
            if let Some(mut invs) = self.ask_for.remove(&key) {
                due.append(&mut invs);
            }
        }
        due
    }

    /// Raise the misbehavior score; at the threshold the peer is marked
    /// for disconnection and the caller bans its address.
    pub fn misbehaving(&mut self, score: u16, threshold: u16) -> bool {
        self.misbehavior = self.misbehavior.saturating_add(score);
        debug!(peer = self.id, score, total = self.misbehavior, "misbehaving peer");
        if self.misbehavior >= threshold {
            self.disconnect = true;
            info!(peer = self.id, addr = %self.addr, "peer banned for misbehavior");
            return true;
        }
        false
    }
}

/// Banned addresses with expiry times.
#[derive(Debug, Default)]
pub struct BanList {
    bans: HashMap<IpAddr, i64>,
}

impl BanList {
    pub fn new() -> Self {
        BanList { bans: HashMap::new() }
    }

    pub fn ban(&mut self, ip: IpAddr, until: i64) {
        let entry = self.bans.entry(ip).or_insert(0);
        if *entry < until {
            *entry = until;
        }
    }

    pub fn is_banned(&self, ip: &IpAddr, now: i64) -> bool {
        self.bans.get(ip).map(|until| *until > now).unwrap_or(false)
    }

    pub fn sweep(&mut self, now: i64) {
        self.bans.retain(|_, until| *until > now);
    }
}

/// Known peer addresses for outbound selection and getaddr replies.
#[derive(Debug, Default)]
pub struct AddrBook {
    addresses: HashMap<NetAddress, u32>,
}

impl AddrBook {
    pub fn new() -> Self {
        AddrBook { addresses: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Record an address, keeping the freshest time seen.
    pub fn add(&mut self, addr: TimedNetAddress) {
        let entry = self.addresses.entry(addr.addr).or_insert(0);
        if *entry < addr.time {
            *entry = addr.time;
        }
    }

    /// Mark an address as successfully connected.
    pub fn good(&mut self, addr: NetAddress, now: u32) {
        self.addresses.insert(addr, now);
    }

    pub fn contains(&self, addr: &NetAddress) -> bool {
        self.addresses.contains_key(addr)
    }

    /// A random candidate to connect to, excluding the given set.
    pub fn select(&self, exclude: &HashSet<SocketAddr>) -> Option<NetAddress> {
        let mut rng = rand::thread_rng();
        self.addresses
            .keys()
            .filter(|a| !exclude.contains(&a.to_socket()))
            .choose(&mut rng)
            .copied()
    }

    pub fn all(&self) -> Vec<TimedNetAddress> {
        self.addresses
            .iter()
            .map(|(addr, time)| TimedNetAddress { time: *time, addr: *addr })
            .collect()
    }
}
