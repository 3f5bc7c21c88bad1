//! Wire protocol: length-prefixed message frames behind a 4-byte network
//! magic, and the payload codecs for every command.
//!
//! Frame layout: magic, 12-byte NUL-padded ASCII command, 4-byte payload
//! length, 4-byte checksum (leading bytes of the payload's double hash),
//! payload.

use crate::checkpoints::SyncCheckpoint;
use crate::constants::MAX_SIZE;
use crate::crypto::{checksum4, sha256d, verify_der};
use crate::error::{CodecError, Rejection};
use crate::serialize::{
    deserialize, serialize, write_compact_size, write_hash, write_i32, write_i64, write_u32,
    write_u64, write_var_bytes, write_var_string, Decodable, Encodable, Reader,
};
use crate::types::{Block, BlockHeader, Hash, Transaction};

pub const HEADER_SIZE: usize = 24;
pub const COMMAND_SIZE: usize = 12;

/// Inventory object kinds.
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

/// Inventory vector entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inv {
    pub kind: u32,
    pub hash: Hash,
}

impl Inv {
    pub fn tx(hash: Hash) -> Self {
        Inv { kind: MSG_TX, hash }
    }

    pub fn block(hash: Hash) -> Self {
        Inv { kind: MSG_BLOCK, hash }
    }

    pub fn is_known_kind(&self) -> bool {
        self.kind == MSG_TX || self.kind == MSG_BLOCK
    }
}

impl Encodable for Inv {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.kind);
        write_hash(buf, &self.hash);
    }
}

impl Decodable for Inv {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Inv { kind: r.read_u32()?, hash: r.read_hash()? })
    }
}

/// A peer address: service bits, IPv6-mapped address, big-endian port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn from_socket(addr: std::net::SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            std::net::IpAddr::V6(v6) => v6.octets(),
        };
        NetAddress { services, ip, port: addr.port() }
    }

    pub fn to_socket(&self) -> std::net::SocketAddr {
        let v6 = std::net::Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => std::net::SocketAddr::new(std::net::IpAddr::V4(v4), self.port),
            None => std::net::SocketAddr::new(std::net::IpAddr::V6(v6), self.port),
        }
    }

    /// Routable means globally addressable: not loopback, unspecified or
    /// private space.
    pub fn is_routable(&self) -> bool {
        match self.to_socket().ip() {
            std::net::IpAddr::V4(v4) => {
                !(v4.is_loopback() || v4.is_private() || v4.is_unspecified() || v4.is_link_local())
            }
            std::net::IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
        }
    }
}

impl Encodable for NetAddress {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.services);
        buf.extend_from_slice(&self.ip);
        buf.extend_from_slice(&self.port.to_be_bytes());
    }
}

impl Decodable for NetAddress {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let services = r.read_u64()?;
        let mut ip = [0u8; 16];
        ip.copy_from_slice(r.take(16)?);
        let port_bytes = r.take(2)?;
        Ok(NetAddress { services, ip, port: u16::from_be_bytes([port_bytes[0], port_bytes[1]]) })
    }
}

/// An address as carried in addr messages, with its last-seen time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedNetAddress {
    pub time: u32,
    pub addr: NetAddress,
}

impl Encodable for TimedNetAddress {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.time);
        self.addr.encode(buf);
    }
}

impl Decodable for TimedNetAddress {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TimedNetAddress { time: r.read_u32()?, addr: NetAddress::decode(r)? })
    }
}

/// The version handshake payload. Addresses here carry no time field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub sub_version: String,
    pub start_height: i32,
}

impl Encodable for VersionPayload {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.version);
        write_u64(buf, self.services);
        write_i64(buf, self.timestamp);
        self.addr_recv.encode(buf);
        self.addr_from.encode(buf);
        write_u64(buf, self.nonce);
        write_var_string(buf, &self.sub_version);
        write_i32(buf, self.start_height);
    }
}

impl Decodable for VersionPayload {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(VersionPayload {
            version: r.read_i32()?,
            services: r.read_u64()?,
            timestamp: r.read_i64()?,
            addr_recv: NetAddress::decode(r)?,
            addr_from: NetAddress::decode(r)?,
            nonce: r.read_u64()?,
            sub_version: r.read_var_string()?,
            start_height: r.read_i32()?,
        })
    }
}

/// Locator-based chain request: exponentially spaced ids ending at
/// genesis, plus a stop hash (zero for "as many as allowed").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorPayload {
    pub version: u32,
    pub locator: Vec<Hash>,
    pub hash_stop: Hash,
}

impl Encodable for LocatorPayload {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.version);
        write_compact_size(buf, self.locator.len() as u64);
        for hash in &self.locator {
            write_hash(buf, hash);
        }
        write_hash(buf, &self.hash_stop);
    }
}

impl Decodable for LocatorPayload {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_u32()?;
        let count = r.read_compact_size()? as usize;
        let mut locator = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            locator.push(r.read_hash()?);
        }
        Ok(LocatorPayload { version, locator, hash_stop: r.read_hash()? })
    }
}

/// The unsigned interior of an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedAlert {
    pub version: i32,
    pub relay_until: i64,
    pub expiration: i64,
    pub id: i32,
    pub cancel: i32,
    pub set_cancel: Vec<i32>,
    pub min_ver: i32,
    pub max_ver: i32,
    pub set_sub_ver: Vec<String>,
    pub priority: i32,
    pub comment: String,
    pub status_bar: String,
    pub reserved: String,
}

impl UnsignedAlert {
    pub fn is_in_effect(&self, now: i64) -> bool {
        now < self.expiration
    }

    pub fn applies_to(&self, version: i32, sub_ver: &str) -> bool {
        if !(self.min_ver..=self.max_ver).contains(&version) {
            return false;
        }
        self.set_sub_ver.is_empty() || self.set_sub_ver.iter().any(|s| s == sub_ver)
    }

    pub fn cancels(&self, other: &UnsignedAlert) -> bool {
        other.id <= self.cancel || self.set_cancel.contains(&other.id)
    }
}

impl Encodable for UnsignedAlert {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.version);
        write_i64(buf, self.relay_until);
        write_i64(buf, self.expiration);
        write_i32(buf, self.id);
        write_i32(buf, self.cancel);
        write_compact_size(buf, self.set_cancel.len() as u64);
        for c in &self.set_cancel {
            write_i32(buf, *c);
        }
        write_i32(buf, self.min_ver);
        write_i32(buf, self.max_ver);
        write_compact_size(buf, self.set_sub_ver.len() as u64);
        for s in &self.set_sub_ver {
            write_var_string(buf, s);
        }
        write_i32(buf, self.priority);
        write_var_string(buf, &self.comment);
        write_var_string(buf, &self.status_bar);
        write_var_string(buf, &self.reserved);
    }
}

impl Decodable for UnsignedAlert {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_i32()?;
        let relay_until = r.read_i64()?;
        let expiration = r.read_i64()?;
        let id = r.read_i32()?;
        let cancel = r.read_i32()?;
        let n = r.read_compact_size()? as usize;
        let mut set_cancel = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            set_cancel.push(r.read_i32()?);
        }
        let min_ver = r.read_i32()?;
        let max_ver = r.read_i32()?;
        let n = r.read_compact_size()? as usize;
        let mut set_sub_ver = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            set_sub_ver.push(r.read_var_string()?);
        }
        Ok(UnsignedAlert {
            version,
            relay_until,
            expiration,
            id,
            cancel,
            set_cancel,
            min_ver,
            max_ver,
            set_sub_ver,
            priority: r.read_i32()?,
            comment: r.read_var_string()?,
            status_bar: r.read_var_string()?,
            reserved: r.read_var_string()?,
        })
    }
}

/// A network alert: serialized unsigned payload plus a DER signature by
/// the alert key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertPayload {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
}

impl AlertPayload {
    pub fn create(secret: &secp256k1::SecretKey, unsigned: &UnsignedAlert) -> Self {
        let message = serialize(unsigned);
        let signature = crate::crypto::sign_der(secret, &sha256d(&message));
        AlertPayload { message, signature }
    }

    pub fn hash(&self) -> Hash {
        sha256d(&self.message)
    }

    /// Verify against the alert key and decode the interior.
    pub fn verify(&self, alert_key: &[u8]) -> Result<UnsignedAlert, Rejection> {
        let key = secp256k1::PublicKey::from_slice(alert_key)
            .map_err(|_| Rejection::benign("malformed alert key"))?;
        if !verify_der(&self.signature, &sha256d(&self.message), &key) {
            return Err(Rejection::dos(10, "bad alert signature"));
        }
        deserialize(&self.message).map_err(|_| Rejection::dos(10, "malformed alert payload"))
    }
}

impl Encodable for AlertPayload {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_var_bytes(buf, &self.message);
        write_var_bytes(buf, &self.signature);
    }
}

impl Decodable for AlertPayload {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(AlertPayload { message: r.read_var_bytes()?, signature: r.read_var_bytes()? })
    }
}

/// Every command this node speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionPayload),
    Verack,
    Addr(Vec<TimedNetAddress>),
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    GetBlocks(LocatorPayload),
    GetHeaders(LocatorPayload),
    Headers(Vec<BlockHeader>),
    Tx(Transaction),
    Block(Block),
    GetAddr,
    MempoolQuery,
    Ping(u64),
    Pong(u64),
    Alert(AlertPayload),
    Checkpoint(SyncCheckpoint),
}

impl NetworkMessage {
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::GetBlocks(_) => "getblocks",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::MempoolQuery => "mempool",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::Alert(_) => "alert",
            NetworkMessage::Checkpoint(_) => "checkpoint",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            NetworkMessage::Version(v) => v.encode(&mut buf),
            NetworkMessage::Verack | NetworkMessage::GetAddr | NetworkMessage::MempoolQuery => {}
            NetworkMessage::Addr(addrs) => {
                write_compact_size(&mut buf, addrs.len() as u64);
                for a in addrs {
                    a.encode(&mut buf);
                }
            }
            NetworkMessage::Inv(invs) | NetworkMessage::GetData(invs) => {
                write_compact_size(&mut buf, invs.len() as u64);
                for inv in invs {
                    inv.encode(&mut buf);
                }
            }
            NetworkMessage::GetBlocks(l) | NetworkMessage::GetHeaders(l) => l.encode(&mut buf),
            NetworkMessage::Headers(headers) => {
                write_compact_size(&mut buf, headers.len() as u64);
                for h in headers {
                    h.encode(&mut buf);
                    // headers carry an empty transaction list
                    write_compact_size(&mut buf, 0);
                }
            }
            NetworkMessage::Tx(tx) => tx.encode(&mut buf),
            NetworkMessage::Block(block) => block.encode(&mut buf),
            NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => write_u64(&mut buf, *nonce),
            NetworkMessage::Alert(alert) => alert.encode(&mut buf),
            NetworkMessage::Checkpoint(cp) => cp.encode(&mut buf),
        }
        buf
    }

    /// Decode a payload by command name; unknown commands are ignored for
    /// extensibility.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Option<NetworkMessage>, CodecError> {
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => NetworkMessage::Version(VersionPayload::decode(&mut r)?),
            "verack" => NetworkMessage::Verack,
            "addr" => NetworkMessage::Addr(decode_vec(&mut r)?),
            "inv" => NetworkMessage::Inv(decode_vec(&mut r)?),
            "getdata" => NetworkMessage::GetData(decode_vec(&mut r)?),
            "getblocks" => NetworkMessage::GetBlocks(LocatorPayload::decode(&mut r)?),
            "getheaders" => NetworkMessage::GetHeaders(LocatorPayload::decode(&mut r)?),
            "headers" => {
                let count = r.read_compact_size()? as usize;
                let mut headers = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    headers.push(BlockHeader::decode(&mut r)?);
                    let _txn = r.read_compact_size()?;
                }
                NetworkMessage::Headers(headers)
            }
            "tx" => NetworkMessage::Tx(Transaction::decode(&mut r)?),
            "block" => NetworkMessage::Block(Block::decode(&mut r)?),
            "getaddr" => NetworkMessage::GetAddr,
            "mempool" => NetworkMessage::MempoolQuery,
            "ping" => NetworkMessage::Ping(r.read_u64()?),
            "pong" => NetworkMessage::Pong(r.read_u64()?),
            "alert" => NetworkMessage::Alert(AlertPayload::decode(&mut r)?),
            "checkpoint" => NetworkMessage::Checkpoint(SyncCheckpoint::decode(&mut r)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn decode_vec<T: Decodable>(r: &mut Reader<'_>) -> Result<Vec<T>, CodecError> {
    let count = r.read_compact_size()? as usize;
    let mut out = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        out.push(T::decode(r)?);
    }
    Ok(out)
}

/// Serialize a message into a complete frame.
pub fn encode_frame(magic: &[u8; 4], message: &NetworkMessage) -> Vec<u8> {
    let payload = message.encode_payload();
    let command = message.command();

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(magic);
    let mut name = [0u8; COMMAND_SIZE];
    name[..command.len()].copy_from_slice(command.as_bytes());
    frame.extend_from_slice(&name);
    write_u32(&mut frame, payload.len() as u32);
    frame.extend_from_slice(&checksum4(&payload));
    frame.extend_from_slice(&payload);
    frame
}

/// Incremental frame decoder over a receive buffer. Garbage before the
/// magic is skipped; frames with bad checksums or oversized lengths are
/// dropped without losing stream synchronization.
pub struct FrameBuffer {
    magic: [u8; 4],
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(magic: [u8; 4]) -> Self {
        FrameBuffer { magic, buf: Vec::new() }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete, checksummed frame, or `None` until more
    /// data arrives.
    pub fn next_frame(&mut self) -> Option<(String, Vec<u8>)> {
        loop {
            // resynchronize on the magic
            let start = self
                .buf
                .windows(4)
                .position(|w| w == self.magic)
                .unwrap_or_else(|| self.buf.len().saturating_sub(3));
            if start > 0 {
                self.buf.drain(..start);
            }
            if self.buf.len() < HEADER_SIZE {
                return None;
            }

            let mut command_bytes = [0u8; COMMAND_SIZE];
            command_bytes.copy_from_slice(&self.buf[4..16]);
            let length =
                u32::from_le_bytes([self.buf[16], self.buf[17], self.buf[18], self.buf[19]])
                    as usize;
            let mut checksum = [0u8; 4];
            checksum.copy_from_slice(&self.buf[20..24]);

            if length > MAX_SIZE {
                // hopeless frame: skip the magic and resynchronize
                self.buf.drain(..4);
                continue;
            }
            if self.buf.len() < HEADER_SIZE + length {
                return None;
            }

            let command = match command_string(&command_bytes) {
                Some(c) => c,
                None => {
                    self.buf.drain(..4);
                    continue;
                }
            };

            let payload: Vec<u8> =
                self.buf[HEADER_SIZE..HEADER_SIZE + length].to_vec();
            self.buf.drain(..HEADER_SIZE + length);

            if checksum4(&payload) != checksum {
                continue;
            }
            return Some((command, payload));
        }
    }
}

/// A command is ASCII, NUL-terminated, with no NUL bytes in the middle.
fn command_string(raw: &[u8; COMMAND_SIZE]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
    if raw[end..].iter().any(|&b| b != 0) {
        return None;
    }
    let name = &raw[..end];
    if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    Some(String::from_utf8_lossy(name).into_owned())
}
