//! Core block-chain value types

use serde::{Deserialize, Serialize};

use crate::constants::{LOCKTIME_THRESHOLD, SEQUENCE_FINAL};
use crate::crypto::sha256d;
use crate::serialize::{serialize, serialized_size};

/// 256-bit hash in internal byte order. The textual form is big-endian
/// hex, i.e. the bytes reversed.
pub type Hash = [u8; 32];

/// All-zero hash, used for null references.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Big-endian hex form of a hash.
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut rev = *hash;
    rev.reverse();
    hex::encode(rev)
}

/// Parse the big-endian hex form back into internal byte order.
pub fn hash_from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    for (i, b) in bytes.iter().rev().enumerate() {
        hash[i] = *b;
    }
    Some(hash)
}

/// Shortened hash form for log lines.
pub fn short_hash(hash: &Hash) -> String {
    let mut s = hash_to_hex(hash);
    s.truncate(20);
    s
}

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

impl OutPoint {
    pub const fn null() -> Self {
        OutPoint { txid: ZERO_HASH, index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.txid == ZERO_HASH && self.index == u32::MAX
    }
}

/// Transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn is_final(&self) -> bool {
        self.sequence == SEQUENCE_FINAL
    }
}

/// Transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }

    pub fn is_null(&self) -> bool {
        self.value == -1
    }
}

/// A transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Identifier: double-SHA-256 of the serialized form.
    pub fn txid(&self) -> Hash {
        sha256d(&serialize(self))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Sum of output values. Callers bound individual values first.
    pub fn value_out(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    pub fn serialized_size(&self) -> usize {
        serialized_size(self)
    }

    /// Finality at a given chain position. A lock time below the threshold
    /// is a block height, otherwise a unix time; final sequence numbers on
    /// every input override the lock time.
    pub fn is_final(&self, height: i32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            block_time
        };
        if (self.lock_time as i64) < cutoff {
            return true;
        }
        self.inputs.iter().all(|i| i.is_final())
    }
}

/// 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Block identifier: double-SHA-256 of the 80 serialized bytes.
    pub fn hash(&self) -> Hash {
        sha256d(&serialize(self))
    }
}

/// A block: header plus a non-empty transaction sequence, the first of
/// which must be the coinbase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn serialized_size(&self) -> usize {
        serialized_size(self)
    }

    /// Merkle root over the transaction ids.
    pub fn merkle_root(&self) -> Hash {
        let txids: Vec<Hash> = self.transactions.iter().map(|tx| tx.txid()).collect();
        merkle_root(&txids)
    }

    /// Merkle branch proving membership of the transaction at `index`.
    pub fn merkle_branch(&self, index: usize) -> Vec<Hash> {
        let txids: Vec<Hash> = self.transactions.iter().map(|tx| tx.txid()).collect();
        merkle_branch(&txids, index)
    }

    /// The height a version-2 block declares in its coinbase script, or
    /// zero when it cannot be read.
    pub fn declared_height(&self) -> i32 {
        let coinbase = match self.transactions.first() {
            Some(tx) if tx.is_coinbase() => tx,
            _ => return 0,
        };
        crate::script::read_script_number(&coinbase.inputs[0].script_sig)
            .map(|n| n.clamp(0, i32::MAX as i64) as i32)
            .unwrap_or(0)
    }
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

/// Merkle root of a list of leaf hashes. A single leaf is its own root;
/// odd rows duplicate their last element.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }
    let mut row: Vec<Hash> = leaves.to_vec();
    while row.len() > 1 {
        let mut next = Vec::with_capacity((row.len() + 1) / 2);
        for pair in row.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(hash_pair(left, right));
        }
        row = next;
    }
    row[0]
}

/// The sibling hashes along the path from leaf `index` to the root.
pub fn merkle_branch(leaves: &[Hash], index: usize) -> Vec<Hash> {
    let mut branch = Vec::new();
    if leaves.is_empty() || index >= leaves.len() {
        return branch;
    }
    let mut row: Vec<Hash> = leaves.to_vec();
    let mut idx = index;
    while row.len() > 1 {
        let sibling = std::cmp::min(idx ^ 1, row.len() - 1);
        branch.push(row[sibling]);
        let mut next = Vec::with_capacity((row.len() + 1) / 2);
        for pair in row.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(hash_pair(left, right));
        }
        row = next;
        idx >>= 1;
    }
    branch
}

/// Fold a leaf up a branch, reproducing the root it belongs to.
pub fn check_merkle_branch(leaf: Hash, branch: &[Hash], index: usize) -> Hash {
    let mut hash = leaf;
    let mut idx = index;
    for sibling in branch {
        if idx & 1 == 1 {
            hash = hash_pair(sibling, &hash);
        } else {
            hash = hash_pair(&hash, sibling);
        }
        idx >>= 1;
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_tx(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint { txid: [tag; 32], index: 0 },
                script_sig: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut { value: 1000, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    #[test]
    fn null_outpoint() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint { txid: [1; 32], index: 0 }.is_null());
        assert!(!OutPoint { txid: ZERO_HASH, index: 0 }.is_null());
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = dummy_tx(0);
        assert!(!tx.is_coinbase());
        tx.inputs[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
        tx.inputs.push(TxIn {
            prevout: OutPoint { txid: [1; 32], index: 0 },
            script_sig: vec![],
            sequence: SEQUENCE_FINAL,
        });
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn txid_stable_under_round_trip() {
        let tx = dummy_tx(3);
        let bytes = crate::serialize::serialize(&tx);
        let back: Transaction = crate::serialize::deserialize(&bytes).unwrap();
        assert_eq!(tx.txid(), back.txid());
    }

    #[test]
    fn finality_by_height_and_time() {
        let mut tx = dummy_tx(1);
        tx.lock_time = 100;
        tx.inputs[0].sequence = 0;
        assert!(tx.is_final(101, 0));
        assert!(!tx.is_final(100, 0));

        tx.lock_time = LOCKTIME_THRESHOLD + 50;
        assert!(tx.is_final(0, LOCKTIME_THRESHOLD as i64 + 51));
        assert!(!tx.is_final(0, LOCKTIME_THRESHOLD as i64 + 50));

        // final sequence numbers override the lock time
        tx.inputs[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final(0, 0));
    }

    #[test]
    fn merkle_single_leaf_is_root() {
        let tx = dummy_tx(5);
        let root = merkle_root(&[tx.txid()]);
        assert_eq!(root, tx.txid());
    }

    #[test]
    fn merkle_branch_round_trip() {
        for count in 1..8usize {
            let txids: Vec<Hash> = (0..count).map(|i| dummy_tx(i as u8).txid()).collect();
            let root = merkle_root(&txids);
            for (i, txid) in txids.iter().enumerate() {
                let branch = merkle_branch(&txids, i);
                assert_eq!(check_merkle_branch(*txid, &branch, i), root, "count={} i={}", count, i);
            }
        }
    }

    #[test]
    fn hex_round_trip() {
        let mut h = [0u8; 32];
        h[0] = 0x73;
        h[31] = 0xbe;
        let s = hash_to_hex(&h);
        assert!(s.starts_with("be"));
        assert!(s.ends_with("73"));
        assert_eq!(hash_from_hex(&s).unwrap(), h);
    }
}
