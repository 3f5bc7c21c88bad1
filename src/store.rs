//! Persistent block storage: append-only flat files segmented below the
//! 2 GiB seek ceiling, plus the key-value index mapping transaction ids to
//! disk positions with per-output spent markers and block ids to their
//! index entries. Multi-write operations go through [`StoreBatch`] and are
//! committed atomically with a flush.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::constants::{MAX_BLOCK_FILE_SIZE, MAX_BLOCK_SIZE};
use crate::error::{CodecError, NodeError, Result};
use crate::pow::U256;
use crate::serialize::{
    deserialize, serialize, write_hash, write_i32, write_u32, Decodable, Encodable, Reader,
};
use crate::types::{Block, Hash, ZERO_HASH};

const TX_PREFIX: &[u8] = b"tx:";
const BLOCK_INDEX_PREFIX: &[u8] = b"bi:";
const KEY_BEST_CHAIN: &[u8] = b"hashBestChain";
const KEY_BEST_INVALID_WORK: &[u8] = b"bnBestInvalidWork";
const KEY_CHECKPOINT_PUBKEY: &[u8] = b"checkpointPubKey";
const KEY_SYNC_CHECKPOINT: &[u8] = b"hashSyncCheckpoint";

/// Position of a serialized transaction on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskTxPos {
    pub file: u32,
    pub block_pos: u32,
    pub tx_pos: u32,
}

impl DiskTxPos {
    pub const NULL: DiskTxPos = DiskTxPos { file: u32::MAX, block_pos: u32::MAX, tx_pos: u32::MAX };

    /// Marker for transactions that live in memory rather than on disk,
    /// used by miner and mempool dry runs.
    pub const MEMORY: DiskTxPos = DiskTxPos { file: 1, block_pos: 1, tx_pos: 1 };

    pub fn is_null(&self) -> bool {
        *self == DiskTxPos::NULL
    }
}

impl Encodable for DiskTxPos {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.file);
        write_u32(buf, self.block_pos);
        write_u32(buf, self.tx_pos);
    }
}

impl Decodable for DiskTxPos {
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        Ok(DiskTxPos { file: r.read_u32()?, block_pos: r.read_u32()?, tx_pos: r.read_u32()? })
    }
}

/// Index entry for a transaction: where it lives and, per output, the
/// position of the input that spent it (null while unspent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIndexEntry {
    pub pos: DiskTxPos,
    pub spent: Vec<DiskTxPos>,
}

impl TxIndexEntry {
    pub fn new(pos: DiskTxPos, outputs: usize) -> Self {
        TxIndexEntry { pos, spent: vec![DiskTxPos::NULL; outputs] }
    }
}

impl Encodable for TxIndexEntry {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.pos.encode(buf);
        crate::serialize::write_compact_size(buf, self.spent.len() as u64);
        for pos in &self.spent {
            pos.encode(buf);
        }
    }
}

impl Decodable for TxIndexEntry {
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        let pos = DiskTxPos::decode(r)?;
        let n = r.read_compact_size()? as usize;
        let mut spent = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            spent.push(DiskTxPos::decode(r)?);
        }
        Ok(TxIndexEntry { pos, spent })
    }
}

/// Durable form of a block-index node. Chain work is recomputed from the
/// parent chain when the index is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskBlockIndex {
    pub version: i32,
    pub prev: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: i32,
    pub file: u32,
    pub block_pos: u32,
    /// Best-chain child, zero when off the best chain.
    pub next: Hash,
}

impl Encodable for DiskBlockIndex {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.version);
        write_hash(buf, &self.prev);
        write_hash(buf, &self.merkle_root);
        write_u32(buf, self.time);
        write_u32(buf, self.bits);
        write_u32(buf, self.nonce);
        write_i32(buf, self.height);
        write_u32(buf, self.file);
        write_u32(buf, self.block_pos);
        write_hash(buf, &self.next);
    }
}

impl Decodable for DiskBlockIndex {
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        Ok(DiskBlockIndex {
            version: r.read_i32()?,
            prev: r.read_hash()?,
            merkle_root: r.read_hash()?,
            time: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
            height: r.read_i32()?,
            file: r.read_u32()?,
            block_pos: r.read_u32()?,
            next: r.read_hash()?,
        })
    }
}

/// A batch of index writes committed atomically.
#[derive(Default)]
pub struct StoreBatch {
    batch: sled::Batch,
}

impl StoreBatch {
    pub fn set_tx_index(&mut self, txid: &Hash, entry: &TxIndexEntry) {
        self.batch.insert(prefixed(TX_PREFIX, txid), serialize(entry));
    }

    pub fn erase_tx_index(&mut self, txid: &Hash) {
        self.batch.remove(prefixed(TX_PREFIX, txid));
    }

    pub fn set_block_index(&mut self, id: &Hash, entry: &DiskBlockIndex) {
        self.batch.insert(prefixed(BLOCK_INDEX_PREFIX, id), serialize(entry));
    }

    pub fn set_best_chain(&mut self, id: &Hash) {
        self.batch.insert(KEY_BEST_CHAIN, id.to_vec());
    }

    pub fn set_best_invalid_work(&mut self, work: &U256) {
        self.batch.insert(KEY_BEST_INVALID_WORK, work.to_le_bytes().to_vec());
    }
}

fn prefixed(prefix: &[u8], hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 32);
    key.extend_from_slice(prefix);
    key.extend_from_slice(hash);
    key
}

/// The block store: flat block files plus the sled-backed index.
pub struct BlockStore {
    dir: PathBuf,
    magic: [u8; 4],
    max_file_size: u64,
    db: sled::Db,
    current_file: u32,
}

impl BlockStore {
    pub fn open(dir: &Path, magic: [u8; 4]) -> Result<Self> {
        Self::open_with_limit(dir, magic, MAX_BLOCK_FILE_SIZE)
    }

    /// Open with a custom rotation limit (small limits exercise rotation
    /// in tests).
    pub fn open_with_limit(dir: &Path, magic: [u8; 4], max_file_size: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = sled::Config::new().path(dir.join("index")).open()?;
        let mut store = BlockStore { dir: dir.to_path_buf(), magic, max_file_size, db, current_file: 1 };
        store.current_file = store.find_current_file()?;
        Ok(store)
    }

    /// An in-memory store for tests: temporary sled database and block
    /// files in a scratch directory.
    pub fn open_temporary(dir: &Path, magic: [u8; 4]) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = sled::Config::new().temporary(true).open()?;
        let mut store = BlockStore {
            dir: dir.to_path_buf(),
            magic,
            max_file_size: MAX_BLOCK_FILE_SIZE,
            db,
            current_file: 1,
        };
        store.current_file = store.find_current_file()?;
        Ok(store)
    }

    fn find_current_file(&self) -> Result<u32> {
        let mut highest = 1u32;
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(num) = name.strip_prefix("blk").and_then(|s| s.strip_suffix(".dat")) {
                if let Ok(n) = num.parse::<u32>() {
                    highest = highest.max(n);
                }
            }
        }
        Ok(highest)
    }

    fn file_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("blk{:04}.dat", file))
    }

    /// Append a block, rotating to a fresh file when the current one would
    /// pass the size ceiling. Returns the file number and the offset of
    /// the serialized block (past the magic and length framing).
    pub fn append_block(&mut self, block: &Block, sync: bool) -> Result<(u32, u32)> {
        let bytes = serialize(block);
        loop {
            let path = self.file_path(self.current_file);
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            let len = file.metadata()?.len();
            if len + 8 + bytes.len() as u64 > self.max_file_size {
                self.current_file += 1;
                continue;
            }
            let mut record = Vec::with_capacity(8 + bytes.len());
            record.extend_from_slice(&self.magic);
            write_u32(&mut record, bytes.len() as u32);
            record.extend_from_slice(&bytes);
            file.write_all(&record)?;
            if sync {
                file.sync_data()?;
            }
            return Ok((self.current_file, (len + 8) as u32));
        }
    }

    /// Read the block at a recorded position, verifying the framing.
    pub fn read_block(&self, file: u32, block_pos: u32) -> Result<Block> {
        if file < 1 || block_pos < 8 {
            return Err(NodeError::Corruption(format!(
                "invalid block position {}:{}",
                file, block_pos
            )));
        }
        let mut handle = File::open(self.file_path(file))?;
        handle.seek(SeekFrom::Start(block_pos as u64 - 8))?;
        let mut framing = [0u8; 8];
        handle.read_exact(&mut framing)?;
        if framing[..4] != self.magic {
            return Err(NodeError::Corruption(format!(
                "bad magic in block file {} at {}",
                file, block_pos
            )));
        }
        let size = u32::from_le_bytes([framing[4], framing[5], framing[6], framing[7]]) as usize;
        if size == 0 || size > MAX_BLOCK_SIZE {
            return Err(NodeError::Corruption(format!("bad block record size {}", size)));
        }
        let mut bytes = vec![0u8; size];
        handle.read_exact(&mut bytes)?;
        Ok(deserialize(&bytes)?)
    }

    /// Linear scan of one block file, skipping garbage until each magic
    /// marker. Used for rescans and external block import.
    pub fn scan_blocks(&self, file: u32) -> Result<Vec<(u32, Block)>> {
        let path = self.file_path(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let mut blocks = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= data.len() {
            if data[pos..pos + 4] != self.magic {
                pos += 1;
                continue;
            }
            let size = u32::from_le_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
            ]) as usize;
            let start = pos + 8;
            if size == 0 || size > MAX_BLOCK_SIZE || start + size > data.len() {
                pos += 1;
                continue;
            }
            match deserialize::<Block>(&data[start..start + size]) {
                Ok(block) => {
                    blocks.push((start as u32, block));
                    pos = start + size;
                }
                Err(_) => pos += 1,
            }
        }
        Ok(blocks)
    }

    pub fn current_file(&self) -> u32 {
        self.current_file
    }

    pub fn batch(&self) -> StoreBatch {
        StoreBatch::default()
    }

    /// Apply a batch and make it durable before returning.
    pub fn commit(&self, batch: StoreBatch) -> Result<()> {
        self.db.apply_batch(batch.batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn read_tx_index(&self, txid: &Hash) -> Result<Option<TxIndexEntry>> {
        match self.db.get(prefixed(TX_PREFIX, txid))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains_tx(&self, txid: &Hash) -> Result<bool> {
        Ok(self.db.contains_key(prefixed(TX_PREFIX, txid))?)
    }

    /// Read the transaction serialized at a disk position. Transaction
    /// positions are absolute file offsets, like block positions.
    pub fn read_tx_at(&self, pos: &DiskTxPos) -> Result<crate::types::Transaction> {
        if pos.is_null() || *pos == DiskTxPos::MEMORY {
            return Err(NodeError::Corruption("tx position does not refer to disk".into()));
        }
        let block = self.read_block(pos.file, pos.block_pos)?;
        let offset = pos
            .tx_pos
            .checked_sub(pos.block_pos)
            .ok_or_else(|| NodeError::Corruption("tx position before its block".into()))?
            as usize;
        let block_bytes = serialize(&block);
        if offset >= block_bytes.len() {
            return Err(NodeError::Corruption("tx position out of block".into()));
        }
        let mut reader = Reader::new(&block_bytes[offset..]);
        crate::types::Transaction::decode(&mut reader)
            .map_err(|_| NodeError::Corruption("tx deserialization failed".into()))
    }

    /// Read a transaction back through its index entry.
    pub fn read_tx(&self, txid: &Hash) -> Result<Option<(crate::types::Transaction, TxIndexEntry)>> {
        let entry = match self.read_tx_index(txid)? {
            Some(e) => e,
            None => return Ok(None),
        };
        if entry.pos.is_null() || entry.pos == DiskTxPos::MEMORY {
            return Ok(None);
        }
        let tx = self.read_tx_at(&entry.pos)?;
        Ok(Some((tx, entry)))
    }

    pub fn read_block_index(&self, id: &Hash) -> Result<Option<DiskBlockIndex>> {
        match self.db.get(prefixed(BLOCK_INDEX_PREFIX, id))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All persisted block-index entries.
    pub fn load_block_index(&self) -> Result<Vec<(Hash, DiskBlockIndex)>> {
        let mut entries = Vec::new();
        for item in self.db.scan_prefix(BLOCK_INDEX_PREFIX) {
            let (key, value) = item?;
            if key.len() != BLOCK_INDEX_PREFIX.len() + 32 {
                return Err(NodeError::Corruption("malformed block index key".into()));
            }
            let mut id = ZERO_HASH;
            id.copy_from_slice(&key[BLOCK_INDEX_PREFIX.len()..]);
            entries.push((id, deserialize(&value)?));
        }
        Ok(entries)
    }

    pub fn best_chain(&self) -> Result<Option<Hash>> {
        match self.db.get(KEY_BEST_CHAIN)? {
            Some(bytes) if bytes.len() == 32 => {
                let mut id = ZERO_HASH;
                id.copy_from_slice(&bytes);
                Ok(Some(id))
            }
            Some(_) => Err(NodeError::Corruption("malformed best chain hash".into())),
            None => Ok(None),
        }
    }

    pub fn best_invalid_work(&self) -> Result<U256> {
        match self.db.get(KEY_BEST_INVALID_WORK)? {
            Some(bytes) if bytes.len() == 32 => {
                let mut raw = [0u8; 32];
                raw.copy_from_slice(&bytes);
                Ok(U256::from_le_bytes(&raw))
            }
            _ => Ok(U256::ZERO),
        }
    }

    pub fn checkpoint_pubkey(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(KEY_CHECKPOINT_PUBKEY)?.map(|v| v.to_vec()))
    }

    pub fn set_checkpoint_pubkey(&self, key: &[u8]) -> Result<()> {
        self.db.insert(KEY_CHECKPOINT_PUBKEY, key)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn sync_checkpoint(&self) -> Result<Option<Hash>> {
        match self.db.get(KEY_SYNC_CHECKPOINT)? {
            Some(bytes) if bytes.len() == 32 => {
                let mut id = ZERO_HASH;
                id.copy_from_slice(&bytes);
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    pub fn set_sync_checkpoint(&self, id: &Hash) -> Result<()> {
        self.db.insert(KEY_SYNC_CHECKPOINT, id.to_vec())?;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAINNET_MAGIC;
    use crate::params::ChainParams;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "embercoin-store-{}-{}-{}",
            tag,
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn block_write_read_round_trip() {
        let dir = scratch_dir("rw");
        let mut store = BlockStore::open_temporary(&dir, MAINNET_MAGIC).unwrap();
        let genesis = ChainParams::mainnet().genesis;

        let (file, pos) = store.append_block(&genesis, true).unwrap();
        assert_eq!(file, 1);
        assert_eq!(pos, 8);

        let back = store.read_block(file, pos).unwrap();
        assert_eq!(back.hash(), genesis.hash());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn file_rotation_at_size_ceiling() {
        let dir = scratch_dir("rotate");
        let genesis = ChainParams::mainnet().genesis;
        let record = 8 + genesis.serialized_size() as u64;
        let mut store =
            BlockStore::open_with_limit(&dir, MAINNET_MAGIC, record + 4).unwrap();

        let (f1, _) = store.append_block(&genesis, false).unwrap();
        let (f2, p2) = store.append_block(&genesis, false).unwrap();
        assert_eq!(f1, 1);
        assert_eq!(f2, 2);
        assert_eq!(store.read_block(f2, p2).unwrap().hash(), genesis.hash());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn scan_skips_garbage() {
        let dir = scratch_dir("scan");
        let mut store = BlockStore::open_temporary(&dir, MAINNET_MAGIC).unwrap();
        let genesis = ChainParams::mainnet().genesis;

        // leading garbage, then a valid record
        {
            let mut f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("blk0001.dat"))
                .unwrap();
            f.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x00]).unwrap();
        }
        store.append_block(&genesis, false).unwrap();

        let blocks = store.scan_blocks(1).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].1.hash(), genesis.hash());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn tx_index_batch_round_trip() {
        let dir = scratch_dir("txidx");
        let store = BlockStore::open_temporary(&dir, MAINNET_MAGIC).unwrap();
        let txid = [9u8; 32];
        let mut entry = TxIndexEntry::new(DiskTxPos { file: 1, block_pos: 8, tx_pos: 89 }, 2);
        entry.spent[1] = DiskTxPos { file: 1, block_pos: 500, tx_pos: 600 };

        let mut batch = store.batch();
        batch.set_tx_index(&txid, &entry);
        store.commit(batch).unwrap();

        assert!(store.contains_tx(&txid).unwrap());
        assert_eq!(store.read_tx_index(&txid).unwrap().unwrap(), entry);

        let mut batch = store.batch();
        batch.erase_tx_index(&txid);
        store.commit(batch).unwrap();
        assert!(!store.contains_tx(&txid).unwrap());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn block_index_and_best_chain_keys() {
        let dir = scratch_dir("bidx");
        let store = BlockStore::open_temporary(&dir, MAINNET_MAGIC).unwrap();
        let id = [3u8; 32];
        let entry = DiskBlockIndex {
            version: 1,
            prev: ZERO_HASH,
            merkle_root: [1; 32],
            time: 1000,
            bits: 0x1e0f_fff0,
            nonce: 5,
            height: 0,
            file: 1,
            block_pos: 8,
            next: ZERO_HASH,
        };
        let mut batch = store.batch();
        batch.set_block_index(&id, &entry);
        batch.set_best_chain(&id);
        store.commit(batch).unwrap();

        assert_eq!(store.read_block_index(&id).unwrap().unwrap(), entry);
        assert_eq!(store.best_chain().unwrap(), Some(id));
        assert_eq!(store.load_block_index().unwrap().len(), 1);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn read_tx_recovers_transaction_from_block_file() {
        let dir = scratch_dir("readtx");
        let mut store = BlockStore::open_temporary(&dir, MAINNET_MAGIC).unwrap();
        let genesis = ChainParams::mainnet().genesis;
        let (file, pos) = store.append_block(&genesis, false).unwrap();

        let coinbase = &genesis.transactions[0];
        // the coinbase begins right after the 80-byte header and tx count
        let tx_pos = pos + 80 + 1;
        let entry = TxIndexEntry::new(
            DiskTxPos { file, block_pos: pos, tx_pos },
            coinbase.outputs.len(),
        );
        let mut batch = store.batch();
        batch.set_tx_index(&coinbase.txid(), &entry);
        store.commit(batch).unwrap();

        let (tx, back) = store.read_tx(&coinbase.txid()).unwrap().unwrap();
        assert_eq!(tx.txid(), coinbase.txid());
        assert_eq!(back, entry);
        std::fs::remove_dir_all(dir).ok();
    }
}
