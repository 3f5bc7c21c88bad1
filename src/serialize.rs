//! Canonical little-endian encoding for all structured types.
//!
//! Every integer is little-endian; sequences carry a compact-size prefix.
//! The same layout is used on the wire, in the block files and in the
//! key-value index, so encoding must stay byte-exact.

use crate::constants::MAX_SIZE;
use crate::error::CodecError;
use crate::types::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

/// Serialize a value into a fresh buffer.
pub fn serialize<T: Encodable>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

/// Deserialize a value, requiring the input to be fully consumed.
pub fn deserialize<T: Decodable>(data: &[u8]) -> Result<T, CodecError> {
    let mut r = Reader::new(data);
    let value = T::decode(&mut r)?;
    if !r.is_empty() {
        return Err(CodecError::InvalidValue("trailing bytes".into()));
    }
    Ok(value)
}

/// Serialized size of a value.
pub fn serialized_size<T: Encodable>(value: &T) -> usize {
    serialize(value).len()
}

/// Types with a canonical byte encoding.
pub trait Encodable {
    fn encode(&self, buf: &mut Vec<u8>);
}

/// Types decodable from the canonical encoding.
pub trait Decodable: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError>;
}

/// Cursor over an input slice.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_hash(&mut self) -> Result<[u8; 32], CodecError> {
        let b = self.take(32)?;
        let mut h = [0u8; 32];
        h.copy_from_slice(b);
        Ok(h)
    }

    /// Compact-size length prefix, bounded by MAX_SIZE.
    pub fn read_compact_size(&mut self) -> Result<u64, CodecError> {
        let first = self.read_u8()?;
        let n = match first {
            0..=0xfc => first as u64,
            0xfd => {
                let v = self.read_u16()? as u64;
                if v < 0xfd {
                    return Err(CodecError::NonCanonicalSize);
                }
                v
            }
            0xfe => {
                let v = self.read_u32()? as u64;
                if v <= 0xffff {
                    return Err(CodecError::NonCanonicalSize);
                }
                v
            }
            0xff => {
                let v = self.read_u64()?;
                if v <= 0xffff_ffff {
                    return Err(CodecError::NonCanonicalSize);
                }
                v
            }
        };
        if n > MAX_SIZE as u64 {
            return Err(CodecError::OversizedLength(n, MAX_SIZE as u64));
        }
        Ok(n)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let n = self.read_compact_size()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn read_var_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidValue("invalid utf-8".into()))
    }
}

pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_hash(buf: &mut Vec<u8>, h: &[u8; 32]) {
    buf.extend_from_slice(h);
}

pub fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            write_u16(buf, n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            write_u32(buf, n as u32);
        }
        _ => {
            buf.push(0xff);
            write_u64(buf, n);
        }
    }
}

pub fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

impl Encodable for OutPoint {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_hash(buf, &self.txid);
        write_u32(buf, self.index);
    }
}

impl Decodable for OutPoint {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(OutPoint { txid: r.read_hash()?, index: r.read_u32()? })
    }
}

impl Encodable for TxIn {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.prevout.encode(buf);
        write_var_bytes(buf, &self.script_sig);
        write_u32(buf, self.sequence);
    }
}

impl Decodable for TxIn {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TxIn {
            prevout: OutPoint::decode(r)?,
            script_sig: r.read_var_bytes()?,
            sequence: r.read_u32()?,
        })
    }
}

impl Encodable for TxOut {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_i64(buf, self.value);
        write_var_bytes(buf, &self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TxOut { value: r.read_i64()?, script_pubkey: r.read_var_bytes()? })
    }
}

impl Encodable for Transaction {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.version);
        write_compact_size(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(buf);
        }
        write_compact_size(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(buf);
        }
        write_u32(buf, self.lock_time);
    }
}

impl Decodable for Transaction {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_i32()?;
        let n_in = r.read_compact_size()? as usize;
        let mut inputs = Vec::with_capacity(n_in.min(1024));
        for _ in 0..n_in {
            inputs.push(TxIn::decode(r)?);
        }
        let n_out = r.read_compact_size()? as usize;
        let mut outputs = Vec::with_capacity(n_out.min(1024));
        for _ in 0..n_out {
            outputs.push(TxOut::decode(r)?);
        }
        let lock_time = r.read_u32()?;
        Ok(Transaction { version, inputs, outputs, lock_time })
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.version);
        write_hash(buf, &self.prev_block);
        write_hash(buf, &self.merkle_root);
        write_u32(buf, self.time);
        write_u32(buf, self.bits);
        write_u32(buf, self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(BlockHeader {
            version: r.read_i32()?,
            prev_block: r.read_hash()?,
            merkle_root: r.read_hash()?,
            time: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }
}

impl Encodable for Block {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.header.encode(buf);
        write_compact_size(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(buf);
        }
    }
}

impl Decodable for Block {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(r)?;
        let n = r.read_compact_size()? as usize;
        let mut transactions = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            transactions.push(Transaction::decode(r)?);
        }
        Ok(Block { header, transactions })
    }
}
