//! Script handling at the consensus boundary: the opaque verifier
//! interface, signature-operation counting, standardness predicates and
//! the canonical number pushes used by coinbase height commitments.
//!
//! The full interpreter lives outside this engine; [`ScriptVerifier`] is
//! the contract it plugs into.

use secp256k1::PublicKey;

use crate::crypto::{sha256d, verify_der};
use crate::serialize::{serialize, write_u32};
use crate::types::{Hash, Transaction};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

pub const MAX_SCRIPT_SIZE: usize = 10_000;
pub const MAX_SCRIPT_SIG_SIZE: usize = 500;

/// Opaque script verifier: given the previous output's locking script, the
/// spending transaction, the input index and strictness flags, decide
/// validity. Pure; no side effects.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        prev_script: &[u8],
        tx: &Transaction,
        input_index: usize,
        strict_p2sh: bool,
        hash_type: u32,
    ) -> bool;
}

/// Built-in verifier: checks canonical pay-to-pubkey spends by signature
/// and accepts other script shapes, leaving them to the external
/// interpreter.
#[derive(Debug, Default)]
pub struct SignatureVerifier;

impl ScriptVerifier for SignatureVerifier {
    fn verify(
        &self,
        prev_script: &[u8],
        tx: &Transaction,
        input_index: usize,
        _strict_p2sh: bool,
        _hash_type: u32,
    ) -> bool {
        let pubkey = match pay_to_pubkey(prev_script) {
            Some(pk) => pk,
            None => return true,
        };
        let key = match PublicKey::from_slice(pubkey) {
            Ok(k) => k,
            Err(_) => return false,
        };
        let script_sig = match tx.inputs.get(input_index) {
            Some(input) => &input.script_sig,
            None => return false,
        };
        let push = match first_push(script_sig) {
            Some(p) if !p.is_empty() => p,
            _ => return false,
        };
        let (der, hash_type) = push.split_at(push.len() - 1);
        let digest = signature_hash(prev_script, tx, input_index, hash_type[0] as u32);
        verify_der(der, &digest, &key)
    }
}

/// Test verifier accepting everything.
#[derive(Debug, Default)]
pub struct AcceptAllVerifier;

impl ScriptVerifier for AcceptAllVerifier {
    fn verify(&self, _: &[u8], _: &Transaction, _: usize, _: bool, _: u32) -> bool {
        true
    }
}

/// Test verifier rejecting everything.
#[derive(Debug, Default)]
pub struct RejectAllVerifier;

impl ScriptVerifier for RejectAllVerifier {
    fn verify(&self, _: &[u8], _: &Transaction, _: usize, _: bool, _: u32) -> bool {
        false
    }
}

/// The digest a signature in `input_index` commits to: the transaction
/// with every input script blanked except the signed one, which carries
/// the previous locking script, followed by the hash type.
pub fn signature_hash(
    prev_script: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: u32,
) -> Hash {
    let mut copy = tx.clone();
    for (i, input) in copy.inputs.iter_mut().enumerate() {
        input.script_sig = if i == input_index { prev_script.to_vec() } else { Vec::new() };
    }
    let mut data = serialize(&copy);
    write_u32(&mut data, hash_type);
    sha256d(&data)
}

/// Iterate over script opcodes, yielding `(opcode, pushed data)`.
/// Stops at the first malformed push.
pub struct OpcodeIter<'a> {
    script: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for OpcodeIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.script.len() {
            return None;
        }
        let op = self.script[self.pos];
        self.pos += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let n = *self.script.get(self.pos)? as usize;
                self.pos += 1;
                n
            }
            OP_PUSHDATA2 => {
                let lo = *self.script.get(self.pos)? as usize;
                let hi = *self.script.get(self.pos + 1)? as usize;
                self.pos += 2;
                lo | (hi << 8)
            }
            OP_PUSHDATA4 => {
                let mut n = 0usize;
                for i in 0..4 {
                    n |= (*self.script.get(self.pos + i)? as usize) << (8 * i);
                }
                self.pos += 4;
                n
            }
            _ => 0,
        };
        if self.pos + len > self.script.len() {
            return None;
        }
        let data = &self.script[self.pos..self.pos + len];
        self.pos += len;
        Some((op, data))
    }
}

pub fn opcodes(script: &[u8]) -> OpcodeIter<'_> {
    OpcodeIter { script, pos: 0 }
}

/// Legacy signature-operation count: every CHECKSIG counts one, every
/// CHECKMULTISIG a flat twenty. With `accurate`, a multisig preceded by a
/// small-integer push counts that many instead.
pub fn sigop_count(script: &[u8], accurate: bool) -> usize {
    let mut count = 0usize;
    let mut last_op = 0xff_u8;
    for (op, _data) in opcodes(script) {
        match op {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_op) {
                    count += (last_op - OP_1 + 1) as usize;
                } else {
                    count += 20;
                }
            }
            _ => {}
        }
        last_op = op;
    }
    count
}

/// Accurate sigop count of the redeem script a pay-to-script-hash input
/// supplies as its final push. Zero when the input is not push-only.
pub fn p2sh_sigop_count(script_sig: &[u8]) -> usize {
    if !is_push_only(script_sig) {
        return 0;
    }
    let mut redeem: &[u8] = &[];
    for (_op, data) in opcodes(script_sig) {
        redeem = data;
    }
    sigop_count(redeem, true)
}

/// Pay-to-script-hash template: HASH160 <20 bytes> EQUAL.
pub fn is_pay_to_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// The pubkey of a pay-to-pubkey script, when it has that shape.
pub fn pay_to_pubkey(script: &[u8]) -> Option<&[u8]> {
    let mut iter = opcodes(script);
    let (op, data) = iter.next()?;
    if !(op == 33 || op == 65) {
        return None;
    }
    let (sig_op, _) = iter.next()?;
    if sig_op != OP_CHECKSIG || iter.next().is_some() {
        return None;
    }
    Some(data)
}

/// The data pushed by the first opcode of a script, if any.
pub fn first_push(script: &[u8]) -> Option<&[u8]> {
    opcodes(script).next().map(|(_, data)| data)
}

pub fn is_push_only(script: &[u8]) -> bool {
    // opcodes() stops early on malformed pushes, so track consumed bytes
    let mut consumed = 0usize;
    for (op, data) in opcodes(script) {
        if op > OP_16 {
            return false;
        }
        consumed += 1 + data.len()
            + match op {
                OP_PUSHDATA1 => 1,
                OP_PUSHDATA2 => 2,
                OP_PUSHDATA4 => 4,
                _ => 0,
            };
    }
    consumed == script.len()
}

/// Standard locking script shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    PubKey,
    PubKeyHash,
    ScriptHash,
    NonStandard,
}

pub fn classify(script: &[u8]) -> ScriptType {
    if pay_to_pubkey(script).is_some() {
        return ScriptType::PubKey;
    }
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        return ScriptType::PubKeyHash;
    }
    if is_pay_to_script_hash(script) {
        return ScriptType::ScriptHash;
    }
    ScriptType::NonStandard
}

pub fn is_standard(script: &[u8]) -> bool {
    script.len() <= MAX_SCRIPT_SIZE && classify(script) != ScriptType::NonStandard
}

/// Minimal push of a data slice.
pub fn push_data(buf: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => buf.push(OP_0),
        1..=0x4b => {
            buf.push(data.len() as u8);
            buf.extend_from_slice(data);
        }
        0x4c..=0xff => {
            buf.push(OP_PUSHDATA1);
            buf.push(data.len() as u8);
            buf.extend_from_slice(data);
        }
        _ => {
            buf.push(OP_PUSHDATA2);
            buf.push((data.len() & 0xff) as u8);
            buf.push((data.len() >> 8) as u8);
            buf.extend_from_slice(data);
        }
    }
}

/// Canonical push of an integer: OP_0/OP_1NEGATE/OP_1..OP_16 for the small
/// range, otherwise a minimal little-endian signed-magnitude push.
pub fn push_number(n: i64) -> Vec<u8> {
    let mut out = Vec::new();
    if n == 0 {
        out.push(OP_0);
        return out;
    }
    if n == -1 {
        out.push(OP_1NEGATE);
        return out;
    }
    if (1..=16).contains(&n) {
        out.push(OP_1 + (n as u8) - 1);
        return out;
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut bytes = Vec::new();
    while abs > 0 {
        bytes.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if bytes.last().map_or(false, |b| b & 0x80 != 0) {
        bytes.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = bytes.len() - 1;
        bytes[last] |= 0x80;
    }
    push_data(&mut out, &bytes);
    out
}

/// Read back the number encoded by the first push of a script.
pub fn read_script_number(script: &[u8]) -> Option<i64> {
    let (op, data) = opcodes(script).next()?;
    match op {
        OP_0 => Some(0),
        OP_1NEGATE => Some(-1),
        OP_1..=OP_16 => Some((op - OP_1 + 1) as i64),
        0x01..=0x4b => {
            if data.len() > 8 {
                return None;
            }
            let mut value: i64 = 0;
            for (i, b) in data.iter().enumerate() {
                let byte = if i == data.len() - 1 { b & 0x7f } else { *b };
                value |= (byte as i64) << (8 * i);
            }
            if data.last().map_or(false, |b| b & 0x80 != 0) {
                value = -value;
            }
            Some(value)
        }
        _ => None,
    }
}

/// Whether a coinbase unlocking script begins with the serialized height,
/// the version-2 block commitment.
pub fn starts_with_height(script_sig: &[u8], height: i32) -> bool {
    let expect = push_number(height as i64);
    script_sig.len() >= expect.len() && script_sig[..expect.len()] == expect[..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxIn, TxOut};

    #[test]
    fn number_push_round_trip() {
        for n in [0i64, 1, 16, 17, 127, 128, 255, 256, 74_100, 400_000, 1_000_000] {
            let script = push_number(n);
            assert_eq!(read_script_number(&script), Some(n), "n={}", n);
        }
    }

    #[test]
    fn small_numbers_use_single_opcodes() {
        assert_eq!(push_number(0), vec![OP_0]);
        assert_eq!(push_number(1), vec![OP_1]);
        assert_eq!(push_number(16), vec![OP_16]);
        assert_eq!(push_number(-1), vec![OP_1NEGATE]);
        // 17 needs a data push
        assert_eq!(push_number(17), vec![0x01, 17]);
        // sign bit forces a padding byte
        assert_eq!(push_number(128), vec![0x02, 0x80, 0x00]);
    }

    #[test]
    fn height_commitment_prefix() {
        let height = 300_000;
        let mut script = push_number(height as i64);
        script.extend_from_slice(&[0x01, 0x07]); // extra nonce follows
        assert!(starts_with_height(&script, height));
        assert!(!starts_with_height(&script, height + 1));
    }

    #[test]
    fn sigop_counting() {
        let script = vec![OP_CHECKSIG, OP_CHECKSIG, OP_CHECKMULTISIG];
        assert_eq!(sigop_count(&script, false), 22);

        // 2-of-3 multisig counts 3 accurately, 20 legacy
        let mut multisig = vec![OP_1 + 1];
        for _ in 0..3 {
            multisig.push(33);
            multisig.extend_from_slice(&[2u8; 33]);
        }
        multisig.push(OP_1 + 2);
        multisig.push(OP_CHECKMULTISIG);
        assert_eq!(sigop_count(&multisig, true), 3);
        assert_eq!(sigop_count(&multisig, false), 20);
    }

    #[test]
    fn p2sh_detection() {
        let mut script = vec![OP_HASH160, 0x14];
        script.extend_from_slice(&[0u8; 20]);
        script.push(OP_EQUAL);
        assert!(is_pay_to_script_hash(&script));
        assert_eq!(classify(&script), ScriptType::ScriptHash);

        script[0] = OP_DUP;
        assert!(!is_pay_to_script_hash(&script));
    }

    #[test]
    fn p2sh_sigops_from_redeem_script() {
        let redeem = vec![OP_CHECKSIG, OP_CHECKSIG];
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &[1, 2, 3]);
        push_data(&mut script_sig, &redeem);
        assert_eq!(p2sh_sigop_count(&script_sig), 2);

        // non-push scripts contribute nothing
        assert_eq!(p2sh_sigop_count(&[OP_DUP]), 0);
    }

    #[test]
    fn classify_standard_shapes() {
        let mut p2pk = vec![33];
        p2pk.extend_from_slice(&[2u8; 33]);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(classify(&p2pk), ScriptType::PubKey);

        let mut p2pkh = vec![OP_DUP, OP_HASH160, 0x14];
        p2pkh.extend_from_slice(&[0u8; 20]);
        p2pkh.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        assert_eq!(classify(&p2pkh), ScriptType::PubKeyHash);

        assert_eq!(classify(&[OP_DUP]), ScriptType::NonStandard);
        assert!(!is_standard(&[OP_DUP]));
    }

    #[test]
    fn push_only_detection() {
        let mut script = Vec::new();
        push_data(&mut script, &[1, 2, 3]);
        push_data(&mut script, &[]);
        assert!(is_push_only(&script));

        script.push(OP_DUP);
        assert!(!is_push_only(&script));

        // truncated push
        assert!(!is_push_only(&[0x05, 0x01]));
    }

    #[test]
    fn signature_verifier_accepts_foreign_shapes() {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint { txid: [1; 32], index: 0 },
                script_sig: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOut { value: 1, script_pubkey: vec![] }],
            lock_time: 0,
        };
        // not pay-to-pubkey: left to the external interpreter
        assert!(SignatureVerifier.verify(&[OP_DUP], &tx, 0, true, 1));
    }

    #[test]
    fn signature_verifier_checks_p2pk() {
        use secp256k1::{rand, Secp256k1};

        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        let mut prev_script = vec![33];
        prev_script.extend_from_slice(&pk.serialize());
        prev_script.push(OP_CHECKSIG);

        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint { txid: [1; 32], index: 0 },
                script_sig: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOut { value: 1, script_pubkey: vec![] }],
            lock_time: 0,
        };
        let digest = signature_hash(&prev_script, &tx, 0, 1);
        let mut sig = crate::crypto::sign_der(&sk, &digest);
        sig.push(1); // hash type
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        tx.inputs[0].script_sig = script_sig;

        assert!(SignatureVerifier.verify(&prev_script, &tx, 0, true, 1));

        // corrupt the signature
        let len = tx.inputs[0].script_sig.len();
        tx.inputs[0].script_sig[len / 2] ^= 0x01;
        assert!(!SignatureVerifier.verify(&prev_script, &tx, 0, true, 1));
    }
}
