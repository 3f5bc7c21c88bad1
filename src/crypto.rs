//! Cryptographic primitives: hashing, the pluggable proof-of-work hasher,
//! compact ECDSA with public-key recovery, and the symmetric cipher used by
//! key storage.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256, Sha512};

use crate::error::NodeError;
use crate::types::Hash;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Double SHA-256, the identifier hash for transactions, headers and
/// message checksums.
pub fn sha256d(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Single SHA-256.
pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// RIPEMD-160 of SHA-256, the address hash.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let rip = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&rip);
    out
}

/// First four bytes of the double hash, used as the frame checksum.
pub fn checksum4(data: &[u8]) -> [u8; 4] {
    let h = sha256d(data);
    [h[0], h[1], h[2], h[3]]
}

/// Hash profile selected by the chain era. Blocks before the switch fork
/// hash with the legacy profile, blocks after it with the modern one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowProfile {
    Legacy,
    Modern,
}

/// Pluggable proof-of-work hasher over the 80-byte serialized header.
/// The consensus engine treats the function as opaque; the built-in
/// implementation hashes with double SHA-256 under both profiles.
pub trait PowHasher: Send + Sync {
    fn pow_hash(&self, header: &[u8], profile: PowProfile) -> Hash;
}

/// Reference hasher: double SHA-256 for both profiles.
#[derive(Debug, Default)]
pub struct Sha256dPow;

impl PowHasher for Sha256dPow {
    fn pow_hash(&self, header: &[u8], _profile: PowProfile) -> Hash {
        sha256d(header)
    }
}

/// Sign a 32-byte digest producing a 65-byte compact signature:
/// one recovery header byte (27 + id, +4 when the key is compressed)
/// followed by the 64-byte r‖s pair.
pub fn sign_compact(
    secret: &SecretKey,
    digest: &Hash,
    compressed: bool,
) -> Result<[u8; 65], NodeError> {
    let secp = Secp256k1::new();
    let msg = Message::from_digest(*digest);
    let sig: RecoverableSignature = secp.sign_ecdsa_recoverable(&msg, secret);
    let (rec_id, data) = sig.serialize_compact();
    let mut out = [0u8; 65];
    out[0] = 27 + rec_id.to_i32() as u8 + if compressed { 4 } else { 0 };
    out[1..].copy_from_slice(&data);
    Ok(out)
}

/// Recover the signing public key from a compact signature.
pub fn recover_compact(signature: &[u8], digest: &Hash) -> Result<PublicKey, NodeError> {
    if signature.len() != 65 {
        return Err(NodeError::Crypto("compact signature must be 65 bytes".into()));
    }
    let header = signature[0];
    if !(27..27 + 8).contains(&header) {
        return Err(NodeError::Crypto("invalid recovery header".into()));
    }
    let rec_id = RecoveryId::from_i32(((header - 27) & 3) as i32)
        .map_err(|e| NodeError::Crypto(e.to_string()))?;
    let sig = RecoverableSignature::from_compact(&signature[1..], rec_id)
        .map_err(|e| NodeError::Crypto(e.to_string()))?;
    let secp = Secp256k1::new();
    let msg = Message::from_digest(*digest);
    secp.recover_ecdsa(&msg, &sig)
        .map_err(|e| NodeError::Crypto(e.to_string()))
}

/// Verify a compact signature against an expected public key by recovery.
pub fn verify_compact(signature: &[u8], digest: &Hash, expected: &PublicKey) -> bool {
    match recover_compact(signature, digest) {
        Ok(recovered) => recovered == *expected,
        Err(_) => false,
    }
}

/// Verify a DER signature made over a 32-byte digest.
pub fn verify_der(signature: &[u8], digest: &Hash, key: &PublicKey) -> bool {
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest(*digest);
    match Signature::from_der(signature) {
        Ok(sig) => secp.verify_ecdsa(&msg, &sig, key).is_ok(),
        Err(_) => false,
    }
}

/// Sign a 32-byte digest, returning a DER signature.
pub fn sign_der(secret: &SecretKey, digest: &Hash) -> Vec<u8> {
    let secp = Secp256k1::new();
    let msg = Message::from_digest(*digest);
    secp.sign_ecdsa(&msg, secret).serialize_der().to_vec()
}

/// Key material for the symmetric cipher: 32-byte key, 16-byte IV.
#[derive(Clone)]
pub struct CipherKey {
    pub key: [u8; 32],
    pub iv: [u8; 16],
}

/// Derive cipher key material from a passphrase with iterated SHA-512,
/// matching the classic EVP_BytesToKey(cipher=AES-256-CBC, md=SHA-512)
/// construction: one digest block covers both key and IV.
pub fn derive_key(passphrase: &[u8], salt: &[u8; 8], rounds: u32) -> Result<CipherKey, NodeError> {
    if rounds < 1 {
        return Err(NodeError::Crypto("derivation rounds must be at least 1".into()));
    }
    let mut hasher = Sha512::new();
    hasher.update(passphrase);
    hasher.update(salt);
    let mut digest = hasher.finalize();
    for _ in 1..rounds {
        digest = Sha512::digest(digest);
    }
    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&digest[..32]);
    iv.copy_from_slice(&digest[32..48]);
    Ok(CipherKey { key, iv })
}

/// AES-256-CBC encryption with PKCS#7 padding.
pub fn aes256_cbc_encrypt(material: &CipherKey, plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(&material.key.into(), &material.iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// AES-256-CBC decryption; fails on bad padding (wrong key or corrupt
/// ciphertext).
pub fn aes256_cbc_decrypt(material: &CipherKey, ciphertext: &[u8]) -> Result<Vec<u8>, NodeError> {
    Aes256CbcDec::new(&material.key.into(), &material.iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| NodeError::Crypto("decryption failed".into()))
}
