//! Checkpoints: the hard-coded (height, id) table and the signed sync
//! checkpoint relayed over the network by the holder of the master key.

use secp256k1::{PublicKey, SecretKey};

use crate::crypto::{sha256d, sign_der, verify_der};
use crate::error::{CodecError, Rejection};
use crate::serialize::{
    deserialize, serialize, write_hash, write_i32, write_var_bytes, Decodable, Encodable, Reader,
};
use crate::types::Hash;

/// How sync-checkpoint failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Reject blocks failing the sync checkpoint.
    Strict,
    /// Accept with a warning.
    Advisory,
    /// Ignore sync checkpoints entirely.
    Permissive,
}

impl std::str::FromStr for CheckpointMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(CheckpointMode::Strict),
            "advisory" => Ok(CheckpointMode::Advisory),
            "permissive" => Ok(CheckpointMode::Permissive),
            other => Err(format!("unknown checkpoint mode '{}'", other)),
        }
    }
}

/// The unsigned interior of a sync checkpoint message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedSyncCheckpoint {
    pub version: i32,
    pub hash: Hash,
}

impl Encodable for UnsignedSyncCheckpoint {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.version);
        write_hash(buf, &self.hash);
    }
}

impl Decodable for UnsignedSyncCheckpoint {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(UnsignedSyncCheckpoint { version: r.read_i32()?, hash: r.read_hash()? })
    }
}

/// A sync checkpoint as relayed: the serialized unsigned message plus a
/// DER signature by the master key over its double hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SyncCheckpoint {
    /// Build and sign a checkpoint for a block id.
    pub fn create(secret: &SecretKey, hash: Hash) -> Self {
        let unsigned = UnsignedSyncCheckpoint { version: 1, hash };
        let message = serialize(&unsigned);
        let signature = sign_der(secret, &sha256d(&message));
        SyncCheckpoint { message, signature }
    }

    /// Verify the signature against the master key and return the pinned
    /// block id.
    pub fn verify(&self, master_key: &[u8]) -> Result<Hash, Rejection> {
        let key = PublicKey::from_slice(master_key)
            .map_err(|_| Rejection::benign("malformed checkpoint master key"))?;
        if !verify_der(&self.signature, &sha256d(&self.message), &key) {
            return Err(Rejection::benign("bad sync checkpoint signature"));
        }
        let unsigned: UnsignedSyncCheckpoint = deserialize(&self.message)
            .map_err(|_| Rejection::benign("malformed sync checkpoint payload"))?;
        Ok(unsigned.hash)
    }
}

impl Encodable for SyncCheckpoint {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_var_bytes(buf, &self.message);
        write_var_bytes(buf, &self.signature);
    }
}

impl Decodable for SyncCheckpoint {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(SyncCheckpoint { message: r.read_var_bytes()?, signature: r.read_var_bytes()? })
    }
}

/// Checkpoint state carried by the chain.
#[derive(Debug, Clone)]
pub struct CheckpointState {
    pub mode: CheckpointMode,
    hardened: Vec<(i32, Hash)>,
    /// Currently applied sync checkpoint.
    pub sync_checkpoint: Option<Hash>,
    /// A verified checkpoint naming a block we do not have yet.
    pub pending: Option<Hash>,
}

impl CheckpointState {
    pub fn new(mode: CheckpointMode, hardened: Vec<(i32, Hash)>) -> Self {
        CheckpointState { mode, hardened, sync_checkpoint: None, pending: None }
    }

    /// A block at a checkpointed height must carry the checkpointed id.
    pub fn check_hardened(&self, height: i32, hash: &Hash) -> bool {
        match self.hardened.iter().find(|(h, _)| *h == height) {
            Some((_, expected)) => expected == hash,
            None => true,
        }
    }

    /// Height of the highest hard-coded checkpoint, the floor below which
    /// the chain is considered historical.
    pub fn total_blocks_estimate(&self) -> i32 {
        self.hardened.iter().map(|(h, _)| *h).max().unwrap_or(0)
    }

    /// The highest hard-coded checkpoint, youngest first.
    pub fn last_hardened<'a>(
        &'a self,
        have: impl Fn(&Hash) -> bool,
    ) -> Option<(i32, &'a Hash)> {
        let mut sorted: Vec<&(i32, Hash)> = self.hardened.iter().collect();
        sorted.sort_by_key(|(h, _)| std::cmp::Reverse(*h));
        sorted.iter().find(|(_, hash)| have(hash)).map(|(h, hash)| (*h, hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{rand, Secp256k1};

    #[test]
    fn hardened_table_lookup() {
        let state = CheckpointState::new(
            CheckpointMode::Strict,
            vec![(0, [1; 32]), (100, [2; 32])],
        );
        assert!(state.check_hardened(0, &[1; 32]));
        assert!(!state.check_hardened(0, &[9; 32]));
        assert!(state.check_hardened(50, &[9; 32]));
        assert!(state.check_hardened(100, &[2; 32]));
        assert_eq!(state.total_blocks_estimate(), 100);
    }

    #[test]
    fn last_hardened_prefers_youngest_present() {
        let state = CheckpointState::new(
            CheckpointMode::Advisory,
            vec![(0, [1; 32]), (100, [2; 32]), (200, [3; 32])],
        );
        // the 200-checkpoint block is not in our index yet
        let found = state.last_hardened(|h| *h != [3; 32]).unwrap();
        assert_eq!(found.0, 100);
    }

    #[test]
    fn sync_checkpoint_round_trip() {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        let pinned = [0x42u8; 32];

        let cp = SyncCheckpoint::create(&sk, pinned);
        assert_eq!(cp.verify(&pk.serialize()).unwrap(), pinned);

        let bytes = serialize(&cp);
        let back: SyncCheckpoint = deserialize(&bytes).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn sync_checkpoint_rejects_wrong_key() {
        let secp = Secp256k1::new();
        let (sk, _) = secp.generate_keypair(&mut rand::thread_rng());
        let (_, other_pk) = secp.generate_keypair(&mut rand::thread_rng());

        let cp = SyncCheckpoint::create(&sk, [7; 32]);
        assert!(cp.verify(&other_pk.serialize()).is_err());
    }

    #[test]
    fn sync_checkpoint_rejects_tampered_payload() {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        let mut cp = SyncCheckpoint::create(&sk, [7; 32]);
        cp.message[4] ^= 0x01;
        assert!(cp.verify(&pk.serialize()).is_err());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("strict".parse::<CheckpointMode>().unwrap(), CheckpointMode::Strict);
        assert_eq!("ADVISORY".parse::<CheckpointMode>().unwrap(), CheckpointMode::Advisory);
        assert!("bogus".parse::<CheckpointMode>().is_err());
    }
}
