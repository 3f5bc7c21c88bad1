//! Per-network chain parameters: genesis blocks, proof-of-work limits,
//! fork schedule helpers and the pluggable hasher/verifier seams.

use std::sync::Arc;

use crate::constants::*;
use crate::crypto::{PowHasher, PowProfile, Sha256dPow};
use crate::pow::U256;
use crate::script::{ScriptVerifier, SignatureVerifier};
use crate::types::{hash_from_hex, Block, BlockHeader, Hash, OutPoint, Transaction, TxIn, TxOut, ZERO_HASH};

/// The two deployed networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

pub const MAINNET_GENESIS_HASH: &str =
    "be2f30f9e8db8f430056869c43503a992d232b28508e83eda101161a18cf7c73";
pub const TESTNET_GENESIS_HASH: &str =
    "ecd47eee16536f7d03d64643cfc8c61b22093f8bf2c9358bf8b6f4dcb5f13192";

const MAINNET_GENESIS_MERKLE: &str =
    "ff2aa75842fae1bfb100b656c57229ce37b03643434da2043ddab7a11cfe69a6";
const TESTNET_GENESIS_MERKLE: &str =
    "9bf4ade403d775b44e872935609367aee5bd7df698e0f4c73e5f30f46b30a537";

const MAINNET_GENESIS_COINBASE: &str =
    "04ffff001d010446552e532e204973205765696768696e672057696465204f7665726861756c206f662057\
     697265746170204c617773202d204e592054696d6573202d204d617920382032303133";
const TESTNET_GENESIS_COINBASE: &str =
    "04ffff001d01044a57656220466f756e6465722044656e6f756e636573204e534120456e6372797074696f\
     6e20437261636b696e67202d2054686520477561726469616e202d2030362f4e6f762f32303133";

const TESTNET_GENESIS_PUBKEY: &str =
    "049023f10bccda76f971d6417d420c6bb5735d3286669ce03b49c5fea07078f0e07b19518ee1c0a4f81bcf\
     56a5497ad7d8200ce470eea8c6e2cf65f1ee503f0d3e";

/// Default master key for signed sync checkpoints and alerts; deployments
/// override it through the params builder and the stored checkpoint key.
const DEFAULT_MASTER_KEY: &str = TESTNET_GENESIS_PUBKEY;

/// Everything the consensus engine needs to know about the network it
/// runs on.
#[derive(Clone)]
pub struct ChainParams {
    pub network: Network,
    pub magic: [u8; 4],
    pub default_port: u16,
    pub genesis: Block,
    pub genesis_hash: Hash,
    pub pow_limit: U256,
    pub pow_limit_bits: u32,
    /// Difficulty reset target applied at the hash-function switch fork.
    pub switch_limit: U256,
    pub base_maturity: i32,
    pub checkpoint_master_key: Vec<u8>,
    pub alert_key: Vec<u8>,
    pub hasher: Arc<dyn PowHasher>,
    pub verifier: Arc<dyn ScriptVerifier>,
}

impl ChainParams {
    pub fn new(network: Network) -> Self {
        let pow_limit = U256::MAX.shr(20);
        let switch_limit = U256::MAX.shr(26);
        let genesis = genesis_block(network);
        let genesis_hash = genesis.hash();
        let master_key = hex::decode(DEFAULT_MASTER_KEY).expect("valid builtin key");
        ChainParams {
            network,
            magic: match network {
                Network::Mainnet => MAINNET_MAGIC,
                Network::Testnet => TESTNET_MAGIC,
            },
            default_port: match network {
                Network::Mainnet => MAINNET_PORT,
                Network::Testnet => TESTNET_PORT,
            },
            genesis,
            genesis_hash,
            pow_limit,
            pow_limit_bits: crate::pow::compress_target(&pow_limit),
            switch_limit,
            base_maturity: match network {
                Network::Mainnet => BASE_MATURITY,
                Network::Testnet => BASE_MATURITY_TESTNET,
            },
            checkpoint_master_key: master_key.clone(),
            alert_key: master_key,
            hasher: Arc::new(Sha256dPow),
            verifier: Arc::new(SignatureVerifier),
        }
    }

    pub fn mainnet() -> Self {
        Self::new(Network::Mainnet)
    }

    pub fn testnet() -> Self {
        Self::new(Network::Testnet)
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn PowHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ScriptVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn is_testnet(&self) -> bool {
        self.network == Network::Testnet
    }

    /// Target spacing and retarget timespan in force at a height.
    pub fn spacing_and_timespan(&self, height: i32) -> (i64, i64) {
        let mut spacing = TARGET_SPACING_ZERO;
        let mut timespan = TARGET_TIMESPAN_ZERO;
        if height >= FORK_ONE {
            spacing = TARGET_SPACING_ONE;
            timespan = TARGET_TIMESPAN_ONE;
        }
        if height >= FORK_TWO {
            spacing = TARGET_SPACING_TWO;
            timespan = TARGET_TIMESPAN_TWO;
        }
        if height >= FORK_THREE || self.is_testnet() {
            spacing = TARGET_SPACING_THREE;
            timespan = TARGET_TIMESPAN_THREE;
        }
        if self.averaging_active(height) {
            spacing = TARGET_SPACING_FOUR;
            timespan = TARGET_TIMESPAN_FOUR;
        }
        (spacing, timespan)
    }

    /// The widened averaging window rules, live after the fourth hard fork
    /// (first testnet fork).
    pub fn averaging_active(&self, height: i32) -> bool {
        match self.network {
            Network::Mainnet => height >= FORK_FOUR,
            Network::Testnet => height >= TESTNET_FORK_ONE,
        }
    }

    /// The hash-function switch fork (fifth hard fork, second testnet
    /// fork): version-2 blocks only, difficulty reset, modern PoW profile.
    pub fn modern_era(&self, height: i32) -> bool {
        match self.network {
            Network::Mainnet => height >= FORK_FIVE,
            Network::Testnet => height >= TESTNET_FORK_TWO,
        }
    }

    /// Exact height of the hash-function switch.
    pub fn modern_era_height(&self) -> i32 {
        match self.network {
            Network::Mainnet => FORK_FIVE,
            Network::Testnet => TESTNET_FORK_TWO,
        }
    }

    pub fn soft_fork_one_active(&self, height: i32) -> bool {
        match self.network {
            Network::Mainnet => height >= SOFT_FORK_ONE,
            Network::Testnet => height >= TESTNET_SOFT_FORK_ONE,
        }
    }

    pub fn soft_fork_two_active(&self, height: i32) -> bool {
        match self.network {
            Network::Mainnet => height >= SOFT_FORK_TWO,
            Network::Testnet => height >= TESTNET_SOFT_FORK_TWO,
        }
    }

    /// Heights where the retarget parameters change discontinuously.
    pub fn is_hard_fork_height(&self, height: i32) -> bool {
        match self.network {
            Network::Mainnet => {
                height == FORK_ONE
                    || height == FORK_TWO
                    || height == FORK_THREE
                    || height == FORK_FOUR
                    || height == FORK_FIVE
            }
            Network::Testnet => height == TESTNET_FORK_ONE || height == TESTNET_FORK_TWO,
        }
    }

    /// Cutover time after which coinbase scripts must commit to the block
    /// height.
    pub fn v2_switch_time(&self) -> u32 {
        match self.network {
            Network::Mainnet => SWITCH_V2_TIME,
            Network::Testnet => TESTNET_SWITCH_V2_TIME,
        }
    }

    pub fn pow_profile(&self, height: i32) -> PowProfile {
        if self.modern_era(height) {
            PowProfile::Modern
        } else {
            PowProfile::Legacy
        }
    }

    /// Proof-of-work hash of a serialized header for a block at `height`.
    pub fn pow_hash(&self, header: &BlockHeader, height: i32) -> Hash {
        let bytes = crate::serialize::serialize(header);
        self.hasher.pow_hash(&bytes, self.pow_profile(height))
    }
}

fn genesis_block(network: Network) -> Block {
    let (coinbase_hex, value, out_script, time, nonce) = match network {
        Network::Mainnet => (
            MAINNET_GENESIS_COINBASE,
            50 * COIN,
            vec![0x00, 0xac],
            1_317_972_665u32,
            2_084_931_085u32,
        ),
        Network::Testnet => {
            let pubkey = hex::decode(TESTNET_GENESIS_PUBKEY).expect("valid builtin key");
            let mut script = Vec::with_capacity(67);
            crate::script::push_data(&mut script, &pubkey);
            script.push(crate::script::OP_CHECKSIG);
            (TESTNET_GENESIS_COINBASE, 500 * COIN, script, 1_383_768_000u32, 1_029_893u32)
        }
    };

    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: hex::decode(coinbase_hex).expect("valid builtin script"),
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOut { value, script_pubkey: out_script }],
        lock_time: 0,
    };

    let merkle_root = coinbase.txid();
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: ZERO_HASH,
            merkle_root,
            time,
            bits: 0x1e0f_fff0,
            nonce,
        },
        transactions: vec![coinbase],
    }
}

/// Hard-coded checkpoint table: (height, id) pairs the chain must match.
pub fn hardened_checkpoints(network: Network) -> Vec<(i32, Hash)> {
    let genesis = match network {
        Network::Mainnet => MAINNET_GENESIS_HASH,
        Network::Testnet => TESTNET_GENESIS_HASH,
    };
    vec![(0, hash_from_hex(genesis).expect("valid builtin hash"))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hash_to_hex;

    #[test]
    fn mainnet_genesis_matches_known_id() {
        let params = ChainParams::mainnet();
        assert_eq!(hash_to_hex(&params.genesis_hash), MAINNET_GENESIS_HASH);
        assert_eq!(hash_to_hex(&params.genesis.header.merkle_root), MAINNET_GENESIS_MERKLE);
        assert_eq!(params.genesis.merkle_root(), params.genesis.header.merkle_root);
    }

    #[test]
    fn testnet_genesis_matches_known_id() {
        let params = ChainParams::testnet();
        assert_eq!(hash_to_hex(&params.genesis_hash), TESTNET_GENESIS_HASH);
        assert_eq!(hash_to_hex(&params.genesis.header.merkle_root), TESTNET_GENESIS_MERKLE);
    }

    #[test]
    fn pow_limit_compact_forms() {
        let params = ChainParams::mainnet();
        assert_eq!(params.pow_limit_bits, 0x1e0f_ffff);
        assert_eq!(crate::pow::compress_target(&params.switch_limit), 0x1d3f_ffff);
    }

    #[test]
    fn spacing_schedule_follows_forks() {
        let params = ChainParams::mainnet();
        assert_eq!(params.spacing_and_timespan(0), (90, 2400 * 90));
        assert_eq!(params.spacing_and_timespan(FORK_ONE), (90, 600 * 90));
        assert_eq!(params.spacing_and_timespan(FORK_TWO), (50, 108 * 50));
        assert_eq!(params.spacing_and_timespan(FORK_THREE), (45, 126 * 45));
        assert_eq!(params.spacing_and_timespan(FORK_FOUR), (90, 20 * 90));
    }

    #[test]
    fn testnet_starts_at_third_era() {
        let params = ChainParams::testnet();
        assert_eq!(params.spacing_and_timespan(0), (45, 126 * 45));
        assert_eq!(params.spacing_and_timespan(TESTNET_FORK_ONE), (90, 20 * 90));
    }

    #[test]
    fn era_predicates() {
        let params = ChainParams::mainnet();
        assert!(!params.modern_era(FORK_FIVE - 1));
        assert!(params.modern_era(FORK_FIVE));
        assert!(!params.averaging_active(FORK_FOUR - 1));
        assert!(params.averaging_active(FORK_FOUR));
        assert!(params.is_hard_fork_height(FORK_THREE));
        assert!(!params.is_hard_fork_height(FORK_THREE + 1));
    }

    #[test]
    fn genesis_blocks_differ_between_networks() {
        assert_ne!(ChainParams::mainnet().genesis_hash, ChainParams::testnet().genesis_hash);
    }
}
