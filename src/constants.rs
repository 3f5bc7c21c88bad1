//! Consensus and protocol constants

/// Base units per coin.
pub const COIN: i64 = 100_000_000;

/// Money supply ceiling in base units.
pub const MAX_MONEY: i64 = 10_000_000 * COIN;

/// Maximum serialized block size.
pub const MAX_BLOCK_SIZE: usize = 524_288;

/// Maximum size of a block the miner generates.
pub const MAX_BLOCK_SIZE_GEN: usize = MAX_BLOCK_SIZE / 2;

/// Maximum legacy-counted signature operations per block.
pub const MAX_BLOCK_SIGOPS: usize = MAX_BLOCK_SIZE / 64;

/// Cap on the orphan transaction pool.
pub const MAX_ORPHAN_TRANSACTIONS: usize = MAX_BLOCK_SIZE / 256;

/// Maximum number of entries in an inv or getdata message.
pub const MAX_INV_SZ: usize = 50_000;

/// Maximum wire payload size.
pub const MAX_SIZE: usize = 0x0200_0000;

/// Minimum delay enforced by the block limiter, seconds.
pub const BLOCK_LIMITER_TIME: i64 = 120;

/// Minimum fee per 1000 bytes when creating or mining transactions.
pub const MIN_TX_FEE: i64 = 10_000_000;

/// Minimum fee per 1000 bytes when relaying transactions.
pub const MIN_RELAY_TX_FEE: i64 = 5_000_000;

/// Outputs below this value require an extra base fee.
pub const TX_DUST: i64 = 1_000_000;

/// Lock times below this are block heights, above are unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number marking an input final.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Confirmations before a coinbase output may be spent.
pub const BASE_MATURITY: i32 = 100;
pub const BASE_MATURITY_TESTNET: i32 = 100;
pub const BASE_MATURITY_OFFSET: i32 = 1;

/// The hard forks.
pub const FORK_ONE: i32 = 46_500;
pub const FORK_TWO: i32 = 69_444;
pub const FORK_THREE: i32 = 74_100;
pub const FORK_FOUR: i32 = 154_000;
pub const FORK_FIVE: i32 = 400_000;

/// The soft forks tightening block time rules.
pub const SOFT_FORK_ONE: i32 = 270_000;
pub const SOFT_FORK_TWO: i32 = 340_000;

/// Testnet fork schedule.
pub const TESTNET_FORK_ONE: i32 = 600;
pub const TESTNET_FORK_TWO: i32 = 3_600;
pub const TESTNET_SOFT_FORK_ONE: i32 = 3_400;
pub const TESTNET_SOFT_FORK_TWO: i32 = 3_500;

/// Version 2 block switch times: 01 Aug 2014 00:00:00 GMT and
/// 08 Jul 2014 00:00:00 GMT respectively.
pub const SWITCH_V2_TIME: u32 = 1_406_851_200;
pub const TESTNET_SWITCH_V2_TIME: u32 = 1_404_777_600;

/// Target block spacings per fork era, seconds.
pub const TARGET_SPACING_ZERO: i64 = 90;
pub const TARGET_SPACING_ONE: i64 = TARGET_SPACING_ZERO;
pub const TARGET_SPACING_TWO: i64 = 50;
pub const TARGET_SPACING_THREE: i64 = 45;
pub const TARGET_SPACING_FOUR: i64 = 90;

/// Retarget timespans per fork era, seconds.
pub const TARGET_TIMESPAN_ZERO: i64 = 2400 * TARGET_SPACING_ZERO;
pub const TARGET_TIMESPAN_ONE: i64 = 600 * TARGET_SPACING_ONE;
pub const TARGET_TIMESPAN_TWO: i64 = 108 * TARGET_SPACING_TWO;
pub const TARGET_TIMESPAN_THREE: i64 = 126 * TARGET_SPACING_THREE;
pub const TARGET_TIMESPAN_FOUR: i64 = 20 * TARGET_SPACING_FOUR;

/// P2SH evaluation became strict at this block timestamp.
pub const P2SH_SWITCH_TIME: u32 = 1_333_238_400;

/// Wire protocol version spoken by this build.
pub const PROTOCOL_VERSION: i32 = 60013;

/// Peers outside this range are disconnected at handshake.
pub const MIN_PROTOCOL_VERSION: i32 = 60002;
pub const MAX_PROTOCOL_VERSION: i32 = 69999;

/// Service bit advertising full block storage.
pub const NODE_NETWORK: u64 = 1;

/// Network magic prefixes for message framing.
pub const MAINNET_MAGIC: [u8; 4] = [0xFE, 0xD0, 0xD8, 0xC3];
pub const TESTNET_MAGIC: [u8; 4] = [0xFE, 0xD0, 0xD8, 0xD4];

/// Default listen ports.
pub const MAINNET_PORT: u16 = 9555;
pub const TESTNET_PORT: u16 = 19555;

/// Block files rotate before reaching this size, keeping file offsets
/// comfortably below the 2 GiB fseek ceiling.
pub const MAX_BLOCK_FILE_SIZE: u64 = 0x7F00_0000;

/// Free disk space floor before the node refuses to write, bytes.
pub const MIN_DISK_SPACE: u64 = 52_428_800;

/// Misbehavior score at which a peer is banned.
pub const DEFAULT_BAN_SCORE: u16 = 100;

/// Default ban duration, seconds.
pub const DEFAULT_BAN_TIME: u64 = 24 * 60 * 60;

/// Cap on simultaneously attempted outbound connections.
pub const MAX_OUTBOUND_CONNECTIONS: usize = 32;

/// Peer inactivity rules, seconds.
pub const HANDSHAKE_TIMEOUT: u64 = 60;
pub const QUIET_RECV_TIMEOUT: u64 = 90 * 60;
pub const QUIET_SEND_TIMEOUT: u64 = 90 * 60;
pub const PONG_TIMEOUT: u64 = 5 * 60;

/// Interval between keep-alive pings, seconds.
pub const PING_INTERVAL: u64 = 60;

/// Minimum spacing between getblocks/getheaders responses per peer, seconds.
pub const LOCATOR_RESPONSE_INTERVAL: u64 = 5;

/// Limits on forwarded chain data per locator request.
pub const GETBLOCKS_LIMIT: usize = 1000;
pub const GETHEADERS_LIMIT: usize = 4000;

/// Re-request interval for unfulfilled inventory, microseconds.
pub const ASKFOR_RETRY_MICROS: u64 = 2 * 60 * 1_000_000;
