//! # Embercoin
//!
//! The consensus core of a proof-of-work currency node: block and
//! transaction validation, the persistent block store and transaction
//! index, best-chain selection under reorganizations, the memory pool,
//! the peer-to-peer gossip engine and the miner.
//!
//! ## Architecture
//!
//! The engine is layered bottom-up:
//! - primitives: hashing, compact targets, canonical serialization
//! - the block store: append-only block files plus the key-value index
//! - chain state: the block-index DAG and the connect/disconnect protocol
//! - the mempool and the miner on one side, the peer engine on the other
//!
//! Shared state lives in a [`node::Node`] context threaded through the
//! component APIs; lock membership is explicit in function signatures.
//! The proof-of-work hash function and the script interpreter are
//! pluggable seams ([`crypto::PowHasher`], [`script::ScriptVerifier`]).

pub mod chain;
pub mod checkpoints;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod economic;
pub mod error;
pub mod mempool;
pub mod miner;
pub mod net;
pub mod node;
pub mod params;
pub mod peer;
pub mod pow;
pub mod script;
pub mod serialize;
pub mod store;
pub mod types;
pub mod wire;

pub use error::{ChainError, CodecError, NodeError, Rejection, Result};
pub use params::{ChainParams, Network};
pub use types::{Block, BlockHeader, Hash, OutPoint, Transaction, TxIn, TxOut};
