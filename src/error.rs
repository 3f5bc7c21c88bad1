//! Error types for the node engine

use thiserror::Error;

/// Fatal or system-level errors. Consensus rejections are carried by
/// [`Rejection`] instead so they can be scored and never retried.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("corrupt data: {0}")]
    Corruption(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Deserialization failures for the canonical wire encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of data")]
    UnexpectedEnd,

    #[error("length {0} exceeds maximum {1}")]
    OversizedLength(u64, u64),

    #[error("non-canonical compact size")]
    NonCanonicalSize,

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// A consensus or protocol rejection with an attached denial-of-service
/// score. A score of zero means the failure is not attributable to peer
/// malice (duplicate inventory, benign races, disabled features).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct Rejection {
    pub reason: String,
    pub dos: u16,
}

impl Rejection {
    /// A rejection carrying a denial-of-service score.
    pub fn dos(score: u16, reason: impl Into<String>) -> Self {
        Rejection { reason: reason.into(), dos: score }
    }

    /// A rejection with no score attached.
    pub fn benign(reason: impl Into<String>) -> Self {
        Rejection { reason: reason.into(), dos: 0 }
    }
}

/// Errors out of the chain-state mutation paths: either a scored rejection
/// of the offending block/transaction, or a fatal store failure.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("{0}")]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Fatal(#[from] NodeError),
}

impl ChainError {
    /// The denial-of-service score to apply to the sending peer, if any.
    pub fn dos_score(&self) -> u16 {
        match self {
            ChainError::Rejected(r) => r.dos,
            ChainError::Fatal(_) => 0,
        }
    }
}

impl From<sled::Error> for ChainError {
    fn from(e: sled::Error) -> Self {
        ChainError::Fatal(NodeError::Database(e))
    }
}

impl From<std::io::Error> for ChainError {
    fn from(e: std::io::Error) -> Self {
        ChainError::Fatal(NodeError::Io(e))
    }
}

impl From<CodecError> for ChainError {
    fn from(e: CodecError) -> Self {
        ChainError::Fatal(NodeError::Codec(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_scores() {
        let r = Rejection::dos(100, "bad coinbase");
        assert_eq!(r.dos, 100);
        assert_eq!(r.to_string(), "bad coinbase");

        let b = Rejection::benign("already have");
        assert_eq!(b.dos, 0);
    }

    #[test]
    fn chain_error_score_passthrough() {
        let e = ChainError::Rejected(Rejection::dos(50, "pow"));
        assert_eq!(e.dos_score(), 50);

        let f = ChainError::Fatal(NodeError::Corruption("index".into()));
        assert_eq!(f.dos_score(), 0);
    }
}
