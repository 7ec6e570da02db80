//! Error types for treegrav.

use thiserror::Error;

use crate::sfc::Key;

#[derive(Debug, Error)]
pub enum GravityError {
    #[error("piece {piece}: I/O error on {path}: {source}")]
    Io {
        piece: usize,
        path: String,
        source: std::io::Error,
    },

    #[error("field file {path} is corrupt or of incorrect type: {reason}")]
    CorruptField { path: String, reason: String },

    #[error("field files disagree: {reason}")]
    MismatchedFields { reason: String },

    #[error("piece {piece}: particle keys not ordered after sort")]
    KeysNotOrdered { piece: usize },

    #[error("splitter array is not non-decreasing")]
    SplittersNotMonotone,

    #[error(
        "piece {piece}: exhausted all 63 key bits between particles {left} and {right}; \
         coincident or pathologically clustered positions"
    )]
    KeyBitsExhausted {
        piece: usize,
        left: usize,
        right: usize,
    },

    #[error("node [{left:#018x}, {right:#018x}) falls between pieces and is owned by none")]
    NodeBetweenPieces { left: Key, right: Key },

    #[error("piece {piece}: boundary contribution for key {lookup_key:#018x} never matched a local node")]
    BoundaryRetryExceeded { piece: usize, lookup_key: Key },

    #[error("a worker thread disconnected before the barrier fired")]
    WorkerDisconnected,
}

pub type Result<T> = std::result::Result<T, GravityError>;
