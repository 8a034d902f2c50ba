//! Error taxonomy for the store: domain errors are returned as `Option`/
//! `bool` and never appear here; this enum only carries fatal and recoverable
//! conditions that callers need to distinguish from ordinary I/O failure.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    #[error("slot marker mismatch at address {addr}: expected one of {expected:?}, found {found}")]
    MarkerMismatch {
        addr: u64,
        expected: &'static [u8],
        found: u8,
    },

    #[error("address out of range: {0}")]
    InvalidAddress(u64),

    #[error("record size mismatch: expected {expected} bytes, got {got}")]
    RecordSizeMismatch { expected: usize, got: usize },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("lock acquisition failed: {0}")]
    Lock(String),

    #[error("decompression failed: {0}")]
    Compression(String),
}

impl StoreError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        StoreError::InvariantViolation(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::Corrupt(msg.into())
    }

    /// True for errors that should be treated as fatal (abort) rather than
    /// recoverable-and-reported.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::MarkerMismatch { .. }
                | StoreError::InvariantViolation(_)
                | StoreError::Io(_)
        )
    }
}
