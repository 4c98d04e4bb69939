use std::io;

use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("out of space")]
    OutOfSpace,
    #[error("read fault at page {0}")]
    ReadFault(u64),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
    #[error("not found")]
    NotFound,
}

/// Reports a broken internal invariant: aborts in debug builds, logs and
/// surfaces an error code in release builds.
pub fn invariant_violation(msg: &'static str) -> StoreError {
    debug_assert!(false, "invariant violated: {msg}");
    error!(message = msg, "store.invariant_violation");
    StoreError::Invariant(msg)
}
