//! Error taxonomy of the matching core
//!
//! Every variant maps to a stable code for callers. Storage failures keep the
//! backend error as their `source()` for logging but never show it in the
//! user-facing message.

use crate::engine::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient USD balance")]
    InsufficientFunds,

    #[error("Insufficient {0} balance")]
    InsufficientAsset(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal storage error")]
    Storage(#[source] StoreError),
}

impl ExchangeError {
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::InvalidInput(_) => "invalid_input",
            ExchangeError::InsufficientFunds => "insufficient_funds",
            ExchangeError::InsufficientAsset(_) => "insufficient_asset",
            ExchangeError::NotFound(_) => "not_found",
            ExchangeError::Forbidden(_) => "forbidden",
            ExchangeError::InvalidState(_) => "invalid_state",
            ExchangeError::Storage(_) => "internal_error",
        }
    }

    /// Deadlocks, lock wait timeouts and lost connections abort the whole
    /// operation, which may then be replayed from the top.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for ExchangeError {
    fn from(err: StoreError) -> Self {
        ExchangeError::Storage(err)
    }
}
