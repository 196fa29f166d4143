//! Error types for the Fusion resolver

use crate::types::{EscrowSide, Stage};

use thiserror::Error;

/// Errors raised by the escrow state machine.
///
/// Messages mirror the revert strings of the escrow contracts so that API
/// clients see the same text whether a call failed on-chain or locally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    #[error("Only {expected} can {action}")]
    Unauthorized {
        action: &'static str,
        expected: &'static str,
    },

    #[error("Invalid secret")]
    InvalidSecret,

    #[error("Timelock not reached: {stage} opens at {opens_at} (now {now})")]
    TimelockNotReached { stage: Stage, opens_at: u64, now: u64 },

    #[error("Timelock expired: {stage} passed at {closed_at} (now {now})")]
    TimelockExpired { stage: Stage, closed_at: u64, now: u64 },

    #[error("Invalid escrow state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: String, need: String },

    #[error("Deposit exceeds required amount: have {have}, need {need}")]
    ExcessDeposit { have: String, need: String },

    #[error("Insufficient safety deposit: have {have}, need {need}")]
    InsufficientSafetyDeposit { have: String, need: String },

    #[error("Invalid timelocks: {0}")]
    InvalidTimelocks(String),

    #[error("{operation} is not supported on {side} escrow")]
    UnsupportedOperation {
        operation: &'static str,
        side: EscrowSide,
    },

    #[error("Escrow already exists for order {order_hash} ({side})")]
    AlreadyExists { order_hash: String, side: EscrowSide },

    #[error("Escrow not found for order {order_hash} ({side})")]
    NotFound { order_hash: String, side: EscrowSide },
}

/// Main error type for the resolver
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Execution step {step} failed: {message}")]
    Execution { step: String, message: String },

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    #[error("Quote error: {0}")]
    Quote(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Unsupported chain {chain_id}")]
    UnsupportedChain { chain_id: u64 },

    #[error("Order {order_hash} not found")]
    OrderNotFound { order_hash: String },

    #[error("Secret for order {order_hash} not available")]
    SecretUnavailable { order_hash: String },

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResolverError::ChainConnection { .. }
                | ResolverError::Timeout { .. }
                | ResolverError::RateLimited { .. }
                | ResolverError::Nonce { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            ResolverError::InsufficientBalance { .. } | ResolverError::Wallet(_)
        )
    }
}

/// Result type for resolver operations
pub type ResolverResult<T> = Result<T, ResolverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = ResolverError::ChainConnection {
            chain_id: 1,
            message: "connection reset".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.should_alert());

        let err = ResolverError::Escrow(EscrowError::InvalidSecret);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Invalid secret");
    }

    #[test]
    fn test_unsupported_chain_message() {
        let err = ResolverError::UnsupportedChain { chain_id: 99 };
        assert_eq!(err.to_string(), "Unsupported chain 99");
    }
}
