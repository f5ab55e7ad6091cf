//! Error types for the load generator

use thiserror::Error;

/// Main error type for load generation
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("RPC error in {method}: {message}")]
    Rpc { method: &'static str, message: String },

    #[error("Node rejected {method} (code {code}): {message}")]
    Rejected {
        method: &'static str,
        code: i64,
        message: String,
    },

    #[error("Gas price oracle error: {0}")]
    Oracle(String),

    #[error("Insufficient balance on {address}: have {have}, need {need}")]
    InsufficientBalance {
        address: String,
        have: String,
        need: String,
    },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Account {address} is not managed by the ledger")]
    UnknownAccount { address: String },

    #[error("Result sink error: {0}")]
    Sink(#[from] std::io::Error),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LoadError {
    /// Transport timeouts are retried by the gateway and never surfaced
    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Timeout { .. })
    }

    /// Node-side validation failure of a raw transaction
    pub fn is_rejection(&self) -> bool {
        matches!(self, LoadError::Rejected { .. })
    }

    /// Rejection caused by the sender not covering value + gas
    pub fn is_insufficient_funds(&self) -> bool {
        match self {
            LoadError::InsufficientBalance { .. } => true,
            LoadError::Rejected { message, .. } => {
                message.to_lowercase().contains("insufficient funds")
            }
            _ => false,
        }
    }

    /// A resend of a transaction the node already holds
    pub fn is_already_known(&self) -> bool {
        match self {
            LoadError::Rejected { message, .. } => {
                let message = message.to_lowercase();
                message.contains("already known") || message.contains("known transaction")
            }
            _ => false,
        }
    }

    /// Rejection meaning the nonce was already used on chain
    pub fn is_nonce_consumed(&self) -> bool {
        match self {
            LoadError::Rejected { message, .. } => message.to_lowercase().contains("nonce too low"),
            _ => false,
        }
    }
}

/// Result type for load generator operations
pub type LoadResult<T> = Result<T, LoadError>;
