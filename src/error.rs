//! Error types for the Loopswap Client SDK.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Loopswap Client SDK.
#[derive(Error, Debug)]
pub enum Error {
    /// A server quote exceeds a user-declared cost ceiling.
    #[error("Quote exceeds limit for {field}: quoted {quoted} sat, limit {limit} sat")]
    QuoteExceedsLimit {
        field: &'static str,
        quoted: u64,
        limit: u64,
    },

    /// The counterparty violated the swap protocol (impossible value, hash
    /// mismatch, wrong amount or script on chain).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A deadline passed before the target confirmation depth was reached.
    #[error("Insufficient confirmations: {0}")]
    InsufficientConfirmations(String),

    /// An off-chain payment could not be completed.
    #[error("Off-chain payment failed: {0}")]
    OffchainPaymentFailed(String),

    /// An on-chain broadcast could not be completed.
    #[error("On-chain broadcast failed: {0}")]
    OnchainBroadcastFailed(String),

    /// The user cancelled the swap.
    #[error("Swap cancelled by user")]
    UserCancelled,

    /// Cancel requested after the point of no return; the swap continues.
    #[error("Swap is past the point of no return and can no longer be cancelled")]
    PastPointOfNoReturn,

    /// Storage operation failed. Fatal: no further state-advancing decision
    /// may be made until the store is healthy again.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Swap not found in storage.
    #[error("Swap not found: {0}")]
    SwapNotFound(String),

    /// Too many active swaps, or the per-peer bound was hit.
    #[error("Swap limit reached: {0}")]
    SwapLimitReached(String),

    /// Parse error.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Bitcoin-related error.
    #[error("Bitcoin error: {0}")]
    Bitcoin(String),

    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(String),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(format!("{:#}", err))
    }
}
