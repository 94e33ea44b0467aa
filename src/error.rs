//! Error types for chain_swr

use thiserror::Error;

/// Errors raised while resolving requests or wiring subscriptions
#[derive(Error, Debug)]
pub enum SwrError {
    /// ABI registry missing from the configuration
    #[error("{0}")]
    Abi(String),

    /// No interface descriptor registered for a contract address
    #[error("ABI not found for {0}")]
    AbiNotFound(String),

    /// Aggregated batch mixes block references
    #[error("Batch mixes block references: {first} and {second}")]
    MixedBlockTags { first: String, second: String },

    /// Request descriptor has an unusable shape
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A collaborator needed by this request is not configured
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// Failure reported by the ledger client, a contract or the aggregator
    #[error(transparent)]
    Upstream(#[from] LedgerError),
}

/// Errors reported by ledger-side collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Network or HTTP failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON-RPC error object returned by the node
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Contract call reverted
    #[error("Call reverted: {0}")]
    Revert(String),

    /// Response could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Method not supported by this client
    #[error("Unsupported method: {0}")]
    Unsupported(String),
}

/// Result type alias for convenience
pub type SwrResult<T> = Result<T, SwrError>;
