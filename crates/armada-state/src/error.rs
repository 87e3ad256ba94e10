//! Error types for the Armada ledger.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A row was not in the state the transaction expected (e.g. an IP already
    /// allocated to another unit). The transaction is rolled back.
    #[error("ledger conflict: {0}")]
    Conflict(String),

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
}
