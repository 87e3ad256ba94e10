//! Error types for discovery, membership, and election.

use armada_state::StateError;
use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid discovery uri '{0}'")]
    InvalidUri(String),

    #[error("invalid discovery entry '{0}'")]
    InvalidEntry(String),

    /// Known scheme whose backend lives outside this process.
    #[error("discovery scheme '{0}' needs an external backend")]
    ExternalBackend(String),

    #[error("unsupported discovery scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("discovery io: {0}")]
    Io(#[from] std::io::Error),

    /// Fatal for the current election epoch.
    #[error("election: {0}")]
    Election(String),

    #[error("engine '{0}' is deregistered")]
    Deregistered(String),

    #[error(transparent)]
    State(#[from] StateError),
}
