//! Region error types.

use armada_placement::PlacementError;
use armada_state::StateError;
use thiserror::Error;

/// Coarse classification of a failure, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, refused before any state change.
    Validation,
    /// No engine satisfies the request, or a pool ran dry.
    ResourceExhausted,
    /// An equal operation is already in flight.
    Conflict,
    /// An engine call failed.
    TransientEngine,
    /// A ledger transaction failed.
    Ledger,
    InvariantViolation,
    NotFound,
}

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Writes are only accepted by the primary.
    #[error("this manager is not the primary")]
    NotPrimary,

    #[error("engine {engine}: {source}")]
    Engine {
        engine: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("placement: {0}")]
    Placement(#[from] PlacementError),

    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type RegionResult<T> = Result<T, RegionError>;

impl RegionError {
    pub fn engine(engine: &str, source: anyhow::Error) -> Self {
        Self::Engine {
            engine: engine.to_string(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RegionError::Validation(_) => ErrorKind::Validation,
            RegionError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            RegionError::Conflict(_) | RegionError::NotPrimary => ErrorKind::Conflict,
            RegionError::NotFound(_) => ErrorKind::NotFound,
            RegionError::Engine { .. } => ErrorKind::TransientEngine,
            RegionError::Placement(err) => match err {
                PlacementError::InvalidExpression { .. }
                | PlacementError::UnknownFilter(_)
                | PlacementError::InvalidOption(_) => ErrorKind::Validation,
                _ => ErrorKind::ResourceExhausted,
            },
            RegionError::State(err) => match err {
                StateError::NotFound(_) => ErrorKind::NotFound,
                StateError::AlreadyExists(_) => ErrorKind::Conflict,
                StateError::InvalidTransition { .. } => ErrorKind::Validation,
                _ => ErrorKind::Ledger,
            },
            RegionError::Invariant(_) => ErrorKind::InvariantViolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_source() {
        let not_match = RegionError::from(PlacementError::NotMatch { groups: 1, needed: 3 });
        assert_eq!(not_match.kind(), ErrorKind::ResourceExhausted);

        let bad_expr = RegionError::from(PlacementError::InvalidExpression {
            expr: "node".to_string(),
            reason: "no operator".to_string(),
        });
        assert_eq!(bad_expr.kind(), ErrorKind::Validation);

        let ledger = RegionError::from(StateError::Transaction("disk full".to_string()));
        assert_eq!(ledger.kind(), ErrorKind::Ledger);

        let taken = RegionError::from(StateError::AlreadyExists("service s".to_string()));
        assert_eq!(taken.kind(), ErrorKind::Conflict);

        let engine = RegionError::engine("e1", anyhow::anyhow!("connection refused"));
        assert_eq!(engine.kind(), ErrorKind::TransientEngine);
        assert!(engine.to_string().contains("e1"));
    }
}
