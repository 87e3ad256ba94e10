//! Error types for candidate selection.

use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    /// A filter reduced the candidate list to nothing.
    #[error("no engine satisfies filter '{filter}': {reason}")]
    NoCandidates { filter: &'static str, reason: String },

    /// The strategy found no engine able to take the container.
    #[error("no engine has capacity for container '{container}'")]
    NoCapacity { container: String },

    #[error("need {needed} engines, only {found} eligible")]
    NotEnoughEngines { needed: usize, found: usize },

    /// Datacenter diversity cannot be satisfied.
    #[error("not match: {groups} datacenter(s) cannot host {needed} units")]
    NotMatch { groups: usize, needed: usize },

    #[error("invalid expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("invalid strategy option: {0}")]
    InvalidOption(String),
}
