//! armada-placement — candidate selection for Armada.
//!
//! Given in-memory engine views and a draft container config, this crate
//! decides where units land. It holds no state of its own: the region owns
//! the views and feeds borrowed slices through the pipeline.
//!
//! # Components
//!
//! - **`engine`** — engine view snapshot
//! - **`container`** — draft container config and its `constraint:`/`affinity:` env
//! - **`expr`** — constraint expression parsing and matching
//! - **`filter`** — hard-constraint filter chain
//! - **`strategy`** — spread, group, binpack, random ranking
//! - **`scheduler`** — filters + strategy
//! - **`diversity`** — cross-datacenter spread of the ranked list

pub mod container;
pub mod diversity;
pub mod engine;
pub mod error;
pub mod expr;
pub mod filter;
pub mod scheduler;
pub mod strategy;

pub use container::{
    ContainerConfig, NETWORKING_LABEL_KEY, PROXY_NETWORKING_LABEL_KEY, SWARM_ID_LABEL_KEY,
};
pub use diversity::select_node_by_cluster;
pub use engine::{ContainerSummary, EngineView, HEALTH_MAX, NetworkScope, NetworkSummary};
pub use error::{PlacementError, PlacementResult};
pub use scheduler::Scheduler;
pub use strategy::{PlacementStrategy, StrategyOptions, new_strategy};
