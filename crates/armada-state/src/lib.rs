//! armada-state — the persisted resource ledger for Armada.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for datacenters, nodes, IP pools, port allotments, services,
//! units, the software catalogue, and task records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{networking_id}:{ip}`, `{service_id}:{unit_id}`) enable
//! prefix scans for related records. Ports are keyed by number and drawn
//! from a persisted counter.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod globals;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{IpClaim, StateStore, epoch_secs};
pub use types::*;
