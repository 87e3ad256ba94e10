//! armada-region — the region controller.
//!
//! Admits service submissions, places their units across datacenters,
//! reserves addresses, ports, and cores in a two-phase ledger, and drives
//! each unit to a running container. A submission either commits all of its
//! reservations or recycles all of them.
//!
//! # Architecture
//!
//! ```text
//! add_service ──CAS Idle→InFlight──▶ scheduler channel
//!                                        │
//!                           schedule_service (filters, strategy,
//!                           diversity, Ledger::preallocate, pending)
//!                                        │
//!                                 executor channel
//!                                        │
//!                        ┌───────────────┼───────────────┐
//!                    drive_unit      drive_unit      drive_unit
//!                        └───────────────┼───────────────┘
//!                                        │
//!                     all started ─▶ Ledger::consistency ─▶ Deployed
//!                     any failure ─▶ cleanup + Ledger::recycle ─▶ Failed
//! ```
//!
//! The [`Region`] also reacts to watchdog events (engine health, quorum)
//! and to leadership changes: only the primary admits work.

pub mod configurer;
pub mod engine;
pub mod error;
mod executor;
pub mod ledger;
pub mod operator;
pub mod region;
pub mod service;
pub mod unit;

pub use configurer::{Configurer, KeyValueConfigurer, new_configurer};
pub use engine::{Engine, ExecOutput, MockEngine, MockOp};
pub use error::{ErrorKind, RegionError, RegionResult};
pub use ledger::{Ledger, PreAllocResource, UnitRequest, format_cpuset, parse_cpuset};
pub use operator::{ExecOperator, Operator, new_operator};
pub use region::{Admission, CHANNEL_CAPACITY, Region, RegionOptions};
pub use service::Service;
pub use unit::{Unit, UnitBinding};
