//! armada-core — configuration and shared primitives for Armada.
//!
//! - **`config`** — `armada.toml` loading and option validation
//! - **`kv`** — `key=value,...` option bags
//! - **`ip`** — IPv4/u32 codec for the IP ledger
//! - **`features`** — init-once process flags

pub mod config;
pub mod features;
pub mod ip;
pub mod kv;

pub use config::{
    ClusterDriver, ConfigError, ConfigResult, DiscoveryConfig, ManageConfig, ReplicationConfig,
    StrategyName, parse_duration,
};
pub use ip::{ip_to_u32, parse_ip_u32, u32_to_ip};
pub use kv::parse_kv_string;
