//! redb table definitions for the Armada ledger.
//!
//! JSON-valued tables use `&str` keys. Composite keys follow
//! `{parent_id}:{child_id}` so related rows can be prefix-scanned.

use redb::TableDefinition;

/// Datacenters (`tb_cluster`) keyed by `{id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("tb_cluster");

/// Persisted engine nodes (`tb_node`) keyed by `{id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("tb_node");

/// Networking pools (`tb_networking`) keyed by `{id}`.
pub const NETWORKINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("tb_networking");

/// Pool addresses (`tb_ip`) keyed by `{networking_id}:{ip:010}`.
pub const IPS: TableDefinition<&str, &[u8]> = TableDefinition::new("tb_ip");

/// Port allotments (`tb_port`) keyed by port number.
pub const PORTS: TableDefinition<u32, &[u8]> = TableDefinition::new("tb_port");

/// Services keyed by `{name}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("tb_service");

/// Units keyed by `{service_id}:{unit_id}`.
pub const UNITS: TableDefinition<&str, &[u8]> = TableDefinition::new("tb_unit");

/// Software catalogue (`tb_software`) keyed by `{name}:{version}`.
pub const SOFTWARE: TableDefinition<&str, &[u8]> = TableDefinition::new("tb_software");

/// Task records keyed by `{id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tb_task");

/// Auto-increment counters keyed by name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Counter name for the next port to hand out.
pub const PORT_SEQUENCE: &str = "tb_port.port";

/// Build the `tb_ip` key for an address inside a pool.
pub fn ip_key(networking_id: &str, ip: u32) -> String {
    format!("{networking_id}:{ip:010}")
}
