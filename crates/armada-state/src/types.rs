//! Domain types for the Armada ledger.
//!
//! These types are the persisted shape of datacenters, nodes, networking
//! pools, IPs, ports, services, units, software, and tasks. All of them are
//! JSON-serialized into redb value columns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Datacenter identifier.
pub type DatacenterId = String;

/// Persisted node identifier.
pub type NodeId = String;

/// Networking pool identifier.
pub type NetworkingId = String;

/// Service identifier.
pub type ServiceId = String;

/// Unit identifier.
pub type UnitId = String;

// ── Datacenter ────────────────────────────────────────────────────

/// A fault-isolation group of engines (`tb_cluster`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Datacenter {
    pub id: DatacenterId,
    pub name: String,
    /// Workload class hosted by this datacenter ("upsql", "proxy", ...).
    #[serde(rename = "type")]
    pub kind: String,
    pub storage_type: String,
    pub storage_id: String,
    /// Physical location label.
    pub datacenter: String,
    pub enabled: bool,
    pub max_node: u32,
    /// Fraction (0.0–1.0) of node capacity the scheduler may use.
    pub usage_limit: f32,
}

// ── Node ──────────────────────────────────────────────────────────

/// Registration status of a persisted node. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    New = 0,
    Registered = 1,
    Deregistered = 2,
}

impl NodeStatus {
    /// Only registered nodes may receive containers.
    pub fn is_schedulable(self) -> bool {
        self == NodeStatus::Registered
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::New => "new",
            NodeStatus::Registered => "registered",
            NodeStatus::Deregistered => "deregistered",
        };
        f.write_str(s)
    }
}

/// A node as recorded in `tb_node`. `name` is the engine id it maps to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub cluster_id: DatacenterId,
    pub admin_ip: String,
    pub max_container: u32,
    pub status: NodeStatus,
    pub register_at: u64,
    pub deregister_at: u64,
}

// ── Networking ────────────────────────────────────────────────────

/// Kind of IP pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkingType {
    /// Container-internal addresses.
    Containers,
    /// Externally routable addresses.
    ExternalAccess,
}

impl fmt::Display for NetworkingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkingType::Containers => f.write_str("containers"),
            NetworkingType::ExternalAccess => f.write_str("external_access"),
        }
    }
}

/// A typed IP pool (`tb_networking`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkingRecord {
    pub id: NetworkingId,
    /// Network address of the pool, encoded as u32.
    pub networking: u32,
    #[serde(rename = "type")]
    pub kind: NetworkingType,
    pub prefix: u8,
    pub gateway: String,
    pub enabled: bool,
}

/// One address of a pool (`tb_ip`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpRecord {
    pub ip_addr: u32,
    pub prefix: u8,
    pub networking_id: NetworkingId,
    pub allocated: bool,
    /// Unit holding the address once committed.
    pub unit_id: Option<UnitId>,
}

/// A committed or pending IP binding of a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IpBinding {
    pub networking_id: NetworkingId,
    pub prefix: u8,
    pub ip: u32,
    #[serde(rename = "type")]
    pub kind: NetworkingType,
    pub gateway: String,
}

// ── Port ──────────────────────────────────────────────────────────

/// A port allotment (`tb_port`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRecord {
    pub port: u32,
    pub name: String,
    pub unit_id: UnitId,
    pub allocated: bool,
}

// ── Service ───────────────────────────────────────────────────────

/// Workload type of a module; selects its configurer and operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    Generic,
    Redis,
    Mysql,
    Proxy,
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleType::Generic => "generic",
            ModuleType::Redis => "redis",
            ModuleType::Mysql => "mysql",
            ModuleType::Proxy => "proxy",
        };
        f.write_str(s)
    }
}

/// Reference into the software catalogue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoftwareRef {
    pub name: String,
    pub version: String,
}

/// A named volume bound into each unit of a module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeSpec {
    pub name: String,
    /// Mount point inside the container.
    pub path: String,
    pub size_bytes: u64,
}

/// Hardware requirements per unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HardwareSpec {
    /// Dedicated CPU cores (0 = shared).
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    /// IP pools each unit needs one address from.
    #[serde(default)]
    pub networkings: Vec<NetworkingType>,
}

/// A typed group of identical containers within a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModuleType,
    /// Raw image reference. Either this or `software` must be set.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub software: Option<SoftwareRef>,
    pub count: u32,
    #[serde(default)]
    pub resources: HardwareSpec,
    /// Preferred engines or datacenters; empty means any.
    #[serde(default)]
    pub candidates: Vec<String>,
    /// Named ports each unit declares.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Overrides merged into the workload configuration.
    #[serde(default)]
    pub configures: HashMap<String, String>,
    /// Base configuration text for the workload.
    #[serde(default)]
    pub config_template: Option<String>,
}

/// A database/application user created once units start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSpec {
    pub name: String,
    pub password: String,
    pub role: String,
}

/// Backup policy attached to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupStrategy {
    /// Cron-like schedule string.
    pub schedule: String,
    pub retention_days: u32,
    pub target: String,
}

/// Declarative service submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub modules: Vec<ModuleSpec>,
    #[serde(default)]
    pub users: Vec<UserSpec>,
    #[serde(default)]
    pub backup: Option<BackupStrategy>,
    /// Retry budget for the unit prepare block; defaults to the manager setting.
    #[serde(default)]
    pub failure_retry: Option<u32>,
}

/// Lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Idle = 0,
    InFlight = 1,
    Deployed = 2,
    Failed = 3,
}

impl ServiceStatus {
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::InFlight),
            2 => Some(Self::Deployed),
            3 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Persisted service row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub id: ServiceId,
    pub name: String,
    pub spec: ServiceSpec,
    pub status: ServiceStatus,
    pub failure_retry: u32,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Unit ──────────────────────────────────────────────────────────

/// Per-container lifecycle state. Values only increase, except the jump to
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Init = 0,
    Preparing = 1,
    Networked = 2,
    Volumes = 3,
    Created = 4,
    Configured = 5,
    Started = 6,
    Failed = 7,
}

impl UnitState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Init),
            1 => Some(Self::Preparing),
            2 => Some(Self::Networked),
            3 => Some(Self::Volumes),
            4 => Some(Self::Created),
            5 => Some(Self::Configured),
            6 => Some(Self::Started),
            7 => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Started | Self::Failed)
    }
}

/// A named port bound to a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub name: String,
    pub port: u32,
}

/// Persisted unit row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitRecord {
    pub id: UnitId,
    pub name: String,
    pub service_id: ServiceId,
    pub module_name: String,
    #[serde(rename = "type")]
    pub kind: ModuleType,
    pub engine_id: Option<String>,
    pub container_id: Option<String>,
    pub swarm_id: Option<String>,
    pub networkings: Vec<IpBinding>,
    pub ports: Vec<PortBinding>,
    pub cpuset: String,
    pub state: UnitState,
    pub created_at: u64,
}

// ── Software ──────────────────────────────────────────────────────

/// Catalogue entry mapping software name/version to an image (`tb_software`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoftwareRecord {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub version: String,
    pub label: String,
    pub store_url: String,
    /// Default named ports for the software.
    pub ports: Vec<String>,
    pub config_key_sets: Vec<String>,
    pub template: String,
    pub enabled: bool,
    pub upload_at: u64,
}

impl SoftwareRecord {
    /// Build the composite key for the software table.
    pub fn table_key(&self) -> String {
        software_key(&self.name, &self.version)
    }

    /// Full image reference on the store.
    pub fn image_ref(&self) -> String {
        if self.store_url.is_empty() {
            format!("{}:{}", self.name, self.version)
        } else {
            format!("{}/{}:{}", self.store_url.trim_end_matches('/'), self.name, self.version)
        }
    }
}

/// Key for a software row.
pub fn software_key(name: &str, version: &str) -> String {
    format!("{name}:{version}")
}

// ── Task ──────────────────────────────────────────────────────────

/// Status of an asynchronous task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    /// Was running when leadership changed hands.
    InFlight,
    Done,
    Failed,
}

/// Persisted record of one asynchronous operation on a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub service_id: ServiceId,
    pub action: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub created_at: u64,
    pub finished_at: Option<u64>,
}

impl UnitRecord {
    /// Build the composite key for the units table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.service_id, self.id)
    }
}
