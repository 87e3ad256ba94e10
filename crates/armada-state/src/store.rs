//! StateStore — redb-backed ledger persistence for Armada.
//!
//! Provides typed CRUD over datacenters, nodes, networking pools, IPs,
//! ports, services, units, software, and tasks, plus the two multi-row
//! transactions the resource ledger relies on: committing a preallocation
//! and releasing it. Both are all-or-nothing: any error drops the write
//! transaction, which aborts it.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// An IP the caller wants committed to a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpClaim {
    pub networking_id: NetworkingId,
    pub ip: u32,
    pub unit_id: UnitId,
}

/// Thread-safe ledger store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [CLUSTERS, NODES, NETWORKINGS, IPS, SERVICES, UNITS, SOFTWARE, TASKS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(PORTS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn insert_new_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key.to_string()));
            }
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All rows whose key starts with `prefix` (empty prefix lists everything).
    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn delete_prefix(&self, def: JsonTable, prefix: &str) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let keys: Vec<String> = {
            let table = txn.open_table(def).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let k = key.value().to_string();
                if k.starts_with(prefix) {
                    keys.push(k);
                }
            }
            keys
        };
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(keys.len() as u32)
    }

    // ── Datacenters ────────────────────────────────────────────────

    /// Insert or update a datacenter.
    pub fn put_datacenter(&self, dc: &Datacenter) -> StateResult<()> {
        self.put_json(CLUSTERS, &dc.id, dc)?;
        debug!(datacenter = %dc.id, "datacenter stored");
        Ok(())
    }

    pub fn get_datacenter(&self, id: &str) -> StateResult<Option<Datacenter>> {
        self.get_json(CLUSTERS, id)
    }

    pub fn list_datacenters(&self) -> StateResult<Vec<Datacenter>> {
        self.scan_json(CLUSTERS, "")
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert a new node. Fails if the id is taken.
    pub fn insert_node(&self, node: &NodeRecord) -> StateResult<()> {
        self.insert_new_json(NODES, &node.id, node)?;
        debug!(node = %node.id, cluster = %node.cluster_id, "node inserted");
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> StateResult<Option<NodeRecord>> {
        self.get_json(NODES, id)
    }

    /// Find the node bound to an engine id.
    pub fn get_node_by_name(&self, name: &str) -> StateResult<Option<NodeRecord>> {
        let nodes: Vec<NodeRecord> = self.scan_json(NODES, "")?;
        Ok(nodes.into_iter().find(|n| n.name == name))
    }

    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.scan_json(NODES, "")
    }

    pub fn list_nodes_in_datacenter(&self, cluster_id: &str) -> StateResult<Vec<NodeRecord>> {
        let nodes: Vec<NodeRecord> = self.scan_json(NODES, "")?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.cluster_id == cluster_id)
            .collect())
    }

    /// Move a node forward to `status`. Backward or repeated transitions fail.
    pub fn update_node_status(&self, id: &str, status: NodeStatus) -> StateResult<NodeRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let current: Option<NodeRecord> = table
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| serde_json::from_slice(guard.value()))
                .transpose()
                .map_err(map_err!(Deserialize))?;
            let mut node = current.ok_or_else(|| StateError::NotFound(format!("node {id}")))?;
            if status <= node.status {
                return Err(StateError::InvalidTransition {
                    id: id.to_string(),
                    from: node.status.to_string(),
                    to: status.to_string(),
                });
            }
            let now = epoch_secs();
            match status {
                NodeStatus::Registered => node.register_at = now,
                NodeStatus::Deregistered => node.deregister_at = now,
                NodeStatus::New => {}
            }
            node.status = status;
            let value = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            node
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %id, %status, "node status updated");
        Ok(node)
    }

    // ── Networkings & IPs ──────────────────────────────────────────

    /// Create a pool and one unallocated `tb_ip` row per address in
    /// `first..=last`, in a single transaction.
    pub fn insert_networking(
        &self,
        networking: &NetworkingRecord,
        first: u32,
        last: u32,
    ) -> StateResult<u32> {
        let value = serde_json::to_vec(networking).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0u32;
        {
            let mut table = txn.open_table(NETWORKINGS).map_err(map_err!(Table))?;
            if table
                .get(networking.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::AlreadyExists(format!(
                    "networking {}",
                    networking.id
                )));
            }
            table
                .insert(networking.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut ips = txn.open_table(IPS).map_err(map_err!(Table))?;
            for ip in first..=last {
                let record = IpRecord {
                    ip_addr: ip,
                    prefix: networking.prefix,
                    networking_id: networking.id.clone(),
                    allocated: false,
                    unit_id: None,
                };
                let row = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                let key = ip_key(&networking.id, ip);
                ips.insert(key.as_str(), row.as_slice())
                    .map_err(map_err!(Write))?;
                count += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(networking = %networking.id, ips = count, "networking pool created");
        Ok(count)
    }

    pub fn get_networking(&self, id: &str) -> StateResult<Option<NetworkingRecord>> {
        self.get_json(NETWORKINGS, id)
    }

    pub fn list_networkings(&self) -> StateResult<Vec<NetworkingRecord>> {
        self.scan_json(NETWORKINGS, "")
    }

    pub fn set_networking_enabled(&self, id: &str, enabled: bool) -> StateResult<()> {
        let mut networking = self
            .get_networking(id)?
            .ok_or_else(|| StateError::NotFound(format!("networking {id}")))?;
        networking.enabled = enabled;
        self.put_json(NETWORKINGS, id, &networking)
    }

    /// All addresses of a pool, ordered by address.
    pub fn list_ips(&self, networking_id: &str) -> StateResult<Vec<IpRecord>> {
        self.scan_json(IPS, &format!("{networking_id}:"))
    }

    pub fn get_ip(&self, networking_id: &str, ip: u32) -> StateResult<Option<IpRecord>> {
        self.get_json(IPS, &ip_key(networking_id, ip))
    }

    /// Number of `tb_ip` rows with `allocated = true`.
    pub fn count_allocated_ips(&self) -> StateResult<usize> {
        let ips: Vec<IpRecord> = self.scan_json(IPS, "")?;
        Ok(ips.iter().filter(|ip| ip.allocated).count())
    }

    /// Total number of `tb_ip` rows.
    pub fn count_ips(&self) -> StateResult<usize> {
        let ips: Vec<IpRecord> = self.scan_json(IPS, "")?;
        Ok(ips.len())
    }

    // ── Ports ──────────────────────────────────────────────────────

    /// Assign one fresh port number per name from the auto-increment counter
    /// and insert the rows with `allocated = false`.
    pub fn reserve_ports(
        &self,
        unit_id: &str,
        names: &[String],
        base: u32,
    ) -> StateResult<Vec<PortRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut records = Vec::with_capacity(names.len());
        {
            let mut seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let current = seq
                .get(PORT_SEQUENCE)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let mut next = current.max(u64::from(base));

            let mut ports = txn.open_table(PORTS).map_err(map_err!(Table))?;
            for name in names {
                let port = u32::try_from(next)
                    .map_err(|_| StateError::Write("port sequence exhausted".to_string()))?;
                let record = PortRecord {
                    port,
                    name: name.clone(),
                    unit_id: unit_id.to_string(),
                    allocated: false,
                };
                let row = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                ports.insert(port, row.as_slice()).map_err(map_err!(Write))?;
                records.push(record);
                next += 1;
            }
            seq.insert(PORT_SEQUENCE, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%unit_id, count = records.len(), "ports reserved");
        Ok(records)
    }

    pub fn get_port(&self, port: u32) -> StateResult<Option<PortRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PORTS).map_err(map_err!(Table))?;
        match table.get(port).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    pub fn list_ports(&self) -> StateResult<Vec<PortRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PORTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    pub fn list_ports_for_unit(&self, unit_id: &str) -> StateResult<Vec<PortRecord>> {
        Ok(self
            .list_ports()?
            .into_iter()
            .filter(|p| p.unit_id == unit_id)
            .collect())
    }

    /// Delete every port row owned by a unit. Returns the number removed.
    pub fn delete_ports_for_unit(&self, unit_id: &str) -> StateResult<u32> {
        let doomed: Vec<u32> = self
            .list_ports_for_unit(unit_id)?
            .into_iter()
            .map(|p| p.port)
            .collect();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PORTS).map_err(map_err!(Table))?;
            for port in &doomed {
                table.remove(*port).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(doomed.len() as u32)
    }

    // ── Ledger transactions ────────────────────────────────────────

    /// Mark every claimed IP and port `allocated = true` in one transaction.
    ///
    /// An IP already held by a different unit, or a missing row, aborts the
    /// whole transaction.
    pub fn commit_reservations(&self, ips: &[IpClaim], ports: &[u32]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut ip_table = txn.open_table(IPS).map_err(map_err!(Table))?;
            for claim in ips {
                let key = ip_key(&claim.networking_id, claim.ip);
                let current: Option<IpRecord> = ip_table
                    .get(key.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| serde_json::from_slice(guard.value()))
                    .transpose()
                    .map_err(map_err!(Deserialize))?;
                let mut record = current.ok_or_else(|| StateError::NotFound(format!("ip {key}")))?;
                if record.allocated && record.unit_id.as_deref() != Some(claim.unit_id.as_str()) {
                    return Err(StateError::Conflict(format!(
                        "ip {key} already allocated to {}",
                        record.unit_id.as_deref().unwrap_or("unknown")
                    )));
                }
                record.allocated = true;
                record.unit_id = Some(claim.unit_id.clone());
                let row = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                ip_table
                    .insert(key.as_str(), row.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut port_table = txn.open_table(PORTS).map_err(map_err!(Table))?;
            for port in ports {
                set_port_allocated(&mut port_table, *port, true)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(ips = ips.len(), ports = ports.len(), "reservations committed");
        Ok(())
    }

    /// Mark IPs and ports `allocated = false` in one transaction.
    pub fn release_reservations(&self, ips: &[(NetworkingId, u32)], ports: &[u32]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut ip_table = txn.open_table(IPS).map_err(map_err!(Table))?;
            for (networking_id, ip) in ips {
                let key = ip_key(networking_id, *ip);
                let current: Option<IpRecord> = ip_table
                    .get(key.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| serde_json::from_slice(guard.value()))
                    .transpose()
                    .map_err(map_err!(Deserialize))?;
                let mut record = current.ok_or_else(|| StateError::NotFound(format!("ip {key}")))?;
                record.allocated = false;
                record.unit_id = None;
                let row = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                ip_table
                    .insert(key.as_str(), row.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut port_table = txn.open_table(PORTS).map_err(map_err!(Table))?;
            for port in ports {
                set_port_allocated(&mut port_table, *port, false)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(ips = ips.len(), ports = ports.len(), "reservations released");
        Ok(())
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn put_service(&self, svc: &ServiceRecord) -> StateResult<()> {
        self.put_json(SERVICES, &svc.name, svc)
    }

    /// Insert a service row; fails if the name is taken.
    pub fn insert_service(&self, svc: &ServiceRecord) -> StateResult<()> {
        self.insert_new_json(SERVICES, &svc.name, svc)?;
        debug!(service = %svc.name, "service inserted");
        Ok(())
    }

    pub fn get_service(&self, name: &str) -> StateResult<Option<ServiceRecord>> {
        self.get_json(SERVICES, name)
    }

    pub fn list_services(&self) -> StateResult<Vec<ServiceRecord>> {
        self.scan_json(SERVICES, "")
    }

    pub fn delete_service(&self, name: &str) -> StateResult<bool> {
        self.delete_key(SERVICES, name)
    }

    // ── Units ──────────────────────────────────────────────────────

    pub fn put_unit(&self, unit: &UnitRecord) -> StateResult<()> {
        self.put_json(UNITS, &unit.table_key(), unit)
    }

    pub fn list_units_for_service(&self, service_id: &str) -> StateResult<Vec<UnitRecord>> {
        self.scan_json(UNITS, &format!("{service_id}:"))
    }

    pub fn delete_units_for_service(&self, service_id: &str) -> StateResult<u32> {
        self.delete_prefix(UNITS, &format!("{service_id}:"))
    }

    // ── Software ───────────────────────────────────────────────────

    pub fn put_software(&self, software: &SoftwareRecord) -> StateResult<()> {
        self.put_json(SOFTWARE, &software.table_key(), software)
    }

    pub fn get_software(&self, name: &str, version: &str) -> StateResult<Option<SoftwareRecord>> {
        self.get_json(SOFTWARE, &software_key(name, version))
    }

    pub fn list_software(&self) -> StateResult<Vec<SoftwareRecord>> {
        self.scan_json(SOFTWARE, "")
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn put_task(&self, task: &TaskRecord) -> StateResult<()> {
        self.put_json(TASKS, &task.id, task)
    }

    pub fn get_task(&self, id: &str) -> StateResult<Option<TaskRecord>> {
        self.get_json(TASKS, id)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        self.scan_json(TASKS, "")
    }

    /// Flag every `running` task as `in_flight`. Returns how many changed.
    pub fn mark_running_tasks_in_flight(&self) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut changed = 0u32;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut running: Vec<TaskRecord> = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let task: TaskRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if task.status == TaskStatus::Running {
                    running.push(task);
                }
            }
            for mut task in running {
                task.status = TaskStatus::InFlight;
                let row = serde_json::to_vec(&task).map_err(map_err!(Serialize))?;
                table
                    .insert(task.id.as_str(), row.as_slice())
                    .map_err(map_err!(Write))?;
                changed += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(changed)
    }
}

fn set_port_allocated(
    table: &mut redb::Table<'_, u32, &'static [u8]>,
    port: u32,
    allocated: bool,
) -> StateResult<()> {
    let current: Option<PortRecord> = table
        .get(port)
        .map_err(map_err!(Read))?
        .map(|guard| serde_json::from_slice(guard.value()))
        .transpose()
        .map_err(map_err!(Deserialize))?;
    let mut record = current.ok_or_else(|| StateError::NotFound(format!("port {port}")))?;
    record.allocated = allocated;
    let row = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
    table.insert(port, row.as_slice()).map_err(map_err!(Write))?;
    Ok(())
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
