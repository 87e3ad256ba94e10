//! Resource ledger — CPU sets, IP pools, and port allotments.
//!
//! The in-memory half (free CPU cores per engine, free addresses per pool)
//! lives inside the region and is only touched under the region write
//! lock. The persisted half is the `tb_ip`/`tb_port` tables. A unit's
//! reservations are collected by [`Ledger::preallocate`], then either
//! committed by [`Ledger::consistency`] or released by [`Ledger::recycle`],
//! each in a single store transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use armada_core::u32_to_ip;
use armada_placement::{
    ContainerConfig, NETWORKING_LABEL_KEY, PROXY_NETWORKING_LABEL_KEY, SWARM_ID_LABEL_KEY,
};
use armada_state::{
    IpBinding, IpClaim, NetworkingId, NetworkingRecord, NetworkingType, PortRecord, StateStore,
    VolumeSpec,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RegionError, RegionResult};
use crate::unit::Unit;

/// Reservations held for one pending container.
#[derive(Debug, Clone, PartialEq)]
pub struct PreAllocResource {
    pub unit_id: String,
    pub engine_id: String,
    pub swarm_id: String,
    /// Draft config with constraint, cpuset, network labels, and binds set.
    pub config: ContainerConfig,
    pub networkings: Vec<IpBinding>,
    pub ports: Vec<PortRecord>,
    pub cpus: Vec<u32>,
}

impl PreAllocResource {
    fn ip_claims(&self) -> Vec<IpClaim> {
        self.networkings
            .iter()
            .map(|b| IpClaim {
                networking_id: b.networking_id.clone(),
                ip: b.ip,
                unit_id: self.unit_id.clone(),
            })
            .collect()
    }

    fn ip_keys(&self) -> impl Iterator<Item = (NetworkingId, u32)> + '_ {
        self.networkings
            .iter()
            .map(|b| (b.networking_id.clone(), b.ip))
    }

    fn port_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.ports.iter().map(|p| p.port)
    }
}

/// What one unit asks of the ledger.
#[derive(Debug, Clone, Copy)]
pub struct UnitRequest<'a> {
    pub unit: &'a Unit,
    /// Service name, used as the container domain.
    pub domain: &'a str,
    /// Module-level draft config.
    pub base: &'a ContainerConfig,
    pub cpus: u32,
    pub volumes: &'a [VolumeSpec],
    pub ports: &'a [String],
    pub networkings: &'a [NetworkingType],
}

/// Exclusive core bookkeeping for one engine.
#[derive(Debug, Clone)]
struct CpuSet {
    total: u32,
    used: BTreeSet<u32>,
}

impl CpuSet {
    fn free(&self) -> u32 {
        self.total.saturating_sub(self.used.len() as u32)
    }

    /// Lowest `n` free cores.
    fn alloc(&mut self, n: u32) -> Option<Vec<u32>> {
        if self.free() < n {
            return None;
        }
        let cores: Vec<u32> = (0..self.total)
            .filter(|c| !self.used.contains(c))
            .take(n as usize)
            .collect();
        self.used.extend(cores.iter().copied());
        Some(cores)
    }

    fn release(&mut self, cores: &[u32]) {
        for core in cores {
            self.used.remove(core);
        }
    }
}

#[derive(Debug, Clone)]
struct IpPool {
    record: NetworkingRecord,
    free: BTreeSet<u32>,
    size: usize,
}

#[derive(Debug, Default)]
pub struct Ledger {
    cpusets: HashMap<String, CpuSet>,
    pools: BTreeMap<NetworkingId, IpPool>,
    port_base: u32,
}

impl Ledger {
    pub fn new(port_base: u32) -> Self {
        Self {
            port_base,
            ..Default::default()
        }
    }

    /// Rebuild the pools from the store; unallocated rows are free.
    pub fn load(store: &StateStore, port_base: u32) -> RegionResult<Self> {
        let mut ledger = Self::new(port_base);
        for record in store.list_networkings()? {
            let ips = store.list_ips(&record.id)?;
            let free = ips.iter().filter(|ip| !ip.allocated).map(|ip| ip.ip_addr).collect();
            ledger.add_pool_with_free(record, free, ips.len());
        }
        debug!(pools = ledger.pools.len(), "ledger loaded");
        Ok(ledger)
    }

    // ── Pools ───────────────────────────────────────────────────────

    pub fn add_pool(&mut self, record: NetworkingRecord, first: u32, last: u32) {
        let free: BTreeSet<u32> = (first..=last).collect();
        let size = free.len();
        self.add_pool_with_free(record, free, size);
    }

    fn add_pool_with_free(&mut self, record: NetworkingRecord, free: BTreeSet<u32>, size: usize) {
        self.pools
            .insert(record.id.clone(), IpPool { record, free, size });
    }

    pub fn set_pool_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.pools.get_mut(id) {
            Some(pool) => {
                pool.record.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn free_ips(&self, kind: NetworkingType) -> usize {
        self.pools
            .values()
            .filter(|p| p.record.enabled && p.record.kind == kind)
            .map(|p| p.free.len())
            .sum()
    }

    pub fn pool_size(&self, id: &str) -> Option<usize> {
        self.pools.get(id).map(|p| p.size)
    }

    /// Take the lowest free address of the first enabled pool of `kind`.
    fn alloc_ip(&mut self, kind: NetworkingType) -> RegionResult<IpBinding> {
        for pool in self.pools.values_mut() {
            if !pool.record.enabled || pool.record.kind != kind {
                continue;
            }
            if let Some(ip) = pool.free.pop_first() {
                return Ok(IpBinding {
                    networking_id: pool.record.id.clone(),
                    prefix: pool.record.prefix,
                    ip,
                    kind,
                    gateway: pool.record.gateway.clone(),
                });
            }
        }
        Err(RegionError::ResourceExhausted(format!(
            "no free address in any enabled {kind} networking"
        )))
    }

    fn release_ip(&mut self, networking_id: &str, ip: u32) {
        if let Some(pool) = self.pools.get_mut(networking_id) {
            pool.free.insert(ip);
        }
    }

    // ── CPU sets ────────────────────────────────────────────────────

    pub fn track_engine(&mut self, engine_id: &str, total_cpus: u32) {
        self.cpusets
            .entry(engine_id.to_string())
            .and_modify(|set| set.total = total_cpus)
            .or_insert_with(|| CpuSet {
                total: total_cpus,
                used: BTreeSet::new(),
            });
    }

    pub fn forget_engine(&mut self, engine_id: &str) {
        self.cpusets.remove(engine_id);
    }

    /// Record cores already held by committed units.
    pub fn mark_cpus_used(&mut self, engine_id: &str, cores: &[u32]) {
        if let Some(set) = self.cpusets.get_mut(engine_id) {
            set.used.extend(cores.iter().copied());
        }
    }

    pub fn free_cpus(&self, engine_id: &str) -> Option<u32> {
        self.cpusets.get(engine_id).map(CpuSet::free)
    }

    pub fn alloc_cpus(&mut self, engine_id: &str, n: u32) -> RegionResult<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let set = self
            .cpusets
            .get_mut(engine_id)
            .ok_or_else(|| RegionError::NotFound(format!("engine {engine_id}")))?;
        set.alloc(n).ok_or_else(|| {
            RegionError::ResourceExhausted(format!(
                "engine {engine_id} has {} free cores, {n} requested",
                set.free()
            ))
        })
    }

    fn release_cpus(&mut self, engine_id: &str, cores: &[u32]) {
        if let Some(set) = self.cpusets.get_mut(engine_id) {
            set.release(cores);
        }
    }

    // ── Transactions ────────────────────────────────────────────────

    /// Reserve cores, addresses, and ports for one unit on `engine_id`
    /// and build its draft container config.
    ///
    /// Cores and addresses are held in memory only; port rows are inserted
    /// unallocated. On error nothing stays reserved.
    pub fn preallocate(
        &mut self,
        store: &StateStore,
        request: &UnitRequest<'_>,
        engine_id: &str,
    ) -> RegionResult<PreAllocResource> {
        let cpus = self.alloc_cpus(engine_id, request.cpus)?;

        let mut networkings = Vec::with_capacity(request.networkings.len());
        for kind in request.networkings {
            match self.alloc_ip(*kind) {
                Ok(binding) => networkings.push(binding),
                Err(err) => {
                    self.undo(engine_id, &cpus, &networkings);
                    return Err(err);
                }
            }
        }

        let ports = match store.reserve_ports(&request.unit.id, request.ports, self.port_base) {
            Ok(ports) => ports,
            Err(err) => {
                self.undo(engine_id, &cpus, &networkings);
                return Err(err.into());
            }
        };

        let swarm_id = Uuid::new_v4().to_string();
        let config = draft_config(request, engine_id, &swarm_id, &cpus, &networkings, &ports);
        debug!(
            unit = %request.unit.name,
            engine = %engine_id,
            %swarm_id,
            cpuset = %config.cpuset_cpus,
            ips = networkings.len(),
            ports = ports.len(),
            "unit preallocated"
        );

        Ok(PreAllocResource {
            unit_id: request.unit.id.clone(),
            engine_id: engine_id.to_string(),
            swarm_id,
            config,
            networkings,
            ports,
            cpus,
        })
    }

    fn undo(&mut self, engine_id: &str, cpus: &[u32], networkings: &[IpBinding]) {
        self.release_cpus(engine_id, cpus);
        for binding in networkings {
            self.release_ip(&binding.networking_id, binding.ip);
        }
    }

    /// Mark every address and port of `resources` allocated, all or nothing.
    pub fn consistency(&self, store: &StateStore, resources: &[PreAllocResource]) -> RegionResult<()> {
        let claims: Vec<IpClaim> = resources.iter().flat_map(|r| r.ip_claims()).collect();
        let ports: Vec<u32> = resources.iter().flat_map(|r| r.port_numbers()).collect();
        store.commit_reservations(&claims, &ports)?;
        info!(units = resources.len(), ips = claims.len(), ports = ports.len(), "ledger committed");
        Ok(())
    }

    /// Release every address and port of `resources` and return cores and
    /// addresses to the free sets.
    ///
    /// The in-memory release happens even if the store transaction fails.
    pub fn recycle(&mut self, store: &StateStore, resources: &[PreAllocResource]) -> RegionResult<()> {
        let ips: Vec<(NetworkingId, u32)> = resources.iter().flat_map(|r| r.ip_keys()).collect();
        let ports: Vec<u32> = resources.iter().flat_map(|r| r.port_numbers()).collect();
        let persisted = store.release_reservations(&ips, &ports);

        for res in resources {
            self.undo(&res.engine_id, &res.cpus, &res.networkings);
        }

        match persisted {
            Ok(()) => {
                info!(units = resources.len(), ips = ips.len(), ports = ports.len(), "ledger recycled");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "recycle transaction failed");
                Err(err.into())
            }
        }
    }

    /// Tear down a committed unit: free its addresses and cores and delete
    /// its port rows.
    pub fn release_committed(
        &mut self,
        store: &StateStore,
        unit_id: &str,
        engine_id: Option<&str>,
        cpus: &[u32],
        networkings: &[IpBinding],
    ) -> RegionResult<()> {
        let ips: Vec<(NetworkingId, u32)> = networkings
            .iter()
            .map(|b| (b.networking_id.clone(), b.ip))
            .collect();
        store.release_reservations(&ips, &[])?;
        store.delete_ports_for_unit(unit_id)?;
        if let Some(engine_id) = engine_id {
            self.release_cpus(engine_id, cpus);
        }
        for binding in networkings {
            self.release_ip(&binding.networking_id, binding.ip);
        }
        Ok(())
    }
}

/// `<networkingId>:<ip>/<prefix>:<gateway>`
pub fn format_binding(binding: &IpBinding) -> String {
    format!(
        "{}:{}/{}:{}",
        binding.networking_id,
        u32_to_ip(binding.ip),
        binding.prefix,
        binding.gateway
    )
}

pub fn format_cpuset(cores: &[u32]) -> String {
    cores
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`format_cpuset`]; unparsable tokens are skipped.
pub fn parse_cpuset(cpuset: &str) -> Vec<u32> {
    cpuset
        .split(',')
        .filter_map(|token| token.trim().parse().ok())
        .collect()
}

fn draft_config(
    request: &UnitRequest<'_>,
    engine_id: &str,
    swarm_id: &str,
    cpus: &[u32],
    networkings: &[IpBinding],
    ports: &[PortRecord],
) -> ContainerConfig {
    let mut config = request.base.clone();
    config.name = request.unit.name.clone();
    config.hostname = request.unit.name.clone();
    config.domainname = request.domain.to_string();
    config.add_constraint(&format!("node=={engine_id}"));
    config.cpuset_cpus = format_cpuset(cpus);
    config.host_ports = ports.iter().map(|p| p.port).collect();
    config
        .labels
        .insert(SWARM_ID_LABEL_KEY.to_string(), swarm_id.to_string());

    for (kind, key) in [
        (NetworkingType::Containers, NETWORKING_LABEL_KEY),
        (NetworkingType::ExternalAccess, PROXY_NETWORKING_LABEL_KEY),
    ] {
        let value: Vec<String> = networkings
            .iter()
            .filter(|b| b.kind == kind)
            .map(format_binding)
            .collect();
        if !value.is_empty() {
            config.labels.insert(key.to_string(), value.join(","));
        }
    }

    config.binds = request
        .volumes
        .iter()
        .map(|v| format!("{}_{}:{}", request.unit.name, v.name, v.path))
        .collect();
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::parse_ip_u32;
    use armada_state::ModuleType;

    fn make_pool(store: &StateStore, id: &str, kind: NetworkingType, first: &str, last: &str) -> Ledger {
        let first = parse_ip_u32(first).unwrap();
        let last = parse_ip_u32(last).unwrap();
        let record = NetworkingRecord {
            id: id.to_string(),
            networking: first & 0xffff_ff00,
            kind,
            prefix: 24,
            gateway: "10.0.0.1".to_string(),
            enabled: true,
        };
        store.insert_networking(&record, first, last).unwrap();
        let mut ledger = Ledger::load(store, 20000).unwrap();
        ledger.track_engine("e1", 4);
        ledger
    }

    fn make_unit(name: &str) -> Unit {
        Unit::new("svc-1", name.to_string(), "db", ModuleType::Redis, 0)
    }

    fn request<'a>(unit: &'a Unit, base: &'a ContainerConfig, ports: &'a [String]) -> UnitRequest<'a> {
        UnitRequest {
            unit,
            domain: "svc",
            base,
            cpus: 2,
            volumes: &[],
            ports,
            networkings: &[NetworkingType::Containers],
        }
    }

    #[test]
    fn cpus_take_lowest_free_cores() {
        let mut ledger = Ledger::new(20000);
        ledger.track_engine("e1", 4);
        assert_eq!(ledger.alloc_cpus("e1", 2).unwrap(), vec![0, 1]);
        assert_eq!(ledger.alloc_cpus("e1", 1).unwrap(), vec![2]);
        ledger.release_cpus("e1", &[0]);
        assert_eq!(ledger.alloc_cpus("e1", 2).unwrap(), vec![0, 3]);
        assert!(matches!(
            ledger.alloc_cpus("e1", 1),
            Err(RegionError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn preallocate_builds_draft_config() {
        let store = StateStore::open_in_memory().unwrap();
        let mut ledger = make_pool(&store, "net-a", NetworkingType::Containers, "10.0.0.10", "10.0.0.12");
        let unit = make_unit("svc_db_0");
        let base = ContainerConfig {
            image: "redis:7".to_string(),
            ..Default::default()
        };
        let ports = vec!["redis".to_string()];

        let res = ledger
            .preallocate(&store, &request(&unit, &base, &ports), "e1")
            .unwrap();

        assert_eq!(res.config.cpuset_cpus, "0,1");
        assert_eq!(res.config.hostname, "svc_db_0");
        assert_eq!(res.config.domainname, "svc");
        assert!(res.config.env.contains(&"constraint:node==e1".to_string()));
        assert_eq!(
            res.config.labels.get(NETWORKING_LABEL_KEY).unwrap(),
            "net-a:10.0.0.10/24:10.0.0.1"
        );
        assert_eq!(res.config.host_ports, vec![20000]);
        assert_eq!(ledger.free_ips(NetworkingType::Containers), 2);

        // Nothing is allocated in the store until commit.
        assert_eq!(store.count_allocated_ips().unwrap(), 0);
        assert!(!store.get_port(20000).unwrap().unwrap().allocated);
    }

    #[test]
    fn exhausted_pool_undoes_cpus() {
        let store = StateStore::open_in_memory().unwrap();
        let mut ledger = make_pool(&store, "net-a", NetworkingType::Containers, "10.0.0.10", "10.0.0.10");
        let base = ContainerConfig::default();
        let first = make_unit("u0");
        let second = make_unit("u1");

        ledger
            .preallocate(&store, &request(&first, &base, &[]), "e1")
            .unwrap();
        let err = ledger
            .preallocate(&store, &request(&second, &base, &[]), "e1")
            .unwrap_err();
        assert!(matches!(err, RegionError::ResourceExhausted(_)));
        assert_eq!(ledger.free_cpus("e1"), Some(2));
    }

    #[test]
    fn commit_then_teardown() {
        let store = StateStore::open_in_memory().unwrap();
        let mut ledger = make_pool(&store, "net-a", NetworkingType::Containers, "10.0.0.10", "10.0.0.12");
        let unit = make_unit("u0");
        let base = ContainerConfig::default();
        let ports = vec!["http".to_string(), "admin".to_string()];
        let res = ledger
            .preallocate(&store, &request(&unit, &base, &ports), "e1")
            .unwrap();

        ledger.consistency(&store, std::slice::from_ref(&res)).unwrap();
        assert_eq!(store.count_allocated_ips().unwrap(), 1);
        assert!(store.list_ports_for_unit(&unit.id).unwrap().iter().all(|p| p.allocated));

        ledger
            .release_committed(&store, &unit.id, Some("e1"), &res.cpus, &res.networkings)
            .unwrap();
        assert_eq!(store.count_allocated_ips().unwrap(), 0);
        assert!(store.list_ports_for_unit(&unit.id).unwrap().is_empty());
        assert_eq!(ledger.free_cpus("e1"), Some(4));
        assert_eq!(ledger.free_ips(NetworkingType::Containers), 3);
    }

    #[test]
    fn recycle_resets_rows_and_free_sets() {
        let store = StateStore::open_in_memory().unwrap();
        let mut ledger = make_pool(&store, "net-a", NetworkingType::Containers, "10.0.0.10", "10.0.0.12");
        let base = ContainerConfig::default();
        let ports = vec!["p".to_string()];
        let units: Vec<Unit> = (0..2).map(|i| make_unit(&format!("u{i}"))).collect();
        let resources: Vec<PreAllocResource> = units
            .iter()
            .map(|u| ledger.preallocate(&store, &request(u, &base, &ports), "e1").unwrap())
            .collect();

        let ports_before = store.list_ports().unwrap().len();
        ledger.recycle(&store, &resources).unwrap();

        assert_eq!(store.count_allocated_ips().unwrap(), 0);
        let rows = store.list_ports().unwrap();
        assert_eq!(rows.len(), ports_before);
        assert!(rows.iter().all(|p| !p.allocated));
        assert_eq!(ledger.free_ips(NetworkingType::Containers), 3);
        assert_eq!(ledger.free_cpus("e1"), Some(4));
    }

    #[test]
    fn disabled_pool_is_skipped() {
        let store = StateStore::open_in_memory().unwrap();
        let mut ledger = make_pool(&store, "net-a", NetworkingType::Containers, "10.0.0.10", "10.0.0.12");
        assert!(ledger.set_pool_enabled("net-a", false));
        assert!(ledger.alloc_ip(NetworkingType::Containers).is_err());
    }

    #[test]
    fn cpuset_round_trip() {
        assert_eq!(format_cpuset(&[0, 2, 5]), "0,2,5");
        assert_eq!(parse_cpuset("0, 2,5"), vec![0, 2, 5]);
        assert!(parse_cpuset("").is_empty());
    }
}
