//! Property tests for ledger conservation and single admission.

use std::sync::Arc;

use armada_core::parse_ip_u32;
use armada_placement::ContainerConfig;
use armada_region::{Ledger, PreAllocResource, Service, Unit, UnitRequest};
use armada_state::{
    ModuleType, NetworkingRecord, NetworkingType, ServiceSpec, ServiceStatus, StateStore,
};
use proptest::prelude::*;

const POOL_SIZE: usize = 8;
const ENGINE_CORES: u32 = 16;

#[derive(Debug, Clone)]
enum Op {
    Preallocate(usize),
    Commit,
    Recycle,
    Teardown,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..4).prop_map(Op::Preallocate),
        Just(Op::Commit),
        Just(Op::Recycle),
        Just(Op::Teardown),
    ]
}

fn make_ledger(store: &StateStore) -> Ledger {
    let first = parse_ip_u32("10.1.0.10").unwrap();
    let last = first + POOL_SIZE as u32 - 1;
    let record = NetworkingRecord {
        id: "net-c".to_string(),
        networking: first & 0xffff_ff00,
        kind: NetworkingType::Containers,
        prefix: 24,
        gateway: "10.1.0.1".to_string(),
        enabled: true,
    };
    store.insert_networking(&record, first, last).unwrap();
    let mut ledger = Ledger::load(store, 30000).unwrap();
    ledger.track_engine("e1", ENGINE_CORES);
    ledger
}

/// Preallocate a batch the way the region does: all or nothing.
fn preallocate_batch(
    ledger: &mut Ledger,
    store: &StateStore,
    batch: usize,
    seq: &mut usize,
) -> Option<Vec<PreAllocResource>> {
    let base = ContainerConfig::default();
    let ports = vec!["main".to_string(), "admin".to_string()];
    let mut resources = Vec::new();
    for _ in 0..batch {
        *seq += 1;
        let unit = Unit::new("svc", format!("svc_db_{seq}"), "db", ModuleType::Generic, 0);
        let request = UnitRequest {
            unit: &unit,
            domain: "svc",
            base: &base,
            cpus: 1,
            volumes: &[],
            ports: &ports,
            networkings: &[NetworkingType::Containers],
        };
        match ledger.preallocate(store, &request, "e1") {
            Ok(res) => resources.push(res),
            Err(_) => {
                ledger.recycle(store, &resources).unwrap();
                return None;
            }
        }
    }
    Some(resources)
}

fn ip_count(resources: &[PreAllocResource]) -> usize {
    resources.iter().map(|r| r.networkings.len()).sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ledger_conserves_addresses_ports_and_cores(ops in prop::collection::vec(op(), 1..40)) {
        let store = StateStore::open_in_memory().unwrap();
        let mut ledger = make_ledger(&store);
        let mut pending: Vec<Vec<PreAllocResource>> = Vec::new();
        let mut committed: Vec<PreAllocResource> = Vec::new();
        let mut seq = 0;

        for op in ops {
            match op {
                Op::Preallocate(n) => {
                    if let Some(batch) = preallocate_batch(&mut ledger, &store, n, &mut seq) {
                        pending.push(batch);
                    }
                }
                Op::Commit => {
                    if let Some(batch) = pending.pop() {
                        ledger.consistency(&store, &batch).unwrap();
                        committed.extend(batch);
                    }
                }
                Op::Recycle => {
                    if let Some(batch) = pending.pop() {
                        ledger.recycle(&store, &batch).unwrap();
                    }
                }
                Op::Teardown => {
                    if let Some(res) = committed.pop() {
                        ledger
                            .release_committed(
                                &store,
                                &res.unit_id,
                                Some(&res.engine_id),
                                &res.cpus,
                                &res.networkings,
                            )
                            .unwrap();
                    }
                }
            }

            let held: Vec<PreAllocResource> = pending.iter().flatten().cloned().collect();
            let pending_ips = ip_count(&held);
            let committed_ips = ip_count(&committed);

            prop_assert_eq!(
                ledger.free_ips(NetworkingType::Containers) + pending_ips + committed_ips,
                POOL_SIZE
            );
            prop_assert_eq!(store.count_allocated_ips().unwrap(), committed_ips);
            prop_assert_eq!(store.count_ips().unwrap(), POOL_SIZE);

            let units = (held.len() + committed.len()) as u32;
            prop_assert_eq!(ledger.free_cpus("e1"), Some(ENGINE_CORES - units));

            let rows = store.list_ports().unwrap();
            let allocated = rows.iter().filter(|p| p.allocated).count();
            let committed_ports: usize = committed.iter().map(|r| r.ports.len()).sum();
            prop_assert_eq!(allocated, committed_ports);
            for res in &held {
                for port in &res.ports {
                    let row = store.get_port(port.port).unwrap().unwrap();
                    prop_assert!(!row.allocated);
                }
            }
        }
    }
}

#[test]
fn concurrent_admission_claims_once() {
    let spec = ServiceSpec {
        name: "svc".to_string(),
        description: String::new(),
        modules: Vec::new(),
        users: Vec::new(),
        backup: None,
        failure_retry: None,
    };
    for _ in 0..50 {
        let service = Arc::new(Service::new("svc-1".to_string(), spec.clone(), 2, Vec::new()));
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let service = Arc::clone(&service);
                    scope.spawn(move || service.try_begin())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(winners, 1);
        assert_eq!(service.status(), ServiceStatus::InFlight);
    }
}
