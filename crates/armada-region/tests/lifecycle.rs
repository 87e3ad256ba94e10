//! End-to-end service lifecycle against in-memory engines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use armada_cluster::{LeadershipHooks, Watchdog};
use armada_core::ManageConfig;
use armada_placement::{EngineView, Scheduler};
use armada_region::{Engine, ErrorKind, MockEngine, Region, RegionOptions};
use armada_state::{
    BackupStrategy, Datacenter, HardwareSpec, ModuleSpec, ModuleType, NetworkingType, NodeRecord,
    NodeStatus, ServiceSpec, ServiceStatus, SoftwareRef, StateStore, TaskStatus, UnitState,
};
use tokio::sync::watch;

const GIB: u64 = 1 << 30;

struct Harness {
    region: Arc<Region>,
    engines: Vec<Arc<MockEngine>>,
    watchdog: Arc<Watchdog>,
    _shutdown: watch::Sender<bool>,
}

fn make_datacenter(id: &str) -> Datacenter {
    Datacenter {
        id: id.to_string(),
        name: id.to_string(),
        kind: "upsql".to_string(),
        storage_type: "local".to_string(),
        storage_id: String::new(),
        datacenter: "site-1".to_string(),
        enabled: true,
        max_node: 0,
        usage_limit: 1.0,
    }
}

fn make_node(id: &str, engine_id: &str, dc: &str) -> NodeRecord {
    NodeRecord {
        id: id.to_string(),
        name: engine_id.to_string(),
        cluster_id: dc.to_string(),
        admin_ip: "192.168.0.1".to_string(),
        max_container: 0,
        status: NodeStatus::New,
        register_at: 0,
        deregister_at: 0,
    }
}

fn make_engine(id: &str) -> Arc<MockEngine> {
    Arc::new(MockEngine::new(EngineView {
        id: id.to_string(),
        name: format!("host-{id}"),
        total_cpus: 8,
        total_memory: 16 * GIB,
        health: 100,
        ..Default::default()
    }))
}

fn make_spec(name: &str, count: u32) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        description: String::new(),
        modules: vec![ModuleSpec {
            name: "cache".to_string(),
            kind: ModuleType::Generic,
            image: Some("app:1.0".to_string()),
            software: None,
            count,
            resources: HardwareSpec {
                cpus: 1,
                memory_bytes: GIB,
                volumes: Vec::new(),
                networkings: vec![NetworkingType::Containers],
            },
            candidates: Vec::new(),
            ports: vec!["http".to_string()],
            env: Vec::new(),
            labels: HashMap::new(),
            configures: HashMap::new(),
            config_template: None,
        }],
        users: Vec::new(),
        backup: None,
        failure_retry: Some(0),
    }
}

/// A primary region with one registered engine per datacenter and a
/// 20-address container pool.
async fn make_harness(datacenters: usize, quorum: usize) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let scheduler = Scheduler::from_config(&ManageConfig::default()).unwrap();
    let watchdog = Arc::new(Watchdog::new(quorum));
    let region = Region::new(
        store,
        scheduler,
        Arc::clone(&watchdog),
        RegionOptions::default(),
    )
    .unwrap();
    region.on_elected().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&region).run(shutdown_rx));

    let mut engines = Vec::new();
    for i in 0..datacenters {
        let dc = format!("dc{i}");
        let engine = make_engine(&format!("e{i}"));
        region.add_datacenter(make_datacenter(&dc)).await.unwrap();
        region
            .add_node(make_node(&format!("node{i}"), engine.id(), &dc))
            .await
            .unwrap();
        region.register_node(&format!("node{i}")).await.unwrap();
        region.add_engine(engine.clone()).await.unwrap();
        engines.push(engine);
    }
    region
        .add_networking(
            "net-c",
            NetworkingType::Containers,
            "10.0.0.10",
            "10.0.0.29",
            24,
            "10.0.0.1",
        )
        .await
        .unwrap();

    Harness {
        region,
        engines,
        watchdog,
        _shutdown: shutdown_tx,
    }
}

async fn wait(region: &Region, name: &str) -> ServiceStatus {
    tokio::time::timeout(Duration::from_secs(10), region.wait_service(name))
        .await
        .expect("service did not settle")
        .unwrap()
}

#[tokio::test]
async fn service_deploys_across_datacenters() {
    let h = make_harness(2, 0).await;
    let admission = h.region.add_service(make_spec("web", 2)).await.unwrap();

    assert_eq!(wait(&h.region, "web").await, ServiceStatus::Deployed);

    let service = h.region.get_service("web").await.unwrap();
    let units = service.units();
    assert_eq!(units.len(), 2);
    assert!(units.iter().all(|u| u.state() == UnitState::Started));
    let mut engines: Vec<String> = units
        .iter()
        .map(|u| u.binding().engine_id.unwrap())
        .collect();
    engines.sort();
    assert_eq!(engines, vec!["e0", "e1"]);

    for engine in &h.engines {
        let ids = engine.container_ids();
        assert_eq!(ids.len(), 1);
        assert!(engine.is_running(&ids[0]));
    }

    let store = h.region.store();
    assert_eq!(store.count_allocated_ips().unwrap(), 2);
    let ports = store.list_ports().unwrap();
    assert_eq!(ports.len(), 2);
    assert!(ports.iter().all(|p| p.allocated));
    assert_eq!(h.region.pending_count(), 0);
    assert_eq!(h.region.free_cpus("e0").await, Some(7));

    let task = store.get_task(&admission.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(
        store.get_service("web").unwrap().unwrap().status,
        ServiceStatus::Deployed
    );
}

#[tokio::test]
async fn failed_unit_recycles_the_whole_batch() {
    let h = make_harness(3, 0).await;
    for engine in &h.engines {
        engine.fail_create_named("web_cache_1");
    }

    let admission = h.region.add_service(make_spec("web", 3)).await.unwrap();
    assert_eq!(wait(&h.region, "web").await, ServiceStatus::Failed);

    let store = h.region.store();
    assert_eq!(store.count_allocated_ips().unwrap(), 0);
    assert_eq!(store.count_ips().unwrap(), 20);
    let ports = store.list_ports().unwrap();
    assert_eq!(ports.len(), 3);
    assert!(ports.iter().all(|p| !p.allocated));

    assert_eq!(h.region.pending_count(), 0);
    assert_eq!(h.region.free_ips(NetworkingType::Containers).await, 20);
    for engine in &h.engines {
        assert!(engine.container_ids().is_empty());
        assert_eq!(h.region.free_cpus(engine.id()).await, Some(8));
    }

    let task = store.get_task(&admission.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("web_cache_1"));

    // Units that had started are failed along with the batch.
    let service = h.region.get_service("web").await.unwrap();
    for unit in service.units() {
        assert_eq!(unit.state(), UnitState::Failed, "{}", unit.name);
        assert!(unit.binding().container_id.is_none());
    }
    let rows = store.list_units_for_service(&service.id).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.state == UnitState::Failed));

    // A redeploy after the fault clears starts from scratch.
    for engine in &h.engines {
        engine.clear_failures();
    }
    h.region.deploy_service("web").await.unwrap();
    assert_eq!(wait(&h.region, "web").await, ServiceStatus::Deployed);
    assert_eq!(store.count_allocated_ips().unwrap(), 3);
    assert_eq!(store.list_ports().unwrap().len(), 3);
}

#[tokio::test]
async fn concurrent_submissions_admit_once() {
    let h = make_harness(2, 0).await;
    let (a, b) = tokio::join!(
        h.region.add_service(make_spec("web", 1)),
        h.region.add_service(make_spec("web", 1)),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(wait(&h.region, "web").await, ServiceStatus::Deployed);
    assert_eq!(h.region.list_services().await.len(), 1);
}

#[tokio::test]
async fn submission_refused_without_quorum() {
    let h = make_harness(1, 1).await;
    let err = h.region.add_service(make_spec("web", 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert!(h.region.get_service("web").await.is_none());

    h.watchdog.engine_connected("e0");
    h.region.add_service(make_spec("web", 1)).await.unwrap();
    assert_eq!(wait(&h.region, "web").await, ServiceStatus::Deployed);
}

#[tokio::test]
async fn replica_refuses_submissions() {
    let h = make_harness(1, 0).await;
    h.region.on_demoted().await;
    let err = h.region.add_service(make_spec("web", 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(!h.region.is_primary());
}

#[tokio::test]
async fn unknown_software_is_rejected() {
    let h = make_harness(1, 0).await;
    let mut spec = make_spec("web", 1);
    spec.modules[0].image = None;
    spec.modules[0].software = Some(SoftwareRef {
        name: "redis".to_string(),
        version: "7.2".to_string(),
    });

    let err = h.region.add_service(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.region.list_services().await.is_empty());
}

#[tokio::test]
async fn placement_shortfall_leaves_service_idle() {
    let h = make_harness(1, 0).await;
    let admission = h.region.add_service(make_spec("web", 3)).await.unwrap();
    assert_eq!(wait(&h.region, "web").await, ServiceStatus::Idle);

    let service = h.region.get_service("web").await.unwrap();
    assert!(service.last_error().is_some());
    assert!(service.units().iter().all(|u| u.state() == UnitState::Init));
    assert_eq!(h.region.pending_count(), 0);
    assert_eq!(h.region.free_ips(NetworkingType::Containers).await, 20);
    let task = h.region.store().get_task(&admission.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn remove_service_releases_everything() {
    let h = make_harness(2, 0).await;
    h.region.add_service(make_spec("web", 2)).await.unwrap();
    assert_eq!(wait(&h.region, "web").await, ServiceStatus::Deployed);

    h.region.remove_service("web").await.unwrap();

    let store = h.region.store();
    assert!(h.region.get_service("web").await.is_none());
    assert!(store.get_service("web").unwrap().is_none());
    assert_eq!(store.count_allocated_ips().unwrap(), 0);
    assert!(store.list_ports().unwrap().is_empty());
    for engine in &h.engines {
        assert!(engine.container_ids().is_empty());
        assert_eq!(h.region.free_cpus(engine.id()).await, Some(8));
    }
}

#[tokio::test]
async fn backup_runs_on_every_started_unit() {
    let h = make_harness(2, 0).await;
    let mut spec = make_spec("web", 2);
    spec.backup = Some(BackupStrategy {
        schedule: "0 3 * * *".to_string(),
        retention_days: 7,
        target: "s3://backups/web".to_string(),
    });
    h.region.add_service(spec).await.unwrap();
    assert_eq!(wait(&h.region, "web").await, ServiceStatus::Deployed);

    assert_eq!(h.region.backup_service("web").await.unwrap(), 2);
    for engine in &h.engines {
        let backups: Vec<_> = engine
            .execs()
            .into_iter()
            .filter(|(_, cmd)| cmd.get(1).map(String::as_str) == Some("backup"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].1[2], "s3://backups/web");
    }

    h.region.add_service(make_spec("api", 1)).await.unwrap();
    assert_eq!(wait(&h.region, "api").await, ServiceStatus::Deployed);
    let err = h.region.backup_service("api").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn deregistered_node_receives_nothing() {
    let h = make_harness(2, 0).await;
    h.region.deregister_node("node1").await.unwrap();
    h.region.add_service(make_spec("web", 1)).await.unwrap();
    assert_eq!(wait(&h.region, "web").await, ServiceStatus::Deployed);

    assert_eq!(h.engines[0].container_ids().len(), 1);
    assert!(h.engines[1].container_ids().is_empty());
}

#[tokio::test]
async fn datacenter_node_limit_is_enforced() {
    let h = make_harness(0, 0).await;
    let mut dc = make_datacenter("dc-small");
    dc.max_node = 1;
    h.region.add_datacenter(dc).await.unwrap();
    h.region
        .add_node(make_node("n1", "e1", "dc-small"))
        .await
        .unwrap();
    let err = h
        .region
        .add_node(make_node("n2", "e2", "dc-small"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}
