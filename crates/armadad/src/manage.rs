//! `armadad manage` — wires the store, scheduler, watchdog, membership,
//! coordinator, region, and discovery together and runs until Ctrl-C.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use armada_cluster::discovery::nodes_path;
use armada_cluster::{
    Candidate, Coordinator, DiscoveryEntry, DiscoveryUri, Follower, LeadershipHooks,
    LocalElection, MembershipManager, Watchdog, new_backend, watch_backend,
};
use armada_core::{ClusterDriver, ManageConfig, StrategyName, features};
use armada_placement::{EngineView, HEALTH_MAX, Scheduler};
use armada_region::{MockEngine, Region, RegionOptions, RegionResult};
use armada_state::{Datacenter, NodeRecord, NodeStatus, StateStore, globals};
use clap::Args;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Datacenter that simulated engines are attached to.
const SIMULATED_DATACENTER: &str = "simulated";

#[derive(Args, Debug, Default)]
pub struct ManageArgs {
    /// TOML configuration file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the state database.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Placement strategy: spread_v2, group, binpack, or random.
    #[arg(long)]
    strategy: Option<String>,

    /// Filter to enable; repeat for several. Replaces the configured list.
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// swarm, garden, or mesos-experimental.
    #[arg(long)]
    cluster_driver: Option<String>,

    #[arg(long)]
    heartbeat: Option<String>,

    #[arg(long)]
    ttl: Option<String>,

    /// Minimum connected engines for admissions.
    #[arg(long)]
    quorum: Option<usize>,

    /// Discovery URI, e.g. `nodes://10.0.0.[1:4]:2375` or `file:///etc/armada/engines`.
    #[arg(long)]
    discovery: Option<String>,

    /// Discovery `key=value,...` options.
    #[arg(long)]
    discovery_opt: Option<String>,

    #[arg(long)]
    replication: bool,

    /// `ip:port` advertised to replicas.
    #[arg(long)]
    advertise: Option<String>,

    #[arg(long)]
    replication_ttl: Option<String>,

    #[arg(long)]
    experimental: bool,

    /// Attach discovered engines as in-memory engines of `CPUS:MEMORY_GIB`.
    #[arg(long, value_name = "CPUS:MEMORY_GIB")]
    simulate_engines: Option<String>,
}

impl ManageArgs {
    /// Defaults, then the config file, then flags. The result is validated.
    pub fn effective_config(&self) -> anyhow::Result<ManageConfig> {
        let mut config = match &self.config {
            Some(path) => ManageConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ManageConfig::default(),
        };

        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(strategy) = &self.strategy {
            config.strategy = StrategyName::parse(strategy)?;
        }
        if !self.filters.is_empty() {
            config.filters = self.filters.clone();
        }
        if let Some(driver) = &self.cluster_driver {
            config.cluster_driver = ClusterDriver::parse(driver)?;
        }
        if let Some(heartbeat) = &self.heartbeat {
            config.heartbeat = heartbeat.clone();
        }
        if let Some(ttl) = &self.ttl {
            config.ttl = ttl.clone();
        }
        if let Some(quorum) = self.quorum {
            config.quorum = quorum;
        }
        if let Some(uri) = &self.discovery {
            config.discovery.uri = uri.clone();
        }
        if let Some(opts) = &self.discovery_opt {
            config.discovery.options = opts.clone();
        }
        if self.replication {
            config.replication.enabled = true;
        }
        if let Some(addr) = &self.advertise {
            config.replication.advertise = Some(addr.clone());
        }
        if let Some(ttl) = &self.replication_ttl {
            config.replication.ttl = ttl.clone();
        }
        if self.experimental {
            config.experimental = true;
        }

        config.validate()?;
        Ok(config)
    }

    fn simulated_capacity(&self) -> anyhow::Result<Option<EngineCapacity>> {
        self.simulate_engines
            .as_deref()
            .map(EngineCapacity::parse)
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EngineCapacity {
    cpus: u64,
    memory: u64,
}

impl EngineCapacity {
    fn parse(s: &str) -> anyhow::Result<Self> {
        let (cpus, gib) = s
            .split_once(':')
            .with_context(|| format!("expected CPUS:MEMORY_GIB, got {s}"))?;
        Ok(Self {
            cpus: cpus.trim().parse().with_context(|| format!("bad cpu count in {s}"))?,
            memory: gib
                .trim()
                .parse::<u64>()
                .with_context(|| format!("bad memory size in {s}"))?
                << 30,
        })
    }
}

pub async fn run(args: ManageArgs) -> anyhow::Result<()> {
    let config = args.effective_config()?;
    let simulated = args.simulated_capacity()?;
    info!(
        strategy = config.strategy.as_str(),
        filters = ?config.filters,
        quorum = config.quorum,
        "armada manager starting"
    );

    features::init_experimental(config.experimental);
    globals::init_nodes_kv_path(nodes_path(&config.discovery_options()));

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("armada.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Core subsystems ────────────────────────────────────────────
    let scheduler = Scheduler::from_config(&config)?;
    let watchdog = Arc::new(Watchdog::new(config.quorum));
    let region = Region::new(
        store.clone(),
        scheduler,
        Arc::clone(&watchdog),
        RegionOptions::from_config(&config),
    )?;
    let membership =
        Arc::new(MembershipManager::new(store, Arc::clone(&watchdog)).with_ttl(config.ttl()?));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    handles.push(tokio::spawn({
        let region = Arc::clone(&region);
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(err) = region.run(shutdown).await {
                warn!(error = %err, "region exited with error");
            }
        }
    }));
    handles.push(tokio::spawn(
        Arc::clone(&membership).run_monitor(config.heartbeat()?, shutdown_rx.clone()),
    ));

    // ── Leadership ─────────────────────────────────────────────────
    // Elections run in-process; an external election backend plugs in
    // through the Candidate/Follower traits.
    if config.replication.enabled {
        warn!("replication enabled without an external election backend, running as sole candidate");
    }
    let coordinator = build_coordinator(&config, Arc::clone(&region));
    handles.push(tokio::spawn(coordinator.run(shutdown_rx.clone())));

    // ── Discovery ──────────────────────────────────────────────────
    if !config.discovery.uri.is_empty() {
        let uri = DiscoveryUri::parse(&config.discovery.uri)?;
        let backend = new_backend(&uri)?;
        let heartbeat = config.heartbeat()?;
        let entries = watch_backend(backend, heartbeat, shutdown_rx.clone());
        let tracker = EngineTracker::new(Arc::clone(&region), Arc::clone(&membership), simulated);
        handles.push(tokio::spawn(tracker.run(entries, heartbeat, shutdown_rx.clone())));
        info!(uri = %config.discovery.uri, "discovery watch started");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    info!("armada manager stopped");
    Ok(())
}

/// Coordinator with the in-process election driving `region`'s hooks.
fn build_coordinator(config: &ManageConfig, region: Arc<Region>) -> Arc<Coordinator> {
    let election = Arc::new(LocalElection::always_primary());
    let advertise = config
        .replication
        .advertise
        .clone()
        .unwrap_or_else(|| "local".to_string());
    let candidate: Arc<dyn Candidate> = election.clone();
    let follower: Arc<dyn Follower> = election;
    let hooks: Arc<dyn LeadershipHooks> = region;
    Arc::new(Coordinator::new(candidate, follower, hooks, advertise))
}

// ── Discovery tracking ─────────────────────────────────────────────

/// Turns discovery snapshots into membership joins, leaves, and heartbeats.
struct EngineTracker {
    region: Arc<Region>,
    membership: Arc<MembershipManager>,
    simulated: Option<EngineCapacity>,
    known: HashSet<String>,
}

impl EngineTracker {
    fn new(
        region: Arc<Region>,
        membership: Arc<MembershipManager>,
        simulated: Option<EngineCapacity>,
    ) -> Self {
        Self {
            region,
            membership,
            simulated,
            known: HashSet::new(),
        }
    }

    async fn run(
        mut self,
        mut entries: mpsc::Receiver<Vec<DiscoveryEntry>>,
        heartbeat: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(heartbeat);
        loop {
            tokio::select! {
                update = entries.recv() => {
                    let Some(update) = update else { break };
                    self.apply(&update).await;
                }
                _ = ticker.tick() => {
                    for engine_id in &self.known {
                        self.membership.heartbeat(engine_id);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("engine tracker stopped");
    }

    async fn apply(&mut self, entries: &[DiscoveryEntry]) {
        let current: HashSet<String> = entries.iter().map(DiscoveryEntry::to_string).collect();

        for gone in self.known.difference(&current) {
            self.membership.leave(gone);
            if let Err(err) = self.region.set_engine_health(gone, 0).await {
                debug!(engine = %gone, error = %err, "vanished engine was not attached");
            }
        }

        let mut joined: HashSet<String> = self.known.intersection(&current).cloned().collect();
        for engine_id in current.difference(&self.known) {
            if let Err(err) = self.membership.join(engine_id, engine_id) {
                warn!(engine = %engine_id, error = %err, "engine refused");
                continue;
            }
            if let Some(capacity) = self.simulated {
                if let Err(err) = self.attach_simulated(engine_id, capacity).await {
                    warn!(engine = %engine_id, error = %err, "failed to attach simulated engine");
                }
            }
            joined.insert(engine_id.clone());
        }
        info!(engines = joined.len(), "discovery applied");
        self.known = joined;
    }

    async fn attach_simulated(&self, engine_id: &str, capacity: EngineCapacity) -> RegionResult<()> {
        let datacenters = self.region.list_datacenters().await;
        if !datacenters.iter().any(|dc| dc.id == SIMULATED_DATACENTER) {
            self.region
                .add_datacenter(Datacenter {
                    id: SIMULATED_DATACENTER.to_string(),
                    name: SIMULATED_DATACENTER.to_string(),
                    kind: "generic".to_string(),
                    storage_type: globals::default_stores()
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "local".to_string()),
                    storage_id: String::new(),
                    datacenter: String::new(),
                    enabled: true,
                    max_node: 0,
                    usage_limit: 1.0,
                })
                .await?;
        }

        let existing = self
            .region
            .list_nodes()
            .await
            .into_iter()
            .find(|n| n.name == engine_id);
        if existing.is_none() {
            let node_id = Uuid::new_v4().to_string();
            self.region
                .add_node(NodeRecord {
                    id: node_id.clone(),
                    name: engine_id.to_string(),
                    cluster_id: SIMULATED_DATACENTER.to_string(),
                    admin_ip: engine_id.split(':').next().unwrap_or_default().to_string(),
                    max_container: 0,
                    status: NodeStatus::New,
                    register_at: 0,
                    deregister_at: 0,
                })
                .await?;
            self.region.register_node(&node_id).await?;
        }

        let engine = MockEngine::new(EngineView {
            id: engine_id.to_string(),
            name: engine_id.to_string(),
            addr: engine_id.to_string(),
            total_cpus: capacity.cpus,
            total_memory: capacity.memory,
            health: HEALTH_MAX,
            ..Default::default()
        });
        self.region.add_engine(Arc::new(engine)).await
    }
}
