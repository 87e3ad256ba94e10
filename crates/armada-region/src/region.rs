//! Region controller — owns engines, datacenters, networkings, services,
//! and pending containers, and runs the scheduling pipeline.
//!
//! Locking: `inner` is the region-wide reader/writer lock; `pending` is the
//! scheduler mutex. `pending` is taken inside a region read lock when both
//! are needed, never inside the write lock. Ledger mutation happens under
//! the write lock, which is held while the store transaction runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use armada_cluster::{ClusterEvent, EventHandler, HandlerId, LeadershipHooks, Watchdog};
use armada_core::{ManageConfig, parse_ip_u32};
use armada_placement::strategy::CLUSTER_LABEL;
use armada_placement::{ContainerConfig, EngineView, Scheduler, select_node_by_cluster};
use armada_state::{
    Datacenter, ModuleSpec, NetworkingRecord, NetworkingType, NodeRecord, NodeStatus,
    PortBinding, ServiceRecord, ServiceSpec, ServiceStatus, SoftwareRecord, StateStore,
    TaskRecord, TaskStatus, UnitState, epoch_secs,
};
use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{RegionError, RegionResult};
use crate::executor::{UnitJob, cleanup_unit, drive_unit};
use crate::ledger::{Ledger, PreAllocResource, UnitRequest, parse_cpuset};
use crate::operator::Operator;
use crate::service::Service;
use crate::unit::Unit;

/// Capacity of the scheduler and executor channels.
pub const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct RegionOptions {
    /// Default retry budget for a unit's prepare block.
    pub failure_retry: u32,
    /// First port handed out by the port counter.
    pub port_base: u32,
    /// Prefer engines that already hold the image.
    pub image_affinity: bool,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            failure_retry: 2,
            port_base: 20000,
            image_affinity: true,
        }
    }
}

impl RegionOptions {
    pub fn from_config(config: &ManageConfig) -> Self {
        Self {
            failure_retry: config.failure_retry,
            port_base: config.port_base,
            ..Default::default()
        }
    }
}

/// Receipt for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub service_id: String,
    pub task_id: String,
}

struct EngineSlot {
    engine: Arc<dyn Engine>,
    view: EngineView,
    node_id: String,
}

/// Reservation between preallocation and the executor's outcome.
#[derive(Debug, Clone)]
struct PendingContainer {
    engine_id: String,
    config: ContainerConfig,
}

/// A schedulable engine and its node's container cap (0 is unlimited).
struct CandidateView {
    view: EngineView,
    max_container: usize,
}

impl CandidateView {
    fn is_full(&self) -> bool {
        self.max_container > 0 && self.view.container_count() >= self.max_container
    }
}

struct RegionInner {
    datacenters: HashMap<String, Datacenter>,
    /// Keyed by node id.
    nodes: HashMap<String, NodeRecord>,
    /// Keyed by engine id.
    engines: HashMap<String, EngineSlot>,
    /// Keyed by service name.
    services: HashMap<String, Arc<Service>>,
    ledger: Ledger,
}

/// Reservations a scheduling run holds so far. Whatever is left here when
/// the run errors or panics is recycled by the dispatcher.
#[derive(Default)]
struct Reservation {
    resources: Vec<PreAllocResource>,
    /// Whether the batch's pending containers were registered.
    registered: bool,
}

fn lock_reservation(held: &Mutex<Reservation>) -> std::sync::MutexGuard<'_, Reservation> {
    held.lock().unwrap_or_else(|e| e.into_inner())
}

struct ScheduleJob {
    service: Arc<Service>,
    task_id: String,
}

struct ExecuteJob {
    service: Arc<Service>,
    task_id: String,
    resources: Vec<PreAllocResource>,
}

type Receivers = (mpsc::Receiver<ScheduleJob>, mpsc::Receiver<Arc<ExecuteJob>>);

pub struct Region {
    this: Weak<Region>,
    store: StateStore,
    scheduler: Scheduler,
    watchdog: Arc<Watchdog>,
    options: RegionOptions,
    inner: RwLock<RegionInner>,
    pending: Mutex<HashMap<String, PendingContainer>>,
    scheduler_tx: mpsc::Sender<ScheduleJob>,
    executor_tx: mpsc::Sender<Arc<ExecuteJob>>,
    receivers: Mutex<Option<Receivers>>,
    primary: AtomicBool,
    handler: Mutex<Option<HandlerId>>,
    #[cfg(test)]
    panic_after_preallocate: AtomicBool,
}

impl Region {
    /// Load persisted state and build the region. Loops start with [`Region::run`].
    pub fn new(
        store: StateStore,
        scheduler: Scheduler,
        watchdog: Arc<Watchdog>,
        options: RegionOptions,
    ) -> RegionResult<Arc<Self>> {
        let datacenters = store
            .list_datacenters()?
            .into_iter()
            .map(|dc| (dc.id.clone(), dc))
            .collect();
        let nodes = store
            .list_nodes()?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let ledger = Ledger::load(&store, options.port_base)?;

        let mut services = HashMap::new();
        for record in store.list_services()? {
            let units = store
                .list_units_for_service(&record.id)?
                .iter()
                .map(|u| Arc::new(Unit::from_record(u)))
                .collect();
            let service = Arc::new(Service::from_record(&record, units));
            if service.status() != record.status {
                store.put_service(&service.to_record())?;
                warn!(service = %service.name, "in-flight service from previous run marked failed");
            }
            services.insert(service.name.clone(), service);
        }
        info!(
            services = services.len(),
            strategy = scheduler.strategy_name(),
            "region loaded"
        );

        let (scheduler_tx, scheduler_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (executor_tx, executor_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            store,
            scheduler,
            watchdog,
            options,
            inner: RwLock::new(RegionInner {
                datacenters,
                nodes,
                engines: HashMap::new(),
                services,
                ledger,
            }),
            pending: Mutex::new(HashMap::new()),
            scheduler_tx,
            executor_tx,
            receivers: Mutex::new(Some((scheduler_rx, executor_rx))),
            primary: AtomicBool::new(false),
            handler: Mutex::new(None),
            #[cfg(test)]
            panic_after_preallocate: AtomicBool::new(false),
        }))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    fn ensure_primary(&self) -> RegionResult<()> {
        if self.is_primary() {
            Ok(())
        } else {
            Err(RegionError::NotPrimary)
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingContainer>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    // ── Loops ──────────────────────────────────────────────────────

    /// Drain the scheduler and executor channels until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> RegionResult<()> {
        let (scheduler_rx, executor_rx) = self
            .receivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| RegionError::Invariant("region loops already running".to_string()))?;

        let scheduler = tokio::spawn(Arc::clone(&self).scheduler_loop(scheduler_rx, shutdown.clone()));
        let executor = tokio::spawn(Arc::clone(&self).executor_loop(executor_rx, shutdown));
        let _ = tokio::join!(scheduler, executor);
        info!("region stopped");
        Ok(())
    }

    async fn scheduler_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ScheduleJob>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("service scheduler started");
        loop {
            tokio::select! {
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    Arc::clone(&self).dispatch_schedule(job).await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("service scheduler stopped");
    }

    async fn executor_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Arc<ExecuteJob>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("service executor started");
        loop {
            tokio::select! {
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    tokio::spawn(Arc::clone(&self).dispatch_execute(job));
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("service executor stopped");
    }

    /// Schedule one service in its own task so a panic becomes an error.
    /// Reservations held by a failed run are recycled here.
    async fn dispatch_schedule(self: Arc<Self>, job: ScheduleJob) {
        let region = Arc::clone(&self);
        let service = Arc::clone(&job.service);
        let held = Arc::new(Mutex::new(Reservation::default()));
        let run_held = Arc::clone(&held);
        let outcome = match tokio::spawn(async move {
            region.schedule_service(&service, &run_held).await
        })
        .await
        {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(RegionError::Invariant(format!(
                "scheduler panicked: {err}"
            ))),
            Err(err) => Err(RegionError::Invariant(format!("scheduler task failed: {err}"))),
        };

        match outcome {
            Ok(resources) => {
                let execute = Arc::new(ExecuteJob {
                    service: job.service,
                    task_id: job.task_id,
                    resources,
                });
                if self.executor_tx.send(Arc::clone(&execute)).await.is_err() {
                    let err = RegionError::Invariant("executor channel closed".to_string());
                    self.fail_execution(&execute, err).await;
                }
            }
            Err(err) => {
                let reservation = std::mem::take(&mut *lock_reservation(&held));
                self.release_reservation(&job.service, reservation).await;
                self.fail_scheduling(&job.service, &job.task_id, err);
            }
        }
    }

    async fn release_reservation(&self, service: &Service, reservation: Reservation) {
        if reservation.resources.is_empty() {
            return;
        }
        let result = {
            let mut inner = self.inner.write().await;
            inner.ledger.recycle(&self.store, &reservation.resources)
        };
        if let Err(err) = result {
            error!(service = %service.name, error = %err, "recycle after failed scheduling failed");
        }
        if reservation.registered {
            self.drop_pending(&reservation.resources).await;
        }
        info!(service = %service.name, units = reservation.resources.len(), "scheduling reservations recycled");
    }

    /// Execute one service in its own task so a panic becomes an error.
    async fn dispatch_execute(self: Arc<Self>, job: Arc<ExecuteJob>) {
        let region = Arc::clone(&self);
        let running = Arc::clone(&job);
        let outcome = match tokio::spawn(async move { region.execute(&running).await }).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(RegionError::Invariant(format!(
                "executor panicked: {err}"
            ))),
            Err(err) => Err(RegionError::Invariant(format!("executor task failed: {err}"))),
        };

        match outcome {
            Ok(()) => self.complete(&job).await,
            Err(err) => self.fail_execution(&job, err).await,
        }
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// Snapshots of every schedulable engine, with pending reservations
    /// applied and the datacenter usage limit enforced. Engines already at
    /// their node's container cap are left out.
    async fn candidate_views(&self) -> Vec<CandidateView> {
        let inner = self.inner.read().await;
        let mut views: Vec<CandidateView> = inner
            .engines
            .values()
            .filter_map(|slot| {
                let node = inner.nodes.get(&slot.node_id)?;
                if !node.status.is_schedulable() || !slot.view.is_healthy() {
                    return None;
                }
                let dc = inner.datacenters.get(&node.cluster_id)?;
                if !dc.enabled {
                    return None;
                }
                Some(CandidateView {
                    view: apply_usage_limit(&slot.view, dc.usage_limit),
                    max_container: node.max_container as usize,
                })
            })
            .collect();

        {
            let pending = self.lock_pending();
            for (swarm_id, container) in pending.iter() {
                if let Some(c) = views.iter_mut().find(|c| c.view.id == container.engine_id) {
                    if !c.view.has_container(&container.config.name) {
                        c.view.reserve(swarm_id, &container.config);
                    }
                }
            }
        }

        views.retain(|c| !c.is_full());
        views.sort_by(|a, b| a.view.id.cmp(&b.view.id));
        views
    }

    /// Pick engines for every unit, preallocate their resources, and
    /// register the pending containers.
    async fn schedule_service(
        &self,
        service: &Service,
        held: &Mutex<Reservation>,
    ) -> RegionResult<Vec<PreAllocResource>> {
        let spec = service.spec();
        for unit in service.units() {
            if unit.state() != UnitState::Init {
                unit.reset();
            }
        }

        let mut views = self.candidate_views().await;
        let mut plan: Vec<(Arc<Unit>, String, &ModuleSpec)> = Vec::new();
        for module in &spec.modules {
            let base = module_config(module);
            let count = module.count as usize;
            let chosen: Vec<String> = {
                let eligible: Vec<&EngineView> = views
                    .iter()
                    .filter(|c| !c.is_full() && module_accepts(module, &c.view))
                    .map(|c| &c.view)
                    .collect();
                let ranked = self
                    .scheduler
                    .schedule(&eligible, &base, count, self.options.image_affinity)?;
                select_node_by_cluster(&ranked, count)?
                    .iter()
                    .map(|v| v.id.clone())
                    .collect()
            };

            let units = service.units_of_module(&module.name);
            if units.len() != chosen.len() {
                return Err(RegionError::Invariant(format!(
                    "module {} has {} units, {} engines chosen",
                    module.name,
                    units.len(),
                    chosen.len()
                )));
            }
            for (unit, engine_id) in units.into_iter().zip(chosen) {
                if let Some(c) = views.iter_mut().find(|c| c.view.id == engine_id) {
                    c.view.reserve(&unit.id, &base);
                }
                debug!(service = %service.name, unit = %unit.name, engine = %engine_id, "unit placed");
                plan.push((unit, engine_id, module));
            }
        }

        let resources = {
            let mut inner = self.inner.write().await;
            let mut resources = Vec::with_capacity(plan.len());
            for (unit, engine_id, module) in &plan {
                let base = module_config(module);
                let request = UnitRequest {
                    unit: unit.as_ref(),
                    domain: &service.name,
                    base: &base,
                    cpus: module.resources.cpus,
                    volumes: &module.resources.volumes,
                    ports: &module.ports,
                    networkings: &module.resources.networkings,
                };
                let res = inner.ledger.preallocate(&self.store, &request, engine_id)?;
                lock_reservation(held).resources.push(res.clone());
                resources.push(res);
            }
            resources
        };
        #[cfg(test)]
        if self.panic_after_preallocate.load(Ordering::Acquire) {
            panic!("injected fault after preallocation");
        }

        let duplicate = {
            let _inner = self.inner.read().await;
            let mut pending = self.lock_pending();
            match resources.iter().find(|r| pending.contains_key(&r.swarm_id)) {
                Some(res) => Some(res.swarm_id.clone()),
                None => {
                    for res in &resources {
                        pending.insert(
                            res.swarm_id.clone(),
                            PendingContainer {
                                engine_id: res.engine_id.clone(),
                                config: res.config.clone(),
                            },
                        );
                    }
                    lock_reservation(held).registered = true;
                    None
                }
            }
        };
        if let Some(swarm_id) = duplicate {
            return Err(RegionError::Invariant(format!(
                "duplicate pending container {swarm_id}"
            )));
        }

        for res in &resources {
            if let Some(unit) = service.unit(&res.unit_id) {
                let mut binding = unit.binding_mut();
                binding.engine_id = Some(res.engine_id.clone());
                binding.swarm_id = Some(res.swarm_id.clone());
                binding.networkings = res.networkings.clone();
                binding.ports = res
                    .ports
                    .iter()
                    .map(|p| PortBinding {
                        name: p.name.clone(),
                        port: p.port,
                    })
                    .collect();
                binding.cpuset = res.config.cpuset_cpus.clone();
            }
        }
        info!(service = %service.name, units = resources.len(), "service scheduled");
        Ok(resources)
    }

    fn fail_scheduling(&self, service: &Service, task_id: &str, err: RegionError) {
        error!(service = %service.name, kind = ?err.kind(), error = %err, "service scheduling failed");
        for unit in service.units() {
            unit.reset();
        }
        service.settle(ServiceStatus::Idle, Some(err.to_string()));
        self.persist_outcome(service, task_id, Some(&err));
    }

    // ── Execution ──────────────────────────────────────────────────

    async fn execute(&self, job: &ExecuteJob) -> RegionResult<()> {
        let spec = job.service.spec();
        let mut jobs = Vec::with_capacity(job.resources.len());
        {
            let inner = self.inner.read().await;
            for res in &job.resources {
                let slot = inner.engines.get(&res.engine_id).ok_or_else(|| {
                    RegionError::engine(&res.engine_id, anyhow::anyhow!("engine removed"))
                })?;
                let unit = job
                    .service
                    .unit(&res.unit_id)
                    .ok_or_else(|| RegionError::Invariant(format!("unknown unit {}", res.unit_id)))?;
                let module = spec
                    .modules
                    .iter()
                    .find(|m| m.name == unit.module_name)
                    .cloned()
                    .ok_or_else(|| {
                        RegionError::Invariant(format!("unknown module {}", unit.module_name))
                    })?;
                jobs.push((Arc::clone(&slot.engine), unit, res.clone(), module));
            }
        }

        let mut tasks = JoinSet::new();
        for (engine, unit, resource, module) in jobs {
            let required_keys = self.required_keys(&module)?;
            tasks.spawn(drive_unit(UnitJob {
                engine,
                unit,
                resource,
                module,
                required_keys,
                users: spec.users.clone(),
                failure_retry: job.service.failure_retry(),
            }));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result.map(|_| ()),
                Err(err) => Err(RegionError::Invariant(format!("unit task failed: {err}"))),
            };
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn required_keys(&self, module: &ModuleSpec) -> RegionResult<Vec<String>> {
        match &module.software {
            Some(sw) => Ok(self
                .store
                .get_software(&sw.name, &sw.version)?
                .map(|rec| rec.config_key_sets)
                .unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    /// Commit the ledger for a fully started service.
    async fn complete(&self, job: &ExecuteJob) {
        let committed = {
            let mut inner = self.inner.write().await;
            match inner.ledger.consistency(&self.store, &job.resources) {
                Ok(()) => {
                    for res in &job.resources {
                        let container_id = job
                            .service
                            .unit(&res.unit_id)
                            .and_then(|u| u.binding().container_id)
                            .unwrap_or_else(|| res.swarm_id.clone());
                        if let Some(slot) = inner.engines.get_mut(&res.engine_id) {
                            slot.view.reserve(&container_id, &res.config);
                        }
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = committed {
            self.fail_execution(job, err).await;
            return;
        }

        self.drop_pending(&job.resources).await;
        job.service.settle(ServiceStatus::Deployed, None);
        self.persist_outcome(&job.service, &job.task_id, None);
        info!(service = %job.service.name, units = job.resources.len(), "service deployed");
    }

    /// Remove created containers and recycle every reservation of the batch.
    async fn fail_execution(&self, job: &ExecuteJob, err: RegionError) {
        error!(service = %job.service.name, kind = ?err.kind(), error = %err, "service execution failed, recycling");

        for res in &job.resources {
            let Some(unit) = job.service.unit(&res.unit_id) else {
                continue;
            };
            let engine = {
                let inner = self.inner.read().await;
                inner.engines.get(&res.engine_id).map(|s| Arc::clone(&s.engine))
            };
            if let Some(engine) = engine {
                cleanup_unit(engine.as_ref(), &unit).await;
            }
            let previous = unit.abort();
            debug!(unit = %unit.name, ?previous, "unit failed with its batch");
        }

        if let Err(recycle_err) = self.recycle(&job.resources).await {
            error!(service = %job.service.name, error = %recycle_err, "recycle failed");
        }

        for unit in job.service.units() {
            let mut binding = unit.binding_mut();
            binding.engine_id = None;
            binding.container_id = None;
            binding.swarm_id = None;
            binding.networkings.clear();
            binding.cpuset.clear();
        }
        job.service.settle(ServiceStatus::Failed, Some(err.to_string()));
        self.persist_outcome(&job.service, &job.task_id, Some(&err));
    }

    /// Release a batch's reservations and drop its pending containers.
    async fn recycle(&self, resources: &[PreAllocResource]) -> RegionResult<()> {
        let result = {
            let mut inner = self.inner.write().await;
            inner.ledger.recycle(&self.store, resources)
        };
        self.drop_pending(resources).await;
        result
    }

    async fn drop_pending(&self, resources: &[PreAllocResource]) {
        let _inner = self.inner.read().await;
        let mut pending = self.lock_pending();
        for res in resources {
            pending.remove(&res.swarm_id);
        }
    }

    fn persist_outcome(&self, service: &Service, task_id: &str, err: Option<&RegionError>) {
        for unit in service.units() {
            if let Err(e) = self.store.put_unit(&unit.to_record()) {
                error!(unit = %unit.name, error = %e, "failed to persist unit");
            }
        }
        if let Err(e) = self.store.put_service(&service.to_record()) {
            error!(service = %service.name, error = %e, "failed to persist service");
        }
        self.finish_task(task_id, err);
    }

    fn finish_task(&self, task_id: &str, err: Option<&RegionError>) {
        let task = match self.store.get_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                error!(task = %task_id, error = %e, "failed to load task");
                return;
            }
        };
        let finished = TaskRecord {
            status: if err.is_some() {
                TaskStatus::Failed
            } else {
                TaskStatus::Done
            },
            error: err.map(|e| e.to_string()),
            finished_at: Some(epoch_secs()),
            ..task
        };
        if let Err(e) = self.store.put_task(&finished) {
            error!(task = %task_id, error = %e, "failed to persist task");
        }
    }

    // ── Admission ──────────────────────────────────────────────────

    /// Validate and admit a new service, then queue it for scheduling.
    pub async fn add_service(&self, mut spec: ServiceSpec) -> RegionResult<Admission> {
        self.ensure_primary()?;
        self.resolve_software(&mut spec)?;
        validate_spec(&spec)?;
        self.ensure_quorum()?;

        let failure_retry = spec.failure_retry.unwrap_or(self.options.failure_retry);
        let service_id = Uuid::new_v4().to_string();
        let now = epoch_secs();
        let units = spec
            .modules
            .iter()
            .flat_map(|module| {
                let service_id = service_id.clone();
                let service_name = spec.name.clone();
                (0..module.count).map(move |i| {
                    Arc::new(Unit::new(
                        &service_id,
                        format!("{service_name}_{}_{i}", module.name),
                        &module.name,
                        module.kind,
                        now,
                    ))
                })
            })
            .collect();
        let service = Arc::new(Service::new(service_id, spec, failure_retry, units));

        {
            let mut inner = self.inner.write().await;
            if inner.services.contains_key(&service.name) {
                return Err(RegionError::Conflict(format!(
                    "service {} already exists",
                    service.name
                )));
            }
            if !service.try_begin() {
                return Err(RegionError::Invariant(format!(
                    "fresh service {} already in flight",
                    service.name
                )));
            }
            if let Err(err) = self.persist_new_service(&service) {
                service.settle(ServiceStatus::Idle, Some(err.to_string()));
                return Err(err);
            }
            inner
                .services
                .insert(service.name.clone(), Arc::clone(&service));
        }
        info!(service = %service.name, units = service.units().len(), "service admitted");
        self.enqueue(service).await
    }

    /// Re-run scheduling for an idle or failed service.
    pub async fn deploy_service(&self, name: &str) -> RegionResult<Admission> {
        self.ensure_primary()?;
        self.ensure_quorum()?;
        let service = self
            .get_service(name)
            .await
            .ok_or_else(|| RegionError::NotFound(format!("service {name}")))?;
        if service.status() == ServiceStatus::Failed {
            service.reopen();
        }
        if !service.try_begin() {
            return Err(RegionError::Conflict(format!(
                "service {name} is {:?}",
                service.status()
            )));
        }
        for unit in service.units() {
            if let Err(err) = self.store.delete_ports_for_unit(&unit.id) {
                service.settle(ServiceStatus::Idle, Some(err.to_string()));
                return Err(err.into());
            }
        }
        if let Err(err) = self.store.put_service(&service.to_record()) {
            service.settle(ServiceStatus::Idle, Some(err.to_string()));
            return Err(err.into());
        }
        self.enqueue(service).await
    }

    fn ensure_quorum(&self) -> RegionResult<()> {
        if self.watchdog.has_quorum() {
            Ok(())
        } else {
            Err(RegionError::ResourceExhausted(format!(
                "cluster quorum lost: {} engines connected",
                self.watchdog.connected_count()
            )))
        }
    }

    fn persist_new_service(&self, service: &Service) -> RegionResult<()> {
        self.store.insert_service(&service.to_record())?;
        for unit in service.units() {
            if let Err(err) = self.store.put_unit(&unit.to_record()) {
                let _ = self.store.delete_units_for_service(&service.id);
                let _ = self.store.delete_service(&service.name);
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn enqueue(&self, service: Arc<Service>) -> RegionResult<Admission> {
        let task = TaskRecord {
            id: Uuid::new_v4().to_string(),
            service_id: service.id.clone(),
            action: "deploy".to_string(),
            status: TaskStatus::Running,
            error: None,
            created_at: epoch_secs(),
            finished_at: None,
        };
        if let Err(err) = self.store.put_task(&task) {
            service.settle(ServiceStatus::Idle, Some(err.to_string()));
            return Err(err.into());
        }

        let admission = Admission {
            service_id: service.id.clone(),
            task_id: task.id.clone(),
        };
        let job = ScheduleJob {
            service: Arc::clone(&service),
            task_id: task.id.clone(),
        };
        if self.scheduler_tx.send(job).await.is_err() {
            let err = RegionError::Invariant("scheduler channel closed".to_string());
            service.settle(ServiceStatus::Idle, Some(err.to_string()));
            self.finish_task(&task.id, Some(&err));
            return Err(err);
        }
        debug!(service = %service.name, task = %task.id, "service queued");
        Ok(admission)
    }

    /// Replace software references with catalogue images, ports, and templates.
    fn resolve_software(&self, spec: &mut ServiceSpec) -> RegionResult<()> {
        for module in &mut spec.modules {
            let Some(sw) = &module.software else {
                continue;
            };
            let record = self
                .store
                .get_software(&sw.name, &sw.version)?
                .filter(|rec| rec.enabled)
                .ok_or_else(|| {
                    RegionError::Validation(format!(
                        "module {}: software {}:{} unknown or disabled",
                        module.name, sw.name, sw.version
                    ))
                })?;
            module.image = Some(record.image_ref());
            if module.ports.is_empty() {
                module.ports = record.ports.clone();
            }
            if module.config_template.is_none() && !record.template.is_empty() {
                module.config_template = Some(record.template.clone());
            }
        }
        Ok(())
    }

    // ── Service queries & teardown ─────────────────────────────────

    pub async fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.inner.read().await.services.get(name).cloned()
    }

    pub async fn list_services(&self) -> Vec<ServiceRecord> {
        let inner = self.inner.read().await;
        let mut records: Vec<ServiceRecord> =
            inner.services.values().map(|s| s.to_record()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Wait until the named service is no longer in flight.
    pub async fn wait_service(&self, name: &str) -> RegionResult<ServiceStatus> {
        let service = self
            .get_service(name)
            .await
            .ok_or_else(|| RegionError::NotFound(format!("service {name}")))?;
        Ok(service.wait_settled().await)
    }

    /// Stop and remove a service's containers, release its resources, and
    /// delete its records.
    pub async fn remove_service(&self, name: &str) -> RegionResult<()> {
        self.ensure_primary()?;
        let service = self
            .get_service(name)
            .await
            .ok_or_else(|| RegionError::NotFound(format!("service {name}")))?;
        let previous = service.status();
        if !service.try_claim() {
            return Err(RegionError::Conflict(format!("service {name} is in flight")));
        }

        let units = service.units();
        let mut touched = HashSet::new();
        for unit in &units {
            let binding = unit.binding();
            let Some(engine_id) = binding.engine_id else {
                continue;
            };
            let engine = {
                let inner = self.inner.read().await;
                inner.engines.get(&engine_id).map(|s| Arc::clone(&s.engine))
            };
            if let Some(engine) = engine {
                cleanup_unit(engine.as_ref(), unit).await;
            }
            touched.insert(engine_id);
        }

        let released = {
            let mut inner = self.inner.write().await;
            let mut result = Ok(());
            for unit in &units {
                let binding = unit.binding();
                result = inner.ledger.release_committed(
                    &self.store,
                    &unit.id,
                    binding.engine_id.as_deref(),
                    &parse_cpuset(&binding.cpuset),
                    &binding.networkings,
                );
                if result.is_err() {
                    break;
                }
            }
            let result = result
                .and_then(|()| Ok(self.store.delete_units_for_service(&service.id)?))
                .and_then(|_| Ok(self.store.delete_service(&service.name)?));
            if result.is_ok() {
                inner.services.remove(&service.name);
            }
            result
        };
        if let Err(err) = released {
            service.settle(previous, Some(err.to_string()));
            return Err(err);
        }

        for engine_id in touched {
            if let Err(err) = self.refresh_engine(&engine_id).await {
                debug!(engine = %engine_id, error = %err, "refresh after teardown failed");
            }
        }
        info!(service = %name, units = units.len(), "service removed");
        Ok(())
    }

    /// Run the service's backup strategy on every started unit. Returns
    /// the number of units backed up.
    pub async fn backup_service(&self, name: &str) -> RegionResult<usize> {
        self.ensure_primary()?;
        let service = self
            .get_service(name)
            .await
            .ok_or_else(|| RegionError::NotFound(format!("service {name}")))?;
        let strategy = service.spec().backup.clone().ok_or_else(|| {
            RegionError::Validation(format!("service {name} has no backup strategy"))
        })?;
        if service.status() != ServiceStatus::Deployed {
            return Err(RegionError::Conflict(format!(
                "service {name} is {:?}",
                service.status()
            )));
        }

        let mut count = 0;
        for unit in service.units() {
            if unit.state() != UnitState::Started {
                continue;
            }
            let binding = unit.binding();
            let (Some(engine_id), Some(container)) = (binding.engine_id, binding.container_id)
            else {
                continue;
            };
            let engine = {
                let inner = self.inner.read().await;
                inner.engines.get(&engine_id).map(|s| Arc::clone(&s.engine))
            }
            .ok_or_else(|| RegionError::NotFound(format!("engine {engine_id}")))?;
            unit.operator()
                .backup(engine.as_ref(), &container, &strategy)
                .await
                .map_err(|e| RegionError::engine(&engine_id, e))?;
            count += 1;
        }
        info!(service = %name, units = count, target = %strategy.target, "service backed up");
        Ok(count)
    }

    // ── Datacenters & nodes ────────────────────────────────────────

    pub async fn add_datacenter(&self, dc: Datacenter) -> RegionResult<()> {
        if dc.id.is_empty() {
            return Err(RegionError::Validation("datacenter id is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&dc.usage_limit) {
            return Err(RegionError::Validation(format!(
                "usage limit {} outside 0.0..=1.0",
                dc.usage_limit
            )));
        }
        let mut inner = self.inner.write().await;
        if inner.datacenters.contains_key(&dc.id) {
            return Err(RegionError::Conflict(format!("datacenter {} exists", dc.id)));
        }
        self.store.put_datacenter(&dc)?;
        info!(datacenter = %dc.id, kind = %dc.kind, "datacenter added");
        inner.datacenters.insert(dc.id.clone(), dc);
        Ok(())
    }

    pub async fn set_datacenter_enabled(&self, id: &str, enabled: bool) -> RegionResult<()> {
        let mut inner = self.inner.write().await;
        let dc = inner
            .datacenters
            .get_mut(id)
            .ok_or_else(|| RegionError::NotFound(format!("datacenter {id}")))?;
        let mut updated = dc.clone();
        updated.enabled = enabled;
        self.store.put_datacenter(&updated)?;
        *dc = updated;
        info!(datacenter = %id, enabled, "datacenter updated");
        Ok(())
    }

    pub async fn list_datacenters(&self) -> Vec<Datacenter> {
        let inner = self.inner.read().await;
        let mut dcs: Vec<Datacenter> = inner.datacenters.values().cloned().collect();
        dcs.sort_by(|a, b| a.id.cmp(&b.id));
        dcs
    }

    /// Add a node in status `new`. An enabled datacenter holds at most
    /// `max_node` nodes.
    pub async fn add_node(&self, mut node: NodeRecord) -> RegionResult<()> {
        let mut inner = self.inner.write().await;
        let dc = inner
            .datacenters
            .get(&node.cluster_id)
            .ok_or_else(|| RegionError::NotFound(format!("datacenter {}", node.cluster_id)))?;
        let members = inner
            .nodes
            .values()
            .filter(|n| n.cluster_id == node.cluster_id)
            .count();
        if dc.enabled && dc.max_node > 0 && members >= dc.max_node as usize {
            return Err(RegionError::ResourceExhausted(format!(
                "datacenter {} already holds {} nodes",
                dc.id, members
            )));
        }
        node.status = NodeStatus::New;
        self.store.insert_node(&node)?;
        info!(node = %node.id, engine = %node.name, datacenter = %node.cluster_id, "node added");
        inner.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub async fn register_node(&self, id: &str) -> RegionResult<NodeRecord> {
        self.update_node_status(id, NodeStatus::Registered).await
    }

    /// Deregistered nodes never receive containers again.
    pub async fn deregister_node(&self, id: &str) -> RegionResult<NodeRecord> {
        self.update_node_status(id, NodeStatus::Deregistered).await
    }

    async fn update_node_status(&self, id: &str, status: NodeStatus) -> RegionResult<NodeRecord> {
        let mut inner = self.inner.write().await;
        let node = self.store.update_node_status(id, status)?;
        info!(node = %id, %status, "node status updated");
        inner.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    pub async fn list_nodes(&self) -> Vec<NodeRecord> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<NodeRecord> = inner.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    // ── Engines ────────────────────────────────────────────────────

    /// Attach an engine to the node whose name is the engine id.
    pub async fn add_engine(&self, engine: Arc<dyn Engine>) -> RegionResult<()> {
        let engine_id = engine.id().to_string();
        let node = {
            let inner = self.inner.read().await;
            inner
                .nodes
                .values()
                .find(|n| n.name == engine_id)
                .cloned()
                .ok_or_else(|| RegionError::NotFound(format!("node for engine {engine_id}")))?
        };
        if node.status == NodeStatus::Deregistered {
            return Err(RegionError::Validation(format!(
                "node {} is deregistered",
                node.id
            )));
        }

        let mut view = engine
            .view()
            .await
            .map_err(|e| RegionError::engine(&engine_id, e))?;
        view.datacenter_id = node.cluster_id.clone();
        view.labels
            .entry(CLUSTER_LABEL.to_string())
            .or_insert_with(|| node.cluster_id.clone());

        let mut inner = self.inner.write().await;
        let total_cpus = u32::try_from(view.total_cpus).unwrap_or(u32::MAX);
        inner.ledger.track_engine(&engine_id, total_cpus);
        let held: Vec<u32> = inner
            .services
            .values()
            .flat_map(|s| s.units())
            .filter(|u| u.state() == UnitState::Started)
            .map(|u| u.binding())
            .filter(|b| b.engine_id.as_deref() == Some(engine_id.as_str()))
            .flat_map(|b| parse_cpuset(&b.cpuset))
            .collect();
        inner.ledger.mark_cpus_used(&engine_id, &held);
        info!(engine = %engine_id, node = %node.id, datacenter = %node.cluster_id, cpus = view.total_cpus, "engine added");
        inner.engines.insert(
            engine_id,
            EngineSlot {
                engine,
                view,
                node_id: node.id,
            },
        );
        Ok(())
    }

    pub async fn remove_engine(&self, engine_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.ledger.forget_engine(engine_id);
        let removed = inner.engines.remove(engine_id).is_some();
        if removed {
            info!(engine = %engine_id, "engine removed");
        }
        removed
    }

    /// Pull a fresh view. An unreachable engine is marked unhealthy.
    pub async fn refresh_engine(&self, engine_id: &str) -> RegionResult<()> {
        let engine = {
            let inner = self.inner.read().await;
            inner
                .engines
                .get(engine_id)
                .map(|s| Arc::clone(&s.engine))
                .ok_or_else(|| RegionError::NotFound(format!("engine {engine_id}")))?
        };
        let fetched = engine.view().await;

        let mut inner = self.inner.write().await;
        let slot = inner
            .engines
            .get_mut(engine_id)
            .ok_or_else(|| RegionError::NotFound(format!("engine {engine_id}")))?;
        match fetched {
            Ok(mut view) => {
                view.datacenter_id = slot.view.datacenter_id.clone();
                for (key, value) in &slot.view.labels {
                    view.labels.entry(key.clone()).or_insert_with(|| value.clone());
                }
                slot.view = view;
                debug!(engine = %engine_id, containers = slot.view.container_count(), "engine refreshed");
                Ok(())
            }
            Err(err) => {
                slot.view.health = 0;
                warn!(engine = %engine_id, error = %err, "engine refresh failed, marked unhealthy");
                Err(RegionError::engine(engine_id, err))
            }
        }
    }

    pub async fn set_engine_health(&self, engine_id: &str, health: u8) -> RegionResult<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .engines
            .get_mut(engine_id)
            .ok_or_else(|| RegionError::NotFound(format!("engine {engine_id}")))?;
        slot.view.health = health.min(armada_placement::HEALTH_MAX);
        debug!(engine = %engine_id, health, "engine health set");
        Ok(())
    }

    pub async fn engine_view(&self, engine_id: &str) -> Option<EngineView> {
        let inner = self.inner.read().await;
        inner.engines.get(engine_id).map(|s| s.view.clone())
    }

    pub async fn list_engines(&self) -> Vec<EngineView> {
        let inner = self.inner.read().await;
        let mut views: Vec<EngineView> = inner.engines.values().map(|s| s.view.clone()).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    // ── Networkings ────────────────────────────────────────────────

    /// Create an IP pool covering `start..=end`. Returns the number of addresses.
    pub async fn add_networking(
        &self,
        id: &str,
        kind: NetworkingType,
        start: &str,
        end: &str,
        prefix: u8,
        gateway: &str,
    ) -> RegionResult<u32> {
        let invalid = |what: &str, value: &str| {
            RegionError::Validation(format!("networking {id}: invalid {what} '{value}'"))
        };
        if prefix == 0 || prefix > 32 {
            return Err(invalid("prefix", &prefix.to_string()));
        }
        let first = parse_ip_u32(start).ok_or_else(|| invalid("start", start))?;
        let last = parse_ip_u32(end).ok_or_else(|| invalid("end", end))?;
        parse_ip_u32(gateway).ok_or_else(|| invalid("gateway", gateway))?;
        let network = first & armada_core::ip::prefix_mask(prefix);
        if last < first || !armada_core::ip::in_prefix(network, prefix, last) {
            return Err(invalid("range", &format!("{start}-{end}/{prefix}")));
        }

        let record = NetworkingRecord {
            id: id.to_string(),
            networking: network,
            kind,
            prefix,
            gateway: gateway.to_string(),
            enabled: true,
        };
        let mut inner = self.inner.write().await;
        let count = self.store.insert_networking(&record, first, last)?;
        inner.ledger.add_pool(record, first, last);
        info!(networking = %id, %kind, count, "networking added");
        Ok(count)
    }

    pub async fn set_networking_enabled(&self, id: &str, enabled: bool) -> RegionResult<()> {
        let mut inner = self.inner.write().await;
        self.store.set_networking_enabled(id, enabled)?;
        inner.ledger.set_pool_enabled(id, enabled);
        info!(networking = %id, enabled, "networking updated");
        Ok(())
    }

    pub async fn free_ips(&self, kind: NetworkingType) -> usize {
        self.inner.read().await.ledger.free_ips(kind)
    }

    pub async fn free_cpus(&self, engine_id: &str) -> Option<u32> {
        self.inner.read().await.ledger.free_cpus(engine_id)
    }

    // ── Software ───────────────────────────────────────────────────

    pub fn add_software(&self, software: &SoftwareRecord) -> RegionResult<()> {
        if software.name.is_empty() || software.version.is_empty() {
            return Err(RegionError::Validation(
                "software name and version are required".to_string(),
            ));
        }
        self.store.put_software(software)?;
        info!(software = %software.table_key(), "software registered");
        Ok(())
    }

    pub fn list_software(&self) -> RegionResult<Vec<SoftwareRecord>> {
        Ok(self.store.list_software()?)
    }
}

// ── Leadership & cluster events ────────────────────────────────────

#[async_trait]
impl LeadershipHooks for Region {
    async fn on_elected(&self) {
        self.primary.store(true, Ordering::Release);
        {
            let mut handler = self.handler.lock().unwrap_or_else(|e| e.into_inner());
            if handler.is_none() {
                if let Some(me) = self.this.upgrade() {
                    *handler = Some(self.watchdog.register(me));
                }
            }
        }
        match self.store.mark_running_tasks_in_flight() {
            Ok(count) => info!(tasks = count, "elected primary, running tasks marked in flight"),
            Err(err) => error!(error = %err, "failed to mark running tasks"),
        }
    }

    async fn on_demoted(&self) {
        self.primary.store(false, Ordering::Release);
        let id = self.handler.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(id) = id {
            self.watchdog.unregister(id);
        }
        info!("demoted to replica");
    }
}

impl EventHandler for Region {
    fn handle(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::EngineDisconnected(engine_id) => {
                let engine_id = engine_id.clone();
                self.spawn_event_work(move |region: Arc<Region>| async move {
                    if let Err(err) = region.set_engine_health(&engine_id, 0).await {
                        debug!(engine = %engine_id, error = %err, "disconnect for unknown engine");
                    }
                });
            }
            ClusterEvent::EngineConnected(engine_id) => {
                let engine_id = engine_id.clone();
                self.spawn_event_work(move |region: Arc<Region>| async move {
                    if let Err(err) = region.refresh_engine(&engine_id).await {
                        debug!(engine = %engine_id, error = %err, "refresh on connect failed");
                    }
                });
            }
            ClusterEvent::QuorumLost { connected, quorum } => {
                warn!(connected, quorum, "quorum lost, admissions refused");
            }
            ClusterEvent::QuorumRestored { connected, quorum } => {
                info!(connected, quorum, "quorum restored, admissions accepted");
            }
        }
    }
}

impl Region {
    fn spawn_event_work<F, Fut>(&self, work: F)
    where
        F: FnOnce(Arc<Region>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let Some(region) = self.this.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(work(region));
            }
            Err(_) => warn!("cluster event outside a runtime dropped"),
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Module-level draft config handed to the scheduler.
fn module_config(module: &ModuleSpec) -> ContainerConfig {
    ContainerConfig {
        name: module.name.clone(),
        image: module.image.clone().unwrap_or_default(),
        env: module.env.clone(),
        labels: module.labels.clone(),
        cpu_shares: i64::from(module.resources.cpus),
        memory: module.resources.memory_bytes,
        ..Default::default()
    }
}

/// Empty candidate lists accept every engine; otherwise an engine matches
/// by id, name, or datacenter.
fn module_accepts(module: &ModuleSpec, view: &EngineView) -> bool {
    module.candidates.is_empty()
        || module
            .candidates
            .iter()
            .any(|c| *c == view.id || *c == view.name || *c == view.datacenter_id)
}

/// Shrink totals to the datacenter's usable fraction.
fn apply_usage_limit(view: &EngineView, limit: f32) -> EngineView {
    let mut view = view.clone();
    if limit > 0.0 && limit < 1.0 {
        let limit = f64::from(limit);
        view.total_cpus = (view.total_cpus as f64 * limit).floor() as u64;
        view.total_memory = (view.total_memory as f64 * limit).floor() as u64;
    }
    view
}

fn validate_spec(spec: &ServiceSpec) -> RegionResult<()> {
    let invalid = |msg: String| Err(RegionError::Validation(msg));
    if spec.name.is_empty() || spec.name.contains(':') {
        return invalid(format!("invalid service name '{}'", spec.name));
    }
    if spec.modules.is_empty() {
        return invalid(format!("service {} has no modules", spec.name));
    }
    let mut names = HashSet::new();
    for module in &spec.modules {
        if module.name.is_empty() || !names.insert(module.name.as_str()) {
            return invalid(format!("duplicate or empty module name '{}'", module.name));
        }
        if module.count == 0 {
            return invalid(format!("module {} has count 0", module.name));
        }
        if module.image.as_deref().is_none_or(str::is_empty) {
            return invalid(format!("module {} has no image or software", module.name));
        }
        let mut ports = HashSet::new();
        if let Some(dup) = module.ports.iter().find(|p| !ports.insert(p.as_str())) {
            return invalid(format!("module {}: duplicate port '{dup}'", module.name));
        }
        if module.resources.volumes.iter().any(|v| v.name.is_empty() || v.path.is_empty()) {
            return invalid(format!("module {}: volume needs a name and a path", module.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use armada_state::HardwareSpec;
    use std::time::Duration;

    /// A primary region with one engine `e0` on node `node0` and a
    /// four-address container pool.
    async fn make_region(max_container: u32) -> Arc<Region> {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = Scheduler::from_config(&ManageConfig::default()).unwrap();
        let region = Region::new(
            store,
            scheduler,
            Arc::new(Watchdog::new(0)),
            RegionOptions::default(),
        )
        .unwrap();
        region.on_elected().await;
        region
            .add_datacenter(Datacenter {
                id: "dc0".to_string(),
                name: "dc0".to_string(),
                kind: "generic".to_string(),
                storage_type: "local".to_string(),
                storage_id: String::new(),
                datacenter: String::new(),
                enabled: true,
                max_node: 0,
                usage_limit: 1.0,
            })
            .await
            .unwrap();
        region
            .add_node(NodeRecord {
                id: "node0".to_string(),
                name: "e0".to_string(),
                cluster_id: "dc0".to_string(),
                admin_ip: "192.168.0.1".to_string(),
                max_container,
                status: NodeStatus::New,
                register_at: 0,
                deregister_at: 0,
            })
            .await
            .unwrap();
        region.register_node("node0").await.unwrap();
        region
            .add_engine(Arc::new(MockEngine::new(EngineView {
                id: "e0".to_string(),
                name: "host-e0".to_string(),
                total_cpus: 8,
                total_memory: 16 << 30,
                health: 100,
                ..Default::default()
            })))
            .await
            .unwrap();
        region
            .add_networking(
                "net-c",
                NetworkingType::Containers,
                "10.0.0.10",
                "10.0.0.13",
                24,
                "10.0.0.1",
            )
            .await
            .unwrap();
        region
    }

    fn start(region: &Arc<Region>) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(Arc::clone(region).run(rx));
        tx
    }

    async fn settle(region: &Region, name: &str) -> ServiceStatus {
        tokio::time::timeout(Duration::from_secs(5), region.wait_service(name))
            .await
            .unwrap()
            .unwrap()
    }

    fn make_module(name: &str, count: u32) -> ModuleSpec {
        ModuleSpec {
            name: name.to_string(),
            kind: armada_state::ModuleType::Generic,
            image: Some("app:1.0".to_string()),
            software: None,
            count,
            resources: HardwareSpec::default(),
            candidates: Vec::new(),
            ports: Vec::new(),
            env: Vec::new(),
            labels: HashMap::new(),
            configures: HashMap::new(),
            config_template: None,
        }
    }

    fn make_spec(modules: Vec<ModuleSpec>) -> ServiceSpec {
        ServiceSpec {
            name: "svc".to_string(),
            description: String::new(),
            modules,
            users: Vec::new(),
            backup: None,
            failure_retry: None,
        }
    }

    #[test]
    fn validation_rules() {
        assert!(validate_spec(&make_spec(vec![make_module("web", 2)])).is_ok());
        assert!(validate_spec(&make_spec(Vec::new())).is_err());
        assert!(validate_spec(&make_spec(vec![make_module("web", 0)])).is_err());
        assert!(
            validate_spec(&make_spec(vec![make_module("web", 1), make_module("web", 1)])).is_err()
        );

        let mut no_image = make_module("web", 1);
        no_image.image = None;
        assert!(validate_spec(&make_spec(vec![no_image])).is_err());

        let mut dup_ports = make_module("web", 1);
        dup_ports.ports = vec!["http".to_string(), "http".to_string()];
        assert!(validate_spec(&make_spec(vec![dup_ports])).is_err());
    }

    #[test]
    fn usage_limit_shrinks_totals() {
        let view = EngineView {
            total_cpus: 10,
            total_memory: 1000,
            ..Default::default()
        };
        let limited = apply_usage_limit(&view, 0.8);
        assert_eq!(limited.total_cpus, 8);
        assert_eq!(limited.total_memory, 800);
        assert_eq!(apply_usage_limit(&view, 0.0).total_cpus, 10);
    }

    #[test]
    fn candidates_match_id_name_or_datacenter() {
        let view = EngineView {
            id: "e1".to_string(),
            name: "host-1".to_string(),
            datacenter_id: "dc-a".to_string(),
            ..Default::default()
        };
        let mut module = make_module("web", 1);
        assert!(module_accepts(&module, &view));
        module.candidates = vec!["dc-a".to_string()];
        assert!(module_accepts(&module, &view));
        module.candidates = vec!["e2".to_string()];
        assert!(!module_accepts(&module, &view));
    }

    #[tokio::test]
    async fn pending_containers_count_toward_the_node_cap() {
        let region = make_region(1).await;
        assert_eq!(region.candidate_views().await.len(), 1);

        region.lock_pending().insert(
            "swarm-a".to_string(),
            PendingContainer {
                engine_id: "e0".to_string(),
                config: ContainerConfig {
                    name: "a_web_0".to_string(),
                    ..Default::default()
                },
            },
        );
        assert!(region.candidate_views().await.is_empty());
    }

    #[tokio::test]
    async fn modules_of_one_service_respect_the_node_cap() {
        let region = make_region(1).await;
        let _shutdown = start(&region);
        region
            .add_service(make_spec(vec![make_module("web", 1), make_module("db", 1)]))
            .await
            .unwrap();

        assert_eq!(settle(&region, "svc").await, ServiceStatus::Idle);
        assert_eq!(region.pending_count(), 0);
        let view = region.engine_view("e0").await.unwrap();
        assert_eq!(view.container_count(), 0);
    }

    #[tokio::test]
    async fn panic_after_preallocation_recycles_the_batch() {
        let region = make_region(0).await;
        let _shutdown = start(&region);
        region.panic_after_preallocate.store(true, Ordering::Release);

        let mut module = make_module("web", 1);
        module.resources.cpus = 2;
        module.resources.networkings = vec![NetworkingType::Containers];
        module.ports = vec!["http".to_string()];
        let admission = region
            .add_service(make_spec(vec![module]))
            .await
            .unwrap();

        assert_eq!(settle(&region, "svc").await, ServiceStatus::Idle);
        let service = region.get_service("svc").await.unwrap();
        assert!(service.last_error().unwrap().contains("panicked"));
        assert_eq!(region.pending_count(), 0);
        assert_eq!(region.free_ips(NetworkingType::Containers).await, 4);
        assert_eq!(region.free_cpus("e0").await, Some(8));
        let store = region.store();
        assert_eq!(store.count_allocated_ips().unwrap(), 0);
        assert!(store.list_ports().unwrap().iter().all(|p| !p.allocated));
        let task = store.get_task(&admission.task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        region.panic_after_preallocate.store(false, Ordering::Release);
        region.deploy_service("svc").await.unwrap();
        assert_eq!(settle(&region, "svc").await, ServiceStatus::Deployed);
        assert_eq!(region.free_cpus("e0").await, Some(6));
        assert_eq!(store.count_allocated_ips().unwrap(), 1);
    }
}
