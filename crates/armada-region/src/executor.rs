//! Unit executor — walks one unit from image pull to a started workload.
//!
//! Each step runs only if the unit has not reached its state yet. The
//! prepare block (pull, network, volumes) retries engine failures up to the
//! service's retry budget; start and health checks have their own budgets.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use armada_state::{ModuleSpec, NetworkingType, UnitState, UserSpec};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{RegionError, RegionResult};
use crate::ledger::PreAllocResource;
use crate::unit::Unit;

/// Attempts for starting a container.
const START_ATTEMPTS: u32 = 2;

/// Attempts for the post-start health check.
const HEALTH_CHECK_ATTEMPTS: u32 = 3;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Everything needed to drive one unit.
pub(crate) struct UnitJob {
    pub engine: Arc<dyn Engine>,
    pub unit: Arc<Unit>,
    pub resource: PreAllocResource,
    pub module: ModuleSpec,
    /// Keys the rendered configuration must define.
    pub required_keys: Vec<String>,
    pub users: Vec<UserSpec>,
    pub failure_retry: u32,
}

/// Run `op` up to `attempts` times.
async fn with_retry<T, F, Fut>(attempts: u32, what: &str, unit: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(%unit, step = what, attempt, error = %err, "unit step failed, retrying");
                attempt += 1;
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Drive the unit to `Started`. Returns the container id.
pub(crate) async fn drive_unit(job: UnitJob) -> RegionResult<String> {
    let UnitJob {
        engine,
        unit,
        resource,
        module,
        required_keys,
        users,
        failure_retry,
    } = job;
    let engine_id = resource.engine_id.clone();
    let engine_err = |err: anyhow::Error| RegionError::engine(&engine_id, err);
    let prepare_attempts = failure_retry.saturating_add(1);
    let name = unit.name.as_str();

    if unit.state() < UnitState::Preparing {
        let image = resource.config.image.as_str();
        with_retry(prepare_attempts, "pull", name, || engine.pull_image(image))
            .await
            .map_err(engine_err)?;
        unit.advance(UnitState::Preparing)?;
    }

    if unit.state() < UnitState::Networked {
        for binding in &resource.networkings {
            with_retry(prepare_attempts, "network", name, || engine.configure_network(binding))
                .await
                .map_err(engine_err)?;
        }
        unit.advance(UnitState::Networked)?;
    }

    if unit.state() < UnitState::Volumes {
        for volume in &module.resources.volumes {
            let volume_name = format!("{}_{}", unit.name, volume.name);
            with_retry(prepare_attempts, "volume", name, || {
                engine.create_volume(&volume_name, volume.size_bytes)
            })
            .await
            .map_err(engine_err)?;
        }
        unit.advance(UnitState::Volumes)?;
    }

    if unit.state() < UnitState::Created {
        let container_id = engine
            .create_container(&resource.config)
            .await
            .map_err(engine_err)?;
        unit.binding_mut().container_id = Some(container_id.clone());
        unit.advance(UnitState::Created)?;
        debug!(unit = %name, engine = %engine_id, container = %container_id, "container created");
    }

    let container_id = unit
        .binding()
        .container_id
        .ok_or_else(|| RegionError::Invariant(format!("unit {name} created without container id")))?;
    let operator = unit.operator();

    if unit.state() < UnitState::Configured {
        let (path, text) = render_config(&unit, &module, &resource, &required_keys)?;
        operator
            .copy_config(engine.as_ref(), &container_id, &path, &text)
            .await
            .map_err(engine_err)?;
        unit.advance(UnitState::Configured)?;
    }

    if unit.state() < UnitState::Started {
        with_retry(START_ATTEMPTS, "start", name, || engine.start_container(&container_id))
            .await
            .map_err(engine_err)?;
        operator
            .start_service(engine.as_ref(), &container_id)
            .await
            .map_err(engine_err)?;
        with_retry(HEALTH_CHECK_ATTEMPTS, "health", name, || {
            operator.health_check(engine.as_ref(), &container_id)
        })
        .await
        .map_err(engine_err)?;
        if !users.is_empty() {
            operator
                .create_users(engine.as_ref(), &container_id, &users)
                .await
                .map_err(engine_err)?;
        }
        unit.advance(UnitState::Started)?;
        info!(unit = %name, engine = %engine_id, container = %container_id, "unit started");
    }

    Ok(container_id)
}

/// Build the unit's configuration file. Returns `(path, content)`.
fn render_config(
    unit: &Unit,
    module: &ModuleSpec,
    resource: &PreAllocResource,
    required_keys: &[String],
) -> RegionResult<(String, String)> {
    let mut configurer = unit.configurer();
    if let Some(template) = &module.config_template {
        configurer.parse(template)?;
    }
    configurer.merge(&module.configures);
    if let Some(binding) = resource
        .networkings
        .iter()
        .find(|b| b.kind == NetworkingType::Containers)
    {
        configurer.set("bind", &armada_core::u32_to_ip(binding.ip).to_string());
    }
    if let Some(port) = resource.ports.first() {
        configurer.set("port", &port.port.to_string());
    }
    configurer.verify(required_keys)?;
    Ok((configurer.path().to_string(), configurer.marshal()))
}

/// Stop and remove the unit's container, if it has one. Failures are
/// logged; the container may already be gone.
pub(crate) async fn cleanup_unit(engine: &dyn Engine, unit: &Unit) {
    let Some(container_id) = unit.binding().container_id else {
        return;
    };
    if unit.state() == UnitState::Started {
        if let Err(err) = unit.operator().stop_service(engine, &container_id).await {
            warn!(unit = %unit.name, error = %err, "stop service failed");
        }
    }
    if let Err(err) = engine.stop_container(&container_id).await {
        debug!(unit = %unit.name, error = %err, "stop container failed");
    }
    match engine.remove_container(&container_id).await {
        Ok(()) => debug!(unit = %unit.name, container = %container_id, "container removed"),
        Err(err) => warn!(unit = %unit.name, container = %container_id, error = %err, "remove container failed"),
    }
    unit.binding_mut().container_id = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngine, MockOp};
    use armada_placement::{ContainerConfig, EngineView};
    use armada_state::{HardwareSpec, IpBinding, ModuleType, PortRecord, VolumeSpec};
    use std::collections::HashMap;

    fn make_engine() -> Arc<MockEngine> {
        Arc::new(MockEngine::new(EngineView {
            id: "e1".to_string(),
            total_cpus: 4,
            total_memory: 8 << 30,
            health: 100,
            ..Default::default()
        }))
    }

    fn make_module() -> ModuleSpec {
        ModuleSpec {
            name: "cache".to_string(),
            kind: ModuleType::Redis,
            image: Some("redis:7".to_string()),
            software: None,
            count: 1,
            resources: HardwareSpec {
                cpus: 1,
                memory_bytes: 1 << 30,
                volumes: vec![VolumeSpec {
                    name: "data".to_string(),
                    path: "/data".to_string(),
                    size_bytes: 1 << 30,
                }],
                networkings: vec![NetworkingType::Containers],
            },
            candidates: Vec::new(),
            ports: vec!["redis".to_string()],
            env: Vec::new(),
            labels: HashMap::new(),
            configures: HashMap::from([("maxmemory".to_string(), "512mb".to_string())]),
            config_template: Some("appendonly yes\n".to_string()),
        }
    }

    fn make_job(engine: Arc<MockEngine>, unit: Arc<Unit>, required: &[&str]) -> UnitJob {
        UnitJob {
            engine,
            unit: Arc::clone(&unit),
            resource: PreAllocResource {
                unit_id: unit.id.clone(),
                engine_id: "e1".to_string(),
                swarm_id: "swarm-1".to_string(),
                config: ContainerConfig {
                    name: unit.name.clone(),
                    image: "redis:7".to_string(),
                    ..Default::default()
                },
                networkings: vec![IpBinding {
                    networking_id: "net-a".to_string(),
                    prefix: 24,
                    ip: armada_core::parse_ip_u32("10.0.0.10").unwrap(),
                    kind: NetworkingType::Containers,
                    gateway: "10.0.0.1".to_string(),
                }],
                ports: vec![PortRecord {
                    port: 20000,
                    name: "redis".to_string(),
                    unit_id: unit.id.clone(),
                    allocated: false,
                }],
                cpus: vec![0],
            },
            module: make_module(),
            required_keys: required.iter().map(|k| k.to_string()).collect(),
            users: Vec::new(),
            failure_retry: 2,
        }
    }

    fn make_unit() -> Arc<Unit> {
        Arc::new(Unit::new("svc-1", "svc_cache_0".to_string(), "cache", ModuleType::Redis, 0))
    }

    #[tokio::test]
    async fn unit_reaches_started() {
        let engine = make_engine();
        let unit = make_unit();
        let id = drive_unit(make_job(engine.clone(), unit.clone(), &["port", "bind"]))
            .await
            .unwrap();

        assert_eq!(unit.state(), UnitState::Started);
        assert!(engine.is_running(&id));
        let conf = String::from_utf8(engine.file(&id, "/etc/redis/redis.conf").unwrap()).unwrap();
        assert!(conf.contains("port 20000"));
        assert!(conf.contains("bind 10.0.0.10"));
        assert!(conf.contains("maxmemory 512mb"));
        assert!(conf.contains("appendonly yes"));
    }

    #[tokio::test]
    async fn prepare_retries_within_budget() {
        let engine = make_engine();
        engine.fail_next(MockOp::Pull, 2);
        let unit = make_unit();
        drive_unit(make_job(engine, unit.clone(), &[])).await.unwrap();
        assert_eq!(unit.state(), UnitState::Started);
    }

    #[tokio::test]
    async fn prepare_gives_up_after_budget() {
        let engine = make_engine();
        engine.fail_next(MockOp::Pull, 3);
        let unit = make_unit();
        let err = drive_unit(make_job(engine, unit.clone(), &[])).await.unwrap_err();
        assert!(matches!(err, RegionError::Engine { .. }));
        assert_eq!(unit.state(), UnitState::Init);
    }

    #[tokio::test]
    async fn missing_required_key_stops_before_start() {
        let engine = make_engine();
        let unit = make_unit();
        let err = drive_unit(make_job(engine.clone(), unit.clone(), &["requirepass"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegionError::Validation(_)));
        assert_eq!(unit.state(), UnitState::Created);

        cleanup_unit(engine.as_ref(), &unit).await;
        assert!(engine.container_ids().is_empty());
        assert!(unit.binding().container_id.is_none());
    }
}
