//! Container engine interface and an in-memory implementation.
//!
//! The region only needs a handful of engine operations: a fresh view for
//! scheduling, and the calls that walk a unit from image pull to a running
//! container. [`MockEngine`] keeps everything in memory and can be scripted
//! to fail, for tests and for dry runs of the daemon.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use armada_placement::{ContainerConfig, ContainerSummary, EngineView};
use armada_state::IpBinding;
use tracing::debug;

/// Output of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn id(&self) -> &str;

    /// Current snapshot of the engine.
    async fn view(&self) -> Result<EngineView>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Set up host-side networking for one address. Idempotent.
    async fn configure_network(&self, binding: &IpBinding) -> Result<()>;

    async fn create_volume(&self, name: &str, size_bytes: u64) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput>;

    async fn copy_to_container(&self, id: &str, path: &str, content: &[u8]) -> Result<()>;
}

/// Operations of [`MockEngine`] that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    View,
    Pull,
    Network,
    Volume,
    Create,
    Start,
    Stop,
    Remove,
    Exec,
    Copy,
}

#[derive(Debug, Clone)]
struct MockContainer {
    config: ContainerConfig,
    running: bool,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    images: HashSet<String>,
    volumes: HashSet<String>,
    networks: HashSet<u32>,
    files: HashMap<(String, String), Vec<u8>>,
    execs: Vec<(String, Vec<String>)>,
    /// Remaining scripted failures per operation; `u32::MAX` never runs out.
    failures: HashMap<MockOp, u32>,
    /// Container names whose creation always fails.
    failing_names: HashSet<String>,
}

/// In-memory engine.
pub struct MockEngine {
    base: EngineView,
    counter: AtomicU64,
    state: Mutex<MockState>,
}

impl MockEngine {
    /// An engine reporting `base` plus whatever containers it creates.
    pub fn new(base: EngineView) -> Self {
        Self {
            base,
            counter: AtomicU64::new(0),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: MockOp, times: u32) {
        self.lock().failures.insert(op, times);
    }

    /// Fail every call of `op`.
    pub fn fail_always(&self, op: MockOp) {
        self.lock().failures.insert(op, u32::MAX);
    }

    /// Fail creation of the container with this name.
    pub fn fail_create_named(&self, name: &str) {
        self.lock().failing_names.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.failing_names.clear();
    }

    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn container_config(&self, id: &str) -> Option<ContainerConfig> {
        self.lock().containers.get(id).map(|c| c.config.clone())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock().containers.get(id).is_some_and(|c| c.running)
    }

    pub fn file(&self, id: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(&(id.to_string(), path.to_string()))
            .cloned()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.lock().execs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, state: &mut MockState, op: MockOp) -> Result<()> {
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                bail!("scripted {op:?} failure");
            }
        }
        Ok(())
    }

    fn container_mut<'s>(state: &'s mut MockState, id: &str) -> Result<&'s mut MockContainer> {
        match state.containers.get_mut(id) {
            Some(container) => Ok(container),
            None => bail!("no such container: {id}"),
        }
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn id(&self) -> &str {
        &self.base.id
    }

    async fn view(&self) -> Result<EngineView> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::View)?;

        let mut view = self.base.clone();
        view.images.extend(state.images.iter().cloned());
        let mut ids: Vec<&String> = state.containers.keys().collect();
        ids.sort();
        for id in ids {
            let config = &state.containers[id].config;
            let cpus = config.requested_cpus();
            view.used_cpus = view.used_cpus.saturating_add(cpus).min(view.total_cpus);
            view.used_memory = view
                .used_memory
                .saturating_add(config.memory)
                .min(view.total_memory);
            view.containers.push(ContainerSummary {
                id: id.clone(),
                name: config.name.clone(),
                image: config.image.clone(),
                labels: config.labels.clone(),
                host_ports: config.host_ports.clone(),
                cpus,
                memory: config.memory,
            });
        }
        Ok(view)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::Pull)?;
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn configure_network(&self, binding: &IpBinding) -> Result<()> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::Network)?;
        state.networks.insert(binding.ip);
        Ok(())
    }

    async fn create_volume(&self, name: &str, _size_bytes: u64) -> Result<()> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::Volume)?;
        state.volumes.insert(name.to_string());
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::Create)?;
        if state.failing_names.contains(&config.name) {
            bail!("cannot create {}", config.name);
        }
        if state.containers.values().any(|c| c.config.name == config.name) {
            bail!("container name {} already in use", config.name);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{n:012x}", self.base.id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                config: config.clone(),
                running: false,
            },
        );
        debug!(engine = %self.base.id, container = %id, name = %config.name, "mock container created");
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::Start)?;
        Self::container_mut(&mut state, id)?.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::Stop)?;
        Self::container_mut(&mut state, id)?.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::Remove)?;
        if state.containers.remove(id).is_none() {
            bail!("no such container: {id}");
        }
        state.files.retain(|(container, _), _| container != id);
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::Exec)?;
        if !state.containers.contains_key(id) {
            bail!("no such container: {id}");
        }
        state.execs.push((id.to_string(), cmd.to_vec()));
        Ok(ExecOutput::default())
    }

    async fn copy_to_container(&self, id: &str, path: &str, content: &[u8]) -> Result<()> {
        let mut state = self.lock();
        self.check(&mut state, MockOp::Copy)?;
        if !state.containers.contains_key(id) {
            bail!("no such container: {id}");
        }
        state
            .files
            .insert((id.to_string(), path.to_string()), content.to_vec());
        Ok(())
    }
}
