//! One container instance of a service module.
//!
//! The lifecycle state is an atomic byte that only moves forward:
//! Init → Preparing → Networked → Volumes → Created → Configured → Started,
//! with a jump to Failed from any state when the unit's batch is recycled.
//! A step whose state was already reached is skipped, which makes executor
//! retries idempotent.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use armada_state::{IpBinding, ModuleType, PortBinding, UnitRecord, UnitState};
use uuid::Uuid;

use crate::configurer::{Configurer, new_configurer};
use crate::error::{RegionError, RegionResult};
use crate::operator::{Operator, new_operator};

/// Where a unit landed and what it holds there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitBinding {
    pub engine_id: Option<String>,
    pub container_id: Option<String>,
    pub swarm_id: Option<String>,
    pub networkings: Vec<IpBinding>,
    pub ports: Vec<PortBinding>,
    pub cpuset: String,
}

pub struct Unit {
    pub id: String,
    pub name: String,
    pub service_id: String,
    pub module_name: String,
    pub kind: ModuleType,
    pub created_at: u64,
    state: AtomicU8,
    binding: RwLock<UnitBinding>,
    configurer: Mutex<Box<dyn Configurer>>,
    operator: Arc<dyn Operator>,
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Unit {
    pub fn new(service_id: &str, name: String, module_name: &str, kind: ModuleType, created_at: u64) -> Self {
        Self::with_state(
            Uuid::new_v4().to_string(),
            name,
            service_id,
            module_name,
            kind,
            created_at,
            UnitState::Init,
            UnitBinding::default(),
        )
    }

    /// Rebuild a unit from its persisted row.
    pub fn from_record(record: &UnitRecord) -> Self {
        Self::with_state(
            record.id.clone(),
            record.name.clone(),
            &record.service_id,
            &record.module_name,
            record.kind,
            record.created_at,
            record.state,
            UnitBinding {
                engine_id: record.engine_id.clone(),
                container_id: record.container_id.clone(),
                swarm_id: record.swarm_id.clone(),
                networkings: record.networkings.clone(),
                ports: record.ports.clone(),
                cpuset: record.cpuset.clone(),
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with_state(
        id: String,
        name: String,
        service_id: &str,
        module_name: &str,
        kind: ModuleType,
        created_at: u64,
        state: UnitState,
        binding: UnitBinding,
    ) -> Self {
        Self {
            id,
            name,
            service_id: service_id.to_string(),
            module_name: module_name.to_string(),
            kind,
            created_at,
            state: AtomicU8::new(state as u8),
            binding: RwLock::new(binding),
            configurer: Mutex::new(new_configurer(kind)),
            operator: Arc::new(new_operator(kind)),
        }
    }

    pub fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(UnitState::Failed)
    }

    /// Move forward to `next`.
    ///
    /// Returns `Ok(false)` when `next` was already reached. A failed unit
    /// cannot advance.
    pub fn advance(&self, next: UnitState) -> RegionResult<bool> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == UnitState::Failed as u8 {
                return Err(RegionError::Invariant(format!(
                    "unit {} is failed, cannot move to {next:?}",
                    self.name
                )));
            }
            if current >= next as u8 {
                return Ok(false);
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark failed from any state, returning the state it left.
    pub(crate) fn abort(&self) -> UnitState {
        UnitState::from_u8(self.state.swap(UnitState::Failed as u8, Ordering::AcqRel))
            .unwrap_or(UnitState::Failed)
    }

    /// Back to Init after a recycled attempt.
    pub(crate) fn reset(&self) {
        self.state.store(UnitState::Init as u8, Ordering::Release);
        *self.binding_mut() = UnitBinding::default();
    }

    pub fn binding(&self) -> UnitBinding {
        self.binding
            .read()
            .map(|b| b.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub(crate) fn binding_mut(&self) -> std::sync::RwLockWriteGuard<'_, UnitBinding> {
        self.binding.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn configurer(&self) -> MutexGuard<'_, Box<dyn Configurer>> {
        self.configurer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn operator(&self) -> Arc<dyn Operator> {
        Arc::clone(&self.operator)
    }

    pub fn to_record(&self) -> UnitRecord {
        let binding = self.binding();
        UnitRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            service_id: self.service_id.clone(),
            module_name: self.module_name.clone(),
            kind: self.kind,
            engine_id: binding.engine_id,
            container_id: binding.container_id,
            swarm_id: binding.swarm_id,
            networkings: binding.networkings,
            ports: binding.ports,
            cpuset: binding.cpuset,
            state: self.state(),
            created_at: self.created_at,
        }
    }
}
