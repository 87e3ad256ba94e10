//! Service object held by the region.
//!
//! The status word is atomic: admission moves it Idle → InFlight with a
//! compare-and-swap, so at most one scheduling run per service exists at a
//! time. Waiters are woken whenever a run settles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use armada_state::{ServiceRecord, ServiceSpec, ServiceStatus, epoch_secs};
use tokio::sync::Notify;

use crate::unit::Unit;

pub struct Service {
    pub id: String,
    pub name: String,
    spec: ServiceSpec,
    failure_retry: u32,
    created_at: u64,
    status: AtomicU64,
    last_error: Mutex<Option<String>>,
    units: RwLock<Vec<Arc<Unit>>>,
    settled: Notify,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Service {
    pub fn new(id: String, spec: ServiceSpec, failure_retry: u32, units: Vec<Arc<Unit>>) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            spec,
            failure_retry,
            created_at: epoch_secs(),
            status: AtomicU64::new(ServiceStatus::Idle.as_u64()),
            last_error: Mutex::new(None),
            units: RwLock::new(units),
            settled: Notify::new(),
        }
    }

    /// Rebuild from persisted rows. A run interrupted by a restart is
    /// reported as failed.
    pub fn from_record(record: &ServiceRecord, units: Vec<Arc<Unit>>) -> Self {
        let (status, last_error) = match record.status {
            ServiceStatus::InFlight => (
                ServiceStatus::Failed,
                Some("interrupted by manager restart".to_string()),
            ),
            other => (other, record.last_error.clone()),
        };
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            spec: record.spec.clone(),
            failure_retry: record.failure_retry,
            created_at: record.created_at,
            status: AtomicU64::new(status.as_u64()),
            last_error: Mutex::new(last_error),
            units: RwLock::new(units),
            settled: Notify::new(),
        }
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn failure_retry(&self) -> u32 {
        self.failure_retry
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u64(self.status.load(Ordering::Acquire)).unwrap_or(ServiceStatus::Failed)
    }

    /// Claim the service for a scheduling run (CAS Idle → InFlight).
    pub fn try_begin(&self) -> bool {
        self.status
            .compare_exchange(
                ServiceStatus::Idle.as_u64(),
                ServiceStatus::InFlight.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Make a failed service schedulable again (CAS Failed → Idle).
    pub fn reopen(&self) -> bool {
        self.status
            .compare_exchange(
                ServiceStatus::Failed.as_u64(),
                ServiceStatus::Idle.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claim a settled service of any status for teardown.
    pub fn try_claim(&self) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current == ServiceStatus::InFlight.as_u64() {
                return false;
            }
            match self.status.compare_exchange(
                current,
                ServiceStatus::InFlight.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// End the current run with `status` and wake waiters.
    pub fn settle(&self, status: ServiceStatus, error: Option<String>) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = error;
        }
        self.status.store(status.as_u64(), Ordering::Release);
        self.settled.notify_waiters();
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.units.read().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn unit(&self, id: &str) -> Option<Arc<Unit>> {
        self.units().into_iter().find(|u| u.id == id)
    }

    pub fn units_of_module(&self, module: &str) -> Vec<Arc<Unit>> {
        self.units()
            .into_iter()
            .filter(|u| u.module_name == module)
            .collect()
    }

    /// Wait until the service is no longer in flight.
    pub async fn wait_settled(&self) -> ServiceStatus {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let status = self.status();
            if status != ServiceStatus::InFlight {
                return status;
            }
            notified.await;
        }
    }

    pub fn to_record(&self) -> ServiceRecord {
        ServiceRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            spec: self.spec.clone(),
            status: self.status(),
            failure_retry: self.failure_retry,
            last_error: self.last_error(),
            created_at: self.created_at,
            updated_at: epoch_secs(),
        }
    }
}
