//! Membership manager — tracks engine liveness.
//!
//! Engines heartbeat periodically; an engine silent for longer than the TTL
//! is marked disconnected and reported to the watchdog. Engines whose
//! persisted node was deregistered are refused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use armada_state::{NodeStatus, StateStore, epoch_secs};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::watchdog::Watchdog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub engine_id: String,
    pub addr: String,
    pub status: MemberStatus,
    pub last_heartbeat: u64,
}

/// Result of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAck {
    Unknown,
    Alive,
    /// The engine had been marked disconnected.
    Reconnected,
}

pub struct MembershipManager {
    state: StateStore,
    watchdog: Arc<Watchdog>,
    /// Silence after which an engine counts as disconnected.
    ttl: Duration,
    members: Mutex<HashMap<String, Member>>,
}

impl MembershipManager {
    pub fn new(state: StateStore, watchdog: Arc<Watchdog>) -> Self {
        Self {
            state,
            watchdog,
            ttl: Duration::from_secs(180),
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Admit an engine. Deregistered nodes never rejoin.
    pub fn join(&self, engine_id: &str, addr: &str) -> ClusterResult<()> {
        if let Some(node) = self.state.get_node_by_name(engine_id)? {
            if node.status == NodeStatus::Deregistered {
                return Err(ClusterError::Deregistered(engine_id.to_string()));
            }
        }

        let newly_connected = {
            let mut members = self.lock_members();
            let previous = members.insert(
                engine_id.to_string(),
                Member {
                    engine_id: engine_id.to_string(),
                    addr: addr.to_string(),
                    status: MemberStatus::Connected,
                    last_heartbeat: epoch_secs(),
                },
            );
            previous.is_none_or(|m| m.status == MemberStatus::Disconnected)
        };

        if newly_connected {
            info!(engine = %engine_id, %addr, "engine joined");
            self.watchdog.engine_connected(engine_id);
        }
        Ok(())
    }

    pub fn heartbeat(&self, engine_id: &str) -> HeartbeatAck {
        let ack = {
            let mut members = self.lock_members();
            match members.get_mut(engine_id) {
                Some(member) => {
                    member.last_heartbeat = epoch_secs();
                    if member.status == MemberStatus::Disconnected {
                        member.status = MemberStatus::Connected;
                        HeartbeatAck::Reconnected
                    } else {
                        HeartbeatAck::Alive
                    }
                }
                None => HeartbeatAck::Unknown,
            }
        };

        match ack {
            HeartbeatAck::Unknown => warn!(engine = %engine_id, "heartbeat from unknown engine"),
            HeartbeatAck::Reconnected => {
                info!(engine = %engine_id, "engine reconnected");
                self.watchdog.engine_connected(engine_id);
            }
            HeartbeatAck::Alive => debug!(engine = %engine_id, "heartbeat received"),
        }
        ack
    }

    pub fn leave(&self, engine_id: &str) -> bool {
        let removed = self.lock_members().remove(engine_id);
        match removed {
            Some(member) => {
                if member.status == MemberStatus::Connected {
                    self.watchdog.engine_disconnected(engine_id);
                }
                info!(engine = %engine_id, "engine left");
                true
            }
            None => false,
        }
    }

    pub fn get_member(&self, engine_id: &str) -> Option<Member> {
        self.lock_members().get(engine_id).cloned()
    }

    pub fn list_members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.lock_members().values().cloned().collect();
        members.sort_by(|a, b| a.engine_id.cmp(&b.engine_id));
        members
    }

    pub fn connected_count(&self) -> usize {
        self.lock_members()
            .values()
            .filter(|m| m.status == MemberStatus::Connected)
            .count()
    }

    /// Mark engines silent past the TTL as disconnected, as of `now`.
    /// Returns the engines that changed.
    pub fn expire_at(&self, now: u64) -> Vec<String> {
        let ttl = self.ttl.as_secs();
        let expired: Vec<String> = {
            let mut members = self.lock_members();
            members
                .values_mut()
                .filter(|m| {
                    m.status == MemberStatus::Connected
                        && now.saturating_sub(m.last_heartbeat) > ttl
                })
                .map(|m| {
                    m.status = MemberStatus::Disconnected;
                    m.engine_id.clone()
                })
                .collect()
        };
        for engine_id in &expired {
            warn!(engine = %engine_id, "engine missed heartbeats, disconnected");
            self.watchdog.engine_disconnected(engine_id);
        }
        expired
    }

    /// Run TTL expiry every `interval` until shutdown.
    pub async fn run_monitor(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?interval, ttl = ?self.ttl, "membership monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.expire_at(epoch_secs());
                }
                _ = shutdown.changed() => {
                    info!("membership monitor stopped");
                    return;
                }
            }
        }
    }

    fn lock_members(&self) -> std::sync::MutexGuard<'_, HashMap<String, Member>> {
        // A poisoned map is still structurally valid.
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }
}
