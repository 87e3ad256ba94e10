//! Leader/replica coordination.
//!
//! The election primitive itself is external; this module consumes it
//! through two contracts. A [`Candidate`] delivers leadership transitions
//! on one channel and epoch-ending errors on another; a [`Follower`]
//! delivers the address of the current primary the same way. The
//! [`Coordinator`] runs both epochs forever, retrying after a fixed delay,
//! calls the [`LeadershipHooks`] on every transition, and publishes the
//! resulting [`Role`] on a `watch` channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info, warn};

use crate::error::{ClusterError, ClusterResult};

/// Delay before a failed election epoch is retried.
pub const ELECTION_RETRY_DELAY: Duration = Duration::from_secs(10);

/// This process's current role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Primary,
    /// Writes are forwarded to `primary` once it is known.
    Replica { primary: Option<String> },
}

impl Role {
    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }
}

/// Channels of one candidate epoch.
pub struct CandidateEpoch {
    /// `true` on gaining leadership, `false` on losing it.
    pub leadership: mpsc::Receiver<bool>,
    pub errors: mpsc::Receiver<ClusterError>,
}

/// Channels of one follower epoch.
pub struct FollowerEpoch {
    /// Advertised address of each new primary.
    pub leaders: mpsc::Receiver<String>,
    pub errors: mpsc::Receiver<ClusterError>,
}

#[async_trait]
pub trait Candidate: Send + Sync {
    async fn run_for_election(&self) -> ClusterResult<CandidateEpoch>;
}

#[async_trait]
pub trait Follower: Send + Sync {
    async fn follow(&self) -> ClusterResult<FollowerEpoch>;
}

/// Work done on leadership transitions.
#[async_trait]
pub trait LeadershipHooks: Send + Sync {
    async fn on_elected(&self);
    async fn on_demoted(&self);
}

pub struct Coordinator {
    candidate: Arc<dyn Candidate>,
    follower: Arc<dyn Follower>,
    hooks: Arc<dyn LeadershipHooks>,
    advertise: String,
    retry_delay: Duration,
    role_tx: watch::Sender<Role>,
    /// Whether `on_elected` ran without a matching `on_demoted`.
    elected: AtomicBool,
}

impl Coordinator {
    pub fn new(
        candidate: Arc<dyn Candidate>,
        follower: Arc<dyn Follower>,
        hooks: Arc<dyn LeadershipHooks>,
        advertise: impl Into<String>,
    ) -> Self {
        let (role_tx, _) = watch::channel(Role::Replica { primary: None });
        Self {
            candidate,
            follower,
            hooks,
            advertise: advertise.into(),
            retry_delay: ELECTION_RETRY_DELAY,
            role_tx,
            elected: AtomicBool::new(false),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    /// Run candidate and follower epochs until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let candidate = tokio::spawn(Arc::clone(&self).candidate_loop(shutdown.clone()));
        let follower = tokio::spawn(Arc::clone(&self).follower_loop(shutdown));
        let _ = tokio::join!(candidate, follower);
        self.demote(None).await;
        info!("coordinator stopped");
    }

    async fn candidate_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.candidate.run_for_election().await {
                Ok(epoch) => {
                    if self.drive_candidate(epoch, &mut shutdown).await {
                        return;
                    }
                }
                Err(e) => error!(error = %e, "failed to run for election"),
            }
            self.demote(None).await;
            if wait_or_shutdown(self.retry_delay, &mut shutdown).await {
                return;
            }
        }
    }

    /// Returns `true` when shutdown was requested.
    async fn drive_candidate(&self, mut epoch: CandidateEpoch, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            tokio::select! {
                event = epoch.leadership.recv() => match event {
                    Some(true) => self.elect().await,
                    Some(false) => self.demote(None).await,
                    None => {
                        warn!("election channel closed");
                        return false;
                    }
                },
                Some(e) = epoch.errors.recv() => {
                    error!(error = %e, "election epoch ended");
                    return false;
                }
                _ = shutdown.changed() => return true,
            }
        }
    }

    async fn follower_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.follower.follow().await {
                Ok(mut epoch) => loop {
                    tokio::select! {
                        leader = epoch.leaders.recv() => match leader {
                            Some(addr) => self.observe_primary(addr),
                            None => break,
                        },
                        Some(e) = epoch.errors.recv() => {
                            error!(error = %e, "follower epoch ended");
                            break;
                        }
                        _ = shutdown.changed() => return,
                    }
                },
                Err(e) => error!(error = %e, "failed to follow leader"),
            }
            if wait_or_shutdown(self.retry_delay, &mut shutdown).await {
                return;
            }
        }
    }

    async fn elect(&self) {
        if !self.elected.swap(true, Ordering::SeqCst) {
            info!(advertise = %self.advertise, "elected primary");
            self.role_tx.send_replace(Role::Primary);
            self.hooks.on_elected().await;
        }
    }

    async fn demote(&self, primary: Option<String>) {
        if self.elected.swap(false, Ordering::SeqCst) {
            info!("lost leadership");
            self.role_tx.send_replace(Role::Replica { primary });
            self.hooks.on_demoted().await;
        }
    }

    fn observe_primary(&self, addr: String) {
        if addr == self.advertise || self.elected.load(Ordering::SeqCst) {
            return;
        }
        info!(primary = %addr, "following primary");
        self.role_tx.send_replace(Role::Replica { primary: Some(addr) });
    }
}

async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

// ── Local election ────────────────────────────────────────────────

/// In-process election driven by explicit calls.
///
/// Serves single-manager deployments (elect once at startup) and tests.
/// Each `run_for_election` / `follow` call opens a fresh epoch; the handle
/// methods feed the most recent one.
#[derive(Default)]
pub struct LocalElection {
    candidate: Mutex<Option<(mpsc::Sender<bool>, mpsc::Sender<ClusterError>)>>,
    follower: Mutex<Option<(mpsc::Sender<String>, mpsc::Sender<ClusterError>)>>,
    epochs: std::sync::atomic::AtomicUsize,
    elect_on_start: bool,
}

impl LocalElection {
    /// An election this process wins as soon as it runs.
    pub fn always_primary() -> Self {
        Self {
            elect_on_start: true,
            ..Default::default()
        }
    }

    /// Number of candidate epochs opened so far.
    pub fn epochs(&self) -> usize {
        self.epochs.load(Ordering::SeqCst)
    }

    pub async fn set_leader(&self, elected: bool) -> bool {
        match self.candidate.lock().await.as_ref() {
            Some((tx, _)) => tx.send(elected).await.is_ok(),
            None => false,
        }
    }

    pub async fn announce_primary(&self, addr: &str) -> bool {
        match self.follower.lock().await.as_ref() {
            Some((tx, _)) => tx.send(addr.to_string()).await.is_ok(),
            None => false,
        }
    }

    /// End the current candidate epoch with an error.
    pub async fn fail_candidate(&self, reason: &str) -> bool {
        match self.candidate.lock().await.as_ref() {
            Some((_, err)) => err.send(ClusterError::Election(reason.to_string())).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Candidate for LocalElection {
    async fn run_for_election(&self) -> ClusterResult<CandidateEpoch> {
        let (tx, leadership) = mpsc::channel(8);
        let (err_tx, errors) = mpsc::channel(1);
        if self.elect_on_start {
            tx.send(true)
                .await
                .map_err(|e| ClusterError::Election(e.to_string()))?;
        }
        *self.candidate.lock().await = Some((tx, err_tx));
        self.epochs.fetch_add(1, Ordering::SeqCst);
        Ok(CandidateEpoch { leadership, errors })
    }
}

#[async_trait]
impl Follower for LocalElection {
    async fn follow(&self) -> ClusterResult<FollowerEpoch> {
        let (tx, leaders) = mpsc::channel(8);
        let (err_tx, errors) = mpsc::channel(1);
        *self.follower.lock().await = Some((tx, err_tx));
        Ok(FollowerEpoch { leaders, errors })
    }
}
