//! Watchdog — engine connectivity and cluster quorum.
//!
//! Counts connected engines and notifies registered handlers of every
//! connect/disconnect, plus a quorum event whenever the count crosses the
//! configured minimum.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    EngineConnected(String),
    EngineDisconnected(String),
    QuorumLost { connected: usize, quorum: usize },
    QuorumRestored { connected: usize, quorum: usize },
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ClusterEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Connectivity {
    connected: HashSet<String>,
    has_quorum: bool,
}

pub struct Watchdog {
    quorum: usize,
    state: Mutex<Connectivity>,
    handlers: RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>,
    next_id: AtomicU64,
}

impl Watchdog {
    /// A quorum of 0 is always met.
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            state: Mutex::new(Connectivity {
                connected: HashSet::new(),
                has_quorum: quorum == 0,
            }),
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push((id, handler));
        }
        id
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        match self.handlers.write() {
            Ok(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(h, _)| *h != id);
                handlers.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn has_quorum(&self) -> bool {
        self.state.lock().map(|s| s.has_quorum).unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.state.lock().map(|s| s.connected.len()).unwrap_or(0)
    }

    pub fn engine_connected(&self, engine_id: &str) {
        self.update(engine_id, true);
    }

    pub fn engine_disconnected(&self, engine_id: &str) {
        self.update(engine_id, false);
    }

    fn update(&self, engine_id: &str, connected: bool) {
        let mut events = Vec::with_capacity(2);
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let changed = if connected {
                state.connected.insert(engine_id.to_string())
            } else {
                state.connected.remove(engine_id)
            };
            if !changed {
                return;
            }
            events.push(if connected {
                ClusterEvent::EngineConnected(engine_id.to_string())
            } else {
                ClusterEvent::EngineDisconnected(engine_id.to_string())
            });

            let count = state.connected.len();
            let now_met = count >= self.quorum;
            if now_met != state.has_quorum {
                state.has_quorum = now_met;
                if now_met {
                    info!(connected = count, quorum = self.quorum, "cluster quorum restored");
                    events.push(ClusterEvent::QuorumRestored {
                        connected: count,
                        quorum: self.quorum,
                    });
                } else {
                    warn!(connected = count, quorum = self.quorum, "cluster quorum lost");
                    events.push(ClusterEvent::QuorumLost {
                        connected: count,
                        quorum: self.quorum,
                    });
                }
            }
        }
        self.dispatch(&events);
    }

    fn dispatch(&self, events: &[ClusterEvent]) {
        // Snapshot so handlers may (un)register from inside `handle`.
        let handlers: Vec<Arc<dyn EventHandler>> = match self.handlers.read() {
            Ok(h) => h.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(_) => return,
        };
        for event in events {
            for handler in &handlers {
                handler.handle(event);
            }
        }
    }
}
