//! armada-cluster — the manager's view of its fleet and its peers.
//!
//! # Architecture
//!
//! ```text
//! Discovery (file:// | nodes:// | external KV)
//!   └── watch_backend → engine endpoints
//!
//! MembershipManager
//!   ├── join / heartbeat / leave
//!   ├── TTL expiry → disconnected
//!   └── reports to Watchdog
//!
//! Watchdog
//!   ├── connected engine set
//!   ├── quorum crossings
//!   └── fans out ClusterEvent to registered handlers
//!
//! Coordinator
//!   ├── Candidate epoch → on_elected / on_demoted
//!   ├── Follower epoch → current primary address
//!   └── Role published on a watch channel
//! ```

pub mod discovery;
pub mod election;
pub mod error;
pub mod membership;
pub mod watchdog;

pub use discovery::{Backend, DiscoveryEntry, DiscoveryUri, Scheme, new_backend, watch_backend};
pub use election::{
    Candidate, CandidateEpoch, Coordinator, Follower, FollowerEpoch, LeadershipHooks,
    LocalElection, Role,
};
pub use error::{ClusterError, ClusterResult};
pub use membership::{HeartbeatAck, Member, MemberStatus, MembershipManager};
pub use watchdog::{ClusterEvent, EventHandler, HandlerId, Watchdog};
