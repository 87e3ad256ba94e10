//! Draft container configuration handed to the scheduler and engines.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::PlacementResult;
use crate::expr::Expr;

/// Label carrying the container-network binding `<id>:<ip>/<prefix>:<gateway>`.
pub const NETWORKING_LABEL_KEY: &str = "armada.networking";

/// Label carrying the external-access binding, same format.
pub const PROXY_NETWORKING_LABEL_KEY: &str = "armada.proxynetworking";

/// Label recording the swarm id of a pending container.
pub const SWARM_ID_LABEL_KEY: &str = "armada.swarm.id";

const CONSTRAINT_PREFIX: &str = "constraint:";
const AFFINITY_PREFIX: &str = "affinity:";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Shares in (0,100] are read as a core count.
    #[serde(default)]
    pub cpu_shares: i64,
    /// Comma-separated core list.
    #[serde(default)]
    pub cpuset_cpus: String,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub network_mode: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub domainname: String,
    /// `volume:path` bind specs.
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub host_ports: Vec<u32>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub volumes_from: Vec<String>,
}

impl ContainerConfig {
    /// Cores requested by this container.
    pub fn requested_cpus(&self) -> u64 {
        if self.cpu_shares > 0 && self.cpu_shares <= 100 {
            return self.cpu_shares as u64;
        }
        self.cpuset_cpus
            .split(',')
            .filter(|token| !token.trim().is_empty())
            .count() as u64
    }

    pub fn constraints(&self) -> PlacementResult<Vec<Expr>> {
        self.exprs_with_prefix(CONSTRAINT_PREFIX)
    }

    pub fn affinities(&self) -> PlacementResult<Vec<Expr>> {
        self.exprs_with_prefix(AFFINITY_PREFIX)
    }

    fn exprs_with_prefix(&self, prefix: &str) -> PlacementResult<Vec<Expr>> {
        self.env
            .iter()
            .filter_map(|e| e.strip_prefix(prefix))
            .map(Expr::parse)
            .collect()
    }

    /// Append a `constraint:` env entry, e.g. `node==engine-1`.
    pub fn add_constraint(&mut self, expr: &str) {
        self.env.push(format!("{CONSTRAINT_PREFIX}{expr}"));
    }

    pub fn add_affinity(&mut self, expr: &str) {
        self.env.push(format!("{AFFINITY_PREFIX}{expr}"));
    }

    /// True when any constraint or affinity is soft (`==~` / `!=~`).
    pub fn has_soft_exprs(&self) -> bool {
        let soft = |prefix: &str| {
            self.env
                .iter()
                .filter_map(|e| e.strip_prefix(prefix))
                .any(|e| e.contains("==~") || e.contains("!=~"))
        };
        soft(CONSTRAINT_PREFIX) || soft(AFFINITY_PREFIX)
    }

    /// Containers this one must be co-located with.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .links
            .iter()
            .map(|l| l.split(':').next().unwrap_or(l).to_string())
            .collect();
        deps.extend(self.volumes_from.iter().map(|v| {
            v.split(':').next().unwrap_or(v).to_string()
        }));
        if let Some(net) = self.network_mode.strip_prefix("container:") {
            deps.push(net.to_string());
        }
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_cpus_from_shares_or_cpuset() {
        let mut config = ContainerConfig {
            cpu_shares: 3,
            ..Default::default()
        };
        assert_eq!(config.requested_cpus(), 3);

        config.cpu_shares = 1024;
        config.cpuset_cpus = "0,1,5".to_string();
        assert_eq!(config.requested_cpus(), 3);

        config.cpuset_cpus = String::new();
        assert_eq!(config.requested_cpus(), 0);
    }

    #[test]
    fn constraint_env_round_trip() {
        let mut config = ContainerConfig::default();
        config.add_constraint("node==engine-1");
        config.add_affinity("image==~redis");
        config.env.push("PATH=/bin".to_string());

        let constraints = config.constraints().unwrap();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].key, "node");
        assert!(config.has_soft_exprs());
        assert_eq!(config.affinities().unwrap().len(), 1);
    }

    #[test]
    fn dependencies_collect_links_and_net() {
        let config = ContainerConfig {
            links: vec!["db:database".to_string()],
            volumes_from: vec!["data:ro".to_string()],
            network_mode: "container:proxy".to_string(),
            ..Default::default()
        };
        assert_eq!(config.dependencies(), vec!["db", "data", "proxy"]);
    }
}
