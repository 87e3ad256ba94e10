//! In-memory snapshot of one container engine.
//!
//! Views are value types: the scheduler filters and ranks borrowed views,
//! and the region replaces a view wholesale on refresh.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::container::ContainerConfig;

/// Health of a fully responsive engine.
pub const HEALTH_MAX: u8 = 100;

/// A container as seen on an engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Host ports the container publishes.
    #[serde(default)]
    pub host_ports: Vec<u32>,
    #[serde(default)]
    pub cpus: u64,
    #[serde(default)]
    pub memory: u64,
}

/// Scope of a docker network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkScope {
    Local,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSummary {
    pub name: String,
    pub scope: NetworkScope,
}

/// Snapshot of a container host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineView {
    pub id: String,
    pub name: String,
    pub addr: String,
    /// Datacenter (fault domain) the engine belongs to.
    pub datacenter_id: String,
    pub total_cpus: u64,
    pub used_cpus: u64,
    pub total_memory: u64,
    pub used_memory: u64,
    #[serde(default)]
    pub containers: Vec<ContainerSummary>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub networks: Vec<NetworkSummary>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// 0..=100; 0 means unreachable.
    pub health: u8,
}

impl EngineView {
    pub fn free_cpus(&self) -> u64 {
        self.total_cpus.saturating_sub(self.used_cpus)
    }

    pub fn free_memory(&self) -> u64 {
        self.total_memory.saturating_sub(self.used_memory)
    }

    pub fn is_healthy(&self) -> bool {
        self.health > 0
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    /// Match a container by id, id prefix, or name.
    pub fn has_container(&self, name_or_id: &str) -> bool {
        let name = name_or_id.trim_start_matches('/');
        self.containers
            .iter()
            .any(|c| c.name == name || c.id == name || (name.len() >= 12 && c.id.starts_with(name)))
    }

    /// Match an image reference; an untagged reference means `:latest`.
    pub fn has_image(&self, image: &str) -> bool {
        let wanted = normalize_image(image);
        self.images.iter().any(|i| normalize_image(i) == wanted)
    }

    pub fn published_ports(&self) -> impl Iterator<Item = u32> + '_ {
        self.containers.iter().flat_map(|c| c.host_ports.iter().copied())
    }

    /// Account for a container about to land on this engine.
    pub fn reserve(&mut self, id: &str, config: &ContainerConfig) {
        let cpus = config.requested_cpus();
        self.used_cpus = self.used_cpus.saturating_add(cpus).min(self.total_cpus);
        self.used_memory = self
            .used_memory
            .saturating_add(config.memory)
            .min(self.total_memory);
        self.containers.push(ContainerSummary {
            id: id.to_string(),
            name: config.name.clone(),
            image: config.image.clone(),
            labels: config.labels.clone(),
            host_ports: config.host_ports.clone(),
            cpus,
            memory: config.memory,
        });
    }
}

fn normalize_image(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_match_defaults_to_latest() {
        let view = EngineView {
            images: vec!["redis:latest".to_string(), "registry:5000/mysql:8.0".to_string()],
            ..Default::default()
        };
        assert!(view.has_image("redis"));
        assert!(view.has_image("registry:5000/mysql:8.0"));
        assert!(!view.has_image("registry:5000/mysql"));
    }

    #[test]
    fn reserve_updates_usage() {
        let mut view = EngineView {
            total_cpus: 4,
            total_memory: 1024,
            health: HEALTH_MAX,
            ..Default::default()
        };
        let config = ContainerConfig {
            name: "u1".to_string(),
            cpuset_cpus: "0,1".to_string(),
            memory: 512,
            host_ports: vec![3306],
            ..Default::default()
        };
        view.reserve("c1", &config);
        assert_eq!(view.used_cpus, 2);
        assert_eq!(view.free_memory(), 512);
        assert!(view.has_container("u1"));
        assert_eq!(view.published_ports().collect::<Vec<_>>(), vec![3306]);
    }
}
