//! armada.toml configuration parser and option validation.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv::parse_kv_string;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("unknown cluster driver: {0}")]
    UnknownDriver(String),

    #[error("invalid duration for {field}: {value}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid option {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Placement strategy names accepted by `strategy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyName {
    #[serde(rename = "spread_v2")]
    Spread,
    #[serde(rename = "group")]
    Group,
    #[serde(rename = "binpack")]
    Binpack,
    #[serde(rename = "random")]
    Random,
}

impl StrategyName {
    pub fn parse(s: &str) -> ConfigResult<Self> {
        match s {
            "spread_v2" | "spread" => Ok(Self::Spread),
            "group" => Ok(Self::Group),
            "binpack" => Ok(Self::Binpack),
            "random" => Ok(Self::Random),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spread => "spread_v2",
            Self::Group => "group",
            Self::Binpack => "binpack",
            Self::Random => "random",
        }
    }
}

/// Cluster drivers accepted by `cluster_driver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterDriver {
    #[serde(rename = "swarm")]
    Swarm,
    #[serde(rename = "garden")]
    Garden,
    #[serde(rename = "mesos-experimental")]
    MesosExperimental,
}

impl ClusterDriver {
    pub fn parse(s: &str) -> ConfigResult<Self> {
        match s {
            "swarm" => Ok(Self::Swarm),
            "garden" => Ok(Self::Garden),
            "mesos-experimental" => Ok(Self::MesosExperimental),
            other => Err(ConfigError::UnknownDriver(other.to_string())),
        }
    }
}

/// Top-level manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManageConfig {
    #[serde(default = "default_strategy")]
    pub strategy: StrategyName,
    #[serde(default = "default_filters")]
    pub filters: Vec<String>,
    #[serde(default = "default_driver")]
    pub cluster_driver: ClusterDriver,
    #[serde(default = "default_refresh_min")]
    pub engine_refresh_min_interval: String,
    #[serde(default = "default_refresh_max")]
    pub engine_refresh_max_interval: String,
    #[serde(default = "default_engine_failure_retry")]
    pub engine_failure_retry: u32,
    #[serde(default = "default_heartbeat")]
    pub heartbeat: String,
    #[serde(default = "default_ttl")]
    pub ttl: String,
    /// Retry budget for the unit prepare block.
    #[serde(default = "default_failure_retry")]
    pub failure_retry: u32,
    /// First port number handed out by the port ledger.
    #[serde(default = "default_port_base")]
    pub port_base: u32,
    /// Memory over-commit ratio accepted by the spread strategy.
    #[serde(default = "default_overcommit")]
    pub overcommit: f64,
    /// Minimum number of connected engines for the cluster to accept work.
    #[serde(default = "default_quorum")]
    pub quorum: usize,
    #[serde(default)]
    pub experimental: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Leader/replica settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `ip:port` advertised to replicas.
    pub advertise: Option<String>,
    #[serde(default = "default_replication_ttl")]
    pub ttl: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            advertise: None,
            ttl: default_replication_ttl(),
        }
    }
}

/// Discovery backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub uri: String,
    /// `key=value,...` option bag passed to the backend.
    #[serde(default)]
    pub options: String,
}

fn default_strategy() -> StrategyName {
    StrategyName::Spread
}

fn default_filters() -> Vec<String> {
    ["resource", "constraint", "port", "affinity", "dependency", "health"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_driver() -> ClusterDriver {
    ClusterDriver::Swarm
}

fn default_refresh_min() -> String {
    "30s".to_string()
}

fn default_refresh_max() -> String {
    "60s".to_string()
}

fn default_engine_failure_retry() -> u32 {
    3
}

fn default_heartbeat() -> String {
    "60s".to_string()
}

fn default_ttl() -> String {
    "180s".to_string()
}

fn default_failure_retry() -> u32 {
    2
}

fn default_port_base() -> u32 {
    20000
}

fn default_overcommit() -> f64 {
    0.05
}

fn default_quorum() -> usize {
    1
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/armada")
}

fn default_replication_ttl() -> String {
    "20s".to_string()
}

impl Default for ManageConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            filters: default_filters(),
            cluster_driver: default_driver(),
            engine_refresh_min_interval: default_refresh_min(),
            engine_refresh_max_interval: default_refresh_max(),
            engine_failure_retry: default_engine_failure_retry(),
            heartbeat: default_heartbeat(),
            ttl: default_ttl(),
            failure_retry: default_failure_retry(),
            port_base: default_port_base(),
            overcommit: default_overcommit(),
            quorum: default_quorum(),
            experimental: false,
            data_dir: default_data_dir(),
            replication: ReplicationConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl ManageConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ManageConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn heartbeat(&self) -> ConfigResult<Duration> {
        duration_field("heartbeat", &self.heartbeat)
    }

    pub fn ttl(&self) -> ConfigResult<Duration> {
        duration_field("ttl", &self.ttl)
    }

    pub fn refresh_min(&self) -> ConfigResult<Duration> {
        duration_field("engine_refresh_min_interval", &self.engine_refresh_min_interval)
    }

    pub fn refresh_max(&self) -> ConfigResult<Duration> {
        duration_field("engine_refresh_max_interval", &self.engine_refresh_max_interval)
    }

    pub fn replication_ttl(&self) -> ConfigResult<Duration> {
        duration_field("replication.ttl", &self.replication.ttl)
    }

    /// Advertised address, parsed. `None` when replication is off.
    pub fn advertise(&self) -> ConfigResult<Option<SocketAddr>> {
        match &self.replication.advertise {
            Some(addr) => addr.parse().map(Some).map_err(|_| ConfigError::Invalid {
                field: "replication.advertise",
                reason: format!("expected ip:port, got {addr}"),
            }),
            None => Ok(None),
        }
    }

    /// Discovery options parsed from the `key=value` bag.
    pub fn discovery_options(&self) -> std::collections::HashMap<String, String> {
        parse_kv_string(&self.discovery.options)
    }

    /// Check every cross-field invariant.
    pub fn validate(&self) -> ConfigResult<()> {
        let min = self.refresh_min()?;
        let max = self.refresh_max()?;
        if min.is_zero() {
            return Err(invalid("engine_refresh_min_interval", "must be positive"));
        }
        if max < min {
            return Err(invalid(
                "engine_refresh_max_interval",
                "must be greater than or equal to the min interval",
            ));
        }
        if self.engine_failure_retry == 0 {
            return Err(invalid("engine_failure_retry", "must be positive"));
        }

        let heartbeat = self.heartbeat()?;
        if heartbeat < Duration::from_secs(1) {
            return Err(invalid("heartbeat", "must be at least 1s"));
        }
        let ttl = self.ttl()?;
        if ttl <= heartbeat {
            return Err(invalid("ttl", "must be strictly greater than heartbeat"));
        }

        if self.replication.enabled {
            if self.advertise()?.is_none() {
                return Err(invalid(
                    "replication.advertise",
                    "required when replication is enabled",
                ));
            }
            if self.replication_ttl()?.is_zero() {
                return Err(invalid("replication.ttl", "must be positive"));
            }
        }

        if self.cluster_driver == ClusterDriver::MesosExperimental && !self.experimental {
            return Err(invalid(
                "cluster_driver",
                "mesos-experimental needs experimental features enabled",
            ));
        }

        if !(0.0..=1.0).contains(&self.overcommit) {
            return Err(invalid("overcommit", "must be within 0.0..=1.0"));
        }

        for name in &self.filters {
            if !KNOWN_FILTERS.contains(&name.as_str()) {
                return Err(invalid("filters", &format!("unknown filter {name}")));
            }
        }

        Ok(())
    }
}

/// Filter names recognized by the placement crate.
pub const KNOWN_FILTERS: &[&str] = &[
    "resource",
    "constraint",
    "port",
    "affinity",
    "dependency",
    "health",
];

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn duration_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ManageConfig::default();
        config.validate().unwrap();
        assert_eq!(config.strategy, StrategyName::Spread);
        assert_eq!(config.failure_retry, 2);
    }

    #[test]
    fn parse_minimal() {
        let toml_str = r#"
strategy = "group"
heartbeat = "5s"
ttl = "15s"

[discovery]
uri = "file:///etc/armada/nodes"
options = "kv.path=custom/nodes"
"#;
        let config: ManageConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.strategy, StrategyName::Group);
        assert_eq!(config.heartbeat().unwrap(), Duration::from_secs(5));
        assert_eq!(
            config.discovery_options().get("kv.path").map(String::as_str),
            Some("custom/nodes")
        );
        config.validate().unwrap();
    }

    #[test]
    fn rejects_sub_second_heartbeat() {
        let config = ManageConfig {
            heartbeat: "500ms".to_string(),
            ..ManageConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "heartbeat", .. })
        ));
    }

    #[test]
    fn rejects_ttl_not_above_heartbeat() {
        let config = ManageConfig {
            heartbeat: "10s".to_string(),
            ttl: "10s".to_string(),
            ..ManageConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "ttl", .. })
        ));
    }

    #[test]
    fn rejects_inverted_refresh_interval() {
        let config = ManageConfig {
            engine_refresh_min_interval: "60s".to_string(),
            engine_refresh_max_interval: "30s".to_string(),
            ..ManageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn replication_needs_advertise() {
        let mut config = ManageConfig::default();
        config.replication.enabled = true;
        assert!(config.validate().is_err());

        config.replication.advertise = Some("10.0.0.1:2375".to_string());
        config.validate().unwrap();

        config.replication.advertise = Some("not-an-addr".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn mesos_needs_experimental() {
        let mut config = ManageConfig {
            cluster_driver: ClusterDriver::MesosExperimental,
            ..ManageConfig::default()
        };
        assert!(config.validate().is_err());
        config.experimental = true;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_filter() {
        let config = ManageConfig {
            filters: vec!["resource".to_string(), "bogus".to_string()],
            ..ManageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn strategy_names() {
        assert_eq!(StrategyName::parse("spread_v2").unwrap(), StrategyName::Spread);
        assert_eq!(StrategyName::parse("binpack").unwrap(), StrategyName::Binpack);
        assert!(StrategyName::parse("fastest").is_err());
        assert_eq!(StrategyName::Group.as_str(), "group");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ManageConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let parsed: ManageConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.port_base, config.port_base);
        assert_eq!(parsed.filters, config.filters);
    }
}
