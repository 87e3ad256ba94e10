//! Discovery — where engines come from.
//!
//! A discovery URI is `scheme://hosts/path`. The `file` and `nodes`
//! schemes are served in-process; `consul`, `etcd`, and `zk` are
//! recognized (their paths feed the nodes and leader keys) but the backend
//! itself is external.
//!
//! Entries accept a numeric range: `10.0.0.[1:3]:2375` expands to three
//! entries.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use armada_state::globals::DEFAULT_NODES_KV_PATH;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{ClusterError, ClusterResult};

/// Option key overriding where engines register in a KV store.
pub const KV_PATH_OPTION: &str = "kv.path";

const LEADER_SUFFIX: &str = "docker/swarm/leader";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    File,
    Nodes,
    Consul,
    Etcd,
    Zk,
}

impl Scheme {
    fn parse(s: &str) -> ClusterResult<Self> {
        match s {
            "file" => Ok(Self::File),
            "nodes" => Ok(Self::Nodes),
            "consul" => Ok(Self::Consul),
            "etcd" => Ok(Self::Etcd),
            "zk" => Ok(Self::Zk),
            other => Err(ClusterError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn is_kv(self) -> bool {
        matches!(self, Self::Consul | Self::Etcd | Self::Zk)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Nodes => "nodes",
            Self::Consul => "consul",
            Self::Etcd => "etcd",
            Self::Zk => "zk",
        }
    }
}

/// A parsed discovery URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryUri {
    pub scheme: Scheme,
    /// Comma-separated hosts (KV and nodes schemes) or the file path.
    pub hosts: Vec<String>,
    /// KV prefix; empty for `file` and `nodes`.
    pub path: String,
}

impl DiscoveryUri {
    pub fn parse(uri: &str) -> ClusterResult<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ClusterError::InvalidUri(uri.to_string()))?;
        let scheme = Scheme::parse(scheme)?;
        if rest.is_empty() {
            return Err(ClusterError::InvalidUri(uri.to_string()));
        }

        match scheme {
            Scheme::File => Ok(Self {
                scheme,
                hosts: vec![rest.to_string()],
                path: String::new(),
            }),
            Scheme::Nodes => Ok(Self {
                scheme,
                hosts: split_hosts(rest),
                path: String::new(),
            }),
            _ => {
                let (hosts, path) = rest.split_once('/').unwrap_or((rest, ""));
                Ok(Self {
                    scheme,
                    hosts: split_hosts(hosts),
                    path: path.trim_matches('/').to_string(),
                })
            }
        }
    }

    /// Key under which the elected primary advertises itself.
    pub fn leader_election_path(&self) -> String {
        if self.path.is_empty() {
            LEADER_SUFFIX.to_string()
        } else {
            format!("{}/{LEADER_SUFFIX}", self.path)
        }
    }
}

fn split_hosts(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// KV path engines register under, honouring `kv.path`.
pub fn nodes_path(options: &HashMap<String, String>) -> String {
    options
        .get(KV_PATH_OPTION)
        .filter(|p| !p.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_NODES_KV_PATH.to_string())
}

/// One engine endpoint reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiscoveryEntry {
    pub host: String,
    pub port: u16,
}

impl DiscoveryEntry {
    pub fn parse(s: &str) -> ClusterResult<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::InvalidEntry(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| ClusterError::InvalidEntry(s.to_string()))?;
        if host.is_empty() {
            return Err(ClusterError::InvalidEntry(s.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for DiscoveryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Expand a single `[start:end]` range. Malformed ranges are left as is.
pub fn expand_range(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('[') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = pattern[open..].find(']').map(|i| open + i) else {
        return vec![pattern.to_string()];
    };
    let Some((start, end)) = pattern[open + 1..close].split_once(':') else {
        return vec![pattern.to_string()];
    };
    let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) else {
        return vec![pattern.to_string()];
    };
    if start > end {
        return vec![pattern.to_string()];
    }
    (start..=end)
        .map(|i| format!("{}{i}{}", &pattern[..open], &pattern[close + 1..]))
        .collect()
}

/// Parse raw entry strings, expanding ranges.
pub fn parse_entries<'a>(raw: impl IntoIterator<Item = &'a str>) -> ClusterResult<Vec<DiscoveryEntry>> {
    let mut entries = Vec::new();
    for item in raw {
        for expanded in expand_range(item) {
            entries.push(DiscoveryEntry::parse(&expanded)?);
        }
    }
    Ok(entries)
}

// ── Backends ──────────────────────────────────────────────────────

#[async_trait]
pub trait Backend: Send + Sync {
    /// Current set of engine endpoints.
    async fn fetch(&self) -> ClusterResult<Vec<DiscoveryEntry>>;
}

/// Static list given inline in the URI.
pub struct NodesBackend {
    entries: Vec<DiscoveryEntry>,
}

impl NodesBackend {
    pub fn new(hosts: &[String]) -> ClusterResult<Self> {
        Ok(Self {
            entries: parse_entries(hosts.iter().map(String::as_str))?,
        })
    }
}

#[async_trait]
impl Backend for NodesBackend {
    async fn fetch(&self) -> ClusterResult<Vec<DiscoveryEntry>> {
        Ok(self.entries.clone())
    }
}

/// One entry per line; `#` starts a comment.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn fetch(&self) -> ClusterResult<Vec<DiscoveryEntry>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        parse_entries(
            content
                .lines()
                .map(|l| l.split('#').next().unwrap_or("").trim())
                .filter(|l| !l.is_empty()),
        )
    }
}

/// Build the in-process backend for a URI.
pub fn new_backend(uri: &DiscoveryUri) -> ClusterResult<Arc<dyn Backend>> {
    match uri.scheme {
        Scheme::File => Ok(Arc::new(FileBackend::new(&uri.hosts[0]))),
        Scheme::Nodes => Ok(Arc::new(NodesBackend::new(&uri.hosts)?)),
        kv => Err(ClusterError::ExternalBackend(kv.as_str().to_string())),
    }
}

/// Poll a backend and forward every changed entry set.
///
/// The first successful fetch is always delivered. Fetch errors are logged
/// and retried on the next tick.
pub fn watch_backend(
    backend: Arc<dyn Backend>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<Vec<DiscoveryEntry>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut last: Option<Vec<DiscoveryEntry>> = None;
        loop {
            match backend.fetch().await {
                Ok(mut entries) => {
                    entries.sort();
                    entries.dedup();
                    if last.as_ref() != Some(&entries) {
                        debug!(count = entries.len(), "discovery entries changed");
                        if tx.send(entries.clone()).await.is_err() {
                            return;
                        }
                        last = Some(entries);
                    }
                }
                Err(e) => warn!(error = %e, "discovery fetch failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kv_uri() {
        let uri = DiscoveryUri::parse("consul://10.0.0.1:8500,10.0.0.2:8500/armada/prod").unwrap();
        assert_eq!(uri.scheme, Scheme::Consul);
        assert_eq!(uri.hosts, vec!["10.0.0.1:8500", "10.0.0.2:8500"]);
        assert_eq!(uri.path, "armada/prod");
        assert_eq!(uri.leader_election_path(), "armada/prod/docker/swarm/leader");
        assert!(uri.scheme.is_kv());
    }

    #[test]
    fn leader_path_without_prefix() {
        let uri = DiscoveryUri::parse("etcd://10.0.0.1:2379").unwrap();
        assert_eq!(uri.leader_election_path(), "docker/swarm/leader");
    }

    #[test]
    fn parse_rejects_bad_uris() {
        assert!(matches!(DiscoveryUri::parse("10.0.0.1"), Err(ClusterError::InvalidUri(_))));
        assert!(matches!(DiscoveryUri::parse("nodes://"), Err(ClusterError::InvalidUri(_))));
        assert!(matches!(
            DiscoveryUri::parse("ftp://host"),
            Err(ClusterError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn kv_path_option() {
        assert_eq!(nodes_path(&HashMap::new()), "docker/swarm/nodes");
        let opts = HashMap::from([(KV_PATH_OPTION.to_string(), "custom/nodes".to_string())]);
        assert_eq!(nodes_path(&opts), "custom/nodes");
    }

    #[test]
    fn range_expansion() {
        assert_eq!(
            expand_range("10.0.0.[1:3]:2375"),
            vec!["10.0.0.1:2375", "10.0.0.2:2375", "10.0.0.3:2375"]
        );
        assert_eq!(expand_range("host:2375"), vec!["host:2375"]);
        assert_eq!(expand_range("host[3:1]:1"), vec!["host[3:1]:1"]);
    }

    #[test]
    fn entry_parse() {
        let e = DiscoveryEntry::parse("10.0.0.1:2375").unwrap();
        assert_eq!(e.to_string(), "10.0.0.1:2375");
        assert!(DiscoveryEntry::parse("10.0.0.1").is_err());
        assert!(DiscoveryEntry::parse(":2375").is_err());
    }

    #[tokio::test]
    async fn nodes_backend_lists_entries() {
        let uri = DiscoveryUri::parse("nodes://10.0.0.[1:2]:2375,10.0.1.9:2375").unwrap();
        let backend = new_backend(&uri).unwrap();
        let entries = backend.fetch().await.unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn file_backend_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster");
        std::fs::write(&path, "# engines\n10.0.0.1:2375\n\n10.0.0.[2:3]:2375 # rack b\n").unwrap();

        let uri = DiscoveryUri::parse(&format!("file://{}", path.display())).unwrap();
        let entries = new_backend(&uri).unwrap().fetch().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].host, "10.0.0.3");
    }

    #[test]
    fn kv_backend_is_external() {
        let uri = DiscoveryUri::parse("zk://10.0.0.1:2181/armada").unwrap();
        assert!(matches!(new_backend(&uri), Err(ClusterError::ExternalBackend(_))));
    }

    #[tokio::test]
    async fn watch_delivers_initial_set() {
        let backend: Arc<dyn Backend> =
            Arc::new(NodesBackend::new(&["10.0.0.1:2375".to_string()]).unwrap());
        let (_tx, shutdown) = watch::channel(false);
        let mut rx = watch_backend(backend, Duration::from_millis(10), shutdown);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);
    }
}
