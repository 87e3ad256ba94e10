//! Ledger settings fixed once at startup.

use std::sync::OnceLock;

/// Default discovery path under which engines register.
pub const DEFAULT_NODES_KV_PATH: &str = "docker/swarm/nodes";

static NODES_KV_PATH: OnceLock<String> = OnceLock::new();
static DEFAULT_STORES: OnceLock<Vec<String>> = OnceLock::new();

/// Set the nodes KV path. Returns `false` if it was already set.
pub fn init_nodes_kv_path(path: impl Into<String>) -> bool {
    NODES_KV_PATH.set(path.into()).is_ok()
}

pub fn nodes_kv_path() -> &'static str {
    NODES_KV_PATH
        .get()
        .map(String::as_str)
        .unwrap_or(DEFAULT_NODES_KV_PATH)
}

/// Set the storage backends new datacenters attach by default.
/// Returns `false` if they were already set.
pub fn init_default_stores(stores: Vec<String>) -> bool {
    DEFAULT_STORES.set(stores).is_ok()
}

pub fn default_stores() -> &'static [String] {
    DEFAULT_STORES.get().map(Vec::as_slice).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_path_is_set_once() {
        // Other tests in this binary never touch the path.
        let first = init_nodes_kv_path("custom/nodes");
        assert!(first);
        assert!(!init_nodes_kv_path("other/nodes"));
        assert_eq!(nodes_kv_path(), "custom/nodes");
    }

    #[test]
    fn default_stores_set_once() {
        assert!(init_default_stores(vec!["local".to_string()]));
        assert!(!init_default_stores(vec![]));
        assert_eq!(default_stores(), ["local".to_string()]);
    }
}
