//! Per-workload configuration synthesis.
//!
//! A configurer holds the parsed configuration of one unit. The executor
//! parses the module's template, merges the service overrides, sets the
//! values the ledger assigned, verifies required keys, and marshals the
//! result into the file copied into the container.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use armada_state::ModuleType;

use crate::error::{RegionError, RegionResult};

pub trait Configurer: Send + Sync {
    /// Replace the current entries with those parsed from `text`.
    fn parse(&mut self, text: &str) -> RegionResult<()>;

    fn parse_file(&mut self, path: &Path) -> RegionResult<()> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RegionError::Validation(format!("read config {}: {e}", path.display()))
        })?;
        self.parse(&text)
    }

    /// Overlay `overrides`; existing keys are replaced.
    fn merge(&mut self, overrides: &HashMap<String, String>);

    /// Fail unless every key in `required` carries a non-empty value.
    fn verify(&self, required: &[String]) -> RegionResult<()>;

    fn set(&mut self, key: &str, value: &str);

    fn get(&self, key: &str) -> Option<&str>;

    fn marshal(&self) -> String;

    /// Where the marshalled file lives inside the container.
    fn path(&self) -> &str;
}

/// Configurer for line-oriented `key<sep>value` files.
#[derive(Debug, Clone)]
pub struct KeyValueConfigurer {
    separator: &'static str,
    /// Section header written before the entries, e.g. `[mysqld]`.
    section: Option<&'static str>,
    path: &'static str,
    entries: BTreeMap<String, String>,
}

impl KeyValueConfigurer {
    pub fn new(separator: &'static str, section: Option<&'static str>, path: &'static str) -> Self {
        Self {
            separator,
            section,
            path,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Configurer for a module type.
pub fn new_configurer(kind: ModuleType) -> Box<dyn Configurer> {
    let configurer = match kind {
        ModuleType::Redis => KeyValueConfigurer::new(" ", None, "/etc/redis/redis.conf"),
        ModuleType::Mysql => KeyValueConfigurer::new(" = ", Some("mysqld"), "/etc/mysql/my.cnf"),
        ModuleType::Proxy => KeyValueConfigurer::new("=", None, "/etc/proxy/proxy.conf"),
        ModuleType::Generic => KeyValueConfigurer::new("=", None, "/etc/armada/unit.conf"),
    };
    Box::new(configurer)
}

impl Configurer for KeyValueConfigurer {
    fn parse(&mut self, text: &str) -> RegionResult<()> {
        let mut entries = BTreeMap::new();
        let separator = self.separator.trim();
        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                continue;
            }
            let parsed = if separator.is_empty() {
                line.split_once(char::is_whitespace)
            } else {
                line.split_once(separator)
            };
            let Some((key, value)) = parsed else {
                return Err(RegionError::Validation(format!(
                    "config line {}: expected key{}value: {line}",
                    n + 1,
                    self.separator
                )));
            };
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        self.entries = entries;
        Ok(())
    }

    fn merge(&mut self, overrides: &HashMap<String, String>) {
        for (key, value) in overrides {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    fn verify(&self, required: &[String]) -> RegionResult<()> {
        let missing: Vec<&str> = required
            .iter()
            .filter(|key| self.entries.get(*key).is_none_or(|v| v.is_empty()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegionError::Validation(format!(
                "missing config keys: {}",
                missing.join(", ")
            )))
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn marshal(&self) -> String {
        let mut out = String::new();
        if let Some(section) = self.section {
            out.push_str(&format!("[{section}]\n"));
        }
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push_str(self.separator);
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    fn path(&self) -> &str {
        self.path
    }
}
