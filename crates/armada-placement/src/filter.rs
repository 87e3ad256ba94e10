//! Hard-constraint filters over engine views.
//!
//! Filters are pure: they take a candidate list and return the subset that
//! can host the container. The chain runs in a fixed order: resource,
//! constraint, port, affinity, dependency, health.

use armada_core::config::KNOWN_FILTERS;
use tracing::debug;

use crate::container::ContainerConfig;
use crate::engine::EngineView;
use crate::error::{PlacementError, PlacementResult};
use crate::expr::Expr;

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return the candidates that pass. `soft` enables soft expressions.
    fn filter<'a>(
        &self,
        config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
        soft: bool,
    ) -> PlacementResult<Vec<&'a EngineView>>;
}

/// Build the configured filters, reordered into chain order.
pub fn build_filters(names: &[String]) -> PlacementResult<Vec<Box<dyn Filter>>> {
    if let Some(unknown) = names.iter().find(|n| !KNOWN_FILTERS.contains(&n.as_str())) {
        return Err(PlacementError::UnknownFilter(unknown.clone()));
    }
    let filters = KNOWN_FILTERS
        .iter()
        .filter(|name| names.iter().any(|n| n == *name))
        .map(|name| -> Box<dyn Filter> {
            match *name {
                "resource" => Box::new(ResourceFilter),
                "constraint" => Box::new(ConstraintFilter),
                "port" => Box::new(PortFilter),
                "affinity" => Box::new(AffinityFilter),
                "dependency" => Box::new(DependencyFilter),
                _ => Box::new(HealthFilter),
            }
        })
        .collect();
    Ok(filters)
}

/// Run every filter in order. An empty result is an error naming the filter.
pub fn apply_filters<'a>(
    filters: &[Box<dyn Filter>],
    config: &ContainerConfig,
    mut nodes: Vec<&'a EngineView>,
    soft: bool,
) -> PlacementResult<Vec<&'a EngineView>> {
    for filter in filters {
        let before = nodes.len();
        nodes = filter.filter(config, nodes, soft)?;
        debug!(filter = filter.name(), before, after = nodes.len(), "filter applied");
        if nodes.is_empty() {
            return Err(PlacementError::NoCandidates {
                filter: filter.name(),
                reason: format!("{before} candidate(s) rejected"),
            });
        }
    }
    Ok(nodes)
}

// ── Resource ──────────────────────────────────────────────────────

/// Drops engines without enough free cores or memory.
pub struct ResourceFilter;

impl Filter for ResourceFilter {
    fn name(&self) -> &'static str {
        "resource"
    }

    fn filter<'a>(
        &self,
        config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
        _soft: bool,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        let cpus = config.requested_cpus();
        let memory = config.memory;
        Ok(nodes
            .into_iter()
            .filter(|n| n.free_cpus() >= cpus && n.free_memory() >= memory)
            .collect())
    }
}

// ── Constraint ────────────────────────────────────────────────────

/// Evaluates `constraint:` expressions against engine attributes.
pub struct ConstraintFilter;

fn engine_values<'a>(node: &'a EngineView, key: &str) -> Vec<&'a str> {
    match key {
        "node" => vec![node.id.as_str(), node.name.as_str()],
        "datacenter" => vec![node.datacenter_id.as_str()],
        _ => node.labels.get(key).map(String::as_str).into_iter().collect(),
    }
}

impl Filter for ConstraintFilter {
    fn name(&self) -> &'static str {
        "constraint"
    }

    fn filter<'a>(
        &self,
        config: &ContainerConfig,
        mut nodes: Vec<&'a EngineView>,
        soft: bool,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        for expr in config.constraints()? {
            if expr.soft && !soft {
                continue;
            }
            nodes.retain(|n| expr.matches(engine_values(n, &expr.key)));
            if nodes.is_empty() {
                return Err(unsatisfied(self.name(), &expr));
            }
        }
        Ok(nodes)
    }
}

fn unsatisfied(filter: &'static str, expr: &Expr) -> PlacementError {
    PlacementError::NoCandidates {
        filter,
        reason: format!("unable to satisfy {expr}"),
    }
}

// ── Port ──────────────────────────────────────────────────────────

/// Drops engines already publishing one of the requested host ports.
pub struct PortFilter;

impl Filter for PortFilter {
    fn name(&self) -> &'static str {
        "port"
    }

    fn filter<'a>(
        &self,
        config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
        _soft: bool,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        if config.host_ports.is_empty() {
            return Ok(nodes);
        }
        Ok(nodes
            .into_iter()
            .filter(|n| !n.published_ports().any(|p| config.host_ports.contains(&p)))
            .collect())
    }
}

// ── Affinity ──────────────────────────────────────────────────────

/// Evaluates `affinity:` expressions against what an engine already hosts:
/// `container`, `image`, or any container label key.
pub struct AffinityFilter;

fn hosted_values<'a>(node: &'a EngineView, key: &str) -> Vec<&'a str> {
    match key {
        "container" => node
            .containers
            .iter()
            .flat_map(|c| [c.name.as_str(), c.id.as_str()])
            .collect(),
        "image" => node
            .images
            .iter()
            .map(String::as_str)
            .chain(node.containers.iter().map(|c| c.image.as_str()))
            .collect(),
        _ => node
            .containers
            .iter()
            .filter_map(|c| c.labels.get(key).map(String::as_str))
            .collect(),
    }
}

impl Filter for AffinityFilter {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn filter<'a>(
        &self,
        config: &ContainerConfig,
        mut nodes: Vec<&'a EngineView>,
        soft: bool,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        for expr in config.affinities()? {
            if expr.soft && !soft {
                continue;
            }
            nodes.retain(|n| expr.matches(hosted_values(n, &expr.key)));
            if nodes.is_empty() {
                return Err(unsatisfied(self.name(), &expr));
            }
        }
        Ok(nodes)
    }
}

// ── Dependency ────────────────────────────────────────────────────

/// Keeps engines hosting every linked, volumes-from, or net container.
pub struct DependencyFilter;

impl Filter for DependencyFilter {
    fn name(&self) -> &'static str {
        "dependency"
    }

    fn filter<'a>(
        &self,
        config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
        _soft: bool,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        let deps = config.dependencies();
        if deps.is_empty() {
            return Ok(nodes);
        }
        Ok(nodes
            .into_iter()
            .filter(|n| deps.iter().all(|d| n.has_container(d)))
            .collect())
    }
}

// ── Health ────────────────────────────────────────────────────────

pub struct HealthFilter;

impl Filter for HealthFilter {
    fn name(&self) -> &'static str {
        "health"
    }

    fn filter<'a>(
        &self,
        _config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
        _soft: bool,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        Ok(nodes.into_iter().filter(|n| n.is_healthy()).collect())
    }
}
