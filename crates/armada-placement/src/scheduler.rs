//! Scheduler — filter chain followed by the configured strategy.

use std::borrow::Cow;

use armada_core::ManageConfig;
use tracing::debug;

use crate::container::ContainerConfig;
use crate::engine::{EngineView, NetworkScope};
use crate::error::{PlacementError, PlacementResult};
use crate::filter::{Filter, apply_filters, build_filters};
use crate::strategy::{PlacementStrategy, StrategyOptions, new_strategy};

/// Network modes that never pin a container to an engine.
const BUILTIN_NETWORK_MODES: [&str; 4] = ["", "default", "bridge", "host"];

pub struct Scheduler {
    strategy: Box<dyn PlacementStrategy>,
    filters: Vec<Box<dyn Filter>>,
}

impl Scheduler {
    pub fn new(strategy: Box<dyn PlacementStrategy>, filters: Vec<Box<dyn Filter>>) -> Self {
        Self { strategy, filters }
    }

    pub fn from_config(config: &ManageConfig) -> PlacementResult<Self> {
        let options = StrategyOptions {
            overcommit: config.overcommit,
        };
        Ok(Self::new(
            new_strategy(config.strategy, &options)?,
            build_filters(&config.filters)?,
        ))
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Filter then rank the candidates for one container.
    ///
    /// Soft expressions are honoured first; if that leaves nothing the chain
    /// runs again without them.
    pub fn select_nodes_for_container<'a>(
        &self,
        candidates: &[&'a EngineView],
        config: &ContainerConfig,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        let config = pin_to_network_owner(candidates, config);

        let accepted = match apply_filters(&self.filters, &config, candidates.to_vec(), true) {
            Ok(nodes) => nodes,
            Err(err) if config.has_soft_exprs() => {
                debug!(error = %err, "retrying without soft expressions");
                apply_filters(&self.filters, &config, candidates.to_vec(), false)?
            }
            Err(err) => return Err(err),
        };

        self.strategy.rank_and_sort(&config, accepted)
    }

    /// Ranked engines for `num` units of the container.
    ///
    /// With `with_image_affinity`, engines already holding the image are tried
    /// first; the plain selection is used when they cannot supply `num`.
    pub fn schedule<'a>(
        &self,
        candidates: &[&'a EngineView],
        config: &ContainerConfig,
        num: usize,
        with_image_affinity: bool,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        if with_image_affinity && !config.image.is_empty() {
            let mut affine = config.clone();
            affine.add_affinity(&format!("image=={}", config.image));
            match self.select_nodes_for_container(candidates, &affine) {
                Ok(nodes) if nodes.len() >= num => return Ok(nodes),
                Ok(nodes) => {
                    debug!(found = nodes.len(), num, "image affinity too narrow, retrying without");
                }
                Err(err) => debug!(error = %err, "image affinity unsatisfied, retrying without"),
            }
        }

        let nodes = self.select_nodes_for_container(candidates, config)?;
        if nodes.len() < num {
            return Err(PlacementError::NotEnoughEngines {
                needed: num,
                found: nodes.len(),
            });
        }
        Ok(nodes)
    }
}

/// A container on a locally scoped network must run on the engine that owns
/// the network.
fn pin_to_network_owner<'c>(
    candidates: &[&EngineView],
    config: &'c ContainerConfig,
) -> Cow<'c, ContainerConfig> {
    let mode = config.network_mode.as_str();
    if BUILTIN_NETWORK_MODES.contains(&mode) || mode.starts_with("container:") || mode == "none" {
        return Cow::Borrowed(config);
    }
    let owner = candidates.iter().find(|n| {
        n.networks
            .iter()
            .any(|net| net.name == mode && net.scope == NetworkScope::Local)
    });
    match owner {
        Some(engine) => {
            let mut pinned = config.clone();
            pinned.add_constraint(&format!("node==~{}", engine.id));
            debug!(network = mode, engine = %engine.id, "pinned to network owner");
            Cow::Owned(pinned)
        }
        None => Cow::Borrowed(config),
    }
}
