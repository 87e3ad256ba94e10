//! Placement strategies — rank feasible engines by weight.
//!
//! Every strategy starts from the same per-engine weight, where lower is
//! better:
//!
//! ```text
//! weight = cpu_score + memory_score + HEALTH_FACTOR * health
//! ```
//!
//! `cpu_score` and `memory_score` are the utilization after placement in
//! percent (100 when the container requests nothing). A healthy engine's
//! health term dominates both. Engines that cannot take the container are
//! dropped before ranking; if none remain the call fails.

use std::cmp::Ordering;
use std::collections::HashMap;

use armada_core::StrategyName;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::container::ContainerConfig;
use crate::engine::EngineView;
use crate::error::{PlacementError, PlacementResult};

/// Multiplier applied to the health indicator.
pub const HEALTH_FACTOR: i64 = -10;

/// Label grouping engines for the group strategy.
pub const CLUSTER_LABEL: &str = "cluster";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyOptions {
    /// Memory over-commit ratio accepted on top of physical memory.
    pub overcommit: f64,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self { overcommit: 0.05 }
    }
}

pub trait PlacementStrategy: Send + Sync {
    fn initialize(&mut self, options: &StrategyOptions) -> PlacementResult<()>;

    fn name(&self) -> &'static str;

    /// Order feasible engines, preferred first.
    fn rank_and_sort<'a>(
        &self,
        config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
    ) -> PlacementResult<Vec<&'a EngineView>>;
}

/// Construct and initialize the strategy for a configured name.
pub fn new_strategy(
    name: StrategyName,
    options: &StrategyOptions,
) -> PlacementResult<Box<dyn PlacementStrategy>> {
    let mut strategy: Box<dyn PlacementStrategy> = match name {
        StrategyName::Spread => Box::new(SpreadStrategy::default()),
        StrategyName::Group => Box::new(GroupStrategy::default()),
        StrategyName::Binpack => Box::new(BinpackStrategy::default()),
        StrategyName::Random => Box::new(RandomStrategy::default()),
    };
    strategy.initialize(options)?;
    Ok(strategy)
}

fn check_options(options: &StrategyOptions) -> PlacementResult<f64> {
    if !(0.0..=1.0).contains(&options.overcommit) {
        return Err(PlacementError::InvalidOption(format!(
            "overcommit {} outside 0..=1",
            options.overcommit
        )));
    }
    Ok(options.overcommit)
}

// ── Weighting ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct WeightedNode<'a> {
    pub node: &'a EngineView,
    pub weight: i64,
}

fn utilization(used: u64, requested: u64, total: u64) -> i64 {
    if requested == 0 {
        return 100;
    }
    ((u128::from(used) + u128::from(requested)) * 100 / u128::from(total.max(1))) as i64
}

/// Weigh every engine able to take the container.
///
/// CPU may not exceed the physical core count; memory may exceed physical
/// memory by `overcommit`.
pub fn weigh_nodes<'a>(
    config: &ContainerConfig,
    nodes: &[&'a EngineView],
    overcommit: f64,
) -> PlacementResult<Vec<WeightedNode<'a>>> {
    let cpus = config.requested_cpus();
    let memory = config.memory;

    let weighted: Vec<WeightedNode<'a>> = nodes
        .iter()
        .filter(|n| cpus == 0 || n.used_cpus.saturating_add(cpus) <= n.total_cpus)
        .filter(|n| {
            let limit = n.total_memory + (n.total_memory as f64 * overcommit) as u64;
            memory == 0 || n.used_memory.saturating_add(memory) <= limit
        })
        .map(|n| WeightedNode {
            node: n,
            weight: utilization(n.used_cpus, cpus, n.total_cpus)
                + utilization(n.used_memory, memory, n.total_memory)
                + HEALTH_FACTOR * i64::from(n.health),
        })
        .collect();

    if weighted.is_empty() {
        return Err(PlacementError::NoCapacity {
            container: config.name.clone(),
        });
    }
    Ok(weighted)
}

fn spread_order(a: &WeightedNode<'_>, b: &WeightedNode<'_>) -> Ordering {
    a.weight
        .cmp(&b.weight)
        .then_with(|| a.node.container_count().cmp(&b.node.container_count()))
        .then_with(|| a.node.id.cmp(&b.node.id))
}

// ── Spread ────────────────────────────────────────────────────────

/// Least-loaded engine first.
#[derive(Debug, Default)]
pub struct SpreadStrategy {
    overcommit: f64,
}

impl PlacementStrategy for SpreadStrategy {
    fn initialize(&mut self, options: &StrategyOptions) -> PlacementResult<()> {
        self.overcommit = check_options(options)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        StrategyName::Spread.as_str()
    }

    fn rank_and_sort<'a>(
        &self,
        config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        let mut weighted = weigh_nodes(config, &nodes, self.overcommit)?;
        weighted.sort_by(spread_order);
        Ok(weighted.into_iter().map(|w| w.node).collect())
    }
}

// ── Group ─────────────────────────────────────────────────────────

/// Buckets engines by their `cluster` label and ranks buckets by average
/// weight; engines keep spread order inside a bucket. Unlabeled engines
/// form a bucket of their own.
#[derive(Debug, Default)]
pub struct GroupStrategy {
    overcommit: f64,
}

struct Bucket<'a> {
    key: String,
    members: Vec<WeightedNode<'a>>,
    weight_sum: i64,
    container_sum: usize,
}

impl Bucket<'_> {
    fn len(&self) -> i128 {
        self.members.len() as i128
    }
}

/// Compare `a_sum / a_len` against `b_sum / b_len` without rounding.
fn cmp_avg(a_sum: i128, a_len: i128, b_sum: i128, b_len: i128) -> Ordering {
    (a_sum * b_len).cmp(&(b_sum * a_len))
}

impl PlacementStrategy for GroupStrategy {
    fn initialize(&mut self, options: &StrategyOptions) -> PlacementResult<()> {
        self.overcommit = check_options(options)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        StrategyName::Group.as_str()
    }

    fn rank_and_sort<'a>(
        &self,
        config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        let mut weighted = weigh_nodes(config, &nodes, self.overcommit)?;
        weighted.sort_by(spread_order);

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut buckets: Vec<Bucket<'a>> = Vec::new();
        for w in weighted {
            let key = match w.node.labels.get(CLUSTER_LABEL) {
                Some(cluster) => format!("cluster:{cluster}"),
                None => format!("node:{}", w.node.id),
            };
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                buckets.push(Bucket {
                    key,
                    members: Vec::new(),
                    weight_sum: 0,
                    container_sum: 0,
                });
                buckets.len() - 1
            });
            let bucket = &mut buckets[slot];
            bucket.weight_sum += w.weight;
            bucket.container_sum += w.node.container_count();
            bucket.members.push(w);
        }

        buckets.sort_by(|a, b| {
            cmp_avg(a.weight_sum.into(), a.len(), b.weight_sum.into(), b.len())
                .then_with(|| a.len().cmp(&b.len()))
                .then_with(|| {
                    cmp_avg(
                        a.container_sum as i128,
                        a.len(),
                        b.container_sum as i128,
                        b.len(),
                    )
                })
                .then_with(|| a.key.cmp(&b.key))
        });

        debug!(
            buckets = buckets.len(),
            first = buckets.first().map(|b| b.key.as_str()).unwrap_or(""),
            "group ranking"
        );
        Ok(buckets
            .into_iter()
            .flat_map(|b| b.members.into_iter().map(|w| w.node))
            .collect())
    }
}

// ── Binpack ───────────────────────────────────────────────────────

/// Most-loaded engine first.
#[derive(Debug, Default)]
pub struct BinpackStrategy {
    overcommit: f64,
}

impl PlacementStrategy for BinpackStrategy {
    fn initialize(&mut self, options: &StrategyOptions) -> PlacementResult<()> {
        self.overcommit = check_options(options)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        StrategyName::Binpack.as_str()
    }

    fn rank_and_sort<'a>(
        &self,
        config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        let mut weighted = weigh_nodes(config, &nodes, self.overcommit)?;
        weighted.sort_by(|a, b| {
            b.weight
                .cmp(&a.weight)
                .then_with(|| b.node.container_count().cmp(&a.node.container_count()))
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        Ok(weighted.into_iter().map(|w| w.node).collect())
    }
}

// ── Random ────────────────────────────────────────────────────────

/// Uniform shuffle of the feasible engines.
#[derive(Debug, Default)]
pub struct RandomStrategy {
    overcommit: f64,
}

impl PlacementStrategy for RandomStrategy {
    fn initialize(&mut self, options: &StrategyOptions) -> PlacementResult<()> {
        self.overcommit = check_options(options)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        StrategyName::Random.as_str()
    }

    fn rank_and_sort<'a>(
        &self,
        config: &ContainerConfig,
        nodes: Vec<&'a EngineView>,
    ) -> PlacementResult<Vec<&'a EngineView>> {
        let mut feasible: Vec<&'a EngineView> = weigh_nodes(config, &nodes, self.overcommit)?
            .into_iter()
            .map(|w| w.node)
            .collect();
        feasible.shuffle(&mut rand::rng());
        Ok(feasible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HEALTH_MAX;

    const GIB: u64 = 1 << 30;

    fn make_view(id: &str, cpus: u64, memory: u64) -> EngineView {
        EngineView {
            id: id.to_string(),
            name: id.to_string(),
            total_cpus: cpus,
            total_memory: memory,
            health: HEALTH_MAX,
            ..Default::default()
        }
    }

    fn mem_config(memory: u64) -> ContainerConfig {
        ContainerConfig {
            name: "c".to_string(),
            memory,
            ..Default::default()
        }
    }

    fn spread() -> Box<dyn PlacementStrategy> {
        new_strategy(StrategyName::Spread, &StrategyOptions::default()).unwrap()
    }

    #[test]
    fn spread_prefers_least_loaded() {
        let mut busy = make_view("busy", 4, 4 * GIB);
        busy.used_memory = 3 * GIB;
        let idle = make_view("idle", 4, 4 * GIB);

        let ranked = spread().rank_and_sort(&mem_config(GIB / 2), vec![&busy, &idle]).unwrap();
        assert_eq!(ranked[0].id, "idle");
    }

    #[test]
    fn spread_breaks_ties_by_container_count() {
        let mut a = make_view("a", 4, GIB);
        a.reserve("x", &ContainerConfig::default());
        let b = make_view("b", 4, GIB);

        let ranked = spread().rank_and_sort(&ContainerConfig::default(), vec![&a, &b]).unwrap();
        assert_eq!(ranked[0].id, "b");
    }

    #[test]
    fn unhealthy_engine_ranks_last() {
        let mut sick = make_view("sick", 4, 4 * GIB);
        sick.health = 10;
        let mut loaded = make_view("loaded", 4, 4 * GIB);
        loaded.used_memory = 3 * GIB;

        let ranked = spread().rank_and_sort(&mem_config(GIB / 2), vec![&sick, &loaded]).unwrap();
        assert_eq!(ranked[0].id, "loaded");
    }

    #[test]
    fn spread_memory_ceiling_is_overcommit() {
        let node = make_view("n", 4, 100 * GIB);

        // Exactly 105% of physical memory fits.
        assert!(spread().rank_and_sort(&mem_config(105 * GIB), vec![&node]).is_ok());

        // One byte more does not.
        let err = spread()
            .rank_and_sort(&mem_config(105 * GIB + 1), vec![&node])
            .unwrap_err();
        assert!(matches!(err, PlacementError::NoCapacity { .. }));
    }

    #[test]
    fn cpu_cannot_be_overcommitted() {
        let node = make_view("n", 2, GIB);
        let config = ContainerConfig {
            cpuset_cpus: "0,1,2".to_string(),
            ..Default::default()
        };
        assert!(spread().rank_and_sort(&config, vec![&node]).is_err());
    }

    #[test]
    fn binpack_prefers_most_loaded() {
        let mut busy = make_view("busy", 4, 4 * GIB);
        busy.used_memory = 2 * GIB;
        let idle = make_view("idle", 4, 4 * GIB);
        let binpack = new_strategy(StrategyName::Binpack, &StrategyOptions::default()).unwrap();

        let ranked = binpack.rank_and_sort(&mem_config(GIB), vec![&idle, &busy]).unwrap();
        assert_eq!(ranked[0].id, "busy");
    }

    #[test]
    fn random_keeps_only_feasible() {
        let small = make_view("small", 4, GIB);
        let big = make_view("big", 4, 8 * GIB);
        let random = new_strategy(StrategyName::Random, &StrategyOptions::default()).unwrap();

        let ranked = random.rank_and_sort(&mem_config(4 * GIB), vec![&small, &big]).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "big");
        assert_eq!(random.name(), "random");
    }

    #[test]
    fn group_ranks_buckets_by_average() {
        let mut a1 = make_view("a1", 4, 4 * GIB);
        a1.labels.insert(CLUSTER_LABEL.to_string(), "a".to_string());
        a1.used_memory = 3 * GIB;
        let mut a2 = make_view("a2", 4, 4 * GIB);
        a2.labels.insert(CLUSTER_LABEL.to_string(), "a".to_string());
        let mut b1 = make_view("b1", 4, 4 * GIB);
        b1.labels.insert(CLUSTER_LABEL.to_string(), "b".to_string());
        b1.used_memory = GIB;

        let group = new_strategy(StrategyName::Group, &StrategyOptions::default()).unwrap();
        let ranked = group
            .rank_and_sort(&mem_config(GIB / 4), vec![&a1, &a2, &b1])
            .unwrap();
        let order: Vec<&str> = ranked.iter().map(|n| n.id.as_str()).collect();
        // Bucket b averages 31% memory, bucket a averages 43%.
        assert_eq!(order, vec!["b1", "a2", "a1"]);
    }

    #[test]
    fn invalid_overcommit_rejected() {
        let options = StrategyOptions { overcommit: 2.0 };
        assert!(new_strategy(StrategyName::Spread, &options).is_err());
    }
}
