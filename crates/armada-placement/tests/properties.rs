//! Property tests for datacenter diversity and the spread memory ceiling.

use std::collections::{HashMap, HashSet};

use armada_core::StrategyName;
use armada_placement::{
    ContainerConfig, EngineView, HEALTH_MAX, StrategyOptions, new_strategy, select_node_by_cluster,
};
use proptest::prelude::*;

fn views(dcs: &[u8]) -> Vec<EngineView> {
    dcs.iter()
        .enumerate()
        .map(|(i, dc)| EngineView {
            id: format!("e{i}"),
            datacenter_id: format!("dc{dc}"),
            ..Default::default()
        })
        .collect()
}

proptest! {
    #[test]
    fn diversity_invariant(dcs in prop::collection::vec(0u8..5, 0..24), num in 1usize..8) {
        let engines = views(&dcs);
        let refs: Vec<&EngineView> = engines.iter().collect();
        let groups: HashSet<&str> = engines.iter().map(|e| e.datacenter_id.as_str()).collect();
        let g = groups.len();

        match select_node_by_cluster(&refs, num) {
            Ok(picked) => {
                prop_assert_eq!(picked.len(), num);
                let mut per_dc: HashMap<&str, usize> = HashMap::new();
                for e in &picked {
                    *per_dc.entry(e.datacenter_id.as_str()).or_default() += 1;
                }
                if g >= num {
                    prop_assert!(per_dc.values().all(|c| *c == 1));
                } else {
                    prop_assert!(g >= 2);
                    prop_assert!(per_dc.values().all(|c| *c <= num / 2));
                }
                let unique: HashSet<&str> = picked.iter().map(|e| e.id.as_str()).collect();
                prop_assert_eq!(unique.len(), num);
            }
            Err(_) => prop_assert!(g < num),
        }
        if g < 2 && g < num {
            prop_assert!(select_node_by_cluster(&refs, num).is_err());
        }
    }

    #[test]
    fn spread_accepts_up_to_105_percent(k in 1u64..100_000) {
        let total = k * 20 * 1024;
        let node = EngineView {
            id: "n".to_string(),
            total_cpus: 1,
            total_memory: total,
            health: HEALTH_MAX,
            ..Default::default()
        };
        let spread = new_strategy(StrategyName::Spread, &StrategyOptions::default()).unwrap();
        let at_ceiling = ContainerConfig { memory: total * 105 / 100, ..Default::default() };
        let above = ContainerConfig { memory: total * 105 / 100 + 1, ..Default::default() };

        prop_assert!(spread.rank_and_sort(&at_ceiling, vec![&node]).is_ok());
        prop_assert!(spread.rank_and_sort(&above, vec![&node]).is_err());
    }
}
