//! Datacenter-diversity post-filter over a ranked engine list.

use tracing::debug;

use crate::engine::EngineView;
use crate::error::{PlacementError, PlacementResult};

/// Pick `num` engines from `ranked` spread across datacenters.
///
/// With at least `num` datacenters, the best engine of each datacenter is
/// taken in rank order. With fewer (but at least two), engines are taken
/// round-robin across datacenters, no datacenter supplying more than
/// `num / 2`. A single datacenter never satisfies a multi-unit request.
pub fn select_node_by_cluster<'a>(
    ranked: &[&'a EngineView],
    num: usize,
) -> PlacementResult<Vec<&'a EngineView>> {
    if num == 0 {
        return Ok(Vec::new());
    }

    // Groups in order of their best-ranked engine.
    let mut groups: Vec<(&str, Vec<&'a EngineView>)> = Vec::new();
    for &node in ranked {
        match groups.iter_mut().find(|(dc, _)| *dc == node.datacenter_id) {
            Some((_, members)) => members.push(node),
            None => groups.push((node.datacenter_id.as_str(), vec![node])),
        }
    }

    let not_match = || PlacementError::NotMatch {
        groups: groups.len(),
        needed: num,
    };

    if groups.len() >= num {
        return Ok(groups.iter().take(num).map(|(_, members)| members[0]).collect());
    }
    if groups.len() < 2 {
        return Err(not_match());
    }

    let cap = num / 2;
    let mut taken = vec![0usize; groups.len()];
    let mut selected = Vec::with_capacity(num);
    for round in 0.. {
        let mut progressed = false;
        for (i, (_, members)) in groups.iter().enumerate() {
            if selected.len() == num {
                break;
            }
            if taken[i] < cap && round < members.len() {
                selected.push(members[round]);
                taken[i] += 1;
                progressed = true;
            }
        }
        if selected.len() == num || !progressed {
            break;
        }
    }

    if selected.len() < num {
        debug!(groups = groups.len(), num, cap, got = selected.len(), "diversity cap not met");
        return Err(not_match());
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: &str, dc: &str) -> EngineView {
        EngineView {
            id: id.to_string(),
            datacenter_id: dc.to_string(),
            ..Default::default()
        }
    }

    fn ids(nodes: &[&EngineView]) -> Vec<String> {
        nodes.iter().map(|n| n.id.clone()).collect()
    }

    #[test]
    fn one_per_datacenter_when_enough() {
        let (a1, a2, b1, c1) = (view("A1", "A"), view("A2", "A"), view("B1", "B"), view("C1", "C"));
        let out = select_node_by_cluster(&[&a1, &a2, &b1, &c1], 3).unwrap();
        assert_eq!(ids(&out), vec!["A1", "B1", "C1"]);
    }

    #[test]
    fn round_robin_with_cap() {
        let nodes = [
            view("A1", "A"),
            view("A2", "A"),
            view("A3", "A"),
            view("B1", "B"),
            view("B2", "B"),
        ];
        let refs: Vec<&EngineView> = nodes.iter().collect();
        let out = select_node_by_cluster(&refs, 4).unwrap();
        assert_eq!(ids(&out), vec!["A1", "B1", "A2", "B2"]);
    }

    #[test]
    fn cap_shortfall_is_not_match() {
        let (a1, a2, b1) = (view("A1", "A"), view("A2", "A"), view("B1", "B"));
        // cap = 2, but B only has one engine.
        let err = select_node_by_cluster(&[&a1, &a2, &b1], 4).unwrap_err();
        assert!(matches!(err, PlacementError::NotMatch { groups: 2, needed: 4 }));
    }

    #[test]
    fn single_datacenter_rejected() {
        let (a1, a2) = (view("A1", "A"), view("A2", "A"));
        assert!(select_node_by_cluster(&[&a1, &a2], 2).is_err());
        assert_eq!(select_node_by_cluster(&[&a1, &a2], 1).unwrap().len(), 1);
    }
}
