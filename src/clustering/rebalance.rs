//! Forcing a raw labelling into exactly `k` groups of similar packet weight.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportCluster {
    pub label: i64,
    /// Total packets of the cluster's captures
    pub weight: u64,
}

/// Weight per label, in first-appearance order.
pub fn aggregate(labels: &[i64], weights: &[u64]) -> Vec<SupportCluster> {
    let mut out: Vec<SupportCluster> = Vec::new();
    for (label, weight) in labels.iter().zip(weights) {
        match out.iter_mut().find(|c| c.label == *label) {
            Some(c) => c.weight += weight,
            None => out.push(SupportCluster {
                label: *label,
                weight: *weight,
            }),
        }
    }
    out
}

pub fn distinct(labels: &[i64]) -> usize {
    labels.iter().collect::<BTreeSet<_>>().len()
}

/// Move members onto fresh labels until `k` labels exist. The most populous
/// label gives up its last member each round. Requires `labels.len() >= k`.
pub fn split_to_fill(labels: &mut [i64], k: usize) {
    while distinct(labels) < k {
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for l in labels.iter() {
            *counts.entry(*l).or_default() += 1;
        }
        let Some((&donor, &size)) = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        else {
            return;
        };
        if size < 2 {
            return;
        }
        let fresh = labels.iter().copied().max().unwrap_or(0) + 1;
        if let Some(last) = labels.iter_mut().rev().find(|l| **l == donor) {
            *last = fresh;
        }
    }
}

/// Greedy grouping of more than `k` clusters into `k` groups.
///
/// Clusters are sorted by weight (heaviest first) and the `k` heaviest seed
/// the groups. Each group in turn takes the remaining cluster that brings it
/// closest to `total / k`, as long as that strictly reduces its distance.
/// Whatever is left is absorbed, heaviest first, by the group whose distance
/// after absorption is smallest.
pub fn balance(mut clusters: Vec<SupportCluster>, k: usize) -> Vec<Vec<SupportCluster>> {
    if k == 0 {
        return Vec::new();
    }
    let total: u64 = clusters.iter().map(|c| c.weight).sum();
    let target = total as f64 / k as f64;
    let distance = |size: u64| (target - size as f64).abs();

    // stable: equal weights keep first-appearance order
    clusters.sort_by(|a, b| b.weight.cmp(&a.weight));
    let seeds = k.min(clusters.len());
    let mut pool = clusters.split_off(seeds);
    let mut groups: Vec<Vec<SupportCluster>> = clusters.into_iter().map(|c| vec![c]).collect();
    let mut sizes: Vec<u64> = groups.iter().map(|g| g[0].weight).collect();

    for (group, size) in groups.iter_mut().zip(sizes.iter_mut()) {
        let mut current = distance(*size);
        while !pool.is_empty() {
            let (pick, after) = pool
                .iter()
                .enumerate()
                .map(|(i, c)| (i, distance(*size + c.weight)))
                .fold((0, f64::INFINITY), |best, cand| if cand.1 < best.1 { cand } else { best });
            if after < current {
                let c = pool.remove(pick);
                *size += c.weight;
                group.push(c);
                current = after;
            } else {
                break;
            }
        }
    }

    for leftover in pool {
        let target_group = sizes
            .iter()
            .enumerate()
            .map(|(g, s)| (g, distance(*s + leftover.weight)))
            .fold((0, f64::INFINITY), |best, cand| if cand.1 < best.1 { cand } else { best })
            .0;
        sizes[target_group] += leftover.weight;
        groups[target_group].push(leftover);
    }
    groups
}

/// Raw label → final group index.
pub fn group_index(groups: &[Vec<SupportCluster>]) -> HashMap<i64, usize> {
    groups
        .iter()
        .enumerate()
        .flat_map(|(g, members)| members.iter().map(move |c| (c.label, g)))
        .collect()
}

/// One-to-one mapping in ascending label order, used when there are exactly `k` labels.
pub fn ascending_index(clusters: &[SupportCluster]) -> HashMap<i64, usize> {
    let sorted: BTreeSet<i64> = clusters.iter().map(|c| c.label).collect();
    sorted.into_iter().enumerate().map(|(i, l)| (l, i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clusters(weights: &[u64]) -> Vec<SupportCluster> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| SupportCluster {
                label: i as i64,
                weight: *w,
            })
            .collect()
    }

    fn weights(group: &[SupportCluster]) -> Vec<u64> {
        group.iter().map(|c| c.weight).collect()
    }

    #[test]
    fn aggregate_sums_per_label_in_first_seen_order() {
        let agg = aggregate(&[3, 1, 3, 0], &[10, 5, 7, 1]);
        assert_eq!(
            agg,
            vec![
                SupportCluster { label: 3, weight: 17 },
                SupportCluster { label: 1, weight: 5 },
                SupportCluster { label: 0, weight: 1 },
            ]
        );
    }

    #[test]
    fn heaviest_clusters_seed_groups() {
        let groups = balance(clusters(&[10, 40, 30, 50, 20]), 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].weight, 50);
        assert_eq!(groups[1][0].weight, 40);
        assert_eq!(weights(&groups[0]), vec![50, 30]);
        assert_eq!(weights(&groups[1]), vec![40, 20, 10]);
    }

    #[test]
    fn greedy_growth_never_moves_away_from_target() {
        let target = 75.0;
        let groups = balance(clusters(&[50, 40, 30, 20, 10]), 2);
        for group in &groups {
            let mut size = 0u64;
            let mut previous = f64::INFINITY;
            for c in group {
                size += c.weight;
                let d = (target - size as f64).abs();
                assert!(d < previous || previous.is_infinite());
                previous = d;
            }
        }
    }

    #[test]
    fn leftovers_are_absorbed() {
        // neither seed improves by taking the 9; it is absorbed afterwards
        let groups = balance(clusters(&[10, 10, 9]), 2);
        assert_eq!(weights(&groups[0]), vec![10, 9]);
        assert_eq!(weights(&groups[1]), vec![10]);
        let index = group_index(&groups);
        assert_eq!(index.len(), 3);
        assert_eq!(index[&2], 0);
    }

    #[test]
    fn split_to_fill_reaches_k() {
        let mut labels = vec![0, 0, 0, 1];
        split_to_fill(&mut labels, 3);
        assert_eq!(labels, vec![0, 0, 2, 1]);
        assert_eq!(distinct(&labels), 3);

        let mut single = vec![5, 5, 5];
        split_to_fill(&mut single, 3);
        assert_eq!(distinct(&single), 3);
    }

    #[test]
    fn ascending_index_orders_labels() {
        let mut reversed = clusters(&[1, 1, 1]);
        reversed.reverse();
        let idx = ascending_index(&reversed);
        assert_eq!(idx[&0], 0);
        assert_eq!(idx[&2], 2);
    }
}
