//! Birch-style composite: clustering-feature subclusters, then Ward merging down to k.

use super::ClusteringBackend;
use crate::clustering::estimate::sq_dist;
use crate::error::ClusteringError;
use ndarray::{Array1, Array2, Axis};

#[derive(Debug, Clone)]
pub struct BirchBackend {
    /// Maximum subcluster radius on standardized rows
    pub threshold: f64,
}

impl Default for BirchBackend {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

/// Clustering feature: count, linear sum, squared sum.
#[derive(Debug, Clone)]
struct Feature {
    n: f64,
    ls: Array1<f64>,
    ss: f64,
}

impl Feature {
    fn new(row: ndarray::ArrayView1<f64>) -> Self {
        Self {
            n: 1.0,
            ls: row.to_owned(),
            ss: row.dot(&row),
        }
    }

    fn centroid(&self) -> Array1<f64> {
        &self.ls / self.n
    }

    /// Radius if `row` were absorbed.
    fn radius_with(&self, row: ndarray::ArrayView1<f64>) -> f64 {
        let n = self.n + 1.0;
        let ls = &self.ls + &row;
        let ss = self.ss + row.dot(&row);
        (ss / n - ls.dot(&ls) / (n * n)).max(0.0).sqrt()
    }

    fn absorb(&mut self, row: ndarray::ArrayView1<f64>) {
        self.n += 1.0;
        self.ls += &row;
        self.ss += row.dot(&row);
    }
}

/// Zero mean, unit variance per column; constant columns become zero.
fn standardize(data: &Array2<f64>) -> Array2<f64> {
    let Some(mean) = data.mean_axis(Axis(0)) else {
        return data.clone();
    };
    let std = data.std_axis(Axis(0), 0.0);
    let mut out = data - &mean;
    for (mut col, s) in out.columns_mut().into_iter().zip(std.iter()) {
        if *s > 0.0 {
            col.mapv_inplace(|v| v / s);
        } else {
            col.fill(0.0);
        }
    }
    out
}

/// Ward agglomeration of weighted centroids into at most `k` groups.
fn ward(centroids: &[Array1<f64>], weights: &[f64], k: usize) -> Vec<usize> {
    let mut groups: Vec<(Vec<usize>, Array1<f64>, f64)> = centroids
        .iter()
        .zip(weights)
        .enumerate()
        .map(|(i, (c, w))| (vec![i], c.clone(), *w))
        .collect();

    while groups.len() > k.max(1) {
        let mut best = (f64::INFINITY, 0, 1);
        for a in 0..groups.len() {
            for b in (a + 1)..groups.len() {
                let (wa, wb) = (groups[a].2, groups[b].2);
                let cost = wa * wb / (wa + wb) * sq_dist(groups[a].1.view(), groups[b].1.view());
                if cost < best.0 {
                    best = (cost, a, b);
                }
            }
        }
        let (_, a, b) = best;
        let (members, centroid, weight) = groups.remove(b);
        let target = &mut groups[a];
        let total = target.2 + weight;
        target.1 = (&target.1 * target.2 + &centroid * weight) / total;
        target.2 = total;
        target.0.extend(members);
    }

    let mut label = vec![0; centroids.len()];
    for (g, (members, _, _)) in groups.iter().enumerate() {
        for m in members {
            label[*m] = g;
        }
    }
    label
}

impl ClusteringBackend for BirchBackend {
    fn name(&self) -> &'static str {
        "Birch"
    }

    fn fit_predict(&self, data: &Array2<f64>, k: usize) -> Result<Vec<i64>, ClusteringError> {
        let rows = standardize(data);
        let mut features: Vec<Feature> = Vec::new();
        let mut assignment = Vec::with_capacity(rows.nrows());

        for row in rows.rows() {
            let nearest = features
                .iter()
                .enumerate()
                .map(|(i, f)| (i, sq_dist(f.centroid().view(), row)))
                .min_by(|a, b| a.1.total_cmp(&b.1));
            match nearest {
                Some((i, _)) if features[i].radius_with(row) <= self.threshold => {
                    features[i].absorb(row);
                    assignment.push(i);
                }
                _ => {
                    assignment.push(features.len());
                    features.push(Feature::new(row));
                }
            }
        }

        let centroids: Vec<Array1<f64>> = features.iter().map(Feature::centroid).collect();
        let weights: Vec<f64> = features.iter().map(|f| f.n).collect();
        let group = ward(&centroids, &weights, k);
        tracing::debug!(subclusters = features.len(), "birch subclusters merged");
        Ok(assignment.iter().map(|s| group[*s] as i64).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn ward_merges_nearest_first() {
        let centroids = vec![array![0.0], array![1.0], array![10.0]];
        assert_eq!(ward(&centroids, &[1.0, 1.0, 1.0], 2), vec![0, 0, 1]);
        assert_eq!(ward(&centroids, &[1.0, 1.0, 1.0], 5), vec![0, 1, 2]);
    }

    #[test]
    fn standardized_constant_columns_are_zero() {
        let s = standardize(&array![[1.0, 5.0], [3.0, 5.0]]);
        assert_eq!(s, array![[-1.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn produces_k_groups_for_separated_data() {
        let data = array![[0.0, 0.0], [0.1, 0.1], [9.0, 9.0], [9.1, 9.1], [20.0, 0.0], [20.1, 0.0]];
        let labels = BirchBackend::default().fit_predict(&data, 3).unwrap();
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], labels[3]);
        assert_eq!(labels[4], labels[5]);
        let mut distinct = labels.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
    }
}
