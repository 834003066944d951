//! Affinity propagation: exemplars chosen by message passing over negative squared distances.

use super::ClusteringBackend;
use crate::clustering::estimate::{median, sq_dist};
use crate::error::ClusteringError;
use ndarray::Array2;

#[derive(Debug, Clone)]
pub struct AffinityPropagationBackend {
    pub damping: f64,
    pub max_iterations: usize,
    /// Iterations with an unchanged exemplar set before stopping
    pub convergence: usize,
}

impl Default for AffinityPropagationBackend {
    fn default() -> Self {
        Self {
            damping: 0.5,
            max_iterations: 200,
            convergence: 15,
        }
    }
}

impl AffinityPropagationBackend {
    fn exemplars(&self, s: &Array2<f64>) -> Vec<usize> {
        let n = s.nrows();
        let mut r = Array2::<f64>::zeros((n, n));
        let mut a = Array2::<f64>::zeros((n, n));
        let mut previous: Vec<bool> = Vec::new();
        let mut stable = 0;

        for _ in 0..self.max_iterations {
            // responsibilities
            for i in 0..n {
                let mut first = (f64::NEG_INFINITY, 0usize);
                let mut second = f64::NEG_INFINITY;
                for k in 0..n {
                    let v = a[[i, k]] + s[[i, k]];
                    if v > first.0 {
                        second = first.0;
                        first = (v, k);
                    } else if v > second {
                        second = v;
                    }
                }
                for k in 0..n {
                    let competitor = if k == first.1 { second } else { first.0 };
                    let fresh = s[[i, k]] - competitor;
                    r[[i, k]] = self.damping * r[[i, k]] + (1.0 - self.damping) * fresh;
                }
            }

            // availabilities
            for k in 0..n {
                let support: f64 = (0..n)
                    .map(|i| if i == k { r[[k, k]] } else { r[[i, k]].max(0.0) })
                    .sum();
                for i in 0..n {
                    let own = if i == k { r[[k, k]] } else { r[[i, k]].max(0.0) };
                    let fresh = if i == k {
                        support - own
                    } else {
                        (support - own).min(0.0)
                    };
                    a[[i, k]] = self.damping * a[[i, k]] + (1.0 - self.damping) * fresh;
                }
            }

            let current: Vec<bool> = (0..n).map(|k| a[[k, k]] + r[[k, k]] > 0.0).collect();
            if current == previous && current.iter().any(|e| *e) {
                stable += 1;
                if stable >= self.convergence {
                    break;
                }
            } else {
                stable = 0;
            }
            previous = current;
        }

        previous
            .iter()
            .enumerate()
            .filter_map(|(k, e)| e.then_some(k))
            .collect()
    }
}

impl ClusteringBackend for AffinityPropagationBackend {
    fn name(&self) -> &'static str {
        "Affinity propagation"
    }

    fn fit_predict(&self, data: &Array2<f64>, _k: usize) -> Result<Vec<i64>, ClusteringError> {
        let n = data.nrows();
        let mut s = Array2::<f64>::zeros((n, n));
        let mut off_diagonal = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    let v = -sq_dist(data.row(i), data.row(j));
                    s[[i, j]] = v;
                    off_diagonal.push(v);
                }
            }
        }
        let preference = median(&off_diagonal).unwrap_or(0.0);
        for i in 0..n {
            s[[i, i]] = preference;
        }

        let exemplars = self.exemplars(&s);
        if exemplars.is_empty() {
            // no exemplar emerged: one group
            return Ok(vec![0; n]);
        }
        tracing::debug!(exemplars = exemplars.len(), "affinity propagation converged");

        let labels = (0..n)
            .map(|i| {
                if let Some(pos) = exemplars.iter().position(|e| *e == i) {
                    return pos as i64;
                }
                exemplars
                    .iter()
                    .enumerate()
                    .max_by(|(_, &x), (_, &y)| s[[i, x]].total_cmp(&s[[i, y]]).then(y.cmp(&x)))
                    .map_or(0, |(pos, _)| pos as i64)
            })
            .collect();
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn one_exemplar_per_tight_group() {
        let data = array![
            [0.0, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [8.0, 8.0],
            [8.1, 8.0],
            [8.0, 8.1],
        ];
        let labels = AffinityPropagationBackend::default().fit_predict(&data, 2).unwrap();
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn every_row_labelled() {
        let data = array![[1.0], [2.0], [3.0], [50.0]];
        let labels = AffinityPropagationBackend::default().fit_predict(&data, 2).unwrap();
        assert_eq!(labels.len(), 4);
        assert!(labels.iter().all(|l| *l >= 0));
    }
}
