//! Spectral partitioning: RBF affinity, normalized, top-k eigenvectors, KMeans on the embedding.

use super::{ClusteringBackend, KMeansBackend};
use crate::clustering::estimate::{median, sq_dist};
use crate::error::ClusteringError;
use ndarray::{Array2, Axis};

#[derive(Debug, Clone)]
pub struct SpectralBackend {
    pub iterations: usize,
    pub tolerance: f64,
}

impl Default for SpectralBackend {
    fn default() -> Self {
        Self {
            iterations: 500,
            tolerance: 1e-9,
        }
    }
}

/// exp(-gamma * |xi - xj|^2) with gamma from the median squared distance
fn rbf_affinity(data: &Array2<f64>) -> Array2<f64> {
    let n = data.nrows();
    let mut sq = Array2::zeros((n, n));
    let mut positive = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            let d = sq_dist(data.row(i), data.row(j));
            sq[[i, j]] = d;
            sq[[j, i]] = d;
            if d > 0.0 {
                positive.push(d);
            }
        }
    }
    let gamma = median(&positive).map_or(1.0, |m| 1.0 / m);
    sq.mapv(|d| (-gamma * d).exp())
}

/// D^-1/2 A D^-1/2, shifted by the identity so the spectrum is non-negative.
fn shifted_normalized(affinity: &Array2<f64>) -> Array2<f64> {
    let degree = affinity.sum_axis(Axis(1)).mapv(|d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 });
    let n = affinity.nrows();
    let mut m = affinity.clone();
    for i in 0..n {
        for j in 0..n {
            m[[i, j]] *= degree[i] * degree[j];
        }
        m[[i, i]] += 1.0;
    }
    m
}

/// Gram–Schmidt on the columns; a collapsed column is replaced by a unit vector.
fn orthonormalize(q: &mut Array2<f64>) {
    let (n, k) = q.dim();
    for j in 0..k {
        for p in 0..j {
            let dot: f64 = (0..n).map(|i| q[[i, j]] * q[[i, p]]).sum();
            for i in 0..n {
                q[[i, j]] -= dot * q[[i, p]];
            }
        }
        let norm = (0..n).map(|i| q[[i, j]] * q[[i, j]]).sum::<f64>().sqrt();
        if norm > 1e-12 {
            for i in 0..n {
                q[[i, j]] /= norm;
            }
        } else {
            for i in 0..n {
                q[[i, j]] = if i == j % n { 1.0 } else { 0.0 };
            }
        }
    }
}

impl SpectralBackend {
    /// Leading `k` eigenvectors of a symmetric PSD matrix by subspace iteration.
    fn leading_eigenvectors(&self, m: &Array2<f64>, k: usize) -> Array2<f64> {
        let n = m.nrows();
        // deterministic, non-degenerate start
        let mut q = Array2::from_shape_fn((n, k), |(i, j)| {
            1.0 + ((i * 31 + j * 17) % 23) as f64 / 23.0 + if i == j { 1.0 } else { 0.0 }
        });
        orthonormalize(&mut q);
        for _ in 0..self.iterations {
            let mut next = m.dot(&q);
            orthonormalize(&mut next);
            let delta = (&next - &q).mapv(f64::abs).fold(0.0f64, |a, b| a.max(*b));
            q = next;
            if delta < self.tolerance {
                break;
            }
        }
        q
    }
}

impl ClusteringBackend for SpectralBackend {
    fn name(&self) -> &'static str {
        "Spectral clustering"
    }

    fn fit_predict(&self, data: &Array2<f64>, k: usize) -> Result<Vec<i64>, ClusteringError> {
        let n = data.nrows();
        if k <= 1 || n <= k {
            return KMeansBackend::default().fit_predict(data, k);
        }
        let m = shifted_normalized(&rbf_affinity(data));
        let mut embedding = self.leading_eigenvectors(&m, k);
        for mut row in embedding.rows_mut() {
            let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                row.mapv_inplace(|v| v / norm);
            }
        }
        KMeansBackend::default()
            .fit_predict(&embedding, k)
            .map_err(|e| ClusteringError::Backend {
                strategy: self.name(),
                reason: e.to_string(),
            })
    }
}
