//! Clustering back-ends. Each maps a feature matrix (one row per capture) to raw labels.

mod affinity;
mod birch;
mod optics;
mod spectral;

pub(crate) use affinity::AffinityPropagationBackend;
pub(crate) use birch::BirchBackend;
pub(crate) use optics::OpticsBackend;
pub(crate) use spectral::SpectralBackend;

use super::estimate;
use crate::error::ClusteringError;
use linfa::traits::{Fit, Predict, Transformer};
use linfa::{DatasetBase, ParamGuard};
use linfa_clustering::{Dbscan, KMeans};
use ndarray::Array2;
use std::collections::HashMap;

/// Label given to rows no cluster claims.
pub const NOISE: i64 = -1;

pub trait ClusteringBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// One label per row. `k` is the target count; unsupervised back-ends may ignore it.
    fn fit_predict(&self, data: &Array2<f64>, k: usize) -> Result<Vec<i64>, ClusteringError>;
}

pub(crate) fn backend_error(strategy: &'static str, e: impl std::fmt::Display) -> ClusteringError {
    ClusteringError::Backend {
        strategy,
        reason: e.to_string(),
    }
}

/// Label per row by identical content, in first-appearance order.
pub(crate) fn distinct_rows(data: &Array2<f64>) -> (Vec<i64>, usize) {
    let mut seen: HashMap<Vec<u64>, i64> = HashMap::new();
    let labels = data
        .rows()
        .into_iter()
        .map(|row| {
            let key: Vec<u64> = row.iter().map(|v| v.to_bits()).collect();
            let next = seen.len() as i64;
            *seen.entry(key).or_insert(next)
        })
        .collect();
    (labels, seen.len())
}

/// Noise becomes label 0; every other label moves up by one.
pub fn shift_noise(labels: &mut [i64]) {
    if labels.contains(&NOISE) {
        for l in labels.iter_mut() {
            *l += 1;
        }
    }
}

/// Fixed-k partitioning over linfa's KMeans (deterministic seed).
#[derive(Debug, Clone)]
pub struct KMeansBackend {
    pub max_iterations: u64,
    pub tolerance: f64,
}

impl Default for KMeansBackend {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            tolerance: 1e-4,
        }
    }
}

impl ClusteringBackend for KMeansBackend {
    fn name(&self) -> &'static str {
        "K-means"
    }

    fn fit_predict(&self, data: &Array2<f64>, k: usize) -> Result<Vec<i64>, ClusteringError> {
        let (distinct, count) = distinct_rows(data);
        if k <= 1 {
            return Ok(vec![0; data.nrows()]);
        }
        if count <= k {
            // not enough distinct points for k centroids
            return Ok(distinct);
        }

        let dataset = DatasetBase::from(data.clone());
        let model: KMeans<f64, _> = KMeans::params(k)
            .max_n_iterations(self.max_iterations)
            .tolerance(self.tolerance)
            .fit(&dataset)
            .map_err(|e| backend_error(self.name(), e))?;
        let labels = model.predict(data);
        Ok(labels.iter().map(|l| *l as i64).collect())
    }
}

/// Density clustering over linfa's DBSCAN with both parameters estimated from the data.
#[derive(Debug, Clone)]
pub struct DbscanBackend {
    /// Candidate minimum-samples values swept by validity score
    pub min_samples: std::ops::RangeInclusive<usize>,
}

impl Default for DbscanBackend {
    fn default() -> Self {
        Self { min_samples: 2..=29 }
    }
}

impl DbscanBackend {
    fn run(&self, data: &Array2<f64>, eps: f64, min_samples: usize) -> Result<Vec<i64>, ClusteringError> {
        let memberships = Dbscan::params(min_samples)
            .tolerance(eps)
            .check()
            .map_err(|e| backend_error(self.name(), e))?
            .transform(data);
        Ok(memberships
            .iter()
            .map(|m| m.map_or(NOISE, |c| c as i64))
            .collect())
    }
}

impl ClusteringBackend for DbscanBackend {
    fn name(&self) -> &'static str {
        "DBSCAN"
    }

    fn fit_predict(&self, data: &Array2<f64>, _k: usize) -> Result<Vec<i64>, ClusteringError> {
        let eps = estimate::estimate_eps(data);
        let mut failure = None;
        let min_samples = estimate::best_by_score(self.min_samples.clone(), |m| {
            match self.run(data, eps, m) {
                Ok(labels) => estimate::calinski_harabasz(data, &labels),
                Err(e) => {
                    failure.get_or_insert(e);
                    None
                }
            }
        })
        .unwrap_or(2);
        if let Some(e) = failure {
            return Err(e);
        }
        tracing::debug!(eps, min_samples, "DBSCAN parameters estimated");
        self.run(data, eps, min_samples)
    }
}
