//! OPTICS reachability ordering (linfa) with DBSCAN-style extraction at the knee.

use super::{backend_error, ClusteringBackend, NOISE};
use crate::clustering::estimate::radius_from_curve;
use crate::error::ClusteringError;
use linfa::traits::Transformer;
use linfa::ParamGuard;
use linfa_clustering::Optics;
use ndarray::Array2;

#[derive(Debug, Clone)]
pub struct OpticsBackend {
    /// Neighbourhood size including the point itself
    pub min_samples: usize,
}

impl Default for OpticsBackend {
    fn default() -> Self {
        Self { min_samples: 2 }
    }
}

/// Per-row distances, infinite where undefined.
pub(crate) struct Reachability {
    pub ordering: Vec<usize>,
    pub reachability: Vec<f64>,
    pub core: Vec<f64>,
}

impl OpticsBackend {
    pub(crate) fn reachability(&self, data: &Array2<f64>) -> Result<Reachability, ClusteringError> {
        let n = data.nrows();
        let mut r = Reachability {
            ordering: Vec::with_capacity(n),
            reachability: vec![f64::INFINITY; n],
            core: vec![f64::INFINITY; n],
        };
        if n == 0 {
            return Ok(r);
        }

        let analysis = Optics::params(self.min_samples)
            .check()
            .map_err(|e| backend_error(self.name(), e))?
            .transform(data.view());
        for sample in analysis.iter() {
            let i = sample.index();
            r.ordering.push(i);
            r.reachability[i] = sample.reachability_distance().unwrap_or(f64::INFINITY);
            r.core[i] = sample.core_distance().unwrap_or(f64::INFINITY);
        }
        // the walk starts without a predecessor
        if let Some(&first) = r.ordering.first() {
            r.reachability[first] = f64::INFINITY;
        }
        Ok(r)
    }
}

/// Labels from a reachability plot cut at `eps`.
pub(crate) fn extract_at(r: &Reachability, eps: f64) -> Vec<i64> {
    let mut labels = vec![NOISE; r.core.len()];
    let mut cluster = -1i64;
    for &p in &r.ordering {
        if r.reachability[p] > eps {
            if r.core[p] <= eps {
                cluster += 1;
                labels[p] = cluster;
            }
        } else if cluster >= 0 {
            labels[p] = cluster;
        }
    }
    labels
}

impl ClusteringBackend for OpticsBackend {
    fn name(&self) -> &'static str {
        "OPTICS"
    }

    fn fit_predict(&self, data: &Array2<f64>, _k: usize) -> Result<Vec<i64>, ClusteringError> {
        let r = self.reachability(data)?;
        let mut curve: Vec<f64> = r
            .reachability
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        curve.sort_by(f64::total_cmp);
        let eps = radius_from_curve(&curve);
        tracing::debug!(eps, "OPTICS extraction radius");
        Ok(extract_at(&r, eps))
    }
}
