//! Clustering captures into one group per host pair.

pub mod backends;
pub(crate) mod estimate;
pub mod rebalance;

pub use backends::{ClusteringBackend, DbscanBackend, KMeansBackend, NOISE};

use crate::error::{ConfigurationError, TestbedError};
use crate::features::{FeatureVector, FEATURE_COUNT};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Unordered pair of emulated host names.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct HostPair(pub String, pub String);

impl HostPair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self(a.into(), b.into())
    }

    fn sorted(&self) -> (&str, &str) {
        if self.0 <= self.1 {
            (&self.0, &self.1)
        } else {
            (&self.1, &self.0)
        }
    }
}

impl PartialEq for HostPair {
    fn eq(&self, other: &Self) -> bool {
        self.sorted() == other.sorted()
    }
}

impl Hash for HostPair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sorted().hash(state);
    }
}

impl fmt::Display for HostPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.0, self.1)
    }
}

/// Outcome for one capture of a clustering run.
#[derive(Debug, Clone, Serialize)]
pub struct ClusteringResult {
    pub path: PathBuf,
    pub features: Arc<FeatureVector>,
    /// Final group index, `0..k`
    pub cluster: Option<usize>,
    /// Label before rebalancing (noise already shifted)
    pub raw_cluster: Option<i64>,
    pub host_pair: Option<HostPair>,
}

impl ClusteringResult {
    fn new(path: PathBuf, features: Arc<FeatureVector>) -> Self {
        Self {
            path,
            features,
            cluster: None,
            raw_cluster: None,
            host_pair: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    KMeans,
    Spectral,
    Dbscan,
    Optics,
    AffinityPropagation,
    Birch,
}

impl Strategy {
    pub const ALL: [Strategy; 6] = [
        Strategy::KMeans,
        Strategy::Spectral,
        Strategy::Dbscan,
        Strategy::Optics,
        Strategy::AffinityPropagation,
        Strategy::Birch,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::KMeans => "K-means",
            Strategy::Spectral => "Spectral clustering",
            Strategy::Dbscan => "DBSCAN",
            Strategy::Optics => "OPTICS",
            Strategy::AffinityPropagation => "Affinity propagation",
            Strategy::Birch => "Birch",
        }
    }

    /// Back-end for this strategy with its default parameters.
    pub fn backend(self) -> Box<dyn ClusteringBackend> {
        match self {
            Strategy::KMeans => Box::new(KMeansBackend::default()),
            Strategy::Spectral => Box::new(backends::SpectralBackend::default()),
            Strategy::Dbscan => Box::new(DbscanBackend::default()),
            Strategy::Optics => Box::new(backends::OpticsBackend::default()),
            Strategy::AffinityPropagation => {
                Box::new(backends::AffinityPropagationBackend::default())
            }
            Strategy::Birch => Box::new(backends::BirchBackend::default()),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let strategy = match lower.as_str() {
            "k-means" | "kmeans" => Strategy::KMeans,
            "spectral clustering" | "spectral" => Strategy::Spectral,
            "dbscan" => Strategy::Dbscan,
            "optics" => Strategy::Optics,
            "affinity propagation" | "affinity" => Strategy::AffinityPropagation,
            "birch" => Strategy::Birch,
            _ => return Err(ConfigurationError::UnknownStrategy(s.to_string())),
        };
        Ok(strategy)
    }
}

/// At most one retry with fixed-k partitioning when a strategy under-produces.
const MAX_RETRIES: usize = 1;

#[derive(Debug, Default)]
pub struct ClusteringEngine {
    results: Vec<ClusteringResult>,
    host_pairs: BTreeMap<usize, HostPair>,
}

impl ClusteringEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the working set; previous assignments are dropped.
    pub fn update_features(&mut self, features: BTreeMap<PathBuf, Arc<FeatureVector>>) {
        self.results = features
            .into_iter()
            .map(|(path, fv)| ClusteringResult::new(path, fv))
            .collect();
    }

    pub fn update_host_pairs(&mut self, pairs: BTreeMap<usize, HostPair>) {
        self.host_pairs = pairs;
    }

    pub fn host_pairs(&self) -> &BTreeMap<usize, HostPair> {
        &self.host_pairs
    }

    pub fn results(&self) -> &[ClusteringResult] {
        &self.results
    }

    /// Cluster every capture into exactly one group per host pair.
    pub fn start(
        &mut self,
        strategy: Strategy,
        restart: bool,
    ) -> Result<&[ClusteringResult], TestbedError> {
        if self.results.is_empty() {
            return Err(ConfigurationError::NoCaptures.into());
        }
        if self.host_pairs.is_empty() {
            return Err(ConfigurationError::NoHostPairs.into());
        }
        let k = self.host_pairs.len();
        let n = self.results.len();
        if n < k {
            return Err(ConfigurationError::TooFewCaptures {
                captures: n,
                pairs: k,
            }
            .into());
        }
        if !restart && self.results.iter().all(|r| r.cluster.is_some()) {
            return Ok(&self.results);
        }

        let data = self.matrix();
        let weights: Vec<u64> = self.results.iter().map(|r| r.features.packet_count()).collect();

        let mut labels = strategy.backend().fit_predict(&data, k)?;
        backends::shift_noise(&mut labels);

        let mut retries = 0;
        while rebalance::distinct(&labels) < k && retries < MAX_RETRIES {
            tracing::info!(
                strategy = %strategy,
                found = rebalance::distinct(&labels),
                k,
                "too few clusters; retrying with K-means"
            );
            labels = KMeansBackend::default().fit_predict(&data, k)?;
            retries += 1;
        }
        if rebalance::distinct(&labels) < k {
            rebalance::split_to_fill(&mut labels, k);
        }

        let clusters = rebalance::aggregate(&labels, &weights);
        let mapping: HashMap<i64, usize> = if clusters.len() == k {
            rebalance::ascending_index(&clusters)
        } else {
            rebalance::group_index(&rebalance::balance(clusters, k))
        };

        let pairs: Vec<&HostPair> = self.host_pairs.values().collect();
        for (result, label) in self.results.iter_mut().zip(&labels) {
            let cluster = mapping.get(label).copied().unwrap_or(0);
            result.raw_cluster = Some(*label);
            result.cluster = Some(cluster);
            result.host_pair = pairs.get(cluster).map(|p| (*p).clone());
        }
        tracing::info!(strategy = %strategy, captures = n, k, "clustering done");
        Ok(&self.results)
    }

    fn matrix(&self) -> Array2<f64> {
        let mut data = Array2::zeros((self.results.len(), FEATURE_COUNT));
        for (mut row, result) in data.rows_mut().into_iter().zip(&self.results) {
            for (cell, v) in row.iter_mut().zip(result.features.iter()) {
                *cell = v.1;
            }
        }
        data
    }
}
