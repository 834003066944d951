//! Batch runner: extraction plus every requested clustering strategy on a
//! blocking worker, reporting progress over a channel.

use crate::clustering::{ClusteringEngine, ClusteringResult, HostPair, Strategy};
use crate::config::TestbedConfig;
use crate::error::{ConfigurationError, TestbedError};
use crate::features::{DeepExtractOptions, FeatureExtractor, SplitBackend, Splitter};
use crate::tools::ToolRunner;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub captures: Vec<PathBuf>,
    pub options: DeepExtractOptions,
    pub strategies: Vec<Strategy>,
    pub host_pairs: BTreeMap<usize, HostPair>,
    pub splitter: Splitter,
}

impl BatchRequest {
    pub fn from_config(
        config: &TestbedConfig,
        tools: Arc<dyn ToolRunner>,
    ) -> Result<Self, ConfigurationError> {
        let strategies = config
            .clustering
            .strategies
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<Strategy>, _>>()?;
        let splitter = match config.features.splitter {
            SplitBackend::External => Splitter::external(config.tools.splitter.clone(), tools),
            SplitBackend::Native => Splitter::native(),
        };
        Ok(Self {
            captures: config.captures.clone(),
            options: DeepExtractOptions::from(&config.features),
            strategies,
            host_pairs: config.clustering.host_pairs.clone(),
            splitter,
        })
    }
}

/// Results of one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyResults {
    pub strategy: Strategy,
    pub elapsed_ms: u64,
    pub results: Vec<ClusteringResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { captures: usize },
    Extracted { capture: PathBuf, files: usize },
    SplitDirectories { directories: Vec<PathBuf> },
    FeaturesDone { vectors: usize, elapsed_ms: u64 },
    Clustered { strategy: Strategy, elapsed_ms: u64 },
    Finished { strategies: usize },
    Failed { message: String, detail: String },
}

/// One-way notification from a running batch.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub batch: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Everything a batch leaves behind. The extractor is returned even on
/// failure so its split directories can be removed.
#[derive(Debug)]
pub struct BatchReport {
    pub batch: Uuid,
    pub extractor: Option<FeatureExtractor>,
    pub outcome: Result<Vec<StrategyResults>, TestbedError>,
}

struct Notifier {
    batch: Uuid,
    tx: UnboundedSender<Progress>,
}

impl Notifier {
    fn send(&self, event: ProgressEvent) {
        // receiver may be gone; the batch still completes
        let _ = self.tx.send(Progress {
            batch: self.batch,
            at: Utc::now(),
            event,
        });
    }
}

/// Run a batch on the blocking pool. Must be called from within a tokio runtime.
pub fn spawn_batch(
    request: BatchRequest,
) -> (Uuid, UnboundedReceiver<Progress>, JoinHandle<BatchReport>) {
    let batch = Uuid::new_v4();
    let (tx, rx) = unbounded_channel();
    let handle = tokio::task::spawn_blocking(move || run_batch(request, batch, tx));
    (batch, rx, handle)
}

/// Run a batch on the current thread.
pub fn run_batch(request: BatchRequest, batch: Uuid, tx: UnboundedSender<Progress>) -> BatchReport {
    let notify = Notifier { batch, tx };
    let mut extractor = None;
    let outcome = execute(&request, &notify, &mut extractor);
    if let Err(e) = &outcome {
        tracing::error!(%batch, error = %e, "batch failed");
        notify.send(ProgressEvent::Failed {
            message: e.to_string(),
            detail: format!("{:?}", e),
        });
    }
    BatchReport {
        batch,
        extractor,
        outcome,
    }
}

fn execute(
    request: &BatchRequest,
    notify: &Notifier,
    slot: &mut Option<FeatureExtractor>,
) -> Result<Vec<StrategyResults>, TestbedError> {
    if request.captures.is_empty() {
        return Err(ConfigurationError::NoCaptures.into());
    }
    if request.strategies.is_empty() {
        return Err(ConfigurationError::NoStrategies.into());
    }
    if request.host_pairs.is_empty() {
        return Err(ConfigurationError::NoHostPairs.into());
    }

    notify.send(ProgressEvent::Started {
        captures: request.captures.len(),
    });
    let extractor = slot.insert(FeatureExtractor::new(request.splitter.clone())?);

    let started = Instant::now();
    for capture in &request.captures {
        let files = extractor.deep_extract(capture, request.options)?;
        notify.send(ProgressEvent::Extracted {
            capture: capture.clone(),
            files: files.len(),
        });
    }
    notify.send(ProgressEvent::SplitDirectories {
        directories: extractor.directories().to_vec(),
    });
    let features = extractor.all();
    notify.send(ProgressEvent::FeaturesDone {
        vectors: features.len(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    });

    let mut engine = ClusteringEngine::new();
    engine.update_features(features);
    engine.update_host_pairs(request.host_pairs.clone());

    let mut all = Vec::with_capacity(request.strategies.len());
    for &strategy in &request.strategies {
        let started = Instant::now();
        let results = engine.start(strategy, true)?.to_vec();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        notify.send(ProgressEvent::Clustered {
            strategy,
            elapsed_ms,
        });
        all.push(StrategyResults {
            strategy,
            elapsed_ms,
            results,
        });
    }
    notify.send(ProgressEvent::Finished {
        strategies: all.len(),
    });
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::SystemTools;

    #[test]
    fn unknown_strategy_in_config_is_rejected() {
        let mut config = TestbedConfig::default();
        config.clustering.strategies = vec!["K-means".into(), "hdbscan".into()];
        let err = BatchRequest::from_config(&config, Arc::new(SystemTools)).unwrap_err();
        assert_eq!(err, ConfigurationError::UnknownStrategy("hdbscan".into()));
    }

    #[test]
    fn empty_batch_fails_with_a_notification() {
        let mut config = TestbedConfig::default();
        config.features.splitter = SplitBackend::Native;
        let request = BatchRequest::from_config(&config, Arc::new(SystemTools)).unwrap();
        let (tx, mut rx) = unbounded_channel();
        let batch = Uuid::new_v4();
        let report = run_batch(request, batch, tx);
        assert!(matches!(
            report.outcome,
            Err(TestbedError::Configuration(ConfigurationError::NoCaptures))
        ));
        assert!(report.extractor.is_none());
        let p = rx.try_recv().unwrap();
        assert_eq!(p.batch, batch);
        assert!(matches!(p.event, ProgressEvent::Failed { .. }));
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["kind"], "failed");
    }
}
