//! Error taxonomy shared by extraction, clustering and replay.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = TestbedError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TestbedError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("interface {interface} already exists")]
    ResourceConflict { interface: String },
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Clustering(#[from] ClusteringError),
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TestbedError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TestbedError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Invalid input or state detected before anything is mutated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no capture files given to the engine")]
    NoCaptures,
    #[error("no host pairs configured")]
    NoHostPairs,
    #[error("{captures} capture(s) cannot be spread over {pairs} host pair(s)")]
    TooFewCaptures { captures: usize, pairs: usize },
    #[error("unknown clustering strategy \"{0}\"")]
    UnknownStrategy(String),
    #[error("no clustering strategy selected")]
    NoStrategies,
    #[error("unknown host \"{0}\"")]
    UnknownHost(String),
    #[error("scenario {index} does not exist ({available} registered)")]
    UnknownScenario { index: usize, available: usize },
    #[error("scenario {0} is already replaying; stop it first")]
    ScenarioRunning(usize),
    #[error(
        "capture {} already has a processed directory {}; remove it before retrying feature extraction",
        capture.display(),
        directory.display()
    )]
    DuplicateSplitDirectory { capture: PathBuf, directory: PathBuf },
    #[error("port table entry {port} maps to \"{name}\" which is not a matching schema field")]
    PortTable { port: u16, name: String },
}

/// External program failed to launch or exited unsuccessfully.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open capture {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed capture {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("cannot write capture {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ClusteringError {
    #[error("{strategy} back-end failed: {reason}")]
    Backend {
        strategy: &'static str,
        reason: String,
    },
}
