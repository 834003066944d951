//! Replay testbed: cluster packet captures onto emulated host pairs and replay
//! them concurrently over provisioned veth links.
//!
//! Modular structure:
//! - [`capture`]: pcap/pcapng reading, packet decoding, pcap writing
//! - [`features`]: Per-capture feature vectors, capture splitting
//! - [`clustering`]: Strategies and rebalancing to one group per host pair
//! - [`replay`]: veth provisioning, scenarios, replay workers
//! - [`pipeline`]: Background batch runner with progress notifications
//! - [`network`]: Emulated hosts the replay engine provisions
//! - [`tools`]: External program invocation
//! - [`logging`]: Structured JSON logging

pub mod capture;
pub mod clustering;
pub mod config;
pub mod error;
pub mod features;
pub mod logging;
pub mod network;
pub mod pipeline;
pub mod replay;
pub mod tools;

pub use clustering::{ClusteringEngine, ClusteringResult, HostPair, Strategy};
pub use config::TestbedConfig;
pub use error::{Result, TestbedError};
pub use features::{FeatureExtractor, FeatureVector};
pub use logging::StructuredLogger;
pub use pipeline::{spawn_batch, BatchRequest, Progress};
pub use replay::{ReplayEngine, ReplayScenario, ScenarioReplayer};
