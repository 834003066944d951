//! Concurrent replay of clustered traffic over provisioned veth pairs.

pub mod engine;
pub mod replayer;
pub mod scenario;

pub use engine::{CleanReport, ProvisionedInterface, ReplayEngine};
pub use replayer::{ReplayerReport, ReplayerState, ScenarioReplayer};
pub use scenario::{Endpoint, ReplayScenario, ScenarioKey, TrafficItem};
