//! replay-testbed entrypoint: extract and cluster the configured captures,
//! print the results as ndjson and optionally replay them until Ctrl+C.

use replay_testbed::{
    config::TestbedConfig,
    logging::StructuredLogger,
    network::NamespaceNetwork,
    pipeline::{spawn_batch, BatchRequest, ProgressEvent, StrategyResults},
    replay::ReplayEngine,
    tools::{SystemTools, ToolRunner},
    ClusteringResult, Strategy,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Serialize)]
struct ResultLine<'a> {
    strategy: Strategy,
    #[serde(flatten)]
    result: &'a ClusteringResult,
}

fn print_results(results: &[StrategyResults]) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for r in results {
        for result in &r.results {
            StructuredLogger::emit_json(
                &ResultLine {
                    strategy: r.strategy,
                    result,
                },
                &mut out,
            );
        }
    }
}

async fn replay(
    config: &TestbedConfig,
    tools: Arc<dyn ToolRunner>,
    results: &[ClusteringResult],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let network = Arc::new(NamespaceNetwork::from_config(
        &config.network,
        &config.tools,
        config.replay.use_sudo,
        Arc::clone(&tools),
    ));
    let mut engine = ReplayEngine::new(network, tools, config.tools.clone(), config.replay.clone());

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    let started = engine
        .apply_results(results)
        .and_then(|prepared| {
            info!(prepared, scenarios = engine.scenarios().len(), "traffic prepared");
            engine.start(&config.replay.scenarios)
        });
    match started {
        Ok(workers) => {
            info!(workers, "replaying (Ctrl+C to stop)");
            stop_rx.recv().await;
        }
        Err(e) => warn!(error = %e, "replay not started"),
    }

    let report = engine.clean().await;
    for r in &report.replayers {
        info!(scenario = r.scenario, passes = r.passes, items = r.items_started, "replayer finished");
    }
    for (interface, e) in &report.failures {
        warn!(%interface, error = %e, "veth pair left behind");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = std::env::var("TESTBED_CONFIG_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("testbed.json"));
    let config = TestbedConfig::load(&config_path);

    StructuredLogger::init(config.log.json, &config.log.level);
    info!(captures = config.captures.len(), "replay testbed starting");

    let tools: Arc<dyn ToolRunner> = Arc::new(SystemTools);
    let request = BatchRequest::from_config(&config, Arc::clone(&tools))?;
    let (batch, mut progress, handle) = spawn_batch(request);

    while let Some(p) = progress.recv().await {
        match &p.event {
            ProgressEvent::Failed { message, detail } => {
                warn!(%batch, %message, %detail, "batch failed")
            }
            event => info!(%batch, ?event, "progress"),
        }
    }
    let report = handle.await?;
    let mut extractor = report.extractor;

    let outcome = match report.outcome {
        Ok(results) => {
            print_results(&results);
            match results.first() {
                Some(first) if config.replay.enabled => {
                    replay(&config, Arc::clone(&tools), &first.results).await
                }
                _ => Ok(()),
            }
        }
        Err(e) => Err(e.into()),
    };

    if let Some(extractor) = extractor.as_mut() {
        extractor.split_clean();
    }
    info!("replay testbed done");
    outcome
}
