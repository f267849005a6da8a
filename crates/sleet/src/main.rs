//! Sleet CLI: bulk-ingest JSON document trees into a relational data lake.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sleet::pipeline::RunState;
use sleet::{CliArgs, Config, Pipeline, PostgresSink, init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    let paths = args.config_paths();
    if paths.is_empty() {
        eprintln!("Error: no config files or directories specified");
        return ExitCode::FAILURE;
    }

    info!("Loading config from {} source(s)", paths.len());

    let config = match Config::from_paths(&paths) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if config.metrics.enabled {
        let addr = match config.metrics.address.parse() {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Invalid metrics address '{}': {e}", config.metrics.address);
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = sleet_common::metrics::init_global(addr) {
            eprintln!("Failed to start metrics server: {e}");
            return ExitCode::FAILURE;
        }
    }

    info!("Starting sleet with {} dataset(s)", config.datasets.len());
    for (key, dataset) in &config.datasets {
        info!("  Dataset: {} ({} -> {})", key, dataset.source, dataset.table);
    }

    // One pool connection per loader worker; table-level advisory locks
    // serialize same-table batches, so more connections would idle.
    let sink = match PostgresSink::connect(&config.sink.url, config.pools.loader_workers as u32)
        .await
    {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            eprintln!("Failed to connect to sink: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining pipeline");
            cancel.cancel();
        });
    }

    match Pipeline::new(config, sink, cancel).run().await {
        Ok((RunState::Failed, summary)) => {
            error!(
                files_loaded = summary.files_loaded,
                files_failed = summary.files_failed,
                "Run failed: sink became unavailable"
            );
            ExitCode::FAILURE
        }
        Ok((state, summary)) => {
            if !summary.is_clean() {
                warn!(
                    files_failed = summary.files_failed,
                    batches_quarantined = summary.batches_quarantined,
                    sequence_gaps = summary.sequence_gaps,
                    "Run completed with failures"
                );
            }
            info!(state = %state, "Run complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Pipeline failed: {e}");
            ExitCode::FAILURE
        }
    }
}
