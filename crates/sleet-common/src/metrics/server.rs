//! Prometheus recorder and scrape endpoint.
//!
//! The recorder is process-global: `init_global` installs it once and
//! serves `/metrics` and `/health` over axum, `init_test` installs the
//! same recorder without a listener so tests can exercise code that
//! emits events. Emit sites never touch this module directly; they go
//! through the `metrics` facade via `emit!`.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{
    AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu, PrometheusInitSnafu,
};

/// Buckets for the stage duration histograms. File reads and parses
/// land in the low-millisecond range; bulk merges waiting on a table
/// lock can run to tens of seconds.
const STAGE_DURATION_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0, 120.0,
];

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

fn install_recorder() -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(STAGE_DURATION_BUCKETS)
        .expect("non-empty bucket list")
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    RECORDER
        .set(handle)
        .map_err(|_| AlreadyInitializedSnafu.build())
}

/// Install the global recorder and serve `/metrics` and `/health` on
/// the given address.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the
/// Prometheus recorder fails to initialize.
pub fn init_global(addr: SocketAddr) -> Result<(), MetricsError> {
    install_recorder()?;
    tokio::spawn(serve(addr));
    info!(%addr, "Metrics server started");
    Ok(())
}

/// Install the global recorder without an HTTP listener.
///
/// Test threads race to this; losers spin until the winner's recorder
/// is visible, so every caller returns with the recorder in place.
pub fn init_test() {
    if install_recorder().is_err() {
        while RECORDER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

/// Render the current metrics in Prometheus text format.
///
/// # Errors
///
/// Returns an error if no recorder has been installed.
pub fn render_metrics() -> Result<String, MetricsError> {
    let handle = RECORDER.get().context(NotInitializedSnafu)?;
    Ok(handle.render())
}

async fn serve(addr: SocketAddr) {
    let app = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .route("/health", get(|| async { "ok\n" }));

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics server to {addr}: {e}");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {e}");
    }
}

async fn metrics_endpoint() -> String {
    // The server is only spawned after the recorder is installed.
    render_metrics().unwrap_or_default()
}
