//! This file defines the data-portal binary entry point.

use data_portal::app;
use data_portal::cli;
use data_portal::metrics;
use data_portal::server;
use data_portal::tracing;

use std::process::exit;
use std::time::Duration;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing(&args);
    metrics::register_metrics();
    let state = match app::state(&args) {
        Ok(state) => state,
        Err(err) => {
            ::tracing::error!("failed to start: {}", err);
            exit(1)
        }
    };
    let pool = state.start_workers();
    let service = app::service(state);
    server::serve(&args, service).await;
    // Running builds finish unless they outlast the shutdown timeout; their leases expire and
    // another process picks them up.
    let timeout = Duration::from_secs(args.graceful_shutdown_timeout);
    if tokio::time::timeout(timeout, pool.shutdown()).await.is_err() {
        ::tracing::warn!("build workers did not stop in time");
    }
    tracing::shutdown_tracing();
}
