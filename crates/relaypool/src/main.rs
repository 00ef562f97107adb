// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relaypool - worker pool server
//!
//! Keeps `RELAYPOOL_NUM_WORKERS` copies of `RELAYPOOL_COMMAND` running,
//! supervised according to the `RELAYPOOL_*` limits, until Ctrl-C.

use tracing::{info, warn};

use relaypool::config::Config;
use relaypool::runtime::PoolRuntimeBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaypool=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        command = %config.command,
        relay = %config.relay,
        num_workers = config.pool.num_workers,
        supervised = config.supervisor.is_some(),
        "Starting relaypool"
    );

    let runtime = PoolRuntimeBuilder::from_config(config)
        .build()?
        .start()
        .await?;

    let pids: Vec<u32> = runtime
        .pool()
        .workers()
        .await
        .iter()
        .filter_map(|worker| worker.pid())
        .collect();
    info!(pids = ?pids, "Worker pool ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Relaypool shut down");

    Ok(())
}
