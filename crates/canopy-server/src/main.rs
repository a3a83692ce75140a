// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Canopy Server - Urban Tree Irrigation Backend
//!
//! Serves the `/api/v1` HTTP API and runs the background loops:
//! - Cluster moisture aggregation on sensor events
//! - Sensor offline sweep, plugin eviction and overdue-plan sweep
//! - MQTT telemetry ingress (optional)

use tracing::{info, warn};

use canopy_server::config::Config;
use canopy_server::runtime::ServerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canopy_server=info,canopy_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        port = config.port,
        app_url = %config.app_url,
        blob_dir = %config.blob_dir.display(),
        "Starting Canopy Server"
    );

    let runtime = ServerRuntime::start(config).await?;

    info!(addr = %runtime.addr(), "Canopy Server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Canopy Server shut down");

    Ok(())
}
