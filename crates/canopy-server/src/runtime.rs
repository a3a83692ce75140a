// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process runtime for canopy-server.
//!
//! [`ServerRuntime`] owns one root cancellation token. The HTTP server, the
//! cluster aggregator, the scheduled sweeps and the MQTT ingress all run on
//! children of it, so [`ServerRuntime::shutdown`] stops everything.
//!
//! ```rust,ignore
//! let runtime = ServerRuntime::start(Config::from_env()?).await?;
//! tokio::signal::ctrl_c().await?;
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use canopy_core::aggregator::{self, ClusterAggregator};
use canopy_core::blob::FsBlobStore;
use canopy_core::plugin::PluginCleanup;
use canopy_core::routing::HttpRoutePlanner;
use canopy_core::scheduler::{Scheduler, SchedulerHandle};
use canopy_core::sensor::SensorStatusSweep;
use canopy_core::store;
use canopy_core::watering_plan::PlanSweep;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, AppState, StateOptions};
use crate::config::Config;
use crate::mqtt::MqttIngress;
use crate::oidc::OidcIdentity;

/// A running server with its background tasks.
pub struct ServerRuntime {
    cancel: CancellationToken,
    addr: SocketAddr,
    server: JoinHandle<std::io::Result<()>>,
    scheduler: SchedulerHandle,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServerRuntime {
    /// Connect the store, wire every component and start listening.
    pub async fn start(config: Config) -> Result<Self> {
        let cancel = CancellationToken::new();

        let store = store::connect(&config.database_url, config.max_db_connections)
            .await
            .context("failed to open store")?;
        info!(backend = store.backend(), "Store connected");

        let identity = Arc::new(OidcIdentity::new(&config.oidc)?);
        let planner = Arc::new(HttpRoutePlanner::new(&config.routing)?);
        let blobs = Arc::new(FsBlobStore::new(&config.blob_dir));

        let state = AppState::new(
            store.clone(),
            planner,
            blobs,
            identity,
            StateOptions {
                app_url: config.app_url.clone(),
                sensor_stale_threshold: config.sensor_stale_threshold,
                plugin_timeout: config.plugin_timeout,
                required_role: config.oidc.required_role.clone(),
            },
            cancel.clone(),
        );

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port)))
            .await
            .with_context(|| format!("failed to bind port {}", config.port))?;
        let addr = listener.local_addr()?;

        let mut tasks = Vec::new();

        // Subscribe before anything can publish.
        let events = state.bus.subscribe("aggregator", aggregator::TOPICS);
        tasks.push((
            "aggregator",
            ClusterAggregator::new(store.clone(), config.sensor_stale_threshold)
                .spawn(events, cancel.child_token()),
        ));

        let scheduler = Scheduler::new()
            .every(
                config.sensor_sweep_interval,
                Arc::new(SensorStatusSweep::new(state.sensors.clone())),
            )
            .every(
                config.plugin_cleanup_interval,
                Arc::new(PluginCleanup::new(state.plugins.clone())),
            )
            .every(
                config.plan_sweep_interval,
                Arc::new(PlanSweep::new(state.plans.clone())),
            )
            .start(cancel.child_token());

        match &config.mqtt {
            Some(mqtt) => {
                info!(host = %mqtt.host, port = mqtt.port, "MQTT ingress enabled");
                tasks.push((
                    "mqtt",
                    MqttIngress::new(mqtt, state.sensors.clone()).spawn(cancel.child_token()),
                ));
            }
            None => info!("MQTT ingress disabled, telemetry arrives over HTTP only"),
        }

        let app = api::router(state);
        let shutdown = cancel.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });
        info!(%addr, "HTTP server listening");

        Ok(Self {
            cancel,
            addr,
            server,
            scheduler,
            tasks,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Check if the HTTP server is still running.
    pub fn is_running(&self) -> bool {
        !self.server.is_finished()
    }

    /// Cancel everything and wait for the tasks to return.
    pub async fn shutdown(self) -> Result<()> {
        info!("Server runtime shutting down...");
        self.cancel.cancel();

        let served = self.server.await;
        self.scheduler.shutdown().await;
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Background task panicked");
            }
        }

        match served {
            Ok(Ok(())) => {
                info!("Server runtime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("HTTP server error during shutdown: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("HTTP server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }
}
