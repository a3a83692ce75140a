// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sensor telemetry ingestion and liveness.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::model::{Sensor, SensorData, SensorStatus, Watermark};
use crate::scheduler::Job;
use crate::store::{NewSensor, SENSOR_SWEEP_LOCK, SensorFilter, Store, run_in_tx};

/// Default age after which a silent sensor is marked offline.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(72 * 3600);

/// Raw telemetry as delivered by a device or gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryPayload {
    pub device_id: String,
    #[serde(default)]
    pub battery: f64,
    #[serde(default)]
    pub humidity: f64,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub watermarks: Vec<Watermark>,
    /// Device-side timestamp; the receive time is used when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TelemetryPayload {
    fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::bad_request("device_id is required"));
        }
        let scalars = [
            ("battery", self.battery),
            ("humidity", self.humidity),
            ("temperature", self.temperature),
        ];
        for (field, value) in scalars {
            if !value.is_finite() {
                return Err(Error::bad_request(format!("{} must be a number", field)));
            }
        }
        for (i, mark) in self.watermarks.iter().enumerate() {
            if !mark.centibar.is_finite() || mark.centibar < 0.0 {
                return Err(Error::bad_request(format!(
                    "watermarks[{}].centibar must be a non-negative number",
                    i
                )));
            }
            if !mark.depth.is_finite() || mark.depth < 0.0 || !mark.resistance.is_finite() {
                return Err(Error::bad_request(format!(
                    "watermarks[{}] has an invalid depth or resistance",
                    i
                )));
            }
        }
        Ok(())
    }

    /// Normalise into a reading stamped at microsecond precision, the
    /// resolution the store keeps.
    fn into_reading(self, now: DateTime<Utc>) -> SensorData {
        SensorData {
            sensor_id: self.device_id.trim().to_string(),
            received_at: self.timestamp.unwrap_or(now).trunc_subsecs(6),
            battery: self.battery,
            humidity: self.humidity,
            temperature: self.temperature,
            watermarks: self.watermarks,
        }
    }
}

/// Outcome of ingesting one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub data: SensorData,
    /// `false` when the reading was a replay of a stored one.
    pub inserted: bool,
}

/// Changes to a sensor's mutable attributes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SensorUpdate {
    pub status: Option<SensorStatus>,
    #[serde(rename = "type")]
    pub sensor_type: Option<String>,
}

#[derive(Clone)]
pub struct SensorService {
    store: Arc<dyn Store>,
    bus: EventBus,
    stale_threshold: Duration,
}

impl SensorService {
    pub fn new(store: Arc<dyn Store>, bus: EventBus, stale_threshold: Duration) -> Self {
        Self {
            store,
            bus,
            stale_threshold,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Persist a reading and mark its sensor online.
    ///
    /// Replays of `(sensor_id, received_at)` are accepted without a second
    /// write or event.
    #[instrument(skip_all, fields(device_id = %payload.device_id))]
    pub async fn ingest(&self, ctx: &RequestContext, payload: TelemetryPayload) -> Result<Ingested> {
        payload.validate()?;
        let now = Utc::now().trunc_subsecs(6);
        let data = payload.into_reading(now);

        let reading = data.clone();
        let (previous, inserted) = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                // Liveness follows the server clock, not the device clock.
                let previous = repo.touch_sensor(&reading.sensor_id, now).await?;
                let inserted = repo.insert_sensor_data(&reading).await?;
                Ok((previous, inserted))
            })
        })
        .await?;

        match previous {
            None => info!(sensor_id = %data.sensor_id, "Registered new sensor from telemetry"),
            Some(SensorStatus::Online) => {}
            Some(old_status) => {
                self.bus
                    .publish(Event::SensorStatusChanged {
                        sensor_id: data.sensor_id.clone(),
                        old_status,
                        new_status: SensorStatus::Online,
                    })
                    .await;
            }
        }

        if inserted {
            self.bus
                .publish(Event::SensorDataArrived {
                    sensor_id: data.sensor_id.clone(),
                    data: data.clone(),
                })
                .await;
        } else {
            debug!(sensor_id = %data.sensor_id, received_at = %data.received_at, "Duplicate reading ignored");
        }

        Ok(Ingested { data, inserted })
    }

    pub async fn create(&self, ctx: &RequestContext, sensor: NewSensor) -> Result<Sensor> {
        if sensor.id.trim().is_empty() {
            return Err(Error::bad_request("sensor id is required"));
        }
        let sensor = NewSensor {
            id: sensor.id.trim().to_string(),
            ..sensor
        };
        let created = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                repo.create_sensor(&sensor).await.map_err(|e| match e {
                    crate::store::StoreError::Conflict { .. } => {
                        Error::conflict(format!("sensor '{}' already exists", sensor.id))
                    }
                    other => other.into(),
                })
            })
        })
        .await?;
        info!(sensor_id = %created.id, "Sensor created");
        Ok(created)
    }

    pub async fn get(&self, ctx: &RequestContext, id: &str) -> Result<Sensor> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.get_sensor(id).await?)
    }

    pub async fn list(&self, ctx: &RequestContext, filter: &SensorFilter) -> Result<(Vec<Sensor>, i64)> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.list_sensors(filter, ctx.pagination()).await?)
    }

    pub async fn update(&self, ctx: &RequestContext, id: &str, update: SensorUpdate) -> Result<Sensor> {
        let id = id.to_string();
        let (old_status, sensor) = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                let mut sensor = repo.get_sensor(&id).await?;
                let old_status = sensor.status;
                if let Some(status) = update.status {
                    sensor.status = status;
                }
                if let Some(sensor_type) = update.sensor_type {
                    sensor.sensor_type = sensor_type;
                }
                repo.update_sensor(&sensor).await?;
                Ok((old_status, repo.get_sensor(&id).await?))
            })
        })
        .await?;

        if old_status != sensor.status {
            self.bus
                .publish(Event::SensorStatusChanged {
                    sensor_id: sensor.id.clone(),
                    old_status,
                    new_status: sensor.status,
                })
                .await;
        }
        Ok(sensor)
    }

    /// Delete a sensor with its readings and unlink it from its tree.
    pub async fn delete(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let sensor_id = id.to_string();
        let linked = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                repo.get_sensor(&sensor_id).await?;
                let tree = repo.get_tree_by_sensor(&sensor_id).await?;
                repo.delete_sensor(&sensor_id).await?;
                Ok(tree)
            })
        })
        .await?;
        info!(sensor_id = %id, "Sensor deleted");

        // The tree lost its readings, so its cluster needs a recompute.
        if let Some(tree) = linked {
            self.bus
                .publish(Event::TreeUpdated {
                    id: tree.id,
                    old_cluster_id: tree.tree_cluster_id,
                    new_cluster_id: tree.tree_cluster_id,
                })
                .await;
        }
        Ok(())
    }

    /// Stored readings of one sensor, newest first.
    pub async fn list_data(&self, ctx: &RequestContext, id: &str) -> Result<(Vec<SensorData>, i64)> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        repo.get_sensor(id).await?;
        Ok(repo.list_sensor_data(id, ctx.pagination()).await?)
    }

    /// Mark sensors silent for longer than the threshold as offline.
    ///
    /// Returns the ids that transitioned. A concurrent sweep holding the
    /// advisory lock makes this a no-op.
    pub async fn sweep_stale(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let threshold = chrono::Duration::from_std(self.stale_threshold)
            .map_err(|e| Error::internal(format!("invalid stale threshold: {}", e)))?;
        let cutoff = Utc::now() - threshold;

        let changed = run_in_tx(self.store.as_ref(), cancel, move |repo| {
            Box::pin(async move {
                if !repo.try_advisory_lock(SENSOR_SWEEP_LOCK).await? {
                    debug!("Sensor sweep already running elsewhere");
                    return Ok(Vec::new());
                }
                let stale = repo.list_stale_sensors(cutoff).await?;
                let mut changed = Vec::with_capacity(stale.len());
                for sensor in stale {
                    repo.set_sensor_status(&sensor.id, SensorStatus::Offline).await?;
                    changed.push((sensor.id, sensor.status));
                }
                Ok(changed)
            })
        })
        .await?;

        for (sensor_id, old_status) in &changed {
            self.bus
                .publish(Event::SensorStatusChanged {
                    sensor_id: sensor_id.clone(),
                    old_status: *old_status,
                    new_status: SensorStatus::Offline,
                })
                .await;
        }
        if !changed.is_empty() {
            info!(count = changed.len(), "Marked stale sensors offline");
        }
        Ok(changed.into_iter().map(|(id, _)| id).collect())
    }
}

/// Periodic offline sweep.
pub struct SensorStatusSweep {
    sensors: Arc<SensorService>,
}

impl SensorStatusSweep {
    pub fn new(sensors: Arc<SensorService>) -> Self {
        Self { sensors }
    }
}

#[async_trait]
impl Job for SensorStatusSweep {
    fn name(&self) -> &'static str {
        "sensor_status_sweep"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.sensors.sweep_stale(cancel).await.map(|_| ())
    }
}
