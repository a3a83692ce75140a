// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MQTT telemetry ingress.
//!
//! Subscribes to the sensor topic filter and hands every message to the
//! sensor ingestor. Malformed messages are logged and dropped; broker
//! outages are retried until shutdown.

use std::sync::Arc;
use std::time::Duration;

use canopy_core::sensor::{Ingested, SensorService, TelemetryPayload};
use canopy_core::{Error, RequestContext};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;

/// Pause before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct MqttIngress {
    options: MqttOptions,
    topic: String,
    sensors: Arc<SensorService>,
}

impl MqttIngress {
    pub fn new(config: &MqttConfig, sensors: Arc<SensorService>) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        Self {
            options,
            topic: config.topic.clone(),
            sensors,
        }
    }

    /// Run the ingress loop until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 64);
        info!(topic = %self.topic, "MQTT ingress started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("MQTT ingress received shutdown signal");
                    if let Err(e) = client.disconnect().await {
                        debug!(error = %e, "MQTT disconnect failed");
                    }
                    break;
                }

                event = eventloop.poll() => match event {
                    // Subscriptions do not survive a reconnect.
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(topic = %self.topic, "Connected to MQTT broker");
                        if let Err(e) = client.subscribe(&self.topic, QoS::AtLeastOnce).await {
                            error!(error = %e, "MQTT subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match ingest_message(&self.sensors, &self.topic, &publish.topic, &publish.payload, &cancel).await {
                            Ok(ingested) => debug!(
                                sensor_id = %ingested.data.sensor_id,
                                inserted = ingested.inserted,
                                "Telemetry ingested"
                            ),
                            Err(e) if e.is_cancelled() => {}
                            Err(Error::BadRequest(reason)) => {
                                warn!(topic = %publish.topic, reason = %reason, "Dropping malformed telemetry");
                            }
                            Err(e) => error!(topic = %publish.topic, error = %e, "Telemetry ingestion failed"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                },
            }
        }

        info!("MQTT ingress stopped");
    }
}

/// Decode one message and ingest it. A payload without `device_id` takes
/// the id from the topic level matched by `+`.
pub async fn ingest_message(
    sensors: &SensorService,
    filter: &str,
    topic: &str,
    payload: &[u8],
    cancel: &CancellationToken,
) -> canopy_core::Result<Ingested> {
    let telemetry = decode_payload(filter, topic, payload)?;
    sensors
        .ingest(&RequestContext::background(cancel), telemetry)
        .await
}

pub fn decode_payload(
    filter: &str,
    topic: &str,
    payload: &[u8],
) -> canopy_core::Result<TelemetryPayload> {
    let mut value: Value = serde_json::from_slice(payload)
        .map_err(|e| Error::bad_request(format!("invalid telemetry JSON: {}", e)))?;

    if let Value::Object(fields) = &mut value {
        if !fields.contains_key("device_id") {
            if let Some(device) = topic_device(filter, topic) {
                fields.insert("device_id".to_string(), Value::String(device.to_string()));
            }
        }
    }

    serde_json::from_value(value)
        .map_err(|e| Error::bad_request(format!("invalid telemetry payload: {}", e)))
}

/// The topic level matched by the first `+` of `filter`.
fn topic_device<'a>(filter: &str, topic: &'a str) -> Option<&'a str> {
    filter
        .split('/')
        .zip(topic.split('/'))
        .find(|(pattern, _)| *pattern == "+")
        .map(|(_, level)| level)
        .filter(|level| !level.is_empty())
}
