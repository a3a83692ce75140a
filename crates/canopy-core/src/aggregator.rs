// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster moisture aggregation.
//!
//! The aggregator listens for sensor and tree events, resolves the
//! clusters they touch and recomputes each one in its own transaction
//! holding the cluster row lock. Recomputes of different clusters run
//! concurrently.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{Event, Topic};
use crate::model::{Coordinate, PlanStatus, SensorData, TreeCluster, WateringStatus};
use crate::store::{Repository, Store, run_in_tx};

/// Topics the aggregator subscribes to.
pub const TOPICS: &[Topic] = &[
    Topic::SensorDataArrived,
    Topic::SensorStatusChanged,
    Topic::TreeCreated,
    Topic::TreeUpdated,
    Topic::TreeDeleted,
    Topic::WateringPlanUpdated,
];

/// Map suction in centibar onto a 0..1 moisture scale. 10 cb and wetter
/// is fully moist, 200 cb and drier is fully dry.
pub fn normalise_centibar(centibar: f64) -> f64 {
    1.0 - ((centibar - 10.0) / 190.0).clamp(0.0, 1.0)
}

pub fn status_for_moisture(moisture: f64) -> WateringStatus {
    if moisture >= 0.7 {
        WateringStatus::Good
    } else if moisture >= 0.4 {
        WateringStatus::Moderate
    } else {
        WateringStatus::Bad
    }
}

/// Moisture and status derived from the latest fresh reading of each
/// sensor. `None` when no reading carries a measurement.
pub fn assess(readings: &[SensorData]) -> Option<(f64, WateringStatus)> {
    let values: Vec<f64> = readings.iter().filter_map(|r| r.mean_centibar()).collect();
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let moisture = normalise_centibar(mean);
    Some((moisture, status_for_moisture(moisture)))
}

/// Mean position of the given coordinates.
pub fn centroid(points: &[Coordinate]) -> Option<Coordinate> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let latitude = points.iter().map(|p| p.latitude).sum::<f64>() / n;
    let longitude = points.iter().map(|p| p.longitude).sum::<f64>() / n;
    Some(Coordinate::new(latitude, longitude))
}

/// Recompute a cluster's centroid, moisture and watering status inside the
/// caller's transaction. Readings older than `fresh_since` are ignored.
///
/// Returns the updated cluster when something changed.
pub async fn recompute_cluster(
    repo: &mut dyn Repository,
    cluster_id: i32,
    fresh_since: DateTime<Utc>,
) -> Result<Option<TreeCluster>> {
    let current = repo.lock_cluster(cluster_id).await?;
    let trees = repo.get_trees(&current.tree_ids).await?;
    let readings = repo.latest_cluster_readings(cluster_id, fresh_since).await?;

    let mut next = current.clone();
    next.coordinate = centroid(&trees.iter().map(|t| t.coordinate).collect::<Vec<_>>());
    match assess(&readings) {
        Some((moisture, status)) => {
            next.moisture_level = moisture;
            next.watering_status = status;
        }
        // Without fresh data the last moisture value is kept.
        None => next.watering_status = WateringStatus::Unknown,
    }

    if next == current {
        return Ok(None);
    }
    repo.update_cluster(&next).await?;
    debug!(
        cluster_id,
        moisture = next.moisture_level,
        status = %next.watering_status,
        readings = readings.len(),
        "Cluster recomputed"
    );
    Ok(Some(next))
}

/// Mark the clusters of a finished plan as just watered.
pub async fn mark_watered(
    repo: &mut dyn Repository,
    cluster_ids: &[i32],
    watered_at: DateTime<Utc>,
) -> Result<()> {
    for &cluster_id in cluster_ids {
        let mut cluster = repo.lock_cluster(cluster_id).await?;
        if cluster.last_watered == Some(watered_at)
            && cluster.moisture_level == 1.0
            && cluster.watering_status == status_for_moisture(1.0)
        {
            continue;
        }
        cluster.last_watered = Some(watered_at);
        cluster.moisture_level = 1.0;
        cluster.watering_status = status_for_moisture(cluster.moisture_level);
        repo.update_cluster(&cluster).await?;
    }
    Ok(())
}

/// What an event asks the aggregator to do.
#[derive(Debug, Clone, PartialEq)]
enum Work {
    Recompute(i32),
    Watered {
        cluster_ids: Vec<i32>,
        watered_at: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct ClusterAggregator {
    store: Arc<dyn Store>,
    stale_threshold: Duration,
}

impl ClusterAggregator {
    pub fn new(store: Arc<dyn Store>, stale_threshold: Duration) -> Self {
        Self {
            store,
            stale_threshold,
        }
    }

    fn fresh_since(&self) -> Result<DateTime<Utc>> {
        let threshold = chrono::Duration::from_std(self.stale_threshold)
            .map_err(|e| Error::internal(format!("invalid stale threshold: {}", e)))?;
        Ok(Utc::now() - threshold)
    }

    /// Recompute one cluster in its own transaction.
    pub async fn recompute(
        &self,
        cancel: &CancellationToken,
        cluster_id: i32,
    ) -> Result<Option<TreeCluster>> {
        let since = self.fresh_since()?;
        run_in_tx(self.store.as_ref(), cancel, move |repo| {
            Box::pin(async move { recompute_cluster(repo, cluster_id, since).await })
        })
        .await
    }

    async fn plan(&self, event: &Event) -> Result<Vec<Work>> {
        let mut clusters = BTreeSet::new();
        match event {
            Event::SensorDataArrived { sensor_id, .. }
            | Event::SensorStatusChanged { sensor_id, .. } => {
                let mut repo = self.store.session().await?;
                if let Some(tree) = repo.get_tree_by_sensor(sensor_id).await? {
                    clusters.extend(tree.tree_cluster_id);
                }
            }
            Event::TreeCreated { id } => {
                let mut repo = self.store.session().await?;
                match repo.get_tree(*id).await {
                    Ok(tree) => clusters.extend(tree.tree_cluster_id),
                    Err(e) => debug!(tree_id = id, error = %e, "Created tree vanished"),
                }
            }
            Event::TreeUpdated {
                old_cluster_id,
                new_cluster_id,
                ..
            } => {
                clusters.extend(*old_cluster_id);
                clusters.extend(*new_cluster_id);
            }
            Event::TreeDeleted { cluster_id, .. } => clusters.extend(*cluster_id),
            Event::WateringPlanUpdated {
                id,
                date,
                new_status: PlanStatus::Finished,
                ..
            } => {
                let mut repo = self.store.session().await?;
                let plan = repo.get_plan(*id).await?;
                let cluster_ids = if plan.evaluation.is_empty() {
                    plan.cluster_ids.clone()
                } else {
                    plan.evaluation.iter().map(|e| e.cluster_id).collect()
                };
                return Ok(vec![Work::Watered {
                    cluster_ids,
                    watered_at: date.and_time(NaiveTime::MIN).and_utc(),
                }]);
            }
            _ => {}
        }
        Ok(clusters.into_iter().map(Work::Recompute).collect())
    }

    async fn execute(&self, cancel: &CancellationToken, work: Work) -> Result<()> {
        match work {
            Work::Recompute(cluster_id) => match self.recompute(cancel, cluster_id).await {
                Ok(_) => Ok(()),
                Err(Error::NotFound(_)) => {
                    debug!(cluster_id, "Cluster gone before recompute");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Work::Watered {
                cluster_ids,
                watered_at,
            } => {
                let count = cluster_ids.len();
                run_in_tx(self.store.as_ref(), cancel, move |repo| {
                    Box::pin(async move { mark_watered(repo, &cluster_ids, watered_at).await })
                })
                .await?;
                debug!(clusters = count, %watered_at, "Clusters marked as watered");
                Ok(())
            }
        }
    }

    /// Handle one event to completion.
    pub async fn handle(&self, cancel: &CancellationToken, event: &Event) -> Result<()> {
        for work in self.plan(event).await? {
            self.execute(cancel, work).await?;
        }
        Ok(())
    }

    /// Consume events until `cancel` fires or the bus goes away.
    pub fn spawn(self, mut events: mpsc::Receiver<Event>, cancel: CancellationToken) -> JoinHandle<()> {
        let aggregator = Arc::new(self);
        tokio::spawn(async move {
            info!("Cluster aggregator started");
            let mut tasks = JoinSet::new();
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Cluster aggregator received shutdown signal");
                        break;
                    }

                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = joined {
                            warn!(error = %e, "Aggregator task panicked");
                        }
                    }

                    event = events.recv() => {
                        let Some(event) = event else {
                            debug!("Event bus closed");
                            break;
                        };
                        let works = match aggregator.plan(&event).await {
                            Ok(works) => works,
                            Err(e) => {
                                error!(topic = ?event.topic(), error = %e, "Failed to resolve affected clusters");
                                continue;
                            }
                        };
                        for work in works {
                            let aggregator = aggregator.clone();
                            let cancel = cancel.clone();
                            tasks.spawn(async move {
                                match aggregator.execute(&cancel, work).await {
                                    Ok(()) => {}
                                    Err(e) if e.is_cancelled() => {}
                                    Err(e) => error!(error = %e, "Cluster aggregation failed"),
                                }
                            });
                        }
                    }
                }
            }
            tasks.shutdown().await;
            info!("Cluster aggregator stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SensorStatus, SoilCondition, Watermark};
    use crate::context::RequestContext;
    use crate::sensor::{SensorService, TelemetryPayload};
    use crate::store::{MemoryStore, NewCluster, NewSensor, NewTree};

    fn reading(sensor_id: &str, centibars: &[f64], received_at: DateTime<Utc>) -> SensorData {
        SensorData {
            sensor_id: sensor_id.to_string(),
            received_at,
            battery: 3.3,
            humidity: 40.0,
            temperature: 20.0,
            watermarks: centibars
                .iter()
                .map(|&centibar| Watermark {
                    resistance: 0.0,
                    centibar,
                    depth: 30.0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_normalisation_and_thresholds() {
        assert_eq!(normalise_centibar(0.0), 1.0);
        assert_eq!(normalise_centibar(10.0), 1.0);
        assert_eq!(normalise_centibar(200.0), 0.0);
        assert_eq!(normalise_centibar(500.0), 0.0);
        assert!((normalise_centibar(105.0) - 0.5).abs() < 1e-12);

        assert_eq!(status_for_moisture(0.7), WateringStatus::Good);
        assert_eq!(status_for_moisture(0.69), WateringStatus::Moderate);
        assert_eq!(status_for_moisture(0.4), WateringStatus::Moderate);
        assert_eq!(status_for_moisture(0.39), WateringStatus::Bad);
    }

    #[test]
    fn test_assess_averages_sensors() {
        let now = Utc::now();
        assert_eq!(assess(&[]), None);
        assert_eq!(assess(&[reading("a", &[], now)]), None);

        // 15 cb is good, 180 cb is bad.
        assert_eq!(
            assess(&[reading("a", &[15.0], now)]).map(|(_, s)| s),
            Some(WateringStatus::Good)
        );
        assert_eq!(
            assess(&[reading("a", &[180.0], now)]).map(|(_, s)| s),
            Some(WateringStatus::Bad)
        );
        // Mean of 10 and 200 is 105 cb, moisture 0.5.
        let (moisture, status) =
            assess(&[reading("a", &[10.0], now), reading("b", &[200.0], now)]).unwrap();
        assert!((moisture - 0.5).abs() < 1e-12);
        assert_eq!(status, WateringStatus::Moderate);
    }

    #[test]
    fn test_centroid() {
        assert_eq!(centroid(&[]), None);
        let c = centroid(&[Coordinate::new(54.0, 9.0), Coordinate::new(55.0, 10.0)]).unwrap();
        assert_eq!(c, Coordinate::new(54.5, 9.5));
    }

    async fn seed(store: &MemoryStore) -> i32 {
        let mut repo = store.session().await.unwrap();
        let cluster = repo
            .create_cluster(&NewCluster {
                name: "C3".to_string(),
                address: String::new(),
                description: String::new(),
                region: None,
                soil_condition: SoilCondition::Loamy,
            })
            .await
            .unwrap();
        repo.create_sensor(&NewSensor {
            id: "s-3".to_string(),
            status: SensorStatus::Online,
            sensor_type: String::new(),
        })
        .await
        .unwrap();
        repo.create_tree(&NewTree {
            tree_cluster_id: Some(cluster.id),
            sensor_id: Some("s-3".to_string()),
            species: "Tilia".to_string(),
            number: "T3".to_string(),
            planting_year: 2010,
            latitude: 54.8,
            longitude: 9.44,
            description: String::new(),
            readonly: false,
        })
        .await
        .unwrap();
        cluster.id
    }

    #[tokio::test]
    async fn test_recompute_writes_only_on_change() {
        let store = Arc::new(MemoryStore::new());
        let cluster_id = seed(&store).await;
        let aggregator = ClusterAggregator::new(store.clone(), Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        // No readings yet: only the centroid changes.
        let updated = aggregator.recompute(&cancel, cluster_id).await.unwrap().unwrap();
        assert_eq!(updated.coordinate, Some(Coordinate::new(54.8, 9.44)));
        assert_eq!(updated.watering_status, WateringStatus::Unknown);
        assert!(aggregator.recompute(&cancel, cluster_id).await.unwrap().is_none());

        {
            let mut repo = store.session().await.unwrap();
            repo.insert_sensor_data(&reading("s-3", &[15.0], Utc::now()))
                .await
                .unwrap();
        }
        let updated = aggregator.recompute(&cancel, cluster_id).await.unwrap().unwrap();
        assert_eq!(updated.watering_status, WateringStatus::Good);
    }

    #[tokio::test]
    async fn test_stale_readings_give_unknown() {
        let store = Arc::new(MemoryStore::new());
        let cluster_id = seed(&store).await;
        {
            let mut repo = store.session().await.unwrap();
            let old = Utc::now() - chrono::Duration::hours(2);
            repo.insert_sensor_data(&reading("s-3", &[180.0], old))
                .await
                .unwrap();
        }
        let aggregator = ClusterAggregator::new(store.clone(), Duration::from_secs(3600));
        let updated = aggregator
            .recompute(&CancellationToken::new(), cluster_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.watering_status, WateringStatus::Unknown);
    }

    #[tokio::test]
    async fn test_tree_moves_recompute_both_clusters() {
        let store = Arc::new(MemoryStore::new());
        let cluster_id = seed(&store).await;
        let aggregator = ClusterAggregator::new(store.clone(), Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        aggregator.recompute(&cancel, cluster_id).await.unwrap();

        let tree_id = {
            let mut repo = store.session().await.unwrap();
            let tree = repo.get_tree_by_sensor("s-3").await.unwrap().unwrap();
            repo.set_tree_cluster(&[tree.id], None).await.unwrap();
            tree.id
        };
        aggregator
            .handle(
                &cancel,
                &Event::TreeUpdated {
                    id: tree_id,
                    old_cluster_id: Some(cluster_id),
                    new_cluster_id: None,
                },
            )
            .await
            .unwrap();

        let mut repo = store.session().await.unwrap();
        let cluster = repo.get_cluster(cluster_id).await.unwrap();
        assert!(cluster.tree_ids.is_empty());
        assert_eq!(cluster.coordinate, None);
    }

    #[tokio::test]
    async fn test_spawned_aggregator_follows_bus() {
        let store = Arc::new(MemoryStore::new());
        let cluster_id = seed(&store).await;
        let bus = crate::events::EventBus::new();
        let cancel = CancellationToken::new();
        let handle = ClusterAggregator::new(store.clone(), Duration::from_secs(3600))
            .spawn(bus.subscribe("aggregator", TOPICS), cancel.clone());

        let data = reading("s-3", &[180.0], Utc::now());
        {
            let mut repo = store.session().await.unwrap();
            repo.insert_sensor_data(&data).await.unwrap();
        }
        bus.publish(Event::SensorDataArrived {
            sensor_id: "s-3".to_string(),
            data,
        })
        .await;

        let mut status = WateringStatus::Unknown;
        for _ in 0..50 {
            let mut repo = store.session().await.unwrap();
            status = repo.get_cluster(cluster_id).await.unwrap().watering_status;
            if status == WateringStatus::Bad {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, WateringStatus::Bad);

        cancel.cancel();
        handle.await.unwrap();
    }

    async fn wait_for_status(
        store: &MemoryStore,
        cluster_id: i32,
        wanted: WateringStatus,
    ) -> WateringStatus {
        let mut status = WateringStatus::Unknown;
        for _ in 0..50 {
            let mut repo = store.session().await.unwrap();
            status = repo.get_cluster(cluster_id).await.unwrap().watering_status;
            if status == wanted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        status
    }

    #[tokio::test]
    async fn test_offline_sweep_resets_cluster_status() {
        let store = Arc::new(MemoryStore::new());
        let cluster_id = seed(&store).await;
        let bus = crate::events::EventBus::new();
        let cancel = CancellationToken::new();
        let stale = Duration::from_millis(300);
        let handle = ClusterAggregator::new(store.clone(), stale)
            .spawn(bus.subscribe("aggregator", TOPICS), cancel.clone());
        let sensors = SensorService::new(store.clone(), bus.clone(), stale);

        sensors
            .ingest(
                &RequestContext::default(),
                TelemetryPayload {
                    device_id: "s-3".to_string(),
                    battery: 3.3,
                    humidity: 40.0,
                    temperature: 20.0,
                    watermarks: vec![Watermark {
                        resistance: 0.0,
                        centibar: 15.0,
                        depth: 30.0,
                    }],
                    timestamp: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            wait_for_status(&store, cluster_id, WateringStatus::Good).await,
            WateringStatus::Good
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        let swept = sensors.sweep_stale(&cancel).await.unwrap();
        assert_eq!(swept, vec!["s-3".to_string()]);
        assert_eq!(
            wait_for_status(&store, cluster_id, WateringStatus::Unknown).await,
            WateringStatus::Unknown
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_watered_sets_good_status() {
        let store = Arc::new(MemoryStore::new());
        let cluster_id = seed(&store).await;
        let watered_at = Utc::now();
        {
            let mut repo = store.session().await.unwrap();
            let mut cluster = repo.get_cluster(cluster_id).await.unwrap();
            cluster.moisture_level = 0.1;
            cluster.watering_status = WateringStatus::Bad;
            repo.update_cluster(&cluster).await.unwrap();
            mark_watered(repo.as_mut(), &[cluster_id], watered_at)
                .await
                .unwrap();
        }

        let mut repo = store.session().await.unwrap();
        let cluster = repo.get_cluster(cluster_id).await.unwrap();
        assert_eq!(cluster.moisture_level, 1.0);
        assert_eq!(cluster.watering_status, WateringStatus::Good);
        assert_eq!(cluster.last_watered, Some(watered_at));
    }
}
