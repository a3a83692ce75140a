// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for canopy-core integration tests.
//!
//! Builds the full set of services over either the in-memory store or a
//! PostgreSQL database named by `TEST_CANOPY_DATABASE_URL`.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use canopy_core::aggregator::{self, ClusterAggregator};
use canopy_core::blob::FsBlobStore;
use canopy_core::cluster::{ClusterInput, ClusterService};
use canopy_core::events::EventBus;
use canopy_core::model::{DrivingLicense, SoilCondition, TreeCluster, VehicleStatus, VehicleType};
use canopy_core::routing::RoutePlanner;
use canopy_core::sensor::{DEFAULT_STALE_THRESHOLD, SensorService};
use canopy_core::store::{self, MemoryStore, Store};
use canopy_core::tree::{TreeInput, TreeService};
use canopy_core::vehicle::{VehicleInput, VehicleService};
use canopy_core::RequestContext;
use canopy_core::watering_plan::WateringPlanEngine;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Every service wired to one store and one bus.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub sensors: SensorService,
    pub trees: TreeService,
    pub clusters: ClusterService,
    pub vehicles: VehicleService,
    pub plans: WateringPlanEngine,
    pub cancel: CancellationToken,
    _blob_dir: tempfile::TempDir,
}

impl Harness {
    pub fn with_store(store: Arc<dyn Store>, planner: Arc<dyn RoutePlanner>) -> Self {
        let bus = EventBus::new();
        let blob_dir = tempfile::tempdir().expect("Failed to create temp dir");
        Self {
            sensors: SensorService::new(store.clone(), bus.clone(), DEFAULT_STALE_THRESHOLD),
            trees: TreeService::new(store.clone(), bus.clone()),
            clusters: ClusterService::new(store.clone(), bus.clone(), DEFAULT_STALE_THRESHOLD),
            vehicles: VehicleService::new(store.clone()),
            plans: WateringPlanEngine::new(
                store.clone(),
                bus.clone(),
                planner,
                Arc::new(FsBlobStore::new(blob_dir.path())),
                "http://canopy.test",
            ),
            store,
            bus,
            cancel: CancellationToken::new(),
            _blob_dir: blob_dir,
        }
    }

    pub fn memory(planner: Arc<dyn RoutePlanner>) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), planner)
    }

    /// `None` when no test database is configured.
    pub async fn postgres(planner: Arc<dyn RoutePlanner>) -> Option<Self> {
        let url = std::env::var("TEST_CANOPY_DATABASE_URL").ok()?;
        let store = store::connect(&url, 5)
            .await
            .expect("Failed to connect to test database");
        Some(Self::with_store(store, planner))
    }

    /// Run the aggregator against this harness' bus until drop of `cancel`.
    pub fn start_aggregator(&self) -> JoinHandle<()> {
        let events = self.bus.subscribe("aggregator", aggregator::TOPICS);
        ClusterAggregator::new(self.store.clone(), DEFAULT_STALE_THRESHOLD)
            .spawn(events, self.cancel.clone())
    }

    pub async fn vehicle(&self, vehicle_type: VehicleType, capacity: f64) -> i32 {
        let plate = format!("FL {}", &Uuid::new_v4().simple().to_string()[..8]);
        self.vehicles
            .create(
                &RequestContext::default(),
                VehicleInput {
                    number_plate: plate,
                    description: String::new(),
                    model: "Unimog".to_string(),
                    water_capacity: capacity,
                    vehicle_type,
                    status: VehicleStatus::Available,
                    driving_license: DrivingLicense::C,
                    width: 2.5,
                    height: 3.0,
                    length: 7.0,
                    weight: 10.0,
                },
            )
            .await
            .expect("Failed to create vehicle")
            .id
    }

    /// A cluster holding `trees` trees around the given position.
    pub async fn cluster(&self, trees: usize, latitude: f64, longitude: f64) -> TreeCluster {
        let ctx = RequestContext::default();
        let mut tree_ids = Vec::with_capacity(trees);
        for i in 0..trees {
            let tree = self
                .trees
                .create(&ctx, tree_input(None, latitude + i as f64 * 0.0001, longitude))
                .await
                .expect("Failed to create tree");
            tree_ids.push(tree.id);
        }
        self.clusters
            .create(
                &ctx,
                ClusterInput {
                    name: format!("cluster {}", Uuid::new_v4()),
                    address: "Friedrich-Ebert-Straße".to_string(),
                    description: String::new(),
                    region: Some("Mürwik".to_string()),
                    soil_condition: SoilCondition::Loamy,
                    tree_ids,
                },
            )
            .await
            .expect("Failed to create cluster")
    }
}

pub fn tree_input(sensor_id: Option<&str>, latitude: f64, longitude: f64) -> TreeInput {
    TreeInput {
        tree_cluster_id: None,
        sensor_id: sensor_id.map(str::to_string),
        species: "Tilia cordata".to_string(),
        number: Uuid::new_v4().to_string(),
        planting_year: 2012,
        latitude,
        longitude,
        description: String::new(),
        readonly: false,
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
