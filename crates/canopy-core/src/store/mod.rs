// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage interfaces and backends.
//!
//! Components never talk to a database directly. They ask a [`Store`] for a
//! [`Repository`], either a plain session or one bound to a
//! [`Transaction`], and go through the typed operations defined here.
//! [`run_in_tx`] wraps a unit of work so that it commits on success and
//! rolls back on error or cancellation.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::context::Pagination;
use crate::error::{Error, Result};
use crate::model::{
    DrivingLicense, EvaluationEntry, PlanStatus, Sensor, SensorData, SensorStatus, SoilCondition,
    Tree, TreeCluster, Vehicle, VehicleStatus, VehicleType, WateringPlan, WateringStatus,
};

/// Advisory lock guarding the sensor status sweep.
pub const SENSOR_SWEEP_LOCK: i64 = 0x63_61_6e_6f_70_79_01;
/// Advisory lock guarding the overdue-plan sweep.
pub const PLAN_SWEEP_LOCK: i64 = 0x63_61_6e_6f_70_79_02;

/// Storage failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{entity} '{key}' not found")]
    EntityNotFound { entity: &'static str, key: String },

    #[error("{operation} violates constraint {constraint}")]
    Conflict {
        operation: &'static str,
        constraint: String,
    },

    #[error("database error during {operation}: {details}")]
    Database {
        operation: &'static str,
        details: String,
    },
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::EntityNotFound {
            entity,
            key: key.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Write Records and Filters
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct NewCluster {
    pub name: String,
    pub address: String,
    pub description: String,
    pub region: Option<String>,
    pub soil_condition: SoilCondition,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterFilter {
    pub watering_statuses: Vec<WateringStatus>,
    pub regions: Vec<String>,
    pub include_archived: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTree {
    pub tree_cluster_id: Option<i32>,
    pub sensor_id: Option<String>,
    pub species: String,
    pub number: String,
    pub planting_year: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub description: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeFilter {
    pub cluster_id: Option<i32>,
    pub sensor_id: Option<String>,
    pub has_cluster: Option<bool>,
    pub planting_years: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSensor {
    pub id: String,
    pub status: SensorStatus,
    pub sensor_type: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorFilter {
    pub statuses: Vec<SensorStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewVehicle {
    pub number_plate: String,
    pub description: String,
    pub model: String,
    pub water_capacity: f64,
    pub vehicle_type: VehicleType,
    pub status: VehicleStatus,
    pub driving_license: DrivingLicense,
    pub width: f64,
    pub height: f64,
    pub length: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleFilter {
    pub vehicle_type: Option<VehicleType>,
    pub status: Option<VehicleStatus>,
    /// Case-insensitive substring of the number plate.
    pub search: Option<String>,
}

/// Row-level fields of a plan. Links are written separately through
/// [`Repository::replace_plan_links`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewPlan {
    pub date: NaiveDate,
    pub description: String,
    pub status: PlanStatus,
    pub total_water_required: f64,
    pub refills: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanFilter {
    pub statuses: Vec<PlanStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

/// A vehicle already booked for a date by another plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleBooking {
    pub vehicle_id: i32,
    pub plan_id: i32,
}

// ============================================================================
// Repository
// ============================================================================

/// Typed storage operations. Every write is visible only after the
/// enclosing transaction commits.
#[async_trait]
pub trait Repository: Send {
    // Tree clusters
    async fn create_cluster(&mut self, cluster: &NewCluster) -> StoreResult<TreeCluster>;
    async fn get_cluster(&mut self, id: i32) -> StoreResult<TreeCluster>;
    /// Lock a cluster row for the rest of the transaction.
    async fn lock_cluster(&mut self, id: i32) -> StoreResult<TreeCluster>;
    async fn get_clusters(&mut self, ids: &[i32]) -> StoreResult<Vec<TreeCluster>>;
    async fn list_clusters(
        &mut self,
        filter: &ClusterFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<TreeCluster>, i64)>;
    /// Persist attribute changes. Tree membership is not touched.
    async fn update_cluster(&mut self, cluster: &TreeCluster) -> StoreResult<()>;
    async fn delete_cluster(&mut self, id: i32) -> StoreResult<()>;
    async fn count_plans_for_cluster(&mut self, id: i32) -> StoreResult<i64>;

    // Trees
    async fn create_tree(&mut self, tree: &NewTree) -> StoreResult<Tree>;
    async fn get_tree(&mut self, id: i32) -> StoreResult<Tree>;
    async fn get_trees(&mut self, ids: &[i32]) -> StoreResult<Vec<Tree>>;
    async fn get_tree_by_sensor(&mut self, sensor_id: &str) -> StoreResult<Option<Tree>>;
    async fn list_trees(
        &mut self,
        filter: &TreeFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<Tree>, i64)>;
    async fn update_tree(&mut self, tree: &Tree) -> StoreResult<()>;
    async fn delete_tree(&mut self, id: i32) -> StoreResult<()>;
    /// Point the given trees at `cluster_id` (or detach them).
    async fn set_tree_cluster(&mut self, tree_ids: &[i32], cluster_id: Option<i32>)
    -> StoreResult<()>;

    // Sensors
    async fn create_sensor(&mut self, sensor: &NewSensor) -> StoreResult<Sensor>;
    async fn get_sensor(&mut self, id: &str) -> StoreResult<Sensor>;
    async fn list_sensors(
        &mut self,
        filter: &SensorFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<Sensor>, i64)>;
    async fn update_sensor(&mut self, sensor: &Sensor) -> StoreResult<()>;
    async fn delete_sensor(&mut self, id: &str) -> StoreResult<()>;
    /// Create the sensor if unknown, mark it online and advance its
    /// last-reading timestamp. Returns the status before the call, `None`
    /// when the sensor was created.
    async fn touch_sensor(
        &mut self,
        id: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<Option<SensorStatus>>;
    async fn set_sensor_status(&mut self, id: &str, status: SensorStatus) -> StoreResult<()>;
    /// Sensors not yet offline whose last reading is older than `cutoff`.
    async fn list_stale_sensors(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Sensor>>;

    // Sensor data
    /// Store a reading. Returns `false` when `(sensor_id, received_at)`
    /// already exists.
    async fn insert_sensor_data(&mut self, data: &SensorData) -> StoreResult<bool>;
    async fn list_sensor_data(
        &mut self,
        sensor_id: &str,
        page: Pagination,
    ) -> StoreResult<(Vec<SensorData>, i64)>;
    /// Latest reading per sensor attached to the cluster's trees, limited to
    /// readings received at or after `since`.
    async fn latest_cluster_readings(
        &mut self,
        cluster_id: i32,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorData>>;

    // Vehicles
    async fn create_vehicle(&mut self, vehicle: &NewVehicle) -> StoreResult<Vehicle>;
    async fn get_vehicle(&mut self, id: i32) -> StoreResult<Vehicle>;
    async fn get_vehicle_by_plate(&mut self, plate: &str) -> StoreResult<Option<Vehicle>>;
    async fn list_vehicles(
        &mut self,
        filter: &VehicleFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<Vehicle>, i64)>;
    async fn update_vehicle(&mut self, vehicle: &Vehicle) -> StoreResult<()>;
    async fn delete_vehicle(&mut self, id: i32) -> StoreResult<()>;
    /// Plans still holding a booking for this vehicle.
    async fn count_open_plans_for_vehicle(&mut self, id: i32) -> StoreResult<i64>;

    // Watering plans
    async fn create_plan(&mut self, plan: &NewPlan) -> StoreResult<i32>;
    async fn get_plan(&mut self, id: i32) -> StoreResult<WateringPlan>;
    /// Lock a plan row for the rest of the transaction.
    async fn lock_plan(&mut self, id: i32) -> StoreResult<WateringPlan>;
    async fn list_plans(
        &mut self,
        filter: &PlanFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<WateringPlan>, i64)>;
    /// Persist row-level fields (status, totals, route data, note).
    async fn update_plan(&mut self, plan: &WateringPlan) -> StoreResult<()>;
    /// Replace cluster, vehicle and user links with those of `plan`.
    /// Vehicle bookings of terminal plans are written as released.
    async fn replace_plan_links(&mut self, plan: &WateringPlan) -> StoreResult<()>;
    async fn set_plan_evaluation(
        &mut self,
        plan_id: i32,
        evaluation: &[EvaluationEntry],
    ) -> StoreResult<()>;
    async fn release_plan_vehicles(&mut self, plan_id: i32) -> StoreResult<()>;
    async fn delete_plan(&mut self, id: i32) -> StoreResult<()>;
    /// Unreleased bookings of any of `vehicle_ids` on `date`, ignoring
    /// `exclude_plan`.
    async fn find_vehicle_bookings(
        &mut self,
        vehicle_ids: &[i32],
        date: NaiveDate,
        exclude_plan: Option<i32>,
    ) -> StoreResult<Vec<VehicleBooking>>;
    /// Plans still `planned` whose date lies before `today`.
    async fn list_overdue_plans(&mut self, today: NaiveDate) -> StoreResult<Vec<WateringPlan>>;

    // Coordination
    /// Transaction-scoped advisory lock. Returns `false` if another
    /// transaction holds it.
    async fn try_advisory_lock(&mut self, key: i64) -> StoreResult<bool>;
}

/// A repository bound to an open transaction.
#[async_trait]
pub trait Transaction: Send {
    fn repo(&mut self) -> &mut dyn Repository;
    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// A non-transactional repository.
    async fn session(&self) -> StoreResult<Box<dyn Repository>>;
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;
    async fn ping(&self) -> StoreResult<()>;
    fn backend(&self) -> &'static str;
}

/// Run `work` inside a transaction.
///
/// Commits when `work` succeeds. Rolls back when it fails or when `cancel`
/// fires first, in which case [`Error::Cancelled`] is returned.
pub async fn run_in_tx<T, F>(store: &dyn Store, cancel: &CancellationToken, work: F) -> Result<T>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn Repository) -> BoxFuture<'t, Result<T>> + Send,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut tx = store.begin().await?;
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = work(tx.repo()) => result,
    };

    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// Open a store from a connection URL. `memory://` selects the in-memory
/// backend; anything else is handed to PostgreSQL.
pub async fn connect(url: &str, max_connections: u32) -> Result<Arc<dyn Store>> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| Error::internal(format!("failed to connect to database: {}", e)))?;
    crate::migrations::run(&pool)
        .await
        .map_err(|e| Error::internal(format!("failed to run migrations: {}", e)))?;
    Ok(Arc::new(PgStore::new(pool)))
}
