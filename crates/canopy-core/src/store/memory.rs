// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory backend.
//!
//! Mirrors the PostgreSQL schema constraints closely enough for tests and
//! single-process development (`memory://`). A transaction holds the global
//! state lock, works on a copy and writes it back on commit, so
//! transactions are fully serialized.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

use super::{
    ClusterFilter, NewCluster, NewPlan, NewSensor, NewTree, NewVehicle, PlanFilter, Repository,
    SensorFilter, Store, StoreError, StoreResult, Transaction, TreeFilter, VehicleBooking,
    VehicleFilter,
};
use crate::context::Pagination;
use crate::model::{
    Coordinate, EvaluationEntry, PlanStatus, Sensor, SensorData, SensorStatus, Tree, TreeCluster,
    Vehicle, WateringPlan,
};

#[derive(Debug, Clone)]
struct PlanEntry {
    plan: WateringPlan,
    booked_date: NaiveDate,
    released: bool,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_cluster_id: i32,
    next_tree_id: i32,
    next_vehicle_id: i32,
    next_plan_id: i32,
    clusters: BTreeMap<i32, TreeCluster>,
    trees: BTreeMap<i32, Tree>,
    sensors: BTreeMap<String, Sensor>,
    sensor_data: BTreeMap<String, BTreeMap<DateTime<Utc>, SensorData>>,
    vehicles: BTreeMap<i32, Vehicle>,
    plans: BTreeMap<i32, PlanEntry>,
}

fn conflict(operation: &'static str, constraint: &str) -> StoreError {
    StoreError::Conflict {
        operation,
        constraint: constraint.to_string(),
    }
}

fn paginate<T: Clone>(items: Vec<T>, page: Pagination) -> (Vec<T>, i64) {
    let total = items.len() as i64;
    (page.slice(&items), total)
}

impl MemoryState {
    fn cluster_view(&self, cluster: &TreeCluster) -> TreeCluster {
        let mut view = cluster.clone();
        view.tree_ids = self
            .trees
            .values()
            .filter(|t| t.tree_cluster_id == Some(cluster.id))
            .map(|t| t.id)
            .collect();
        view
    }

    fn sensor_view(&self, sensor: &Sensor) -> Sensor {
        let mut view = sensor.clone();
        view.latest_data = self
            .sensor_data
            .get(&sensor.id)
            .and_then(|readings| readings.values().next_back())
            .cloned();
        view
    }

    fn cluster(&self, id: i32) -> StoreResult<TreeCluster> {
        self.clusters
            .get(&id)
            .map(|c| self.cluster_view(c))
            .ok_or_else(|| StoreError::not_found("tree cluster", id))
    }

    fn check_tree_refs(&self, operation: &'static str, tree: &Tree) -> StoreResult<()> {
        if let Some(cluster_id) = tree.tree_cluster_id {
            if !self.clusters.contains_key(&cluster_id) {
                return Err(conflict(operation, "trees_tree_cluster_id_fkey"));
            }
        }
        if let Some(sensor_id) = &tree.sensor_id {
            if !self.sensors.contains_key(sensor_id) {
                return Err(conflict(operation, "trees_sensor_id_fkey"));
            }
            let taken = self
                .trees
                .values()
                .any(|t| t.id != tree.id && t.sensor_id.as_deref() == Some(sensor_id));
            if taken {
                return Err(conflict(operation, "trees_sensor_id_key"));
            }
        }
        Ok(())
    }

    fn check_plate(&self, operation: &'static str, plate: &str, except: i32) -> StoreResult<()> {
        let taken = self
            .vehicles
            .values()
            .any(|v| v.id != except && v.number_plate.eq_ignore_ascii_case(plate));
        if taken {
            return Err(conflict(operation, "vehicles_number_plate_key"));
        }
        Ok(())
    }

    fn bookings(
        &self,
        vehicle_ids: &[i32],
        date: NaiveDate,
        exclude_plan: Option<i32>,
    ) -> Vec<VehicleBooking> {
        let mut found = Vec::new();
        for entry in self.plans.values() {
            if entry.released || entry.booked_date != date || Some(entry.plan.id) == exclude_plan
            {
                continue;
            }
            for vehicle_id in entry.plan.vehicle_ids() {
                if vehicle_ids.contains(&vehicle_id) {
                    found.push(VehicleBooking {
                        vehicle_id,
                        plan_id: entry.plan.id,
                    });
                }
            }
        }
        found.sort_by_key(|b| b.vehicle_id);
        found
    }
}

enum Access {
    Shared(Arc<Mutex<MemoryState>>),
    Exclusive {
        guard: OwnedMutexGuard<MemoryState>,
        working: Box<MemoryState>,
    },
}

enum StateRef<'a> {
    Guard(MutexGuard<'a, MemoryState>),
    Direct(&'a mut MemoryState),
}

impl Deref for StateRef<'_> {
    type Target = MemoryState;

    fn deref(&self) -> &MemoryState {
        match self {
            StateRef::Guard(g) => &**g,
            StateRef::Direct(s) => &**s,
        }
    }
}

impl DerefMut for StateRef<'_> {
    fn deref_mut(&mut self) -> &mut MemoryState {
        match self {
            StateRef::Guard(g) => &mut **g,
            StateRef::Direct(s) => &mut **s,
        }
    }
}

/// Repository over the shared in-memory state.
pub struct MemoryRepository {
    access: Access,
}

impl MemoryRepository {
    async fn state(&mut self) -> StateRef<'_> {
        match &mut self.access {
            Access::Shared(state) => StateRef::Guard(state.lock().await),
            Access::Exclusive { working, .. } => StateRef::Direct(&mut **working),
        }
    }
}

/// In-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn session(&self) -> StoreResult<Box<dyn Repository>> {
        Ok(Box::new(MemoryRepository {
            access: Access::Shared(self.state.clone()),
        }))
    }

    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = Box::new((*guard).clone());
        Ok(Box::new(MemoryRepository {
            access: Access::Exclusive { guard, working },
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl Transaction for MemoryRepository {
    fn repo(&mut self) -> &mut dyn Repository {
        self
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        match self.access {
            Access::Exclusive { mut guard, working } => {
                *guard = *working;
                Ok(())
            }
            Access::Shared(_) => Err(StoreError::Database {
                operation: "commit",
                details: "no transaction in progress".to_string(),
            }),
        }
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    // ------------------------------------------------------------------
    // Tree clusters
    // ------------------------------------------------------------------

    async fn create_cluster(&mut self, cluster: &NewCluster) -> StoreResult<TreeCluster> {
        let mut state = self.state().await;
        state.next_cluster_id += 1;
        let now = Utc::now();
        let created = TreeCluster {
            id: state.next_cluster_id,
            name: cluster.name.clone(),
            address: cluster.address.clone(),
            description: cluster.description.clone(),
            region: cluster.region.clone(),
            coordinate: None,
            soil_condition: cluster.soil_condition,
            moisture_level: 0.0,
            watering_status: crate::model::WateringStatus::Unknown,
            archived: false,
            last_watered: None,
            tree_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        state.clusters.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_cluster(&mut self, id: i32) -> StoreResult<TreeCluster> {
        self.state().await.cluster(id)
    }

    async fn lock_cluster(&mut self, id: i32) -> StoreResult<TreeCluster> {
        self.state().await.cluster(id)
    }

    async fn get_clusters(&mut self, ids: &[i32]) -> StoreResult<Vec<TreeCluster>> {
        let state = self.state().await;
        Ok(state
            .clusters
            .values()
            .filter(|c| ids.contains(&c.id))
            .map(|c| state.cluster_view(c))
            .collect())
    }

    async fn list_clusters(
        &mut self,
        filter: &ClusterFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<TreeCluster>, i64)> {
        let state = self.state().await;
        let items: Vec<TreeCluster> = state
            .clusters
            .values()
            .filter(|c| {
                filter.watering_statuses.is_empty()
                    || filter.watering_statuses.contains(&c.watering_status)
            })
            .filter(|c| {
                filter.regions.is_empty()
                    || c.region.as_ref().is_some_and(|r| filter.regions.contains(r))
            })
            .filter(|c| filter.include_archived || !c.archived)
            .map(|c| state.cluster_view(c))
            .collect();
        Ok(paginate(items, page))
    }

    async fn update_cluster(&mut self, cluster: &TreeCluster) -> StoreResult<()> {
        let mut state = self.state().await;
        let stored = state
            .clusters
            .get_mut(&cluster.id)
            .ok_or_else(|| StoreError::not_found("tree cluster", cluster.id))?;
        let created_at = stored.created_at;
        *stored = TreeCluster {
            tree_ids: Vec::new(),
            created_at,
            updated_at: Utc::now(),
            ..cluster.clone()
        };
        Ok(())
    }

    async fn delete_cluster(&mut self, id: i32) -> StoreResult<()> {
        let mut state = self.state().await;
        if !state.clusters.contains_key(&id) {
            return Err(StoreError::not_found("tree cluster", id));
        }
        let referenced = state
            .plans
            .values()
            .any(|e| e.plan.cluster_ids.contains(&id));
        if referenced {
            return Err(conflict("delete_cluster", "plan_cluster_cluster_id_fkey"));
        }
        state.clusters.remove(&id);
        for tree in state.trees.values_mut() {
            if tree.tree_cluster_id == Some(id) {
                tree.tree_cluster_id = None;
            }
        }
        Ok(())
    }

    async fn count_plans_for_cluster(&mut self, id: i32) -> StoreResult<i64> {
        let state = self.state().await;
        Ok(state
            .plans
            .values()
            .filter(|e| e.plan.cluster_ids.contains(&id))
            .count() as i64)
    }

    // ------------------------------------------------------------------
    // Trees
    // ------------------------------------------------------------------

    async fn create_tree(&mut self, tree: &NewTree) -> StoreResult<Tree> {
        let mut state = self.state().await;
        let now = Utc::now();
        let mut created = Tree {
            id: 0,
            tree_cluster_id: tree.tree_cluster_id,
            sensor_id: tree.sensor_id.clone(),
            species: tree.species.clone(),
            number: tree.number.clone(),
            planting_year: tree.planting_year,
            coordinate: Coordinate::new(tree.latitude, tree.longitude),
            description: tree.description.clone(),
            readonly: tree.readonly,
            created_at: now,
            updated_at: now,
        };
        state.check_tree_refs("create_tree", &created)?;
        state.next_tree_id += 1;
        created.id = state.next_tree_id;
        state.trees.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_tree(&mut self, id: i32) -> StoreResult<Tree> {
        self.state()
            .await
            .trees
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("tree", id))
    }

    async fn get_trees(&mut self, ids: &[i32]) -> StoreResult<Vec<Tree>> {
        let state = self.state().await;
        Ok(state
            .trees
            .values()
            .filter(|t| ids.contains(&t.id))
            .cloned()
            .collect())
    }

    async fn get_tree_by_sensor(&mut self, sensor_id: &str) -> StoreResult<Option<Tree>> {
        let state = self.state().await;
        Ok(state
            .trees
            .values()
            .find(|t| t.sensor_id.as_deref() == Some(sensor_id))
            .cloned())
    }

    async fn list_trees(
        &mut self,
        filter: &TreeFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<Tree>, i64)> {
        let state = self.state().await;
        let items: Vec<Tree> = state
            .trees
            .values()
            .filter(|t| filter.cluster_id.is_none() || t.tree_cluster_id == filter.cluster_id)
            .filter(|t| {
                filter
                    .has_cluster
                    .is_none_or(|has| t.tree_cluster_id.is_some() == has)
            })
            .filter(|t| {
                filter.planting_years.is_empty() || filter.planting_years.contains(&t.planting_year)
            })
            .filter(|t| filter.sensor_id.is_none() || t.sensor_id == filter.sensor_id)
            .cloned()
            .collect();
        Ok(paginate(items, page))
    }

    async fn update_tree(&mut self, tree: &Tree) -> StoreResult<()> {
        let mut state = self.state().await;
        if !state.trees.contains_key(&tree.id) {
            return Err(StoreError::not_found("tree", tree.id));
        }
        state.check_tree_refs("update_tree", tree)?;
        if let Some(stored) = state.trees.get_mut(&tree.id) {
            let created_at = stored.created_at;
            *stored = Tree {
                created_at,
                updated_at: Utc::now(),
                ..tree.clone()
            };
        }
        Ok(())
    }

    async fn delete_tree(&mut self, id: i32) -> StoreResult<()> {
        self.state()
            .await
            .trees
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("tree", id))
    }

    async fn set_tree_cluster(
        &mut self,
        tree_ids: &[i32],
        cluster_id: Option<i32>,
    ) -> StoreResult<()> {
        let mut state = self.state().await;
        if let Some(id) = cluster_id {
            if !state.clusters.contains_key(&id) {
                return Err(conflict("set_tree_cluster", "trees_tree_cluster_id_fkey"));
            }
        }
        let now = Utc::now();
        for tree in state.trees.values_mut() {
            if tree_ids.contains(&tree.id) {
                tree.tree_cluster_id = cluster_id;
                tree.updated_at = now;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sensors
    // ------------------------------------------------------------------

    async fn create_sensor(&mut self, sensor: &NewSensor) -> StoreResult<Sensor> {
        let mut state = self.state().await;
        if state.sensors.contains_key(&sensor.id) {
            return Err(conflict("create_sensor", "sensors_pkey"));
        }
        let now = Utc::now();
        let created = Sensor {
            id: sensor.id.clone(),
            status: sensor.status,
            sensor_type: sensor.sensor_type.clone(),
            last_reading: None,
            latest_data: None,
            created_at: now,
            updated_at: now,
        };
        state.sensors.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn get_sensor(&mut self, id: &str) -> StoreResult<Sensor> {
        let state = self.state().await;
        state
            .sensors
            .get(id)
            .map(|s| state.sensor_view(s))
            .ok_or_else(|| StoreError::not_found("sensor", id))
    }

    async fn list_sensors(
        &mut self,
        filter: &SensorFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<Sensor>, i64)> {
        let state = self.state().await;
        let items: Vec<Sensor> = state
            .sensors
            .values()
            .filter(|s| filter.statuses.is_empty() || filter.statuses.contains(&s.status))
            .map(|s| state.sensor_view(s))
            .collect();
        Ok(paginate(items, page))
    }

    async fn update_sensor(&mut self, sensor: &Sensor) -> StoreResult<()> {
        let mut state = self.state().await;
        let stored = state
            .sensors
            .get_mut(&sensor.id)
            .ok_or_else(|| StoreError::not_found("sensor", &sensor.id))?;
        stored.status = sensor.status;
        stored.sensor_type = sensor.sensor_type.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_sensor(&mut self, id: &str) -> StoreResult<()> {
        let mut state = self.state().await;
        if state.sensors.remove(id).is_none() {
            return Err(StoreError::not_found("sensor", id));
        }
        state.sensor_data.remove(id);
        for tree in state.trees.values_mut() {
            if tree.sensor_id.as_deref() == Some(id) {
                tree.sensor_id = None;
            }
        }
        Ok(())
    }

    async fn touch_sensor(
        &mut self,
        id: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<Option<SensorStatus>> {
        let mut state = self.state().await;
        let now = Utc::now();
        match state.sensors.get_mut(id) {
            Some(sensor) => {
                let previous = sensor.status;
                sensor.status = SensorStatus::Online;
                sensor.last_reading = Some(
                    sensor
                        .last_reading
                        .map_or(seen_at, |last| last.max(seen_at)),
                );
                sensor.updated_at = now;
                Ok(Some(previous))
            }
            None => {
                state.sensors.insert(
                    id.to_string(),
                    Sensor {
                        id: id.to_string(),
                        status: SensorStatus::Online,
                        sensor_type: String::new(),
                        last_reading: Some(seen_at),
                        latest_data: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(None)
            }
        }
    }

    async fn set_sensor_status(&mut self, id: &str, status: SensorStatus) -> StoreResult<()> {
        let mut state = self.state().await;
        let sensor = state
            .sensors
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("sensor", id))?;
        sensor.status = status;
        sensor.updated_at = Utc::now();
        Ok(())
    }

    async fn list_stale_sensors(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Sensor>> {
        let state = self.state().await;
        Ok(state
            .sensors
            .values()
            .filter(|s| s.status != SensorStatus::Offline)
            .filter(|s| s.last_reading.unwrap_or(s.created_at) < cutoff)
            .map(|s| state.sensor_view(s))
            .collect())
    }

    // ------------------------------------------------------------------
    // Sensor data
    // ------------------------------------------------------------------

    async fn insert_sensor_data(&mut self, data: &SensorData) -> StoreResult<bool> {
        let mut state = self.state().await;
        if !state.sensors.contains_key(&data.sensor_id) {
            return Err(conflict("insert_sensor_data", "sensor_data_sensor_id_fkey"));
        }
        let readings = state
            .sensor_data
            .entry(data.sensor_id.clone())
            .or_default();
        if readings.contains_key(&data.received_at) {
            return Ok(false);
        }
        readings.insert(data.received_at, data.clone());
        Ok(true)
    }

    async fn list_sensor_data(
        &mut self,
        sensor_id: &str,
        page: Pagination,
    ) -> StoreResult<(Vec<SensorData>, i64)> {
        let state = self.state().await;
        let items: Vec<SensorData> = state
            .sensor_data
            .get(sensor_id)
            .map(|readings| readings.values().rev().cloned().collect())
            .unwrap_or_default();
        Ok(paginate(items, page))
    }

    async fn latest_cluster_readings(
        &mut self,
        cluster_id: i32,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorData>> {
        let state = self.state().await;
        let mut sensor_ids: Vec<&String> = state
            .trees
            .values()
            .filter(|t| t.tree_cluster_id == Some(cluster_id))
            .filter_map(|t| t.sensor_id.as_ref())
            .collect();
        sensor_ids.sort();
        Ok(sensor_ids
            .into_iter()
            .filter_map(|id| state.sensor_data.get(id))
            .filter_map(|readings| readings.values().next_back())
            .filter(|d| d.received_at >= since)
            .cloned()
            .collect())
    }

    // ------------------------------------------------------------------
    // Vehicles
    // ------------------------------------------------------------------

    async fn create_vehicle(&mut self, vehicle: &NewVehicle) -> StoreResult<Vehicle> {
        let mut state = self.state().await;
        state.check_plate("create_vehicle", &vehicle.number_plate, 0)?;
        state.next_vehicle_id += 1;
        let now = Utc::now();
        let created = Vehicle {
            id: state.next_vehicle_id,
            number_plate: vehicle.number_plate.clone(),
            description: vehicle.description.clone(),
            model: vehicle.model.clone(),
            water_capacity: vehicle.water_capacity,
            vehicle_type: vehicle.vehicle_type,
            status: vehicle.status,
            driving_license: vehicle.driving_license,
            width: vehicle.width,
            height: vehicle.height,
            length: vehicle.length,
            weight: vehicle.weight,
            created_at: now,
            updated_at: now,
        };
        state.vehicles.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_vehicle(&mut self, id: i32) -> StoreResult<Vehicle> {
        self.state()
            .await
            .vehicles
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("vehicle", id))
    }

    async fn get_vehicle_by_plate(&mut self, plate: &str) -> StoreResult<Option<Vehicle>> {
        let state = self.state().await;
        Ok(state
            .vehicles
            .values()
            .find(|v| v.number_plate.eq_ignore_ascii_case(plate))
            .cloned())
    }

    async fn list_vehicles(
        &mut self,
        filter: &VehicleFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<Vehicle>, i64)> {
        let state = self.state().await;
        let items: Vec<Vehicle> = state
            .vehicles
            .values()
            .filter(|v| filter.vehicle_type.is_none_or(|t| v.vehicle_type == t))
            .filter(|v| filter.status.is_none_or(|s| v.status == s))
            .filter(|v| {
                filter.search.as_ref().is_none_or(|q| {
                    v.number_plate
                        .to_uppercase()
                        .contains(&q.to_uppercase())
                })
            })
            .cloned()
            .collect();
        Ok(paginate(items, page))
    }

    async fn update_vehicle(&mut self, vehicle: &Vehicle) -> StoreResult<()> {
        let mut state = self.state().await;
        if !state.vehicles.contains_key(&vehicle.id) {
            return Err(StoreError::not_found("vehicle", vehicle.id));
        }
        state.check_plate("update_vehicle", &vehicle.number_plate, vehicle.id)?;
        if let Some(stored) = state.vehicles.get_mut(&vehicle.id) {
            let created_at = stored.created_at;
            *stored = Vehicle {
                created_at,
                updated_at: Utc::now(),
                ..vehicle.clone()
            };
        }
        Ok(())
    }

    async fn delete_vehicle(&mut self, id: i32) -> StoreResult<()> {
        let mut state = self.state().await;
        if !state.vehicles.contains_key(&id) {
            return Err(StoreError::not_found("vehicle", id));
        }
        let booked = state
            .plans
            .values()
            .any(|e| !e.released && e.plan.vehicle_ids().contains(&id));
        if booked {
            return Err(conflict("delete_vehicle", "plan_vehicle_vehicle_id_fkey"));
        }
        // Released bookings go with the vehicle.
        for entry in state.plans.values_mut() {
            let plan = &mut entry.plan;
            if plan.trailer_id == Some(id) {
                plan.trailer_id = None;
            }
            if plan.transporter_id == id {
                plan.transporter_id = 0;
                if plan.status != PlanStatus::Canceled {
                    plan.status = PlanStatus::Unknown;
                }
            }
        }
        state.vehicles.remove(&id);
        Ok(())
    }

    async fn count_open_plans_for_vehicle(&mut self, id: i32) -> StoreResult<i64> {
        let state = self.state().await;
        Ok(state
            .plans
            .values()
            .filter(|e| !e.released && e.plan.vehicle_ids().contains(&id))
            .count() as i64)
    }

    // ------------------------------------------------------------------
    // Watering plans
    // ------------------------------------------------------------------

    async fn create_plan(&mut self, plan: &NewPlan) -> StoreResult<i32> {
        let mut state = self.state().await;
        state.next_plan_id += 1;
        let id = state.next_plan_id;
        let now = Utc::now();
        let created = WateringPlan {
            id,
            date: plan.date,
            description: plan.description.clone(),
            status: plan.status,
            transporter_id: 0,
            trailer_id: None,
            cluster_ids: Vec::new(),
            user_ids: Vec::new(),
            total_water_required: plan.total_water_required,
            distance: None,
            gpx_url: None,
            refills: plan.refills,
            cancellation_note: String::new(),
            evaluation: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        state.plans.insert(
            id,
            PlanEntry {
                plan: created,
                booked_date: plan.date,
                released: true,
            },
        );
        Ok(id)
    }

    async fn get_plan(&mut self, id: i32) -> StoreResult<WateringPlan> {
        self.state()
            .await
            .plans
            .get(&id)
            .map(|e| e.plan.clone())
            .ok_or_else(|| StoreError::not_found("watering plan", id))
    }

    async fn lock_plan(&mut self, id: i32) -> StoreResult<WateringPlan> {
        self.get_plan(id).await
    }

    async fn list_plans(
        &mut self,
        filter: &PlanFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<WateringPlan>, i64)> {
        let state = self.state().await;
        let mut items: Vec<WateringPlan> = state
            .plans
            .values()
            .map(|e| &e.plan)
            .filter(|p| filter.statuses.is_empty() || filter.statuses.contains(&p.status))
            .filter(|p| filter.date_from.is_none_or(|from| p.date >= from))
            .filter(|p| filter.date_to.is_none_or(|to| p.date <= to))
            .cloned()
            .collect();
        items.sort_by_key(|p| (p.date, p.id));
        Ok(paginate(items, page))
    }

    async fn update_plan(&mut self, plan: &WateringPlan) -> StoreResult<()> {
        let mut state = self.state().await;
        let entry = state
            .plans
            .get_mut(&plan.id)
            .ok_or_else(|| StoreError::not_found("watering plan", plan.id))?;
        let stored = &mut entry.plan;
        stored.date = plan.date;
        stored.description = plan.description.clone();
        stored.status = plan.status;
        stored.total_water_required = plan.total_water_required;
        stored.distance = plan.distance;
        stored.gpx_url = plan.gpx_url.clone();
        stored.refills = plan.refills;
        stored.cancellation_note = plan.cancellation_note.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn replace_plan_links(&mut self, plan: &WateringPlan) -> StoreResult<()> {
        let mut state = self.state().await;
        if !state.plans.contains_key(&plan.id) {
            return Err(StoreError::not_found("watering plan", plan.id));
        }
        if plan.cluster_ids.iter().any(|id| !state.clusters.contains_key(id)) {
            return Err(conflict(
                "replace_plan_links",
                "plan_cluster_cluster_id_fkey",
            ));
        }
        if plan
            .vehicle_ids()
            .iter()
            .any(|id| !state.vehicles.contains_key(id))
        {
            return Err(conflict("book_vehicle", "plan_vehicle_vehicle_id_fkey"));
        }

        let released = plan.status.is_terminal();
        if !released
            && !state
                .bookings(&plan.vehicle_ids(), plan.date, Some(plan.id))
                .is_empty()
        {
            return Err(conflict("book_vehicle", "plan_vehicle_booking_key"));
        }

        if let Some(entry) = state.plans.get_mut(&plan.id) {
            entry.plan.transporter_id = plan.transporter_id;
            entry.plan.trailer_id = plan.trailer_id;
            entry.plan.cluster_ids = plan.cluster_ids.clone();
            entry.plan.user_ids = plan.user_ids.clone();
            entry.plan.evaluation.clear();
            entry.booked_date = plan.date;
            entry.released = released;
        }
        Ok(())
    }

    async fn set_plan_evaluation(
        &mut self,
        plan_id: i32,
        evaluation: &[EvaluationEntry],
    ) -> StoreResult<()> {
        let mut state = self.state().await;
        let entry = state
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| StoreError::not_found("watering plan", plan_id))?;
        let mut merged: Vec<EvaluationEntry> = Vec::new();
        for cluster_id in &entry.plan.cluster_ids {
            let update = evaluation.iter().find(|e| e.cluster_id == *cluster_id);
            let existing = entry
                .plan
                .evaluation
                .iter()
                .find(|e| e.cluster_id == *cluster_id);
            if let Some(e) = update.or(existing) {
                merged.push(*e);
            }
        }
        entry.plan.evaluation = merged;
        Ok(())
    }

    async fn release_plan_vehicles(&mut self, plan_id: i32) -> StoreResult<()> {
        if let Some(entry) = self.state().await.plans.get_mut(&plan_id) {
            entry.released = true;
        }
        Ok(())
    }

    async fn delete_plan(&mut self, id: i32) -> StoreResult<()> {
        self.state()
            .await
            .plans
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("watering plan", id))
    }

    async fn find_vehicle_bookings(
        &mut self,
        vehicle_ids: &[i32],
        date: NaiveDate,
        exclude_plan: Option<i32>,
    ) -> StoreResult<Vec<VehicleBooking>> {
        Ok(self.state().await.bookings(vehicle_ids, date, exclude_plan))
    }

    async fn list_overdue_plans(&mut self, today: NaiveDate) -> StoreResult<Vec<WateringPlan>> {
        let state = self.state().await;
        Ok(state
            .plans
            .values()
            .map(|e| &e.plan)
            .filter(|p| p.status == PlanStatus::Planned && p.date < today)
            .cloned()
            .collect())
    }

    async fn try_advisory_lock(&mut self, _key: i64) -> StoreResult<bool> {
        // Transactions are already serialized by the state lock.
        Ok(true)
    }
}
