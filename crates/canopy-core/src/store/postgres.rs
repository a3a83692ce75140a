// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL backend.
//!
//! [`PgRepository`] is generic over the connection it drives so that the
//! same queries serve pooled sessions and open transactions.

use std::ops::DerefMut;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres};

use super::{
    ClusterFilter, NewCluster, NewPlan, NewSensor, NewTree, NewVehicle, PlanFilter, Repository,
    SensorFilter, Store, StoreError, StoreResult, Transaction, TreeFilter, VehicleBooking,
    VehicleFilter,
};
use crate::context::Pagination;
use crate::model::{
    Coordinate, DrivingLicense, EvaluationEntry, PlanStatus, Sensor, SensorData, SensorStatus,
    SoilCondition, Tree, TreeCluster, Vehicle, VehicleStatus, VehicleType, Watermark, WateringPlan,
    WateringStatus,
};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn session(&self) -> StoreResult<Box<dyn Repository>> {
        let conn = self.pool.acquire().await.map_err(db_error("acquire"))?;
        Ok(Box::new(PgRepository { conn }))
    }

    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let conn = self.pool.begin().await.map_err(db_error("begin"))?;
        Ok(Box::new(PgRepository { conn }))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error("ping"))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// Map a driver error, tagging it with the operation that raised it.
/// Unique and foreign-key violations surface as conflicts.
fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| {
        if let sqlx::Error::Database(db) = &err {
            if matches!(db.code().as_deref(), Some("23505") | Some("23503")) {
                return StoreError::Conflict {
                    operation,
                    constraint: db.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        StoreError::Database {
            operation,
            details: err.to_string(),
        }
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() { None } else { Some(items) }
}

fn window(page: Pagination) -> (Option<i64>, i64) {
    match page.window() {
        Some((limit, offset)) => (Some(limit), offset),
        None => (None, 0),
    }
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(sqlx::FromRow)]
struct ClusterRow {
    id: i32,
    name: String,
    address: String,
    description: String,
    region: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    soil_condition: String,
    moisture_level: f64,
    watering_status: String,
    archived: bool,
    last_watered: Option<DateTime<Utc>>,
    tree_ids: Vec<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ClusterRow> for TreeCluster {
    fn from(row: ClusterRow) -> Self {
        let coordinate = match (row.latitude, row.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
            _ => None,
        };
        TreeCluster {
            id: row.id,
            name: row.name,
            address: row.address,
            description: row.description,
            region: row.region,
            coordinate,
            soil_condition: SoilCondition::from_stored(&row.soil_condition),
            moisture_level: row.moisture_level,
            watering_status: WateringStatus::from_stored(&row.watering_status),
            archived: row.archived,
            last_watered: row.last_watered,
            tree_ids: row.tree_ids,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const CLUSTER_SELECT: &str = r#"
    SELECT c.id, c.name, c.address, c.description, c.region, c.latitude, c.longitude,
           c.soil_condition, c.moisture_level, c.watering_status, c.archived,
           c.last_watered, c.created_at, c.updated_at,
           ARRAY(SELECT t.id FROM trees t WHERE t.tree_cluster_id = c.id ORDER BY t.id) AS tree_ids
    FROM tree_clusters c
"#;

#[derive(sqlx::FromRow)]
struct TreeRow {
    id: i32,
    tree_cluster_id: Option<i32>,
    sensor_id: Option<String>,
    species: String,
    number: String,
    planting_year: i32,
    latitude: f64,
    longitude: f64,
    description: String,
    readonly: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TreeRow> for Tree {
    fn from(row: TreeRow) -> Self {
        Tree {
            id: row.id,
            tree_cluster_id: row.tree_cluster_id,
            sensor_id: row.sensor_id,
            species: row.species,
            number: row.number,
            planting_year: row.planting_year,
            coordinate: Coordinate::new(row.latitude, row.longitude),
            description: row.description,
            readonly: row.readonly,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const TREE_SELECT: &str = r#"
    SELECT id, tree_cluster_id, sensor_id, species, number, planting_year,
           latitude, longitude, description, readonly, created_at, updated_at
    FROM trees
"#;

#[derive(sqlx::FromRow)]
struct SensorDataRow {
    sensor_id: String,
    received_at: DateTime<Utc>,
    battery: f64,
    humidity: f64,
    temperature: f64,
    watermarks: Json<Vec<Watermark>>,
}

impl From<SensorDataRow> for SensorData {
    fn from(row: SensorDataRow) -> Self {
        SensorData {
            sensor_id: row.sensor_id,
            received_at: row.received_at,
            battery: row.battery,
            humidity: row.humidity,
            temperature: row.temperature,
            watermarks: row.watermarks.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    id: String,
    status: String,
    sensor_type: String,
    last_reading: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    data_received_at: Option<DateTime<Utc>>,
    data_battery: Option<f64>,
    data_humidity: Option<f64>,
    data_temperature: Option<f64>,
    data_watermarks: Option<Json<Vec<Watermark>>>,
}

impl From<SensorRow> for Sensor {
    fn from(row: SensorRow) -> Self {
        let latest_data = row.data_received_at.map(|received_at| SensorData {
            sensor_id: row.id.clone(),
            received_at,
            battery: row.data_battery.unwrap_or_default(),
            humidity: row.data_humidity.unwrap_or_default(),
            temperature: row.data_temperature.unwrap_or_default(),
            watermarks: row.data_watermarks.map(|w| w.0).unwrap_or_default(),
        });
        Sensor {
            id: row.id,
            status: SensorStatus::from_stored(&row.status),
            sensor_type: row.sensor_type,
            last_reading: row.last_reading,
            latest_data,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const SENSOR_SELECT: &str = r#"
    SELECT s.id, s.status, s.sensor_type, s.last_reading, s.created_at, s.updated_at,
           d.received_at AS data_received_at, d.battery AS data_battery,
           d.humidity AS data_humidity, d.temperature AS data_temperature,
           d.watermarks AS data_watermarks
    FROM sensors s
    LEFT JOIN LATERAL (
        SELECT received_at, battery, humidity, temperature, watermarks
        FROM sensor_data
        WHERE sensor_id = s.id
        ORDER BY received_at DESC
        LIMIT 1
    ) d ON TRUE
"#;

#[derive(sqlx::FromRow)]
struct VehicleRow {
    id: i32,
    number_plate: String,
    description: String,
    model: String,
    water_capacity: f64,
    vehicle_type: String,
    status: String,
    driving_license: String,
    width: f64,
    height: f64,
    length: f64,
    weight: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<VehicleRow> for Vehicle {
    fn from(row: VehicleRow) -> Self {
        Vehicle {
            id: row.id,
            number_plate: row.number_plate,
            description: row.description,
            model: row.model,
            water_capacity: row.water_capacity,
            vehicle_type: VehicleType::from_stored(&row.vehicle_type),
            status: VehicleStatus::from_stored(&row.status),
            driving_license: DrivingLicense::from_stored(&row.driving_license),
            width: row.width,
            height: row.height,
            length: row.length,
            weight: row.weight,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const VEHICLE_SELECT: &str = r#"
    SELECT id, number_plate, description, model, water_capacity, vehicle_type, status,
           driving_license, width, height, length, weight, created_at, updated_at
    FROM vehicles
"#;

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: i32,
    date: NaiveDate,
    description: String,
    status: String,
    total_water_required: f64,
    distance: Option<f64>,
    gpx_url: Option<String>,
    refills: i32,
    cancellation_note: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    transporter_id: Option<i32>,
    trailer_id: Option<i32>,
    cluster_ids: Vec<i32>,
    user_ids: Vec<String>,
    evaluation: Json<Vec<EvaluationEntry>>,
}

impl From<PlanRow> for WateringPlan {
    fn from(row: PlanRow) -> Self {
        // A plan without a transporter link cannot be trusted unless canceled.
        let stored = PlanStatus::from_stored(&row.status);
        let status = match row.transporter_id {
            Some(_) => stored,
            None if stored == PlanStatus::Canceled => stored,
            None => PlanStatus::Unknown,
        };
        WateringPlan {
            id: row.id,
            date: row.date,
            description: row.description,
            status,
            transporter_id: row.transporter_id.unwrap_or_default(),
            trailer_id: row.trailer_id,
            cluster_ids: row.cluster_ids,
            user_ids: row.user_ids,
            total_water_required: row.total_water_required,
            distance: row.distance,
            gpx_url: row.gpx_url,
            refills: row.refills,
            cancellation_note: row.cancellation_note,
            evaluation: row.evaluation.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const PLAN_SELECT: &str = r#"
    SELECT p.id, p.date, p.description, p.status, p.total_water_required, p.distance,
           p.gpx_url, p.refills, p.cancellation_note, p.created_at, p.updated_at,
           (SELECT pv.vehicle_id FROM plan_vehicle pv
             WHERE pv.plan_id = p.id AND pv.role = 'transporter') AS transporter_id,
           (SELECT pv.vehicle_id FROM plan_vehicle pv
             WHERE pv.plan_id = p.id AND pv.role = 'trailer') AS trailer_id,
           ARRAY(SELECT pc.cluster_id FROM plan_cluster pc
                  WHERE pc.plan_id = p.id ORDER BY pc.position) AS cluster_ids,
           ARRAY(SELECT pu.user_id FROM plan_user pu
                  WHERE pu.plan_id = p.id ORDER BY pu.position) AS user_ids,
           COALESCE((
               SELECT json_agg(json_build_object(
                          'cluster_id', pc.cluster_id,
                          'consumed_water_litres', pc.consumed_water)
                      ORDER BY pc.position)
               FROM plan_cluster pc
               WHERE pc.plan_id = p.id AND pc.consumed_water IS NOT NULL
           ), '[]'::json) AS evaluation
    FROM watering_plans p
"#;

// ============================================================================
// Repository
// ============================================================================

/// Repository over any PostgreSQL connection handle.
pub struct PgRepository<C> {
    conn: C,
}

impl<C> PgRepository<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    fn conn(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

#[async_trait]
impl Transaction for PgRepository<sqlx::Transaction<'static, Postgres>> {
    fn repo(&mut self) -> &mut dyn Repository {
        self
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.conn.commit().await.map_err(db_error("commit"))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.conn.rollback().await.map_err(db_error("rollback"))
    }
}

// Keep the pooled variant nameable for callers that want a concrete type.
pub type PgSession = PgRepository<PoolConnection<Postgres>>;

#[async_trait]
impl<C> Repository for PgRepository<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    // ------------------------------------------------------------------
    // Tree clusters
    // ------------------------------------------------------------------

    async fn create_cluster(&mut self, cluster: &NewCluster) -> StoreResult<TreeCluster> {
        let id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO tree_clusters (name, address, description, region, soil_condition)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&cluster.name)
        .bind(&cluster.address)
        .bind(&cluster.description)
        .bind(&cluster.region)
        .bind(cluster.soil_condition.as_str())
        .fetch_one(self.conn())
        .await
        .map_err(db_error("create_cluster"))?;

        self.get_cluster(id).await
    }

    async fn get_cluster(&mut self, id: i32) -> StoreResult<TreeCluster> {
        let sql = format!("{} WHERE c.id = $1", CLUSTER_SELECT);
        sqlx::query_as::<_, ClusterRow>(&sql)
            .bind(id)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error("get_cluster"))?
            .map(Into::into)
            .ok_or_else(|| StoreError::not_found("tree cluster", id))
    }

    async fn lock_cluster(&mut self, id: i32) -> StoreResult<TreeCluster> {
        let sql = format!("{} WHERE c.id = $1 FOR UPDATE OF c", CLUSTER_SELECT);
        sqlx::query_as::<_, ClusterRow>(&sql)
            .bind(id)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error("lock_cluster"))?
            .map(Into::into)
            .ok_or_else(|| StoreError::not_found("tree cluster", id))
    }

    async fn get_clusters(&mut self, ids: &[i32]) -> StoreResult<Vec<TreeCluster>> {
        let sql = format!("{} WHERE c.id = ANY($1) ORDER BY c.id", CLUSTER_SELECT);
        let rows = sqlx::query_as::<_, ClusterRow>(&sql)
            .bind(ids)
            .fetch_all(self.conn())
            .await
            .map_err(db_error("get_clusters"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_clusters(
        &mut self,
        filter: &ClusterFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<TreeCluster>, i64)> {
        const WHERE: &str = r#"
            WHERE ($1::TEXT[] IS NULL OR c.watering_status = ANY($1))
              AND ($2::TEXT[] IS NULL OR c.region = ANY($2))
              AND ($3 OR NOT c.archived)
        "#;
        let statuses = non_empty(
            filter
                .watering_statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
        );
        let regions = non_empty(filter.regions.clone());
        let (limit, offset) = window(page);

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM tree_clusters c {}",
            WHERE
        ))
        .bind(&statuses)
        .bind(&regions)
        .bind(filter.include_archived)
        .fetch_one(self.conn())
        .await
        .map_err(db_error("list_clusters"))?;

        let sql = format!(
            "{} {} ORDER BY c.id LIMIT $4 OFFSET $5",
            CLUSTER_SELECT, WHERE
        );
        let rows = sqlx::query_as::<_, ClusterRow>(&sql)
            .bind(&statuses)
            .bind(&regions)
            .bind(filter.include_archived)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.conn())
            .await
            .map_err(db_error("list_clusters"))?;

        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    async fn update_cluster(&mut self, cluster: &TreeCluster) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tree_clusters
            SET name = $2, address = $3, description = $4, region = $5,
                latitude = $6, longitude = $7, soil_condition = $8,
                moisture_level = $9, watering_status = $10, archived = $11,
                last_watered = $12, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(cluster.id)
        .bind(&cluster.name)
        .bind(&cluster.address)
        .bind(&cluster.description)
        .bind(&cluster.region)
        .bind(cluster.coordinate.map(|c| c.latitude))
        .bind(cluster.coordinate.map(|c| c.longitude))
        .bind(cluster.soil_condition.as_str())
        .bind(cluster.moisture_level)
        .bind(cluster.watering_status.as_str())
        .bind(cluster.archived)
        .bind(cluster.last_watered)
        .execute(self.conn())
        .await
        .map_err(db_error("update_cluster"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("tree cluster", cluster.id));
        }
        Ok(())
    }

    async fn delete_cluster(&mut self, id: i32) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM tree_clusters WHERE id = $1")
            .bind(id)
            .execute(self.conn())
            .await
            .map_err(db_error("delete_cluster"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("tree cluster", id));
        }
        Ok(())
    }

    async fn count_plans_for_cluster(&mut self, id: i32) -> StoreResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM plan_cluster WHERE cluster_id = $1")
            .bind(id)
            .fetch_one(self.conn())
            .await
            .map_err(db_error("count_plans_for_cluster"))
    }

    // ------------------------------------------------------------------
    // Trees
    // ------------------------------------------------------------------

    async fn create_tree(&mut self, tree: &NewTree) -> StoreResult<Tree> {
        let sql = r#"
            INSERT INTO trees (tree_cluster_id, sensor_id, species, number, planting_year,
                               latitude, longitude, description, readonly)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, tree_cluster_id, sensor_id, species, number, planting_year,
                      latitude, longitude, description, readonly, created_at, updated_at
        "#;
        let row = sqlx::query_as::<_, TreeRow>(sql)
            .bind(tree.tree_cluster_id)
            .bind(&tree.sensor_id)
            .bind(&tree.species)
            .bind(&tree.number)
            .bind(tree.planting_year)
            .bind(tree.latitude)
            .bind(tree.longitude)
            .bind(&tree.description)
            .bind(tree.readonly)
            .fetch_one(self.conn())
            .await
            .map_err(db_error("create_tree"))?;
        Ok(row.into())
    }

    async fn get_tree(&mut self, id: i32) -> StoreResult<Tree> {
        let sql = format!("{} WHERE id = $1", TREE_SELECT);
        sqlx::query_as::<_, TreeRow>(&sql)
            .bind(id)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error("get_tree"))?
            .map(Into::into)
            .ok_or_else(|| StoreError::not_found("tree", id))
    }

    async fn get_trees(&mut self, ids: &[i32]) -> StoreResult<Vec<Tree>> {
        let sql = format!("{} WHERE id = ANY($1) ORDER BY id", TREE_SELECT);
        let rows = sqlx::query_as::<_, TreeRow>(&sql)
            .bind(ids)
            .fetch_all(self.conn())
            .await
            .map_err(db_error("get_trees"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_tree_by_sensor(&mut self, sensor_id: &str) -> StoreResult<Option<Tree>> {
        let sql = format!("{} WHERE sensor_id = $1", TREE_SELECT);
        let row = sqlx::query_as::<_, TreeRow>(&sql)
            .bind(sensor_id)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error("get_tree_by_sensor"))?;
        Ok(row.map(Into::into))
    }

    async fn list_trees(
        &mut self,
        filter: &TreeFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<Tree>, i64)> {
        const WHERE: &str = r#"
            WHERE ($1::INT IS NULL OR tree_cluster_id = $1)
              AND ($2::BOOL IS NULL OR (tree_cluster_id IS NOT NULL) = $2)
              AND ($3::INT[] IS NULL OR planting_year = ANY($3))
              AND ($4::TEXT IS NULL OR sensor_id = $4)
        "#;
        let years = non_empty(filter.planting_years.clone());
        let (limit, offset) = window(page);

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM trees {}", WHERE))
            .bind(filter.cluster_id)
            .bind(filter.has_cluster)
            .bind(&years)
            .bind(&filter.sensor_id)
            .fetch_one(self.conn())
            .await
            .map_err(db_error("list_trees"))?;

        let sql = format!("{} {} ORDER BY id LIMIT $5 OFFSET $6", TREE_SELECT, WHERE);
        let rows = sqlx::query_as::<_, TreeRow>(&sql)
            .bind(filter.cluster_id)
            .bind(filter.has_cluster)
            .bind(&years)
            .bind(&filter.sensor_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.conn())
            .await
            .map_err(db_error("list_trees"))?;

        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    async fn update_tree(&mut self, tree: &Tree) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE trees
            SET tree_cluster_id = $2, sensor_id = $3, species = $4, number = $5,
                planting_year = $6, latitude = $7, longitude = $8, description = $9,
                readonly = $10, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(tree.id)
        .bind(tree.tree_cluster_id)
        .bind(&tree.sensor_id)
        .bind(&tree.species)
        .bind(&tree.number)
        .bind(tree.planting_year)
        .bind(tree.coordinate.latitude)
        .bind(tree.coordinate.longitude)
        .bind(&tree.description)
        .bind(tree.readonly)
        .execute(self.conn())
        .await
        .map_err(db_error("update_tree"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("tree", tree.id));
        }
        Ok(())
    }

    async fn delete_tree(&mut self, id: i32) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM trees WHERE id = $1")
            .bind(id)
            .execute(self.conn())
            .await
            .map_err(db_error("delete_tree"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("tree", id));
        }
        Ok(())
    }

    async fn set_tree_cluster(
        &mut self,
        tree_ids: &[i32],
        cluster_id: Option<i32>,
    ) -> StoreResult<()> {
        if tree_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE trees SET tree_cluster_id = $2, updated_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(tree_ids)
        .bind(cluster_id)
        .execute(self.conn())
        .await
        .map_err(db_error("set_tree_cluster"))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sensors
    // ------------------------------------------------------------------

    async fn create_sensor(&mut self, sensor: &NewSensor) -> StoreResult<Sensor> {
        sqlx::query(
            r#"
            INSERT INTO sensors (id, status, sensor_type)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&sensor.id)
        .bind(sensor.status.as_str())
        .bind(&sensor.sensor_type)
        .execute(self.conn())
        .await
        .map_err(db_error("create_sensor"))?;

        self.get_sensor(&sensor.id).await
    }

    async fn get_sensor(&mut self, id: &str) -> StoreResult<Sensor> {
        let sql = format!("{} WHERE s.id = $1", SENSOR_SELECT);
        sqlx::query_as::<_, SensorRow>(&sql)
            .bind(id)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error("get_sensor"))?
            .map(Into::into)
            .ok_or_else(|| StoreError::not_found("sensor", id))
    }

    async fn list_sensors(
        &mut self,
        filter: &SensorFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<Sensor>, i64)> {
        const WHERE: &str = "WHERE ($1::TEXT[] IS NULL OR s.status = ANY($1))";
        let statuses = non_empty(
            filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
        );
        let (limit, offset) = window(page);

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM sensors s {}", WHERE))
                .bind(&statuses)
                .fetch_one(self.conn())
                .await
                .map_err(db_error("list_sensors"))?;

        let sql = format!(
            "{} {} ORDER BY s.id LIMIT $2 OFFSET $3",
            SENSOR_SELECT, WHERE
        );
        let rows = sqlx::query_as::<_, SensorRow>(&sql)
            .bind(&statuses)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.conn())
            .await
            .map_err(db_error("list_sensors"))?;

        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    async fn update_sensor(&mut self, sensor: &Sensor) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sensors SET status = $2, sensor_type = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&sensor.id)
        .bind(sensor.status.as_str())
        .bind(&sensor.sensor_type)
        .execute(self.conn())
        .await
        .map_err(db_error("update_sensor"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("sensor", &sensor.id));
        }
        Ok(())
    }

    async fn delete_sensor(&mut self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM sensors WHERE id = $1")
            .bind(id)
            .execute(self.conn())
            .await
            .map_err(db_error("delete_sensor"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("sensor", id));
        }
        Ok(())
    }

    async fn touch_sensor(
        &mut self,
        id: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<Option<SensorStatus>> {
        let previous: Option<String> =
            sqlx::query_scalar("SELECT status FROM sensors WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(self.conn())
                .await
                .map_err(db_error("touch_sensor"))?;

        sqlx::query(
            r#"
            INSERT INTO sensors (id, status, last_reading)
            VALUES ($1, 'online', $2)
            ON CONFLICT (id) DO UPDATE
            SET status = 'online',
                last_reading = GREATEST(sensors.last_reading, EXCLUDED.last_reading),
                updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(seen_at)
        .execute(self.conn())
        .await
        .map_err(db_error("touch_sensor"))?;

        Ok(previous.map(|s| SensorStatus::from_stored(&s)))
    }

    async fn set_sensor_status(&mut self, id: &str, status: SensorStatus) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE sensors SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(status.as_str())
                .execute(self.conn())
                .await
                .map_err(db_error("set_sensor_status"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("sensor", id));
        }
        Ok(())
    }

    async fn list_stale_sensors(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Sensor>> {
        let sql = format!(
            "{} WHERE s.status <> 'offline' AND COALESCE(s.last_reading, s.created_at) < $1 ORDER BY s.id",
            SENSOR_SELECT
        );
        let rows = sqlx::query_as::<_, SensorRow>(&sql)
            .bind(cutoff)
            .fetch_all(self.conn())
            .await
            .map_err(db_error("list_stale_sensors"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ------------------------------------------------------------------
    // Sensor data
    // ------------------------------------------------------------------

    async fn insert_sensor_data(&mut self, data: &SensorData) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sensor_data (sensor_id, received_at, battery, humidity, temperature, watermarks)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (sensor_id, received_at) DO NOTHING
            "#,
        )
        .bind(&data.sensor_id)
        .bind(data.received_at)
        .bind(data.battery)
        .bind(data.humidity)
        .bind(data.temperature)
        .bind(Json(&data.watermarks))
        .execute(self.conn())
        .await
        .map_err(db_error("insert_sensor_data"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_sensor_data(
        &mut self,
        sensor_id: &str,
        page: Pagination,
    ) -> StoreResult<(Vec<SensorData>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_data WHERE sensor_id = $1")
            .bind(sensor_id)
            .fetch_one(self.conn())
            .await
            .map_err(db_error("list_sensor_data"))?;

        let (limit, offset) = window(page);
        let rows = sqlx::query_as::<_, SensorDataRow>(
            r#"
            SELECT sensor_id, received_at, battery, humidity, temperature, watermarks
            FROM sensor_data
            WHERE sensor_id = $1
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(sensor_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.conn())
        .await
        .map_err(db_error("list_sensor_data"))?;

        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    async fn latest_cluster_readings(
        &mut self,
        cluster_id: i32,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorData>> {
        let rows = sqlx::query_as::<_, SensorDataRow>(
            r#"
            SELECT DISTINCT ON (d.sensor_id)
                   d.sensor_id, d.received_at, d.battery, d.humidity, d.temperature, d.watermarks
            FROM sensor_data d
            JOIN trees t ON t.sensor_id = d.sensor_id
            WHERE t.tree_cluster_id = $1 AND d.received_at >= $2
            ORDER BY d.sensor_id, d.received_at DESC
            "#,
        )
        .bind(cluster_id)
        .bind(since)
        .fetch_all(self.conn())
        .await
        .map_err(db_error("latest_cluster_readings"))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ------------------------------------------------------------------
    // Vehicles
    // ------------------------------------------------------------------

    async fn create_vehicle(&mut self, vehicle: &NewVehicle) -> StoreResult<Vehicle> {
        let row = sqlx::query_as::<_, VehicleRow>(
            r#"
            INSERT INTO vehicles (number_plate, description, model, water_capacity, vehicle_type,
                                  status, driving_license, width, height, length, weight)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, number_plate, description, model, water_capacity, vehicle_type, status,
                      driving_license, width, height, length, weight, created_at, updated_at
            "#,
        )
        .bind(&vehicle.number_plate)
        .bind(&vehicle.description)
        .bind(&vehicle.model)
        .bind(vehicle.water_capacity)
        .bind(vehicle.vehicle_type.as_str())
        .bind(vehicle.status.as_str())
        .bind(vehicle.driving_license.as_str())
        .bind(vehicle.width)
        .bind(vehicle.height)
        .bind(vehicle.length)
        .bind(vehicle.weight)
        .fetch_one(self.conn())
        .await
        .map_err(db_error("create_vehicle"))?;
        Ok(row.into())
    }

    async fn get_vehicle(&mut self, id: i32) -> StoreResult<Vehicle> {
        let sql = format!("{} WHERE id = $1", VEHICLE_SELECT);
        sqlx::query_as::<_, VehicleRow>(&sql)
            .bind(id)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error("get_vehicle"))?
            .map(Into::into)
            .ok_or_else(|| StoreError::not_found("vehicle", id))
    }

    async fn get_vehicle_by_plate(&mut self, plate: &str) -> StoreResult<Option<Vehicle>> {
        let sql = format!("{} WHERE UPPER(number_plate) = UPPER($1)", VEHICLE_SELECT);
        let row = sqlx::query_as::<_, VehicleRow>(&sql)
            .bind(plate)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error("get_vehicle_by_plate"))?;
        Ok(row.map(Into::into))
    }

    async fn list_vehicles(
        &mut self,
        filter: &VehicleFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<Vehicle>, i64)> {
        const WHERE: &str = r#"
            WHERE ($1::TEXT IS NULL OR vehicle_type = $1)
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR number_plate ILIKE '%' || $3 || '%')
        "#;
        let vehicle_type = filter.vehicle_type.map(|t| t.as_str());
        let status = filter.status.map(|s| s.as_str());
        let (limit, offset) = window(page);

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM vehicles {}", WHERE))
            .bind(vehicle_type)
            .bind(status)
            .bind(&filter.search)
            .fetch_one(self.conn())
            .await
            .map_err(db_error("list_vehicles"))?;

        let sql = format!("{} {} ORDER BY id LIMIT $4 OFFSET $5", VEHICLE_SELECT, WHERE);
        let rows = sqlx::query_as::<_, VehicleRow>(&sql)
            .bind(vehicle_type)
            .bind(status)
            .bind(&filter.search)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.conn())
            .await
            .map_err(db_error("list_vehicles"))?;

        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    async fn update_vehicle(&mut self, vehicle: &Vehicle) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE vehicles
            SET number_plate = $2, description = $3, model = $4, water_capacity = $5,
                vehicle_type = $6, status = $7, driving_license = $8, width = $9,
                height = $10, length = $11, weight = $12, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(vehicle.id)
        .bind(&vehicle.number_plate)
        .bind(&vehicle.description)
        .bind(&vehicle.model)
        .bind(vehicle.water_capacity)
        .bind(vehicle.vehicle_type.as_str())
        .bind(vehicle.status.as_str())
        .bind(vehicle.driving_license.as_str())
        .bind(vehicle.width)
        .bind(vehicle.height)
        .bind(vehicle.length)
        .bind(vehicle.weight)
        .execute(self.conn())
        .await
        .map_err(db_error("update_vehicle"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("vehicle", vehicle.id));
        }
        Ok(())
    }

    async fn delete_vehicle(&mut self, id: i32) -> StoreResult<()> {
        // Open bookings still hold the foreign key.
        sqlx::query("DELETE FROM plan_vehicle WHERE vehicle_id = $1 AND released")
            .bind(id)
            .execute(self.conn())
            .await
            .map_err(db_error("delete_vehicle"))?;
        let result = sqlx::query("DELETE FROM vehicles WHERE id = $1")
            .bind(id)
            .execute(self.conn())
            .await
            .map_err(db_error("delete_vehicle"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("vehicle", id));
        }
        Ok(())
    }

    async fn count_open_plans_for_vehicle(&mut self, id: i32) -> StoreResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM plan_vehicle WHERE vehicle_id = $1 AND NOT released",
        )
        .bind(id)
        .fetch_one(self.conn())
        .await
        .map_err(db_error("count_open_plans_for_vehicle"))
    }

    // ------------------------------------------------------------------
    // Watering plans
    // ------------------------------------------------------------------

    async fn create_plan(&mut self, plan: &NewPlan) -> StoreResult<i32> {
        sqlx::query_scalar(
            r#"
            INSERT INTO watering_plans (date, description, status, total_water_required, refills)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(plan.date)
        .bind(&plan.description)
        .bind(plan.status.as_str())
        .bind(plan.total_water_required)
        .bind(plan.refills)
        .fetch_one(self.conn())
        .await
        .map_err(db_error("create_plan"))
    }

    async fn get_plan(&mut self, id: i32) -> StoreResult<WateringPlan> {
        let sql = format!("{} WHERE p.id = $1", PLAN_SELECT);
        sqlx::query_as::<_, PlanRow>(&sql)
            .bind(id)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error("get_plan"))?
            .map(Into::into)
            .ok_or_else(|| StoreError::not_found("watering plan", id))
    }

    async fn lock_plan(&mut self, id: i32) -> StoreResult<WateringPlan> {
        let sql = format!("{} WHERE p.id = $1 FOR UPDATE OF p", PLAN_SELECT);
        sqlx::query_as::<_, PlanRow>(&sql)
            .bind(id)
            .fetch_optional(self.conn())
            .await
            .map_err(db_error("lock_plan"))?
            .map(Into::into)
            .ok_or_else(|| StoreError::not_found("watering plan", id))
    }

    async fn list_plans(
        &mut self,
        filter: &PlanFilter,
        page: Pagination,
    ) -> StoreResult<(Vec<WateringPlan>, i64)> {
        const WHERE: &str = r#"
            WHERE ($1::TEXT[] IS NULL OR p.status = ANY($1))
              AND ($2::DATE IS NULL OR p.date >= $2)
              AND ($3::DATE IS NULL OR p.date <= $3)
        "#;
        let statuses = non_empty(
            filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
        );
        let (limit, offset) = window(page);

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM watering_plans p {}", WHERE))
                .bind(&statuses)
                .bind(filter.date_from)
                .bind(filter.date_to)
                .fetch_one(self.conn())
                .await
                .map_err(db_error("list_plans"))?;

        let sql = format!(
            "{} {} ORDER BY p.date, p.id LIMIT $4 OFFSET $5",
            PLAN_SELECT, WHERE
        );
        let rows = sqlx::query_as::<_, PlanRow>(&sql)
            .bind(&statuses)
            .bind(filter.date_from)
            .bind(filter.date_to)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.conn())
            .await
            .map_err(db_error("list_plans"))?;

        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    async fn update_plan(&mut self, plan: &WateringPlan) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE watering_plans
            SET date = $2, description = $3, status = $4, total_water_required = $5,
                distance = $6, gpx_url = $7, refills = $8, cancellation_note = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(plan.id)
        .bind(plan.date)
        .bind(&plan.description)
        .bind(plan.status.as_str())
        .bind(plan.total_water_required)
        .bind(plan.distance)
        .bind(&plan.gpx_url)
        .bind(plan.refills)
        .bind(&plan.cancellation_note)
        .execute(self.conn())
        .await
        .map_err(db_error("update_plan"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("watering plan", plan.id));
        }
        Ok(())
    }

    async fn replace_plan_links(&mut self, plan: &WateringPlan) -> StoreResult<()> {
        let released = plan.status.is_terminal();

        sqlx::query("DELETE FROM plan_cluster WHERE plan_id = $1")
            .bind(plan.id)
            .execute(self.conn())
            .await
            .map_err(db_error("replace_plan_links"))?;
        sqlx::query(
            r#"
            INSERT INTO plan_cluster (plan_id, cluster_id, position)
            SELECT $1, t.cluster_id, t.ord - 1
            FROM UNNEST($2::INT[]) WITH ORDINALITY AS t(cluster_id, ord)
            "#,
        )
        .bind(plan.id)
        .bind(&plan.cluster_ids)
        .execute(self.conn())
        .await
        .map_err(db_error("replace_plan_links"))?;

        sqlx::query("DELETE FROM plan_vehicle WHERE plan_id = $1")
            .bind(plan.id)
            .execute(self.conn())
            .await
            .map_err(db_error("replace_plan_links"))?;
        let mut vehicles = vec![(plan.transporter_id, "transporter")];
        if let Some(trailer_id) = plan.trailer_id {
            vehicles.push((trailer_id, "trailer"));
        }
        for (vehicle_id, role) in vehicles {
            sqlx::query(
                r#"
                INSERT INTO plan_vehicle (plan_id, vehicle_id, role, plan_date, released)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(plan.id)
            .bind(vehicle_id)
            .bind(role)
            .bind(plan.date)
            .bind(released)
            .execute(self.conn())
            .await
            .map_err(db_error("book_vehicle"))?;
        }

        sqlx::query("DELETE FROM plan_user WHERE plan_id = $1")
            .bind(plan.id)
            .execute(self.conn())
            .await
            .map_err(db_error("replace_plan_links"))?;
        sqlx::query(
            r#"
            INSERT INTO plan_user (plan_id, user_id, position)
            SELECT $1, t.user_id, t.ord - 1
            FROM UNNEST($2::TEXT[]) WITH ORDINALITY AS t(user_id, ord)
            "#,
        )
        .bind(plan.id)
        .bind(&plan.user_ids)
        .execute(self.conn())
        .await
        .map_err(db_error("replace_plan_links"))?;

        Ok(())
    }

    async fn set_plan_evaluation(
        &mut self,
        plan_id: i32,
        evaluation: &[EvaluationEntry],
    ) -> StoreResult<()> {
        let cluster_ids: Vec<i32> = evaluation.iter().map(|e| e.cluster_id).collect();
        let consumed: Vec<f64> = evaluation.iter().map(|e| e.consumed_water_litres).collect();
        sqlx::query(
            r#"
            UPDATE plan_cluster pc
            SET consumed_water = e.consumed
            FROM UNNEST($2::INT[], $3::FLOAT8[]) AS e(cluster_id, consumed)
            WHERE pc.plan_id = $1 AND pc.cluster_id = e.cluster_id
            "#,
        )
        .bind(plan_id)
        .bind(&cluster_ids)
        .bind(&consumed)
        .execute(self.conn())
        .await
        .map_err(db_error("set_plan_evaluation"))?;
        Ok(())
    }

    async fn release_plan_vehicles(&mut self, plan_id: i32) -> StoreResult<()> {
        sqlx::query("UPDATE plan_vehicle SET released = TRUE WHERE plan_id = $1")
            .bind(plan_id)
            .execute(self.conn())
            .await
            .map_err(db_error("release_plan_vehicles"))?;
        Ok(())
    }

    async fn delete_plan(&mut self, id: i32) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM watering_plans WHERE id = $1")
            .bind(id)
            .execute(self.conn())
            .await
            .map_err(db_error("delete_plan"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("watering plan", id));
        }
        Ok(())
    }

    async fn find_vehicle_bookings(
        &mut self,
        vehicle_ids: &[i32],
        date: NaiveDate,
        exclude_plan: Option<i32>,
    ) -> StoreResult<Vec<VehicleBooking>> {
        let rows: Vec<(i32, i32)> = sqlx::query_as(
            r#"
            SELECT vehicle_id, plan_id
            FROM plan_vehicle
            WHERE vehicle_id = ANY($1) AND plan_date = $2 AND NOT released
              AND ($3::INT IS NULL OR plan_id <> $3)
            ORDER BY vehicle_id
            "#,
        )
        .bind(vehicle_ids)
        .bind(date)
        .bind(exclude_plan)
        .fetch_all(self.conn())
        .await
        .map_err(db_error("find_vehicle_bookings"))?;

        Ok(rows
            .into_iter()
            .map(|(vehicle_id, plan_id)| VehicleBooking {
                vehicle_id,
                plan_id,
            })
            .collect())
    }

    async fn list_overdue_plans(&mut self, today: NaiveDate) -> StoreResult<Vec<WateringPlan>> {
        let sql = format!(
            "{} WHERE p.status = 'planned' AND p.date < $1 ORDER BY p.id FOR UPDATE OF p",
            PLAN_SELECT
        );
        let rows = sqlx::query_as::<_, PlanRow>(&sql)
            .bind(today)
            .fetch_all(self.conn())
            .await
            .map_err(db_error("list_overdue_plans"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn try_advisory_lock(&mut self, key: i64) -> StoreResult<bool> {
        sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(key)
            .fetch_one(self.conn())
            .await
            .map_err(db_error("try_advisory_lock"))
    }
}
