// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sensor endpoints and HTTP telemetry ingress.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use canopy_core::model::{Sensor, SensorData, SensorStatus};
use canopy_core::sensor::{SensorUpdate, TelemetryPayload};
use canopy_core::store::{NewSensor, SensorFilter};
use serde::Deserialize;

use super::{ApiError, ApiJson, ApiPath, ApiQuery, AppState, Ctx, ListResponse, parse_list};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sensor", get(list).post(create))
        .route("/sensor/data", post(ingest))
        .route("/sensor/{id}", get(fetch).put(update).delete(remove))
        .route("/sensor/{id}/data", get(list_data))
}

#[derive(Debug, Default, Deserialize)]
pub struct SensorQuery {
    /// Comma-separated statuses
    pub status: Option<String>,
}

/// Body of a sensor registration.
#[derive(Debug, Deserialize)]
pub struct SensorBody {
    pub id: String,
    #[serde(default = "unknown_status")]
    pub status: SensorStatus,
    #[serde(rename = "type", default)]
    pub sensor_type: String,
}

fn unknown_status() -> SensorStatus {
    SensorStatus::Unknown
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiQuery(query): ApiQuery<SensorQuery>,
) -> Result<Json<ListResponse<Sensor>>, ApiError> {
    let filter = SensorFilter {
        statuses: parse_list::<SensorStatus>(query.status.as_deref())?,
    };
    let page = state.sensors.list(&ctx, &filter).await?;
    Ok(Json(ListResponse::new(&ctx, page)))
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiJson(body): ApiJson<SensorBody>,
) -> Result<(StatusCode, Json<Sensor>), ApiError> {
    let sensor = state
        .sensors
        .create(
            &ctx,
            NewSensor {
                id: body.id,
                status: body.status,
                sensor_type: body.sensor_type,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(sensor)))
}

async fn fetch(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<String>,
) -> Result<Json<Sensor>, ApiError> {
    Ok(Json(state.sensors.get(&ctx, &id).await?))
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<String>,
    ApiJson(body): ApiJson<SensorUpdate>,
) -> Result<Json<Sensor>, ApiError> {
    Ok(Json(state.sensors.update(&ctx, &id, body).await?))
}

async fn remove(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<String>,
) -> Result<StatusCode, ApiError> {
    state.sensors.delete(&ctx, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_data(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<String>,
) -> Result<Json<ListResponse<SensorData>>, ApiError> {
    let page = state.sensors.list_data(&ctx, &id).await?;
    Ok(Json(ListResponse::new(&ctx, page)))
}

/// Same path into the ingestor as MQTT messages take. Replays answer
/// 200 instead of 201.
async fn ingest(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiJson(payload): ApiJson<TelemetryPayload>,
) -> Result<(StatusCode, Json<SensorData>), ApiError> {
    let ingested = state.sensors.ingest(&ctx, payload).await?;
    let status = if ingested.inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ingested.data)))
}
