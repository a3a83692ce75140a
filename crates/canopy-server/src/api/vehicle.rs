// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vehicle endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use canopy_core::model::{Vehicle, VehicleStatus, VehicleType};
use canopy_core::store::VehicleFilter;
use canopy_core::vehicle::VehicleInput;
use serde::Deserialize;

use super::{ApiError, ApiJson, ApiPath, ApiQuery, AppState, Ctx, ListResponse};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/vehicle", get(list).post(create))
        .route("/vehicle/{id}", get(fetch).put(update).delete(remove))
        .route("/vehicle/plate/{plate}", get(fetch_by_plate))
}

#[derive(Debug, Default, Deserialize)]
pub struct VehicleQuery {
    #[serde(rename = "type")]
    pub vehicle_type: Option<String>,
    pub status: Option<String>,
    /// Substring of the number plate
    pub search: Option<String>,
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiQuery(query): ApiQuery<VehicleQuery>,
) -> Result<Json<ListResponse<Vehicle>>, ApiError> {
    let filter = VehicleFilter {
        vehicle_type: query
            .vehicle_type
            .as_deref()
            .map(str::parse::<VehicleType>)
            .transpose()?,
        status: query
            .status
            .as_deref()
            .map(str::parse::<VehicleStatus>)
            .transpose()?,
        search: query.search.filter(|s| !s.trim().is_empty()),
    };
    let page = state.vehicles.list(&ctx, &filter).await?;
    Ok(Json(ListResponse::new(&ctx, page)))
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiJson(input): ApiJson<VehicleInput>,
) -> Result<(StatusCode, Json<Vehicle>), ApiError> {
    let vehicle = state.vehicles.create(&ctx, input).await?;
    Ok((StatusCode::CREATED, Json(vehicle)))
}

async fn fetch(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
) -> Result<Json<Vehicle>, ApiError> {
    Ok(Json(state.vehicles.get(&ctx, id).await?))
}

async fn fetch_by_plate(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(plate): ApiPath<String>,
) -> Result<Json<Vehicle>, ApiError> {
    Ok(Json(state.vehicles.get_by_plate(&ctx, &plate).await?))
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
    ApiJson(input): ApiJson<VehicleInput>,
) -> Result<Json<Vehicle>, ApiError> {
    Ok(Json(state.vehicles.update(&ctx, id, input).await?))
}

async fn remove(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
) -> Result<StatusCode, ApiError> {
    state.vehicles.delete(&ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
