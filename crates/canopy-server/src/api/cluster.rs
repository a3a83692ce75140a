// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tree cluster endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use canopy_core::cluster::ClusterInput;
use canopy_core::model::{TreeCluster, WateringStatus};
use canopy_core::store::ClusterFilter;
use serde::Deserialize;

use super::{ApiError, ApiJson, ApiPath, ApiQuery, AppState, Ctx, ListResponse, parse_list};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cluster", get(list).post(create))
        .route("/cluster/{id}", get(fetch).put(update).delete(remove))
        .route("/cluster/{id}/archive", post(archive))
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterQuery {
    /// Comma-separated watering statuses
    pub watering_status: Option<String>,
    /// Comma-separated region names
    pub region: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiQuery(query): ApiQuery<ClusterQuery>,
) -> Result<Json<ListResponse<TreeCluster>>, ApiError> {
    let regions = query
        .region
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let filter = ClusterFilter {
        watering_statuses: parse_list::<WateringStatus>(query.watering_status.as_deref())?,
        regions,
        include_archived: query.include_archived,
    };
    let page = state.clusters.list(&ctx, &filter).await?;
    Ok(Json(ListResponse::new(&ctx, page)))
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiJson(input): ApiJson<ClusterInput>,
) -> Result<(StatusCode, Json<TreeCluster>), ApiError> {
    let cluster = state.clusters.create(&ctx, input).await?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

async fn fetch(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
) -> Result<Json<TreeCluster>, ApiError> {
    Ok(Json(state.clusters.get(&ctx, id).await?))
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
    ApiJson(input): ApiJson<ClusterInput>,
) -> Result<Json<TreeCluster>, ApiError> {
    Ok(Json(state.clusters.update(&ctx, id, input).await?))
}

async fn archive(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
) -> Result<Json<TreeCluster>, ApiError> {
    Ok(Json(state.clusters.archive(&ctx, id).await?))
}

async fn remove(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
) -> Result<StatusCode, ApiError> {
    state.clusters.delete(&ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
