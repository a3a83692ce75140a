// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tree endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use canopy_core::Error;
use canopy_core::model::Tree;
use canopy_core::store::TreeFilter;
use canopy_core::tree::TreeInput;
use serde::Deserialize;

use super::{ApiError, ApiJson, ApiPath, ApiQuery, AppState, Ctx, ListResponse};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tree", get(list).post(create))
        .route("/tree/{id}", get(fetch).put(update).delete(remove))
}

#[derive(Debug, Default, Deserialize)]
pub struct TreeQuery {
    pub sensor_id: Option<String>,
    pub cluster_id: Option<i32>,
    pub has_cluster: Option<bool>,
    /// Comma-separated planting years
    pub planting_years: Option<String>,
}

fn planting_years(raw: Option<&str>) -> Result<Vec<i32>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i32>()
                .map_err(|_| ApiError(Error::bad_request(format!("invalid planting year '{}'", s))))
        })
        .collect()
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiQuery(query): ApiQuery<TreeQuery>,
) -> Result<Json<ListResponse<Tree>>, ApiError> {
    let filter = TreeFilter {
        cluster_id: query.cluster_id,
        sensor_id: query.sensor_id,
        has_cluster: query.has_cluster,
        planting_years: planting_years(query.planting_years.as_deref())?,
    };
    let page = state.trees.list(&ctx, &filter).await?;
    Ok(Json(ListResponse::new(&ctx, page)))
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiJson(input): ApiJson<TreeInput>,
) -> Result<(StatusCode, Json<Tree>), ApiError> {
    let tree = state.trees.create(&ctx, input).await?;
    Ok((StatusCode::CREATED, Json(tree)))
}

async fn fetch(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
) -> Result<Json<Tree>, ApiError> {
    Ok(Json(state.trees.get(&ctx, id).await?))
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
    ApiJson(input): ApiJson<TreeInput>,
) -> Result<Json<Tree>, ApiError> {
    Ok(Json(state.trees.update(&ctx, id, input).await?))
}

async fn remove(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
) -> Result<StatusCode, ApiError> {
    state.trees.delete(&ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planting_years() {
        assert_eq!(planting_years(Some("2012, 2015")).unwrap(), vec![2012, 2015]);
        assert!(planting_years(None).unwrap().is_empty());
        assert!(planting_years(Some("twenty")).is_err());
    }
}
