// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Watering plan endpoints.

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use canopy_core::model::{PlanStatus, WateringPlan};
use canopy_core::routing::RoutePreview;
use canopy_core::store::PlanFilter;
use canopy_core::watering_plan::{PlanDetails, PlanInput, PlanUpdate, RoutePreviewRequest};
use chrono::NaiveDate;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::{ApiError, ApiJson, ApiPath, ApiQuery, AppState, Ctx, ListResponse, parse_list};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/watering-plan", get(list).post(create))
        .route(
            "/watering-plan/{id}",
            get(fetch).put(update).delete(remove),
        )
        .route("/watering-plan/route/preview", post(preview))
        .route("/watering-plan/route/gpx/{name}", get(gpx))
}

#[derive(Debug, Default, Deserialize)]
pub struct PlanQuery {
    /// Comma-separated statuses
    pub status: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiQuery(query): ApiQuery<PlanQuery>,
) -> Result<Json<ListResponse<WateringPlan>>, ApiError> {
    let filter = PlanFilter {
        statuses: parse_list::<PlanStatus>(query.status.as_deref())?,
        date_from: query.date_from,
        date_to: query.date_to,
    };
    let page = state.plans.list(&ctx, &filter).await?;
    Ok(Json(ListResponse::new(&ctx, page)))
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiJson(input): ApiJson<PlanInput>,
) -> Result<(StatusCode, Json<WateringPlan>), ApiError> {
    let plan = state.plans.create(&ctx, input).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn fetch(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
) -> Result<Json<PlanDetails>, ApiError> {
    Ok(Json(state.plans.get_details(&ctx, id).await?))
}

/// Absent body fields keep their value; the merge runs inside the
/// engine's transaction.
async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
    ApiJson(body): ApiJson<PlanUpdate>,
) -> Result<Json<WateringPlan>, ApiError> {
    let plan = state
        .plans
        .update(&ctx, id, move |draft| body.apply(draft))
        .await?;
    Ok(Json(plan))
}

async fn remove(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(id): ApiPath<i32>,
) -> Result<StatusCode, ApiError> {
    state.plans.delete(&ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn preview(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiJson(request): ApiJson<RoutePreviewRequest>,
) -> Result<Json<RoutePreview>, ApiError> {
    Ok(Json(state.plans.preview_route(&ctx, request).await?))
}

async fn gpx(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiPath(name): ApiPath<String>,
) -> Result<Response, ApiError> {
    let file = state.plans.open_gpx(&ctx, &name).await?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/gpx+xml".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        body,
    )
        .into_response())
}
