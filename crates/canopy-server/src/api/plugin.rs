// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plugin registry endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use canopy_core::plugin::{Plugin, PluginRegistration, Registered};
use serde::Serialize;

use super::{ApiError, ApiJson, ApiPath, AppState, Ctx};

/// Authenticated routes. Registration is mounted separately without auth.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/plugin", get(list))
        .route("/plugin/{slug}", get(fetch).delete(remove))
        .route("/plugin/{slug}/heartbeat", post(heartbeat))
}

#[derive(Debug, Serialize)]
pub struct PluginList {
    pub data: Vec<Plugin>,
}

pub async fn register(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    ApiJson(registration): ApiJson<PluginRegistration>,
) -> Result<(StatusCode, Json<Registered>), ApiError> {
    ctx.check_cancelled()?;
    let registered = state.plugins.register(registration).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn heartbeat(
    State(state): State<AppState>,
    ApiPath(slug): ApiPath<String>,
) -> Result<Json<Plugin>, ApiError> {
    Ok(Json(state.plugins.heartbeat(&slug)?))
}

async fn list(State(state): State<AppState>) -> Result<Json<PluginList>, ApiError> {
    Ok(Json(PluginList {
        data: state.plugins.list()?,
    }))
}

async fn fetch(
    State(state): State<AppState>,
    ApiPath(slug): ApiPath<String>,
) -> Result<Json<Plugin>, ApiError> {
    Ok(Json(state.plugins.get(&slug)?))
}

async fn remove(
    State(state): State<AppState>,
    ApiPath(slug): ApiPath<String>,
) -> Result<StatusCode, ApiError> {
    state.plugins.unregister(&slug)?;
    Ok(StatusCode::NO_CONTENT)
}
