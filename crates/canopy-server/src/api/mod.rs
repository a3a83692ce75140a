// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API under `/api/v1`.
//!
//! Handlers translate requests into core service calls. Every failure is an
//! [`ApiError`]; the [`render_errors`] layer turns it into the JSON body
//! `{error, code, path, method}` with the status from [`ApiError::status`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Query, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use canopy_core::blob::BlobStore;
use canopy_core::cluster::ClusterService;
use canopy_core::identity::{IdentityProvider, Principal};
use canopy_core::plugin::PluginRegistry;
use canopy_core::routing::RoutePlanner;
use canopy_core::sensor::SensorService;
use canopy_core::store::Store;
use canopy_core::tree::TreeService;
use canopy_core::vehicle::VehicleService;
use canopy_core::watering_plan::WateringPlanEngine;
use canopy_core::{Error, EventBus, PageMeta, Pagination, RequestContext};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth;

pub mod cluster;
pub mod plugin;
pub mod sensor;
pub mod tree;
pub mod vehicle;
pub mod watering_plan;

/// Header carrying a caller-chosen request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Knobs for [`AppState::new`].
#[derive(Debug, Clone)]
pub struct StateOptions {
    pub app_url: String,
    pub sensor_stale_threshold: Duration,
    pub plugin_timeout: Duration,
    pub required_role: Option<String>,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub sensors: Arc<SensorService>,
    pub trees: Arc<TreeService>,
    pub clusters: Arc<ClusterService>,
    pub vehicles: Arc<VehicleService>,
    pub plans: Arc<WateringPlanEngine>,
    pub plugins: Arc<PluginRegistry>,
    pub identity: Arc<dyn IdentityProvider>,
    pub required_role: Option<String>,
    pub started_at: Instant,
    /// Fires on process shutdown; request contexts are its children.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        planner: Arc<dyn RoutePlanner>,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityProvider>,
        options: StateOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let bus = EventBus::new();
        let stale = options.sensor_stale_threshold;
        Self {
            sensors: Arc::new(SensorService::new(store.clone(), bus.clone(), stale)),
            trees: Arc::new(TreeService::new(store.clone(), bus.clone())),
            clusters: Arc::new(ClusterService::new(store.clone(), bus.clone(), stale)),
            vehicles: Arc::new(VehicleService::new(store.clone())),
            plans: Arc::new(WateringPlanEngine::new(
                store.clone(),
                bus.clone(),
                planner,
                blobs,
                &options.app_url,
            )),
            plugins: Arc::new(PluginRegistry::new(
                identity.clone(),
                options.plugin_timeout,
            )),
            identity,
            required_role: options.required_role,
            started_at: Instant::now(),
            store,
            bus,
            shutdown,
        }
    }
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(watering_plan::routes())
        .merge(cluster::routes())
        .merge(tree::routes())
        .merge(vehicle::routes())
        .merge(sensor::routes())
        .merge(plugin::routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    // Plugins authenticate with client credentials in the body.
    let public = Router::new()
        .route("/info", get(info))
        .route("/plugin/register", post(plugin::register));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .nest("/api/v1", protected.merge(public))
        .layer(middleware::from_fn(render_errors))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// A core error on its way to the client.
#[derive(Debug, Clone)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RoutingUnavailable(_) | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::bad_request(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(Error::bad_request(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(Error::bad_request(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            Error::Internal(msg) => error!(error = %msg, "Request failed"),
            other => debug!(code = other.code(), error = %other, "Request rejected"),
        }
        // The body is rendered by `render_errors`, which knows the request.
        let mut response = self.status().into_response();
        response.extensions_mut().insert(self);
        response
    }
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub path: String,
    pub method: String,
}

/// Render [`ApiError`]s left in response extensions as JSON.
pub async fn render_errors(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let mut response = next.run(req).await;
    match response.extensions_mut().remove::<ApiError>() {
        Some(err) => {
            let body = ErrorBody {
                error: err.0.to_string(),
                code: err.0.code().to_string(),
                path,
                method,
            };
            (err.status(), Json(body)).into_response()
        }
        None => response,
    }
}

// ============================================================================
// Extractors
// ============================================================================

/// JSON body whose rejections become 400 responses.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Path parameters whose rejections become 400 responses.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

/// Query parameters whose rejections become 400 responses.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

/// Request context built from the caller, the query window and the
/// process shutdown token.
pub struct Ctx(pub RequestContext);

impl FromRequestParts<AppState> for Ctx {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let Query(page) = Query::<PageQuery>::from_request_parts(parts, state).await?;
        let pagination = Pagination::new(page.page, page.limit)?;
        let request_id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .unwrap_or_else(Uuid::new_v4);

        let mut ctx = RequestContext::new(state.shutdown.child_token())
            .with_pagination(pagination)
            .with_request_id(request_id);
        if let Some(principal) = parts.extensions.get::<Principal>() {
            ctx = ctx.with_principal(principal.clone());
        }
        Ok(Ctx(ctx))
    }
}

/// Comma-separated query values, parsed one by one.
pub fn parse_list<T>(raw: Option<&str>) -> Result<Vec<T>, ApiError>
where
    T: std::str::FromStr<Err = Error>,
{
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<T>().map_err(ApiError::from))
            .collect()
    })
    .unwrap_or_else(|| Ok(Vec::new()))
}

// ============================================================================
// Responses
// ============================================================================

/// A list with its pagination block. The block is omitted for unlimited
/// queries.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PageMeta>,
}

impl<T> ListResponse<T> {
    pub fn new(ctx: &RequestContext, (data, total): (Vec<T>, i64)) -> Self {
        Self {
            data,
            pagination: ctx.pagination().meta(total),
        }
    }
}

// ============================================================================
// Probes
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "shutting_down" })),
        );
    }
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": state.store.backend(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "error": e.to_string(),
            })),
        ),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub version: String,
    pub uptime_secs: u64,
    pub store: String,
}

async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        store: state.store.backend().to_string(),
    })
}
