// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for canopy-server integration tests.
//!
//! Builds the router over the in-memory store with a fixed route planner
//! and a static identity provider, then drives it with `oneshot` requests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use canopy_core::aggregator::{self, ClusterAggregator};
use canopy_core::blob::FsBlobStore;
use canopy_core::identity::{Principal, StaticIdentity};
use canopy_core::model::TreeCluster;
use canopy_core::routing::{
    FeatureCollection, GpxStream, Rig, RoutePlanner, RoutePreview, RoutingError, gpx_from_bytes,
};
use canopy_core::sensor::DEFAULT_STALE_THRESHOLD;
use canopy_core::store::MemoryStore;
use canopy_server::{AppState, StateOptions, router};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const TOKEN: &str = "test-token";
pub const ROLE: &str = "canopy-user";
pub const CLIENT_ID: &str = "plugin-client";
pub const CLIENT_SECRET: &str = "plugin-secret";

/// Every stop costs a kilometre.
pub struct FixedPlanner;

#[async_trait]
impl RoutePlanner for FixedPlanner {
    async fn preview(
        &self,
        _rig: &Rig,
        clusters: &[TreeCluster],
    ) -> Result<RoutePreview, RoutingError> {
        Ok(RoutePreview {
            collection: FeatureCollection::new(vec![]),
            distance: 1000.0 * clusters.len() as f64,
            duration: 120.0,
        })
    }

    async fn gpx(&self, _rig: &Rig, _clusters: &[TreeCluster]) -> Result<GpxStream, RoutingError> {
        Ok(gpx_from_bytes(b"<gpx version=\"1.1\"/>".to_vec()))
    }
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub cancel: CancellationToken,
    _blob_dir: tempfile::TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_plugin_timeout(Duration::from_secs(300))
    }

    pub fn with_plugin_timeout(plugin_timeout: Duration) -> Self {
        let blob_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let identity = StaticIdentity::new()
            .with_token(TOKEN, Principal::new("u-1").with_roles([ROLE]))
            .with_token("outsider-token", Principal::new("u-2"))
            .with_client(CLIENT_ID, CLIENT_SECRET);
        let cancel = CancellationToken::new();

        let state = AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FixedPlanner),
            Arc::new(FsBlobStore::new(blob_dir.path())),
            Arc::new(identity),
            StateOptions {
                app_url: "http://canopy.test".to_string(),
                sensor_stale_threshold: DEFAULT_STALE_THRESHOLD,
                plugin_timeout,
                required_role: Some(ROLE.to_string()),
            },
            cancel.clone(),
        );

        let events = state.bus.subscribe("aggregator", aggregator::TOPICS);
        ClusterAggregator::new(state.store.clone(), DEFAULT_STALE_THRESHOLD)
            .spawn(events, cancel.child_token());

        Self {
            app: router(state.clone()),
            state,
            cancel,
            _blob_dir: blob_dir,
        }
    }

    /// Send a request with the test bearer token.
    pub async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.call_as(Some(TOKEN), method, uri, body).await
    }

    pub async fn call_as(
        &self,
        token: Option<&str>,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");

        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    pub async fn vehicle(&self, plate: &str, vehicle_type: &str, capacity: f64) -> i64 {
        let (status, body) = self
            .call(
                Method::POST,
                "/api/v1/vehicle",
                Some(json!({
                    "number_plate": plate,
                    "model": "Unimog",
                    "water_capacity": capacity,
                    "type": vehicle_type,
                    "status": "available",
                    "driving_license": "C",
                    "width": 2.5,
                    "height": 3.0,
                    "length": 7.0,
                    "weight": 10.0
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "vehicle create: {}", body);
        body["id"].as_i64().expect("vehicle id")
    }

    pub async fn tree(&self, sensor_id: Option<&str>, latitude: f64, longitude: f64) -> i64 {
        let (status, body) = self
            .call(
                Method::POST,
                "/api/v1/tree",
                Some(json!({
                    "sensor_id": sensor_id,
                    "species": "Tilia cordata",
                    "planting_year": 2012,
                    "latitude": latitude,
                    "longitude": longitude
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "tree create: {}", body);
        body["id"].as_i64().expect("tree id")
    }

    pub async fn cluster(&self, name: &str, tree_ids: &[i64]) -> i64 {
        let (status, body) = self
            .call(
                Method::POST,
                "/api/v1/cluster",
                Some(json!({
                    "name": name,
                    "address": "Friedrich-Ebert-Straße",
                    "soil_condition": "loamy",
                    "tree_ids": tree_ids
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "cluster create: {}", body);
        body["id"].as_i64().expect("cluster id")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
