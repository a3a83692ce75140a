// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for a Valhalla-compatible directions engine.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{RoutingError, TruckCosting};

#[derive(Debug, Clone, Serialize)]
pub struct DirectionsRequest {
    pub locations: Vec<Location>,
    pub costing: &'static str,
    pub costing_options: CostingOptions,
    pub directions_options: DirectionsOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostingOptions {
    pub truck: TruckCosting,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectionsOptions {
    pub units: &'static str,
}

impl DirectionsRequest {
    /// Truck route through `[lon, lat]` stops in the given order.
    pub fn truck(stops: &[[f64; 2]], costing: TruckCosting) -> Self {
        Self {
            locations: stops
                .iter()
                .map(|[lon, lat]| Location {
                    lat: *lat,
                    lon: *lon,
                    kind: "break",
                })
                .collect(),
            costing: "truck",
            costing_options: CostingOptions { truck: costing },
            directions_options: DirectionsOptions {
                units: "kilometers",
            },
            format: None,
        }
    }

    pub fn as_gpx(mut self) -> Self {
        self.format = Some("gpx");
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectionsResponse {
    pub trip: Trip,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Trip {
    pub legs: Vec<Leg>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Leg {
    pub shape: String,
    #[serde(default)]
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Summary {
    /// Kilometres.
    pub length: f64,
    /// Seconds.
    pub time: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValhallaClient {
    client: Client,
    base_url: String,
}

impl ValhallaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RoutingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RoutingError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    async fn post(&self, request: &DirectionsRequest) -> Result<Response, RoutingError> {
        debug!(
            locations = request.locations.len(),
            format = request.format.unwrap_or("json"),
            "Requesting directions"
        );
        let response = self
            .client
            .post(format!("{}/route", self.base_url))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: Option<ErrorBody> = response.json().await.ok();
        let detail = body
            .map(|b| {
                format!(
                    "{} (code {})",
                    b.error.unwrap_or_default(),
                    b.error_code.unwrap_or_default()
                )
            })
            .unwrap_or_else(|| status.to_string());
        if status.is_client_error() {
            Err(RoutingError::InvalidInput(detail))
        } else {
            Err(RoutingError::Unavailable(detail))
        }
    }

    pub async fn route(&self, request: &DirectionsRequest) -> Result<Trip, RoutingError> {
        let response = self.post(request).await?;
        let body: DirectionsResponse = response.json().await.map_err(|e| {
            RoutingError::Unavailable(format!("malformed directions response: {}", e))
        })?;
        Ok(body.trip)
    }

    pub async fn route_gpx(&self, request: &DirectionsRequest) -> Result<Bytes, RoutingError> {
        let response = self.post(request).await?;
        response
            .bytes()
            .await
            .map_err(|e| RoutingError::Unavailable(format!("GPX download failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn costing() -> TruckCosting {
        TruckCosting {
            width: 2.5,
            height: 3.2,
            length: 7.0,
            weight: 12.0,
            axle_load: 6.0,
            axle_count: 2,
        }
    }

    #[test]
    fn test_request_shape() {
        let request = DirectionsRequest::truck(&[[9.43, 54.79], [9.44, 54.80]], costing());
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["costing"], "truck");
        assert_eq!(value["locations"][0], json!({"lat": 54.79, "lon": 9.43, "type": "break"}));
        assert_eq!(value["costing_options"]["truck"]["axle_count"], 2);
        assert!(value.get("format").is_none());

        let gpx = serde_json::to_value(request.as_gpx()).unwrap();
        assert_eq!(gpx["format"], "gpx");
    }

    #[tokio::test]
    async fn test_route_parses_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/route"))
            .and(body_partial_json(json!({"costing": "truck"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "trip": {
                    "legs": [{"shape": "g}iogBgi{~PSR", "summary": {"length": 0.01, "time": 2.0}}],
                    "summary": {"length": 0.01, "time": 2.0},
                    "status": 0
                }
            })))
            .mount(&server)
            .await;

        let client = ValhallaClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let request = DirectionsRequest::truck(&[[9.43, 54.79], [9.44, 54.80]], costing());
        let trip = client.route(&request).await.unwrap();
        assert_eq!(trip.legs.len(), 1);
        assert_eq!(trip.summary.length, 0.01);
    }

    #[tokio::test]
    async fn test_route_classifies_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/route"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error_code": 171,
                "error": "No suitable edges near location",
                "status_code": 400
            })))
            .mount(&server)
            .await;

        let client = ValhallaClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let request = DirectionsRequest::truck(&[[0.0, 0.0], [0.1, 0.1]], costing());
        let err = client.route(&request).await.unwrap_err();
        assert_eq!(
            err,
            RoutingError::InvalidInput("No suitable edges near location (code 171)".into())
        );
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_transient() {
        // Nothing listens on port 9 locally.
        let client = ValhallaClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let request = DirectionsRequest::truck(&[[0.0, 0.0], [0.1, 0.1]], costing());
        let err = client.route_gpx(&request).await.unwrap_err();
        assert!(err.is_transient());
    }
}
