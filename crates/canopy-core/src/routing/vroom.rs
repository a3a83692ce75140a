// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for a VROOM-compatible optimiser.
//!
//! Only the step sequence of the solution is used; geometry comes from the
//! directions engine.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RoutingError;

#[derive(Debug, Clone, Serialize)]
pub struct OptimiseRequest {
    pub vehicles: Vec<OptimiserVehicle>,
    pub shipments: Vec<Shipment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimiserVehicle {
    pub id: u32,
    pub start: [f64; 2],
    pub end: [f64; 2],
    pub capacity: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Shipment {
    pub amount: Vec<i64>,
    pub pickup: ShipmentStep,
    pub delivery: ShipmentStep,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShipmentStep {
    pub id: u32,
    pub location: [f64; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimiseResponse {
    pub code: i32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub routes: Vec<OptimisedRoute>,
    #[serde(default)]
    pub unassigned: Vec<Unassigned>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimisedRoute {
    pub vehicle: u32,
    pub steps: Vec<RouteStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteStep {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub location: Option<[f64; 2]>,
    #[serde(default)]
    pub id: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Unassigned {
    pub id: u32,
}

impl OptimiseRequest {
    /// One vehicle starting and ending at `depot`, one shipment per
    /// waypoint picked up at the depot. Amounts are capped at the vehicle
    /// capacity so every shipment stays assignable; refills are accounted
    /// for separately.
    pub fn single_vehicle(depot: [f64; 2], capacity: f64, deliveries: &[([f64; 2], f64)]) -> Self {
        let capacity = capacity.max(1.0).round() as i64;
        let shipments = deliveries
            .iter()
            .enumerate()
            .map(|(i, (location, litres))| {
                let id = i as u32 + 1;
                Shipment {
                    amount: vec![(litres.round() as i64).clamp(0, capacity)],
                    pickup: ShipmentStep {
                        id,
                        location: depot,
                    },
                    delivery: ShipmentStep {
                        id,
                        location: *location,
                    },
                }
            })
            .collect();
        Self {
            vehicles: vec![OptimiserVehicle {
                id: 1,
                start: depot,
                end: depot,
                capacity: vec![capacity],
            }],
            shipments,
        }
    }
}

impl OptimiseResponse {
    /// Ordered `[lon, lat]` stops of the first route with consecutive
    /// duplicates collapsed.
    pub fn ordered_locations(&self) -> Result<Vec<[f64; 2]>, RoutingError> {
        if !self.unassigned.is_empty() {
            let ids: Vec<String> = self.unassigned.iter().map(|u| u.id.to_string()).collect();
            return Err(RoutingError::InvalidInput(format!(
                "optimiser could not assign stops {}",
                ids.join(", ")
            )));
        }
        let route = self.routes.first().ok_or_else(|| {
            RoutingError::Unavailable("optimiser returned no route".to_string())
        })?;

        let mut locations: Vec<[f64; 2]> = Vec::with_capacity(route.steps.len());
        for step in &route.steps {
            if let Some(location) = step.location {
                if locations.last() != Some(&location) {
                    locations.push(location);
                }
            }
        }
        Ok(locations)
    }
}

#[derive(Debug, Clone)]
pub struct VroomClient {
    client: Client,
    base_url: String,
}

impl VroomClient {
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

    pub async fn optimise(
        &self,
        request: &OptimiseRequest,
    ) -> Result<OptimiseResponse, RoutingError> {
        debug!(
            shipments = request.shipments.len(),
            "Requesting route optimisation"
        );
        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body: Result<OptimiseResponse, _> = response.json().await;
        match body {
            // VROOM reports input problems as code 2 and routing problems
            // as code 3.
            Ok(solution) if solution.code == 0 => Ok(solution),
            Ok(solution) if solution.code == 2 => Err(RoutingError::InvalidInput(
                solution.error.unwrap_or_else(|| "invalid optimiser input".to_string()),
            )),
            Ok(solution) => Err(RoutingError::Unavailable(format!(
                "optimiser error code {}: {}",
                solution.code,
                solution.error.unwrap_or_default()
            ))),
            Err(_) if status.is_client_error() => Err(RoutingError::InvalidInput(format!(
                "optimiser rejected request: {}",
                status
            ))),
            Err(e) => Err(RoutingError::Unavailable(format!(
                "optimiser returned {}: {}",
                status, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DEPOT: [f64; 2] = [9.4353, 54.7937];

    #[test]
    fn test_request_shape() {
        let request = OptimiseRequest::single_vehicle(
            DEPOT,
            1000.0,
            &[([9.44, 54.80], 400.0), ([9.45, 54.81], 2400.0)],
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["vehicles"][0]["start"], json!(DEPOT));
        assert_eq!(value["vehicles"][0]["capacity"], json!([1000]));
        assert_eq!(value["shipments"][0]["amount"], json!([400]));
        assert_eq!(value["shipments"][1]["amount"], json!([1000]));
        assert_eq!(value["shipments"][1]["pickup"]["location"], json!(DEPOT));
        assert_eq!(value["shipments"][1]["delivery"]["id"], json!(2));
    }

    #[test]
    fn test_ordered_locations_collapse_duplicates() {
        let response: OptimiseResponse = serde_json::from_value(json!({
            "code": 0,
            "routes": [{
                "vehicle": 1,
                "steps": [
                    {"type": "start", "location": DEPOT},
                    {"type": "pickup", "id": 1, "location": DEPOT},
                    {"type": "pickup", "id": 2, "location": DEPOT},
                    {"type": "delivery", "id": 2, "location": [9.45, 54.81]},
                    {"type": "delivery", "id": 1, "location": [9.44, 54.80]},
                    {"type": "end", "location": DEPOT}
                ]
            }],
            "unassigned": []
        }))
        .unwrap();

        assert_eq!(
            response.ordered_locations().unwrap(),
            vec![DEPOT, [9.45, 54.81], [9.44, 54.80], DEPOT]
        );
    }

    #[test]
    fn test_unassigned_is_invalid_input() {
        let response: OptimiseResponse = serde_json::from_value(json!({
            "code": 0, "routes": [], "unassigned": [{"id": 3}]
        }))
        .unwrap();
        assert!(matches!(
            response.ordered_locations(),
            Err(RoutingError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_optimise_error_codes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"code": 2, "error": "Invalid shipment"})),
            )
            .mount(&server)
            .await;

        let client = VroomClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let request = OptimiseRequest::single_vehicle(DEPOT, 1000.0, &[([9.44, 54.8], 400.0)]);
        let err = client.optimise(&request).await.unwrap_err();
        assert_eq!(err, RoutingError::InvalidInput("Invalid shipment".into()));
    }

    #[tokio::test]
    async fn test_optimise_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = VroomClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let request = OptimiseRequest::single_vehicle(DEPOT, 1000.0, &[([9.44, 54.8], 400.0)]);
        let err = client.optimise(&request).await.unwrap_err();
        assert!(err.is_transient());
    }
}
