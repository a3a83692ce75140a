// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP-backed route planner.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::polyline::{self, PRECISION};
use super::valhalla::{DirectionsRequest, ValhallaClient};
use super::vroom::{OptimiseRequest, VroomClient};
use super::{
    Feature, FeatureCollection, GpxStream, Rig, RoutePlanner, RoutePreview, RoutingError,
    gpx_from_bytes, waypoints,
};
use crate::model::{Coordinate, TreeCluster};

/// Where the routing collaborators live and where every route starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingConfig {
    pub optimiser_url: String,
    pub directions_url: String,
    pub depot: Coordinate,
    pub timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            optimiser_url: "http://localhost:3000".to_string(),
            directions_url: "http://localhost:8002".to_string(),
            depot: Coordinate::new(54.7937, 9.4353),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Sequences stops with the optimiser, then routes them with the
/// directions engine.
#[derive(Debug, Clone)]
pub struct HttpRoutePlanner {
    optimiser: VroomClient,
    directions: ValhallaClient,
    depot: Coordinate,
}

impl HttpRoutePlanner {
    pub fn new(config: &RoutingConfig) -> Result<Self, RoutingError> {
        Ok(Self {
            optimiser: VroomClient::new(&config.optimiser_url, config.timeout)?,
            directions: ValhallaClient::new(&config.directions_url, config.timeout)?,
            depot: config.depot,
        })
    }

    async fn ordered_stops(
        &self,
        rig: &Rig,
        clusters: &[TreeCluster],
    ) -> Result<Vec<[f64; 2]>, RoutingError> {
        let points = waypoints(clusters)?;
        let deliveries: Vec<([f64; 2], f64)> = points
            .into_iter()
            .zip(clusters)
            .map(|(point, cluster)| (point, cluster.expected_litres()))
            .collect();

        let request =
            OptimiseRequest::single_vehicle(self.depot.lon_lat(), rig.water_capacity(), &deliveries);
        let solution = self.optimiser.optimise(&request).await?;
        let stops = solution.ordered_locations()?;
        if stops.len() < 2 {
            return Err(RoutingError::InvalidInput(
                "route needs at least two distinct stops".to_string(),
            ));
        }
        debug!(stops = stops.len(), "Optimised stop order");
        Ok(stops)
    }
}

#[async_trait]
impl RoutePlanner for HttpRoutePlanner {
    #[instrument(skip_all, fields(clusters = clusters.len()))]
    async fn preview(
        &self,
        rig: &Rig,
        clusters: &[TreeCluster],
    ) -> Result<RoutePreview, RoutingError> {
        let stops = self.ordered_stops(rig, clusters).await?;
        let request = DirectionsRequest::truck(&stops, rig.costing());
        let trip = self.directions.route(&request).await?;

        let mut features = Vec::with_capacity(trip.legs.len());
        for leg in &trip.legs {
            let coordinates = polyline::decode(&leg.shape, PRECISION)?;
            features.extend(Feature::line(coordinates));
        }

        Ok(RoutePreview {
            collection: FeatureCollection::new(features),
            distance: trip.summary.length * 1000.0,
            duration: trip.summary.time,
        })
    }

    #[instrument(skip_all, fields(clusters = clusters.len()))]
    async fn gpx(&self, rig: &Rig, clusters: &[TreeCluster]) -> Result<GpxStream, RoutingError> {
        let stops = self.ordered_stops(rig, clusters).await?;
        let request = DirectionsRequest::truck(&stops, rig.costing()).as_gpx();
        let bytes = self.directions.route_gpx(&request).await?;
        Ok(gpx_from_bytes(bytes.to_vec()))
    }
}
