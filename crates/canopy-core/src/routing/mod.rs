// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route planning.
//!
//! A [`RoutePlanner`] turns a rig (transporter plus optional trailer) and
//! a list of clusters into either a GeoJSON preview or a GPX stream. The
//! HTTP implementation sequences waypoints with a VROOM-style optimiser and
//! asks a Valhalla-style directions engine for the geometry.

pub mod planner;
pub mod polyline;
pub mod valhalla;
pub mod vroom;

pub use self::planner::{HttpRoutePlanner, RoutingConfig};

use std::io::Cursor;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::model::{TreeCluster, Vehicle};

/// Axles assumed per vehicle when deriving axle load.
pub const AXLES_PER_VEHICLE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    /// The collaborator failed in a way that may succeed on retry.
    #[error("routing service unavailable: {0}")]
    Unavailable(String),

    /// The collaborator rejected the input; retrying will not help.
    #[error("routing input rejected: {0}")]
    InvalidInput(String),
}

impl RoutingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for RoutingError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.is_client_error() => RoutingError::InvalidInput(err.to_string()),
            _ => RoutingError::Unavailable(err.to_string()),
        }
    }
}

/// A transporter with an optional trailer.
#[derive(Debug, Clone, PartialEq)]
pub struct Rig {
    pub transporter: Vehicle,
    pub trailer: Option<Vehicle>,
}

impl Rig {
    pub fn new(transporter: Vehicle, trailer: Option<Vehicle>) -> Self {
        Self {
            transporter,
            trailer,
        }
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        std::iter::once(&self.transporter).chain(self.trailer.as_ref())
    }

    /// Water carried per run.
    pub fn water_capacity(&self) -> f64 {
        self.vehicles().map(|v| v.water_capacity).sum()
    }

    /// Dimensional costing for the directions engine.
    pub fn costing(&self) -> TruckCosting {
        let width = self.vehicles().map(|v| v.width).sum();
        let weight: f64 = self.vehicles().map(|v| v.weight).sum();
        let length = self.vehicles().map(|v| v.length).sum();
        let height = self.vehicles().map(|v| v.height).fold(0.0, f64::max);
        let axle_count = AXLES_PER_VEHICLE * self.vehicles().count() as u32;
        TruckCosting {
            width,
            height,
            length,
            weight,
            axle_load: weight / f64::from(axle_count),
            axle_count,
        }
    }
}

/// Truck costing options. Dimensions in metres, weights in tonnes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TruckCosting {
    pub width: f64,
    pub height: f64,
    pub length: f64,
    pub weight: f64,
    pub axle_load: f64,
    pub axle_count: u32,
}

/// `[min_lon, min_lat, max_lon, max_lat]`.
pub type BoundingBox = [f64; 4];

/// Bounding box of a coordinate list, `None` when empty.
pub fn bbox_of(coordinates: &[[f64; 2]]) -> Option<BoundingBox> {
    let first = coordinates.first()?;
    let mut bbox = [first[0], first[1], first[0], first[1]];
    for [lon, lat] in coordinates.iter().skip(1) {
        bbox[0] = bbox[0].min(*lon);
        bbox[1] = bbox[1].min(*lat);
        bbox[2] = bbox[2].max(*lon);
        bbox[3] = bbox[3].max(*lat);
    }
    Some(bbox)
}

/// Smallest box covering both.
pub fn bbox_union(a: BoundingBox, b: BoundingBox) -> BoundingBox {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].max(b[2]), a[3].max(b[3])]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineString {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    pub bbox: BoundingBox,
    pub geometry: LineString,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Feature {
    /// A LineString feature. `None` when there are no coordinates.
    pub fn line(coordinates: Vec<[f64; 2]>) -> Option<Self> {
        let bbox = bbox_of(&coordinates)?;
        Some(Self {
            kind: "Feature".to_string(),
            bbox,
            geometry: LineString {
                kind: "LineString".to_string(),
                coordinates,
            },
            properties: serde_json::Map::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub bbox: BoundingBox,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        let bbox = features
            .iter()
            .map(|f| f.bbox)
            .reduce(bbox_union)
            .unwrap_or([0.0; 4]);
        Self {
            kind: "FeatureCollection".to_string(),
            bbox,
            features,
        }
    }
}

/// A planned route for display. Serializes as a GeoJSON
/// `FeatureCollection` carrying `distance` and `duration` as foreign members.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePreview {
    #[serde(flatten)]
    pub collection: FeatureCollection,
    /// Total length in metres.
    pub distance: f64,
    /// Total travel time in seconds.
    pub duration: f64,
}

/// Seekable byte stream.
pub trait ReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> ReadSeek for T {}

/// GPX document streamed from the directions engine.
pub type GpxStream = Pin<Box<dyn ReadSeek>>;

/// Wrap in-memory bytes as a [`GpxStream`].
pub fn gpx_from_bytes(bytes: impl Into<Vec<u8>>) -> GpxStream {
    Box::pin(Cursor::new(bytes.into()))
}

#[async_trait]
pub trait RoutePlanner: Send + Sync {
    async fn preview(&self, rig: &Rig, clusters: &[TreeCluster])
    -> Result<RoutePreview, RoutingError>;

    async fn gpx(&self, rig: &Rig, clusters: &[TreeCluster]) -> Result<GpxStream, RoutingError>;
}

/// Centroids of the clusters in order, rejecting clusters without one.
pub fn waypoints(clusters: &[TreeCluster]) -> Result<Vec<[f64; 2]>, RoutingError> {
    if clusters.is_empty() {
        return Err(RoutingError::InvalidInput(
            "at least one cluster is required".to_string(),
        ));
    }
    clusters
        .iter()
        .map(|c| {
            c.coordinate.map(|p| p.lon_lat()).ok_or_else(|| {
                RoutingError::InvalidInput(format!("tree cluster {} has no coordinates", c.id))
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;

    use crate::model::{
        Coordinate, DrivingLicense, SoilCondition, TreeCluster, Vehicle, VehicleStatus,
        VehicleType, WateringStatus,
    };

    pub fn vehicle(id: i32, vehicle_type: VehicleType, capacity: f64) -> Vehicle {
        Vehicle {
            id,
            number_plate: format!("FL-{}", id),
            description: String::new(),
            model: String::new(),
            water_capacity: capacity,
            vehicle_type,
            status: VehicleStatus::Active,
            driving_license: DrivingLicense::C,
            width: 2.5,
            height: 3.2,
            length: 7.0,
            weight: 12.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn cluster(id: i32, coordinate: Option<Coordinate>, trees: usize) -> TreeCluster {
        TreeCluster {
            id,
            name: format!("cluster {}", id),
            address: String::new(),
            description: String::new(),
            region: None,
            coordinate,
            soil_condition: SoilCondition::Unknown,
            moisture_level: 0.0,
            watering_status: WateringStatus::Unknown,
            archived: false,
            last_watered: None,
            tree_ids: (1..=trees as i32).collect(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
