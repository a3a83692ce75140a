// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain entities shared by every component.
//!
//! Enumerations serialize as lowercase snake_case strings on the wire and in
//! the database. Parsing user input is strict and fails with
//! [`Error::BadRequest`]; decoding stored values falls back to the
//! `Unknown` variant where one exists so that corrupt rows stay readable.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// All variants in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::BadRequest(format!(
                        "unknown {} '{}'",
                        $label, other
                    ))),
                }
            }
        }
    };
}

wire_enum! {
    /// Soil type of a cluster's location.
    SoilCondition, "soil condition" {
        Sandy => "sandy",
        Silty => "silty",
        Loamy => "loamy",
        Clay => "clay",
        Unknown => "unknown",
    }
}

wire_enum! {
    /// Aggregated dryness of a cluster.
    WateringStatus, "watering status" {
        Good => "good",
        Moderate => "moderate",
        Bad => "bad",
        Unknown => "unknown",
    }
}

wire_enum! {
    /// Reachability of a sensor.
    SensorStatus, "sensor status" {
        Online => "online",
        Offline => "offline",
        Unknown => "unknown",
    }
}

wire_enum! {
    /// Vehicle role in a rig.
    VehicleType, "vehicle type" {
        Transporter => "transporter",
        Trailer => "trailer",
        Unknown => "unknown",
    }
}

wire_enum! {
    /// Operational availability of a vehicle.
    VehicleStatus, "vehicle status" {
        Active => "active",
        Available => "available",
        NotAvailable => "not_available",
        Unknown => "unknown",
    }
}

wire_enum! {
    /// Licence class required to drive a vehicle.
    DrivingLicense, "driving license" {
        B => "B",
        BE => "BE",
        C => "C",
        CE => "CE",
    }
}

wire_enum! {
    /// Lifecycle state of a watering plan.
    PlanStatus, "watering plan status" {
        Planned => "planned",
        Active => "active",
        Finished => "finished",
        NotCompleted => "not_completed",
        Canceled => "canceled",
        Unknown => "unknown",
    }
}

wire_enum! {
    /// Bucket a cluster falls into by tree count.
    ClusterSize, "cluster size" {
        Empty => "empty",
        Small => "small",
        Medium => "medium",
        Large => "large",
    }
}

impl SoilCondition {
    /// Decode a stored value, falling back to `Unknown`.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }
}

impl WateringStatus {
    /// Decode a stored value, falling back to `Unknown`.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }
}

impl SensorStatus {
    /// Decode a stored value, falling back to `Unknown`.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }
}

impl VehicleType {
    /// Decode a stored value, falling back to `Unknown`.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }
}

impl VehicleStatus {
    /// Decode a stored value, falling back to `Unknown`.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }
}

impl DrivingLicense {
    /// Decode a stored value. Licences have no unknown variant, so the
    /// most permissive class is assumed.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or(Self::B)
    }
}

impl PlanStatus {
    /// Decode a stored value, falling back to `Unknown`.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }

    /// Terminal plans are immutable and hold no vehicle bookings.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::NotCompleted | Self::Canceled)
    }
}

impl ClusterSize {
    /// Classify by tree count.
    pub fn for_tree_count(count: usize) -> Self {
        match count {
            0 => Self::Empty,
            1..=5 => Self::Small,
            6..=15 => Self::Medium,
            _ => Self::Large,
        }
    }

    /// Litres a cluster of this size needs per watering run.
    pub fn expected_litres(&self) -> f64 {
        match self {
            Self::Empty => 0.0,
            Self::Small => 400.0,
            Self::Medium => 1200.0,
            Self::Large => 2400.0,
        }
    }
}

/// A WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Reject positions outside the WGS84 range.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::bad_request(format!(
                "latitude {} is out of range",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::bad_request(format!(
                "longitude {} is out of range",
                self.longitude
            )));
        }
        Ok(())
    }

    /// `[longitude, latitude]`, the order routing services expect.
    pub fn lon_lat(&self) -> [f64; 2] {
        [self.longitude, self.latitude]
    }
}

/// A group of trees watered together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeCluster {
    pub id: i32,
    pub name: String,
    pub address: String,
    pub description: String,
    pub region: Option<String>,
    pub coordinate: Option<Coordinate>,
    pub soil_condition: SoilCondition,
    pub moisture_level: f64,
    pub watering_status: WateringStatus,
    pub archived: bool,
    pub last_watered: Option<DateTime<Utc>>,
    pub tree_ids: Vec<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TreeCluster {
    pub fn size(&self) -> ClusterSize {
        ClusterSize::for_tree_count(self.tree_ids.len())
    }

    pub fn expected_litres(&self) -> f64 {
        self.size().expected_litres()
    }
}

/// A single tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub id: i32,
    pub tree_cluster_id: Option<i32>,
    pub sensor_id: Option<String>,
    pub species: String,
    pub number: String,
    pub planting_year: i32,
    pub coordinate: Coordinate,
    pub description: String,
    pub readonly: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One soil-moisture probe at a given depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub resistance: f64,
    pub centibar: f64,
    pub depth: f64,
}

/// A normalised sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub sensor_id: String,
    pub received_at: DateTime<Utc>,
    pub battery: f64,
    pub humidity: f64,
    pub temperature: f64,
    pub watermarks: Vec<Watermark>,
}

impl SensorData {
    /// Mean suction across all probes of this reading.
    pub fn mean_centibar(&self) -> Option<f64> {
        if self.watermarks.is_empty() {
            return None;
        }
        let sum: f64 = self.watermarks.iter().map(|w| w.centibar).sum();
        Some(sum / self.watermarks.len() as f64)
    }
}

/// A soil-moisture sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub status: SensorStatus,
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub last_reading: Option<DateTime<Utc>>,
    pub latest_data: Option<SensorData>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A transporter or trailer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: i32,
    pub number_plate: String,
    pub description: String,
    pub model: String,
    pub water_capacity: f64,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    pub status: VehicleStatus,
    pub driving_license: DrivingLicense,
    pub width: f64,
    pub height: f64,
    pub length: f64,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Water actually delivered to one cluster of a finished plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationEntry {
    pub cluster_id: i32,
    pub consumed_water_litres: f64,
}

/// A dated watering run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WateringPlan {
    pub id: i32,
    pub date: NaiveDate,
    pub description: String,
    pub status: PlanStatus,
    pub transporter_id: i32,
    pub trailer_id: Option<i32>,
    pub cluster_ids: Vec<i32>,
    pub user_ids: Vec<String>,
    pub total_water_required: f64,
    pub distance: Option<f64>,
    pub gpx_url: Option<String>,
    pub refills: i32,
    pub cancellation_note: String,
    pub evaluation: Vec<EvaluationEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WateringPlan {
    /// Vehicles booked by this plan, transporter first.
    pub fn vehicle_ids(&self) -> Vec<i32> {
        let mut ids = vec![self.transporter_id];
        ids.extend(self.trailer_id);
        ids
    }
}
