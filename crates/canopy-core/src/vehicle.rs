// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vehicle registry.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::model::{DrivingLicense, Vehicle, VehicleStatus, VehicleType};
use crate::store::{NewVehicle, Store, StoreError, VehicleFilter, run_in_tx};

/// Canonical plate form: trimmed, inner whitespace collapsed, upper-case.
pub fn normalize_plate(plate: &str) -> String {
    plate
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Writable vehicle attributes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VehicleInput {
    pub number_plate: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: String,
    pub water_capacity: f64,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    #[serde(default = "default_status")]
    pub status: VehicleStatus,
    #[serde(default = "default_license")]
    pub driving_license: DrivingLicense,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub length: f64,
    #[serde(default)]
    pub weight: f64,
}

fn default_status() -> VehicleStatus {
    VehicleStatus::Unknown
}

fn default_license() -> DrivingLicense {
    DrivingLicense::B
}

impl VehicleInput {
    fn validate(self) -> Result<NewVehicle> {
        let number_plate = normalize_plate(&self.number_plate);
        if number_plate.is_empty() {
            return Err(Error::bad_request("number_plate is required"));
        }
        if self.vehicle_type == VehicleType::Unknown {
            return Err(Error::bad_request(
                "vehicle type must be transporter or trailer",
            ));
        }
        if !self.water_capacity.is_finite() || self.water_capacity < 0.0 {
            return Err(Error::bad_request("water_capacity must not be negative"));
        }
        if self.vehicle_type == VehicleType::Transporter && self.water_capacity <= 0.0 {
            return Err(Error::bad_request(
                "a transporter needs a positive water_capacity",
            ));
        }
        let dimensions = [
            ("width", self.width),
            ("height", self.height),
            ("length", self.length),
            ("weight", self.weight),
        ];
        for (field, value) in dimensions {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::bad_request(format!("{} must not be negative", field)));
            }
        }
        Ok(NewVehicle {
            number_plate,
            description: self.description,
            model: self.model,
            water_capacity: self.water_capacity,
            vehicle_type: self.vehicle_type,
            status: self.status,
            driving_license: self.driving_license,
            width: self.width,
            height: self.height,
            length: self.length,
            weight: self.weight,
        })
    }
}

fn plate_conflict(plate: &str) -> impl FnOnce(StoreError) -> Error + '_ {
    move |e| match e {
        StoreError::Conflict { .. } => Error::conflict(format!(
            "vehicle with number plate '{}' already exists",
            plate
        )),
        other => other.into(),
    }
}

#[derive(Clone)]
pub struct VehicleService {
    store: Arc<dyn Store>,
}

impl VehicleService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create(&self, ctx: &RequestContext, input: VehicleInput) -> Result<Vehicle> {
        let vehicle = input.validate()?;
        let created = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                repo.create_vehicle(&vehicle)
                    .await
                    .map_err(plate_conflict(&vehicle.number_plate))
            })
        })
        .await?;
        info!(vehicle_id = created.id, plate = %created.number_plate, "Vehicle created");
        Ok(created)
    }

    pub async fn get(&self, ctx: &RequestContext, id: i32) -> Result<Vehicle> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.get_vehicle(id).await?)
    }

    pub async fn get_by_plate(&self, ctx: &RequestContext, plate: &str) -> Result<Vehicle> {
        ctx.check_cancelled()?;
        let plate = normalize_plate(plate);
        let mut repo = self.store.session().await?;
        repo.get_vehicle_by_plate(&plate)
            .await?
            .ok_or_else(|| StoreError::not_found("vehicle", &plate).into())
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        filter: &VehicleFilter,
    ) -> Result<(Vec<Vehicle>, i64)> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.list_vehicles(filter, ctx.pagination()).await?)
    }

    /// Replace all writable attributes.
    pub async fn update(&self, ctx: &RequestContext, id: i32, input: VehicleInput) -> Result<Vehicle> {
        let next = input.validate()?;
        let updated = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                let current = repo.get_vehicle(id).await?;
                if current.vehicle_type != next.vehicle_type
                    && repo.count_open_plans_for_vehicle(id).await? > 0
                {
                    return Err(Error::conflict(format!(
                        "vehicle {} is booked by an open watering plan and cannot change type",
                        id
                    )));
                }
                let vehicle = Vehicle {
                    number_plate: next.number_plate.clone(),
                    description: next.description,
                    model: next.model,
                    water_capacity: next.water_capacity,
                    vehicle_type: next.vehicle_type,
                    status: next.status,
                    driving_license: next.driving_license,
                    width: next.width,
                    height: next.height,
                    length: next.length,
                    weight: next.weight,
                    ..current
                };
                repo.update_vehicle(&vehicle)
                    .await
                    .map_err(plate_conflict(&next.number_plate))?;
                Ok(repo.get_vehicle(id).await?)
            })
        })
        .await?;
        info!(vehicle_id = id, "Vehicle updated");
        Ok(updated)
    }

    /// Delete a vehicle no plan refers to.
    pub async fn delete(&self, ctx: &RequestContext, id: i32) -> Result<()> {
        run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                repo.get_vehicle(id).await?;
                if repo.count_open_plans_for_vehicle(id).await? > 0 {
                    return Err(Error::conflict(format!(
                        "vehicle {} is booked by an open watering plan",
                        id
                    )));
                }
                repo.delete_vehicle(id).await.map_err(|e| match e {
                    StoreError::Conflict { .. } => Error::conflict(format!(
                        "vehicle {} is referenced by watering plans",
                        id
                    )),
                    other => other.into(),
                })
            })
        })
        .await?;
        info!(vehicle_id = id, "Vehicle deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn input(plate: &str, vehicle_type: VehicleType, capacity: f64) -> VehicleInput {
        VehicleInput {
            number_plate: plate.to_string(),
            description: String::new(),
            model: "Unimog".to_string(),
            water_capacity: capacity,
            vehicle_type,
            status: VehicleStatus::Available,
            driving_license: DrivingLicense::C,
            width: 2.4,
            height: 3.1,
            length: 6.0,
            weight: 7.5,
        }
    }

    fn service() -> VehicleService {
        VehicleService::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_normalize_plate() {
        assert_eq!(normalize_plate("  fl tbz   1 "), "FL TBZ 1");
        assert_eq!(normalize_plate(""), "");
    }

    #[test]
    fn test_input_validation() {
        assert!(input(" ", VehicleType::Trailer, 0.0).validate().is_err());
        assert!(input("A", VehicleType::Unknown, 10.0).validate().is_err());
        assert!(input("A", VehicleType::Transporter, 0.0).validate().is_err());
        assert!(input("A", VehicleType::Trailer, 0.0).validate().is_ok());

        let mut negative = input("A", VehicleType::Trailer, 100.0);
        negative.width = -1.0;
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_input_defaults() {
        let input: VehicleInput = serde_json::from_str(
            r#"{"number_plate": "FL TBZ 1", "water_capacity": 2000, "type": "transporter"}"#,
        )
        .unwrap();
        assert_eq!(input.status, VehicleStatus::Unknown);
        assert_eq!(input.driving_license, DrivingLicense::B);
    }

    #[tokio::test]
    async fn test_plate_unique_case_insensitive() {
        let vehicles = service();
        let ctx = RequestContext::default();

        let created = vehicles
            .create(&ctx, input("fl tbz 1", VehicleType::Transporter, 2000.0))
            .await
            .unwrap();
        assert_eq!(created.number_plate, "FL TBZ 1");

        let err = vehicles
            .create(&ctx, input("FL TBZ 1 ", VehicleType::Trailer, 1000.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let found = vehicles.get_by_plate(&ctx, "Fl Tbz 1").await.unwrap();
        assert_eq!(found.id, created.id);
        assert!(matches!(
            vehicles.get_by_plate(&ctx, "nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let vehicles = service();
        let ctx = RequestContext::default();
        let a = vehicles
            .create(&ctx, input("A 1", VehicleType::Transporter, 2000.0))
            .await
            .unwrap();
        let b = vehicles
            .create(&ctx, input("B 1", VehicleType::Trailer, 1000.0))
            .await
            .unwrap();

        let err = vehicles
            .update(&ctx, b.id, input("a 1", VehicleType::Trailer, 1000.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let updated = vehicles
            .update(&ctx, b.id, input("B 2", VehicleType::Trailer, 1500.0))
            .await
            .unwrap();
        assert_eq!(updated.number_plate, "B 2");
        assert_eq!(updated.water_capacity, 1500.0);
        assert_eq!(updated.created_at, b.created_at);

        vehicles.delete(&ctx, a.id).await.unwrap();
        assert!(matches!(
            vehicles.get(&ctx, a.id).await,
            Err(Error::NotFound(_))
        ));

        let (all, total) = vehicles
            .list(
                &ctx,
                &VehicleFilter {
                    vehicle_type: Some(VehicleType::Trailer),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(all[0].id, b.id);
    }
}
