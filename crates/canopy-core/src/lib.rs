// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Canopy Core - Urban Tree Irrigation Engine
//!
//! This crate holds the domain logic of the irrigation backend: watering
//! plans and their lifecycle, route planning against external routing
//! services, sensor ingestion and cluster moisture aggregation, the vehicle
//! registry, plugin liveness and the background scheduler. It knows nothing
//! about HTTP; `canopy-server` wires it to the outside world.
//!
//! # Architecture
//!
//! ```text
//!   MQTT / HTTP ingress          HTTP API (/api/v1)
//!          │                           │
//!          ▼                           ▼
//! ┌─────────────────┐   ┌──────────────────────────────────────────┐
//! │ SensorService   │   │ Tree / Cluster / Vehicle services         │
//! │ (ingest, sweep) │   │ WateringPlanEngine ──► RoutePlanner       │
//! └────────┬────────┘   │                       (optimiser+directions)
//!          │            └──────────┬───────────────────────────────┘
//!          │  EventBus             │
//!          ▼                       ▼
//! ┌─────────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │ClusterAggregator│──►│ Store (Postgres/mem) │   │  BlobStore   │
//! └─────────────────┘   └──────────────────────┘   │  (GPX files) │
//!                                                   └──────────────┘
//! ```
//!
//! # Watering Plan State Machine
//!
//! ```text
//!   ┌─────────┐  activate   ┌────────┐  finish   ┌──────────┐
//!   │ PLANNED │────────────►│ ACTIVE │──────────►│ FINISHED │
//!   └────┬────┘             └───┬─┬──┘           └──────────┘
//!        │ cancel / sweep       │ │ not completed ┌───────────────┐
//!        │                      │ └──────────────►│ NOT_COMPLETED │
//!        ▼                      │ cancel          └───────────────┘
//!   ┌──────────┐◄───────────────┘
//!   │ CANCELED │
//!   └──────────┘
//! ```
//!
//! Overdue `planned` plans are moved to `not_completed` by the daily sweep.
//!
//! # Modules
//!
//! - [`store`]: repository trait, transactions, PostgreSQL and in-memory backends
//! - [`watering_plan`]: plan lifecycle engine
//! - [`routing`]: route planner and its optimiser/directions clients
//! - [`sensor`], [`aggregator`]: telemetry ingestion and moisture aggregation
//! - [`tree`], [`cluster`], [`vehicle`]: entity services
//! - [`plugin`]: plugin registry with heartbeat expiry
//! - [`scheduler`]: fixed-interval background jobs
//! - [`events`]: in-process publish/subscribe bus

/// Cluster moisture aggregation driven by bus events.
pub mod aggregator;

/// Blob storage for GPX route files.
pub mod blob;

/// Tree cluster service.
pub mod cluster;

/// Per-request context: pagination, identity and cancellation.
pub mod context;

/// Error types shared by every component.
pub mod error;

/// In-process event bus.
pub mod events;

/// Identity collaborator trait and principals.
pub mod identity;

/// Embedded PostgreSQL migrations.
pub mod migrations;

/// Domain entities.
pub mod model;

/// Plugin registry.
pub mod plugin;

/// Route planning.
pub mod routing;

/// Background job scheduler.
pub mod scheduler;

/// Sensor ingestion and status sweep.
pub mod sensor;

/// Storage interfaces and backends.
pub mod store;

/// Tree service.
pub mod tree;

/// Vehicle registry.
pub mod vehicle;

/// Watering-plan engine.
pub mod watering_plan;

pub use context::{PageMeta, Pagination, RequestContext};
pub use error::{Error, Result};
pub use events::{Event, EventBus, Topic};
