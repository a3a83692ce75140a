// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Canopy Server - HTTP API and process runtime
//!
//! Wires `canopy-core` to the outside world:
//! - JSON API under `/api/v1` with bearer-token authentication
//! - OIDC identity provider (RS256 validation, client credentials)
//! - MQTT telemetry ingress
//! - Runtime that owns every background loop under one cancellation token

/// HTTP routes, extractors and error rendering.
pub mod api;

/// Bearer token middleware.
pub mod auth;

/// Environment configuration.
pub mod config;

/// MQTT telemetry ingress.
pub mod mqtt;

/// OpenID Connect identity provider.
pub mod oidc;

/// Process runtime.
pub mod runtime;

pub use api::{AppState, StateOptions, router};
pub use config::{Config, ConfigError};
pub use runtime::ServerRuntime;
