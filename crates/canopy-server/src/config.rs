// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for canopy-server.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use canopy_core::model::Coordinate;
use canopy_core::routing::RoutingConfig;

/// Default MQTT topic filter for sensor telemetry.
pub const DEFAULT_MQTT_TOPIC: &str = "canopy/sensors/+/data";

/// Identity provider settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OidcConfig {
    /// Realm URL, e.g. `https://auth.example.org/realms/canopy`
    pub issuer: String,
    /// Base64 DER of the realm's RS256 public key
    pub public_key_b64: String,
    /// Role every caller must hold, if any
    pub required_role: Option<String>,
}

/// MQTT broker settings. Ingress is disabled without them.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL; `memory://` selects the in-memory store
    pub database_url: String,
    /// Maximum PostgreSQL pool size
    pub max_db_connections: u32,
    /// HTTP listen port
    pub port: u16,
    /// External base URL, used for GPX links
    pub app_url: String,
    /// Age after which a silent sensor is offline
    pub sensor_stale_threshold: Duration,
    pub sensor_sweep_interval: Duration,
    /// Plugins without a heartbeat for this long are evicted
    pub plugin_timeout: Duration,
    pub plugin_cleanup_interval: Duration,
    pub plan_sweep_interval: Duration,
    pub routing: RoutingConfig,
    /// Directory holding GPX files
    pub blob_dir: PathBuf,
    pub oidc: OidcConfig,
    pub mqtt: Option<MqttConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("CANOPY_DATABASE_URL")?;
        let max_db_connections = parsed("CANOPY_DATABASE_MAX_CONNECTIONS", 10u32)?;
        let port = parsed("CANOPY_SERVER_PORT", 3000u16)?;
        let app_url = std::env::var("CANOPY_APP_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        let sensor_stale_threshold = seconds("CANOPY_SENSOR_STALE_THRESHOLD_SECS", 72 * 3600)?;
        let sensor_sweep_interval = seconds("CANOPY_SENSOR_SWEEP_INTERVAL_SECS", 3 * 3600)?;
        let plugin_timeout = seconds("CANOPY_PLUGIN_TIMEOUT_SECS", 300)?;
        let plugin_cleanup_interval = seconds("CANOPY_PLUGIN_CLEANUP_INTERVAL_SECS", 60)?;
        let plan_sweep_interval = seconds("CANOPY_PLAN_SWEEP_INTERVAL_SECS", 24 * 3600)?;

        // Plugins are told to beat every `timeout / 2` whole seconds.
        if plugin_timeout < Duration::from_secs(2) {
            return Err(ConfigError::Invalid {
                var: "CANOPY_PLUGIN_TIMEOUT_SECS",
                reason: "must be at least twice the heartbeat interval of 1 second".to_string(),
            });
        }

        let routing = RoutingConfig {
            optimiser_url: required("CANOPY_ROUTING_OPTIMISER_URL")?,
            directions_url: required("CANOPY_ROUTING_DIRECTIONS_URL")?,
            depot: match std::env::var("CANOPY_ROUTING_DEPOT") {
                Ok(raw) => parse_depot(&raw)?,
                Err(_) => RoutingConfig::default().depot,
            },
            timeout: seconds("CANOPY_ROUTING_TIMEOUT_SECS", 30)?,
        };

        let blob_dir = PathBuf::from(
            std::env::var("CANOPY_BLOB_DIR").unwrap_or_else(|_| ".data/gpx".to_string()),
        );

        let oidc = OidcConfig {
            issuer: required("CANOPY_OIDC_ISSUER")?,
            public_key_b64: required("CANOPY_OIDC_PUBLIC_KEY_B64")?,
            required_role: std::env::var("CANOPY_OIDC_REQUIRED_ROLE")
                .ok()
                .filter(|r| !r.is_empty()),
        };

        let mqtt = match std::env::var("CANOPY_MQTT_BROKER") {
            Ok(broker) if !broker.is_empty() => {
                let (host, port) = parse_broker(&broker)?;
                Some(MqttConfig {
                    host,
                    port,
                    topic: std::env::var("CANOPY_MQTT_TOPIC")
                        .unwrap_or_else(|_| DEFAULT_MQTT_TOPIC.to_string()),
                    client_id: std::env::var("CANOPY_MQTT_CLIENT_ID")
                        .unwrap_or_else(|_| "canopy-server".to_string()),
                })
            }
            _ => None,
        };

        Ok(Self {
            database_url,
            max_db_connections,
            port,
            app_url,
            sensor_stale_threshold,
            sensor_sweep_interval,
            plugin_timeout,
            plugin_cleanup_interval,
            plan_sweep_interval,
            routing,
            blob_dir,
            oidc,
            mqtt,
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingEnvVar(var))
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// A positive number of seconds.
fn seconds(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs = parsed(var, default)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

/// `lon,lat`
fn parse_depot(raw: &str) -> Result<Coordinate, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var: "CANOPY_ROUTING_DEPOT",
        reason,
    };
    let (lon, lat) = raw
        .split_once(',')
        .ok_or_else(|| invalid(format!("expected 'lon,lat', got '{}'", raw)))?;
    let lon: f64 = lon.trim().parse().map_err(|_| invalid(format!("bad longitude '{}'", lon)))?;
    let lat: f64 = lat.trim().parse().map_err(|_| invalid(format!("bad latitude '{}'", lat)))?;
    let depot = Coordinate::new(lat, lon);
    depot.validate().map_err(|e| invalid(e.to_string()))?;
    Ok(depot)
}

/// `host:port`, port defaulting to 1883.
fn parse_broker(raw: &str) -> Result<(String, u16), ConfigError> {
    match raw.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| ConfigError::Invalid {
                var: "CANOPY_MQTT_BROKER",
                reason: format!("bad port '{}'", port),
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((raw.to_string(), 1883)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is present but unusable.
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
