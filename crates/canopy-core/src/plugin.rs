// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of external plugins with heartbeat-based liveness.
//!
//! A plugin is listed only while its last heartbeat is younger than the
//! configured timeout. Reads filter expired entries so the guarantee holds
//! between cleanup runs as well.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::identity::{AccessToken, IdentityProvider};
use crate::scheduler::Job;

/// Default eviction timeout.
pub const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(300);

/// A registered plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub slug: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub host_path: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Client credentials a plugin presents at registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginRegistration {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub host_path: String,
    pub auth: ClientCredentials,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registered {
    pub plugin: Plugin,
    pub token: AccessToken,
    /// How often the plugin must send heartbeats.
    pub heartbeat_interval_secs: u64,
}

fn validate_slug(slug: &str) -> Result<()> {
    let valid = !slug.is_empty()
        && slug.len() <= 64
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::bad_request(format!(
            "plugin slug '{}' must be 1-64 lowercase letters, digits, '-' or '_'",
            slug
        )))
    }
}

pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Plugin>>,
    identity: Arc<dyn IdentityProvider>,
    timeout: Duration,
}

impl PluginRegistry {
    pub fn new(identity: Arc<dyn IdentityProvider>, timeout: Duration) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            identity,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Interval advertised to plugins, half the timeout.
    pub fn heartbeat_interval(&self) -> Duration {
        self.timeout / 2
    }

    fn timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX)
    }

    fn is_alive(&self, plugin: &Plugin, now: DateTime<Utc>) -> bool {
        now - plugin.last_heartbeat <= self.timeout_chrono()
    }

    /// Register or refresh a plugin and mint a delegated token.
    ///
    /// The credential exchange happens before the lock is taken.
    #[instrument(skip_all, fields(slug = %registration.slug))]
    pub async fn register(&self, registration: PluginRegistration) -> Result<Registered> {
        validate_slug(&registration.slug)?;
        if registration.name.trim().is_empty() {
            return Err(Error::bad_request("plugin name is required"));
        }
        url::Url::parse(&registration.host_path).map_err(|e| {
            Error::bad_request(format!(
                "invalid host_path '{}': {}",
                registration.host_path, e
            ))
        })?;

        let token = self
            .identity
            .client_credentials(
                &registration.auth.client_id,
                &registration.auth.client_secret,
            )
            .await?;

        let plugin = Plugin {
            slug: registration.slug,
            name: registration.name,
            version: registration.version,
            description: registration.description,
            host_path: registration.host_path,
            last_heartbeat: Utc::now(),
        };

        let replaced = {
            let mut plugins = self.write()?;
            plugins.insert(plugin.slug.clone(), plugin.clone()).is_some()
        };
        info!(slug = %plugin.slug, version = %plugin.version, replaced, "Plugin registered");

        Ok(Registered {
            plugin,
            token,
            heartbeat_interval_secs: self.heartbeat_interval().as_secs(),
        })
    }

    /// Refresh the heartbeat of a live plugin.
    pub fn heartbeat(&self, slug: &str) -> Result<Plugin> {
        let now = Utc::now();
        let mut plugins = self.write()?;
        let alive = plugins
            .get(slug)
            .map(|p| self.is_alive(p, now))
            .unwrap_or(false);
        if !alive {
            plugins.remove(slug);
            return Err(Error::not_found(format!("plugin '{}' not found", slug)));
        }
        match plugins.get_mut(slug) {
            Some(plugin) => {
                plugin.last_heartbeat = now;
                debug!(slug, "Plugin heartbeat");
                Ok(plugin.clone())
            }
            None => Err(Error::not_found(format!("plugin '{}' not found", slug))),
        }
    }

    pub fn get(&self, slug: &str) -> Result<Plugin> {
        let now = Utc::now();
        let plugins = self.read()?;
        plugins
            .get(slug)
            .filter(|p| self.is_alive(p, now))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("plugin '{}' not found", slug)))
    }

    /// Live plugins ordered by slug.
    pub fn list(&self) -> Result<Vec<Plugin>> {
        let now = Utc::now();
        let plugins = self.read()?;
        let mut live: Vec<Plugin> = plugins
            .values()
            .filter(|p| self.is_alive(p, now))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(live)
    }

    pub fn unregister(&self, slug: &str) -> Result<()> {
        let removed = self.write()?.remove(slug);
        match removed {
            Some(_) => {
                info!(slug, "Plugin unregistered");
                Ok(())
            }
            None => Err(Error::not_found(format!("plugin '{}' not found", slug))),
        }
    }

    /// Evict plugins whose heartbeat is older than the timeout at `now`.
    /// Returns the evicted slugs.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let expired: Vec<String> = {
            let plugins = self.read()?;
            plugins
                .values()
                .filter(|p| !self.is_alive(p, now))
                .map(|p| p.slug.clone())
                .collect()
        };
        if expired.is_empty() {
            return Ok(expired);
        }

        let mut evicted = Vec::with_capacity(expired.len());
        {
            let mut plugins = self.write()?;
            for slug in expired {
                // A heartbeat may have landed between the scan and the lock.
                let still_expired = plugins
                    .get(&slug)
                    .map(|p| !self.is_alive(p, now))
                    .unwrap_or(false);
                if still_expired {
                    plugins.remove(&slug);
                    evicted.push(slug);
                }
            }
        }
        for slug in &evicted {
            info!(slug = %slug, "Plugin evicted after missed heartbeats");
        }
        Ok(evicted)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Plugin>>> {
        self.plugins
            .read()
            .map_err(|_| Error::internal("plugin registry lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Plugin>>> {
        self.plugins
            .write()
            .map_err(|_| Error::internal("plugin registry lock poisoned"))
    }

    #[cfg(test)]
    fn set_heartbeat(&self, slug: &str, at: DateTime<Utc>) {
        if let Some(plugin) = self.plugins.write().unwrap().get_mut(slug) {
            plugin.last_heartbeat = at;
        }
    }
}

/// Periodic eviction of silent plugins.
pub struct PluginCleanup {
    registry: Arc<PluginRegistry>,
}

impl PluginCleanup {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Job for PluginCleanup {
    fn name(&self) -> &'static str {
        "plugin_cleanup"
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<()> {
        let evicted = self.registry.cleanup_at(Utc::now())?;
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Plugin cleanup finished");
        }
        Ok(())
    }
}
