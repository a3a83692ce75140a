// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tree maintenance.
//!
//! Every write publishes a tree event after commit so the aggregator can
//! recompute the clusters involved.

use std::sync::Arc;

use chrono::{Datelike, Utc};
use serde::Deserialize;
use tracing::info;

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::model::{Coordinate, Tree};
use crate::store::{NewTree, Repository, Store, StoreError, TreeFilter, run_in_tx};

/// Writable tree attributes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TreeInput {
    #[serde(default)]
    pub tree_cluster_id: Option<i32>,
    #[serde(default)]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub species: String,
    #[serde(default)]
    pub number: String,
    pub planting_year: i32,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub readonly: bool,
}

impl TreeInput {
    fn validate(&mut self) -> Result<()> {
        let this_year = Utc::now().year();
        if self.planting_year < 1 || self.planting_year > this_year {
            return Err(Error::bad_request(format!(
                "planting_year must be between 1 and {}",
                this_year
            )));
        }
        Coordinate::new(self.latitude, self.longitude).validate()?;
        // An empty sensor id means "no sensor".
        if let Some(sensor_id) = &self.sensor_id {
            if sensor_id.trim().is_empty() {
                self.sensor_id = None;
            }
        }
        Ok(())
    }
}

/// Check that referenced cluster and sensor exist and the sensor is free.
async fn check_links(repo: &mut dyn Repository, tree_id: i32, input: &TreeInput) -> Result<()> {
    if let Some(cluster_id) = input.tree_cluster_id {
        match repo.get_cluster(cluster_id).await {
            Ok(cluster) if cluster.archived => {
                return Err(Error::bad_request(format!(
                    "tree cluster {} is archived",
                    cluster_id
                )));
            }
            Ok(_) => {}
            Err(StoreError::EntityNotFound { .. }) => {
                return Err(Error::bad_request(format!(
                    "tree cluster {} does not exist",
                    cluster_id
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
    if let Some(sensor_id) = &input.sensor_id {
        match repo.get_sensor(sensor_id).await {
            Ok(_) => {}
            Err(StoreError::EntityNotFound { .. }) => {
                return Err(Error::bad_request(format!(
                    "sensor '{}' does not exist",
                    sensor_id
                )));
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(holder) = repo.get_tree_by_sensor(sensor_id).await? {
            if holder.id != tree_id {
                return Err(Error::conflict(format!(
                    "sensor '{}' is already attached to tree {}",
                    sensor_id, holder.id
                )));
            }
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct TreeService {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl TreeService {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub async fn create(&self, ctx: &RequestContext, mut input: TreeInput) -> Result<Tree> {
        input.validate()?;
        let tree = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                check_links(repo, 0, &input).await?;
                Ok(repo
                    .create_tree(&NewTree {
                        tree_cluster_id: input.tree_cluster_id,
                        sensor_id: input.sensor_id,
                        species: input.species,
                        number: input.number,
                        planting_year: input.planting_year,
                        latitude: input.latitude,
                        longitude: input.longitude,
                        description: input.description,
                        readonly: input.readonly,
                    })
                    .await?)
            })
        })
        .await?;

        info!(tree_id = tree.id, cluster_id = ?tree.tree_cluster_id, "Tree created");
        self.bus.publish(Event::TreeCreated { id: tree.id }).await;
        Ok(tree)
    }

    pub async fn get(&self, ctx: &RequestContext, id: i32) -> Result<Tree> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.get_tree(id).await?)
    }

    pub async fn list(&self, ctx: &RequestContext, filter: &TreeFilter) -> Result<(Vec<Tree>, i64)> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.list_trees(filter, ctx.pagination()).await?)
    }

    /// Replace a tree's attributes. Read-only trees accept changes to
    /// cluster, sensor and description only.
    pub async fn update(&self, ctx: &RequestContext, id: i32, mut input: TreeInput) -> Result<Tree> {
        input.validate()?;
        let (old_cluster_id, tree) = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                let current = repo.get_tree(id).await?;
                if current.readonly {
                    let fixed_changed = current.species != input.species
                        || current.number != input.number
                        || current.planting_year != input.planting_year
                        || current.coordinate != Coordinate::new(input.latitude, input.longitude)
                        || !input.readonly;
                    if fixed_changed {
                        return Err(Error::bad_request(format!(
                            "tree {} is read-only; only cluster, sensor and description can change",
                            id
                        )));
                    }
                }
                check_links(repo, id, &input).await?;

                let old_cluster_id = current.tree_cluster_id;
                let next = Tree {
                    tree_cluster_id: input.tree_cluster_id,
                    sensor_id: input.sensor_id,
                    species: input.species,
                    number: input.number,
                    planting_year: input.planting_year,
                    coordinate: Coordinate::new(input.latitude, input.longitude),
                    description: input.description,
                    readonly: input.readonly,
                    ..current
                };
                repo.update_tree(&next).await?;
                Ok((old_cluster_id, repo.get_tree(id).await?))
            })
        })
        .await?;

        info!(tree_id = id, "Tree updated");
        self.bus
            .publish(Event::TreeUpdated {
                id,
                old_cluster_id,
                new_cluster_id: tree.tree_cluster_id,
            })
            .await;
        Ok(tree)
    }

    pub async fn delete(&self, ctx: &RequestContext, id: i32) -> Result<()> {
        let cluster_id = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                let tree = repo.get_tree(id).await?;
                if tree.readonly {
                    return Err(Error::bad_request(format!(
                        "tree {} is read-only and cannot be deleted",
                        id
                    )));
                }
                repo.delete_tree(id).await?;
                Ok(tree.tree_cluster_id)
            })
        })
        .await?;

        info!(tree_id = id, "Tree deleted");
        self.bus.publish(Event::TreeDeleted { id, cluster_id }).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;
    use crate::model::{SensorStatus, SoilCondition};
    use crate::store::{MemoryStore, NewCluster, NewSensor};

    fn input(cluster_id: Option<i32>, sensor_id: Option<&str>) -> TreeInput {
        TreeInput {
            tree_cluster_id: cluster_id,
            sensor_id: sensor_id.map(str::to_string),
            species: "Quercus robur".to_string(),
            number: "1001".to_string(),
            planting_year: 1998,
            latitude: 54.79,
            longitude: 9.43,
            description: String::new(),
            readonly: false,
        }
    }

    async fn setup() -> (Arc<MemoryStore>, TreeService, EventBus, i32) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let cluster_id = {
            let mut repo = store.session().await.unwrap();
            repo.create_sensor(&NewSensor {
                id: "s-1".to_string(),
                status: SensorStatus::Online,
                sensor_type: String::new(),
            })
            .await
            .unwrap();
            repo.create_cluster(&NewCluster {
                name: "Park".to_string(),
                address: String::new(),
                description: String::new(),
                region: None,
                soil_condition: SoilCondition::Sandy,
            })
            .await
            .unwrap()
            .id
        };
        let trees = TreeService::new(store.clone(), bus.clone());
        (store, trees, bus, cluster_id)
    }

    #[tokio::test]
    async fn test_create_validates_links() {
        let (_store, trees, _bus, cluster_id) = setup().await;
        let ctx = RequestContext::default();

        assert!(matches!(
            trees.create(&ctx, input(Some(999), None)).await,
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            trees.create(&ctx, input(None, Some("missing"))).await,
            Err(Error::BadRequest(_))
        ));

        let mut bad_year = input(None, None);
        bad_year.planting_year = 3000;
        assert!(matches!(
            trees.create(&ctx, bad_year).await,
            Err(Error::BadRequest(_))
        ));

        let tree = trees
            .create(&ctx, input(Some(cluster_id), Some("s-1")))
            .await
            .unwrap();
        assert_eq!(tree.sensor_id.as_deref(), Some("s-1"));

        // One sensor per tree.
        let err = trees
            .create(&ctx, input(Some(cluster_id), Some("s-1")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let (found, total) = trees
            .list(
                &ctx,
                &TreeFilter {
                    sensor_id: Some("s-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(found[0].id, tree.id);
    }

    #[tokio::test]
    async fn test_update_publishes_cluster_move() {
        let (_store, trees, bus, cluster_id) = setup().await;
        let mut rx = bus.subscribe("test", &[Topic::TreeUpdated]);
        let ctx = RequestContext::default();

        let tree = trees.create(&ctx, input(Some(cluster_id), None)).await.unwrap();
        let moved = trees.update(&ctx, tree.id, input(None, None)).await.unwrap();
        assert_eq!(moved.tree_cluster_id, None);
        assert_eq!(moved.created_at, tree.created_at);

        assert_eq!(
            rx.recv().await,
            Some(Event::TreeUpdated {
                id: tree.id,
                old_cluster_id: Some(cluster_id),
                new_cluster_id: None,
            })
        );
    }

    #[tokio::test]
    async fn test_readonly_tree_rules() {
        let (_store, trees, _bus, cluster_id) = setup().await;
        let ctx = RequestContext::default();

        let mut imported = input(None, None);
        imported.readonly = true;
        let tree = trees.create(&ctx, imported.clone()).await.unwrap();

        let mut relinked = imported.clone();
        relinked.tree_cluster_id = Some(cluster_id);
        relinked.sensor_id = Some("s-1".to_string());
        relinked.description = "next to the fountain".to_string();
        let updated = trees.update(&ctx, tree.id, relinked).await.unwrap();
        assert_eq!(updated.tree_cluster_id, Some(cluster_id));

        let mut moved = imported.clone();
        moved.latitude = 54.0;
        assert!(matches!(
            trees.update(&ctx, tree.id, moved).await,
            Err(Error::BadRequest(_))
        ));

        assert!(matches!(
            trees.delete(&ctx, tree.id).await,
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_publishes_cluster() {
        let (_store, trees, bus, cluster_id) = setup().await;
        let mut rx = bus.subscribe("test", &[Topic::TreeDeleted]);
        let ctx = RequestContext::default();

        let tree = trees.create(&ctx, input(Some(cluster_id), None)).await.unwrap();
        trees.delete(&ctx, tree.id).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(Event::TreeDeleted {
                id: tree.id,
                cluster_id: Some(cluster_id),
            })
        );
        assert!(matches!(trees.get(&ctx, tree.id).await, Err(Error::NotFound(_))));
    }
}
