// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tree cluster maintenance.
//!
//! Tree membership is written together with the cluster and every cluster
//! whose membership changed is recomputed in the same transaction.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::aggregator::recompute_cluster;
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::model::{SoilCondition, TreeCluster};
use crate::store::{ClusterFilter, NewCluster, Repository, Store, run_in_tx};

/// Writable cluster attributes. `tree_ids` is the complete membership.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterInput {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_soil")]
    pub soil_condition: SoilCondition,
    #[serde(default)]
    pub tree_ids: Vec<i32>,
}

fn default_soil() -> SoilCondition {
    SoilCondition::Unknown
}

impl ClusterInput {
    fn validate(&mut self) -> Result<()> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(Error::bad_request("cluster name is required"));
        }
        let unique: BTreeSet<i32> = self.tree_ids.iter().copied().collect();
        if unique.len() != self.tree_ids.len() {
            return Err(Error::bad_request("tree_ids contains duplicates"));
        }
        self.region = self
            .region
            .take()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        Ok(())
    }
}

/// A tree whose cluster changed as part of a cluster write.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Moved {
    tree_id: i32,
    from: Option<i32>,
    to: Option<i32>,
}

/// Point exactly `tree_ids` at `cluster_id`, then recompute every cluster
/// that gained or lost a tree, in id order.
async fn write_membership(
    repo: &mut dyn Repository,
    cluster_id: i32,
    current: &[i32],
    tree_ids: &[i32],
    fresh_since: DateTime<Utc>,
) -> Result<Vec<Moved>> {
    let trees = repo.get_trees(tree_ids).await?;
    if trees.len() != tree_ids.len() {
        let found: BTreeSet<i32> = trees.iter().map(|t| t.id).collect();
        let missing: Vec<String> = tree_ids
            .iter()
            .filter(|id| !found.contains(id))
            .map(|id| id.to_string())
            .collect();
        return Err(Error::bad_request(format!(
            "unknown tree ids: {}",
            missing.join(", ")
        )));
    }

    let mut moved = Vec::new();
    let removed: Vec<i32> = current
        .iter()
        .copied()
        .filter(|id| !tree_ids.contains(id))
        .collect();
    for &tree_id in &removed {
        moved.push(Moved {
            tree_id,
            from: Some(cluster_id),
            to: None,
        });
    }
    for tree in &trees {
        if tree.tree_cluster_id != Some(cluster_id) {
            moved.push(Moved {
                tree_id: tree.id,
                from: tree.tree_cluster_id,
                to: Some(cluster_id),
            });
        }
    }

    if !removed.is_empty() {
        repo.set_tree_cluster(&removed, None).await?;
    }
    let added: Vec<i32> = moved
        .iter()
        .filter(|m| m.to == Some(cluster_id))
        .map(|m| m.tree_id)
        .collect();
    if !added.is_empty() {
        repo.set_tree_cluster(&added, Some(cluster_id)).await?;
    }

    let mut affected: BTreeSet<i32> = moved.iter().filter_map(|m| m.from).collect();
    affected.insert(cluster_id);
    for id in affected {
        recompute_cluster(repo, id, fresh_since).await?;
    }
    Ok(moved)
}

#[derive(Clone)]
pub struct ClusterService {
    store: Arc<dyn Store>,
    bus: EventBus,
    stale_threshold: Duration,
}

impl ClusterService {
    pub fn new(store: Arc<dyn Store>, bus: EventBus, stale_threshold: Duration) -> Self {
        Self {
            store,
            bus,
            stale_threshold,
        }
    }

    fn fresh_since(&self) -> Result<DateTime<Utc>> {
        let threshold = chrono::Duration::from_std(self.stale_threshold)
            .map_err(|e| Error::internal(format!("invalid stale threshold: {}", e)))?;
        Ok(Utc::now() - threshold)
    }

    async fn announce(&self, moved: &[Moved]) {
        for m in moved {
            self.bus
                .publish(Event::TreeUpdated {
                    id: m.tree_id,
                    old_cluster_id: m.from,
                    new_cluster_id: m.to,
                })
                .await;
        }
    }

    pub async fn create(&self, ctx: &RequestContext, mut input: ClusterInput) -> Result<TreeCluster> {
        input.validate()?;
        let since = self.fresh_since()?;
        let (cluster, moved) = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                let created = repo
                    .create_cluster(&NewCluster {
                        name: input.name,
                        address: input.address,
                        description: input.description,
                        region: input.region,
                        soil_condition: input.soil_condition,
                    })
                    .await?;
                let moved = write_membership(repo, created.id, &[], &input.tree_ids, since).await?;
                Ok((repo.get_cluster(created.id).await?, moved))
            })
        })
        .await?;

        info!(cluster_id = cluster.id, trees = cluster.tree_ids.len(), "Tree cluster created");
        self.announce(&moved).await;
        Ok(cluster)
    }

    pub async fn get(&self, ctx: &RequestContext, id: i32) -> Result<TreeCluster> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.get_cluster(id).await?)
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        filter: &ClusterFilter,
    ) -> Result<(Vec<TreeCluster>, i64)> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.list_clusters(filter, ctx.pagination()).await?)
    }

    /// Replace attributes and membership.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        id: i32,
        mut input: ClusterInput,
    ) -> Result<TreeCluster> {
        input.validate()?;
        let since = self.fresh_since()?;
        let (cluster, moved) = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                let current = repo.lock_cluster(id).await?;
                if current.archived {
                    return Err(Error::bad_request(format!(
                        "tree cluster {} is archived",
                        id
                    )));
                }
                let next = TreeCluster {
                    name: input.name,
                    address: input.address,
                    description: input.description,
                    region: input.region,
                    soil_condition: input.soil_condition,
                    ..current.clone()
                };
                repo.update_cluster(&next).await?;
                let moved =
                    write_membership(repo, id, &current.tree_ids, &input.tree_ids, since).await?;
                Ok((repo.get_cluster(id).await?, moved))
            })
        })
        .await?;

        info!(cluster_id = id, "Tree cluster updated");
        self.announce(&moved).await;
        Ok(cluster)
    }

    /// Soft-delete. Archived clusters stay readable but cannot be planned.
    pub async fn archive(&self, ctx: &RequestContext, id: i32) -> Result<TreeCluster> {
        let cluster = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                let mut cluster = repo.lock_cluster(id).await?;
                if !cluster.archived {
                    cluster.archived = true;
                    repo.update_cluster(&cluster).await?;
                }
                Ok(repo.get_cluster(id).await?)
            })
        })
        .await?;
        info!(cluster_id = id, "Tree cluster archived");
        Ok(cluster)
    }

    /// Delete a cluster no plan refers to. Its trees are detached.
    pub async fn delete(&self, ctx: &RequestContext, id: i32) -> Result<()> {
        run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                repo.lock_cluster(id).await?;
                let plans = repo.count_plans_for_cluster(id).await?;
                if plans > 0 {
                    return Err(Error::conflict(format!(
                        "tree cluster {} is used by {} watering plan(s)",
                        id, plans
                    )));
                }
                repo.delete_cluster(id).await?;
                Ok(())
            })
        })
        .await?;
        info!(cluster_id = id, "Tree cluster deleted");
        Ok(())
    }
}
