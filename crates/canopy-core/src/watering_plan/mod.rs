// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Watering-plan engine.
//!
//! Every create and update runs in one transaction: links are resolved
//! against persisted vehicles and clusters, vehicle bookings are checked
//! for the plan date, water demand is derived and the route planner is
//! consulted. Updates hand the current plan to a caller-supplied mutator
//! and revalidate whatever it produced before anything is written.
//! `WateringPlanUpdated` is published after commit on every status change.

pub mod state;
pub mod water;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, gpx_key, validate_key};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::model::{
    EvaluationEntry, PlanStatus, TreeCluster, Vehicle, VehicleType, WateringPlan,
};
use crate::routing::{GpxStream, Rig, RoutePlanner, RoutePreview, RoutingError};
use crate::scheduler::Job;
use crate::store::{
    NewPlan, PLAN_SWEEP_LOCK, PlanFilter, Repository, Store, StoreError, run_in_tx,
};

use self::state::{Guard, check_transition};
use self::water::{refills, total_water_required};

/// Body of a plan creation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlanInput {
    pub date: NaiveDate,
    #[serde(default)]
    pub description: String,
    pub transporter_id: i32,
    #[serde(default)]
    pub trailer_id: Option<i32>,
    pub cluster_ids: Vec<i32>,
    pub user_ids: Vec<String>,
}

/// The writable part of a plan, as seen by an update mutator.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDraft {
    pub date: NaiveDate,
    pub description: String,
    pub status: PlanStatus,
    pub transporter_id: i32,
    pub trailer_id: Option<i32>,
    pub cluster_ids: Vec<i32>,
    pub user_ids: Vec<String>,
    pub cancellation_note: String,
    pub evaluation: Vec<EvaluationEntry>,
}

impl From<&WateringPlan> for PlanDraft {
    fn from(plan: &WateringPlan) -> Self {
        Self {
            date: plan.date,
            description: plan.description.clone(),
            status: plan.status,
            transporter_id: plan.transporter_id,
            trailer_id: plan.trailer_id,
            cluster_ids: plan.cluster_ids.clone(),
            user_ids: plan.user_ids.clone(),
            cancellation_note: plan.cancellation_note.clone(),
            evaluation: plan.evaluation.clone(),
        }
    }
}

/// Body of a plan update. Absent fields keep their current value; an
/// explicit `"trailer_id": null` detaches the trailer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlanUpdate {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub transporter_id: Option<i32>,
    #[serde(default, deserialize_with = "present")]
    pub trailer_id: Option<Option<i32>>,
    #[serde(default)]
    pub cluster_ids: Option<Vec<i32>>,
    #[serde(default)]
    pub user_ids: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<PlanStatus>,
    #[serde(default)]
    pub cancellation_note: Option<String>,
    #[serde(default)]
    pub evaluation: Option<Vec<EvaluationEntry>>,
}

fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl PlanUpdate {
    /// Merge into `draft`. Reports whether anything changed. The evaluation
    /// is only taken when the resulting status is `finished`.
    pub fn apply(self, draft: &mut PlanDraft) -> Result<bool> {
        let before = draft.clone();
        if let Some(date) = self.date {
            draft.date = date;
        }
        if let Some(description) = self.description {
            draft.description = description;
        }
        if let Some(transporter_id) = self.transporter_id {
            draft.transporter_id = transporter_id;
        }
        if let Some(trailer_id) = self.trailer_id {
            draft.trailer_id = trailer_id;
        }
        if let Some(cluster_ids) = self.cluster_ids {
            draft.cluster_ids = cluster_ids;
        }
        if let Some(user_ids) = self.user_ids {
            draft.user_ids = user_ids;
        }
        if let Some(status) = self.status {
            draft.status = status;
        }
        if let Some(note) = self.cancellation_note {
            draft.cancellation_note = note;
        }
        if let Some(evaluation) = self.evaluation {
            if draft.status == PlanStatus::Finished {
                draft.evaluation = evaluation;
            }
        }
        Ok(*draft != before)
    }
}

/// Rig and clusters requested for a route preview.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoutePreviewRequest {
    pub transporter_id: i32,
    #[serde(default)]
    pub trailer_id: Option<i32>,
    pub cluster_ids: Vec<i32>,
}

/// A plan with its links resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanDetails {
    #[serde(flatten)]
    pub plan: WateringPlan,
    pub transporter: Vehicle,
    pub trailer: Option<Vehicle>,
    pub tree_clusters: Vec<TreeCluster>,
}

fn normalize_users(user_ids: Vec<String>) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut users = Vec::with_capacity(user_ids.len());
    for raw in user_ids {
        let user = raw.trim().to_string();
        if user.is_empty() {
            return Err(Error::bad_request("user ids must not be empty"));
        }
        if !seen.insert(user.clone()) {
            return Err(Error::bad_request(format!("user '{}' is listed twice", user)));
        }
        users.push(user);
    }
    if users.is_empty() {
        return Err(Error::bad_request(
            "a watering plan needs at least one user",
        ));
    }
    Ok(users)
}

async fn load_vehicle(repo: &mut dyn Repository, id: i32, role: &str) -> Result<Vehicle> {
    match repo.get_vehicle(id).await {
        Ok(vehicle) => Ok(vehicle),
        Err(StoreError::EntityNotFound { .. }) => Err(Error::bad_request(format!(
            "{} {} does not exist",
            role, id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Resolve and type-check the vehicles of a rig.
async fn load_rig(
    repo: &mut dyn Repository,
    transporter_id: i32,
    trailer_id: Option<i32>,
) -> Result<Rig> {
    let transporter = load_vehicle(repo, transporter_id, "transporter").await?;
    if transporter.vehicle_type != VehicleType::Transporter {
        return Err(Error::bad_request(
            "transporter requires a vehicle of type transporter",
        ));
    }
    let trailer = match trailer_id {
        Some(id) => {
            let trailer = load_vehicle(repo, id, "trailer").await?;
            if trailer.vehicle_type != VehicleType::Trailer {
                return Err(Error::bad_request(
                    "trailer requires a vehicle of type trailer",
                ));
            }
            Some(trailer)
        }
        None => None,
    };
    Ok(Rig::new(transporter, trailer))
}

/// Resolve clusters in the requested order. Archived clusters may stay on a
/// plan that already links them but cannot be added.
async fn load_clusters(
    repo: &mut dyn Repository,
    ids: &[i32],
    already_linked: &[i32],
) -> Result<Vec<TreeCluster>> {
    if ids.is_empty() {
        return Err(Error::bad_request(
            "a watering plan needs at least one tree cluster",
        ));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = ids.iter().find(|id| !seen.insert(**id)) {
        return Err(Error::bad_request(format!(
            "tree cluster {} is listed twice",
            dup
        )));
    }

    let mut found = repo.get_clusters(ids).await?;
    let mut ordered = Vec::with_capacity(ids.len());
    for id in ids {
        let position = found
            .iter()
            .position(|c| c.id == *id)
            .ok_or_else(|| Error::bad_request(format!("tree cluster {} does not exist", id)))?;
        let cluster = found.swap_remove(position);
        if cluster.archived && !already_linked.contains(id) {
            return Err(Error::bad_request(format!(
                "tree cluster {} is archived",
                id
            )));
        }
        ordered.push(cluster);
    }
    Ok(ordered)
}

async fn check_bookings(
    repo: &mut dyn Repository,
    rig: &Rig,
    date: NaiveDate,
    exclude_plan: Option<i32>,
) -> Result<()> {
    let ids: Vec<i32> = rig.vehicles().map(|v| v.id).collect();
    let clashes = repo.find_vehicle_bookings(&ids, date, exclude_plan).await?;
    match clashes.first() {
        Some(booking) => Err(Error::conflict(format!(
            "vehicle {} is already booked on {} by watering plan {}",
            booking.vehicle_id, date, booking.plan_id
        ))),
        None => Ok(()),
    }
}

fn link_error(date: NaiveDate) -> impl FnOnce(StoreError) -> Error {
    move |e| match e {
        StoreError::Conflict { .. } => Error::conflict(format!(
            "a vehicle of this plan is already booked on {}",
            date
        )),
        other => other.into(),
    }
}

/// Call a routing collaborator, retrying once when it fails transiently.
async fn with_retry<T, F, Fut>(operation: &'static str, call: F) -> std::result::Result<T, RoutingError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, RoutingError>>,
{
    match call().await {
        Err(e) if e.is_transient() => {
            warn!(operation, error = %e, "Routing call failed, retrying once");
            call().await
        }
        other => other,
    }
}

struct Updated {
    plan: WateringPlan,
    old_status: PlanStatus,
}

/// Owns the plan lifecycle.
#[derive(Clone)]
pub struct WateringPlanEngine {
    store: Arc<dyn Store>,
    bus: EventBus,
    planner: Arc<dyn RoutePlanner>,
    blobs: Arc<dyn BlobStore>,
    app_url: Arc<str>,
}

impl WateringPlanEngine {
    pub fn new(
        store: Arc<dyn Store>,
        bus: EventBus,
        planner: Arc<dyn RoutePlanner>,
        blobs: Arc<dyn BlobStore>,
        app_url: &str,
    ) -> Self {
        Self {
            store,
            bus,
            planner,
            blobs,
            app_url: Arc::from(app_url.trim_end_matches('/')),
        }
    }

    /// Public URL of a stored GPX blob.
    pub fn gpx_url(&self, key: &str) -> String {
        format!("{}/api/v1/watering-plan/route/gpx/{}", self.app_url, key)
    }

    pub async fn create(&self, ctx: &RequestContext, input: PlanInput) -> Result<WateringPlan> {
        let draft = PlanDraft {
            date: input.date,
            description: input.description,
            status: PlanStatus::Planned,
            transporter_id: input.transporter_id,
            trailer_id: input.trailer_id,
            cluster_ids: input.cluster_ids,
            user_ids: normalize_users(input.user_ids)?,
            cancellation_note: String::new(),
            evaluation: Vec::new(),
        };
        let engine = self.clone();
        let plan = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move { engine.create_in(repo, draft).await })
        })
        .await?;
        info!(
            plan_id = plan.id,
            date = %plan.date,
            clusters = plan.cluster_ids.len(),
            distance = ?plan.distance,
            "Watering plan created"
        );
        Ok(plan)
    }

    async fn create_in(&self, repo: &mut dyn Repository, draft: PlanDraft) -> Result<WateringPlan> {
        let rig = load_rig(repo, draft.transporter_id, draft.trailer_id).await?;
        let clusters = load_clusters(repo, &draft.cluster_ids, &[]).await?;
        check_bookings(repo, &rig, draft.date, None).await?;

        let total = total_water_required(&clusters);
        let id = repo
            .create_plan(&NewPlan {
                date: draft.date,
                description: draft.description,
                status: PlanStatus::Planned,
                total_water_required: total,
                refills: refills(total, rig.water_capacity()),
            })
            .await?;

        let mut plan = repo.get_plan(id).await?;
        plan.transporter_id = draft.transporter_id;
        plan.trailer_id = draft.trailer_id;
        plan.cluster_ids = draft.cluster_ids;
        plan.user_ids = draft.user_ids;
        repo.replace_plan_links(&plan)
            .await
            .map_err(link_error(plan.date))?;

        plan.distance = self.route_distance(&rig, &clusters).await?;
        if plan.distance.is_some() {
            repo.update_plan(&plan).await?;
        }
        Ok(repo.get_plan(id).await?)
    }

    /// Load the plan, let `mutate` edit it and persist the result.
    ///
    /// The mutator returns `false` to commit nothing. Whatever it returns
    /// `true` for is revalidated in full: transition guards, vehicle types,
    /// cluster existence and vehicle bookings.
    pub async fn update<F>(&self, ctx: &RequestContext, id: i32, mutate: F) -> Result<WateringPlan>
    where
        F: FnOnce(&mut PlanDraft) -> Result<bool> + Send + 'static,
    {
        let engine = self.clone();
        let today = Utc::now().date_naive();
        let updated = run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move { engine.update_in(repo, id, today, mutate).await })
        })
        .await?;

        let plan = updated.plan;
        if updated.old_status != plan.status {
            info!(
                plan_id = id,
                old_status = %updated.old_status,
                new_status = %plan.status,
                "Watering plan status changed"
            );
            self.bus
                .publish(Event::WateringPlanUpdated {
                    id,
                    date: plan.date,
                    old_status: updated.old_status,
                    new_status: plan.status,
                })
                .await;
        }
        Ok(plan)
    }

    async fn update_in<F>(
        &self,
        repo: &mut dyn Repository,
        id: i32,
        today: NaiveDate,
        mutate: F,
    ) -> Result<Updated>
    where
        F: FnOnce(&mut PlanDraft) -> Result<bool>,
    {
        let current = repo.lock_plan(id).await?;
        let old_status = current.status;
        let original = PlanDraft::from(&current);
        let mut draft = original.clone();
        if !mutate(&mut draft)? || draft == original {
            debug!(plan_id = id, "Watering plan unchanged");
            return Ok(Updated {
                plan: current,
                old_status,
            });
        }
        if old_status.is_terminal() {
            return Err(Error::bad_request(format!(
                "watering plan {} is {} and can no longer be changed",
                id, old_status
            )));
        }

        draft.user_ids = normalize_users(draft.user_ids)?;
        check_transition(
            old_status,
            draft.status,
            Guard {
                date: draft.date,
                today,
                cluster_ids: &draft.cluster_ids,
                evaluation: &draft.evaluation,
                cancellation_note: &draft.cancellation_note,
            },
        )?;

        let relinked = draft.date != current.date
            || draft.transporter_id != current.transporter_id
            || draft.trailer_id != current.trailer_id
            || draft.cluster_ids != current.cluster_ids
            || draft.user_ids != current.user_ids;
        if draft.status == PlanStatus::Canceled && !relinked {
            // Stored links are kept as they are, even when they no longer resolve.
            let plan = WateringPlan {
                description: draft.description,
                status: draft.status,
                cancellation_note: draft.cancellation_note,
                ..current
            };
            repo.update_plan(&plan).await?;
            repo.release_plan_vehicles(id).await?;
            return Ok(Updated {
                plan: repo.get_plan(id).await?,
                old_status,
            });
        }

        let rig = load_rig(repo, draft.transporter_id, draft.trailer_id).await?;
        let clusters = load_clusters(repo, &draft.cluster_ids, &current.cluster_ids).await?;
        if !draft.status.is_terminal() {
            check_bookings(repo, &rig, draft.date, Some(id)).await?;
        }

        let total = total_water_required(&clusters);
        let mut plan = WateringPlan {
            date: draft.date,
            description: draft.description,
            status: draft.status,
            transporter_id: draft.transporter_id,
            trailer_id: draft.trailer_id,
            cluster_ids: draft.cluster_ids,
            user_ids: draft.user_ids,
            cancellation_note: draft.cancellation_note,
            evaluation: draft.evaluation,
            total_water_required: total,
            refills: refills(total, rig.water_capacity()),
            ..current.clone()
        };

        let links_changed = plan.cluster_ids != current.cluster_ids
            || plan.vehicle_ids() != current.vehicle_ids();
        if links_changed {
            plan.distance = self.route_distance(&rig, &clusters).await?;
        }
        if plan.status == PlanStatus::Active && (old_status != PlanStatus::Active || links_changed)
        {
            plan.gpx_url = Some(self.store_gpx(id, &rig, &clusters).await?);
        }

        repo.update_plan(&plan).await?;
        repo.replace_plan_links(&plan)
            .await
            .map_err(link_error(plan.date))?;
        if plan.status == PlanStatus::Finished {
            repo.set_plan_evaluation(id, &plan.evaluation).await?;
        }

        Ok(Updated {
            plan: repo.get_plan(id).await?,
            old_status,
        })
    }

    /// Distance of the planned route. A collaborator outage leaves it
    /// unset, rejected input fails the operation.
    async fn route_distance(&self, rig: &Rig, clusters: &[TreeCluster]) -> Result<Option<f64>> {
        let planner = self.planner.as_ref();
        match with_retry("preview", move || planner.preview(rig, clusters)).await {
            Ok(preview) => Ok(Some(preview.distance)),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Route planner unavailable, storing plan without distance");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store_gpx(&self, plan_id: i32, rig: &Rig, clusters: &[TreeCluster]) -> Result<String> {
        let planner = self.planner.as_ref();
        let stream = with_retry("gpx", move || planner.gpx(rig, clusters)).await?;
        let key = gpx_key(plan_id);
        self.blobs.put(&key, stream).await?;
        debug!(plan_id, key = %key, "Stored route GPX");
        Ok(self.gpx_url(&key))
    }

    /// Delete a plan that is not active.
    pub async fn delete(&self, ctx: &RequestContext, id: i32) -> Result<()> {
        run_in_tx(self.store.as_ref(), ctx.cancel_token(), move |repo| {
            Box::pin(async move {
                let plan = repo.lock_plan(id).await?;
                if plan.status == PlanStatus::Active {
                    return Err(Error::conflict(format!(
                        "watering plan {} is active and cannot be deleted",
                        id
                    )));
                }
                Ok(repo.delete_plan(id).await?)
            })
        })
        .await?;

        if let Err(e) = self.blobs.delete(&gpx_key(id)).await {
            warn!(plan_id = id, error = %e, "Failed to remove route GPX");
        }
        info!(plan_id = id, "Watering plan deleted");
        Ok(())
    }

    pub async fn get(&self, ctx: &RequestContext, id: i32) -> Result<WateringPlan> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.get_plan(id).await?)
    }

    /// A plan together with its vehicles and clusters.
    pub async fn get_details(&self, ctx: &RequestContext, id: i32) -> Result<PlanDetails> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        let plan = repo.get_plan(id).await?;
        let transporter = repo.get_vehicle(plan.transporter_id).await?;
        let trailer = match plan.trailer_id {
            Some(trailer_id) => Some(repo.get_vehicle(trailer_id).await?),
            None => None,
        };
        let mut clusters = repo.get_clusters(&plan.cluster_ids).await?;
        clusters.sort_by_key(|c| {
            plan.cluster_ids
                .iter()
                .position(|id| *id == c.id)
                .unwrap_or(usize::MAX)
        });
        Ok(PlanDetails {
            plan,
            transporter,
            trailer,
            tree_clusters: clusters,
        })
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        filter: &PlanFilter,
    ) -> Result<(Vec<WateringPlan>, i64)> {
        ctx.check_cancelled()?;
        let mut repo = self.store.session().await?;
        Ok(repo.list_plans(filter, ctx.pagination()).await?)
    }

    /// Route geometry for a rig and clusters without creating a plan.
    pub async fn preview_route(
        &self,
        ctx: &RequestContext,
        request: RoutePreviewRequest,
    ) -> Result<RoutePreview> {
        ctx.check_cancelled()?;
        let (rig, clusters) = {
            let mut repo = self.store.session().await?;
            let rig = load_rig(repo.as_mut(), request.transporter_id, request.trailer_id).await?;
            let clusters = load_clusters(repo.as_mut(), &request.cluster_ids, &[]).await?;
            (rig, clusters)
        };

        let planner = self.planner.as_ref();
        let rig = &rig;
        let clusters = clusters.as_slice();
        tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => Err(Error::Cancelled),
            preview = with_retry("preview", move || planner.preview(rig, clusters)) => Ok(preview?),
        }
    }

    /// Open a stored GPX file by name.
    pub async fn open_gpx(&self, ctx: &RequestContext, name: &str) -> Result<GpxStream> {
        ctx.check_cancelled()?;
        validate_key(name)?;
        self.blobs
            .open(name)
            .await?
            .ok_or_else(|| Error::not_found(format!("gpx file '{}' not found", name)))
    }

    /// Move planned plans whose date has passed to `not_completed`.
    ///
    /// Returns the ids that transitioned. A concurrent sweep holding the
    /// advisory lock makes this a no-op.
    pub async fn sweep_overdue(&self, cancel: &CancellationToken) -> Result<Vec<i32>> {
        let today = Utc::now().date_naive();
        let changed = run_in_tx(self.store.as_ref(), cancel, move |repo| {
            Box::pin(async move {
                if !repo.try_advisory_lock(PLAN_SWEEP_LOCK).await? {
                    debug!("Plan sweep already running elsewhere");
                    return Ok(Vec::new());
                }
                let overdue = repo.list_overdue_plans(today).await?;
                let mut changed = Vec::with_capacity(overdue.len());
                for mut plan in overdue {
                    let old_status = plan.status;
                    plan.status = PlanStatus::NotCompleted;
                    repo.update_plan(&plan).await?;
                    repo.release_plan_vehicles(plan.id).await?;
                    changed.push((plan.id, plan.date, old_status));
                }
                Ok(changed)
            })
        })
        .await?;

        for (id, date, old_status) in &changed {
            self.bus
                .publish(Event::WateringPlanUpdated {
                    id: *id,
                    date: *date,
                    old_status: *old_status,
                    new_status: PlanStatus::NotCompleted,
                })
                .await;
        }
        if !changed.is_empty() {
            info!(count = changed.len(), "Marked overdue watering plans not completed");
        }
        Ok(changed.into_iter().map(|(id, _, _)| id).collect())
    }
}

/// Periodic overdue-plan sweep.
pub struct PlanSweep {
    plans: Arc<WateringPlanEngine>,
}

impl PlanSweep {
    pub fn new(plans: Arc<WateringPlanEngine>) -> Self {
        Self { plans }
    }
}

#[async_trait]
impl Job for PlanSweep {
    fn name(&self) -> &'static str {
        "plan_sweep"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.plans.sweep_overdue(cancel).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::blob::FsBlobStore;
    use crate::events::Topic;
    use crate::model::{DrivingLicense, SoilCondition, VehicleStatus};
    use crate::routing::{FeatureCollection, gpx_from_bytes};
    use crate::store::{MemoryStore, NewCluster, NewTree, NewVehicle};
    use crate::vehicle::VehicleService;

    /// Planner double with scripted failures.
    #[derive(Default)]
    struct FakePlanner {
        calls: AtomicUsize,
        failures: Mutex<Vec<RoutingError>>,
    }

    impl FakePlanner {
        fn failing(errors: Vec<RoutingError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: Mutex::new(errors),
            }
        }

        fn next_failure(&self) -> Option<RoutingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        }
    }

    #[async_trait]
    impl RoutePlanner for FakePlanner {
        async fn preview(
            &self,
            _rig: &Rig,
            clusters: &[TreeCluster],
        ) -> std::result::Result<RoutePreview, RoutingError> {
            if let Some(e) = self.next_failure() {
                return Err(e);
            }
            Ok(RoutePreview {
                collection: FeatureCollection::new(vec![]),
                distance: 1000.0 * clusters.len() as f64,
                duration: 60.0,
            })
        }

        async fn gpx(
            &self,
            _rig: &Rig,
            _clusters: &[TreeCluster],
        ) -> std::result::Result<GpxStream, RoutingError> {
            if let Some(e) = self.next_failure() {
                return Err(e);
            }
            Ok(gpx_from_bytes(b"<gpx version=\"1.1\"/>".to_vec()))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: EventBus,
        planner: Arc<FakePlanner>,
        engine: WateringPlanEngine,
        _dir: tempfile::TempDir,
    }

    fn fixture(planner: FakePlanner) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let planner = Arc::new(planner);
        let dir = tempfile::tempdir().unwrap();
        let engine = WateringPlanEngine::new(
            store.clone(),
            bus.clone(),
            planner.clone(),
            Arc::new(FsBlobStore::new(dir.path())),
            "http://canopy.test/",
        );
        Fixture {
            store,
            bus,
            planner,
            engine,
            _dir: dir,
        }
    }

    async fn add_vehicle(
        store: &MemoryStore,
        plate: &str,
        vehicle_type: VehicleType,
        capacity: f64,
    ) -> i32 {
        let mut repo = store.session().await.unwrap();
        repo.create_vehicle(&NewVehicle {
            number_plate: plate.to_string(),
            description: String::new(),
            model: String::new(),
            water_capacity: capacity,
            vehicle_type,
            status: VehicleStatus::Active,
            driving_license: DrivingLicense::C,
            width: 2.5,
            height: 3.0,
            length: 7.0,
            weight: 10.0,
        })
        .await
        .unwrap()
        .id
    }

    async fn add_cluster(store: &MemoryStore, name: &str, trees: usize) -> i32 {
        let mut repo = store.session().await.unwrap();
        let cluster = repo
            .create_cluster(&NewCluster {
                name: name.to_string(),
                address: String::new(),
                description: String::new(),
                region: None,
                soil_condition: SoilCondition::Loamy,
            })
            .await
            .unwrap();
        let mut tree_ids = Vec::new();
        for i in 0..trees {
            let tree = repo
                .create_tree(&NewTree {
                    tree_cluster_id: None,
                    sensor_id: None,
                    species: "Quercus robur".to_string(),
                    number: format!("{}-{}", name, i),
                    planting_year: 2010,
                    latitude: 54.78 + i as f64 * 0.001,
                    longitude: 9.43,
                    description: String::new(),
                    readonly: false,
                })
                .await
                .unwrap();
            tree_ids.push(tree.id);
        }
        repo.set_tree_cluster(&tree_ids, Some(cluster.id))
            .await
            .unwrap();
        cluster.id
    }

    struct Seed {
        transporter: i32,
        trailer: i32,
        clusters: Vec<i32>,
    }

    async fn seed(store: &MemoryStore) -> Seed {
        let transporter = add_vehicle(store, "FL TBZ 1", VehicleType::Transporter, 2000.0).await;
        let trailer = add_vehicle(store, "FL TBZ 2", VehicleType::Trailer, 1000.0).await;
        let c1 = add_cluster(store, "c1", 1).await;
        let c2 = add_cluster(store, "c2", 6).await;
        Seed {
            transporter,
            trailer,
            clusters: vec![c1, c2],
        }
    }

    fn input(seed: &Seed, date: NaiveDate) -> PlanInput {
        PlanInput {
            date,
            description: "morning run".to_string(),
            transporter_id: seed.transporter,
            trailer_id: Some(seed.trailer),
            cluster_ids: seed.clusters.clone(),
            user_ids: vec!["u-1".to_string()],
        }
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn set_status(
        status: PlanStatus,
        note: &str,
    ) -> impl FnOnce(&mut PlanDraft) -> Result<bool> + Send + 'static {
        let update = PlanUpdate {
            status: Some(status),
            cancellation_note: Some(note.to_string()),
            ..Default::default()
        };
        move |draft: &mut PlanDraft| update.apply(draft)
    }

    #[tokio::test]
    async fn test_create_derives_water_and_distance() {
        let f = fixture(FakePlanner::default());
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();

        let plan = f.engine.create(&ctx, input(&seed, today())).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Planned);
        assert_eq!(plan.total_water_required, 400.0 + 1200.0);
        assert_eq!(plan.refills, 0);
        assert_eq!(plan.distance, Some(2000.0));
        assert_eq!(plan.cluster_ids, seed.clusters);
        assert_eq!(plan.user_ids, vec!["u-1".to_string()]);
        assert_eq!(plan.trailer_id, Some(seed.trailer));

        let details = f.engine.get_details(&ctx, plan.id).await.unwrap();
        assert_eq!(details.transporter.id, seed.transporter);
        assert_eq!(details.trailer.map(|t| t.id), Some(seed.trailer));
        let ordered: Vec<i32> = details.tree_clusters.iter().map(|c| c.id).collect();
        assert_eq!(ordered, seed.clusters);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_links() {
        let f = fixture(FakePlanner::default());
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();

        let mut wrong_trailer = input(&seed, today());
        wrong_trailer.trailer_id = Some(seed.transporter);
        let err = f.engine.create(&ctx, wrong_trailer).await.unwrap_err();
        assert_eq!(
            err,
            Error::bad_request("trailer requires a vehicle of type trailer")
        );

        let mut wrong_transporter = input(&seed, today());
        wrong_transporter.transporter_id = seed.trailer;
        wrong_transporter.trailer_id = None;
        let err = f.engine.create(&ctx, wrong_transporter).await.unwrap_err();
        assert_eq!(
            err,
            Error::bad_request("transporter requires a vehicle of type transporter")
        );

        let mut no_users = input(&seed, today());
        no_users.user_ids = vec![];
        assert!(matches!(
            f.engine.create(&ctx, no_users).await,
            Err(Error::BadRequest(_))
        ));

        let mut no_clusters = input(&seed, today());
        no_clusters.cluster_ids = vec![];
        assert!(matches!(
            f.engine.create(&ctx, no_clusters).await,
            Err(Error::BadRequest(_))
        ));

        let mut unknown_cluster = input(&seed, today());
        unknown_cluster.cluster_ids.push(999);
        assert!(matches!(
            f.engine.create(&ctx, unknown_cluster).await,
            Err(Error::BadRequest(_))
        ));

        let mut unknown_vehicle = input(&seed, today());
        unknown_vehicle.transporter_id = 999;
        assert!(matches!(
            f.engine.create(&ctx, unknown_vehicle).await,
            Err(Error::BadRequest(_))
        ));

        let (plans, total) = f.engine.list(&ctx, &PlanFilter::default()).await.unwrap();
        assert!(plans.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_double_booking_is_conflict() {
        let f = fixture(FakePlanner::default());
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();
        let date = today();

        let first = f.engine.create(&ctx, input(&seed, date)).await.unwrap();

        let mut second = input(&seed, date);
        second.trailer_id = None;
        let err = f.engine.create(&ctx, second).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{:?}", err);

        // Another day is free.
        let mut other_day = input(&seed, date + ChronoDuration::days(1));
        other_day.trailer_id = None;
        f.engine.create(&ctx, other_day).await.unwrap();

        // Canceling releases the booking.
        f.engine
            .update(&ctx, first.id, set_status(PlanStatus::Canceled, "flood"))
            .await
            .unwrap();
        f.engine.create(&ctx, input(&seed, date)).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_routing_failure_keeps_plan() {
        let f = fixture(FakePlanner::failing(vec![
            RoutingError::Unavailable("timeout".into()),
            RoutingError::Unavailable("timeout".into()),
        ]));
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();

        let plan = f.engine.create(&ctx, input(&seed, today())).await.unwrap();
        assert_eq!(plan.distance, None);
        assert_eq!(f.planner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_transient_failure_is_retried() {
        let f = fixture(FakePlanner::failing(vec![RoutingError::Unavailable(
            "reset".into(),
        )]));
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();

        let plan = f.engine.create(&ctx, input(&seed, today())).await.unwrap();
        assert_eq!(plan.distance, Some(2000.0));
        assert_eq!(f.planner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_routing_failure_rolls_back() {
        let f = fixture(FakePlanner::failing(vec![RoutingError::InvalidInput(
            "no route".into(),
        )]));
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();

        let err = f.engine.create(&ctx, input(&seed, today())).await.unwrap_err();
        assert_eq!(err, Error::bad_request("no route"));
        assert_eq!(f.planner.calls.load(Ordering::SeqCst), 1);

        let (plans, _) = f.engine.list(&ctx, &PlanFilter::default()).await.unwrap();
        assert!(plans.is_empty());
        // The booking went with the rollback.
        f.engine.create(&ctx, input(&seed, today())).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_requires_note_and_publishes() {
        let f = fixture(FakePlanner::default());
        let mut events = f.bus.subscribe("test", &[Topic::WateringPlanUpdated]);
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();
        let plan = f.engine.create(&ctx, input(&seed, today())).await.unwrap();

        let err = f
            .engine
            .update(&ctx, plan.id, set_status(PlanStatus::Canceled, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(f.engine.get(&ctx, plan.id).await.unwrap().status, PlanStatus::Planned);

        let canceled = f
            .engine
            .update(&ctx, plan.id, set_status(PlanStatus::Canceled, "flood"))
            .await
            .unwrap();
        assert_eq!(canceled.status, PlanStatus::Canceled);
        assert_eq!(canceled.cancellation_note, "flood");

        assert_eq!(
            events.recv().await,
            Some(Event::WateringPlanUpdated {
                id: plan.id,
                date: plan.date,
                old_status: PlanStatus::Planned,
                new_status: PlanStatus::Canceled,
            })
        );

        // Terminal plans are frozen.
        let err = f
            .engine
            .update(&ctx, plan.id, |draft: &mut PlanDraft| {
                draft.description = "late edit".to_string();
                Ok(true)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_vehicle_delete_after_cancel() {
        let f = fixture(FakePlanner::default());
        let vehicles = VehicleService::new(f.store.clone());
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();
        let plan = f.engine.create(&ctx, input(&seed, today())).await.unwrap();

        let err = vehicles.delete(&ctx, seed.trailer).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{:?}", err);

        f.engine
            .update(&ctx, plan.id, set_status(PlanStatus::Canceled, "flood"))
            .await
            .unwrap();
        vehicles.delete(&ctx, seed.trailer).await.unwrap();
        vehicles.delete(&ctx, seed.transporter).await.unwrap();

        let stored = f.engine.get(&ctx, plan.id).await.unwrap();
        assert_eq!(stored.status, PlanStatus::Canceled);
        assert_eq!(stored.trailer_id, None);
        assert_eq!(stored.cancellation_note, "flood");
    }

    #[tokio::test]
    async fn test_cancel_plan_without_transporter() {
        let f = fixture(FakePlanner::default());
        let vehicles = VehicleService::new(f.store.clone());
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();
        let plan = f.engine.create(&ctx, input(&seed, today())).await.unwrap();

        f.engine
            .update(&ctx, plan.id, set_status(PlanStatus::Active, ""))
            .await
            .unwrap();
        f.engine
            .update(&ctx, plan.id, set_status(PlanStatus::NotCompleted, ""))
            .await
            .unwrap();
        vehicles.delete(&ctx, seed.transporter).await.unwrap();

        let orphaned = f.engine.get(&ctx, plan.id).await.unwrap();
        assert_eq!(orphaned.status, PlanStatus::Unknown);

        let canceled = f
            .engine
            .update(&ctx, plan.id, set_status(PlanStatus::Canceled, "vehicle sold"))
            .await
            .unwrap();
        assert_eq!(canceled.status, PlanStatus::Canceled);
        assert_eq!(canceled.total_water_required, orphaned.total_water_required);
        assert_eq!(canceled.distance, orphaned.distance);
    }

    #[tokio::test]
    async fn test_mutator_without_change_writes_nothing() {
        let f = fixture(FakePlanner::default());
        let mut events = f.bus.subscribe("test", &[Topic::WateringPlanUpdated]);
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();
        let plan = f.engine.create(&ctx, input(&seed, today())).await.unwrap();

        let same = f
            .engine
            .update(&ctx, plan.id, |draft: &mut PlanDraft| {
                draft.description = "ignored".to_string();
                Ok(false)
            })
            .await
            .unwrap();
        assert_eq!(same, plan);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_lifecycle_to_finished() {
        let f = fixture(FakePlanner::default());
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();
        let plan = f.engine.create(&ctx, input(&seed, today())).await.unwrap();

        let active = f
            .engine
            .update(&ctx, plan.id, set_status(PlanStatus::Active, ""))
            .await
            .unwrap();
        assert_eq!(active.status, PlanStatus::Active);
        let key = gpx_key(plan.id);
        assert_eq!(
            active.gpx_url.as_deref(),
            Some(format!("http://canopy.test/api/v1/watering-plan/route/gpx/{}", key).as_str())
        );
        let mut gpx = String::new();
        f.engine
            .open_gpx(&ctx, &key)
            .await
            .unwrap()
            .read_to_string(&mut gpx)
            .await
            .unwrap();
        assert!(gpx.starts_with("<gpx"));

        let err = f.engine.delete(&ctx, plan.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Finishing needs one entry per cluster.
        let partial = PlanUpdate {
            status: Some(PlanStatus::Finished),
            evaluation: Some(vec![EvaluationEntry {
                cluster_id: seed.clusters[0],
                consumed_water_litres: 350.0,
            }]),
            ..Default::default()
        };
        let err = f
            .engine
            .update(&ctx, plan.id, move |d| partial.apply(d))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let evaluation = vec![
            EvaluationEntry {
                cluster_id: seed.clusters[0],
                consumed_water_litres: 350.0,
            },
            EvaluationEntry {
                cluster_id: seed.clusters[1],
                consumed_water_litres: 1100.0,
            },
        ];
        let full = PlanUpdate {
            status: Some(PlanStatus::Finished),
            evaluation: Some(evaluation.clone()),
            ..Default::default()
        };
        let finished = f
            .engine
            .update(&ctx, plan.id, move |d| full.apply(d))
            .await
            .unwrap();
        assert_eq!(finished.status, PlanStatus::Finished);
        assert_eq!(finished.evaluation, evaluation);

        f.engine.delete(&ctx, plan.id).await.unwrap();
        assert!(matches!(
            f.engine.open_gpx(&ctx, &key).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_activation_waits_for_plan_date() {
        let f = fixture(FakePlanner::default());
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();
        let plan = f
            .engine
            .create(&ctx, input(&seed, today() + ChronoDuration::days(3)))
            .await
            .unwrap();

        let err = f
            .engine
            .update(&ctx, plan.id, set_status(PlanStatus::Active, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_update_relinks_and_recomputes() {
        let f = fixture(FakePlanner::default());
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();
        let plan = f.engine.create(&ctx, input(&seed, today())).await.unwrap();
        let big = add_cluster(&f.store, "c3", 16).await;

        let update = PlanUpdate {
            cluster_ids: Some(vec![big, seed.clusters[0]]),
            trailer_id: Some(None),
            ..Default::default()
        };
        let updated = f
            .engine
            .update(&ctx, plan.id, move |d| update.apply(d))
            .await
            .unwrap();
        assert_eq!(updated.cluster_ids, vec![big, seed.clusters[0]]);
        assert_eq!(updated.trailer_id, None);
        assert_eq!(updated.total_water_required, 2400.0 + 400.0);
        assert_eq!(updated.refills, 1);
        assert_eq!(updated.distance, Some(2000.0));

        // The released trailer can be booked elsewhere on the same date.
        let spare = add_vehicle(&f.store, "FL TBZ 3", VehicleType::Transporter, 500.0).await;
        let mut other = input(&seed, plan.date);
        other.transporter_id = spare;
        f.engine.create(&ctx, other).await.unwrap();
    }

    #[test]
    fn test_update_body_merges() {
        let body: PlanUpdate =
            serde_json::from_str(r#"{"status": "canceled", "cancellation_note": "flood", "trailer_id": null}"#)
                .unwrap();
        assert_eq!(body.trailer_id, Some(None));
        assert_eq!(body.date, None);

        let mut draft = PlanDraft {
            date: NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(),
            description: String::new(),
            status: PlanStatus::Planned,
            transporter_id: 1,
            trailer_id: Some(2),
            cluster_ids: vec![1, 2],
            user_ids: vec!["u-1".to_string()],
            cancellation_note: String::new(),
            evaluation: vec![],
        };
        assert!(body.apply(&mut draft).unwrap());
        assert_eq!(draft.status, PlanStatus::Canceled);
        assert_eq!(draft.trailer_id, None);
        assert_eq!(draft.cluster_ids, vec![1, 2]);

        let untouched: PlanUpdate = serde_json::from_str("{}").unwrap();
        let before = draft.clone();
        assert!(!untouched.apply(&mut draft).unwrap());
        assert_eq!(draft, before);

        // Evaluation is dropped unless the plan finishes.
        let ignored: PlanUpdate = serde_json::from_str(
            r#"{"evaluation": [{"cluster_id": 1, "consumed_water_litres": 5}]}"#,
        )
        .unwrap();
        assert!(!ignored.apply(&mut draft).unwrap());
    }

    #[tokio::test]
    async fn test_sweep_marks_overdue_plans() {
        let f = fixture(FakePlanner::default());
        let mut events = f.bus.subscribe("test", &[Topic::WateringPlanUpdated]);
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();
        let yesterday = today() - ChronoDuration::days(1);
        let overdue = f.engine.create(&ctx, input(&seed, yesterday)).await.unwrap();
        let current = f.engine.create(&ctx, input(&seed, today())).await.unwrap();

        let cancel = CancellationToken::new();
        let swept = f.engine.sweep_overdue(&cancel).await.unwrap();
        assert_eq!(swept, vec![overdue.id]);
        assert_eq!(
            f.engine.get(&ctx, overdue.id).await.unwrap().status,
            PlanStatus::NotCompleted
        );
        assert_eq!(
            f.engine.get(&ctx, current.id).await.unwrap().status,
            PlanStatus::Planned
        );
        assert_eq!(
            events.recv().await,
            Some(Event::WateringPlanUpdated {
                id: overdue.id,
                date: yesterday,
                old_status: PlanStatus::Planned,
                new_status: PlanStatus::NotCompleted,
            })
        );

        // Vehicles are free again on the swept date.
        f.engine.create(&ctx, input(&seed, yesterday)).await.unwrap();
        assert_eq!(f.engine.sweep_overdue(&cancel).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_preview_and_gpx_lookup() {
        let f = fixture(FakePlanner::default());
        let seed = seed(&f.store).await;
        let ctx = RequestContext::default();

        let preview = f
            .engine
            .preview_route(
                &ctx,
                RoutePreviewRequest {
                    transporter_id: seed.transporter,
                    trailer_id: None,
                    cluster_ids: seed.clusters.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(preview.distance, 2000.0);

        assert!(matches!(
            f.engine.open_gpx(&ctx, "../secret").await,
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            f.engine.open_gpx(&ctx, "plan-77.gpx").await,
            Err(Error::NotFound(_))
        ));
    }
}
