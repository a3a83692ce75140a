// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plan status transitions.

use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::model::{EvaluationEntry, PlanStatus};

/// Whether `from -> to` is an edge of the lifecycle. Staying in the same
/// status is not a transition and is handled by the caller.
pub fn is_allowed(from: PlanStatus, to: PlanStatus) -> bool {
    use PlanStatus::*;
    matches!(
        (from, to),
        (Planned, Active)
            | (Planned, Canceled)
            | (Active, Finished)
            | (Active, NotCompleted)
            | (Active, Canceled)
            | (Unknown, Canceled)
    )
}

/// Facts the transition guards look at.
#[derive(Debug, Clone, Copy)]
pub struct Guard<'a> {
    pub date: NaiveDate,
    pub today: NaiveDate,
    pub cluster_ids: &'a [i32],
    pub evaluation: &'a [EvaluationEntry],
    pub cancellation_note: &'a str,
}

/// Validate moving a plan from `from` to `to`.
pub fn check_transition(from: PlanStatus, to: PlanStatus, guard: Guard<'_>) -> Result<()> {
    if to == PlanStatus::Unknown {
        return Err(Error::bad_request("status 'unknown' cannot be set"));
    }
    if from != to && !is_allowed(from, to) {
        return Err(Error::bad_request(format!(
            "watering plan cannot move from {} to {}",
            from, to
        )));
    }

    match to {
        PlanStatus::Active if from != to && guard.date > guard.today => {
            Err(Error::bad_request(format!(
                "watering plan for {} cannot start before its date",
                guard.date
            )))
        }
        PlanStatus::Finished if from != to => check_evaluation(guard.cluster_ids, guard.evaluation),
        PlanStatus::NotCompleted if !guard.evaluation.is_empty() => Err(Error::bad_request(
            "a not completed watering plan takes no evaluation",
        )),
        _ => Ok(()),
    }?;

    if to == PlanStatus::Canceled {
        if guard.cancellation_note.trim().is_empty() {
            return Err(Error::bad_request(
                "cancellation_note is required to cancel a watering plan",
            ));
        }
    } else if !guard.cancellation_note.is_empty() {
        return Err(Error::bad_request(
            "cancellation_note is only allowed for canceled watering plans",
        ));
    }
    Ok(())
}

/// Exactly one non-negative entry per linked cluster.
pub fn check_evaluation(cluster_ids: &[i32], evaluation: &[EvaluationEntry]) -> Result<()> {
    let linked: BTreeSet<i32> = cluster_ids.iter().copied().collect();
    let mut seen = BTreeSet::new();
    for entry in evaluation {
        if !linked.contains(&entry.cluster_id) {
            return Err(Error::bad_request(format!(
                "evaluation refers to tree cluster {} which is not part of the plan",
                entry.cluster_id
            )));
        }
        if !seen.insert(entry.cluster_id) {
            return Err(Error::bad_request(format!(
                "evaluation lists tree cluster {} twice",
                entry.cluster_id
            )));
        }
        if !entry.consumed_water_litres.is_finite() || entry.consumed_water_litres < 0.0 {
            return Err(Error::bad_request(format!(
                "consumed water for tree cluster {} must not be negative",
                entry.cluster_id
            )));
        }
    }
    if seen.len() != linked.len() {
        return Err(Error::bad_request(
            "evaluation needs one entry per tree cluster of the plan",
        ));
    }
    Ok(())
}
