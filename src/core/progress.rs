//! Folding of poll observations into job and master progress.
//!
//! Per-host polls are the only ground truth. A master that has correlated
//! per-host jobs derives its status and progress from them; its own status
//! endpoint is only consulted while it has none. Every update goes through
//! the registry's clamping, so nothing shown here ever moves backwards.

use serde::Serialize;

use super::correlation::{ChildLink, CorrelationIndex};
use super::models::{JobId, JobStatus, MAX_ACTIVE_PROGRESS};
use super::registry::JobRegistry;

/// Stand-in progress for a per-host job that has not been polled yet, so a
/// master's bar moves before real data arrives.
pub const UNPOLLED_CHILD_PROGRESS: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    pub status: JobStatus,
    pub progress: u8,
}

/// Result of folding one observation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationOutcome {
    /// The observed job's own stream reached a terminal status.
    pub stream_finished: bool,
    /// Jobs whose status became terminal because of this observation.
    pub finished: Vec<JobId>,
    /// Master recomputed from this observation, if any.
    pub master: Option<JobId>,
}

/// Derive a master's status and progress from its per-host jobs.
///
/// `unresolved` counts targets with no per-host job yet; each contributes
/// [`UNPOLLED_CHILD_PROGRESS`] and keeps the master from completing.
/// Returns `None` when there are no children.
pub fn derive_aggregate(registry: &JobRegistry, children: &[ChildLink], unresolved: usize) -> Option<Aggregate> {
    if children.is_empty() {
        return None;
    }

    let mut total = unresolved as u32 * u32::from(UNPOLLED_CHILD_PROGRESS);
    let mut any_failed = false;
    let mut all_terminal = unresolved == 0;

    for link in children {
        let contribution = match registry.get(&link.job_id) {
            Some(child) => {
                any_failed |= child.status == JobStatus::Failed;
                all_terminal &= child.status.is_terminal();
                match child.status {
                    JobStatus::Completed => 100,
                    JobStatus::Failed | JobStatus::Cancelled => child.reported_progress,
                    _ if child.has_been_polled() => child.progress,
                    _ => UNPOLLED_CHILD_PROGRESS,
                }
            }
            None => {
                all_terminal = false;
                UNPOLLED_CHILD_PROGRESS
            }
        };
        total += u32::from(contribution);
    }

    let count = (children.len() + unresolved) as u32;
    let mean = ((total + count / 2) / count) as u8;

    let status = if any_failed {
        JobStatus::Failed
    } else if all_terminal {
        JobStatus::Completed
    } else {
        JobStatus::Running
    };

    Some(Aggregate {
        status,
        progress: mean,
    })
}

/// Recompute a master from its children. Returns true when the master
/// became terminal or its terminal status changed.
pub fn recompute_master(
    registry: &mut JobRegistry,
    correlation: &CorrelationIndex,
    master_id: &str,
) -> bool {
    let children = correlation.children_of(master_id);
    let Some(master) = registry.get(master_id) else {
        return false;
    };
    // Once the master's own run is over, targets that never got a per-host
    // job are not waited for.
    let unresolved = if master.stream_finished {
        0
    } else {
        master.targets.len().saturating_sub(children.len())
    };
    let Some(aggregate) = derive_aggregate(registry, children, unresolved) else {
        return false;
    };
    let Some(master) = registry.get_mut(master_id) else {
        return false;
    };

    master.aggregated = true;

    if master.status.is_terminal() {
        // Any failed host fails the master, even after its own stream
        // reported completion. Progress is left where it was.
        if master.status == JobStatus::Completed && aggregate.status == JobStatus::Failed {
            master.status = JobStatus::Failed;
            return true;
        }
        // A derived failure keeps tracking hosts that are still finishing.
        if master.status == JobStatus::Failed {
            master.progress = master.progress.max(aggregate.progress);
        }
        return false;
    }

    match aggregate.status {
        JobStatus::Failed => {
            master.status = JobStatus::Failed;
            master.progress = master.progress.max(aggregate.progress);
        }
        JobStatus::Completed | JobStatus::Cancelled => {
            master.status = aggregate.status;
            master.progress = 100;
        }
        JobStatus::Running | JobStatus::Pending => {
            master.status = JobStatus::Running;
            master.progress = master
                .progress
                .max(aggregate.progress)
                .min(MAX_ACTIVE_PROGRESS);
        }
    }
    master.status.is_terminal()
}

/// Fold one observation for `job_id` and propagate it to its master.
///
/// A master with correlated children only has its stream state tracked
/// here; its status and progress are recomputed from the children instead.
pub fn record_observation(
    registry: &mut JobRegistry,
    correlation: &CorrelationIndex,
    job_id: &str,
    progress: Option<u8>,
    status: JobStatus,
) -> Option<ObservationOutcome> {
    let mut outcome = ObservationOutcome {
        stream_finished: status.is_terminal(),
        ..Default::default()
    };

    if correlation.has_children(job_id) {
        let master = registry.get_mut(job_id)?;
        master.stream_finished |= status.is_terminal();
        if recompute_master(registry, correlation, job_id) {
            outcome.finished.push(job_id.to_string());
        }
        outcome.master = Some(job_id.to_string());
        return Some(outcome);
    }

    let (_, finished) = registry.observe(job_id, progress, status)?;
    if let Some(job) = registry.get_mut(job_id) {
        job.stream_finished |= status.is_terminal();
    }
    if finished {
        outcome.finished.push(job_id.to_string());
    }

    if let Some(master_id) = correlation.master_of(job_id).cloned() {
        if recompute_master(registry, correlation, &master_id) {
            outcome.finished.push(master_id.clone());
        }
        outcome.master = Some(master_id);
    }

    Some(outcome)
}
