//! Shared tracking state: registry, correlation index and status cache.
//!
//! `TrackerState` is owned by one `JobTracker` and shared with its polling
//! tasks through [`SharedState`]. Callers hold the lock only for synchronous
//! sections, never across an `.await`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::cache::StatusCache;
use super::correlation::{CorrelationIndex, CorrelationSnapshot, CreationEvent};
use super::models::{
    Attribution, ChildSummary, Job, JobId, JobKind, JobSnapshot, PollState, StatusReport,
};
use super::output::{self, CombinedTranscript};
use super::progress::{self, ObservationOutcome};
use super::registry::JobRegistry;

pub type SharedState = Arc<RwLock<TrackerState>>;

/// Serializable form of the registry and correlation index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub correlation: CorrelationSnapshot,
}

pub const PERSISTED_STATE_VERSION: u32 = 1;

#[derive(Debug)]
pub struct TrackerState {
    pub registry: JobRegistry,
    pub correlation: CorrelationIndex,
    pub cache: StatusCache,
    correlation_grace: Duration,
}

impl TrackerState {
    pub fn new(cache_ttl: Duration, correlation_grace: Duration) -> Self {
        Self {
            registry: JobRegistry::new(),
            correlation: CorrelationIndex::new(),
            cache: StatusCache::new(cache_ttl),
            correlation_grace,
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Record a master job acknowledged by the execution service.
    pub fn register_master(&mut self, job: Job, extra: serde_json::Value) {
        self.correlation.record_creation(
            CreationEvent::master(job.id.clone(), job.label.clone(), job.targets.clone())
                .with_extra(extra),
        );
        self.registry.upsert(job);
    }

    /// Record a per-host job and try to attach it to a master. Returns the
    /// master it was attached to.
    pub fn register_individual(
        &mut self,
        job_id: &str,
        label: &str,
        target: &str,
        extra: serde_json::Value,
    ) -> Option<JobId> {
        if !self.registry.contains(job_id) {
            self.registry.upsert(Job::individual(job_id, label, target));
        }
        self.correlation
            .record_creation(CreationEvent::individual(job_id, label, target).with_extra(extra));

        let master = self.correlation.associate(job_id, target)?;
        progress::recompute_master(&mut self.registry, &self.correlation, &master);
        Some(master)
    }

    /// Fold a successful status response into the state. The status cache
    /// is left to the caller, which knows whether the report is fresh.
    pub fn apply_report(&mut self, job_id: &str, report: &StatusReport) -> Option<ObservationOutcome> {
        let job = self.registry.get_mut(job_id)?;
        job.last_polled_at = Some(Utc::now());
        if let Some(text) = &report.output {
            output::append_raw(&mut job.raw_output, text);
        }

        let outcome = progress::record_observation(
            &mut self.registry,
            &self.correlation,
            job_id,
            report.progress,
            report.status,
        )?;
        debug!(
            job_id,
            status = %report.status,
            progress = ?report.progress,
            "Applied status report"
        );
        Some(outcome)
    }

    pub fn attribution(&self, job: &Job, now: DateTime<Utc>) -> Attribution {
        if self.correlation.has_children(&job.id) {
            return Attribution::PerHost;
        }
        let grace = ChronoDuration::from_std(self.correlation_grace).unwrap_or_else(|_| ChronoDuration::weeks(52));
        let waiting = job.kind == JobKind::Master
            && self.correlation.master_of(&job.id).is_none()
            && now.signed_duration_since(job.created_at) < grace;
        if waiting {
            Attribution::AwaitingHosts
        } else {
            Attribution::SingleStream
        }
    }

    pub fn combined_output(&self, job_id: &str) -> Option<CombinedTranscript> {
        let job = self.registry.get(job_id)?;
        let attribution = self.attribution(job, Utc::now());
        output::render_combined(&self.registry, &self.correlation, job_id, attribution)
    }

    pub fn snapshot_job(&self, job_id: &str, poll_state: PollState, with_output: bool) -> Option<JobSnapshot> {
        let job = self.registry.get(job_id)?;
        let children = self
            .correlation
            .children_of(job_id)
            .iter()
            .filter_map(|link| {
                self.registry.get(&link.job_id).map(|child| ChildSummary {
                    id: child.id.clone(),
                    target: link.target.clone(),
                    status: child.status,
                    progress: child.progress,
                })
            })
            .collect();

        Some(JobSnapshot {
            id: job.id.clone(),
            kind: job.kind,
            label: job.label.clone(),
            targets: job.targets.clone(),
            status: job.status,
            progress: job.progress,
            attribution: self.attribution(job, Utc::now()),
            poll_state,
            children,
            master_id: self.correlation.master_of(job_id).cloned(),
            combined_output: with_output
                .then(|| self.combined_output(job_id).map(|t| t.to_string()))
                .flatten(),
        })
    }

    /// Ids of jobs shown as top-level cards: masters and uncorrelated
    /// per-host jobs, in creation order.
    pub fn top_level_ids(&self) -> Vec<JobId> {
        self.registry
            .all()
            .filter(|job| !job.dismissed && self.correlation.master_of(&job.id).is_none())
            .map(|job| job.id.clone())
            .collect()
    }

    /// Remove a job together with its correlation entries and cache entry.
    pub fn remove(&mut self, job_id: &str) -> Option<Job> {
        self.correlation.forget(job_id);
        self.cache.remove(job_id);
        self.registry.remove(job_id)
    }

    /// Remove every job flagged as dismissed, along with the per-host jobs
    /// that belong to it. Returns the removed ids.
    pub fn sweep_dismissed(&mut self) -> Vec<JobId> {
        let dismissed: Vec<JobId> = self
            .registry
            .all()
            .filter(|job| job.dismissed)
            .map(|job| job.id.clone())
            .collect();

        let mut removed = Vec::new();
        for id in dismissed {
            let children: Vec<JobId> = self
                .correlation
                .children_of(&id)
                .iter()
                .map(|link| link.job_id.clone())
                .collect();
            for child in children {
                if self.remove(&child).is_some() {
                    removed.push(child);
                }
            }
            if self.remove(&id).is_some() {
                removed.push(id);
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.registry.clear();
        self.correlation.clear();
        self.cache.clear();
    }

    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            version: PERSISTED_STATE_VERSION,
            saved_at: Utc::now(),
            jobs: self.registry.all().cloned().collect(),
            correlation: self.correlation.snapshot(),
        }
    }

    /// Merge persisted state. Jobs already present by id are left alone.
    /// Returns the ids of newly inserted jobs that are not terminal.
    pub fn merge_persisted(&mut self, persisted: PersistedState) -> Vec<JobId> {
        let mut resumable = Vec::new();
        for job in persisted.jobs {
            if self.registry.contains(&job.id) {
                continue;
            }
            if !job.is_terminal() && !job.dismissed {
                resumable.push(job.id.clone());
            }
            self.registry.upsert(job);
        }
        self.correlation.merge(persisted.correlation);
        resumable
    }
}
