//! The job tracker: the one object the presentation layer talks to.
//!
//! A tracker is created when the daemon starts and dropped when it stops.
//! It owns the shared state, the polling scheduler and the execution
//! service handle, and turns user actions (start, cancel, expand, collapse,
//! dismiss, clear) into state changes and polling decisions.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::error::TrackerError;
use super::models::{Job, JobId, JobSnapshot, JobStatus, PollState};
use super::progress;
use super::scheduler::PollingScheduler;
use super::state::{SharedState, TrackerState};
use crate::config::{AppConfig, PollingConfig};
use crate::remote::{ExecutionService, StartRequest, unique_hosts};

/// State changes other components can react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    JobCreated { job_id: JobId },
    JobUpdated { job_id: JobId },
    JobFinished { job_id: JobId },
    JobDismissed { job_id: JobId },
    Cleared,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub polling: PollingConfig,
    pub correlation_grace: Duration,
    pub cancel_grace: Duration,
    pub fan_out_spacing: Duration,
    /// Poll every job from creation, as if its detail view were open.
    pub auto_poll: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for TrackerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            polling: config.polling.clone(),
            correlation_grace: Duration::from_secs(config.correlation_grace_secs),
            cancel_grace: Duration::from_secs(config.cancel_grace_secs),
            fan_out_spacing: Duration::from_millis(config.fan_out_spacing_ms),
            auto_poll: config.auto_poll,
        }
    }
}

#[derive(Clone)]
pub struct JobTracker {
    state: SharedState,
    service: Arc<dyn ExecutionService>,
    scheduler: PollingScheduler,
    events: broadcast::Sender<TrackerEvent>,
    expanded: Arc<Mutex<HashSet<JobId>>>,
    config: Arc<TrackerConfig>,
}

fn poll_state_of(job: &Job, polling: bool) -> PollState {
    if polling {
        PollState::Polling
    } else if job.is_terminal() {
        PollState::Terminated
    } else {
        PollState::Idle
    }
}

impl JobTracker {
    pub fn new(service: Arc<dyn ExecutionService>, config: TrackerConfig) -> Self {
        let state = TrackerState::new(config.polling.cache_ttl(), config.correlation_grace).shared();
        let (events, _) = broadcast::channel(256);
        let scheduler = PollingScheduler::new(
            state.clone(),
            service.clone(),
            config.polling.clone(),
            events.clone(),
        );
        Self {
            state,
            service,
            scheduler,
            events,
            expanded: Arc::new(Mutex::new(HashSet::new())),
            config: Arc::new(config),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TrackerEvent) {
        let _ = self.events.send(event);
    }

    fn is_expanded(&self, job_id: &str) -> bool {
        self.expanded
            .lock()
            .map(|set| set.contains(job_id))
            .unwrap_or(false)
    }

    /// Start a playbook run.
    ///
    /// A request carrying the single-host marker is tracked as a per-host
    /// job and offered to the correlation index. Anything else becomes a
    /// master; with `fan_out` set, one per-host run is then started for each
    /// accepted target.
    pub async fn start(&self, request: StartRequest, fan_out: bool) -> Result<JobSnapshot, TrackerError> {
        let request = request.with_unique_hosts();
        if request.playbook.trim().is_empty() {
            return Err(TrackerError::InvalidRequest("playbook is required".into()));
        }
        if request.hosts.is_empty() {
            return Err(TrackerError::InvalidRequest("at least one host is required".into()));
        }

        if request.single_host_target().is_some() {
            let job_id = self.start_individual(&request).await?;
            return self.snapshot(&job_id, false).await;
        }

        let ack = self
            .service
            .start(&request)
            .await
            .map_err(TrackerError::StartFailed)?;
        let targets = ack
            .hosts
            .map(unique_hosts)
            .filter(|hosts| !hosts.is_empty())
            .unwrap_or_else(|| request.hosts.clone());
        let job_id = ack.job_id;

        {
            let mut state = self.state.write().await;
            state.register_master(
                Job::master(job_id.clone(), request.label(), targets.clone()),
                serde_json::Value::Object(request.extra_vars.clone()),
            );
        }
        info!(job_id = %job_id, playbook = %request.playbook, targets = targets.len(), fan_out, "Playbook started");
        self.emit(TrackerEvent::JobCreated { job_id: job_id.clone() });

        if self.config.auto_poll {
            self.scheduler.ensure_polling(&job_id);
        }
        self.watch_correlation(&job_id, fan_out);
        if fan_out {
            self.spawn_fan_out(request, targets);
        }

        self.snapshot(&job_id, false).await
    }

    async fn start_individual(&self, request: &StartRequest) -> Result<JobId, TrackerError> {
        let target = request
            .single_host_target()
            .ok_or_else(|| TrackerError::InvalidRequest("per-host run without a host".into()))?;
        let ack = self
            .service
            .start(request)
            .await
            .map_err(TrackerError::StartFailed)?;

        let master = {
            let mut state = self.state.write().await;
            state.register_individual(
                &ack.job_id,
                &request.label(),
                &target,
                serde_json::Value::Object(request.extra_vars.clone()),
            )
        };
        info!(job_id = %ack.job_id, target = %target, master_id = ?master, "Per-host run started");
        self.emit(TrackerEvent::JobCreated { job_id: ack.job_id.clone() });
        if let Some(master) = &master {
            self.emit(TrackerEvent::JobUpdated { job_id: master.clone() });
        }

        let parent_open = master.as_deref().is_some_and(|m| self.is_expanded(m));
        if self.config.auto_poll || parent_open {
            self.scheduler.ensure_polling(&ack.job_id);
        }
        Ok(ack.job_id)
    }

    fn spawn_fan_out(&self, request: StartRequest, targets: Vec<String>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            for (idx, host) in targets.iter().enumerate() {
                if idx > 0 {
                    tokio::time::sleep(tracker.config.fan_out_spacing).await;
                }
                if let Err(e) = tracker.start_individual(&request.for_single_host(host)).await {
                    warn!(target = %host, error = %e, "Per-host run failed to start; continuing");
                }
            }
        });
    }

    /// Log when a master's correlation grace window passes without any
    /// per-host job; its card falls back to the single-stream view.
    fn watch_correlation(&self, job_id: &str, expected: bool) {
        let tracker = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.config.correlation_grace).await;
            let state = tracker.state.read().await;
            if state.registry.contains(&job_id) && !state.correlation.has_children(&job_id) {
                if expected {
                    warn!(job_id = %job_id, "No per-host jobs surfaced; showing unattributed single stream");
                } else {
                    debug!(job_id = %job_id, "Master has no per-host jobs; single stream");
                }
            }
        });
    }

    /// Ask the service to cancel a job.
    ///
    /// On a failed acknowledgement nothing changes and the error is returned
    /// so the user can retry. On success polling continues; if no terminal
    /// status arrives within the grace window the job is marked cancelled.
    pub async fn request_cancel(&self, job_id: &str) -> Result<(), TrackerError> {
        let children = {
            let state = self.state.read().await;
            let job = state
                .registry
                .get(job_id)
                .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
            if job.is_terminal() {
                return Ok(());
            }
            state
                .correlation
                .children_of(job_id)
                .iter()
                .filter(|link| state.registry.get(&link.job_id).is_some_and(|c| !c.is_terminal()))
                .map(|link| link.job_id.clone())
                .collect::<Vec<_>>()
        };

        self.service
            .cancel(job_id)
            .await
            .map_err(|source| TrackerError::CancelFailed {
                job_id: job_id.to_string(),
                source,
            })?;

        for child in &children {
            if let Err(e) = self.service.cancel(child).await {
                warn!(job_id = %child, master_id = %job_id, error = %e, "Cancel of per-host job not acknowledged");
            }
        }

        {
            let mut state = self.state.write().await;
            let now = Utc::now();
            for id in std::iter::once(job_id).chain(children.iter().map(String::as_str)) {
                if let Some(job) = state.registry.get_mut(id) {
                    job.cancel_requested_at = Some(now);
                }
            }
        }
        info!(job_id, children = children.len(), "Cancel acknowledged");

        self.arm_cancel_expiry(job_id.to_string(), children, self.config.cancel_grace);
        Ok(())
    }

    fn arm_cancel_expiry(&self, job_id: JobId, children: Vec<JobId>, after: Duration) {
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            tracker.expire_cancel(&job_id, &children).await;
        });
    }

    async fn expire_cancel(&self, job_id: &str, children: &[JobId]) {
        let finished = {
            let mut state = self.state.write().await;
            let mut finished = Vec::new();
            for id in std::iter::once(job_id).chain(children.iter().map(String::as_str)) {
                if let Some((_, true)) = state.registry.observe(id, None, JobStatus::Cancelled) {
                    finished.push(id.to_string());
                }
            }
            let TrackerState {
                registry,
                correlation,
                ..
            } = &mut *state;
            if let Some(master) = correlation.master_of(job_id).cloned() {
                if progress::recompute_master(registry, correlation, &master) {
                    finished.push(master);
                }
            }
            finished
        };

        for id in &finished {
            self.scheduler.stop(id);
            self.emit(TrackerEvent::JobFinished { job_id: id.clone() });
        }
        if !finished.is_empty() {
            warn!(job_id, "No terminal status after cancel; marked cancelled");
        }
    }

    /// Open a job's detail view: start polling it and its per-host jobs, and
    /// return its snapshot with the combined transcript.
    pub async fn expand_output(&self, job_id: &str) -> Result<JobSnapshot, TrackerError> {
        let to_poll = {
            let state = self.state.read().await;
            let job = state
                .registry
                .get(job_id)
                .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
            let mut ids = Vec::new();
            if !job.is_terminal() {
                ids.push(job_id.to_string());
            }
            for link in state.correlation.children_of(job_id) {
                if state.registry.get(&link.job_id).is_some_and(|c| !c.is_terminal()) {
                    ids.push(link.job_id.clone());
                }
            }
            ids
        };

        if let Ok(mut expanded) = self.expanded.lock() {
            expanded.insert(job_id.to_string());
        }
        for id in &to_poll {
            self.scheduler.ensure_polling(id);
        }
        self.snapshot(job_id, true).await
    }

    /// Close a job's detail view, cancelling its pending poll timers.
    pub async fn collapse_output(&self, job_id: &str) -> Result<(), TrackerError> {
        let ids = self.family(job_id).await?;
        if let Ok(mut expanded) = self.expanded.lock() {
            expanded.remove(job_id);
        }
        for id in &ids {
            self.scheduler.stop(id);
        }
        Ok(())
    }

    /// The presentation layer removed the job's card. Polling stops now; the
    /// next persistence sweep drops the job from the registry.
    pub async fn dismiss(&self, job_id: &str) -> Result<(), TrackerError> {
        let ids = self.family(job_id).await?;
        for id in &ids {
            self.scheduler.stop(id);
        }
        {
            let mut state = self.state.write().await;
            if let Some(job) = state.registry.get_mut(job_id) {
                job.dismissed = true;
            }
        }
        if let Ok(mut expanded) = self.expanded.lock() {
            expanded.remove(job_id);
        }
        self.emit(TrackerEvent::JobDismissed { job_id: job_id.to_string() });
        Ok(())
    }

    /// Wipe all tracking state.
    pub async fn clear(&self) {
        self.scheduler.stop_all();
        self.state.write().await.clear();
        if let Ok(mut expanded) = self.expanded.lock() {
            expanded.clear();
        }
        info!("Tracking state cleared");
        self.emit(TrackerEvent::Cleared);
    }

    /// Re-enter restored, unfinished jobs into polling. A job whose cancel
    /// was acknowledged before the restart gets the rest of its grace window.
    pub async fn resume(&self, job_ids: &[JobId]) {
        let pending_cancels: Vec<_> = {
            let state = self.state.read().await;
            job_ids
                .iter()
                .filter_map(|id| Some((id.clone(), state.registry.get(id)?.cancel_requested_at?)))
                .collect()
        };

        for id in job_ids {
            self.scheduler.ensure_polling(id);
        }

        let now = Utc::now();
        for (id, requested_at) in pending_cancels {
            let elapsed = (now - requested_at).to_std().unwrap_or_default();
            let remaining = self.config.cancel_grace.saturating_sub(elapsed);
            debug!(job_id = %id, remaining_ms = remaining.as_millis() as u64, "Re-arming cancel grace window");
            self.arm_cancel_expiry(id, Vec::new(), remaining);
        }
    }

    async fn family(&self, job_id: &str) -> Result<Vec<JobId>, TrackerError> {
        let state = self.state.read().await;
        if !state.registry.contains(job_id) {
            return Err(TrackerError::NotFound(job_id.to_string()));
        }
        Ok(std::iter::once(job_id.to_string())
            .chain(state.correlation.children_of(job_id).iter().map(|l| l.job_id.clone()))
            .collect())
    }

    pub async fn snapshot(&self, job_id: &str, with_output: bool) -> Result<JobSnapshot, TrackerError> {
        let state = self.state.read().await;
        let job = state
            .registry
            .get(job_id)
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
        let poll_state = poll_state_of(job, self.scheduler.is_polling(job_id));
        state
            .snapshot_job(job_id, poll_state, with_output)
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))
    }

    /// Snapshots of every top-level card, in creation order.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let state = self.state.read().await;
        state
            .top_level_ids()
            .iter()
            .filter_map(|id| {
                let job = state.registry.get(id)?;
                let poll_state = poll_state_of(job, self.scheduler.is_polling(id));
                state.snapshot_job(id, poll_state, false)
            })
            .collect()
    }

    pub async fn job_count(&self) -> usize {
        self.state.read().await.registry.len()
    }

    pub fn polling_count(&self) -> usize {
        self.scheduler.active_count()
    }

    /// Stop all polling. Used on shutdown.
    pub fn shutdown(&self) {
        self.scheduler.stop_all();
    }
}
