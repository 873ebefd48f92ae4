//! Authoritative in-memory table of tracked jobs.
//!
//! The registry performs no I/O. It is the single place where the progress
//! rules are enforced: displayed progress never decreases, a job that is not
//! terminal never shows 100, and a terminal job always does. The one
//! exception is a master whose `failed` status was derived from its
//! per-host jobs: it keeps showing how far the hosts actually got.

use std::collections::HashMap;

use super::models::{Job, JobId, JobStatus, MAX_ACTIVE_PROGRESS};

#[derive(Debug, Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
}

/// Bring a job's progress in line with its status.
fn normalize(job: &mut Job) {
    if job.aggregated && job.status == JobStatus::Failed {
        return;
    }
    if job.status.is_terminal() {
        job.progress = 100;
    } else {
        job.progress = job.progress.min(MAX_ACTIVE_PROGRESS);
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new job or update an existing one with the same id.
    ///
    /// On update, progress is clamped to `max(existing, proposed)` and a
    /// terminal status is never replaced by a non-terminal one.
    pub fn upsert(&mut self, mut job: Job) -> &Job {
        let id = job.id.clone();
        match self.jobs.get(&id) {
            Some(existing) => {
                job.progress = job.progress.max(existing.progress);
                job.reported_progress = job.reported_progress.max(existing.reported_progress);
                if existing.status.is_terminal() {
                    job.status = existing.status;
                }
                job.created_at = existing.created_at;
            }
            None => self.order.push(id.clone()),
        }
        normalize(&mut job);
        self.jobs.insert(id.clone(), job);
        &self.jobs[&id]
    }

    /// Fold one observation into an existing job. Returns `None` for unknown
    /// ids. The returned flag is true when this observation moved the job
    /// into a terminal status.
    pub fn observe(
        &mut self,
        job_id: &str,
        progress: Option<u8>,
        status: JobStatus,
    ) -> Option<(&Job, bool)> {
        let job = self.jobs.get_mut(job_id)?;
        let was_terminal = job.status.is_terminal();

        if !was_terminal {
            if let Some(p) = progress {
                let p = p.min(100);
                job.reported_progress = job.reported_progress.max(p);
                job.progress = job.progress.max(p);
            }
            job.status = status;
        }
        normalize(job);

        let finished = !was_terminal && job.status.is_terminal();
        Some((&*job, finished))
    }

    /// Raise a job's displayed progress without touching its status.
    pub fn raise_progress(&mut self, job_id: &str, progress: u8) -> Option<u8> {
        let job = self.jobs.get_mut(job_id)?;
        job.progress = job.progress.max(progress);
        normalize(job);
        Some(job.progress)
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Delete a job. Removing an unknown id is a no-op.
    pub fn remove(&mut self, job_id: &str) -> Option<Job> {
        let removed = self.jobs.remove(job_id)?;
        self.order.retain(|id| id != job_id);
        Some(removed)
    }

    /// Jobs in insertion order. The iterator can be cloned to restart it.
    pub fn all(&self) -> impl Iterator<Item = &Job> + Clone + '_ {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::JobKind;

    fn running(id: &str, progress: u8) -> Job {
        let mut job = Job::master(id, "site.yml", vec!["h1".into()]);
        job.status = JobStatus::Running;
        job.progress = progress;
        job
    }

    #[test]
    fn upsert_never_lowers_progress() {
        let mut registry = JobRegistry::new();
        registry.upsert(running("m", 40));
        let job = registry.upsert(running("m", 25));
        assert_eq!(job.progress, 40);

        let job = registry.upsert(running("m", 55));
        assert_eq!(job.progress, 55);
    }

    #[test]
    fn progress_is_100_iff_terminal() {
        let mut registry = JobRegistry::new();
        assert_eq!(registry.upsert(running("m", 100)).progress, 99);

        let (job, finished) = registry.observe("m", Some(30), JobStatus::Failed).unwrap();
        assert!(finished);
        assert_eq!(job.progress, 100);
        assert_eq!(job.reported_progress, 30);
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut registry = JobRegistry::new();
        registry.upsert(running("m", 10));
        registry.observe("m", None, JobStatus::Completed);

        let (job, finished) = registry.observe("m", Some(20), JobStatus::Running).unwrap();
        assert!(!finished);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn monotone_over_arbitrary_sequence() {
        let mut registry = JobRegistry::new();
        registry.upsert(running("m", 0));
        let mut shown = 0;
        for p in [5, 3, 50, 12, 49, 80, 0, 79, 100, 4] {
            let (job, _) = registry.observe("m", Some(p), JobStatus::Running).unwrap();
            assert!(job.progress >= shown);
            shown = job.progress;
        }
        assert_eq!(shown, 99);
    }

    #[test]
    fn all_preserves_insertion_order_and_restarts() {
        let mut registry = JobRegistry::new();
        for id in ["c", "a", "b"] {
            registry.upsert(Job::new(id, JobKind::Individual, "x", vec![]));
        }
        registry.upsert(running("a", 5));

        let iter = registry.all();
        let first: Vec<_> = iter.clone().map(|j| j.id.as_str()).collect();
        let second: Vec<_> = iter.map(|j| j.id.as_str()).collect();
        assert_eq!(first, ["c", "a", "b"]);
        assert_eq!(first, second);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = JobRegistry::new();
        registry.upsert(running("m", 1));
        assert!(registry.remove("m").is_some());
        assert!(registry.remove("m").is_none());
        assert!(registry.get("m").is_none());
        assert_eq!(registry.all().count(), 0);
    }
}
