//! Correlation of per-host jobs back to the master request that caused them.
//!
//! The execution service never reports which master a per-host job belongs
//! to. Individual job ids surface later through their own creation
//! responses, each tagged with a single target. The index keeps a short,
//! recency-ordered log of creation events and infers the association from
//! it: the newest master whose target set contains the host, and which has
//! not claimed a job for that host yet, wins.
//!
//! Everything else in the crate goes through [`CorrelationIndex`], so the
//! heuristic can be swapped for an authoritative mapping in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use super::models::JobId;

/// Number of creation events kept in the log.
pub const CREATION_LOG_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationEvent {
    pub job_id: JobId,
    pub targets: Vec<String>,
    pub individual: bool,
    pub label: String,
    #[serde(default)]
    pub extra: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl CreationEvent {
    pub fn master(job_id: impl Into<JobId>, label: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            targets,
            individual: false,
            label: label.into(),
            extra: serde_json::Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn individual(job_id: impl Into<JobId>, label: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            targets: vec![target.into()],
            individual: true,
            label: label.into(),
            extra: serde_json::Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

/// A resolved `(individual job, target)` pair under a master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildLink {
    pub job_id: JobId,
    pub target: String,
}

/// Serializable form of the index, used by the persistence layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSnapshot {
    pub log: Vec<CreationEvent>,
    pub links: Vec<(JobId, Vec<ChildLink>)>,
}

#[derive(Debug, Default, Clone)]
pub struct CorrelationIndex {
    log: VecDeque<CreationEvent>,
    children: HashMap<JobId, Vec<ChildLink>>,
    master_order: Vec<JobId>,
    parent_of: HashMap<JobId, JobId>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a creation event, evicting the oldest beyond capacity.
    pub fn record_creation(&mut self, event: CreationEvent) {
        if self.log.len() == CREATION_LOG_CAPACITY {
            if let Some(evicted) = self.log.pop_front() {
                debug!(job_id = %evicted.job_id, "Creation event evicted from correlation log");
            }
        }
        self.log.push_back(event);
    }

    /// Resolve the master an individual job belongs to.
    ///
    /// Already-associated jobs return their existing master. Returns `None`
    /// when no master in the log can claim the target; the caller then treats
    /// the job as its own master.
    pub fn associate(&mut self, individual_id: &str, target: &str) -> Option<JobId> {
        if let Some(master) = self.parent_of.get(individual_id) {
            return Some(master.clone());
        }

        let master_id = self
            .log
            .iter()
            .rev()
            .filter(|event| !event.individual && event.job_id != individual_id)
            .filter(|event| event.targets.iter().any(|t| t == target))
            .find(|event| !self.has_claimed(&event.job_id, target))
            .map(|event| event.job_id.clone());

        match &master_id {
            Some(master) => {
                self.link(master, individual_id, target);
                debug!(master_id = %master, job_id = %individual_id, target, "Correlated per-host job");
            }
            None => {
                warn!(job_id = %individual_id, target, "No master found for per-host job; showing it on its own");
            }
        }
        master_id
    }

    fn has_claimed(&self, master_id: &str, target: &str) -> bool {
        self.children
            .get(master_id)
            .is_some_and(|links| links.iter().any(|l| l.target == target))
    }

    fn link(&mut self, master_id: &str, individual_id: &str, target: &str) {
        if !self.children.contains_key(master_id) {
            self.master_order.push(master_id.to_string());
        }
        self.children
            .entry(master_id.to_string())
            .or_default()
            .push(ChildLink {
                job_id: individual_id.to_string(),
                target: target.to_string(),
            });
        self.parent_of
            .insert(individual_id.to_string(), master_id.to_string());
    }

    /// Children of a master, in the order their targets were first resolved.
    pub fn children_of(&self, master_id: &str) -> &[ChildLink] {
        self.children
            .get(master_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn master_of(&self, individual_id: &str) -> Option<&JobId> {
        self.parent_of.get(individual_id)
    }

    pub fn has_children(&self, master_id: &str) -> bool {
        !self.children_of(master_id).is_empty()
    }

    pub fn creation_log(&self) -> impl Iterator<Item = &CreationEvent> {
        self.log.iter()
    }

    /// Drop every correlation entry that mentions `job_id`, as master or child.
    pub fn forget(&mut self, job_id: &str) {
        if let Some(links) = self.children.remove(job_id) {
            self.master_order.retain(|id| id != job_id);
            for link in links {
                self.parent_of.remove(&link.job_id);
            }
        }
        if let Some(master) = self.parent_of.remove(job_id) {
            if let Some(links) = self.children.get_mut(&master) {
                links.retain(|l| l.job_id != job_id);
            }
        }
        self.log.retain(|event| event.job_id != job_id);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> CorrelationSnapshot {
        CorrelationSnapshot {
            log: self.log.iter().cloned().collect(),
            links: self
                .master_order
                .iter()
                .filter_map(|m| self.children.get(m).map(|l| (m.clone(), l.clone())))
                .collect(),
        }
    }

    /// Merge a persisted snapshot. Existing associations win; a restored link
    /// is skipped when its job or its `(master, target)` pair is already
    /// resolved, so merging twice has no further effect.
    pub fn merge(&mut self, snapshot: CorrelationSnapshot) {
        for event in snapshot.log {
            if !self.log.iter().any(|e| e.job_id == event.job_id) {
                self.record_creation(event);
            }
        }
        for (master, links) in snapshot.links {
            for link in links {
                if self.parent_of.contains_key(&link.job_id) || self.has_claimed(&master, &link.target) {
                    continue;
                }
                self.link(&master, &link.job_id, &link.target);
            }
        }
    }
}
