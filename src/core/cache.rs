//! Short-lived memo of the last successful status response per job.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::models::{JobId, StatusReport};

/// Most entries kept before the oldest is evicted.
pub const CACHE_CAPACITY: usize = 30;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub report: StatusReport,
    pub observed_at: Instant,
}

#[derive(Debug, Clone)]
pub struct StatusCache {
    ttl: Duration,
    entries: HashMap<JobId, CacheEntry>,
    order: VecDeque<JobId>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, job_id: &str, report: StatusReport) {
        let entry = CacheEntry {
            report,
            observed_at: Instant::now(),
        };
        if self.entries.insert(job_id.to_string(), entry).is_some() {
            self.order.retain(|id| id != job_id);
        }
        self.order.push_back(job_id.to_string());

        while self.order.len() > CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    /// The cached report, if it is younger than the TTL.
    pub fn fresh(&self, job_id: &str) -> Option<&StatusReport> {
        self.entries
            .get(job_id)
            .filter(|entry| entry.observed_at.elapsed() < self.ttl)
            .map(|entry| &entry.report)
    }

    pub fn get(&self, job_id: &str) -> Option<&CacheEntry> {
        self.entries.get(job_id)
    }

    pub fn remove(&mut self, job_id: &str) {
        if self.entries.remove(job_id).is_some() {
            self.order.retain(|id| id != job_id);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
