#![allow(dead_code)]

use async_trait::async_trait;
use runwatch::config::PollingConfig;
use runwatch::core::{JobStatus, StatusReport, TrackerConfig, TrackerEvent};
use runwatch::remote::{ExecutionService, RemoteError, StartAck, StartRequest};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// One scripted status answer. `Err` is a transport-class failure.
pub type Step = Result<StatusReport, String>;

pub fn running(progress: u8) -> Step {
    Ok(StatusReport::new(JobStatus::Running).with_progress(progress))
}

pub fn completed() -> Step {
    Ok(StatusReport::new(JobStatus::Completed).with_progress(100))
}

pub fn failed(progress: u8) -> Step {
    Ok(StatusReport::new(JobStatus::Failed).with_progress(progress))
}

pub fn unreachable_service() -> Step {
    Err("connection reset by peer".to_string())
}

/// Execution service double. Hands out job ids in order and answers status
/// requests from per-job scripts; the last step of a script repeats.
#[derive(Default)]
pub struct FakeService {
    pub latency: Duration,
    pub reject_start: AtomicBool,
    pub reject_cancel: AtomicBool,
    ids: Mutex<VecDeque<String>>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    starts: Mutex<Vec<StartRequest>>,
    cancels: Mutex<Vec<String>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
}

impl FakeService {
    pub fn with_ids(ids: &[&str]) -> Self {
        let service = Self::default();
        service
            .ids
            .lock()
            .unwrap()
            .extend(ids.iter().map(|id| id.to_string()));
        service
    }

    pub fn script(&self, job_id: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_id.to_string(), steps.into());
    }

    pub fn starts(&self) -> Vec<StartRequest> {
        self.starts.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn calls(&self, job_id: &str) -> usize {
        self.calls.lock().unwrap().get(job_id).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self, job_id: &str) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    fn next_step(&self, job_id: &str) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(job_id) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
            Some(steps) => steps.front().cloned().unwrap_or_else(|| running(0)),
            None => running(0),
        }
    }
}

#[async_trait]
impl ExecutionService for FakeService {
    async fn start(&self, request: &StartRequest) -> Result<StartAck, RemoteError> {
        if self.reject_start.load(Ordering::SeqCst) {
            return Err(RemoteError::Api {
                status: 500,
                body: "inventory unavailable".into(),
            });
        }
        self.starts.lock().unwrap().push(request.clone());
        let job_id = self
            .ids
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RemoteError::Rejected("no more job ids".into()))?;
        Ok(StartAck {
            job_id,
            hosts: Some(request.hosts.clone()),
        })
    }

    async fn status(&self, job_id: &str) -> Result<StatusReport, RemoteError> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let current = in_flight.entry(job_id.to_string()).or_default();
            *current += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            let peak = max.entry(job_id.to_string()).or_default();
            *peak = (*peak).max(*current);
        }
        tokio::time::sleep(self.latency).await;
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(current) = in_flight.get_mut(job_id) {
                *current -= 1;
            }
        }
        *self
            .calls
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_default() += 1;

        self.next_step(job_id).map_err(RemoteError::Parse)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), RemoteError> {
        if self.reject_cancel.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("job is not cancellable".into()));
        }
        self.cancels.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

pub fn tracker_config() -> TrackerConfig {
    TrackerConfig {
        polling: PollingConfig {
            base_interval_ms: 1000,
            max_interval_ms: 5000,
            backoff_multiplier: 1.5,
            retry_interval_ms: 5000,
            cache_ttl_ms: 2000,
        },
        correlation_grace: Duration::from_secs(30),
        cancel_grace: Duration::from_secs(30),
        fan_out_spacing: Duration::from_secs(1),
        auto_poll: true,
    }
}

pub async fn wait_for_finish(events: &mut broadcast::Receiver<TrackerEvent>, job_id: &str) {
    timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(TrackerEvent::JobFinished { job_id: id }) if id == job_id => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timeout waiting for JobFinished");
}
