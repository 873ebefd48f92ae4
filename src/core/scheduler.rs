//! Per-job polling with adaptive timing.
//!
//! Each polled job gets one task and one [`CancellationToken`]. The task
//! awaits every status request before scheduling the next, so a job never
//! has two requests in flight. Successful "still running" responses stretch
//! the interval geometrically up to a ceiling; transport or parse failures
//! wait a fixed, longer retry interval and never finalize the job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::{JobId, StatusReport};
use super::state::SharedState;
use super::tracker::TrackerEvent;
use crate::config::PollingConfig;
use crate::logging::LogThrottle;
use crate::remote::{ExecutionService, RemoteError};

/// Next success-path delay: grow by `multiplier`, capped at `max`.
pub fn next_delay(current: Duration, config: &PollingConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.backoff_multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_interval())
}

struct PollHandle {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Handles {
    next_generation: u64,
    active: HashMap<JobId, PollHandle>,
}

#[derive(Clone)]
pub struct PollingScheduler {
    state: SharedState,
    service: Arc<dyn ExecutionService>,
    config: PollingConfig,
    events: broadcast::Sender<TrackerEvent>,
    handles: Arc<Mutex<Handles>>,
    throttle: Arc<LogThrottle>,
}

impl PollingScheduler {
    pub fn new(
        state: SharedState,
        service: Arc<dyn ExecutionService>,
        config: PollingConfig,
        events: broadcast::Sender<TrackerEvent>,
    ) -> Self {
        Self {
            state,
            service,
            config,
            events,
            handles: Arc::new(Mutex::new(Handles::default())),
            throttle: Arc::new(LogThrottle::new(Duration::from_secs(30))),
        }
    }

    /// Start polling `job_id` unless it is already being polled.
    pub fn ensure_polling(&self, job_id: &str) {
        let Ok(mut handles) = self.handles.lock() else {
            return;
        };
        if handles.active.contains_key(job_id) {
            return;
        }

        handles.next_generation += 1;
        let generation = handles.next_generation;
        let token = CancellationToken::new();
        handles.active.insert(
            job_id.to_string(),
            PollHandle {
                generation,
                token: token.clone(),
            },
        );
        drop(handles);

        debug!(job_id, "Polling started");
        let scheduler = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            scheduler.poll_loop(&job_id, token).await;
            scheduler.release(&job_id, generation);
        });
    }

    /// Cancel the pending timer for `job_id`. Returns false if it was idle.
    pub fn stop(&self, job_id: &str) -> bool {
        let Ok(mut handles) = self.handles.lock() else {
            return false;
        };
        match handles.active.remove(job_id) {
            Some(handle) => {
                handle.token.cancel();
                debug!(job_id, "Polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for (_, handle) in handles.active.drain() {
                handle.token.cancel();
            }
        }
    }

    pub fn is_polling(&self, job_id: &str) -> bool {
        self.handles
            .lock()
            .map(|h| h.active.contains_key(job_id))
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.handles.lock().map(|h| h.active.len()).unwrap_or(0)
    }

    fn release(&self, job_id: &str, generation: u64) {
        if let Ok(mut handles) = self.handles.lock() {
            if handles
                .active
                .get(job_id)
                .is_some_and(|h| h.generation == generation)
            {
                handles.active.remove(job_id);
            }
        }
    }

    /// Fetch a status. With `allow_cached`, a fresh cache entry answers
    /// instead of the network. The flag is true for network results.
    async fn fetch(&self, job_id: &str, allow_cached: bool) -> Option<Result<(StatusReport, bool), RemoteError>> {
        let cached = {
            let state = self.state.read().await;
            if !state.registry.contains(job_id) {
                return None;
            }
            allow_cached.then(|| state.cache.fresh(job_id).cloned()).flatten()
        };
        match cached {
            Some(report) => Some(Ok((report, false))),
            None => Some(self.service.status(job_id).await.map(|r| (r, true))),
        }
    }

    async fn poll_loop(&self, job_id: &str, token: CancellationToken) {
        let mut delay = self.config.base_interval();
        let mut attempt: u32 = 0;
        // Only the first request after (re)starting may reuse a recent answer.
        let mut first = true;

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.fetch(job_id, first) => result,
            };
            first = false;
            if token.is_cancelled() {
                return;
            }

            let wait = match result {
                None => {
                    debug!(job_id, "Job no longer tracked; polling ends");
                    return;
                }
                Some(Ok((report, fetched))) => {
                    attempt = 0;
                    let outcome = {
                        let mut state = self.state.write().await;
                        if fetched {
                            state.cache.insert(job_id, report.clone());
                        }
                        state.apply_report(job_id, &report)
                    };
                    let Some(outcome) = outcome else {
                        return;
                    };

                    let _ = self.events.send(TrackerEvent::JobUpdated {
                        job_id: job_id.to_string(),
                    });
                    for finished in &outcome.finished {
                        let _ = self.events.send(TrackerEvent::JobFinished {
                            job_id: finished.clone(),
                        });
                    }
                    if outcome.stream_finished {
                        info!(job_id, status = %report.status, "Job reached terminal status");
                        return;
                    }

                    let wait = delay;
                    delay = next_delay(delay, &self.config);
                    wait
                }
                Some(Err(e)) => {
                    attempt += 1;
                    if let Some(suppressed) = self.throttle.check() {
                        warn!(job_id, attempt, suppressed, error = %e, "Status poll failed; retrying");
                    } else {
                        debug!(job_id, attempt, error = %e, "Status poll failed; retrying");
                    }
                    self.config.retry_interval()
                }
            };

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
