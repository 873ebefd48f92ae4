use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use tokio::time::{Duration, sleep};
use uuid::Uuid;

use super::{ExecutionService, RemoteError, StartAck, StartRequest};
use crate::core::models::{JobStatus, StatusReport};

const TASKS: &[&str] = &[
    "Gathering Facts",
    "Ensure base packages are present",
    "Configure hostname",
    "Apply hardening profile",
    "Restart services",
];

struct SimulatedRun {
    playbook: String,
    hosts: Vec<String>,
    step: usize,
    fails: bool,
    cancelled: bool,
}

impl SimulatedRun {
    fn total_steps(&self) -> usize {
        TASKS.len()
    }

    fn status(&self) -> JobStatus {
        if self.cancelled {
            JobStatus::Cancelled
        } else if self.step == 0 {
            JobStatus::Pending
        } else if self.step < self.total_steps() {
            JobStatus::Running
        } else if self.fails {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }

    fn output(&self) -> String {
        let mut out = String::new();
        if self.step == 0 {
            return out;
        }
        let _ = writeln!(out, "PLAY [{}] {}", self.playbook, "*".repeat(40));
        let done = self.step.min(self.total_steps());
        for (idx, task) in TASKS.iter().take(done).enumerate() {
            let _ = writeln!(out, "\nTASK [{}] {}", task, "*".repeat(40));
            for host in &self.hosts {
                let last = idx + 1 == self.total_steps();
                if last && self.fails {
                    let _ = writeln!(out, "fatal: [{host}]: FAILED! => {{\"msg\": \"simulated failure\"}}");
                } else if idx % 2 == 0 {
                    let _ = writeln!(out, "ok: [{host}]");
                } else {
                    let _ = writeln!(out, "changed: [{host}]");
                }
            }
        }
        if self.status().is_terminal() && !self.cancelled {
            let _ = writeln!(out, "\nPLAY RECAP {}", "*".repeat(40));
            let failed = usize::from(self.fails);
            for host in &self.hosts {
                let _ = writeln!(
                    out,
                    "{host:<26} : ok={}    changed={}    unreachable=0    failed={failed}",
                    self.total_steps().div_ceil(2),
                    self.total_steps() / 2 - failed.min(self.total_steps() / 2),
                );
            }
        }
        out
    }
}

/// In-process execution engine used in simulation mode.
///
/// Every status query advances a run by one task. A playbook whose name
/// contains `fail` fails on its last task.
pub struct SimulatedExecutionService {
    pub latency: Duration,
    runs: Mutex<HashMap<String, SimulatedRun>>,
}

impl Default for SimulatedExecutionService {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(150),
            runs: Mutex::new(HashMap::new()),
        }
    }
}

impl SimulatedExecutionService {
    fn with_run<T>(&self, job_id: &str, f: impl FnOnce(&mut SimulatedRun) -> T) -> Result<T, RemoteError> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| RemoteError::Rejected("simulator state poisoned".into()))?;
        let run = runs
            .get_mut(job_id)
            .ok_or_else(|| RemoteError::Api {
                status: 404,
                body: format!("job {job_id} not found"),
            })?;
        Ok(f(run))
    }
}

#[async_trait]
impl ExecutionService for SimulatedExecutionService {
    async fn start(&self, request: &StartRequest) -> Result<StartAck, RemoteError> {
        if request.hosts.is_empty() {
            return Err(RemoteError::Rejected("at least one host is required".into()));
        }
        sleep(self.latency).await;

        let job_id = Uuid::now_v7().to_string();
        let run = SimulatedRun {
            playbook: request.label(),
            hosts: request.hosts.clone(),
            step: 0,
            fails: request.playbook.contains("fail"),
            cancelled: false,
        };
        self.runs
            .lock()
            .map_err(|_| RemoteError::Rejected("simulator state poisoned".into()))?
            .insert(job_id.clone(), run);

        Ok(StartAck {
            job_id,
            hosts: Some(request.hosts.clone()),
        })
    }

    async fn status(&self, job_id: &str) -> Result<StatusReport, RemoteError> {
        sleep(self.latency).await;
        self.with_run(job_id, |run| {
            if !run.status().is_terminal() {
                run.step += 1;
            }
            let progress = (run.step.min(run.total_steps()) * 100 / run.total_steps()) as u8;
            StatusReport::new(run.status())
                .with_progress(progress)
                .with_output(run.output())
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<(), RemoteError> {
        sleep(self.latency).await;
        self.with_run(job_id, |run| {
            if !run.status().is_terminal() {
                run.cancelled = true;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant() -> SimulatedExecutionService {
        SimulatedExecutionService {
            latency: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_progresses_to_completion() {
        let service = instant();
        let ack = service
            .start(&StartRequest::new("site.yml", vec!["h1".into()]))
            .await
            .unwrap();

        let mut last = service.status(&ack.job_id).await.unwrap();
        while !last.status.is_terminal() {
            last = service.status(&ack.job_id).await.unwrap();
        }
        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(last.progress, Some(100));
        assert!(last.output.unwrap().contains("PLAY RECAP"));
    }

    #[tokio::test]
    async fn failing_playbook_fails() {
        let service = instant();
        let ack = service
            .start(&StartRequest::new("fail-me.yml", vec!["h1".into()]))
            .await
            .unwrap();
        let mut last = service.status(&ack.job_id).await.unwrap();
        while !last.status.is_terminal() {
            last = service.status(&ack.job_id).await.unwrap();
        }
        assert_eq!(last.status, JobStatus::Failed);
        assert!(last.output.unwrap().contains("fatal: [h1]"));
    }

    #[tokio::test]
    async fn cancel_marks_run_cancelled() {
        let service = instant();
        let ack = service
            .start(&StartRequest::new("site.yml", vec!["h1".into()]))
            .await
            .unwrap();
        service.cancel(&ack.job_id).await.unwrap();
        let report = service.status(&ack.job_id).await.unwrap();
        assert_eq!(report.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_job_is_an_api_error() {
        let err = instant().status("nope").await.unwrap_err();
        assert!(matches!(err, RemoteError::Api { status: 404, .. }));
    }
}
