use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type JobId = String;

/// Highest progress a job may show while it is still pending or running.
pub const MAX_ACTIVE_PROGRESS: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Multi-host run requested by the user
    Master,
    /// Single-host run, usually one leg of a fan-out
    Individual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    /// Accepts the status words the execution service is known to emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" | "success" => Ok(JobStatus::Completed),
            "failed" | "error" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unrecognized job status: {other}")),
        }
    }
}

/// A unit of remote execution tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Id assigned by the execution service
    pub id: JobId,
    pub kind: JobKind,
    /// Playbook file name shown on the card
    pub label: String,
    /// Hosts in request order, without repeats
    pub targets: Vec<String>,
    pub status: JobStatus,
    /// Displayed progress, 0-100. Never decreases.
    pub progress: u8,
    /// Highest progress value the remote service itself reported.
    #[serde(default)]
    pub reported_progress: u8,
    /// Cumulative transcript from the job's own status endpoint
    #[serde(default)]
    pub raw_output: String,
    pub created_at: DateTime<Utc>,
    /// Time of the last successful status response
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Set when the service acknowledged a cancel; starts the grace window
    #[serde(default)]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Set when the presentation layer removed the job's card.
    #[serde(default)]
    pub dismissed: bool,
    /// Status and progress are folded from correlated per-host jobs.
    #[serde(default)]
    pub aggregated: bool,
    /// The job's own status endpoint reported a terminal status.
    #[serde(default)]
    pub stream_finished: bool,
}

impl Job {
    pub fn new(id: impl Into<JobId>, kind: JobKind, label: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            targets,
            status: JobStatus::Pending,
            progress: 0,
            reported_progress: 0,
            raw_output: String::new(),
            created_at: Utc::now(),
            last_polled_at: None,
            cancel_requested_at: None,
            dismissed: false,
            aggregated: false,
            stream_finished: false,
        }
    }

    pub fn master(id: impl Into<JobId>, label: impl Into<String>, targets: Vec<String>) -> Self {
        Self::new(id, JobKind::Master, label, targets)
    }

    pub fn individual(id: impl Into<JobId>, label: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, JobKind::Individual, label, vec![target.into()])
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_been_polled(&self) -> bool {
        self.last_polled_at.is_some()
    }
}

/// One parsed status response from the execution service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: JobStatus,
    /// Progress the service reported, clamped to 0-100
    pub progress: Option<u8>,
    /// Cumulative transcript for the job, when the service sent one.
    pub output: Option<String>,
}

impl StatusReport {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            output: None,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// How a master job's output and status are being sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    /// Correlated per-host jobs exist; status and output are folded from them.
    PerHost,
    /// No per-host jobs yet, still inside the correlation grace window.
    AwaitingHosts,
    /// No per-host breakdown; the job's own stream is the only source.
    SingleStream,
}

/// Where a job sits in the polling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    /// Not polled; no detail view is open
    Idle,
    /// A poll task is scheduled or in flight
    Polling,
    /// Terminal status reached; polling is over
    Terminated,
}

/// One per-host job as shown under its master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub id: JobId,
    /// Host the job runs against
    pub target: String,
    pub status: JobStatus,
    pub progress: u8,
}

/// Read-only view of a job handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub label: String,
    pub targets: Vec<String>,
    pub status: JobStatus,
    /// Displayed progress, 0-100
    pub progress: u8,
    /// Where the status and output of this card come from
    pub attribution: Attribution,
    pub poll_state: PollState,
    /// Correlated per-host jobs, in the order their hosts were resolved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildSummary>,
    /// Master this per-host job was attributed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_id: Option<JobId>,
    /// Transcript with host section dividers, when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_output: Option<String>,
}
