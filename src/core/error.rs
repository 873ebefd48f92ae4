use crate::remote::RemoteError;

/// Errors surfaced to the presentation layer.
///
/// Transport failures while polling, correlation misses and unreadable
/// snapshots are recovered internally and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("failed to start playbook: {0}")]
    StartFailed(#[source] RemoteError),

    #[error("failed to cancel job {job_id}: {source}")]
    CancelFailed {
        job_id: String,
        #[source]
        source: RemoteError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
