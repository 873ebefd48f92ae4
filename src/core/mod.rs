pub mod cache;
pub mod correlation;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod persistence;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod tracker;

pub use correlation::{CorrelationIndex, CreationEvent};
pub use error::TrackerError;
pub use models::{Attribution, Job, JobId, JobKind, JobSnapshot, JobStatus, PollState, StatusReport};
pub use orchestrator::Orchestrator;
pub use persistence::{FileStore, MemoryStore, PersistenceGateway, SnapshotStore};
pub use registry::JobRegistry;
pub use state::{SharedState, TrackerState};
pub use tracker::{JobTracker, TrackerConfig, TrackerEvent};
