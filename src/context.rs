use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use crate::config::AppConfig;
use crate::core::{JobTracker, TrackerConfig};
use crate::remote::{self, ExecutionService};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub tracker: JobTracker,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self> {
        let service = remote::create_service(&config)?;
        Ok(Self::with_service(config, service))
    }

    pub fn with_service(config: AppConfig, service: Arc<dyn ExecutionService>) -> Self {
        let tracker = JobTracker::new(service, TrackerConfig::from(&config));
        Self {
            config: Arc::new(config),
            tracker,
            started_at: Instant::now(),
        }
    }
}
