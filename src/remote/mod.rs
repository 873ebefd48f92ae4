//! Client side of the remote execution service.
//!
//! The service starts playbook runs, reports their status and accepts
//! best-effort cancellation. [`ExecutionService`] is the seam the tracker
//! talks through; `http` is the real client and `simulated` a stand-in
//! engine for running the daemon without a backend.

mod http;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::models::{JobId, StatusReport};

pub use http::HttpExecutionService;
pub use simulated::SimulatedExecutionService;

/// Extra variable marking a run as one host of a fanned-out execution.
pub const SINGLE_HOST_MARKER: &str = "single_host_execution";
/// Extra variable naming the host of a single-host run.
pub const HOST_SPECIFIC_KEY: &str = "host_specific";

/// Errors from the execution service client.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-2xx status code.
    #[error("service error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The response body could not be understood.
    #[error("unexpected response: {0}")]
    Parse(String),

    /// The service answered but refused the operation.
    #[error("rejected by service: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub playbook: String,
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
}

impl StartRequest {
    pub fn new(playbook: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            playbook: playbook.into(),
            hosts,
            extra_vars: serde_json::Map::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra_vars.insert(key.into(), value.into());
        self
    }

    /// The same request with repeated hosts dropped, first occurrence kept.
    pub fn with_unique_hosts(mut self) -> Self {
        self.hosts = unique_hosts(self.hosts);
        self
    }

    /// Per-host request derived from a multi-host one.
    pub fn for_single_host(&self, host: &str) -> Self {
        let mut request = Self {
            playbook: self.playbook.clone(),
            hosts: vec![host.to_string()],
            extra_vars: self.extra_vars.clone(),
        };
        request
            .extra_vars
            .insert(SINGLE_HOST_MARKER.into(), serde_json::Value::Bool(true));
        request
            .extra_vars
            .insert(HOST_SPECIFIC_KEY.into(), serde_json::Value::String(host.into()));
        request
    }

    /// The host this request targets when it is marked as a single-host run.
    pub fn single_host_target(&self) -> Option<String> {
        let marked = self
            .extra_vars
            .get(SINGLE_HOST_MARKER)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !marked {
            return None;
        }
        self.extra_vars
            .get(HOST_SPECIFIC_KEY)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .or_else(|| match self.hosts.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            })
    }

    /// Display label for the run: the playbook file name.
    pub fn label(&self) -> String {
        self.playbook
            .rsplit('/')
            .next()
            .unwrap_or(&self.playbook)
            .to_string()
    }
}

/// Host list in first-seen order without repeats.
pub fn unique_hosts(hosts: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    hosts.into_iter().filter(|host| seen.insert(host.clone())).collect()
}

/// Acknowledgement of a start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartAck {
    pub job_id: JobId,
    /// Hosts the service accepted, when it reports them.
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
}

#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn start(&self, request: &StartRequest) -> Result<StartAck, RemoteError>;

    async fn status(&self, job_id: &str) -> Result<StatusReport, RemoteError>;

    async fn cancel(&self, job_id: &str) -> Result<(), RemoteError>;
}

/// Build the execution service selected by the configuration.
pub fn create_service(config: &AppConfig) -> anyhow::Result<Arc<dyn ExecutionService>> {
    if config.simulation {
        return Ok(Arc::new(SimulatedExecutionService::default()));
    }
    let service = HttpExecutionService::new(
        config.service_url.clone(),
        Duration::from_secs(config.request_timeout_secs),
    )?;
    Ok(Arc::new(service))
}
