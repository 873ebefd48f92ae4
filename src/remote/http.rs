use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{ExecutionService, RemoteError, StartAck, StartRequest};
use crate::core::models::{JobStatus, StatusReport};

/// JSON-over-HTTP client for the execution service.
pub struct HttpExecutionService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

impl HttpExecutionService {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

fn parse_status(body: StatusBody) -> Result<StatusReport, RemoteError> {
    let status: JobStatus = body.status.parse().map_err(RemoteError::Parse)?;
    let progress = body
        .progress
        .filter(|p| p.is_finite())
        .map(|p| p.round().clamp(0.0, 100.0) as u8);
    Ok(StatusReport {
        status,
        progress,
        output: body.output,
    })
}

#[async_trait]
impl ExecutionService for HttpExecutionService {
    async fn start(&self, request: &StartRequest) -> Result<StartAck, RemoteError> {
        let response = self
            .client
            .post(format!("{}/api/run", self.base_url))
            .json(request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        response
            .json::<StartAck>()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))
    }

    async fn status(&self, job_id: &str) -> Result<StatusReport, RemoteError> {
        let response = self
            .client
            .get(format!("{}/api/status/{}", self.base_url, job_id))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body = response
            .json::<StatusBody>()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        parse_status(body)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(format!("{}/api/cancel", self.base_url))
            .json(&json!({ "job_id": job_id }))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body = response
            .json::<CancelBody>()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;

        if body.success {
            Ok(())
        } else {
            Err(RemoteError::Rejected(
                body.error.unwrap_or_else(|| "cancel not acknowledged".to_string()),
            ))
        }
    }
}
