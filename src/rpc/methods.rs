//! RPC method handlers.
//!
//! Each method maps onto one [`JobTracker`] operation. Tracker errors are
//! translated into application error codes in the `-32000` range.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::context::AppContext;
use crate::core::TrackerError;
use crate::remote::StartRequest;

use super::protocol::{
    CANCEL_FAILED, JOB_NOT_FOUND, Request, Response, START_FAILED, INVALID_PARAMS,
};

pub struct MethodHandler {
    ctx: AppContext,
}

#[derive(Deserialize)]
struct JobParams {
    id: String,
}

#[derive(Deserialize)]
struct GetParams {
    id: String,
    #[serde(default)]
    output: bool,
}

#[derive(Deserialize)]
struct StartParams {
    playbook: String,
    hosts: Vec<String>,
    #[serde(default)]
    extra_vars: Map<String, Value>,
    #[serde(default)]
    fan_out: bool,
}

#[derive(Serialize)]
struct Ack {
    ok: bool,
}

fn parse<T: DeserializeOwned>(id: &Value, params: Value) -> Result<T, Response> {
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}

fn tracker_error(id: Value, err: TrackerError) -> Response {
    let code = match &err {
        TrackerError::NotFound(_) => JOB_NOT_FOUND,
        TrackerError::StartFailed(_) => START_FAILED,
        TrackerError::CancelFailed { .. } => CANCEL_FAILED,
        TrackerError::InvalidRequest(_) => INVALID_PARAMS,
    };
    Response::error(id, code, err.to_string())
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "daemon.status" => Ok(self.daemon_status(id.clone()).await),
            "jobs.list" => Ok(Response::success(id.clone(), self.ctx.tracker.list().await)),
            "jobs.get" => self.jobs_get(&id, params).await,
            "jobs.start" => self.jobs_start(&id, params).await,
            "jobs.cancel" => self.jobs_cancel(&id, params).await,
            "jobs.dismiss" => self.jobs_dismiss(&id, params).await,
            "jobs.clear" => {
                self.ctx.tracker.clear().await;
                Ok(Response::success(id.clone(), Ack { ok: true }))
            }
            "output.expand" => self.output_expand(&id, params).await,
            "output.collapse" => self.output_collapse(&id, params).await,
            _ => Ok(Response::method_not_found(id.clone(), &request.method)),
        };

        result.unwrap_or_else(|response| response)
    }

    async fn daemon_status(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            tracked_jobs: usize,
            polling_jobs: usize,
            service_url: String,
            simulation: bool,
            auto_poll: bool,
        }

        let config = &self.ctx.config;
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.ctx.started_at.elapsed().as_secs(),
                tracked_jobs: self.ctx.tracker.job_count().await,
                polling_jobs: self.ctx.tracker.polling_count(),
                service_url: config.service_url.clone(),
                simulation: config.simulation,
                auto_poll: config.auto_poll,
            },
        )
    }

    async fn jobs_get(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let params: GetParams = parse(id, params)?;
        self.ctx
            .tracker
            .snapshot(&params.id, params.output)
            .await
            .map(|snapshot| Response::success(id.clone(), snapshot))
            .map_err(|e| tracker_error(id.clone(), e))
    }

    async fn jobs_start(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let params: StartParams = parse(id, params)?;
        let mut request = StartRequest::new(params.playbook, params.hosts);
        request.extra_vars = params.extra_vars;
        self.ctx
            .tracker
            .start(request, params.fan_out)
            .await
            .map(|snapshot| Response::success(id.clone(), snapshot))
            .map_err(|e| tracker_error(id.clone(), e))
    }

    async fn jobs_cancel(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let params: JobParams = parse(id, params)?;
        self.ctx
            .tracker
            .request_cancel(&params.id)
            .await
            .map(|()| Response::success(id.clone(), Ack { ok: true }))
            .map_err(|e| tracker_error(id.clone(), e))
    }

    async fn jobs_dismiss(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let params: JobParams = parse(id, params)?;
        self.ctx
            .tracker
            .dismiss(&params.id)
            .await
            .map(|()| Response::success(id.clone(), Ack { ok: true }))
            .map_err(|e| tracker_error(id.clone(), e))
    }

    async fn output_expand(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let params: JobParams = parse(id, params)?;
        self.ctx
            .tracker
            .expand_output(&params.id)
            .await
            .map(|snapshot| Response::success(id.clone(), snapshot))
            .map_err(|e| tracker_error(id.clone(), e))
    }

    async fn output_collapse(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let params: JobParams = parse(id, params)?;
        self.ctx
            .tracker
            .collapse_output(&params.id)
            .await
            .map(|()| Response::success(id.clone(), Ack { ok: true }))
            .map_err(|e| tracker_error(id.clone(), e))
    }
}
