//! HTTP control channel to the agent running on each worker.

use async_trait::async_trait;
use buildfleet_core::control::{DispatchMessage, WorkerControl};
use buildfleet_core::id::JobKey;
use buildfleet_core::maintenance::MaintenanceKind;
use buildfleet_core::worker::{DiskUsage, HealthSnapshot, Worker};
use buildfleet_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Talks to the worker agent at `Worker::address`.
pub struct HttpWorkerControl {
    client: reqwest::Client,
    request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct MaintenanceRequest {
    action: MaintenanceKind,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    disk_used_bytes: Option<i64>,
    disk_total_bytes: Option<i64>,
}

impl HttpWorkerControl {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }

    fn endpoint(worker: &Worker, path: &str) -> Result<Url> {
        let address = worker.address.as_deref().ok_or_else(|| {
            Error::Unreachable(format!("worker {} has no address", worker.id))
        })?;
        let base = Url::parse(address).map_err(|e| {
            Error::InvalidInput(format!("worker {} address {address}: {e}", worker.id))
        })?;
        base.join(path)
            .map_err(|e| Error::InvalidInput(format!("worker {} path {path}: {e}", worker.id)))
    }

    async fn post<T: Serialize + ?Sized>(&self, worker: &Worker, path: &str, body: &T) -> Result<()> {
        let url = Self::endpoint(worker, path)?;
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(worker, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "worker {} answered {status}: {text}",
                worker.id
            )));
        }
        Ok(())
    }
}

fn request_error(worker: &Worker, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("worker {}: {err}", worker.id))
    } else {
        Error::Unreachable(format!("worker {}: {err}", worker.id))
    }
}

#[async_trait]
impl WorkerControl for HttpWorkerControl {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn dispatch(&self, worker: &Worker, message: &DispatchMessage) -> Result<()> {
        self.post(worker, "jobs", message).await
    }

    async fn stop(&self, worker: &Worker, job: &JobKey) -> Result<()> {
        let path = format!("jobs/{}/{}/{}/stop", job.project_id, job.build_id, job.job_id);
        self.post(worker, &path, &serde_json::json!({})).await
    }

    async fn maintain(&self, worker: &Worker, kind: MaintenanceKind) -> Result<()> {
        self.post(worker, "maintenance", &MaintenanceRequest { action: kind })
            .await
    }

    async fn probe(&self, worker: &Worker) -> Result<HealthSnapshot> {
        let url = Self::endpoint(worker, "health")?;
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| request_error(worker, e))?;

        if !response.status().is_success() {
            return Ok(HealthSnapshot::unreachable());
        }
        let health: HealthResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("worker {} health body: {e}", worker.id)))?;

        let disk_usage = match (health.disk_used_bytes, health.disk_total_bytes) {
            (Some(used_bytes), Some(total_bytes)) => Some(DiskUsage {
                used_bytes,
                total_bytes,
            }),
            _ => None,
        };
        Ok(HealthSnapshot {
            reachable: true,
            disk_usage,
        })
    }
}
