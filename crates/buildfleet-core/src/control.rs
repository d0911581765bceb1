//! Worker control channel.
//!
//! Workers execute the CI steps out of process. The scheduler talks to them
//! through this trait: dispatch, stop, maintenance and health probes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Result;
use crate::artifact::ArtifactCredentials;
use crate::id::JobKey;
use crate::maintenance::MaintenanceKind;
use crate::secret::SecretValue;
use crate::worker::{HealthSnapshot, Worker};

/// Everything a worker needs to run a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub job: JobKey,
    pub name: String,
    /// Container image to run.
    pub image: String,
    /// Opaque cache settings.
    pub cache_config: serde_json::Value,
    /// Resolved secrets. Empty for builds that are not safe.
    pub secrets: HashMap<String, SecretValue>,
    pub artifacts: ArtifactCredentials,
    /// Where to stream output sections and report completion.
    pub output_endpoint: String,
    /// Plaintext output-connect credential. Sent once, never stored.
    pub connect_credential: String,
}

/// Trait for the channel the scheduler uses to drive workers.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// Name of this control channel implementation.
    fn name(&self) -> &'static str;

    /// Hand a job to a worker. `Ok` is the dispatch acknowledgement.
    async fn dispatch(&self, worker: &Worker, message: &DispatchMessage) -> Result<()>;

    /// Best-effort request to stop a running job.
    async fn stop(&self, worker: &Worker, job: &JobKey) -> Result<()>;

    /// Run a maintenance action (disk cleanup, environment reset) on the worker.
    async fn maintain(&self, worker: &Worker, kind: MaintenanceKind) -> Result<()>;

    /// Probe the worker's health.
    async fn probe(&self, worker: &Worker) -> Result<HealthSnapshot>;
}
