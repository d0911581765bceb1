//! Jobs and the job state machine.
//!
//! ```text
//! Queued -> Dispatching -> Running -> Succeeded | Failed
//!              |
//!              +-> Queued (rollback, counted)
//! Queued | Dispatching | Running -> Cancelled
//! ```
//!
//! Terminal states are never left.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobKey, Version, WorkerId, WorkerKind};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Dispatching,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Dispatching)
                | (Dispatching, Running)
                | (Dispatching, Queued)
                | (Dispatching, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Queued, Cancelled)
                | (Dispatching, Cancelled)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Dispatching => "dispatching",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "dispatching" => Ok(JobState::Dispatching),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job state: {other}"))),
        }
    }
}

/// Why a job failed. Infrastructure failures are never the job's fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum JobFailure {
    /// The worker died, dispatch never acknowledged, and so on.
    Infrastructure(String),
    /// The worker ran the job and reported failure.
    Job(String),
}

impl JobFailure {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, JobFailure::Infrastructure(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobFailure::Infrastructure(m) | JobFailure::Job(m) => m,
        }
    }
}

/// Completion report sent by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Everything needed to create a job. The key is assigned by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_id: i64,
    pub name: String,
    /// Job kind, used when resolving secrets.
    pub kind: String,
    pub image: String,
    #[serde(default)]
    pub cache_config: serde_json::Value,
    #[serde(default)]
    pub secret_names: Vec<String>,
    /// Restrict the job to one worker pool. `None` runs anywhere.
    #[serde(default)]
    pub pool: Option<WorkerKind>,
}

/// One schedulable unit of CI work belonging to a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub key: JobKey,
    pub name: String,
    pub kind: String,
    pub image: String,
    /// Opaque cache settings handed to the worker.
    pub cache_config: serde_json::Value,
    pub secret_names: Vec<String>,
    pub pool: Option<WorkerKind>,
    pub state: JobState,
    /// Worker currently (or last) executing this job.
    pub worker: Option<WorkerId>,
    /// Human-readable label of the worker that ran the job. Survives worker deletion.
    pub worker_label: Option<String>,
    /// Hash of the output-connect credential. The plaintext is never stored.
    #[serde(skip)]
    pub credential_hash: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub dispatch_started_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// Time spent waiting for a worker, in milliseconds.
    pub wait_ms: Option<i64>,
    pub dispatch_attempts: i32,
    pub success: Option<bool>,
    pub failure: Option<JobFailure>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_purged: bool,
    pub version: Version,
}

impl Job {
    pub fn new(key: JobKey, spec: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            key,
            name: spec.name,
            kind: spec.kind,
            image: spec.image,
            cache_config: spec.cache_config,
            secret_names: spec.secret_names,
            pool: spec.pool,
            state: JobState::Queued,
            worker: None,
            worker_label: None,
            credential_hash: None,
            queued_at: now,
            dispatch_started_at: None,
            started_at: None,
            wait_ms: None,
            dispatch_attempts: 0,
            success: None,
            failure: None,
            finished_at: None,
            output_purged: false,
            version: Version::initial(),
        }
    }

    fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!(
                "job {} cannot move from {} to {}",
                self.key, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Queued -> Dispatching. Binds the job to `worker`.
    pub fn begin_dispatch(
        &mut self,
        worker: WorkerId,
        worker_label: String,
        credential_hash: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.worker.is_some() && self.state == JobState::Queued {
            return Err(Error::InvalidTransition(format!(
                "job {} still carries a previous worker assignment",
                self.key
            )));
        }
        self.transition(JobState::Dispatching)?;
        self.worker = Some(worker);
        self.worker_label = Some(worker_label);
        self.credential_hash = Some(credential_hash);
        self.dispatch_started_at = Some(now);
        Ok(())
    }

    /// Dispatching -> Running, on worker acknowledgement.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Running)?;
        self.started_at = Some(now);
        self.wait_ms = Some((now - self.queued_at).num_milliseconds().max(0));
        Ok(())
    }

    /// Dispatching -> Queued. Clears the assignment and counts the attempt.
    pub fn rollback_dispatch(&mut self) -> Result<()> {
        self.transition(JobState::Queued)?;
        self.worker = None;
        self.worker_label = None;
        self.credential_hash = None;
        self.dispatch_started_at = None;
        self.dispatch_attempts += 1;
        Ok(())
    }

    /// Running -> Succeeded | Failed, from a worker completion report.
    pub fn finish(&mut self, outcome: &JobOutcome, now: DateTime<Utc>) -> Result<()> {
        if outcome.success {
            self.transition(JobState::Succeeded)?;
        } else {
            self.transition(JobState::Failed)?;
            self.failure = Some(JobFailure::Job(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "job reported failure".to_string()),
            ));
        }
        self.success = Some(outcome.success);
        self.finished_at = Some(now);
        self.credential_hash = None;
        Ok(())
    }

    /// Dispatching | Running -> Failed, for reasons outside the job's script.
    pub fn fail_infrastructure(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(JobState::Failed)?;
        self.failure = Some(JobFailure::Infrastructure(message.into()));
        self.success = Some(false);
        self.finished_at = Some(now);
        self.credential_hash = None;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Cancelled)?;
        self.success = Some(false);
        self.finished_at = Some(now);
        self.credential_hash = None;
        Ok(())
    }

    /// Whether the job currently holds a reservation on `worker`.
    pub fn is_assigned_to(&self, worker: WorkerId) -> bool {
        !self.state.is_terminal() && self.worker == Some(worker)
    }
}
