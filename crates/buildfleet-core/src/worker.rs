//! Workers: controlled (cloud-provisioned) and external (operator-registered).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobKey, Version, WorkerId, WorkerKind};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Cloud resource requested, not ready yet.
    Provisioning,
    /// Up and healthy.
    Running,
    /// Controlled worker whose instance is stopped. Must be woken before dispatch.
    Idle,
    /// Missed health probes past the threshold.
    Unreachable,
    Terminated,
    Errored,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Provisioning => "provisioning",
            WorkerStatus::Running => "running",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Unreachable => "unreachable",
            WorkerStatus::Terminated => "terminated",
            WorkerStatus::Errored => "errored",
        }
    }

    /// Statuses a worker can be scheduled from.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, WorkerStatus::Running | WorkerStatus::Idle)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "provisioning" => Ok(WorkerStatus::Provisioning),
            "running" => Ok(WorkerStatus::Running),
            "idle" => Ok(WorkerStatus::Idle),
            "unreachable" => Ok(WorkerStatus::Unreachable),
            "terminated" => Ok(WorkerStatus::Terminated),
            "errored" => Ok(WorkerStatus::Errored),
            other => Err(Error::InvalidInput(format!(
                "unknown worker status: {other}"
            ))),
        }
    }
}

/// Who, if anyone, holds a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "job", rename_all = "snake_case")]
pub enum Reservation {
    Free,
    Job(JobKey),
    Maintenance,
}

impl Reservation {
    pub fn is_free(&self) -> bool {
        matches!(self, Reservation::Free)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub used_bytes: i64,
    pub total_bytes: i64,
}

impl DiskUsage {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes <= 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

/// Result of one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub reachable: bool,
    pub disk_usage: Option<DiskUsage>,
}

impl HealthSnapshot {
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            disk_usage: None,
        }
    }
}

/// What to ask the cloud for when provisioning a controlled worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub source_image: String,
    pub instance_class: String,
    pub volume_gb: i32,
    pub priority: i32,
}

/// Operator-supplied description of an external worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalWorkerSpec {
    pub name: String,
    pub address: String,
    pub priority: i32,
    pub ssh_key_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlledDetails {
    pub source_image: String,
    pub instance_class: String,
    pub volume_gb: i32,
    /// Cloud-side handle, known once the create request was accepted.
    pub instance_handle: Option<String>,
    pub fully_provisioned: bool,
    pub provisioning_started_at: Option<DateTime<Utc>>,
    /// Accumulated runtime in seconds, for cost accounting.
    pub total_runtime_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalDetails {
    pub ssh_key_ref: Option<String>,
}

/// Kind-specific worker fields. The variant always matches `WorkerId::kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerDetails {
    Controlled(ControlledDetails),
    External(ExternalDetails),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub status: WorkerStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Last time a probe found the worker reachable.
    pub last_seen_at: Option<DateTime<Utc>>,
    pub reservation: Reservation,
    pub address: Option<String>,
    /// When the worker's compute last came up. `None` while stopped.
    pub running_since: Option<DateTime<Utc>>,
    /// When the last reservation was released.
    pub idle_since: Option<DateTime<Utc>>,
    pub disk_usage: Option<DiskUsage>,
    pub cleanup_queued: bool,
    pub wants_maintenance: bool,
    pub last_maintenance_at: Option<DateTime<Utc>>,
    pub jobs_since_maintenance: i32,
    pub priority: i32,
    pub details: WorkerDetails,
    pub version: Version,
}

impl Worker {
    /// A controlled worker placeholder, created before the cloud resource exists.
    pub fn new_controlled(id: i64, spec: &InstanceSpec, now: DateTime<Utc>) -> Self {
        Self::blank(
            WorkerId::controlled(id),
            format!("controlled-{id}"),
            WorkerStatus::Provisioning,
            spec.priority,
            WorkerDetails::Controlled(ControlledDetails {
                source_image: spec.source_image.clone(),
                instance_class: spec.instance_class.clone(),
                volume_gb: spec.volume_gb,
                instance_handle: None,
                fully_provisioned: false,
                provisioning_started_at: Some(now),
                total_runtime_secs: 0,
            }),
        )
    }

    /// An external worker. It is assumed up until a probe says otherwise.
    pub fn new_external(id: i64, spec: &ExternalWorkerSpec, now: DateTime<Utc>) -> Self {
        let mut worker = Self::blank(
            WorkerId::external(id),
            spec.name.clone(),
            WorkerStatus::Running,
            spec.priority,
            WorkerDetails::External(ExternalDetails {
                ssh_key_ref: spec.ssh_key_ref.clone(),
            }),
        );
        worker.address = Some(spec.address.clone());
        worker.running_since = Some(now);
        worker.last_seen_at = Some(now);
        worker.idle_since = Some(now);
        worker
    }

    fn blank(
        id: WorkerId,
        name: String,
        status: WorkerStatus,
        priority: i32,
        details: WorkerDetails,
    ) -> Self {
        Self {
            id,
            name,
            status,
            last_checked_at: None,
            last_seen_at: None,
            reservation: Reservation::Free,
            address: None,
            running_since: None,
            idle_since: None,
            disk_usage: None,
            cleanup_queued: false,
            wants_maintenance: false,
            last_maintenance_at: None,
            jobs_since_maintenance: 0,
            priority,
            details,
            version: Version::initial(),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.id.kind
    }

    /// Label recorded on jobs for audit.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }

    pub fn controlled(&self) -> Option<&ControlledDetails> {
        match &self.details {
            WorkerDetails::Controlled(c) => Some(c),
            WorkerDetails::External(_) => None,
        }
    }

    pub fn controlled_mut(&mut self) -> Option<&mut ControlledDetails> {
        match &mut self.details {
            WorkerDetails::Controlled(c) => Some(c),
            WorkerDetails::External(_) => None,
        }
    }

    /// Free, schedulable and not waiting for maintenance.
    pub fn is_eligible(&self) -> bool {
        self.status.is_schedulable()
            && self.reservation.is_free()
            && !self.wants_maintenance
            && !self.cleanup_queued
    }

    /// Compute already up; no wake-up needed before dispatch.
    pub fn is_warm(&self) -> bool {
        self.running_since.is_some()
    }

    /// Whether the worker counts against the controlled-worker ceiling.
    pub fn is_active(&self) -> bool {
        !matches!(
            self.status,
            WorkerStatus::Terminated | WorkerStatus::Errored
        )
    }

    /// Start accruing runtime.
    pub fn start_clock(&mut self, now: DateTime<Utc>) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    /// Stop accruing runtime and fold the elapsed time into the total.
    pub fn stop_clock(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.running_since.take() {
            let elapsed = (now - since).num_seconds().max(0);
            if let Some(c) = self.controlled_mut() {
                c.total_runtime_secs += elapsed;
            }
        }
    }
}
