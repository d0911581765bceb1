//! Audit records of maintenance actions against the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ResourceId, WorkerId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceKind {
    /// Free disk space on the worker.
    Cleanup,
    /// Reset the worker's build environment.
    HealthReset,
    /// Stop an idle controlled worker's instance.
    Recycle,
    /// Destroy a controlled worker's cloud resource.
    Teardown,
}

impl MaintenanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceKind::Cleanup => "cleanup",
            MaintenanceKind::HealthReset => "health_reset",
            MaintenanceKind::Recycle => "recycle",
            MaintenanceKind::Teardown => "teardown",
        }
    }
}

impl std::str::FromStr for MaintenanceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cleanup" => Ok(MaintenanceKind::Cleanup),
            "health_reset" => Ok(MaintenanceKind::HealthReset),
            "recycle" => Ok(MaintenanceKind::Recycle),
            "teardown" => Ok(MaintenanceKind::Teardown),
            other => Err(Error::InvalidInput(format!(
                "unknown maintenance kind: {other}"
            ))),
        }
    }
}

/// Write-once audit record. Only the completion fields change after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceOperation {
    pub id: ResourceId,
    pub kind: MaintenanceKind,
    pub worker: Option<WorkerId>,
    pub description: String,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed: bool,
}

impl MaintenanceOperation {
    pub fn new(
        kind: MaintenanceKind,
        worker: Option<WorkerId>,
        description: impl Into<String>,
        triggered_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            kind,
            worker,
            description: description.into(),
            triggered_by: triggered_by.into(),
            created_at: now,
            finished_at: None,
            failed: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
