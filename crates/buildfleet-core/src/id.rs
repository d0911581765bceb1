//! Resource identifiers, composite keys and version stamps.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for audit records (maintenance operations, events).
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a new unique ResourceId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a ResourceId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<ResourceId> for Uuid {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Key of a build: (project id, build id). Both are caller-assigned sequences.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{project_id}/{build_id}")]
pub struct BuildKey {
    pub project_id: i64,
    pub build_id: i64,
}

impl BuildKey {
    pub fn new(project_id: i64, build_id: i64) -> Self {
        Self {
            project_id,
            build_id,
        }
    }

    pub fn job(&self, job_id: i64) -> JobKey {
        JobKey {
            project_id: self.project_id,
            build_id: self.build_id,
            job_id,
        }
    }
}

/// Key of a job: (project id, build id, job id).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{project_id}/{build_id}/{job_id}")]
pub struct JobKey {
    pub project_id: i64,
    pub build_id: i64,
    pub job_id: i64,
}

impl JobKey {
    pub fn new(project_id: i64, build_id: i64, job_id: i64) -> Self {
        Self {
            project_id,
            build_id,
            job_id,
        }
    }

    pub fn build(&self) -> BuildKey {
        BuildKey::new(self.project_id, self.build_id)
    }
}

/// Which pool a worker lives in. Worker ids are only unique within a kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    #[display("controlled")]
    Controlled,
    #[display("external")]
    External,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Controlled => "controlled",
            WorkerKind::External => "external",
        }
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "controlled" => Ok(WorkerKind::Controlled),
            "external" => Ok(WorkerKind::External),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown worker kind: {other}"
            ))),
        }
    }
}

/// Identity of a worker: the pool namespace plus the id within that pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{kind}-{id}")]
pub struct WorkerId {
    pub kind: WorkerKind,
    pub id: i64,
}

impl WorkerId {
    pub fn controlled(id: i64) -> Self {
        Self {
            kind: WorkerKind::Controlled,
            id,
        }
    }

    pub fn external(id: i64) -> Self {
        Self {
            kind: WorkerKind::External,
            id,
        }
    }
}

/// Optimistic-concurrency stamp. Every committed write bumps it by one.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
)]
#[display("v{_0}")]
pub struct Version(pub i64);

impl Version {
    pub fn initial() -> Self {
        Self(1)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}
