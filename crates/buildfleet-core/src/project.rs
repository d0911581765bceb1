//! Projects and builds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BuildKey, Version};
use crate::job::{JobState, NewJob};

/// A versioned source project. Read-only to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    /// Repository location (clone URL).
    pub repository: String,
    pub default_branch: String,
    pub enabled: bool,
    pub deleted: bool,
}

impl Project {
    /// Whether queued work for this project may be scheduled.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Succeeded | BuildStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Created => "created",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "created" => Ok(BuildStatus::Created),
            "running" => Ok(BuildStatus::Running),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown build status: {other}"
            ))),
        }
    }
}

/// One triggering event (e.g. a pushed commit) for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub key: BuildKey,
    pub commit_hash: String,
    pub remote_ref: String,
    pub commit_message: String,
    /// Only safe builds receive secrets. Builds from untrusted forks are not safe.
    pub is_safe: bool,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: Version,
}

/// Request to create a build and queue its jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBuild {
    pub project_id: i64,
    pub build_id: i64,
    pub commit_hash: String,
    pub remote_ref: String,
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub is_safe: bool,
    pub jobs: Vec<NewJob>,
}

impl Build {
    pub fn new(request: &NewBuild, now: DateTime<Utc>) -> Self {
        Self {
            key: BuildKey::new(request.project_id, request.build_id),
            commit_hash: request.commit_hash.clone(),
            remote_ref: request.remote_ref.clone(),
            commit_message: request.commit_message.clone(),
            is_safe: request.is_safe,
            status: BuildStatus::Created,
            created_at: now,
            finished_at: None,
            version: Version::initial(),
        }
    }

    /// Derive the build status from the states of its jobs.
    ///
    /// Returns `None` when the status does not change.
    pub fn derive_status<'a>(
        &self,
        jobs: impl IntoIterator<Item = &'a JobState>,
    ) -> Option<BuildStatus> {
        if self.status.is_terminal() {
            return None;
        }

        let states: Vec<&JobState> = jobs.into_iter().collect();
        if states.is_empty() {
            return None;
        }

        let next = if states.iter().all(|s| s.is_terminal()) {
            if states.iter().all(|s| **s == JobState::Succeeded) {
                BuildStatus::Succeeded
            } else {
                BuildStatus::Failed
            }
        } else if states.iter().any(|s| **s != JobState::Queued) {
            BuildStatus::Running
        } else {
            // A running build whose jobs were all rolled back stays running.
            return None;
        };

        (next != self.status).then_some(next)
    }
}
