//! Build and job repository.

use async_trait::async_trait;
use buildfleet_core::id::{BuildKey, JobKey, Version, WorkerId};
use buildfleet_core::job::{Job, JobFailure, JobState};
use buildfleet_core::project::Build;
use chrono::{DateTime, Utc};

use crate::repo::PgStore;
use crate::{DbError, DbResult, map_insert_error};

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Insert a build together with its jobs. Fails with `Duplicate` if the key exists.
    async fn insert_build(&self, build: &Build, jobs: &[Job]) -> DbResult<()>;
    async fn get_build(&self, key: BuildKey) -> DbResult<Build>;
    /// Compare-and-swap on `build.version`.
    async fn update_build(&self, build: &Build) -> DbResult<Build>;

    async fn get_job(&self, key: JobKey) -> DbResult<Job>;
    /// Compare-and-swap on `job.version`.
    async fn update_job(&self, job: &Job) -> DbResult<Job>;
    async fn list_jobs_for_build(&self, key: BuildKey) -> DbResult<Vec<Job>>;
    /// Jobs in `state`, oldest enqueue first.
    async fn list_jobs_in_state(&self, state: JobState) -> DbResult<Vec<Job>>;
    /// Terminal jobs finished before `cutoff` whose output has not been purged.
    async fn list_unpurged_finished_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Job>>;
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    project_id: i64,
    build_id: i64,
    commit_hash: String,
    remote_ref: String,
    commit_message: String,
    is_safe: bool,
    status: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> DbResult<Self> {
        Ok(Build {
            key: BuildKey::new(row.project_id, row.build_id),
            commit_hash: row.commit_hash,
            remote_ref: row.remote_ref,
            commit_message: row.commit_message,
            is_safe: row.is_safe,
            status: row.status.parse()?,
            created_at: row.created_at,
            finished_at: row.finished_at,
            version: Version(row.version),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    project_id: i64,
    build_id: i64,
    job_id: i64,
    name: String,
    kind: String,
    image: String,
    cache_config: serde_json::Value,
    secret_names: Vec<String>,
    pool: Option<String>,
    state: String,
    worker_kind: Option<String>,
    worker_id: Option<i64>,
    worker_label: Option<String>,
    credential_hash: Option<String>,
    queued_at: DateTime<Utc>,
    dispatch_started_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    wait_ms: Option<i64>,
    dispatch_attempts: i32,
    success: Option<bool>,
    failure_reason: Option<String>,
    failure_message: Option<String>,
    finished_at: Option<DateTime<Utc>>,
    output_purged: bool,
    version: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let worker = match (row.worker_kind, row.worker_id) {
            (Some(kind), Some(id)) => Some(WorkerId {
                kind: kind.parse()?,
                id,
            }),
            _ => None,
        };
        let failure = match row.failure_reason.as_deref() {
            None => None,
            Some("infrastructure") => Some(JobFailure::Infrastructure(
                row.failure_message.unwrap_or_default(),
            )),
            Some("job") => Some(JobFailure::Job(row.failure_message.unwrap_or_default())),
            Some(other) => {
                return Err(DbError::Corrupt(format!("unknown failure reason: {}", other)));
            }
        };

        Ok(Job {
            key: JobKey::new(row.project_id, row.build_id, row.job_id),
            name: row.name,
            kind: row.kind,
            image: row.image,
            cache_config: row.cache_config,
            secret_names: row.secret_names,
            pool: row.pool.map(|p| p.parse()).transpose()?,
            state: row.state.parse()?,
            worker,
            worker_label: row.worker_label,
            credential_hash: row.credential_hash,
            queued_at: row.queued_at,
            dispatch_started_at: row.dispatch_started_at,
            started_at: row.started_at,
            wait_ms: row.wait_ms,
            dispatch_attempts: row.dispatch_attempts,
            success: row.success,
            failure,
            finished_at: row.finished_at,
            output_purged: row.output_purged,
            version: Version(row.version),
        })
    }
}

fn failure_columns(failure: &Option<JobFailure>) -> (Option<&'static str>, Option<String>) {
    match failure {
        None => (None, None),
        Some(JobFailure::Infrastructure(m)) => (Some("infrastructure"), Some(m.clone())),
        Some(JobFailure::Job(m)) => (Some("job"), Some(m.clone())),
    }
}

fn jobs_from_rows(rows: Vec<JobRow>) -> DbResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

#[async_trait]
impl BuildRepo for PgStore {
    async fn insert_build(&self, build: &Build, jobs: &[Job]) -> DbResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO builds (project_id, build_id, commit_hash, remote_ref, commit_message,
                                is_safe, status, created_at, finished_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(build.key.project_id)
        .bind(build.key.build_id)
        .bind(&build.commit_hash)
        .bind(&build.remote_ref)
        .bind(&build.commit_message)
        .bind(build.is_safe)
        .bind(build.status.as_str())
        .bind(build.created_at)
        .bind(build.finished_at)
        .bind(build.version.0)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, format!("build {}", build.key)))?;

        for job in jobs {
            sqlx::query(
                r#"
                INSERT INTO jobs (project_id, build_id, job_id, name, kind, image, cache_config,
                                  secret_names, pool, state, queued_at, dispatch_attempts,
                                  output_purged, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(job.key.project_id)
            .bind(job.key.build_id)
            .bind(job.key.job_id)
            .bind(&job.name)
            .bind(&job.kind)
            .bind(&job.image)
            .bind(&job.cache_config)
            .bind(&job.secret_names)
            .bind(job.pool.map(|p| p.as_str()))
            .bind(job.state.as_str())
            .bind(job.queued_at)
            .bind(job.dispatch_attempts)
            .bind(job.output_purged)
            .bind(job.version.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, format!("job {}", job.key)))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_build(&self, key: BuildKey) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE project_id = $1 AND build_id = $2",
        )
        .bind(key.project_id)
        .bind(key.build_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", key)))?;
        row.try_into()
    }

    async fn update_build(&self, build: &Build) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            UPDATE builds
            SET status = $3, finished_at = $4, version = version + 1
            WHERE project_id = $1 AND build_id = $2 AND version = $5
            RETURNING *
            "#,
        )
        .bind(build.key.project_id)
        .bind(build.key.build_id)
        .bind(build.status.as_str())
        .bind(build.finished_at)
        .bind(build.version.0)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                // Distinguish a missing row from a lost race.
                self.get_build(build.key).await?;
                Err(DbError::VersionConflict {
                    entity: format!("build {}", build.key),
                    expected: build.version,
                })
            }
        }
    }

    async fn get_job(&self, key: JobKey) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE project_id = $1 AND build_id = $2 AND job_id = $3",
        )
        .bind(key.project_id)
        .bind(key.build_id)
        .bind(key.job_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", key)))?;
        row.try_into()
    }

    async fn update_job(&self, job: &Job) -> DbResult<Job> {
        let (failure_reason, failure_message) = failure_columns(&job.failure);
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET state = $4,
                worker_kind = $5,
                worker_id = $6,
                worker_label = $7,
                credential_hash = $8,
                dispatch_started_at = $9,
                started_at = $10,
                wait_ms = $11,
                dispatch_attempts = $12,
                success = $13,
                failure_reason = $14,
                failure_message = $15,
                finished_at = $16,
                output_purged = output_purged OR $17,
                version = version + 1
            WHERE project_id = $1 AND build_id = $2 AND job_id = $3 AND version = $18
            RETURNING *
            "#,
        )
        .bind(job.key.project_id)
        .bind(job.key.build_id)
        .bind(job.key.job_id)
        .bind(job.state.as_str())
        .bind(job.worker.map(|w| w.kind.as_str()))
        .bind(job.worker.map(|w| w.id))
        .bind(&job.worker_label)
        .bind(&job.credential_hash)
        .bind(job.dispatch_started_at)
        .bind(job.started_at)
        .bind(job.wait_ms)
        .bind(job.dispatch_attempts)
        .bind(job.success)
        .bind(failure_reason)
        .bind(failure_message)
        .bind(job.finished_at)
        .bind(job.output_purged)
        .bind(job.version.0)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                self.get_job(job.key).await?;
                Err(DbError::VersionConflict {
                    entity: format!("job {}", job.key),
                    expected: job.version,
                })
            }
        }
    }

    async fn list_jobs_for_build(&self, key: BuildKey) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE project_id = $1 AND build_id = $2 ORDER BY job_id",
        )
        .bind(key.project_id)
        .bind(key.build_id)
        .fetch_all(self.pool())
        .await?;
        jobs_from_rows(rows)
    }

    async fn list_jobs_in_state(&self, state: JobState) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE state = $1
            ORDER BY queued_at ASC, project_id, build_id, job_id
            "#,
        )
        .bind(state.as_str())
        .fetch_all(self.pool())
        .await?;
        jobs_from_rows(rows)
    }

    async fn list_unpurged_finished_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE finished_at < $1 AND output_purged = FALSE
            ORDER BY finished_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        jobs_from_rows(rows)
    }
}
