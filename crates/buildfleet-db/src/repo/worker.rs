//! Worker repository. Both worker kinds live in one table keyed by (kind, id),
//! with kind-specific columns left NULL for the other kind.

use async_trait::async_trait;
use buildfleet_core::id::{JobKey, Version, WorkerId, WorkerKind};
use buildfleet_core::worker::{
    ControlledDetails, DiskUsage, ExternalDetails, ExternalWorkerSpec, InstanceSpec, Reservation,
    Worker, WorkerDetails,
};
use chrono::{DateTime, Utc};

use crate::repo::PgStore;
use crate::{DbError, DbResult, map_insert_error};

#[async_trait]
pub trait WorkerRepo: Send + Sync {
    /// Create a controlled-worker placeholder in `Provisioning` with a fresh id.
    async fn insert_controlled(&self, spec: &InstanceSpec, now: DateTime<Utc>)
    -> DbResult<Worker>;
    /// Register an external worker. Names are unique among external workers.
    async fn insert_external(
        &self,
        spec: &ExternalWorkerSpec,
        now: DateTime<Utc>,
    ) -> DbResult<Worker>;
    async fn find_external_by_name(&self, name: &str) -> DbResult<Option<Worker>>;
    async fn get_worker(&self, id: WorkerId) -> DbResult<Worker>;
    /// Compare-and-swap on `worker.version`.
    async fn update_worker(&self, worker: &Worker) -> DbResult<Worker>;
    async fn list_workers(&self) -> DbResult<Vec<Worker>>;
    /// Workers that are free, schedulable and not flagged for maintenance.
    async fn list_free_workers(&self) -> DbResult<Vec<Worker>>;
}

#[derive(Debug, sqlx::FromRow)]
struct WorkerRow {
    kind: String,
    id: i64,
    name: String,
    status: String,
    last_checked_at: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
    reservation: String,
    reserved_project_id: Option<i64>,
    reserved_build_id: Option<i64>,
    reserved_job_id: Option<i64>,
    address: Option<String>,
    running_since: Option<DateTime<Utc>>,
    idle_since: Option<DateTime<Utc>>,
    disk_used_bytes: Option<i64>,
    disk_total_bytes: Option<i64>,
    cleanup_queued: bool,
    wants_maintenance: bool,
    last_maintenance_at: Option<DateTime<Utc>>,
    jobs_since_maintenance: i32,
    priority: i32,
    source_image: Option<String>,
    instance_class: Option<String>,
    volume_gb: Option<i32>,
    instance_handle: Option<String>,
    fully_provisioned: Option<bool>,
    provisioning_started_at: Option<DateTime<Utc>>,
    total_runtime_secs: Option<i64>,
    ssh_key_ref: Option<String>,
    version: i64,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = DbError;

    fn try_from(row: WorkerRow) -> DbResult<Self> {
        let kind: WorkerKind = row.kind.parse()?;
        let id = WorkerId { kind, id: row.id };

        let reservation = match row.reservation.as_str() {
            "free" => Reservation::Free,
            "maintenance" => Reservation::Maintenance,
            "job" => match (
                row.reserved_project_id,
                row.reserved_build_id,
                row.reserved_job_id,
            ) {
                (Some(p), Some(b), Some(j)) => Reservation::Job(JobKey::new(p, b, j)),
                _ => {
                    return Err(DbError::Corrupt(format!(
                        "worker {id} reserved for a job without a job key"
                    )));
                }
            },
            other => {
                return Err(DbError::Corrupt(format!(
                    "worker {id} has unknown reservation {other}"
                )));
            }
        };

        let disk_usage = match (row.disk_used_bytes, row.disk_total_bytes) {
            (Some(used_bytes), Some(total_bytes)) => Some(DiskUsage {
                used_bytes,
                total_bytes,
            }),
            _ => None,
        };

        let details = match kind {
            WorkerKind::Controlled => WorkerDetails::Controlled(ControlledDetails {
                source_image: row.source_image.unwrap_or_default(),
                instance_class: row.instance_class.unwrap_or_default(),
                volume_gb: row.volume_gb.unwrap_or_default(),
                instance_handle: row.instance_handle,
                fully_provisioned: row.fully_provisioned.unwrap_or(false),
                provisioning_started_at: row.provisioning_started_at,
                total_runtime_secs: row.total_runtime_secs.unwrap_or(0),
            }),
            WorkerKind::External => WorkerDetails::External(ExternalDetails {
                ssh_key_ref: row.ssh_key_ref,
            }),
        };

        Ok(Worker {
            id,
            name: row.name,
            status: row.status.parse()?,
            last_checked_at: row.last_checked_at,
            last_seen_at: row.last_seen_at,
            reservation,
            address: row.address,
            running_since: row.running_since,
            idle_since: row.idle_since,
            disk_usage,
            cleanup_queued: row.cleanup_queued,
            wants_maintenance: row.wants_maintenance,
            last_maintenance_at: row.last_maintenance_at,
            jobs_since_maintenance: row.jobs_since_maintenance,
            priority: row.priority,
            details,
            version: Version(row.version),
        })
    }
}

/// Flattened column values shared by insert and update.
struct WorkerColumns<'a> {
    reservation: &'static str,
    reserved: Option<JobKey>,
    disk: Option<DiskUsage>,
    controlled: Option<&'a ControlledDetails>,
    ssh_key_ref: Option<&'a str>,
}

impl<'a> WorkerColumns<'a> {
    fn of(worker: &'a Worker) -> Self {
        let (reservation, reserved) = match worker.reservation {
            Reservation::Free => ("free", None),
            Reservation::Job(key) => ("job", Some(key)),
            Reservation::Maintenance => ("maintenance", None),
        };
        let ssh_key_ref = match &worker.details {
            WorkerDetails::External(e) => e.ssh_key_ref.as_deref(),
            WorkerDetails::Controlled(_) => None,
        };
        Self {
            reservation,
            reserved,
            disk: worker.disk_usage,
            controlled: worker.controlled(),
            ssh_key_ref,
        }
    }
}

fn workers_from_rows(rows: Vec<WorkerRow>) -> DbResult<Vec<Worker>> {
    rows.into_iter().map(Worker::try_from).collect()
}

impl PgStore {
    async fn insert_worker(&self, worker: &Worker) -> DbResult<Worker> {
        let cols = WorkerColumns::of(worker);
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            INSERT INTO workers (
                kind, id, name, status, last_checked_at, last_seen_at,
                reservation, reserved_project_id, reserved_build_id, reserved_job_id,
                address, running_since, idle_since, disk_used_bytes, disk_total_bytes,
                cleanup_queued, wants_maintenance, last_maintenance_at, jobs_since_maintenance,
                priority, source_image, instance_class, volume_gb, instance_handle,
                fully_provisioned, provisioning_started_at, total_runtime_secs, ssh_key_ref,
                version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29)
            RETURNING *
            "#,
        )
        .bind(worker.id.kind.as_str())
        .bind(worker.id.id)
        .bind(&worker.name)
        .bind(worker.status.as_str())
        .bind(worker.last_checked_at)
        .bind(worker.last_seen_at)
        .bind(cols.reservation)
        .bind(cols.reserved.map(|k| k.project_id))
        .bind(cols.reserved.map(|k| k.build_id))
        .bind(cols.reserved.map(|k| k.job_id))
        .bind(&worker.address)
        .bind(worker.running_since)
        .bind(worker.idle_since)
        .bind(cols.disk.map(|d| d.used_bytes))
        .bind(cols.disk.map(|d| d.total_bytes))
        .bind(worker.cleanup_queued)
        .bind(worker.wants_maintenance)
        .bind(worker.last_maintenance_at)
        .bind(worker.jobs_since_maintenance)
        .bind(worker.priority)
        .bind(cols.controlled.map(|c| c.source_image.as_str()))
        .bind(cols.controlled.map(|c| c.instance_class.as_str()))
        .bind(cols.controlled.map(|c| c.volume_gb))
        .bind(cols.controlled.and_then(|c| c.instance_handle.as_deref()))
        .bind(cols.controlled.map(|c| c.fully_provisioned))
        .bind(cols.controlled.and_then(|c| c.provisioning_started_at))
        .bind(cols.controlled.map(|c| c.total_runtime_secs))
        .bind(cols.ssh_key_ref)
        .bind(worker.version.0)
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_insert_error(e, format!("worker {}", worker.name)))?;
        row.try_into()
    }
}

#[async_trait]
impl WorkerRepo for PgStore {
    async fn insert_controlled(
        &self,
        spec: &InstanceSpec,
        now: DateTime<Utc>,
    ) -> DbResult<Worker> {
        let id: i64 = sqlx::query_scalar("SELECT nextval('controlled_worker_ids')")
            .fetch_one(self.pool())
            .await?;
        self.insert_worker(&Worker::new_controlled(id, spec, now))
            .await
    }

    async fn insert_external(
        &self,
        spec: &ExternalWorkerSpec,
        now: DateTime<Utc>,
    ) -> DbResult<Worker> {
        let id: i64 = sqlx::query_scalar("SELECT nextval('external_worker_ids')")
            .fetch_one(self.pool())
            .await?;
        self.insert_worker(&Worker::new_external(id, spec, now))
            .await
    }

    async fn find_external_by_name(&self, name: &str) -> DbResult<Option<Worker>> {
        let row = sqlx::query_as::<_, WorkerRow>(
            "SELECT * FROM workers WHERE kind = 'external' AND name = $1",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        row.map(Worker::try_from).transpose()
    }

    async fn get_worker(&self, id: WorkerId) -> DbResult<Worker> {
        let row = sqlx::query_as::<_, WorkerRow>(
            "SELECT * FROM workers WHERE kind = $1 AND id = $2",
        )
        .bind(id.kind.as_str())
        .bind(id.id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))?;
        row.try_into()
    }

    async fn update_worker(&self, worker: &Worker) -> DbResult<Worker> {
        let cols = WorkerColumns::of(worker);
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            UPDATE workers
            SET name = $3,
                status = $4,
                last_checked_at = $5,
                last_seen_at = $6,
                reservation = $7,
                reserved_project_id = $8,
                reserved_build_id = $9,
                reserved_job_id = $10,
                address = $11,
                running_since = $12,
                idle_since = $13,
                disk_used_bytes = $14,
                disk_total_bytes = $15,
                cleanup_queued = $16,
                wants_maintenance = $17,
                last_maintenance_at = $18,
                jobs_since_maintenance = $19,
                priority = $20,
                instance_handle = $21,
                fully_provisioned = $22,
                provisioning_started_at = $23,
                total_runtime_secs = $24,
                ssh_key_ref = $25,
                version = version + 1
            WHERE kind = $1 AND id = $2 AND version = $26
            RETURNING *
            "#,
        )
        .bind(worker.id.kind.as_str())
        .bind(worker.id.id)
        .bind(&worker.name)
        .bind(worker.status.as_str())
        .bind(worker.last_checked_at)
        .bind(worker.last_seen_at)
        .bind(cols.reservation)
        .bind(cols.reserved.map(|k| k.project_id))
        .bind(cols.reserved.map(|k| k.build_id))
        .bind(cols.reserved.map(|k| k.job_id))
        .bind(&worker.address)
        .bind(worker.running_since)
        .bind(worker.idle_since)
        .bind(cols.disk.map(|d| d.used_bytes))
        .bind(cols.disk.map(|d| d.total_bytes))
        .bind(worker.cleanup_queued)
        .bind(worker.wants_maintenance)
        .bind(worker.last_maintenance_at)
        .bind(worker.jobs_since_maintenance)
        .bind(worker.priority)
        .bind(cols.controlled.and_then(|c| c.instance_handle.as_deref()))
        .bind(cols.controlled.map(|c| c.fully_provisioned))
        .bind(cols.controlled.and_then(|c| c.provisioning_started_at))
        .bind(cols.controlled.map(|c| c.total_runtime_secs))
        .bind(cols.ssh_key_ref)
        .bind(worker.version.0)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                self.get_worker(worker.id).await?;
                Err(DbError::VersionConflict {
                    entity: format!("worker {}", worker.id),
                    expected: worker.version,
                })
            }
        }
    }

    async fn list_workers(&self) -> DbResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers ORDER BY kind, id")
            .fetch_all(self.pool())
            .await?;
        workers_from_rows(rows)
    }

    async fn list_free_workers(&self) -> DbResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT * FROM workers
            WHERE status IN ('running', 'idle')
              AND reservation = 'free'
              AND NOT wants_maintenance
              AND NOT cleanup_queued
            ORDER BY priority, kind, id
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        workers_from_rows(rows)
    }
}
