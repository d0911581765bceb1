//! Maintenance audit log.

use async_trait::async_trait;
use buildfleet_core::id::{ResourceId, WorkerId};
use buildfleet_core::maintenance::MaintenanceOperation;
use chrono::{DateTime, Utc};

use crate::repo::PgStore;
use crate::{DbError, DbResult};

#[async_trait]
pub trait MaintenanceRepo: Send + Sync {
    async fn insert_operation(&self, op: &MaintenanceOperation) -> DbResult<()>;
    /// Record completion. Finishing an already finished operation is an error.
    async fn finish_operation(
        &self,
        id: ResourceId,
        failed: bool,
        now: DateTime<Utc>,
    ) -> DbResult<MaintenanceOperation>;
    /// Most recent first, optionally for a single worker.
    async fn list_operations(
        &self,
        worker: Option<WorkerId>,
        limit: i64,
    ) -> DbResult<Vec<MaintenanceOperation>>;
}

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: uuid::Uuid,
    kind: String,
    worker_kind: Option<String>,
    worker_id: Option<i64>,
    description: String,
    triggered_by: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    failed: bool,
}

impl TryFrom<OperationRow> for MaintenanceOperation {
    type Error = DbError;

    fn try_from(row: OperationRow) -> DbResult<Self> {
        let worker = match (row.worker_kind, row.worker_id) {
            (Some(kind), Some(id)) => Some(WorkerId {
                kind: kind.parse()?,
                id,
            }),
            _ => None,
        };
        Ok(MaintenanceOperation {
            id: ResourceId::from_uuid(row.id),
            kind: row.kind.parse()?,
            worker,
            description: row.description,
            triggered_by: row.triggered_by,
            created_at: row.created_at,
            finished_at: row.finished_at,
            failed: row.failed,
        })
    }
}

#[async_trait]
impl MaintenanceRepo for PgStore {
    async fn insert_operation(&self, op: &MaintenanceOperation) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO maintenance_operations (id, kind, worker_kind, worker_id, description,
                                                triggered_by, created_at, finished_at, failed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(op.id.as_uuid())
        .bind(op.kind.as_str())
        .bind(op.worker.map(|w| w.kind.as_str()))
        .bind(op.worker.map(|w| w.id))
        .bind(&op.description)
        .bind(&op.triggered_by)
        .bind(op.created_at)
        .bind(op.finished_at)
        .bind(op.failed)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn finish_operation(
        &self,
        id: ResourceId,
        failed: bool,
        now: DateTime<Utc>,
    ) -> DbResult<MaintenanceOperation> {
        let row = sqlx::query_as::<_, OperationRow>(
            r#"
            UPDATE maintenance_operations
            SET finished_at = $2, failed = $3
            WHERE id = $1 AND finished_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .bind(failed)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| {
            DbError::InvalidState(format!("maintenance operation {} is missing or finished", id))
        })?;
        row.try_into()
    }

    async fn list_operations(
        &self,
        worker: Option<WorkerId>,
        limit: i64,
    ) -> DbResult<Vec<MaintenanceOperation>> {
        let rows = match worker {
            Some(w) => {
                sqlx::query_as::<_, OperationRow>(
                    r#"
                    SELECT * FROM maintenance_operations
                    WHERE worker_kind = $1 AND worker_id = $2
                    ORDER BY created_at DESC
                    LIMIT $3
                    "#,
                )
                .bind(w.kind.as_str())
                .bind(w.id)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, OperationRow>(
                    "SELECT * FROM maintenance_operations ORDER BY created_at DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.into_iter().map(MaintenanceOperation::try_from).collect()
    }
}
