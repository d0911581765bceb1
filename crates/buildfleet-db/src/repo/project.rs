//! Project repository. Projects are owned by the portal; the scheduler only reads them.

use async_trait::async_trait;
use buildfleet_core::project::Project;

use crate::repo::PgStore;
use crate::{DbError, DbResult};

#[async_trait]
pub trait ProjectRepo: Send + Sync {
    async fn upsert_project(&self, project: &Project) -> DbResult<()>;
    async fn get_project(&self, id: i64) -> DbResult<Project>;
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectRow {
    id: i64,
    name: String,
    repository: String,
    default_branch: String,
    enabled: bool,
    deleted: bool,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Project {
            id: row.id,
            name: row.name,
            repository: row.repository,
            default_branch: row.default_branch,
            enabled: row.enabled,
            deleted: row.deleted,
        }
    }
}

#[async_trait]
impl ProjectRepo for PgStore {
    async fn upsert_project(&self, project: &Project) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, repository, default_branch, enabled, deleted)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                repository = EXCLUDED.repository,
                default_branch = EXCLUDED.default_branch,
                enabled = EXCLUDED.enabled,
                deleted = EXCLUDED.deleted
            "#,
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(&project.repository)
        .bind(&project.default_branch)
        .bind(project.enabled)
        .bind(project.deleted)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_project(&self, id: i64) -> DbResult<Project> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))?;
        Ok(row.into())
    }
}
