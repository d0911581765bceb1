//! Job output repository.
//!
//! Sections are append-only while open. Appends to one section are
//! serialized by a row lock so concurrent writers never interleave out of
//! order.

use async_trait::async_trait;
use buildfleet_core::id::JobKey;
use buildfleet_core::output::{JobOutputSection, SectionStatus};
use chrono::{DateTime, Utc};

use crate::repo::PgStore;
use crate::{DbError, DbResult};

#[async_trait]
pub trait OutputRepo: Send + Sync {
    /// Open a new section. Section ids are assigned per job starting at 1.
    async fn open_section(
        &self,
        job: JobKey,
        name: &str,
        now: DateTime<Utc>,
    ) -> DbResult<JobOutputSection>;

    /// Append to an open section, clipping at `max_len` bytes. Returns bytes accepted.
    async fn append_output(
        &self,
        job: JobKey,
        section_id: i64,
        text: &str,
        max_len: usize,
    ) -> DbResult<usize>;

    async fn close_section(
        &self,
        job: JobKey,
        section_id: i64,
        status: SectionStatus,
        now: DateTime<Utc>,
    ) -> DbResult<JobOutputSection>;

    async fn get_section(&self, job: JobKey, section_id: i64) -> DbResult<JobOutputSection>;

    /// All sections of a job in id order.
    async fn list_sections(&self, job: JobKey) -> DbResult<Vec<JobOutputSection>>;

    /// Drop the text of every section and mark the job's output purged.
    /// Returns the number of sections touched. Idempotent.
    async fn purge_output(&self, job: JobKey) -> DbResult<u64>;
}

#[derive(Debug, sqlx::FromRow)]
struct SectionRow {
    project_id: i64,
    build_id: i64,
    job_id: i64,
    section_id: i64,
    name: String,
    status: String,
    output: String,
    output_length: i64,
    truncated: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<SectionRow> for JobOutputSection {
    type Error = DbError;

    fn try_from(row: SectionRow) -> DbResult<Self> {
        Ok(JobOutputSection {
            job: JobKey::new(row.project_id, row.build_id, row.job_id),
            section_id: row.section_id,
            name: row.name,
            status: row.status.parse()?,
            output: row.output,
            output_length: row.output_length,
            truncated: row.truncated,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

const SELECT_SECTION: &str = r#"
    SELECT * FROM job_output_sections
    WHERE project_id = $1 AND build_id = $2 AND job_id = $3 AND section_id = $4
"#;

impl PgStore {
    async fn lock_section(
        tx: &mut sqlx::PgConnection,
        job: JobKey,
        section_id: i64,
    ) -> DbResult<JobOutputSection> {
        let row = sqlx::query_as::<_, SectionRow>(&format!("{SELECT_SECTION} FOR UPDATE"))
            .bind(job.project_id)
            .bind(job.build_id)
            .bind(job.job_id)
            .bind(section_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("section {} of job {}", section_id, job)))?;
        row.try_into()
    }

    async fn store_section(
        tx: &mut sqlx::PgConnection,
        section: &JobOutputSection,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE job_output_sections
            SET status = $5, output = $6, output_length = $7, truncated = $8, finished_at = $9
            WHERE project_id = $1 AND build_id = $2 AND job_id = $3 AND section_id = $4
            "#,
        )
        .bind(section.job.project_id)
        .bind(section.job.build_id)
        .bind(section.job.job_id)
        .bind(section.section_id)
        .bind(section.status.as_str())
        .bind(&section.output)
        .bind(section.output_length)
        .bind(section.truncated)
        .bind(section.finished_at)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OutputRepo for PgStore {
    async fn open_section(
        &self,
        job: JobKey,
        name: &str,
        now: DateTime<Utc>,
    ) -> DbResult<JobOutputSection> {
        let mut tx = self.pool().begin().await?;

        let section_id: i64 = sqlx::query_scalar(
            r#"
            UPDATE jobs SET next_section_id = next_section_id + 1
            WHERE project_id = $1 AND build_id = $2 AND job_id = $3
            RETURNING next_section_id
            "#,
        )
        .bind(job.project_id)
        .bind(job.build_id)
        .bind(job.job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", job)))?;

        let section = JobOutputSection::new(job, section_id, name.to_string(), now);
        sqlx::query(
            r#"
            INSERT INTO job_output_sections (project_id, build_id, job_id, section_id, name,
                                             status, output, output_length, truncated,
                                             started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, '', 0, FALSE, $7, NULL)
            "#,
        )
        .bind(job.project_id)
        .bind(job.build_id)
        .bind(job.job_id)
        .bind(section_id)
        .bind(&section.name)
        .bind(section.status.as_str())
        .bind(section.started_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(section)
    }

    async fn append_output(
        &self,
        job: JobKey,
        section_id: i64,
        text: &str,
        max_len: usize,
    ) -> DbResult<usize> {
        let mut tx = self.pool().begin().await?;
        let mut section = Self::lock_section(&mut tx, job, section_id).await?;
        let accepted = section.append(text, max_len)?;
        if accepted > 0 || section.truncated {
            Self::store_section(&mut tx, &section).await?;
        }
        tx.commit().await?;
        Ok(accepted)
    }

    async fn close_section(
        &self,
        job: JobKey,
        section_id: i64,
        status: SectionStatus,
        now: DateTime<Utc>,
    ) -> DbResult<JobOutputSection> {
        let mut tx = self.pool().begin().await?;
        let mut section = Self::lock_section(&mut tx, job, section_id).await?;
        section.close(status, now)?;
        Self::store_section(&mut tx, &section).await?;
        tx.commit().await?;
        Ok(section)
    }

    async fn get_section(&self, job: JobKey, section_id: i64) -> DbResult<JobOutputSection> {
        let row = sqlx::query_as::<_, SectionRow>(SELECT_SECTION)
            .bind(job.project_id)
            .bind(job.build_id)
            .bind(job.job_id)
            .bind(section_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("section {} of job {}", section_id, job)))?;
        row.try_into()
    }

    async fn list_sections(&self, job: JobKey) -> DbResult<Vec<JobOutputSection>> {
        let rows = sqlx::query_as::<_, SectionRow>(
            r#"
            SELECT * FROM job_output_sections
            WHERE project_id = $1 AND build_id = $2 AND job_id = $3
            ORDER BY section_id
            "#,
        )
        .bind(job.project_id)
        .bind(job.build_id)
        .bind(job.job_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(JobOutputSection::try_from).collect()
    }

    async fn purge_output(&self, job: JobKey) -> DbResult<u64> {
        let mut tx = self.pool().begin().await?;

        let touched = sqlx::query(
            r#"
            UPDATE job_output_sections
            SET output = '', output_length = 0
            WHERE project_id = $1 AND build_id = $2 AND job_id = $3 AND output_length > 0
            "#,
        )
        .bind(job.project_id)
        .bind(job.build_id)
        .bind(job.job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // The purge flag is bookkeeping only and does not take part in the
        // job's version stamp.
        sqlx::query(
            r#"
            UPDATE jobs SET output_purged = TRUE
            WHERE project_id = $1 AND build_id = $2 AND job_id = $3
            "#,
        )
        .bind(job.project_id)
        .bind(job.build_id)
        .bind(job.job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(touched)
    }
}
