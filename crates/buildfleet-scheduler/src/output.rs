//! Output aggregation: authenticated, append-only ingestion of job logs
//! and the read side used by operators.

use std::sync::Arc;

use buildfleet_config::OutputSettings;
use buildfleet_core::credential;
use buildfleet_core::event::{Event, Notifier};
use buildfleet_core::id::JobKey;
use buildfleet_core::job::{Job, JobState};
use buildfleet_core::output::{JobOutputSection, SectionStatus};
use buildfleet_db::Store;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{SchedulerError, SchedulerResult};

const PURGE_BATCH: i64 = 100;

/// Check a worker-presented credential against the job's stored hash.
pub(crate) fn authorize(job: &Job, presented: &str) -> SchedulerResult<()> {
    let valid = job
        .credential_hash
        .as_deref()
        .is_some_and(|hash| credential::verify(presented, hash));
    if valid {
        Ok(())
    } else {
        warn!(job = %job.key, state = %job.state, "Rejected worker credential");
        Err(SchedulerError::Unauthorized(format!(
            "credential not valid for job {}",
            job.key
        )))
    }
}

/// Section metadata without the text.
#[derive(Debug, Clone, Serialize)]
pub struct SectionSummary {
    pub section_id: i64,
    pub name: String,
    pub status: SectionStatus,
    pub output_length: i64,
    pub truncated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&JobOutputSection> for SectionSummary {
    fn from(s: &JobOutputSection) -> Self {
        Self {
            section_id: s.section_id,
            name: s.name.clone(),
            status: s.status,
            output_length: s.output_length,
            truncated: s.truncated,
            started_at: s.started_at,
            finished_at: s.finished_at,
        }
    }
}

/// A slice of section output starting at a byte offset.
#[derive(Debug, Clone, Serialize)]
pub struct OutputChunk {
    pub text: String,
    /// Offset to pass on the next read.
    pub next_offset: usize,
    /// The section is closed and everything has been read.
    pub complete: bool,
    /// The job's output was removed by retention.
    pub purged: bool,
}

pub struct OutputAggregator {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    settings: OutputSettings,
}

impl OutputAggregator {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, settings: OutputSettings) -> Self {
        Self {
            store,
            notifier,
            settings,
        }
    }

    async fn authorized_job(&self, key: JobKey, credential: &str) -> SchedulerResult<Job> {
        let job = self.store.get_job(key).await?;
        authorize(&job, credential)?;
        Ok(job)
    }

    /// Open a named section. Returns its id, unique within the job.
    pub async fn open_section(
        &self,
        key: JobKey,
        credential: &str,
        name: &str,
    ) -> SchedulerResult<i64> {
        let job = self.authorized_job(key, credential).await?;
        if job.state != JobState::Running {
            return Err(SchedulerError::InvalidState(format!(
                "job {key} is {}, not running",
                job.state
            )));
        }
        if name.trim().is_empty() {
            return Err(SchedulerError::InvalidState(
                "section name must not be empty".to_string(),
            ));
        }

        let section = self.store.open_section(key, name, Utc::now()).await?;
        debug!(job = %key, section = section.section_id, %name, "Opened output section");
        self.notifier.notify(Event::SectionOpened {
            job: key,
            section_id: section.section_id,
            name: section.name.clone(),
        });
        Ok(section.section_id)
    }

    /// Append to an open section. Returns the number of bytes accepted,
    /// which is less than `text.len()` once the section hits its cap.
    pub async fn append_output(
        &self,
        key: JobKey,
        credential: &str,
        section_id: i64,
        text: &str,
    ) -> SchedulerResult<usize> {
        self.authorized_job(key, credential).await?;
        let accepted = self
            .store
            .append_output(key, section_id, text, self.settings.max_section_bytes)
            .await?;
        if accepted < text.len() {
            warn!(job = %key, section = section_id, dropped = text.len() - accepted, "Section output truncated");
        }
        Ok(accepted)
    }

    pub async fn close_section(
        &self,
        key: JobKey,
        credential: &str,
        section_id: i64,
        status: SectionStatus,
    ) -> SchedulerResult<SectionSummary> {
        self.authorized_job(key, credential).await?;
        if status == SectionStatus::Running {
            return Err(SchedulerError::InvalidState(
                "a section cannot be closed as running".to_string(),
            ));
        }
        let section = self
            .store
            .close_section(key, section_id, status, Utc::now())
            .await?;
        debug!(job = %key, section = section_id, status = section.status.as_str(), "Closed output section");
        self.notifier.notify(Event::SectionClosed {
            job: key,
            section_id,
        });
        Ok(SectionSummary::from(&section))
    }

    pub async fn read_sections(&self, key: JobKey) -> SchedulerResult<Vec<SectionSummary>> {
        // Surface NotFound for unknown jobs rather than an empty list.
        self.store.get_job(key).await?;
        let sections = self.store.list_sections(key).await?;
        Ok(sections.iter().map(SectionSummary::from).collect())
    }

    /// Read a section's text from byte `offset` onwards.
    pub async fn read_output(
        &self,
        key: JobKey,
        section_id: i64,
        offset: usize,
    ) -> SchedulerResult<OutputChunk> {
        let job = self.store.get_job(key).await?;
        let section = self.store.get_section(key, section_id).await?;

        let len = section.output.len();
        let start = offset.min(len);
        let text = section.output.get(start..).ok_or_else(|| {
            SchedulerError::InvalidState(format!("offset {offset} is not on a character boundary"))
        })?;

        Ok(OutputChunk {
            text: text.to_string(),
            next_offset: len,
            complete: !section.is_open(),
            purged: job.output_purged,
        })
    }

    /// Drop output text of jobs finished longer ago than the retention period.
    /// Returns the number of jobs purged.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let retention =
            Duration::from_std(self.settings.retention).unwrap_or_else(|_| Duration::days(36_500));
        let cutoff = now - retention;

        let mut purged = 0;
        loop {
            let batch = self
                .store
                .list_unpurged_finished_before(cutoff, PURGE_BATCH)
                .await?;
            if batch.is_empty() {
                break;
            }
            let full = batch.len() as i64 == PURGE_BATCH;
            for job in batch {
                let sections = self.store.purge_output(job.key).await?;
                debug!(job = %job.key, sections, "Purged job output");
                purged += 1;
            }
            if !full {
                break;
            }
        }

        if purged > 0 {
            info!(jobs = purged, %cutoff, "Purged expired job output");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use buildfleet_core::job::JobOutcome;

    #[tokio::test]
    async fn test_sections_are_ordered_and_numbered_per_job() {
        let h = Harness::new();
        let (key, credential, _) = h.running_job().await;

        let first = h.output.open_section(key, &credential, "checkout").await.unwrap();
        h.output
            .append_output(key, &credential, first, "cloning\n")
            .await
            .unwrap();
        h.output
            .append_output(key, &credential, first, "done\n")
            .await
            .unwrap();
        h.output
            .close_section(key, &credential, first, SectionStatus::Succeeded)
            .await
            .unwrap();
        let second = h.output.open_section(key, &credential, "test").await.unwrap();
        assert_eq!((first, second), (1, 2));

        let sections = h.output.read_sections(key).await.unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "checkout");
        assert_eq!(sections[0].status, SectionStatus::Succeeded);
        assert_eq!(sections[1].status, SectionStatus::Running);

        let chunk = h.output.read_output(key, first, 0).await.unwrap();
        assert_eq!(chunk.text, "cloning\ndone\n");
        assert!(chunk.complete);

        let tail = h.output.read_output(key, first, 8).await.unwrap();
        assert_eq!(tail.text, "done\n");
        assert_eq!(tail.next_offset, 13);
    }

    #[tokio::test]
    async fn test_concurrent_sections_keep_their_own_text() {
        let h = Harness::new();
        let (key, credential, _) = h.running_job().await;

        let unit = h.output.open_section(key, &credential, "unit").await.unwrap();
        let lint = h.output.open_section(key, &credential, "lint").await.unwrap();
        for (section, text) in [(unit, "a1\n"), (lint, "b1\n"), (unit, "a2\n"), (lint, "b2\n")] {
            h.output
                .append_output(key, &credential, section, text)
                .await
                .unwrap();
        }

        let a = h.output.read_output(key, unit, 0).await.unwrap();
        let b = h.output.read_output(key, lint, 0).await.unwrap();
        assert_eq!(a.text, "a1\na2\n");
        assert_eq!(b.text, "b1\nb2\n");
        assert!(!a.complete);
        assert_eq!(a.next_offset, 6);
    }

    #[tokio::test]
    async fn test_bad_credential_is_rejected_without_writing() {
        let h = Harness::new();
        let (key, credential, _) = h.running_job().await;
        let section = h.output.open_section(key, &credential, "build").await.unwrap();

        let err = h
            .output
            .append_output(key, "not-the-credential", section, "forged\n")
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Unauthorized(_)));
        let chunk = h.output.read_output(key, section, 0).await.unwrap();
        assert!(chunk.text.is_empty());
    }

    #[tokio::test]
    async fn test_append_to_closed_section_fails() {
        let h = Harness::new();
        let (key, credential, _) = h.running_job().await;
        let section = h.output.open_section(key, &credential, "build").await.unwrap();
        h.output
            .close_section(key, &credential, section, SectionStatus::Failed)
            .await
            .unwrap();

        let err = h
            .output
            .append_output(key, &credential, section, "late\n")
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_credential_stops_working_after_completion() {
        let h = Harness::new();
        let (key, credential, _) = h.running_job().await;
        h.scheduler
            .complete_job(
                key,
                &credential,
                JobOutcome {
                    success: true,
                    error: None,
                },
            )
            .await
            .unwrap();

        let err = h
            .output
            .open_section(key, &credential, "after")
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_section_output_is_capped() {
        let h = Harness::with_settings(|c| c.output.max_section_bytes = 8);
        let (key, credential, _) = h.running_job().await;
        let section = h.output.open_section(key, &credential, "noisy").await.unwrap();

        let accepted = h
            .output
            .append_output(key, &credential, section, "0123456789")
            .await
            .unwrap();
        assert_eq!(accepted, 8);
        let sections = h.output.read_sections(key).await.unwrap();
        assert!(sections[0].truncated);
        assert_eq!(sections[0].output_length, 8);
    }

    #[tokio::test]
    async fn test_purge_after_retention() {
        let h = Harness::with_settings(|c| {
            c.output.retention = std::time::Duration::from_secs(3600);
        });
        let (key, credential, _) = h.running_job().await;
        let section = h.output.open_section(key, &credential, "build").await.unwrap();
        h.output
            .append_output(key, &credential, section, "lots of log\n")
            .await
            .unwrap();
        h.scheduler
            .complete_job(
                key,
                &credential,
                JobOutcome {
                    success: true,
                    error: None,
                },
            )
            .await
            .unwrap();

        // Still within retention.
        assert_eq!(h.output.purge_expired(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + Duration::hours(2);
        assert_eq!(h.output.purge_expired(later).await.unwrap(), 1);
        assert_eq!(h.output.purge_expired(later).await.unwrap(), 0);

        let chunk = h.output.read_output(key, section, 0).await.unwrap();
        assert!(chunk.text.is_empty());
        assert!(chunk.purged);
        let sections = h.output.read_sections(key).await.unwrap();
        assert_eq!(sections[0].name, "build");
        assert_eq!(sections[0].output_length, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let h = Harness::new();
        let err = h
            .output
            .read_sections(JobKey::new(7, 7, 7))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }
}
