//! Streamed job output, split into named sections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobKey;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Running,
    Succeeded,
    Failed,
}

impl SectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionStatus::Running => "running",
            SectionStatus::Succeeded => "succeeded",
            SectionStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SectionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(SectionStatus::Running),
            "succeeded" => Ok(SectionStatus::Succeeded),
            "failed" => Ok(SectionStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown section status: {other}"
            ))),
        }
    }
}

/// One named phase of a job's log, e.g. a single build step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutputSection {
    pub job: JobKey,
    pub section_id: i64,
    pub name: String,
    pub status: SectionStatus,
    pub output: String,
    /// Byte length of `output`, tracked separately so it can be read without the text.
    pub output_length: i64,
    /// Set when appends were clipped at the per-section cap.
    pub truncated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobOutputSection {
    pub fn new(job: JobKey, section_id: i64, name: String, now: DateTime<Utc>) -> Self {
        Self {
            job,
            section_id,
            name,
            status: SectionStatus::Running,
            output: String::new(),
            output_length: 0,
            truncated: false,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == SectionStatus::Running
    }

    /// Append `text`, clipping at `max_len` bytes (on a char boundary).
    ///
    /// Returns the number of bytes accepted.
    pub fn append(&mut self, text: &str, max_len: usize) -> Result<usize> {
        if !self.is_open() {
            return Err(Error::InvalidTransition(format!(
                "section {} of job {} is closed",
                self.section_id, self.job
            )));
        }

        let room = max_len.saturating_sub(self.output.len());
        let accepted = if text.len() <= room {
            text
        } else {
            self.truncated = true;
            let mut cut = room;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            &text[..cut]
        };

        self.output.push_str(accepted);
        self.output_length = self.output.len() as i64;
        Ok(accepted.len())
    }

    pub fn close(&mut self, status: SectionStatus, now: DateTime<Utc>) -> Result<()> {
        if status == SectionStatus::Running {
            return Err(Error::InvalidInput(
                "a section cannot be closed as running".to_string(),
            ));
        }
        if !self.is_open() {
            return Err(Error::InvalidTransition(format!(
                "section {} of job {} is already closed",
                self.section_id, self.job
            )));
        }
        self.status = status;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Drop the bulk text. Name, status and timings are kept.
    pub fn purge(&mut self) {
        self.output.clear();
        self.output_length = 0;
    }
}
