use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::{DownloadRequest, MediaFormat};

pub type JobId = Uuid;

/// Lifecycle stage of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Downloading => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Transitions only move forward; a terminal job never changes status
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A download job as tracked by the registry and reported to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_size: Option<u64>,
    pub video_id: String,
    pub format: MediaFormat,
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Fresh pending job for a validated request
    pub fn new(request: &DownloadRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            file_path: None,
            file_size: None,
            video_id: request.video_id.to_string(),
            format: request.format,
            quality: request.quality.to_string(),
            title: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge `update` into this job. Backward status transitions, a second
    /// `file_path` and lower progress values are ignored.
    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(status) = update.status {
            if self.status != status {
                if !self.status.can_transition_to(status) {
                    return;
                }
                self.status = status;
            }
        }

        if let Some(progress) = update.progress {
            let progress = progress.min(100);
            if progress > self.progress {
                self.progress = progress;
            }
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if self.file_path.is_none() {
            self.file_path = update.file_path;
        }
        if update.file_size.is_some() {
            self.file_size = update.file_size;
        }
        if update.title.is_some() {
            self.title = update.title;
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update merged into a stored job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub title: Option<String>,
}

impl JobUpdate {
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn downloading(file_path: PathBuf, title: String) -> Self {
        Self {
            status: Some(JobStatus::Downloading),
            progress: Some(0),
            file_path: Some(file_path),
            title: Some(title),
            ..Default::default()
        }
    }

    pub fn completed(file_size: u64) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            file_size: Some(file_size),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
