//! Polling and result-delivery protocol on top of the job registry.
//!
//! A client creates a job, polls its status until it is terminal, then
//! fetches the result exactly once. A completed result hands over the file
//! bytes and deletes the file; a failed result is reported once and then
//! forgotten.

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::job::{Job, JobId, JobStatus};
use crate::registry::JobRegistry;
use crate::sanitize::{ensure_extension, sanitize};
use crate::validation::{DownloadRequest, MediaFormat, ValidationError};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A finished download handed to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredFile {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// What fetching a job's result produced
#[derive(Debug)]
pub enum ResultOutcome {
    NotFound,
    /// Still pending or downloading; keep polling
    InProgress(Job),
    Failed(Job),
    Completed(DeliveredFile),
}

/// Transport-independent download service
#[derive(Clone)]
pub struct DownloadService {
    registry: Arc<JobRegistry>,
}

impl DownloadService {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Validate a request and start a job for it
    pub fn create(&self, video_id: &str, format: &str, quality: &str) -> Result<JobId, ValidationError> {
        let request = DownloadRequest::parse(video_id, format, quality)?;
        Ok(self.registry.start_download(request))
    }

    /// Current snapshot of a job; malformed ids are simply unknown
    pub fn status(&self, job_id: &str) -> Option<Job> {
        let id = parse_job_id(job_id)?;
        self.registry.get_progress(id)
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.registry.jobs()
    }

    /// Fetch a job's result, consuming the job when it is terminal
    pub async fn result(&self, job_id: &str) -> Result<ResultOutcome, ProtocolError> {
        let Some(id) = parse_job_id(job_id) else {
            return Ok(ResultOutcome::NotFound);
        };
        let Some(job) = self.registry.get_progress(id) else {
            return Ok(ResultOutcome::NotFound);
        };

        match job.status {
            JobStatus::Pending | JobStatus::Downloading => Ok(ResultOutcome::InProgress(job)),
            JobStatus::Failed => {
                self.registry.remove(id);
                info!("Job {} failure delivered and removed", id);
                Ok(ResultOutcome::Failed(job))
            }
            JobStatus::Completed => {
                let Some(path) = job.file_path.clone() else {
                    warn!("Completed job {} has no file path", id);
                    self.registry.remove(id);
                    return Ok(ResultOutcome::NotFound);
                };

                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!("File for job {} is gone: {}", id, path.display());
                        self.registry.remove(id);
                        return Ok(ResultOutcome::NotFound);
                    }
                    Err(e) => {
                        return Err(ProtocolError::Read {
                            path: path.display().to_string(),
                            source: e,
                        })
                    }
                };

                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to delete delivered file {}: {}", path.display(), e);
                }
                self.registry.remove(id);

                let file_name = client_file_name(&path, id, job.format);
                info!("Job {} delivered as \"{}\" ({} bytes)", id, file_name, bytes.len());

                Ok(ResultOutcome::Completed(DeliveredFile {
                    content_type: content_type_for(&path),
                    file_name,
                    bytes,
                }))
            }
        }
    }
}

fn parse_job_id(raw: &str) -> Option<JobId> {
    Uuid::parse_str(raw.trim()).ok()
}

/// File name offered to the client: stored name without the job id prefix
fn client_file_name(path: &Path, job_id: JobId, format: MediaFormat) -> String {
    let stored = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let prefix = format!("{}_", job_id);
    let name = stored.strip_prefix(&prefix).unwrap_or(stored);
    ensure_extension(&sanitize(name), format)
}

/// MIME type derived from a file's extension
pub fn content_type_for(path: &Path) -> &'static str {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(MediaFormat::from_extension)
        .map(|f| f.content_type())
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}
