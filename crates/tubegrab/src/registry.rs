use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::job::{Job, JobId, JobUpdate};
use crate::media::MediaFetcher;
use crate::sanitize::{sanitize, truncate_to_bytes};
use crate::validation::DownloadRequest;

/// Progress reported while a download is still running never reaches 100
const MAX_RUNNING_PROGRESS: u8 = 99;

/// Filename limit of common filesystems, in bytes
const MAX_FILE_NAME_BYTES: usize = 255;

/// Room for the `.part` and `.fNNN` suffixes yt-dlp adds to intermediate files
const TOOL_SUFFIX_HEADROOM: usize = 16;

/// What one sweep pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub files_removed: usize,
    pub jobs_removed: usize,
}

/// In-memory table of download jobs for one server process.
///
/// Every job is advanced by its own background task; handlers only read
/// snapshots or remove finished entries. The map lock is never held across
/// an `.await`.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
    fetcher: Arc<dyn MediaFetcher>,
    downloads_dir: PathBuf,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl JobRegistry {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, downloads_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            fetcher,
            downloads_dir: downloads_dir.into(),
            sweeper: Mutex::new(None),
        })
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn fetcher(&self) -> &Arc<dyn MediaFetcher> {
        &self.fetcher
    }

    /// Register a pending job and start fetching it in the background.
    /// The returned id can be looked up as soon as this returns.
    pub fn start_download(self: &Arc<Self>, request: DownloadRequest) -> JobId {
        let job = Job::new(&request);
        let job_id = job.job_id;
        self.jobs.write().insert(job_id, job);

        info!(
            "Created job {} for {} ({} {})",
            job_id, request.video_id, request.format, request.quality
        );

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.run_job(job_id, request).await;
        });

        job_id
    }

    /// Snapshot of one job
    pub fn get_progress(&self, job_id: JobId) -> Option<Job> {
        self.jobs.read().get(&job_id).cloned()
    }

    /// Snapshots of all jobs, newest first
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn remove(&self, job_id: JobId) -> Option<Job> {
        self.jobs.write().remove(&job_id)
    }

    /// Merge `update` into a job; a job that no longer exists is left alone
    pub(crate) fn update_progress(&self, job_id: JobId, update: JobUpdate) {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&job_id) {
            Some(job) => job.apply(update),
            None => debug!("Ignoring update for removed job {}", job_id),
        }
    }

    async fn run_job(&self, job_id: JobId, request: DownloadRequest) {
        if let Err(e) = tokio::fs::create_dir_all(&self.downloads_dir).await {
            error!(
                "Job {}: failed to create downloads directory {}: {}",
                job_id,
                self.downloads_dir.display(),
                e
            );
            self.update_progress(job_id, JobUpdate::failed("Failed to prepare download directory"));
            return;
        }

        let info = match self.fetcher.get_video_info(&request.video_id).await {
            Ok(info) => info,
            Err(e) => {
                error!("Job {}: metadata fetch failed: {}", job_id, e);
                self.update_progress(job_id, JobUpdate::failed(e.user_message()));
                return;
            }
        };

        let output_path = self.downloads_dir.join(output_file_name(
            job_id,
            &info.title,
            request.format.extension(),
        ));

        info!("Job {}: downloading \"{}\" to {}", job_id, info.title, output_path.display());
        self.update_progress(job_id, JobUpdate::downloading(output_path.clone(), info.title));

        let on_progress = |pct: u8| {
            self.update_progress(job_id, JobUpdate::progress(pct.min(MAX_RUNNING_PROGRESS)));
        };

        match self
            .fetcher
            .download_video(
                &request.video_id,
                request.format,
                request.quality,
                &output_path,
                &on_progress,
            )
            .await
        {
            Ok(result) => {
                info!(
                    "✅ Job {} completed: {} ({} bytes)",
                    job_id,
                    result.file_path.display(),
                    result.file_size
                );
                self.update_progress(job_id, JobUpdate::completed(result.file_size));
            }
            Err(e) => {
                error!("❌ Job {} failed: {}", job_id, e);
                self.update_progress(job_id, JobUpdate::failed(e.user_message()));
            }
        }
    }

    /// Delete files in the downloads directory older than `max_age` and
    /// drop finished jobs that have not changed for `max_age`
    pub async fn sweep_once(&self, max_age: Duration) -> SweepReport {
        let files_removed = match sweep_directory(&self.downloads_dir, max_age).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Sweep of {} failed: {}", self.downloads_dir.display(), e);
                0
            }
        };

        let now = Utc::now();
        let jobs_removed = {
            let mut jobs = self.jobs.write();
            let before = jobs.len();
            jobs.retain(|_, job| {
                let stale = job.status.is_terminal()
                    && (now - job.updated_at).to_std().map_or(false, |age| age > max_age);
                if stale {
                    debug!("Dropping stale {} job {}", job.status, job.job_id);
                }
                !stale
            });
            before - jobs.len()
        };

        if files_removed > 0 || jobs_removed > 0 {
            info!(
                "🧹 Sweep removed {} file(s) and {} job(s)",
                files_removed, jobs_removed
            );
        }

        SweepReport { files_removed, jobs_removed }
    }

    /// Run [`sweep_once`](Self::sweep_once) every `interval` until
    /// [`shutdown`](Self::shutdown) is called or the registry is dropped
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, max_age: Duration) {
        let weak = Arc::downgrade(self);
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.sweep_once(max_age).await;
            }
            debug!("Sweeper stopped");
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        info!(
            "Sweeping {} every {:?} (max age {:?})",
            self.downloads_dir.display(),
            period,
            max_age
        );
    }

    /// Stop the background sweeper
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Sweeper shut down");
        }
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

/// Remove top-level files of `dir` last modified more than `max_age` ago
async fn sweep_directory(dir: &Path, max_age: Duration) -> anyhow::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let dir = dir.to_path_buf();
    let removed = tokio::task::spawn_blocking(move || {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in walkdir::WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(t) => t,
                None => continue,
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= max_age {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => {
                    info!("🗑️  Deleted expired download: {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to delete expired download {}: {}", path.display(), e),
            }
        }
        removed
    })
    .await?;

    Ok(removed)
}

/// `<jobId>_<title>.<ext>`, with the title cut so the whole name and the
/// tool's intermediate files stay within the filesystem's byte limit
fn output_file_name(job_id: JobId, title: &str, extension: &str) -> String {
    let id = job_id.to_string();
    let budget = MAX_FILE_NAME_BYTES - TOOL_SUFFIX_HEADROOM - id.len() - 2 - extension.len();
    let title = sanitize(title);
    format!("{}_{}.{}", id, truncate_to_bytes(&title, budget), extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::job::JobStatus;
    use crate::media::{AvailableFormats, DownloadResult, VideoInfo};
    use crate::validation::{MediaFormat, Quality, VideoId};
    use async_trait::async_trait;
    use filetime::FileTime;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-process stand-in for yt-dlp
    struct FakeFetcher {
        title: String,
        size: usize,
        fail_info: bool,
        fail_download: bool,
        step: Duration,
        downloads: AtomicU32,
    }

    impl FakeFetcher {
        fn ok(title: &str) -> Self {
            Self {
                title: title.to_string(),
                size: 1024,
                fail_info: false,
                fail_download: false,
                step: Duration::from_millis(5),
                downloads: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn get_video_info(&self, video_id: &VideoId) -> Result<VideoInfo, FetchError> {
            if self.fail_info {
                return Err(FetchError::ToolFailed {
                    code: Some(1),
                    stderr: "[youtube] x: Video unavailable".to_string(),
                });
            }
            Ok(VideoInfo {
                id: video_id.to_string(),
                title: self.title.clone(),
                duration_seconds: 212,
                thumbnail_url: String::new(),
                channel_name: "Channel".to_string(),
                view_count: 0,
                available_formats: AvailableFormats::default(),
            })
        }

        async fn download_video(
            &self,
            _video_id: &VideoId,
            _format: MediaFormat,
            _quality: Quality,
            output_path: &Path,
            on_progress: &(dyn Fn(u8) + Send + Sync),
        ) -> Result<DownloadResult, FetchError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            for pct in [10u8, 50, 100] {
                tokio::time::sleep(self.step).await;
                on_progress(pct);
            }
            if self.fail_download {
                return Err(FetchError::Blocked("HTTP Error 403: Forbidden".to_string()));
            }
            tokio::fs::write(output_path, vec![0u8; self.size]).await?;
            Ok(DownloadResult {
                file_path: output_path.to_path_buf(),
                file_size: self.size as u64,
            })
        }
    }

    fn request() -> DownloadRequest {
        DownloadRequest::parse("dQw4w9WgXcQ", "mp4", "720p").unwrap()
    }

    /// Poll until the job is terminal, recording every status seen
    async fn wait_terminal(registry: &JobRegistry, job_id: JobId) -> (Job, Vec<JobStatus>) {
        let mut seen = Vec::new();
        for _ in 0..500 {
            let job = registry.get_progress(job_id).expect("job disappeared");
            if seen.last() != Some(&job.status) {
                seen.push(job.status);
            }
            if job.status.is_terminal() {
                return (job, seen);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    fn rank(status: JobStatus) -> u8 {
        match status {
            JobStatus::Pending => 0,
            JobStatus::Downloading => 1,
            _ => 2,
        }
    }

    #[tokio::test]
    async fn test_job_visible_as_pending_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Arc::new(FakeFetcher::ok("Title")), dir.path());

        let job_id = registry.start_download(request());
        let job = registry.get_progress(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.file_path.is_none());
    }

    #[tokio::test]
    async fn test_download_completes_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Arc::new(FakeFetcher::ok("Never Gonna: Give/You Up")), dir.path());

        let job_id = registry.start_download(request());
        let (job, seen) = wait_terminal(&registry, job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.file_size, Some(1024));
        assert!(job.error.is_none());
        assert!(seen.windows(2).all(|w| rank(w[0]) < rank(w[1])));

        let path = job.file_path.unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("{}_Never Gonna GiveYou Up.mp4", job_id));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_long_non_ascii_title_fits_file_name_limit() {
        let dir = tempfile::tempdir().unwrap();
        let title: String = "日本語のタイトル".repeat(13).chars().take(100).collect();
        let registry = JobRegistry::new(Arc::new(FakeFetcher::ok(&title)), dir.path());

        let job_id = registry.start_download(request());
        let (job, _) = wait_terminal(&registry, job_id).await;

        assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
        assert_eq!(job.title.as_deref(), Some(title.as_str()));
        let path = job.file_path.unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.len() + TOOL_SUFFIX_HEADROOM <= MAX_FILE_NAME_BYTES);
        assert!(name.starts_with(&format!("{}_日本語のタイトル", job_id)));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn test_output_file_name_keeps_short_titles_whole() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(output_file_name(id, "a/b", "mp3"), format!("{}_ab.mp3", id));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_capped_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = FakeFetcher::ok("Slow");
        fetcher.step = Duration::from_millis(20);
        let registry = JobRegistry::new(Arc::new(fetcher), dir.path());

        let job_id = registry.start_download(request());
        let mut last = 0;
        loop {
            let job = registry.get_progress(job_id).unwrap();
            assert!(job.progress >= last);
            if job.status.is_terminal() {
                break;
            }
            assert!(job.progress <= MAX_RUNNING_PROGRESS);
            last = job.progress;
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }

    #[tokio::test]
    async fn test_metadata_failure_fails_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = FakeFetcher::ok("Title");
        fetcher.fail_info = true;
        let fetcher = Arc::new(fetcher);
        let registry = JobRegistry::new(fetcher.clone(), dir.path());

        let job_id = registry.start_download(request());
        let (job, seen) = wait_terminal(&registry, job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(seen, vec![JobStatus::Pending, JobStatus::Failed]);
        assert_eq!(job.error.as_deref(), Some("Video unavailable or removed."));
        assert!(job.file_size.is_none());
        assert!(job.file_path.is_none());
        assert_eq!(fetcher.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_failure_records_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = FakeFetcher::ok("Title");
        fetcher.fail_download = true;
        let registry = JobRegistry::new(Arc::new(fetcher), dir.path());

        let job_id = registry.start_download(request());
        let (job, _) = wait_terminal(&registry, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("403"));
        assert!(job.file_path.is_some());
        assert!(job.file_size.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_same_video_jobs_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Arc::new(FakeFetcher::ok("Same")), dir.path());

        let a = registry.start_download(request());
        let b = registry.start_download(request());
        assert_ne!(a, b);

        let (job_a, _) = wait_terminal(&registry, a).await;
        let (job_b, _) = wait_terminal(&registry, b).await;
        assert_eq!(job_a.status, JobStatus::Completed);
        assert_eq!(job_b.status, JobStatus::Completed);
        assert_ne!(job_a.file_path, job_b.file_path);
        assert_eq!(registry.jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_removed_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Arc::new(FakeFetcher::ok("T")), dir.path());

        assert!(registry.get_progress(uuid::Uuid::new_v4()).is_none());

        let job_id = registry.start_download(request());
        assert!(registry.remove(job_id).is_some());
        registry.update_progress(job_id, JobUpdate::progress(50));
        assert!(registry.get_progress(job_id).is_none());
        assert!(registry.remove(job_id).is_none());
    }

    #[tokio::test]
    async fn test_jobs_listed_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Arc::new(FakeFetcher::ok("T")), dir.path());

        let first = registry.start_download(request());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = registry.start_download(request());

        let ids: Vec<JobId> = registry.jobs().iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![second, first]);
    }

    fn age_file(path: &Path, secs: i64) {
        let then = FileTime::from_unix_time(FileTime::now().unix_seconds() - secs, 0);
        filetime::set_file_mtime(path, then).unwrap();
    }

    #[tokio::test]
    async fn test_sweep_deletes_old_files_and_stale_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Arc::new(FakeFetcher::ok("T")), dir.path());

        let old = dir.path().join("orphan.mp4");
        let fresh = dir.path().join("fresh.mp4");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&fresh, b"new").unwrap();
        age_file(&old, 3600);

        let done = registry.start_download(request());
        wait_terminal(&registry, done).await;
        let running = registry.start_download(request());
        {
            let mut jobs = registry.jobs.write();
            let stale = Utc::now() - chrono::Duration::hours(1);
            jobs.get_mut(&done).unwrap().updated_at = stale;
            jobs.get_mut(&running).unwrap().updated_at = stale;
        }

        let report = registry.sweep_once(Duration::from_secs(60)).await;
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.jobs_removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(registry.get_progress(done).is_none());
        assert!(registry.get_progress(running).is_some());
    }

    #[tokio::test]
    async fn test_sweep_of_missing_directory_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Arc::new(FakeFetcher::ok("T")), dir.path().join("absent"));
        assert_eq!(registry.sweep_once(Duration::ZERO).await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_sweeper_runs_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(Arc::new(FakeFetcher::ok("T")), dir.path());

        let old = dir.path().join("old.mp3");
        std::fs::write(&old, b"x").unwrap();
        age_file(&old, 3600);

        registry.start_sweeper(Duration::from_millis(10), Duration::from_secs(60));
        for _ in 0..200 {
            if !old.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!old.exists());

        registry.shutdown();
        assert!(registry.sweeper.lock().is_none());
    }
}
