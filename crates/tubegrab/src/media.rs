use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::validation::{MediaFormat, Quality, VideoId};

/// Fallback resolutions when the tool reports none
pub const DEFAULT_VIDEO_QUALITIES: &[&str] = &["1080p", "720p", "480p", "360p"];
/// Fallback bitrates when the tool reports none
pub const DEFAULT_AUDIO_QUALITIES: &[&str] = &["320kbps", "256kbps", "192kbps", "128kbps"];

/// Qualities a video can be requested in, best first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableFormats {
    pub video: Vec<String>,
    pub audio: Vec<String>,
}

impl Default for AvailableFormats {
    fn default() -> Self {
        Self {
            video: DEFAULT_VIDEO_QUALITIES.iter().map(|s| s.to_string()).collect(),
            audio: DEFAULT_AUDIO_QUALITIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Metadata of a single video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub duration_seconds: u64,
    pub thumbnail_url: String,
    pub channel_name: String,
    pub view_count: u64,
    pub available_formats: AvailableFormats,
}

/// Outcome of a finished download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub file_size: u64,
}

/// Everything the job registry needs from the media-fetch engine
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Query metadata for a video without downloading it
    async fn get_video_info(&self, video_id: &VideoId) -> Result<VideoInfo, FetchError>;

    /// Download a video to `output_path`; `on_progress` receives
    /// intermediate percentages (0-100) when the tool reports them
    async fn download_video(
        &self,
        video_id: &VideoId,
        format: MediaFormat,
        quality: Quality,
        output_path: &Path,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<DownloadResult, FetchError>;
}
