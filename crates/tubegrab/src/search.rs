use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::media::{AvailableFormats, MediaFetcher};
use crate::validation::VideoId;
use crate::ytdlp::YtDlp;

/// Best match for a search query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    pub channel: String,
    /// `m:ss` or `h:mm:ss`
    pub duration: String,
    pub url: String,
    pub available_formats: AvailableFormats,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Search for `query`; at most one result is returned
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct RawSearchEntry {
    id: String,
    title: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: String,
}

/// Format a duration in seconds as `m:ss`, or `h:mm:ss` past one hour
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

/// First parseable entry of `--flat-playlist --dump-json` output
fn parse_search_output(stdout: &str) -> Option<SearchResult> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|line| match serde_json::from_str::<RawSearchEntry>(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unparseable search line: {}", e);
                None
            }
        })
        .map(|entry| {
            let thumbnail = entry
                .thumbnails
                .last()
                .map(|t| t.url.clone())
                .unwrap_or_else(|| format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", entry.id));
            let duration = entry
                .duration
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| d.round() as u64)
                .unwrap_or(0);
            SearchResult {
                url: format!("https://www.youtube.com/watch?v={}", entry.id),
                title: entry.title.unwrap_or_else(|| "Unknown".to_string()),
                thumbnail,
                channel: entry
                    .uploader
                    .or(entry.channel)
                    .unwrap_or_else(|| "Unknown".to_string()),
                duration: format_duration(duration),
                available_formats: AvailableFormats::default(),
                id: entry.id,
            }
        })
}

/// Search backed by yt-dlp's `ytsearch1:` extractor
pub struct YtDlpSearch {
    ytdlp: Arc<YtDlp>,
}

impl YtDlpSearch {
    pub fn new(ytdlp: Arc<YtDlp>) -> Self {
        Self { ytdlp }
    }

    async fn run_search(&self, query: &str) -> Result<Option<SearchResult>, FetchError> {
        let args = vec![
            format!("ytsearch1:{}", query),
            "--dump-json".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        let output = self.ytdlp.run_tool(&args, None).await?;
        if !output.status.success() {
            return Err(FetchError::from_tool_output(output.status.code(), &output.stderr));
        }
        Ok(parse_search_output(&output.stdout))
    }
}

#[async_trait]
impl SearchProvider for YtDlpSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, FetchError> {
        let what = format!("Search for \"{}\"", query);
        let found = self
            .ytdlp
            .retry_policy()
            .run(&what, |_| self.run_search(query))
            .await?;

        let Some(mut result) = found else {
            return Ok(Vec::new());
        };

        // Flat search output lacks formats
        match VideoId::parse(&result.id) {
            Ok(id) => match self.ytdlp.get_video_info(&id).await {
                Ok(info) => result.available_formats = info.available_formats,
                Err(e) => warn!("Could not fetch formats for {}: {}", result.id, e),
            },
            Err(_) => debug!("Search result id {} is not a video id", result.id),
        }

        Ok(vec![result])
    }
}
