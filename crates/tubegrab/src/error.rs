use std::path::PathBuf;
use thiserror::Error;

/// Failures of the media fetch adapter
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("yt-dlp executable not found: {0}")]
    ToolNotFound(PathBuf),

    #[error("failed to run yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("request blocked by the video host: {0}")]
    Blocked(String),

    #[error("rate limited by the video host: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("yt-dlp failed (code={code:?}): {stderr}")]
    ToolFailed { code: Option<i32>, stderr: String },

    #[error("malformed video metadata: {0}")]
    Metadata(String),

    #[error("yt-dlp exited successfully but produced no file at {0}")]
    MissingOutput(PathBuf),

    #[error("file size {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Classify a non-zero yt-dlp exit by its diagnostic output
    pub fn from_tool_output(code: Option<i32>, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let detail = last_error_line(stderr);

        if lower.contains("http error 429") || lower.contains("too many requests") {
            FetchError::RateLimited(detail)
        } else if lower.contains("http error 403") || lower.contains("forbidden") {
            FetchError::Blocked(detail)
        } else if lower.contains("timed out")
            || lower.contains("connection reset")
            || lower.contains("temporary failure in name resolution")
            || lower.contains("connection refused")
        {
            FetchError::Network(detail)
        } else {
            FetchError::ToolFailed { code, stderr: detail }
        }
    }

    /// Whether retrying the same invocation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Blocked(_) | FetchError::RateLimited(_) | FetchError::Network(_)
        )
    }

    /// Message suitable for showing to the person who requested the download
    pub fn user_message(&self) -> String {
        match self {
            FetchError::ToolNotFound(_) | FetchError::Spawn(_) => {
                "Downloader is not available on the server".to_string()
            }
            FetchError::Blocked(_) => {
                "The video host blocked the request (403). Try again later.".to_string()
            }
            FetchError::RateLimited(_) => {
                "The video host is rate limiting requests (429). Try again later.".to_string()
            }
            FetchError::Network(_) => {
                "Connection to the video host failed. Try again later.".to_string()
            }
            FetchError::ToolFailed { stderr, .. } => translate_tool_error(stderr),
            FetchError::Metadata(_) => "Failed to parse video information".to_string(),
            FetchError::MissingOutput(_) => "Download finished without producing a file".to_string(),
            FetchError::TooLarge { limit, .. } => {
                format!("File size exceeds {}MB limit", limit / (1024 * 1024))
            }
            FetchError::Io(_) => "Failed to verify download".to_string(),
        }
    }
}

fn translate_tool_error(stderr: &str) -> String {
    let lower = stderr.to_lowercase();

    if lower.contains("private video") {
        return "This video is private.".to_string();
    }
    if lower.contains("sign in to confirm") || lower.contains("login required") {
        return "This video requires signing in.".to_string();
    }
    if lower.contains("video unavailable") || lower.contains("not available") {
        return "Video unavailable or removed.".to_string();
    }
    if lower.contains("ffmpeg") && (lower.contains("not found") || lower.contains("no such file")) {
        return "FFmpeg not found on the server.".to_string();
    }
    if stderr.trim().is_empty() {
        return "Download failed".to_string();
    }
    stderr.trim().to_string()
}

/// Last `ERROR:` line of yt-dlp's stderr without its prefix, or the trimmed tail
fn last_error_line(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.to_lowercase().starts_with("error"));

    match line {
        Some(l) => l
            .strip_prefix("ERROR: ")
            .or_else(|| l.strip_prefix("ERROR:"))
            .unwrap_or(l)
            .trim()
            .to_string(),
        None => {
            let trimmed = stderr.trim();
            trimmed.chars().take(300).collect()
        }
    }
}
