use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static VIDEO_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());
static VIDEO_QUALITY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)p(\d+)?$").unwrap());
static AUDIO_QUALITY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)kbps$").unwrap());

/// Maximum accepted search query length, in characters
pub const MAX_QUERY_LEN: usize = 200;

/// Reasons a request is rejected before any job is created
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid video ID: expected 11 characters of [A-Za-z0-9_-]")]
    VideoId,
    #[error("Invalid format '{0}': expected mp3 or mp4")]
    Format(String),
    #[error("Invalid video quality '{0}'. Expected format like: 360p, 720p, 1080p")]
    VideoQuality(String),
    #[error("Invalid audio quality '{0}'. Expected format like: 128kbps, 192kbps, 320kbps")]
    AudioQuality(String),
    #[error("Search query cannot be empty")]
    EmptyQuery,
    #[error("Search query too long (max {MAX_QUERY_LEN} characters)")]
    QueryTooLong,
}

/// Container a download is delivered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Mp3,
    Mp4,
}

impl MediaFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "mp3",
            MediaFormat::Mp4 => "mp4",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "audio/mpeg",
            MediaFormat::Mp4 => "video/mp4",
        }
    }

    /// Format matching a file extension, case-insensitive
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => Some(MediaFormat::Mp3),
            "mp4" => Some(MediaFormat::Mp4),
            _ => None,
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for MediaFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mp3" => Ok(MediaFormat::Mp3),
            "mp4" => Ok(MediaFormat::Mp4),
            other => Err(ValidationError::Format(other.to_string())),
        }
    }
}

/// An 11-character video host id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VideoId(String);

impl VideoId {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if VIDEO_ID_RE.is_match(raw) {
            Ok(VideoId(raw.to_string()))
        } else {
            Err(ValidationError::VideoId)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl TryFrom<String> for VideoId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        VideoId::parse(&value)
    }
}

impl From<VideoId> for String {
    fn from(id: VideoId) -> Self {
        id.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Requested quality, already checked against the format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    /// Nominal resolution height with an optional frame rate, e.g. `720p60`
    Video { height: u32, fps: Option<u32> },
    /// Audio bitrate in kbps, e.g. `192kbps`
    Audio { kbps: u32 },
}

impl Quality {
    /// Parse a quality string in the syntax `format` expects
    pub fn parse(raw: &str, format: MediaFormat) -> Result<Self, ValidationError> {
        match format {
            MediaFormat::Mp4 => {
                let caps = VIDEO_QUALITY_RE
                    .captures(raw)
                    .ok_or_else(|| ValidationError::VideoQuality(raw.to_string()))?;
                let height = caps[1]
                    .parse::<u32>()
                    .map_err(|_| ValidationError::VideoQuality(raw.to_string()))?;
                let fps = match caps.get(2) {
                    Some(m) => Some(
                        m.as_str()
                            .parse::<u32>()
                            .map_err(|_| ValidationError::VideoQuality(raw.to_string()))?,
                    ),
                    None => None,
                };
                Ok(Quality::Video { height, fps })
            }
            MediaFormat::Mp3 => {
                let caps = AUDIO_QUALITY_RE
                    .captures(raw)
                    .ok_or_else(|| ValidationError::AudioQuality(raw.to_string()))?;
                let kbps = caps[1]
                    .parse::<u32>()
                    .map_err(|_| ValidationError::AudioQuality(raw.to_string()))?;
                Ok(Quality::Audio { kbps })
            }
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Video { height, fps: Some(fps) } => write!(f, "{}p{}", height, fps),
            Quality::Video { height, fps: None } => write!(f, "{}p", height),
            Quality::Audio { kbps } => write!(f, "{}kbps", kbps),
        }
    }
}

/// A download request that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub video_id: VideoId,
    pub format: MediaFormat,
    pub quality: Quality,
}

impl DownloadRequest {
    /// Validate raw request fields; the quality syntax depends on the format
    pub fn parse(video_id: &str, format: &str, quality: &str) -> Result<Self, ValidationError> {
        let video_id = VideoId::parse(video_id)?;
        let format = format.parse::<MediaFormat>()?;
        let quality = Quality::parse(quality, format)?;
        Ok(DownloadRequest { video_id, format, quality })
    }
}

/// Trim a search query and check its length
pub fn parse_search_query(raw: &str) -> Result<String, ValidationError> {
    let query = raw.trim();
    if query.is_empty() {
        return Err(ValidationError::EmptyQuery);
    }
    if query.chars().count() > MAX_QUERY_LEN {
        return Err(ValidationError::QueryTooLong);
    }
    Ok(query.to_string())
}
