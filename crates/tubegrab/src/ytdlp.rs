use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::ServerConfig;
use crate::error::FetchError;
use crate::media::{AvailableFormats, DownloadResult, MediaFetcher, VideoInfo};
use crate::retry::RetryPolicy;
use crate::validation::{MediaFormat, Quality, VideoId};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

/// Nominal height -> yt-dlp format selector. Every entry falls back to the
/// muxed 360p stream (18), which YouTube serves for nearly every video.
const VIDEO_SELECTORS: &[(u32, &str)] = &[
    (144, "160+140/18"),
    (240, "133+140/18"),
    (360, "18"),
    (480, "135+140/18"),
    (720, "298+140/136+140/22/18"),
    (1080, "299+140/137+140/22/18"),
    (1440, "308+140/271+140/22/18"),
    (2160, "315+140/313+140/22/18"),
];

/// Selector used when no table entry applies
pub const SAFE_VIDEO_SELECTOR: &str = "18";

const AUDIO_SELECTOR: &str = "bestaudio/140";

/// Bitrates (kbps) the mp3 extractor is asked for
const AUDIO_BITRATES: &[u32] = &[64, 96, 128, 160, 192, 256, 320];

const DEFAULT_AUDIO_BITRATE: u32 = 192;

const PROGRESS_PREFIX: &str = "download:";

/// Captured result of one yt-dlp run
#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Concrete stream selection for one download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSelection {
    pub selector: &'static str,
    pub args: Vec<String>,
}

/// Map a requested format and quality onto yt-dlp arguments
pub fn select_format(format: MediaFormat, quality: Quality) -> FormatSelection {
    match format {
        MediaFormat::Mp4 => {
            let selector = match quality {
                Quality::Video { height, .. } => video_selector(height),
                Quality::Audio { .. } => SAFE_VIDEO_SELECTOR,
            };
            FormatSelection {
                selector,
                args: vec!["--merge-output-format".to_string(), "mp4".to_string()],
            }
        }
        MediaFormat::Mp3 => {
            let bitrate = match quality {
                Quality::Audio { kbps } => audio_bitrate(kbps),
                Quality::Video { .. } => DEFAULT_AUDIO_BITRATE,
            };
            FormatSelection {
                selector: AUDIO_SELECTOR,
                args: vec![
                    "-x".to_string(),
                    "--audio-format".to_string(),
                    "mp3".to_string(),
                    "--audio-quality".to_string(),
                    format!("{}K", bitrate),
                ],
            }
        }
    }
}

/// Largest table entry not above `height`, or the smallest entry
fn video_selector(height: u32) -> &'static str {
    VIDEO_SELECTORS
        .iter()
        .rev()
        .find(|(h, _)| *h <= height)
        .or_else(|| VIDEO_SELECTORS.first())
        .map(|(_, sel)| *sel)
        .unwrap_or(SAFE_VIDEO_SELECTOR)
}

fn audio_bitrate(kbps: u32) -> u32 {
    AUDIO_BITRATES
        .iter()
        .rev()
        .find(|b| **b <= kbps)
        .or_else(|| AUDIO_BITRATES.first())
        .copied()
        .unwrap_or(DEFAULT_AUDIO_BITRATE)
}

#[derive(Debug, Deserialize)]
struct RawVideoInfo {
    id: String,
    title: String,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<u64>,
    #[serde(default)]
    formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    height: Option<u32>,
    abr: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
}

impl RawFormat {
    fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(c) if c != "none")
    }

    fn has_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(c) if c != "none")
    }
}

/// Decode `yt-dlp --dump-json` output into [`VideoInfo`]
pub fn parse_video_info(json: &str) -> Result<VideoInfo, FetchError> {
    let raw: RawVideoInfo =
        serde_json::from_str(json).map_err(|e| FetchError::Metadata(e.to_string()))?;
    let formats = raw.formats.unwrap_or_default();

    let mut heights: Vec<u32> = formats
        .iter()
        .filter(|f| f.has_video())
        .filter_map(|f| f.height)
        .filter(|h| *h > 0)
        .collect();
    // Stable sort keeps first-seen order among equal keys
    heights.sort_by(|a, b| b.cmp(a));
    heights.dedup();

    let mut bitrates: Vec<u32> = formats
        .iter()
        .filter(|f| f.has_audio() && !f.has_video())
        .filter_map(|f| f.abr)
        .filter(|abr| abr.is_finite() && *abr > 0.0)
        .map(|abr| abr.round() as u32)
        .collect();
    bitrates.sort_by(|a, b| b.cmp(a));
    bitrates.dedup();

    let defaults = AvailableFormats::default();
    let available_formats = AvailableFormats {
        video: if heights.is_empty() {
            defaults.video
        } else {
            heights.iter().map(|h| format!("{}p", h)).collect()
        },
        audio: if bitrates.is_empty() {
            defaults.audio
        } else {
            bitrates.iter().map(|b| format!("{}kbps", b)).collect()
        },
    };

    Ok(VideoInfo {
        id: raw.id,
        title: raw.title,
        duration_seconds: raw.duration.filter(|d| d.is_finite() && *d > 0.0).map(|d| d.round() as u64).unwrap_or(0),
        thumbnail_url: raw.thumbnail.unwrap_or_default(),
        channel_name: raw
            .uploader
            .or(raw.channel)
            .unwrap_or_else(|| "Unknown".to_string()),
        view_count: raw.view_count.unwrap_or(0),
        available_formats,
    })
}

/// Percentage from a `download:  42.5%` progress line
pub fn parse_progress_line(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let pct = rest.trim().trim_end_matches('%').trim().parse::<f64>().ok()?;
    if !pct.is_finite() {
        return None;
    }
    Some(pct.clamp(0.0, 100.0) as u8)
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Media fetcher backed by the yt-dlp command-line tool
#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: PathBuf,
    ffmpeg_location: Option<PathBuf>,
    max_file_size: u64,
    retry: RetryPolicy,
}

impl YtDlp {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            ffmpeg_location: None,
            max_file_size: ServerConfig::default_config().max_file_size_bytes(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            bin: cfg.ytdlp_bin.clone(),
            ffmpeg_location: cfg.ffmpeg_location.clone(),
            max_file_size: cfg.max_file_size_bytes(),
            retry: RetryPolicy::new(cfg.max_retries, cfg.retry_base_delay()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Installed yt-dlp version, used as an availability check on startup
    pub async fn version(&self) -> Result<String, FetchError> {
        let output = self.run_tool(&["--version".to_string()], None).await?;
        if !output.status.success() {
            return Err(FetchError::from_tool_output(output.status.code(), &output.stderr));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Arguments for downloading `video_id` to `output_path`
    pub fn build_download_args(
        &self,
        video_id: &VideoId,
        format: MediaFormat,
        quality: Quality,
        output_path: &Path,
        attempt: u32,
    ) -> Vec<String> {
        let selection = select_format(format, quality);

        let mut args = vec![
            video_id.watch_url(),
            "-o".to_string(),
            output_path.to_string_lossy().to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            // Keep the local write time; the sweep ages files by mtime
            "--no-mtime".to_string(),
            "--progress-template".to_string(),
            format!("{}%(progress._percent_str)s", PROGRESS_PREFIX),
            "--user-agent".to_string(),
            random_user_agent().to_string(),
        ];

        if let Some(ref ffmpeg) = self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().to_string());
        }

        // Slow down after the host has already pushed back once
        if attempt > 0 {
            args.push("--sleep-requests".to_string());
            args.push("1".to_string());
        }

        args.push("-f".to_string());
        args.push(selection.selector.to_string());
        args.extend(selection.args);
        args
    }

    /// Run yt-dlp to completion, feeding every output line to `on_line`
    pub(crate) async fn run_tool(
        &self,
        args: &[String],
        on_line: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> Result<ToolOutput, FetchError> {
        debug!("Executing yt-dlp: {} {}", self.bin.display(), args.join(" "));

        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FetchError::ToolNotFound(self.bin.clone())
            } else {
                FetchError::Spawn(e)
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            FetchError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "stdout not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            FetchError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "stderr not captured"))
        })?;

        let read_stdout = async {
            let mut collected = Vec::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(cb) = on_line {
                    cb(&line);
                }
                collected.push(line);
            }
            collected.join("\n")
        };

        let read_stderr = async {
            let mut collected = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(cb) = on_line {
                    cb(&line);
                }
                collected.push(line);
            }
            collected.join("\n")
        };

        let (stdout, stderr, status) = tokio::join!(read_stdout, read_stderr, child.wait());
        let status = status?;

        debug!(
            "yt-dlp exit code: {:?}, stdout length: {}, stderr length: {}",
            status.code(),
            stdout.len(),
            stderr.len()
        );

        Ok(ToolOutput { status, stdout, stderr })
    }

    async fn fetch_video_info(&self, video_id: &VideoId) -> Result<VideoInfo, FetchError> {
        let args = vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--user-agent".to_string(),
            random_user_agent().to_string(),
            video_id.watch_url(),
        ];

        let output = self.run_tool(&args, None).await?;
        if !output.status.success() {
            warn!(
                "Metadata fetch for {} failed (exit code {:?}): {}",
                video_id,
                output.status.code(),
                output.stderr
            );
            return Err(FetchError::from_tool_output(output.status.code(), &output.stderr));
        }

        parse_video_info(&output.stdout)
    }

    async fn perform_download(
        &self,
        video_id: &VideoId,
        format: MediaFormat,
        quality: Quality,
        output_path: &Path,
        attempt: u32,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<DownloadResult, FetchError> {
        let args = self.build_download_args(video_id, format, quality, output_path, attempt);
        info!(
            "Starting yt-dlp download of {} as {} {} to {} (attempt {})",
            video_id,
            format,
            quality,
            output_path.display(),
            attempt + 1
        );

        let on_line = |line: &str| {
            if let Some(pct) = parse_progress_line(line) {
                on_progress(pct);
            }
        };

        let output = self.run_tool(&args, Some(&on_line)).await?;
        if !output.status.success() {
            warn!(
                "Download of {} failed (exit code {:?}): {}",
                video_id,
                output.status.code(),
                output.stderr
            );
            remove_partial_files(output_path).await;
            return Err(FetchError::from_tool_output(output.status.code(), &output.stderr));
        }

        let metadata = match tokio::fs::metadata(output_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                remove_partial_files(output_path).await;
                return Err(FetchError::MissingOutput(output_path.to_path_buf()));
            }
            Err(e) => return Err(FetchError::Io(e)),
        };

        let size = metadata.len();
        if size > self.max_file_size {
            warn!(
                "Download of {} is {} bytes, over the {} byte limit; deleting {}",
                video_id,
                size,
                self.max_file_size,
                output_path.display()
            );
            remove_partial_files(output_path).await;
            return Err(FetchError::TooLarge { size, limit: self.max_file_size });
        }

        Ok(DownloadResult {
            file_path: output_path.to_path_buf(),
            file_size: size,
        })
    }
}

#[async_trait]
impl MediaFetcher for YtDlp {
    async fn get_video_info(&self, video_id: &VideoId) -> Result<VideoInfo, FetchError> {
        let what = format!("Metadata fetch for {}", video_id);
        self.retry.run(&what, |_| self.fetch_video_info(video_id)).await
    }

    async fn download_video(
        &self,
        video_id: &VideoId,
        format: MediaFormat,
        quality: Quality,
        output_path: &Path,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<DownloadResult, FetchError> {
        let what = format!("Download of {}", video_id);
        self.retry
            .run(&what, |attempt| {
                self.perform_download(video_id, format, quality, output_path, attempt, on_progress)
            })
            .await
    }
}

/// Remove `output_path` and every yt-dlp leftover sharing its name
/// (`.part` files, per-stream `.fNNN.` files before merging)
async fn remove_partial_files(output_path: &Path) {
    let (Some(dir), Some(name)) = (
        output_path.parent(),
        output_path.file_name().and_then(|n| n.to_str()),
    ) else {
        return;
    };
    let stem = output_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let prefix = format!("{}.", stem);

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot list {} for partial files: {}", dir.display(), e);
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name == name || file_name.starts_with(&prefix) {
            let path = entry.path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed partial file {}", path.display()),
                Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::time::Duration;

    const SAMPLE_INFO: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Never Gonna Give You Up",
        "duration": 212.0,
        "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/maxresdefault.jpg",
        "uploader": "Rick Astley",
        "view_count": 1500000000,
        "formats": [
            {"format_id": "sb0", "vcodec": "none", "acodec": "none", "height": 45},
            {"format_id": "139", "vcodec": "none", "acodec": "mp4a.40.5", "abr": 48.8},
            {"format_id": "140", "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5},
            {"format_id": "251", "vcodec": "none", "acodec": "opus", "abr": 130.2},
            {"format_id": "18", "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "height": 360},
            {"format_id": "136", "vcodec": "avc1.4d401f", "acodec": "none", "height": 720},
            {"format_id": "137", "vcodec": "avc1.640028", "acodec": "none", "height": 1080},
            {"format_id": "247", "vcodec": "vp9", "acodec": "none", "height": 720},
            {"format_id": "x", "vcodec": "vp9", "acodec": "none", "height": null}
        ]
    }"#;

    #[test]
    fn test_parse_video_info() {
        let info = parse_video_info(SAMPLE_INFO).unwrap();
        assert_eq!(info.id, "dQw4w9WgXcQ");
        assert_eq!(info.title, "Never Gonna Give You Up");
        assert_eq!(info.duration_seconds, 212);
        assert_eq!(info.channel_name, "Rick Astley");
        assert_eq!(info.view_count, 1_500_000_000);
        assert_eq!(info.available_formats.video, vec!["1080p", "720p", "360p"]);
        assert_eq!(info.available_formats.audio, vec!["130kbps", "49kbps"]);
    }

    #[test]
    fn test_parse_video_info_defaults() {
        let info = parse_video_info(r#"{"id": "dQw4w9WgXcQ", "title": "T"}"#).unwrap();
        assert_eq!(info.duration_seconds, 0);
        assert_eq!(info.channel_name, "Unknown");
        assert_eq!(info.thumbnail_url, "");
        assert_eq!(info.available_formats, AvailableFormats::default());

        let info = parse_video_info(r#"{"id": "a", "title": "T", "channel": "C", "formats": null}"#).unwrap();
        assert_eq!(info.channel_name, "C");
        assert_eq!(info.available_formats, AvailableFormats::default());
    }

    #[test]
    fn test_parse_video_info_rejects_malformed() {
        assert!(matches!(parse_video_info("not json"), Err(FetchError::Metadata(_))));
        assert!(matches!(parse_video_info(r#"{"id": "x"}"#), Err(FetchError::Metadata(_))));
        assert!(matches!(parse_video_info(""), Err(FetchError::Metadata(_))));
    }

    #[test]
    fn test_progress_line_parsing() {
        assert_eq!(parse_progress_line("download:  42.5%"), Some(42));
        assert_eq!(parse_progress_line("download:100.0%"), Some(100));
        assert_eq!(parse_progress_line("  download: 7% "), Some(7));
        assert_eq!(parse_progress_line("download:   N/A%"), None);
        assert_eq!(parse_progress_line("[youtube] Extracting URL"), None);
        assert_eq!(parse_progress_line(""), None);
    }

    #[test]
    fn test_video_selector_table() {
        let q = |h| Quality::Video { height: h, fps: None };
        assert_eq!(select_format(MediaFormat::Mp4, q(720)).selector, "298+140/136+140/22/18");
        assert_eq!(select_format(MediaFormat::Mp4, q(1080)).selector, "299+140/137+140/22/18");
        assert_eq!(select_format(MediaFormat::Mp4, q(360)).selector, "18");
        // Between entries: closest lower one
        assert_eq!(select_format(MediaFormat::Mp4, q(900)).selector, "298+140/136+140/22/18");
        // Above and below the table
        assert_eq!(select_format(MediaFormat::Mp4, q(4320)).selector, "315+140/313+140/22/18");
        assert_eq!(select_format(MediaFormat::Mp4, q(100)).selector, "160+140/18");
        assert_eq!(
            select_format(MediaFormat::Mp4, Quality::Audio { kbps: 128 }).selector,
            SAFE_VIDEO_SELECTOR
        );
    }

    #[test]
    fn test_audio_selection() {
        let sel = select_format(MediaFormat::Mp3, Quality::Audio { kbps: 192 });
        assert_eq!(sel.selector, "bestaudio/140");
        assert_eq!(sel.args, vec!["-x", "--audio-format", "mp3", "--audio-quality", "192K"]);

        let sel = select_format(MediaFormat::Mp3, Quality::Audio { kbps: 200 });
        assert!(sel.args.contains(&"192K".to_string()));
        let sel = select_format(MediaFormat::Mp3, Quality::Audio { kbps: 32 });
        assert!(sel.args.contains(&"64K".to_string()));
    }

    #[test]
    fn test_download_args() {
        let ytdlp = YtDlp::new("yt-dlp");
        let id = VideoId::parse("dQw4w9WgXcQ").unwrap();
        let out = Path::new("/tmp/downloads/job_title.mp4");
        let quality = Quality::Video { height: 720, fps: None };

        let args = ytdlp.build_download_args(&id, MediaFormat::Mp4, quality, out, 0);
        assert_eq!(args[0], "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1] == "/tmp/downloads/job_title.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "298+140/136+140/22/18"));
        assert!(args.windows(2).any(|w| w[0] == "--merge-output-format" && w[1] == "mp4"));
        assert!(args.contains(&"--no-mtime".to_string()));
        assert!(!args.contains(&"--sleep-requests".to_string()));
        assert!(!args.contains(&"--ffmpeg-location".to_string()));

        let retry_args = ytdlp.build_download_args(&id, MediaFormat::Mp4, quality, out, 1);
        assert!(retry_args.contains(&"--sleep-requests".to_string()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Every requested height maps to some table selector that ends in the safe default
        #[test]
        fn test_every_height_has_a_selector(height in 0u32..10_000) {
            let sel = select_format(MediaFormat::Mp4, Quality::Video { height, fps: None });
            prop_assert!(sel.selector.ends_with(SAFE_VIDEO_SELECTOR));
        }

        /// The chosen bitrate never exceeds the request unless the request is below the table
        #[test]
        fn test_audio_bitrate_not_above_request(kbps in 64u32..1000) {
            prop_assert!(audio_bitrate(kbps) <= kbps);
        }
    }

    #[cfg(unix)]
    mod fake_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable shell script standing in for yt-dlp
        fn fake_ytdlp(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-yt-dlp");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        /// Script that writes `size` bytes to the path following `-o`
        fn writing_script(size: usize) -> String {
            format!(
                r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
echo "download:  10.0%"
echo "download:  55.5%"
head -c {} /dev/zero > "$out"
echo "download: 100.0%"
exit 0"#,
                size
            )
        }

        fn video_id() -> VideoId {
            VideoId::parse("dQw4w9WgXcQ").unwrap()
        }

        #[tokio::test]
        async fn test_get_video_info_from_tool() {
            let dir = tempfile::tempdir().unwrap();
            let json = SAMPLE_INFO.replace('\n', " ");
            let bin = fake_ytdlp(dir.path(), &format!("cat <<'EOF'\n{}\nEOF", json));

            let ytdlp = YtDlp::new(bin).with_retry_policy(RetryPolicy::none());
            let info = ytdlp.get_video_info(&video_id()).await.unwrap();
            assert_eq!(info.title, "Never Gonna Give You Up");
        }

        #[tokio::test]
        async fn test_metadata_failure_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_ytdlp(dir.path(), "echo 'ERROR: [youtube] x: Video unavailable' >&2\nexit 1");

            let ytdlp = YtDlp::new(bin).with_retry_policy(RetryPolicy::new(3, Duration::ZERO));
            let err = ytdlp.get_video_info(&video_id()).await.unwrap_err();
            assert!(matches!(err, FetchError::ToolFailed { code: Some(1), .. }));
        }

        #[tokio::test]
        async fn test_blocked_requests_are_retried() {
            let dir = tempfile::tempdir().unwrap();
            let counter = dir.path().join("calls");
            let bin = fake_ytdlp(
                dir.path(),
                &format!(
                    "echo x >> '{}'\necho 'ERROR: HTTP Error 403: Forbidden' >&2\nexit 1",
                    counter.display()
                ),
            );

            let ytdlp = YtDlp::new(bin).with_retry_policy(RetryPolicy::new(2, Duration::ZERO));
            let err = ytdlp.get_video_info(&video_id()).await.unwrap_err();
            assert!(matches!(err, FetchError::Blocked(_)));

            let calls = std::fs::read_to_string(&counter).unwrap();
            assert_eq!(calls.lines().count(), 3);
        }

        #[tokio::test]
        async fn test_version() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_ytdlp(dir.path(), "echo 2024.08.06");
            assert_eq!(YtDlp::new(bin).version().await.unwrap(), "2024.08.06");
        }

        #[tokio::test]
        async fn test_missing_tool() {
            let ytdlp = YtDlp::new("/nonexistent/yt-dlp-binary");
            let err = ytdlp.get_video_info(&video_id()).await.unwrap_err();
            assert!(matches!(err, FetchError::ToolNotFound(_)));
        }

        #[tokio::test]
        async fn test_download_reports_progress_and_size() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_ytdlp(dir.path(), &writing_script(2048));
            let out = dir.path().join("job_title.mp4");

            let seen = Mutex::new(Vec::new());
            let on_progress = |pct: u8| seen.lock().unwrap().push(pct);

            let ytdlp = YtDlp::new(bin).with_retry_policy(RetryPolicy::none());
            let result = ytdlp
                .download_video(
                    &video_id(),
                    MediaFormat::Mp4,
                    Quality::Video { height: 720, fps: None },
                    &out,
                    &on_progress,
                )
                .await
                .unwrap();

            assert_eq!(result.file_path, out);
            assert_eq!(result.file_size, 2048);
            assert_eq!(std::fs::metadata(&out).unwrap().len(), 2048);
            assert_eq!(*seen.lock().unwrap(), vec![10, 55, 100]);
        }

        #[tokio::test]
        async fn test_oversized_download_is_deleted() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_ytdlp(dir.path(), &writing_script(4096));
            let out = dir.path().join("job_big.mp4");

            let ytdlp = YtDlp::new(bin)
                .with_retry_policy(RetryPolicy::none())
                .with_max_file_size(1024);
            let err = ytdlp
                .download_video(
                    &video_id(),
                    MediaFormat::Mp4,
                    Quality::Video { height: 360, fps: None },
                    &out,
                    &|_: u8| {},
                )
                .await
                .unwrap_err();

            assert!(matches!(err, FetchError::TooLarge { size: 4096, limit: 1024 }));
            assert!(!out.exists());
        }

        #[tokio::test]
        async fn test_failed_download_leaves_no_partial_files() {
            let dir = tempfile::tempdir().unwrap();
            let out = dir.path().join("job_fail.mp4");
            let bin = fake_ytdlp(
                dir.path(),
                &format!(
                    "echo partial > '{0}.part'\necho partial > '{1}'\necho 'ERROR: Video unavailable' >&2\nexit 1",
                    out.display(),
                    dir.path().join("job_fail.f137.mp4").display()
                ),
            );

            let ytdlp = YtDlp::new(bin).with_retry_policy(RetryPolicy::none());
            let err = ytdlp
                .download_video(
                    &video_id(),
                    MediaFormat::Mp4,
                    Quality::Video { height: 1080, fps: None },
                    &out,
                    &|_: u8| {},
                )
                .await
                .unwrap_err();

            assert!(!err.is_transient());
            let leftovers: Vec<_> = std::fs::read_dir(dir.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| n.starts_with("job_fail"))
                .collect();
            assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
        }

        #[tokio::test]
        async fn test_zero_exit_without_file_is_missing_output() {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_ytdlp(dir.path(), "exit 0");
            let out = dir.path().join("job_none.mp3");

            let ytdlp = YtDlp::new(bin).with_retry_policy(RetryPolicy::none());
            let err = ytdlp
                .download_video(
                    &video_id(),
                    MediaFormat::Mp3,
                    Quality::Audio { kbps: 192 },
                    &out,
                    &|_: u8| {},
                )
                .await
                .unwrap_err();
            assert!(matches!(err, FetchError::MissingOutput(_)));
        }
    }
}
