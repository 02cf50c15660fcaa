use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
    Frame, Terminal,
};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use std::io::stdout;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;
use tubegrab::{
    sanitize::{ensure_extension, sanitize},
    AvailableFormats, Job, JobStatus, MediaFormat, SearchResult,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Search a video and download it through a tubegrabd server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// What to search for
    query: String,

    /// Output format
    #[arg(short, long, default_value = "mp4", value_parser = ["mp3", "mp4"])]
    format: String,

    /// Quality such as 720p or 192kbps (default: best match for the format)
    #[arg(short, long)]
    quality: Option<String>,

    /// Base URL of the server
    #[arg(short, long, default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Directory the file is saved to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

/// Where the download stands, as reported by the worker thread
#[derive(Debug, Clone)]
enum Phase {
    Searching,
    Starting,
    Downloading(Job),
    Saving,
    Done { path: PathBuf, size: u64 },
    Failed(String),
}

struct App {
    query: String,
    video: Option<SearchResult>,
    quality: Option<String>,
    phase: Phase,
    should_quit: bool,
}

impl App {
    fn new(query: String) -> Self {
        Self {
            query,
            video: None,
            quality: None,
            phase: Phase::Searching,
            should_quit: false,
        }
    }

    fn apply(&mut self, update: Update) {
        match update {
            Update::Found { video, quality } => {
                self.video = Some(video);
                self.quality = Some(quality);
                self.phase = Phase::Starting;
            }
            Update::Phase(phase) => self.phase = phase,
        }
    }

    fn progress(&self) -> u16 {
        match &self.phase {
            Phase::Downloading(job) => u16::from(job.progress.min(100)),
            Phase::Saving | Phase::Done { .. } => 100,
            _ => 0,
        }
    }
}

enum Update {
    Found { video: SearchResult, quality: String },
    Phase(Phase),
}

/// Blocking client for the tubegrabd HTTP API
struct ApiClient {
    base: String,
    http: Client,
}

/// Reply of `GET /download/{id}`
enum Fetched {
    Pending(Job),
    File { name: String, bytes: Vec<u8> },
}

impl ApiClient {
    fn new(base: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let resp = self
            .http
            .get(format!("{}/search", self.base))
            .query(&[("q", query)])
            .send()
            .context("Search request failed")?;
        let body: serde_json::Value = check(resp)?.json().context("Invalid search response")?;
        let videos = body
            .get("videos")
            .cloned()
            .ok_or_else(|| anyhow!("Search response has no videos"))?;
        serde_json::from_value(videos).context("Invalid search result")
    }

    fn create(&self, video_id: &str, format: &str, quality: &str) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/download", self.base))
            .json(&serde_json::json!({
                "videoId": video_id,
                "format": format,
                "quality": quality,
            }))
            .send()
            .context("Download request failed")?;
        let body: serde_json::Value = check(resp)?.json().context("Invalid download response")?;
        body.get("jobId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Download response has no jobId"))
    }

    fn progress(&self, job_id: &str) -> Result<Job> {
        let resp = self
            .http
            .get(format!("{}/download/{}/progress", self.base, job_id))
            .send()
            .context("Progress request failed")?;
        check(resp)?.json().context("Invalid progress response")
    }

    fn fetch(&self, job_id: &str) -> Result<Fetched> {
        let resp = self
            .http
            .get(format!("{}/download/{}", self.base, job_id))
            .send()
            .context("Result request failed")?;
        let resp = check(resp)?;

        let is_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.starts_with("application/json"));
        if is_json {
            return Ok(Fetched::Pending(resp.json().context("Invalid status response")?));
        }

        let name = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_file_name)
            .unwrap_or_else(|| "download".to_string());
        let bytes = resp.bytes().context("Failed to read file body")?.to_vec();
        Ok(Fetched::File { name, bytes })
    }
}

/// Turn a non-2xx reply into an error carrying the server's message
fn check(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .json::<serde_json::Value>()
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    bail!("Server returned {}: {}", status.as_u16(), message)
}

/// File name from a Content-Disposition header, preferring `filename*`
fn disposition_file_name(header: &str) -> Option<String> {
    let mut plain = None;
    for part in header.split(';').map(str::trim) {
        if let Some(encoded) = part.strip_prefix("filename*=") {
            let encoded = encoded
                .strip_prefix("UTF-8''")
                .or_else(|| encoded.strip_prefix("utf-8''"))
                .unwrap_or(encoded);
            if let Ok(decoded) = urlencoding::decode(encoded) {
                return Some(decoded.into_owned());
            }
        } else if let Some(quoted) = part.strip_prefix("filename=") {
            plain = Some(quoted.trim_matches('"').to_string());
        }
    }
    plain
}

/// Requested quality, or the preferred default if the video offers it,
/// or the best quality the video offers
fn choose_quality(format: MediaFormat, requested: Option<&str>, formats: &AvailableFormats) -> String {
    if let Some(q) = requested {
        return q.to_string();
    }
    let (preferred, offered) = match format {
        MediaFormat::Mp4 => ("720p", &formats.video),
        MediaFormat::Mp3 => ("192kbps", &formats.audio),
    };
    if offered.iter().any(|q| q == preferred) {
        preferred.to_string()
    } else {
        offered
            .first()
            .cloned()
            .unwrap_or_else(|| preferred.to_string())
    }
}

/// Search, start the job, poll it and save the file, reporting each step
fn run_download(args: &Args, tx: &Sender<Update>) -> Result<()> {
    let format: MediaFormat = args.format.parse()?;
    let client = ApiClient::new(&args.server)?;

    let video = client
        .search(&args.query)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No results for \"{}\"", args.query))?;
    let quality = choose_quality(format, args.quality.as_deref(), &video.available_formats);
    let video_id = video.id.clone();
    let _ = tx.send(Update::Found { video, quality: quality.clone() });

    let job_id = client.create(&video_id, format.extension(), &quality)?;

    loop {
        let job = client.progress(&job_id)?;
        match job.status {
            JobStatus::Failed => {
                bail!("{}", job.error.unwrap_or_else(|| "Download failed".to_string()))
            }
            JobStatus::Completed => {
                let _ = tx.send(Update::Phase(Phase::Saving));
                match client.fetch(&job_id)? {
                    Fetched::Pending(job) => {
                        let _ = tx.send(Update::Phase(Phase::Downloading(job)));
                    }
                    Fetched::File { name, bytes } => {
                        let path = save_file(&args.output, &name, format, &bytes)?;
                        let _ = tx.send(Update::Phase(Phase::Done {
                            path,
                            size: bytes.len() as u64,
                        }));
                        return Ok(());
                    }
                }
            }
            _ => {
                let _ = tx.send(Update::Phase(Phase::Downloading(job)));
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn save_file(dir: &Path, name: &str, format: MediaFormat, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
    let path = dir.join(ensure_extension(&sanitize(name), format));
    std::fs::write(&path, bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn spawn_worker(args: Args) -> Receiver<Update> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        if let Err(e) = run_download(&args, &tx) {
            let _ = tx.send(Update::Phase(Phase::Failed(format!("{:#}", e))));
        }
    });
    rx
}

fn main() -> Result<()> {
    let args = Args::parse();
    let updates = spawn_worker(args.clone());

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(args.query.clone());
    let result = run_app(&mut terminal, &mut app, &updates);

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    result?;
    match app.phase {
        Phase::Done { path, size } => {
            println!("Saved {} ({})", path.display(), format_size(size, DECIMAL));
            Ok(())
        }
        Phase::Failed(message) => bail!(message),
        _ => Ok(()),
    }
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    updates: &Receiver<Update>,
) -> Result<()> {
    loop {
        while let Ok(update) = updates.try_recv() {
            app.apply(update);
        }

        terminal.draw(|f| ui(f, app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                if let crossterm::event::KeyCode::Char('q') = key.code {
                    app.should_quit = true;
                }
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let size = f.size();

    if size.height < 10 || size.width < 40 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 40x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(6),
            Constraint::Length(3),
            Constraint::Length(3),
        ])
        .split(size);

    render_video(f, app, chunks[0]);
    render_gauge(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn render_video(f: &mut Frame, app: &App, area: Rect) {
    let width = area.width.saturating_sub(12) as usize;
    let lines = match &app.video {
        Some(video) => vec![
            Line::from(Span::styled(
                truncate_string(&video.title, width),
                Style::default().add_modifier(Modifier::BOLD),
            )),
            Line::from(format!("Channel:  {}", truncate_string(&video.channel, width))),
            Line::from(format!("Duration: {}", video.duration)),
            Line::from(format!(
                "Quality:  {}",
                app.quality.as_deref().unwrap_or("-")
            )),
            Line::from(format!("URL:      {}", video.url)),
        ],
        None => vec![Line::from(format!(
            "Searching for \"{}\"...",
            truncate_string(&app.query, width)
        ))],
    };

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Video"))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn render_gauge(f: &mut Frame, app: &App, area: Rect) {
    let color = match app.phase {
        Phase::Failed(_) => Color::Red,
        Phase::Done { .. } => Color::Green,
        _ => Color::Cyan,
    };
    let percent = app.progress();
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(color))
        .percent(percent)
        .label(format!("{}%", percent));
    f.render_widget(gauge, area);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let (text, style) = match &app.phase {
        Phase::Searching => ("Searching...".to_string(), Style::default()),
        Phase::Starting => ("Starting download...".to_string(), Style::default()),
        Phase::Downloading(job) => (
            format!("{} | job {}", job.status, job.job_id),
            Style::default(),
        ),
        Phase::Saving => ("Saving file...".to_string(), Style::default()),
        Phase::Done { path, size } => (
            format!(
                "Saved {} ({})",
                truncate_string(&path.display().to_string(), 50),
                format_size(*size, DECIMAL)
            ),
            Style::default().fg(Color::Green),
        ),
        Phase::Failed(message) => (message.clone(), Style::default().fg(Color::Red)),
    };

    let paragraph = Paragraph::new(format!("{} | q=quit", text))
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(style)
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
