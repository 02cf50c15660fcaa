pub mod config;
pub mod error;
pub mod job;
pub mod media;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod sanitize;
pub mod search;
pub mod validation;
pub mod ytdlp;

pub use config::ServerConfig;
pub use error::FetchError;
pub use job::{Job, JobId, JobStatus};
pub use media::{AvailableFormats, MediaFetcher, VideoInfo};
pub use protocol::{DeliveredFile, DownloadService, ResultOutcome};
pub use registry::JobRegistry;
pub use search::{SearchProvider, SearchResult, YtDlpSearch};
pub use validation::{MediaFormat, Quality, ValidationError, VideoId};
pub use ytdlp::YtDlp;
