use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure to turn a page URL into downloadable formats.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("extractor `{0}` not found")]
    ToolNotFound(String),

    #[error("unsupported URL: {0}")]
    Unsupported(String),

    #[error("video unavailable: {0}")]
    Unavailable(String),

    #[error("access restricted: {0}")]
    Restricted(String),

    #[error("network error while resolving: {0}")]
    Network(String),

    #[error("failed to parse extractor output: {0}")]
    Parse(String),

    #[error("extractor failed: {0}")]
    Failed(String),

    #[error("no downloadable formats found")]
    NoFormats,

    #[error("requested format `{0}` is not available")]
    FormatNotFound(String),
}

/// The byte source's metadata is missing or disagrees with what the extractor reported.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid source URL `{0}`")]
    InvalidUrl(String),

    #[error("probe request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("probe of {url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    #[error("source reports {actual} bytes but the extractor announced {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },

    #[error("cancelled")]
    Cancelled,

    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ShortRead { .. })
    }

    pub fn from_status(status: StatusCode) -> Self {
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Self::Transient(format!("HTTP {}", status))
        } else {
            Self::Permanent(format!("HTTP {}", status))
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::from_status(status);
        }
        if e.is_builder() || e.is_redirect() {
            Self::Permanent(e.to_string())
        } else {
            // connect, timeout, reset and body errors are all worth another attempt
            Self::Transient(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("{path:?} is {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("failed to finalize {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("muxer `{0}` not found")]
    NotFound(String),

    #[error("muxer exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    #[error("failed to run muxer: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("resume record {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode resume record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no resume record open for {0}")]
    Missing(String),
}

/// Terminal failure of a download, as reported to the user.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("{job}: {source} ({segments_done}/{segments_total} segments completed)")]
    Fetch {
        job: String,
        segments_done: usize,
        segments_total: usize,
        #[source]
        source: FetchError,
    },

    #[error(transparent)]
    Assemble(#[from] AssembleError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error("{job}: timed out after {after:?} ({segments_done}/{segments_total} segments completed)")]
    Timeout {
        job: String,
        after: Duration,
        segments_done: usize,
        segments_total: usize,
    },

    #[error("cancelled by user ({segments_done}/{segments_total} segments completed)")]
    Cancelled {
        segments_done: usize,
        segments_total: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DownloadError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolve(_) => "ResolveError",
            Self::Plan(_) => "PlanError",
            Self::Fetch { source, .. } => match source {
                FetchError::Permanent(_) => "FetchPermanent",
                _ => "FetchExhausted",
            },
            Self::Assemble(_) => "AssembleError",
            Self::Mux(_) => "MuxError",
            Self::Resume(_) => "ResumeError",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled { .. } => "UserCancelled",
            Self::Io(_) => "IoError",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Resolve(_) => 2,
            Self::Plan(_) => 3,
            Self::Fetch { .. } => 4,
            Self::Assemble(_) => 5,
            Self::Mux(_) => 6,
            Self::Timeout { .. } => 7,
            Self::Cancelled { .. } => 130,
            Self::Resume(_) | Self::Io(_) => 1,
        }
    }
}
