use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use crate::fetcher::RetryPolicy;

pub const DEFAULT_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_SEGMENTS_PER_WORKER: usize = 4;
pub const STATE_DIR_NAME: &str = ".vidl";

/// Knobs of one download run.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub output_dir: PathBuf,
    /// Where resume records live.
    pub state_dir: PathBuf,
    /// Size of the global fetch pool, shared by all jobs.
    pub concurrency: usize,
    pub segment_size: u64,
    /// Caps segments per job at `concurrency * segments_per_worker`.
    pub segments_per_worker: usize,
    pub retry: RetryPolicy,
    /// Per request; a timeout is retried.
    pub request_timeout: Duration,
    /// Per job; a timeout fails the job.
    pub job_timeout: Option<Duration>,
    /// Bytes per second across all fetchers.
    pub rate_limit: Option<NonZeroU32>,
    pub cleanup_on_failure: bool,
    pub show_progress: bool,
    pub user_agent: String,
}

impl DownloadConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        Self {
            state_dir: output_dir.join(STATE_DIR_NAME),
            output_dir,
            concurrency: num_cpus::get().max(1),
            segment_size: DEFAULT_SEGMENT_SIZE,
            segments_per_worker: DEFAULT_SEGMENTS_PER_WORKER,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            job_timeout: None,
            rate_limit: None,
            cleanup_on_failure: false,
            show_progress: true,
            user_agent: format!("vidl/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn max_segments(&self) -> usize {
        self.concurrency.max(1) * self.segments_per_worker.max(1)
    }
}
