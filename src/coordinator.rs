//! Drives a page URL through resolve, plan, fetch, assemble and mux.
//!
//! Every selected format becomes a [`DownloadJob`]. Jobs share one pool of
//! fetch permits, so the total number of open transfers stays at the
//! configured concurrency no matter how many jobs run.

use indicatif::ProgressDrawTarget;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DownloadConfig;
use crate::error::{AssembleError, DownloadError, FetchError, PlanError, ResumeError};
use crate::extractor::Extractor;
use crate::fetcher::{ByteSource, SegmentFetcher, Throttle};
use crate::formats::{self, Selection};
use crate::model::FormatDescriptor;
use crate::muxer::Muxer;
use crate::planner::{self, Segment, SegmentPlan, SegmentState};
use crate::progress::{self, ProgressEvent, ProgressReporter, ProgressSender};
use crate::resume::ResumeStore;
use crate::state::JobIdentity;
use crate::utils;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Resolving,
    Planning,
    Fetching,
    Assembling,
    Muxing,
    Done,
    Failed(String),
}

/// One format bound to its destination file.
pub struct DownloadJob {
    pub id: usize,
    pub format: FormatDescriptor,
    pub part_path: PathBuf,
    pub identity: JobIdentity,
    pub plan: SegmentPlan,
    source: Arc<ByteSource>,
    state: JobState,
}

impl DownloadJob {
    /// Resume records are keyed on the page and format rather than the
    /// byte-source URL, which many sites sign and expire.
    pub fn source_key(page_url: &str, format_id: &str) -> String {
        format!("{}#{}", page_url, format_id)
    }

    #[cfg(test)]
    pub fn state(&self) -> &JobState {
        &self.state
    }

    fn transition(&mut self, next: JobState) {
        info!(
            job = self.id,
            format = %self.format.format_id,
            from = ?self.state,
            to = ?next,
            "job state changed"
        );
        self.state = next;
    }

    fn label(&self) -> String {
        let name = self
            .part_path
            .file_name()
            .map(|n| n.to_string_lossy().trim_end_matches(".part").to_string())
            .unwrap_or_default();
        format!("{} [{}]", name, self.format.format_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub title: String,
    pub output: PathBuf,
    /// The output already existed and nothing was fetched.
    pub skipped: bool,
}

pub struct DownloadCoordinator {
    client: Client,
    config: DownloadConfig,
    extractor: Arc<dyn Extractor>,
    muxer: Arc<dyn Muxer>,
    store: Arc<ResumeStore>,
    pool: Arc<Semaphore>,
    throttle: Option<Arc<Throttle>>,
    cancel: CancellationToken,
}

impl DownloadCoordinator {
    pub fn new(config: DownloadConfig, extractor: Arc<dyn Extractor>, muxer: Arc<dyn Muxer>) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(config, client, extractor, muxer)
    }

    pub fn with_client(
        config: DownloadConfig,
        client: Client,
        extractor: Arc<dyn Extractor>,
        muxer: Arc<dyn Muxer>,
    ) -> Self {
        let store = Arc::new(ResumeStore::new(config.state_dir.clone()));
        let pool = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let throttle = config.rate_limit.map(|limit| Arc::new(Throttle::per_second(limit)));
        Self {
            client,
            config,
            extractor,
            muxer,
            store,
            pool,
            throttle,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops every job; finished segments stay recorded.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn download(&self, page_url: &str, format: Option<&str>) -> Result<DownloadOutcome, DownloadError> {
        info!(page_url, state = ?JobState::Resolving, "resolving page");
        let info = self.extractor.resolve(page_url).await.map_err(|e| {
            error!(page_url, error = %e, "failed to resolve page");
            e
        })?;
        let selection = formats::select(&info, format)?;
        fs::create_dir_all(&self.config.output_dir).await?;

        match selection {
            Selection::Single(format) => self.download_single(page_url, &info.title, format).await,
            Selection::Merge { video, audio } => {
                self.download_merged(page_url, &info.title, video, audio).await
            }
        }
    }

    async fn download_single(
        &self,
        page_url: &str,
        title: &str,
        format: FormatDescriptor,
    ) -> Result<DownloadOutcome, DownloadError> {
        let output = utils::output_path(&self.config.output_dir, title, &format.ext);
        if let Some(outcome) = skip_existing(title, &output).await {
            return Ok(outcome);
        }

        let mut job = self
            .plan_job(0, page_url, format, utils::part_path(&output))
            .await?;
        match self.drive_single(&mut job, &output).await {
            Ok(()) => Ok(DownloadOutcome {
                title: title.to_string(),
                output,
                skipped: false,
            }),
            Err(e) => Err(self.fail(&mut [&mut job], e).await),
        }
    }

    async fn download_merged(
        &self,
        page_url: &str,
        title: &str,
        video: FormatDescriptor,
        audio: FormatDescriptor,
    ) -> Result<DownloadOutcome, DownloadError> {
        let dir = &self.config.output_dir;
        let container = formats::merge_container(&video.ext, &audio.ext);
        let output = utils::output_path(dir, title, container);
        if let Some(outcome) = skip_existing(title, &output).await {
            return Ok(outcome);
        }

        let video_part = utils::part_path(&utils::stream_path(dir, title, &video.format_id, &video.ext));
        let audio_part = utils::part_path(&utils::stream_path(dir, title, &audio.format_id, &audio.ext));
        let mut video_job = self.plan_job(0, page_url, video, video_part).await?;
        let mut audio_job = match self.plan_job(1, page_url, audio, audio_part).await {
            Ok(job) => job,
            Err(e) => return Err(self.fail(&mut [&mut video_job], e).await),
        };

        match self.drive_merged(&mut video_job, &mut audio_job, &output).await {
            Ok(()) => Ok(DownloadOutcome {
                title: title.to_string(),
                output,
                skipped: false,
            }),
            Err(e) => Err(self.fail(&mut [&mut video_job, &mut audio_job], e).await),
        }
    }

    async fn drive_single(&self, job: &mut DownloadJob, output: &Path) -> Result<(), DownloadError> {
        let (tx, reporter) = self.start_reporter(&[&*job]);
        let fetched = self.fetch_job(job, tx).await;
        let _ = reporter.await;
        fetched?;

        self.assemble(job).await?;
        fs::rename(&job.part_path, output)
            .await
            .map_err(|source| AssembleError::Io {
                path: output.to_path_buf(),
                source,
            })?;
        self.store.delete(&job.identity).await?;
        job.transition(JobState::Done);
        info!(output = ?output, "download complete");
        Ok(())
    }

    async fn drive_merged(
        &self,
        video: &mut DownloadJob,
        audio: &mut DownloadJob,
        output: &Path,
    ) -> Result<(), DownloadError> {
        let (tx, reporter) = self.start_reporter(&[&*video, &*audio]);
        // a failing job cancels only its own segments; the pair settles independently
        let (video_fetched, audio_fetched) =
            tokio::join!(self.fetch_job(video, tx.clone()), self.fetch_job(audio, tx));
        let _ = reporter.await;
        video_fetched?;
        audio_fetched?;

        self.assemble(video).await?;
        self.assemble(audio).await?;

        video.transition(JobState::Muxing);
        audio.transition(JobState::Muxing);
        self.muxer.mux(&video.part_path, &audio.part_path, output).await?;

        for job in [video, audio] {
            if let Err(e) = fs::remove_file(&job.part_path).await {
                warn!(path = ?job.part_path, error = %e, "failed to remove intermediate file");
            }
            self.store.delete(&job.identity).await?;
            job.transition(JobState::Done);
        }
        info!(output = ?output, "download complete");
        Ok(())
    }

    /// Probes the source, builds the segment plan and restores finished
    /// segments from a previous attempt.
    async fn plan_job(
        &self,
        id: usize,
        page_url: &str,
        format: FormatDescriptor,
        part_path: PathBuf,
    ) -> Result<DownloadJob, DownloadError> {
        let headers = header_map(&format.http_headers);
        let probe = planner::probe(&self.client, &format.url, &headers).await?;
        if let (Some(expected), Some(actual)) = (format.filesize, probe.content_length) {
            if expected != actual {
                return Err(PlanError::LengthMismatch { expected, actual }.into());
            }
        }

        let mut plan = planner::plan(&probe, self.config.segment_size, self.config.max_segments());
        let identity = JobIdentity {
            source: DownloadJob::source_key(page_url, &format.format_id),
            destination: part_path.clone(),
            content_length: probe.content_length,
            etag: probe.etag.clone(),
        };

        let mut resumed = false;
        if let Some(bitmap) = self.store.load(&identity, &plan).await {
            if part_file_matches(&part_path, plan.total_length).await {
                plan.apply_completed(&bitmap);
                resumed = bitmap.done_count() > 0;
            } else {
                warn!(path = ?part_path, "partial file missing or resized, starting over");
                self.store.delete(&identity).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!resumed)
            .open(&part_path)
            .await?;
        if let Some(total) = plan.total_length {
            file.set_len(total).await?;
        }
        drop(file);
        self.store.begin(&identity, &plan).await?;

        info!(
            job = id,
            format = %format.format_id,
            total = ?plan.total_length,
            segments = plan.segment_count(),
            already_done = plan.done_count(),
            resumable = plan.resumable,
            "planned download"
        );
        let source = Arc::new(ByteSource {
            url: format.url.clone(),
            headers,
            ranged: plan.resumable,
        });
        Ok(DownloadJob {
            id,
            format,
            part_path,
            identity,
            plan,
            source,
            state: JobState::Planning,
        })
    }

    /// Runs every pending segment of `job` through the shared pool and waits
    /// for all of them to settle.
    async fn fetch_job(&self, job: &mut DownloadJob, progress: ProgressSender) -> Result<(), DownloadError> {
        job.transition(JobState::Fetching);
        let job_cancel = self.cancel.child_token();
        let fetcher = Arc::new(SegmentFetcher::new(
            self.client.clone(),
            job.source.clone(),
            self.config.retry.clone(),
            self.config.request_timeout,
            self.throttle.clone(),
        ));
        let segments_total = job.plan.segment_count();
        let done = Arc::new(AtomicUsize::new(job.plan.done_count()));

        let pending: Vec<Segment> = job.plan.pending().cloned().collect();
        let mut tasks = JoinSet::new();
        for segment in pending {
            job.plan.mark(segment.index, SegmentState::InFlight);
            let task = SegmentTask {
                fetcher: fetcher.clone(),
                pool: self.pool.clone(),
                store: self.store.clone(),
                identity: job.identity.clone(),
                part_path: job.part_path.clone(),
                cancel: job_cancel.clone(),
                progress: progress.clone(),
                done: done.clone(),
                job_id: job.id,
                segments_total,
                bytes_total: job.plan.total_length,
            };
            tasks.spawn(async move {
                let index = segment.index;
                (index, task.run(segment).await)
            });
        }
        drop(progress);

        let deadline = self
            .config
            .job_timeout
            .map(|timeout| (timeout, tokio::time::Instant::now() + timeout));
        let mut timed_out = false;
        let mut failure: Option<TaskFailure> = None;
        loop {
            let joined = match deadline {
                Some((timeout, at)) if !timed_out => tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = tokio::time::sleep_until(at) => {
                        warn!(job = job.id, ?timeout, "job timed out, cancelling its segments");
                        timed_out = true;
                        job_cancel.cancel();
                        continue;
                    }
                },
                _ => tasks.join_next().await,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((index, Ok(()))) => job.plan.mark(index, SegmentState::Done),
                Ok((index, Err(e))) if e.is_cancelled() => job.plan.mark(index, SegmentState::Pending),
                Ok((index, Err(e))) => {
                    job.plan.mark(index, SegmentState::Failed);
                    if failure.is_none() {
                        error!(job = job.id, segment = index, error = %e, "segment failed, cancelling the rest of the job");
                        job_cancel.cancel();
                        failure = Some(e);
                    }
                }
                Err(join_error) => {
                    job_cancel.cancel();
                    failure.get_or_insert(TaskFailure::Fetch(FetchError::Permanent(format!(
                        "segment task failed: {}",
                        join_error
                    ))));
                }
            }
        }

        let segments_done = job.plan.done_count();
        if let Some(failure) = failure {
            return Err(match failure {
                TaskFailure::Fetch(source) => DownloadError::Fetch {
                    job: job.label(),
                    segments_done,
                    segments_total,
                    source,
                },
                TaskFailure::Resume(e) => e.into(),
            });
        }
        if job.plan.is_complete() {
            return Ok(());
        }
        if let (true, Some((after, _))) = (timed_out, deadline) {
            return Err(DownloadError::Timeout {
                job: job.label(),
                after,
                segments_done,
                segments_total,
            });
        }
        Err(DownloadError::Cancelled {
            segments_done,
            segments_total,
        })
    }

    /// Checks the finished part file before it is renamed or muxed. A size
    /// mismatch means the data cannot be trusted, so the resume state goes too.
    async fn assemble(&self, job: &mut DownloadJob) -> Result<(), DownloadError> {
        job.transition(JobState::Assembling);
        let actual = fs::metadata(&job.part_path)
            .await
            .map_err(|source| AssembleError::Io {
                path: job.part_path.clone(),
                source,
            })?
            .len();

        if let Some(expected) = job.plan.total_length {
            if actual != expected {
                warn!(path = ?job.part_path, expected, actual, "size mismatch, discarding partial data");
                let _ = self.store.delete(&job.identity).await;
                let _ = fs::remove_file(&job.part_path).await;
                return Err(AssembleError::SizeMismatch {
                    path: job.part_path.clone(),
                    expected,
                    actual,
                }
                .into());
            }
        }
        Ok(())
    }

    async fn fail(&self, jobs: &mut [&mut DownloadJob], err: DownloadError) -> DownloadError {
        error!(kind = err.kind(), error = %err, "download failed");
        for job in jobs.iter_mut() {
            if job.state != JobState::Done {
                job.transition(JobState::Failed(err.kind().to_string()));
            }
            if self.config.cleanup_on_failure {
                self.discard(&**job).await;
            }
        }
        err
    }

    async fn discard(&self, job: &DownloadJob) {
        if let Err(e) = self.store.delete(&job.identity).await {
            warn!(error = %e, "failed to delete resume record");
        }
        match fs::remove_file(&job.part_path).await {
            Ok(()) => info!(path = ?job.part_path, "removed partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?job.part_path, error = %e, "failed to remove partial file"),
        }
    }

    fn start_reporter(&self, jobs: &[&DownloadJob]) -> (ProgressSender, JoinHandle<ProgressReporter>) {
        let (tx, rx) = progress::channel();
        let labels: BTreeMap<usize, String> = jobs.iter().map(|job| (job.id, job.label())).collect();
        let target = if self.config.show_progress {
            ProgressDrawTarget::stderr_with_hz(5)
        } else {
            ProgressDrawTarget::hidden()
        };
        for job in jobs {
            let _ = tx.send(ProgressEvent {
                job_id: job.id,
                bytes_received_delta: job.plan.done_bytes(),
                bytes_total: job.plan.total_length,
                segments_done: job.plan.done_count(),
                segments_total: job.plan.segment_count(),
                timestamp: Instant::now(),
            });
        }
        let reporter = ProgressReporter::new(labels, target);
        (tx, tokio::spawn(reporter.run(rx)))
    }
}

#[derive(Debug, thiserror::Error)]
enum TaskFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Resume(#[from] ResumeError),
}

impl TaskFailure {
    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Cancelled))
    }
}

/// Everything one spawned segment needs.
struct SegmentTask {
    fetcher: Arc<SegmentFetcher>,
    pool: Arc<Semaphore>,
    store: Arc<ResumeStore>,
    identity: JobIdentity,
    part_path: PathBuf,
    cancel: CancellationToken,
    progress: ProgressSender,
    done: Arc<AtomicUsize>,
    job_id: usize,
    segments_total: usize,
    bytes_total: Option<u64>,
}

impl SegmentTask {
    async fn run(self, segment: Segment) -> Result<(), TaskFailure> {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled.into()),
            permit = self.pool.clone().acquire_owned() => permit.map_err(|_| FetchError::Cancelled)?,
        };

        // each segment writes through its own handle, so offsets never race
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.part_path)
            .await
            .map_err(FetchError::Io)?;
        self.fetcher
            .fetch(&segment, &mut file, &self.cancel, |delta| self.report(delta))
            .await?;
        drop(file);

        self.store.mark_done(&self.identity, segment.index).await?;
        self.done.fetch_add(1, Ordering::SeqCst);
        self.report(0);
        Ok(())
    }

    fn report(&self, delta: u64) {
        let _ = self.progress.send(ProgressEvent {
            job_id: self.job_id,
            bytes_received_delta: delta,
            bytes_total: self.bytes_total,
            segments_done: self.done.load(Ordering::SeqCst),
            segments_total: self.segments_total,
            timestamp: Instant::now(),
        });
    }
}

async fn skip_existing(title: &str, output: &Path) -> Option<DownloadOutcome> {
    if !fs::try_exists(output).await.unwrap_or(false) {
        return None;
    }
    info!(output = ?output, "output already exists, skipping");
    Some(DownloadOutcome {
        title: title.to_string(),
        output: output.to_path_buf(),
        skipped: true,
    })
}

async fn part_file_matches(path: &Path, total: Option<u64>) -> bool {
    match fs::metadata(path).await {
        Ok(metadata) => total.map_or(true, |t| metadata.len() == t),
        Err(_) => false,
    }
}

fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid source header"),
        }
    }
    map
}
