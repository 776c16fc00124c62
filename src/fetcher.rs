use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::planner::{parse_content_range, Segment};

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped at `max_delay`, plus up to half of that again.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);
        backoff + backoff.mul_f64(jitter_fraction() * 0.5)
    }
}

/// Pseudo-random value in `[0, 1)` taken from the clock.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 10_000) as f64 / 10_000.0
}

/// Process-wide bandwidth cap shared by all fetchers.
pub struct Throttle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: u32,
}

impl Throttle {
    pub fn per_second(bytes: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(bytes)),
            burst: bytes.get(),
        }
    }

    pub async fn consume(&self, mut bytes: usize) {
        // a single request may not exceed the burst size
        while bytes > 0 {
            let take = bytes.min(self.burst as usize);
            if let Some(n) = NonZeroU32::new(take as u32) {
                let _ = self.limiter.until_n_ready(n).await;
            }
            bytes -= take;
        }
    }
}

/// Where a job's bytes come from.
#[derive(Debug, Clone)]
pub struct ByteSource {
    pub url: String,
    pub headers: HeaderMap,
    /// Send `Range` headers. Off for servers without range support.
    pub ranged: bool,
}

pub struct SegmentFetcher {
    client: Client,
    source: Arc<ByteSource>,
    policy: RetryPolicy,
    request_timeout: Duration,
    throttle: Option<Arc<Throttle>>,
}

impl SegmentFetcher {
    pub fn new(
        client: Client,
        source: Arc<ByteSource>,
        policy: RetryPolicy,
        request_timeout: Duration,
        throttle: Option<Arc<Throttle>>,
    ) -> Self {
        Self {
            client,
            source,
            policy,
            request_timeout,
            throttle,
        }
    }

    /// Downloads `segment` into `file` at the segment's offset.
    ///
    /// `on_progress` receives the number of new bytes after each chunk.
    /// Bytes rewritten by a retry are not reported twice.
    pub async fn fetch<F>(
        &self,
        segment: &Segment,
        file: &mut File,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<u64, FetchError>
    where
        F: FnMut(u64),
    {
        let mut reported = 0u64;
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let err = match self
                .attempt(segment, file, cancel, &mut reported, &mut on_progress)
                .await
            {
                Ok(written) => return Ok(written),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.policy.retries {
                return Err(FetchError::Exhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.delay(attempt);
            attempt += 1;
            warn!(
                segment = segment.index,
                attempt,
                error = %err,
                "segment failed, retrying in {:?}",
                delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt<F>(
        &self,
        segment: &Segment,
        file: &mut File,
        cancel: &CancellationToken,
        reported: &mut u64,
        on_progress: &mut F,
    ) -> Result<u64, FetchError>
    where
        F: FnMut(u64),
    {
        let expected = segment.len();
        let mut request = self
            .client
            .get(&self.source.url)
            .headers(self.source.headers.clone());
        if self.source.ranged {
            if let Some(range) = segment.range_header() {
                request = request.header(header::RANGE, range);
            }
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            sent = tokio::time::timeout(self.request_timeout, request.send()) => match sent {
                Err(_) => return Err(FetchError::Transient("request timed out".to_string())),
                Ok(result) => result?,
            },
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }
        if self.source.ranged && status == StatusCode::OK && segment.start != 0 {
            return Err(FetchError::Permanent(
                "server ignored the range request".to_string(),
            ));
        }
        if status == StatusCode::PARTIAL_CONTENT {
            check_content_range(response.headers(), segment)?;
        }

        if expected.is_none() {
            // open-ended transfers restart from zero
            file.set_len(0).await?;
        }
        file.seek(SeekFrom::Start(segment.start)).await?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = tokio::time::timeout(self.request_timeout, stream.next()) => next
                    .map_err(|_| FetchError::Transient("read timed out".to_string()))?,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            let mut data = &chunk[..];
            if let Some(len) = expected {
                let remaining = (len - written) as usize;
                if data.len() > remaining {
                    data = &data[..remaining];
                }
            }
            if !data.is_empty() {
                if let Some(throttle) = &self.throttle {
                    throttle.consume(data.len()).await;
                }
                file.write_all(data).await?;
                written += data.len() as u64;
                if written > *reported {
                    on_progress(written - *reported);
                    *reported = written;
                }
            }
            if expected == Some(written) {
                break;
            }
        }

        if let Some(len) = expected {
            if written != len {
                return Err(FetchError::ShortRead {
                    expected: len,
                    received: written,
                });
            }
        }
        file.flush().await?;
        file.sync_data().await?;
        debug!(segment = segment.index, bytes = written, "segment complete");
        Ok(written)
    }
}

/// A 206 must cover exactly the bytes that were asked for.
fn check_content_range(headers: &HeaderMap, segment: &Segment) -> Result<(), FetchError> {
    let value = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let matches = match parse_content_range(value) {
        Some((start, end, _)) => {
            start == segment.start && segment.end_inclusive.map_or(true, |want| want == end)
        }
        None => false,
    };
    if matches {
        Ok(())
    } else {
        Err(FetchError::Permanent(format!(
            "partial response for segment {} has Content-Range {:?}",
            segment.index, value
        )))
    }
}
