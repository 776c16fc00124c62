use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::PlanError;
use crate::state::CompletionBitmap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// A contiguous byte range of the resource, fetched as one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    /// `None` for the open-ended segment of a resource of unknown length.
    pub end_inclusive: Option<u64>,
    pub state: SegmentState,
}

impl Segment {
    pub fn len(&self) -> Option<u64> {
        self.end_inclusive.map(|end| end - self.start + 1)
    }

    pub fn range_header(&self) -> Option<String> {
        self.end_inclusive
            .map(|end| format!("bytes={}-{}", self.start, end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub total_length: Option<u64>,
    pub segment_size: u64,
    /// Whether the source honours range requests. A non-resumable plan
    /// always has a single segment and restarts from zero.
    pub resumable: bool,
    pub segments: Vec<Segment>,
}

impl SegmentPlan {
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|s| s.state == SegmentState::Pending)
    }

    pub fn done_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.state == SegmentState::Done)
            .count()
    }

    pub fn done_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.state == SegmentState::Done)
            .filter_map(Segment::len)
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(|s| s.state == SegmentState::Done)
    }

    pub fn mark(&mut self, index: usize, state: SegmentState) {
        if let Some(segment) = self.segments.get_mut(index) {
            segment.state = state;
        }
    }

    pub fn apply_completed(&mut self, bitmap: &CompletionBitmap) {
        for segment in self.segments.iter_mut() {
            if bitmap.is_done(segment.index) {
                segment.state = SegmentState::Done;
            }
        }
    }
}

/// What a HEAD request told us about the byte source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceProbe {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub etag: Option<String>,
}

/// Splits a resource into segments of `segment_size_hint` bytes, growing the
/// segment size when that would produce more than `max_segments` segments.
pub fn plan(probe: &SourceProbe, segment_size_hint: u64, max_segments: usize) -> SegmentPlan {
    let total = match (probe.content_length, probe.accept_ranges) {
        (Some(total), true) => total,
        (total, _) => return single_segment(total),
    };

    let hint = segment_size_hint.max(1);
    if total == 0 {
        return SegmentPlan {
            total_length: Some(0),
            segment_size: hint,
            resumable: true,
            segments: vec![],
        };
    }

    let max_segments = max_segments.max(1) as u64;
    let mut segment_size = hint;
    if total.div_ceil(segment_size) > max_segments {
        segment_size = total.div_ceil(max_segments);
    }

    let count = total.div_ceil(segment_size);
    let segments = (0..count)
        .map(|i| {
            let start = i * segment_size;
            let end = (start + segment_size).min(total) - 1;
            Segment {
                index: i as usize,
                start,
                end_inclusive: Some(end),
                state: SegmentState::Pending,
            }
        })
        .collect();

    SegmentPlan {
        total_length: Some(total),
        segment_size,
        resumable: true,
        segments,
    }
}

fn single_segment(total: Option<u64>) -> SegmentPlan {
    let segments = match total {
        Some(0) => vec![],
        _ => vec![Segment {
            index: 0,
            start: 0,
            end_inclusive: total.map(|t| t - 1),
            state: SegmentState::Pending,
        }],
    };
    SegmentPlan {
        total_length: total,
        segment_size: total.unwrap_or(0),
        resumable: false,
        segments,
    }
}

/// Reads length, range support and entity tag of a byte source.
///
/// Servers that reject HEAD are asked for the first byte instead, and the
/// total is taken from `Content-Range`.
pub async fn probe(client: &Client, url: &str, headers: &HeaderMap) -> Result<SourceProbe, PlanError> {
    url::Url::parse(url).map_err(|_| PlanError::InvalidUrl(url.to_string()))?;

    let response = client
        .head(url)
        .headers(headers.clone())
        .send()
        .await
        .map_err(|source| PlanError::Request {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
        debug!(url, "HEAD rejected, probing with a one-byte range request");
        return probe_with_range(client, url, headers).await;
    }
    if !status.is_success() {
        return Err(PlanError::Status {
            url: url.to_string(),
            status,
        });
    }

    let probe = SourceProbe {
        // reqwest reports a zero length for HEAD bodies, so read the header itself
        content_length: header_u64(response.headers(), header::CONTENT_LENGTH),
        accept_ranges: accepts_byte_ranges(response.headers()),
        etag: header_string(response.headers(), header::ETAG),
    };
    debug!(url, ?probe, "probed byte source");
    Ok(probe)
}

async fn probe_with_range(client: &Client, url: &str, headers: &HeaderMap) -> Result<SourceProbe, PlanError> {
    let response = client
        .get(url)
        .headers(headers.clone())
        .header(header::RANGE, "bytes=0-0")
        .send()
        .await
        .map_err(|source| PlanError::Request {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    let etag = header_string(response.headers(), header::ETAG);
    match status {
        StatusCode::PARTIAL_CONTENT => Ok(SourceProbe {
            content_length: header_string(response.headers(), header::CONTENT_RANGE)
                .and_then(|v| parse_content_range_total(&v)),
            accept_ranges: true,
            etag,
        }),
        s if s.is_success() => Ok(SourceProbe {
            content_length: header_u64(response.headers(), header::CONTENT_LENGTH),
            accept_ranges: false,
            etag,
        }),
        status => Err(PlanError::Status {
            url: url.to_string(),
            status,
        }),
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn header_u64(headers: &HeaderMap, name: header::HeaderName) -> Option<u64> {
    header_string(headers, name).and_then(|v| v.parse().ok())
}

fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    header_string(headers, header::ACCEPT_RANGES)
        .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
        .unwrap_or(false)
}

/// `bytes 200-299/1234` -> `(200, 299, Some(1234))`
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let (range, total) = value.trim().strip_prefix("bytes ")?.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, end, total.trim().parse().ok()))
}

/// `bytes 0-0/1234` -> `1234`
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Resource, TestServer};

    fn ranged(total: u64) -> SourceProbe {
        SourceProbe {
            content_length: Some(total),
            accept_ranges: true,
            etag: None,
        }
    }

    #[test]
    fn test_segments_partition_the_resource() {
        for total in [1u64, 2, 7, 100, 1023, 1024, 1025, 10 * 1024 * 1024 + 3] {
            for hint in [1u64, 3, 512, 1024, 4096, 2 * 1024 * 1024] {
                let plan = plan(&ranged(total), hint, 64);
                assert!(plan.segment_count() <= 64, "total={total} hint={hint}");

                let mut expected_start = 0;
                for (i, segment) in plan.segments.iter().enumerate() {
                    assert_eq!(segment.index, i);
                    assert_eq!(segment.start, expected_start, "gap or overlap at segment {i}");
                    expected_start = segment.end_inclusive.unwrap() + 1;
                }
                assert_eq!(expected_start, total);
                let sum: u64 = plan.segments.iter().filter_map(Segment::len).sum();
                assert_eq!(sum, total);
            }
        }
    }

    #[test]
    fn test_fixed_size_segments_with_short_tail() {
        let mb = 1024 * 1024;
        let plan = plan(&ranged(10 * mb + 5), 2 * mb, 12);
        assert_eq!(plan.segment_count(), 6);
        assert_eq!(plan.segments[0].len(), Some(2 * mb));
        assert_eq!(plan.segments[5].len(), Some(5));
        assert_eq!(plan.segments[1].range_header().unwrap(), format!("bytes={}-{}", 2 * mb, 4 * mb - 1));
    }

    #[test]
    fn test_segment_count_is_capped() {
        let plan = plan(&ranged(1000), 10, 4);
        assert_eq!(plan.segment_count(), 4);
        assert_eq!(plan.segment_size, 250);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let probe = ranged(123_457);
        assert_eq!(plan(&probe, 4096, 12), plan(&probe, 4096, 12));
    }

    #[test]
    fn test_unknown_length_gives_one_open_segment() {
        let probe = SourceProbe {
            content_length: None,
            accept_ranges: true,
            etag: None,
        };
        let plan = plan(&probe, 1024, 8);
        assert_eq!(plan.segment_count(), 1);
        assert_eq!(plan.segments[0].end_inclusive, None);
        assert!(!plan.resumable);
    }

    #[test]
    fn test_no_range_support_gives_one_whole_segment() {
        let probe = SourceProbe {
            content_length: Some(5000),
            accept_ranges: false,
            etag: None,
        };
        let plan = plan(&probe, 1024, 8);
        assert_eq!(plan.segment_count(), 1);
        assert_eq!(plan.segments[0].len(), Some(5000));
        assert!(!plan.resumable);
    }

    #[test]
    fn test_empty_resource_has_no_segments() {
        let plan = plan(&ranged(0), 1024, 8);
        assert!(plan.segments.is_empty());
        assert!(plan.is_complete());
    }

    #[test]
    fn test_apply_completed_marks_done() {
        let mut plan = plan(&ranged(400), 100, 8);
        plan.apply_completed(&CompletionBitmap::from_indices(4, [0, 1, 3]));
        let pending: Vec<usize> = plan.pending().map(|s| s.index).collect();
        assert_eq!(pending, vec![2]);
        assert_eq!(plan.done_count(), 3);
        assert_eq!(plan.done_bytes(), 300);
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 200-299/1234"), Some((200, 299, Some(1234))));
        assert_eq!(parse_content_range("bytes 0-9/*"), Some((0, 9, None)));
        assert_eq!(parse_content_range("bytes */1234"), None);
        assert_eq!(parse_content_range("bytes 9-0/10"), None);
        assert_eq!(parse_content_range("items 0-9/10"), None);
    }

    #[tokio::test]
    async fn test_probe_reads_headers() {
        let server = TestServer::start().await;
        server.add("/ranged", Resource::new(testing::pattern(4096, 1)).with_etag("\"v1\""));
        server.add("/plain", Resource::new(testing::pattern(100, 2)).without_ranges());

        let client = testing::client();
        let probe_ranged = probe(&client, &server.url("/ranged"), &HeaderMap::new()).await.unwrap();
        assert_eq!(probe_ranged.content_length, Some(4096));
        assert!(probe_ranged.accept_ranges);
        assert_eq!(probe_ranged.etag.as_deref(), Some("\"v1\""));

        let probe_plain = probe(&client, &server.url("/plain"), &HeaderMap::new()).await.unwrap();
        assert_eq!(probe_plain.content_length, Some(100));
        assert!(!probe_plain.accept_ranges);
    }

    #[tokio::test]
    async fn test_probe_missing_resource_is_plan_error() {
        let server = TestServer::start().await;
        let err = probe(&testing::client(), &server.url("/missing"), &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Status { status, .. } if status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_probe_falls_back_when_head_rejected() {
        let server = TestServer::start().await;
        server.add("/nohead", Resource::new(testing::pattern(2048, 3)).rejecting_head());
        let probe = probe(&testing::client(), &server.url("/nohead"), &HeaderMap::new()).await.unwrap();
        assert_eq!(probe.content_length, Some(2048));
        assert!(probe.accept_ranges);
    }
}
