//! Test doubles: an axum server for byte sources with range support and
//! failure injection, a fixed extractor and a recording muxer.

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{self, header, HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use futures::stream::{self, Stream};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::{MuxError, ResolveError};
use crate::extractor::Extractor;
use crate::model::VideoInfo;
use crate::muxer::Muxer;

/// Deterministic, non-repeating-looking bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(31).wrapping_add(i as u64 >> 8) as u8) ^ seed)
        .collect()
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("test client")
}

#[derive(Debug, Clone)]
pub struct Resource {
    body: Vec<u8>,
    ranges: bool,
    send_length: bool,
    etag: Option<String>,
    status: Option<u16>,
    reject_head: bool,
    fail_first: usize,
    truncate_first: usize,
    stall_first: usize,
    stall: Duration,
    chunk_delay: Option<Duration>,
    slow_from: u64,
    forbid_from: Option<u64>,
    shift: u64,
}

impl Resource {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ranges: true,
            send_length: true,
            etag: None,
            status: None,
            reject_head: false,
            fail_first: 0,
            truncate_first: 0,
            stall_first: 0,
            stall: Duration::ZERO,
            chunk_delay: None,
            slow_from: 0,
            forbid_from: None,
            shift: 0,
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    /// Bodies go out chunked, without `Content-Length`.
    pub fn without_length(mut self) -> Self {
        self.send_length = false;
        self
    }

    pub fn with_etag(mut self, etag: &str) -> Self {
        self.etag = Some(etag.to_string());
        self
    }

    /// Answer every request with this status and no body.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn rejecting_head(mut self) -> Self {
        self.reject_head = true;
        self
    }

    /// The first `n` GET requests get a 503.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// The first `n` GET requests get half the requested bytes.
    pub fn truncating_first(mut self, n: usize) -> Self {
        self.truncate_first = n;
        self
    }

    /// The first `n` GET requests send headers, then wait `pause` before any body byte.
    pub fn stalling_first(mut self, n: usize, pause: Duration) -> Self {
        self.stall_first = n;
        self.stall = pause;
        self
    }

    /// Send bodies 1 KiB at a time with this pause before each piece.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Ranged GETs starting at or after `offset` get a 403.
    pub fn forbidding_from(mut self, offset: u64) -> Self {
        self.forbid_from = Some(offset);
        self
    }

    /// Partial responses start `by` bytes after the requested offset.
    pub fn shifting_ranges(mut self, by: u64) -> Self {
        self.shift = by;
        self
    }

    /// Only ranges starting at or after `offset` are slowed down.
    pub fn slow_from(mut self, offset: u64) -> Self {
        self.slow_from = offset;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLog {
    pub method: String,
    pub range: Option<(u64, u64)>,
}

#[derive(Default)]
struct ServerState {
    resources: HashMap<String, Resource>,
    requests: HashMap<String, Vec<RequestLog>>,
    in_flight: usize,
    max_in_flight: usize,
}

type SharedState = Arc<Mutex<ServerState>>;

pub struct TestServer {
    addr: SocketAddr,
    state: SharedState,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = SharedState::default();
        let app = Router::new()
            .fallback(serve_resource)
            .with_state(state.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn add(&self, path: &str, resource: Resource) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(path.to_string(), resource);
    }

    /// GET requests seen for `path`, in arrival order.
    pub fn requests(&self, path: &str) -> Vec<RequestLog> {
        self.state
            .lock()
            .unwrap()
            .requests
            .get(path)
            .map(|logs| logs.iter().filter(|r| r.method == "GET").cloned().collect())
            .unwrap_or_default()
    }

    /// Most GET bodies being sent at the same time, over all paths.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_resource(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range);
    let path = uri.path().to_string();

    let reply = {
        let mut server = state.lock().unwrap();
        server.requests.entry(path.clone()).or_default().push(RequestLog {
            method: method.to_string(),
            range,
        });
        match server.resources.get_mut(&path) {
            None => Reply::status(StatusCode::NOT_FOUND),
            Some(resource) => reply_for(resource, &method, range),
        }
    };
    reply.into_response(&state)
}

enum Payload {
    Empty,
    /// Headers only; no length is implied by the body.
    Head,
    Bytes {
        body: Vec<u8>,
        chunk_delay: Option<Duration>,
        stall: Option<Duration>,
    },
}

struct Reply {
    status: StatusCode,
    headers: Vec<(HeaderName, String)>,
    payload: Payload,
}

impl Reply {
    fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: vec![(header::CONTENT_LENGTH, "0".to_string())],
            payload: Payload::Empty,
        }
    }

    fn into_response(self, state: &SharedState) -> Response {
        let mut builder = http::Response::builder().status(self.status);
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        let body = match self.payload {
            Payload::Empty => Body::empty(),
            Payload::Head => Body::from_stream(stream::empty::<Result<Bytes, Infallible>>()),
            Payload::Bytes {
                body,
                chunk_delay,
                stall,
            } => Body::from_stream(paced(body, chunk_delay, stall, InFlight::enter(state.clone()))),
        };
        builder.body(body).expect("valid test response")
    }
}

/// Counts a GET body as in flight until its last piece is handed out.
struct InFlight(SharedState);

impl InFlight {
    fn enter(state: SharedState) -> Self {
        {
            let mut server = state.lock().unwrap();
            server.in_flight += 1;
            server.max_in_flight = server.max_in_flight.max(server.in_flight);
        }
        Self(state)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut server) = self.0.lock() {
            server.in_flight -= 1;
        }
    }
}

fn paced(
    body: Vec<u8>,
    chunk_delay: Option<Duration>,
    stall: Option<Duration>,
    guard: InFlight,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let pieces: Vec<Bytes> = match chunk_delay {
        Some(_) => body.chunks(1024).map(Bytes::copy_from_slice).collect(),
        None if body.is_empty() => vec![],
        None => vec![Bytes::from(body)],
    };
    stream::unfold(
        (pieces.into_iter().peekable(), stall, Some(guard)),
        move |(mut pieces, mut stall, mut guard)| async move {
            let piece = pieces.next()?;
            if let Some(pause) = stall.take() {
                tokio::time::sleep(pause).await;
            }
            if let Some(pause) = chunk_delay {
                tokio::time::sleep(pause).await;
            }
            if pieces.peek().is_none() {
                drop(guard.take());
            }
            Some((Ok(piece), (pieces, stall, guard)))
        },
    )
}

fn reply_for(resource: &mut Resource, method: &Method, range: Option<(u64, u64)>) -> Reply {
    if let Some(code) = resource.status {
        return Reply::status(StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    }
    if method == Method::HEAD && resource.reject_head {
        return Reply::status(StatusCode::METHOD_NOT_ALLOWED);
    }
    if method == Method::GET && resource.fail_first > 0 {
        resource.fail_first -= 1;
        return Reply::status(StatusCode::SERVICE_UNAVAILABLE);
    }
    if let (Some(limit), Some((start, _))) = (resource.forbid_from, range) {
        if method == Method::GET && start >= limit {
            return Reply::status(StatusCode::FORBIDDEN);
        }
    }

    let total = resource.body.len() as u64;
    let mut headers = vec![];
    if resource.ranges {
        headers.push((header::ACCEPT_RANGES, "bytes".to_string()));
    }
    if let Some(etag) = &resource.etag {
        headers.push((header::ETAG, etag.clone()));
    }

    let (status, start, end) = match range {
        Some((start, end)) if resource.ranges && start + resource.shift < total => {
            let start = start + resource.shift;
            let end = end.min(total - 1);
            headers.push((header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total)));
            (StatusCode::PARTIAL_CONTENT, start, end + 1)
        }
        _ => (StatusCode::OK, 0, total),
    };
    let mut body = resource.body[start as usize..end as usize].to_vec();

    if method == Method::HEAD {
        if resource.send_length {
            headers.push((header::CONTENT_LENGTH, body.len().to_string()));
        }
        return Reply {
            status,
            headers,
            payload: Payload::Head,
        };
    }

    if resource.truncate_first > 0 {
        resource.truncate_first -= 1;
        body.truncate(body.len() / 2);
    }
    let stall = (resource.stall_first > 0).then(|| {
        resource.stall_first -= 1;
        resource.stall
    });
    if resource.send_length {
        headers.push((header::CONTENT_LENGTH, body.len().to_string()));
    }
    let chunk_delay = resource.chunk_delay.filter(|_| start >= resource.slow_from);
    Reply {
        status,
        headers,
        payload: Payload::Bytes {
            body,
            chunk_delay,
            stall,
        },
    }
}

/// `bytes=10-19` -> `(10, 19)`; open-ended ranges run to `u64::MAX`.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = if end.trim().is_empty() {
        u64::MAX
    } else {
        end.trim().parse().ok()?
    };
    Some((start, end))
}

/// Resolves every URL to the same info.
pub struct StaticExtractor {
    info: VideoInfo,
}

impl StaticExtractor {
    pub fn new(info: VideoInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl Extractor for StaticExtractor {
    async fn resolve(&self, _page_url: &str) -> Result<VideoInfo, ResolveError> {
        Ok(self.info.clone())
    }
}

/// Concatenates video then audio into the output and remembers the call.
#[derive(Default)]
pub struct RecordingMuxer {
    calls: Mutex<Vec<(PathBuf, PathBuf, PathBuf)>>,
    inputs: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    fail: bool,
}

impl RecordingMuxer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, PathBuf, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }

    /// Contents of the inputs at the time of each call.
    pub fn inputs(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Muxer for RecordingMuxer {
    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), MuxError> {
        self.calls.lock().unwrap().push((
            video.to_path_buf(),
            audio.to_path_buf(),
            output.to_path_buf(),
        ));
        let v = tokio::fs::read(video).await?;
        let a = tokio::fs::read(audio).await?;
        self.inputs.lock().unwrap().push((v.clone(), a.clone()));
        if self.fail {
            return Err(MuxError::NotFound("recording-muxer".to_string()));
        }
        tokio::fs::write(output, [v, a].concat()).await?;
        Ok(())
    }
}
