//! Extractor collaborator: maps a page URL to downloadable formats.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::error::ResolveError;
use crate::model::{FormatDescriptor, VideoInfo};
use crate::utils;

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn resolve(&self, page_url: &str) -> Result<VideoInfo, ResolveError>;
}

/// Runs `yt-dlp -J` and reads its JSON.
pub struct YtDlpExtractor {
    program: PathBuf,
}

impl YtDlpExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_args(url: &str) -> Vec<String> {
        vec![
            "--dump-single-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--encoding".to_string(),
            "utf-8".to_string(),
            url.to_string(),
        ]
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn resolve(&self, page_url: &str) -> Result<VideoInfo, ResolveError> {
        url::Url::parse(page_url).map_err(|_| ResolveError::Unsupported(page_url.to_string()))?;

        debug!(program = ?self.program, page_url, "running extractor");
        let output = Command::new(&self.program)
            .args(Self::build_args(page_url))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ResolveError::ToolNotFound(self.program.to_string_lossy().to_string())
                }
                _ => ResolveError::Failed(e.to_string()),
            })?;

        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        parse_info_json(&output.stdout)
    }
}

/// Maps extractor stderr to an error kind.
pub fn classify_failure(stderr: &str) -> ResolveError {
    let message = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .unwrap_or(stderr)
        .trim()
        .to_string();
    let lower = message.to_lowercase();

    if lower.contains("unsupported url") {
        ResolveError::Unsupported(message)
    } else if lower.contains("sign in")
        || lower.contains("confirm your age")
        || lower.contains("age-restricted")
        || lower.contains("members-only")
        || lower.contains("not available in your country")
        || lower.contains("geo restriction")
    {
        ResolveError::Restricted(message)
    } else if lower.contains("private video")
        || lower.contains("video unavailable")
        || lower.contains("has been removed")
        || lower.contains("404")
    {
        ResolveError::Unavailable(message)
    } else if lower.contains("timed out")
        || lower.contains("unable to download")
        || lower.contains("connection")
    {
        ResolveError::Network(message)
    } else {
        ResolveError::Failed(message)
    }
}

#[derive(Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
    #[serde(flatten)]
    single: RawFormat,
}

#[derive(Deserialize, Default)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    resolution: Option<String>,
    height: Option<u32>,
    tbr: Option<f64>,
    abr: Option<f64>,
    url: Option<String>,
    filesize: Option<u64>,
    format_note: Option<String>,
    protocol: Option<String>,
    #[serde(default)]
    http_headers: HashMap<String, String>,
}

impl RawFormat {
    /// Only plain HTTP(S) sources can be fetched by byte range.
    fn into_descriptor(self) -> Option<FormatDescriptor> {
        let url = self.url?;
        let protocol = self.protocol.unwrap_or_else(|| "https".to_string());
        if protocol != "http" && protocol != "https" {
            return None;
        }
        Some(FormatDescriptor {
            format_id: self.format_id.unwrap_or_else(|| "0".to_string()),
            ext: self.ext.unwrap_or_else(|| "mp4".to_string()),
            vcodec: codec_tag(self.vcodec),
            acodec: codec_tag(self.acodec),
            resolution: self.resolution,
            height: self.height,
            tbr: self.tbr,
            abr: self.abr,
            url,
            filesize: self.filesize,
            format_note: self.format_note,
            http_headers: self.http_headers,
        })
    }
}

/// `"none"` means the stream is absent; a missing tag means unknown but present.
fn codec_tag(tag: Option<String>) -> Option<String> {
    match tag {
        Some(t) if t == "none" => None,
        Some(t) => Some(t),
        None => Some("unknown".to_string()),
    }
}

pub fn parse_info_json(stdout: &[u8]) -> Result<VideoInfo, ResolveError> {
    let raw: RawInfo =
        serde_json::from_slice(stdout).map_err(|e| ResolveError::Parse(e.to_string()))?;
    let fallback_title = raw
        .single
        .url
        .as_deref()
        .and_then(utils::get_filename_from_url)
        .and_then(|name| {
            Path::new(&name)
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
        });

    let mut formats: Vec<FormatDescriptor> = raw
        .formats
        .into_iter()
        .filter_map(RawFormat::into_descriptor)
        .collect();
    if formats.is_empty() {
        // sites with a single direct file report it at the top level
        formats.extend(raw.single.into_descriptor());
    }
    if formats.is_empty() {
        return Err(ResolveError::NoFormats);
    }

    Ok(VideoInfo {
        title: raw
            .title
            .or(fallback_title)
            .unwrap_or_else(|| "video".to_string()),
        duration: raw.duration,
        formats,
    })
}
