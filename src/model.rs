use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything the extractor learned about a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    /// Duration in seconds, when the site reports one.
    pub duration: Option<f64>,
    pub formats: Vec<FormatDescriptor>,
}

impl VideoInfo {
    pub fn duration_label(&self) -> String {
        let total = self.duration.unwrap_or(0.0).max(0.0) as u64;
        format!("{} min {} s", total / 60, total % 60)
    }

    /// Formats carrying at least one of audio or video.
    pub fn media_formats(&self) -> impl Iterator<Item = &FormatDescriptor> {
        self.formats.iter().filter(|f| f.has_video() || f.has_audio())
    }

    pub fn format(&self, format_id: &str) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|f| f.format_id == format_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub ext: String,
    /// `None` when the stream carries no video.
    pub vcodec: Option<String>,
    /// `None` when the stream carries no audio.
    pub acodec: Option<String>,
    pub resolution: Option<String>,
    pub height: Option<u32>,
    /// Total bitrate in kbps.
    pub tbr: Option<f64>,
    /// Audio bitrate in kbps.
    pub abr: Option<f64>,
    pub url: String,
    pub filesize: Option<u64>,
    pub format_note: Option<String>,
    /// Headers the byte source expects (user agent, referer, cookies).
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
}

impl FormatDescriptor {
    pub fn has_video(&self) -> bool {
        self.vcodec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.is_some()
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video() && !self.has_audio()
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    /// One listing line, e.g. `mp4 1080p 1920x1080 128kbps`.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.ext.clone()];
        if let Some(note) = &self.format_note {
            parts.push(note.clone());
        }
        if let Some(resolution) = &self.resolution {
            parts.push(resolution.clone());
        }
        if let Some(abr) = self.abr {
            parts.push(format!("{:.0}kbps", abr));
        }
        parts.join(" ")
    }
}
