use std::cmp::Ordering;

use crate::error::ResolveError;
use crate::model::{FormatDescriptor, VideoInfo};

/// What to download for one page.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Single(FormatDescriptor),
    Merge {
        video: FormatDescriptor,
        audio: FormatDescriptor,
    },
}

/// Picks formats by id (`137`, `137+140`, `bestvideo+bestaudio`), or the
/// best video+audio pair when no id is given.
pub fn select(info: &VideoInfo, requested: Option<&str>) -> Result<Selection, ResolveError> {
    let requested = requested.map(str::trim).filter(|r| !r.is_empty());
    match requested {
        None | Some("best") => best(info),
        Some(spec) => match spec.split_once('+') {
            Some((video, audio)) => Ok(Selection::Merge {
                video: pick(info, video, best_video)?,
                audio: pick(info, audio, best_audio)?,
            }),
            None => Ok(Selection::Single(pick(info, spec, best_combined)?)),
        },
    }
}

fn pick(
    info: &VideoInfo,
    id: &str,
    fallback: fn(&VideoInfo) -> Option<&FormatDescriptor>,
) -> Result<FormatDescriptor, ResolveError> {
    let found = match id {
        "bestvideo" | "bestaudio" | "best" => fallback(info),
        id => info.format(id),
    };
    found
        .cloned()
        .ok_or_else(|| ResolveError::FormatNotFound(id.to_string()))
}

fn best(info: &VideoInfo) -> Result<Selection, ResolveError> {
    let video = info.formats.iter().filter(|f| f.is_video_only()).max_by(video_rank);
    let audio = info.formats.iter().filter(|f| f.is_audio_only()).max_by(audio_rank);
    let combined = best_combined(info);

    if let (Some(video), Some(audio)) = (video, audio) {
        // a separate stream pair is only worth merging if it beats the best combined file
        let merged_wins = combined.map_or(true, |c| c.height.unwrap_or(0) <= video.height.unwrap_or(0));
        if merged_wins {
            return Ok(Selection::Merge {
                video: video.clone(),
                audio: audio.clone(),
            });
        }
    }
    combined
        .or(video)
        .or(audio)
        .cloned()
        .map(Selection::Single)
        .ok_or(ResolveError::NoFormats)
}

fn best_video(info: &VideoInfo) -> Option<&FormatDescriptor> {
    info.formats
        .iter()
        .filter(|f| f.has_video())
        .max_by(|a, b| a.is_video_only().cmp(&b.is_video_only()).then(video_rank(a, b)))
}

fn best_audio(info: &VideoInfo) -> Option<&FormatDescriptor> {
    info.formats
        .iter()
        .filter(|f| f.has_audio())
        .max_by(|a, b| a.is_audio_only().cmp(&b.is_audio_only()).then(audio_rank(a, b)))
}

fn best_combined(info: &VideoInfo) -> Option<&FormatDescriptor> {
    info.formats
        .iter()
        .filter(|f| f.has_video() && f.has_audio())
        .max_by(video_rank)
}

fn video_rank(a: &&FormatDescriptor, b: &&FormatDescriptor) -> Ordering {
    a.height
        .unwrap_or(0)
        .cmp(&b.height.unwrap_or(0))
        .then(a.tbr.unwrap_or(0.0).total_cmp(&b.tbr.unwrap_or(0.0)))
}

fn audio_rank(a: &&FormatDescriptor, b: &&FormatDescriptor) -> Ordering {
    let bitrate = |f: &FormatDescriptor| f.abr.or(f.tbr).unwrap_or(0.0);
    bitrate(*a).total_cmp(&bitrate(*b))
}

/// Container for a merged pair: keep the inputs' family when they agree.
pub fn merge_container(video_ext: &str, audio_ext: &str) -> &'static str {
    match (video_ext, audio_ext) {
        ("mp4", "m4a" | "mp4") => "mp4",
        ("webm", "webm") => "webm",
        _ => "mkv",
    }
}
