use std::path::{Path, PathBuf};
use url::Url;

/// Last path segment of a URL, if it has one.
pub fn get_filename_from_url(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    url.path_segments()?
        .last()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Keeps titles readable (including non-ASCII) but strips path separators
/// and characters most filesystems reject.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn output_path(dir: &Path, title: &str, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", sanitize_filename(title), ext))
}

/// Intermediate file of one stream of a merged download, e.g. `clip.f137.mp4`.
pub fn stream_path(dir: &Path, title: &str, format_id: &str, ext: &str) -> PathBuf {
    dir.join(format!(
        "{}.f{}.{}",
        sanitize_filename(title),
        sanitize_filename(format_id),
        ext
    ))
}

/// `clip.mp4` -> `clip.mp4.part`
pub fn part_path(path: &Path) -> PathBuf {
    let mut part = path.to_path_buf();
    match path.extension() {
        Some(extension) => {
            let mut ext = extension.to_os_string();
            ext.push(".part");
            part.set_extension(ext);
        }
        None => {
            part.set_extension("part");
        }
    }
    part
}
