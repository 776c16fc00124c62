use anyhow::{Context, Result};
use indicatif::HumanBytes;
use std::io::IsTerminal;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};
use url::Url;

use crate::cli::{DownloadArgs, InfoArgs, ListArgs};
use crate::config::{DownloadConfig, STATE_DIR_NAME};
use crate::coordinator::DownloadCoordinator;
use crate::error::{DownloadError, ResolveError};
use crate::extractor::{Extractor, YtDlpExtractor};
use crate::muxer::FfmpegMuxer;
use crate::resume::ResumeStore;

/// Page URLs must be absolute http(s) URLs before anything is spawned.
fn check_page_url(page_url: &str) -> Result<(), DownloadError> {
    match Url::parse(page_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        _ => Err(ResolveError::Unsupported(page_url.to_string()).into()),
    }
}

pub fn build_config(args: &DownloadArgs) -> DownloadConfig {
    let mut config = DownloadConfig::new(args.output.clone());
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency.max(1);
    }
    if let Some(segment_size) = args.segment_size {
        config.segment_size = segment_size.max(1);
    }
    if let Some(retries) = args.retries {
        config.retry.retries = retries;
    }
    if let Some(secs) = args.request_timeout {
        config.request_timeout = Duration::from_secs(secs.max(1));
    }
    config.job_timeout = args.job_timeout.map(Duration::from_secs);
    config.rate_limit = args.rate_limit.and_then(NonZeroU32::new);
    config.cleanup_on_failure = args.cleanup;
    config.show_progress = !args.no_progress && std::io::stderr().is_terminal();
    config
}

pub async fn run_download(args: DownloadArgs) -> Result<()> {
    check_page_url(&args.url)?;
    let config = build_config(&args);
    fs::create_dir_all(&config.output_dir)
        .await
        .context("Failed to create output directory")?;
    info!(
        output = ?config.output_dir,
        concurrency = config.concurrency,
        segment_size = config.segment_size,
        "starting download"
    );

    let coordinator = DownloadCoordinator::new(
        config,
        Arc::new(YtDlpExtractor::new(args.yt_dlp)),
        Arc::new(FfmpegMuxer::new(args.ffmpeg)),
    );
    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after in-flight chunks");
            cancel.cancel();
        }
    });

    let outcome = coordinator.download(&args.url, args.format.as_deref()).await?;
    if outcome.skipped {
        println!("Already downloaded: {}", outcome.output.display());
    } else {
        println!("Saved \"{}\" to {}", outcome.title, outcome.output.display());
    }
    Ok(())
}

pub async fn show_info(args: InfoArgs) -> Result<()> {
    check_page_url(&args.url)?;
    let extractor = YtDlpExtractor::new(args.yt_dlp);
    let info = extractor
        .resolve(&args.url)
        .await
        .map_err(DownloadError::from)?;

    println!("Title: {}", info.title);
    println!("Duration: {}", info.duration_label());
    println!();
    println!("{:<4} {:<12} {:<40} {:<12} {:<12}", "#", "Format", "Description", "Video", "Audio");
    println!("{:-<4} {:-<12} {:-<40} {:-<12} {:-<12}", "", "", "", "", "");
    for (i, format) in info.media_formats().enumerate() {
        println!(
            "{:<4} {:<12} {:<40} {:<12} {:<12}",
            i + 1,
            format.format_id,
            format.describe(),
            format.vcodec.as_deref().unwrap_or("-"),
            format.acodec.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn list_records(args: ListArgs) -> Result<()> {
    let state_dir = args
        .state_dir
        .unwrap_or_else(|| args.output.join(STATE_DIR_NAME));
    let store = ResumeStore::new(state_dir.clone());
    let records = store.list().await?;
    if records.is_empty() {
        println!("No unfinished downloads in {:?}.", state_dir);
        return Ok(());
    }

    let done_bytes: u64 = records.iter().map(|r| r.completed_bytes()).sum();
    let known_bytes: u64 = records.iter().filter_map(|r| r.identity.content_length).sum();
    println!(
        "Summary: Unfinished: {} | Downloaded: {} / {}",
        records.len(),
        HumanBytes(done_bytes),
        HumanBytes(known_bytes)
    );
    println!();

    println!("{:<50} {:<12} {:<15} {:<12} {:<20}", "Filename", "Segments", "Progress", "Size", "Updated");
    println!("{:-<50} {:-<12} {:-<15} {:-<12} {:-<20}", "", "", "", "", "");
    for record in &records {
        let progress = match record.identity.content_length {
            Some(total) if total > 0 => format!("{:.2}%", record.completed_bytes() as f64 / total as f64 * 100.0),
            _ => "-".to_string(),
        };
        let size = record
            .identity
            .content_length
            .map(|total| HumanBytes(total).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "{:<50} {:<12} {:<15} {:<12} {:<20}",
            display_name(&record.identity.destination),
            format!("{}/{}", record.done.len(), record.segment_count),
            progress,
            size,
            record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
    }
    Ok(())
}

fn display_name(destination: &Path) -> String {
    destination
        .file_name()
        .map(|name| name.to_string_lossy().trim_end_matches(".part").to_string())
        .unwrap_or_else(|| destination.display().to_string())
}
