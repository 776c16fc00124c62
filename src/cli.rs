use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Segmented, resumable video downloader", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also write debug logs to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a video page
    Download(DownloadArgs),
    /// Show the title, duration and available formats of a page
    Info(InfoArgs),
    /// List unfinished downloads that can be resumed
    List(ListArgs),
}

#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    /// Page URL
    pub url: String,

    /// Format id, or `<video>+<audio>` to merge two streams (default: best)
    #[arg(short, long)]
    pub format: Option<String>,

    /// Directory to save downloaded files
    #[arg(short, long, default_value = "downloads")]
    pub output: PathBuf,

    /// Maximum number of concurrent segment transfers (defaults to number of logical CPUs)
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Target segment size in bytes
    #[arg(short = 's', long = "segment-size")]
    pub segment_size: Option<u64>,

    /// Retries per segment for transient failures
    #[arg(long)]
    pub retries: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long = "request-timeout")]
    pub request_timeout: Option<u64>,

    /// Per-job timeout in seconds
    #[arg(long = "job-timeout")]
    pub job_timeout: Option<u64>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short, long = "rate-limit")]
    pub rate_limit: Option<u32>,

    /// Where resume records are kept (default: <output>/.vidl)
    #[arg(long = "state-dir")]
    pub state_dir: Option<PathBuf>,

    /// Delete partial files and resume records when a download fails
    #[arg(long)]
    pub cleanup: bool,

    /// Disable progress bars
    #[arg(long = "no-progress")]
    pub no_progress: bool,

    #[arg(long = "yt-dlp", default_value = "yt-dlp")]
    pub yt_dlp: PathBuf,

    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct InfoArgs {
    /// Page URL
    pub url: String,

    #[arg(long = "yt-dlp", default_value = "yt-dlp")]
    pub yt_dlp: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct ListArgs {
    /// Directory downloads were saved to
    #[arg(short, long, default_value = "downloads")]
    pub output: PathBuf,

    /// Resume record directory (default: <output>/.vidl)
    #[arg(long = "state-dir")]
    pub state_dir: Option<PathBuf>,
}
