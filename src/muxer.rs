use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::MuxError;

/// Combines a video-only and an audio-only file into one container.
#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), MuxError>;
}

pub struct FfmpegMuxer {
    program: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_args(video: &Path, audio: &Path, output: &Path) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = ["-y", "-loglevel", "error", "-i"]
            .into_iter()
            .map(std::ffi::OsString::from)
            .collect();
        args.push(video.into());
        args.push("-i".into());
        args.push(audio.into());
        for arg in ["-map", "0:v:0", "-map", "1:a:0", "-c", "copy"] {
            args.push(arg.into());
        }
        args.push(output.into());
        args
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), MuxError> {
        info!(output = ?output, "merging video and audio");
        let result = Command::new(&self.program)
            .args(Self::build_args(video, audio, output))
            .kill_on_drop(true)
            .output()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MuxError::NotFound(self.program.to_string_lossy().to_string()))
            }
            Err(e) => return Err(MuxError::Io(e)),
        };

        if !out.status.success() {
            // leave no half-written container behind
            let _ = tokio::fs::remove_file(output).await;
            return Err(MuxError::Failed {
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        debug!(output = ?output, "muxer finished");
        Ok(())
    }
}
