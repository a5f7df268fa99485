//! Audio extraction through an external transcoder binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to launch transcoder: {0}")]
    Launch(#[from] std::io::Error),
    #[error("transcoder timed out after {0:?}")]
    Timeout(Duration),
    #[error("transcoder exited with {status}: {stderr_tail}")]
    Failed {
        status: std::process::ExitStatus,
        stderr_tail: String,
    },
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Probe the container for an audio stream. Absence is not an error.
    async fn has_audio_stream(&self, input: &Path) -> Result<bool, TranscodeError>;

    /// Extract the audio track to `output`. The output file exists on Ok.
    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<(), TranscodeError>;
}

pub struct FfmpegTranscoder {
    binary: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<std::ffi::OsString>) -> Result<std::process::Output, TranscodeError> {
        let mut command = Command::new(&self.binary);
        command.args(&args).kill_on_drop(true);
        debug!(binary = %self.binary.display(), "spawning transcoder");
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| TranscodeError::Timeout(self.timeout))??;
        Ok(output)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn has_audio_stream(&self, input: &Path) -> Result<bool, TranscodeError> {
        // `ffmpeg -i <file>` with no output exits nonzero but prints the
        // stream table on stderr, which is all the probe needs.
        let output = self
            .run(vec![
                "-hide_banner".into(),
                "-i".into(),
                input.as_os_str().to_os_string(),
            ])
            .await?;
        let diagnostics = String::from_utf8_lossy(&output.stderr);
        Ok(diagnostics.contains("Audio:"))
    }

    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        let result = self
            .run(vec![
                "-y".into(),
                "-i".into(),
                input.as_os_str().to_os_string(),
                "-vn".into(),
                "-acodec".into(),
                "libmp3lame".into(),
                output.as_os_str().to_os_string(),
            ])
            .await?;
        if result.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail = stderr
                .lines()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            Err(TranscodeError::Failed {
                status: result.status,
                stderr_tail: tail,
            })
        }
    }
}
