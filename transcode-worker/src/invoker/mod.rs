//! Controlled invocation of the external transcoder: direct-exec argv, a
//! structured progress pipe, an absolute wall-clock ceiling, an inactivity
//! watchdog, signaled cancellation with a grace window, and a scoped
//! scratch directory whose release is guaranteed on every exit path.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use conveyor_core::ErrorCode;

pub mod args;
pub mod probe;
pub mod progress;

pub use args::{build_plan, Plan};
pub use probe::{cached_encoder_caps, EncoderCaps};
pub use progress::{compute_percent, eta_seconds, ProgressParser, ProgressReport};

const STDERR_TAIL_LINES: usize = 32;

/// State machine of one invocation:
/// `spawning → running ⇄ progress → {exited_ok | exited_error | timed_out |
/// killed}`.
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("failed to spawn transcoder: {0}")]
    Spawn(std::io::Error),
    #[error("i/o error talking to transcoder: {0}")]
    Io(#[from] std::io::Error),
    #[error("wall-clock ceiling exceeded")]
    WallClockExceeded,
    #[error("no progress within the inactivity window")]
    Stalled,
    #[error("cancelled by request")]
    Cancelled,
    #[error("transcoder exited with status {code:?}")]
    Exited { code: Option<i32> },
    #[error("input media could not be processed")]
    InvalidMedia,
}

impl InvokeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InvokeError::WallClockExceeded | InvokeError::Stalled => ErrorCode::TranscoderTimeout,
            InvokeError::Exited { .. } => ErrorCode::TranscoderCrash,
            InvokeError::InvalidMedia => ErrorCode::TranscoderInvalidMedia,
            InvokeError::Cancelled => ErrorCode::Internal,
            InvokeError::Spawn(_) | InvokeError::Io(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Invoker {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub wall_clock: Duration,
    pub inactivity: Duration,
    pub grace: Duration,
}

impl Invoker {
    /// Run the transcoder with the given argv. Parsed progress blocks are
    /// forwarded on `progress_tx`; flipping `cancel` to true triggers the
    /// graceful-then-hard stop sequence. The child's stdout is consumed
    /// line-by-line, never buffered whole.
    pub async fn run(
        &self,
        argv: &[String],
        progress_tx: mpsc::Sender<ProgressReport>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), InvokeError> {
        let mut child = Command::new(&self.ffmpeg)
            .args(argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(InvokeError::Spawn)?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        // Keep a bounded tail of stderr for local logs and failure
        // classification. It never reaches the job's public error object.
        let stderr_tail = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "transcoder", "{}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let deadline = Instant::now() + self.wall_clock;
        let mut last_activity = Instant::now();
        let mut lines = BufReader::new(stdout).lines();
        let mut parser = ProgressParser::new();

        let outcome = loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            last_activity = Instant::now();
                            if let Some(report) = parser.feed(&line) {
                                // A full send here would stall the pipe; the
                                // consumer debounces, dropping is fine.
                                _ = progress_tx.try_send(report);
                            }
                        }
                        Ok(None) => break self.wait_for_exit(&mut child, deadline).await,
                        Err(err) => {
                            self.kill(&mut child).await;
                            break Err(InvokeError::Io(err));
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("transcoder exceeded its wall-clock ceiling, killing");
                    self.kill(&mut child).await;
                    break Err(InvokeError::WallClockExceeded);
                }
                _ = tokio::time::sleep_until(last_activity + self.inactivity) => {
                    warn!("transcoder produced no progress in {:?}, killing", self.inactivity);
                    self.kill(&mut child).await;
                    break Err(InvokeError::Stalled);
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break self.stop_gracefully(&mut child).await;
                    }
                }
            }
        };

        let tail = stderr_tail.await.unwrap_or_default();
        if let Err(err) = &outcome {
            // Full diagnostics stay server-side.
            error!(
                "transcoder invocation failed ({}); stderr tail: {}",
                err,
                tail.iter().cloned().collect::<Vec<_>>().join(" | ")
            );
        }

        match outcome {
            Err(InvokeError::Exited { code }) if looks_like_invalid_media(&tail) => {
                debug!("classifying exit status {:?} as invalid media", code);
                Err(InvokeError::InvalidMedia)
            }
            other => other,
        }
    }

    async fn wait_for_exit(
        &self,
        child: &mut Child,
        deadline: Instant,
    ) -> Result<(), InvokeError> {
        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                self.kill(child).await;
                return Err(InvokeError::WallClockExceeded);
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(InvokeError::Exited {
                code: status.code(),
            })
        }
    }

    /// Graceful stop: ask the transcoder to quit (it honors `q` on stdin),
    /// then hard-kill after the grace window.
    async fn stop_gracefully(&self, child: &mut Child) -> Result<(), InvokeError> {
        if let Some(stdin) = child.stdin.as_mut() {
            drop(stdin.write_all(b"q").await);
            drop(stdin.flush().await);
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("transcoder ignored the quit request, killing");
                self.kill(child).await;
            }
        }
        Err(InvokeError::Cancelled)
    }

    async fn kill(&self, child: &mut Child) {
        if let Err(err) = child.kill().await {
            warn!("failed to kill transcoder: {}", err);
        }
    }
}

fn looks_like_invalid_media(stderr_tail: &VecDeque<String>) -> bool {
    stderr_tail.iter().any(|line| {
        line.contains("Invalid data found when processing input")
            || line.contains("moov atom not found")
            || line.contains("could not find codec parameters")
    })
}

/// Scoped scratch directory for one job attempt. Owned exclusively by the
/// executing worker; the backing `TempDir` removes the tree on drop, which
/// runs on success, failure and unwind alike.
pub struct JobScratch {
    dir: TempDir,
}

impl JobScratch {
    pub fn new(root: &Path, job_id: uuid::Uuid) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{job_id}-"))
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn input_path(&self, source_name: &str) -> PathBuf {
        let extension = Path::new(source_name)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bin".to_owned());
        self.dir.path().join(format!("input.{extension}"))
    }

    pub fn output_path(&self, target_name: &str) -> PathBuf {
        let name = Path::new(target_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output.bin".to_owned());
        self.dir.path().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_paths_derive_from_locator_names() {
        let root = tempfile::tempdir().unwrap();
        let scratch = JobScratch::new(root.path(), uuid::Uuid::now_v7()).unwrap();

        let input = scratch.input_path("clip.mov");
        assert_eq!(input.file_name().unwrap(), "input.mov");
        assert!(input.starts_with(scratch.path()));

        let output = scratch.output_path("result.mp4");
        assert_eq!(output.file_name().unwrap(), "result.mp4");
    }

    #[test]
    fn scratch_is_released_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let scratch = JobScratch::new(root.path(), uuid::Uuid::now_v7()).unwrap();
            std::fs::write(scratch.path().join("partial.mp4"), b"half a frame").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn invalid_media_classification_reads_the_tail() {
        let mut tail = VecDeque::new();
        tail.push_back("whatever".to_owned());
        assert!(!looks_like_invalid_media(&tail));

        tail.push_back("clip.mov: Invalid data found when processing input".to_owned());
        assert!(looks_like_invalid_media(&tail));
    }
}
