//! Still-image capture
//!
//! Two ways to keep the artifact file fresh:
//! - on demand: run one capture process per request, wait for it to exit
//! - timelapse: keep one capture process running that rewrites the file
//!   every couple of seconds, and report each rewrite as a frame-ready event
//!
//! Only one on-demand capture runs at a time; overlapping triggers are
//! dropped while the capture flag is held.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::resources::Resources;

/// Placeholder replaced by the artifact path in capture arguments
pub const PATH_PLACEHOLDER: &str = "{path}";

/// How the camera is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// One process invocation per capture
    OnDemand,
    /// One long-running process rewriting the artifact periodically
    Timelapse,
}

/// Capture command configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
    /// Capture executable
    pub program: String,
    /// Arguments; `{path}` expands to `output`
    pub args: Vec<String>,
    /// Artifact path the capture process writes
    pub output: PathBuf,
    /// How often the timelapse output is checked for a new frame
    pub frame_poll: Duration,
}

impl CaptureConfig {
    /// Pi camera running continuously: 800x600 every 2 s, flipped for an
    /// upside-down mount
    pub fn timelapse(output: impl Into<PathBuf>) -> Self {
        Self {
            mode: CaptureMode::Timelapse,
            program: "rpicam-still".to_string(),
            args: [
                "-n", "-t", "0", "--timelapse", "2000", "--width", "800", "--height", "600",
                "-q", "80", "--hflip", "--vflip", "-o", PATH_PLACEHOLDER,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            output: output.into(),
            frame_poll: Duration::from_millis(500),
        }
    }

    /// Single shot with a one second warm-up (`imagesnap` on desktop hosts)
    pub fn on_demand(output: impl Into<PathBuf>) -> Self {
        Self {
            mode: CaptureMode::OnDemand,
            program: "imagesnap".to_string(),
            args: ["-w", "1.0", "-q", PATH_PLACEHOLDER]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            output: output.into(),
            frame_poll: Duration::from_millis(500),
        }
    }

    /// Replace program and arguments with a whitespace-separated command line
    pub fn with_command_line(mut self, command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        self.program = parts.next().context("Capture command line is empty")?;
        self.args = parts.collect();
        Ok(self)
    }

    fn expanded_args(&self) -> Vec<String> {
        let path = self.output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(PATH_PLACEHOLDER, &path))
            .collect()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.expanded_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Result of an on-demand capture attempt
#[derive(Debug)]
pub enum CaptureOutcome {
    /// The process ran and exited (successfully or not)
    Finished(ExitStatus),
    /// Another capture held the device; nothing was started
    Busy,
    /// The process could not be started
    Failed,
}

/// A frame written by the timelapse process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReady;

/// Runs the capture command against the shared capture flag
pub struct CaptureUnit {
    config: CaptureConfig,
    resources: Arc<Resources>,
}

impl CaptureUnit {
    pub fn new(config: CaptureConfig, resources: Arc<Resources>) -> Self {
        Self { config, resources }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn output(&self) -> &Path {
        &self.config.output
    }

    /// Take one picture, unless a capture is already running
    pub async fn capture(&self) -> CaptureOutcome {
        let Some(_guard) = self.resources.capture().try_acquire() else {
            debug!("capture already in progress, dropping trigger");
            return CaptureOutcome::Busy;
        };

        debug!(program = %self.config.program, "starting capture");
        match self.config.command().output().await {
            Ok(output) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(
                        "{} exited with {}: {}",
                        self.config.program,
                        output.status,
                        stderr.trim()
                    );
                }
                CaptureOutcome::Finished(output.status)
            }
            Err(e) => {
                warn!(
                    "Could not run {} ({}). Ensure {:?} is produced some other way.",
                    self.config.program, e, self.config.output
                );
                CaptureOutcome::Failed
            }
        }
    }

    /// Launch the continuous capture process.
    ///
    /// The returned receiver yields one event per rewritten frame. Events are
    /// dropped, not queued, while the consumer is busy. The process is
    /// restarted with backoff if it exits, and killed when the handle drops.
    pub fn start_timelapse(&self) -> (TimelapseCapture, mpsc::Receiver<FrameReady>) {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let config = self.config.clone();

        tokio::spawn(run_timelapse(config, tx, cancel.clone()));

        (TimelapseCapture { cancel }, rx)
    }
}

/// Handle to the running timelapse process
pub struct TimelapseCapture {
    cancel: CancellationToken,
}

impl TimelapseCapture {
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TimelapseCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Backoff after `attempt` consecutive failures: 2, 4, 8 ... capped at 30 s
pub(crate) fn restart_delay(attempt: u32) -> Duration {
    let secs = (1u64 << attempt.min(5)).min(30);
    Duration::from_secs(secs)
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if meta.len() == 0 {
        return None;
    }
    meta.modified().ok()
}

/// Log the capture process's stderr so a full pipe never blocks it
fn drain_stderr(program: String, mut stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; 4096];
        loop {
            match stderr.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let msg = String::from_utf8_lossy(&buffer[..n]);
                    for line in msg.lines().map(str::trim).filter(|l| !l.is_empty()) {
                        debug!(target: "janus::capture::stderr", "{}: {}", program, line);
                    }
                }
            }
        }
    });
}

async fn run_timelapse(
    config: CaptureConfig,
    tx: mpsc::Sender<FrameReady>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;
    let mut last_modified = modified_at(&config.output).await;

    while !cancel.is_cancelled() {
        let mut child: Child = match config.command().spawn() {
            Ok(mut child) => {
                info!(program = %config.program, "timelapse capture started");
                if let Some(stderr) = child.stderr.take() {
                    drain_stderr(config.program.clone(), stderr);
                }
                child
            }
            Err(e) => {
                attempt += 1;
                let delay = restart_delay(attempt);
                error!(
                    "Failed to start {}: {}. Retrying in {:.0}s",
                    config.program,
                    e,
                    delay.as_secs_f64()
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        let mut poll = tokio::time::interval(config.frame_poll);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let exited = loop {
            tokio::select! {
                _ = cancel.cancelled() => break None,
                status = child.wait() => break Some(status),
                _ = poll.tick() => {
                    let modified = modified_at(&config.output).await;
                    if modified.is_some() && modified != last_modified {
                        last_modified = modified;
                        attempt = 0;
                        // A full channel means the consumer is still busy; skip this frame
                        let _ = tx.try_send(FrameReady);
                    }
                    if tx.is_closed() {
                        break None;
                    }
                }
            }
        };

        match exited {
            None => {
                let _ = child.kill().await;
                break;
            }
            Some(status) => {
                attempt += 1;
                let delay = restart_delay(attempt);
                match status {
                    Ok(status) => warn!(
                        "timelapse capture exited with {}. Restarting in {:.0}s",
                        status,
                        delay.as_secs_f64()
                    ),
                    Err(e) => warn!(
                        "timelapse capture wait failed: {}. Restarting in {:.0}s",
                        e,
                        delay.as_secs_f64()
                    ),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    info!("timelapse capture stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell(output: &Path, mode: CaptureMode, script: &str) -> CaptureConfig {
        CaptureConfig {
            mode,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            output: output.to_path_buf(),
            frame_poll: Duration::from_millis(20),
        }
    }

    #[test]
    fn path_placeholder_is_expanded() {
        let config = CaptureConfig::on_demand("/tmp/garage-image.jpg");
        assert_eq!(
            config.expanded_args(),
            vec!["-w", "1.0", "-q", "/tmp/garage-image.jpg"]
        );
    }

    #[test]
    fn command_line_override() {
        let config = CaptureConfig::timelapse("/tmp/a.jpg")
            .with_command_line("libcamera-still -t 0 --timelapse 5000 -o {path}")
            .unwrap();
        assert_eq!(config.program, "libcamera-still");
        assert_eq!(config.expanded_args().last().unwrap(), "/tmp/a.jpg");
        assert!(CaptureConfig::timelapse("/tmp/a.jpg").with_command_line("  ").is_err());
    }

    #[tokio::test]
    async fn on_demand_capture_writes_artifact() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("img.jpg");
        let script = format!("printf jpeg > {}", output.display());
        let unit = CaptureUnit::new(
            shell(&output, CaptureMode::OnDemand, &script),
            Arc::new(Resources::new()),
        );

        match unit.capture().await {
            CaptureOutcome::Finished(status) => assert!(status.success()),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(std::fs::read(&output).unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn failing_process_still_releases_flag() {
        let dir = tempdir().unwrap();
        let resources = Arc::new(Resources::new());
        let unit = CaptureUnit::new(
            shell(&dir.path().join("img.jpg"), CaptureMode::OnDemand, "exit 3"),
            Arc::clone(&resources),
        );

        assert!(matches!(unit.capture().await, CaptureOutcome::Finished(s) if !s.success()));
        assert!(!resources.capture().is_busy());
    }

    #[tokio::test]
    async fn missing_binary_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        let resources = Arc::new(Resources::new());
        let mut config = CaptureConfig::on_demand(dir.path().join("img.jpg"));
        config.program = "janus-definitely-not-a-camera".to_string();
        let unit = CaptureUnit::new(config, Arc::clone(&resources));

        assert!(matches!(unit.capture().await, CaptureOutcome::Failed));
        assert!(!resources.capture().is_busy());
    }

    #[tokio::test]
    async fn overlapping_capture_is_dropped() {
        let dir = tempdir().unwrap();
        let resources = Arc::new(Resources::new());
        let unit = Arc::new(CaptureUnit::new(
            shell(&dir.path().join("img.jpg"), CaptureMode::OnDemand, "sleep 0.3"),
            Arc::clone(&resources),
        ));

        let running = {
            let unit = Arc::clone(&unit);
            tokio::spawn(async move { unit.capture().await })
        };
        while !resources.capture().is_busy() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(unit.capture().await, CaptureOutcome::Busy));
        assert!(matches!(running.await.unwrap(), CaptureOutcome::Finished(_)));
    }

    #[tokio::test]
    async fn timelapse_reports_rewritten_frames() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("img.jpg");
        let script = format!(
            "while true; do date +%s%N > {}; sleep 0.05; done",
            output.display()
        );
        let unit = CaptureUnit::new(
            shell(&output, CaptureMode::Timelapse, &script),
            Arc::new(Resources::new()),
        );

        let (handle, mut frames) = unit.start_timelapse();
        let first = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("no frame reported");
        assert!(first.is_some());

        drop(handle);
        // Channel closes once the capture task notices the cancellation
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while frames.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn timelapse_keeps_reporting_frames_with_noisy_stderr() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("img.jpg");
        // About 16 KiB of log output per frame fills an unread pipe within a few frames
        let script = format!(
            "while true; do yes '[0:00:01.5] INFO RPI camera frame ready' | head -n 400 >&2; \
             date +%s%N > {}; sleep 0.05; done",
            output.display()
        );
        let unit = CaptureUnit::new(
            shell(&output, CaptureMode::Timelapse, &script),
            Arc::new(Resources::new()),
        );

        let (handle, mut frames) = unit.start_timelapse();
        let mut seen = 0;
        let counted = tokio::time::timeout(Duration::from_secs(10), async {
            while seen < 12 {
                if frames.recv().await.is_none() {
                    break;
                }
                seen += 1;
            }
        })
        .await;

        assert!(counted.is_ok(), "only {} frames before stalling", seen);
        assert_eq!(seen, 12);
        handle.stop();
    }

    #[test]
    fn restart_delay_is_capped() {
        assert_eq!(restart_delay(1), Duration::from_secs(2));
        assert_eq!(restart_delay(10), Duration::from_secs(30));
    }
}
