//! Routine image freshness
//!
//! Keeps the public "latest" image no older than the refresh interval and
//! adds an archive entry every archive interval. Cycles are driven either by
//! a timer or by frame-ready events from a running timelapse capture; either
//! way a cycle only runs when its class is due, and a tick that arrives while
//! an upload is in flight is a no-op. A class whose cycles keep failing (no
//! camera, no artifact, store unreachable) backs off before trying again.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{restart_delay, FrameReady};
use crate::publish::{MediaPipeline, PublishOutcome};
use crate::resources::UploadClass;

/// Freshness cadence
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum age of the public image
    pub refresh_interval: Duration,
    /// Spacing between archive entries
    pub archive_interval: Duration,
    /// Timer resolution for due checks when no frame events drive the cycle
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            archive_interval: Duration::from_secs(30 * 60),
            tick: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self, class: UploadClass) -> Duration {
        match class {
            UploadClass::Regular => self.refresh_interval,
            UploadClass::Archive => self.archive_interval,
        }
    }
}

/// What a scheduler tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The class was published recently enough
    NotDue,
    /// Recent cycles failed; waiting out the backoff before the next attempt
    BackingOff,
    /// A cycle ran (it may still have been dropped or skipped)
    Ran(PublishOutcome),
}

/// Consecutive failed cycles of one class
#[derive(Debug, Default, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Option<Instant>,
}

/// Drives routine capture/publish cycles
pub struct FreshnessScheduler {
    pipeline: Arc<MediaPipeline>,
    config: SchedulerConfig,
    backoff: Mutex<[Backoff; 2]>,
}

impl FreshnessScheduler {
    pub fn new(pipeline: Arc<MediaPipeline>, config: SchedulerConfig) -> Self {
        Self {
            pipeline,
            config,
            backoff: Mutex::new([Backoff::default(); 2]),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one cycle of `class` if it is due and not backing off
    pub async fn tick(&self, class: UploadClass) -> CycleOutcome {
        let interval = self.config.interval(class);
        if !self.pipeline.resources().is_due(class, interval) {
            return CycleOutcome::NotDue;
        }
        let now = Instant::now();
        if self
            .with_backoff(class, |b| b.retry_at)
            .is_some_and(|retry_at| now < retry_at)
        {
            return CycleOutcome::BackingOff;
        }

        match class {
            UploadClass::Regular => debug!("refreshing image"),
            UploadClass::Archive => info!("adding image to archive"),
        }
        let outcome = self.pipeline.refresh(class).await;
        self.record(class, &outcome);
        CycleOutcome::Ran(outcome)
    }

    fn with_backoff<T>(&self, class: UploadClass, f: impl FnOnce(&mut Backoff) -> T) -> T {
        let mut backoff = match self.backoff.lock() {
            Ok(backoff) => backoff,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut backoff[class.slot()])
    }

    /// Busy cycles are retried on the next tick; failures push the retry out
    fn record(&self, class: UploadClass, outcome: &PublishOutcome) {
        match outcome {
            PublishOutcome::Published(_) => self.with_backoff(class, |b| *b = Backoff::default()),
            PublishOutcome::Busy => {}
            PublishOutcome::MissingArtifact | PublishOutcome::Failed => {
                let (failures, delay) = self.with_backoff(class, |b| {
                    b.failures += 1;
                    let delay = restart_delay(b.failures);
                    b.retry_at = Some(Instant::now() + delay);
                    (b.failures, delay)
                });
                warn!(
                    %class,
                    failures,
                    "image cycle did not publish. Retrying in {:.0}s",
                    delay.as_secs_f64()
                );
            }
        }
    }

    /// Timer-driven cycles until `cancel` fires
    pub async fn run_timer(&self, cancel: CancellationToken) {
        info!(
            refresh_secs = self.config.refresh_interval.as_secs(),
            archive_secs = self.config.archive_interval.as_secs(),
            "freshness scheduler running on timer"
        );
        tokio::join!(
            self.run_class(UploadClass::Regular, cancel.clone()),
            self.run_class(UploadClass::Archive, cancel),
        );
    }

    async fn run_class(&self, class: UploadClass, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(class).await;
                }
            }
        }
    }

    /// Frame-driven cycles: each new timelapse frame is a tick for both classes
    pub async fn run_on_frames(
        &self,
        mut frames: mpsc::Receiver<FrameReady>,
        cancel: CancellationToken,
    ) {
        info!(
            refresh_secs = self.config.refresh_interval.as_secs(),
            archive_secs = self.config.archive_interval.as_secs(),
            "freshness scheduler following timelapse frames"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => {
                    if frame.is_none() {
                        info!("timelapse frame events ended");
                        break;
                    }
                    tokio::join!(
                        self.tick(UploadClass::Regular),
                        self.tick(UploadClass::Archive),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureConfig, CaptureUnit};
    use crate::publish::{MediaPublisher, PublishConfig};
    use crate::resources::Resources;
    use crate::store::LocalStore;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dirs: (TempDir, TempDir),
        artifact: std::path::PathBuf,
        resources: Arc<Resources>,
        scheduler: FreshnessScheduler,
    }

    fn fixture(with_artifact: bool) -> Fixture {
        let work = tempdir().unwrap();
        let store_dir = tempdir().unwrap();
        let artifact = work.path().join("img.jpg");
        if with_artifact {
            std::fs::write(&artifact, b"jpeg").unwrap();
        }

        let resources = Arc::new(Resources::new());
        let capture = CaptureUnit::new(
            CaptureConfig::timelapse(artifact.clone()),
            Arc::clone(&resources),
        );
        let publisher = MediaPublisher::new(
            Arc::new(LocalStore::new(store_dir.path())),
            Arc::clone(&resources),
            PublishConfig::default(),
        );
        let pipeline = Arc::new(MediaPipeline::new(capture, publisher, Arc::clone(&resources)));
        let scheduler = FreshnessScheduler::new(pipeline, SchedulerConfig::default());

        Fixture {
            _dirs: (work, store_dir),
            artifact,
            resources,
            scheduler,
        }
    }

    #[tokio::test]
    async fn archive_not_due_runs_nothing() {
        let f = fixture(true);
        f.resources.mark_fresh(UploadClass::Archive, Instant::now());

        assert_eq!(f.scheduler.tick(UploadClass::Archive).await, CycleOutcome::NotDue);
        assert!(!f.resources.upload(UploadClass::Archive).is_busy());
    }

    #[tokio::test]
    async fn first_tick_publishes_and_second_is_not_due() {
        let f = fixture(true);

        let first = f.scheduler.tick(UploadClass::Regular).await;
        assert!(matches!(first, CycleOutcome::Ran(PublishOutcome::Published(_))));
        assert_eq!(f.scheduler.tick(UploadClass::Regular).await, CycleOutcome::NotDue);
    }

    #[tokio::test]
    async fn tick_during_upload_is_dropped() {
        let f = fixture(true);
        let _held = f.resources.upload(UploadClass::Regular).try_acquire().unwrap();

        assert_eq!(
            f.scheduler.tick(UploadClass::Regular).await,
            CycleOutcome::Ran(PublishOutcome::Busy)
        );
        assert!(f.resources.freshness().last_refresh_at.is_none());
    }

    #[tokio::test]
    async fn missing_artifact_stays_due() {
        let f = fixture(false);
        assert_eq!(
            f.scheduler.tick(UploadClass::Regular).await,
            CycleOutcome::Ran(PublishOutcome::MissingArtifact)
        );
        assert!(f.resources.is_due(UploadClass::Regular, Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_cycles_back_off_until_published() {
        let f = fixture(false);
        let class = UploadClass::Regular;

        assert_eq!(
            f.scheduler.tick(class).await,
            CycleOutcome::Ran(PublishOutcome::MissingArtifact)
        );
        assert_eq!(f.scheduler.tick(class).await, CycleOutcome::BackingOff);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            f.scheduler.tick(class).await,
            CycleOutcome::Ran(PublishOutcome::MissingArtifact)
        );
        // Second failure doubles the wait
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(f.scheduler.tick(class).await, CycleOutcome::BackingOff);

        std::fs::write(&f.artifact, b"jpeg").unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            f.scheduler.tick(class).await,
            CycleOutcome::Ran(PublishOutcome::Published(_))
        ));
        // Archive never failed, so it is unaffected
        assert!(matches!(
            f.scheduler.tick(UploadClass::Archive).await,
            CycleOutcome::Ran(PublishOutcome::Published(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_cycles_do_not_back_off() {
        let f = fixture(true);
        let held = f.resources.upload(UploadClass::Regular).try_acquire().unwrap();
        assert_eq!(
            f.scheduler.tick(UploadClass::Regular).await,
            CycleOutcome::Ran(PublishOutcome::Busy)
        );

        drop(held);
        assert!(matches!(
            f.scheduler.tick(UploadClass::Regular).await,
            CycleOutcome::Ran(PublishOutcome::Published(_))
        ));
    }

    #[tokio::test]
    async fn frame_events_drive_both_classes() {
        let f = fixture(true);
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        tx.send(FrameReady).await.unwrap();
        drop(tx);
        f.scheduler.run_on_frames(rx, cancel).await;

        let freshness = f.resources.freshness();
        assert!(freshness.last_refresh_at.is_some());
        assert!(freshness.last_archive_at.is_some());
    }
}
