//! Coordinator lifecycle
//!
//! Wires the request watchers, the freshness scheduler and the capture
//! process around one shared [`Resources`] and runs them until shutdown or
//! until a watcher loses its subscription.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::actuation::{ActuationConfig, ActuationController};
use crate::capture::{CaptureConfig, CaptureMode, CaptureUnit};
use crate::gpio::GpioDriver;
use crate::publish::{MediaPipeline, MediaPublisher, PublishConfig};
use crate::queue::RequestQueue;
use crate::request::RequestKind;
use crate::resources::Resources;
use crate::scheduler::{FreshnessScheduler, SchedulerConfig};
use crate::store::ArtifactStore;
use crate::watcher::{RequestWatcher, WatcherConfig};

/// Everything the coordinator needs besides its backends
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub actuation: ActuationConfig,
    pub capture: CaptureConfig,
    pub publish: PublishConfig,
    pub scheduler: SchedulerConfig,
    pub watcher: WatcherConfig,
}

impl CoordinatorConfig {
    pub fn new(capture: CaptureConfig) -> Self {
        Self {
            actuation: ActuationConfig::default(),
            capture,
            publish: PublishConfig::default(),
            scheduler: SchedulerConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

/// Device-side coordinator
pub struct Coordinator {
    resources: Arc<Resources>,
    pipeline: Arc<MediaPipeline>,
    scheduler: Arc<FreshnessScheduler>,
    watcher: Arc<RequestWatcher>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        queue: Arc<dyn RequestQueue>,
        store: Arc<dyn ArtifactStore>,
        gpio: Arc<dyn GpioDriver>,
    ) -> Self {
        let resources = Arc::new(Resources::new());
        let capture = CaptureUnit::new(config.capture, Arc::clone(&resources));
        let publisher = MediaPublisher::new(store, Arc::clone(&resources), config.publish);
        let pipeline = Arc::new(MediaPipeline::new(capture, publisher, Arc::clone(&resources)));
        let scheduler = Arc::new(FreshnessScheduler::new(Arc::clone(&pipeline), config.scheduler));
        let actuation = Arc::new(ActuationController::new(gpio, config.actuation));
        let watcher = Arc::new(RequestWatcher::new(
            queue,
            actuation,
            Arc::clone(&pipeline),
            config.watcher,
        ));

        Self {
            resources,
            pipeline,
            scheduler,
            watcher,
        }
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    /// Run until `shutdown` fires (`Ok`) or a watcher dies (`Err`).
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let cancel = shutdown.child_token();
        let tracker = TaskTracker::new();

        let _timelapse = match self.pipeline.capture_unit().config().mode {
            CaptureMode::Timelapse => {
                let (handle, frames) = self.pipeline.capture_unit().start_timelapse();
                let scheduler = Arc::clone(&self.scheduler);
                let cancel = cancel.clone();
                tracker.spawn(async move { scheduler.run_on_frames(frames, cancel).await });
                Some(handle)
            }
            CaptureMode::OnDemand => {
                let scheduler = Arc::clone(&self.scheduler);
                let cancel = cancel.clone();
                tracker.spawn(async move { scheduler.run_timer(cancel).await });
                None
            }
        };

        let mut door = self.spawn_watcher(&tracker, RequestKind::Door, cancel.clone());
        let mut image = self.spawn_watcher(&tracker, RequestKind::Image, cancel.clone());
        tracker.close();

        info!("booted and ready");

        let result = tokio::select! {
            r = &mut door => watcher_result(RequestKind::Door, r),
            r = &mut image => watcher_result(RequestKind::Image, r),
        };

        if let Err(ref e) = result {
            error!("stopping coordinator: {:#}", e);
        }
        cancel.cancel();
        tracker.wait().await;
        info!("coordinator stopped");
        result
    }

    fn spawn_watcher(
        &self,
        tracker: &TaskTracker,
        kind: RequestKind,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let watcher = Arc::clone(&self.watcher);
        tracker.spawn(async move { watcher.run(kind, cancel).await })
    }
}

fn watcher_result(
    kind: RequestKind,
    joined: Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    joined
        .with_context(|| format!("{} watcher task panicked", kind))?
        .with_context(|| format!("{} watcher stopped", kind))
}
