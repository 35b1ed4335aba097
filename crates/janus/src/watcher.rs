//! Pending-request watcher
//!
//! One loop per request kind. Each delivered batch is handled in order:
//! stale requests time out, door requests pulse a relay, image requests run
//! a refresh/publish cycle. The queue may deliver a record more than once,
//! so the watcher remembers what it already acted on and only retries the
//! status transition for those.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actuation::ActuationController;
use crate::publish::{MediaPipeline, PublishOutcome};
use crate::queue::RequestQueue;
use crate::request::{Request, RequestId, RequestKind, RequestStatus};
use crate::resources::UploadClass;
use crate::status::{RequestStatusUpdater, TransitionOutcome};

/// Staleness and retry policy
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Door requests at least this old are refused
    pub door_timeout: Duration,
    /// Image requests at least this old are refused; `None` never refuses
    pub image_timeout: Option<Duration>,
    /// How often requests left pending are looked at again
    pub retry_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            door_timeout: Duration::from_secs(10),
            image_timeout: Some(Duration::from_secs(60)),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// What the watcher remembers about one request stream
#[derive(Default)]
pub struct WatchState {
    /// Action ran, transition still owed
    unsettled: HashMap<RequestId, RequestStatus>,
    /// Terminal transition done (or found already done)
    settled: HashSet<RequestId>,
    /// Most recent delivered batch
    last: Vec<Request>,
}

impl WatchState {
    /// Requests whose action ran but whose status is not yet terminal
    pub fn unsettled(&self) -> usize {
        self.unsettled.len()
    }

    fn owes_work(&self) -> bool {
        self.last.iter().any(|r| !self.settled.contains(&r.id))
    }

    /// Forget requests that left the pending set
    fn prune(&mut self, batch: &[Request]) {
        let live: HashSet<&RequestId> = batch.iter().map(|r| &r.id).collect();
        self.unsettled.retain(|id, _| live.contains(id));
        self.settled.retain(|id| live.contains(id));
    }
}

/// Drains pending door and image requests
pub struct RequestWatcher {
    queue: Arc<dyn RequestQueue>,
    updater: RequestStatusUpdater,
    actuation: Arc<ActuationController>,
    pipeline: Arc<MediaPipeline>,
    config: WatcherConfig,
}

impl RequestWatcher {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        actuation: Arc<ActuationController>,
        pipeline: Arc<MediaPipeline>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            updater: RequestStatusUpdater::new(Arc::clone(&queue)),
            queue,
            actuation,
            pipeline,
            config,
        }
    }

    /// Watch `kind` until `cancel` fires.
    ///
    /// Returns `Err` when the subscription dies; the caller must treat that
    /// as fatal since no further requests of this kind will be seen.
    pub async fn run(&self, kind: RequestKind, cancel: CancellationToken) -> Result<()> {
        let mut subscription = self
            .queue
            .subscribe_pending(kind)
            .await
            .with_context(|| format!("Failed to subscribe to pending {} requests", kind))?;
        info!("watching pending {} requests", kind);

        let mut retry = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.retry_interval,
            self.config.retry_interval,
        );
        retry.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut state = WatchState::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("{} watcher stopping", kind);
                    return Ok(());
                }
                batch = subscription.next_batch() => {
                    let batch = batch?;
                    debug!("{} pending {} request(s)", batch.len(), kind);
                    state.prune(&batch);
                    state.last = batch;
                    self.process_last(&mut state).await;
                }
                _ = retry.tick(), if state.owes_work() => {
                    debug!("revisiting pending {} requests", kind);
                    self.process_last(&mut state).await;
                }
            }
        }
    }

    async fn process_last(&self, state: &mut WatchState) {
        let batch = std::mem::take(&mut state.last);
        self.process_batch(&batch, state).await;
        state.last = batch;
    }

    /// Handle every request of one batch, in delivery order
    pub async fn process_batch(&self, batch: &[Request], state: &mut WatchState) {
        for request in batch {
            if state.settled.contains(&request.id) {
                continue;
            }

            let outcome = if let Some(&to) = state.unsettled.get(&request.id) {
                debug!(id = %request.id, "retrying {} transition to {}", request.kind, to);
                Some(self.updater.finish(request, to).await)
            } else {
                self.handle(request, state).await
            };

            match outcome {
                Some(outcome) if outcome.is_settled() => {
                    state.unsettled.remove(&request.id);
                    state.settled.insert(request.id.clone());
                }
                _ => {}
            }
        }
    }

    /// Act on a request seen for the first time. `None` leaves it pending.
    async fn handle(&self, request: &Request, state: &mut WatchState) -> Option<TransitionOutcome> {
        let target = match request.kind {
            RequestKind::Door => self.handle_door(request),
            RequestKind::Image => self.handle_image(request).await?,
        };

        let outcome = self.updater.finish(request, target).await;
        if !outcome.is_settled() {
            state.unsettled.insert(request.id.clone(), target);
        }
        Some(outcome)
    }

    fn handle_door(&self, request: &Request) -> RequestStatus {
        let age = request.age_at(Utc::now());
        if age >= self.config.door_timeout {
            info!(
                id = %request.id,
                age_ms = age.as_millis() as u64,
                "door request is stale, refusing"
            );
            return RequestStatus::Timeout;
        }

        match request.door_index() {
            Ok(door) => {
                self.actuation.trigger(door);
                RequestStatus::Completed
            }
            Err(e) => {
                warn!(id = %request.id, "refusing door request: {}", e);
                RequestStatus::Timeout
            }
        }
    }

    async fn handle_image(&self, request: &Request) -> Option<RequestStatus> {
        if let Some(max_age) = self.config.image_timeout {
            if request.is_stale(Utc::now(), max_age) {
                info!(id = %request.id, "image request is stale, refusing");
                return Some(RequestStatus::Timeout);
            }
        }

        match self.pipeline.refresh(UploadClass::Regular).await {
            PublishOutcome::Published(_) => Some(RequestStatus::Completed),
            outcome => {
                info!(id = %request.id, ?outcome, "image request left pending");
                None
            }
        }
    }
}
