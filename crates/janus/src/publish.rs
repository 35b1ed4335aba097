//! Media publishing
//!
//! [`MediaPublisher`] pushes the captured artifact to the store under a key
//! derived from the upload class, makes it public and records freshness.
//! [`MediaPipeline`] puts a capture in front of that when the camera runs in
//! on-demand mode.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capture::{CaptureMode, CaptureOutcome, CaptureUnit};
use crate::resources::{Resources, UploadClass};
use crate::store::{ArtifactStore, ObjectMetadata, StoredObject};

/// Key layout and metadata for published images
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Object key basename, e.g. `garage-image`
    pub basename: String,
    pub metadata: ObjectMetadata,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            basename: "garage-image".to_string(),
            metadata: ObjectMetadata::no_cache(),
        }
    }
}

/// Result of one publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Uploaded and made public
    Published(StoredObject),
    /// Another upload of the same class, or an on-demand capture, was in
    /// flight; nothing done
    Busy,
    /// No artifact on disk yet; nothing uploaded
    MissingArtifact,
    /// Upload or make-public failed; freshness untouched
    Failed,
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published(_))
    }
}

/// Last archive timestamp handed out, and how many keys used it
#[derive(Default)]
struct ArchiveStamp {
    stamp: String,
    repeats: u32,
}

/// Uploads the artifact, one upload per class at a time
pub struct MediaPublisher {
    store: Arc<dyn ArtifactStore>,
    resources: Arc<Resources>,
    config: PublishConfig,
    last_archive: Mutex<ArchiveStamp>,
}

impl MediaPublisher {
    pub fn new(store: Arc<dyn ArtifactStore>, resources: Arc<Resources>, config: PublishConfig) -> Self {
        Self {
            store,
            resources,
            config,
            last_archive: Mutex::new(ArchiveStamp::default()),
        }
    }

    /// Destination key for `class` at `now`.
    ///
    /// Regular uploads always reuse one key. Archive keys embed the UTC time
    /// and get a `-N` suffix when two land on the same second.
    pub fn destination_key(&self, class: UploadClass, now: DateTime<Utc>) -> String {
        let base = &self.config.basename;
        match class {
            UploadClass::Regular => format!("{}.jpg", base),
            UploadClass::Archive => {
                let stamp = now.format("%Y-%m-%d-%H-%M-%S").to_string();
                let mut last = match self.last_archive.lock() {
                    Ok(last) => last,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let suffix = if last.stamp == stamp {
                    last.repeats += 1;
                    format!("-{}", last.repeats)
                } else {
                    last.stamp = stamp.clone();
                    last.repeats = 0;
                    String::new()
                };
                format!("{}-archive/{}-{}{}.jpg", base, base, stamp, suffix)
            }
        }
    }

    /// Upload `source` as `class`.
    ///
    /// Dropped when an upload of the same class is already running. A missing
    /// source file is skipped quietly; the next cycle will try again.
    pub async fn publish(&self, source: &Path, class: UploadClass) -> PublishOutcome {
        let Some(_guard) = self.resources.upload(class).try_acquire() else {
            debug!(%class, "already uploading image, dropping new request");
            return PublishOutcome::Busy;
        };

        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                info!("{:?} is not a file, skipping upload", source);
                return PublishOutcome::MissingArtifact;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("File {:?} does not exist, skipping upload", source);
                return PublishOutcome::MissingArtifact;
            }
            Err(e) => {
                warn!("Error looking for image file {:?}: {}", source, e);
                return PublishOutcome::Failed;
            }
        }

        let key = self.destination_key(class, Utc::now());
        let object = match self.store.upload(source, &key, &self.config.metadata).await {
            Ok(object) => object,
            Err(e) => {
                warn!(%class, key, "Error uploading image: {:#}", e);
                return PublishOutcome::Failed;
            }
        };

        if let Err(e) = self.store.make_public(&object).await {
            warn!(%class, key = %object.key, "Error making image public: {:#}", e);
            return PublishOutcome::Failed;
        }

        self.resources.mark_fresh(class, Instant::now());
        info!(%class, key = %object.key, "image published");
        PublishOutcome::Published(object)
    }
}

/// Capture (when on demand) followed by publish
pub struct MediaPipeline {
    capture: CaptureUnit,
    publisher: MediaPublisher,
    resources: Arc<Resources>,
}

impl MediaPipeline {
    pub fn new(capture: CaptureUnit, publisher: MediaPublisher, resources: Arc<Resources>) -> Self {
        Self {
            capture,
            publisher,
            resources,
        }
    }

    pub fn capture_unit(&self) -> &CaptureUnit {
        &self.capture
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    /// Produce a fresh image and publish it as `class`.
    ///
    /// In timelapse mode the artifact is already being rewritten, so only the
    /// upload runs. A busy upload slot short-circuits before any capture. In
    /// on-demand mode a capture already in flight makes this cycle `Busy`,
    /// since the artifact may be half written.
    pub async fn refresh(&self, class: UploadClass) -> PublishOutcome {
        if self.resources.upload(class).is_busy() {
            debug!(%class, "upload in flight, skipping cycle");
            return PublishOutcome::Busy;
        }

        if self.capture.config().mode == CaptureMode::OnDemand {
            if let CaptureOutcome::Busy = self.capture.capture().await {
                debug!(%class, "capture in flight, skipping cycle");
                return PublishOutcome::Busy;
            }
        }

        self.publisher.publish(self.capture.output(), class).await
    }
}
