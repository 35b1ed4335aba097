//! Filesystem request queue
//!
//! Layout: `root/<collection>/<id>.json`, one [`RequestDocument`] per file.
//! Writes go to a hidden temp file first and are renamed into place, so a
//! reader never sees a half-written document. Subscriptions poll the
//! collection directory and deliver the pending set whenever it changes.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{check_target, same_ids, RequestQueue, Subscription, TransitionError};
use crate::request::{NewRequest, Request, RequestDocument, RequestId, RequestKind, RequestStatus};

/// Configuration for the filesystem queue
#[derive(Debug, Clone)]
pub struct LocalQueueConfig {
    /// Root directory holding one subdirectory per collection
    pub root: PathBuf,
    /// How often subscriptions rescan their collection
    pub poll_interval: Duration,
}

impl Default for LocalQueueConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/janus/queue"),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Request queue backed by JSON files
#[derive(Clone)]
pub struct LocalQueue {
    config: LocalQueueConfig,
    /// Serialises read-check-write transitions within this process
    write_lock: Arc<Mutex<()>>,
}

impl LocalQueue {
    /// Open (and create if needed) a queue rooted at `config.root`
    pub async fn open(config: LocalQueueConfig) -> Result<Self> {
        for kind in RequestKind::ALL {
            let dir = config.root.join(kind.collection());
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create queue directory: {:?}", dir))?;
        }
        Ok(Self {
            config,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn collection_dir(&self, kind: RequestKind) -> PathBuf {
        self.config.root.join(kind.collection())
    }

    fn document_path(&self, kind: RequestKind, id: &RequestId) -> PathBuf {
        self.collection_dir(kind).join(format!("{}.json", id))
    }

    async fn read_document(path: &Path) -> Result<Option<RequestDocument>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Malformed request document: {:?}", path))?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    async fn write_document(path: &Path, doc: &RequestDocument) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Request document path has no file name")?;
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        let bytes = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move {:?} into place", path))?;
        Ok(())
    }

    /// Read every pending request of a kind, oldest first
    async fn scan_pending(dir: &Path, kind: RequestKind) -> Result<Vec<Request>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to list {:?}", dir))?;

        let mut pending = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = document_id(&path) else {
                continue;
            };
            match Self::read_document(&path).await {
                Ok(Some(doc)) if doc.status == RequestStatus::Pending => {
                    pending.push(Request::from_document(kind, id, doc));
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable request {}: {:#}", id, e),
            }
        }

        pending.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(pending)
    }
}

/// Request id for a `<id>.json` document path; temp files and strays are ignored
fn document_id(path: &Path) -> Option<RequestId> {
    if path.extension().is_none_or(|ext| ext != "json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.starts_with('.') {
        return None;
    }
    Some(RequestId::from(stem))
}

#[async_trait::async_trait]
impl RequestQueue for LocalQueue {
    async fn subscribe_pending(&self, kind: RequestKind) -> Result<Subscription> {
        let (tx, subscription) = Subscription::channel(kind, 4);
        let dir = self.collection_dir(kind);
        let poll_interval = self.config.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<Vec<Request>> = None;

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                match Self::scan_pending(&dir, kind).await {
                    Ok(batch) => {
                        if last.as_ref().is_some_and(|prev| same_ids(prev, &batch)) {
                            continue;
                        }
                        if tx.send(Ok(batch.clone())).await.is_err() {
                            break;
                        }
                        last = Some(batch);
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            debug!(%kind, "local queue subscription ended");
        });

        Ok(subscription)
    }

    async fn transition(
        &self,
        kind: RequestKind,
        id: &RequestId,
        to: RequestStatus,
    ) -> Result<(), TransitionError> {
        check_target(to)?;
        let path = self.document_path(kind, id);

        let _guard = self.write_lock.lock().await;
        let mut doc = Self::read_document(&path)
            .await?
            .ok_or_else(|| TransitionError::NotFound {
                kind,
                id: id.clone(),
            })?;

        if doc.status != RequestStatus::Pending {
            return Err(TransitionError::NotPending {
                kind,
                id: id.clone(),
                status: doc.status,
            });
        }

        doc.status = to;
        Self::write_document(&path, &doc).await?;
        Ok(())
    }

    async fn submit(&self, request: NewRequest) -> Result<RequestId> {
        let id = RequestId(uuid::Uuid::new_v4().simple().to_string());
        let path = self.document_path(request.kind, &id);
        let doc = request.into_document();

        let _guard = self.write_lock.lock().await;
        Self::write_document(&path, &doc).await?;
        debug!(%id, "request stored at {:?}", path);
        Ok(id)
    }

    async fn get(&self, kind: RequestKind, id: &RequestId) -> Result<Option<Request>> {
        let path = self.document_path(kind, id);
        Ok(Self::read_document(&path)
            .await?
            .map(|doc| Request::from_document(kind, id.clone(), doc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_queue(root: &Path) -> LocalQueue {
        LocalQueue::open(LocalQueueConfig {
            root: root.to_path_buf(),
            poll_interval: Duration::from_millis(20),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn submit_writes_pending_document() {
        let dir = tempdir().unwrap();
        let queue = open_queue(dir.path()).await;

        let id = queue.submit(NewRequest::door(1).user("cli")).await.unwrap();
        let path = dir.path().join("door_requests").join(format!("{}.json", id));
        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();

        assert_eq!(raw["door"], 1);
        assert_eq!(raw["status"], "pending");
        assert_eq!(raw["user"], "cli");
    }

    #[tokio::test]
    async fn transition_updates_only_pending_documents() {
        let dir = tempdir().unwrap();
        let queue = open_queue(dir.path()).await;
        let id = queue.submit(NewRequest::image()).await.unwrap();

        queue
            .transition(RequestKind::Image, &id, RequestStatus::Completed)
            .await
            .unwrap();
        let stored = queue.get(RequestKind::Image, &id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);

        let err = queue
            .transition(RequestKind::Image, &id, RequestStatus::Timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotPending { .. }));
    }

    #[tokio::test]
    async fn transition_of_missing_document_fails() {
        let dir = tempdir().unwrap();
        let queue = open_queue(dir.path()).await;

        let err = queue
            .transition(RequestKind::Door, &RequestId::from("nope"), RequestStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn subscription_delivers_changes_oldest_first() {
        let dir = tempdir().unwrap();
        let queue = open_queue(dir.path()).await;
        let older = queue
            .submit(NewRequest::door(0).aged(Duration::from_secs(5)))
            .await
            .unwrap();
        let newer = queue.submit(NewRequest::door(1)).await.unwrap();

        let mut sub = queue.subscribe_pending(RequestKind::Door).await.unwrap();
        let batch = sub.next_batch().await.unwrap();
        let ids: Vec<_> = batch.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![older.clone(), newer.clone()]);

        queue
            .transition(RequestKind::Door, &older, RequestStatus::Completed)
            .await
            .unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(2), sub.next_batch())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, newer);
    }

    #[tokio::test]
    async fn malformed_documents_are_skipped() {
        let dir = tempdir().unwrap();
        let queue = open_queue(dir.path()).await;
        std::fs::write(dir.path().join("image_requests").join("junk.json"), b"{not json").unwrap();
        queue.submit(NewRequest::image()).await.unwrap();

        let mut sub = queue.subscribe_pending(RequestKind::Image).await.unwrap();
        assert_eq!(sub.next_batch().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removed_collection_kills_subscription() {
        let dir = tempdir().unwrap();
        let queue = open_queue(dir.path()).await;
        let mut sub = queue.subscribe_pending(RequestKind::Door).await.unwrap();
        assert!(sub.next_batch().await.unwrap().is_empty());

        std::fs::remove_dir_all(dir.path().join("door_requests")).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), sub.next_batch())
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn temp_files_are_not_documents() {
        assert_eq!(
            document_id(Path::new("/q/door_requests/abc.json")),
            Some(RequestId::from("abc"))
        );
        assert_eq!(document_id(Path::new("/q/door_requests/.abc.json.tmp")), None);
        assert_eq!(document_id(Path::new("/q/door_requests/notes.txt")), None);
    }
}
