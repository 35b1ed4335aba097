//! In-process request queue
//!
//! Keeps every request in memory and wakes subscribers through a `watch`
//! channel on each mutation. Subscribers receive the pending set of their
//! kind, skipping deliveries that would repeat the previous set.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

use super::{check_target, same_ids, RequestQueue, Subscription, TransitionError};
use crate::request::{NewRequest, Request, RequestDocument, RequestId, RequestKind, RequestStatus};

#[derive(Default)]
struct State {
    /// Documents per kind, in submission order
    docs: HashMap<RequestKind, Vec<(RequestId, RequestDocument)>>,
    next_id: u64,
    /// When set, every subscription fails with this reason
    failure: Option<String>,
}

impl State {
    fn pending(&self, kind: RequestKind) -> Vec<Request> {
        self.docs
            .get(&kind)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| doc.status == RequestStatus::Pending)
                    .map(|(id, doc)| Request::from_document(kind, id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct Inner {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory queue state poisoned"))
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// In-memory request queue
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
            }),
        }
    }

    /// Make every live and future subscription fail with `reason`
    pub fn fail_subscriptions(&self, reason: &str) -> Result<()> {
        self.inner.lock()?.failure = Some(reason.to_string());
        self.inner.notify();
        Ok(())
    }

    /// Remove a request entirely
    pub fn delete(&self, kind: RequestKind, id: &RequestId) -> Result<bool> {
        let removed = {
            let mut state = self.inner.lock()?;
            let docs = state.docs.entry(kind).or_default();
            let before = docs.len();
            docs.retain(|(doc_id, _)| doc_id != id);
            before != docs.len()
        };
        if removed {
            self.inner.notify();
        }
        Ok(removed)
    }

    /// Current status of a request, if it exists
    pub fn status(&self, kind: RequestKind, id: &RequestId) -> Option<RequestStatus> {
        let state = self.inner.lock().ok()?;
        state
            .docs
            .get(&kind)?
            .iter()
            .find(|(doc_id, _)| doc_id == id)
            .map(|(_, doc)| doc.status)
    }
}

#[async_trait::async_trait]
impl RequestQueue for MemoryQueue {
    async fn subscribe_pending(&self, kind: RequestKind) -> Result<Subscription> {
        let (tx, subscription) = Subscription::channel(kind, 4);
        let inner = Arc::clone(&self.inner);
        let mut changes = inner.changes.subscribe();

        tokio::spawn(async move {
            let mut last: Option<Vec<Request>> = None;
            loop {
                changes.borrow_and_update();
                let snapshot = inner
                    .lock()
                    .map(|state| (state.pending(kind), state.failure.clone()));
                let (batch, failure) = match snapshot {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };

                if let Some(reason) = failure {
                    let _ = tx.send(Err(anyhow!(reason))).await;
                    break;
                }

                let repeat = last.as_ref().is_some_and(|prev| same_ids(prev, &batch));
                if !repeat {
                    if tx.send(Ok(batch.clone())).await.is_err() {
                        break;
                    }
                    last = Some(batch);
                }

                if changes.changed().await.is_err() {
                    break;
                }
            }
            debug!(%kind, "memory queue subscription ended");
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
        {
            let mut state = self.inner.lock()?;
            let doc = state
                .docs
                .entry(kind)
                .or_default()
                .iter_mut()
                .find(|(doc_id, _)| doc_id == id)
                .map(|(_, doc)| doc)
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
        }
        self.inner.notify();
        Ok(())
    }

    async fn submit(&self, request: NewRequest) -> Result<RequestId> {
        let id = {
            let mut state = self.inner.lock()?;
            state.next_id += 1;
            let id = RequestId(format!("{}-{}", request.kind, state.next_id));
            let kind = request.kind;
            state
                .docs
                .entry(kind)
                .or_default()
                .push((id.clone(), request.into_document()));
            id
        };
        self.inner.notify();
        Ok(id)
    }

    async fn get(&self, kind: RequestKind, id: &RequestId) -> Result<Option<Request>> {
        let state = self.inner.lock()?;
        Ok(state.docs.get(&kind).and_then(|docs| {
            docs.iter()
                .find(|(doc_id, _)| doc_id == id)
                .map(|(id, doc)| Request::from_document(kind, id.clone(), doc.clone()))
        }))
    }
}
