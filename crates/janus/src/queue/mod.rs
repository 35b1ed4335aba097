//! Request queue seam
//!
//! The queue is an external collaborator: it stores requests, pushes the set
//! of pending requests to subscribers whenever that set changes, and performs
//! compare-and-set status transitions. Two backends live here:
//! - [`MemoryQueue`]: in-process, used by tests and single-binary setups
//! - [`LocalQueue`]: one JSON document per request under a directory tree

pub mod local;
pub mod memory;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::request::{NewRequest, Request, RequestId, RequestKind, RequestStatus};

pub use local::{LocalQueue, LocalQueueConfig};
pub use memory::MemoryQueue;

/// Why a status transition was refused
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// The record was deleted (or never existed)
    #[error("{kind} request {id} does not exist")]
    NotFound { kind: RequestKind, id: RequestId },
    /// The record already left `Pending`
    #[error("{kind} request {id} is already {status}")]
    NotPending {
        kind: RequestKind,
        id: RequestId,
        status: RequestStatus,
    },
    /// Storage failure; the record is untouched
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Storage backend for requests
#[async_trait::async_trait]
pub trait RequestQueue: Send + Sync {
    /// Subscribe to the set of pending requests of one kind.
    ///
    /// The first batch is the current pending set; later batches are sent
    /// whenever that set changes. A record may be delivered more than once.
    async fn subscribe_pending(&self, kind: RequestKind) -> Result<Subscription>;

    /// Move a request from `Pending` to the terminal status `to`.
    ///
    /// Fails without writing when the record is gone or no longer pending.
    async fn transition(
        &self,
        kind: RequestKind,
        id: &RequestId,
        to: RequestStatus,
    ) -> Result<(), TransitionError>;

    /// Store a new pending request and return its id
    async fn submit(&self, request: NewRequest) -> Result<RequestId>;

    /// Fetch a single request
    async fn get(&self, kind: RequestKind, id: &RequestId) -> Result<Option<Request>>;
}

/// Producer half of a subscription, held by the backend's delivery task
pub type BatchSender = mpsc::Sender<Result<Vec<Request>>>;

/// Live stream of pending-request batches for one kind
pub struct Subscription {
    kind: RequestKind,
    rx: mpsc::Receiver<Result<Vec<Request>>>,
}

impl Subscription {
    /// Create a subscription and the sender a backend uses to feed it
    pub fn channel(kind: RequestKind, capacity: usize) -> (BatchSender, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { kind, rx })
    }

    /// Wait for the next batch.
    ///
    /// An error means the subscription is dead: either the backend reported
    /// a failure or its delivery task went away. Nothing more will arrive.
    pub async fn next_batch(&mut self) -> Result<Vec<Request>> {
        match self.rx.recv().await {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(e)) => Err(e.context(format!("{} request subscription failed", self.kind))),
            None => Err(anyhow!("{} request subscription closed", self.kind)),
        }
    }
}

/// Validate that `to` is a legal target for a transition out of `Pending`
pub(crate) fn check_target(to: RequestStatus) -> Result<(), TransitionError> {
    if to.is_terminal() {
        Ok(())
    } else {
        Err(TransitionError::Backend(anyhow!(
            "refusing to transition a request back to {}",
            to
        )))
    }
}

/// Whether two pending sets name the same requests in the same order
pub(crate) fn same_ids(a: &[Request], b: &[Request]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id == y.id)
}
