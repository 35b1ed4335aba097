//! Exactly-once status reconciliation

use std::sync::Arc;
use tracing::{info, warn};

use crate::queue::{RequestQueue, TransitionError};
use crate::request::{Request, RequestStatus};

/// Result of trying to terminate a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// This call moved the request out of `Pending`
    Applied,
    /// The record is gone or was already terminal; nothing left to do
    AlreadySettled,
    /// Backend failure; the request is still `Pending`
    Failed,
}

impl TransitionOutcome {
    /// Whether the request needs no further reconciliation
    pub fn is_settled(&self) -> bool {
        !matches!(self, TransitionOutcome::Failed)
    }
}

/// Moves requests from `Pending` to a terminal status through the queue's
/// compare-and-set transition
#[derive(Clone)]
pub struct RequestStatusUpdater {
    queue: Arc<dyn RequestQueue>,
}

impl RequestStatusUpdater {
    pub fn new(queue: Arc<dyn RequestQueue>) -> Self {
        Self { queue }
    }

    pub async fn complete(&self, request: &Request) -> TransitionOutcome {
        self.finish(request, RequestStatus::Completed).await
    }

    pub async fn timeout(&self, request: &Request) -> TransitionOutcome {
        self.finish(request, RequestStatus::Timeout).await
    }

    pub async fn finish(&self, request: &Request, to: RequestStatus) -> TransitionOutcome {
        match self.queue.transition(request.kind, &request.id, to).await {
            Ok(()) => {
                info!(id = %request.id, "Marked {} request {}", request.kind, to);
                TransitionOutcome::Applied
            }
            Err(e @ (TransitionError::NotFound { .. } | TransitionError::NotPending { .. })) => {
                info!(id = %request.id, "Not marking {} request {}: {}", request.kind, to, e);
                TransitionOutcome::AlreadySettled
            }
            Err(TransitionError::Backend(e)) => {
                warn!(id = %request.id, "Transition of {} request to {} failed: {:#}", request.kind, to, e);
                TransitionOutcome::Failed
            }
        }
    }
}
