//! Request model shared by the coordinator, the queue backends and the CLI
//!
//! A request is a small JSON document living in one of two collections:
//!
//! ```json
//! { "door": 0, "requested_at": "2024-05-01T07:30:00Z", "status": "pending", "user": "cli" }
//! ```
//!
//! Image requests carry no `door` field. The coordinator only ever reads a
//! request and moves its `status` from `pending` to a terminal value.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Collection holding door-actuation requests
pub const DOOR_COLLECTION: &str = "door_requests";
/// Collection holding image requests
pub const IMAGE_COLLECTION: &str = "image_requests";

/// Which stream a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Door,
    Image,
}

impl RequestKind {
    pub const ALL: [RequestKind; 2] = [RequestKind::Door, RequestKind::Image];

    /// Name of the backing collection
    pub fn collection(&self) -> &'static str {
        match self {
            RequestKind::Door => DOOR_COLLECTION,
            RequestKind::Image => IMAGE_COLLECTION,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Door => write!(f, "door"),
            RequestKind::Image => write!(f, "image"),
        }
    }
}

/// Request status. `Completed` and `Timeout` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Completed,
    Timeout,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Opaque request identifier assigned by the queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One of the two relay outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DoorIndex {
    Zero,
    One,
}

impl DoorIndex {
    pub fn as_usize(&self) -> usize {
        match self {
            DoorIndex::Zero => 0,
            DoorIndex::One => 1,
        }
    }
}

impl TryFrom<i64> for DoorIndex {
    type Error = InvalidDoor;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DoorIndex::Zero),
            1 => Ok(DoorIndex::One),
            other => Err(InvalidDoor(Some(other))),
        }
    }
}

impl fmt::Display for DoorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_usize())
    }
}

/// A door request whose payload does not name door 0 or 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid door index: {0:?}")]
pub struct InvalidDoor(pub Option<i64>);

/// Stored form of a request, as written to a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDocument {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub door: Option<i64>,
    pub requested_at: DateTime<Utc>,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
}

/// A request as observed by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    /// Raw door payload (`None` for image requests)
    pub door: Option<i64>,
    pub requested_at: DateTime<Utc>,
    pub status: RequestStatus,
}

impl Request {
    pub fn from_document(kind: RequestKind, id: RequestId, doc: RequestDocument) -> Self {
        Self {
            id,
            kind,
            door: doc.door,
            requested_at: doc.requested_at,
            status: doc.status,
        }
    }

    /// Validated door index of a door request
    pub fn door_index(&self) -> Result<DoorIndex, InvalidDoor> {
        match self.door {
            Some(raw) => DoorIndex::try_from(raw),
            None => Err(InvalidDoor(None)),
        }
    }

    /// Time elapsed since submission. Requests stamped in the future count as brand new.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.requested_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the request is at or past `max_age` at `now`
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age_at(now) >= max_age
    }
}

/// A request about to be submitted to a queue
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub kind: RequestKind,
    pub door: Option<i64>,
    pub requested_at: DateTime<Utc>,
    pub user: Option<String>,
}

impl NewRequest {
    pub fn door(index: i64) -> Self {
        Self {
            kind: RequestKind::Door,
            door: Some(index),
            requested_at: Utc::now(),
            user: None,
        }
    }

    pub fn image() -> Self {
        Self {
            kind: RequestKind::Image,
            door: None,
            requested_at: Utc::now(),
            user: None,
        }
    }

    pub fn requested_at(mut self, at: DateTime<Utc>) -> Self {
        self.requested_at = at;
        self
    }

    /// Backdate the request by `age` (useful for replaying old submissions)
    pub fn aged(self, age: Duration) -> Self {
        let at = Utc::now() - TimeDelta::from_std(age).unwrap_or(TimeDelta::zero());
        self.requested_at(at)
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn into_document(self) -> RequestDocument {
        RequestDocument {
            door: self.door,
            requested_at: self.requested_at,
            status: RequestStatus::Pending,
            user: self.user,
        }
    }
}
