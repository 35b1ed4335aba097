//! Janus - request-driven door relay and camera publishing
//!
//! The device-side coordinator drains a queue of door and image requests,
//! pulses relays, captures stills and publishes them to an object store,
//! while keeping the public image fresh on its own schedule.
//!
//! - **Request model**: [`Request`], [`RequestKind`], [`RequestStatus`]
//! - **Seams**: [`queue::RequestQueue`], [`store::ArtifactStore`], [`gpio::GpioDriver`]
//! - **Pipeline**: [`capture::CaptureUnit`], [`publish::MediaPublisher`], [`scheduler::FreshnessScheduler`]
//! - **Lifecycle**: [`watcher::RequestWatcher`], [`status::RequestStatusUpdater`], [`coordinator::Coordinator`]

pub mod actuation;
pub mod capture;
pub mod coordinator;
pub mod gpio;
pub mod publish;
pub mod queue;
pub mod request;
pub mod resources;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod watcher;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use request::{DoorIndex, NewRequest, Request, RequestId, RequestKind, RequestStatus};
pub use resources::{Resources, UploadClass};
