//! Process-wide resource guards and freshness bookkeeping
//!
//! The capture device and each upload destination are guarded by a busy
//! flag. Acquisition never waits: a caller that finds the flag set drops its
//! trigger. The flag is released when the returned guard goes out of scope,
//! so every exit path (including errors) releases it exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Destination class of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadClass {
    /// Overwrites the single public "latest" image
    Regular,
    /// Adds a timestamped entry under the archive prefix
    Archive,
}

impl UploadClass {
    pub(crate) fn slot(&self) -> usize {
        match self {
            UploadClass::Regular => 0,
            UploadClass::Archive => 1,
        }
    }
}

impl fmt::Display for UploadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadClass::Regular => write!(f, "refresh"),
            UploadClass::Archive => write!(f, "archive"),
        }
    }
}

/// Non-blocking binary semaphore
pub struct BusyFlag {
    busy: AtomicBool,
    /// Number of acquisitions refused because the flag was held
    dropped: AtomicU64,
}

impl BusyFlag {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Take the flag, or `None` if someone else holds it
    pub fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(BusyGuard { flag: self })
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for BusyFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a [`BusyFlag`] until dropped
#[must_use = "the flag is released as soon as the guard is dropped"]
pub struct BusyGuard<'a> {
    flag: &'a BusyFlag,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.busy.store(false, Ordering::Release);
    }
}

/// When each upload class last succeeded (`None` = never since start)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreshnessState {
    pub last_refresh_at: Option<Instant>,
    pub last_archive_at: Option<Instant>,
}

impl FreshnessState {
    pub fn last(&self, class: UploadClass) -> Option<Instant> {
        match class {
            UploadClass::Regular => self.last_refresh_at,
            UploadClass::Archive => self.last_archive_at,
        }
    }

    /// A cycle is due once `interval` has passed since the last success
    pub fn is_due(&self, class: UploadClass, now: Instant, interval: Duration) -> bool {
        match self.last(class) {
            Some(last) => now.saturating_duration_since(last) >= interval,
            None => true,
        }
    }

    fn record(&mut self, class: UploadClass, at: Instant) {
        match class {
            UploadClass::Regular => self.last_refresh_at = Some(at),
            UploadClass::Archive => self.last_archive_at = Some(at),
        }
    }
}

/// Every shared guard and timestamp the media pipeline needs.
///
/// Lives for the whole process; share it behind an `Arc`.
#[derive(Default)]
pub struct Resources {
    capture: BusyFlag,
    uploads: [BusyFlag; 2],
    freshness: Mutex<FreshnessState>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(&self) -> &BusyFlag {
        &self.capture
    }

    pub fn upload(&self, class: UploadClass) -> &BusyFlag {
        &self.uploads[class.slot()]
    }

    pub fn freshness(&self) -> FreshnessState {
        match self.freshness.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Record a successful upload of `class` completed at `at`
    pub fn mark_fresh(&self, class: UploadClass, at: Instant) {
        match self.freshness.lock() {
            Ok(mut state) => state.record(class, at),
            Err(poisoned) => poisoned.into_inner().record(class, at),
        }
    }

    pub fn is_due(&self, class: UploadClass, interval: Duration) -> bool {
        self.freshness().is_due(class, Instant::now(), interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn busy_flag_is_exclusive_until_guard_drops() {
        let flag = BusyFlag::new();
        let guard = flag.try_acquire().expect("first acquire");
        assert!(flag.is_busy());
        assert!(flag.try_acquire().is_none());
        assert_eq!(flag.dropped(), 1);

        drop(guard);
        assert!(!flag.is_busy());
        assert!(flag.try_acquire().is_some());
    }

    #[test]
    fn upload_classes_have_independent_flags() {
        let resources = Resources::new();
        let _regular = resources.upload(UploadClass::Regular).try_acquire().unwrap();
        assert!(resources.upload(UploadClass::Archive).try_acquire().is_some());
        assert!(resources.upload(UploadClass::Regular).try_acquire().is_none());
        assert!(resources.capture().try_acquire().is_some());
    }

    #[test]
    fn concurrent_acquires_admit_one_holder() {
        let resources = Arc::new(Resources::new());
        let start = Arc::new(std::sync::Barrier::new(8));
        let tried = Arc::new(std::sync::Barrier::new(8));
        let held = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resources = Arc::clone(&resources);
                let start = Arc::clone(&start);
                let tried = Arc::clone(&tried);
                let held = Arc::clone(&held);
                std::thread::spawn(move || {
                    start.wait();
                    let guard = resources.capture().try_acquire();
                    if guard.is_some() {
                        held.fetch_add(1, Ordering::SeqCst);
                    }
                    // Keep the winner's guard alive until everyone has tried
                    tried.wait();
                    drop(guard);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(held.load(Ordering::SeqCst), 1);
        assert_eq!(resources.capture().dropped(), 7);
    }

    #[test]
    fn never_uploaded_is_due() {
        let state = FreshnessState::default();
        assert!(state.is_due(UploadClass::Regular, Instant::now(), Duration::from_secs(30)));
        assert!(state.is_due(UploadClass::Archive, Instant::now(), Duration::from_secs(1800)));
    }

    #[tokio::test(start_paused = true)]
    async fn due_after_interval_elapses() {
        let resources = Resources::new();
        resources.mark_fresh(UploadClass::Archive, Instant::now());
        assert!(!resources.is_due(UploadClass::Archive, Duration::from_secs(60)));
        assert!(resources.is_due(UploadClass::Regular, Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!resources.is_due(UploadClass::Archive, Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(resources.is_due(UploadClass::Archive, Duration::from_secs(60)));
    }
}
