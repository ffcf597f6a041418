use std::{
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
};

use jiff::{SignedDuration, Timestamp};

use crate::time::Duration;

/// Source of the current time.
pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// Reads the time from the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and advance the
/// clock that a reconciler or authenticator is reading from.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = add(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Adds `duration` to `timestamp`, saturating at [`Timestamp::MAX`].
pub fn add(timestamp: Timestamp, duration: Duration) -> Timestamp {
    timestamp
        .checked_add(duration.to_signed())
        .unwrap_or(Timestamp::MAX)
}

/// Returns how much time passed between `earlier` and `later`.
///
/// Returns [`None`] if `later` is actually before `earlier`.
pub fn elapsed(earlier: Timestamp, later: Timestamp) -> Option<Duration> {
    let span = later.duration_since(earlier);
    if span.is_negative() {
        return None;
    }
    std::time::Duration::try_from(span).ok().map(Duration::from)
}

/// Returns the time left until `deadline`, which is zero if it already passed.
pub fn until(now: Timestamp, deadline: Timestamp) -> Duration {
    elapsed(now, deadline).unwrap_or_default()
}

impl Duration {
    /// Converts into a [`SignedDuration`], saturating at [`SignedDuration::MAX`].
    pub fn to_signed(self) -> SignedDuration {
        SignedDuration::try_from(*self).unwrap_or(SignedDuration::MAX)
    }
}
